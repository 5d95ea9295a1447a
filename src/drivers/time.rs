//! Timer ticks and the CMOS real-time clock.

use core::sync::atomic::{AtomicU64, Ordering};

/// PIT channel 0 at its power-on divisor, roughly 18.2 interrupts/second.
pub const TIMER_HZ: u64 = 18;

static TICKS: AtomicU64 = AtomicU64::new(0);

pub fn init() {
    TICKS.store(0, Ordering::Relaxed);
}

/// Called once per timer interrupt, before the scheduler runs.
pub fn timer_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Busy-sleep across timer ticks, yielding the CPU while waiting.
pub fn sleep_millis(millis: u64) -> i64 {
    let target = ticks() + (millis * TIMER_HZ).div_ceil(1000).max(1);
    while ticks() < target {
        crate::scheduler::yield_now();
        crate::arch::enable_and_halt();
    }
    0
}

#[cfg(not(test))]
fn read_cmos(register: u8) -> u8 {
    use x86_64::instructions::port::Port;
    let mut address: Port<u8> = Port::new(0x70);
    let mut data: Port<u8> = Port::new(0x71);
    unsafe {
        address.write(register);
        data.read()
    }
}

#[cfg(test)]
fn read_cmos(register: u8) -> u8 {
    // Fixed 12:34:56, BCD encoded.
    match register {
        0x00 => 0x56,
        0x02 => 0x34,
        0x04 => 0x12,
        _ => 0,
    }
}

fn bcd_to_dec(bcd: u8) -> u8 {
    (bcd & 0x0F) + ((bcd >> 4) * 10)
}

pub fn rtc_hour() -> i64 {
    bcd_to_dec(read_cmos(0x04)) as i64
}

pub fn rtc_minute() -> i64 {
    bcd_to_dec(read_cmos(0x02)) as i64
}

pub fn rtc_second() -> i64 {
    bcd_to_dec(read_cmos(0x00)) as i64
}
