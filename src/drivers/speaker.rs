//! PC speaker driven by PIT channel 2.

#[cfg(not(test))]
use x86_64::instructions::port::Port;

const PIT_FREQUENCY: u32 = 1_193_182;

#[cfg(not(test))]
pub fn start_beep(frequency: u32) -> i64 {
    if frequency == 0 {
        return -1;
    }

    let divisor = (PIT_FREQUENCY / frequency).clamp(1, u16::MAX as u32) as u16;
    let mut command: Port<u8> = Port::new(0x43);
    let mut channel2: Port<u8> = Port::new(0x42);
    let mut gate: Port<u8> = Port::new(0x61);

    unsafe {
        command.write(0xB6); // channel 2, lobyte/hibyte, square wave
        channel2.write(divisor as u8);
        channel2.write((divisor >> 8) as u8);
        let current = gate.read();
        gate.write(current | 0x03);
    }
    0
}

#[cfg(not(test))]
pub fn stop_beep() -> i64 {
    let mut gate: Port<u8> = Port::new(0x61);
    unsafe {
        let current = gate.read();
        gate.write(current & !0x03);
    }
    0
}

#[cfg(test)]
pub fn start_beep(frequency: u32) -> i64 {
    if frequency == 0 {
        return -1;
    }
    let _ = PIT_FREQUENCY;
    0
}

#[cfg(test)]
pub fn stop_beep() -> i64 {
    0
}
