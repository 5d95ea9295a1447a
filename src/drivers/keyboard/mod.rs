pub mod scancodes;

use core::sync::atomic::{AtomicUsize, Ordering};
use lazy_static::lazy_static;
use scancodes::{KeyCode, KeyboardState};
use spin::Mutex;

const BUFFER_SIZE: usize = 256;
const REGISTERABLE_KEYS: usize = 128;

/// Lock-free single-producer ring: the interrupt handler pushes, readers pop.
pub struct KeyboardBuffer {
    buffer: [KeyCode; BUFFER_SIZE],
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl KeyboardBuffer {
    pub const fn new() -> Self {
        Self {
            buffer: [KeyCode::Unknown; BUFFER_SIZE],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, key: KeyCode) -> Result<(), ()> {
        let head = self.head.load(Ordering::Acquire);
        let next_head = (head + 1) % BUFFER_SIZE;

        if next_head == self.tail.load(Ordering::Acquire) {
            return Err(()); // full
        }

        // The atomic head/tail cursors keep producer and consumer on
        // disjoint slots, so the raw write cannot race the read side.
        unsafe {
            let slot = self.buffer.as_ptr().add(head) as *mut KeyCode;
            *slot = key;
        }

        self.head.store(next_head, Ordering::Release);
        Ok(())
    }

    pub fn pop(&self) -> Option<KeyCode> {
        let tail = self.tail.load(Ordering::Acquire);

        if tail == self.head.load(Ordering::Acquire) {
            return None; // empty
        }

        let key = unsafe {
            let slot = self.buffer.as_ptr().add(tail) as *mut KeyCode;
            *slot
        };

        self.tail.store((tail + 1) % BUFFER_SIZE, Ordering::Release);
        Some(key)
    }

    pub fn clear(&self) {
        while self.pop().is_some() {}
    }
}

lazy_static! {
    pub static ref KEYBOARD_BUFFER: KeyboardBuffer = KeyboardBuffer::new();
    static ref KEYBOARD_STATE: Mutex<KeyboardState> = Mutex::new(KeyboardState::new());
    static ref REGISTERED_HANDLERS: Mutex<[Option<u64>; REGISTERABLE_KEYS]> =
        Mutex::new([None; REGISTERABLE_KEYS]);
}

pub fn init() {
    #[cfg(not(test))]
    {
        use x86_64::instructions::port::Port;
        // Drain any residual scancode the 8042 controller holds.
        let mut port: Port<u8> = Port::new(0x60);
        let _ = unsafe { port.read() };
    }
    crate::log_info!("PS/2 keyboard driver initialized.");
}

/// Bind a userland handler to a raw scancode (the `register_key` syscall).
pub fn register_key(scancode: u8, handler: u64) -> i64 {
    if scancode as usize >= REGISTERABLE_KEYS {
        return -1;
    }
    REGISTERED_HANDLERS.lock()[scancode as usize] = Some(handler);
    0
}

/// Called from the keyboard interrupt with each raw scancode.
pub fn push_scancode(scancode: u8) {
    if let Some(handler) = REGISTERED_HANDLERS
        .lock()
        .get(scancode as usize)
        .copied()
        .flatten()
    {
        let callback: extern "C" fn(u8) = unsafe { core::mem::transmute(handler as usize) };
        callback(scancode);
    }

    let keycode = KEYBOARD_STATE.lock().process_scancode(scancode);

    match keycode {
        KeyCode::Unknown => {}
        KeyCode::Interrupt => {
            crate::process::kill_foreground_process();
        }
        key => {
            let _ = KEYBOARD_BUFFER.push(key);
        }
    }
}

pub fn try_read_key() -> Option<KeyCode> {
    KEYBOARD_BUFFER.pop()
}

/// Block until a key is available, yielding the CPU between polls.
pub fn read_key() -> KeyCode {
    loop {
        if let Some(key) = try_read_key() {
            return key;
        }
        crate::scheduler::yield_now();
        crate::arch::enable_and_halt();
    }
}

pub fn clear_input_buffer() -> i64 {
    KEYBOARD_BUFFER.clear();
    0
}

/// Blocking single character fetch without echoing; -1 on end-of-input.
pub fn get_char_no_display() -> i64 {
    loop {
        match read_key() {
            KeyCode::Char(c) => return c as i64,
            KeyCode::Enter => return '\n' as i64,
            KeyCode::Backspace => return 0x08,
            KeyCode::Eof => return -1,
            _ => {}
        }
    }
}

/// Console line input with echo: reads until newline, the buffer fills, or
/// end-of-input. Returns the byte count (0 means EOF before any input).
pub fn console_read(buf: &mut [u8]) -> i64 {
    let mut count = 0usize;

    while count < buf.len() {
        match read_key() {
            KeyCode::Char(c) => {
                buf[count] = c as u8;
                count += 1;
                crate::print!("{}", c);
            }
            KeyCode::Enter => {
                buf[count] = b'\n';
                count += 1;
                crate::println!();
                break;
            }
            KeyCode::Backspace => {
                if count > 0 {
                    count -= 1;
                    crate::video::WRITER.lock().backspace();
                }
            }
            KeyCode::Eof => break,
            _ => {}
        }
    }

    count as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_is_fifo_and_bounded() {
        let buffer = KeyboardBuffer::new();
        assert_eq!(buffer.pop(), None);

        buffer.push(KeyCode::Char('a')).unwrap();
        buffer.push(KeyCode::Enter).unwrap();
        assert_eq!(buffer.pop(), Some(KeyCode::Char('a')));
        assert_eq!(buffer.pop(), Some(KeyCode::Enter));
        assert_eq!(buffer.pop(), None);

        for _ in 0..BUFFER_SIZE - 1 {
            buffer.push(KeyCode::Char('x')).unwrap();
        }
        assert!(buffer.push(KeyCode::Char('y')).is_err());

        buffer.clear();
        assert_eq!(buffer.pop(), None);
    }
}
