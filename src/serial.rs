use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::instructions::port::Port;

/// 16550-compatible UART on the first COM port, used for kernel logging.
pub struct SerialPort {
    data: Port<u8>,
    int_en: Port<u8>,
    fifo_ctrl: Port<u8>,
    line_ctrl: Port<u8>,
    modem_ctrl: Port<u8>,
    line_sts: Port<u8>,
}

impl SerialPort {
    pub const unsafe fn new(base: u16) -> SerialPort {
        SerialPort {
            data: Port::new(base),
            int_en: Port::new(base + 1),
            fifo_ctrl: Port::new(base + 2),
            line_ctrl: Port::new(base + 3),
            modem_ctrl: Port::new(base + 4),
            line_sts: Port::new(base + 5),
        }
    }

    pub fn init(&mut self) {
        unsafe {
            self.int_en.write(0x00);
            self.line_ctrl.write(0x80); // DLAB on
            self.data.write(0x03); // 38400 baud
            self.int_en.write(0x00);
            self.line_ctrl.write(0x03); // 8N1
            self.fifo_ctrl.write(0xC7);
            self.modem_ctrl.write(0x0B);
        }
    }

    fn wait_for_tx_empty(&mut self) {
        unsafe {
            while (self.line_sts.read() & 0x20) == 0 {}
        }
    }

    pub fn send(&mut self, byte: u8) {
        self.wait_for_tx_empty();
        unsafe {
            self.data.write(byte);
        }
    }
}

impl core::fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for byte in s.bytes() {
            self.send(byte);
        }
        Ok(())
    }
}

lazy_static! {
    pub static ref SERIAL1: Mutex<SerialPort> = {
        let mut serial_port = unsafe { SerialPort::new(0x3F8) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

#[cfg(not(test))]
#[doc(hidden)]
pub fn _log(level: &str, args: core::fmt::Arguments) {
    use core::fmt::Write;
    crate::arch::without_interrupts(|| {
        let mut serial = SERIAL1.lock();
        let _ = serial.write_fmt(format_args!("[{}] {}\n", level, args));
    });
}

// Hosted tests have no UART; logging becomes a no-op.
#[cfg(test)]
#[doc(hidden)]
pub fn _log(_level: &str, _args: core::fmt::Arguments) {}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::serial::_log("INFO", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::serial::_log("WARN", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::serial::_log("ERROR", format_args!($($arg)*))
    };
}

pub fn init() {
    #[cfg(not(test))]
    {
        let _ = SERIAL1.lock();
    }
}
