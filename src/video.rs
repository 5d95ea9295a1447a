//! Framebuffer console.
//!
//! The bootloader leaves a VBE mode-info block at a fixed address; text is
//! rendered from the 8x8 bitmap font scaled by the current font size, and
//! the same pixel path backs the drawing primitives surfaced through
//! syscalls. Hosted tests render into a RAM framebuffer instead.

use core::fmt;
use font8x8::legacy::BASIC_LEGACY;
use lazy_static::lazy_static;
use spin::Mutex;
use volatile::Volatile;

const FONT_WIDTH: usize = 8;
const FONT_HEIGHT: usize = 8;
const MIN_FONT_SCALE: u8 = 1;
const MAX_FONT_SCALE: u8 = 4;
const BYTES_PER_PIXEL: usize = 3;

pub const DEFAULT_TEXT_COLOR: u32 = 0x00FF_FFFF;
pub const DEFAULT_BACKGROUND_COLOR: u32 = 0x0000_0000;

#[cfg(not(test))]
mod probe {
    /// VBE 3.0 mode information block, filled in by the bootloader.
    #[repr(C, packed)]
    pub struct VbeModeInfo {
        pub attributes: u16,
        pub window_a: u8,
        pub window_b: u8,
        pub granularity: u16,
        pub window_size: u16,
        pub segment_a: u16,
        pub segment_b: u16,
        pub win_func_ptr: u32,
        pub pitch: u16,
        pub width: u16,
        pub height: u16,
        pub w_char: u8,
        pub y_char: u8,
        pub planes: u8,
        pub bpp: u8,
        pub banks: u8,
        pub memory_model: u8,
        pub bank_size: u8,
        pub image_pages: u8,
        pub reserved0: u8,
        pub red_mask: u8,
        pub red_position: u8,
        pub green_mask: u8,
        pub green_position: u8,
        pub blue_mask: u8,
        pub blue_position: u8,
        pub reserved_mask: u8,
        pub reserved_position: u8,
        pub direct_color_attributes: u8,
        pub framebuffer: u32,
    }

    const VBE_MODE_INFO_ADDRESS: usize = 0x5C00;

    pub fn framebuffer() -> (usize, usize, usize, usize) {
        let info = unsafe { &*(VBE_MODE_INFO_ADDRESS as *const VbeModeInfo) };
        (
            info.framebuffer as usize,
            info.width as usize,
            info.height as usize,
            info.pitch as usize,
        )
    }
}

#[cfg(test)]
mod probe {
    use core::ptr::addr_of_mut;

    pub const TEST_WIDTH: usize = 320;
    pub const TEST_HEIGHT: usize = 200;

    static mut TEST_FRAMEBUFFER: [u8; TEST_WIDTH * TEST_HEIGHT * 3] =
        [0; TEST_WIDTH * TEST_HEIGHT * 3];

    pub fn framebuffer() -> (usize, usize, usize, usize) {
        let base = unsafe { addr_of_mut!(TEST_FRAMEBUFFER) } as usize;
        (base, TEST_WIDTH, TEST_HEIGHT, TEST_WIDTH * 3)
    }
}

pub struct Writer {
    base: usize,
    width: usize,
    height: usize,
    pitch: usize,
    cursor_x: usize,
    cursor_y: usize,
    font_scale: u8,
    text_color: u32,
    background_color: u32,
}

impl Writer {
    fn new() -> Self {
        let (base, width, height, pitch) = probe::framebuffer();
        Writer {
            base,
            width,
            height,
            pitch,
            cursor_x: 0,
            cursor_y: 0,
            font_scale: 2,
            text_color: DEFAULT_TEXT_COLOR,
            background_color: DEFAULT_BACKGROUND_COLOR,
        }
    }

    fn cell_width(&self) -> usize {
        FONT_WIDTH * self.font_scale as usize
    }

    fn cell_height(&self) -> usize {
        FONT_HEIGHT * self.font_scale as usize
    }

    pub fn put_pixel(&mut self, x: usize, y: usize, color: u32) {
        if x >= self.width || y >= self.height {
            return;
        }
        let offset = self.base + y * self.pitch + x * BYTES_PER_PIXEL;
        unsafe {
            (*(offset as *mut Volatile<u8>)).write(color as u8);
            (*((offset + 1) as *mut Volatile<u8>)).write((color >> 8) as u8);
            (*((offset + 2) as *mut Volatile<u8>)).write((color >> 16) as u8);
        }
    }

    #[cfg(test)]
    fn read_pixel_byte(&self, offset: usize) -> u8 {
        unsafe { (*((self.base + offset) as *const Volatile<u8>)).read() }
    }

    fn draw_glyph(&mut self, c: char) {
        let glyph = BASIC_LEGACY
            .get(c as usize)
            .unwrap_or(&BASIC_LEGACY[b'?' as usize]);
        let scale = self.font_scale as usize;

        for (row, bits) in glyph.iter().enumerate() {
            for col in 0..FONT_WIDTH {
                let lit = bits & (1 << col) != 0;
                let color = if lit {
                    self.text_color
                } else {
                    self.background_color
                };
                for sy in 0..scale {
                    for sx in 0..scale {
                        self.put_pixel(
                            self.cursor_x + col * scale + sx,
                            self.cursor_y + row * scale + sy,
                            color,
                        );
                    }
                }
            }
        }
    }

    fn scroll(&mut self) {
        let band = self.cell_height() * self.pitch;
        let visible = self.height * self.pitch;
        unsafe {
            core::ptr::copy(
                (self.base + band) as *const u8,
                self.base as *mut u8,
                visible - band,
            );
        }
        for y in self.height - self.cell_height()..self.height {
            for x in 0..self.width {
                self.put_pixel(x, y, self.background_color);
            }
        }
    }

    fn newline(&mut self) {
        self.cursor_x = 0;
        self.cursor_y += self.cell_height();
        if self.cursor_y + self.cell_height() > self.height {
            self.scroll();
            self.cursor_y -= self.cell_height();
        }
    }

    pub fn put_char(&mut self, c: char) {
        match c {
            '\n' => self.newline(),
            '\r' => self.cursor_x = 0,
            '\x08' => self.backspace(),
            _ => {
                if self.cursor_x + self.cell_width() > self.width {
                    self.newline();
                }
                self.draw_glyph(c);
                self.cursor_x += self.cell_width();
            }
        }
    }

    pub fn backspace(&mut self) {
        if self.cursor_x >= self.cell_width() {
            self.cursor_x -= self.cell_width();
        } else if self.cursor_y >= self.cell_height() {
            self.cursor_y -= self.cell_height();
            self.cursor_x = (self.width / self.cell_width() - 1) * self.cell_width();
        } else {
            return;
        }
        let saved = self.text_color;
        self.text_color = self.background_color;
        self.draw_glyph(' ');
        self.text_color = saved;
    }

    pub fn clear(&mut self) {
        self.fill(self.background_color);
        self.cursor_x = 0;
        self.cursor_y = 0;
    }

    pub fn fill(&mut self, color: u32) {
        for y in 0..self.height {
            for x in 0..self.width {
                self.put_pixel(x, y, color);
            }
        }
    }
}

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.chars() {
            self.put_char(c);
        }
        Ok(())
    }
}

lazy_static! {
    pub static ref WRITER: Mutex<Writer> = Mutex::new(Writer::new());
}

pub fn init() {
    let writer = WRITER.lock();
    crate::log_info!(
        "Framebuffer console: {}x{} at {:#x}.",
        writer.width,
        writer.height,
        writer.base
    );
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    crate::arch::without_interrupts(|| {
        let _ = WRITER.lock().write_fmt(args);
    });
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::video::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => { $crate::print!("\n") };
    ($($arg:tt)*) => {{
        $crate::video::_print(format_args!($($arg)*));
        $crate::print!("\n");
    }};
}

/// Raw console write used by the `write` syscall path.
pub fn console_write(bytes: &[u8]) -> i64 {
    crate::arch::without_interrupts(|| {
        let mut writer = WRITER.lock();
        for &byte in bytes {
            writer.put_char(byte as char);
        }
        bytes.len() as i64
    })
}

pub fn set_text_color(color: u32) -> i64 {
    WRITER.lock().text_color = color;
    0
}

pub fn set_background_color(color: u32) -> i64 {
    WRITER.lock().background_color = color;
    0
}

/// Clamp and apply a font scale; returns the effective scale.
pub fn set_font_size(size: u8) -> i64 {
    let mut writer = WRITER.lock();
    writer.font_scale = size.clamp(MIN_FONT_SCALE, MAX_FONT_SCALE);
    writer.font_scale as i64
}

pub fn increase_font_size() -> i64 {
    let current = WRITER.lock().font_scale;
    set_font_size(current.saturating_add(1))
}

pub fn decrease_font_size() -> i64 {
    let current = WRITER.lock().font_scale;
    set_font_size(current.saturating_sub(1))
}

pub fn clear_screen() -> i64 {
    WRITER.lock().clear();
    0
}

pub fn fill_screen(color: u32) -> i64 {
    WRITER.lock().fill(color);
    0
}

pub fn window_width() -> i64 {
    WRITER.lock().width as i64
}

pub fn window_height() -> i64 {
    WRITER.lock().height as i64
}

pub fn draw_rectangle(color: u32, width: usize, height: usize, x: usize, y: usize) -> i64 {
    let mut writer = WRITER.lock();
    for dy in 0..height {
        for dx in 0..width {
            writer.put_pixel(x + dx, y + dy, color);
        }
    }
    0
}

pub fn draw_circle(color: u32, top_left_x: usize, top_left_y: usize, diameter: usize) -> i64 {
    let mut writer = WRITER.lock();
    let radius = (diameter / 2) as i64;
    let center_x = top_left_x as i64 + radius;
    let center_y = top_left_y as i64 + radius;

    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy <= radius * radius {
                writer.put_pixel((center_x + dx) as usize, (center_y + dy) as usize, color);
            }
        }
    }
    0
}
