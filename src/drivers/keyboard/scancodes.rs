//! PS/2 scancode set 1 decoding.

use bitflags::bitflags;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCode {
    Char(char),
    Enter,
    Backspace,
    /// Ctrl+D, surfaced to readers as end-of-input.
    Eof,
    /// Ctrl+C, kills the foreground process.
    Interrupt,
    ArrowUp,
    ArrowDown,
    ArrowLeft,
    ArrowRight,
    F(u8),
    Unknown,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Modifiers: u8 {
        const SHIFT = 1 << 0;
        const CTRL = 1 << 1;
        const ALT = 1 << 2;
        const CAPS_LOCK = 1 << 3;
    }
}

pub struct KeyboardState {
    modifiers: Modifiers,
    extended_scancode: bool,
}

impl KeyboardState {
    pub const fn new() -> Self {
        Self {
            modifiers: Modifiers::empty(),
            extended_scancode: false,
        }
    }

    pub fn process_scancode(&mut self, scancode: u8) -> KeyCode {
        if scancode == 0xE0 {
            self.extended_scancode = true;
            return KeyCode::Unknown;
        }

        let is_extended = self.extended_scancode;
        self.extended_scancode = false;

        if is_extended {
            return match scancode {
                0x48 => KeyCode::ArrowUp,
                0x4B => KeyCode::ArrowLeft,
                0x4D => KeyCode::ArrowRight,
                0x50 => KeyCode::ArrowDown,
                0x1D => self.modifier_make(Modifiers::CTRL),
                0x9D => self.modifier_break(Modifiers::CTRL),
                0x38 => self.modifier_make(Modifiers::ALT),
                0xB8 => self.modifier_break(Modifiers::ALT),
                _ => KeyCode::Unknown,
            };
        }

        match scancode {
            0x02 => self.char_with_shift('1', '!'),
            0x03 => self.char_with_shift('2', '@'),
            0x04 => self.char_with_shift('3', '#'),
            0x05 => self.char_with_shift('4', '$'),
            0x06 => self.char_with_shift('5', '%'),
            0x07 => self.char_with_shift('6', '^'),
            0x08 => self.char_with_shift('7', '&'),
            0x09 => self.char_with_shift('8', '*'),
            0x0A => self.char_with_shift('9', '('),
            0x0B => self.char_with_shift('0', ')'),
            0x0C => self.char_with_shift('-', '_'),
            0x0D => self.char_with_shift('=', '+'),

            0x10 => self.char_with_shift('q', 'Q'),
            0x11 => self.char_with_shift('w', 'W'),
            0x12 => self.char_with_shift('e', 'E'),
            0x13 => self.char_with_shift('r', 'R'),
            0x14 => self.char_with_shift('t', 'T'),
            0x15 => self.char_with_shift('y', 'Y'),
            0x16 => self.char_with_shift('u', 'U'),
            0x17 => self.char_with_shift('i', 'I'),
            0x18 => self.char_with_shift('o', 'O'),
            0x19 => self.char_with_shift('p', 'P'),
            0x1A => self.char_with_shift('[', '{'),
            0x1B => self.char_with_shift(']', '}'),

            0x1E => self.char_with_shift('a', 'A'),
            0x1F => self.char_with_shift('s', 'S'),
            0x20 => self.char_with_shift('d', 'D'),
            0x21 => self.char_with_shift('f', 'F'),
            0x22 => self.char_with_shift('g', 'G'),
            0x23 => self.char_with_shift('h', 'H'),
            0x24 => self.char_with_shift('j', 'J'),
            0x25 => self.char_with_shift('k', 'K'),
            0x26 => self.char_with_shift('l', 'L'),
            0x27 => self.char_with_shift(';', ':'),
            0x28 => self.char_with_shift('\'', '"'),
            0x29 => self.char_with_shift('`', '~'),
            0x2B => self.char_with_shift('\\', '|'),

            0x2C => self.char_with_shift('z', 'Z'),
            0x2D => self.char_with_shift('x', 'X'),
            0x2E => {
                if self.modifiers.contains(Modifiers::CTRL) {
                    KeyCode::Interrupt
                } else {
                    self.char_with_shift('c', 'C')
                }
            }
            0x2F => self.char_with_shift('v', 'V'),
            0x30 => self.char_with_shift('b', 'B'),
            0x31 => self.char_with_shift('n', 'N'),
            0x32 => self.char_with_shift('m', 'M'),
            0x33 => self.char_with_shift(',', '<'),
            0x34 => self.char_with_shift('.', '>'),
            0x35 => self.char_with_shift('/', '?'),

            0x2A | 0x36 => self.modifier_make(Modifiers::SHIFT),
            0xAA | 0xB6 => self.modifier_break(Modifiers::SHIFT),
            0x1D => self.modifier_make(Modifiers::CTRL),
            0x9D => self.modifier_break(Modifiers::CTRL),
            0x38 => self.modifier_make(Modifiers::ALT),
            0xB8 => self.modifier_break(Modifiers::ALT),
            0x3A => {
                self.modifiers.toggle(Modifiers::CAPS_LOCK);
                KeyCode::Unknown
            }

            0x39 => KeyCode::Char(' '),
            0x1C => KeyCode::Enter,
            0x0E => KeyCode::Backspace,

            0x3B => KeyCode::F(1),
            0x3C => KeyCode::F(2),
            0x3D => KeyCode::F(3),
            0x3E => KeyCode::F(4),
            0x3F => KeyCode::F(5),
            0x40 => KeyCode::F(6),
            0x41 => KeyCode::F(7),
            0x42 => KeyCode::F(8),
            0x43 => KeyCode::F(9),
            0x44 => KeyCode::F(10),
            0x57 => KeyCode::F(11),
            0x58 => KeyCode::F(12),

            _ => KeyCode::Unknown,
        }
    }

    fn modifier_make(&mut self, modifier: Modifiers) -> KeyCode {
        self.modifiers.insert(modifier);
        KeyCode::Unknown
    }

    fn modifier_break(&mut self, modifier: Modifiers) -> KeyCode {
        self.modifiers.remove(modifier);
        KeyCode::Unknown
    }

    fn char_with_shift(&self, lower: char, upper: char) -> KeyCode {
        if self.modifiers.contains(Modifiers::CTRL) && lower == 'd' {
            return KeyCode::Eof;
        }

        let is_letter = lower.is_ascii_lowercase();
        let shift_active = if is_letter && self.modifiers.contains(Modifiers::CAPS_LOCK) {
            !self.modifiers.contains(Modifiers::SHIFT)
        } else {
            self.modifiers.contains(Modifiers::SHIFT)
        };

        if shift_active {
            KeyCode::Char(upper)
        } else {
            KeyCode::Char(lower)
        }
    }
}
