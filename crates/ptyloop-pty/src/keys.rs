//! Named keys and the bytes an xterm sends for them.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    /// Modifier keys held with a [`Key`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Modifiers: u8 {
        const SHIFT = 0b0001;
        const ALT   = 0b0010;
        const CTRL  = 0b0100;
    }
}

/// A key press the host wants delivered to the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    Char(char),
    Up,
    Down,
    Right,
    Left,
    Home,
    End,
    Insert,
    Delete,
    PageUp,
    PageDown,
    /// Function key `F1` through `F12`.
    F(u8),
    Tab,
    Enter,
    Backspace,
    Escape,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown key name: {0:?}")]
pub struct UnknownKey(pub String);

impl Key {
    /// Look up a key by its lowercase name (`"up"`, `"pageup"`, `"f5"`, ...).
    pub fn from_name(name: &str) -> Option<Self> {
        let key = match name {
            "up" => Key::Up,
            "down" => Key::Down,
            "right" => Key::Right,
            "left" => Key::Left,
            "home" => Key::Home,
            "end" => Key::End,
            "insert" => Key::Insert,
            "delete" => Key::Delete,
            "pageup" => Key::PageUp,
            "pagedown" => Key::PageDown,
            "tab" => Key::Tab,
            "enter" => Key::Enter,
            "backspace" => Key::Backspace,
            "escape" => Key::Escape,
            _ => {
                let n: u8 = name.strip_prefix('f')?.parse().ok()?;
                if !(1..=12).contains(&n) {
                    return None;
                }
                Key::F(n)
            }
        };
        Some(key)
    }

    /// Bytes to write to the PTY for this key with `modifiers` held.
    ///
    /// Returns `None` for function keys outside F1-F12.
    pub fn to_bytes(self, modifiers: Modifiers) -> Option<Vec<u8>> {
        let bytes = match self {
            Key::Char(ch) => return Some(encode_char(ch, modifiers)),
            Key::Up => csi_key(modifiers, 'A'),
            Key::Down => csi_key(modifiers, 'B'),
            Key::Right => csi_key(modifiers, 'C'),
            Key::Left => csi_key(modifiers, 'D'),
            Key::Home => csi_key(modifiers, 'H'),
            Key::End => csi_key(modifiers, 'F'),
            Key::Insert => tilde_key(modifiers, 2),
            Key::Delete => tilde_key(modifiers, 3),
            Key::PageUp => tilde_key(modifiers, 5),
            Key::PageDown => tilde_key(modifiers, 6),
            Key::F(n @ 1..=4) => ss3_key(modifiers, b'P' + (n - 1)),
            Key::F(n @ 5..=12) => tilde_key(modifiers, FUNCTION_CODES[(n - 5) as usize]),
            Key::F(_) => return None,
            Key::Tab => with_alt_prefix(modifiers, vec![b'\t']),
            Key::Enter => with_alt_prefix(modifiers, vec![b'\r']),
            Key::Backspace => with_alt_prefix(modifiers, vec![0x7f]),
            Key::Escape => with_alt_prefix(modifiers, vec![0x1b]),
        };
        Some(bytes)
    }
}

impl FromStr for Key {
    type Err = UnknownKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        if let (Some(ch), None) = (chars.next(), chars.next()) {
            return Ok(Key::Char(ch));
        }
        Key::from_name(&s.to_ascii_lowercase()).ok_or_else(|| UnknownKey(s.to_string()))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Char(ch) => write!(f, "{ch}"),
            Key::F(n) => write!(f, "f{n}"),
            other => write!(f, "{}", format!("{other:?}").to_ascii_lowercase()),
        }
    }
}

/// Translate a host key event to PTY bytes.
///
/// Named keys win; otherwise the event's `character` is sent as UTF-8,
/// control characters included (Ctrl+C arrives as `'\x03'`).
pub fn translate(name: &str, character: Option<char>) -> Option<Vec<u8>> {
    if let Some(key) = Key::from_name(name) {
        return key.to_bytes(Modifiers::empty());
    }
    character.map(|ch| ch.to_string().into_bytes())
}

/// `CSI n ~` codes for F5-F12.
const FUNCTION_CODES: [u8; 8] = [15, 17, 18, 19, 20, 21, 23, 24];

fn encode_char(ch: char, modifiers: Modifiers) -> Vec<u8> {
    let bytes = if modifiers.contains(Modifiers::CTRL) && ch.is_ascii_alphabetic() {
        vec![ch.to_ascii_lowercase() as u8 - b'a' + 1]
    } else {
        ch.to_string().into_bytes()
    };
    with_alt_prefix(modifiers, bytes)
}

fn with_alt_prefix(modifiers: Modifiers, bytes: Vec<u8>) -> Vec<u8> {
    if !modifiers.contains(Modifiers::ALT) {
        return bytes;
    }
    let mut prefixed = Vec::with_capacity(bytes.len() + 1);
    prefixed.push(0x1b);
    prefixed.extend(bytes);
    prefixed
}

/// xterm modifier parameter: 1 + shift + 2*alt + 4*ctrl.
fn modifier_param(modifiers: Modifiers) -> Option<u8> {
    if modifiers.is_empty() {
        return None;
    }
    let mut value = 1;
    if modifiers.contains(Modifiers::SHIFT) {
        value += 1;
    }
    if modifiers.contains(Modifiers::ALT) {
        value += 2;
    }
    if modifiers.contains(Modifiers::CTRL) {
        value += 4;
    }
    Some(value)
}

fn csi_key(modifiers: Modifiers, final_byte: char) -> Vec<u8> {
    match modifier_param(modifiers) {
        Some(param) => format!("\x1b[1;{param}{final_byte}").into_bytes(),
        None => format!("\x1b[{final_byte}").into_bytes(),
    }
}

fn tilde_key(modifiers: Modifiers, code: u8) -> Vec<u8> {
    match modifier_param(modifiers) {
        Some(param) => format!("\x1b[{code};{param}~").into_bytes(),
        None => format!("\x1b[{code}~").into_bytes(),
    }
}

fn ss3_key(modifiers: Modifiers, final_byte: u8) -> Vec<u8> {
    match modifier_param(modifiers) {
        Some(param) => format!("\x1b[1;{param}{}", final_byte as char).into_bytes(),
        None => vec![0x1b, b'O', final_byte],
    }
}
