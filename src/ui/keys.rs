//! Key codes
//!
//! The viewer works on a raw key-code space modelled on what a terminal
//! delivers: Ctrl+letter arrives as a control code 1-26, Alt+key as Escape
//! followed by the key, and special keys get codes above the Unicode range.
//! [`to_keysym`] translates these codes into X keysyms for the remote side.

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

/// A raw key code as delivered by the canvas
pub type RawKey = u32;

pub const KEY_ESCAPE: RawKey = 0x1b;
pub const KEY_DELETE: RawKey = 0x7f;

// Special keys live past the last Unicode scalar value so that any
// character can be passed on as its own code point.
const SPECIAL_BASE: RawKey = 0x11_0000;
pub const KEY_BACKSPACE: RawKey = SPECIAL_BASE;
pub const KEY_TAB: RawKey = SPECIAL_BASE + 1;
pub const KEY_RETURN: RawKey = SPECIAL_BASE + 2;
pub const KEY_PAUSE: RawKey = SPECIAL_BASE + 3;
pub const KEY_UP: RawKey = SPECIAL_BASE + 4;
pub const KEY_DOWN: RawKey = SPECIAL_BASE + 5;
pub const KEY_LEFT: RawKey = SPECIAL_BASE + 6;
pub const KEY_RIGHT: RawKey = SPECIAL_BASE + 7;
pub const KEY_INSERT: RawKey = SPECIAL_BASE + 8;
pub const KEY_HOME: RawKey = SPECIAL_BASE + 9;
pub const KEY_END: RawKey = SPECIAL_BASE + 10;
pub const KEY_PAGEUP: RawKey = SPECIAL_BASE + 11;
pub const KEY_PAGEDOWN: RawKey = SPECIAL_BASE + 12;
pub const KEY_F1: RawKey = SPECIAL_BASE + 0x20;
pub const KEY_F15: RawKey = KEY_F1 + 14;

/// X keysyms used by the viewer
pub mod xk {
    pub const BACKSPACE: u32 = 0xff08;
    pub const TAB: u32 = 0xff09;
    pub const RETURN: u32 = 0xff0d;
    pub const PAUSE: u32 = 0xff13;
    pub const ESCAPE: u32 = 0xff1b;
    pub const HOME: u32 = 0xff50;
    pub const LEFT: u32 = 0xff51;
    pub const UP: u32 = 0xff52;
    pub const RIGHT: u32 = 0xff53;
    pub const DOWN: u32 = 0xff54;
    pub const PAGE_UP: u32 = 0xff55;
    pub const PAGE_DOWN: u32 = 0xff56;
    pub const END: u32 = 0xff57;
    pub const INSERT: u32 = 0xff63;
    pub const F1: u32 = 0xffbe;
    pub const SHIFT_L: u32 = 0xffe1;
    pub const SHIFT_R: u32 = 0xffe2;
    pub const CONTROL_L: u32 = 0xffe3;
    pub const CONTROL_R: u32 = 0xffe4;
    pub const ALT_L: u32 = 0xffe9;
    pub const ALT_R: u32 = 0xffea;
    pub const SUPER_L: u32 = 0xffeb;
    pub const DELETE: u32 = 0xffff;
}

const SPECIAL_KEYSYMS: [(RawKey, u32); 15] = [
    (KEY_BACKSPACE, xk::BACKSPACE),
    (KEY_TAB, xk::TAB),
    (KEY_RETURN, xk::RETURN),
    (KEY_PAUSE, xk::PAUSE),
    (KEY_ESCAPE, xk::ESCAPE),
    (KEY_DELETE, xk::DELETE),
    (KEY_UP, xk::UP),
    (KEY_DOWN, xk::DOWN),
    (KEY_LEFT, xk::LEFT),
    (KEY_RIGHT, xk::RIGHT),
    (KEY_INSERT, xk::INSERT),
    (KEY_HOME, xk::HOME),
    (KEY_END, xk::END),
    (KEY_PAGEUP, xk::PAGE_UP),
    (KEY_PAGEDOWN, xk::PAGE_DOWN),
];

/// Translate a raw key code into an X keysym.
///
/// Returns `None` for codes with no mapping; those must never be sent.
pub fn to_keysym(key: RawKey) -> Option<u32> {
    if (0x20..=0x7e).contains(&key) {
        return Some(key);
    }
    if (KEY_F1..=KEY_F15).contains(&key) {
        return Some(xk::F1 + (key - KEY_F1));
    }
    if let Some(&(_, sym)) = SPECIAL_KEYSYMS.iter().find(|(code, _)| *code == key) {
        return Some(sym);
    }
    if key < 0x100 {
        return Some(key);
    }
    None
}

/// Control code for Ctrl+letter, if `key` is one
pub fn ctrl_letter(key: RawKey) -> Option<char> {
    match key {
        1..=26 => char::from_u32(u32::from(b'a') + key - 1),
        _ => None,
    }
}

/// Turn a crossterm key event into the raw codes a terminal would have
/// sent. Usually one code; Alt+key gives two.
pub fn raw_keys(event: &KeyEvent) -> Vec<RawKey> {
    let ctrl = event.modifiers.contains(KeyModifiers::CONTROL);
    let alt = event.modifiers.contains(KeyModifiers::ALT);

    let key = match event.code {
        KeyCode::Char(ch) if ctrl && ch.is_ascii_alphabetic() => {
            u32::from(ch.to_ascii_lowercase() as u8 - b'a' + 1)
        }
        KeyCode::Char('[') if ctrl => KEY_ESCAPE,
        KeyCode::Char(ch) => ch as u32,
        KeyCode::Enter => KEY_RETURN,
        KeyCode::Backspace => KEY_BACKSPACE,
        KeyCode::Tab | KeyCode::BackTab => KEY_TAB,
        KeyCode::Esc => KEY_ESCAPE,
        KeyCode::Delete => KEY_DELETE,
        KeyCode::Up => KEY_UP,
        KeyCode::Down => KEY_DOWN,
        KeyCode::Left => KEY_LEFT,
        KeyCode::Right => KEY_RIGHT,
        KeyCode::Insert => KEY_INSERT,
        KeyCode::Home => KEY_HOME,
        KeyCode::End => KEY_END,
        KeyCode::PageUp => KEY_PAGEUP,
        KeyCode::PageDown => KEY_PAGEDOWN,
        KeyCode::Pause => KEY_PAUSE,
        KeyCode::F(n @ 1..=15) => KEY_F1 + u32::from(n) - 1,
        _ => return Vec::new(),
    };

    // Alt + key = ESC + key
    if alt {
        vec![KEY_ESCAPE, key]
    } else {
        vec![key]
    }
}
