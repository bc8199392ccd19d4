/*
 * Copyright 2026 BadgeVMS Contributors
 *
 * This file is part of BadgeVMS.
 *
 * BadgeVMS is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * BadgeVMS is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * BadgeVMS. If not, see <https://www.gnu.org/licenses/>.
 */

//! Keyboard/window event types (spec §3 `Event`), ported from
//! `examples/original_source/main/include/badgevms/event.h`'s `event_t` tagged
//! union and `keyboard_event_t`.

bitflags::bitflags! {
    /// Modifier mask carried on a key event.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
    pub struct KeyMod: u16 {
        const NONE  = 0;
        const SHIFT = 1 << 0;
        const CTRL  = 1 << 1;
        const ALT   = 1 << 2;
        const FN    = 1 << 3;
        const SUPER = 1 << 4;
    }
}

/// Physical key identity, independent of layout/modifiers.
pub type Scancode = u16;
/// Layout-resolved virtual key code.
pub type KeyCode = u16;

/// A handful of keycodes the compositor's Fn/Alt-Tab interception cares
/// about; the full keymap is a collaborator (keyboard-matrix driver).
pub mod keycode {
    use super::KeyCode;
    pub const TAB: KeyCode = 0x09;
    pub const FN: KeyCode = 0xF0;
    pub const ALT: KeyCode = 0xF1;
    pub const CROSS: KeyCode = 0xF2;
    pub const UP: KeyCode = 0x80;
    pub const DOWN: KeyCode = 0x81;
    pub const LEFT: KeyCode = 0x82;
    pub const RIGHT: KeyCode = 0x83;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    /// Microseconds, per spec §3.
    pub timestamp_us: u64,
    pub scancode: Scancode,
    pub keycode: KeyCode,
    pub modifiers: KeyMod,
    /// Resolved character including modifiers, or 0 if non-printable.
    pub character: u8,
    pub down: bool,
    pub repeat: bool,
}

/// The tagged union of spec §3.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Event {
    None,
    Quit,
    KeyDown(KeyEvent),
    KeyUp(KeyEvent),
    WindowResize { w: i32, h: i32 },
}

impl Default for Event {
    fn default() -> Self {
        Event::None
    }
}
