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

//! Windows and framebuffers (spec §3), grounded on
//! `examples/original_source/badgevms/include/badgevms/compositor.h`'s
//! `window_flag_t` / `window_rect_t` and `compositor.c`'s `managed_framebuffer_t`.

use crate::compositor::event::Event;
use crate::compositor::geometry::Rect;
use crate::task::pid::Pid;
use crossbeam_channel::{Receiver, Sender};
use std::sync::{Arc, Condvar};
use std::time::Duration;

/// Maximum window title length (spec §3).
pub const TITLE_MAX: usize = 20;
/// Capacity of a window's event queue (spec §3, §5).
pub const EVENT_QUEUE_DEPTH: usize = 10;
/// Maximum simultaneous framebuffer slots per window.
pub const MAX_FRAMEBUFFERS: usize = 3;

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
    pub struct WindowFlags: u32 {
        const NONE             = 0;
        const FULLSCREEN       = 1 << 0;
        const ALWAYS_ON_TOP    = 1 << 1;
        const UNDECORATED      = 1 << 2;
        const MAXIMIZED        = 1 << 3;
        const MAXIMIZED_LEFT   = 1 << 4;
        const MAXIMIZED_RIGHT  = 1 << 5;
        const DOUBLE_BUFFERED  = 1 << 6;
        const LOW_PRIORITY     = 1 << 7;
        const FLIP_HORIZONTAL  = 1 << 8;
        const FLIP_VERTICAL    = 1 << 9;
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PixelFormat {
    Rgb565,
    Bgr565,
    Rgba8888,
    Bgra8888,
    Argb8888,
    Abgr8888,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Rgb565 | PixelFormat::Bgr565 => 2,
            _ => 4,
        }
    }
}

/// A window's framebuffer: one slot of demand-mapped pixel storage.
///
/// `clean` tracks submission, not content: `window_framebuffer_update` sets
/// it (a frame is waiting to be drawn) and the compositor's frame loop
/// clears it once it has blitted the buffer's visible region, waking anyone
/// blocked in [`Framebuffer::wait_drawn`] (spec §4.6 step 5, §5).
pub struct Framebuffer {
    pub w: u32,
    pub h: u32,
    pub format: PixelFormat,
    /// Base virtual address of the backing pages, in the framebuffer arena.
    pub vaddr: u64,
    clean: std::sync::Mutex<bool>,
    clean_cv: Condvar,
    pub active: std::sync::atomic::AtomicBool,
}

impl Framebuffer {
    pub fn new(w: u32, h: u32, format: PixelFormat, vaddr: u64) -> Self {
        Self {
            w,
            h,
            format,
            vaddr,
            clean: std::sync::Mutex::new(true),
            clean_cv: Condvar::new(),
            active: std::sync::atomic::AtomicBool::new(true),
        }
    }

    /// `window_framebuffer_update`: marks a frame submitted and waiting to
    /// be drawn.
    pub fn request_redraw(&self) {
        *self.clean.lock().unwrap() = true;
    }

    /// Called by the compositor after blitting this buffer's visible region.
    pub fn mark_drawn(&self) {
        *self.clean.lock().unwrap() = false;
        self.clean_cv.notify_all();
    }

    /// Blocks (if `block`) until the compositor has drawn the last submitted
    /// frame, or `timeout` elapses. Returns whether it was drawn by the time
    /// this call returned.
    pub fn wait_drawn(&self, block: bool, timeout: Option<Duration>) -> bool {
        let clean = self.clean.lock().unwrap();
        if !*clean || !block {
            return !*clean;
        }
        let guard = match timeout {
            Some(t) => self.clean_cv.wait_timeout_while(clean, t, |c| *c).map(|(g, _)| g),
            None => self.clean_cv.wait_while(clean, |c| *c),
        };
        !*guard.unwrap()
    }
}

/// One window on the compositor's stack.
pub struct Window {
    pub id: u64,
    pub owner: Pid,
    title: std::sync::Mutex<String>,
    pub flags: std::sync::Mutex<WindowFlags>,
    pub rect: std::sync::Mutex<Rect>,
    /// Saved rect from before entering fullscreen, restored on exit.
    saved_rect: std::sync::Mutex<Option<Rect>>,
    pub framebuffers: std::sync::Mutex<[Option<Arc<Framebuffer>>; MAX_FRAMEBUFFERS]>,
    pub cur_fb: std::sync::atomic::AtomicUsize,
    pub visible: std::sync::Mutex<Vec<Rect>>,
    event_tx: Sender<Event>,
    event_rx: Receiver<Event>,
}

impl Window {
    pub fn new(id: u64, owner: Pid, title: &str, rect: Rect, flags: WindowFlags) -> Self {
        let (event_tx, event_rx) = crossbeam_channel::bounded(EVENT_QUEUE_DEPTH);
        Self {
            id,
            owner,
            title: std::sync::Mutex::new(title.chars().take(TITLE_MAX).collect()),
            flags: std::sync::Mutex::new(flags),
            rect: std::sync::Mutex::new(rect),
            saved_rect: std::sync::Mutex::new(None),
            framebuffers: std::sync::Mutex::new([None, None, None]),
            cur_fb: std::sync::atomic::AtomicUsize::new(0),
            visible: std::sync::Mutex::new(vec![rect]),
            event_tx,
            event_rx,
        }
    }

    pub fn title(&self) -> String {
        self.title.lock().unwrap().clone()
    }

    pub fn set_title(&self, title: &str) {
        *self.title.lock().unwrap() = title.chars().take(TITLE_MAX).collect();
    }

    /// Enqueues an event for this window, dropping it if the queue is full
    /// (spec §4.6: "Non-swallowed events are enqueued... drop if full").
    pub fn push_event(&self, event: Event) {
        let _ = self.event_tx.try_send(event);
    }

    pub fn poll_event(&self, block: bool, timeout: Option<std::time::Duration>) -> Event {
        if !block {
            return self.event_rx.try_recv().unwrap_or(Event::None);
        }
        match timeout {
            Some(t) => self.event_rx.recv_timeout(t).unwrap_or(Event::None),
            None => self.event_rx.recv().unwrap_or(Event::None),
        }
    }

    /// Transitions flags, saving/restoring the pre-fullscreen rect exactly
    /// (spec §4.6, testable property in §8). `screen_rect` is applied to the
    /// window on entering fullscreen; it is unused (and may be `None`) on any
    /// other transition.
    pub fn set_flags(&self, new_flags: WindowFlags, screen_rect: Option<Rect>) {
        let mut flags = self.flags.lock().unwrap();
        let was_fullscreen = flags.contains(WindowFlags::FULLSCREEN);
        let now_fullscreen = new_flags.contains(WindowFlags::FULLSCREEN);

        if !was_fullscreen && now_fullscreen {
            *self.saved_rect.lock().unwrap() = Some(*self.rect.lock().unwrap());
            if let Some(screen_rect) = screen_rect {
                *self.rect.lock().unwrap() = screen_rect;
            }
        } else if was_fullscreen && !now_fullscreen {
            if let Some(saved) = self.saved_rect.lock().unwrap().take() {
                *self.rect.lock().unwrap() = saved;
            }
        }
        *flags = new_flags;
    }

    pub fn is_fullscreen(&self) -> bool {
        self.flags.lock().unwrap().contains(WindowFlags::FULLSCREEN)
    }
}
