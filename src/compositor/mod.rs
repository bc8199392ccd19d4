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

//! The window compositor (spec §4.6): window stack, framebuffer lifecycle,
//! visible-region computation, hardware-blit dispatch and vsync-driven frame
//! cadence, keyboard event routing.
//!
//! Grounded on `examples/original_source/badgevms/compositor/compositor.c`'s
//! `compositor()` task loop for the per-frame command-drain / keyboard-poll /
//! per-window-blit sequencing, and on `examples/original_source/badgevms/
//! compositor/pixel_functions.c` for the rectangle algebra ([`geometry`]).
//! The PPA hardware accelerator is a collaborator, modeled as the
//! [`Blitter`] trait so tests can assert dispatch without real hardware.

pub mod event;
pub mod geometry;
pub mod window;

use crate::compositor::event::{keycode, Event, KeyEvent, KeyMod};
use crate::compositor::geometry::Rect;
use crate::compositor::window::{Framebuffer, PixelFormat, Window, WindowFlags};
use crate::error::{EResult, KernelError};
use crate::memory::buddy::{AllocKind, PageAllocator};
use crate::memory::vmem::Mmu;
use crate::memory::PAGE_SIZE;
use crate::task::pid::Pid;
use crate::task::Priority;
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Panel rotation, applied to every blit destination rect (spec §4.6).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RotationAngle {
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

/// The PPA-equivalent hardware 2D blit accelerator. A collaborator per spec
/// §1; `NoopBlitter`/`RecordingBlitter` stand in for it in tests.
pub trait Blitter: Send + Sync {
    fn blit(
        &self,
        src: Rect,
        dst: Rect,
        format: PixelFormat,
        rotation: RotationAngle,
        scanout: usize,
    ) -> EResult<()>;
}

/// A `Blitter` that always succeeds and remembers every call it received.
#[derive(Default)]
pub struct RecordingBlitter {
    pub calls: Mutex<Vec<(Rect, Rect, usize)>>,
}

impl Blitter for RecordingBlitter {
    fn blit(&self, src: Rect, dst: Rect, _format: PixelFormat, _rotation: RotationAngle, scanout: usize) -> EResult<()> {
        self.calls.lock().unwrap().push((src, dst, scanout));
        Ok(())
    }
}

/// Number of scan-out buffers the compositor rotates through (spec §4.6).
const SCANOUT_COUNT: usize = 3;
/// Commands drained per frame (spec §4.6 step 2, §5).
const COMMANDS_PER_FRAME: usize = 5;
/// Keyboard events polled per frame (spec §4.6 step 3).
const KEYBOARD_EVENTS_PER_FRAME: usize = 10;
/// Depth of the compositor's command queue.
const COMMAND_QUEUE_DEPTH: usize = 32;
/// Clamp bound for window size (content area, excluding decorations).
pub const WINDOW_MAX_W: i32 = 440;
pub const WINDOW_MAX_H: i32 = 280;
/// Fn-held arrow-key window nudge, in pixels (spec §4.6 step 3c).
const FN_MOVE_STEP: i32 = 10;

enum Command {
    Create {
        window: Arc<Window>,
    },
    Destroy {
        id: u64,
    },
    Flags {
        id: u64,
        flags: WindowFlags,
    },
    FramebufferFree {
        id: u64,
        fb_num: usize,
    },
}

pub struct Compositor<M: Mmu, B: Blitter = RecordingBlitter> {
    /// Focused window at index 0 (head of stack).
    stack: Mutex<Vec<Arc<Window>>>,
    cmd_tx: Sender<Command>,
    cmd_rx: Receiver<Command>,
    psram: Arc<PageAllocator>,
    fb_vaddr: PageAllocator,
    mmu: M,
    blitter: B,
    background_damaged: Mutex<[bool; SCANOUT_COUNT]>,
    cur_scanout: AtomicUsize,
    visible_regions_valid: AtomicBool,
    rotation: RotationAngle,
    screen: Rect,
    next_window_id: AtomicU64,
    fn_held: AtomicBool,
}

impl<M: Mmu, B: Blitter> Compositor<M, B> {
    pub fn new(psram: Arc<PageAllocator>, mmu: M, blitter: B, screen: Rect, rotation: RotationAngle) -> Self {
        let fb_vaddr = PageAllocator::new();
        fb_vaddr.init_pool(0x6000_0000, 0x6000_0000 + 64 * PAGE_SIZE as u64, Default::default());
        let (cmd_tx, cmd_rx) = crossbeam_channel::bounded(COMMAND_QUEUE_DEPTH);
        Self {
            stack: Mutex::new(Vec::new()),
            cmd_tx,
            cmd_rx,
            psram,
            fb_vaddr,
            mmu,
            blitter,
            background_damaged: Mutex::new([true; SCANOUT_COUNT]),
            cur_scanout: AtomicUsize::new(0),
            visible_regions_valid: AtomicBool::new(false),
            rotation,
            screen,
            next_window_id: AtomicU64::new(1),
            fn_held: AtomicBool::new(false),
        }
    }

    fn clamp_rect(&self, rect: Rect, fullscreen: bool) -> Rect {
        if fullscreen {
            return self.screen;
        }
        let w = rect.w.clamp(0, WINDOW_MAX_W);
        let h = rect.h.clamp(0, WINDOW_MAX_H);
        let max_x = (self.screen.w - w).max(0);
        let max_y = (self.screen.h - h).max(0);
        Rect::new(rect.x.clamp(0, max_x), rect.y.clamp(0, max_y), w, h)
    }

    /// Posts a `WINDOW_CREATE` command and blocks until it is processed.
    pub fn window_create(&self, owner: Pid, title: &str, size: (i32, i32), flags: WindowFlags) -> Arc<Window> {
        let id = self.next_window_id.fetch_add(1, Ordering::SeqCst);
        let fullscreen = flags.contains(WindowFlags::FULLSCREEN);
        let rect = self.clamp_rect(Rect::new(0, 0, size.0, size.1), fullscreen);
        let window = Arc::new(Window::new(id, owner, title, rect, flags));
        self.submit(Command::Create { window: window.clone() });
        window
    }

    pub fn window_destroy(&self, id: u64) {
        self.submit(Command::Destroy { id });
    }

    pub fn window_set_flags(&self, id: u64, flags: WindowFlags) {
        self.submit(Command::Flags { id, flags });
    }

    /// `window_position_set`: moves `id` immediately, clamped to the screen.
    /// A no-op on a fullscreen window, same as the Fn-held move shortcut.
    pub fn window_set_position(&self, id: u64, x: i32, y: i32) {
        if let Some(window) = self.stack.lock().unwrap().iter().find(|w| w.id == id) {
            if window.is_fullscreen() {
                return;
            }
            let mut rect = window.rect.lock().unwrap();
            let new_rect = Rect::new(x, y, rect.w, rect.h);
            *rect = self.clamp_rect(new_rect, false);
        }
        self.mark_damaged_and_invalidate();
    }

    /// `window_size_set`: resizes `id` immediately, clamped to
    /// [`WINDOW_MAX_W`]/[`WINDOW_MAX_H`] and the screen.
    pub fn window_set_size(&self, id: u64, w: i32, h: i32) {
        if let Some(window) = self.stack.lock().unwrap().iter().find(|w| w.id == id) {
            if window.is_fullscreen() {
                return;
            }
            let mut rect = window.rect.lock().unwrap();
            let new_rect = Rect::new(rect.x, rect.y, w, h);
            *rect = self.clamp_rect(new_rect, false);
        }
        self.mark_damaged_and_invalidate();
    }

    pub fn framebuffer_allocate(&self, window: &Window, w: u32, h: u32, format: PixelFormat) -> EResult<usize> {
        let bpp = format.bytes_per_pixel();
        let size = (w * h * bpp) as usize;
        let pages = crate::memory::pages_for(size);
        let order = crate::memory::order_for_pages(pages);
        let vaddr_size = crate::memory::pages_in_order(order) * PAGE_SIZE;
        let vaddr = self.fb_vaddr.allocate(vaddr_size, AllocKind::Framebuffer, 0)?;
        let paddr = match self.psram.allocate(size, AllocKind::Framebuffer, 0) {
            Ok(p) => p,
            Err(e) => {
                let _ = self.fb_vaddr.deallocate(vaddr);
                return Err(e);
            }
        };
        self.mmu.map(vaddr, paddr, size as u64);

        let mut fbs = window.framebuffers.lock().unwrap();
        let Some(slot) = fbs.iter().position(Option::is_none) else {
            self.mmu.unmap(vaddr, size as u64);
            let _ = self.psram.deallocate(paddr);
            let _ = self.fb_vaddr.deallocate(vaddr);
            return Err(KernelError::ResourceExhaustion("window: no free framebuffer slot"));
        };
        fbs[slot] = Some(Arc::new(Framebuffer::new(w, h, format, vaddr)));
        window.cur_fb.store(slot, Ordering::SeqCst);
        Ok(slot)
    }

    /// Posts `FRAMEBUFFER_FREE` for `fb_num` of `window`.
    pub fn framebuffer_free(&self, id: u64, fb_num: usize) {
        self.submit(Command::FramebufferFree { id, fb_num });
    }

    fn submit(&self, cmd: Command) {
        // Spec §5: "Window API calls... post then wait"; this substrate's
        // single-threaded test driver processes commands via `frame_tick`,
        // so submission here only enqueues.
        let _ = self.cmd_tx.send(cmd);
        self.mark_damaged_and_invalidate();
    }

    fn mark_damaged_and_invalidate(&self) {
        let mut damaged = self.background_damaged.lock().unwrap();
        damaged.iter_mut().for_each(|d| *d = true);
        self.visible_regions_valid.store(false, Ordering::SeqCst);
    }

    fn find_window(&self, id: u64) -> Option<usize> {
        self.stack.lock().unwrap().iter().position(|w| w.id == id)
    }

    fn process_commands(&self, limit: usize) -> usize {
        let mut processed = 0;
        while processed < limit {
            let Ok(cmd) = self.cmd_rx.try_recv() else {
                break;
            };
            self.apply_command(cmd);
            processed += 1;
        }
        processed
    }

    fn apply_command(&self, cmd: Command) {
        match cmd {
            Command::Create { window } => {
                self.stack.lock().unwrap().insert(0, window);
            }
            Command::Destroy { id } => {
                let mut stack = self.stack.lock().unwrap();
                if let Some(idx) = stack.iter().position(|w| w.id == id) {
                    stack.remove(idx);
                }
            }
            Command::Flags { id, flags } => {
                if let Some(window) = self.stack.lock().unwrap().iter().find(|w| w.id == id) {
                    let screen_rect = if flags.contains(WindowFlags::FULLSCREEN) {
                        Some(self.screen)
                    } else {
                        None
                    };
                    window.set_flags(flags, screen_rect);
                }
            }
            Command::FramebufferFree { id, fb_num } => {
                if let Some(window) = self.stack.lock().unwrap().iter().find(|w| w.id == id) {
                    let mut fbs = window.framebuffers.lock().unwrap();
                    if let Some(fb) = fbs.get_mut(fb_num).and_then(Option::take) {
                        self.mmu.unmap(fb.vaddr, (fb.w * fb.h * fb.format.bytes_per_pixel()) as u64);
                        let _ = self.fb_vaddr.deallocate(fb.vaddr);
                    }
                    if window.cur_fb.load(Ordering::SeqCst) == fb_num {
                        // Demote to the highest remaining allocated slot.
                        let next = fbs.iter().rposition(Option::is_some);
                        window.cur_fb.store(next.unwrap_or(0), Ordering::SeqCst);
                    }
                }
            }
        }
    }

    /// Content-rect of `window`: the decorated rect inset by the border, or
    /// the full rect in fullscreen (spec §4.6 `window_calculate_visible_regions`).
    fn content_rect(window: &Window) -> Rect {
        let rect = *window.rect.lock().unwrap();
        if window.is_fullscreen() {
            rect
        } else {
            Rect::new(rect.x + 2, rect.y + 18, rect.w, rect.h)
        }
    }

    fn recompute_visible_regions(&self) {
        let stack = self.stack.lock().unwrap();
        for (i, window) in stack.iter().enumerate() {
            let mut visible = vec![Self::content_rect(window)];
            for occluder in stack.iter().take(i) {
                let occluder_rect = Self::content_rect(occluder);
                let mut next = Vec::new();
                for r in &visible {
                    next.extend(geometry::subtract(*r, occluder_rect));
                }
                visible = next;
                if visible.is_empty() {
                    break;
                }
            }
            geometry::merge(&mut visible);
            let scale = self.window_scale(window);
            geometry::split_problematic_heights(&mut visible, scale);
            *window.visible.lock().unwrap() = visible;
        }
        self.visible_regions_valid.store(true, Ordering::SeqCst);
    }

    fn window_scale(&self, window: &Window) -> f32 {
        let fbs = window.framebuffers.lock().unwrap();
        let cur = window.cur_fb.load(Ordering::SeqCst);
        let Some(Some(fb)) = fbs.get(cur) else {
            return 1.0;
        };
        let rect = *window.rect.lock().unwrap();
        let sx = rect.w as f32 / fb.w.max(1) as f32;
        let sy = rect.h as f32 / fb.h.max(1) as f32;
        sx.min(sy).max(0.001)
    }

    /// Assigns this frame's OS-thread priority band to every window: the
    /// focused fullscreen non-low-priority window gets `FOREGROUND`, all
    /// others get `NORMAL` (spec §4.3, §4.6 step 5).
    pub fn frame_priorities(&self) -> Vec<(Pid, Priority)> {
        let stack = self.stack.lock().unwrap();
        stack
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let fullscreen = w.is_fullscreen();
                let low_priority = w.flags.lock().unwrap().contains(WindowFlags::LOW_PRIORITY);
                let priority = if i == 0 && fullscreen && !low_priority {
                    Priority::Foreground
                } else {
                    Priority::Normal
                };
                (w.owner, priority)
            })
            .collect()
    }

    /// Alt-Tab: cycles focus from the head to the next window in the stack.
    fn cycle_focus(&self) {
        let mut stack = self.stack.lock().unwrap();
        if stack.len() > 1 {
            let head = stack.remove(0);
            stack.push(head);
        }
    }

    /// Moves the focused window by `(dx, dy)`, clamped to the screen.
    fn move_focused(&self, dx: i32, dy: i32) {
        let stack = self.stack.lock().unwrap();
        if let Some(window) = stack.first() {
            if window.is_fullscreen() {
                return;
            }
            let mut rect = window.rect.lock().unwrap();
            let new_rect = Rect::new(rect.x + dx, rect.y + dy, rect.w, rect.h);
            *rect = self.clamp_rect(new_rect, false);
        }
    }

    fn kill_focused(&self) -> Option<Pid> {
        self.stack.lock().unwrap().first().map(|w| w.owner)
    }

    /// Handles Fn-modifier tracking and the Fn-held interception rules (spec
    /// §4.6 step 3), routing the rest to the focused window's event queue.
    /// Returns the pid of a task Cross-killed this call, if any.
    fn dispatch_keyboard_event(&self, ev: KeyEvent) -> Option<Pid> {
        if ev.keycode == keycode::FN {
            self.fn_held.store(ev.down, Ordering::SeqCst);
            return None;
        }

        if ev.down && ev.modifiers.contains(KeyMod::ALT) && ev.keycode == keycode::TAB {
            self.cycle_focus();
            return None;
        }

        if self.fn_held.load(Ordering::SeqCst) && ev.down {
            match ev.keycode {
                keycode::UP => {
                    self.move_focused(0, -FN_MOVE_STEP);
                    return None;
                }
                keycode::DOWN => {
                    self.move_focused(0, FN_MOVE_STEP);
                    return None;
                }
                keycode::LEFT => {
                    self.move_focused(-FN_MOVE_STEP, 0);
                    return None;
                }
                keycode::RIGHT => {
                    self.move_focused(FN_MOVE_STEP, 0);
                    return None;
                }
                keycode::CROSS => {
                    return self.kill_focused();
                }
                _ => {}
            }
        }

        let event = if ev.down {
            Event::KeyDown(ev)
        } else {
            Event::KeyUp(ev)
        };
        if let Some(window) = self.stack.lock().unwrap().first() {
            window.push_event(event);
        }
        None
    }

    /// One vsync-triggered frame iteration (spec §4.6). `keyboard_events` is
    /// what the keyboard device collaborator polled this tick (capped to
    /// [`KEYBOARD_EVENTS_PER_FRAME`] by the caller or here). Returns pids
    /// Cross-killed this frame (to be posted to the scheduler by the caller,
    /// since the compositor does not itself own process lifecycle).
    pub fn frame_tick(&self, keyboard_events: Vec<KeyEvent>) -> Vec<Pid> {
        self.process_commands(COMMANDS_PER_FRAME);

        let mut killed = Vec::new();
        for ev in keyboard_events.into_iter().take(KEYBOARD_EVENTS_PER_FRAME) {
            if let Some(pid) = self.dispatch_keyboard_event(ev) {
                killed.push(pid);
            }
        }

        let scanout = self.cur_scanout.load(Ordering::SeqCst);
        {
            let mut damaged = self.background_damaged.lock().unwrap();
            if damaged[scanout] {
                damaged[scanout] = false;
            }
        }

        if !self.visible_regions_valid.load(Ordering::SeqCst) {
            self.recompute_visible_regions();
        }

        let stack = self.stack.lock().unwrap();
        for window in stack.iter().rev() {
            let cur = window.cur_fb.load(Ordering::SeqCst);
            let fbs = window.framebuffers.lock().unwrap();
            let Some(Some(fb)) = fbs.get(cur) else {
                continue;
            };
            if !fb.active.load(Ordering::SeqCst) {
                continue;
            }
            let scale = self.window_scale(window);
            let visible = window.visible.lock().unwrap().clone();
            for rect in &visible {
                let src = self.content_rect_to_framebuffer_rect(*rect, window, fb, scale);
                if let Err(e) = self.blitter.blit(src, *rect, fb.format, self.rotation, scanout) {
                    log::warn!("blit failed for window {}: {e}", window.id);
                }
            }
            if !visible.is_empty() {
                fb.mark_drawn();
            }
        }
        drop(stack);

        self.cur_scanout.store((scanout + 1) % SCANOUT_COUNT, Ordering::SeqCst);
        killed
    }

    fn content_rect_to_framebuffer_rect(&self, content_rect: Rect, window: &Window, fb: &Framebuffer, scale: f32) -> Rect {
        let rect = *window.rect.lock().unwrap();
        let mut cr = content_rect;
        if !window.is_fullscreen() {
            cr.x -= rect.x + 2;
            cr.y -= rect.y + 18;
        }
        let start_x = ((cr.x as f32 / scale) as i32).clamp(0, fb.w as i32 - 1).max(0);
        let start_y = ((cr.y as f32 / scale) as i32).clamp(0, fb.h as i32 - 1).max(0);
        let end_x = (((cr.x + cr.w) as f32 / scale) as i32).clamp(start_x, fb.w as i32);
        let end_y = (((cr.y + cr.h) as f32 / scale) as i32).clamp(start_y, fb.h as i32);
        Rect::new(start_x, start_y, end_x - start_x, end_y - start_y)
    }

    pub fn window_count(&self) -> usize {
        self.stack.lock().unwrap().len()
    }

    pub fn focused(&self) -> Option<Arc<Window>> {
        self.stack.lock().unwrap().first().cloned()
    }

    pub fn screen_rect(&self) -> Rect {
        self.screen
    }
}
