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

//! Task lifecycle: pid allocation ([`pid`]), the process table, per-task
//! resource tracking ([`resource`]), and the Zeus/Hades spawn-and-reap
//! services ([`scheduler`]).

pub mod pid;
pub mod resource;
pub mod scheduler;

use crate::task::pid::Pid;
use crate::task::resource::ResourceTracker;
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Capacity of a task's reaped-children queue. Posting is non-blocking
/// (`try_send`), dropping the notification on overflow (spec §4.3 step 3).
pub const CHILDREN_QUEUE_DEPTH: usize = 16;

/// Priority bands a task's OS thread can run at (spec §4.3).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Priority {
    Low = 4,
    Normal = 5,
    Foreground = 6,
}

/// Why a task was created: an independent process from an ELF path, a
/// process whose ELF image was already resident (`Elf`), or a thread sharing
/// its parent's `TaskThread`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TaskKind {
    Elf,
    ElfPath,
    Thread,
}

/// The size of a task's open-file table (spec §6: "Per-task FD table of size 128").
pub const FD_TABLE_SIZE: usize = 128;

/// The mutable state shared between a process and every thread spawned
/// within it: the virtual arena, the open-file table, and per-resource-kind
/// ownership sets. Refcounted — destroyed only once every sharer has exited
/// (spec §3 `TaskThread`).
pub struct TaskThread {
    pub refcount: AtomicU32,
    pub fd_table: Mutex<[Option<u32>; FD_TABLE_SIZE]>,
    pub resources: ResourceTracker,
}

impl TaskThread {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            refcount: AtomicU32::new(1),
            fd_table: Mutex::new([None; FD_TABLE_SIZE]),
            resources: ResourceTracker::new(),
        })
    }

    pub fn retain(self: &Arc<Self>) -> Arc<Self> {
        self.refcount.fetch_add(1, Ordering::SeqCst);
        self.clone()
    }

    /// Releases one sharer's reference. Returns `true` if this was the last
    /// one, meaning the caller must now tear down the arena/fds/resources.
    pub fn release(&self) -> bool {
        self.refcount.fetch_sub(1, Ordering::SeqCst) == 1
    }

    /// Installs `fd` into the first free FD table slot, or `None` if the
    /// table is full.
    pub fn install_fd(&self, fd: u32) -> Option<usize> {
        let mut table = self.fd_table.lock().unwrap();
        let slot = table.iter().position(Option::is_none)?;
        table[slot] = Some(fd);
        Some(slot)
    }

    pub fn close_fd(&self, slot: usize) -> Option<u32> {
        self.fd_table.lock().unwrap().get_mut(slot).and_then(Option::take)
    }
}

/// One entry of the process table (spec §3 `TaskInfo`).
pub struct TaskInfo {
    pub pid: Pid,
    pub parent: Pid,
    pub kind: TaskKind,
    pub thread: Arc<TaskThread>,
    pub argv: Vec<String>,
    /// Bounded FIFO of this task's reaped children, drained by `wait`.
    children_tx: Sender<Pid>,
    children_rx: Receiver<Pid>,
    pub errno: AtomicU32,
}

impl TaskInfo {
    pub fn new(pid: Pid, parent: Pid, kind: TaskKind, thread: Arc<TaskThread>, argv: Vec<String>) -> Self {
        let (children_tx, children_rx) = crossbeam_channel::bounded(CHILDREN_QUEUE_DEPTH);
        Self {
            pid,
            parent,
            kind,
            thread,
            argv,
            children_tx,
            children_rx,
            errno: AtomicU32::new(0),
        }
    }

    /// Posts `child` as reaped. Non-blocking; dropped silently on overflow,
    /// since this may be invoked from the reaper while holding no caller
    /// context to block on (spec §4.3: "posted from the thread-delete hook,
    /// which may run in ISR context → non-blocking enqueue required").
    pub fn notify_child_reaped(&self, child: Pid) {
        let _ = self.children_tx.try_send(child);
    }

    /// Pops one reaped child pid, optionally blocking up to `timeout`.
    pub fn wait_child(&self, block: bool, timeout: Option<std::time::Duration>) -> Option<Pid> {
        if !block {
            return self.children_rx.try_recv().ok();
        }
        match timeout {
            Some(t) => self.children_rx.recv_timeout(t).ok(),
            None => self.children_rx.recv().ok(),
        }
    }
}

/// Fixed-size table indexed by pid; entry 0 is the kernel pseudo-task and is
/// never populated with a real `TaskInfo` (spec §3).
pub struct ProcessTable {
    slots: Mutex<std::collections::HashMap<Pid, Arc<TaskInfo>>>,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn insert(&self, task: Arc<TaskInfo>) {
        self.slots.lock().unwrap().insert(task.pid, task);
    }

    pub fn get(&self, pid: Pid) -> Option<Arc<TaskInfo>> {
        self.slots.lock().unwrap().get(&pid).cloned()
    }

    pub fn remove(&self, pid: Pid) -> Option<Arc<TaskInfo>> {
        self.slots.lock().unwrap().remove(&pid)
    }

    /// All pids currently parented by `parent` (used for cascade deletion).
    pub fn children_of(&self, parent: Pid) -> Vec<Pid> {
        self.slots
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.parent == parent)
            .map(|t| t.pid)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
