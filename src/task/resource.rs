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

//! Per-task resource tracking (spec §4.5). Every OS-level handle a task
//! acquires (an open file, an iconv conversion, a compiled regex, an OTA
//! session, a window, a device handle, a TLS connection) is recorded here so
//! Hades can sweep and release everything a task still owns when it dies,
//! even if the task itself never closed it cleanly.

use crate::error::{EResult, KernelError};
use std::collections::HashSet;
use std::sync::Mutex;

/// The resource kinds `spec.md` §4.5 enumerates.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum ResourceKind {
    OpenFile,
    Iconv,
    Regex,
    OtaSession,
    Window,
    DeviceHandle,
    TlsConnection,
}

const ALL_KINDS: [ResourceKind; 7] = [
    ResourceKind::OpenFile,
    ResourceKind::Iconv,
    ResourceKind::Regex,
    ResourceKind::OtaSession,
    ResourceKind::Window,
    ResourceKind::DeviceHandle,
    ResourceKind::TlsConnection,
];

/// A task's per-kind sets of owned handles, identified by an opaque `u64`
/// (in real firmware, a pointer; here, any stable handle id).
#[derive(Default)]
pub struct ResourceTracker {
    sets: Mutex<std::collections::HashMap<ResourceKind, HashSet<u64>>>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self {
            sets: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Records that this task now owns `handle` of `kind`. A double-record of
    /// an already-tracked handle is a contract violation (spec §4.5).
    pub fn record_alloc(&self, kind: ResourceKind, handle: u64) -> EResult<()> {
        let mut sets = self.sets.lock().unwrap();
        let set = sets.entry(kind).or_default();
        if !set.insert(handle) {
            return Err(KernelError::ContractViolation("double-record of a tracked resource"));
        }
        Ok(())
    }

    /// Records that `handle` of `kind` has been released. A double-free (or a
    /// free of something never recorded) is a contract violation.
    pub fn record_free(&self, kind: ResourceKind, handle: u64) -> EResult<()> {
        let mut sets = self.sets.lock().unwrap();
        let removed = sets.get_mut(&kind).map(|s| s.remove(&handle)).unwrap_or(false);
        if !removed {
            return Err(KernelError::ContractViolation("double-free of a tracked resource"));
        }
        Ok(())
    }

    /// True if `handle` of `kind` is currently tracked as owned.
    pub fn is_owned(&self, kind: ResourceKind, handle: u64) -> bool {
        self.sets
            .lock()
            .unwrap()
            .get(&kind)
            .map(|s| s.contains(&handle))
            .unwrap_or(false)
    }

    /// Walks every kind's set and invokes `destroy(kind, handle)` for every
    /// surviving handle, then clears the tracker. Called by Hades on task
    /// death for resources the task never released itself.
    pub fn sweep(&self, mut destroy: impl FnMut(ResourceKind, u64)) {
        let mut sets = self.sets.lock().unwrap();
        for kind in ALL_KINDS {
            if let Some(set) = sets.remove(&kind) {
                for handle in set {
                    destroy(kind, handle);
                }
            }
        }
    }
}
