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

//! Error handling for the kernel substrate.
//!
//! Two layers exist, matching the propagation policy of the specification:
//! - [`Errno`]: the POSIX-style numeric error a syscall surfaces to a user task.
//! - [`KernelError`]: the richer, internal error kind a subsystem actually produces.
//!   [`KernelError::errno`] collapses it down to the number a syscall returns.

use std::fmt;

/// Type representing a Unix-style errno.
pub type Errno = i32;

/// Invalid argument.
pub const EINVAL: Errno = 22;
/// Not enough space.
pub const ENOMEM: Errno = 12;
/// No such file or directory.
pub const ENOENT: Errno = 2;
/// Bad file descriptor.
pub const EBADF: Errno = 9;
/// No such device.
pub const ENODEV: Errno = 19;
/// Device or resource busy.
pub const EBUSY: Errno = 16;
/// Resource temporarily unavailable.
pub const EAGAIN: Errno = 11;
/// No child processes.
pub const ECHILD: Errno = 10;
/// Too many open files.
pub const EMFILE: Errno = 24;
/// Function not implemented / not supported.
pub const ENOSYS: Errno = 38;

/// The kernel-internal error kinds of spec §7.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// Out of physical pages, out of vaddr, out of pids, or a fixed-size table is full.
    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(&'static str),
    /// Non-page-aligned pointer, unknown device name, malformed path, out-of-range fd, ...
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Logical name resolves but the device is absent, or the file isn't found.
    #[error("not found: {0}")]
    NotFound(&'static str),
    /// Double-free of a tracked resource, double record, double MMU map. A kernel bug.
    #[error("contract violation: {0}")]
    ContractViolation(&'static str),
    /// An unhandled machine exception inside a user task, caught by Cerberos.
    #[error("user task {0} crashed and was terminated")]
    UserCrash(u16),
    /// A hardware-blit (or other transient hardware op) failed; the frame continues.
    #[error("hardware transient failure: {0}")]
    HardwareTransient(&'static str),
}

impl KernelError {
    /// Collapses this error to the errno a syscall should return.
    ///
    /// `UserCrash` and `ContractViolation` have no valid errno: the former kills the task
    /// instead of returning to it, the latter is logged and treated as best-effort recovery by
    /// the caller (see spec §7).
    pub fn errno(&self) -> Errno {
        match self {
            KernelError::ResourceExhaustion(_) => ENOMEM,
            KernelError::InvalidArgument(_) => EINVAL,
            KernelError::NotFound(_) => ENOENT,
            KernelError::ContractViolation(_) => EINVAL,
            KernelError::UserCrash(_) => EINVAL,
            KernelError::HardwareTransient(_) => EAGAIN,
        }
    }
}

/// Crate-wide result alias.
pub type EResult<T> = Result<T, KernelError>;

impl fmt::Display for ErrnoDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "errno {}", self.0)
    }
}

/// Wrapper letting an `Errno` be displayed without clashing with the `i32` impl.
pub struct ErrnoDisplay(pub Errno);
