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

//! The uniform device interface (spec §6) and a name → device-object
//! registry. Concrete drivers (LCD panel init, I²C, keyboard matrix scan,
//! fatfs) are collaborators behind this trait — spec §1 scopes them out of
//! this crate entirely. Grounded on `maestro`'s `device::DeviceType`/`DeviceIO`
//! split (`src/device/mod.rs`) for the type-tag-plus-uniform-IO shape.

use crate::error::{EResult, KernelError};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// The device type tags of spec §6.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum DeviceType {
    Block,
    Bus,
    Lcd,
    Keyboard,
    Filesystem,
    Socket,
    Orientation,
}

/// A directory entry as returned by `readdir`, for `Filesystem`-tagged devices.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// The uniform operations every registered device exposes.
pub trait Device: Send + Sync {
    fn device_type(&self) -> DeviceType;
    fn open(&self, path: &str, flags: i32, mode: u32) -> EResult<u32>;
    fn close(&self, dev_fd: u32) -> EResult<()>;
    fn read(&self, dev_fd: u32, buf: &mut [u8]) -> EResult<usize>;
    fn write(&self, dev_fd: u32, buf: &[u8]) -> EResult<usize>;
    fn lseek(&self, dev_fd: u32, offset: i64, whence: i32) -> EResult<i64>;

    /// LCD-specific: blit raw pixels at `(x, y)`. Non-LCD devices return
    /// `ENOSYS` via `InvalidArgument`.
    fn draw(&self, _x: i32, _y: i32, _w: u32, _h: u32, _pixels: &[u8]) -> EResult<()> {
        Err(KernelError::InvalidArgument("draw: not an LCD device"))
    }

    /// LCD-specific: hands back the scan-out buffer at `index`.
    fn getfb(&self, _index: u32) -> EResult<Vec<u8>> {
        Err(KernelError::InvalidArgument("getfb: not an LCD device"))
    }

    /// Filesystem-specific operations; default to `NotFound` so block/bus/
    /// lcd/keyboard devices need not implement them.
    fn stat(&self, _path: &str) -> EResult<u64> {
        Err(KernelError::NotFound("stat: not a filesystem device"))
    }
    fn unlink(&self, _path: &str) -> EResult<()> {
        Err(KernelError::NotFound("unlink: not a filesystem device"))
    }
    fn mkdir(&self, _path: &str) -> EResult<()> {
        Err(KernelError::NotFound("mkdir: not a filesystem device"))
    }
    fn rmdir(&self, _path: &str) -> EResult<()> {
        Err(KernelError::NotFound("rmdir: not a filesystem device"))
    }
    fn rename(&self, _from: &str, _to: &str) -> EResult<()> {
        Err(KernelError::NotFound("rename: not a filesystem device"))
    }
    fn readdir(&self, _path: &str) -> EResult<Vec<DirEntry>> {
        Err(KernelError::NotFound("readdir: not a filesystem device"))
    }
}

/// Name → device-object table (spec §2 "Device registry").
#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Arc<dyn Device>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, name: &str, device: Arc<dyn Device>) {
        self.devices.write().unwrap().insert(name.to_string(), device);
    }

    pub fn unregister(&self, name: &str) {
        self.devices.write().unwrap().remove(name);
    }

    pub fn get(&self, name: &str) -> EResult<Arc<dyn Device>> {
        self.devices
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or(KernelError::NotFound("unknown device name"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct MemFs {
        next_fd: AtomicU32,
    }

    impl Device for MemFs {
        fn device_type(&self) -> DeviceType {
            DeviceType::Filesystem
        }
        fn open(&self, _path: &str, _flags: i32, _mode: u32) -> EResult<u32> {
            Ok(self.next_fd.fetch_add(1, Ordering::SeqCst))
        }
        fn close(&self, _dev_fd: u32) -> EResult<()> {
            Ok(())
        }
        fn read(&self, _dev_fd: u32, _buf: &mut [u8]) -> EResult<usize> {
            Ok(0)
        }
        fn write(&self, _dev_fd: u32, buf: &[u8]) -> EResult<usize> {
            Ok(buf.len())
        }
        fn lseek(&self, _dev_fd: u32, offset: i64, _whence: i32) -> EResult<i64> {
            Ok(offset)
        }
        fn readdir(&self, _path: &str) -> EResult<Vec<DirEntry>> {
            Ok(vec![DirEntry {
                name: "hello.elf".into(),
                is_dir: false,
            }])
        }
    }

    #[test]
    fn unknown_device_is_not_found() {
        let reg = DeviceRegistry::new();
        assert!(matches!(reg.get("FLASH0"), Err(KernelError::NotFound(_))));
    }

    #[test]
    fn registered_device_round_trips() {
        let reg = DeviceRegistry::new();
        reg.register(
            "FLASH0",
            Arc::new(MemFs {
                next_fd: AtomicU32::new(0),
            }),
        );
        let dev = reg.get("FLASH0").unwrap();
        assert_eq!(dev.device_type(), DeviceType::Filesystem);
        let fd = dev.open("hello.elf", 0, 0).unwrap();
        assert_eq!(dev.write(fd, b"hi").unwrap(), 2);
        let entries = dev.readdir("/").unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn non_lcd_device_rejects_lcd_ops() {
        let reg = DeviceRegistry::new();
        reg.register(
            "FLASH0",
            Arc::new(MemFs {
                next_fd: AtomicU32::new(0),
            }),
        );
        let dev = reg.get("FLASH0").unwrap();
        assert!(dev.draw(0, 0, 1, 1, &[]).is_err());
    }
}
