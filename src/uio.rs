// SEC PDCP Job Ring Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Job ring access through Linux UIO.
//!
//! The kernel exposes every job ring as a UIO device: `/sys/class/uio/uioN/name`
//! identifies the ring, and `/dev/uioN` maps its register page and delivers
//! its interrupts. Writing a 32-bit 1 or 0 to the device node enables or
//! masks the interrupt; a blocking read returns the interrupt count.
//!
//! # Platform Support
//!
//! Linux only. Elsewhere [`UioRing::open`] returns
//! [`SecError::PlatformNotSupported`].

use crate::error::{SecError, SecResult};
use std::fs;
use std::path::{Path, PathBuf};

/// Sysfs directory listing UIO devices.
pub const SYSFS_UIO_PATH: &str = "/sys/class/uio";

/// Substring of the UIO name of job ring devices.
const JOB_RING_NAME: &str = "jr";

/// A job ring UIO device found in sysfs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UioDevice {
    /// UIO index, `N` in `uioN`.
    pub index: u32,
    /// Name reported by the kernel driver.
    pub name: String,
    /// Device node to open.
    pub dev_path: PathBuf,
}

/// Lists job ring devices under `sysfs_root`, ordered by UIO index.
pub fn discover_job_rings_in(sysfs_root: &Path) -> SecResult<Vec<UioDevice>> {
    let mut devices = Vec::new();
    for entry in fs::read_dir(sysfs_root)? {
        let entry = entry?;
        let dir_name = entry.file_name().to_string_lossy().to_string();
        let Some(index) = dir_name
            .strip_prefix("uio")
            .and_then(|s| s.parse::<u32>().ok())
        else {
            continue;
        };
        let Ok(name) = fs::read_to_string(entry.path().join("name")) else {
            continue;
        };
        let name = name.trim().to_string();
        if name.contains(JOB_RING_NAME) {
            devices.push(UioDevice {
                index,
                name,
                dev_path: PathBuf::from(format!("/dev/uio{index}")),
            });
        }
    }
    devices.sort_by_key(|d| d.index);
    Ok(devices)
}

/// Lists the job ring devices of this machine.
pub fn discover_job_rings() -> SecResult<Vec<UioDevice>> {
    let root = Path::new(SYSFS_UIO_PATH);
    if !root.exists() {
        return Err(SecError::PlatformNotSupported);
    }
    discover_job_rings_in(root)
}

// ============================================================================
// Linux Implementation
// ============================================================================

#[cfg(target_os = "linux")]
mod linux_impl {
    use super::*;
    use crate::hw::{InterruptControl, JobRingRegisters, Register, REGISTER_PAGE_SIZE};
    use log::debug;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;

    fn open_device(path: &Path) -> SecResult<File> {
        File::options()
            .read(true)
            .write(true)
            .open(path)
            .map_err(SecError::Io)
    }

    /// Register page of one job ring, mapped from its UIO device.
    pub struct UioRing {
        file: File,
        regs: *mut u8,
        map_size: usize,
    }

    // SAFETY: the mapping is owned by this value and unmapped only on drop;
    // register accesses are volatile and need no further synchronization
    // beyond the ring's single producer/consumer discipline.
    unsafe impl Send for UioRing {}

    impl UioRing {
        /// Open `/dev/uioN` and map its register page.
        pub fn open(path: &Path) -> SecResult<Self> {
            let file = open_device(path)?;
            // SAFETY: fresh shared mapping of the device's first map region.
            let regs = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    REGISTER_PAGE_SIZE,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    file.as_raw_fd(),
                    0,
                )
            };
            if regs == libc::MAP_FAILED {
                return Err(SecError::MmapFailed(format!(
                    "{}: {}",
                    path.display(),
                    std::io::Error::last_os_error()
                )));
            }
            debug!("uio: mapped {} at {:p}", path.display(), regs);
            Ok(Self {
                file,
                regs: regs as *mut u8,
                map_size: REGISTER_PAGE_SIZE,
            })
        }

        /// Open a discovered device.
        pub fn open_device(device: &UioDevice) -> SecResult<Self> {
            Self::open(&device.dev_path)
        }

        /// Interrupt control sharing this device.
        pub fn interrupts(&self) -> SecResult<UioInterrupts> {
            Ok(UioInterrupts {
                file: self.file.try_clone()?,
            })
        }

        fn reg_ptr(&self, reg: Register) -> *mut u32 {
            self.regs.wrapping_add(reg.offset()) as *mut u32
        }
    }

    impl JobRingRegisters for UioRing {
        fn read(&self, reg: Register) -> u32 {
            // SAFETY: every register offset lies within the mapped page.
            unsafe { std::ptr::read_volatile(self.reg_ptr(reg)) }
        }

        fn write(&self, reg: Register, value: u32) {
            // SAFETY: as in `read`.
            unsafe { std::ptr::write_volatile(self.reg_ptr(reg), value) }
        }
    }

    impl Drop for UioRing {
        fn drop(&mut self) {
            // SAFETY: `regs` was returned by mmap with `map_size`.
            unsafe {
                libc::munmap(self.regs as *mut libc::c_void, self.map_size);
            }
        }
    }

    impl std::fmt::Debug for UioRing {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("UioRing")
                .field("fd", &self.file.as_raw_fd())
                .field("regs", &self.regs)
                .finish()
        }
    }

    /// Interrupt control through a UIO device node.
    #[derive(Debug)]
    pub struct UioInterrupts {
        file: File,
    }

    impl UioInterrupts {
        fn request(&self, enable: bool) -> SecResult<()> {
            (&self.file).write_all(&u32::from(enable).to_ne_bytes())?;
            Ok(())
        }

        /// Block until the next interrupt; returns the total interrupt count.
        pub fn wait(&self) -> SecResult<u32> {
            let mut buf = [0u8; 4];
            (&self.file).read_exact(&mut buf)?;
            Ok(u32::from_ne_bytes(buf))
        }
    }

    impl InterruptControl for UioInterrupts {
        fn enable(&self) -> SecResult<()> {
            self.request(true)
        }

        fn disable(&self) -> SecResult<()> {
            self.request(false)
        }

        fn event_fd(&self) -> Option<i32> {
            Some(self.file.as_raw_fd())
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod stub_impl {
    use super::*;
    use crate::hw::{InterruptControl, JobRingRegisters, Register};

    /// Stub job ring for non-Linux platforms.
    #[derive(Debug)]
    pub struct UioRing {
        _private: (),
    }

    impl UioRing {
        /// Always fails with [`SecError::PlatformNotSupported`].
        pub fn open(_path: &Path) -> SecResult<Self> {
            Err(SecError::PlatformNotSupported)
        }

        /// Always fails with [`SecError::PlatformNotSupported`].
        pub fn open_device(_device: &UioDevice) -> SecResult<Self> {
            Err(SecError::PlatformNotSupported)
        }

        pub fn interrupts(&self) -> SecResult<UioInterrupts> {
            Err(SecError::PlatformNotSupported)
        }
    }

    impl JobRingRegisters for UioRing {
        fn read(&self, _reg: Register) -> u32 {
            0
        }

        fn write(&self, _reg: Register, _value: u32) {}
    }

    /// Stub interrupt control for non-Linux platforms.
    #[derive(Debug)]
    pub struct UioInterrupts {
        _private: (),
    }

    impl InterruptControl for UioInterrupts {
        fn enable(&self) -> SecResult<()> {
            Err(SecError::PlatformNotSupported)
        }

        fn disable(&self) -> SecResult<()> {
            Err(SecError::PlatformNotSupported)
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux_impl::{UioInterrupts, UioRing};

#[cfg(not(target_os = "linux"))]
pub use stub_impl::{UioInterrupts, UioRing};
