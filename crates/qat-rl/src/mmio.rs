//! Memory-mapped PMISC BAR access
//!
//! The RL link tables, bucket granularity registers and admin mailbox all
//! live in the PMISC BAR. It can be mapped either through the sysfs
//! `resourceN` file of the PF or through a VFIO device region.
//!
//! rustix covers mmap/munmap; the VFIO region-info ioctl goes through libc
//! with the numbers kept in [`crate::vfio`].

// MMIO needs exact casts between kernel structs, pointers and offsets
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_ptr_alignment)]

use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsFd, AsRawFd};
use std::ptr::NonNull;

use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use tracing::{debug, info};

use crate::csr::CsrAccess;
use crate::error::{Result, RlError};
use crate::vfio::ioctls::VFIO_DEVICE_GET_REGION_INFO;

/// VFIO region info, as filled in by `VFIO_DEVICE_GET_REGION_INFO`
#[repr(C)]
#[derive(Debug, Default)]
struct VfioRegionInfo {
    argsz: u32,
    flags: u32,
    index: u32,
    cap_offset: u32,
    size: u64,
    offset: u64,
}

/// Mapped PMISC BAR
pub struct MappedBar {
    ptr: NonNull<u8>,
    size: usize,
    bar: u32,
    // keeps the fd backing the mapping open
    _file: Option<File>,
}

impl std::fmt::Debug for MappedBar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedBar")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("size", &self.size)
            .field("bar", &self.bar)
            .finish_non_exhaustive()
    }
}

// SAFETY: Send - the mapping is process-wide and owned exclusively by this value.
unsafe impl Send for MappedBar {}

// SAFETY: Sync - every access is a bounds-checked volatile 32-bit load or store;
// the device serialises register accesses itself.
unsafe impl Sync for MappedBar {}

impl MappedBar {
    /// Map BAR `bar` of the PCI function at `pci_address` through sysfs
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the resource file cannot be opened and
    /// `Internal` if it is empty or cannot be mapped.
    pub fn from_sysfs(pci_address: &str, bar: u32) -> Result<Self> {
        let path = format!("/sys/bus/pci/devices/{pci_address}/resource{bar}");
        debug!("Mapping PMISC BAR: {path}");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| RlError::not_found(format!("{path}: {e}")))?;

        let size = file
            .metadata()
            .map_err(|e| RlError::internal(format!("cannot stat {path}: {e}")))?
            .len() as usize;
        if size == 0 {
            return Err(RlError::internal(format!("{path} is empty")));
        }

        let ptr = Self::map_fd(&file, size, 0, bar)?;
        info!("Mapped BAR{bar} of {pci_address}, size={size:#x}");

        Ok(Self {
            ptr,
            size,
            bar,
            _file: Some(file),
        })
    }

    /// Map region `bar` of an open VFIO device
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the region cannot be queried or mapped.
    pub fn from_vfio(device_fd: &File, bar: u32) -> Result<Self> {
        let mut region_info = VfioRegionInfo {
            argsz: std::mem::size_of::<VfioRegionInfo>() as u32,
            index: bar,
            ..Default::default()
        };

        // SAFETY: VFIO_DEVICE_GET_REGION_INFO reads and writes a vfio_region_info;
        // argsz and index are initialised and the layout matches the kernel's.
        let ret = unsafe {
            libc::ioctl(
                device_fd.as_raw_fd(),
                VFIO_DEVICE_GET_REGION_INFO as _,
                std::ptr::addr_of_mut!(region_info),
            )
        };
        if ret < 0 {
            return Err(RlError::internal(format!(
                "BAR{bar} region info: {}",
                std::io::Error::last_os_error()
            )));
        }

        debug!(
            "BAR{bar}: size={:#x}, offset={:#x}, flags={:#x}",
            region_info.size, region_info.offset, region_info.flags
        );

        let size = region_info.size as usize;
        let ptr = Self::map_fd(device_fd, size, region_info.offset, bar)?;
        info!("Mapped VFIO BAR{bar} at {ptr:p}, size={size:#x}");

        Ok(Self {
            ptr,
            size,
            bar,
            _file: None,
        })
    }

    fn map_fd(file: &File, size: usize, offset: u64, bar: u32) -> Result<NonNull<u8>> {
        // SAFETY: the fd is open, size is the region size reported by the kernel
        // and the mapping is released exactly once in Drop.
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                offset,
            )
        }
        .map_err(|e| RlError::internal(format!("mmap BAR{bar}: {e}")))?;

        NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| RlError::internal(format!("mmap BAR{bar} returned null")))
    }

    /// Size of the mapping in bytes
    pub const fn size(&self) -> usize {
        self.size
    }

    /// BAR index
    pub const fn bar(&self) -> u32 {
        self.bar
    }

    /// Whether a 32-bit register at `offset` lies inside the mapping
    pub fn in_bounds(&self, offset: usize) -> bool {
        register_fits(self.size, offset)
    }
}

fn register_fits(size: usize, offset: usize) -> bool {
    offset.checked_add(4).is_some_and(|end| end <= size)
}

impl CsrAccess for MappedBar {
    /// # Panics
    ///
    /// Panics if `offset + 4` exceeds the mapping.
    fn read32(&self, offset: usize) -> u32 {
        assert!(self.in_bounds(offset), "CSR offset {offset:#x} out of bounds");
        // SAFETY: ptr is valid for size bytes, in_bounds(offset) holds and CSRs are
        // naturally aligned.
        unsafe { std::ptr::read_volatile(self.ptr.as_ptr().add(offset).cast::<u32>()) }
    }

    /// # Panics
    ///
    /// Panics if `offset + 4` exceeds the mapping.
    fn write32(&self, offset: usize, value: u32) {
        assert!(self.in_bounds(offset), "CSR offset {offset:#x} out of bounds");
        // SAFETY: as in read32; the store has device side effects, hence volatile.
        unsafe {
            std::ptr::write_volatile(self.ptr.as_ptr().add(offset).cast::<u32>(), value);
        }
    }
}

impl Drop for MappedBar {
    fn drop(&mut self) {
        // SAFETY: ptr/size come from the successful mmap in map_fd and Drop runs once.
        if let Err(e) = unsafe { munmap(self.ptr.as_ptr().cast(), self.size) } {
            tracing::warn!("munmap BAR{}: {e}", self.bar);
        }
        debug!("Unmapped BAR{}", self.bar);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_info_matches_kernel_layout() {
        assert_eq!(std::mem::size_of::<VfioRegionInfo>(), 32);
    }

    #[test]
    fn register_bounds_do_not_wrap() {
        assert!(register_fits(0x1000, 0xffc));
        assert!(!register_fits(0x1000, 0xffd));
        assert!(!register_fits(0x1000, usize::MAX - 1));
        assert!(!register_fits(usize::MAX, usize::MAX - 2));
    }

    #[test]
    fn missing_device_is_not_found() {
        let err = MappedBar::from_sysfs("ffff:ff:1f.7", 4).unwrap_err();
        assert!(matches!(err, RlError::NotFound { .. }));
    }

    #[test]
    #[ignore = "requires a QAT gen4 PF bound to a userspace-accessible driver"]
    fn read_pmisc_bar() {
        let addr = std::env::var("QAT_PF").unwrap_or_else(|_| "0000:6b:00.0".into());
        let bar = MappedBar::from_sysfs(&addr, 4).unwrap();
        assert!(bar.size() > qat_rl_hw::regs::RL_LEAF2CLUSTER);
        let _ = bar.read32(qat_rl_hw::regs::RL_TOKEN_PCIEIN_BUCKET);
    }
}
