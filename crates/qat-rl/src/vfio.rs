//! VFIO device access: IOMMU-mapped DMA and the PMISC BAR
//!
//! The admin parameter blocks and mailbox message areas must be reachable
//! by the device. [`VfioDevice`] attaches the PF's IOMMU group to a Type1v2
//! container and hands out page-aligned, mlock'd host buffers mapped at
//! IOVAs it assigns.
//!
//! # Requirements
//!
//! 1. IOMMU enabled (`intel_iommu=on`)
//! 2. PF bound to `vfio-pci`
//! 3. Access to `/dev/vfio/$IOMMU_GROUP`
//!
//! ```no_run
//! use std::sync::Arc;
//! use qat_rl::prelude::*;
//! use qat_rl::{AdminChannel, MailboxTransport, VfioDevice};
//!
//! # fn main() -> Result<()> {
//! let device = Arc::new(VfioDevice::open("0000:6b:00.0")?);
//! let csr = Arc::new(device.map_bar(4)?);
//! let mailbox = MailboxTransport::new(csr.clone(), device.clone());
//! let admin = AdminChannel::new(Box::new(mailbox), device);
//! let rl = RateLimiter::init(RlHwData::gen4(), DeviceConfig::gen4(), csr, admin)?;
//! # rl.exit();
//! # Ok(())
//! # }
//! ```
//!
//! rustix covers mlock/munlock; the VFIO ioctls go through libc.

// ioctl arguments need exact casts between kernel structs and pointers
#![allow(clippy::cast_possible_truncation)]

use std::alloc::Layout;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::ptr::NonNull;
use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rustix::mm::{mlock, munlock};
use tracing::{debug, info, warn};

use crate::dma::{write_range, DmaAllocator, DmaBuffer, DmaMemory, IOVA_ALIGN};
use crate::error::{Result, RlError};
use crate::mmio::MappedBar;

/// VFIO ioctl numbers, `_IO(';', 100 + n)`
pub(crate) mod ioctls {
    use std::os::raw::c_ulong;

    const fn io(nr: u8) -> c_ulong {
        ((b';' as c_ulong) << 8) | (100 + nr as c_ulong)
    }

    pub const VFIO_GET_API_VERSION: c_ulong = io(0);
    pub const VFIO_CHECK_EXTENSION: c_ulong = io(1);
    pub const VFIO_SET_IOMMU: c_ulong = io(2);
    pub const VFIO_GROUP_GET_STATUS: c_ulong = io(3);
    pub const VFIO_GROUP_SET_CONTAINER: c_ulong = io(4);
    pub const VFIO_GROUP_GET_DEVICE_FD: c_ulong = io(6);
    pub const VFIO_DEVICE_GET_REGION_INFO: c_ulong = io(8);
    pub const VFIO_IOMMU_MAP_DMA: c_ulong = io(13);
    pub const VFIO_IOMMU_UNMAP_DMA: c_ulong = io(14);

    pub const VFIO_API_VERSION: i32 = 0;
    pub const VFIO_TYPE1V2_IOMMU: u32 = 3;
    pub const VFIO_GROUP_FLAGS_VIABLE: u32 = 1 << 0;
    pub const VFIO_DMA_MAP_FLAG_READ: u32 = 1 << 0;
    pub const VFIO_DMA_MAP_FLAG_WRITE: u32 = 1 << 1;
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioGroupStatus {
    argsz: u32,
    flags: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioDmaMap {
    argsz: u32,
    flags: u32,
    vaddr: u64,
    iova: u64,
    size: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioDmaUnmap {
    argsz: u32,
    flags: u32,
    iova: u64,
    size: u64,
}

/// First IOVA handed out, above the low 256 MiB
const IOVA_START: u64 = 0x1000_0000;

fn os_error(what: &str) -> RlError {
    RlError::internal(format!("{what}: {}", std::io::Error::last_os_error()))
}

/// PF opened through VFIO
#[derive(Debug)]
pub struct VfioDevice {
    pcie_address: String,
    container: Arc<File>,
    // the group must stay open while the container is in use
    _group: File,
    device: File,
    next_iova: Mutex<u64>,
}

impl VfioDevice {
    fn iommu_group(pcie_address: &str) -> Result<u32> {
        let path = format!("/sys/bus/pci/devices/{pcie_address}/iommu_group");
        let link = std::fs::read_link(&path)
            .map_err(|e| RlError::not_found(format!("{path}: {e} (is the IOMMU on?)")))?;
        link.file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| RlError::internal(format!("bad IOMMU group link {}", link.display())))
    }

    fn open_rw(path: &str) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| RlError::not_found(format!("{path}: {e}")))
    }

    /// Attach the PF at `pcie_address` to a fresh Type1v2 container
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the IOMMU group or VFIO nodes are missing and
    /// `Internal` if any VFIO step is refused.
    pub fn open(pcie_address: &str) -> Result<Self> {
        let group_id = Self::iommu_group(pcie_address)?;
        debug!("VFIO: {pcie_address} in IOMMU group {group_id}");

        let container = Self::open_rw("/dev/vfio/vfio")?;

        // SAFETY: _IO with no argument on the open container fd.
        let version =
            unsafe { libc::ioctl(container.as_raw_fd(), ioctls::VFIO_GET_API_VERSION as _) };
        if version != ioctls::VFIO_API_VERSION {
            return Err(RlError::internal(format!(
                "unsupported VFIO API version {version}"
            )));
        }

        // SAFETY: the argument is the extension id, passed by value.
        let has_type1 = unsafe {
            libc::ioctl(
                container.as_raw_fd(),
                ioctls::VFIO_CHECK_EXTENSION as _,
                ioctls::VFIO_TYPE1V2_IOMMU,
            )
        };
        if has_type1 != 1 {
            return Err(RlError::internal("VFIO Type1v2 IOMMU not supported"));
        }

        let group = Self::open_rw(&format!("/dev/vfio/{group_id}"))?;

        let mut status = VfioGroupStatus {
            argsz: std::mem::size_of::<VfioGroupStatus>() as u32,
            flags: 0,
        };
        // SAFETY: the kernel fills a vfio_group_status; argsz is set and the
        // layout matches.
        let ret = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_GET_STATUS as _,
                std::ptr::addr_of_mut!(status),
            )
        };
        if ret < 0 || status.flags & ioctls::VFIO_GROUP_FLAGS_VIABLE == 0 {
            return Err(RlError::internal(format!(
                "IOMMU group {group_id} not viable (bind every device to vfio-pci)"
            )));
        }

        // SAFETY: the kernel reads one int, the container fd.
        let ret = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_SET_CONTAINER as _,
                std::ptr::from_ref(&container.as_raw_fd()),
            )
        };
        if ret < 0 {
            return Err(os_error("VFIO set container"));
        }

        // SAFETY: the IOMMU type is passed by value; a group is attached.
        let ret = unsafe {
            libc::ioctl(
                container.as_raw_fd(),
                ioctls::VFIO_SET_IOMMU as _,
                ioctls::VFIO_TYPE1V2_IOMMU,
            )
        };
        if ret < 0 {
            return Err(os_error("VFIO set IOMMU"));
        }

        let name = CString::new(pcie_address)
            .map_err(|e| RlError::invalid_argument(format!("PCIe address: {e}")))?;
        // SAFETY: the kernel reads a NUL-terminated device name.
        let device_fd = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_GET_DEVICE_FD as _,
                name.as_ptr(),
            )
        };
        if device_fd < 0 {
            return Err(os_error("VFIO device fd"));
        }
        // SAFETY: device_fd is a fresh fd we now own.
        let device = unsafe { File::from_raw_fd(device_fd) };

        info!("VFIO: opened {pcie_address} (group {group_id})");
        Ok(Self {
            pcie_address: pcie_address.to_string(),
            container: Arc::new(container),
            _group: group,
            device,
            next_iova: Mutex::new(IOVA_START),
        })
    }

    /// PCIe address this device was opened with
    pub fn pcie_address(&self) -> &str {
        &self.pcie_address
    }

    /// Map region `bar` of the device
    ///
    /// # Errors
    ///
    /// As [`MappedBar::from_vfio`].
    pub fn map_bar(&self, bar: u32) -> Result<MappedBar> {
        MappedBar::from_vfio(&self.device, bar)
    }

    fn reserve_iova(&self, size: usize) -> Result<u64> {
        let mut next = self.next_iova.lock().unwrap_or_else(PoisonError::into_inner);
        let iova = *next;
        *next = iova
            .checked_add(size as u64)
            .ok_or_else(|| RlError::internal("IOVA space exhausted"))?;
        Ok(iova)
    }
}

impl DmaAllocator for VfioDevice {
    fn alloc(&self, size: usize) -> Result<DmaBuffer> {
        if size == 0 {
            return Err(RlError::invalid_argument("zero-sized DMA buffer"));
        }
        let span = size.div_ceil(IOVA_ALIGN as usize) * IOVA_ALIGN as usize;
        let iova = self.reserve_iova(span)?;
        let region = PinnedRegion::map(self.container.clone(), span, iova)?;
        Ok(DmaBuffer::new(Box::new(region)))
    }
}

/// Page-aligned, locked host memory mapped at `iova`
#[derive(Debug)]
struct PinnedRegion {
    container: Arc<File>,
    vaddr: NonNull<u8>,
    layout: Layout,
    iova: u64,
}

// SAFETY: the region owns its allocation; writes need &mut self.
unsafe impl Send for PinnedRegion {}

impl PinnedRegion {
    fn map(container: Arc<File>, size: usize, iova: u64) -> Result<Self> {
        let layout = Layout::from_size_align(size, IOVA_ALIGN as usize)
            .map_err(|e| RlError::invalid_argument(format!("DMA layout: {e}")))?;

        // SAFETY: layout has a non-zero size and a power-of-two alignment;
        // the block is freed with the same layout in Drop or below.
        let vaddr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
            .ok_or_else(|| RlError::internal("out of DMA memory"))?;

        // SAFETY: [vaddr, vaddr + size) is the allocation made above.
        if let Err(e) = unsafe { mlock(vaddr.as_ptr().cast(), size) } {
            // SAFETY: allocated above with this layout and not yet shared.
            unsafe { std::alloc::dealloc(vaddr.as_ptr(), layout) };
            return Err(RlError::internal(format!("mlock DMA buffer: {e}")));
        }

        let map = VfioDmaMap {
            argsz: std::mem::size_of::<VfioDmaMap>() as u32,
            flags: ioctls::VFIO_DMA_MAP_FLAG_READ | ioctls::VFIO_DMA_MAP_FLAG_WRITE,
            vaddr: vaddr.as_ptr() as u64,
            iova,
            size: size as u64,
        };
        // SAFETY: the kernel reads a vfio_iommu_type1_dma_map describing the
        // locked allocation above.
        let ret = unsafe {
            libc::ioctl(
                container.as_raw_fd(),
                ioctls::VFIO_IOMMU_MAP_DMA as _,
                std::ptr::addr_of!(map),
            )
        };
        if ret < 0 {
            let err = os_error("VFIO map DMA");
            // SAFETY: locked and allocated above, never handed out.
            unsafe {
                let _ = munlock(vaddr.as_ptr().cast(), size);
                std::alloc::dealloc(vaddr.as_ptr(), layout);
            }
            return Err(err);
        }

        debug!("DMA map: vaddr={vaddr:p}, iova={iova:#x}, size={size:#x}");
        Ok(Self {
            container,
            vaddr,
            layout,
            iova,
        })
    }
}

impl DmaMemory for PinnedRegion {
    fn iova(&self) -> u64 {
        self.iova
    }

    fn size(&self) -> usize {
        self.layout.size()
    }

    fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        write_range(self.size(), offset, data, self.iova)?;
        // SAFETY: offset + data.len() <= size was checked and &mut self is
        // exclusive on the host side.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.vaddr.as_ptr().add(offset),
                data.len(),
            );
        }
        fence(Ordering::SeqCst);
        Ok(())
    }

    fn read_all(&self) -> Vec<u8> {
        fence(Ordering::SeqCst);
        // SAFETY: every i < size lies in the allocation; volatile because the
        // device writes behind the compiler's back.
        (0..self.size())
            .map(|i| unsafe { std::ptr::read_volatile(self.vaddr.as_ptr().add(i)) })
            .collect()
    }
}

impl Drop for PinnedRegion {
    fn drop(&mut self) {
        let unmap = VfioDmaUnmap {
            argsz: std::mem::size_of::<VfioDmaUnmap>() as u32,
            flags: 0,
            iova: self.iova,
            size: self.layout.size() as u64,
        };
        // SAFETY: unmaps the IOVA range mapped in `map` before the memory goes.
        let ret = unsafe {
            libc::ioctl(
                self.container.as_raw_fd(),
                ioctls::VFIO_IOMMU_UNMAP_DMA as _,
                std::ptr::addr_of!(unmap),
            )
        };
        if ret < 0 {
            // the device may still reach the pages: leak them rather than free
            warn!(
                "VFIO unmap DMA at iova={:#x}: {}",
                self.iova,
                std::io::Error::last_os_error()
            );
            return;
        }

        // SAFETY: vaddr/layout come from `map`; the IOMMU mapping is gone.
        unsafe {
            let _ = munlock(self.vaddr.as_ptr().cast(), self.layout.size());
            std::alloc::dealloc(self.vaddr.as_ptr(), self.layout);
        }
        debug!("Freed DMA buffer at iova={:#x}", self.iova);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_numbers_match_kernel_headers() {
        assert_eq!(ioctls::VFIO_GET_API_VERSION, 0x3b64);
        assert_eq!(ioctls::VFIO_DEVICE_GET_REGION_INFO, 0x3b6c);
        assert_eq!(ioctls::VFIO_IOMMU_MAP_DMA, 0x3b71);
        assert_eq!(ioctls::VFIO_IOMMU_UNMAP_DMA, 0x3b72);
    }

    #[test]
    fn dma_structs_match_kernel_layout() {
        assert_eq!(std::mem::size_of::<VfioDmaMap>(), 32);
        assert_eq!(std::mem::size_of::<VfioDmaUnmap>(), 24);
        assert_eq!(std::mem::size_of::<VfioGroupStatus>(), 8);
    }

    #[test]
    fn missing_device_is_not_found() {
        let err = VfioDevice::open("ffff:ff:1f.7").unwrap_err();
        assert!(matches!(err, RlError::NotFound { .. }));
    }

    #[test]
    #[ignore = "requires a QAT gen4 PF bound to vfio-pci"]
    fn mapped_buffer_round_trip() {
        let addr = std::env::var("QAT_PF").unwrap_or_else(|_| "0000:6b:00.0".into());
        let device = VfioDevice::open(&addr).unwrap();
        let mut a = device.alloc(100).unwrap();
        let b = device.alloc(8).unwrap();
        assert_eq!(a.size(), 4096);
        assert!(b.iova() >= a.iova() + 4096);
        a.fill(&[7; 100]).unwrap();
        assert_eq!(a.contents()[..100], [7; 100]);
        assert!(a.fill(&[0; 4097]).is_err());
    }
}
