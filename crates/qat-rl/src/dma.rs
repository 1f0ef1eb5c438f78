//! Device-visible parameter buffers for admin commands
//!
//! The firmware reads SLA parameters from a buffer it addresses by IOVA. A
//! [`DmaBuffer`] is owned by the call that allocated it and is released when
//! dropped, on success and on every error path alike.
//!
//! ```text
//! DmaAllocator
//!   ├─ VfioDevice   pinned host memory mapped through the IOMMU (hardware)
//!   └─ DmaPool      IOVA → contents table read by SoftwareFirmware (simulation)
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::error::{Result, RlError};

/// First IOVA handed out by the host pool
const IOVA_BASE: u64 = 0x1_0000_0000;

/// Buffers are placed on page boundaries
pub(crate) const IOVA_ALIGN: u64 = 4096;

/// Memory behind one [`DmaBuffer`]
///
/// Implementations release their mapping in `Drop`.
pub trait DmaMemory: fmt::Debug + Send {
    /// Device-visible address
    fn iova(&self) -> u64;

    /// Size in bytes
    fn size(&self) -> usize;

    /// Copy `data` in at `offset`
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the write runs past the buffer.
    fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<()>;

    /// Snapshot of the current contents, including device writes
    fn read_all(&self) -> Vec<u8>;
}

/// Source of DMA buffers for admin traffic
pub trait DmaAllocator: fmt::Debug + Send + Sync {
    /// Allocate a zeroed buffer of at least `size` bytes
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a zero size, or a backend error if
    /// memory cannot be made visible to the device.
    fn alloc(&self, size: usize) -> Result<DmaBuffer>;
}

impl<T: DmaAllocator + ?Sized> DmaAllocator for Arc<T> {
    fn alloc(&self, size: usize) -> Result<DmaBuffer> {
        (**self).alloc(size)
    }
}

/// Bounds check shared by the backends
pub(crate) fn write_range(len: usize, offset: usize, data: &[u8], iova: u64) -> Result<usize> {
    offset
        .checked_add(data.len())
        .filter(|&end| end <= len)
        .ok_or_else(|| RlError::invalid_argument(format!("DMA write past end of {iova:#x}")))
}

/// One DMA buffer, freed on drop
#[derive(Debug)]
pub struct DmaBuffer {
    mem: Box<dyn DmaMemory>,
}

impl DmaBuffer {
    /// Wrap backend memory
    pub fn new(mem: Box<dyn DmaMemory>) -> Self {
        Self { mem }
    }

    /// Device-visible address
    pub fn iova(&self) -> u64 {
        self.mem.iova()
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.mem.size()
    }

    /// Fill the buffer from `data`, starting at byte 0
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `data` is larger than the buffer.
    pub fn fill(&mut self, data: &[u8]) -> Result<()> {
        self.mem.write_at(0, data)
    }

    /// Current contents
    pub fn contents(&self) -> Vec<u8> {
        self.mem.read_all()
    }
}

#[derive(Debug, Default)]
struct PoolState {
    buffers: HashMap<u64, Vec<u8>>,
    next_iova: u64,
    allocated: u64,
}

/// Host-memory DMA pool
///
/// Its IOVAs are bookkeeping keys only: nothing maps them for a real device.
/// The software firmware resolves them through [`DmaPool::read`]. Clones
/// share the same pool.
#[derive(Debug, Clone, Default)]
pub struct DmaPool {
    state: Arc<Mutex<PoolState>>,
}

impl DmaPool {
    /// Empty pool
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the buffer at `iova`, `None` once it has been freed
    pub fn read(&self, iova: u64) -> Option<Vec<u8>> {
        self.lock().buffers.get(&iova).cloned()
    }

    /// Write `data` at `offset` into the buffer at `iova`
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown IOVA and `InvalidArgument` if the
    /// write runs past the buffer.
    pub fn write(&self, iova: u64, offset: usize, data: &[u8]) -> Result<()> {
        let mut state = self.lock();
        let buf = state
            .buffers
            .get_mut(&iova)
            .ok_or_else(|| RlError::not_found(format!("DMA buffer {iova:#x}")))?;
        let end = write_range(buf.len(), offset, data, iova)?;
        buf[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Buffers allocated and not yet freed
    pub fn outstanding(&self) -> usize {
        self.lock().buffers.len()
    }

    /// Buffers allocated over the pool's lifetime
    pub fn allocated(&self) -> u64 {
        self.lock().allocated
    }

    fn free(&self, iova: u64) {
        self.lock().buffers.remove(&iova);
    }
}

impl DmaAllocator for DmaPool {
    fn alloc(&self, size: usize) -> Result<DmaBuffer> {
        if size == 0 {
            return Err(RlError::invalid_argument("zero-sized DMA buffer"));
        }

        let mut state = self.lock();
        let iova = IOVA_BASE + state.next_iova;
        let span = (size as u64).div_ceil(IOVA_ALIGN) * IOVA_ALIGN;
        state.next_iova += span;
        state.allocated += 1;
        state.buffers.insert(iova, vec![0; size]);
        drop(state);

        debug!("DMA alloc: iova={iova:#x}, size={size:#x}");
        Ok(DmaBuffer::new(Box::new(PoolBlock {
            pool: self.clone(),
            iova,
            size,
        })))
    }
}

#[derive(Debug)]
struct PoolBlock {
    pool: DmaPool,
    iova: u64,
    size: usize,
}

impl DmaMemory for PoolBlock {
    fn iova(&self) -> u64 {
        self.iova
    }

    fn size(&self) -> usize {
        self.size
    }

    fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.pool.write(self.iova, offset, data)
    }

    fn read_all(&self) -> Vec<u8> {
        self.pool.read(self.iova).unwrap_or_default()
    }
}

impl Drop for PoolBlock {
    fn drop(&mut self) {
        self.pool.free(self.iova);
        debug!("Freed DMA buffer at iova={:#x}", self.iova);
    }
}
