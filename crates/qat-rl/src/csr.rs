//! CSR access seam
//!
//! Everything the RL block writes to the device goes through [`CsrAccess`].
//! On hardware that is a mapped PMISC BAR ([`crate::mmio::MappedBar`]); in
//! tests and the CLI it is a [`ShadowCsr`], a register file that remembers
//! every write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// 32-bit CSR read/write
pub trait CsrAccess: std::fmt::Debug + Send + Sync {
    /// Read the register at `offset`
    fn read32(&self, offset: usize) -> u32;

    /// Write `value` to the register at `offset`
    fn write32(&self, offset: usize, value: u32);
}

#[derive(Debug, Default)]
struct ShadowState {
    regs: HashMap<usize, u32>,
    writes: Vec<(usize, u32)>,
}

/// Software register file
///
/// Unwritten registers read as zero. Clones share the same registers, so a
/// test can keep a handle while the controller owns another.
#[derive(Debug, Clone, Default)]
pub struct ShadowCsr {
    state: Arc<Mutex<ShadowState>>,
}

impl ShadowCsr {
    /// Empty register file
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ShadowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every write so far, oldest first
    pub fn writes(&self) -> Vec<(usize, u32)> {
        self.lock().writes.clone()
    }

    /// Number of writes so far
    pub fn write_count(&self) -> usize {
        self.lock().writes.len()
    }

    /// Writes that landed in `[start, end)`
    pub fn writes_in(&self, start: usize, end: usize) -> Vec<(usize, u32)> {
        self.lock()
            .writes
            .iter()
            .copied()
            .filter(|(off, _)| (start..end).contains(off))
            .collect()
    }

    /// Preload a register without logging a write
    pub fn poke(&self, offset: usize, value: u32) {
        self.lock().regs.insert(offset, value);
    }
}

impl CsrAccess for ShadowCsr {
    fn read32(&self, offset: usize) -> u32 {
        self.lock().regs.get(&offset).copied().unwrap_or(0)
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut state = self.lock();
        state.regs.insert(offset, value);
        state.writes.push((offset, value));
    }
}

impl<T: CsrAccess + ?Sized> CsrAccess for Arc<T> {
    fn read32(&self, offset: usize) -> u32 {
        (**self).read32(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        (**self).write32(offset, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwritten_reads_zero() {
        let csr = ShadowCsr::new();
        assert_eq!(csr.read32(0x1000), 0);
        assert_eq!(csr.write_count(), 0);
    }

    #[test]
    fn clones_share_registers() {
        let csr = ShadowCsr::new();
        let view = csr.clone();
        csr.write32(0x10, 7);
        assert_eq!(view.read32(0x10), 7);
        assert_eq!(view.writes(), vec![(0x10, 7)]);
    }

    #[test]
    fn poke_is_not_logged() {
        let csr = ShadowCsr::new();
        csr.poke(0x20, 1);
        assert_eq!(csr.read32(0x20), 1);
        assert!(csr.writes_in(0, 0x100).is_empty());
    }
}
