//! In-Memory Flash
//!
//! Implements FlashDevice over a RAM image with NOR semantics: programming
//! only clears bits and erase sets a whole sector to 0xff. Clones share the
//! same image, so a test can keep a handle to inspect or damage the device
//! while the store owns another.

use crate::domain::codec::ERASED;
use crate::domain::errors::FlashError;
use crate::domain::ports::FlashDevice;
use parking_lot::Mutex;
use std::sync::Arc;

struct MemFlashState {
    data: Vec<u8>,
    fail_writes: u32,
    tear_at: Option<usize>,
    erase_count: u64,
}

/// RAM-backed NOR flash with fault injection.
#[derive(Clone)]
pub struct MemFlash {
    sector_size: usize,
    sector_count: u32,
    state: Arc<Mutex<MemFlashState>>,
}

impl MemFlash {
    /// Create an erased device.
    pub fn new(sector_size: usize, sector_count: u32) -> Self {
        Self {
            sector_size,
            sector_count,
            state: Arc::new(Mutex::new(MemFlashState {
                data: vec![ERASED; sector_size * sector_count as usize],
                fail_writes: 0,
                tear_at: None,
                erase_count: 0,
            })),
        }
    }

    /// Make the next `n` writes fail without programming anything.
    pub fn fail_next_writes(&self, n: u32) {
        self.state.lock().fail_writes = n;
    }

    /// Make the next write program only its first `bytes` bytes and then
    /// report failure, as if power was lost mid-write.
    pub fn tear_next_write(&self, bytes: usize) {
        self.state.lock().tear_at = Some(bytes);
    }

    /// Program raw bytes, bypassing alignment checks and fault injection.
    pub fn program(&self, addr: u32, data: &[u8]) {
        let mut state = self.state.lock();
        let start = addr as usize;
        for (cell, byte) in state.data[start..start + data.len()].iter_mut().zip(data) {
            *cell &= *byte;
        }
    }

    /// Copy of one device sector.
    pub fn sector(&self, sector: u32) -> Vec<u8> {
        let start = sector as usize * self.sector_size;
        self.state.lock().data[start..start + self.sector_size].to_vec()
    }

    /// Number of sector erases performed so far.
    pub fn erase_count(&self) -> u64 {
        self.state.lock().erase_count
    }

    fn check_range(&self, addr: u32, len: usize) -> Result<usize, FlashError> {
        let start = addr as usize;
        let total = self.sector_size * self.sector_count as usize;
        if start.checked_add(len).map_or(true, |end| end > total) {
            return Err(FlashError::OutOfRange { addr, len });
        }
        Ok(start)
    }
}

impl FlashDevice for MemFlash {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn sector_count(&self) -> u32 {
        self.sector_count
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let start = self.check_range(addr, buf.len())?;
        let state = self.state.lock();
        buf.copy_from_slice(&state.data[start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        if addr % 4 != 0 || data.len() % 4 != 0 {
            return Err(FlashError::Misaligned {
                addr,
                len: data.len(),
            });
        }
        let start = self.check_range(addr, data.len())?;
        let mut state = self.state.lock();

        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(FlashError::Device("injected write failure".to_string()));
        }

        let (len, torn) = match state.tear_at.take() {
            Some(at) => (at.min(data.len()), true),
            None => (data.len(), false),
        };
        for (cell, byte) in state.data[start..start + len].iter_mut().zip(data) {
            *cell &= *byte;
        }
        if torn {
            return Err(FlashError::Device("write interrupted".to_string()));
        }
        Ok(())
    }

    fn erase_sector(&mut self, sector: u32) -> Result<(), FlashError> {
        if sector >= self.sector_count {
            return Err(FlashError::OutOfRange {
                addr: sector.saturating_mul(self.sector_size as u32),
                len: self.sector_size,
            });
        }
        let start = sector as usize * self.sector_size;
        let mut state = self.state.lock();
        state.data[start..start + self.sector_size].fill(ERASED);
        state.erase_count += 1;
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_program_only_clears_bits() {
        let mut flash = MemFlash::new(64, 2);
        flash.write(0, &[0x0f, 0xf0, 0xff, 0x00]).unwrap();
        flash.write(0, &[0xf3, 0x3f, 0x55, 0xff]).unwrap();

        let mut out = [0u8; 4];
        flash.read(0, &mut out).unwrap();
        assert_eq!(out, [0x03, 0x30, 0x55, 0x00]);
    }

    #[test]
    fn test_erase_restores_ones() {
        let mut flash = MemFlash::new(64, 2);
        flash.write(64, &[0; 8]).unwrap();
        flash.erase_sector(1).unwrap();
        assert!(flash.sector(1).iter().all(|b| *b == ERASED));
        assert_eq!(flash.erase_count(), 1);
    }

    #[test]
    fn test_rejects_misaligned_and_out_of_range() {
        let mut flash = MemFlash::new(64, 2);
        assert!(matches!(flash.write(2, &[0; 4]), Err(FlashError::Misaligned { .. })));
        assert!(matches!(flash.write(0, &[0; 3]), Err(FlashError::Misaligned { .. })));
        assert!(matches!(flash.write(128, &[0; 4]), Err(FlashError::OutOfRange { .. })));
        let mut out = [0u8; 8];
        assert!(matches!(flash.read(124, &mut out), Err(FlashError::OutOfRange { .. })));
        assert!(flash.erase_sector(2).is_err());
    }

    #[test]
    fn test_fault_injection() {
        let mut flash = MemFlash::new(64, 2);
        flash.fail_next_writes(1);
        assert!(flash.write(0, &[0; 4]).is_err());
        assert!(flash.sector(0).iter().all(|b| *b == ERASED));
        assert!(flash.write(0, &[0; 4]).is_ok());

        flash.tear_next_write(4);
        assert!(flash.write(8, &[0; 8]).is_err());
        let sector = flash.sector(0);
        assert_eq!(&sector[8..12], &[0; 4]);
        assert_eq!(&sector[12..16], &[ERASED; 4]);
    }

    #[test]
    fn test_clones_share_image() {
        let flash = MemFlash::new(64, 2);
        let mut device = flash.clone();
        device.write(0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(&flash.sector(0)[..4], &[1, 2, 3, 4]);
    }
}
