//! File-Backed Flash
//!
//! Implements FlashDevice over a flash image on disk so the sector ring
//! survives process restarts. A new or short image is extended with erased
//! bytes. Writes keep NOR semantics and are synced before returning.

use crate::domain::codec::ERASED;
use crate::domain::errors::FlashError;
use crate::domain::ports::FlashDevice;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub struct FileFlash {
    path: PathBuf,
    file: File,
    sector_size: usize,
    sector_count: u32,
}

impl FileFlash {
    /// Open or create a flash image of `sector_count` sectors.
    pub fn open(
        path: impl AsRef<Path>,
        sector_size: usize,
        sector_count: u32,
    ) -> Result<Self, FlashError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let total = (sector_size * sector_count as usize) as u64;
        let current = file.metadata()?.len();
        if current < total {
            file.seek(SeekFrom::Start(current))?;
            let padding = vec![ERASED; (total - current) as usize];
            file.write_all(&padding)?;
            file.sync_data()?;
            tracing::info!(
                "flash image {} extended to {} sectors",
                path.display(),
                sector_count
            );
        }

        Ok(Self {
            path,
            file,
            sector_size,
            sector_count,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_range(&self, addr: u32, len: usize) -> Result<u64, FlashError> {
        let total = self.sector_size as u64 * self.sector_count as u64;
        if addr as u64 + len as u64 > total {
            return Err(FlashError::OutOfRange { addr, len });
        }
        Ok(addr as u64)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), FlashError> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), FlashError> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.file.sync_data()?;
        Ok(())
    }
}

impl FlashDevice for FileFlash {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn sector_count(&self) -> u32 {
        self.sector_count
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let offset = self.check_range(addr, buf.len())?;
        self.read_at(offset, buf)
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        if addr % 4 != 0 || data.len() % 4 != 0 {
            return Err(FlashError::Misaligned {
                addr,
                len: data.len(),
            });
        }
        let offset = self.check_range(addr, data.len())?;

        let mut cells = vec![0u8; data.len()];
        self.read_at(offset, &mut cells)?;
        for (cell, byte) in cells.iter_mut().zip(data) {
            *cell &= *byte;
        }
        self.write_at(offset, &cells)
    }

    fn erase_sector(&mut self, sector: u32) -> Result<(), FlashError> {
        let addr = sector.saturating_mul(self.sector_size as u32);
        if sector >= self.sector_count {
            return Err(FlashError::OutOfRange {
                addr,
                len: self.sector_size,
            });
        }
        let erased = vec![ERASED; self.sector_size];
        self.write_at(addr as u64, &erased)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_new_image_is_erased() {
        let dir = TempDir::new().unwrap();
        let mut flash = FileFlash::open(dir.path().join("flash.img"), 128, 4).unwrap();
        assert_eq!(std::fs::metadata(flash.path()).unwrap().len(), 512);

        let mut out = [0u8; 128];
        flash.read(128, &mut out).unwrap();
        assert!(out.iter().all(|b| *b == ERASED));
    }

    #[test]
    fn test_content_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flash.img");
        {
            let mut flash = FileFlash::open(&path, 128, 4).unwrap();
            flash.write(256, &[1, 2, 3, 4]).unwrap();
        }
        let mut flash = FileFlash::open(&path, 128, 4).unwrap();
        let mut out = [0u8; 4];
        flash.read(256, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_nor_write_and_erase() {
        let dir = TempDir::new().unwrap();
        let mut flash = FileFlash::open(dir.path().join("flash.img"), 128, 2).unwrap();
        flash.write(0, &[0xf0, 0xff, 0xff, 0xff]).unwrap();
        flash.write(0, &[0x3c, 0xff, 0xff, 0xff]).unwrap();

        let mut out = [0u8; 1];
        flash.read(0, &mut out).unwrap();
        assert_eq!(out[0], 0x30);

        flash.erase_sector(0).unwrap();
        flash.read(0, &mut out).unwrap();
        assert_eq!(out[0], ERASED);
        assert!(flash.erase_sector(2).is_err());
        assert!(matches!(flash.write(1, &[0; 4]), Err(FlashError::Misaligned { .. })));
    }
}
