//! Flash Device Port
//!
//! Sector-addressed NOR flash. Implementations may be a RAM image, a file
//! on disk, or a real SPI flash driver.

use crate::domain::errors::FlashError;

/// Raw access to a region of erasable flash.
///
/// Writes follow NOR semantics: programming can only clear bits, so a
/// sector must be erased (all `0xff`) before fresh content is written.
/// Addresses are absolute byte offsets into the device.
pub trait FlashDevice: Send {
    /// Erase granularity in bytes.
    fn sector_size(&self) -> usize;

    /// Total number of sectors on the device.
    fn sector_count(&self) -> u32;

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    /// Program `data` at `addr`. Callers keep `addr` and the length 4-byte
    /// aligned.
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError>;

    fn erase_sector(&mut self, sector: u32) -> Result<(), FlashError>;
}
