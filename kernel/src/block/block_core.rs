use super::block_error::BlockError;
use alloc::{vec, vec::Vec};
use core::fmt;

/// Size of a block device sector in bytes.
///
/// All IDE disks use this sector size, as do most USB and SCSI disks.
pub const BLOCK_SECTOR_SIZE: usize = pagekit_shared::sizes::SECTOR_SIZE;

/// Index of a block device sector.
///
/// Good enough for devices up to 2 TB.
pub type BlockSector = u32;

/// Interface to a sector-addressed device.
pub trait BlockDevice: Send {
    /// Reads sector `sector` into `buf`, which must be `BLOCK_SECTOR_SIZE` bytes long.
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError>;
    /// Writes `buf`, which must be `BLOCK_SECTOR_SIZE` bytes long, to sector `sector`.
    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError>;
    /// Size of the device in sectors.
    fn size(&self) -> BlockSector;
}

/// A RAM-backed block device.
pub struct MemDisk {
    data: Vec<u8>,
    /// The size of the device in sectors
    block_size: BlockSector,
    read_count: u32,
    write_count: u32,
}

impl MemDisk {
    pub fn new(block_size: BlockSector) -> Self {
        Self {
            data: vec![0; block_size as usize * BLOCK_SECTOR_SIZE],
            block_size,
            read_count: 0,
            write_count: 0,
        }
    }

    fn check(&self, sector: BlockSector, buf_len: usize) -> Result<usize, BlockError> {
        if buf_len != BLOCK_SECTOR_SIZE {
            return Err(BlockError::BufferInvalid);
        }
        if sector >= self.block_size {
            return Err(BlockError::SectorOutOfBounds);
        }
        Ok(sector as usize * BLOCK_SECTOR_SIZE)
    }

    pub fn read_count(&self) -> u32 {
        self.read_count
    }

    pub fn write_count(&self) -> u32 {
        self.write_count
    }
}

impl BlockDevice for MemDisk {
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        let start = self.check(sector, buf.len())?;
        buf.copy_from_slice(&self.data[start..start + BLOCK_SECTOR_SIZE]);
        self.read_count += 1;
        Ok(())
    }

    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        let start = self.check(sector, buf.len())?;
        self.data[start..start + BLOCK_SECTOR_SIZE].copy_from_slice(buf);
        self.write_count += 1;
        Ok(())
    }

    fn size(&self) -> BlockSector {
        self.block_size
    }
}

impl fmt::Display for MemDisk {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "memdisk: {:04} sectors, {:04} read, {:04} write",
            self.block_size, self.read_count, self.write_count
        )
    }
}

/// A device whose every transfer fails.
#[cfg(test)]
pub struct BrokenDisk(pub BlockSector);

#[cfg(test)]
impl BlockDevice for BrokenDisk {
    fn read(&mut self, _sector: BlockSector, _buf: &mut [u8]) -> Result<(), BlockError> {
        Err(BlockError::ReadError)
    }

    fn write(&mut self, _sector: BlockSector, _buf: &[u8]) -> Result<(), BlockError> {
        Err(BlockError::WriteError)
    }

    fn size(&self) -> BlockSector {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sectors_are_independent() {
        let mut disk = MemDisk::new(4);
        disk.write(1, &[7; BLOCK_SECTOR_SIZE]).unwrap();

        let mut buf = [0xff; BLOCK_SECTOR_SIZE];
        disk.read(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        disk.read(1, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 7));
        assert_eq!((disk.read_count(), disk.write_count()), (2, 1));
    }

    #[test]
    fn rejects_bad_requests() {
        let mut disk = MemDisk::new(2);
        let mut buf = [0; BLOCK_SECTOR_SIZE];
        assert_eq!(disk.read(2, &mut buf), Err(BlockError::SectorOutOfBounds));
        assert_eq!(disk.write(0, &buf[..10]), Err(BlockError::BufferInvalid));
        assert_eq!(disk.write_count(), 0);
    }
}
