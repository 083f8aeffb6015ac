//! Raw SPI-NOR access.
//!
//! [`FlashIo`] is the seam between the installer core and whatever actually
//! owns the flash chip. On the console itself that's the SPI-NOR driver; in
//! this crate (and in every test) it's [`FileBackedFlash`], a flat file that
//! behaves like flash closely enough to exercise every code path: reads
//! return whatever is there, writes only ever clear bits (never set them),
//! and erase resets a region to `0xff`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{CoreError, Result};
use crate::wire::FOUR_KIB;

/// Raw, offset-addressed flash access. Implementors are not expected to be
/// aware of partitions or any higher-level structure.
pub trait FlashIo {
    /// Total addressable size of the device, in bytes.
    fn capacity(&self) -> u32;

    /// Reads `buf.len()` bytes starting at `offset`.
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<()>;

    /// Erases `len` bytes starting at `offset` to `0xff`. Both `offset` and
    /// `len` must be sector-aligned.
    fn erase(&mut self, offset: u32, len: u32) -> Result<()>;

    /// Writes `data` starting at `offset`. The region must already be erased
    /// (this never sets a bit that is currently clear, matching real NOR
    /// behavior, but callers are responsible for erasing first).
    fn write(&mut self, offset: u32, data: &[u8]) -> Result<()>;

    /// Flushes any buffered state to the backing medium.
    fn flush(&mut self) -> Result<()>;
}

fn check_bounds(capacity: u32, offset: u32, len: u32) -> Result<()> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| CoreError::flash_io("offset + length overflows u32"))?;
    if end > capacity {
        return Err(CoreError::flash_io(format!(
            "access [{offset:#x}, {end:#x}) exceeds flash capacity {capacity:#x}"
        )));
    }
    Ok(())
}

/// A flash image backed by a single flat file on the host filesystem,
/// standing in for raw SPI-NOR during development and testing.
pub struct FileBackedFlash {
    path: PathBuf,
    data: Vec<u8>,
    capacity: u32,
    dirty: bool,
}

impl FileBackedFlash {
    /// Opens an existing flash image file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file =
            File::open(&path).map_err(|e| CoreError::file_io(path.clone(), e))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| CoreError::file_io(path.clone(), e))?;
        let capacity = data.len() as u32;
        Ok(Self {
            path,
            data,
            capacity,
            dirty: false,
        })
    }

    /// Creates a fresh flash image of `capacity` bytes, entirely erased
    /// (`0xff`), and writes it to `path`.
    pub fn create(path: impl AsRef<Path>, capacity: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = vec![0xffu8; capacity as usize];
        let mut flash = Self {
            path,
            data,
            capacity,
            dirty: true,
        };
        flash.flush()?;
        Ok(flash)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Borrows the whole image, for inspection tooling that wants to scan
    /// raw bytes directly.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl FlashIo for FileBackedFlash {
    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<()> {
        check_bounds(self.capacity, offset, buf.len() as u32)?;
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn erase(&mut self, offset: u32, len: u32) -> Result<()> {
        if offset % FOUR_KIB != 0 || len % FOUR_KIB != 0 {
            return Err(CoreError::flash_io(format!(
                "erase region [{offset:#x}, len {len:#x}) is not sector-aligned"
            )));
        }
        check_bounds(self.capacity, offset, len)?;
        let start = offset as usize;
        let end = start + len as usize;
        self.data[start..end].fill(0xff);
        self.dirty = true;
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        check_bounds(self.capacity, offset, data.len() as u32)?;
        let start = offset as usize;
        for (dst, &src) in self.data[start..start + data.len()].iter_mut().zip(data) {
            *dst &= src;
        }
        self.dirty = true;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| CoreError::file_io(self.path.clone(), e))?;
        file.write_all(&self.data)
            .map_err(|e| CoreError::file_io(self.path.clone(), e))?;
        self.dirty = false;
        Ok(())
    }
}

impl Drop for FileBackedFlash {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// A bounded view over a [`FlashIo`], addressed relative to a partition's
/// start offset. Reads and writes past the partition's own size are
/// rejected regardless of what the backing flash would otherwise allow.
pub struct PartitionHandle<'a, F: FlashIo> {
    flash: &'a mut F,
    base: u32,
    size: u32,
}

impl<'a, F: FlashIo> PartitionHandle<'a, F> {
    pub fn new(flash: &'a mut F, base: u32, size: u32) -> Self {
        Self { flash, base, size }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<()> {
        check_bounds(self.size, offset, buf.len() as u32)?;
        self.flash.read(self.base + offset, buf)
    }

    pub fn erase(&mut self, offset: u32, len: u32) -> Result<()> {
        check_bounds(self.size, offset, len)?;
        self.flash.erase(self.base + offset, len)
    }

    pub fn write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        check_bounds(self.size, offset, data.len() as u32)?;
        self.flash.write(self.base + offset, data)
    }
}

pub fn seek_to(file: &mut File, offset: u64) -> Result<()> {
    file.seek(SeekFrom::Start(offset))
        .map(|_| ())
        .map_err(|e| CoreError::flash_io(format!("seek to {offset:#x} failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_then_open_roundtrips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flash.img");
        {
            let mut flash = FileBackedFlash::create(&path, 4 * FOUR_KIB).unwrap();
            flash.write(0, b"hello").unwrap();
            flash.flush().unwrap();
        }
        let mut reopened = FileBackedFlash::open(&path).unwrap();
        let mut buf = [0u8; 5];
        reopened.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn write_only_clears_bits() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flash.img");
        let mut flash = FileBackedFlash::create(&path, FOUR_KIB).unwrap();
        flash.write(0, &[0b1111_0000]).unwrap();
        flash.write(0, &[0b0000_1111]).unwrap();
        let mut buf = [0u8; 1];
        flash.read(0, &mut buf).unwrap();
        assert_eq!(buf[0], 0);
    }

    #[test]
    fn erase_requires_sector_alignment() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flash.img");
        let mut flash = FileBackedFlash::create(&path, 2 * FOUR_KIB).unwrap();
        assert!(flash.erase(1, FOUR_KIB).is_err());
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flash.img");
        let mut flash = FileBackedFlash::create(&path, FOUR_KIB).unwrap();
        let mut buf = [0u8; 16];
        assert!(flash.read(FOUR_KIB - 8, &mut buf).is_err());
    }

    #[test]
    fn partition_handle_confines_access_to_its_window() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flash.img");
        let mut flash = FileBackedFlash::create(&path, 4 * FOUR_KIB).unwrap();
        let mut handle = PartitionHandle::new(&mut flash, FOUR_KIB, FOUR_KIB);
        assert!(handle.write(0, b"ok").is_ok());
        assert!(handle.write(FOUR_KIB - 1, b"nope").is_err());
    }
}
