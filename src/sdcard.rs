//! The firmware source filesystem.
//!
//! On the console this is a FAT-formatted SD card holding `.fw` files plus
//! an optional `utility.bin`. [`SdFilesystem`] abstracts just enough of
//! that to let the installation pipeline enumerate and open firmware files
//! without depending on any particular storage stack; [`HostSdFilesystem`]
//! walks a plain host directory in its place.

use std::fs;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{CoreError, Result};

/// A reader that also supports seeking, so callers can read a file in more
/// than one pass without holding its contents in memory between passes.
pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

/// A firmware source directory: enumerable `.fw` files plus an optional
/// shared `utility.bin`.
pub trait SdFilesystem {
    /// Lists every `.fw` file found, sorted for deterministic iteration.
    fn list_firmwares(&self) -> Result<Vec<PathBuf>>;

    /// Opens a firmware file for streaming, seekable reads. Seeking lets the
    /// Installation Pipeline read a firmware file in two passes — a
    /// header-only validation pass, then a streaming erase/write pass —
    /// without ever buffering the whole file in memory.
    fn open_firmware(&self, path: &Path) -> Result<Box<dyn ReadSeek>>;

    /// Reads the shared utility image, if one is present.
    fn read_utility(&self) -> Result<Option<Vec<u8>>>;
}

/// Backs [`SdFilesystem`] with a real directory on the host, standing in
/// for the console's SD card mount.
pub struct HostSdFilesystem {
    root: PathBuf,
}

impl HostSdFilesystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl SdFilesystem for HostSdFilesystem {
    fn list_firmwares(&self) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        for entry in WalkDir::new(&self.root)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "fw") {
                found.push(path.to_path_buf());
            }
        }
        found.sort();
        Ok(found)
    }

    fn open_firmware(&self, path: &Path) -> Result<Box<dyn ReadSeek>> {
        let file = fs::File::open(path).map_err(|e| CoreError::file_io(path, e))?;
        Ok(Box::new(file))
    }

    fn read_utility(&self) -> Result<Option<Vec<u8>>> {
        let path = self.root.join("utility.bin");
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path).map_err(|e| CoreError::file_io(&path, e))?;
        Ok(Some(data))
    }
}
