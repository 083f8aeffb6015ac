//! Core error taxonomy.
//!
//! Every fallible operation in this crate returns [`CoreError`]. The binary
//! wraps these in `anyhow` at the CLI boundary and prints a single
//! phase-tagged line before halting, rather than a full backtrace.

use std::path::PathBuf;

use thiserror::Error;

/// All errors the firmware-installer core can raise.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("file I/O error on {path}: {source}")]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("format error: {0}")]
    Format(String),

    #[error("checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    Checksum { expected: u32, computed: u32 },

    #[error("flash I/O error: {0}")]
    FlashIo(String),

    #[error("capacity error: {0}")]
    Capacity(String),

    #[error("platform error: {0}")]
    Platform(String),

    #[error("allocation error: {0}")]
    Alloc(String),

    /// Wraps any of the above once it occurs after flash has already been
    /// mutated (a part erased/written, the table or registry already
    /// updated). There is no rollback path past that point — this is the
    /// Rust-process analogue of the original firmware's "halt with
    /// diagnostic blink", surfaced distinctly so an operator knows the
    /// flash image may now be in a partially-installed state.
    #[error("{0}")]
    Unrecoverable(Box<CoreError>),
}

impl CoreError {
    pub fn file_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileIo {
            path: path.into(),
            source,
        }
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub fn flash_io(msg: impl Into<String>) -> Self {
        Self::FlashIo(msg.into())
    }

    pub fn capacity(msg: impl Into<String>) -> Self {
        Self::Capacity(msg.into())
    }

    pub fn platform(msg: impl Into<String>) -> Self {
        Self::Platform(msg.into())
    }

    /// Marks `self` as having occurred after flash mutation has begun.
    pub fn into_unrecoverable(self) -> Self {
        Self::Unrecoverable(Box::new(self))
    }

    /// User-facing phase tag, printed as a single uppercase line
    /// (`"CHECKSUM MISMATCH ERROR"`, `"ERASE ERROR"`, ...) ahead of the
    /// detailed message.
    pub fn phase_tag(&self) -> &'static str {
        match self {
            CoreError::FileIo { .. } => "FILE I/O ERROR",
            CoreError::Format(_) => "FORMAT ERROR",
            CoreError::Checksum { .. } => "CHECKSUM MISMATCH ERROR",
            CoreError::FlashIo(_) => "FLASH I/O ERROR",
            CoreError::Capacity(_) => "CAPACITY ERROR",
            CoreError::Platform(_) => "PLATFORM ERROR",
            CoreError::Alloc(_) => "ALLOC ERROR",
            CoreError::Unrecoverable(_) => "UNRECOVERABLE",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
