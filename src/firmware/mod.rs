//! Reads `.fw` firmware container files.
//!
//! Layout on disk: a 24-byte magic, a 40-byte description, an 86x48 RGB565
//! tile, then a sequence of `(partition descriptor, u32 length, payload)`
//! records running up to the final 4 bytes, which hold a CRC-32 computed
//! over everything before them.
//!
//! Nothing in this module buffers a whole `.fw` file or a whole part's
//! payload into memory: the device this targets has a few hundred KiB of
//! RAM against flash images that run into the multiple-MiB range (spec.md
//! §1), so every payload is read through [`FirmwareFile::read_part_chunk`]
//! into a caller-owned buffer the size of one flash sector.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crc32fast::Hasher;

use crate::error::{CoreError, Result};
use crate::wire::{PartitionDescriptor, Tile, FIRMWARE_DESCRIPTION_SIZE, FIRMWARE_MAGIC, TILE_LENGTH};

const CRC_CHUNK: usize = 4096;

/// The fixed-size header every `.fw` file starts with.
#[derive(Debug, Clone)]
pub struct FirmwareHeader {
    pub description: [u8; FIRMWARE_DESCRIPTION_SIZE],
    pub tile: Tile,
}

impl FirmwareHeader {
    pub fn description_str(&self) -> String {
        let end = self
            .description
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(FIRMWARE_DESCRIPTION_SIZE);
        String::from_utf8_lossy(&self.description[..end]).into_owned()
    }
}

/// One partition record's fixed-size header: the descriptor plus the
/// declared payload length `L`. Yielded by [`FirmwareFile::next_part`]
/// without touching the payload itself, so callers can validate a part
/// before deciding whether to stream it anywhere.
#[derive(Debug, Clone)]
pub struct PartHeader {
    pub descriptor: PartitionDescriptor,
    pub payload_length: u32,
}

/// A single partition record with its payload fully loaded. Only used by
/// tests and other small-input callers that want the whole record at once;
/// the Installation Pipeline streams payloads directly instead of building
/// one of these.
#[derive(Debug, Clone)]
pub struct FirmwarePart {
    pub descriptor: PartitionDescriptor,
    pub data: Vec<u8>,
}

/// A parsed `.fw` file, still holding its reader so parts can be streamed
/// rather than buffered all at once by the caller.
pub struct FirmwareFile<R> {
    reader: R,
    header: FirmwareHeader,
    parts_start: u64,
    file_len: u64,
    /// Bytes of the current part's payload not yet read via
    /// [`FirmwareFile::read_part_chunk`]. [`FirmwareFile::next_part`] skips
    /// over whatever is left here before reading the next part's header, so
    /// a caller never has to drain a part it doesn't care about.
    part_remaining: u32,
}

impl FirmwareFile<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| CoreError::file_io(path, e))?;
        Self::from_seekable(BufReader::new(file))
    }
}

impl<R: Read + Seek> FirmwareFile<R> {
    /// Builds a `FirmwareFile` from any seekable reader whose length isn't
    /// already known, by seeking to the end and back rather than requiring
    /// the caller to read the whole thing to find out how big it is.
    pub fn from_seekable(mut reader: R) -> Result<Self> {
        let file_len = reader
            .seek(SeekFrom::End(0))
            .map_err(|e| CoreError::format(format!("seek to end failed: {e}")))?;
        reader
            .seek(SeekFrom::Start(0))
            .map_err(|e| CoreError::format(format!("seek to start failed: {e}")))?;
        Self::from_reader(reader, file_len)
    }

    pub fn from_reader(mut reader: R, file_len: u64) -> Result<Self> {
        if file_len
            < FIRMWARE_MAGIC.len() as u64 + FIRMWARE_DESCRIPTION_SIZE as u64 + TILE_LENGTH as u64 + 4
        {
            return Err(CoreError::format(
                "firmware file is smaller than the fixed header",
            ));
        }

        let mut magic = [0u8; 24];
        reader
            .read_exact(&mut magic)
            .map_err(|e| CoreError::format(format!("failed to read magic: {e}")))?;
        if &magic != FIRMWARE_MAGIC {
            return Err(CoreError::format("bad firmware magic"));
        }

        let mut description = [0u8; FIRMWARE_DESCRIPTION_SIZE];
        reader
            .read_exact(&mut description)
            .map_err(|e| CoreError::format(format!("failed to read description: {e}")))?;
        // The wire format doesn't guarantee a null terminator if the label
        // fills all 40 bytes; force one so `description_str` never reads
        // past the field (spec.md §3: "last byte forced to zero after load").
        description[FIRMWARE_DESCRIPTION_SIZE - 1] = 0;

        let mut tile_bytes = vec![0u8; TILE_LENGTH];
        reader
            .read_exact(&mut tile_bytes)
            .map_err(|e| CoreError::format(format!("failed to read tile: {e}")))?;
        let tile = Tile::from_bytes(&tile_bytes)?;

        let parts_start = 24 + FIRMWARE_DESCRIPTION_SIZE as u64 + TILE_LENGTH as u64;

        Ok(Self {
            reader,
            header: FirmwareHeader { description, tile },
            parts_start,
            file_len,
            part_remaining: 0,
        })
    }

    pub fn header(&self) -> &FirmwareHeader {
        &self.header
    }

    /// Total size of the file, CRC trailer included.
    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    fn crc_offset(&self) -> u64 {
        self.file_len - 4
    }

    /// The stored trailing CRC-32, covering every byte before it.
    pub fn stored_crc(&mut self) -> Result<u32> {
        self.reader
            .seek(SeekFrom::Start(self.crc_offset()))
            .map_err(|e| CoreError::format(format!("seek to CRC trailer failed: {e}")))?;
        let mut buf = [0u8; 4];
        self.reader
            .read_exact(&mut buf)
            .map_err(|e| CoreError::format(format!("failed to read CRC trailer: {e}")))?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Streams the whole file except its final 4 bytes through a CRC-32 and
    /// compares against the stored trailer, 4 KiB at a time.
    pub fn verify_crc(&mut self) -> Result<()> {
        let expected = self.stored_crc()?;

        self.reader
            .seek(SeekFrom::Start(0))
            .map_err(|e| CoreError::format(format!("seek to start failed: {e}")))?;

        let mut hasher = Hasher::new();
        let mut remaining = self.crc_offset();
        let mut buf = [0u8; CRC_CHUNK];
        while remaining > 0 {
            let take = (buf.len() as u64).min(remaining) as usize;
            self.reader
                .read_exact(&mut buf[..take])
                .map_err(|e| CoreError::format(format!("failed reading during CRC check: {e}")))?;
            hasher.update(&buf[..take]);
            remaining -= take as u64;
        }
        let computed = hasher.finalize();

        if computed != expected {
            return Err(CoreError::Checksum { expected, computed });
        }
        // Leaves the reader at the CRC trailer; callers that go on to read
        // parts must reposition via `seek_to_parts`.
        Ok(())
    }

    /// Repositions the reader at the first part record, discarding any
    /// in-progress part's unread payload tracking.
    pub fn seek_to_parts(&mut self) -> Result<()> {
        self.reader
            .seek(SeekFrom::Start(self.parts_start))
            .map_err(|e| CoreError::format(format!("seek to parts failed: {e}")))?;
        self.part_remaining = 0;
        Ok(())
    }

    /// Reads the next part's descriptor and declared payload length `L`,
    /// skipping whatever of the previous part's payload the caller never
    /// read. Returns `Ok(None)` once the cursor reaches the CRC trailer.
    pub fn next_part(&mut self) -> Result<Option<PartHeader>> {
        if self.part_remaining > 0 {
            self.reader
                .seek(SeekFrom::Current(self.part_remaining as i64))
                .map_err(|e| CoreError::format(format!("failed skipping part payload: {e}")))?;
            self.part_remaining = 0;
        }

        let current = self
            .reader
            .stream_position()
            .map_err(|e| CoreError::format(format!("failed reading stream position: {e}")))?;
        if current >= self.crc_offset() {
            return Ok(None);
        }

        let mut descriptor_buf = [0u8; PartitionDescriptor::WIRE_SIZE];
        self.reader
            .read_exact(&mut descriptor_buf)
            .map_err(|e| CoreError::format(format!("failed reading part descriptor: {e}")))?;
        let descriptor = PartitionDescriptor::from_bytes(&descriptor_buf)?;

        let mut len_buf = [0u8; 4];
        self.reader
            .read_exact(&mut len_buf)
            .map_err(|e| CoreError::format(format!("failed reading part length: {e}")))?;
        let payload_length = u32::from_le_bytes(len_buf);

        let payload_end = current + PartitionDescriptor::WIRE_SIZE as u64 + 4 + payload_length as u64;
        if payload_end > self.crc_offset() {
            return Err(CoreError::format("part payload runs past the CRC trailer"));
        }

        self.part_remaining = payload_length;
        Ok(Some(PartHeader {
            descriptor,
            payload_length,
        }))
    }

    /// Reads up to `buf.len()` bytes of the current part's payload (as
    /// returned by the most recent [`FirmwareFile::next_part`]), returning
    /// `0` once the whole payload has been read.
    pub fn read_part_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        let take = (buf.len() as u32).min(self.part_remaining) as usize;
        if take == 0 {
            return Ok(0);
        }
        self.reader
            .read_exact(&mut buf[..take])
            .map_err(|e| CoreError::format(format!("failed reading part payload: {e}")))?;
        self.part_remaining -= take as u32;
        Ok(take)
    }

    /// Reads every part record and its payload into memory at once. Only
    /// meant for tests and other callers working with small, already-trusted
    /// inputs — the Installation Pipeline uses [`FirmwareFile::next_part`] /
    /// [`FirmwareFile::read_part_chunk`] directly so it never holds a whole
    /// payload in memory.
    pub fn read_parts(&mut self) -> Result<Vec<FirmwarePart>> {
        self.seek_to_parts()?;
        let mut parts = Vec::new();
        while let Some(header) = self.next_part()? {
            let mut data = vec![0u8; header.payload_length as usize];
            let mut filled = 0usize;
            while filled < data.len() {
                let n = self.read_part_chunk(&mut data[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            parts.push(FirmwarePart {
                descriptor: header.descriptor,
                data,
            });
        }
        Ok(parts)
    }

    /// Sum of every part's declared length, the flash footprint this
    /// firmware needs once installed. Reads only headers; payloads are
    /// skipped rather than loaded.
    pub fn total_size(&mut self) -> Result<u32> {
        self.seek_to_parts()?;
        let mut total = 0u32;
        while let Some(header) = self.next_part()? {
            total += header.descriptor.length;
        }
        Ok(total)
    }
}

/// Reads just the tile (thumbnail) of a `.fw` file, for listing UIs that
/// want a preview without committing to a full install. Unlike every other
/// reader in this module, this one never fails: a truncated file, a bad
/// magic, or any other mismatch yields a blank tile instead of an error, so
/// a single corrupt preview image never halts the picker UI (spec.md §4.4's
/// "default-bad-image policy").
pub fn preview_tile(path: impl AsRef<Path>) -> Tile {
    FirmwareFile::open(path)
        .map(|firmware| firmware.header().tile.clone())
        .unwrap_or_else(|_| Tile::blank())
}
