//! On-wire and on-flash binary layouts.
//!
//! These are hand-written packed codecs rather than `#[repr(C)]` structs cast
//! over raw bytes: several fields (descriptions, labels, tiles) are
//! fixed-size byte arrays that need explicit null-termination handling, and
//! a couple of the records mix field widths in a way that Rust's native
//! struct layout would silently pad. Every offset below is the one the
//! device's bootloader expects; get it wrong and an existing on-flash
//! registry stops parsing.

use crate::error::{CoreError, Result};

/// Magic bytes at the start of every `.fw` firmware container (24 bytes,
/// not null-terminated on the wire).
pub const FIRMWARE_MAGIC: &[u8; 24] = b"ODROIDGO_FIRMWARE_V00_01";

pub const FIRMWARE_DESCRIPTION_SIZE: usize = 40;
pub const TILE_WIDTH: usize = 86;
pub const TILE_HEIGHT: usize = 48;
pub const TILE_LENGTH: usize = TILE_WIDTH * TILE_HEIGHT * 2;
pub const PARTS_MAX: usize = 20;

/// Marks an occupied app-registry slot.
pub const APP_MAGIC: u16 = 0x1205;
/// Marks a free app-registry slot (erased flash).
pub const APP_MAGIC_FREE: u16 = 0xffff;

/// Marks a valid partition-table entry.
pub const ESP_PARTITION_MAGIC: u16 = 0x50AA;
/// Marks an empty partition-table entry (erased flash).
pub const ESP_PARTITION_MAGIC_EMPTY: u16 = 0xffff;

pub const PART_SUBTYPE_FACTORY_DATA: u8 = 0xFE;
pub const PART_TYPE_DATA: u8 = 0x01;
pub const PART_TYPE_APP: u8 = 0x00;
/// ESP-IDF's `APP_TEST` subtype, used for the optional `utility.bin`
/// passthrough partition (spec.md §4.6 step 7).
pub const PART_SUBTYPE_APP_TEST: u8 = 0x20;

pub const SIXTY_FOUR_KIB: u32 = 0x10000;
pub const FOUR_KIB: u32 = 0x1000;

/// A single partition record inside a `.fw` container (28 bytes on the
/// wire): `type(1) | subtype(1) | reserved(2) | label(16) | flags(4 LE) |
/// length(4 LE)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDescriptor {
    pub ty: u8,
    pub subtype: u8,
    pub label: [u8; 16],
    pub flags: u32,
    pub length: u32,
}

impl PartitionDescriptor {
    pub const WIRE_SIZE: usize = 28;

    pub fn new(ty: u8, subtype: u8, label: &str, flags: u32, length: u32) -> Self {
        let mut label_bytes = [0u8; 16];
        for (dst, src) in label_bytes.iter_mut().zip(label.as_bytes()) {
            *dst = *src;
        }
        Self {
            ty,
            subtype,
            label: label_bytes,
            flags,
            length,
        }
    }

    pub fn label_str(&self) -> String {
        let end = self.label.iter().position(|&b| b == 0).unwrap_or(16);
        String::from_utf8_lossy(&self.label[..end]).into_owned()
    }

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        out[0] = self.ty;
        out[1] = self.subtype;
        // bytes 2..4 reserved, left zero
        out[4..20].copy_from_slice(&self.label);
        out[20..24].copy_from_slice(&self.flags.to_le_bytes());
        out[24..28].copy_from_slice(&self.length.to_le_bytes());
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(CoreError::format(format!(
                "partition descriptor truncated: {} bytes, need {}",
                buf.len(),
                Self::WIRE_SIZE
            )));
        }
        let mut label = [0u8; 16];
        label.copy_from_slice(&buf[4..20]);
        Ok(Self {
            ty: buf[0],
            subtype: buf[1],
            label,
            flags: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            length: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
        })
    }
}

/// An 86x48 RGB565 thumbnail, stored little-endian on the wire.
#[derive(Clone, PartialEq, Eq)]
pub struct Tile(pub Vec<u8>);

impl Tile {
    pub fn blank() -> Self {
        Tile(vec![0xff; TILE_LENGTH])
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != TILE_LENGTH {
            return Err(CoreError::format(format!(
                "tile is {} bytes, expected {}",
                buf.len(),
                TILE_LENGTH
            )));
        }
        Ok(Tile(buf.to_vec()))
    }

    pub fn pixels(&self) -> Vec<u16> {
        self.0
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect()
    }
}

impl std::fmt::Debug for Tile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tile({} bytes)", self.0.len())
    }
}

/// A fixed-size app-registry record, exactly as stored in the factory-data
/// partition. Field order and sizes below must not change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDescriptor {
    pub magic: u16,
    pub start_offset: u32,
    /// Inclusive last byte owned by this app.
    pub end_offset: u32,
    pub description: [u8; FIRMWARE_DESCRIPTION_SIZE],
    pub parts: Vec<PartitionDescriptor>,
    pub tile: Tile,
}

impl AppDescriptor {
    /// magic(2) + start(4) + end(4) + description(40) + parts(20*28) +
    /// parts_count(1) + tile(8256) + reserved(256)
    pub const WIRE_SIZE: usize = 2
        + 4
        + 4
        + FIRMWARE_DESCRIPTION_SIZE
        + PARTS_MAX * PartitionDescriptor::WIRE_SIZE
        + 1
        + TILE_LENGTH
        + 256;

    pub fn occupied(&self) -> bool {
        self.magic == APP_MAGIC
    }

    pub fn description_str(&self) -> String {
        let end = self
            .description
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(FIRMWARE_DESCRIPTION_SIZE);
        String::from_utf8_lossy(&self.description[..end]).into_owned()
    }

    pub fn free_slot() -> [u8; Self::WIRE_SIZE] {
        [0xffu8; Self::WIRE_SIZE]
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; Self::WIRE_SIZE];
        let mut off = 0;
        out[off..off + 2].copy_from_slice(&self.magic.to_le_bytes());
        off += 2;
        out[off..off + 4].copy_from_slice(&self.start_offset.to_le_bytes());
        off += 4;
        out[off..off + 4].copy_from_slice(&self.end_offset.to_le_bytes());
        off += 4;
        out[off..off + FIRMWARE_DESCRIPTION_SIZE].copy_from_slice(&self.description);
        off += FIRMWARE_DESCRIPTION_SIZE;

        for i in 0..PARTS_MAX {
            let part_bytes = if i < self.parts.len() {
                self.parts[i].to_bytes()
            } else {
                [0xffu8; PartitionDescriptor::WIRE_SIZE]
            };
            out[off..off + PartitionDescriptor::WIRE_SIZE].copy_from_slice(&part_bytes);
            off += PartitionDescriptor::WIRE_SIZE;
        }

        out[off] = self.parts.len() as u8;
        off += 1;

        out[off..off + TILE_LENGTH].copy_from_slice(&self.tile.0);
        off += TILE_LENGTH;

        // remaining 256 bytes are reserved padding, already zeroed.
        debug_assert_eq!(off + 256, Self::WIRE_SIZE);

        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(CoreError::format(format!(
                "app descriptor truncated: {} bytes, need {}",
                buf.len(),
                Self::WIRE_SIZE
            )));
        }
        let mut off = 0;
        let magic = u16::from_le_bytes(buf[off..off + 2].try_into().unwrap());
        off += 2;
        let start_offset = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let end_offset = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let mut description = [0u8; FIRMWARE_DESCRIPTION_SIZE];
        description.copy_from_slice(&buf[off..off + FIRMWARE_DESCRIPTION_SIZE]);
        off += FIRMWARE_DESCRIPTION_SIZE;

        let mut all_parts = Vec::with_capacity(PARTS_MAX);
        for _ in 0..PARTS_MAX {
            all_parts.push(PartitionDescriptor::from_bytes(
                &buf[off..off + PartitionDescriptor::WIRE_SIZE],
            )?);
            off += PartitionDescriptor::WIRE_SIZE;
        }

        let parts_count = buf[off] as usize;
        off += 1;

        let tile = Tile::from_bytes(&buf[off..off + TILE_LENGTH])?;
        off += TILE_LENGTH;
        debug_assert_eq!(off + 256, Self::WIRE_SIZE);

        let parts_count = parts_count.min(PARTS_MAX);
        all_parts.truncate(parts_count);

        Ok(Self {
            magic,
            start_offset,
            end_offset,
            description,
            parts: all_parts,
            tile,
        })
    }
}

/// A single entry in the live ESP-style partition table (32 bytes):
/// `magic(2 LE) | type(1) | subtype(1) | offset(4 LE) | size(4 LE) |
/// label(16) | flags(4 LE)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTableEntry {
    pub magic: u16,
    pub ty: u8,
    pub subtype: u8,
    pub offset: u32,
    pub size: u32,
    pub label: [u8; 16],
    pub flags: u32,
}

impl PartitionTableEntry {
    pub const WIRE_SIZE: usize = 32;

    pub fn empty() -> Self {
        Self {
            magic: ESP_PARTITION_MAGIC_EMPTY,
            ty: 0xff,
            subtype: 0xff,
            offset: 0xffff_ffff,
            size: 0xffff_ffff,
            label: [0xff; 16],
            flags: 0xffff_ffff,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == ESP_PARTITION_MAGIC
    }

    pub fn is_empty_slot(&self) -> bool {
        self.magic == ESP_PARTITION_MAGIC_EMPTY
    }

    pub fn label_str(&self) -> String {
        let end = self.label.iter().position(|&b| b == 0).unwrap_or(16);
        String::from_utf8_lossy(&self.label[..end]).into_owned()
    }

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0xffu8; Self::WIRE_SIZE];
        out[0..2].copy_from_slice(&self.magic.to_le_bytes());
        out[2] = self.ty;
        out[3] = self.subtype;
        out[4..8].copy_from_slice(&self.offset.to_le_bytes());
        out[8..12].copy_from_slice(&self.size.to_le_bytes());
        out[12..28].copy_from_slice(&self.label);
        out[28..32].copy_from_slice(&self.flags.to_le_bytes());
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(CoreError::format(format!(
                "partition-table entry truncated: {} bytes, need {}",
                buf.len(),
                Self::WIRE_SIZE
            )));
        }
        let magic = u16::from_le_bytes(buf[0..2].try_into().unwrap());
        let mut label = [0u8; 16];
        label.copy_from_slice(&buf[12..28]);
        Ok(Self {
            magic,
            ty: buf[2],
            subtype: buf[3],
            offset: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            size: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            label,
            flags: u32::from_le_bytes(buf[28..32].try_into().unwrap()),
        })
    }
}

/// Rounds `value` up to the next multiple of `align` (`align` must be a
/// power of two).
pub fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_descriptor_roundtrip() {
        let d = PartitionDescriptor::new(0x00, 0x10, "app0", 0, 0x10000);
        let bytes = d.to_bytes();
        assert_eq!(bytes.len(), PartitionDescriptor::WIRE_SIZE);
        let back = PartitionDescriptor::from_bytes(&bytes).unwrap();
        assert_eq!(d, back);
        assert_eq!(back.label_str(), "app0");
    }

    #[test]
    fn app_descriptor_roundtrip_with_parts() {
        let app = AppDescriptor {
            magic: APP_MAGIC,
            start_offset: 0x20000,
            end_offset: 0x2ffff,
            description: {
                let mut d = [0u8; FIRMWARE_DESCRIPTION_SIZE];
                d[..4].copy_from_slice(b"TEST");
                d
            },
            parts: vec![PartitionDescriptor::new(0x00, 0x10, "app0", 0, 0x10000)],
            tile: Tile::blank(),
        };
        let bytes = app.to_bytes();
        assert_eq!(bytes.len(), AppDescriptor::WIRE_SIZE);
        let back = AppDescriptor::from_bytes(&bytes).unwrap();
        assert_eq!(back.description_str(), "TEST");
        assert_eq!(back.parts.len(), 1);
        assert_eq!(back.start_offset, 0x20000);
        assert_eq!(back.end_offset, 0x2ffff);
    }

    #[test]
    fn app_descriptor_free_slot_is_all_ff() {
        let slot = AppDescriptor::free_slot();
        assert!(slot.iter().all(|&b| b == 0xff));
        let parsed = AppDescriptor::from_bytes(&slot).unwrap();
        assert_eq!(parsed.magic, APP_MAGIC_FREE);
        assert!(!parsed.occupied());
    }

    #[test]
    fn partition_table_entry_roundtrip() {
        let e = PartitionTableEntry {
            magic: ESP_PARTITION_MAGIC,
            ty: 0x00,
            subtype: 0x10,
            offset: 0x20000,
            size: 0x10000,
            label: {
                let mut l = [0u8; 16];
                l[..4].copy_from_slice(b"app0");
                l
            },
            flags: 0,
        };
        let bytes = e.to_bytes();
        let back = PartitionTableEntry::from_bytes(&bytes).unwrap();
        assert_eq!(e, back);
        assert!(back.is_valid());
    }

    #[test]
    fn align_up_rounds_to_64k() {
        assert_eq!(align_up(0, SIXTY_FOUR_KIB), 0);
        assert_eq!(align_up(1, SIXTY_FOUR_KIB), SIXTY_FOUR_KIB);
        assert_eq!(align_up(SIXTY_FOUR_KIB, SIXTY_FOUR_KIB), SIXTY_FOUR_KIB);
        assert_eq!(align_up(SIXTY_FOUR_KIB + 1, SIXTY_FOUR_KIB), 2 * SIXTY_FOUR_KIB);
    }
}
