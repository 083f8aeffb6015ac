//! Reads and rewrites the live ESP-style partition table stored at a fixed
//! flash offset.
//!
//! The table itself is a flat array of 32-byte entries terminated by the
//! first all-`0xff` (empty) slot; [`esp_idf_part`] already knows this
//! format and is reused here for CSV/inspection output, while the raw
//! read/rewrite path goes through [`crate::wire::PartitionTableEntry`]
//! directly so the exact on-flash bytes are under our control.

use esp_idf_part::{AppType, DataType, Partition, PartitionTable, SubType, Type};

use crate::config::{defaults, Config};
use crate::error::{CoreError, Result};
use crate::flash::FlashIo;
use crate::wire::{
    align_up, PartitionDescriptor, PartitionTableEntry, ESP_PARTITION_MAGIC, FOUR_KIB,
    PART_SUBTYPE_FACTORY_DATA,
};

const MAX_ENTRIES: usize = (defaults::PARTITION_TABLE_SIZE / PartitionTableEntry::WIRE_SIZE as u32) as usize;

/// The live partition table, held in memory and rewritten to flash as a
/// whole on every mutation (matching how the original firmware only ever
/// replaces the table, never patches a single entry in place).
#[derive(Debug, Clone)]
pub struct PartitionTableManager {
    entries: Vec<PartitionTableEntry>,
}

impl PartitionTableManager {
    /// Builds the fixed set of system partitions (bootloader is not itself
    /// a table entry; nvs, factory-data and the partition table's own
    /// reserved region are) that every installation starts with. Apps (and
    /// the optional trailing `utility` partition one of them may carry) are
    /// added on top of this by the Installation Pipeline.
    pub fn bootstrap(_config: &Config) -> Self {
        let entries = vec![
            PartitionTableEntry {
                magic: ESP_PARTITION_MAGIC,
                ty: 0x01, // data
                subtype: 0x02, // nvs
                offset: defaults::NVS_OFFSET,
                size: defaults::NVS_SIZE,
                label: label(b"nvs"),
                flags: 0,
            },
            PartitionTableEntry {
                magic: ESP_PARTITION_MAGIC,
                ty: 0x01,
                subtype: PART_SUBTYPE_FACTORY_DATA,
                offset: defaults::FACTORY_DATA_OFFSET,
                size: defaults::FACTORY_DATA_SIZE,
                label: label(b"factory"),
                flags: 0,
            },
        ];
        Self { entries }
    }

    /// Reads the table at its fixed offset from `flash`.
    pub fn load(flash: &mut impl FlashIo) -> Result<Self> {
        let mut buf = vec![0u8; defaults::PARTITION_TABLE_SIZE as usize];
        flash.read(defaults::PARTITION_TABLE_OFFSET, &mut buf)?;

        let mut entries = Vec::new();
        for chunk in buf.chunks_exact(PartitionTableEntry::WIRE_SIZE) {
            let entry = PartitionTableEntry::from_bytes(chunk)?;
            if entry.is_empty_slot() {
                break;
            }
            if !entry.is_valid() {
                return Err(CoreError::format(format!(
                    "partition table entry at flash offset has bad magic {:#06x}",
                    entry.magic
                )));
            }
            entries.push(entry);
        }
        Ok(Self { entries })
    }

    /// Writes the table back out, zero-padding unused slots with
    /// all-`0xff` empty entries exactly as the original layout expects.
    pub fn persist(&self, flash: &mut impl FlashIo) -> Result<()> {
        if self.entries.len() > MAX_ENTRIES {
            return Err(CoreError::capacity(format!(
                "partition table has {} entries, table region holds at most {}",
                self.entries.len(),
                MAX_ENTRIES
            )));
        }
        let mut buf = vec![0xffu8; defaults::PARTITION_TABLE_SIZE as usize];
        for (i, entry) in self.entries.iter().enumerate() {
            let start = i * PartitionTableEntry::WIRE_SIZE;
            buf[start..start + PartitionTableEntry::WIRE_SIZE].copy_from_slice(&entry.to_bytes());
        }
        // The table's logical region (0xC00 bytes) is smaller than flash's
        // 4 KiB erase granularity. `PARTITION_TABLE_OFFSET` is sector-aligned,
        // so erase the whole sector but only write back the logical region;
        // the rest of the sector is left erased.
        flash.erase(defaults::PARTITION_TABLE_OFFSET, FOUR_KIB)?;
        flash.write(defaults::PARTITION_TABLE_OFFSET, &buf)?;
        Ok(())
    }

    pub fn entries(&self) -> &[PartitionTableEntry] {
        &self.entries
    }

    pub fn find(&self, label: &str) -> Option<&PartitionTableEntry> {
        self.entries.iter().find(|e| e.label_str() == label)
    }

    /// Index of the first mutable slot: the entry right after `factory`.
    /// Everything before this is a fixed system partition (nvs, factory-data)
    /// that no app installation or boot selection ever touches.
    fn start_table_entry(&self) -> usize {
        self.entries
            .iter()
            .position(|e| e.label_str() == "factory")
            .map(|i| i + 1)
            .unwrap_or(self.entries.len())
    }

    /// Blanks every entry from [`Self::start_table_entry`] onward and
    /// replaces them with `parts`, laid out back-to-back starting at
    /// `base_offset`. This is the table's only mutation: at any moment the
    /// mutable region reflects exactly one app's partitions — whichever one
    /// was most recently installed or selected to boot — never a union of
    /// every app ever installed.
    pub fn rewrite(&mut self, parts: &[PartitionDescriptor], base_offset: u32) -> Result<()> {
        let start = self.start_table_entry();
        if start + parts.len() > MAX_ENTRIES {
            return Err(CoreError::capacity(format!(
                "{} partitions would not fit in the {} table slots left after the system entries",
                parts.len(),
                MAX_ENTRIES - start
            )));
        }
        self.entries.truncate(start);
        let mut offset = base_offset;
        for part in parts {
            self.entries.push(PartitionTableEntry {
                magic: ESP_PARTITION_MAGIC,
                ty: part.ty,
                subtype: part.subtype,
                offset,
                size: part.length,
                label: part.label,
                flags: part.flags,
            });
            offset += part.length;
        }
        Ok(())
    }

    /// Renders the table via `esp-idf-part` for human-readable inspection
    /// (`appforge inspect`), independent of our own raw codec.
    pub fn to_csv(&self) -> Result<String> {
        let partitions: Vec<Partition> = self
            .entries
            .iter()
            .filter_map(|e| to_esp_idf_partition(e).ok())
            .collect();
        let table = PartitionTable::new(partitions);
        table
            .to_csv()
            .map_err(|e| CoreError::format(format!("failed to render partition table: {e}")))
    }
}

fn label(name: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..name.len()].copy_from_slice(name);
    out
}

fn to_esp_idf_partition(entry: &PartitionTableEntry) -> Result<Partition> {
    let ty = match entry.ty {
        0x00 => Type::App,
        0x01 => Type::Data,
        other => return Err(CoreError::format(format!("unknown partition type {other:#04x}"))),
    };
    let subtype = match (ty, entry.subtype) {
        (Type::App, 0x00) => SubType::App(AppType::Factory),
        (Type::Data, 0x02) => SubType::Data(DataType::Nvs),
        (Type::Data, PART_SUBTYPE_FACTORY_DATA) => SubType::Data(DataType::Undefined),
        (Type::Data, other) => SubType::Data(DataType::Custom(other)),
        (Type::App, other) => SubType::App(AppType::Custom(other)),
    };
    Ok(Partition::new(
        entry.label_str(),
        ty,
        subtype,
        entry.offset,
        entry.size,
        esp_idf_part::Flags::empty(),
    ))
}

/// Rounds an offset up to the next app-alignment boundary.
pub fn align_to_app_boundary(offset: u32) -> u32 {
    align_up(offset, defaults::APP_ALIGNMENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::FileBackedFlash;
    use tempfile::tempdir;

    #[test]
    fn persist_then_load_roundtrips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flash.img");
        let mut flash = FileBackedFlash::create(&path, 4 * 1024 * 1024).unwrap();

        let mut table = PartitionTableManager::bootstrap(&Config::default());
        table
            .rewrite(&[PartitionDescriptor::new(0x00, 0x00, "app0", 0, 0x10000)], 0x20000)
            .unwrap();
        table.persist(&mut flash).unwrap();

        let loaded = PartitionTableManager::load(&mut flash).unwrap();
        assert_eq!(loaded.entries().len(), 3);
        assert!(loaded.find("app0").is_some());
    }

    #[test]
    fn rewrite_replaces_whatever_app_was_previously_live() {
        let mut table = PartitionTableManager::bootstrap(&Config::default());
        table
            .rewrite(&[PartitionDescriptor::new(0x00, 0x00, "app0", 0, 0x10000)], 0x20000)
            .unwrap();
        assert!(table.find("app0").is_some());

        table
            .rewrite(&[PartitionDescriptor::new(0x00, 0x00, "app1", 0, 0x10000)], 0x20000)
            .unwrap();
        assert!(table.find("app0").is_none());
        assert!(table.find("app1").is_some());
        // The fixed system entries survive every rewrite.
        assert!(table.find("nvs").is_some());
        assert!(table.find("factory").is_some());
    }

    #[test]
    fn rewrite_lays_out_multiple_parts_back_to_back() {
        let mut table = PartitionTableManager::bootstrap(&Config::default());
        table
            .rewrite(
                &[
                    PartitionDescriptor::new(0x00, 0x00, "boot", 0, 0x10000),
                    PartitionDescriptor::new(0x01, 0x00, "data", 0, 0x20000),
                ],
                0x20000,
            )
            .unwrap();
        assert_eq!(table.find("boot").unwrap().offset, 0x20000);
        assert_eq!(table.find("data").unwrap().offset, 0x30000);
    }

    #[test]
    fn rewrite_is_deterministic() {
        let mut table_a = PartitionTableManager::bootstrap(&Config::default());
        let mut table_b = PartitionTableManager::bootstrap(&Config::default());
        let part = PartitionDescriptor::new(0x00, 0x00, "app0", 0, 0x10000);
        table_a.rewrite(&[part.clone()], 0x20000).unwrap();
        table_b.rewrite(&[part], 0x20000).unwrap();

        let dir = tempdir().unwrap();
        let mut flash_a = FileBackedFlash::create(&dir.path().join("a.img"), 4 * 1024 * 1024).unwrap();
        let mut flash_b = FileBackedFlash::create(&dir.path().join("b.img"), 4 * 1024 * 1024).unwrap();
        table_a.persist(&mut flash_a).unwrap();
        table_b.persist(&mut flash_b).unwrap();

        let mut sector_a = vec![0u8; defaults::PARTITION_TABLE_SIZE as usize];
        let mut sector_b = vec![0u8; defaults::PARTITION_TABLE_SIZE as usize];
        flash_a.read(defaults::PARTITION_TABLE_OFFSET, &mut sector_a).unwrap();
        flash_b.read(defaults::PARTITION_TABLE_OFFSET, &mut sector_b).unwrap();
        assert_eq!(sector_a, sector_b);
    }

    #[test]
    fn align_to_app_boundary_rounds_to_64k() {
        assert_eq!(align_to_app_boundary(0x20001), 0x30000);
        assert_eq!(align_to_app_boundary(0x20000), 0x20000);
    }
}
