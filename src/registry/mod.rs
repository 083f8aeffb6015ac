//! The installed-app registry and its compactor.
//!
//! Every installed app gets one fixed-size [`AppDescriptor`] record, packed
//! densely (no holes) into the reserved `factory` partition. Removing an
//! app in the middle of the list would otherwise leave a gap in the flash
//! region the later apps occupy, so [`AppRegistry::remove`] also relocates
//! every app above the removed one down by the freed size, strictly
//! low-to-high, before rewriting the registry. That ordering is what makes
//! the relocation safe without a second buffer: a later app's source bytes
//! are always still at a higher address than any destination already
//! written this pass.

use serde::Serialize;

use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::flash::FlashIo;
use crate::partition_table::PartitionTableManager;
use crate::wire::{AppDescriptor, PartitionDescriptor, APP_MAGIC, FOUR_KIB};

/// JSON-friendly view of one registry slot, for `appforge inspect --json`
/// and anything else that wants machine-readable output instead of the
/// human-readable listing.
#[derive(Debug, Serialize)]
pub struct AppSummary {
    pub slot: usize,
    pub description: String,
    pub start_offset: u32,
    pub end_offset: u32,
    pub partition_labels: Vec<String>,
}

/// Bytes moved per read/write step while relocating app data during a
/// compaction. Mirrors a sector-sized working buffer rather than loading
/// an entire app's data into memory at once.
const RELOCATE_CHUNK: u32 = FOUR_KIB * 4;

/// The installed-app registry: a dense, in-memory mirror of the
/// `factory` partition's fixed-size record array.
pub struct AppRegistry {
    apps: Vec<AppDescriptor>,
    capacity: usize,
    partition_offset: u32,
    partition_size: u32,
}

impl AppRegistry {
    /// Reads every occupied slot out of the `factory` partition, stopping
    /// at the first free (`0xffff` magic) slot, matching the dense-array
    /// invariant: once created, a registry never has a free slot before an
    /// occupied one.
    pub fn load(flash: &mut impl FlashIo, table: &PartitionTableManager) -> Result<Self> {
        let factory = table
            .find("factory")
            .ok_or_else(|| CoreError::format("no factory-data partition in the live table"))?;
        let partition_offset = factory.offset;
        let partition_size = factory.size;
        let capacity = (partition_size as usize) / AppDescriptor::WIRE_SIZE;

        let mut apps = Vec::new();
        let mut buf = vec![0u8; AppDescriptor::WIRE_SIZE];
        for slot in 0..capacity {
            let offset = partition_offset + (slot * AppDescriptor::WIRE_SIZE) as u32;
            flash.read(offset, &mut buf)?;
            let descriptor = AppDescriptor::from_bytes(&buf)?;
            if !descriptor.occupied() {
                break;
            }
            apps.push(descriptor);
        }

        Ok(Self {
            apps,
            capacity,
            partition_offset,
            partition_size,
        })
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AppDescriptor> {
        self.apps.iter()
    }

    pub fn get(&self, index: usize) -> Option<&AppDescriptor> {
        self.apps.get(index)
    }

    pub fn find_by_description(&self, description: &str) -> Option<usize> {
        self.apps
            .iter()
            .position(|a| a.description_str() == description)
    }

    /// The next free flash byte past every installed app, or the start of
    /// the apps region if the registry is empty.
    pub fn allocation_frontier(&self, config: &Config) -> u32 {
        self.apps
            .iter()
            .map(|a| a.end_offset + 1)
            .max()
            .unwrap_or_else(|| config.apps_region_offset())
    }

    /// Appends a new app descriptor to the next free slot.
    pub fn append(&mut self, descriptor: AppDescriptor) -> Result<()> {
        if self.apps.len() >= self.capacity {
            return Err(CoreError::capacity(format!(
                "app registry is full ({} of {} slots used)",
                self.apps.len(),
                self.capacity
            )));
        }
        self.apps.push(descriptor);
        Ok(())
    }

    /// Removes the app at `index`, relocating every later app's flash data
    /// down to close the gap. Does not touch the live partition table: the
    /// table only ever reflects whichever single app was most recently
    /// installed or booted (spec.md §4.2, §4.6, §4.8), and the compactor
    /// (spec.md §4.7) never rewrites it — if the app currently live in the
    /// table happens to be one of the apps shifted here, its table entries
    /// go stale until the next install or `select_and_boot` rewrites them,
    /// matching the original firmware's behavior exactly.
    pub fn remove(&mut self, index: usize, flash: &mut impl FlashIo) -> Result<()> {
        if index >= self.apps.len() {
            return Err(CoreError::format(format!(
                "no app at registry slot {index}"
            )));
        }
        let removed = self.apps.remove(index);
        let removed_size = removed.end_offset - removed.start_offset + 1;

        for app in self.apps.iter_mut().skip(index) {
            let old_start = app.start_offset;
            let new_start = app.start_offset - removed_size;
            let new_end = app.end_offset - removed_size;
            let region_len = app.end_offset - app.start_offset + 1;

            relocate_region(flash, old_start, new_start, region_len)?;

            app.start_offset = new_start;
            app.end_offset = new_end;
        }

        Ok(())
    }

    /// Rewrites the whole registry array to the `factory` partition,
    /// padding every slot past the last occupied one with an all-`0xff`
    /// free marker. Always writes the full partition size, never a
    /// shrunk view of it, so a later [`AppRegistry::load`] still finds a
    /// clean free-slot boundary.
    pub fn persist(&self, flash: &mut impl FlashIo) -> Result<()> {
        let mut buf = vec![0xffu8; self.partition_size as usize];
        for (i, app) in self.apps.iter().enumerate() {
            let start = i * AppDescriptor::WIRE_SIZE;
            buf[start..start + AppDescriptor::WIRE_SIZE].copy_from_slice(&app.to_bytes());
        }
        flash.erase(self.partition_offset, self.partition_size)?;
        flash.write(self.partition_offset, &buf)?;
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Renders the whole registry as a JSON array of [`AppSummary`].
    pub fn to_json(&self) -> Result<String> {
        let summaries: Vec<AppSummary> = self
            .apps
            .iter()
            .enumerate()
            .map(|(slot, app)| AppSummary {
                slot,
                description: app.description_str(),
                start_offset: app.start_offset,
                end_offset: app.end_offset,
                partition_labels: app.parts.iter().map(|p| p.label_str()).collect(),
            })
            .collect();
        serde_json::to_string_pretty(&summaries)
            .map_err(|e| CoreError::format(format!("failed to serialize registry: {e}")))
    }
}

/// Moves `len` bytes from `src` to `dst` in `flash`, chunk by chunk,
/// erasing and rewriting the destination as it goes. Assumes `dst < src`
/// (a compaction always shifts toward lower addresses) so that within a
/// single app's relocation, reading ahead of the write cursor is always
/// reading data that hasn't been overwritten yet.
fn relocate_region(flash: &mut impl FlashIo, src: u32, dst: u32, len: u32) -> Result<()> {
    if dst >= src {
        return Err(CoreError::flash_io(
            "relocation destination must be below the source",
        ));
    }
    let mut done = 0u32;
    while done < len {
        let chunk = RELOCATE_CHUNK.min(len - done);
        let mut buf = vec![0u8; chunk as usize];
        flash.read(src + done, &mut buf)?;

        let erase_start = align_down(dst + done, FOUR_KIB);
        let erase_end = align_up_local(dst + done + chunk, FOUR_KIB);
        flash.erase(erase_start, erase_end - erase_start)?;
        flash.write(dst + done, &buf)?;

        done += chunk;
    }
    Ok(())
}

fn align_down(value: u32, align: u32) -> u32 {
    value & !(align - 1)
}

fn align_up_local(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::FileBackedFlash;
    use crate::wire::Tile;
    use tempfile::tempdir;

    fn setup() -> (FileBackedFlash, PartitionTableManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flash.img");
        let mut flash = FileBackedFlash::create(&path, 4 * 1024 * 1024).unwrap();
        let table = PartitionTableManager::bootstrap(&Config::default());
        table.persist(&mut flash).unwrap();
        (flash, table, dir)
    }

    fn descriptor(start: u32, end: u32, desc: &str, part_len: u32) -> AppDescriptor {
        let mut description = [0u8; 40];
        description[..desc.len()].copy_from_slice(desc.as_bytes());
        AppDescriptor {
            magic: APP_MAGIC,
            start_offset: start,
            end_offset: end,
            description,
            parts: vec![PartitionDescriptor::new(0x00, 0x00, "app", 0, part_len)],
            tile: Tile::blank(),
        }
    }

    #[test]
    fn append_then_persist_then_load_roundtrips() {
        let (mut flash, table, _dir) = setup();
        let mut registry = AppRegistry::load(&mut flash, &table).unwrap();
        assert!(registry.is_empty());

        registry
            .append(descriptor(0x20000, 0x2ffff, "one", 0x10000))
            .unwrap();
        registry.persist(&mut flash).unwrap();

        let reloaded = AppRegistry::load(&mut flash, &table).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get(0).unwrap().description_str(), "one");
    }

    #[test]
    fn allocation_frontier_starts_at_apps_region_when_empty() {
        let (mut flash, table, _dir) = setup();
        let registry = AppRegistry::load(&mut flash, &table).unwrap();
        let config = Config::default();
        assert_eq!(registry.allocation_frontier(&config), config.apps_region_offset());
    }

    #[test]
    fn allocation_frontier_follows_last_app() {
        let (mut flash, table, _dir) = setup();
        let mut registry = AppRegistry::load(&mut flash, &table).unwrap();
        registry
            .append(descriptor(0x20000, 0x2ffff, "one", 0x10000))
            .unwrap();
        let config = Config::default();
        assert_eq!(registry.allocation_frontier(&config), 0x30000);
    }

    #[test]
    fn remove_compacts_later_apps_down() {
        let (mut flash, table, _dir) = setup();
        let mut registry = AppRegistry::load(&mut flash, &table).unwrap();

        registry
            .append(descriptor(0x20000, 0x2ffff, "first", 0x10000))
            .unwrap();
        registry
            .append(descriptor(0x30000, 0x3ffff, "second", 0x10000))
            .unwrap();
        registry.persist(&mut flash).unwrap();

        flash.write(0x30000, b"second-app-data").unwrap();

        registry.remove(0, &mut flash).unwrap();
        registry.persist(&mut flash).unwrap();

        assert_eq!(registry.len(), 1);
        let remaining = registry.get(0).unwrap();
        assert_eq!(remaining.description_str(), "second");
        assert_eq!(remaining.start_offset, 0x20000);

        let mut buf = [0u8; 15];
        flash.read(0x20000, &mut buf).unwrap();
        assert_eq!(&buf, b"second-app-data");
    }

    /// Removing the last app is a fast path: nothing above it needs
    /// relocating, so the earlier app's bytes and offsets never move.
    #[test]
    fn remove_last_app_moves_nothing() {
        let (mut flash, table, _dir) = setup();
        let mut registry = AppRegistry::load(&mut flash, &table).unwrap();

        registry
            .append(descriptor(0x20000, 0x2ffff, "first", 0x10000))
            .unwrap();
        registry
            .append(descriptor(0x30000, 0x3ffff, "second", 0x10000))
            .unwrap();
        registry.persist(&mut flash).unwrap();
        flash.write(0x20000, b"first-app-data!").unwrap();

        registry.remove(1, &mut flash).unwrap();
        registry.persist(&mut flash).unwrap();

        assert_eq!(registry.len(), 1);
        let remaining = registry.get(0).unwrap();
        assert_eq!(remaining.description_str(), "first");
        assert_eq!(remaining.start_offset, 0x20000);
        assert_eq!(remaining.end_offset, 0x2ffff);

        let mut buf = [0u8; 15];
        flash.read(0x20000, &mut buf).unwrap();
        assert_eq!(&buf, b"first-app-data!");

        let config = Config::default();
        assert_eq!(registry.allocation_frontier(&config), 0x30000);
    }

    /// Install-then-uninstall idempotence: appending an app and removing it
    /// by index again (interior case, since it's the only one) restores the
    /// registry's prior shape exactly.
    #[test]
    fn append_then_remove_is_idempotent() {
        let (mut flash, table, _dir) = setup();
        let mut registry = AppRegistry::load(&mut flash, &table).unwrap();
        let config = Config::default();
        let frontier_before = registry.allocation_frontier(&config);

        registry
            .append(descriptor(0x20000, 0x2ffff, "first", 0x10000))
            .unwrap();
        assert_eq!(registry.len(), 1);

        let idx = registry.find_by_description("first").unwrap();
        registry.remove(idx, &mut flash).unwrap();

        assert!(registry.is_empty());
        assert_eq!(registry.allocation_frontier(&config), frontier_before);
    }
}
