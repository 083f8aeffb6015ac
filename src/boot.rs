//! Selecting and handing off to an installed app.
//!
//! Booting is a two-phase commit: the live partition table is rewritten to
//! the chosen app's parts (spec.md §4.8 step 1, same `rewrite` the
//! Installation Pipeline uses at commit time), the chosen app's boot
//! partition is recorded through [`Platform::set_boot_partition`], the live
//! partition table is reloaded so the confirmation step sees current state,
//! and only then does the platform restart into it. Anything that fails
//! before the restart leaves the previous boot target untouched.

use log::warn;

use crate::device::Device;
use crate::error::{CoreError, Result};
use crate::flash::FlashIo;
use crate::platform::Platform;
use crate::wire::AppDescriptor;

/// Picks the app at `slot` out of the device's registry and hands off to it
/// through `platform`.
pub struct BootSelector;

impl BootSelector {
    /// Looks up the app descriptor at `slot`, makes its parts the live
    /// partition table, finds its primary ("app" type) partition, and boots
    /// it.
    pub fn select_and_boot<F: FlashIo>(
        device: &mut Device<F>,
        platform: &mut dyn Platform,
        slot: usize,
    ) -> Result<()> {
        let app = device
            .registry
            .get(slot)
            .ok_or_else(|| CoreError::format(format!("no app at registry slot {slot}")))?
            .clone();

        device.table.rewrite(&app.parts, app.start_offset)?;
        device.table.persist(&mut device.flash)?;
        device.flash.flush()?;

        let label = primary_partition_label(&app)?;

        // `set_boot_partition` already persisted the pending target to the
        // RTC-backed flag, so a platform with no live-reload hook still
        // finishes the handoff correctly: the cold boot that follows
        // `restart` re-applies the flag before the main UI starts (the
        // two-phase commit of spec.md §9), it just can't take effect without
        // the restart.
        platform.set_boot_partition(&label)?;
        if platform.reload_partition_table()? {
            // Live reload already applied it; nothing left for a cold start
            // to redo.
            platform.clear_pending_boot()?;
        } else {
            warn!(
                "live partition-table reload unavailable; '{label}' stays pending until the next cold start re-applies it"
            );
        }
        platform.restart()
    }
}

fn primary_partition_label(app: &AppDescriptor) -> Result<String> {
    app.parts
        .iter()
        .find(|p| p.ty == 0x00)
        .map(|p| p.label_str())
        .ok_or_else(|| CoreError::format("app has no bootable (type=app) partition"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::flash::FileBackedFlash;
    use crate::platform::NoopPlatform;
    use crate::wire::{PartitionDescriptor, Tile, APP_MAGIC};
    use tempfile::tempdir;

    #[test]
    fn boots_the_apps_primary_partition() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flash.img");
        let config = Config {
            flash_image: path.clone(),
            ..Config::default()
        };
        let flash = FileBackedFlash::create(&path, config.flash_size.size_bytes()).unwrap();
        let mut device = Device::provision(flash, config).unwrap();

        let mut description = [0u8; 40];
        description[..4].copy_from_slice(b"GAME");
        device
            .registry
            .append(AppDescriptor {
                magic: APP_MAGIC,
                start_offset: 0x120000,
                end_offset: 0x12ffff,
                description,
                parts: vec![PartitionDescriptor::new(0x00, 0x00, "app0", 0, 0x10000)],
                tile: Tile::blank(),
            })
            .unwrap();

        let mut platform = NoopPlatform::default();
        BootSelector::select_and_boot(&mut device, &mut platform, 0).unwrap();

        assert_eq!(platform.last_boot_partition, Some("app0".to_string()));
        assert!(platform.restarted);
        assert_eq!(device.table.find("app0").unwrap().offset, 0x120000);
    }

    /// Selecting a second app replaces the first one's entry in the live
    /// table rather than appending alongside it — the table only ever
    /// reflects whichever app was most recently selected to boot.
    #[test]
    fn selecting_a_different_app_replaces_the_previous_live_entry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flash.img");
        let config = Config {
            flash_image: path.clone(),
            ..Config::default()
        };
        let flash = FileBackedFlash::create(&path, config.flash_size.size_bytes()).unwrap();
        let mut device = Device::provision(flash, config).unwrap();

        for (label, start) in [("app0", 0x120000u32), ("app1", 0x130000u32)] {
            device
                .registry
                .append(AppDescriptor {
                    magic: APP_MAGIC,
                    start_offset: start,
                    end_offset: start + 0xffff,
                    description: [0u8; 40],
                    parts: vec![PartitionDescriptor::new(0x00, 0x00, label, 0, 0x10000)],
                    tile: Tile::blank(),
                })
                .unwrap();
        }

        let mut platform = NoopPlatform::default();
        BootSelector::select_and_boot(&mut device, &mut platform, 0).unwrap();
        assert!(device.table.find("app0").is_some());

        BootSelector::select_and_boot(&mut device, &mut platform, 1).unwrap();
        assert!(device.table.find("app0").is_none());
        assert!(device.table.find("app1").is_some());
    }

    /// When the platform reports it couldn't live-reload, the pending boot
    /// flag must stay set so a cold start can finish the job — this is the
    /// only path in spec.md §4.8 step 4 that leaves the flag behind.
    #[test]
    fn a_failed_live_reload_leaves_the_pending_flag_set() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flash.img");
        let config = Config {
            flash_image: path.clone(),
            ..Config::default()
        };
        let flash = FileBackedFlash::create(&path, config.flash_size.size_bytes()).unwrap();
        let mut device = Device::provision(flash, config).unwrap();

        let mut description = [0u8; 40];
        description[..4].copy_from_slice(b"GAME");
        device
            .registry
            .append(AppDescriptor {
                magic: APP_MAGIC,
                start_offset: 0x120000,
                end_offset: 0x12ffff,
                description,
                parts: vec![PartitionDescriptor::new(0x00, 0x00, "app0", 0, 0x10000)],
                tile: Tile::blank(),
            })
            .unwrap();

        let mut platform = NoopPlatform {
            reload_succeeds: false,
            ..Default::default()
        };
        BootSelector::select_and_boot(&mut device, &mut platform, 0).unwrap();

        assert_eq!(
            platform.pending_boot_partition().unwrap(),
            Some("app0".to_string())
        );
        assert!(platform.restarted);
    }

    #[test]
    fn a_successful_live_reload_clears_the_pending_flag() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flash.img");
        let config = Config {
            flash_image: path.clone(),
            ..Config::default()
        };
        let flash = FileBackedFlash::create(&path, config.flash_size.size_bytes()).unwrap();
        let mut device = Device::provision(flash, config).unwrap();

        let mut description = [0u8; 40];
        description[..4].copy_from_slice(b"GAME");
        device
            .registry
            .append(AppDescriptor {
                magic: APP_MAGIC,
                start_offset: 0x120000,
                end_offset: 0x12ffff,
                description,
                parts: vec![PartitionDescriptor::new(0x00, 0x00, "app0", 0, 0x10000)],
                tile: Tile::blank(),
            })
            .unwrap();

        let mut platform = NoopPlatform::default();
        BootSelector::select_and_boot(&mut device, &mut platform, 0).unwrap();

        assert_eq!(platform.pending_boot_partition().unwrap(), None);
    }

    #[test]
    fn rejects_an_out_of_range_slot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flash.img");
        let config = Config {
            flash_image: path.clone(),
            ..Config::default()
        };
        let flash = FileBackedFlash::create(&path, config.flash_size.size_bytes()).unwrap();
        let mut device = Device::provision(flash, config).unwrap();

        let mut platform = NoopPlatform::default();
        assert!(BootSelector::select_and_boot(&mut device, &mut platform, 0).is_err());
    }
}
