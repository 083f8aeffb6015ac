use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::wire::SIXTY_FOUR_KIB;

/// Runtime configuration for an installer run: where firmware files live,
/// which flash image to operate on, and how big that flash is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub flash_size: FlashSize,
    pub sd_root: PathBuf,
    pub flash_image: PathBuf,
    pub verbose: bool,
    pub dry_run: bool,
    /// Skip the installation confirmation prompt (spec.md §4.6 step 3).
    pub assume_yes: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashSize {
    #[serde(rename = "4MB")]
    Size4MB,
    #[serde(rename = "8MB")]
    Size8MB,
    #[serde(rename = "16MB")]
    Size16MB,
}

impl FlashSize {
    pub fn size_bytes(&self) -> u32 {
        match self {
            FlashSize::Size4MB => 4 * 1024 * 1024,
            FlashSize::Size8MB => 8 * 1024 * 1024,
            FlashSize::Size16MB => 16 * 1024 * 1024,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flash_size: FlashSize::Size16MB,
            sd_root: PathBuf::from("."),
            flash_image: PathBuf::from("flash.img"),
            verbose: false,
            dry_run: false,
            assume_yes: false,
        }
    }
}

/// Fixed layout of the console's SPI-NOR flash. These offsets are not
/// configurable: the mask ROM bootloader expects the second-stage
/// bootloader and partition table at exactly these addresses.
pub mod defaults {
    pub const BOOTLOADER_OFFSET: u32 = 0x1000;
    pub const BOOTLOADER_SIZE: u32 = 0x7000;
    pub const PARTITION_TABLE_OFFSET: u32 = 0x8000;
    /// `ESP_PARTITION_TABLE_MAX_LEN`: the partition table's logical region is
    /// 3 KiB, not a full 4 KiB sector. `PARTITION_TABLE_OFFSET` is itself
    /// sector-aligned, so erasing it still costs one whole [`FOUR_KIB`](crate::wire::FOUR_KIB)
    /// sector; only [`PARTITION_TABLE_SIZE`] bytes of that sector are ever
    /// read back or written with real entries.
    pub const PARTITION_TABLE_SIZE: u32 = 0xC00;
    pub const NVS_OFFSET: u32 = 0x9000;
    pub const NVS_SIZE: u32 = 0x1000;
    /// Reserved region holding the dense [`crate::registry::AppRegistry`]
    /// array. Labeled `factory` with subtype `0xFE` in the live partition
    /// table.
    pub const FACTORY_DATA_OFFSET: u32 = 0xA000;
    pub const FACTORY_DATA_SIZE: u32 = 0x10000;
    /// Installed apps are packed starting here, aligned to 64 KiB. There is
    /// no separate fixed utility partition: an optional `utility.bin` is
    /// appended as a trailing part of whichever app install includes it
    /// (spec.md §4.6 step 7), so it lives inside the apps region like any
    /// other app partition rather than at a pre-reserved offset.
    pub const APPS_REGION_OFFSET: u32 = 0x20000;

    pub const APP_ALIGNMENT: u32 = SIXTY_FOUR_KIB;
}

use defaults::*;

impl Config {
    /// Byte offset one past the end of the apps region, i.e. flash capacity.
    pub fn apps_region_end(&self) -> u32 {
        self.flash_size.size_bytes()
    }

    pub fn apps_region_offset(&self) -> u32 {
        APPS_REGION_OFFSET
    }
}
