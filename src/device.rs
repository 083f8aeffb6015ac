//! A single owned handle bundling everything an operation needs: the flash
//! itself, the live partition table, and the app registry. Every pipeline
//! function takes `&mut Device` instead of reaching for global state.

use crate::config::Config;
use crate::error::Result;
use crate::flash::FlashIo;
use crate::partition_table::PartitionTableManager;
use crate::registry::AppRegistry;

pub struct Device<F: FlashIo> {
    pub flash: F,
    pub table: PartitionTableManager,
    pub registry: AppRegistry,
    pub config: Config,
}

impl<F: FlashIo> Device<F> {
    /// Loads the partition table and app registry out of an already
    /// provisioned flash image.
    pub fn open(mut flash: F, config: Config) -> Result<Self> {
        let table = PartitionTableManager::load(&mut flash)?;
        let registry = AppRegistry::load(&mut flash, &table)?;
        Ok(Self {
            flash,
            table,
            registry,
            config,
        })
    }

    /// Builds the fixed system partitions on a blank image and writes them
    /// out, ready for [`Device::open`] to read back.
    pub fn provision(mut flash: F, config: Config) -> Result<Self> {
        let table = PartitionTableManager::bootstrap(&config);
        table.persist(&mut flash)?;
        let registry = AppRegistry::load(&mut flash, &table)?;
        Ok(Self {
            flash,
            table,
            registry,
            config,
        })
    }

    /// Persists both the partition table and the app registry.
    pub fn save(&mut self) -> Result<()> {
        self.table.persist(&mut self.flash)?;
        self.registry.persist(&mut self.flash)?;
        self.flash.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::FileBackedFlash;
    use tempfile::tempdir;

    #[test]
    fn provision_then_open_roundtrips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flash.img");
        let config = Config {
            flash_image: path.clone(),
            ..Config::default()
        };

        {
            let flash = FileBackedFlash::create(&path, config.flash_size.size_bytes()).unwrap();
            let mut device = Device::provision(flash, config.clone()).unwrap();
            device.save().unwrap();
        }

        let flash = FileBackedFlash::open(&path).unwrap();
        let device = Device::open(flash, config).unwrap();
        assert!(device.registry.is_empty());
        assert!(device.table.find("factory").is_some());
    }
}
