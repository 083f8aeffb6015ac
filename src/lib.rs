pub mod boot;
pub mod cli;
pub mod config;
pub mod device;
pub mod error;
pub mod firmware;
pub mod flash;
pub mod install;
pub mod partition_table;
pub mod platform;
pub mod progress;
pub mod registry;
pub mod sdcard;
pub mod wire;

pub use boot::BootSelector;
pub use config::Config;
pub use device::Device;
pub use error::{CoreError, Result};
pub use firmware::FirmwareFile;
pub use flash::{FileBackedFlash, FlashIo};
pub use partition_table::PartitionTableManager;
pub use platform::Platform;
pub use progress::ProgressSink;
pub use registry::AppRegistry;
pub use sdcard::SdFilesystem;
