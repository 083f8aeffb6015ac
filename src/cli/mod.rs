use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::FlashSize;

#[derive(Parser, Debug)]
#[command(
    name = "appforge",
    about = "Install, list, remove, and boot apps on a handheld console's flash image",
    version
)]
pub struct Args {
    /// Flash image file to operate on (created by `provision` if missing).
    #[arg(short, long, default_value = "flash.img")]
    pub flash_image: PathBuf,

    /// Directory standing in for the SD card: holds `.fw` files and an
    /// optional `utility.bin`.
    #[arg(short = 'd', long, default_value = ".")]
    pub sd_root: PathBuf,

    /// Flash capacity to assume when provisioning a new image.
    #[arg(long, value_parser = parse_flash_size, default_value = "16MB")]
    pub flash_size: FlashSize,

    #[arg(short, long)]
    pub verbose: bool,

    /// Report what would happen without touching the flash image.
    #[arg(long)]
    pub dry_run: bool,

    /// Skip the installation confirmation prompt and proceed automatically.
    #[arg(short = 'y', long)]
    pub yes: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Creates a blank flash image with the fixed system partitions laid
    /// out, ready to receive apps.
    Provision,
    /// Installs every `.fw` file found under the SD root (or just `firmware`,
    /// if given).
    Install {
        firmware: Option<PathBuf>,
    },
    /// Lists every app currently registered on the flash image.
    List,
    /// Removes the app at the given registry slot and compacts the gap.
    Remove {
        slot: usize,
    },
    /// Marks the app at the given registry slot to boot and restarts.
    Boot {
        slot: usize,
    },
    /// Prints the live partition table and registry contents.
    Inspect {
        /// Print the registry as JSON instead of a human-readable listing.
        #[arg(long)]
        json: bool,
    },
}

fn parse_flash_size(value: &str) -> Result<FlashSize, String> {
    match value {
        "4MB" | "4mb" => Ok(FlashSize::Size4MB),
        "8MB" | "8mb" => Ok(FlashSize::Size8MB),
        "16MB" | "16mb" => Ok(FlashSize::Size16MB),
        other => Err(format!(
            "unsupported flash size '{other}', expected 4MB, 8MB, or 16MB"
        )),
    }
}
