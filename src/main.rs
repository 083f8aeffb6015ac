use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use std::io::{self, Write};

use log::{info, warn, LevelFilter};

use appforge_core::boot::BootSelector;
use appforge_core::cli::{Args, Commands};
use appforge_core::config::Config;
use appforge_core::device::Device;
use appforge_core::flash::FileBackedFlash;
use appforge_core::install;
use appforge_core::platform::HostPlatform;
use appforge_core::progress::{IndicatifProgress, ProgressSink};
use appforge_core::sdcard::{HostSdFilesystem, SdFilesystem};

fn main() {
    let args = Args::parse();

    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    if let Err(e) = run(args) {
        if let Some(core_err) = e.downcast_ref::<appforge_core::CoreError>() {
            eprintln!("{}: {}", core_err.phase_tag().red().bold(), core_err);
        } else {
            eprintln!("{}: {}", "Error".red().bold(), e);
        }
        process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = Config {
        flash_size: args.flash_size,
        sd_root: args.sd_root.clone(),
        flash_image: args.flash_image.clone(),
        verbose: args.verbose,
        dry_run: args.dry_run,
        assume_yes: args.yes,
    };

    match args.command {
        Commands::Provision => provision(&config),
        Commands::Install { firmware } => install_cmd(&config, firmware),
        Commands::List => list(&config),
        Commands::Remove { slot } => remove(&config, slot),
        Commands::Boot { slot } => boot(&config, slot),
        Commands::Inspect { json } => inspect(&config, json),
    }
}

fn provision(config: &Config) -> Result<()> {
    if config.flash_image.exists() {
        anyhow::bail!(
            "{} already exists; remove it first if you want to reprovision",
            config.flash_image.display()
        );
    }
    if config.dry_run {
        info!(
            "(dry run) would create a {} byte flash image at {}",
            config.flash_size.size_bytes(),
            config.flash_image.display()
        );
        return Ok(());
    }
    let flash = FileBackedFlash::create(&config.flash_image, config.flash_size.size_bytes())
        .context("failed to create flash image")?;
    let mut device = Device::provision(flash, config.clone())?;
    device.save()?;
    println!(
        "{} {} ({} bytes)",
        "provisioned".green().bold(),
        config.flash_image.display(),
        config.flash_size.size_bytes()
    );
    Ok(())
}

fn open_device(config: &Config) -> Result<Device<FileBackedFlash>> {
    let flash = FileBackedFlash::open(&config.flash_image).with_context(|| {
        format!(
            "failed to open {}; run `appforge provision` first",
            config.flash_image.display()
        )
    })?;
    Ok(Device::open(flash, config.clone())?)
}

fn install_cmd(config: &Config, firmware: Option<std::path::PathBuf>) -> Result<()> {
    let mut device = open_device(config)?;
    let sd = HostSdFilesystem::new(&config.sd_root);

    let targets = match firmware {
        Some(path) => vec![path],
        None => sd.list_firmwares()?,
    };
    if targets.is_empty() {
        println!("{}", "no .fw files found".yellow());
        return Ok(());
    }

    // `utility.bin`, if present, rides along with whichever single firmware
    // is being installed (spec.md §4.6 step 7) — there is no standalone
    // "install the utility image" action, matching the original firmware's
    // single-selection install flow. When discovering every `.fw` file on
    // the SD root at once, it's attached to the last one.
    for (i, path) in targets.iter().enumerate() {
        let mut progress = IndicatifProgress::default();
        if config.dry_run {
            info!("(dry run) would install {}", path.display());
            continue;
        }
        let attach_utility = i == targets.len() - 1;
        let assume_yes = config.assume_yes;
        let mut confirm = |preview: &install::InstallPreview| {
            confirm_install(preview, assume_yes)
        };
        let slot = install::install_firmware(
            &mut device,
            &sd,
            path,
            attach_utility,
            &mut progress as &mut dyn ProgressSink,
            &mut confirm,
        )
        .with_context(|| format!("failed to install {}", path.display()))?;
        match slot {
            Some(slot) => println!(
                "{} {} -> slot {}",
                "installed".green().bold(),
                path.display(),
                slot
            ),
            None => println!("{} {}", "cancelled".yellow().bold(), path.display()),
        }
    }

    Ok(())
}

/// Shows the operator what's about to be written and asks for confirmation
/// before any flash mutation begins (spec.md §4.6 step 3). `assume_yes`
/// bypasses the prompt for non-interactive runs.
fn confirm_install(preview: &install::InstallPreview, assume_yes: bool) -> bool {
    println!(
        "about to install {:?} ({} part(s), {} bytes)",
        preview.description, preview.part_count, preview.total_size
    );
    if assume_yes {
        return true;
    }
    print!("proceed? [y/N] ");
    if io::stdout().flush().is_err() {
        return false;
    }
    let mut line = String::new();
    if io::stdin().read_line(&mut line).is_err() {
        return false;
    }
    matches!(line.trim().to_lowercase().as_str(), "y" | "yes")
}

fn list(config: &Config) -> Result<()> {
    let device = open_device(config)?;
    if device.registry.is_empty() {
        println!("{}", "no apps installed".yellow());
        return Ok(());
    }
    for (slot, app) in device.registry.iter().enumerate() {
        println!(
            "{:>3}  {:<24}  {:#010x}-{:#010x}  {} part(s)",
            slot,
            app.description_str(),
            app.start_offset,
            app.end_offset,
            app.parts.len()
        );
    }
    Ok(())
}

fn remove(config: &Config, slot: usize) -> Result<()> {
    let mut device = open_device(config)?;
    if config.dry_run {
        info!("(dry run) would remove slot {slot}");
        return Ok(());
    }
    install::remove_app(&mut device, slot)?;
    println!("{} slot {}", "removed".green().bold(), slot);
    Ok(())
}

fn boot(config: &Config, slot: usize) -> Result<()> {
    let mut device = open_device(config)?;
    let mut platform = HostPlatform::new(&config.flash_image);

    // Cold start: finish a two-phase commit a prior restart couldn't
    // complete via live reload (spec.md §4.8 step 4). The pending flag is
    // the RTC-equivalent record of what should already be live; confirm it
    // against the table we just loaded from flash and clear it either way,
    // since this boot request is about to set its own target.
    if let Some(pending) = platform.pending_boot_partition()? {
        if device.table.find(&pending).is_some() {
            info!("cold start: pending boot partition '{pending}' is already live");
        } else {
            warn!("cold start: pending boot partition '{pending}' not found in the live table");
        }
        platform.clear_pending_boot()?;
    }

    if config.dry_run {
        info!("(dry run) would boot slot {slot}");
        return Ok(());
    }
    BootSelector::select_and_boot(&mut device, &mut platform, slot)?;
    println!("{} slot {}", "booted".green().bold(), slot);
    Ok(())
}

fn inspect(config: &Config, json: bool) -> Result<()> {
    let device = open_device(config)?;
    if json {
        println!("{}", device.registry.to_json()?);
        return Ok(());
    }
    println!("{}", "partition table".bold());
    println!("{}", device.table.to_csv()?);
    println!("{}", "apps".bold());
    for (slot, app) in device.registry.iter().enumerate() {
        println!("  [{slot}] {}", app.description_str());
    }
    Ok(())
}
