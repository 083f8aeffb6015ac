//! Bootloader/OS handoff.
//!
//! After a firmware is installed or removed the partition table on flash
//! has changed underneath whatever parsed it at boot, and the next
//! application to run has to be recorded somewhere that survives a reset.
//! On the console that "somewhere" is a no-init RTC memory flag read by the
//! second-stage bootloader; [`Platform`] abstracts that two-step commit
//! (mark boot target, reload live state, restart) so the installer core
//! never touches hardware registers directly.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{CoreError, Result};

/// The host's view of "what happens after the installer is done".
pub trait Platform {
    /// Records which app should run on the next boot. Persists across a
    /// restart; does not take effect until [`Platform::restart`].
    fn set_boot_partition(&mut self, label: &str) -> Result<()>;

    /// Re-reads the live partition table from flash into whatever runtime
    /// state the platform keeps cached. Returns `false` if the reload could
    /// not be completed and a full restart is required instead.
    fn reload_partition_table(&mut self) -> Result<bool>;

    /// Performs a warm restart into the partition set by
    /// [`Platform::set_boot_partition`]. Does not return on real hardware;
    /// the host implementation returns normally so tests can observe it.
    fn restart(&mut self) -> Result<()>;

    /// Reads back whatever boot target [`Platform::set_boot_partition`] last
    /// recorded, if it hasn't been cleared yet. A cold start consults this
    /// to finish a two-phase commit that [`Platform::reload_partition_table`]
    /// reported it couldn't complete live (spec.md §4.8 step 4).
    fn pending_boot_partition(&self) -> Result<Option<String>>;

    /// Clears the pending boot target once it has been fully applied, so a
    /// later cold start doesn't redo work a live reload already finished.
    fn clear_pending_boot(&mut self) -> Result<()>;
}

/// Persists the pending boot target to a sidecar file next to the flash
/// image, standing in for the RTC no-init flag the real bootloader reads.
pub struct HostPlatform {
    boot_flag_path: PathBuf,
    restart_count: u32,
}

impl HostPlatform {
    pub fn new(flash_image_path: impl AsRef<Path>) -> Self {
        let boot_flag_path = flash_image_path.as_ref().with_extension("bootflag");
        Self {
            boot_flag_path,
            restart_count: 0,
        }
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }
}

impl Platform for HostPlatform {
    fn set_boot_partition(&mut self, label: &str) -> Result<()> {
        fs::write(&self.boot_flag_path, label)
            .map_err(|e| CoreError::file_io(&self.boot_flag_path, e))
    }

    fn reload_partition_table(&mut self) -> Result<bool> {
        // A host process can always just keep using its in-memory table;
        // there is no separate runtime cache to invalidate.
        Ok(true)
    }

    fn restart(&mut self) -> Result<()> {
        self.restart_count += 1;
        Ok(())
    }

    fn pending_boot_partition(&self) -> Result<Option<String>> {
        if !self.boot_flag_path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.boot_flag_path)
            .map_err(|e| CoreError::file_io(&self.boot_flag_path, e))?;
        Ok(Some(contents.trim().to_string()))
    }

    fn clear_pending_boot(&mut self) -> Result<()> {
        if self.boot_flag_path.exists() {
            fs::remove_file(&self.boot_flag_path)
                .map_err(|e| CoreError::file_io(&self.boot_flag_path, e))?;
        }
        Ok(())
    }
}

/// Discards every platform call. Used where a test only cares about flash
/// and registry state, not boot sequencing. `reload_succeeds` lets a test
/// force the degraded (no-live-reload) path.
#[derive(Debug)]
pub struct NoopPlatform {
    pub last_boot_partition: Option<String>,
    pub restarted: bool,
    pub reload_succeeds: bool,
    pending_boot: Option<String>,
}

impl Default for NoopPlatform {
    fn default() -> Self {
        Self {
            last_boot_partition: None,
            restarted: false,
            reload_succeeds: true,
            pending_boot: None,
        }
    }
}

impl Platform for NoopPlatform {
    fn set_boot_partition(&mut self, label: &str) -> Result<()> {
        self.last_boot_partition = Some(label.to_string());
        self.pending_boot = Some(label.to_string());
        Ok(())
    }

    fn reload_partition_table(&mut self) -> Result<bool> {
        Ok(self.reload_succeeds)
    }

    fn restart(&mut self) -> Result<()> {
        self.restarted = true;
        Ok(())
    }

    fn pending_boot_partition(&self) -> Result<Option<String>> {
        Ok(self.pending_boot.clone())
    }

    fn clear_pending_boot(&mut self) -> Result<()> {
        self.pending_boot = None;
        Ok(())
    }
}
