//! The installation pipeline: validates a firmware container, streams its
//! parts to flash, and registers the result as a new app.
//!
//! Order of operations mirrors the original console firmware closely
//! because each step is there to fail before anything irreversible
//! happens: header and CRC are checked before a single sector is erased,
//! every part is validated against its target address from its header
//! alone (no payload is read) before the operator is asked to confirm,
//! every part is erased and written before the registry is updated, and
//! the registry is the very last thing touched so a power loss midway
//! through never leaves a half-installed app looking complete.
//!
//! Nothing here buffers a whole firmware part into memory: each part's
//! payload is streamed straight from the firmware file's reader into a
//! single reused sector-sized buffer and out to flash (spec.md §1, §5).

use log::warn;

use crate::config::defaults;
use crate::error::{CoreError, Result};
use crate::firmware::{FirmwareFile, PartHeader};
use crate::flash::FlashIo;
use crate::partition_table::align_to_app_boundary;
use crate::progress::ProgressSink;
use crate::sdcard::{ReadSeek, SdFilesystem};
use crate::wire::{
    align_up, AppDescriptor, PartitionDescriptor, FOUR_KIB, PARTS_MAX, PART_SUBTYPE_APP_TEST,
    PART_TYPE_APP,
};
use crate::device::Device;

const STREAM_CHUNK: usize = FOUR_KIB as usize;

/// Erases the aligned flash region a part of `length` bytes starting at
/// `offset` occupies, rounding out to whole sectors as real NOR flash
/// requires.
fn erase_region(flash: &mut impl FlashIo, offset: u32, length: u32) -> Result<()> {
    let erase_start = offset & !(FOUR_KIB - 1);
    let erase_end = (offset + length + FOUR_KIB - 1) & !(FOUR_KIB - 1);
    flash.erase(erase_start, erase_end - erase_start)
}

/// Where a planned part's payload bytes come from when it's time to write
/// them. `Streamed` parts are read straight out of the firmware container
/// in lockstep with [`FirmwareFile::next_part`]/[`FirmwareFile::read_part_chunk`];
/// `InMemory` is only ever the optional `utility.bin`, a small auxiliary
/// file already read whole from the SD root, separate from the firmware
/// container this module's streaming discipline is about.
enum PartSource {
    Streamed,
    InMemory(Vec<u8>),
}

/// One partition staged for installation: its descriptor, how many payload
/// bytes it actually carries, and where those bytes will come from.
struct PlannedPart {
    descriptor: PartitionDescriptor,
    payload_length: u32,
    source: PartSource,
}

/// What a caller is shown before any flash mutation begins, so it can
/// require the operator's explicit confirmation (spec.md §4.6 step 3).
pub struct InstallPreview<'a> {
    pub description: &'a str,
    pub part_count: usize,
    pub total_size: u32,
}

/// Installs a single `.fw` file found at `path` on `sd` onto `device`.
///
/// If `attach_utility` is set and a `utility.bin` is present on `sd`, it is
/// appended to this same app as one more `Type::App`/`APP_TEST` partition
/// labeled `"utility"` (spec.md §4.6 step 7) rather than living at a
/// separately reserved offset — that matches the console firmware this was
/// ported from, which only ever has a single firmware selected for
/// installation at a time and tacks the utility image onto whichever one
/// that is.
///
/// `confirm` is called once, after every part has been validated against
/// its target address and before the first sector is erased, with a
/// preview of what's about to happen. If it returns `false` the install is
/// cancelled and `Ok(None)` is returned with no flash mutation having
/// occurred (spec.md §4.6 step 3).
///
/// Returns the registry slot index the new app landed in, or `None` if the
/// operator cancelled.
pub fn install_firmware<F: FlashIo>(
    device: &mut Device<F>,
    sd: &dyn SdFilesystem,
    path: &std::path::Path,
    attach_utility: bool,
    progress: &mut dyn ProgressSink,
    confirm: &mut dyn FnMut(&InstallPreview) -> bool,
) -> Result<Option<usize>> {
    let reader = sd.open_firmware(path)?;
    let mut firmware = FirmwareFile::from_seekable(reader)?;

    progress.init("verifying", firmware.file_len());
    firmware.verify_crc()?;
    progress.finish();

    let header = firmware.header().clone();
    let description = header.description_str();

    firmware.seek_to_parts()?;
    let mut plan = Vec::new();
    while let Some(PartHeader {
        descriptor,
        payload_length,
    }) = firmware.next_part()?
    {
        plan.push(PlannedPart {
            descriptor,
            payload_length,
            source: PartSource::Streamed,
        });
    }
    if plan.len() > PARTS_MAX {
        return Err(CoreError::capacity(format!(
            "firmware declares {} parts, at most {} are supported",
            plan.len(),
            PARTS_MAX
        )));
    }

    let frontier = device.registry.allocation_frontier(&device.config);
    let start = align_to_app_boundary(frontier);

    if attach_utility {
        append_utility_part(sd, &mut plan, start, device.config.apps_region_end())?;
    }

    // Walk the same cursor the write loop below will use so every part is
    // validated against the address it will actually land at, purely from
    // header data — no payload byte is read during validation.
    let mut check_cursor = start;
    for planned in &plan {
        let descriptor = &planned.descriptor;
        if descriptor.ty == 0xff {
            return Err(CoreError::format("partition descriptor has invalid type 0xff"));
        }
        if descriptor.length % defaults::APP_ALIGNMENT != 0 {
            return Err(CoreError::format(format!(
                "partition '{}' length {:#x} is not a multiple of {:#x}",
                descriptor.label_str(),
                descriptor.length,
                defaults::APP_ALIGNMENT
            )));
        }
        if check_cursor % defaults::APP_ALIGNMENT != 0 {
            return Err(CoreError::format(format!(
                "partition '{}' lands at unaligned offset {:#x}",
                descriptor.label_str(),
                check_cursor
            )));
        }
        if planned.payload_length > descriptor.length {
            return Err(CoreError::format(format!(
                "partition '{}' payload is {} bytes, exceeds declared length {}",
                descriptor.label_str(),
                planned.payload_length,
                descriptor.length
            )));
        }
        check_cursor = check_cursor
            .checked_add(descriptor.length)
            .ok_or_else(|| CoreError::capacity("app size overflows the address space"))?;
        if check_cursor > device.config.apps_region_end() {
            return Err(CoreError::capacity(format!(
                "app needs flash up to {check_cursor:#x}, but the device only has {:#x}",
                device.config.apps_region_end()
            )));
        }
    }
    let end = check_cursor - 1;
    let total_size = end - start + 1;

    let preview = InstallPreview {
        description: &description,
        part_count: plan.len(),
        total_size,
    };
    if !confirm(&preview) {
        return Ok(None);
    }

    progress.init("writing", total_size as u64);
    firmware.seek_to_parts()?;
    let mut cursor = start;
    let mut written = 0u64;
    let mut descriptors = Vec::with_capacity(plan.len());
    let mut chunk_buf = [0u8; STREAM_CHUNK];
    // Once the first sector has been erased there is no rollback path; any
    // failure past this point is reported as unrecoverable rather than a
    // plain validation error, since the flash image may now sit half-written.
    let mut mutation_started = false;
    for planned in &plan {
        match write_part(&mut device.flash, &mut firmware, cursor, planned, &mut chunk_buf) {
            Ok(()) => mutation_started = true,
            Err(e) if mutation_started => return Err(e.into_unrecoverable()),
            Err(e) => return Err(e),
        }
        descriptors.push(planned.descriptor.clone());
        cursor += planned.descriptor.length;
        written += planned.descriptor.length as u64;
        progress.update(written);
    }
    progress.finish();

    // Commit point (spec.md §4.6 step 8): the live partition table is
    // replaced wholesale with this app's parts — it only ever reflects the
    // most recently installed or booted app, never every app ever written —
    // and only then is the new app appended to the registry, which is the
    // durable record of every installed app's flash range regardless of
    // which one the table currently makes bootable.
    progress.init("finalizing", 2);
    device
        .table
        .rewrite(&descriptors, start)
        .map_err(CoreError::into_unrecoverable)?;
    device.table.persist(&mut device.flash).map_err(CoreError::into_unrecoverable)?;
    progress.update(1);

    let app = AppDescriptor {
        magic: crate::wire::APP_MAGIC,
        start_offset: start,
        end_offset: end,
        description: header.description,
        parts: descriptors,
        tile: header.tile,
    };
    device
        .registry
        .append(app)
        .map_err(CoreError::into_unrecoverable)?;
    device
        .registry
        .persist(&mut device.flash)
        .map_err(CoreError::into_unrecoverable)?;
    device.flash.flush().map_err(CoreError::into_unrecoverable)?;
    progress.update(2);
    progress.finish();

    Ok(Some(device.registry.len() - 1))
}

/// Erases `planned`'s target region and writes its payload at `offset`,
/// streaming a [`PartSource::Streamed`] payload through `buf` one sector at
/// a time rather than holding it all in memory.
fn write_part(
    flash: &mut impl FlashIo,
    firmware: &mut FirmwareFile<Box<dyn ReadSeek>>,
    offset: u32,
    planned: &PlannedPart,
    buf: &mut [u8],
) -> Result<()> {
    erase_region(flash, offset, planned.descriptor.length)?;
    match &planned.source {
        PartSource::Streamed => {
            firmware
                .next_part()?
                .ok_or_else(|| CoreError::format("firmware part stream ended early"))?;
            let mut written_in_part = 0u32;
            loop {
                let n = firmware.read_part_chunk(buf)?;
                if n == 0 {
                    break;
                }
                flash.write(offset + written_in_part, &buf[..n])?;
                written_in_part += n as u32;
            }
        }
        PartSource::InMemory(data) => {
            flash.write(offset, data)?;
        }
    }
    Ok(())
}

/// If `utility.bin` exists on `sd`, appends it to `parts` as one more
/// `Type::App`/`APP_TEST` partition labeled `"utility"`, its declared length
/// rounded up to the 64 KiB app alignment. Silently skips the attachment
/// (logging a warning) if the app has no free partition slot left or if
/// including it would run the app past the end of flash — spec.md §4.6 step
/// 7's "unless inclusion would overflow flash" is a skip condition, not a
/// reason to fail the whole install.
fn append_utility_part(
    sd: &dyn SdFilesystem,
    parts: &mut Vec<PlannedPart>,
    app_start: u32,
    flash_end: u32,
) -> Result<()> {
    let Some(data) = sd.read_utility()? else {
        return Ok(());
    };
    if parts.len() >= PARTS_MAX {
        warn!("utility.bin present but the app already has {PARTS_MAX} partitions, skipping");
        return Ok(());
    }

    let declared: u32 = parts.iter().map(|p| p.descriptor.length).sum();
    let utility_offset = app_start + declared;
    let length = align_up(data.len() as u32, defaults::APP_ALIGNMENT);
    match utility_offset.checked_add(length) {
        Some(end) if end <= flash_end => {
            let descriptor =
                PartitionDescriptor::new(PART_TYPE_APP, PART_SUBTYPE_APP_TEST, "utility", 0, length);
            let payload_length = data.len() as u32;
            parts.push(PlannedPart {
                descriptor,
                payload_length,
                source: PartSource::InMemory(data),
            });
        }
        _ => warn!("utility.bin would overflow flash, skipping"),
    }
    Ok(())
}

/// Removes the app at `slot` from the registry, relocating every later
/// app's flash data down to close the gap it leaves.
pub fn remove_app<F: FlashIo>(device: &mut Device<F>, slot: usize) -> Result<()> {
    device.registry.remove(slot, &mut device.flash)?;
    device.registry.persist(&mut device.flash)?;
    device.flash.flush()
}
