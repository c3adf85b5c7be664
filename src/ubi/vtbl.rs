//! Reading the volume table out of the layout volume, and reconciling it with the volumes found
//! on flash.

use super::attach_info::AttachInfo;
use super::headers::*;
use super::io::UbiIo;
use crate::error::{AttachError, Result};
use crate::nand::{Nand, ReadStatus};

use std::collections::BTreeMap;

/// The volume table: one record per existing user volume, by volume ID
pub type VolumeTable = BTreeMap<u32, VolTableRecord>;

/// Read the volume table of an attached device. User volumes found on flash that the table
/// doesn't know about are dropped from `ai`, their PEBs scheduled for erasure.
pub fn read_volume_table<N: Nand>(
    io: &mut UbiIo<'_, N>,
    ai: &mut AttachInfo,
) -> Result<VolumeTable> {
    if ai.is_empty {
        log::debug!("empty device, empty volume table");
        return Ok(VolumeTable::new());
    }

    let Some(layout) = ai.volume(UBI_LAYOUT_VOLUME_ID) else {
        return Err(AttachError::VolumeTable("layout volume not found".into()));
    };
    let copies: Vec<(u32, u32, u32)> = layout
        .lebs()
        .filter(|leb| leb.lnum < UBI_LAYOUT_VOLUME_EBS)
        .map(|leb| (leb.lnum, ai.peb(leb.peb).pnum, leb.slot))
        .collect();

    let leb_size = io.geometry().leb_size();
    let slots = (leb_size / UBI_VTBL_RECORD_SIZE).min(UBI_MAX_VOLUMES as usize);

    let mut decoded = Vec::with_capacity(copies.len());
    let mut buf = Vec::with_capacity(slots * UBI_VTBL_RECORD_SIZE);
    for (lnum, pnum, slot) in copies {
        let offset = slot as usize * leb_size;
        if io.read_data(pnum, offset, slots * UBI_VTBL_RECORD_SIZE, &mut buf)?
            == ReadStatus::Uncorrectable
        {
            log::warn!("volume table copy {lnum} in PEB {pnum} is unreadable");
            continue;
        }

        match decode_table(&buf) {
            Ok(records) => {
                log::debug!("volume table copy {lnum} in PEB {pnum}: {} volumes", records.len());
                decoded.push(records);
            }
            Err((vol_id, defect)) => {
                log::warn!("volume table copy {lnum} in PEB {pnum}: record {vol_id} is bad ({defect:?})");
            }
        }
    }

    if decoded.len() == 2 && decoded[0] != decoded[1] {
        log::warn!("the two volume table copies differ, using LEB 0");
    }
    let Some(table) = decoded.into_iter().next() else {
        log::error!("both volume table copies are corrupted");
        return Err(AttachError::VolumeTable("no intact copy".into()));
    };

    let orphans: Vec<u32> = ai
        .volumes()
        .map(|volume| volume.vol_id)
        .filter(|&vol_id| !is_internal_volume(vol_id) && !table.contains_key(&vol_id))
        .collect();
    for vol_id in orphans {
        log::warn!("volume {vol_id} is not in the volume table, removing it");
        ai.remove_volume(vol_id);
    }

    Ok(table)
}

/// Decode every record of a table copy, or report the first bad one
fn decode_table(buf: &[u8]) -> std::result::Result<VolumeTable, (u32, HeaderDefect)> {
    let mut table = VolumeTable::new();
    for (vol_id, bytes) in buf.chunks_exact(UBI_VTBL_RECORD_SIZE).enumerate() {
        let vol_id = vol_id as u32;
        match VolTableRecord::decode(bytes) {
            Ok(Some(record)) => {
                table.insert(vol_id, record);
            }
            Ok(None) => (),
            Err(defect) => return Err((vol_id, defect)),
        }
    }
    Ok(table)
}
