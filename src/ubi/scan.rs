//! This module contains code to scan one PEB and determine its contents (per UBI), sorting it
//! into the attach information.

use super::attach::{AttachConfig, FlashKind};
use super::attach_info::{AttachInfo, PebList};
use super::headers::*;
use super::io::{HdrRead, UbiIo};
use super::resolve::{add_leb, Placement};
use crate::error::{AttachError, Result};
use crate::nand::{Nand, PageUtil, ReadStatus};

use parking_lot::Mutex;

/// Everything a scan needs besides the attach information it fills in
pub struct ScanContext<'a, N: Nand> {
    pub io: UbiIo<'a, N>,
    pub config: AttachConfig,

    /// Scratch space for reading PEB payloads; held for one read-and-check at a time
    pub(crate) peb_buf: Mutex<Vec<u8>>,
}

impl<'a, N: Nand> ScanContext<'a, N> {
    pub fn new(io: UbiIo<'a, N>, config: AttachConfig) -> Self {
        let peb_buf = Mutex::new(Vec::with_capacity(io.geometry().data_size()));
        Self {
            io,
            config,
            peb_buf,
        }
    }
}

/// Scan one PEB and record what it holds
///
/// In `fast` mode (looking for a fastmap), a damaged VID header means the fastmap can't be
/// trusted, so `force_full_scan` gets set.
pub fn scan_peb<N: Nand>(
    ctx: &mut ScanContext<'_, N>,
    ai: &mut AttachInfo,
    pnum: u32,
    fast: bool,
) -> Result<()> {
    if ctx.io.is_bad(pnum)? {
        ai.bad_peb_count += 1;
        return Ok(());
    }

    let mut bitflips = false;
    let ec_hdr = ctx.io.read_ec_hdr(pnum)?;
    let ec_ecc_failed = ec_hdr == HdrRead::CorruptedEcc;
    let ec_hdr = match ec_hdr {
        HdrRead::Valid(ec_hdr) => Some(ec_hdr),
        HdrRead::Bitflips(ec_hdr) => {
            bitflips = true;
            Some(ec_hdr)
        }
        HdrRead::Blank => {
            ai.empty_peb_count += 1;
            ai.add_to_list(PebList::Erase, pnum, None, false);
            return Ok(());
        }
        HdrRead::BlankBitflips => {
            ai.empty_peb_count += 1;
            ai.add_to_list(PebList::Erase, pnum, None, true);
            return Ok(());
        }
        HdrRead::Corrupted | HdrRead::CorruptedEcc => {
            // The VID header may still tell us something; the PEB gets scrubbed regardless
            bitflips = true;
            None
        }
    };

    if let Some(ec_hdr) = ec_hdr {
        check_ec_hdr(ctx, ai, pnum, &ec_hdr)?;
    }
    let ec = ec_hdr.map(|x| x.ec);

    sort_by_vid(ctx, ai, pnum, ec, bitflips, ec_ecc_failed, fast)?;

    if let Some(ec) = ec {
        ai.note_ec(ec);
    }

    Ok(())
}

/// Enforce the rules a valid EC header must follow
fn check_ec_hdr<N: Nand>(
    ctx: &ScanContext<'_, N>,
    ai: &mut AttachInfo,
    pnum: u32,
    ec_hdr: &Ec,
) -> Result<()> {
    if ec_hdr.ec > UBI_MAX_ERASECOUNTER {
        log::error!("erase counter overflow, max is {UBI_MAX_ERASECOUNTER}");
        return Err(AttachError::EcOverflow {
            pnum,
            ec: ec_hdr.ec,
        });
    }

    let geometry = ctx.io.geometry();
    if ec_hdr.vid_hdr_offset != geometry.vid_hdr_offset()
        || ec_hdr.data_offset != geometry.data_offset()
    {
        return Err(AttachError::BadEcLayout {
            pnum,
            vid_hdr_offset: ec_hdr.vid_hdr_offset,
            data_offset: ec_hdr.data_offset,
        });
    }

    // Zero means "written by an old tool"; it matches anything
    if ec_hdr.image_seq != 0 {
        if ai.image_seq == 0 {
            ai.image_seq = ec_hdr.image_seq;
        } else if ai.image_seq != ec_hdr.image_seq {
            return Err(AttachError::ImageSeqMismatch {
                pnum,
                expected: ai.image_seq,
                found: ec_hdr.image_seq,
            });
        }
    }

    Ok(())
}

/// Read the VID header(s) of a PEB whose EC header was not blank, and put the PEB where it
/// belongs
fn sort_by_vid<N: Nand>(
    ctx: &mut ScanContext<'_, N>,
    ai: &mut AttachInfo,
    pnum: u32,
    ec: Option<u64>,
    bitflips: bool,
    ec_ecc_failed: bool,
    fast: bool,
) -> Result<()> {
    let ec_ok = ec.is_some();

    let vids = match ctx.io.read_vid_hdrs(pnum)? {
        HdrRead::Valid(vids) => (vids, bitflips),
        HdrRead::Bitflips(vids) => (vids, true),

        HdrRead::Blank => {
            if ec_ok && !bitflips {
                ai.add_to_list(PebList::Free, pnum, ec, false);
            } else {
                ai.add_to_list(PebList::Erase, pnum, ec, true);
            }
            return Ok(());
        }
        HdrRead::BlankBitflips => {
            ai.add_to_list(PebList::Erase, pnum, ec, true);
            return Ok(());
        }

        vid_hdr @ (HdrRead::Corrupted | HdrRead::CorruptedEcc) => {
            if vid_hdr == HdrRead::CorruptedEcc && ec_ecc_failed {
                ai.maybe_bad_peb_count += 1;
            }
            if fast {
                ai.force_full_scan = true;
            }

            if !ec_ok {
                // Both headers are gone: most likely a power cut while erasing
                let to_head = ctx.config.flash_kind == FlashKind::Nor;
                ai.add_to_list(PebList::Erase, pnum, ec, to_head);
            } else if check_corruption(ctx, pnum)? {
                ai.add_to_list(PebList::Corrupted, pnum, ec, false);
            } else {
                ai.add_to_list(PebList::Erase, pnum, ec, true);
            }
            return Ok(());
        }
    };
    let (vids, bitflips) = vids;

    let first = vids[0];
    let vol_id = first.vol_id;
    if is_internal_volume(vol_id) && vol_id != UBI_LAYOUT_VOLUME_ID && !is_fastmap_volume(vol_id) {
        match Compat::try_from(first.compat) {
            Ok(Compat::Delete) => {
                log::info!(
                    "\"delete\" compatible internal volume {vol_id}:{} found, will remove it",
                    first.lnum
                );
                let handle = ai.add_to_list(PebList::Erase, pnum, ec, true);
                ai.peb_mut(handle).vol_id = Some(vol_id);
                return Ok(());
            }
            Ok(Compat::ReadOnly) => {
                log::info!(
                    "read-only compatible internal volume {vol_id}:{} found, switch to read-only mode",
                    first.lnum
                );
                ai.read_only = true;
            }
            Ok(Compat::Preserve) => {
                log::info!(
                    "\"preserve\" compatible internal volume {vol_id}:{} found",
                    first.lnum
                );
                let handle = ai.add_to_list(PebList::Alien, pnum, ec, false);
                ai.peb_mut(handle).vol_id = Some(vol_id);
                return Ok(());
            }
            Ok(Compat::Reject) | Err(()) => {
                log::error!("incompatible internal volume {vol_id}:{} found", first.lnum);
                return Err(AttachError::IncompatibleVolume { pnum, vol_id });
            }
        }
    }

    if !ec_ok {
        log::warn!("valid VID header but corrupted EC header at PEB {pnum}");
    }

    let handle = ai.new_peb(pnum, ec);
    let peb = ai.peb_mut(handle);
    peb.vol_id = Some(vol_id);
    peb.sqnum = first.sqnum;
    peb.scrub = bitflips;
    if ctx.config.lebs_per_peb > 1 {
        peb.slots = Some(vids.iter().map(|vid| vid.lnum).collect());
    }

    if is_fastmap_volume(vol_id) {
        ai.max_sqnum = ai.max_sqnum.max(first.sqnum);
        ai.push(PebList::Fastmap, handle, false);
        return Ok(());
    }

    // Hold a reference while the slots are handed out, so that the PEB only goes to the erase
    // list once every slot has lost
    ai.take_ref(handle);
    let mut corrupted = false;
    for (slot, vid) in vids.iter().enumerate() {
        if add_leb(ctx, ai, handle, slot as u32, vid)? == Placement::Corrupted {
            corrupted = true;
        }
    }
    ai.drop_ref(handle, corrupted);

    Ok(())
}

/// Decide whether a PEB with a good EC header but a damaged VID header was hit by a power cut
/// (`false`), or holds data UBI can't explain (`true`)
///
/// A power cut while writing the VID header leaves the data area empty; a power cut while
/// erasing leaves it unstable. Anything else must be kept around for inspection.
fn check_corruption<N: Nand>(ctx: &mut ScanContext<'_, N>, pnum: u32) -> Result<bool> {
    let data_size = ctx.io.geometry().data_size();
    let data_offset = ctx.io.geometry().data_offset();
    let mut buf = ctx.peb_buf.lock();

    let status = ctx.io.read_data(pnum, 0, data_size, &mut buf)?;
    if status != ReadStatus::Clean || buf.is_erased() {
        return Ok(false);
    }

    log::error!("PEB {pnum} contains corrupted VID header, and the data does not contain all 0xFF");
    log::error!("this may be a non-UBI PEB or a severe VID header corruption which requires manual inspection");
    log::error!("hexdump of PEB {pnum} offset {data_offset}, length {data_size}");
    for (i, line) in buf.chunks(32).enumerate() {
        let hex: Vec<String> = line.iter().map(|x| format!("{x:02x}")).collect();
        log::error!("{:08x}: {}", i * 32, hex.join(" "));
    }

    Ok(true)
}
