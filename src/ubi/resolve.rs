//! Folding LEB copies into the volume directory.
//!
//! Several PEBs can claim the same `vol_id:lnum`: wear-leveling and atomic LEB changes write a
//! new copy before the old one is erased, and a power cut can leave both behind. The copy with
//! the higher sequence number is newer, but a copy made by wear-leveling (copy flag set) is
//! only trusted once its data CRC checks out.

use super::attach_info::{AttachInfo, LogicalBlock, PebHandle, Volume};
use super::headers::*;
use super::io::HdrRead;
use super::scan::ScanContext;
use crate::error::{AttachError, Result};
use crate::nand::Nand;

/// What became of a LEB copy handed to [add_leb]
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Placement {
    /// It is now the authoritative copy
    Kept,

    /// A newer copy already exists
    Superseded,

    /// It claimed to be newer, but its data failed the CRC check
    Corrupted,
}

/// The outcome of comparing two copies of one LEB
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub(crate) struct Verdict {
    /// The copy being added beats the recorded one
    pub new_wins: bool,

    /// Bitflips were seen while checking the newer copy
    pub bitflips: bool,

    /// The copy that was checked had a bad data CRC
    pub corrupted: bool,
}

/// Make sure a VID header agrees with everything seen of its volume so far
fn check_consistency(volume: &Volume, vid: &Vid, pnum: u32) -> Result<()> {
    let field = if volume.vol_type != vid.vol_type {
        "vol_type"
    } else if volume.used_ebs != vid.used_ebs {
        "used_ebs"
    } else if volume.data_pad != vid.data_pad {
        "data_pad"
    } else if volume.compat != vid.compat {
        "compat"
    } else {
        return Ok(());
    };

    log::error!("inconsistent VID header at PEB {pnum}: {vid:?}");
    Err(AttachError::InconsistentVolume {
        vol_id: vid.vol_id,
        pnum,
        field,
    })
}

/// Record slot `slot` of the PEB `handle`, described by `vid`, in the volume directory
///
/// The PEB's reference count goes up if the copy is kept. If it replaces an older copy, the
/// older copy's PEB loses a reference instead (and is queued for erasure once unreferenced).
pub fn add_leb<N: Nand>(
    ctx: &mut ScanContext<'_, N>,
    ai: &mut AttachInfo,
    handle: PebHandle,
    slot: u32,
    vid: &Vid,
) -> Result<Placement> {
    let pnum = ai.peb(handle).pnum;
    let sqnum = ai.peb(handle).sqnum + u64::from(slot);
    let (vol_id, lnum) = (vid.vol_id, vid.lnum);

    log::debug!("PEB {pnum}, LEB {vol_id}:{lnum}, sqnum {sqnum}, copy_flag {}", vid.copy_flag);
    ai.max_sqnum = ai.max_sqnum.max(sqnum);

    let volume = ai.volume_entry(Volume::new(
        vol_id,
        vid.vol_type,
        vid.used_ebs,
        vid.data_pad,
        vid.compat,
    ));
    check_consistency(volume, vid, pnum)?;

    let new_leb = LogicalBlock {
        lnum,
        copy_flag: vid.copy_flag,
        peb: handle,
        slot,
        sqnum,
        data_size: vid.data_size,
    };

    let Some(old) = volume.leb(lnum).cloned() else {
        let inserted = volume.insert_leb(new_leb);
        debug_assert!(inserted);
        ai.take_ref(handle);
        return Ok(Placement::Kept);
    };

    let old_pnum = ai.peb(old.peb).pnum;
    log::debug!("this LEB is already found at PEB {old_pnum}, sqnum {}", old.sqnum);

    if old.sqnum == sqnum && sqnum != 0 {
        log::error!("two LEBs with same sequence number {sqnum}");
        return Err(AttachError::DuplicateSqnum {
            vol_id,
            lnum,
            sqnum,
            first: old_pnum,
            second: pnum,
        });
    }

    let verdict = compare_copies(ctx, &old, old_pnum, &new_leb, pnum, vid)?;

    if verdict.new_wins {
        if let Some(volume) = ai.volume_mut(vol_id) {
            volume.replace_leb(new_leb);
        }
        ai.take_ref(handle);
        if verdict.bitflips {
            ai.peb_mut(handle).scrub = true;
        }
        ai.drop_ref(old.peb, verdict.corrupted);
        Ok(Placement::Kept)
    } else {
        if verdict.bitflips {
            ai.peb_mut(old.peb).scrub = true;
        }
        Ok(if verdict.corrupted {
            Placement::Corrupted
        } else {
            Placement::Superseded
        })
    }
}

/// Decide which of two copies of a LEB is the one to keep
///
/// Only the copy with the higher sequence number can win outright, and only if its copy flag
/// is unset. Otherwise its data is read back and CRC-checked, and if that fails, the older copy
/// wins after all.
pub(crate) fn compare_copies<N: Nand>(
    ctx: &mut ScanContext<'_, N>,
    old: &LogicalBlock,
    old_pnum: u32,
    new: &LogicalBlock,
    new_pnum: u32,
    new_vid: &Vid,
) -> Result<Verdict> {
    if old.sqnum == new.sqnum {
        // Equal non-zero numbers are caught by the caller, so both must be zero: UBI images
        // this old have no way to order copies
        log::error!("unsupported on-flash UBI format");
        return Err(AttachError::LegacyFormat {
            vol_id: new_vid.vol_id,
            lnum: new_vid.lnum,
        });
    }

    let mut verdict = Verdict {
        new_wins: new.sqnum > old.sqnum,
        ..Default::default()
    };

    let (pnum, slot, vid) = if verdict.new_wins {
        if !new.copy_flag {
            log::debug!("second PEB {new_pnum} is newer, copy_flag is unset");
            return Ok(verdict);
        }
        (new_pnum, new.slot, *new_vid)
    } else {
        if !old.copy_flag {
            log::debug!("first PEB {old_pnum} is newer, copy_flag is unset");
            return Ok(verdict);
        }

        // The recorded copy's header wasn't kept around, so read it again
        let vids = match ctx.io.read_vid_hdrs(old_pnum)? {
            HdrRead::Valid(vids) => vids,
            HdrRead::Bitflips(vids) => {
                verdict.bitflips = true;
                vids
            }
            _ => Vec::new(),
        };
        let vid = vids.get(old.slot as usize).copied().ok_or_else(|| {
            log::error!("VID of PEB {old_pnum} header is bad, but it was OK earlier");
            AttachError::VidHeaderLost { pnum: old_pnum }
        })?;
        (old_pnum, old.slot, vid)
    };

    let leb_size = ctx.io.geometry().leb_size();
    let mut buf = ctx.peb_buf.lock();
    let status = ctx.io.read_data(
        pnum,
        slot as usize * leb_size,
        vid.data_size as usize,
        &mut buf,
    )?;

    let crc = UBI_CRC.checksum(&buf);
    if crc != vid.data_crc {
        log::debug!(
            "PEB {pnum} CRC error: calculated {crc:#010x}, must be {:#010x}",
            vid.data_crc
        );
        verdict.corrupted = true;
        verdict.bitflips = false;
        verdict.new_wins = !verdict.new_wins;
    } else {
        log::debug!("PEB {pnum} CRC is OK");
        verdict.bitflips |= status.is_dirty();
    }

    if verdict.new_wins {
        log::debug!("second PEB {new_pnum} is newer, copy_flag is set");
    } else {
        log::debug!("first PEB {old_pnum} is newer, copy_flag is set");
    }

    Ok(verdict)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{Nand, SimFault, SimNand};
    use crate::ubi::attach::AttachConfig;
    use crate::ubi::attach_info::PebList;
    use crate::ubi::io::{Geometry, UbiIo};
    use crate::ubi::scan::scan_peb;
    use crate::ubi::testutil::*;

    /// Scan the given PEBs, in order
    fn scan_order(nand: &mut SimNand, order: &[u32]) -> Result<AttachInfo> {
        let io = UbiIo::new(nand, 1)?;
        let mut ctx = ScanContext::new(io, AttachConfig::default());
        let mut ai = AttachInfo::new();
        for &pnum in order {
            scan_peb(&mut ctx, &mut ai, pnum, false)?;
        }
        Ok(ai)
    }

    fn pnum_of(ai: &AttachInfo, vol_id: u32, lnum: u32) -> Option<u32> {
        let leb = ai.volume(vol_id)?.leb(lnum)?;
        Some(ai.peb(leb.peb).pnum)
    }

    #[test]
    fn test_newer_copy_wins_without_reading() -> anyhow::Result<()> {
        let mut nand = SimNand::new(layout_with_blocks(2));
        let geometry = Geometry::new(nand.get_layout(), 1)?;
        write_leb(&mut nand, &geometry, 0, 1, dyn_vid(0, 0, 5), b"old")?;
        write_leb(&mut nand, &geometry, 1, 1, dyn_vid(0, 0, 9), b"new")?;

        // Any attempt to read the payloads would fail
        for pnum in 0..2 {
            for page in 2..geometry.pages_per_block {
                nand.inject_fault(pnum, page, SimFault::ReadError);
            }
        }

        for order in [[0, 1], [1, 0]] {
            let ai = scan_order(&mut nand, &order)?;
            assert_eq!(pnum_of(&ai, 0, 0), Some(1));
            assert_eq!(ai.list_pnums(PebList::Erase), [0]);
            assert_eq!(ai.max_sqnum, 9);
        }

        Ok(())
    }

    #[test]
    fn test_copy_with_bad_crc_loses() -> anyhow::Result<()> {
        let mut nand = SimNand::new(layout_with_blocks(3));
        let geometry = Geometry::new(nand.get_layout(), 1)?;
        write_leb(&mut nand, &geometry, 0, 1, dyn_vid(0, 0, 5), b"original")?;
        write_leb(&mut nand, &geometry, 1, 1, copy_of(dyn_vid(0, 0, 8), b"original"), b"origXnal")?;
        write_leb(&mut nand, &geometry, 2, 1, dyn_vid(0, 1, 3), b"other")?;

        for order in [[0, 1, 2], [2, 1, 0]] {
            let ai = scan_order(&mut nand, &order)?;

            // The copy is newer, but its data is damaged, so the original is kept
            assert_eq!(pnum_of(&ai, 0, 0), Some(0));
            assert!(!ai.peb(ai.volume(0).unwrap().leb(0).unwrap().peb).scrub);
            assert_eq!(ai.list_pnums(PebList::Erase), [1]);
            assert_eq!(ai.max_sqnum, 8);
        }

        Ok(())
    }

    #[test]
    fn test_good_copy_wins() -> anyhow::Result<()> {
        let mut nand = SimNand::new(layout_with_blocks(2));
        let geometry = Geometry::new(nand.get_layout(), 1)?;
        write_leb(&mut nand, &geometry, 0, 1, dyn_vid(0, 0, 5), b"payload")?;
        write_leb(&mut nand, &geometry, 1, 1, copy_of(dyn_vid(0, 0, 8), b"payload"), b"payload")?;
        nand.inject_fault(1, 2, SimFault::Bitflips);

        for order in [[0, 1], [1, 0]] {
            let ai = scan_order(&mut nand, &order)?;
            let leb = ai.volume(0).unwrap().leb(0).unwrap();
            assert_eq!(ai.peb(leb.peb).pnum, 1);
            assert!(leb.copy_flag);
            assert!(ai.peb(leb.peb).scrub);
            assert_eq!(ai.list_pnums(PebList::Erase), [0]);
        }

        Ok(())
    }

    #[test]
    fn test_recorded_copy_loses_its_header() -> anyhow::Result<()> {
        let mut nand = SimNand::new(layout_with_blocks(2));
        let geometry = Geometry::new(nand.get_layout(), 1)?;
        write_leb(&mut nand, &geometry, 0, 1, copy_of(dyn_vid(0, 0, 8), b"moved"), b"moved")?;
        write_leb(&mut nand, &geometry, 1, 1, dyn_vid(0, 0, 5), b"original")?;

        let mut ai = scan_order(&mut nand, &[0])?;
        assert_eq!(pnum_of(&ai, 0, 0), Some(0));

        // The recorded copy is newer and must be CRC-checked, but its header is gone now
        corrupt_vid(&mut nand, &geometry, 0);
        let io = UbiIo::new(&mut nand, 1)?;
        let mut ctx = ScanContext::new(io, AttachConfig::default());
        let err = scan_peb(&mut ctx, &mut ai, 1, false).unwrap_err();
        assert!(matches!(err, AttachError::VidHeaderLost { pnum: 0 }));

        Ok(())
    }

    #[test]
    fn test_sequence_conflicts() -> anyhow::Result<()> {
        let mut nand = SimNand::new(layout_with_blocks(2));
        let geometry = Geometry::new(nand.get_layout(), 1)?;
        write_leb(&mut nand, &geometry, 0, 1, dyn_vid(0, 0, 7), &[])?;
        write_leb(&mut nand, &geometry, 1, 1, dyn_vid(0, 0, 7), &[])?;
        let err = scan_order(&mut nand, &[0, 1]).unwrap_err();
        assert!(matches!(
            err,
            AttachError::DuplicateSqnum {
                vol_id: 0,
                lnum: 0,
                sqnum: 7,
                first: 0,
                second: 1
            }
        ));

        let mut nand = SimNand::new(layout_with_blocks(2));
        write_leb(&mut nand, &geometry, 0, 1, dyn_vid(0, 0, 0), &[])?;
        write_leb(&mut nand, &geometry, 1, 1, dyn_vid(0, 0, 0), &[])?;
        let err = scan_order(&mut nand, &[0, 1]).unwrap_err();
        assert!(matches!(err, AttachError::LegacyFormat { vol_id: 0, lnum: 0 }));

        Ok(())
    }

    #[test]
    fn test_inconsistent_volume_any_order() -> anyhow::Result<()> {
        let mut nand = SimNand::new(layout_with_blocks(3));
        let geometry = Geometry::new(nand.get_layout(), 1)?;
        let leb_size = geometry.leb_size() as u32;
        write_leb(&mut nand, &geometry, 0, 1, dyn_vid(2, 0, 1), &[])?;
        write_leb(&mut nand, &geometry, 1, 1, dyn_vid(2, 1, 2), &[])?;
        let payload = vec![0x42; leb_size as usize];
        write_leb(
            &mut nand,
            &geometry,
            2,
            1,
            with_data(static_vid(2, 0, 3, 2, leb_size), &payload),
            &payload,
        )?;

        for order in [[0, 1, 2], [2, 0, 1], [1, 2, 0]] {
            let err = scan_order(&mut nand, &order).unwrap_err();
            assert!(
                matches!(err, AttachError::InconsistentVolume { vol_id: 2, field: "vol_type", .. }),
                "order {order:?}: {err}"
            );
        }

        Ok(())
    }

    #[test]
    fn test_highest_lnum_tracking() -> anyhow::Result<()> {
        let mut nand = SimNand::new(layout_with_blocks(3));
        let geometry = Geometry::new(nand.get_layout(), 1)?;
        let a = b"abc";
        let b = b"defgh";
        write_leb(&mut nand, &geometry, 0, 1, static_vid(1, 1, 1, 2, 3), a)?;
        write_leb(&mut nand, &geometry, 1, 1, copy_of(static_vid(1, 1, 4, 2, 0), b), b)?;
        let full = vec![0u8; geometry.leb_size()];
        write_leb(&mut nand, &geometry, 2, 1, with_data(static_vid(1, 0, 2, 2, 0), &full), &full)?;

        let ai = scan_order(&mut nand, &[0, 2, 1])?;
        let volume = ai.volume(1).unwrap();
        assert_eq!(volume.highest_lnum, 1);
        assert_eq!(volume.last_data_size, 5);
        assert_eq!(volume.leb_count, 2);

        Ok(())
    }
}
