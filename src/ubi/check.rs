//! Debug checks on finished attach information: everything recorded must agree with itself and
//! with what is on the flash.

use super::attach::scan_all;
use super::attach_info::AttachInfo;
use super::headers::*;
use super::io::HdrRead;
use super::scan::ScanContext;
use crate::error::{AttachError, Result};
use crate::nand::Nand;

use std::collections::{BTreeMap, BTreeSet};

macro_rules! fail {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        log::error!("self-check failed: {msg}");
        return Err(AttachError::SelfCheck(msg));
    }};
}

/// Check that `ai` is internally consistent, matches the VID headers on flash, and accounts for
/// every good PEB exactly once
pub fn self_check<N: Nand>(ctx: &mut ScanContext<'_, N>, ai: &AttachInfo) -> Result<()> {
    log::debug!("checking attach information");

    check_volumes(ai)?;
    check_headers(ctx, ai)?;
    check_partition(ctx, ai)?;

    Ok(())
}

/// Per-volume bookkeeping
fn check_volumes(ai: &AttachInfo) -> Result<()> {
    let mut vols_found = 0;
    let mut highest_vol_id = 0;
    let mut refs: BTreeMap<_, u32> = BTreeMap::new();

    for volume in ai.volumes() {
        let vol_id = volume.vol_id;
        vols_found += 1;
        highest_vol_id = highest_vol_id.max(vol_id);

        if vol_id >= UBI_MAX_VOLUMES && !is_internal_volume(vol_id) {
            fail!("volume ID {vol_id} out of range");
        }
        match volume.vol_type {
            VolType::Dynamic if volume.used_ebs != 0 => {
                fail!("dynamic volume {vol_id} has used_ebs {}", volume.used_ebs)
            }
            _ => (),
        }

        let mut leb_count = 0;
        let mut highest_lnum = 0;
        for leb in volume.lebs() {
            leb_count += 1;
            highest_lnum = highest_lnum.max(leb.lnum);
            *refs.entry(leb.peb).or_default() += 1;

            if volume.vol_type == VolType::Static && leb.lnum >= volume.used_ebs {
                fail!(
                    "static volume {vol_id} has LEB {} beyond used_ebs {}",
                    leb.lnum,
                    volume.used_ebs
                );
            }

            if ai.ec_count > 0 {
                let ec = ai.peb(leb.peb).ec.unwrap_or(ai.mean_ec);
                if ec < ai.min_ec || ec > ai.max_ec {
                    fail!(
                        "LEB {vol_id}:{} has EC {ec}, outside {}..={}",
                        leb.lnum,
                        ai.min_ec,
                        ai.max_ec
                    );
                }
            }
        }

        if leb_count != volume.leb_count {
            fail!(
                "volume {vol_id} counts {} LEBs but has {leb_count}",
                volume.leb_count
            );
        }
        if leb_count > 0 && highest_lnum != volume.highest_lnum {
            fail!(
                "volume {vol_id} has highest LEB {highest_lnum}, recorded as {}",
                volume.highest_lnum
            );
        }
    }

    if vols_found != ai.vols_found {
        fail!("{vols_found} volumes present, {} recorded", ai.vols_found);
    }
    if vols_found > 0 && highest_vol_id != ai.highest_vol_id {
        fail!(
            "highest volume ID is {highest_vol_id}, recorded as {}",
            ai.highest_vol_id
        );
    }

    for (handle, peb) in ai.pebs() {
        let expected = refs.get(&handle).copied().unwrap_or(0);
        if peb.refs() != expected {
            fail!(
                "PEB {} has {} references, but {expected} LEBs point to it",
                peb.pnum,
                peb.refs()
            );
        }
    }

    Ok(())
}

/// Re-read the VID header behind every LEB and compare it to the record
fn check_headers<N: Nand>(ctx: &mut ScanContext<'_, N>, ai: &AttachInfo) -> Result<()> {
    for volume in ai.volumes() {
        for leb in volume.lebs() {
            let pnum = ai.peb(leb.peb).pnum;
            let vids = match ctx.io.read_vid_hdrs(pnum)? {
                HdrRead::Valid(vids) | HdrRead::Bitflips(vids) => vids,
                _ => fail!("no VID header in PEB {pnum}"),
            };
            let Some(vid) = vids.get(leb.slot as usize) else {
                fail!("no VID header in slot {} of PEB {pnum}", leb.slot);
            };

            let mismatch = if vid.vol_type != volume.vol_type {
                Some("vol_type")
            } else if vids[0].sqnum + u64::from(leb.slot) != leb.sqnum {
                Some("sqnum")
            } else if vid.vol_id != volume.vol_id {
                Some("vol_id")
            } else if vid.compat != volume.compat {
                Some("compat")
            } else if vid.lnum != leb.lnum {
                Some("lnum")
            } else if vid.used_ebs != volume.used_ebs {
                Some("used_ebs")
            } else if vid.data_pad != volume.data_pad {
                Some("data_pad")
            } else if leb.lnum == volume.highest_lnum && vid.data_size != volume.last_data_size {
                Some("last data_size")
            } else {
                None
            };

            if let Some(field) = mismatch {
                log::error!("VID header of PEB {pnum}: {vid:?}");
                fail!("{field} of LEB {}:{} disagrees with flash", volume.vol_id, leb.lnum);
            }
        }
    }

    Ok(())
}

/// Every good PEB must be in exactly one place, and no PEB record may be unaccounted for
fn check_partition<N: Nand>(ctx: &mut ScanContext<'_, N>, ai: &AttachInfo) -> Result<()> {
    let locations = ai.peb_locations();

    for pnum in 0..ctx.io.peb_count() {
        let found = locations.get(&pnum).map_or(0, Vec::len);
        if ctx.io.is_bad(pnum)? {
            if found != 0 {
                fail!("bad PEB {pnum} is in use");
            }
        } else if found != 1 {
            fail!(
                "PEB {pnum} accounted for {found} times: {:?}",
                locations.get(&pnum)
            );
        }
    }

    if let Some((&pnum, _)) = locations.range(ctx.io.peb_count()..).next() {
        fail!("PEB {pnum} is beyond the end of the device");
    }

    let live = ai.pebs().count();
    let placed: usize = locations.values().map(Vec::len).sum();
    if live != placed {
        fail!("{live} PEB records, but only {placed} are on a list or back a LEB");
    }

    Ok(())
}

/// Scan the whole device afresh and check that it agrees with `fm_ai`, which came from a fastmap
pub fn compare_with_full_scan<N: Nand>(
    ctx: &mut ScanContext<'_, N>,
    fm_ai: &AttachInfo,
) -> Result<()> {
    log::debug!("comparing fastmap with a full scan");

    let mut full = AttachInfo::new();
    scan_all(ctx, &mut full, 0)?;

    let fm_vols: BTreeSet<u32> = fm_ai.volumes().map(|v| v.vol_id).collect();
    let full_vols: BTreeSet<u32> = full.volumes().map(|v| v.vol_id).collect();
    if fm_vols != full_vols {
        fail!("fastmap has volumes {fm_vols:?}, full scan found {full_vols:?}");
    }

    for volume in fm_ai.volumes() {
        let vol_id = volume.vol_id;
        let Some(other) = full.volume(vol_id) else {
            fail!("volume {vol_id} missing from the full scan");
        };
        if (volume.vol_type, volume.used_ebs, volume.data_pad)
            != (other.vol_type, other.used_ebs, other.data_pad)
        {
            fail!("volume {vol_id} differs between fastmap and full scan");
        }

        let fm_eba = fm_ai.eba_table(vol_id);
        let full_eba = full.eba_table(vol_id);
        if fm_eba != full_eba {
            fail!("EBA table of volume {vol_id}: fastmap {fm_eba:?}, full scan {full_eba:?}");
        }
    }

    Ok(())
}
