//! Attaching from a fastmap: a snapshot of the attach information, written to flash so that the
//! next attach doesn't have to read every PEB.
//!
//! A fastmap consists of a superblock (LEB 0 of [UBI_FM_SB_VOLUME_ID]) that lists the PEBs
//! holding the fastmap data (LEB `i` of [UBI_FM_DATA_VOLUME_ID]). The data is a [FmData] record,
//! padded with 0xFF to fill those LEBs, and protected by a CRC kept in the superblock.
//!
//! PEBs in the fastmap's "pool" may have been written after the fastmap was, so they are scanned
//! normally on attach.

use super::attach_info::{AttachInfo, LogicalBlock, PebHandle, PebList, Volume};
use super::headers::*;
use super::io::HdrRead;
use super::scan::{scan_peb, ScanContext};
use crate::error::Result;
use crate::nand::{Nand, ReadStatus};

use deku::prelude::*;

use std::collections::{BTreeMap, BTreeSet};

/// The fastmap superblock must be in one of the PEBs below this number
pub const UBI_FM_MAX_START: u32 = 64;

/// The most PEBs fastmap data may span
pub const UBI_FM_MAX_BLOCKS: usize = 32;

pub const UBI_FM_SB_MAGIC: u32 = 0x7B11_D69F;
pub const UBI_FM_DATA_MAGIC: u32 = 0xD4B8_2EF7;
pub const UBI_FM_FMT_VERSION: u8 = 1;

/// The fastmap superblock
#[derive(Debug, Clone, Eq, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct FmSuperblock {
    pub magic: u32,
    pub version: u8,
    pub padding: [u8; 3],

    /// The CRC of all fastmap data blocks, including padding
    pub data_crc: u32,
    pub sqnum: u64,

    /// How many entries of `block_loc` and `block_ec` are in use
    pub used_blocks: u32,
    pub block_loc: [u32; UBI_FM_MAX_BLOCKS],
    pub block_ec: [u64; UBI_FM_MAX_BLOCKS],
}

impl FmSuperblock {
    /// A superblock for fastmap data stored in `blocks`, given as `(pnum, ec)` pairs
    pub fn new(sqnum: u64, data_crc: u32, blocks: &[(u32, u64)]) -> Self {
        let mut block_loc = [0; UBI_FM_MAX_BLOCKS];
        let mut block_ec = [0; UBI_FM_MAX_BLOCKS];
        for (i, &(pnum, ec)) in blocks.iter().take(UBI_FM_MAX_BLOCKS).enumerate() {
            block_loc[i] = pnum;
            block_ec[i] = ec;
        }

        Self {
            magic: UBI_FM_SB_MAGIC,
            version: UBI_FM_FMT_VERSION,
            padding: Default::default(),
            data_crc,
            sqnum,
            used_blocks: blocks.len().min(UBI_FM_MAX_BLOCKS) as u32,
            block_loc,
            block_ec,
        }
    }
}

/// A PEB and its erase counter
#[derive(Debug, Copy, Clone, Eq, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct FmEcEntry {
    pub pnum: u32,
    pub ec: u64,
}

/// Where one LEB lives
#[derive(Debug, Copy, Clone, Eq, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct FmLeb {
    pub lnum: u32,
    pub pnum: u32,
    pub slot: u8,
    pub copy_flag: u8,
    pub padding: [u8; 2],
    pub data_size: u32,
    pub sqnum: u64,
}

/// One volume and its LEBs
#[derive(Debug, Clone, Eq, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct FmVolume {
    pub vol_id: u32,
    pub vol_type: u8,
    pub compat: u8,
    pub padding: [u8; 2],
    pub used_ebs: u32,
    pub data_pad: u32,
    pub last_data_size: u32,
    pub leb_count: u32,
    #[deku(count = "leb_count")]
    pub lebs: Vec<FmLeb>,
}

/// The body of a fastmap
#[derive(Debug, Clone, Eq, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct FmData {
    pub magic: u32,

    pub pool_count: u32,
    /// PEBs that may have been written since the fastmap was
    #[deku(count = "pool_count")]
    pub pool: Vec<u32>,

    pub free_count: u32,
    #[deku(count = "free_count")]
    pub free: Vec<FmEcEntry>,

    pub used_count: u32,
    #[deku(count = "used_count")]
    pub used: Vec<FmEcEntry>,

    pub scrub_count: u32,
    /// Used PEBs that need scrubbing
    #[deku(count = "scrub_count")]
    pub scrub: Vec<FmEcEntry>,

    pub erase_count: u32,
    #[deku(count = "erase_count")]
    pub erase: Vec<FmEcEntry>,

    pub vol_count: u32,
    #[deku(count = "vol_count")]
    pub volumes: Vec<FmVolume>,
}

impl Default for FmData {
    fn default() -> Self {
        Self {
            magic: UBI_FM_DATA_MAGIC,
            pool_count: 0,
            pool: Vec::new(),
            free_count: 0,
            free: Vec::new(),
            used_count: 0,
            used: Vec::new(),
            scrub_count: 0,
            scrub: Vec::new(),
            erase_count: 0,
            erase: Vec::new(),
            vol_count: 0,
            volumes: Vec::new(),
        }
    }
}

impl FmData {
    /// Bring the count fields in line with the lists, for encoding
    pub fn fix_counts(&mut self) {
        self.pool_count = self.pool.len() as u32;
        self.free_count = self.free.len() as u32;
        self.used_count = self.used.len() as u32;
        self.scrub_count = self.scrub.len() as u32;
        self.erase_count = self.erase.len() as u32;
        self.vol_count = self.volumes.len() as u32;
        for volume in &mut self.volumes {
            volume.leb_count = volume.lebs.len() as u32;
        }
    }
}

/// What was found while looking for a fastmap
#[derive(Debug)]
pub enum FastmapScan {
    /// There is no fastmap superblock
    NoFastmap,

    /// There is a fastmap, but it can't be used
    Invalid(String),

    /// The attach information, rebuilt from the fastmap
    Attached(AttachInfo),
}

/// Tracks which PEBs a fastmap mentions
struct Claims {
    claimed: Vec<bool>,
}

impl Claims {
    fn new(peb_count: u32) -> Self {
        Self {
            claimed: vec![false; peb_count as usize],
        }
    }

    /// Claim a PEB, failing if it is out of range or already claimed
    fn claim(&mut self, pnum: u32) -> std::result::Result<(), String> {
        match self.claimed.get_mut(pnum as usize) {
            None => Err(format!("PEB {pnum} out of range")),
            Some(true) => Err(format!("PEB {pnum} referenced more than once")),
            Some(claimed) => {
                *claimed = true;
                Ok(())
            }
        }
    }

    fn is_claimed(&self, pnum: u32) -> bool {
        self.claimed.get(pnum as usize).copied().unwrap_or(false)
    }

    fn unclaimed(&self) -> impl Iterator<Item = u32> + '_ {
        self.claimed
            .iter()
            .enumerate()
            .filter(|(_, &claimed)| !claimed)
            .map(|(pnum, _)| pnum as u32)
    }
}

macro_rules! invalid {
    ($($arg:tt)*) => {
        return Ok(FastmapScan::Invalid(format!($($arg)*)))
    };
}

/// Look for a fastmap among the PEBs of `scan_ai`, and if there is a good one, rebuild the attach
/// information from it
pub fn scan_fastmap<N: Nand>(
    ctx: &mut ScanContext<'_, N>,
    scan_ai: &AttachInfo,
) -> Result<FastmapScan> {
    let newest = scan_ai
        .list(PebList::Fastmap)
        .filter(|peb| peb.vol_id == Some(UBI_FM_SB_VOLUME_ID))
        .max_by_key(|peb| peb.sqnum);
    let Some(sb_peb) = newest else {
        return Ok(FastmapScan::NoFastmap);
    };
    let sb_pnum = sb_peb.pnum;
    log::debug!("fastmap superblock at PEB {sb_pnum}, sqnum {}", sb_peb.sqnum);

    let leb_size = ctx.io.geometry().leb_size();
    let peb_count = ctx.io.peb_count();

    let sb = {
        let mut buf = ctx.peb_buf.lock();
        if ctx.io.read_data(sb_pnum, 0, leb_size, &mut buf)? == ReadStatus::Uncorrectable {
            invalid!("superblock PEB {sb_pnum} is unreadable");
        }
        match FmSuperblock::from_bytes((buf.as_slice(), 0)) {
            Ok((_, sb)) => sb,
            Err(err) => invalid!("cannot decode superblock: {err}"),
        }
    };

    if sb.magic != UBI_FM_SB_MAGIC {
        invalid!("bad superblock magic {:#010x}", sb.magic);
    }
    if sb.version != UBI_FM_FMT_VERSION {
        invalid!("unsupported fastmap version {}", sb.version);
    }
    let used_blocks = sb.used_blocks as usize;
    if !(1..=UBI_FM_MAX_BLOCKS).contains(&used_blocks) {
        invalid!("fastmap claims {used_blocks} data blocks");
    }
    let blocks: Vec<(u32, u64)> = sb.block_loc[..used_blocks]
        .iter()
        .copied()
        .zip(sb.block_ec[..used_blocks].iter().copied())
        .collect();

    let mut raw = Vec::with_capacity(used_blocks * leb_size);
    let mut data_sqnum = 0;
    for (i, &(pnum, _)) in blocks.iter().enumerate() {
        if pnum >= peb_count {
            invalid!("fastmap data block {i} at out-of-range PEB {pnum}");
        }
        let vid = match ctx.io.read_vid_hdrs(pnum)? {
            HdrRead::Valid(vids) | HdrRead::Bitflips(vids) => vids[0],
            _ => invalid!("fastmap data block {i} at PEB {pnum} has no VID header"),
        };
        if vid.vol_id != UBI_FM_DATA_VOLUME_ID || vid.lnum as usize != i {
            invalid!(
                "PEB {pnum} holds LEB {}:{}, not fastmap data block {i}",
                vid.vol_id,
                vid.lnum
            );
        }
        data_sqnum = data_sqnum.max(vid.sqnum);

        let mut buf = ctx.peb_buf.lock();
        if ctx.io.read_data(pnum, 0, leb_size, &mut buf)? == ReadStatus::Uncorrectable {
            invalid!("fastmap data block {i} at PEB {pnum} is unreadable");
        }
        raw.extend_from_slice(&buf);
    }

    let crc = UBI_CRC.checksum(&raw);
    if crc != sb.data_crc {
        invalid!("data CRC {crc:#010x}, expected {:#010x}", sb.data_crc);
    }

    let data = match FmData::from_bytes((raw.as_slice(), 0)) {
        Ok((_, data)) => data,
        Err(err) => invalid!("cannot decode fastmap data: {err}"),
    };
    if data.magic != UBI_FM_DATA_MAGIC {
        invalid!("bad fastmap data magic {:#010x}", data.magic);
    }

    let mut claims = Claims::new(peb_count);
    let lists = [&data.free, &data.used, &data.scrub, &data.erase];
    let claimed = std::iter::once(sb_pnum)
        .chain(blocks.iter().map(|&(pnum, _)| pnum))
        .chain(data.pool.iter().copied())
        .chain(lists.into_iter().flatten().map(|entry| entry.pnum));
    for pnum in claimed {
        if let Err(reason) = claims.claim(pnum) {
            invalid!("{reason}");
        }
    }

    let mut ai = AttachInfo::new();
    ai.image_seq = scan_ai.image_seq;
    ai.max_sqnum = sb.sqnum.max(data_sqnum);

    for entry in &data.free {
        ai.add_to_list(PebList::Free, entry.pnum, Some(entry.ec), false);
        ai.note_ec(entry.ec);
    }
    for entry in &data.erase {
        ai.add_to_list(PebList::Erase, entry.pnum, Some(entry.ec), false);
        ai.note_ec(entry.ec);
    }

    let mut used: BTreeMap<u32, (u64, bool)> = BTreeMap::new();
    for (entries, scrub) in [(&data.used, false), (&data.scrub, true)] {
        for entry in entries {
            used.insert(entry.pnum, (entry.ec, scrub));
            ai.note_ec(entry.ec);
        }
    }

    let lebs_per_peb = ctx.config.lebs_per_peb;
    let mut handles: BTreeMap<u32, PebHandle> = BTreeMap::new();
    let mut filled: BTreeSet<(u32, u32)> = BTreeSet::new();
    let mut seen_vols: BTreeSet<u32> = BTreeSet::new();
    for fm_vol in &data.volumes {
        if !seen_vols.insert(fm_vol.vol_id) {
            invalid!("volume {} recorded twice", fm_vol.vol_id);
        }
        let Ok(vol_type) = VolType::try_from(fm_vol.vol_type) else {
            invalid!("volume {} has bad type {}", fm_vol.vol_id, fm_vol.vol_type);
        };

        let mut lebs: BTreeMap<u32, LogicalBlock> = BTreeMap::new();
        for fm_leb in &fm_vol.lebs {
            let Some(&(ec, scrub)) = used.get(&fm_leb.pnum) else {
                invalid!(
                    "LEB {}:{} is in PEB {}, which is not a used PEB",
                    fm_vol.vol_id,
                    fm_leb.lnum,
                    fm_leb.pnum
                );
            };

            let slot = u32::from(fm_leb.slot);
            if slot >= lebs_per_peb {
                invalid!(
                    "LEB {}:{} is in slot {slot} of PEB {}, which has {lebs_per_peb}",
                    fm_vol.vol_id,
                    fm_leb.lnum,
                    fm_leb.pnum
                );
            }
            if !filled.insert((fm_leb.pnum, slot)) {
                invalid!("slot {slot} of PEB {} holds two LEBs", fm_leb.pnum);
            }
            let Some(peb_sqnum) = fm_leb.sqnum.checked_sub(u64::from(slot)) else {
                invalid!(
                    "LEB {}:{} has sqnum {} in slot {slot}",
                    fm_vol.vol_id,
                    fm_leb.lnum,
                    fm_leb.sqnum
                );
            };

            let handle = *handles
                .entry(fm_leb.pnum)
                .or_insert_with(|| ai.new_peb(fm_leb.pnum, Some(ec)));
            let peb = ai.peb_mut(handle);
            peb.vol_id = Some(fm_vol.vol_id);
            peb.sqnum = peb_sqnum;
            peb.scrub = scrub;
            if ctx.config.lebs_per_peb > 1 {
                let slots = peb.slots.get_or_insert_with(Vec::new);
                if slots.len() <= slot as usize {
                    slots.resize(slot as usize + 1, 0);
                }
                slots[slot as usize] = fm_leb.lnum;
            }
            ai.take_ref(handle);
            ai.max_sqnum = ai.max_sqnum.max(fm_leb.sqnum);

            let leb = LogicalBlock {
                lnum: fm_leb.lnum,
                copy_flag: fm_leb.copy_flag != 0,
                peb: handle,
                slot,
                sqnum: fm_leb.sqnum,
                data_size: fm_leb.data_size,
            };
            if lebs.insert(fm_leb.lnum, leb).is_some() {
                invalid!("LEB {}:{} recorded twice", fm_vol.vol_id, fm_leb.lnum);
            }
        }

        let volume = ai.volume_entry(Volume::new(
            fm_vol.vol_id,
            vol_type,
            fm_vol.used_ebs,
            fm_vol.data_pad,
            fm_vol.compat,
        ));
        for leb in lebs.into_values() {
            if !volume.insert_leb(leb) {
                invalid!("volume {} has overlapping LEB records", fm_vol.vol_id);
            }
        }
        if volume.last_data_size != fm_vol.last_data_size {
            invalid!("volume {} has inconsistent last_data_size", fm_vol.vol_id);
        }
    }

    if let Some(pnum) = used.keys().find(|pnum| !handles.contains_key(pnum)) {
        invalid!("used PEB {pnum} holds no LEB");
    }

    let current: BTreeSet<u32> = blocks.iter().map(|&(pnum, _)| pnum).collect();
    for peb in scan_ai.list(PebList::Fastmap) {
        let handle = if peb.pnum == sb_pnum || current.contains(&peb.pnum) {
            ai.add_to_list(PebList::Fastmap, peb.pnum, peb.ec, false)
        } else if !claims.is_claimed(peb.pnum) {
            // An older fastmap, which the current one didn't know about
            claims.claim(peb.pnum).ok();
            ai.add_to_list(PebList::Erase, peb.pnum, peb.ec, false)
        } else {
            continue;
        };
        let record = ai.peb_mut(handle);
        record.vol_id = peb.vol_id;
        record.sqnum = peb.sqnum;
    }
    for &(pnum, ec) in &blocks {
        if !scan_ai.list(PebList::Fastmap).any(|peb| peb.pnum == pnum) {
            ai.add_to_list(PebList::Fastmap, pnum, Some(ec), false);
        }
    }

    for pnum in claims.unclaimed().collect::<Vec<_>>() {
        if ctx.io.is_bad(pnum)? {
            ai.bad_peb_count += 1;
        } else {
            invalid!("PEB {pnum} is not referenced by the fastmap");
        }
    }

    log::debug!("fastmap pool: {:?}", data.pool);
    for &pnum in &data.pool {
        scan_peb(ctx, &mut ai, pnum, false)?;
    }

    ai.compute_mean_ec();
    ai.backfill_unknown_ec();

    log::info!(
        "attached by fastmap: {} volumes, {} pool PEBs scanned",
        ai.vols_found,
        data.pool.len()
    );
    Ok(FastmapScan::Attached(ai))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::SimNand;
    use crate::ubi::attach::{attach, AttachConfig, AttachStrategy};
    use crate::ubi::io::{Geometry, UbiIo};
    use crate::ubi::testutil::*;

    const FM_MAX_START: u32 = 8;

    /// A fastmap LEB entry for a dynamic LEB
    fn fm_leb(lnum: u32, pnum: u32, sqnum: u64) -> FmLeb {
        FmLeb {
            lnum,
            pnum,
            slot: 0,
            copy_flag: 0,
            padding: Default::default(),
            data_size: 0,
            sqnum,
        }
    }

    fn fm_volume(vol_id: u32, compat: u8, lebs: Vec<FmLeb>) -> FmVolume {
        FmVolume {
            vol_id,
            vol_type: VolType::Dynamic.into(),
            compat,
            padding: Default::default(),
            used_ebs: 0,
            data_pad: 0,
            last_data_size: 0,
            leb_count: 0,
            lebs,
        }
    }

    /// Build a 32-PEB device with a fastmap, letting `tweak` edit the fastmap before it is
    /// written:
    ///
    /// - PEBs 0, 1: volume table
    /// - PEB 2: fastmap superblock, PEB 3: fastmap data
    /// - PEBs 10, 11: LEBs 0 and 1 of volume 0
    /// - PEB 20: in the pool, holding a newer copy of LEB 0:1
    /// - everything else free
    fn build_device(tweak: impl FnOnce(&mut FmData)) -> anyhow::Result<(SimNand, Geometry)> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        let geometry = Geometry::new(TEST_LAYOUT, 1)?;

        let records = [vtbl_record("rootfs")];
        write_vtbl(&mut nand, &geometry, 0, 0, 1, &records)?;
        write_vtbl(&mut nand, &geometry, 1, 1, 2, &records)?;
        write_leb(&mut nand, &geometry, 10, 1, dyn_vid(0, 0, 10), b"zero")?;
        write_leb(&mut nand, &geometry, 11, 1, dyn_vid(0, 1, 11), b"one")?;
        write_leb(&mut nand, &geometry, 20, 1, dyn_vid(0, 1, 50), b"one again")?;

        let free: Vec<u32> = (4..32).filter(|pnum| ![10, 11, 20].contains(pnum)).collect();
        for &pnum in &free {
            write_ec(&mut nand, &geometry, pnum, 1)?;
        }

        let mut data = FmData {
            pool: vec![20],
            used: [0, 1, 10, 11]
                .into_iter()
                .map(|pnum| FmEcEntry { pnum, ec: 1 })
                .collect(),
            free: free
                .into_iter()
                .map(|pnum| FmEcEntry { pnum, ec: 1 })
                .collect(),
            volumes: vec![
                fm_volume(
                    UBI_LAYOUT_VOLUME_ID,
                    Compat::Reject.into(),
                    vec![fm_leb(0, 0, 1), fm_leb(1, 1, 2)],
                ),
                fm_volume(0, 0, vec![fm_leb(0, 10, 10), fm_leb(1, 11, 11)]),
            ],
            ..Default::default()
        };
        tweak(&mut data);
        data.fix_counts();
        write_fastmap(&mut nand, &geometry, 2, &[3], 20, &data)?;

        Ok((nand, geometry))
    }

    fn find_fastmap(nand: &mut SimNand) -> Result<FastmapScan> {
        let config = AttachConfig::default().fm_max_start(FM_MAX_START);
        let io = UbiIo::new(nand, 1)?;
        let mut ctx = ScanContext::new(io, config);
        let mut scan_ai = AttachInfo::new();
        for pnum in 0..FM_MAX_START {
            scan_peb(&mut ctx, &mut scan_ai, pnum, true)?;
        }
        scan_fastmap(&mut ctx, &scan_ai)
    }

    #[test]
    fn test_attach_by_fastmap() -> anyhow::Result<()> {
        let (mut nand, _) = build_device(|_| ())?;

        let FastmapScan::Attached(ai) = find_fastmap(&mut nand)? else {
            panic!("fastmap not used");
        };
        assert_eq!(ai.eba_table(0), Some(vec![(0, 10), (1, 20)]));
        assert_eq!(ai.list_pnums(PebList::Fastmap), [2, 3]);
        assert_eq!(ai.list_pnums(PebList::Erase), [11]);
        assert_eq!(ai.list_len(PebList::Free), 25);
        assert_eq!(ai.max_sqnum, 50);
        assert_eq!(ai.image_seq, TEST_IMAGE_SEQ);

        // The same, through the front door, cross-checked against a full scan
        let config = AttachConfig::default()
            .strategy(AttachStrategy::FastThenFull)
            .fm_max_start(FM_MAX_START)
            .self_check(true);
        let attached = attach(&mut nand, config)?;
        assert_eq!(attached.ai.eba_table(0), Some(vec![(0, 10), (1, 20)]));
        assert_eq!(attached.vtbl[&0].name, "rootfs");

        Ok(())
    }

    #[test]
    fn test_no_fastmap() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        assert!(matches!(find_fastmap(&mut nand)?, FastmapScan::NoFastmap));

        Ok(())
    }

    #[test]
    fn test_damaged_fastmap() -> anyhow::Result<()> {
        let (mut nand, geometry) = build_device(|_| ())?;
        // The pool entry, in the middle of the fastmap data
        nand.corrupt(3, geometry.data_offset() as usize + 10, &[0x99]);
        assert!(matches!(find_fastmap(&mut nand)?, FastmapScan::Invalid(_)));

        // A full scan still finds everything
        let config = AttachConfig::default()
            .strategy(AttachStrategy::FastThenFull)
            .fm_max_start(FM_MAX_START);
        let attached = attach(&mut nand, config)?;
        assert_eq!(attached.ai.eba_table(0), Some(vec![(0, 10), (1, 20)]));
        assert_eq!(attached.ai.list_pnums(PebList::Fastmap), [2, 3]);

        Ok(())
    }

    #[test]
    fn test_fastmap_must_cover_every_peb() -> anyhow::Result<()> {
        let forget_30 = |data: &mut FmData| data.free.retain(|entry| entry.pnum != 30);

        let (mut nand, _) = build_device(forget_30)?;
        match find_fastmap(&mut nand)? {
            FastmapScan::Invalid(reason) => assert!(reason.contains("PEB 30 is not referenced")),
            other => panic!("unexpected {other:?}"),
        }

        // Bad PEBs needn't be mentioned
        let (mut nand, _) = build_device(forget_30)?;
        nand.set_bad(30);
        let FastmapScan::Attached(ai) = find_fastmap(&mut nand)? else {
            panic!("fastmap not used");
        };
        assert_eq!(ai.bad_peb_count, 1);

        // Nor may a PEB be mentioned twice
        let (mut nand, _) = build_device(|data| data.erase.push(FmEcEntry { pnum: 10, ec: 1 }))?;
        match find_fastmap(&mut nand)? {
            FastmapScan::Invalid(reason) => assert!(reason.contains("more than once")),
            other => panic!("unexpected {other:?}"),
        }

        Ok(())
    }

    #[test]
    fn test_volume_recorded_twice() -> anyhow::Result<()> {
        let (mut nand, _) = build_device(|data| {
            data.volumes[1].lebs = vec![fm_leb(0, 10, 10)];
            data.volumes.push(fm_volume(0, 0, vec![fm_leb(0, 11, 11)]));
        })?;
        match find_fastmap(&mut nand)? {
            FastmapScan::Invalid(reason) => assert!(reason.contains("volume 0 recorded twice")),
            other => panic!("unexpected {other:?}"),
        }

        Ok(())
    }

    #[test]
    fn test_leb_placement_checked() -> anyhow::Result<()> {
        // Only slot 0 exists without consolidation; the sqnum would underflow otherwise
        let (mut nand, _) = build_device(|data| {
            data.volumes[1].lebs[0].slot = 1;
            data.volumes[1].lebs[0].sqnum = 0;
        })?;
        match find_fastmap(&mut nand)? {
            FastmapScan::Invalid(reason) => assert!(reason.contains("slot 1 of PEB 10")),
            other => panic!("unexpected {other:?}"),
        }

        // Two LEBs can't share one slot
        let (mut nand, _) = build_device(|data| data.volumes[1].lebs[1].pnum = 10)?;
        match find_fastmap(&mut nand)? {
            FastmapScan::Invalid(reason) => assert!(reason.contains("holds two LEBs")),
            other => panic!("unexpected {other:?}"),
        }

        Ok(())
    }

    #[test]
    fn test_used_peb_without_leb() -> anyhow::Result<()> {
        let (mut nand, _) = build_device(|data| {
            data.free.retain(|entry| entry.pnum != 30);
            data.used.push(FmEcEntry { pnum: 30, ec: 1 });
        })?;
        match find_fastmap(&mut nand)? {
            FastmapScan::Invalid(reason) => assert!(reason.contains("holds no LEB")),
            other => panic!("unexpected {other:?}"),
        }

        Ok(())
    }

    #[test]
    fn test_damaged_vid_forces_full_scan() -> anyhow::Result<()> {
        let (mut nand, geometry) = build_device(|_| ())?;
        corrupt_vid(&mut nand, &geometry, 5);

        {
            let io = UbiIo::new(&mut nand, 1)?;
            let mut ctx = ScanContext::new(io, AttachConfig::default());
            let mut scan_ai = AttachInfo::new();
            for pnum in 0..FM_MAX_START {
                scan_peb(&mut ctx, &mut scan_ai, pnum, true)?;
            }
            assert!(scan_ai.force_full_scan);
        }

        // Attaching still works; PEB 5 ends up waiting for erasure
        let config = AttachConfig::default()
            .strategy(AttachStrategy::FastThenFull)
            .fm_max_start(FM_MAX_START);
        let attached = attach(&mut nand, config)?;
        assert!(attached.ai.list_pnums(PebList::Erase).contains(&5));
        assert_eq!(attached.ai.eba_table(0), Some(vec![(0, 10), (1, 20)]));

        Ok(())
    }
}
