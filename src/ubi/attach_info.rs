//! The in-memory result of attaching: every PEB record, the lists they are sorted into, and the
//! per-volume LEB directories.
//!
//! PEB records live in an arena and are addressed by [PebHandle]. Lists hold handles directly.
//! LEB records hold a handle too, but only to look the PEB up; a PEB that backs LEBs stays in
//! the arena for as long as its reference count is non-zero, which for a consolidated PEB may
//! mean several LEBs in several volumes.

use super::headers::{Ec, VolType, UBI_MAX_ERASECOUNTER};
use super::io::UbiIo;
use crate::error::{AttachError, Result};
use crate::nand::Nand;

use std::collections::{btree_map::Entry, BTreeMap, VecDeque};

/// A stable handle to a PEB record
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PebHandle(u32);

/// Everything learned about one physical eraseblock
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PhysicalBlock {
    /// The physical eraseblock number
    pub pnum: u32,

    /// The erase counter, or `None` if the EC header was unreadable
    pub ec: Option<u64>,

    /// The volume this PEB last belonged to, if it had a readable VID header
    pub vol_id: Option<u32>,

    /// The sequence number of the PEB's (first) VID header
    pub sqnum: u64,

    /// Bitflips were seen; the PEB should be scrubbed
    pub scrub: bool,

    /// For a consolidated PEB, the LEB number stored in each slot
    pub slots: Option<Vec<u32>>,

    /// How many LEB records point into this PEB
    refs: u32,
}

impl PhysicalBlock {
    fn new(pnum: u32, ec: Option<u64>) -> Self {
        Self {
            pnum,
            ec,
            vol_id: None,
            sqnum: 0,
            scrub: false,
            slots: None,
            refs: 0,
        }
    }

    /// How many LEB records currently point into this PEB
    pub fn refs(&self) -> u32 {
        self.refs
    }
}

/// One LEB as found on flash
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LogicalBlock {
    pub lnum: u32,

    /// The copy flag of the VID header: this LEB was written by wear-leveling or an atomic
    /// change, and its data must be CRC-checked before it may beat an older copy
    pub copy_flag: bool,

    /// The PEB holding this LEB's data
    pub peb: PebHandle,

    /// Which slot of the PEB holds the data (always 0 unless consolidated)
    pub slot: u32,

    /// The PEB's sequence number plus `slot`
    pub sqnum: u64,

    /// The `data_size` recorded in this LEB's VID header
    pub data_size: u32,
}

/// Everything learned about one volume
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Volume {
    pub vol_id: u32,
    pub vol_type: VolType,
    pub used_ebs: u32,
    pub data_pad: u32,
    pub compat: u8,

    /// The highest LEB number seen so far
    pub highest_lnum: u32,

    /// The `data_size` of the LEB numbered `highest_lnum`
    pub last_data_size: u32,

    /// How many LEBs were found
    pub leb_count: u32,

    lebs: BTreeMap<u32, LogicalBlock>,
}

impl Volume {
    pub(crate) fn new(vol_id: u32, vol_type: VolType, used_ebs: u32, data_pad: u32, compat: u8) -> Self {
        Self {
            vol_id,
            vol_type,
            used_ebs,
            data_pad,
            compat,
            highest_lnum: 0,
            last_data_size: 0,
            leb_count: 0,
            lebs: BTreeMap::new(),
        }
    }

    /// The LEBs of this volume, in LEB number order
    pub fn lebs(&self) -> impl Iterator<Item = &LogicalBlock> {
        self.lebs.values()
    }

    pub fn leb(&self, lnum: u32) -> Option<&LogicalBlock> {
        self.lebs.get(&lnum)
    }

    /// Record a LEB seen for the first time
    ///
    /// Returns `false`, leaving the volume untouched, if the LEB is already recorded.
    #[must_use]
    pub(crate) fn insert_leb(&mut self, leb: LogicalBlock) -> bool {
        let Entry::Vacant(entry) = self.lebs.entry(leb.lnum) else {
            return false;
        };
        if self.leb_count == 0 || self.highest_lnum <= leb.lnum {
            self.highest_lnum = leb.lnum;
            self.last_data_size = leb.data_size;
        }
        self.leb_count += 1;
        entry.insert(leb);
        true
    }

    /// Replace the record of a LEB with a newer copy
    pub(crate) fn replace_leb(&mut self, leb: LogicalBlock) {
        if self.highest_lnum == leb.lnum {
            self.last_data_size = leb.data_size;
        }
        self.lebs.insert(leb.lnum, leb);
    }

    fn take_lebs(&mut self) -> BTreeMap<u32, LogicalBlock> {
        self.leb_count = 0;
        std::mem::take(&mut self.lebs)
    }
}

/// The lists a PEB that doesn't back any LEB can be sorted into
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum PebList {
    /// Holds a valid EC header and nothing else; ready for use
    Free,

    /// Must be erased before use
    Erase,

    /// Holds data UBI can't explain; preserved for inspection, never erased automatically
    Corrupted,

    /// Belongs to an internal volume this implementation doesn't know, with compat "preserve"
    Alien,

    /// Holds fastmap data
    Fastmap,
}

impl PebList {
    pub const ALL: [PebList; 5] = [
        PebList::Free,
        PebList::Erase,
        PebList::Corrupted,
        PebList::Alien,
        PebList::Fastmap,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Where a PEB ended up after attaching
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PebLocation {
    /// Backs one or more `(vol_id, lnum)` LEBs
    Lebs(Vec<(u32, u32)>),

    /// Sits on a list
    List(PebList),
}

/// The numbers downstream layers want from an attach
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct DeviceCounters {
    pub bad_peb_count: u32,
    pub good_peb_count: u32,
    pub corr_peb_count: u32,
    pub mean_ec: u64,
    pub max_ec: u64,
    pub max_sqnum: u64,
}

/// The result of attaching a flash device
#[derive(Debug, Clone)]
pub struct AttachInfo {
    pebs: Vec<Option<PhysicalBlock>>,
    vacant: Vec<u32>,
    lists: [VecDeque<PebHandle>; 5],
    volumes: BTreeMap<u32, Volume>,

    pub bad_peb_count: u32,
    pub empty_peb_count: u32,
    pub corr_peb_count: u32,
    pub alien_peb_count: u32,
    pub maybe_bad_peb_count: u32,

    pub ec_sum: u64,
    pub ec_count: u32,
    pub min_ec: u64,
    pub max_ec: u64,
    pub mean_ec: u64,

    pub max_sqnum: u64,
    pub highest_vol_id: u32,
    pub vols_found: u32,

    /// The image sequence number shared by every EC header; 0 until one is seen
    pub image_seq: u32,

    /// The device holds nothing but empty PEBs
    pub is_empty: bool,

    /// An internal volume demanded that the device be treated as read-only
    pub read_only: bool,

    /// Something was seen that makes attaching from a fastmap unsafe
    pub force_full_scan: bool,
}

impl Default for AttachInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl AttachInfo {
    pub fn new() -> Self {
        Self {
            pebs: Vec::new(),
            vacant: Vec::new(),
            lists: Default::default(),
            volumes: BTreeMap::new(),
            bad_peb_count: 0,
            empty_peb_count: 0,
            corr_peb_count: 0,
            alien_peb_count: 0,
            maybe_bad_peb_count: 0,
            ec_sum: 0,
            ec_count: 0,
            min_ec: UBI_MAX_ERASECOUNTER,
            max_ec: 0,
            mean_ec: 0,
            max_sqnum: 0,
            highest_vol_id: 0,
            vols_found: 0,
            image_seq: 0,
            is_empty: false,
            read_only: false,
            force_full_scan: false,
        }
    }

    // ---- PEB arena ----

    /// Create a record for a PEB that is not yet on any list or in any volume
    pub(crate) fn new_peb(&mut self, pnum: u32, ec: Option<u64>) -> PebHandle {
        let peb = Some(PhysicalBlock::new(pnum, ec));
        match self.vacant.pop() {
            Some(index) => {
                self.pebs[index as usize] = peb;
                PebHandle(index)
            }
            None => {
                self.pebs.push(peb);
                PebHandle(self.pebs.len() as u32 - 1)
            }
        }
    }

    pub fn peb(&self, handle: PebHandle) -> &PhysicalBlock {
        self.pebs[handle.0 as usize]
            .as_ref()
            .expect("stale PEB handle")
    }

    pub(crate) fn peb_mut(&mut self, handle: PebHandle) -> &mut PhysicalBlock {
        self.pebs[handle.0 as usize]
            .as_mut()
            .expect("stale PEB handle")
    }

    /// Remove a PEB record from the arena; it must already be off every list
    fn release(&mut self, handle: PebHandle) -> PhysicalBlock {
        let peb = self.pebs[handle.0 as usize]
            .take()
            .expect("stale PEB handle");
        self.vacant.push(handle.0);
        peb
    }

    /// Every live PEB record
    pub fn pebs(&self) -> impl Iterator<Item = (PebHandle, &PhysicalBlock)> {
        self.pebs
            .iter()
            .enumerate()
            .filter_map(|(i, peb)| peb.as_ref().map(|peb| (PebHandle(i as u32), peb)))
    }

    // ---- lists ----

    /// Put a PEB record on a list
    pub(crate) fn push(&mut self, list: PebList, handle: PebHandle, to_head: bool) {
        match list {
            PebList::Corrupted => self.corr_peb_count += 1,
            PebList::Alien => self.alien_peb_count += 1,
            _ => (),
        }

        let peb = self.peb(handle);
        log::debug!(
            "add to {list:?}{}: PEB {}, EC {:?}",
            if to_head { " (head)" } else { "" },
            peb.pnum,
            peb.ec
        );

        let list = &mut self.lists[list.index()];
        if to_head {
            list.push_front(handle);
        } else {
            list.push_back(handle);
        }
    }

    /// Create a PEB record directly on a list
    pub(crate) fn add_to_list(
        &mut self,
        list: PebList,
        pnum: u32,
        ec: Option<u64>,
        to_head: bool,
    ) -> PebHandle {
        let handle = self.new_peb(pnum, ec);
        self.push(list, handle, to_head);
        handle
    }

    /// The PEBs on a list, head first
    pub fn list(&self, list: PebList) -> impl Iterator<Item = &PhysicalBlock> {
        self.lists[list.index()].iter().map(|&h| self.peb(h))
    }

    /// The PEB numbers on a list, head first
    pub fn list_pnums(&self, list: PebList) -> Vec<u32> {
        self.list(list).map(|peb| peb.pnum).collect()
    }

    pub fn list_len(&self, list: PebList) -> usize {
        self.lists[list.index()].len()
    }

    /// Take a PEB off the head of a list, removing it from the arena too
    fn pop_front(&mut self, list: PebList) -> Option<PhysicalBlock> {
        let handle = self.lists[list.index()].pop_front()?;
        Some(self.release(handle))
    }

    // ---- reference counting ----

    pub(crate) fn take_ref(&mut self, handle: PebHandle) {
        self.peb_mut(handle).refs += 1;
    }

    /// Drop one LEB's claim on a PEB; when no LEB is left, the PEB goes to the erase list
    ///
    /// Returns `true` if the PEB was moved to the erase list.
    pub(crate) fn drop_ref(&mut self, handle: PebHandle, to_head: bool) -> bool {
        let peb = self.peb_mut(handle);
        peb.refs = peb.refs.saturating_sub(1);
        if peb.refs > 0 {
            return false;
        }
        self.push(PebList::Erase, handle, to_head);
        true
    }

    // ---- volumes ----

    pub fn volumes(&self) -> impl Iterator<Item = &Volume> {
        self.volumes.values()
    }

    pub fn volume(&self, vol_id: u32) -> Option<&Volume> {
        self.volumes.get(&vol_id)
    }

    pub(crate) fn volume_mut(&mut self, vol_id: u32) -> Option<&mut Volume> {
        self.volumes.get_mut(&vol_id)
    }

    /// Get a volume, creating it from the given prototype if this is its first sighting
    pub(crate) fn volume_entry(&mut self, proto: Volume) -> &mut Volume {
        let vol_id = proto.vol_id;
        if !self.volumes.contains_key(&vol_id) {
            self.vols_found += 1;
            self.highest_vol_id = self.highest_vol_id.max(vol_id);
        }
        self.volumes.entry(vol_id).or_insert(proto)
    }

    /// Forget a volume; all of its PEBs go to the tail of the erase list
    pub fn remove_volume(&mut self, vol_id: u32) -> Option<Volume> {
        let mut volume = self.volumes.remove(&vol_id)?;
        self.vols_found -= 1;
        for leb in volume.take_lebs().into_values() {
            self.drop_ref(leb.peb, false);
        }
        Some(volume)
    }

    /// The LEB-to-PEB mapping of a volume, as `(lnum, pnum)` pairs in LEB order
    pub fn eba_table(&self, vol_id: u32) -> Option<Vec<(u32, u32)>> {
        let volume = self.volume(vol_id)?;
        Some(
            volume
                .lebs()
                .map(|leb| (leb.lnum, self.peb(leb.peb).pnum))
                .collect(),
        )
    }

    // ---- statistics ----

    /// Account for a trustworthy erase counter
    pub(crate) fn note_ec(&mut self, ec: u64) {
        self.ec_sum += ec;
        self.ec_count += 1;
        self.min_ec = self.min_ec.min(ec);
        self.max_ec = self.max_ec.max(ec);
    }

    /// Compute the mean of the trustworthy erase counters (0 if there were none)
    pub fn compute_mean_ec(&mut self) -> u64 {
        self.mean_ec = self
            .ec_sum
            .checked_div(u64::from(self.ec_count))
            .unwrap_or(0);
        self.mean_ec
    }

    /// Give every PEB whose erase counter is unknown the mean erase counter
    ///
    /// Known erase counters are never touched, so this can be run any number of times.
    pub fn backfill_unknown_ec(&mut self) {
        let mean_ec = self.mean_ec;
        for peb in self.pebs.iter_mut().flatten() {
            peb.ec.get_or_insert(mean_ec);
        }
    }

    /// Where each PEB ended up, by PEB number
    ///
    /// A healthy attach has exactly one location for every good PEB.
    pub fn peb_locations(&self) -> BTreeMap<u32, Vec<PebLocation>> {
        let mut backing: BTreeMap<PebHandle, Vec<(u32, u32)>> = BTreeMap::new();
        for volume in self.volumes() {
            for leb in volume.lebs() {
                backing
                    .entry(leb.peb)
                    .or_default()
                    .push((volume.vol_id, leb.lnum));
            }
        }

        let mut locations: BTreeMap<u32, Vec<PebLocation>> = BTreeMap::new();
        for (handle, lebs) in backing {
            locations
                .entry(self.peb(handle).pnum)
                .or_default()
                .push(PebLocation::Lebs(lebs));
        }
        for list in PebList::ALL {
            for peb in self.list(list) {
                locations
                    .entry(peb.pnum)
                    .or_default()
                    .push(PebLocation::List(list));
            }
        }

        locations
    }

    /// Summarize the attach for the device-level counters
    pub fn device_counters(&self, peb_count: u32) -> DeviceCounters {
        DeviceCounters {
            bad_peb_count: self.bad_peb_count,
            good_peb_count: peb_count - self.bad_peb_count,
            corr_peb_count: self.corr_peb_count,
            mean_ec: self.mean_ec,
            max_ec: self.max_ec,
            max_sqnum: self.max_sqnum,
        }
    }

    /// Hand out one PEB for use before wear-leveling is running.
    ///
    /// Free PEBs are used first. Failing that, PEBs from the erase list are erased and given a
    /// fresh EC header until one succeeds.
    pub fn early_get_peb<N: Nand>(&mut self, io: &mut UbiIo<'_, N>) -> Result<PhysicalBlock> {
        if let Some(peb) = self.pop_front(PebList::Free) {
            log::debug!("return free PEB {}, EC {:?}", peb.pnum, peb.ec);
            return Ok(peb);
        }

        let candidates: Vec<PebHandle> = self.lists[PebList::Erase.index()].iter().copied().collect();
        for handle in candidates {
            let mean_ec = self.mean_ec;
            let peb = self.peb(handle);
            let ec = peb.ec.unwrap_or(mean_ec) + 1;
            let pnum = peb.pnum;

            if ec >= UBI_MAX_ERASECOUNTER {
                return Err(AttachError::EcOverflow { pnum, ec });
            }

            let ec_hdr: Ec = io.geometry().ec_header(ec, self.image_seq);
            let erased = io.sync_erase(pnum).and_then(|_| io.write_ec_hdr(pnum, ec_hdr));
            if let Err(err) = erased {
                log::warn!("cannot erase PEB {pnum} for early use: {err}");
                continue;
            }

            self.lists[PebList::Erase.index()].retain(|&h| h != handle);
            let mut peb = self.release(handle);
            peb.ec = Some(ec);
            peb.scrub = false;
            return Ok(peb);
        }

        log::error!("no free eraseblocks");
        Err(AttachError::NoSpace)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::SimNand;
    use crate::ubi::testutil::*;

    #[test]
    fn test_list_order() {
        let mut ai = AttachInfo::new();
        ai.add_to_list(PebList::Erase, 1, Some(3), false);
        ai.add_to_list(PebList::Erase, 2, Some(3), false);
        ai.add_to_list(PebList::Erase, 3, None, true);
        ai.add_to_list(PebList::Corrupted, 4, Some(3), false);
        ai.add_to_list(PebList::Alien, 5, Some(3), false);

        assert_eq!(ai.list_pnums(PebList::Erase), [3, 1, 2]);
        assert_eq!(ai.corr_peb_count, 1);
        assert_eq!(ai.alien_peb_count, 1);
    }

    #[test]
    fn test_refcount_release() {
        let mut ai = AttachInfo::new();
        let handle = ai.new_peb(7, Some(1));
        ai.take_ref(handle);
        ai.take_ref(handle);

        assert!(!ai.drop_ref(handle, false));
        assert_eq!(ai.list_len(PebList::Erase), 0);
        assert!(ai.drop_ref(handle, true));
        assert_eq!(ai.list_pnums(PebList::Erase), [7]);
    }

    #[test]
    fn test_insert_leb_never_overwrites() {
        let mut ai = AttachInfo::new();
        let leb = |lnum, peb, data_size| LogicalBlock {
            lnum,
            copy_flag: false,
            peb,
            slot: 0,
            sqnum: 1,
            data_size,
        };
        let first = ai.new_peb(1, Some(1));
        let second = ai.new_peb(2, Some(1));

        let mut volume = Volume::new(0, VolType::Dynamic, 0, 0, 0);
        assert!(volume.insert_leb(leb(3, first, 100)));
        assert!(!volume.insert_leb(leb(3, second, 200)));

        assert_eq!(volume.leb_count, 1);
        assert_eq!(volume.last_data_size, 100);
        assert_eq!(volume.leb(3).map(|leb| leb.peb), Some(first));
    }

    #[test]
    fn test_backfill_is_idempotent() {
        let mut ai = AttachInfo::new();
        for (pnum, ec) in [(0, Some(10)), (1, None), (2, Some(20)), (3, None)] {
            if let Some(ec) = ec {
                ai.note_ec(ec);
            }
            ai.add_to_list(PebList::Free, pnum, ec, false);
        }

        assert_eq!(ai.compute_mean_ec(), 15);
        ai.backfill_unknown_ec();
        let once: Vec<_> = ai.list(PebList::Free).map(|peb| peb.ec).collect();

        // A later mean must not leak into already-filled counters
        ai.mean_ec = 99;
        ai.backfill_unknown_ec();
        let twice: Vec<_> = ai.list(PebList::Free).map(|peb| peb.ec).collect();

        assert_eq!(once, [Some(10), Some(15), Some(20), Some(15)]);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_mean_ec_without_samples() {
        let mut ai = AttachInfo::new();
        assert_eq!(ai.compute_mean_ec(), 0);
    }

    #[test]
    fn test_arena_reuses_slots() {
        let mut ai = AttachInfo::new();
        let a = ai.add_to_list(PebList::Free, 0, Some(1), false);
        let freed = ai.pop_front(PebList::Free).unwrap();
        assert_eq!(freed.pnum, 0);

        let b = ai.add_to_list(PebList::Free, 1, Some(1), false);
        assert_eq!(a, b);
        assert_eq!(ai.pebs().count(), 1);
    }

    #[test]
    fn test_early_get_peb() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.fail_erase(4);

        let mut io = UbiIo::new(&mut nand, 1)?;
        let mut ai = AttachInfo::new();
        ai.image_seq = 0x1234;
        ai.mean_ec = 6;
        ai.add_to_list(PebList::Free, 2, Some(3), false);
        ai.add_to_list(PebList::Erase, 4, Some(8), false);
        ai.add_to_list(PebList::Erase, 5, None, false);

        // Free PEBs go first, without any I/O
        assert_eq!(ai.early_get_peb(&mut io)?.pnum, 2);

        // PEB 4 can't be erased, so PEB 5 gets erased with the mean EC plus one
        let peb = ai.early_get_peb(&mut io)?;
        assert_eq!((peb.pnum, peb.ec), (5, Some(7)));
        assert!(matches!(io.read_ec_hdr(5)?, crate::ubi::io::HdrRead::Valid(ec) if ec.ec == 7 && ec.image_seq == 0x1234));

        let err = ai.early_get_peb(&mut io).unwrap_err();
        assert!(err.is_no_space());
        assert_eq!(ai.list_pnums(PebList::Erase), [4]);

        Ok(())
    }
}
