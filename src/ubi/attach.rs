//! The attach entry point: scanning a whole device (or finding its fastmap), judging whether the
//! result is usable, and handing it on.

use super::attach_info::{AttachInfo, DeviceCounters, PebList};
use super::check;
use super::fastmap::{self, FastmapScan, UBI_FM_MAX_START};
use super::io::UbiIo;
use super::scan::{scan_peb, ScanContext};
use super::vtbl::{read_volume_table, VolumeTable};
use crate::error::{AttachError, Result};
use crate::nand::Nand;

use rand::Rng;

/// How to find the contents of the device
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum AttachStrategy {
    /// Read the headers of every PEB
    #[default]
    Full,

    /// Look for a fastmap near the start of the device, scanning everything if there isn't a
    /// usable one
    FastThenFull,
}

/// What kind of flash the device is
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum FlashKind {
    #[default]
    Nand,

    /// NOR flash; PEBs whose headers are both gone were interrupted mid-erase and are erased
    /// before anything else
    Nor,
}

/// Attach settings
#[derive(Debug, Clone)]
pub struct AttachConfig {
    pub strategy: AttachStrategy,

    /// Only the PEBs below this number are searched for a fastmap superblock
    pub fm_max_start: u32,

    pub flash_kind: FlashKind,

    /// How many LEBs each PEB holds
    pub lebs_per_peb: u32,

    /// Verify the finished attach information against the flash; slow
    pub self_check: bool,

    /// Yield the thread after this many PEBs (0 to never yield)
    pub yield_every: u32,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            strategy: Default::default(),
            fm_max_start: UBI_FM_MAX_START,
            flash_kind: Default::default(),
            lebs_per_peb: 1,
            self_check: cfg!(debug_assertions),
            yield_every: 1,
        }
    }
}

impl AttachConfig {
    pub fn strategy(mut self, strategy: AttachStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn fm_max_start(mut self, fm_max_start: u32) -> Self {
        self.fm_max_start = fm_max_start;
        self
    }

    pub fn flash_kind(mut self, flash_kind: FlashKind) -> Self {
        self.flash_kind = flash_kind;
        self
    }

    /// Set the consolidation factor; this must be between 1 and
    /// [UBI_MAX_LEBS_PER_PEB](super::io::UBI_MAX_LEBS_PER_PEB), or attaching fails
    pub fn lebs_per_peb(mut self, lebs_per_peb: u32) -> Self {
        self.lebs_per_peb = lebs_per_peb;
        self
    }

    pub fn self_check(mut self, self_check: bool) -> Self {
        self.self_check = self_check;
        self
    }

    pub fn yield_every(mut self, yield_every: u32) -> Self {
        self.yield_every = yield_every;
        self
    }

    /// Give other threads a chance to run, if `scanned` PEBs is a multiple of `yield_every`
    fn maybe_yield(&self, scanned: u32) {
        if self.yield_every != 0 && scanned % self.yield_every == 0 {
            std::thread::yield_now();
        }
    }
}

/// A successfully attached device
#[derive(Debug)]
pub struct Attached {
    pub ai: AttachInfo,
    pub counters: DeviceCounters,
    pub vtbl: VolumeTable,
}

/// Attach a flash device: find every volume and LEB on it, and sort out every other PEB
pub fn attach<N: Nand>(nand: &mut N, config: AttachConfig) -> Result<Attached> {
    let io = UbiIo::new(nand, config.lebs_per_peb)?;
    let mut ctx = ScanContext::new(io, config);
    let peb_count = ctx.io.peb_count();

    let mut ai = match ctx.config.strategy {
        AttachStrategy::FastThenFull if peb_count > ctx.config.fm_max_start => {
            scan_fast(&mut ctx)?
        }
        _ => {
            let mut ai = AttachInfo::new();
            scan_all(&mut ctx, &mut ai, 0)?;
            ai
        }
    };

    let vtbl = read_volume_table(&mut ctx.io, &mut ai)?;
    let counters = ai.device_counters(peb_count);

    log::info!(
        "attached: {peb_count} PEBs, {} bad, {} corrupted, {} volumes, max sqnum {}",
        counters.bad_peb_count,
        counters.corr_peb_count,
        ai.vols_found,
        counters.max_sqnum
    );
    log::info!(
        "mean EC {}, max EC {}, image sequence number {:#x}{}",
        counters.mean_ec,
        counters.max_ec,
        ai.image_seq,
        if ai.read_only { ", read-only" } else { "" }
    );

    Ok(Attached { ai, counters, vtbl })
}

/// Scan every PEB from `start` onwards into `ai`, then decide whether the result is usable
pub fn scan_all<N: Nand>(
    ctx: &mut ScanContext<'_, N>,
    ai: &mut AttachInfo,
    start: u32,
) -> Result<()> {
    let peb_count = ctx.io.peb_count();
    let rpt = howudoin::new()
        .label("Scanning blocks")
        .set_len(u64::from(peb_count.saturating_sub(start)));

    for pnum in start..peb_count {
        scan_peb(ctx, ai, pnum, false)?;
        rpt.inc();
        ctx.config.maybe_yield(pnum + 1);
    }

    rpt.close();
    log::debug!("scanning is finished");

    ai.compute_mean_ec();
    ai.backfill_unknown_ec();

    late_analysis(ai, peb_count)?;

    if ctx.config.self_check {
        check::self_check(ctx, ai)?;
    }

    Ok(())
}

/// Look for a fastmap among the first PEBs; scan everything if there is no usable one
fn scan_fast<N: Nand>(ctx: &mut ScanContext<'_, N>) -> Result<AttachInfo> {
    let fm_max_start = ctx.config.fm_max_start;
    let mut scan_ai = AttachInfo::new();

    let rpt = howudoin::new()
        .label("Searching for fastmap")
        .set_len(u64::from(fm_max_start));
    for pnum in 0..fm_max_start {
        scan_peb(ctx, &mut scan_ai, pnum, true)?;
        rpt.inc();
        ctx.config.maybe_yield(pnum + 1);
    }
    rpt.close();

    let found = if scan_ai.force_full_scan {
        log::info!("damaged VID header seen, not trusting any fastmap");
        FastmapScan::NoFastmap
    } else {
        fastmap::scan_fastmap(ctx, &scan_ai)?
    };

    match found {
        FastmapScan::NoFastmap => {
            log::info!("no fastmap found, scanning the remaining PEBs");
            scan_all(ctx, &mut scan_ai, fm_max_start)?;
            Ok(scan_ai)
        }
        FastmapScan::Invalid(reason) => {
            log::warn!("bad fastmap ({reason}), attaching by full scan");
            let mut ai = AttachInfo::new();
            scan_all(ctx, &mut ai, 0)?;
            Ok(ai)
        }
        FastmapScan::Attached(ai) => {
            if ctx.config.self_check {
                check::self_check(ctx, &ai)?;
                check::compare_with_full_scan(ctx, &ai)?;
            }
            Ok(ai)
        }
    }
}

/// Judge the scan as a whole: too many corrupted PEBs, or nothing but empty ones, need special
/// treatment
fn late_analysis(ai: &mut AttachInfo, peb_count: u32) -> Result<()> {
    let eligible = peb_count - ai.bad_peb_count - ai.alien_peb_count;
    let threshold = (eligible / 20).max(8);

    if ai.corr_peb_count > 0 {
        log::warn!(
            "{} PEBs are corrupted and preserved: {:?}",
            ai.corr_peb_count,
            ai.list_pnums(PebList::Corrupted)
        );

        if ai.corr_peb_count >= threshold {
            log::error!("too many corrupted PEBs, refusing");
            return Err(AttachError::TooManyCorrupted {
                count: ai.corr_peb_count,
                threshold,
            });
        }
    }

    if ai.empty_peb_count + ai.maybe_bad_peb_count == eligible {
        // Nothing but empty PEBs, and a few that may be bad. The latter might also be data that
        // isn't UBI at all, so be careful not to wipe it.
        if ai.maybe_bad_peb_count <= 2 {
            ai.is_empty = true;
            ai.image_seq = rand::thread_rng().gen_range(1..=u32::MAX);
            log::info!("empty MTD device detected");
        } else {
            log::error!("MTD device is not UBI-formatted and may contain non-UBI data - refusing it");
            return Err(AttachError::NotUbi {
                maybe_bad: ai.maybe_bad_peb_count,
            });
        }
    }

    Ok(())
}
