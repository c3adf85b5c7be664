//! Attach to a flash device (or an image of one) and report what UBI finds on it.
//!
//! Attaching is read-only, so this is safe to point at a device some other UBI implementation is
//! using, to check its work.

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};

use std::fs::File;
use std::path::PathBuf;

#[cfg(target_os = "linux")]
use ubi_attach::nand::mtd::MtdNand;
use ubi_attach::{
    nand::{Nand, NandLayout, SimNand},
    ubi::{attach, AttachConfig, AttachStrategy, Attached, FlashKind, PebList, PebLocation},
};

#[derive(Args, Debug)]
#[group(required = true)]
struct NandOptions {
    /// Name of the MTD device or partition
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_name: Option<String>,

    /// Path to a `/dev/mtdX` device
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_dev: Option<PathBuf>,

    /// Path to the NAND image to use
    #[clap(long, group = "nand-options", requires = "sim_layout")]
    sim_path: Option<PathBuf>,

    /// Layout of the NAND to simulate
    #[clap(long)]
    sim_layout: Option<NandLayout>,
}

impl NandOptions {
    fn open(&self) -> Result<NandImpl> {
        let nandimpl = if let Some(layout) = self.sim_layout {
            let mut sim = SimNand::new(layout);
            if let Some(path) = &self.sim_path {
                sim.load(&mut File::open(path)?)?;
            }

            NandImpl::Sim(sim)
        } else {
            #[cfg(target_os = "linux")]
            {
                let mtd = {
                    if let Some(name) = &self.mtd_name {
                        MtdNand::open_named(name)?
                    } else if let Some(dev) = &self.mtd_dev {
                        MtdNand::open(dev)?
                    } else {
                        unreachable!()
                    }
                };

                NandImpl::Mtd(mtd)
            }

            #[cfg(not(target_os = "linux"))]
            unreachable!()
        };

        Ok(nandimpl)
    }
}

#[derive(Debug)]
enum NandImpl {
    Sim(SimNand),

    #[cfg(target_os = "linux")]
    Mtd(MtdNand),
}

impl NandImpl {
    fn do_attach(&mut self, config: AttachConfig) -> Result<Attached> {
        let attached = match self {
            NandImpl::Sim(nand) => attach(nand, config)?,

            #[cfg(target_os = "linux")]
            NandImpl::Mtd(nand) => attach(nand, config)?,
        };

        Ok(attached)
    }

    fn peb_count(&self) -> u32 {
        match self {
            NandImpl::Sim(nand) => nand.get_layout().blocks,

            #[cfg(target_os = "linux")]
            NandImpl::Mtd(nand) => nand.get_layout().blocks,
        }
    }
}

#[derive(ValueEnum, Debug, Default, Copy, Clone)]
enum Strategy {
    /// Scan every PEB
    #[default]
    Full,

    /// Use a fastmap if there is a good one
    Fastmap,
}

#[derive(Args, Debug)]
struct AttachOptions {
    /// How to find the device's contents
    #[clap(long, value_enum, default_value_t)]
    strategy: Strategy,

    /// Only look for a fastmap superblock below this PEB number
    #[clap(long)]
    fm_max_start: Option<u32>,

    /// The device is NOR flash
    #[clap(long)]
    nor: bool,

    /// How many LEBs each PEB holds
    #[clap(long, default_value_t = 1)]
    lebs_per_peb: u32,

    /// Cross-check the result against the flash
    #[clap(long)]
    self_check: bool,
}

impl From<&AttachOptions> for AttachConfig {
    fn from(value: &AttachOptions) -> Self {
        let strategy = match value.strategy {
            Strategy::Full => AttachStrategy::Full,
            Strategy::Fastmap => AttachStrategy::FastThenFull,
        };
        let flash_kind = match value.nor {
            true => FlashKind::Nor,
            false => FlashKind::Nand,
        };

        let mut config = AttachConfig::default()
            .strategy(strategy)
            .flash_kind(flash_kind)
            .lebs_per_peb(value.lebs_per_peb)
            .self_check(value.self_check);
        if let Some(fm_max_start) = value.fm_max_start {
            config = config.fm_max_start(fm_max_start);
        }
        config
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Attach, and print a summary of the device and its volumes
    Attach,

    /// Print where each PEB ended up
    Overview,

    /// Print the LEB-to-PEB mapping of a volume
    Eba {
        /// The volume ID
        #[clap(long)]
        vol_id: u32,
    },
}

impl Command {
    fn execute(self, nand: &mut NandImpl, config: AttachConfig) -> Result<()> {
        let peb_count = nand.peb_count();
        let attached = nand.do_attach(config)?;
        let ai = &attached.ai;

        match self {
            Command::Attach => {
                let counters = &attached.counters;
                println!("PEBs:            {peb_count}");
                println!("bad PEBs:        {}", counters.bad_peb_count);
                println!("corrupted PEBs:  {}", counters.corr_peb_count);
                println!("mean EC:         {}", counters.mean_ec);
                println!("max EC:          {}", counters.max_ec);
                println!("max sqnum:       {}", counters.max_sqnum);
                println!("image sequence:  {:#010x}", ai.image_seq);
                if ai.is_empty {
                    println!("(empty device)");
                }
                if ai.read_only {
                    println!("(read-only)");
                }
                for list in PebList::ALL {
                    println!("{:16} {}", format!("{list:?} PEBs:"), ai.list_len(list));
                }

                for volume in ai.volumes() {
                    let name = attached
                        .vtbl
                        .get(&volume.vol_id)
                        .map_or("-", |record| record.name.as_str());
                    println!(
                        "volume {:10} {:16} {:?}, {} LEBs",
                        volume.vol_id, name, volume.vol_type, volume.leb_count
                    );
                }
            }

            Command::Overview => {
                let locations = ai.peb_locations();

                for pnum in 0..peb_count {
                    match locations.get(&pnum).map(Vec::as_slice) {
                        None => println!("{pnum:4} => bad"),
                        Some([PebLocation::Lebs(lebs)]) => println!("{pnum:4} => LEBs {lebs:?}"),
                        Some([PebLocation::List(list)]) => println!("{pnum:4} => {list:?}"),
                        Some(other) => println!("{pnum:4} => ?? {other:?}"),
                    }
                }
            }

            Command::Eba { vol_id } => {
                let Some(eba) = ai.eba_table(vol_id) else {
                    anyhow::bail!("no volume {vol_id}");
                };

                for (lnum, pnum) in eba {
                    println!("{lnum:6} => {pnum}");
                }
            }
        };

        Ok(())
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The NAND to use
    #[clap(flatten)]
    nand: NandOptions,

    #[clap(flatten)]
    attach: AttachOptions,

    /// What to report
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    env_logger::init();
    howudoin::init(howudoin::consumers::TermLine::default());

    let mut nand = args.nand.open()?;
    let config = AttachConfig::from(&args.attach);
    args.cmd.execute(&mut nand, config)?;
    Ok(())
}
