//! This module implements attaching to a UBI-formatted flash device: reading the EC and VID
//! headers of the physical eraseblocks ("PEBs"), and working out from them which PEB currently
//! holds each logical eraseblock ("LEB") of each volume, and what is to become of all the others.
//!
//! UBI populates the first writable page of every block with an "erase counter" ("EC") header,
//! and if the block is in use, a "volume ID" ("VID") header in the second page:
//!
//! ```text
//! +- PEB -------------------+
//! |  Page 0: EC header      |
//! |  Page 1: VID header(s)  |  one 64-byte header per LEB slot
//! |  Page 2..: data         |  LEB slot i starts at i * leb_size
//! +-------------------------+
//! ```
//!
//! A LEB may be found in more than one PEB, if a power cut interrupted wear-leveling or an
//! atomic LEB change; the sequence numbers in the VID headers decide which copy is current.
//! PEBs that hold no current LEB are sorted into the free, erase, corrupted, alien, and fastmap
//! lists of the [AttachInfo].
//!
//! Attaching never writes to the flash, with the single exception of
//! [AttachInfo::early_get_peb].

pub mod attach;
pub mod attach_info;
pub mod check;
pub mod fastmap;
pub mod headers;
pub mod io;
mod resolve;
pub mod scan;
pub mod vtbl;

#[cfg(test)]
mod testutil;

pub use attach::{attach, AttachConfig, AttachStrategy, Attached, FlashKind};
pub use attach_info::{AttachInfo, DeviceCounters, PebList, PebLocation, PhysicalBlock};
pub use headers::VolType;
pub use vtbl::VolumeTable;
