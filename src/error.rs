//! The ways an attach can fail.

use thiserror::Error;

/// Why a flash device could not be attached
///
/// Everything other than [AttachError::Io] describes a flash image that UBI must not trust, so
/// retrying won't help.
#[derive(Error, Debug)]
pub enum AttachError {
    #[error(transparent)]
    Io(#[from] anyhow::Error),

    #[error("erase counter overflow at PEB {pnum}: EC {ec}")]
    EcOverflow { pnum: u32, ec: u64 },

    #[error("bad image sequence number {found} in PEB {pnum}, expected {expected}")]
    ImageSeqMismatch { pnum: u32, expected: u32, found: u32 },

    #[error("PEB {pnum} has a header for unsupported UBI version {version}")]
    UnsupportedVersion { pnum: u32, version: u8 },

    #[error("PEB {pnum} places its VID header at {vid_hdr_offset} and data at {data_offset}, which this device's geometry does not allow")]
    BadEcLayout {
        pnum: u32,
        vid_hdr_offset: u32,
        data_offset: u32,
    },

    #[error("PEB {pnum} has an invalid VID header: {reason}")]
    InvalidVidHeader { pnum: u32, reason: &'static str },

    #[error("inconsistent {field} in PEB {pnum} for volume {vol_id}")]
    InconsistentVolume {
        vol_id: u32,
        pnum: u32,
        field: &'static str,
    },

    #[error("LEB {vol_id}:{lnum} has two copies (PEBs {first} and {second}) with sequence number {sqnum}")]
    DuplicateSqnum {
        vol_id: u32,
        lnum: u32,
        sqnum: u64,
        first: u32,
        second: u32,
    },

    #[error("LEB {vol_id}:{lnum} has two copies without sequence numbers; unsupported on-flash UBI format")]
    LegacyFormat { vol_id: u32, lnum: u32 },

    #[error("VID header of PEB {pnum} was readable earlier, but not any more")]
    VidHeaderLost { pnum: u32 },

    #[error("incompatible internal volume {vol_id} found in PEB {pnum}")]
    IncompatibleVolume { pnum: u32, vol_id: u32 },

    #[error("{count} PEBs are corrupted (at most {} tolerated), refusing to attach", .threshold - 1)]
    TooManyCorrupted { count: u32, threshold: u32 },

    #[error("device is not UBI-formatted and possibly contains non-UBI data ({maybe_bad} PEBs look bad), refusing it")]
    NotUbi { maybe_bad: u32 },

    #[error("no free eraseblocks")]
    NoSpace,

    #[error("volume table: {0}")]
    VolumeTable(String),

    #[error("self-check failed: {0}")]
    SelfCheck(String),
}

impl AttachError {
    /// Is this the out-of-space condition, rather than a failure?
    pub fn is_no_space(&self) -> bool {
        matches!(self, Self::NoSpace)
    }
}

pub type Result<T> = std::result::Result<T, AttachError>;
