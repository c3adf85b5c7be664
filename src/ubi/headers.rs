//! This module contains the code necessary to read, write, and manipulate EC/VID headers, with
//! CRC verification/computation.

use crc::{Crc, CRC_32_JAMCRC};
pub use deku::{DekuContainerRead, DekuContainerWrite};
use income::{EcHdr, VidHdr, VtblRecord, UBI_EC_HDR_MAGIC, UBI_VID_HDR_MAGIC};

/// UBI's `crc32(UBI_CRC32_INIT, ...)`: CRC-32 seeded with all-ones and not inverted afterwards.
pub const UBI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);
pub const UBI_VERSION: u8 = 1;

/// On-flash size of an EC header
pub const UBI_EC_HDR_SIZE: usize = 64;

/// On-flash size of a VID header; consolidated PEBs pack several of these back-to-back
pub const UBI_VID_HDR_SIZE: usize = 64;

/// On-flash size of a volume table record
pub const UBI_VTBL_RECORD_SIZE: usize = 0xAC;

/// The largest erase counter UBI will accept
pub const UBI_MAX_ERASECOUNTER: u64 = 0x7FFF_FFFF;

/// User volume IDs are `0..UBI_MAX_VOLUMES`
pub const UBI_MAX_VOLUMES: u32 = 128;

/// Internal volume IDs start here
pub const UBI_INTERNAL_VOL_START: u32 = 0x7FFF_FFFF - 4096;

/// The volume that holds the volume table
pub const UBI_LAYOUT_VOLUME_ID: u32 = UBI_INTERNAL_VOL_START;
pub const UBI_LAYOUT_VOLUME_EBS: u32 = 2;

/// The volume holding fastmap superblocks
pub const UBI_FM_SB_VOLUME_ID: u32 = UBI_INTERNAL_VOL_START + 1;

/// The volume holding fastmap payload blocks
pub const UBI_FM_DATA_VOLUME_ID: u32 = UBI_INTERNAL_VOL_START + 2;

/// Is this a volume ID reserved for UBI's own use?
pub fn is_internal_volume(vol_id: u32) -> bool {
    vol_id >= UBI_INTERNAL_VOL_START
}

/// Is this one of the fastmap volumes?
pub fn is_fastmap_volume(vol_id: u32) -> bool {
    vol_id == UBI_FM_SB_VOLUME_ID || vol_id == UBI_FM_DATA_VOLUME_ID
}

/// The reason some bytes failed to parse as a header
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum HeaderDefect {
    /// The magic number is wrong; the bytes may be blank, foreign, or badly corrupted
    Magic,

    /// The magic number is right but the header CRC is not
    Crc,

    /// The header is intact, but written by an unknown UBI version
    Version(u8),

    /// The header is intact, but a field holds an impossible value
    Field(&'static str),
}

/// A trait missing from the `income` crate: implements parsing UBI headers from byteslices, with
/// magic and CRC verification.
pub trait ParseHeader<'a>: Sized + DekuContainerRead<'a> + ComputeCrc {
    fn get_magic() -> &'static [u8];
    fn get_hdr_magic(&self) -> &[u8];
    fn get_hdr_version(&self) -> u8;

    /// Parse, reporting why the bytes aren't a usable header
    fn parse_checked(buf: &'a [u8]) -> Result<Self, HeaderDefect> {
        let (_, header) = Self::from_bytes((buf, 0)).map_err(|_| HeaderDefect::Magic)?;

        if header.get_hdr_magic() != Self::get_magic() {
            return Err(HeaderDefect::Magic);
        }

        if !header.check_crc() {
            return Err(HeaderDefect::Crc);
        }

        if header.get_hdr_version() != UBI_VERSION {
            return Err(HeaderDefect::Version(header.get_hdr_version()));
        }

        Ok(header)
    }
}

impl ParseHeader<'_> for EcHdr {
    fn get_magic() -> &'static [u8] {
        UBI_EC_HDR_MAGIC
    }
    fn get_hdr_magic(&self) -> &[u8] {
        &self.magic
    }
    fn get_hdr_version(&self) -> u8 {
        self.version
    }
}

impl ParseHeader<'_> for VidHdr {
    fn get_magic() -> &'static [u8] {
        UBI_VID_HDR_MAGIC
    }
    fn get_hdr_magic(&self) -> &[u8] {
        &self.magic
    }
    fn get_hdr_version(&self) -> u8 {
        self.version
    }
}

/// Another trait missing from `income` to compute the correct CRC for some Vid/Ec header
pub trait ComputeCrc: DekuContainerWrite {
    fn compute_crc(&self) -> u32 {
        let header_bytes = self
            .to_bytes()
            .expect("fixed-layout UBI headers always serialize");
        let header_len = header_bytes.len() - std::mem::size_of::<u32>();
        UBI_CRC.checksum(&header_bytes[..header_len])
    }

    fn check_crc(&self) -> bool {
        self.get_crc() == self.compute_crc()
    }

    fn fix_crc(&mut self) {
        self.set_crc(self.compute_crc())
    }

    fn get_crc(&self) -> u32;
    fn set_crc(&mut self, crc: u32);
}

impl ComputeCrc for EcHdr {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}
impl ComputeCrc for VidHdr {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}
impl ComputeCrc for VtblRecord {
    fn get_crc(&self) -> u32 {
        self.crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.crc = crc;
    }
}

/// This represents the specific fields we care about in an EC header
///
/// This is meant to be more ergonomic to work with than EcHdr, which represents the raw data
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Ec {
    pub ec: u64,
    pub vid_hdr_offset: u32,
    pub data_offset: u32,
    pub image_seq: u32,
}

impl Ec {
    /// Change the erase counter of this EC header
    pub fn ec(mut self, ec: u64) -> Self {
        self.ec = ec;
        self
    }

    /// Convert from a byte slice
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        Self::decode_checked(bytes).ok()
    }

    /// Convert from a byte slice, reporting why it isn't an EC header
    pub fn decode_checked(bytes: &[u8]) -> Result<Self, HeaderDefect> {
        EcHdr::parse_checked(bytes).map(|x| x.into())
    }

    /// Write into a byte slice
    pub fn encode(self, out_bytes: &mut [u8]) -> anyhow::Result<()> {
        let bytes = EcHdr::from(self).to_bytes()?;
        let out_bytes = out_bytes
            .get_mut(..bytes.len())
            .ok_or(anyhow::anyhow!("out_bytes too small"))?;
        out_bytes.copy_from_slice(&bytes);
        Ok(())
    }
}

impl From<EcHdr> for Ec {
    fn from(value: EcHdr) -> Self {
        let EcHdr {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
            ..
        } = value;

        Self {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
        }
    }
}

impl From<Ec> for EcHdr {
    fn from(value: Ec) -> EcHdr {
        let Ec {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
        } = value;

        let mut target = Self {
            magic: *b"UBI#",
            version: UBI_VERSION,

            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,

            hdr_crc: Default::default(),
            padding1: Default::default(),
            padding2: Default::default(),
        };

        target.fix_crc();
        target
    }
}

/// These represent UBI volume types
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum VolType {
    /// A volume that may be read and written in random order
    #[default]
    Dynamic,

    /// A volume that is read-only after it is initially written, except for whole-volume updates
    Static,
}

impl From<VolType> for u8 {
    fn from(value: VolType) -> Self {
        match value {
            VolType::Dynamic => 1,
            VolType::Static => 2,
        }
    }
}

impl TryFrom<u8> for VolType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Dynamic),
            2 => Ok(Self::Static),
            _ => Err(()),
        }
    }
}

/// How a UBI implementation that doesn't know an internal volume must treat its PEBs
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Compat {
    /// Erase the PEBs; the volume can be recreated by whoever owns it
    Delete,

    /// Keep the PEBs, but refuse to write anything to the device
    ReadOnly,

    /// Keep the PEBs, and never touch them
    Preserve,

    /// Refuse to attach the device at all
    Reject,
}

impl From<Compat> for u8 {
    fn from(value: Compat) -> Self {
        match value {
            Compat::Delete => 1,
            Compat::ReadOnly => 2,
            Compat::Preserve => 4,
            Compat::Reject => 5,
        }
    }
}

impl TryFrom<u8> for Compat {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Delete),
            2 => Ok(Self::ReadOnly),
            4 => Ok(Self::Preserve),
            5 => Ok(Self::Reject),
            _ => Err(()),
        }
    }
}

/// This represents the specific fields we care about in a VID header
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Vid {
    /// The type of volume.
    pub vol_type: VolType,

    /// Whether this PEB was written as a copy of another, for wear-leveling purposes.
    pub copy_flag: bool,

    /// For internal volumes, flags indicating how UBI should handle the volume.
    pub compat: u8,

    /// The ID of the volume, and entry in the volume table.
    pub vol_id: u32,

    /// The offset of the LEB within this volume.
    pub lnum: u32,

    /// For `Static` volumes and copied LEBs, the number of bytes written at the same time as the
    /// VID header, which are thus included in `data_crc`; otherwise 0.
    pub data_size: u32,

    /// The number of LEBs used by this volume, or 0 if this volume is `Dynamic`
    pub used_ebs: u32,

    /// The number of bytes unused at the end of the PEB, to cut the LEB down to a multiple of the
    /// requested volume alignment size.
    pub data_pad: u32,

    /// The CRC of the first `data_size` bytes of the LEB, or 0 when unused.
    pub data_crc: u32,

    /// A unique counter greater than any other VID header written, for resolving `vol_id:lnum`
    /// collisions.
    pub sqnum: u64,
}

impl Vid {
    /// Change the sequence number for this `Vid`
    pub fn sqnum(mut self, sqnum: u64) -> Self {
        self.sqnum = sqnum;
        self
    }

    /// Convert from a byte slice
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        Self::decode_checked(bytes).ok()
    }

    /// Convert from a byte slice, reporting why it isn't a usable VID header
    pub fn decode_checked(bytes: &[u8]) -> Result<Self, HeaderDefect> {
        VidHdr::parse_checked(bytes)?.try_into()
    }

    /// Write into a byte slice
    pub fn encode(self, out_bytes: &mut [u8]) -> anyhow::Result<()> {
        let bytes = VidHdr::from(self).to_bytes()?;
        let out_bytes = out_bytes
            .get_mut(..bytes.len())
            .ok_or(anyhow::anyhow!("out_bytes too small"))?;
        out_bytes.copy_from_slice(&bytes);
        Ok(())
    }
}

impl TryFrom<VidHdr> for Vid {
    type Error = HeaderDefect;

    fn try_from(value: VidHdr) -> Result<Self, Self::Error> {
        let VidHdr {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
            ..
        } = value;

        let vol_type = vol_type
            .try_into()
            .map_err(|_| HeaderDefect::Field("vol_type"))?;
        let copy_flag = match copy_flag {
            0 => false,
            1 => true,
            _ => return Err(HeaderDefect::Field("copy_flag")),
        };

        Ok(Self {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
        })
    }
}

impl From<Vid> for VidHdr {
    fn from(value: Vid) -> VidHdr {
        let Vid {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
        } = value;

        let vol_type = vol_type.into();
        let copy_flag = copy_flag.into();

        let mut target = Self {
            magic: *b"UBI!",
            version: UBI_VERSION,

            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,

            hdr_crc: Default::default(),
            padding1: Default::default(),
            padding2: Default::default(),
            padding3: Default::default(),
        };

        target.fix_crc();
        target
    }
}

/// This represents the specific fields we care about in a volume table record
#[derive(Debug, Default, Eq, PartialEq, Clone)]
pub struct VolTableRecord {
    /// The total number of PEBs allocated to this volume.
    pub reserved_pebs: u32,

    /// All LEBs in this volume will be a multiple of this size.
    pub alignment: u32,

    /// The number of bytes reserved from the end of each PEB to ensure alignment.
    pub data_pad: u32,

    /// The type of volume.
    pub vol_type: VolType,

    /// Set to `true` during a whole-volume update, so that if interrupted, it's possible to detect
    /// that the volume is corrupt.
    pub upd_marker: bool,

    /// The name of the volume.
    pub name: String,

    /// Any flags set on this volume.
    pub flags: u8,
}

impl VolTableRecord {
    /// Convert from a byte slice
    ///
    /// `Ok(None)` is an intact record for an unused volume slot.
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>, HeaderDefect> {
        let (_, vtblrec) = VtblRecord::from_bytes((bytes, 0)).map_err(|_| HeaderDefect::Magic)?;
        if !vtblrec.check_crc() {
            return Err(HeaderDefect::Crc);
        }
        if vtblrec.reserved_pebs == 0 {
            return Ok(None);
        }
        vtblrec.try_into().map(Some)
    }

    /// Write into a Vec<u8>
    pub fn into_bytes(self) -> Vec<u8> {
        VtblRecord::from(self)
            .to_bytes()
            .expect("fixed-layout volume table records always serialize")
    }

    /// Represent an empty entry in the volume table
    pub fn none_into_bytes() -> Vec<u8> {
        let mut record = VtblRecord {
            reserved_pebs: Default::default(),
            alignment: Default::default(),
            data_pad: Default::default(),
            vol_type: Default::default(),
            upd_marker: Default::default(),
            name: std::array::from_fn(|_| 0u8),
            name_len: Default::default(),
            flags: Default::default(),
            crc: Default::default(),
            padding: Default::default(),
        };
        record.fix_crc();
        record
            .to_bytes()
            .expect("fixed-layout volume table records always serialize")
    }
}

pub trait OptionIntoBytes {
    fn into_bytes(self) -> Vec<u8>;
}

impl OptionIntoBytes for Option<VolTableRecord> {
    fn into_bytes(self) -> Vec<u8> {
        match self {
            Some(x) => x.into_bytes(),
            None => VolTableRecord::none_into_bytes(),
        }
    }
}

impl TryFrom<VtblRecord> for VolTableRecord {
    type Error = HeaderDefect;

    fn try_from(value: VtblRecord) -> Result<Self, Self::Error> {
        let VtblRecord {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            name_len,
            flags,
            ..
        } = value;

        let vol_type = vol_type
            .try_into()
            .map_err(|_| HeaderDefect::Field("vol_type"))?;
        let upd_marker = upd_marker != 0;
        let name = name
            .get(..name_len as usize)
            .and_then(|x| std::str::from_utf8(x).ok())
            .ok_or(HeaderDefect::Field("name"))?
            .to_string();

        Ok(Self {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            flags,
        })
    }
}

impl From<VolTableRecord> for VtblRecord {
    fn from(value: VolTableRecord) -> VtblRecord {
        let VolTableRecord {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            flags,
        } = value;

        let vol_type = vol_type.into();
        let upd_marker = upd_marker.into();
        let name_len = name.len() as _;

        let name_bytes = name.as_bytes();
        let mut name = std::array::from_fn(|_| 0u8);
        name[..name_bytes.len()].copy_from_slice(name_bytes);

        let mut target = Self {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            name_len,
            flags,

            crc: Default::default(),
            padding: Default::default(),
        };

        target.fix_crc();
        target
    }
}

#[test]
fn test_encode() -> anyhow::Result<()> {
    let ec = Ec::default();
    let vid = Vid::default();
    let vtbl = VolTableRecord {
        reserved_pebs: 3,
        alignment: 1024,
        name: "example".to_string(),
        ..Default::default()
    };

    let mut buf = vec![0u8; 1024];

    ec.encode(&mut buf)?;
    assert_eq!(Ec::decode(&buf), Some(ec));

    vid.encode(&mut buf)?;
    assert_eq!(Vid::decode(&buf), Some(vid));

    let vec = vtbl.clone().into_bytes();
    assert_eq!(VolTableRecord::decode(&vec), Ok(Some(vtbl)));
    assert_eq!(VolTableRecord::decode(&VolTableRecord::none_into_bytes()), Ok(None));

    Ok(())
}

#[test]
fn test_header_defects() -> anyhow::Result<()> {
    let mut buf = vec![0xFFu8; UBI_EC_HDR_SIZE];
    assert_eq!(Ec::decode_checked(&buf), Err(HeaderDefect::Magic));

    Ec::default().ec(12).encode(&mut buf)?;
    buf[10] ^= 0x40;
    assert_eq!(Ec::decode_checked(&buf), Err(HeaderDefect::Crc));

    // A VID header with an impossible volume type, but an otherwise valid CRC
    let mut hdr = VidHdr::from(Vid::default());
    hdr.vol_type = 9;
    hdr.fix_crc();
    let bytes = hdr.to_bytes()?;
    assert_eq!(
        Vid::decode_checked(&bytes),
        Err(HeaderDefect::Field("vol_type"))
    );

    Ok(())
}

#[test]
fn test_compat_codes() {
    for compat in [
        Compat::Delete,
        Compat::ReadOnly,
        Compat::Preserve,
        Compat::Reject,
    ] {
        assert_eq!(Compat::try_from(u8::from(compat)), Ok(compat));
    }
    assert_eq!(Compat::try_from(3), Err(()));
}
