//! UBI's view of a flash device: where the headers and data live inside each PEB, and how the
//! raw reads of them are classified.
//!
//! Every PEB is laid out the same way:
//!
//! ```text
//! +------ page 0 ------+------ page 1 ------+------ page 2 .. N ------------------+
//! | EC header          | VID header(s)      | data (one LEB per consolidation     |
//! |                    | 64 bytes per slot  | slot, split evenly)                 |
//! +--------------------+--------------------+-------------------------------------+
//! ```

use super::headers::*;
use crate::error::{AttachError, Result};
use crate::nand::{Nand, NandBlock, NandLayout, PageUtil, ReadStatus};

use anyhow::{anyhow, ensure};

/// The most LEBs a single PEB may be consolidated to hold
pub const UBI_MAX_LEBS_PER_PEB: u32 = 8;

/// Where things are inside each PEB of a device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Geometry {
    pub peb_count: u32,
    pub page_size: usize,
    pub pages_per_block: u32,

    /// How many LEBs are packed into a consolidated PEB; 1 means no consolidation
    pub lebs_per_peb: u32,
}

impl Geometry {
    /// Work out the geometry of a NAND with the given layout
    pub fn new(layout: NandLayout, lebs_per_peb: u32) -> anyhow::Result<Self> {
        ensure!(
            (1..=UBI_MAX_LEBS_PER_PEB).contains(&lebs_per_peb),
            "cannot consolidate {lebs_per_peb} LEBs per PEB"
        );
        ensure!(
            layout.pages_per_block >= 3,
            "need at least 3 pages per block, have {}",
            layout.pages_per_block
        );
        ensure!(
            layout.bytes_per_page >= UBI_VID_HDR_SIZE * lebs_per_peb as usize,
            "page size {} too small for {lebs_per_peb} VID headers",
            layout.bytes_per_page
        );

        Ok(Self {
            peb_count: layout.blocks,
            page_size: layout.bytes_per_page,
            pages_per_block: layout.pages_per_block,
            lebs_per_peb,
        })
    }

    /// Byte offset of the VID header(s) within a PEB
    pub fn vid_hdr_offset(&self) -> u32 {
        self.page_size as u32
    }

    /// Byte offset of the data area within a PEB
    pub fn data_offset(&self) -> u32 {
        self.page_size as u32 * 2
    }

    /// Size of the data area of a PEB
    pub fn data_size(&self) -> usize {
        self.page_size * (self.pages_per_block - 2) as usize
    }

    /// Size of one LEB
    pub fn leb_size(&self) -> usize {
        self.data_size() / self.lebs_per_peb as usize
    }

    /// The EC header every PEB of this device should carry, with a given erase counter
    pub fn ec_header(&self, ec: u64, image_seq: u32) -> Ec {
        Ec {
            ec,
            vid_hdr_offset: self.vid_hdr_offset(),
            data_offset: self.data_offset(),
            image_seq,
        }
    }
}

/// The outcome of reading one of the headers of a PEB
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum HdrRead<T> {
    /// A valid header
    Valid(T),

    /// A valid header, but the ECC engine had to correct bitflips to get it
    Bitflips(T),

    /// The header area is erased
    Blank,

    /// The header area is erased, but the ECC engine reported bitflips
    BlankBitflips,

    /// The header area holds something that isn't a valid header
    Corrupted,

    /// The header area holds something that isn't a valid header, and it was unreadable anyway
    CorruptedEcc,
}

impl<T> HdrRead<T> {
    /// Classify the result of decoding the header bytes `hdr`, which came back with `status`
    fn classify(hdr: &[u8], status: ReadStatus, decoded: std::result::Result<T, HeaderDefect>, pnum: u32) -> Result<Self> {
        match decoded {
            // A header whose CRC checks out survived whatever the ECC engine complained about
            Ok(x) if status.is_dirty() => Ok(Self::Bitflips(x)),
            Ok(x) => Ok(Self::Valid(x)),

            Err(HeaderDefect::Magic) => Ok(match status {
                ReadStatus::Uncorrectable => Self::CorruptedEcc,
                ReadStatus::Bitflips if hdr.is_erased() => Self::BlankBitflips,
                ReadStatus::Clean if hdr.is_erased() => Self::Blank,
                _ => Self::Corrupted,
            }),
            Err(HeaderDefect::Crc) => Ok(match status {
                ReadStatus::Uncorrectable => Self::CorruptedEcc,
                _ => Self::Corrupted,
            }),

            Err(HeaderDefect::Version(version)) => {
                Err(AttachError::UnsupportedVersion { pnum, version })
            }
            Err(HeaderDefect::Field(reason)) => Err(AttachError::InvalidVidHeader { pnum, reason }),
        }
    }
}

/// Check the fields of a CRC-valid VID header for values UBI never writes
pub fn validate_vid(vid: &Vid, geometry: &Geometry) -> std::result::Result<(), &'static str> {
    let leb_size = geometry.leb_size() as u32;

    if vid.vol_id >= UBI_MAX_VOLUMES && !is_internal_volume(vid.vol_id) {
        return Err("volume ID out of range");
    }
    if !is_internal_volume(vid.vol_id) && vid.compat != 0 {
        return Err("compat set on a user volume");
    }
    if is_internal_volume(vid.vol_id) && Compat::try_from(vid.compat).is_err() {
        return Err("unknown compat value");
    }
    if vid.data_pad >= leb_size / 2 {
        return Err("data_pad too large");
    }

    let usable_leb_size = leb_size - vid.data_pad;
    match vid.vol_type {
        VolType::Static => {
            if vid.used_ebs == 0 {
                return Err("static volume without used_ebs");
            }
            if vid.lnum >= vid.used_ebs {
                return Err("LEB number beyond used_ebs");
            }
            if vid.lnum < vid.used_ebs - 1 && vid.data_size != usable_leb_size {
                return Err("non-final static LEB not full");
            }
            if vid.data_size == 0 || vid.data_size > usable_leb_size {
                return Err("static LEB data_size out of range");
            }
        }
        VolType::Dynamic => {
            if vid.used_ebs != 0 {
                return Err("used_ebs set on a dynamic volume");
            }
            if vid.copy_flag {
                if vid.data_size == 0 || vid.data_size > usable_leb_size {
                    return Err("copied LEB data_size out of range");
                }
            } else if vid.data_size != 0 || vid.data_crc != 0 {
                return Err("data_size/data_crc set on an uncopied dynamic LEB");
            }
        }
    }

    Ok(())
}

/// UBI-level access to a flash device
pub struct UbiIo<'a, N: Nand> {
    nand: &'a mut N,
    geometry: Geometry,
    page_buf: Vec<u8>,
}

impl<'a, N: Nand> UbiIo<'a, N> {
    pub fn new(nand: &'a mut N, lebs_per_peb: u32) -> anyhow::Result<Self> {
        let geometry = Geometry::new(nand.get_layout(), lebs_per_peb)?;
        let page_buf = vec![0; geometry.page_size];

        Ok(Self {
            nand,
            geometry,
            page_buf,
        })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn peb_count(&self) -> u32 {
        self.geometry.peb_count
    }

    /// Is this PEB marked bad?
    pub fn is_bad(&mut self, pnum: u32) -> Result<bool> {
        Ok(self.nand.block(pnum)?.is_none())
    }

    /// Read whole pages of a PEB that is expected to be good
    fn read_pages(&mut self, pnum: u32, start_page: u32, buf: &mut [u8]) -> Result<ReadStatus> {
        let block = self
            .nand
            .block(pnum)?
            .ok_or_else(|| anyhow!("PEB {pnum} went bad while attaching"))?;
        Ok(block.read(start_page, buf)?)
    }

    /// Read and classify the EC header of a PEB
    pub fn read_ec_hdr(&mut self, pnum: u32) -> Result<HdrRead<Ec>> {
        let mut page = std::mem::take(&mut self.page_buf);
        let result = self.read_pages(pnum, 0, &mut page).and_then(|status| {
            let hdr = &page[..UBI_EC_HDR_SIZE];
            HdrRead::classify(hdr, status, Ec::decode_checked(hdr), pnum)
        });
        self.page_buf = page;
        result
    }

    /// Read and classify the VID header(s) of a PEB
    ///
    /// A consolidated PEB carries one header per slot, back-to-back; the list ends at the first
    /// erased slot. A damaged header in any slot makes the whole set untrustworthy.
    pub fn read_vid_hdrs(&mut self, pnum: u32) -> Result<HdrRead<Vec<Vid>>> {
        let mut page = std::mem::take(&mut self.page_buf);
        let vid_page = self.geometry.vid_hdr_offset() / self.geometry.page_size as u32;
        let result = self
            .read_pages(pnum, vid_page, &mut page)
            .and_then(|status| self.classify_vid_page(pnum, &page, status));
        self.page_buf = page;
        result
    }

    fn classify_vid_page(&self, pnum: u32, page: &[u8], status: ReadStatus) -> Result<HdrRead<Vec<Vid>>> {
        let mut slots = page
            .chunks_exact(UBI_VID_HDR_SIZE)
            .take(self.geometry.lebs_per_peb as usize);

        let first = slots.next().unwrap_or_default();
        let mut vids = match HdrRead::classify(first, status, Vid::decode_checked(first), pnum)? {
            HdrRead::Valid(vid) | HdrRead::Bitflips(vid) => vec![vid],
            HdrRead::Blank => return Ok(HdrRead::Blank),
            HdrRead::BlankBitflips => return Ok(HdrRead::BlankBitflips),
            HdrRead::Corrupted => return Ok(HdrRead::Corrupted),
            HdrRead::CorruptedEcc => return Ok(HdrRead::CorruptedEcc),
        };

        for slot in slots {
            if slot.is_erased() {
                break;
            }
            match Vid::decode_checked(slot) {
                Ok(vid) => vids.push(vid),
                Err(HeaderDefect::Magic | HeaderDefect::Crc) => {
                    return Ok(match status {
                        ReadStatus::Uncorrectable => HdrRead::CorruptedEcc,
                        _ => HdrRead::Corrupted,
                    })
                }
                Err(HeaderDefect::Version(version)) => {
                    return Err(AttachError::UnsupportedVersion { pnum, version })
                }
                Err(HeaderDefect::Field(reason)) => {
                    return Err(AttachError::InvalidVidHeader { pnum, reason })
                }
            }
        }

        for vid in &vids {
            validate_vid(vid, &self.geometry)
                .map_err(|reason| AttachError::InvalidVidHeader { pnum, reason })?;
        }

        Ok(match status {
            ReadStatus::Clean => HdrRead::Valid(vids),
            _ => HdrRead::Bitflips(vids),
        })
    }

    /// Read `len` bytes of a PEB's data area, starting `offset` bytes in, into `buf`
    pub fn read_data(
        &mut self,
        pnum: u32,
        offset: usize,
        len: usize,
        buf: &mut Vec<u8>,
    ) -> Result<ReadStatus> {
        buf.clear();
        if len == 0 {
            return Ok(ReadStatus::Clean);
        }

        let page_size = self.geometry.page_size;
        let start = self.geometry.data_offset() as usize + offset;
        let end = start + len;
        if end > page_size * self.geometry.pages_per_block as usize {
            return Err(anyhow!("read of {len} bytes at {offset} runs off the end of PEB {pnum}").into());
        }

        let first_page = start / page_size;
        let end_page = end.div_ceil(page_size);
        buf.resize((end_page - first_page) * page_size, 0);

        let status = self.read_pages(pnum, first_page as u32, buf)?;
        buf.drain(..start - first_page * page_size);
        buf.truncate(len);
        Ok(status)
    }

    /// Erase a PEB
    pub fn sync_erase(&mut self, pnum: u32) -> Result<()> {
        let mut block = self
            .nand
            .block(pnum)?
            .ok_or_else(|| anyhow!("cannot erase bad PEB {pnum}"))?;
        Ok(block.erase()?)
    }

    /// Write an EC header into a freshly erased PEB
    pub fn write_ec_hdr(&mut self, pnum: u32, ec: Ec) -> Result<()> {
        let mut page = vec![0xFF; self.geometry.page_size];
        ec.encode(&mut page)?;

        let mut block = self
            .nand
            .block(pnum)?
            .ok_or_else(|| anyhow!("cannot write to bad PEB {pnum}"))?;
        Ok(block.program(0, &page)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{SimFault, SimNand};
    use crate::ubi::testutil::*;

    #[test]
    fn test_header_reads() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        let geometry = Geometry::new(TEST_LAYOUT, 1)?;

        write_ec(&mut nand, &geometry, 1, 10)?;
        write_leb(&mut nand, &geometry, 2, 10, dyn_vid(0, 0, 1), &[])?;
        write_leb(&mut nand, &geometry, 3, 10, dyn_vid(0, 1, 2), &[])?;
        nand.inject_fault(3, 1, SimFault::Bitflips);
        write_leb(&mut nand, &geometry, 4, 10, dyn_vid(0, 2, 3), &[])?;
        corrupt_vid(&mut nand, &geometry, 4);
        nand.inject_fault(5, 0, SimFault::Uncorrectable);
        nand.corrupt(5, 0, &[0x12, 0x34]);

        let mut io = UbiIo::new(&mut nand, 1)?;

        assert_eq!(io.read_ec_hdr(0)?, HdrRead::Blank);
        assert!(matches!(io.read_ec_hdr(1)?, HdrRead::Valid(ec) if ec.ec == 10));
        assert_eq!(io.read_vid_hdrs(1)?, HdrRead::Blank);
        assert!(matches!(io.read_vid_hdrs(2)?, HdrRead::Valid(v) if v.len() == 1 && v[0].lnum == 0));
        assert!(matches!(io.read_vid_hdrs(3)?, HdrRead::Bitflips(v) if v[0].sqnum == 2));
        assert_eq!(io.read_vid_hdrs(4)?, HdrRead::Corrupted);
        assert_eq!(io.read_ec_hdr(5)?, HdrRead::CorruptedEcc);

        Ok(())
    }

    #[test]
    fn test_read_data_window() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        let geometry = Geometry::new(TEST_LAYOUT, 1)?;

        let payload: Vec<u8> = (0..=255u8).cycle().take(300).collect();
        write_leb(&mut nand, &geometry, 0, 1, dyn_vid(0, 0, 1), &payload)?;

        let mut io = UbiIo::new(&mut nand, 1)?;
        let mut buf = Vec::new();
        assert_eq!(io.read_data(0, 5, 200, &mut buf)?, ReadStatus::Clean);
        assert_eq!(buf, payload[5..205]);

        io.read_data(0, 0, 0, &mut buf)?;
        assert!(buf.is_empty());

        let data_size = io.geometry().data_size();
        assert!(io.read_data(0, data_size - 4, 8, &mut buf).is_err());

        Ok(())
    }

    #[test]
    fn test_validate_vid() -> anyhow::Result<()> {
        let geometry = Geometry::new(TEST_LAYOUT, 1)?;
        let leb_size = geometry.leb_size() as u32;

        assert_eq!(validate_vid(&dyn_vid(3, 0, 1), &geometry), Ok(()));
        assert!(validate_vid(&dyn_vid(500, 0, 1), &geometry).is_err());

        let mut vid = static_vid(1, 0, 1, 2, leb_size);
        assert_eq!(validate_vid(&vid, &geometry), Ok(()));
        vid.data_size = 10;
        assert!(validate_vid(&vid, &geometry).is_err());
        vid.lnum = 1;
        assert_eq!(validate_vid(&vid, &geometry), Ok(()));
        vid.lnum = 2;
        assert!(validate_vid(&vid, &geometry).is_err());

        let mut vid = dyn_vid(0, 0, 1);
        vid.compat = 1;
        assert!(validate_vid(&vid, &geometry).is_err());

        Ok(())
    }

    #[test]
    fn test_geometry_limits() {
        assert!(Geometry::new(TEST_LAYOUT, 0).is_err());
        assert!(Geometry::new(TEST_LAYOUT, UBI_MAX_LEBS_PER_PEB + 1).is_err());

        let geometry = Geometry::new(TEST_LAYOUT, 2).unwrap();
        assert_eq!(geometry.leb_size() * 2, geometry.data_size());
    }
}
