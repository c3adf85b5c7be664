//! Helpers for building UBI images on a [SimNand] in tests.

use super::fastmap::{FmData, FmSuperblock};
use super::headers::*;
use super::io::Geometry;
use crate::nand::{Nand, NandBlock, NandLayout, SimNand};

use anyhow::{anyhow, ensure};
use deku::DekuContainerWrite;

pub const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 32,
    pages_per_block: 8,
    bytes_per_page: 256,
};

/// The image sequence number every helper writes into EC headers
pub const TEST_IMAGE_SEQ: u32 = 0x5EED_1234;

/// A layout like [TEST_LAYOUT], with a different number of blocks
pub fn layout_with_blocks(blocks: u32) -> NandLayout {
    NandLayout {
        blocks,
        ..TEST_LAYOUT
    }
}

/// A dynamic-volume VID header
pub fn dyn_vid(vol_id: u32, lnum: u32, sqnum: u64) -> Vid {
    Vid {
        vol_type: VolType::Dynamic,
        vol_id,
        lnum,
        sqnum,
        ..Default::default()
    }
}

/// A static-volume VID header; `data_crc` is left for [with_data] to fill in
pub fn static_vid(vol_id: u32, lnum: u32, sqnum: u64, used_ebs: u32, data_size: u32) -> Vid {
    Vid {
        vol_type: VolType::Static,
        vol_id,
        lnum,
        sqnum,
        used_ebs,
        data_size,
        ..Default::default()
    }
}

/// Fill in `data_size` and `data_crc` to describe `payload`
pub fn with_data(vid: Vid, payload: &[u8]) -> Vid {
    Vid {
        data_size: payload.len() as u32,
        data_crc: UBI_CRC.checksum(payload),
        ..vid
    }
}

/// Turn a dynamic VID header into that of a wear-leveling copy of `payload`
pub fn copy_of(vid: Vid, payload: &[u8]) -> Vid {
    Vid {
        copy_flag: true,
        ..with_data(vid, payload)
    }
}

/// Write just an EC header into a PEB
pub fn write_ec(nand: &mut SimNand, geometry: &Geometry, pnum: u32, ec: u64) -> anyhow::Result<()> {
    write_peb(nand, geometry, pnum, ec, &[], &[])
}

/// Write a complete single-LEB PEB
pub fn write_leb(
    nand: &mut SimNand,
    geometry: &Geometry,
    pnum: u32,
    ec: u64,
    vid: Vid,
    payload: &[u8],
) -> anyhow::Result<()> {
    write_peb(nand, geometry, pnum, ec, &[vid], &[payload])
}

/// Write a PEB with one VID header and payload per slot
pub fn write_peb(
    nand: &mut SimNand,
    geometry: &Geometry,
    pnum: u32,
    ec: u64,
    vids: &[Vid],
    payloads: &[&[u8]],
) -> anyhow::Result<()> {
    let mut page = vec![0xFF; geometry.page_size];
    let mut block = nand
        .block(pnum)?
        .ok_or_else(|| anyhow!("PEB {pnum} is bad"))?;

    geometry
        .ec_header(ec, TEST_IMAGE_SEQ)
        .encode(&mut page)?;
    block.program(0, &page)?;

    if vids.is_empty() {
        return Ok(());
    }

    page.fill(0xFF);
    for (vid, slot) in vids.iter().zip(page.chunks_exact_mut(UBI_VID_HDR_SIZE)) {
        vid.encode(slot)?;
    }
    block.program(1, &page)?;

    let leb_size = geometry.leb_size();
    let mut data = vec![0xFF; geometry.data_size()];
    for (payload, slot) in payloads.iter().zip(data.chunks_exact_mut(leb_size)) {
        slot[..payload.len()].copy_from_slice(payload);
    }
    block.program(2, &data)?;

    Ok(())
}

/// Write one copy of the volume table into a PEB of the layout volume
pub fn write_vtbl(
    nand: &mut SimNand,
    geometry: &Geometry,
    pnum: u32,
    lnum: u32,
    sqnum: u64,
    records: &[Option<VolTableRecord>],
) -> anyhow::Result<()> {
    let slots = (geometry.leb_size() / UBI_VTBL_RECORD_SIZE).min(UBI_MAX_VOLUMES as usize);

    let mut table = Vec::with_capacity(slots * UBI_VTBL_RECORD_SIZE);
    for i in 0..slots {
        table.extend(records.get(i).cloned().flatten().into_bytes());
    }

    write_leb(nand, geometry, pnum, 1, layout_vid(lnum, sqnum), &table)
}

/// A VID header for the layout volume
pub fn layout_vid(lnum: u32, sqnum: u64) -> Vid {
    Vid {
        compat: Compat::Reject.into(),
        ..dyn_vid(UBI_LAYOUT_VOLUME_ID, lnum, sqnum)
    }
}

/// A volume table record for a small dynamic volume
pub fn vtbl_record(name: &str) -> Option<VolTableRecord> {
    Some(VolTableRecord {
        reserved_pebs: 4,
        alignment: 1,
        vol_type: VolType::Dynamic,
        name: name.to_string(),
        ..Default::default()
    })
}

/// Write a fastmap: its superblock at `sb_pnum` with sequence number `sqnum`, and `data` spread
/// over `data_pnums`
pub fn write_fastmap(
    nand: &mut SimNand,
    geometry: &Geometry,
    sb_pnum: u32,
    data_pnums: &[u32],
    sqnum: u64,
    data: &FmData,
) -> anyhow::Result<()> {
    let leb_size = geometry.leb_size();
    let mut raw = data.to_bytes()?;
    ensure!(raw.len() <= leb_size * data_pnums.len(), "fastmap data too large");
    raw.resize(leb_size * data_pnums.len(), 0xFF);

    for (i, (&pnum, chunk)) in data_pnums.iter().zip(raw.chunks(leb_size)).enumerate() {
        let vid = fastmap_vid(UBI_FM_DATA_VOLUME_ID, i as u32, sqnum + 1 + i as u64);
        write_leb(nand, geometry, pnum, 1, vid, chunk)?;
    }

    let blocks: Vec<(u32, u64)> = data_pnums.iter().map(|&pnum| (pnum, 1)).collect();
    let sb = FmSuperblock::new(sqnum, UBI_CRC.checksum(&raw), &blocks);
    let vid = fastmap_vid(UBI_FM_SB_VOLUME_ID, 0, sqnum);
    write_leb(nand, geometry, sb_pnum, 1, vid, &sb.to_bytes()?)
}

fn fastmap_vid(vol_id: u32, lnum: u32, sqnum: u64) -> Vid {
    Vid {
        compat: Compat::Delete.into(),
        ..dyn_vid(vol_id, lnum, sqnum)
    }
}

/// Damage the (first) VID header of a PEB beyond recognition
pub fn corrupt_vid(nand: &mut SimNand, geometry: &Geometry, pnum: u32) {
    nand.corrupt(pnum, geometry.vid_hdr_offset() as usize, &[0x00]);
}

/// Damage the EC header of a PEB beyond recognition
pub fn corrupt_ec(nand: &mut SimNand, pnum: u32) {
    nand.corrupt(pnum, 0, &[0x00]);
}
