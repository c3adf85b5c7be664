//! Abstractions and code to access NAND flash

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::str::FromStr;

use anyhow::{bail, ensure};

#[cfg(target_os = "linux")]
pub mod mtd;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// How cleanly a read came back from the flash's ECC engine.
///
/// Ordered from best to worst, so that the status of a multi-page read is the `max` of the
/// statuses of its pages.
#[derive(Debug, Default, Eq, PartialEq, Ord, PartialOrd, Copy, Clone)]
pub enum ReadStatus {
    /// No errors were seen
    #[default]
    Clean,

    /// The ECC engine corrected one or more bitflips; the data is good, but the block is wearing
    Bitflips,

    /// The ECC engine could not correct the data; the buffer holds whatever was read
    Uncorrectable,
}

impl ReadStatus {
    /// Did the ECC engine have to do (or fail to do) anything?
    pub fn is_dirty(self) -> bool {
        self != Self::Clean
    }
}

/// A pub-fields struct describing the data layout of a NAND flash device
#[derive(Debug, Copy, Clone)]
pub struct NandLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
}

impl NandLayout {
    /// The number of bytes in one eraseblock
    pub fn block_size(&self) -> usize {
        self.bytes_per_page * self.pages_per_block as usize
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTES"
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [blocks, pages_per_block, bytes_per_page]: [&str; 3] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#"))?;
        let blocks = blocks.parse()?;
        let pages_per_block = pages_per_block.parse()?;
        let bytes_per_page = bytes_per_page.parse()?;

        Ok(NandLayout {
            blocks,
            pages_per_block,
            bytes_per_page,
        })
    }
}

/// Represents a NAND flash device
pub trait Nand {
    type Block<'a>: NandBlock + 'a
    where
        Self: 'a;

    /// Get a block
    ///
    /// Returns None if `index` refers to a block marked bad
    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>>;

    /// Get the layout of the NAND
    fn get_layout(&self) -> NandLayout;
}

/// Represents a block of a NAND flash device
pub trait NandBlock {
    /// How many pages in this block?
    fn page_count(&self) -> u32;

    /// How many bytes per page?
    fn page_size(&self) -> usize;

    /// Read an integral number of pages, starting at the specified page
    ///
    /// ECC trouble is not an error: the content is filled in regardless, and the returned
    /// [ReadStatus] says how trustworthy it is. An `Err` means the read itself failed.
    fn read(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<ReadStatus>;

    /// Write the specified content, beginning at the specified page
    ///
    /// Note that `index` must be greater than any previously-written index, or in other words,
    /// writing a page makes it and all skipped pages nonwritable. This is to comply with the
    /// sequential-write requirements of certain MLC NANDs.
    fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()>;

    /// Erase a block, making all pages writable again
    fn erase(&mut self) -> anyhow::Result<()>;

    /// Marks the block as bad, consuming the block object (it cannot be retrieved again).
    fn mark_bad(self) -> anyhow::Result<()>;
}

/// A fault that [SimNand] reports when a particular page is read
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum SimFault {
    /// Reads succeed, reporting corrected bitflips
    Bitflips,

    /// Reads return the stored data, reporting an uncorrectable ECC error
    Uncorrectable,

    /// Reads fail outright
    ReadError,
}

/// A simulated in-memory NAND flash, for testing purposes
#[derive(Debug, Clone)]
pub struct SimNand {
    blocks: Box<[SimBlock]>,
    layout: NandLayout,
}

/// A block of SimNand
#[derive(Debug, Clone)]
pub struct SimBlock {
    /// All bytes of all written pages (legally, can only append to this)
    data: Vec<u8>,

    /// How many pages in this block
    page_count: u32,

    /// How many bytes per page
    page_size: usize,

    /// Is this block marked bad?
    marked_bad: bool,

    /// Faults to report on reads, by page
    faults: BTreeMap<u32, SimFault>,

    /// Should erasing this block fail?
    erase_fails: bool,
}

impl SimNand {
    /// Create an empty SimNand with the specified layout
    pub fn new(layout: NandLayout) -> Self {
        let blocks = vec![SimBlock::new(layout); layout.blocks as usize];
        let blocks = blocks.into_boxed_slice();

        Self { blocks, layout }
    }

    /// Initialize the NAND contents with content read from a type implementing `Read`.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let size = self.layout.block_size();
        let mut buf = vec![0; size];

        for block in 0..self.layout.blocks {
            let mut block = &mut self.blocks[block as usize];
            block.marked_bad = false;
            block.data.clear();
            read.read_exact(&mut buf)?;
            block.program(0, &buf)?;
        }

        Ok(())
    }

    /// Write the contents of this simulated NAND block out to a writable stream (such as a File)
    pub fn save<W: Write>(&mut self, write: &mut W) -> anyhow::Result<()> {
        let size = self.layout.block_size();
        let mut buf = vec![0; size];

        for block in 0..self.layout.blocks {
            match self.block(block)? {
                None => buf.fill(0xBD),
                Some(block) => {
                    block.read(0, &mut buf)?;
                }
            };

            write.write_all(&buf)?;
        }

        Ok(())
    }

    /// Make reads of one page report a fault
    pub fn inject_fault(&mut self, block: u32, page: u32, fault: SimFault) {
        self.blocks[block as usize].faults.insert(page, fault);
    }

    /// Make erases of one block fail
    pub fn fail_erase(&mut self, block: u32) {
        self.blocks[block as usize].erase_fails = true;
    }

    /// Mark a block bad without going through [NandBlock::mark_bad]
    pub fn set_bad(&mut self, block: u32) {
        let block = &mut self.blocks[block as usize];
        block.data.clear();
        block.marked_bad = true;
    }

    /// Overwrite bytes of a block in place, ignoring programming rules; for simulating corruption
    pub fn corrupt(&mut self, block: u32, offset: usize, bytes: &[u8]) {
        let block = &mut self.blocks[block as usize];
        let end = offset + bytes.len();
        if block.data.len() < end {
            block.data.resize(end, 0xFF);
        }
        block.data[offset..end].copy_from_slice(bytes);
    }
}

impl SimBlock {
    /// Construct an empty block within the given layout
    fn new(layout: NandLayout) -> Self {
        Self {
            data: Default::default(),
            page_count: layout.pages_per_block,
            page_size: layout.bytes_per_page,
            marked_bad: false,
            faults: Default::default(),
            erase_fails: false,
        }
    }

    fn write_page(&mut self, index: u32, content: &[u8]) -> anyhow::Result<()> {
        ensure!(content.len() == self.page_size, "content not page-sized");
        ensure!(index < self.page_count, "page index out of bounds");

        let begin = index as usize * self.page_size;

        ensure!(begin >= self.data.len(), "write in already-written area");

        // Writing fully-erased content is a no-op.
        if !content.is_erased() {
            self.data.resize(begin, 0xFF);
            self.data.extend_from_slice(content);
        }

        Ok(())
    }

    fn read_page(&self, index: u32, content: &mut [u8]) -> anyhow::Result<ReadStatus> {
        ensure!(content.len() == self.page_size, "content not page-sized");
        ensure!(index < self.page_count, "page index out of bounds");

        let status = match self.faults.get(&index) {
            None => ReadStatus::Clean,
            Some(SimFault::Bitflips) => ReadStatus::Bitflips,
            Some(SimFault::Uncorrectable) => ReadStatus::Uncorrectable,
            Some(SimFault::ReadError) => bail!("simulated read failure at page {index}"),
        };

        let begin = index as usize * self.page_size;
        let end = begin + self.page_size;

        match self.data.get(begin..end) {
            Some(page) => content.copy_from_slice(page),
            None => {
                // A corrupted tail may leave a partial page behind
                content.fill(0xFF);
                if let Some(partial) = self.data.get(begin..) {
                    content[..partial.len()].copy_from_slice(partial);
                }
            }
        }

        Ok(status)
    }
}

impl Nand for SimNand {
    type Block<'a> = &'a mut SimBlock;

    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>> {
        self.blocks
            .get_mut(index as usize)
            .ok_or(anyhow::anyhow!("block {index} out of range"))
            .map(|x| Some(x).filter(|y| !y.marked_bad))
    }

    fn get_layout(&self) -> NandLayout {
        self.layout
    }
}

impl NandBlock for &mut SimBlock {
    fn page_count(&self) -> u32 {
        self.page_count
    }
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<ReadStatus> {
        let mut page = start_page;
        let mut status = ReadStatus::Clean;
        for chunk in content.chunks_mut(self.page_size()) {
            status = status.max(self.read_page(page, chunk)?);
            page += 1;
        }
        Ok(status)
    }

    fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()> {
        let mut page = start_page;
        for chunk in content.chunks(self.page_size()) {
            self.write_page(page, chunk)?;
            page += 1;
        }
        Ok(())
    }

    fn erase(&mut self) -> anyhow::Result<()> {
        ensure!(!self.erase_fails, "simulated erase failure");
        self.data.clear();
        self.faults.clear();

        Ok(())
    }

    fn mark_bad(mut self) -> anyhow::Result<()> {
        self.data.clear();
        self.marked_bad = true;
        Ok(())
    }
}

#[cfg(test)]
const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 8,
    pages_per_block: 16,
    bytes_per_page: 256,
};

#[test]
fn test_sim_block() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(nand.block(0).unwrap().is_some());
    assert!(nand.block(TEST_LAYOUT.blocks - 1).unwrap().is_some());
    assert!(nand.block(TEST_LAYOUT.blocks).is_err());
}

#[test]
fn test_sim_mark_bad() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(nand.block(0).unwrap().is_some());
    nand.block(0).unwrap().unwrap().mark_bad().unwrap();
    assert!(nand.block(0).unwrap().is_none());
}

#[test]
fn test_sim_read_write() {
    let mut nand = SimNand::new(TEST_LAYOUT);

    let data_in = vec![0xA5u8; nand.get_layout().bytes_per_page];
    let mut data_out = data_in.clone();

    let mut block = nand.block(0).unwrap().unwrap();
    block.program(2, &data_in).unwrap();
    assert!(block.program(1, &data_in).is_err());

    block.read(1, &mut data_out).unwrap();
    assert!(data_out.is_erased());

    block.read(2, &mut data_out).unwrap();
    assert_eq!(data_out, data_in);

    block.read(3, &mut data_out).unwrap();
    assert!(data_out.is_erased());
}

#[test]
fn test_sim_faults() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.inject_fault(1, 0, SimFault::Bitflips);
    nand.inject_fault(1, 2, SimFault::Uncorrectable);
    nand.inject_fault(1, 4, SimFault::ReadError);

    let page_size = nand.get_layout().bytes_per_page;
    let mut buf = vec![0u8; page_size * 2];
    let block = nand.block(1).unwrap().unwrap();

    assert_eq!(block.read(0, &mut buf).unwrap(), ReadStatus::Bitflips);
    assert_eq!(block.read(1, &mut buf).unwrap(), ReadStatus::Uncorrectable);
    assert!(block.read(4, &mut buf[..page_size]).is_err());
    assert_eq!(block.read(6, &mut buf).unwrap(), ReadStatus::Clean);
}

#[test]
fn test_sim_load() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.load(&mut std::io::repeat(0x55u8)).unwrap();

    let mut buf = vec![0u8; nand.get_layout().block_size()];

    let block = nand.block(0).unwrap().unwrap();
    block.read(0, &mut buf).unwrap();

    assert!(buf.iter().all(|&x| x == 0x55u8));
}
