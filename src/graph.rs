//! The binary graph image.
//!
//! A graph is a single read-mostly block of little-endian 32-bit words:
//!
//! ```text
//! word 0        [unused 6 | compression 2 | graph size in words 24]
//! word 1        interpreter version
//! words 2..=5   per-bank memory consumption, UQ0.8, one byte per bank
//! words 6..=17  section table: 6 pairs { packed address, size in bytes }
//! words 18..    section payloads, concatenated in table order
//! ```
//!
//! Sections, in order: PIO-HW, PIO-GRAPH, SCRIPTS, LINKED-LIST, FORMATS,
//! ARCS. A section whose address word carries the INPLACE flag is read
//! directly out of the image; otherwise the designated main instance copies
//! it to the RAM location named by the packed address during RESET.

use byteorder::{ByteOrder, LittleEndian};

use crate::bits::field;
use crate::error::Error;
use crate::packed::{BankTable, PackedAddr};

/// Version word this runtime interprets.
pub const INTERPRETER_VERSION: u32 = 0x0100;

/// Words in the fixed header (before the section table).
pub const HEADER_WORDS: usize = 6;

/// Words in header plus section table.
pub const HEADER_AND_TABLE_WORDS: usize = HEADER_WORDS + 2 * SECTION_COUNT;

/// Number of sections in the table.
pub const SECTION_COUNT: usize = 6;

/// Bit 30 of a section address word: access the section inside the image
/// instead of copying it to RAM.
const INPLACE_BIT: u32 = 1 << 30;

/// Build a section-table address word that references the payload at word
/// offset `word_off` inside the image itself (the INPLACE access mode).
pub fn inplace_section_addr(word_off: usize) -> u32 {
    INPLACE_BIT | (word_off as u32 & 0x1FFF_FFFF)
}

const GRAPH_SIZE_MSB: u32 = 23;
const GRAPH_SIZE_LSB: u32 = 0;
const COMPRESSION_MSB: u32 = 25;
const COMPRESSION_LSB: u32 = 24;

/// Identifies one of the six graph sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum SectionId {
    PioHw = 0,
    PioGraph = 1,
    Scripts = 2,
    LinkedList = 3,
    Formats = 4,
    Arcs = 5,
}

impl SectionId {
    pub const ALL: [SectionId; SECTION_COUNT] = [
        SectionId::PioHw,
        SectionId::PioGraph,
        SectionId::Scripts,
        SectionId::LinkedList,
        SectionId::Formats,
        SectionId::Arcs,
    ];

    fn name(self) -> &'static str {
        match self {
            SectionId::PioHw => "PIO-HW",
            SectionId::PioGraph => "PIO-GRAPH",
            SectionId::Scripts => "SCRIPTS",
            SectionId::LinkedList => "LINKED-LIST",
            SectionId::Formats => "FORMATS",
            SectionId::Arcs => "ARCS",
        }
    }
}

/// One entry of the section table.
#[derive(Debug, Clone, Copy)]
pub struct SectionEntry {
    pub addr_word: u32,
    pub byte_size: u32,
}

impl SectionEntry {
    pub fn is_inplace(&self) -> bool {
        self.addr_word & INPLACE_BIT != 0
    }

    pub fn words(&self) -> usize {
        (self.byte_size as usize + 3) / 4
    }
}

/// Where a section lives after RESET resolved it.
#[derive(Debug, Clone, Copy)]
pub(crate) enum SectionLocation {
    Empty,
    /// Word offset into the image.
    Inplace { word_off: usize, words: usize },
    /// Linear RAM address the main instance copied the payload to.
    Ram { addr: usize, words: usize },
}

impl SectionLocation {
    pub(crate) fn words(&self) -> usize {
        match *self {
            SectionLocation::Empty => 0,
            SectionLocation::Inplace { words, .. } | SectionLocation::Ram { words, .. } => words,
        }
    }
}

/// An owned, parsed graph image.
#[derive(Debug, Clone)]
pub struct GraphImage {
    words: Vec<u32>,
}

impl GraphImage {
    /// Parse an image from its raw words. Checks structural consistency but
    /// not the interpreter version; version mismatch is a RESET-time fatal
    /// error so that the caller can still inspect a foreign image.
    pub fn from_words(words: Vec<u32>) -> Result<GraphImage, Error> {
        if words.len() < HEADER_AND_TABLE_WORDS {
            return Err(Error::ImageTooSmall {
                needed: HEADER_AND_TABLE_WORDS,
                got: words.len(),
            });
        }
        let declared = field(words[0], GRAPH_SIZE_MSB, GRAPH_SIZE_LSB) as usize;
        if declared > words.len() {
            return Err(Error::ImageTooSmall {
                needed: declared,
                got: words.len(),
            });
        }
        let image = GraphImage { words };
        // Every in-image payload and INPLACE target must stay inside the
        // image.
        for id in SectionId::ALL {
            let entry = image.section(id);
            if entry.is_inplace() {
                let off = field(entry.addr_word, 28, 0) as usize;
                if off + entry.words() > image.words.len() {
                    return Err(Error::BadSection(id.name()));
                }
            }
            let (src, words) = (image.payload_offset(id), entry.words());
            if words > 0 && src + words > image.words.len() {
                return Err(Error::BadSection(id.name()));
            }
        }
        Ok(image)
    }

    /// Parse an image from little-endian bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<GraphImage, Error> {
        if bytes.len() % 4 != 0 {
            return Err(Error::ImageTooSmall {
                needed: bytes.len() / 4 + 1,
                got: bytes.len() / 4,
            });
        }
        let mut words = vec![0u32; bytes.len() / 4];
        LittleEndian::read_u32_into(bytes, &mut words);
        GraphImage::from_words(words)
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn size_words(&self) -> usize {
        field(self.words[0], GRAPH_SIZE_MSB, GRAPH_SIZE_LSB) as usize
    }

    pub fn compression(&self) -> u8 {
        field(self.words[0], COMPRESSION_MSB, COMPRESSION_LSB) as u8
    }

    pub fn version(&self) -> u32 {
        self.words[1]
    }

    pub fn check_version(&self) -> Result<(), Error> {
        if self.version() == INTERPRETER_VERSION {
            Ok(())
        } else {
            Err(Error::VersionMismatch {
                image: self.version(),
                runtime: INTERPRETER_VERSION,
            })
        }
    }

    /// UQ0.8 fraction of bank `idx` consumed by the graph (0xFF ≈ 100%).
    pub fn bank_consumption(&self, idx: usize) -> u8 {
        debug_assert!(idx < 16);
        let word = self.words[2 + idx / 4];
        (word >> (8 * (idx % 4))) as u8
    }

    pub fn section(&self, id: SectionId) -> SectionEntry {
        let base = HEADER_WORDS + 2 * id as usize;
        SectionEntry {
            addr_word: self.words[base],
            byte_size: self.words[base + 1],
        }
    }

    /// Word offset of the section's payload inside the image.
    fn payload_offset(&self, id: SectionId) -> usize {
        let mut off = HEADER_AND_TABLE_WORDS;
        for prev in &SectionId::ALL[..id as usize] {
            off += self.section(*prev).words();
        }
        off
    }

    /// Resolve one section: return the in-image location, or copy the
    /// payload to its RAM home (main instance only) and return that.
    pub(crate) fn resolve_section(
        &self,
        id: SectionId,
        banks: &BankTable,
        copy: bool,
    ) -> Result<SectionLocation, Error> {
        let entry = self.section(id);
        let words = entry.words();
        if words == 0 {
            return Ok(SectionLocation::Empty);
        }
        if entry.is_inplace() {
            return Ok(SectionLocation::Inplace {
                word_off: field(entry.addr_word, 28, 0) as usize,
                words,
            });
        }
        let addr = banks.to_linear(PackedAddr::from_word(entry.addr_word))?;
        if copy {
            let src = &self.words[self.payload_offset(id)..][..words];
            // The destination is application-owned bank RAM registered in
            // the bank table; only the main instance runs this path.
            unsafe {
                core::ptr::copy_nonoverlapping(src.as_ptr(), addr as *mut u32, words);
            }
        }
        Ok(SectionLocation::Ram { addr, words })
    }
}
