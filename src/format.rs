//! Stream format entries.
//!
//! Each arc references two entries of the graph's format table: one for the
//! producing node and one for the consuming node. Formats are immutable at
//! run time; the frame size is the quantity the arc engine compares against
//! ring-buffer occupancy.
//!
//! A format entry is 4 words:
//!
//! * word 0: packed frame size in bytes (extension + 21-bit signed value)
//! * word 1: sub-type, domain, raw sample type, time-stamp discipline,
//!   interleaving scheme, channel count minus one
//! * word 2: sampling rate in Hz as raw IEEE-754 bits
//! * word 3: domain-specific word, opaque to the scheduler

use crate::bits::field;
use crate::packed::PackedSize;

/// Number of `u32` words per format entry.
pub const FORMAT_WORDS: usize = 4;

/// How the channels of one frame are laid out in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interleaving {
    /// Channel samples alternate inside the frame (`L R L R ...`).
    Interleaved,
    /// One pointer, channel planes follow each other.
    DeinterleavedOnePtr,
    /// Channel planes in separate buffer slices.
    DeinterleavedUnpacked,
}

/// Time-stamp discipline of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeStamp {
    None,
    Absolute,
    Relative,
    Counter,
}

/// Stream domain categories, used when inserting conversion nodes and for
/// routing domain-specific IO settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Domain {
    General = 0,
    AudioIn = 1,
    AudioOut = 2,
    Gpio = 3,
    Motion = 4,
    Image2dIn = 5,
    Image2dOut = 6,
    AnalogIn = 7,
    AnalogOut = 8,
    UserInterface = 9,
    /// Domains 10..=15, decoded by platform callbacks.
    PlatformSpecific = 10,
}

impl Domain {
    fn from_raw(raw: u8) -> Domain {
        match raw {
            0 => Domain::General,
            1 => Domain::AudioIn,
            2 => Domain::AudioOut,
            3 => Domain::Gpio,
            4 => Domain::Motion,
            5 => Domain::Image2dIn,
            6 => Domain::Image2dOut,
            7 => Domain::AnalogIn,
            8 => Domain::AnalogOut,
            9 => Domain::UserInterface,
            _ => Domain::PlatformSpecific,
        }
    }
}

/// A decoded view of one 4-word format entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamFormat {
    pub words: [u32; FORMAT_WORDS],
}

// word 1 fields
const SUBTYPE_MSB: u32 = 28;
const SUBTYPE_LSB: u32 = 22;
const DOMAIN_MSB: u32 = 21;
const DOMAIN_LSB: u32 = 18;
const RAW_MSB: u32 = 17;
const RAW_LSB: u32 = 12;
const TIMESTAMP_MSB: u32 = 9;
const TIMESTAMP_LSB: u32 = 7;
const INTERLEAVE_MSB: u32 = 6;
const INTERLEAVE_LSB: u32 = 5;
const NCHAN_M1_MSB: u32 = 4;
const NCHAN_M1_LSB: u32 = 0;

impl StreamFormat {
    pub fn from_words(words: [u32; FORMAT_WORDS]) -> StreamFormat {
        StreamFormat { words }
    }

    /// Frame size in bytes: the minimum amount a producer writes or a
    /// consumer reads per node invocation.
    pub fn frame_size(&self) -> usize {
        PackedSize::from_word(self.words[0]).to_bytes().max(0) as usize
    }

    pub fn sub_type(&self) -> u8 {
        field(self.words[1], SUBTYPE_MSB, SUBTYPE_LSB) as u8
    }

    pub fn domain(&self) -> Domain {
        Domain::from_raw(field(self.words[1], DOMAIN_MSB, DOMAIN_LSB) as u8)
    }

    /// Raw sample arithmetic type (6-bit code from the store catalog).
    pub fn raw_type(&self) -> u8 {
        field(self.words[1], RAW_MSB, RAW_LSB) as u8
    }

    pub fn time_stamp(&self) -> TimeStamp {
        match field(self.words[1], TIMESTAMP_MSB, TIMESTAMP_LSB) {
            0 => TimeStamp::None,
            1 => TimeStamp::Absolute,
            2 => TimeStamp::Relative,
            _ => TimeStamp::Counter,
        }
    }

    pub fn interleaving(&self) -> Interleaving {
        match field(self.words[1], INTERLEAVE_MSB, INTERLEAVE_LSB) {
            0 => Interleaving::Interleaved,
            1 => Interleaving::DeinterleavedOnePtr,
            _ => Interleaving::DeinterleavedUnpacked,
        }
    }

    pub fn channels(&self) -> u8 {
        field(self.words[1], NCHAN_M1_MSB, NCHAN_M1_LSB) as u8 + 1
    }

    /// Sampling rate in Hz.
    pub fn sampling_rate(&self) -> f32 {
        f32::from_bits(self.words[2])
    }

    pub fn domain_word(&self) -> u32 {
        self.words[3]
    }
}

/// Builder used by tests and host tooling to assemble format words.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatBuilder {
    frame_size: usize,
    channels: u8,
    domain: u8,
    raw_type: u8,
    sampling_rate: f32,
}

impl FormatBuilder {
    pub fn new() -> FormatBuilder {
        FormatBuilder {
            channels: 1,
            ..Default::default()
        }
    }

    pub fn frame_size(mut self, bytes: usize) -> Self {
        self.frame_size = bytes;
        self
    }

    pub fn channels(mut self, n: u8) -> Self {
        self.channels = n.max(1);
        self
    }

    pub fn domain(mut self, d: u8) -> Self {
        self.domain = d;
        self
    }

    pub fn raw_type(mut self, t: u8) -> Self {
        self.raw_type = t;
        self
    }

    pub fn sampling_rate(mut self, hz: f32) -> Self {
        self.sampling_rate = hz;
        self
    }

    pub fn build(self) -> [u32; FORMAT_WORDS] {
        use crate::bits::with_field;
        let w0 = PackedSize::from_bytes(self.frame_size)
            .expect("frame size not representable")
            .0;
        let mut w1 = 0;
        w1 = with_field(w1, DOMAIN_MSB, DOMAIN_LSB, self.domain as u32);
        w1 = with_field(w1, RAW_MSB, RAW_LSB, self.raw_type as u32);
        w1 = with_field(w1, NCHAN_M1_MSB, NCHAN_M1_LSB, self.channels.max(1) as u32 - 1);
        [w0, w1, self.sampling_rate.to_bits(), 0]
    }
}
