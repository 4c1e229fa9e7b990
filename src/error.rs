use bitflags::bitflags;
use thiserror::Error;

/// The error type used in this crate.
///
/// Only setup and codec failures surface as `Error`. Flow-control problems
/// (ring-buffer overflow / underflow on a driver transfer) are recovered
/// locally by dropping the transfer and recording a sticky bit in the
/// instance [`ErrorLog`]; they never abort a scheduler pass.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    #[error("graph image is truncated: need {needed} words, got {got}")]
    ImageTooSmall { needed: usize, got: usize },

    #[error("graph image was built for interpreter version {image:#06x}, this runtime is {runtime:#06x}")]
    VersionMismatch { image: u32, runtime: u32 },

    #[error("graph section {0} is malformed")]
    BadSection(&'static str),

    #[error("no memory bank can reach address {addr:#x} with a packed displacement")]
    AddressOutOfRange { addr: usize },

    #[error("packed word references memory bank {0}, which is not populated")]
    UnknownBank(u8),

    #[error("node at position {position} requested {size} bytes and the platform allocator refused")]
    MemoryAllocation { position: u32, size: usize },

    #[error("instance is stopped after a fatal error; issue a fresh RESET first")]
    Stopped,

    #[error("instance registry is full ({0} slots)")]
    TooManyInstances(usize),

    #[error("hardware IO {0} is not connected to the graph")]
    IoNotConnected(u8),

    #[error("service group {group} function {function} has no generic backend")]
    UnknownService { group: u8, function: u16 },
}

bitflags! {
    /// Sticky per-instance error bits.
    ///
    /// Recoverable conditions only raise a bit; fatal ones additionally put
    /// the instance in the stopped state so that further RUN calls are
    /// refused until the next RESET.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ErrorLog: u32 {
        /// Interpreter version word did not match.
        const VERSION_MISMATCH = 1 << 0;
        /// Header or section table could not be decoded.
        const BAD_IMAGE = 1 << 1;
        /// A packed address failed to resolve through the bank table.
        const ADDRESS_RANGE = 1 << 2;
        /// Dynamic segment allocation failed during a node reset.
        const ALLOCATION = 1 << 3;
        /// An RX copy was dropped because the arc had no room.
        const RX_OVERFLOW = 1 << 4;
        /// A TX copy was dropped because the arc had no data.
        const TX_UNDERFLOW = 1 << 5;
        /// The pending parameter-update list wrapped and evicted an entry.
        const PARAM_LIST_FULL = 1 << 6;
    }
}

impl ErrorLog {
    /// Bits that stop the instance.
    pub const FATAL: ErrorLog = ErrorLog::VERSION_MISMATCH.union(ErrorLog::BAD_IMAGE);

    pub fn is_fatal(self) -> bool {
        self.intersects(Self::FATAL)
    }
}
