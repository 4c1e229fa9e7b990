//! Graph IO control words, the driver contract, and the acknowledgement
//! data path.
//!
//! Two tables describe the boundary of the graph. `pio_hw` has one word per
//! hardware IO and translates it to a graph IO (or "not connected") plus
//! the scheduler instance with affinity for it. `pio_graph` has four words
//! per graph IO: a control word for the scheduler and three domain-specific
//! settings words handed to the driver at RESET.
//!
//! Drivers come in two flavors. A *commander* pushes data on its own clock
//! and the scheduler never solicits it; a *servant* only moves data when
//! the boundary pump asks. Either way, completion flows back through the
//! runtime's acknowledgement entry point, which lands bytes in the arc (or
//! rebases the arc onto a driver-owned buffer) and decides whether the
//! "request in flight" bit can be cleared.

use log::warn;

use crate::arc::ArcHandle;
use crate::bits::field;
use crate::node::XdmBuffer;
use crate::packed::BankTable;
use crate::platform::Platform;

/// Words per `pio_graph` record.
pub const IO_CONTROL_WORDS: usize = 4;

/// Value of the graph-IO index field meaning "this hardware IO is unused by
/// the graph".
pub const NOT_CONNECTED: u16 = 0xFFFF;

// pio_hw word fields
const HW_INSTANCE_MSB: u32 = 20;
const HW_INSTANCE_LSB: u32 = 16;
const HW_GRAPH_IDX_MSB: u32 = 15;
const HW_GRAPH_IDX_LSB: u32 = 0;

// pio_graph word 0 fields
const FW_IDX_MSB: u32 = 31;
const FW_IDX_LSB: u32 = 16;
const BUFFER_ALLOC_BIT: u32 = 1 << 15;
const SET_CALLBACK_BIT: u32 = 1 << 14;
const COPY_BIT: u32 = 1 << 13;
const SERVANT_BIT: u32 = 1 << 12;
const TX_BIT: u32 = 1 << 11;
const ARC_ID_MSB: u32 = 5;
const ARC_ID_LSB: u32 = 0;

/// One word of the hardware→graph translation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwIoWord(pub u32);

impl HwIoWord {
    pub fn new(graph_io: u16, instance: u8) -> HwIoWord {
        let mut w = 0;
        w = crate::bits::with_field(w, HW_INSTANCE_MSB, HW_INSTANCE_LSB, instance as u32);
        w = crate::bits::with_field(w, HW_GRAPH_IDX_MSB, HW_GRAPH_IDX_LSB, graph_io as u32);
        HwIoWord(w)
    }

    pub fn not_connected() -> HwIoWord {
        HwIoWord::new(NOT_CONNECTED, 0)
    }

    /// Index into `pio_graph`, or `None` when unconnected.
    pub fn graph_io(self) -> Option<u16> {
        let idx = field(self.0, HW_GRAPH_IDX_MSB, HW_GRAPH_IDX_LSB) as u16;
        (idx != NOT_CONNECTED).then_some(idx)
    }

    /// Instance allowed to initialize and pump this IO.
    pub fn instance(self) -> u8 {
        field(self.0, HW_INSTANCE_MSB, HW_INSTANCE_LSB) as u8
    }
}

/// How driver completions move bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// The driver buffer is copied into / out of the arc buffer.
    Copy,
    /// The arc is rebased onto the driver-owned buffer, no copy.
    SetBuffer,
}

/// The scheduler-facing control word of one graph IO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoControlWord(pub u32);

impl IoControlWord {
    pub fn fw_index(self) -> u16 {
        field(self.0, FW_IDX_MSB, FW_IDX_LSB) as u16
    }

    /// The driver owns the buffer and the arc must be rebased onto it at
    /// RESET.
    pub fn buffer_allocated_by_driver(self) -> bool {
        self.0 & BUFFER_ALLOC_BIT != 0
    }

    pub fn settings_are_callback(self) -> bool {
        self.0 & SET_CALLBACK_BIT != 0
    }

    pub fn mode(self) -> TransferMode {
        if self.0 & COPY_BIT != 0 {
            TransferMode::Copy
        } else {
            TransferMode::SetBuffer
        }
    }

    /// `true` for servant IOs the boundary pump must solicit; commander IOs
    /// deliver unsolicited.
    pub fn servant(self) -> bool {
        self.0 & SERVANT_BIT != 0
    }

    /// `true` when the stream leaves the graph (TX).
    pub fn is_tx(self) -> bool {
        self.0 & TX_BIT != 0
    }

    pub fn arc_id(self) -> u16 {
        field(self.0, ARC_ID_MSB, ARC_ID_LSB) as u16
    }
}

/// Builder for an `IoControlWord` (host tooling and tests).
#[derive(Debug, Clone, Copy, Default)]
pub struct IoControlBuilder {
    fw_index: u16,
    arc_id: u16,
    tx: bool,
    servant: bool,
    copy: bool,
    buffer_alloc: bool,
}

impl IoControlBuilder {
    pub fn new(fw_index: u16, arc_id: u16) -> IoControlBuilder {
        IoControlBuilder {
            fw_index,
            arc_id,
            copy: true,
            ..Default::default()
        }
    }

    pub fn tx(mut self, tx: bool) -> Self {
        self.tx = tx;
        self
    }

    pub fn servant(mut self, servant: bool) -> Self {
        self.servant = servant;
        self
    }

    pub fn mode(mut self, mode: TransferMode) -> Self {
        self.copy = mode == TransferMode::Copy;
        self
    }

    pub fn buffer_allocated_by_driver(mut self, on: bool) -> Self {
        self.buffer_alloc = on;
        self
    }

    pub fn build(self) -> IoControlWord {
        let mut w = 0;
        w = crate::bits::with_field(w, FW_IDX_MSB, FW_IDX_LSB, self.fw_index as u32);
        w = crate::bits::with_field(w, ARC_ID_MSB, ARC_ID_LSB, self.arc_id as u32);
        if self.tx {
            w |= TX_BIT;
        }
        if self.servant {
            w |= SERVANT_BIT;
        }
        if self.copy {
            w |= COPY_BIT;
        }
        if self.buffer_alloc {
            w |= BUFFER_ALLOC_BIT;
        }
        IoControlWord(w)
    }
}

/// Requests honored by an IO driver entry point.
pub enum IoRequest<'a> {
    /// Initialize the peripheral with the IO's settings words.
    Reset { settings: &'a [u32] },
    /// Re-configure a running peripheral.
    SetParameter { settings: &'a [u32] },
    /// Read the active configuration back into caller memory.
    ReadParameter { settings: &'a mut [u32] },
    /// The driver reports the buffer it owns; the arc is rebased onto it.
    SetBuffer { buffer: &'a mut XdmBuffer },
    /// Boundary pump: move up to `buffer.size` bytes at `buffer.address`
    /// (into the graph for RX, out of it for TX), then report completion
    /// through the runtime's acknowledgement entry point.
    Run { buffer: XdmBuffer },
    Stop,
}

/// An IO driver. One function per hardware IO, indexed by the firmware IO
/// index of the control word.
pub type IoEntry = fn(IoRequest<'_>);

/// A dropped transfer, recovered by retrying on the driver's next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowError {
    /// RX copy larger than the arc's free space.
    Overflow,
    /// TX request larger than the arc's pending data.
    Underflow,
}

/// What [`acknowledge`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AckOutcome {
    /// Bytes actually moved (zero on a flow error).
    pub(crate) transferred: usize,
    /// The graph IO's "request in flight" bit may be cleared.
    pub(crate) clear_ongoing: bool,
    pub(crate) flow_error: Option<FlowError>,
}

/// Core of the driver acknowledgement path: move `data` into or out of
/// `arc` according to the IO's direction and transfer mode.
///
/// `data.address` is the driver-side buffer (for [`TransferMode::Copy`]) or
/// the buffer ownership handed to the graph (for
/// [`TransferMode::SetBuffer`]); `data.size` is the byte count.
pub(crate) fn acknowledge(
    arc: &ArcHandle<'_>,
    is_tx: bool,
    mode: TransferMode,
    data: XdmBuffer,
    producer_frame: usize,
    consumer_frame: usize,
    banks: &BankTable,
    platform: &dyn Platform,
) -> AckOutcome {
    arc.mp_acquire(platform, banks);
    let mut outcome = AckOutcome {
        transferred: 0,
        clear_ongoing: false,
        flow_error: None,
    };

    if !is_tx {
        // RX: bytes travel into the graph.
        match mode {
            TransferMode::Copy => {
                if arc.free_space() < data.size {
                    warn!(
                        "rx overflow: {} bytes offered, {} free",
                        data.size,
                        arc.free_space()
                    );
                    outcome.flow_error = Some(FlowError::Overflow);
                } else {
                    match arc.write_address(banks) {
                        Ok(dst) => {
                            unsafe {
                                core::ptr::copy_nonoverlapping(
                                    data.address as *const u8,
                                    dst as *mut u8,
                                    data.size,
                                );
                            }
                            arc.advance_write(data.size, producer_frame);
                            outcome.transferred = data.size;
                        }
                        Err(e) => warn!("rx transfer dropped: {e}"),
                    }
                }
            }
            TransferMode::SetBuffer => {
                // Driver-owned, pre-filled buffer becomes the arc storage.
                match arc.rebase(data.address, data.size, 0, data.size, banks) {
                    Ok(()) => outcome.transferred = data.size,
                    Err(e) => warn!("rx set-buffer rebase failed: {e}"),
                }
            }
        }
        // Enough for the consumer to run: the request is complete.
        outcome.clear_ongoing = arc.available() >= consumer_frame;
    } else {
        // TX: bytes travel out of the graph.
        match mode {
            TransferMode::Copy => {
                if arc.available() < data.size {
                    warn!(
                        "tx underflow: {} bytes requested, {} pending",
                        data.size,
                        arc.available()
                    );
                    outcome.flow_error = Some(FlowError::Underflow);
                } else {
                    match arc.read_address(banks) {
                        Ok(src) => {
                            unsafe {
                                core::ptr::copy_nonoverlapping(
                                    src as *const u8,
                                    data.address as *mut u8,
                                    data.size,
                                );
                            }
                            let _ = arc.advance_read(data.size, producer_frame, banks);
                            outcome.transferred = data.size;
                        }
                        Err(e) => warn!("tx transfer dropped: {e}"),
                    }
                }
                // Less than one more frame to send: stop soliciting.
                outcome.clear_ongoing = arc.available() < consumer_frame;
            }
            TransferMode::SetBuffer => {
                match arc.rebase(data.address, data.size, 0, 0, banks) {
                    Ok(()) => outcome.transferred = data.size,
                    Err(e) => warn!("tx set-buffer rebase failed: {e}"),
                }
                outcome.clear_ongoing = true;
            }
        }
    }

    arc.mp_release(platform, banks);
    outcome
}
