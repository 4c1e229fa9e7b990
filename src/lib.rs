//! An embedded dataflow runtime: a compact interpreter executing a
//! statically described graph of signal-processing nodes connected by
//! ring-buffer arcs, on bare-metal or small-RTOS targets, possibly across
//! several cooperating processors sharing one binary graph image.
//!
//! The moving parts:
//!
//! * [`GraphImage`] is the portable binary graph: header, section table,
//!   formats, IO controls, the linked list of nodes and the arc
//!   descriptors. Intra-graph references are 29-bit [`PackedAddr`] values
//!   resolved through a per-processor [`BankTable`], so the same image runs
//!   on processors with different memory maps.
//! * [`ArcTable`] / [`ArcHandle`] are single-producer single-consumer byte
//!   FIFOs with frame-granular readiness, realign-to-base instead of
//!   wrapping, high-QoS override and a per-node collision byte.
//! * [`Instance`] is one cooperative scheduler walking the node list;
//!   several instances on different processors may share one image.
//! * [`Runtime`] is the root object: registry of instances, the services
//!   the nodes consume, and the [`Runtime::io_ack`] completion path that
//!   couples device drivers to arcs.
//!
//! ## Example
//!
//! ```no_run
//! use nanograph::{GraphImage, RuntimeBuilder, SchedulerConfig, BankTable, HostPlatform};
//!
//! # fn run(image_bytes: &[u8], banks: BankTable) -> Result<(), nanograph::Error> {
//! let image = GraphImage::from_bytes(image_bytes)?;
//! let mut builder = RuntimeBuilder::new();
//! builder
//!     .banks(banks)
//!     .platform(HostPlatform::with_arena(64 * 1024));
//! let runtime = builder.build(image);
//! let mut instance = runtime.create_instance(SchedulerConfig::main())?;
//! instance.reset()?;
//! loop {
//!     instance.run()?;
//! }
//! # }
//! ```

mod arc;
mod bits;
mod dsp;
mod error;
mod format;
mod graph;
mod io;
mod node;
mod packed;
mod platform;
mod runtime;
mod scheduler;
mod services;
mod sync;

pub use arc::{
    descriptor_words, ArcFlags, ArcHandle, ArcTable, ARC_DESC_WORDS, ARC_ID_UNUSED,
    ARC_REF_ID_MASK, ARC_REF_TX,
};
pub use dsp::{
    biquad_cascade_df1_f32, biquad_cascade_df1_q15, hann_window_f32, BIQUAD_COEFFS_PER_STAGE,
    BIQUAD_STATE_PER_STAGE,
};
pub use error::{Error, ErrorLog};
pub use format::{
    Domain, FormatBuilder, Interleaving, StreamFormat, TimeStamp, FORMAT_WORDS,
};
pub use graph::{
    inplace_section_addr, GraphImage, SectionEntry, SectionId, HEADER_AND_TABLE_WORDS,
    HEADER_WORDS, INTERPRETER_VERSION, SECTION_COUNT,
};
pub use io::{
    FlowError, HwIoWord, IoControlBuilder, IoControlWord, IoEntry, IoRequest, TransferMode,
    IO_CONTROL_WORDS, NOT_CONNECTED,
};
pub use node::{
    command_ext, null_node, sentinel_word, Command, CommandWord, MemorySegment, NodeEntry,
    NodeHeader, NodeHeaderBuilder, NodeRequest, NodeStatus, ParamHeader, XdmBuffer,
    MAX_ARCS_PER_NODE, MAX_NODE_REPEAT, MAX_SEGMENTS_PER_NODE, NODE_INDEX_NULL,
    NODE_INDEX_SCRIPT, NODE_INDEX_SENTINEL,
};
pub use packed::{
    extension_shift, BankTable, PackedAddr, PackedSize, MAX_BANKS, MAX_PACK_ADDR_RANGE, NO_BANK,
};
pub use platform::{HostBank, HostPlatform, Platform};
pub use runtime::{Runtime, RuntimeBuilder, MAX_PENDING_PARAM_UPDATES};
pub use scheduler::{Instance, ReturnOption, SchedulerConfig};
pub use services::{
    dsp_command, dsp_ml, internal, math, script, service, stdlib, BiquadInstF32, BiquadInstQ15,
    ServiceArgs, ServiceCommand, ServiceGroup, Services,
};
pub use sync::{BakeryLock, ResetState, MAX_INSTANCES};
