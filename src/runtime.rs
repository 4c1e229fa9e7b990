//! The runtime root: shared state, the instance registry, and the driver
//! acknowledgement entry point.
//!
//! One [`Runtime`] owns everything the scheduler instances share: the graph
//! image, the bank table, the platform, the node and IO entry-point tables,
//! the resolved sections, the pending parameter updates and the per-instance
//! registry slots. Device drivers land their completions here via
//! [`Runtime::io_ack`], which switches to the affinity instance's state;
//! the registry replaces the process-wide instance-pointer table a bare-C
//! runtime would use.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use log::{debug, warn};

use crate::arc::ArcTable;
use crate::error::{Error, ErrorLog};
use crate::format::{StreamFormat, FORMAT_WORDS};
use crate::graph::{GraphImage, SectionId, SectionLocation, SECTION_COUNT};
use crate::io::{self, FlowError, HwIoWord, IoControlWord, IoEntry, IO_CONTROL_WORDS};
use crate::node::{null_node, NodeEntry, XdmBuffer, MAX_SEGMENTS_PER_NODE};
use crate::packed::BankTable;
use crate::platform::{HostPlatform, Platform};
use crate::scheduler::{control, Instance, SchedulerConfig};
use crate::sync::{BakeryLock, ResetState, MAX_INSTANCES};

/// Bound on queued out-of-band parameter updates.
pub const MAX_PENDING_PARAM_UPDATES: usize = 8;

/// Cross-instance visible state of one scheduler instance.
pub(crate) struct InstanceState {
    /// The packed scheduler control word (whoami, reset state, working
    /// bits).
    pub(crate) control: AtomicU32,
    /// One bit per graph IO: a driver request is in flight.
    pub(crate) ongoing: AtomicU64,
    /// Graph IOs this instance polls.
    pub(crate) iomask: AtomicU64,
    pub(crate) errors: AtomicU32,
    pub(crate) rx_overflows: AtomicU32,
    pub(crate) tx_underflows: AtomicU32,
    pub(crate) registered: AtomicBool,
}

impl InstanceState {
    fn new() -> InstanceState {
        InstanceState {
            control: AtomicU32::new(0),
            ongoing: AtomicU64::new(0),
            iomask: AtomicU64::new(0),
            errors: AtomicU32::new(0),
            rx_overflows: AtomicU32::new(0),
            tx_underflows: AtomicU32::new(0),
            registered: AtomicBool::new(false),
        }
    }

    pub(crate) fn reset_state(&self) -> ResetState {
        let w = self.control.load(Ordering::Acquire);
        ResetState::from_raw(crate::bits::field(
            w,
            control::RSTSTATE_MSB,
            control::RSTSTATE_LSB,
        ))
    }

    pub(crate) fn set_reset_state(&self, state: ResetState) {
        self.update_control(|w| {
            crate::bits::with_field(w, control::RSTSTATE_MSB, control::RSTSTATE_LSB, state as u32)
        });
    }

    pub(crate) fn update_control(&self, f: impl Fn(u32) -> u32) {
        self.control
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| Some(f(w)))
            .expect("control update cannot fail");
    }

    pub(crate) fn error_log(&self) -> ErrorLog {
        ErrorLog::from_bits_truncate(self.errors.load(Ordering::Acquire))
    }

    pub(crate) fn record_error(&self, bits: ErrorLog) {
        self.errors.fetch_or(bits.bits(), Ordering::AcqRel);
    }
}

/// One queued out-of-band parameter update.
pub(crate) struct PendingUpdate {
    pub(crate) node_position: u32,
    pub(crate) tag: u8,
    pub(crate) params: Box<[u32]>,
}

/// Fixed-capacity pending-update list. When full, the oldest un-consumed
/// entry is overwritten.
pub(crate) struct PendingParams {
    pub(crate) slots: [Option<PendingUpdate>; MAX_PENDING_PARAM_UPDATES],
    evict: usize,
}

impl PendingParams {
    fn new() -> PendingParams {
        PendingParams {
            slots: Default::default(),
            evict: 0,
        }
    }

    /// Returns `true` when an un-consumed entry had to be evicted.
    fn push(&mut self, update: PendingUpdate) -> bool {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.is_none()) {
            *slot = Some(update);
            return false;
        }
        let victim = self.evict % MAX_PENDING_PARAM_UPDATES;
        self.evict = self.evict.wrapping_add(1);
        self.slots[victim] = Some(update);
        true
    }

    /// Remove and return the first entry queued for `position`.
    pub(crate) fn take_for(&mut self, position: u32) -> Option<PendingUpdate> {
        self.slots
            .iter_mut()
            .find(|s| {
                s.as_ref()
                    .is_some_and(|u| u.node_position == position)
            })
            .and_then(Option::take)
    }
}

/// Segments handed out by the allocator for one dynamically-allocated node.
pub(crate) struct DynAlloc {
    pub(crate) position: u32,
    pub(crate) segments: [usize; MAX_SEGMENTS_PER_NODE],
    pub(crate) count: u8,
}

/// Sections resolved at RESET.
pub(crate) struct Sections {
    pub(crate) locations: [SectionLocation; SECTION_COUNT],
    pub(crate) arcs: ArcTable,
    pub(crate) hw_io_count: usize,
    pub(crate) graph_io_count: usize,
}

/// Everything the instances share.
pub(crate) struct Shared {
    pub(crate) graph: GraphImage,
    pub(crate) banks: BankTable,
    pub(crate) platform: Box<dyn Platform>,
    pub(crate) nodes: Vec<NodeEntry>,
    pub(crate) io_entries: Vec<Option<IoEntry>>,
    pub(crate) sections: OnceLock<Sections>,
    pub(crate) instances: [InstanceState; MAX_INSTANCES],
    pub(crate) pending: Mutex<PendingParams>,
    pub(crate) dyn_segments: Mutex<Vec<DynAlloc>>,
    pub(crate) bakery: BakeryLock,
}

impl Shared {
    /// Read word `idx` of a resolved section.
    pub(crate) fn sec_word(&self, id: SectionId, idx: usize) -> u32 {
        let sections = self.sections.get().expect("sections resolved at RESET");
        match sections.locations[id as usize] {
            SectionLocation::Empty => 0,
            SectionLocation::Inplace { word_off, words } => {
                assert!(idx < words);
                self.graph.words()[word_off + idx]
            }
            SectionLocation::Ram { addr, words } => {
                assert!(idx < words);
                unsafe { core::ptr::read_volatile((addr as *const u32).add(idx)) }
            }
        }
    }

    /// Borrow `len` words of a resolved section.
    pub(crate) fn sec_slice(&self, id: SectionId, word_off: usize, len: usize) -> &[u32] {
        let sections = self.sections.get().expect("sections resolved at RESET");
        match sections.locations[id as usize] {
            SectionLocation::Empty => &[],
            SectionLocation::Inplace { word_off: off, words } => {
                assert!(word_off + len <= words);
                &self.graph.words()[off + word_off..off + word_off + len]
            }
            SectionLocation::Ram { addr, words } => {
                assert!(word_off + len <= words);
                // Bank RAM outlives the runtime per the bank-table contract.
                unsafe {
                    core::slice::from_raw_parts((addr as *const u32).add(word_off), len)
                }
            }
        }
    }

    pub(crate) fn sec_words(&self, id: SectionId) -> usize {
        self.sections
            .get()
            .map(|s| s.locations[id as usize].words())
            .unwrap_or(0)
    }

    pub(crate) fn format(&self, idx: u8) -> StreamFormat {
        let base = idx as usize * FORMAT_WORDS;
        let mut words = [0u32; FORMAT_WORDS];
        for (i, w) in words.iter_mut().enumerate() {
            *w = self.sec_word(SectionId::Formats, base + i);
        }
        StreamFormat::from_words(words)
    }

    /// Frame size of format `idx` in bytes.
    pub(crate) fn frame_size(&self, idx: u8) -> usize {
        self.format(idx).frame_size()
    }

    pub(crate) fn io_entry(&self, fw_index: u16) -> Option<IoEntry> {
        self.io_entries.get(fw_index as usize).copied().flatten()
    }

    /// Promote every registered instance to DONE_SYNC once all of them
    /// reached DONE. Returns `true` when the barrier is open.
    pub(crate) fn try_sync_reset(&self) -> bool {
        let mut any = false;
        for state in &self.instances {
            if !state.registered.load(Ordering::Acquire) {
                continue;
            }
            any = true;
            if state.reset_state() < ResetState::Done {
                return false;
            }
        }
        if !any {
            return false;
        }
        for state in &self.instances {
            if state.registered.load(Ordering::Acquire) {
                state.set_reset_state(ResetState::DoneSync);
            }
        }
        true
    }
}

/// Builds a [`Runtime`]: the tables that cannot change once instances
/// exist, married to a graph image at [`RuntimeBuilder::build`] time.
pub struct RuntimeBuilder {
    banks: BankTable,
    platform: Option<Box<dyn Platform>>,
    nodes: Vec<NodeEntry>,
    io_entries: Vec<Option<IoEntry>>,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        RuntimeBuilder::new()
    }
}

impl RuntimeBuilder {
    pub fn new() -> RuntimeBuilder {
        RuntimeBuilder {
            banks: BankTable::new(),
            platform: None,
            // Index 0 is the null task, index 1 is reserved for the
            // bytecode script node.
            nodes: vec![null_node, null_node],
            io_entries: Vec::new(),
        }
    }

    /// Install the per-processor memory bank table.
    pub fn banks(&mut self, banks: BankTable) -> &mut Self {
        self.banks = banks;
        self
    }

    pub fn platform(&mut self, platform: impl Platform + 'static) -> &mut Self {
        self.platform = Some(Box::new(platform));
        self
    }

    /// Append a node entry point; returns its index in the entry-point
    /// table (application nodes start at 2).
    pub fn node(&mut self, entry: NodeEntry) -> u16 {
        self.nodes.push(entry);
        (self.nodes.len() - 1) as u16
    }

    /// Install the driver for firmware IO index `fw_index`.
    pub fn io(&mut self, fw_index: u16, entry: IoEntry) -> &mut Self {
        if self.io_entries.len() <= fw_index as usize {
            self.io_entries.resize(fw_index as usize + 1, None);
        }
        self.io_entries[fw_index as usize] = Some(entry);
        self
    }

    pub fn build(self, graph: GraphImage) -> Runtime {
        Runtime {
            shared: std::sync::Arc::new(Shared {
                graph,
                banks: self.banks,
                platform: self
                    .platform
                    .unwrap_or_else(|| Box::new(HostPlatform::with_arena(0))),
                nodes: self.nodes,
                io_entries: self.io_entries,
                sections: OnceLock::new(),
                instances: [
                    InstanceState::new(),
                    InstanceState::new(),
                    InstanceState::new(),
                    InstanceState::new(),
                ],
                pending: Mutex::new(PendingParams::new()),
                dyn_segments: Mutex::new(Vec::new()),
                bakery: BakeryLock::new(),
            }),
        }
    }
}

/// The runtime root object.
pub struct Runtime {
    shared: std::sync::Arc<Shared>,
}

impl Runtime {
    /// Create the scheduler instance with the given identity. At most one
    /// instance per index; indices are bounded by
    /// [`MAX_INSTANCES`](crate::sync::MAX_INSTANCES).
    pub fn create_instance(&self, config: SchedulerConfig) -> Result<Instance, Error> {
        let slot = config.instance_index as usize;
        if slot >= MAX_INSTANCES {
            return Err(Error::TooManyInstances(MAX_INSTANCES));
        }
        let state = &self.shared.instances[slot];
        if state.registered.swap(true, Ordering::AcqRel) {
            return Err(Error::TooManyInstances(MAX_INSTANCES));
        }
        assert!(
            config.whoami() != 0,
            "instance identity must be non-zero (architecture ids start at 1)"
        );
        state.control.store(config.control_word(), Ordering::Release);
        Ok(Instance::new(self.shared.clone(), slot, config))
    }

    /// Queue an out-of-band parameter update for the node at
    /// `node_position`, then notify the scheduler with
    /// [`Instance::set_parameter`].
    pub fn push_parameter_update(&self, node_position: u32, tag: u8, params: &[u32]) {
        let evicted = self.shared.pending.lock().unwrap().push(PendingUpdate {
            node_position,
            tag,
            params: params.into(),
        });
        if evicted {
            warn!("pending parameter list full, evicted the oldest entry");
            for state in &self.shared.instances {
                if state.registered.load(Ordering::Acquire) {
                    state.record_error(ErrorLog::PARAM_LIST_FULL);
                }
            }
        }
    }

    /// Driver acknowledgement entry point, callable from completion
    /// context: land `data` in the arc wired to hardware IO `hw_io`.
    ///
    /// Returns the bytes moved; overflow and underflow drop the transfer,
    /// count an error against the affinity instance, and return `Ok(0)`.
    pub fn io_ack(&self, hw_io: u8, data: XdmBuffer) -> Result<usize, Error> {
        let shared = &self.shared;
        let sections = shared.sections.get().ok_or(Error::Stopped)?;
        if hw_io as usize >= sections.hw_io_count {
            return Err(Error::IoNotConnected(hw_io));
        }
        let hw = HwIoWord(shared.sec_word(SectionId::PioHw, hw_io as usize));
        let graph_io = hw.graph_io().ok_or(Error::IoNotConnected(hw_io))? as usize;
        if graph_io >= sections.graph_io_count {
            return Err(Error::IoNotConnected(hw_io));
        }
        // Switch to the affinity instance's state.
        let state = &shared.instances[hw.instance() as usize % MAX_INSTANCES];
        let ctl = IoControlWord(shared.sec_word(SectionId::PioGraph, graph_io * IO_CONTROL_WORDS));

        let arc = sections.arcs.arc(ctl.arc_id());
        let producer_frame = shared.frame_size(arc.producer_format());
        let consumer_frame = shared.frame_size(arc.consumer_format());

        let outcome = io::acknowledge(
            &arc,
            ctl.is_tx(),
            ctl.mode(),
            data,
            producer_frame,
            consumer_frame,
            &shared.banks,
            shared.platform.as_ref(),
        );

        // Flow accounting settles before the in-flight bit is released;
        // a re-armed pump must observe the recorded error.
        match outcome.flow_error {
            Some(FlowError::Overflow) => {
                state.record_error(ErrorLog::RX_OVERFLOW);
                state.rx_overflows.fetch_add(1, Ordering::AcqRel);
            }
            Some(FlowError::Underflow) => {
                state.record_error(ErrorLog::TX_UNDERFLOW);
                state.tx_underflows.fetch_add(1, Ordering::AcqRel);
            }
            None => {}
        }
        if outcome.clear_ongoing {
            state
                .ongoing
                .fetch_and(!(1u64 << graph_io), Ordering::AcqRel);
            debug!("io {hw_io}: request complete, ongoing bit cleared");
        }
        Ok(outcome.transferred)
    }

    /// Sticky error bits of one instance.
    pub fn error_log(&self, instance_index: u8) -> ErrorLog {
        self.shared.instances[instance_index as usize % MAX_INSTANCES].error_log()
    }

    /// `(rx_overflows, tx_underflows)` counted for one instance.
    pub fn flow_error_counts(&self, instance_index: u8) -> (u32, u32) {
        let state = &self.shared.instances[instance_index as usize % MAX_INSTANCES];
        (
            state.rx_overflows.load(Ordering::Acquire),
            state.tx_underflows.load(Ordering::Acquire),
        )
    }

    /// `true` while a node invocation is in progress on the instance; an
    /// external inspector polling this can detect hung nodes.
    pub fn node_executing(&self, instance_index: u8) -> bool {
        let state = &self.shared.instances[instance_index as usize % MAX_INSTANCES];
        state.control.load(Ordering::Acquire) & control::NODE_EXEC_BIT != 0
    }

    /// The shared bakery mutex for platforms that need a stronger lock
    /// than the collision byte.
    pub fn bakery(&self) -> &BakeryLock {
        &self.shared.bakery
    }

    /// The resolved arc table, available once some instance completed
    /// RESET. Intended for inspectors and tests.
    pub fn arc_table(&self) -> Option<ArcTable> {
        self.shared.sections.get().map(|s| s.arcs)
    }
}
