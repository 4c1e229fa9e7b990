//! The graph scheduler.
//!
//! An [`Instance`] interprets the linked list of nodes cooperatively: per
//! node it decodes the header, applies the processor/priority filter, takes
//! the collision-byte lock, checks arc readiness, prepares memory segments,
//! calls the node (bounded by [`MAX_NODE_REPEAT`]), commits the arc indices
//! and unlocks. Servant IOs are pumped at the top of every node visit.
//! Several instances on different processors may walk the same list
//! concurrently; the collision byte keeps each node single-owner.

use std::sync::atomic::Ordering;

use log::{debug, trace, warn};

use crate::bits::with_field;
use crate::error::{Error, ErrorLog};
use crate::graph::{SectionId, SECTION_COUNT};
use crate::io::{HwIoWord, IoControlWord, IoRequest, IO_CONTROL_WORDS};
use crate::node::{
    command_ext, Command, CommandWord, NodeHeader, NodeRequest, NodeStatus, XdmBuffer,
    MAX_ARCS_PER_NODE, MAX_NODE_REPEAT, MAX_SEGMENTS_PER_NODE, NODE_INDEX_NULL,
};
use crate::runtime::{DynAlloc, InstanceState, Sections, Shared};
use crate::services::Services;
use crate::sync::ResetState;

/// Scheduler control word fields (per instance, cross-instance visible).
pub(crate) mod control {
    pub const PRIORITY_MSB: u32 = 31;
    pub const PRIORITY_LSB: u32 = 30;
    pub const PROC_MSB: u32 = 29;
    pub const PROC_LSB: u32 = 27;
    pub const ARCH_MSB: u32 = 26;
    pub const ARCH_LSB: u32 = 24;
    pub const CLEAR_SWAP_BIT: u32 = 1 << 16;
    pub const RSTSTATE_MSB: u32 = 15;
    pub const RSTSTATE_LSB: u32 = 14;
    pub const INST_IDX_MSB: u32 = 13;
    pub const INST_IDX_LSB: u32 = 9;
    pub const MAIN_BIT: u32 = 1 << 8;
    pub const NODE_EXEC_BIT: u32 = 1 << 7;
    pub const END_LIST_BIT: u32 = 1 << 6;
    pub const STILL_DATA_BIT: u32 = 1 << 5;
    pub const BOOT_WARM_BIT: u32 = 1 << 4;
    pub const RETURN_MSB: u32 = 1;
    pub const RETURN_LSB: u32 = 0;
}

/// Slots of the memory array synthesized for a node RESET: segment
/// addresses, then the optional key words, then the per-arc formats.
const RESET_MEMORY_SLOTS: usize =
    MAX_SEGMENTS_PER_NODE + 4 + crate::format::FORMAT_WORDS * MAX_ARCS_PER_NODE;

/// When control returns from [`Instance::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ReturnOption {
    /// Return after each attempted node.
    EndEachNode = 1,
    /// Return once the whole list was parsed.
    #[default]
    EndAllParsed = 2,
    /// Keep parsing until no node moved data during a full pass.
    EndWhenStarving = 3,
}

/// Identity and policy of one scheduler instance.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Registry slot, also matched against IO affinity. `0..4`.
    pub instance_index: u8,
    /// Architecture id; the commander architecture is 1, so this is never
    /// zero.
    pub arch_id: u8,
    /// Processor index within the architecture; 0 means "commander".
    pub proc_id: u8,
    /// RTOS priority lane of this instance on its processor.
    pub priority: u8,
    /// The main instance copies graph sections into RAM at RESET.
    pub main_instance: bool,
    /// Warm boot restores retained memory instead of clearing it.
    pub warm_boot: bool,
    pub return_option: ReturnOption,
}

impl SchedulerConfig {
    /// The main instance on the commander processor.
    pub fn main() -> SchedulerConfig {
        SchedulerConfig {
            instance_index: 0,
            arch_id: 1,
            proc_id: 0,
            priority: 0,
            main_instance: true,
            warm_boot: false,
            return_option: ReturnOption::default(),
        }
    }

    /// A secondary instance in registry slot `instance_index`.
    pub fn secondary(instance_index: u8) -> SchedulerConfig {
        SchedulerConfig {
            instance_index,
            main_instance: false,
            ..SchedulerConfig::main()
        }
    }

    /// The signature byte written into collision bytes: priority,
    /// processor and architecture ids packed together.
    pub fn whoami(&self) -> u8 {
        (self.priority << 6) | ((self.proc_id & 0b111) << 3) | (self.arch_id & 0b111)
    }

    pub(crate) fn control_word(&self) -> u32 {
        let mut w = 0;
        w = with_field(w, control::PRIORITY_MSB, control::PRIORITY_LSB, self.priority as u32);
        w = with_field(w, control::PROC_MSB, control::PROC_LSB, self.proc_id as u32);
        w = with_field(w, control::ARCH_MSB, control::ARCH_LSB, self.arch_id as u32);
        w = with_field(
            w,
            control::INST_IDX_MSB,
            control::INST_IDX_LSB,
            self.instance_index as u32,
        );
        if self.main_instance {
            w |= control::MAIN_BIT;
        }
        if self.warm_boot {
            w |= control::BOOT_WARM_BIT;
        }
        w = with_field(
            w,
            control::RETURN_MSB,
            control::RETURN_LSB,
            self.return_option as u32,
        );
        w
    }
}

/// Debug-script hook phases around node execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScriptPhase {
    Pre,
    Post,
}

/// Placeholder for the bytecode script engine: the hook sites and id
/// plumbing are wired, execution is not part of the core.
fn script_hook(script: u16, phase: ScriptPhase) {
    if script != 0 {
        trace!("script {script} hook at {phase:?} (bytecode engine not attached)");
    }
}

/// One scheduler instance. Owned by the thread that drives it; the
/// cross-instance-visible portion lives in the runtime registry.
pub struct Instance {
    shared: std::sync::Arc<Shared>,
    slot: usize,
    config: SchedulerConfig,
    /// Word position in the linked list where the next visit resumes.
    link_position: u32,
}

impl Instance {
    pub(crate) fn new(
        shared: std::sync::Arc<Shared>,
        slot: usize,
        config: SchedulerConfig,
    ) -> Instance {
        Instance {
            shared,
            slot,
            config,
            link_position: 0,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn state(&self) -> &InstanceState {
        &self.shared.instances[self.slot]
    }

    fn set_flag(&self, bit: u32) {
        self.state().update_control(|w| w | bit);
    }

    fn clear_flag(&self, bit: u32) {
        self.state().update_control(|w| w & !bit);
    }

    fn flag(&self, bit: u32) -> bool {
        self.state().control.load(Ordering::Acquire) & bit != 0
    }

    /// The interpreter entry point: RESET, RUN, SET_PARAMETER (with the
    /// node position as argument) or STOP.
    pub fn interpret(&mut self, command: Command, arg: u32) -> Result<(), Error> {
        match command {
            Command::Reset => self.reset(),
            Command::Run => self.run(),
            Command::SetParameter => self.set_parameter(arg),
            Command::Stop => self.stop(),
            _ => Ok(()),
        }
    }

    // ---------------------------------------------------------------------
    // RESET

    /// Initialize this instance: resolve (and, on the main instance, copy)
    /// the graph sections, bring up the IOs owned by this instance, then
    /// walk the list resetting every node not already reset by a sibling.
    pub fn reset(&mut self) -> Result<(), Error> {
        let state = self.state();
        state.errors.store(0, Ordering::Release);
        state.ongoing.store(0, Ordering::Release);
        state.set_reset_state(ResetState::Start);

        if let Err(e) = self.shared.graph.check_version() {
            state.record_error(ErrorLog::VERSION_MISMATCH);
            return Err(e);
        }
        if let Err(e) = self.resolve_sections() {
            state.record_error(ErrorLog::BAD_IMAGE);
            return Err(e);
        }
        self.init_io()?;

        self.link_position = 0;
        self.process(Command::Reset)?;
        self.link_position = 0;

        self.state().set_reset_state(ResetState::Done);
        Ok(())
    }

    fn resolve_sections(&self) -> Result<(), Error> {
        let shared = &self.shared;
        let copy = self.config.main_instance;
        let mut locations = [crate::graph::SectionLocation::Empty; SECTION_COUNT];
        for id in SectionId::ALL {
            locations[id as usize] = shared.graph.resolve_section(id, &shared.banks, copy)?;
        }
        let arcs = match locations[SectionId::Arcs as usize] {
            crate::graph::SectionLocation::Ram { addr, words } => unsafe {
                crate::arc::ArcTable::from_raw(addr, words)
            },
            // Arc descriptors are written at run time; an image-resident
            // arcs section only works for RAM-resident images, which the
            // owned image model does not expose.
            _ => return Err(Error::BadSection("ARCS")),
        };
        let hw_io_count = locations[SectionId::PioHw as usize].words();
        let graph_io_count = locations[SectionId::PioGraph as usize].words() / IO_CONTROL_WORDS;
        let _ = shared.sections.set(Sections {
            locations,
            arcs,
            hw_io_count,
            graph_io_count,
        });
        Ok(())
    }

    /// Bring up every hardware IO whose affinity names this instance, and
    /// build the instance's IO mask.
    fn init_io(&self) -> Result<(), Error> {
        let shared = &self.shared;
        let sections = shared.sections.get().ok_or(Error::Stopped)?;
        let mut iomask = 0u64;
        for hw_idx in 0..sections.hw_io_count {
            let hw = HwIoWord(shared.sec_word(SectionId::PioHw, hw_idx));
            let Some(graph_io) = hw.graph_io() else {
                continue;
            };
            if (graph_io as usize) >= sections.graph_io_count {
                continue;
            }
            iomask |= 1u64 << graph_io;
            if hw.instance() != self.config.instance_index {
                continue;
            }
            let ctl = IoControlWord(
                shared.sec_word(SectionId::PioGraph, graph_io as usize * IO_CONTROL_WORDS),
            );
            let Some(entry) = shared.io_entry(ctl.fw_index()) else {
                continue;
            };
            let settings = shared.sec_slice(
                SectionId::PioGraph,
                graph_io as usize * IO_CONTROL_WORDS + 1,
                IO_CONTROL_WORDS - 1,
            );
            entry(IoRequest::Reset { settings });

            // The driver owns the buffer: adopt it as the arc storage.
            if ctl.buffer_allocated_by_driver() {
                let mut buffer = XdmBuffer::default();
                entry(IoRequest::SetBuffer {
                    buffer: &mut buffer,
                });
                if buffer.address != 0 {
                    sections.arcs.arc(ctl.arc_id()).rebase(
                        buffer.address,
                        buffer.size,
                        0,
                        0,
                        &shared.banks,
                    )?;
                }
            }
        }
        self.state().iomask.store(iomask, Ordering::Release);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // RUN

    /// One scheduler invocation. Returns early while siblings are still in
    /// RESET (the reset barrier), and refuses to run after a fatal error
    /// until the next RESET.
    pub fn run(&mut self) -> Result<(), Error> {
        if self.state().error_log().is_fatal() {
            return Err(Error::Stopped);
        }
        if self.state().reset_state() != ResetState::DoneSync {
            if !self.shared.try_sync_reset() {
                debug!("instance {}: siblings still in reset", self.slot);
                return Ok(());
            }
        }
        self.process(Command::Run)
    }

    /// Flag a pending parameter update to the node at `node_position`: the
    /// update itself was queued on the runtime beforehand. The node's
    /// preprocessing picks it up on the next RUN visit.
    pub fn set_parameter(&mut self, node_position: u32) -> Result<(), Error> {
        let shared = self.shared.clone();
        let sections = shared.sections.get().ok_or(Error::Stopped)?;
        let header = NodeHeader::decode(
            &|i| shared.sec_word(SectionId::LinkedList, i),
            node_position,
        );
        if let Some(header) = header {
            if let Some(arc_id) = header.collision_arc() {
                sections.arcs.arc(arc_id).set_new_param();
            }
        }
        Ok(())
    }

    /// Walk the list delivering STOP to every node, then release
    /// dynamically allocated segments.
    pub fn stop(&mut self) -> Result<(), Error> {
        self.link_position = 0;
        self.process(Command::Stop)?;
        self.link_position = 0;
        let mut dyn_segments = self.shared.dyn_segments.lock().unwrap();
        for alloc in dyn_segments.drain(..) {
            for seg in &alloc.segments[..alloc.count as usize] {
                self.shared.platform.free(*seg);
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // The list walk

    fn process(&mut self, command: Command) -> Result<(), Error> {
        let shared = self.shared.clone();
        let sections = shared.sections.get().ok_or(Error::Stopped)?;
        let list_words = shared.sec_words(SectionId::LinkedList);

        loop {
            self.clear_flag(control::STILL_DATA_BIT);
            self.clear_flag(control::END_LIST_BIT);

            loop {
                if command == Command::Run {
                    self.boundary_pump(sections)?;
                }
                let position = self.link_position;
                if position as usize >= list_words {
                    self.state().record_error(ErrorLog::BAD_IMAGE);
                    return Err(Error::BadSection("LINKED-LIST"));
                }
                let header = NodeHeader::decode(
                    &|i| shared.sec_word(SectionId::LinkedList, i),
                    position,
                );
                let Some(header) = header else {
                    // Terminal node: rewind for the next pass.
                    self.link_position = 0;
                    self.set_flag(control::END_LIST_BIT);
                    break;
                };
                if header.next_position() as usize > list_words {
                    self.state().record_error(ErrorLog::BAD_IMAGE);
                    return Err(Error::BadSection("LINKED-LIST"));
                }
                self.link_position = header.next_position();

                if header.node_index == NODE_INDEX_NULL {
                    continue;
                }
                if !self.compatible(&header) {
                    continue;
                }
                let visited = self.visit_node(sections, &header, command)?;
                if visited
                    && command == Command::Run
                    && self.config.return_option == ReturnOption::EndEachNode
                {
                    return Ok(());
                }
            }

            let starve_mode = command == Command::Run
                && self.config.return_option == ReturnOption::EndWhenStarving;
            if !(starve_mode && self.flag(control::STILL_DATA_BIT)) {
                return Ok(());
            }
        }
    }

    /// Does the node's processor/architecture/priority filter accept this
    /// instance? Zero fields match anything.
    fn compatible(&self, header: &NodeHeader) -> bool {
        (header.arch_id == 0 || header.arch_id == self.config.arch_id)
            && (header.proc_id == 0 || header.proc_id == self.config.proc_id)
            && (header.priority == 0 || header.priority == self.config.priority)
    }

    /// Lock, dispatch by command, unlock. Returns `false` when the node was
    /// skipped (locked elsewhere).
    fn visit_node(
        &self,
        sections: &Sections,
        header: &NodeHeader,
        command: Command,
    ) -> Result<bool, Error> {
        let collision = header.collision_arc().map(|id| sections.arcs.arc(id));
        if let Some(ref arc) = collision {
            if arc.lock_owner() != 0 {
                trace!(
                    "node @{}: held by {:#04x}, skipping",
                    header.position,
                    arc.lock_owner()
                );
                return Ok(false);
            }
            if !arc.try_lock(self.config.whoami()) {
                debug!("node @{}: lost the lock race", header.position);
                return Ok(false);
            }
        }

        let result = match command {
            Command::Reset => self.reset_node(sections, header),
            Command::Run => self.run_node(sections, header),
            Command::Stop => self.stop_node(sections, header),
            _ => Ok(()),
        };

        if let Some(ref arc) = collision {
            arc.unlock();
        }

        match result {
            Ok(()) => Ok(true),
            // Errors local to one node never abort the pass.
            Err(Error::MemoryAllocation { position, size }) => {
                warn!("node @{position}: allocation of {size} bytes failed");
                self.state().record_error(ErrorLog::ALLOCATION);
                Ok(true)
            }
            Err(e @ (Error::AddressOutOfRange { .. } | Error::UnknownBank(_))) => {
                warn!("node @{}: {e}", header.position);
                self.state().record_error(ErrorLog::ADDRESS_RANGE);
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    fn node_entry(&self, header: &NodeHeader) -> crate::node::NodeEntry {
        self.shared
            .nodes
            .get(header.node_index as usize)
            .copied()
            .unwrap_or(crate::node::null_node)
    }

    /// The single node invocation site. The execution flag around the call
    /// lets external inspectors detect a hung node.
    fn call_node(
        &self,
        entry: crate::node::NodeEntry,
        command: CommandWord,
        request: NodeRequest<'_>,
    ) -> NodeStatus {
        self.set_flag(control::NODE_EXEC_BIT);
        let status = entry(command, request);
        self.clear_flag(control::NODE_EXEC_BIT);
        status
    }

    fn pack_command(&self, command: Command, header: &NodeHeader) -> CommandWord {
        let preset = header
            .param_header(&|i| self.shared.sec_word(SectionId::LinkedList, i))
            .preset();
        CommandWord::new(command)
            .with_arc_count(header.arc_count)
            .with_preset(preset)
            .with_extension(if self.config.warm_boot {
                command_ext::WARM_BOOT
            } else {
                command_ext::COLD_BOOT
            })
    }

    /// Linear address of the node's instance memory (first segment).
    fn node_instance_addr(&self, header: &NodeHeader) -> Result<usize, Error> {
        if header.dyn_alloc {
            let dyn_segments = self.shared.dyn_segments.lock().unwrap();
            return dyn_segments
                .iter()
                .find(|a| a.position == header.position)
                .map(|a| a.segments[0])
                .ok_or(Error::MemoryAllocation {
                    position: header.position,
                    size: 0,
                });
        }
        let seg = header.segment(
            &|i| self.shared.sec_word(SectionId::LinkedList, i),
            0,
        );
        self.shared.banks.to_linear(seg.addr)
    }

    // ---------------------------------------------------------------------
    // Node RESET

    fn reset_node(&self, sections: &Sections, header: &NodeHeader) -> Result<(), Error> {
        let shared = &self.shared;
        let collision = header.collision_arc().map(|id| sections.arcs.arc(id));

        // A sibling instance may have reset this node already.
        if let Some(ref arc) = collision {
            if arc.reset_done() {
                return Ok(());
            }
        }

        let list = |i: usize| shared.sec_word(SectionId::LinkedList, i);
        let param_header = header.param_header(&list);
        let entry = self.node_entry(header);
        let services = Services::new(shared.platform.as_ref());

        let mut memory = [0usize; RESET_MEMORY_SLOTS];
        let segment_count = header.segment_count as usize;

        if header.dyn_alloc {
            // Sub-protocol: ask the node for its segment sizes, then turn
            // each into an allocation.
            let query = self
                .pack_command(Command::Reset, header)
                .with_extension(command_ext::DYN_MALLOC)
                .with_tag(param_header.trace_id());
            self.call_node(
                entry,
                query,
                NodeRequest::Reset {
                    memory: &mut memory,
                    services: &services,
                },
            );
            let mut alloc = DynAlloc {
                position: header.position,
                segments: [0; MAX_SEGMENTS_PER_NODE],
                count: segment_count as u8,
            };
            for i in 0..segment_count {
                let size = memory[i];
                let addr =
                    shared
                        .platform
                        .alloc(size)
                        .ok_or(Error::MemoryAllocation {
                            position: header.position,
                            size,
                        })?;
                memory[i] = addr;
                alloc.segments[i] = addr;
            }
            shared.dyn_segments.lock().unwrap().push(alloc);
        } else {
            let mut needs_swap = false;
            for i in 0..segment_count {
                let seg = header.segment(&list, i);
                memory[i] = shared.banks.to_linear(seg.addr)?;
                needs_swap |= seg.swap();
            }
            if needs_swap {
                self.set_flag(control::CLEAR_SWAP_BIT);
            } else {
                self.clear_flag(control::CLEAR_SWAP_BIT);
            }
        }

        let mut cursor = segment_count;
        if let Some(user_key) = header.user_key(&list) {
            let platform_key = shared.platform.key_pair();
            memory[cursor] = user_key[0] as usize;
            memory[cursor + 1] = user_key[1] as usize;
            memory[cursor + 2] = platform_key[0] as usize;
            memory[cursor + 3] = platform_key[1] as usize;
            cursor += 4;
        }

        // The node must not read the graph: its arc formats are copied
        // into the reset memory array.
        for (arc_id, is_tx) in header.arc_refs() {
            let arc = sections.arcs.arc(arc_id);
            let fmt = if is_tx {
                arc.producer_format()
            } else {
                arc.consumer_format()
            };
            let format = shared.format(fmt);
            for word in format.words {
                memory[cursor] = word as usize;
                cursor += 1;
            }
        }

        if !header.dyn_alloc {
            self.memory_segments(sections, header, Command::Reset, false)?;
        }
        script_hook(header.script as u16, ScriptPhase::Pre);

        let reset = self
            .pack_command(Command::Reset, header)
            .with_tag(param_header.trace_id());
        self.call_node(
            entry,
            reset,
            NodeRequest::Reset {
                memory: &mut memory,
                services: &services,
            },
        );

        script_hook(header.script as u16, ScriptPhase::Post);
        if !header.dyn_alloc {
            self.memory_segments(sections, header, Command::Reset, true)?;
        }

        if let Some(ref arc) = collision {
            arc.set_reset_done();
        }

        // Boot parameters follow immediately.
        let (payload_off, payload_len) = header.param_payload(&list);
        if payload_len > 0 {
            let params = shared.sec_slice(SectionId::LinkedList, payload_off, payload_len);
            let instance = self.node_instance_addr(header)?;
            let set = self
                .pack_command(Command::SetParameter, header)
                .with_tag(param_header.tag());
            self.call_node(entry, set, NodeRequest::SetParameter { instance, params });
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Node RUN

    fn run_node(&self, sections: &Sections, header: &NodeHeader) -> Result<(), Error> {
        let collision = header.collision_arc().map(|id| sections.arcs.arc(id));

        // Out-of-band parameter updates queued for this node?
        if let Some(ref arc) = collision {
            if arc.new_param() {
                self.apply_pending_updates(header)?;
                arc.clear_new_param();
            }
        }

        let arc_total = header.arc_count as usize;
        let mut xdm = [XdmBuffer::default(); MAX_ARCS_PER_NODE];
        if !self.arc_index_update_pre(sections, header, &mut xdm)? {
            trace!("node @{}: arcs not ready", header.position);
            return Ok(());
        }

        // The lock may have been stomped between acquisition and here.
        if let Some(ref arc) = collision {
            if !arc.still_locked(self.config.whoami()) {
                return Ok(());
            }
        }

        self.set_flag(control::STILL_DATA_BIT);
        self.memory_segments(sections, header, Command::Run, false)?;
        script_hook(header.script as u16, ScriptPhase::Pre);

        let entry = self.node_entry(header);
        let instance = self.node_instance_addr(header)?;
        let command = self.pack_command(Command::Run, header);
        let mut budget = MAX_NODE_REPEAT;
        loop {
            let status = self.call_node(
                entry,
                command,
                NodeRequest::Run {
                    instance,
                    xdm: &mut xdm[..arc_total],
                },
            );
            budget -= 1;
            if status == NodeStatus::Completed || budget == 0 {
                break;
            }
        }

        self.arc_index_update_post(sections, header, &xdm)?;
        script_hook(header.script as u16, ScriptPhase::Post);
        self.memory_segments(sections, header, Command::Run, true)?;
        Ok(())
    }

    fn apply_pending_updates(&self, header: &NodeHeader) -> Result<(), Error> {
        loop {
            let update = {
                let mut pending = self.shared.pending.lock().unwrap();
                pending.take_for(header.position)
            };
            let Some(update) = update else {
                return Ok(());
            };
            let entry = self.node_entry(header);
            let instance = self.node_instance_addr(header)?;
            let command = self
                .pack_command(Command::SetParameter, header)
                .with_tag(update.tag);
            debug!(
                "node @{}: applying parameter update, tag {}",
                header.position, update.tag
            );
            self.call_node(
                entry,
                command,
                NodeRequest::SetParameter {
                    instance,
                    params: &update.params,
                },
            );
        }
    }

    // ---------------------------------------------------------------------
    // Node STOP

    fn stop_node(&self, _sections: &Sections, header: &NodeHeader) -> Result<(), Error> {
        let entry = self.node_entry(header);
        let instance = self.node_instance_addr(header)?;
        let command = self.pack_command(Command::Stop, header);
        self.call_node(entry, command, NodeRequest::Stop { instance });
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Arc readiness and index commits

    /// Pre-phase: gather the XDM pointer/size pairs and decide readiness.
    /// All arcs must be ready, unless a high-QoS arc forces a go, in which
    /// case the not-ready arcs are presented with size 0.
    fn arc_index_update_pre(
        &self,
        sections: &Sections,
        header: &NodeHeader,
        xdm: &mut [XdmBuffer; MAX_ARCS_PER_NODE],
    ) -> Result<bool, Error> {
        let shared = &self.shared;
        let banks = &shared.banks;
        let platform = shared.platform.as_ref();
        let mut all_ready = true;
        let mut qos_override = false;
        let mut ready = [false; MAX_ARCS_PER_NODE];

        for (i, (arc_id, is_tx)) in header.arc_refs().enumerate() {
            let arc = sections.arcs.arc(arc_id);
            arc.mp_acquire(platform, banks);
            script_hook(arc.script(), ScriptPhase::Pre);
            let producer_frame = shared.frame_size(arc.producer_format());
            if is_tx {
                let (ok, free) = arc.ready_for_write(producer_frame);
                xdm[i] = XdmBuffer {
                    address: arc.write_address(banks)?,
                    size: free,
                };
                ready[i] = ok;
                qos_override |= ok && arc.high_qos();
                all_ready &= ok;
            } else {
                // A blocked producer is waiting for us to make room.
                if arc.alignment_blocked() {
                    arc.realign_to_base(producer_frame, banks)?;
                }
                let consumer_frame = shared.frame_size(arc.consumer_format());
                let (ok, available) = arc.ready_for_read(consumer_frame);
                xdm[i] = XdmBuffer {
                    address: arc.read_address(banks)?,
                    size: available,
                };
                ready[i] = ok;
                qos_override |= ok && arc.high_qos();
                all_ready &= ok;
            }
        }

        if header.arc_count == 0 {
            return Ok(true);
        }
        let go = all_ready || qos_override;
        if go && !all_ready {
            // Not-ready arcs pass through untouched.
            for (i, ok) in ready.iter().enumerate().take(header.arc_count as usize) {
                if !ok {
                    xdm[i].size = 0;
                }
            }
        }
        Ok(go)
    }

    /// Post-phase: commit what the node reported. TX sizes advance the
    /// write index, RX sizes the read index.
    fn arc_index_update_post(
        &self,
        sections: &Sections,
        header: &NodeHeader,
        xdm: &[XdmBuffer; MAX_ARCS_PER_NODE],
    ) -> Result<(), Error> {
        let shared = &self.shared;
        let banks = &shared.banks;
        let platform = shared.platform.as_ref();
        for (i, (arc_id, is_tx)) in header.arc_refs().enumerate() {
            let arc = sections.arcs.arc(arc_id);
            let producer_frame = shared.frame_size(arc.producer_format());
            if is_tx {
                arc.advance_write(xdm[i].size, producer_frame);
            } else {
                arc.advance_read(xdm[i].size, producer_frame, banks)?;
            }
            script_hook(arc.script(), ScriptPhase::Post);
            arc.mp_release(platform, banks);
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Memory segments

    /// Clear, swap and flush the node's memory segments before (`post =
    /// false`) or after (`post = true`) the node call.
    fn memory_segments(
        &self,
        sections: &Sections,
        header: &NodeHeader,
        command: Command,
        post: bool,
    ) -> Result<(), Error> {
        if header.dyn_alloc {
            return Ok(());
        }
        let shared = &self.shared;
        let list = |i: usize| shared.sec_word(SectionId::LinkedList, i);
        for i in 0..header.segment_count as usize {
            let seg = header.segment(&list, i);
            let addr = shared.banks.to_linear(seg.addr)?;
            let len = seg.size_bytes();

            if header.smp_flush {
                if post {
                    shared.platform.clean(addr, len);
                } else {
                    shared.platform.invalidate(addr, len);
                }
            }

            // The swap is symmetric: running it again after the call
            // restores both sides.
            if seg.swap() {
                let arc = sections.arcs.arc(seg.swap_arc());
                let swap_len = arc.size();
                arc.swap_with(addr as *mut u8, swap_len, &shared.banks)?;
            }

            if !post && seg.clear() {
                let wipe = seg.working() || command == Command::Reset;
                if wipe && len > 0 {
                    unsafe {
                        core::ptr::write_bytes(addr as *mut u8, 0, len);
                    }
                }
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Boundary pump

    /// For each servant graph IO owned by this instance: when the arc can
    /// take (RX) or provide (TX) a frame and no request is in flight, mark
    /// the request ongoing and ask the driver to move data. The driver's
    /// completion comes back through `Runtime::io_ack`, which clears the
    /// bit.
    fn boundary_pump(&self, sections: &Sections) -> Result<(), Error> {
        let shared = &self.shared;
        let state = self.state();
        let iomask = state.iomask.load(Ordering::Acquire);

        for graph_io in 0..sections.graph_io_count {
            let ctl = IoControlWord(
                shared.sec_word(SectionId::PioGraph, graph_io * IO_CONTROL_WORDS),
            );
            if ctl.fw_index() as usize >= sections.hw_io_count {
                continue;
            }
            let hw = HwIoWord(shared.sec_word(SectionId::PioHw, ctl.fw_index() as usize));
            if hw.instance() != self.config.instance_index {
                continue;
            }
            if iomask & (1u64 << graph_io) == 0 {
                continue;
            }
            // Commander IOs deliver on their own clock.
            if !ctl.servant() {
                continue;
            }
            if state.ongoing.load(Ordering::Acquire) & (1u64 << graph_io) != 0 {
                continue;
            }

            let arc = sections.arcs.arc(ctl.arc_id());
            let (need, address, size) = if ctl.is_tx() {
                let frame = shared.frame_size(arc.consumer_format());
                let (ok, available) = arc.ready_for_read(frame);
                (ok, arc.read_address(&shared.banks)?, available)
            } else {
                let frame = shared.frame_size(arc.producer_format());
                let (ok, free) = arc.ready_for_write(frame);
                (ok, arc.write_address(&shared.banks)?, free)
            };
            if !need || size == 0 {
                continue;
            }
            let Some(entry) = shared.io_entry(ctl.fw_index()) else {
                continue;
            };
            state.ongoing.fetch_or(1u64 << graph_io, Ordering::AcqRel);
            trace!("io pump: soliciting graph io {graph_io} for {size} bytes");
            entry(IoRequest::Run {
                buffer: XdmBuffer { address, size },
            });
        }
        Ok(())
    }
}

impl core::fmt::Debug for Instance {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Instance")
            .field("slot", &self.slot)
            .field("link_position", &self.link_position)
            .finish()
    }
}
