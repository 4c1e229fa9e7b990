//! The node protocol: packed command words, XDM buffer lists, the request
//! sum type passed to node entry points, and the node header decoder.
//!
//! A node header in the linked list is variable-length, minimum 5 words:
//!
//! ```text
//! word 0   [priority 2 | proc 3 | arch 3 | .. | alloc 1 | key 1 |
//!           arcs 5 | segments-1 3 | node index 10]
//! word 1   [.. | protect 1 | smp-flush 1 | script 7]
//! arcs     ceil(N/2) words, two 12-bit arc references each
//! segments (segments) pairs { packed address, packed size + flags }
//! keys     4 optional words when the key bit is set
//! params   [tag 4 | preset 4 | trace 8 | length-in-words 16], then the
//!          boot parameters; the length counts this header word too
//! ```
//!
//! A node whose index field is all ones terminates the list.

use crate::arc::{ARC_REF_ID_MASK, ARC_REF_TX};
use crate::bits::{field, with_field};
use crate::packed::{PackedAddr, PackedSize};
use crate::services::Services;

/// Upper bound on arcs attached to one node.
pub const MAX_ARCS_PER_NODE: usize = 8;

/// Upper bound on memory segments declared by one node.
pub const MAX_SEGMENTS_PER_NODE: usize = 6;

/// A node returning "not completed" is re-entered at most this many times
/// in a single scheduler visit.
pub const MAX_NODE_REPEAT: u32 = 4;

/// Node index terminating the linked list.
pub const NODE_INDEX_SENTINEL: u16 = 0x03FF;

/// Entry-point index of the null task.
pub const NODE_INDEX_NULL: u16 = 0;

/// Entry-point index reserved for the bytecode script node.
pub const NODE_INDEX_SCRIPT: u16 = 1;

// ---------------------------------------------------------------------------
// Command word

/// Commands of the node / IO / interpreter protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Reset = 1,
    SetParameter = 2,
    ReadParameter = 3,
    Run = 4,
    Stop = 5,
    UpdateRelocatable = 6,
    SetBuffer = 7,
    ReadData = 8,
    WriteData = 9,
    Library = 10,
}

impl Command {
    pub fn from_raw(raw: u8) -> Option<Command> {
        Some(match raw {
            1 => Command::Reset,
            2 => Command::SetParameter,
            3 => Command::ReadParameter,
            4 => Command::Run,
            5 => Command::Stop,
            6 => Command::UpdateRelocatable,
            7 => Command::SetBuffer,
            8 => Command::ReadData,
            9 => Command::WriteData,
            10 => Command::Library,
            _ => return None,
        })
    }
}

/// Command extension values (2-bit field).
pub mod command_ext {
    /// RESET after power-up: clear everything.
    pub const COLD_BOOT: u8 = 0;
    /// RESET with memory banks restored from retention.
    pub const WARM_BOOT: u8 = 1;
    /// Pre-reset query: the node returns its segment sizes.
    pub const DYN_MALLOC: u8 = 2;
    /// SET_PARAMETER must complete before returning.
    pub const PARAM_WAIT: u8 = 1;
}

const NARC_MSB: u32 = 23;
const NARC_LSB: u32 = 20;
const PRESET_MSB: u32 = 19;
const PRESET_LSB: u32 = 16;
const POSITION_MSB: u32 = 31;
const POSITION_LSB: u32 = 16;
const TAG_MSB: u32 = 15;
const TAG_LSB: u32 = 8;
const EXT_MSB: u32 = 5;
const EXT_LSB: u32 = 4;
const CMD_MSB: u32 = 3;
const CMD_LSB: u32 = 0;

/// The packed 32-bit word handed to every node invocation:
/// `[position 16 / (narc 4 | preset 4) | tag 8 | .. | ext 2 | command 4]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandWord(pub u32);

impl CommandWord {
    pub fn new(command: Command) -> CommandWord {
        CommandWord(command as u32)
    }

    pub fn command(self) -> Option<Command> {
        Command::from_raw(field(self.0, CMD_MSB, CMD_LSB) as u8)
    }

    pub fn with_command(self, command: Command) -> CommandWord {
        CommandWord(with_field(self.0, CMD_MSB, CMD_LSB, command as u32))
    }

    pub fn extension(self) -> u8 {
        field(self.0, EXT_MSB, EXT_LSB) as u8
    }

    pub fn with_extension(self, ext: u8) -> CommandWord {
        CommandWord(with_field(self.0, EXT_MSB, EXT_LSB, ext as u32))
    }

    pub fn tag(self) -> u8 {
        field(self.0, TAG_MSB, TAG_LSB) as u8
    }

    pub fn with_tag(self, tag: u8) -> CommandWord {
        CommandWord(with_field(self.0, TAG_MSB, TAG_LSB, tag as u32))
    }

    pub fn preset(self) -> u8 {
        field(self.0, PRESET_MSB, PRESET_LSB) as u8
    }

    pub fn with_preset(self, preset: u8) -> CommandWord {
        CommandWord(with_field(self.0, PRESET_MSB, PRESET_LSB, preset as u32))
    }

    pub fn arc_count(self) -> u8 {
        field(self.0, NARC_MSB, NARC_LSB) as u8
    }

    pub fn with_arc_count(self, narc: u8) -> CommandWord {
        CommandWord(with_field(self.0, NARC_MSB, NARC_LSB, narc as u32))
    }

    /// Node position, sharing the bits of `narc`/`preset`; used by scripted
    /// out-of-band parameter updates.
    pub fn position(self) -> u16 {
        field(self.0, POSITION_MSB, POSITION_LSB) as u16
    }

    pub fn with_position(self, position: u16) -> CommandWord {
        CommandWord(with_field(self.0, POSITION_MSB, POSITION_LSB, position as u32))
    }
}

// ---------------------------------------------------------------------------
// Node entry contract

/// One entry of the pointer/size list exchanged with a running node.
///
/// On entry, RX arcs carry `{read address, bytes available}` and TX arcs
/// `{write address, bytes free}`. The node overwrites `size` with the bytes
/// it consumed (RX) or produced (TX).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct XdmBuffer {
    pub address: usize,
    pub size: usize,
}

/// Outcome of a node invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Completed,
    /// The node split its work; call it again this visit (bounded by
    /// [`MAX_NODE_REPEAT`]).
    NeedsAnotherCall,
}

/// The data argument of a node invocation, discriminated by command.
pub enum NodeRequest<'a> {
    /// RESET. `memory` starts with one linear address per memory segment
    /// (or, with the DYN_MALLOC extension, is where the node must deposit
    /// its segment *sizes*), followed by the key words when the node is
    /// keyed, followed by the 4-word stream format of each arc.
    Reset {
        memory: &'a mut [usize],
        services: &'a Services<'a>,
    },
    /// SET_PARAMETER. `params` starts at the first parameter word; the
    /// command tag selects which parameter, 15 meaning "all".
    SetParameter { instance: usize, params: &'a [u32] },
    /// READ_PARAMETER back into caller memory.
    ReadParameter { instance: usize, destination: usize },
    /// RUN over one XDM pair per arc.
    Run {
        instance: usize,
        xdm: &'a mut [XdmBuffer],
    },
    /// STOP: release everything, including dynamically allocated segments.
    Stop { instance: usize },
    /// Remaining commands (UPDATE_RELOCATABLE, READ_DATA, WRITE_DATA,
    /// LIBRARY); the payload meaning is owned by the node.
    Other { instance: usize, data: usize },
}

/// A node implementation. Index 0 of the entry-point table is the null task;
/// index 1 is reserved for the bytecode script node.
pub type NodeEntry = fn(CommandWord, NodeRequest<'_>) -> NodeStatus;

/// The null task: accepts every command and does nothing.
pub fn null_node(_command: CommandWord, _request: NodeRequest<'_>) -> NodeStatus {
    NodeStatus::Completed
}

// ---------------------------------------------------------------------------
// Node header decoding

const PRIORITY_MSB: u32 = 31;
const PRIORITY_LSB: u32 = 30;
const PROC_MSB: u32 = 29;
const PROC_LSB: u32 = 27;
const ARCH_MSB: u32 = 26;
const ARCH_LSB: u32 = 24;
const ALLOC_BIT: u32 = 1 << 19;
const KEY_BIT: u32 = 1 << 18;
const NBARC_MSB: u32 = 17;
const NBARC_LSB: u32 = 13;
const NSEG_M1_MSB: u32 = 12;
const NSEG_M1_LSB: u32 = 10;
const NODE_IDX_MSB: u32 = 9;
const NODE_IDX_LSB: u32 = 0;

const PROTECT_BIT: u32 = 1 << 8;
const SMP_FLUSH_BIT: u32 = 1 << 7;
const SCRIPT_MSB: u32 = 6;
const SCRIPT_LSB: u32 = 0;

const PARAM_TAG_MSB: u32 = 31;
const PARAM_TAG_LSB: u32 = 28;
const PARAM_PRESET_MSB: u32 = 27;
const PARAM_PRESET_LSB: u32 = 24;
const PARAM_TRACE_MSB: u32 = 23;
const PARAM_TRACE_LSB: u32 = 16;
const PARAM_LEN_MSB: u32 = 15;
const PARAM_LEN_LSB: u32 = 0;

// Memory segment size-word flags.
const SEG_SWAP_BIT: u32 = 1 << 31;
const SEG_WORK_BIT: u32 = 1 << 30;
const SEG_CLEAR_BIT: u32 = 1 << 29;

/// One memory segment declaration of a node.
#[derive(Debug, Clone, Copy)]
pub struct MemorySegment {
    pub addr: PackedAddr,
    size_word: u32,
}

impl MemorySegment {
    pub fn from_words(addr_word: u32, size_word: u32) -> MemorySegment {
        MemorySegment {
            addr: PackedAddr::from_word(addr_word),
            size_word,
        }
    }

    /// Exchange the segment with an arc buffer around the node call.
    pub fn swap(&self) -> bool {
        self.size_word & SEG_SWAP_BIT != 0
    }

    /// Scratch memory, cleared before every call.
    pub fn working(&self) -> bool {
        self.size_word & SEG_WORK_BIT != 0
    }

    /// Static memory cleared once at RESET (or scratch, always cleared).
    pub fn clear(&self) -> bool {
        self.size_word & SEG_CLEAR_BIT != 0
    }

    pub fn size_bytes(&self) -> usize {
        PackedSize::from_word(self.size_word).to_bytes().max(0) as usize
    }

    /// Arc whose buffer this segment is swapped with (valid when
    /// [`MemorySegment::swap`] is set).
    pub fn swap_arc(&self) -> u16 {
        (self.size_word as u16) & (ARC_REF_TX | ARC_REF_ID_MASK)
    }
}

/// A decoded node header. Offsets are in words, relative to the node's
/// first word in the linked list.
#[derive(Debug, Clone)]
pub struct NodeHeader {
    pub position: u32,
    pub node_index: u16,
    pub arcs: [u16; MAX_ARCS_PER_NODE],
    pub arc_count: u8,
    pub segment_count: u8,
    pub keyed: bool,
    pub dyn_alloc: bool,
    pub smp_flush: bool,
    pub memory_protect: bool,
    pub script: u8,
    pub priority: u8,
    pub proc_id: u8,
    pub arch_id: u8,
    segments_offset: usize,
    key_offset: Option<usize>,
    params_offset: usize,
    next_offset: usize,
}

impl NodeHeader {
    /// Decode the header starting at `list[position]`. Returns `None` for
    /// the terminal sentinel.
    pub fn decode(list: &impl Fn(usize) -> u32, position: u32) -> Option<NodeHeader> {
        let base = position as usize;
        let w0 = list(base);
        let node_index = field(w0, NODE_IDX_MSB, NODE_IDX_LSB) as u16;
        if node_index == NODE_INDEX_SENTINEL {
            return None;
        }
        let w1 = list(base + 1);
        let arc_count = (field(w0, NBARC_MSB, NBARC_LSB) as usize).min(MAX_ARCS_PER_NODE);
        let segment_count =
            (field(w0, NSEG_M1_MSB, NSEG_M1_LSB) as usize + 1).min(MAX_SEGMENTS_PER_NODE) as u8;
        let keyed = w0 & KEY_BIT != 0;

        let mut arcs = [0u16; MAX_ARCS_PER_NODE];
        for (i, slot) in arcs.iter_mut().enumerate().take(arc_count) {
            let word = list(base + 2 + i / 2);
            *slot = if i % 2 == 0 {
                (word & 0x0FFF) as u16
            } else {
                ((word >> 16) & 0x0FFF) as u16
            };
        }

        let segments_offset = 2 + arc_count.div_ceil(2);
        let mut params_offset = segments_offset + 2 * segment_count as usize;
        let key_offset = keyed.then_some(params_offset);
        if keyed {
            params_offset += 4;
        }
        let param_word = list(base + params_offset);
        let param_len = (field(param_word, PARAM_LEN_MSB, PARAM_LEN_LSB) as usize).max(1);
        let next_offset = params_offset + param_len;

        Some(NodeHeader {
            position,
            node_index,
            arcs,
            arc_count: arc_count as u8,
            segment_count,
            keyed,
            dyn_alloc: w0 & ALLOC_BIT != 0,
            smp_flush: w1 & SMP_FLUSH_BIT != 0,
            memory_protect: w1 & PROTECT_BIT != 0,
            script: field(w1, SCRIPT_MSB, SCRIPT_LSB) as u8,
            priority: field(w0, PRIORITY_MSB, PRIORITY_LSB) as u8,
            proc_id: field(w0, PROC_MSB, PROC_LSB) as u8,
            arch_id: field(w0, ARCH_MSB, ARCH_LSB) as u8,
            segments_offset,
            key_offset,
            params_offset,
            next_offset,
        })
    }

    /// Arc references of this node: `(id, is_tx)`.
    pub fn arc_refs(&self) -> impl Iterator<Item = (u16, bool)> + '_ {
        self.arcs[..self.arc_count as usize]
            .iter()
            .map(|&r| (r & ARC_REF_ID_MASK, r & ARC_REF_TX != 0))
    }

    /// The first TX arc carries the collision byte used to lock the node
    /// and its RESET-DONE / NEW-PARAM state bits. A node without outputs
    /// has no lock cell and runs unlocked.
    pub fn collision_arc(&self) -> Option<u16> {
        self.arc_refs().find(|&(_, tx)| tx).map(|(id, _)| id)
    }

    pub fn segment(&self, list: &impl Fn(usize) -> u32, idx: usize) -> MemorySegment {
        debug_assert!(idx < self.segment_count as usize);
        let at = self.position as usize + self.segments_offset + 2 * idx;
        MemorySegment::from_words(list(at), list(at + 1))
    }

    /// The two 32-bit user key words (first half of the 4 key words).
    pub fn user_key(&self, list: &impl Fn(usize) -> u32) -> Option<[u32; 2]> {
        self.key_offset.map(|off| {
            let at = self.position as usize + off;
            [list(at), list(at + 1)]
        })
    }

    pub fn param_header(&self, list: &impl Fn(usize) -> u32) -> ParamHeader {
        ParamHeader(list(self.position as usize + self.params_offset))
    }

    /// Word offset of the first parameter payload word, and the payload
    /// length in words (0 when the node has no boot parameters).
    pub fn param_payload(&self, list: &impl Fn(usize) -> u32) -> (usize, usize) {
        let header = self.param_header(list);
        let len = header.length_words().saturating_sub(1);
        (self.position as usize + self.params_offset + 1, len)
    }

    /// Position of the next node header in the list.
    pub fn next_position(&self) -> u32 {
        self.position + self.next_offset as u32
    }
}

/// The boot-parameter header word of a node.
#[derive(Debug, Clone, Copy)]
pub struct ParamHeader(pub u32);

impl ParamHeader {
    pub fn tag(self) -> u8 {
        field(self.0, PARAM_TAG_MSB, PARAM_TAG_LSB) as u8
    }

    pub fn preset(self) -> u8 {
        field(self.0, PARAM_PRESET_MSB, PARAM_PRESET_LSB) as u8
    }

    pub fn trace_id(self) -> u8 {
        field(self.0, PARAM_TRACE_MSB, PARAM_TRACE_LSB) as u8
    }

    pub fn length_words(self) -> usize {
        field(self.0, PARAM_LEN_MSB, PARAM_LEN_LSB) as usize
    }
}

// ---------------------------------------------------------------------------
// Header assembly (host tooling and tests)

/// Build the words of one node header. This is the inverse of
/// [`NodeHeader::decode`], provided for host-side graph assembly.
#[derive(Debug, Clone, Default)]
pub struct NodeHeaderBuilder {
    node_index: u16,
    arcs: Vec<u16>,
    segments: Vec<(u32, u32)>,
    key: Option<[u32; 4]>,
    params: Vec<u32>,
    preset: u8,
    trace_id: u8,
    param_tag: u8,
    dyn_alloc: bool,
    smp_flush: bool,
    script: u8,
    priority: u8,
    proc_id: u8,
    arch_id: u8,
}

impl NodeHeaderBuilder {
    pub fn new(node_index: u16) -> NodeHeaderBuilder {
        NodeHeaderBuilder {
            node_index,
            ..Default::default()
        }
    }

    /// Add an arc reference. `tx` marks the arc as an output of this node.
    pub fn arc(mut self, id: u16, tx: bool) -> Self {
        self.arcs.push(if tx { id | ARC_REF_TX } else { id });
        self
    }

    /// Add a memory segment with a pre-packed address word and size word.
    pub fn segment(mut self, addr_word: u32, size_word: u32) -> Self {
        self.segments.push((addr_word, size_word));
        self
    }

    pub fn key(mut self, key: [u32; 4]) -> Self {
        self.key = Some(key);
        self
    }

    pub fn boot_params(mut self, tag: u8, params: &[u32]) -> Self {
        self.param_tag = tag;
        self.params = params.to_vec();
        self
    }

    pub fn preset(mut self, preset: u8) -> Self {
        self.preset = preset;
        self
    }

    pub fn trace_id(mut self, id: u8) -> Self {
        self.trace_id = id;
        self
    }

    pub fn dyn_alloc(mut self, on: bool) -> Self {
        self.dyn_alloc = on;
        self
    }

    pub fn smp_flush(mut self, on: bool) -> Self {
        self.smp_flush = on;
        self
    }

    pub fn script(mut self, id: u8) -> Self {
        self.script = id;
        self
    }

    pub fn processor_filter(mut self, arch: u8, proc: u8, priority: u8) -> Self {
        self.arch_id = arch;
        self.proc_id = proc;
        self.priority = priority;
        self
    }

    pub fn build(self) -> Vec<u32> {
        let segments = if self.segments.is_empty() {
            // Every node owns at least its instance segment.
            vec![(0, 0)]
        } else {
            self.segments
        };
        let mut w0 = 0;
        w0 = with_field(w0, PRIORITY_MSB, PRIORITY_LSB, self.priority as u32);
        w0 = with_field(w0, PROC_MSB, PROC_LSB, self.proc_id as u32);
        w0 = with_field(w0, ARCH_MSB, ARCH_LSB, self.arch_id as u32);
        w0 = with_field(w0, NBARC_MSB, NBARC_LSB, self.arcs.len() as u32);
        w0 = with_field(w0, NSEG_M1_MSB, NSEG_M1_LSB, segments.len() as u32 - 1);
        w0 = with_field(w0, NODE_IDX_MSB, NODE_IDX_LSB, self.node_index as u32);
        if self.dyn_alloc {
            w0 |= ALLOC_BIT;
        }
        if self.key.is_some() {
            w0 |= KEY_BIT;
        }
        let mut w1 = with_field(0, SCRIPT_MSB, SCRIPT_LSB, self.script as u32);
        if self.smp_flush {
            w1 |= SMP_FLUSH_BIT;
        }

        let mut words = vec![w0, w1];
        for pair in self.arcs.chunks(2) {
            let mut word = (pair[0] & 0x0FFF) as u32;
            if let Some(&hi) = pair.get(1) {
                word |= ((hi & 0x0FFF) as u32) << 16;
            }
            words.push(word);
        }
        for (addr, size) in segments {
            words.push(addr);
            words.push(size);
        }
        if let Some(key) = self.key {
            words.extend_from_slice(&key);
        }
        let mut param_word = 0;
        param_word = with_field(param_word, PARAM_TAG_MSB, PARAM_TAG_LSB, self.param_tag as u32);
        param_word = with_field(
            param_word,
            PARAM_PRESET_MSB,
            PARAM_PRESET_LSB,
            self.preset as u32,
        );
        param_word = with_field(
            param_word,
            PARAM_TRACE_MSB,
            PARAM_TRACE_LSB,
            self.trace_id as u32,
        );
        param_word = with_field(
            param_word,
            PARAM_LEN_MSB,
            PARAM_LEN_LSB,
            1 + self.params.len() as u32,
        );
        words.push(param_word);
        words.extend_from_slice(&self.params);
        words
    }
}

/// The one-word linked-list terminator.
pub fn sentinel_word() -> u32 {
    with_field(0, NODE_IDX_MSB, NODE_IDX_LSB, NODE_INDEX_SENTINEL as u32)
}
