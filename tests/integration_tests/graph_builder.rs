//! Test-side assembly of binary graph images.
//!
//! The real toolchain that compiles graphs is a separate project; the tests
//! only need small images with a handful of formats, arcs, IOs and nodes.
//! Everything lands in one host memory bank: the arcs section is copied to
//! bank offset 0 at RESET, followed by the arc buffers, the node instance
//! segments and an optional scratch region for driver-owned buffers.

use nanograph::{
    descriptor_words, inplace_section_addr, sentinel_word, ArcFlags, BankTable, GraphImage,
    HostBank, HwIoWord, IoControlWord, NodeHeaderBuilder, PackedAddr, PackedSize,
    ARC_DESC_WORDS, FORMAT_WORDS, HEADER_AND_TABLE_WORDS, HEADER_WORDS, INTERPRETER_VERSION,
    IO_CONTROL_WORDS,
};

struct ArcSpec {
    size: usize,
    producer_fmt: u8,
    consumer_fmt: u8,
    flags: ArcFlags,
}

#[derive(Default)]
pub struct GraphBuilder {
    version: Option<u32>,
    formats: Vec<[u32; FORMAT_WORDS]>,
    arcs: Vec<ArcSpec>,
    nodes: Vec<(NodeHeaderBuilder, usize)>,
    pio_hw: Vec<u32>,
    pio_graph: Vec<u32>,
    scratch_bytes: usize,
}

pub struct BuiltGraph {
    pub image: GraphImage,
    pub banks: BankTable,
    pub ram: HostBank,
    pub buffer_offsets: Vec<usize>,
    pub node_positions: Vec<u32>,
    pub scratch_offset: usize,
}

impl BuiltGraph {
    /// Linear address of an offset inside the test bank.
    pub fn addr(&self, offset: usize) -> usize {
        self.ram.base() + offset
    }

    pub fn buffer_addr(&self, arc: usize) -> usize {
        self.addr(self.buffer_offsets[arc])
    }

    pub fn scratch_addr(&self) -> usize {
        self.addr(self.scratch_offset)
    }
}

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

impl GraphBuilder {
    pub fn new() -> GraphBuilder {
        GraphBuilder::default()
    }

    pub fn version(&mut self, version: u32) -> &mut Self {
        self.version = Some(version);
        self
    }

    /// Register a 4-word format entry; returns its index.
    pub fn format(&mut self, words: [u32; FORMAT_WORDS]) -> u8 {
        self.formats.push(words);
        (self.formats.len() - 1) as u8
    }

    /// Declare an arc; returns its id.
    pub fn arc(&mut self, size: usize, producer_fmt: u8, consumer_fmt: u8, flags: ArcFlags) -> u16 {
        self.arcs.push(ArcSpec {
            size,
            producer_fmt,
            consumer_fmt,
            flags,
        });
        (self.arcs.len() - 1) as u16
    }

    /// Append a node to the linked list. The builder allocates
    /// `instance_bytes` of bank memory for the node's first segment.
    pub fn node(&mut self, header: NodeHeaderBuilder, instance_bytes: usize) -> usize {
        self.nodes.push((header, instance_bytes.max(8)));
        self.nodes.len() - 1
    }

    /// Declare a hardware IO wired to `graph_io` with the given affinity
    /// instance; returns the hardware IO index.
    pub fn hw_io(&mut self, graph_io: u16, instance: u8) -> u8 {
        self.pio_hw.push(HwIoWord::new(graph_io, instance).0);
        (self.pio_hw.len() - 1) as u8
    }

    /// Declare a graph IO; returns its index.
    pub fn graph_io(&mut self, control: IoControlWord) -> u16 {
        self.pio_graph.push(control.0);
        self.pio_graph.extend_from_slice(&[0; IO_CONTROL_WORDS - 1]);
        (self.pio_graph.len() / IO_CONTROL_WORDS - 1) as u16
    }

    /// Reserve bank bytes usable as a driver-owned buffer.
    pub fn scratch(&mut self, bytes: usize) -> &mut Self {
        self.scratch_bytes = bytes;
        self
    }

    pub fn build(self) -> BuiltGraph {
        // Bank layout: arcs section first, then buffers, instances,
        // scratch.
        let arcs_section_words = self.arcs.len() * ARC_DESC_WORDS;
        let mut cursor = arcs_section_words * 4;
        let mut buffer_offsets = Vec::new();
        for arc in &self.arcs {
            cursor = align8(cursor);
            buffer_offsets.push(cursor);
            cursor += arc.size;
        }
        let mut instance_offsets = Vec::new();
        for (_, instance_bytes) in &self.nodes {
            cursor = align8(cursor);
            instance_offsets.push(cursor);
            cursor += instance_bytes;
        }
        cursor = align8(cursor);
        let scratch_offset = cursor;
        cursor += self.scratch_bytes;

        let ram = HostBank::new(cursor.max(16));
        let mut banks = BankTable::new();
        banks.set(0, ram.base());

        // Linked list.
        let mut list = Vec::new();
        let mut node_positions = Vec::new();
        for (i, (header, instance_bytes)) in self.nodes.into_iter().enumerate() {
            let addr = PackedAddr::new(0, 0, instance_offsets[i] as i32).word();
            let size = PackedSize::from_bytes(instance_bytes).unwrap().0;
            node_positions.push(list.len() as u32);
            list.extend(header.segment(addr, size).build());
        }
        list.push(sentinel_word());

        // Arc descriptors (copied to bank offset 0 at RESET).
        let mut arcs_payload = Vec::new();
        for (i, arc) in self.arcs.iter().enumerate() {
            arcs_payload.extend_from_slice(&descriptor_words(
                PackedAddr::new(0, 0, buffer_offsets[i] as i32),
                arc.size,
                arc.producer_fmt,
                arc.consumer_fmt,
                arc.flags,
            ));
        }

        let formats_payload: Vec<u32> = self.formats.iter().flatten().copied().collect();
        let payloads: [&[u32]; 6] = [
            &self.pio_hw,
            &self.pio_graph,
            &[],
            &list,
            &formats_payload,
            &arcs_payload,
        ];

        let mut words = vec![0u32; HEADER_AND_TABLE_WORDS];
        let mut offset = HEADER_AND_TABLE_WORDS;
        for (i, payload) in payloads.iter().enumerate() {
            let entry = HEADER_WORDS + 2 * i;
            words[entry] = if i == 5 {
                // ARCS is the one writable section: copy it to the bank.
                PackedAddr::new(0, 0, 0).word()
            } else {
                inplace_section_addr(offset)
            };
            words[entry + 1] = (payload.len() * 4) as u32;
            offset += payload.len();
        }
        for payload in payloads {
            words.extend_from_slice(payload);
        }
        words[0] = words.len() as u32 & 0x00FF_FFFF;
        words[1] = self.version.unwrap_or(INTERPRETER_VERSION);

        BuiltGraph {
            image: GraphImage::from_words(words).expect("test graph must be well-formed"),
            banks,
            ram,
            buffer_offsets,
            node_positions,
            scratch_offset,
        }
    }
}
