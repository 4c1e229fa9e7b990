//! End-to-end scheduler scenarios over synthesized graph images.

mod graph_builder;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use graph_builder::GraphBuilder;
use nanograph::{
    command_ext, ArcFlags, Command, CommandWord, Domain, Error, ErrorLog, FormatBuilder,
    HostPlatform, IoControlBuilder, IoRequest, NodeHeaderBuilder, NodeRequest, NodeStatus,
    ReturnOption, Runtime, RuntimeBuilder, SchedulerConfig, TransferMode, XdmBuffer,
};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn audio_format() -> [u32; 4] {
    FormatBuilder::new()
        .frame_size(320)
        .channels(1)
        .domain(Domain::AudioIn as u8)
        .sampling_rate(16_000.0)
        .build()
}

fn ack_rx(runtime: &Runtime, hw: u8, pattern: u8, len: usize) -> usize {
    let chunk = vec![pattern; len];
    runtime
        .io_ack(
            hw,
            XdmBuffer {
                address: chunk.as_ptr() as usize,
                size: len,
            },
        )
        .unwrap()
}

// ---------------------------------------------------------------------------
// Scenario: audio pass-through without nodes, driven by driver completions.

#[test]
fn audio_pass_through() {
    init_logs();
    let mut g = GraphBuilder::new();
    let fmt = g.format(audio_format());
    let arc = g.arc(1600, fmt, fmt, ArcFlags::default());
    let gio_in = g.graph_io(
        IoControlBuilder::new(0, arc)
            .mode(TransferMode::Copy)
            .build(),
    );
    let gio_out = g.graph_io(
        IoControlBuilder::new(1, arc)
            .tx(true)
            .mode(TransferMode::Copy)
            .build(),
    );
    g.hw_io(gio_in, 0);
    g.hw_io(gio_out, 0);
    let built = g.build();

    let mut rt = RuntimeBuilder::new();
    rt.banks(built.banks);
    let runtime = rt.build(built.image);
    let mut instance = runtime.create_instance(SchedulerConfig::main()).unwrap();
    instance.reset().unwrap();

    // Five driver completions of one frame each fill the buffer exactly.
    for i in 0..5u8 {
        assert_eq!(ack_rx(&runtime, 0, 0xA0 + i, 320), 320);
    }
    let arcs = runtime.arc_table().unwrap();
    let a = arcs.arc(arc);
    assert_eq!(a.write_index(), 1600);
    assert_eq!(a.read_index(), 0);
    assert!(a.alignment_blocked());

    // A sixth completion cannot fit: dropped, counted, never fatal.
    assert_eq!(ack_rx(&runtime, 0, 0xFF, 320), 0);
    assert_eq!(runtime.flow_error_counts(0), (1, 0));
    assert!(runtime.error_log(0).contains(ErrorLog::RX_OVERFLOW));
    assert!(!runtime.error_log(0).is_fatal());

    // The consumer drains one frame: the read advances past the frame and
    // the pending bytes realign to the base address.
    let mut sink = vec![0u8; 320];
    let sent = runtime
        .io_ack(
            1,
            XdmBuffer {
                address: sink.as_mut_ptr() as usize,
                size: 320,
            },
        )
        .unwrap();
    assert_eq!(sent, 320);
    assert!(sink.iter().all(|&b| b == 0xA0));
    assert_eq!(a.read_index(), 0);
    assert_eq!(a.write_index(), 1280);
    assert!(!a.alignment_blocked());
}

// ---------------------------------------------------------------------------
// Scenario: RX + SET_BUFFER adopts the driver's buffer.

#[test]
fn rx_set_buffer_rebases_arc() {
    init_logs();
    let mut g = GraphBuilder::new();
    let fmt320 = g.format(audio_format());
    let fmt160 = g.format(FormatBuilder::new().frame_size(160).build());
    // Producer pushes 320-byte frames, consumer runs on 160.
    let arc = g.arc(64, fmt320, fmt160, ArcFlags::default());
    let gio = g.graph_io(
        IoControlBuilder::new(0, arc)
            .mode(TransferMode::SetBuffer)
            .build(),
    );
    g.hw_io(gio, 0);
    g.scratch(512);
    let built = g.build();
    let scratch = built.scratch_addr();

    let mut rt = RuntimeBuilder::new();
    rt.banks(built.banks);
    let runtime = rt.build(built.image);
    let mut instance = runtime.create_instance(SchedulerConfig::main()).unwrap();
    instance.reset().unwrap();

    unsafe {
        core::ptr::write_bytes(scratch as *mut u8, 0x5C, 320);
    }
    runtime
        .io_ack(
            0,
            XdmBuffer {
                address: scratch,
                size: 320,
            },
        )
        .unwrap();

    let arc_table = runtime.arc_table().unwrap();
    let a = arc_table.arc(arc);
    assert_eq!(a.size(), 320);
    assert_eq!(a.read_index(), 0);
    assert_eq!(a.write_index(), 320);
    // The arc now reads straight out of the driver's buffer.
    assert_eq!(a.read_address(&built.banks).unwrap(), scratch);
}

// ---------------------------------------------------------------------------
// Scenario: a full RX -> node -> TX pipeline.

static COPIED: AtomicUsize = AtomicUsize::new(0);

fn copy_node(_command: CommandWord, request: NodeRequest<'_>) -> NodeStatus {
    if let NodeRequest::Run { xdm, .. } = request {
        let n = xdm[0].size.min(xdm[1].size);
        unsafe {
            core::ptr::copy_nonoverlapping(xdm[0].address as *const u8, xdm[1].address as *mut u8, n);
        }
        xdm[0].size = n;
        xdm[1].size = n;
        COPIED.fetch_add(n, Ordering::SeqCst);
    }
    NodeStatus::Completed
}

#[test]
fn two_arc_pipeline_moves_data_end_to_end() {
    init_logs();
    let mut g = GraphBuilder::new();
    let fmt = g.format(audio_format());
    let arc_in = g.arc(1600, fmt, fmt, ArcFlags::default());
    let arc_out = g.arc(1600, fmt, fmt, ArcFlags::default());
    let gio_in = g.graph_io(IoControlBuilder::new(0, arc_in).build());
    let gio_out = g.graph_io(IoControlBuilder::new(1, arc_out).tx(true).build());
    g.hw_io(gio_in, 0);
    g.hw_io(gio_out, 0);

    let mut rt = RuntimeBuilder::new();
    let node_idx = rt.node(copy_node);
    g.node(
        NodeHeaderBuilder::new(node_idx)
            .arc(arc_in, false)
            .arc(arc_out, true),
        16,
    );
    let built = g.build();
    rt.banks(built.banks);
    let runtime = rt.build(built.image);

    let mut instance = runtime.create_instance(SchedulerConfig::main()).unwrap();
    instance.reset().unwrap();

    assert_eq!(ack_rx(&runtime, 0, 0x42, 320), 320);
    instance.interpret(Command::Run, 0).unwrap();
    assert_eq!(COPIED.load(Ordering::SeqCst), 320);

    let mut sink = vec![0u8; 320];
    let sent = runtime
        .io_ack(
            1,
            XdmBuffer {
                address: sink.as_mut_ptr() as usize,
                size: 320,
            },
        )
        .unwrap();
    assert_eq!(sent, 320);
    assert!(sink.iter().all(|&b| b == 0x42));
}

// ---------------------------------------------------------------------------
// Scenario: collision on a node leaves it to the owner, the rest of the
// list still runs.

static A_RUNS: AtomicU32 = AtomicU32::new(0);
static B_RUNS: AtomicU32 = AtomicU32::new(0);

fn node_a(_c: CommandWord, request: NodeRequest<'_>) -> NodeStatus {
    if let NodeRequest::Run { xdm, .. } = request {
        A_RUNS.fetch_add(1, Ordering::SeqCst);
        xdm[0].size = 0;
    }
    NodeStatus::Completed
}

fn node_b(_c: CommandWord, request: NodeRequest<'_>) -> NodeStatus {
    if let NodeRequest::Run { xdm, .. } = request {
        B_RUNS.fetch_add(1, Ordering::SeqCst);
        xdm[0].size = 0;
    }
    NodeStatus::Completed
}

#[test]
fn locked_node_is_skipped_without_blocking_the_pass() {
    init_logs();
    let mut g = GraphBuilder::new();
    let fmt = g.format(FormatBuilder::new().frame_size(16).build());
    let arc_a = g.arc(64, fmt, fmt, ArcFlags::default());
    let arc_b = g.arc(64, fmt, fmt, ArcFlags::default());

    let mut rt = RuntimeBuilder::new();
    let idx_a = rt.node(node_a);
    let idx_b = rt.node(node_b);
    g.node(NodeHeaderBuilder::new(idx_a).arc(arc_a, true), 8);
    g.node(NodeHeaderBuilder::new(idx_b).arc(arc_b, true), 8);
    let built = g.build();
    rt.banks(built.banks);
    let runtime = rt.build(built.image);

    let mut instance = runtime.create_instance(SchedulerConfig::main()).unwrap();
    instance.reset().unwrap();

    // Another instance owns node A.
    let arcs = runtime.arc_table().unwrap();
    assert!(arcs.arc(arc_a).try_lock(0x6E));

    instance.run().unwrap();
    assert_eq!(A_RUNS.load(Ordering::SeqCst), 0);
    assert_eq!(B_RUNS.load(Ordering::SeqCst), 1);

    arcs.arc(arc_a).unlock();
    instance.run().unwrap();
    assert_eq!(A_RUNS.load(Ordering::SeqCst), 1);
    assert_eq!(B_RUNS.load(Ordering::SeqCst), 2);
}

// ---------------------------------------------------------------------------
// Scenario: high-QoS override runs the node with the starved arcs zeroed.

static QOS_SIZES: [AtomicUsize; 2] = [AtomicUsize::new(usize::MAX), AtomicUsize::new(usize::MAX)];

fn qos_node(_c: CommandWord, request: NodeRequest<'_>) -> NodeStatus {
    if let NodeRequest::Run { xdm, .. } = request {
        QOS_SIZES[0].store(xdm[0].size, Ordering::SeqCst);
        QOS_SIZES[1].store(xdm[1].size, Ordering::SeqCst);
        // Consume the high-QoS arc fully, nothing from the starved one.
        xdm[0].size = 0;
    }
    NodeStatus::Completed
}

#[test]
fn high_qos_arc_overrides_readiness() {
    init_logs();
    let mut g = GraphBuilder::new();
    let fmt = g.format(audio_format());
    let arc_low = g.arc(640, fmt, fmt, ArcFlags::default());
    let arc_high = g.arc(
        640,
        fmt,
        fmt,
        ArcFlags {
            high_qos: true,
            mp_flush: false,
        },
    );

    let mut rt = RuntimeBuilder::new();
    let idx = rt.node(qos_node);
    g.node(
        NodeHeaderBuilder::new(idx)
            .arc(arc_low, false)
            .arc(arc_high, false),
        8,
    );
    let built = g.build();
    rt.banks(built.banks);
    let runtime = rt.build(built.image);

    let mut instance = runtime.create_instance(SchedulerConfig::main()).unwrap();
    instance.reset().unwrap();

    // Fill the high-QoS arc completely, leave the other empty.
    let arcs = runtime.arc_table().unwrap();
    arcs.arc(arc_high).advance_write(640, 320);

    instance.run().unwrap();
    assert_eq!(QOS_SIZES[0].load(Ordering::SeqCst), 0);
    assert_eq!(QOS_SIZES[1].load(Ordering::SeqCst), 640);

    // The starved arc was passed through unchanged.
    assert_eq!(arcs.arc(arc_low).read_index(), 0);
    assert_eq!(arcs.arc(arc_low).write_index(), 0);
    // The consumed high-QoS arc rewound to empty.
    assert_eq!(arcs.arc(arc_high).available(), 0);
}

// ---------------------------------------------------------------------------
// Scenario: alignment-blocked handoff from producer to consumer.

static HANDOFF_ADDR: AtomicUsize = AtomicUsize::new(0);
static HANDOFF_SIZE: AtomicUsize = AtomicUsize::new(0);
static HANDOFF_FIRST: AtomicU32 = AtomicU32::new(0);

fn handoff_node(_c: CommandWord, request: NodeRequest<'_>) -> NodeStatus {
    if let NodeRequest::Run { xdm, .. } = request {
        HANDOFF_ADDR.store(xdm[0].address, Ordering::SeqCst);
        HANDOFF_SIZE.store(xdm[0].size, Ordering::SeqCst);
        let first = unsafe { *(xdm[0].address as *const u8) };
        HANDOFF_FIRST.store(first as u32, Ordering::SeqCst);
        xdm[0].size = 320.min(xdm[0].size);
    }
    NodeStatus::Completed
}

#[test]
fn alignment_blocked_handoff_realigns_without_losing_data() {
    init_logs();
    let mut g = GraphBuilder::new();
    let fmt = g.format(audio_format());
    let arc = g.arc(1600, fmt, fmt, ArcFlags::default());
    let gio = g.graph_io(IoControlBuilder::new(0, arc).build());
    g.hw_io(gio, 0);

    let mut rt = RuntimeBuilder::new();
    let idx = rt.node(handoff_node);
    g.node(NodeHeaderBuilder::new(idx).arc(arc, false), 8);
    let built = g.build();
    let base = built.buffer_addr(arc as usize);
    rt.banks(built.banks);
    let runtime = rt.build(built.image);

    let mut instance = runtime.create_instance(SchedulerConfig::main()).unwrap();
    instance.reset().unwrap();

    // Four frames in, consumer takes one: read = 320, write = 1280.
    for i in 0..4u8 {
        ack_rx(&runtime, 0, 0xB0 + i, 320);
    }
    instance.run().unwrap();
    let arcs = runtime.arc_table().unwrap();
    assert_eq!(arcs.arc(arc).read_index(), 320);

    // Producer fills the tail and blocks.
    ack_rx(&runtime, 0, 0xB4, 320);
    assert!(arcs.arc(arc).alignment_blocked());
    assert_eq!(arcs.arc(arc).write_index(), 1600);

    // The consumer's preprocessing realigns: data moves down to the base,
    // nothing is lost, the flag drops.
    instance.run().unwrap();
    assert_eq!(HANDOFF_ADDR.load(Ordering::SeqCst), base);
    assert_eq!(HANDOFF_SIZE.load(Ordering::SeqCst), 1280);
    assert_eq!(HANDOFF_FIRST.load(Ordering::SeqCst), 0xB1);
    let a = arcs.arc(arc);
    assert!(!a.alignment_blocked());
    assert_eq!(a.read_index(), 320);
    assert_eq!(a.write_index(), 1280);
}

// ---------------------------------------------------------------------------
// Scenario: a node splitting long work is bounded by MAX_NODE_REPEAT.

static GREEDY_CALLS: AtomicU32 = AtomicU32::new(0);

fn greedy_node(_c: CommandWord, request: NodeRequest<'_>) -> NodeStatus {
    if let NodeRequest::Run { xdm, .. } = request {
        GREEDY_CALLS.fetch_add(1, Ordering::SeqCst);
        xdm[0].size = 0;
        return NodeStatus::NeedsAnotherCall;
    }
    NodeStatus::Completed
}

#[test]
fn node_repeat_is_capped() {
    init_logs();
    let mut g = GraphBuilder::new();
    let fmt = g.format(FormatBuilder::new().frame_size(16).build());
    let arc = g.arc(64, fmt, fmt, ArcFlags::default());

    let mut rt = RuntimeBuilder::new();
    let idx = rt.node(greedy_node);
    g.node(NodeHeaderBuilder::new(idx).arc(arc, true), 8);
    let built = g.build();
    rt.banks(built.banks);
    let runtime = rt.build(built.image);

    let mut instance = runtime.create_instance(SchedulerConfig::main()).unwrap();
    instance.reset().unwrap();
    instance.run().unwrap();
    assert_eq!(GREEDY_CALLS.load(Ordering::SeqCst), 4);
}

// ---------------------------------------------------------------------------
// Scenario: the reset barrier holds RUN back until every instance is done.

static BARRIER_RUNS: AtomicU32 = AtomicU32::new(0);
static BARRIER_RESETS: AtomicU32 = AtomicU32::new(0);

fn barrier_node(command: CommandWord, request: NodeRequest<'_>) -> NodeStatus {
    match request {
        NodeRequest::Run { xdm, .. } => {
            BARRIER_RUNS.fetch_add(1, Ordering::SeqCst);
            xdm[0].size = 0;
        }
        NodeRequest::Reset { .. } if command.extension() != command_ext::DYN_MALLOC => {
            BARRIER_RESETS.fetch_add(1, Ordering::SeqCst);
        }
        _ => {}
    }
    NodeStatus::Completed
}

#[test]
fn reset_barrier_gates_run_and_reset_is_idempotent() {
    init_logs();
    let mut g = GraphBuilder::new();
    let fmt = g.format(FormatBuilder::new().frame_size(16).build());
    let arc = g.arc(64, fmt, fmt, ArcFlags::default());

    let mut rt = RuntimeBuilder::new();
    let idx = rt.node(barrier_node);
    g.node(NodeHeaderBuilder::new(idx).arc(arc, true), 8);
    let built = g.build();
    rt.banks(built.banks);
    let runtime = rt.build(built.image);

    let mut main = runtime.create_instance(SchedulerConfig::main()).unwrap();
    let mut secondary = runtime
        .create_instance(SchedulerConfig {
            proc_id: 1,
            ..SchedulerConfig::secondary(1)
        })
        .unwrap();

    main.reset().unwrap();
    assert_eq!(BARRIER_RESETS.load(Ordering::SeqCst), 1);

    // Sibling still in reset: RUN is a quiet no-op.
    main.run().unwrap();
    assert_eq!(BARRIER_RUNS.load(Ordering::SeqCst), 0);

    // The sibling's reset skips the node (already reset) and opens the
    // barrier.
    secondary.reset().unwrap();
    assert_eq!(BARRIER_RESETS.load(Ordering::SeqCst), 1);

    main.run().unwrap();
    assert_eq!(BARRIER_RUNS.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Scenario: out-of-band parameter updates reach the node before its next
// RUN.

static PARAM_TAG: AtomicU32 = AtomicU32::new(u32::MAX);
static PARAM_VALUE: AtomicU32 = AtomicU32::new(0);
static PARAM_BEFORE_RUN: AtomicBool = AtomicBool::new(false);

fn tunable_node(command: CommandWord, request: NodeRequest<'_>) -> NodeStatus {
    match request {
        NodeRequest::SetParameter { params, .. } => {
            PARAM_TAG.store(command.tag() as u32, Ordering::SeqCst);
            if let Some(&v) = params.first() {
                PARAM_VALUE.store(v, Ordering::SeqCst);
            }
        }
        NodeRequest::Run { xdm, .. } => {
            PARAM_BEFORE_RUN.store(PARAM_VALUE.load(Ordering::SeqCst) != 0, Ordering::SeqCst);
            xdm[0].size = 0;
        }
        _ => {}
    }
    NodeStatus::Completed
}

#[test]
fn pending_parameter_update_is_applied_on_next_visit() {
    init_logs();
    let mut g = GraphBuilder::new();
    let fmt = g.format(FormatBuilder::new().frame_size(16).build());
    let arc = g.arc(64, fmt, fmt, ArcFlags::default());

    let mut rt = RuntimeBuilder::new();
    let idx = rt.node(tunable_node);
    let node = g.node(NodeHeaderBuilder::new(idx).arc(arc, true), 8);
    let built = g.build();
    let position = built.node_positions[node];
    rt.banks(built.banks);
    let runtime = rt.build(built.image);

    let mut instance = runtime.create_instance(SchedulerConfig::main()).unwrap();
    instance.reset().unwrap();

    runtime.push_parameter_update(position, 3, &[0xCAFE]);
    instance.set_parameter(position).unwrap();
    let arcs = runtime.arc_table().unwrap();
    assert!(arcs.arc(arc).new_param());

    instance.run().unwrap();
    assert_eq!(PARAM_TAG.load(Ordering::SeqCst), 3);
    assert_eq!(PARAM_VALUE.load(Ordering::SeqCst), 0xCAFE);
    assert!(PARAM_BEFORE_RUN.load(Ordering::SeqCst));
    assert!(!arcs.arc(arc).new_param());
}

// ---------------------------------------------------------------------------
// Scenario: boot parameters are delivered right after the node reset.

static BOOT_PARAMS: AtomicU32 = AtomicU32::new(0);

fn boot_node(command: CommandWord, request: NodeRequest<'_>) -> NodeStatus {
    if let NodeRequest::SetParameter { params, .. } = request {
        if command.tag() == 15 {
            BOOT_PARAMS.store(params[0], Ordering::SeqCst);
        }
    }
    NodeStatus::Completed
}

#[test]
fn boot_parameters_follow_reset() {
    init_logs();
    let mut g = GraphBuilder::new();
    let fmt = g.format(FormatBuilder::new().frame_size(16).build());
    let arc = g.arc(64, fmt, fmt, ArcFlags::default());

    let mut rt = RuntimeBuilder::new();
    let idx = rt.node(boot_node);
    g.node(
        NodeHeaderBuilder::new(idx)
            .arc(arc, true)
            .boot_params(15, &[0x0002_710F]),
        8,
    );
    let built = g.build();
    rt.banks(built.banks);
    let runtime = rt.build(built.image);

    let mut instance = runtime.create_instance(SchedulerConfig::main()).unwrap();
    instance.reset().unwrap();
    assert_eq!(BOOT_PARAMS.load(Ordering::SeqCst), 0x0002_710F);
}

// ---------------------------------------------------------------------------
// Scenario: servant IOs are solicited by the boundary pump, once per
// outstanding request.

static PUMP_RESETS: AtomicU32 = AtomicU32::new(0);
static PUMP_RUNS: AtomicU32 = AtomicU32::new(0);
static PUMP_LAST_SIZE: AtomicUsize = AtomicUsize::new(0);

fn pump_driver(request: IoRequest<'_>) {
    match request {
        IoRequest::Reset { .. } => {
            PUMP_RESETS.fetch_add(1, Ordering::SeqCst);
        }
        IoRequest::Run { buffer } => {
            PUMP_RUNS.fetch_add(1, Ordering::SeqCst);
            PUMP_LAST_SIZE.store(buffer.size, Ordering::SeqCst);
        }
        _ => {}
    }
}

#[test]
fn boundary_pump_solicits_servant_io_once() {
    init_logs();
    let mut g = GraphBuilder::new();
    let fmt = g.format(audio_format());
    let arc = g.arc(1600, fmt, fmt, ArcFlags::default());
    let gio = g.graph_io(IoControlBuilder::new(0, arc).servant(true).build());
    g.hw_io(gio, 0);
    let built = g.build();

    let mut rt = RuntimeBuilder::new();
    rt.io(0, pump_driver);
    rt.banks(built.banks);
    let runtime = rt.build(built.image);

    let mut instance = runtime.create_instance(SchedulerConfig::main()).unwrap();
    instance.reset().unwrap();
    assert_eq!(PUMP_RESETS.load(Ordering::SeqCst), 1);

    // First pass asks the driver for the whole free area.
    instance.run().unwrap();
    assert_eq!(PUMP_RUNS.load(Ordering::SeqCst), 1);
    assert_eq!(PUMP_LAST_SIZE.load(Ordering::SeqCst), 1600);

    // While the request is in flight, the pump stays quiet.
    instance.run().unwrap();
    assert_eq!(PUMP_RUNS.load(Ordering::SeqCst), 1);

    // Completion lands a frame and clears the in-flight bit.
    assert_eq!(ack_rx(&runtime, 0, 0x11, 320), 320);
    instance.run().unwrap();
    assert_eq!(PUMP_RUNS.load(Ordering::SeqCst), 2);
    assert_eq!(PUMP_LAST_SIZE.load(Ordering::SeqCst), 1280);
}

// ---------------------------------------------------------------------------
// Scenario: dynamic segment allocation at reset.

static DYN_INSTANCE: AtomicUsize = AtomicUsize::new(0);
static DYN_RUN_INSTANCE: AtomicUsize = AtomicUsize::new(0);
static DYN_STOPPED: AtomicBool = AtomicBool::new(false);

fn dyn_node(command: CommandWord, request: NodeRequest<'_>) -> NodeStatus {
    match request {
        NodeRequest::Reset { memory, .. } => {
            if command.extension() == command_ext::DYN_MALLOC {
                // Announce how much instance memory we need.
                memory[0] = 64;
            } else {
                DYN_INSTANCE.store(memory[0], Ordering::SeqCst);
            }
        }
        NodeRequest::Run { instance, xdm } => {
            DYN_RUN_INSTANCE.store(instance, Ordering::SeqCst);
            xdm[0].size = 0;
        }
        NodeRequest::Stop { .. } => {
            DYN_STOPPED.store(true, Ordering::SeqCst);
        }
        _ => {}
    }
    NodeStatus::Completed
}

#[test]
fn dyn_malloc_reset_allocates_and_stop_releases() {
    init_logs();
    let mut g = GraphBuilder::new();
    let fmt = g.format(FormatBuilder::new().frame_size(16).build());
    let arc = g.arc(64, fmt, fmt, ArcFlags::default());

    let mut rt = RuntimeBuilder::new();
    rt.platform(HostPlatform::with_arena(4096));
    let idx = rt.node(dyn_node);
    g.node(
        NodeHeaderBuilder::new(idx).arc(arc, true).dyn_alloc(true),
        8,
    );
    let built = g.build();
    rt.banks(built.banks);
    let runtime = rt.build(built.image);

    let mut instance = runtime.create_instance(SchedulerConfig::main()).unwrap();
    instance.reset().unwrap();
    let allocated = DYN_INSTANCE.load(Ordering::SeqCst);
    assert_ne!(allocated, 0);

    instance.run().unwrap();
    assert_eq!(DYN_RUN_INSTANCE.load(Ordering::SeqCst), allocated);

    instance.stop().unwrap();
    assert!(DYN_STOPPED.load(Ordering::SeqCst));

    // A fresh RESET after STOP starts from a clean slate: the arc section
    // is re-copied (indices and state flags cleared) and the node is reset
    // again with newly allocated memory.
    instance.reset().unwrap();
    let arc_table = runtime.arc_table().unwrap();
    let a = arc_table.arc(arc);
    assert_eq!(a.read_index(), 0);
    assert_eq!(a.write_index(), 0);
    assert!(a.reset_done());
    assert_ne!(DYN_INSTANCE.load(Ordering::SeqCst), allocated);
}

// ---------------------------------------------------------------------------
// Scenario: version mismatch is fatal until the next reset.

#[test]
fn version_mismatch_stops_the_instance() {
    init_logs();
    let mut g = GraphBuilder::new();
    let fmt = g.format(FormatBuilder::new().frame_size(16).build());
    g.arc(64, fmt, fmt, ArcFlags::default());
    g.version(0x0200);
    let built = g.build();

    let mut rt = RuntimeBuilder::new();
    rt.banks(built.banks);
    let runtime = rt.build(built.image);
    let mut instance = runtime.create_instance(SchedulerConfig::main()).unwrap();
    assert!(matches!(
        instance.reset(),
        Err(Error::VersionMismatch { image: 0x0200, .. })
    ));
    assert!(runtime.error_log(0).contains(ErrorLog::VERSION_MISMATCH));
    assert!(runtime.error_log(0).is_fatal());
    assert_eq!(instance.run(), Err(Error::Stopped));
}

// ---------------------------------------------------------------------------
// Scenario: the starving return policy drains everything in one call.

static DRAIN_RUNS: AtomicU32 = AtomicU32::new(0);

fn drain_node(_c: CommandWord, request: NodeRequest<'_>) -> NodeStatus {
    if let NodeRequest::Run { xdm, .. } = request {
        DRAIN_RUNS.fetch_add(1, Ordering::SeqCst);
        // Consume one frame per visit.
        xdm[0].size = 320.min(xdm[0].size);
    }
    NodeStatus::Completed
}

#[test]
fn starving_policy_keeps_parsing_until_no_data_moves() {
    init_logs();
    let mut g = GraphBuilder::new();
    let fmt = g.format(audio_format());
    let arc = g.arc(1600, fmt, fmt, ArcFlags::default());
    let gio = g.graph_io(IoControlBuilder::new(0, arc).build());
    g.hw_io(gio, 0);

    let mut rt = RuntimeBuilder::new();
    let idx = rt.node(drain_node);
    g.node(NodeHeaderBuilder::new(idx).arc(arc, false), 8);
    let built = g.build();
    rt.banks(built.banks);
    let runtime = rt.build(built.image);

    let mut instance = runtime
        .create_instance(SchedulerConfig {
            return_option: ReturnOption::EndWhenStarving,
            ..SchedulerConfig::main()
        })
        .unwrap();
    instance.reset().unwrap();

    for i in 0..3u8 {
        ack_rx(&runtime, 0, i, 320);
    }
    // One RUN call keeps passing over the list until the node starves.
    instance.run().unwrap();
    assert_eq!(DRAIN_RUNS.load(Ordering::SeqCst), 3);
    assert_eq!(runtime.arc_table().unwrap().arc(arc).available(), 0);
}
