// Copyright 2020 Loom project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use devices::{DeviceManager, ResourceContext, ThreadPoolDevice};
use fnv::FnvHashMap as HashMap;
use graph::{AttrValue, Graph, GraphDef, GraphDefNode, NodeDef, NodeId};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use status::{Code, Status};
use tensor::{DataType, Tensor, TensorDef};

use crate::cancellation::CancellationManager;
use crate::kernel::{global_registry, AsyncDone, AsyncOpKernel, OpKernel, OpKernelContext};
use crate::kernels::const_value;
use crate::oplib::{
    DataflowOpLibrary, NamedTensor, OpLibrary, RequestEnvelope, RunStepRequest, RunStepResponse,
};
use crate::rendezvous::LocalRendezvous;
use crate::session::{FunctionCallFrame, ScopedStepContainer, SessionMgr, SessionState, TensorStore};
use crate::state::{Args, ExecutorImpl, MultiDeviceExecutorParams};
use crate::stats::StepStatsCollector;

const I64: &[DataType] = &[DataType::Int64];
const BOOL: &[DataType] = &[DataType::Bool];

/// Executions per node name, for exactly-once assertions. Node names must be
/// unique across tests: the registry is process-wide.
static RUN_COUNTS: Lazy<Mutex<HashMap<String, usize>>> =
    Lazy::new(|| Mutex::new(HashMap::default()));

static LAST_FAILED_ALLOC: AtomicUsize = AtomicUsize::new(0);

fn run_count(name: &str) -> usize {
    RUN_COUNTS.lock().get(name).copied().unwrap_or(0)
}

/// Forwards input 0 and counts how often each node ran.
struct CountingOp;

impl OpKernel for CountingOp {
    fn compute(&self, ctx: &mut OpKernelContext) -> Result<(), Status> {
        *RUN_COUNTS.lock().entry(ctx.node_name.clone()).or_insert(0) += 1;
        let t = ctx.input(0)?.clone();
        ctx.set_output(0, t)
    }
}

/// Fails with the configured message, optionally after a delay.
struct FailOp {
    message: String,
    delay_ms: u64,
}

impl OpKernel for FailOp {
    fn compute(&self, _ctx: &mut OpKernelContext) -> Result<(), Status> {
        if self.delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.delay_ms));
        }
        Err(Status::internal(self.message.clone()))
    }
}

/// Requests one allocation of the configured size, recording the failure
/// size on refusal.
struct BigAllocOp {
    num_bytes: usize,
}

impl OpKernel for BigAllocOp {
    fn compute(&self, ctx: &mut OpKernelContext) -> Result<(), Status> {
        let elements = self.num_bytes / DataType::Double.element_size();
        match ctx.allocate_tensor(DataType::Double, tensor::TensorShape::vector(elements)) {
            Ok(t) => ctx.set_output(0, t),
            Err(e) => {
                LAST_FAILED_ALLOC.store(ctx.allocator.last_failed_alloc_size(), Ordering::SeqCst);
                Err(e)
            }
        }
    }
}

/// Triggers the step's CancellationManager, then forwards its input.
struct CancelOp;

impl OpKernel for CancelOp {
    fn compute(&self, ctx: &mut OpKernelContext) -> Result<(), Status> {
        if let Some(cm) = &ctx.cancellation_manager {
            cm.start_cancel();
        }
        let t = ctx.input(0)?.clone();
        ctx.set_output(0, t)
    }
}

/// Completes on a background thread after 50ms.
struct DelayOp;

impl OpKernel for DelayOp {
    fn compute(&self, _ctx: &mut OpKernelContext) -> Result<(), Status> {
        Err(Status::internal("TestDelay must be dispatched asynchronously"))
    }

    fn as_async(&self) -> Option<&dyn AsyncOpKernel> {
        Some(self)
    }
}

impl AsyncOpKernel for DelayOp {
    fn compute_async(&self, mut ctx: OpKernelContext, done: AsyncDone) {
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            match ctx.input(0).map(Tensor::clone) {
                Ok(t) => {
                    if let Err(e) = ctx.set_output(0, t) {
                        ctx.set_status(e);
                    }
                }
                Err(e) => ctx.set_status(e),
            }
            done(ctx);
        });
    }
}

fn register_test_kernels() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let cpu = devices::DeviceType::cpu();
        let registry = global_registry();
        registry.register("TestCounting", &cpu, false, Box::new(|_| Ok(Arc::new(CountingOp))));
        registry.register(
            "TestFail",
            &cpu,
            false,
            Box::new(|def| {
                Ok(Arc::new(FailOp {
                    message: def.attr_str("message").unwrap_or("failed").to_owned(),
                    delay_ms: def.attr_i64("delay_ms").unwrap_or(0) as u64,
                }))
            }),
        );
        registry.register(
            "TestBigAlloc",
            &cpu,
            true,
            Box::new(|def| {
                Ok(Arc::new(BigAllocOp {
                    num_bytes: def.attr_i64("num_bytes").unwrap_or(0) as usize,
                }))
            }),
        );
        registry.register("TestCancel", &cpu, false, Box::new(|_| Ok(Arc::new(CancelOp))));
        registry.register("TestDelay", &cpu, false, Box::new(|_| Ok(Arc::new(DelayOp))));
    });
}

struct Harness {
    pool: task_executor::Executor,
    device_mgr: Arc<DeviceManager>,
    resource_context: Arc<ResourceContext>,
    next_step_id: AtomicUsize,
}

impl Harness {
    fn new() -> Harness {
        Harness::with_memory_limit(usize::MAX)
    }

    fn with_memory_limit(limit_bytes: usize) -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();
        register_test_kernels();
        Harness {
            pool: task_executor::Executor::new_owned(4).unwrap(),
            device_mgr: Arc::new(
                DeviceManager::new(vec![
                    Arc::new(ThreadPoolDevice::new(0)),
                    Arc::new(ThreadPoolDevice::new(1)),
                ])
                .unwrap(),
            ),
            resource_context: Arc::new(ResourceContext::new(limit_bytes)),
            next_step_id: AtomicUsize::new(1),
        }
    }

    fn executor(&self, graph: Graph) -> Arc<ExecutorImpl> {
        ExecutorImpl::new(
            MultiDeviceExecutorParams {
                device_mgr: self.device_mgr.clone(),
                resource_context: self.resource_context.clone(),
            },
            graph,
        )
        .unwrap()
    }

    fn args(&self) -> Args {
        Args {
            step_id: self.next_step_id.fetch_add(1, Ordering::Relaxed) as u64,
            rendezvous: Some(Arc::new(LocalRendezvous::new())),
            session_state: Some(Arc::new(SessionState::new())),
            tensor_store: Some(Arc::new(TensorStore::new())),
            step_container: Some(Arc::new(ScopedStepContainer::new(0))),
            stats_collector: None,
            call_frame: None,
            cancellation_manager: None,
            runner: self.pool.runner(),
            sync_on_finish: true,
        }
    }

    /// Runs the executor and returns (status, number of done invocations
    /// observed within a grace period).
    fn run(&self, executor: &Arc<ExecutorImpl>, args: Args) -> (Status, usize) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        executor.run_async(
            args,
            Box::new(move |status| {
                calls2.fetch_add(1, Ordering::SeqCst);
                tx.send(status).unwrap();
            }),
        );
        let status = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        // Give a buggy second invocation a chance to show up.
        std::thread::sleep(Duration::from_millis(20));
        (status, calls.load(Ordering::SeqCst))
    }
}

fn add_unary(g: &mut Graph, name: &str, op: &str, src: NodeId, src_output: usize) -> NodeId {
    let id = g
        .add_node(NodeDef::new(name, op).inputs(I64).outputs(I64))
        .unwrap();
    g.add_edge(src, src_output, id, 0).unwrap();
    id
}

fn add_const_i64(g: &mut Graph, name: &str, value: i64) -> NodeId {
    g.add_node(
        NodeDef::new(name, "Const")
            .outputs(I64)
            .attr("value", const_value(Tensor::scalar_i64(value)).unwrap()),
    )
    .unwrap()
}

fn add_arg(g: &mut Graph, name: &str, index: i64) -> NodeId {
    g.add_node(
        NodeDef::new(name, "_Arg")
            .outputs(I64)
            .attr("index", AttrValue::I(index)),
    )
    .unwrap()
}

fn add_retval(g: &mut Graph, name: &str, index: i64, src: NodeId) -> NodeId {
    let id = g
        .add_node(
            NodeDef::new(name, "_Retval")
                .inputs(I64)
                .attr("index", AttrValue::I(index)),
        )
        .unwrap();
    g.add_edge(src, 0, id, 0).unwrap();
    id
}

fn add_enter(g: &mut Graph, name: &str, src: NodeId, is_constant: bool) -> NodeId {
    let id = g
        .add_node(
            NodeDef::new(name, "Enter")
                .inputs(I64)
                .outputs(I64)
                .attr("frame_name", AttrValue::S("loop".to_owned()))
                .attr("is_constant", AttrValue::B(is_constant))
                .attr("parallel_iterations", AttrValue::I(2)),
        )
        .unwrap();
    g.add_edge(src, 0, id, 0).unwrap();
    id
}

fn call_frame_args(harness: &Harness, frame: &Arc<FunctionCallFrame>) -> Args {
    let mut args = harness.args();
    args.call_frame = Some(frame.clone());
    args
}

// S1: a linear chain of identities computes the fed value, the done callback
// fires once with OK.
#[test]
fn linear_chain() {
    let harness = Harness::new();
    let mut g = Graph::new();
    let a = add_arg(&mut g, "s1_a", 0);
    let b = add_unary(&mut g, "s1_b", "Identity", a, 0);
    let c = add_unary(&mut g, "s1_c", "Identity", b, 0);
    add_retval(&mut g, "s1_ret", 0, c);

    let executor = harness.executor(g);
    let frame = Arc::new(FunctionCallFrame::new(vec![Tensor::scalar_i64(7)], 1));
    let (status, done_calls) = harness.run(&executor, call_frame_args(&harness, &frame));
    assert!(status.is_ok(), "{status}");
    assert_eq!(done_calls, 1);
    assert_eq!(
        frame.consume_retvals().unwrap()[0].as_scalar_i64().unwrap(),
        7
    );
}

// S2: the untaken Switch branch is dead: its kernels never run and Merge
// forwards the live side.
#[test]
fn dead_branch() {
    let harness = Harness::new();
    let mut g = Graph::new();
    let data = add_const_i64(&mut g, "s2_data", 3);
    let pred = g
        .add_node(
            NodeDef::new("s2_pred", "Const")
                .outputs(BOOL)
                .attr("value", const_value(Tensor::scalar_bool(false)).unwrap()),
        )
        .unwrap();
    let switch = g
        .add_node(
            NodeDef::new("s2_switch", "Switch")
                .inputs(&[DataType::Int64, DataType::Bool])
                .outputs(&[DataType::Int64, DataType::Int64]),
        )
        .unwrap();
    g.add_edge(data, 0, switch, 0).unwrap();
    g.add_edge(pred, 0, switch, 1).unwrap();

    // Output 0 is the false branch (live here), output 1 the true branch.
    let live = add_unary(&mut g, "s2_live", "TestCounting", switch, 0);
    let dead = add_unary(&mut g, "s2_dead", "TestCounting", switch, 1);
    let merge = g
        .add_node(
            NodeDef::new("s2_merge", "Merge")
                .inputs(&[DataType::Int64, DataType::Int64])
                .outputs(I64),
        )
        .unwrap();
    g.add_edge(live, 0, merge, 0).unwrap();
    g.add_edge(dead, 0, merge, 1).unwrap();
    add_retval(&mut g, "s2_ret", 0, merge);

    let executor = harness.executor(g);
    let frame = Arc::new(FunctionCallFrame::new(vec![], 1));
    let (status, done_calls) = harness.run(&executor, call_frame_args(&harness, &frame));
    assert!(status.is_ok(), "{status}");
    assert_eq!(done_calls, 1);
    assert_eq!(
        frame.consume_retvals().unwrap()[0].as_scalar_i64().unwrap(),
        3
    );
    assert_eq!(run_count("s2_live"), 1);
    assert_eq!(run_count("s2_dead"), 0);
}

// S3: `while i < 3: i = i + 1` with parallel_iterations = 2. The Exit
// yields 3 and the loop body ran exactly 3 times.
#[test]
fn while_loop() {
    let harness = Harness::new();
    let mut g = Graph::new();
    let i0 = add_arg(&mut g, "s3_i0", 0);
    let enter_i = add_enter(&mut g, "s3_enter_i", i0, false);
    let c3 = add_const_i64(&mut g, "s3_c3", 3);
    let enter_3 = add_enter(&mut g, "s3_enter_3", c3, true);
    let c1 = add_const_i64(&mut g, "s3_c1", 1);
    let enter_1 = add_enter(&mut g, "s3_enter_1", c1, true);

    let merge = g
        .add_node(
            NodeDef::new("s3_merge", "Merge")
                .inputs(&[DataType::Int64, DataType::Int64])
                .outputs(I64),
        )
        .unwrap();
    g.add_edge(enter_i, 0, merge, 0).unwrap();

    let less = g
        .add_node(
            NodeDef::new("s3_less", "Less")
                .inputs(&[DataType::Int64, DataType::Int64])
                .outputs(BOOL),
        )
        .unwrap();
    g.add_edge(merge, 0, less, 0).unwrap();
    g.add_edge(enter_3, 0, less, 1).unwrap();
    let cond = g
        .add_node(NodeDef::new("s3_cond", "LoopCond").inputs(BOOL).outputs(BOOL))
        .unwrap();
    g.add_edge(less, 0, cond, 0).unwrap();

    let switch = g
        .add_node(
            NodeDef::new("s3_switch", "Switch")
                .inputs(&[DataType::Int64, DataType::Bool])
                .outputs(&[DataType::Int64, DataType::Int64]),
        )
        .unwrap();
    g.add_edge(merge, 0, switch, 0).unwrap();
    g.add_edge(cond, 0, switch, 1).unwrap();

    // False branch exits the loop.
    let exit = g
        .add_node(NodeDef::new("s3_exit", "Exit").inputs(I64).outputs(I64))
        .unwrap();
    g.add_edge(switch, 0, exit, 0).unwrap();
    add_retval(&mut g, "s3_ret", 0, exit);

    // True branch: i + 1, counted, then around the back edge.
    let add = g
        .add_node(
            NodeDef::new("s3_add", "Add")
                .inputs(&[DataType::Int64, DataType::Int64])
                .outputs(I64),
        )
        .unwrap();
    g.add_edge(switch, 1, add, 0).unwrap();
    g.add_edge(enter_1, 0, add, 1).unwrap();
    let body = add_unary(&mut g, "s3_body", "TestCounting", add, 0);
    let next = g
        .add_node(
            NodeDef::new("s3_next", "NextIteration")
                .inputs(I64)
                .outputs(I64),
        )
        .unwrap();
    g.add_edge(body, 0, next, 0).unwrap();
    g.add_edge(next, 0, merge, 1).unwrap();

    let executor = harness.executor(g);
    let frame = Arc::new(FunctionCallFrame::new(vec![Tensor::scalar_i64(0)], 1));
    let (status, done_calls) = harness.run(&executor, call_frame_args(&harness, &frame));
    assert!(status.is_ok(), "{status}");
    assert_eq!(done_calls, 1);
    assert_eq!(
        frame.consume_retvals().unwrap()[0].as_scalar_i64().unwrap(),
        3
    );
    assert_eq!(run_count("s3_body"), 3);
}

// S4: an allocation beyond the resource quota surfaces as ResourceExhausted
// with the failed size recorded for the admission layer.
#[test]
fn allocator_exhaustion() {
    let harness = Harness::with_memory_limit(1 << 30);
    let ten_gib: usize = 10 << 30;
    let mut g = Graph::new();
    let c = add_const_i64(&mut g, "s4_c", 0);
    let big = g
        .add_node(
            NodeDef::new("s4_big", "TestBigAlloc")
                .inputs(I64)
                .outputs(&[DataType::Double])
                .attr("num_bytes", AttrValue::I(ten_gib as i64)),
        )
        .unwrap();
    g.add_edge(c, 0, big, 0).unwrap();

    let executor = harness.executor(g);
    let (status, done_calls) = harness.run(&executor, harness.args());
    assert_eq!(status.code(), Code::ResourceExhausted, "{status}");
    assert_eq!(done_calls, 1);
    assert_eq!(LAST_FAILED_ALLOC.load(Ordering::SeqCst), ten_gib);
}

// S5: cancelling mid-run: nodes dispatched after the trigger observe
// CANCELLED, the callback fires exactly once with Cancelled.
#[test]
fn cancellation_mid_run() {
    let harness = Harness::new();
    let mut g = Graph::new();
    let mut prev = add_arg(&mut g, "s5_a", 0);
    for i in 0..10 {
        prev = add_unary(&mut g, &format!("s5_pre{i}"), "Identity", prev, 0);
    }
    prev = add_unary(&mut g, "s5_cancel", "TestCancel", prev, 0);
    for i in 0..89 {
        prev = add_unary(&mut g, &format!("s5_post{i}"), "TestCounting", prev, 0);
    }
    add_retval(&mut g, "s5_ret", 0, prev);

    let executor = harness.executor(g);
    let mut args = call_frame_args(
        &harness,
        &Arc::new(FunctionCallFrame::new(vec![Tensor::scalar_i64(1)], 1)),
    );
    args.cancellation_manager = Some(Arc::new(CancellationManager::new()));
    let (status, done_calls) = harness.run(&executor, args);
    assert_eq!(status.code(), Code::Cancelled, "{status}");
    assert_eq!(done_calls, 1);
    // Everything after the trigger was refused at dispatch.
    assert_eq!(run_count("s5_post0"), 0);
}

// S6: an async kernel releases the worker and completes on the Runner; the
// value still arrives.
#[test]
fn async_kernel() {
    let harness = Harness::new();
    let mut g = Graph::new();
    let a = add_arg(&mut g, "s6_a", 0);
    let d = add_unary(&mut g, "s6_delay", "TestDelay", a, 0);
    add_retval(&mut g, "s6_ret", 0, d);

    let executor = harness.executor(g);
    let frame = Arc::new(FunctionCallFrame::new(vec![Tensor::scalar_i64(11)], 1));
    let start = Instant::now();
    let (status, done_calls) = harness.run(&executor, call_frame_args(&harness, &frame));
    assert!(status.is_ok(), "{status}");
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert_eq!(done_calls, 1);
    assert_eq!(
        frame.consume_retvals().unwrap()[0].as_scalar_i64().unwrap(),
        11
    );
}

// Exactly-once over arbitrary chain shapes: a random-length identity chain
// always reproduces its feed, and every node runs once.
#[test]
fn random_chain_matches_feed() {
    use rand::Rng;
    let harness = Harness::new();
    let mut rng = rand::thread_rng();
    for round in 0..3 {
        let len = rng.gen_range(5..40);
        let value = rng.gen_range(-1_000_i64..1_000);
        let mut g = Graph::new();
        let mut prev = add_arg(&mut g, &format!("rc{round}_a"), 0);
        for i in 0..len {
            prev = add_unary(&mut g, &format!("rc{round}_n{i}"), "TestCounting", prev, 0);
        }
        add_retval(&mut g, &format!("rc{round}_ret"), 0, prev);

        let executor = harness.executor(g);
        let frame = Arc::new(FunctionCallFrame::new(vec![Tensor::scalar_i64(value)], 1));
        let (status, done_calls) = harness.run(&executor, call_frame_args(&harness, &frame));
        assert!(status.is_ok(), "{status}");
        assert_eq!(done_calls, 1);
        assert_eq!(
            frame.consume_retvals().unwrap()[0].as_scalar_i64().unwrap(),
            value
        );
        for i in 0..len {
            assert_eq!(run_count(&format!("rc{round}_n{i}")), 1);
        }
    }
}

// Property 7: of two concurrent failures, the first one reported wins; the
// second is dropped.
#[test]
fn error_precedence() {
    let harness = Harness::new();
    let mut g = Graph::new();
    g.add_node(
        NodeDef::new("ep_first", "TestFail")
            .outputs(I64)
            .attr("message", AttrValue::S("first failure".to_owned())),
    )
    .unwrap();
    g.add_node(
        NodeDef::new("ep_second", "TestFail")
            .outputs(I64)
            .attr("message", AttrValue::S("second failure".to_owned()))
            .attr("delay_ms", AttrValue::I(150)),
    )
    .unwrap();

    let executor = harness.executor(g);
    let (status, done_calls) = harness.run(&executor, harness.args());
    assert_eq!(status.code(), Code::Internal);
    assert!(status.message().contains("first failure"), "{status}");
    assert_eq!(done_calls, 1);
}

// Deadness crosses devices: Send on CPU:0, Recv (async) feeding a retval on
// CPU:1.
#[test]
fn send_recv_across_devices() {
    let harness = Harness::new();
    let mut g = Graph::new();
    let a = add_arg(&mut g, "sr_a", 0);
    let send = g
        .add_node(
            NodeDef::new("sr_send", "_Send")
                .inputs(I64)
                .attr("tensor_name", AttrValue::S("x".to_owned()))
                .attr("send_device", AttrValue::S("CPU:0".to_owned()))
                .attr("recv_device", AttrValue::S("CPU:1".to_owned())),
        )
        .unwrap();
    g.add_edge(a, 0, send, 0).unwrap();
    let recv = g
        .add_node(
            NodeDef::new("sr_recv", "_Recv")
                .outputs(I64)
                .on_device("CPU:1")
                .attr("tensor_name", AttrValue::S("x".to_owned()))
                .attr("send_device", AttrValue::S("CPU:0".to_owned()))
                .attr("recv_device", AttrValue::S("CPU:1".to_owned())),
        )
        .unwrap();
    let ret = g
        .add_node(
            NodeDef::new("sr_ret", "_Retval")
                .inputs(I64)
                .on_device("CPU:1")
                .attr("index", AttrValue::I(0)),
        )
        .unwrap();
    g.add_edge(recv, 0, ret, 0).unwrap();

    let executor = harness.executor(g);
    let frame = Arc::new(FunctionCallFrame::new(vec![Tensor::scalar_i64(5)], 1));
    let (status, done_calls) = harness.run(&executor, call_frame_args(&harness, &frame));
    assert!(status.is_ok(), "{status}");
    assert_eq!(done_calls, 1);
    assert_eq!(
        frame.consume_retvals().unwrap()[0].as_scalar_i64().unwrap(),
        5
    );
}

// A failing node prevents successor activation and aborts the rendezvous, so
// a dependent recv does not hang.
#[test]
fn failure_aborts_rendezvous() {
    let harness = Harness::new();
    let mut g = Graph::new();
    let f = g
        .add_node(
            NodeDef::new("fr_fail", "TestFail")
                .outputs(I64)
                .attr("message", AttrValue::S("boom".to_owned())),
        )
        .unwrap();
    let send = g
        .add_node(
            NodeDef::new("fr_send", "_Send")
                .inputs(I64)
                .attr("tensor_name", AttrValue::S("y".to_owned()))
                .attr("send_device", AttrValue::S("CPU:0".to_owned()))
                .attr("recv_device", AttrValue::S("CPU:1".to_owned())),
        )
        .unwrap();
    g.add_edge(f, 0, send, 0).unwrap();
    g.add_node(
        NodeDef::new("fr_recv", "_Recv")
            .outputs(I64)
            .on_device("CPU:1")
            .attr("tensor_name", AttrValue::S("y".to_owned()))
            .attr("send_device", AttrValue::S("CPU:0".to_owned()))
            .attr("recv_device", AttrValue::S("CPU:1".to_owned())),
    )
    .unwrap();

    let executor = harness.executor(g);
    let (status, done_calls) = harness.run(&executor, harness.args());
    assert_eq!(status.code(), Code::Internal, "{status}");
    assert_eq!(done_calls, 1);
}

// Stats: control-flow nodes carry timeline labels, everything that ran is
// recorded under its device.
#[test]
fn stats_collection() {
    let harness = Harness::new();
    let mut g = Graph::new();
    let a = add_arg(&mut g, "st_a", 0);
    let b = add_unary(&mut g, "st_b", "Identity", a, 0);
    add_retval(&mut g, "st_ret", 0, b);

    let executor = harness.executor(g);
    let collector = Arc::new(StepStatsCollector::new());
    let mut args = call_frame_args(
        &harness,
        &Arc::new(FunctionCallFrame::new(vec![Tensor::scalar_i64(1)], 1)),
    );
    args.stats_collector = Some(collector.clone());
    let (status, _) = harness.run(&executor, args);
    assert!(status.is_ok(), "{status}");

    let stats = collector.step_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].device, "CPU:0");
    let names: Vec<_> = stats[0]
        .node_stats
        .iter()
        .map(|s| s.node_name.clone())
        .collect();
    assert!(names.contains(&"st_a".to_owned()));
    assert!(names.contains(&"st_b".to_owned()));
    assert!(names.contains(&"st_ret".to_owned()));
    for s in &stats[0].node_stats {
        assert!(s.all_end_rel_micros >= s.op_end_rel_micros);
        assert!(!s.memory.is_empty());
    }
}

// An unknown op is a NotFound at kernel setup, reported through the done
// callback rather than unwinding the scheduler.
#[test]
fn unknown_op_fails_cleanly() {
    let harness = Harness::new();
    let mut g = Graph::new();
    g.add_node(NodeDef::new("uo_x", "NoSuchOp").outputs(I64))
        .unwrap();
    let executor = harness.executor(g);
    let (status, done_calls) = harness.run(&executor, harness.args());
    assert_eq!(status.code(), Code::NotFound, "{status}");
    assert_eq!(done_calls, 1);
}

// An empty graph completes immediately with OK.
#[test]
fn empty_graph() {
    let harness = Harness::new();
    let executor = harness.executor(Graph::new());
    let (status, done_calls) = harness.run(&executor, harness.args());
    assert!(status.is_ok(), "{status}");
    assert_eq!(done_calls, 1);
}

// The borrowed Executor flavor: the scheduler runs on a runtime owned by the
// caller (here, tokio's test runtime).
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn borrowed_pool_runs_steps() {
    let _ = env_logger::builder().is_test(true).try_init();
    register_test_kernels();
    let pool = task_executor::Executor::new();
    let device_mgr = Arc::new(DeviceManager::new(vec![Arc::new(ThreadPoolDevice::new(0))]).unwrap());

    let mut g = Graph::new();
    let a = add_arg(&mut g, "bp_a", 0);
    let b = add_unary(&mut g, "bp_b", "Identity", a, 0);
    add_retval(&mut g, "bp_ret", 0, b);
    let executor = ExecutorImpl::new(
        MultiDeviceExecutorParams {
            device_mgr,
            resource_context: Arc::new(ResourceContext::unbounded()),
        },
        g,
    )
    .unwrap();

    let frame = Arc::new(FunctionCallFrame::new(vec![Tensor::scalar_i64(9)], 1));
    let (tx, rx) = crossbeam_channel::bounded(1);
    executor.run_async(
        Args {
            step_id: 1,
            rendezvous: Some(Arc::new(LocalRendezvous::new())),
            session_state: None,
            tensor_store: None,
            step_container: None,
            stats_collector: None,
            call_frame: Some(frame.clone()),
            cancellation_manager: None,
            runner: pool.runner(),
            sync_on_finish: true,
        },
        Box::new(move |status| tx.send(status).unwrap()),
    );
    let status = tokio::task::spawn_blocking(move || {
        rx.recv_timeout(Duration::from_secs(10)).unwrap()
    })
    .await
    .unwrap();
    assert!(status.is_ok(), "{status}");
    assert_eq!(
        frame.consume_retvals().unwrap()[0].as_scalar_i64().unwrap(),
        9
    );
}

fn graph_def_node(def: NodeDef, inputs: &[&str]) -> GraphDefNode {
    GraphDefNode {
        def,
        inputs: inputs.iter().map(|s| (*s).to_owned()).collect(),
    }
}

fn add_one_graph_def() -> GraphDef {
    GraphDef {
        nodes: vec![
            graph_def_node(
                NodeDef::new("x", "_Arg")
                    .outputs(I64)
                    .attr("index", AttrValue::I(0)),
                &[],
            ),
            graph_def_node(
                NodeDef::new("one", "Const")
                    .outputs(I64)
                    .attr("value", const_value(Tensor::scalar_i64(1)).unwrap()),
                &[],
            ),
            graph_def_node(
                NodeDef::new("sum", "Add")
                    .inputs(&[DataType::Int64, DataType::Int64])
                    .outputs(I64),
                &["x", "one"],
            ),
            graph_def_node(
                NodeDef::new("out", "_Retval")
                    .inputs(I64)
                    .attr("index", AttrValue::I(0)),
                &["sum"],
            ),
        ],
    }
}

fn envelope(kind: &str, payload: impl serde::Serialize) -> RequestEnvelope {
    RequestEnvelope {
        kind: kind.to_owned(),
        payload: serde_json::to_value(payload).unwrap(),
    }
}

fn dispatch(lib: &DataflowOpLibrary, env: RequestEnvelope) -> Result<serde_json::Value, Status> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    lib.on_custom(env, Box::new(move |r| tx.send(r).unwrap()));
    rx.recv_timeout(Duration::from_secs(10)).unwrap()
}

fn session_library(harness: &Harness) -> DataflowOpLibrary {
    DataflowOpLibrary::new(Arc::new(SessionMgr::new(
        harness.device_mgr.clone(),
        harness.resource_context.clone(),
        harness.pool.clone(),
    )))
}

// The dispatch layer: create a session, run a step, fetch the result.
#[test]
fn dispatch_run_step() {
    let harness = Harness::new();
    let lib = session_library(&harness);

    let created = dispatch(
        &lib,
        envelope(
            "dataflow.CreateSessionRequest",
            serde_json::json!({ "graph": add_one_graph_def() }),
        ),
    )
    .unwrap();
    let handle = created["session_handle"].as_str().unwrap().to_owned();

    let response = dispatch(
        &lib,
        envelope(
            "dataflow.RunStepRequest",
            RunStepRequest {
                session_handle: handle.clone(),
                partial_run_handle: None,
                feeds: vec![NamedTensor {
                    name: "x".to_owned(),
                    tensor: TensorDef::from_tensor(&Tensor::scalar_i64(41)).unwrap(),
                }],
                fetches: vec!["out".to_owned()],
                collect_stats: false,
            },
        ),
    )
    .unwrap();
    let response: RunStepResponse = serde_json::from_value(response).unwrap();
    assert_eq!(response.tensors.len(), 1);
    assert_eq!(
        response.tensors[0].tensor.to_tensor().unwrap().as_scalar_i64().unwrap(),
        42
    );

    dispatch(
        &lib,
        envelope(
            "dataflow.CloseSessionRequest",
            serde_json::json!({ "session_handle": handle }),
        ),
    )
    .unwrap();
}

#[test]
fn dispatch_unknown_kind_and_stubs() {
    let harness = Harness::new();
    let lib = session_library(&harness);

    let err = dispatch(&lib, envelope("dataflow.BogusRequest", serde_json::json!({})))
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    // The onRunGraph / onRun entry points are surfaced as not implemented.
    let (tx, rx) = crossbeam_channel::bounded(1);
    lib.on_run_graph(
        envelope("dataflow.RunGraphRequest", serde_json::json!({})),
        Box::new(move |r| tx.send(r).unwrap()),
    );
    assert_eq!(rx.recv().unwrap().unwrap_err().code(), Code::Unimplemented);

    let (tx, rx) = crossbeam_channel::bounded(1);
    lib.on_run(
        envelope("dataflow.RunRequest", serde_json::json!({})),
        Box::new(move |r| tx.send(r).unwrap()),
    );
    assert_eq!(rx.recv().unwrap().unwrap_err().code(), Code::Unimplemented);
}

#[test]
fn dispatch_list_devices_and_partial_run() {
    let harness = Harness::new();
    let lib = session_library(&harness);

    let devices = dispatch(
        &lib,
        envelope("dataflow.ListDevicesRequest", serde_json::json!({})),
    )
    .unwrap();
    assert_eq!(
        devices["devices"],
        serde_json::json!(["CPU:0", "CPU:1"])
    );

    let created = dispatch(
        &lib,
        envelope(
            "dataflow.CreateSessionRequest",
            serde_json::json!({ "graph": add_one_graph_def() }),
        ),
    )
    .unwrap();
    let handle = created["session_handle"].as_str().unwrap().to_owned();

    let setup = dispatch(
        &lib,
        envelope(
            "dataflow.PartialRunSetupRequest",
            serde_json::json!({
                "session_handle": handle,
                "feeds": ["x"],
                "fetches": ["out"],
            }),
        ),
    )
    .unwrap();
    let partial = setup["partial_run_handle"].as_str().unwrap().to_owned();

    let err = dispatch(
        &lib,
        envelope(
            "dataflow.RunStepRequest",
            RunStepRequest {
                session_handle: handle,
                partial_run_handle: Some(partial),
                feeds: vec![],
                fetches: vec!["out".to_owned()],
                collect_stats: false,
            },
        ),
    )
    .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);
}
