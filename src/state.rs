// Copyright 2019 Loom project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use devices::{Device, DeviceContext, DeviceManager, DeviceSpec, PerOpAllocator, ResourceContext};
use fnv::FnvHashMap as HashMap;
use graph::pending_counts::NodeState;
use graph::{ControlFlowInfo, FrameInfo, FrameInfoMap, Graph, GraphView, NodeId, NodeItem};
use parking_lot::Mutex;
use status::{Result, Status};
use task_executor::Runner;
use tensor::{AllocatorAttributes, Tensor};

use crate::cancellation::CancellationManager;
use crate::entry::{Entry, EntryValue};
use crate::frame::{FrameState, TaggedNode, TaggedNodeSeq};
use crate::kernel::{self, FunctionLibraryRuntime, OpKernel, OpKernelContext};
use crate::rendezvous::Rendezvous;
use crate::session::{FunctionCallFrame, ScopedStepContainer, SessionState, TensorStore};
use crate::stats::{nodestats, NodeExecStats, StepStatsCollector};

pub type DoneCallback = Box<dyn FnOnce(Status) + Send + 'static>;

///
/// Per-invocation parameters, borrowed from the caller for the lifetime of
/// the invocation.
///
pub struct Args {
    pub step_id: u64,
    pub rendezvous: Option<Arc<dyn Rendezvous>>,
    pub session_state: Option<Arc<SessionState>>,
    pub tensor_store: Option<Arc<TensorStore>>,
    pub step_container: Option<Arc<ScopedStepContainer>>,
    pub stats_collector: Option<Arc<StepStatsCollector>>,
    pub call_frame: Option<Arc<FunctionCallFrame>>,
    pub cancellation_manager: Option<Arc<CancellationManager>>,
    pub runner: Runner,
    /// Wait for every used device to drain before reporting completion.
    pub sync_on_finish: bool,
}

pub struct MultiDeviceExecutorParams {
    pub device_mgr: Arc<DeviceManager>,
    pub resource_context: Arc<ResourceContext>,
}

///
/// The immutable half of an executor: the flattened graph, the per-frame
/// static info, and the kernel cache. Shared by every concurrent invocation
/// of the same graph.
///
pub struct ExecutorImpl {
    params: MultiDeviceExecutorParams,
    graph: Graph,
    gview: GraphView,
    frame_infos: FrameInfoMap,
    root_nodes: Vec<NodeId>,
    kernel_cache: Mutex<HashMap<(String, NodeId), Arc<dyn OpKernel>>>,
    /// Frame info for graphs whose root frame has no nodes.
    empty_frame_info: FrameInfo,
}

impl ExecutorImpl {
    pub fn new(params: MultiDeviceExecutorParams, graph: Graph) -> Result<Arc<ExecutorImpl>> {
        graph.validate()?;
        let cf = ControlFlowInfo::build(&graph)?;
        let mut frame_infos = FrameInfoMap::default();
        let registry = kernel::global_registry();
        let gview = GraphView::build(&graph, &cf, &mut frame_infos, &|def| {
            registry.is_expensive(&def.op)
        })?;
        let root_nodes = graph.root_nodes();
        Ok(Arc::new(ExecutorImpl {
            params,
            graph,
            gview,
            frame_infos,
            root_nodes,
            kernel_cache: Mutex::new(HashMap::default()),
            empty_frame_info: FrameInfo::default(),
        }))
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn gview(&self) -> &GraphView {
        &self.gview
    }

    fn frame_info(&self, name: &str) -> &FrameInfo {
        self.frame_infos.get(name).unwrap_or(&self.empty_frame_info)
    }

    ///
    /// Runs the graph once. `done` is invoked exactly once, on a Runner
    /// thread, with the first error (or OK).
    ///
    pub fn run_async(self: &Arc<Self>, args: Args, done: DoneCallback) {
        let state = ExecutorState::new(self.clone(), args, done);
        state.run();
    }
}

struct DeviceItem {
    device: Arc<dyn Device>,
    fruntime: Arc<FunctionLibraryRuntime>,
}

struct StateInner {
    status: Status,
    /// Key: dynamic frame name. A new frame is created at some iteration of
    /// an active frame, so the key combines the parent name, the parent
    /// iteration, and the Enter node's frame_name attr.
    outstanding_frames: HashMap<String, Arc<FrameState>>,
    device_context_maps: HashMap<String, Vec<Option<Arc<dyn DeviceContext>>>>,
    fruntimes: HashMap<String, Arc<FunctionLibraryRuntime>>,
    used_devices: Vec<Arc<dyn Device>>,
    dumped_on_error: bool,
}

///
/// The state of one invocation: dispatches nodes as they become ready and
/// tracks how many of each node's predecessors have not completed.
///
/// Lock ordering: `inner` here is acquired before any `FrameState::inner`;
/// no path takes this lock while holding a frame lock.
///
pub(crate) struct ExecutorState {
    step_id: u64,
    rendezvous: Option<Arc<dyn Rendezvous>>,
    session_state: Option<Arc<SessionState>>,
    tensor_store: Option<Arc<TensorStore>>,
    step_container: Option<Arc<ScopedStepContainer>>,
    stats_collector: Option<Arc<StepStatsCollector>>,
    call_frame: Option<Arc<FunctionCallFrame>>,
    cancellation_manager: Option<Arc<CancellationManager>>,
    runner: Runner,
    sync_on_finish: bool,

    impl_: Arc<ExecutorImpl>,
    root_frame: Arc<FrameState>,
    done_cb: Mutex<Option<DoneCallback>>,
    num_outstanding_ops: AtomicUsize,
    inner: Mutex<StateInner>,
}

impl ExecutorState {
    fn new(impl_: Arc<ExecutorImpl>, args: Args, done: DoneCallback) -> Arc<ExecutorState> {
        let root_frame = Arc::new(FrameState::new(
            String::new(),
            1,
            None,
            -1,
            impl_.frame_info(""),
        ));
        let mut outstanding_frames = HashMap::default();
        outstanding_frames.insert(String::new(), root_frame.clone());
        Arc::new(ExecutorState {
            step_id: args.step_id,
            rendezvous: args.rendezvous,
            session_state: args.session_state,
            tensor_store: args.tensor_store,
            step_container: args.step_container,
            stats_collector: args.stats_collector,
            call_frame: args.call_frame,
            cancellation_manager: args.cancellation_manager,
            runner: args.runner,
            sync_on_finish: args.sync_on_finish,
            impl_,
            root_frame,
            done_cb: Mutex::new(Some(done)),
            num_outstanding_ops: AtomicUsize::new(0),
            inner: Mutex::new(StateInner {
                status: Status::ok(),
                outstanding_frames,
                device_context_maps: HashMap::default(),
                fruntimes: HashMap::default(),
                used_devices: Vec::new(),
                dumped_on_error: false,
            }),
        })
    }

    fn run(self: Arc<Self>) {
        let ready: TaggedNodeSeq = self
            .impl_
            .root_nodes
            .iter()
            .map(|&node| TaggedNode {
                node,
                frame: self.root_frame.clone(),
                iter: 0,
                is_dead: false,
            })
            .collect();
        if ready.is_empty() {
            self.finish();
            return;
        }
        log::trace!(
            "step {}: seeding {} root nodes",
            self.step_id,
            ready.len()
        );
        self.root_frame.inner.lock().iteration_mut(0).outstanding_ops = ready.len();
        self.num_outstanding_ops.store(ready.len(), Ordering::SeqCst);
        self.schedule_ready(ready, None);
    }

    ///
    /// Runs one ready node, then any cheap nodes it made ready, inline.
    /// Expensive newly-ready nodes go back through the Runner.
    ///
    fn process(self: &Arc<Self>, tagged: TaggedNode, scheduled_usec: i64) {
        let gview = self.impl_.gview();
        let mut inline_ready: VecDeque<TaggedNode> = VecDeque::new();
        inline_ready.push_back(tagged);
        let mut completed = false;

        while let Some(tagged) = inline_ready.pop_front() {
            let item = gview.node(tagged.node);
            log::trace!(
                "step {}: process `{}` ({}) frame `{}` iter {} dead {}",
                self.step_id,
                item.name,
                item.op,
                tagged.frame.frame_name,
                tagged.iter,
                tagged.is_dead
            );
            {
                let mut frame_inner = tagged.frame.inner.lock();
                frame_inner
                    .iteration_mut(tagged.iter)
                    .mark_started(item.pending_handle);
            }

            let mut stats = self
                .stats_collector
                .as_ref()
                .map(|_| NodeExecStats::new(&item.name));
            nodestats::set_scheduled(&mut stats, scheduled_usec);
            nodestats::set_all_start(&mut stats);

            // Cancellation is observed at dispatch; in-flight kernels drain.
            if self
                .cancellation_manager
                .as_ref()
                .map(|cm| cm.is_cancelled())
                .unwrap_or(false)
            {
                self.maybe_mark_completed(&tagged, item);
                completed = self.node_done(
                    Status::cancelled(format!("step {} was cancelled", self.step_id)),
                    &tagged,
                    item,
                    Vec::new(),
                    stats,
                    Some(&mut inline_ready),
                );
                continue;
            }

            // A dead node only runs if it is a transfer node: deadness must
            // cross device boundaries through Send/Recv.
            if tagged.is_dead && !item.is_transfer {
                // Still take (and drop) the inputs: a node is dead if any
                // input is, and the rest may hold live tensors.
                drop(self.take_inputs(&tagged, item));
                let outputs = vec![Entry::default(); item.num_outputs];
                self.maybe_mark_completed(&tagged, item);
                let mut ready = TaggedNodeSeq::new();
                self.propagate_outputs(&tagged, item, outputs, &mut ready);
                completed =
                    self.node_done(Status::ok(), &tagged, item, ready, stats, Some(&mut inline_ready));
                continue;
            }

            let ditem = match self.lookup_device(item) {
                Ok(d) => d,
                Err(e) => {
                    self.maybe_mark_completed(&tagged, item);
                    completed =
                        self.node_done(e, &tagged, item, Vec::new(), stats, Some(&mut inline_ready));
                    continue;
                }
            };
            let kernel = match self.setup_kernel(item, &ditem) {
                Ok(k) => k,
                Err(e) => {
                    self.maybe_mark_completed(&tagged, item);
                    completed =
                        self.node_done(e, &tagged, item, Vec::new(), stats, Some(&mut inline_ready));
                    continue;
                }
            };

            let taken = self.take_inputs(&tagged, item);
            let prepared = match self.prepare_inputs(item, taken) {
                Ok(p) => p,
                Err(e) => {
                    self.maybe_mark_completed(&tagged, item);
                    completed =
                        self.node_done(e, &tagged, item, Vec::new(), stats, Some(&mut inline_ready));
                    continue;
                }
            };
            let (inputs, input_alloc_attrs, input_device_contexts, is_input_dead) = prepared;

            let allocator = Arc::new(PerOpAllocator::new(
                self.impl_.params.resource_context.clone(),
                ditem.device.allocator(AllocatorAttributes::default()),
            ));
            let mut ctx = OpKernelContext {
                step_id: self.step_id,
                node_name: item.name.clone(),
                op: item.op.clone(),
                inputs,
                input_alloc_attrs,
                input_device_contexts,
                is_input_dead,
                device: ditem.device.clone(),
                op_device_context: self.find_device_context(item, &ditem.device),
                allocator,
                rendezvous: self.rendezvous.clone(),
                session_state: self.session_state.clone(),
                tensor_store: self.tensor_store.clone(),
                step_container: self.step_container.clone(),
                call_frame: self.call_frame.clone(),
                cancellation_manager: self.cancellation_manager.clone(),
                frame_id: tagged.frame.frame_id,
                iter: tagged.iter,
                outputs: vec![None; item.num_outputs],
                status: Status::ok(),
                stats,
            };

            if let Some(async_kernel) = kernel.as_async() {
                // Hand the context to the kernel; its continuation re-enters
                // the scheduler on a Runner thread. The frame lock is not
                // captured.
                nodestats::set_op_start(&mut ctx.stats);
                let this = self.clone();
                let runner = self.runner.clone();
                let tagged = tagged.clone();
                async_kernel.compute_async(
                    ctx,
                    Box::new(move |ctx| {
                        let this2 = this.clone();
                        runner(Box::new(move || this2.async_done(tagged, ctx)));
                    }),
                );
                continue;
            }

            nodestats::set_op_start(&mut ctx.stats);
            let compute_result = kernel.compute(&mut ctx);
            nodestats::set_op_end(&mut ctx.stats);

            let (status, outputs, stats) = self.conclude_compute(item, ctx, compute_result);
            self.maybe_mark_completed(&tagged, item);
            let mut ready = TaggedNodeSeq::new();
            let status = if status.is_ok() {
                self.propagate_outputs(&tagged, item, outputs, &mut ready);
                Status::ok()
            } else {
                status
            };
            completed = self.node_done(status, &tagged, item, ready, stats, Some(&mut inline_ready));
        }

        if completed {
            self.finish();
        }
    }

    /// Continuation of an asynchronous kernel, run on a Runner thread.
    fn async_done(self: &Arc<Self>, tagged: TaggedNode, mut ctx: OpKernelContext) {
        let item = self.impl_.gview().node(tagged.node);
        nodestats::set_op_end(&mut ctx.stats);
        let status = ctx.status.clone();
        let (status, outputs, stats) = self.conclude_compute(
            item,
            ctx,
            if status.is_ok() { Ok(()) } else { Err(status) },
        );
        self.maybe_mark_completed(&tagged, item);
        let mut ready = TaggedNodeSeq::new();
        let status = if status.is_ok() {
            self.propagate_outputs(&tagged, item, outputs, &mut ready);
            Status::ok()
        } else {
            status
        };
        let completed = self.node_done(status, &tagged, item, ready, stats, None);
        if completed {
            self.finish();
        }
    }

    ///
    /// Folds the kernel's reported status with output validation, producing
    /// the entries to propagate and the finalized stats.
    ///
    fn conclude_compute(
        &self,
        item: &NodeItem,
        mut ctx: OpKernelContext,
        compute_result: Result<()>,
    ) -> (Status, Vec<Entry>, Option<NodeExecStats>) {
        let mut status = match compute_result {
            Ok(()) => ctx.status.clone(),
            Err(e) => e,
        };
        let mut outputs = Vec::new();
        if status.is_ok() {
            if let Err(e) = self.process_outputs(item, &mut ctx, &mut outputs) {
                status = e;
            }
        }
        nodestats::set_memory(&mut ctx.stats, &ctx.allocator);
        (status, outputs, ctx.stats.take())
    }

    ///
    /// Moves this node's input entries out of the iteration. The write-once/
    /// take-once slot contract makes the brief frame lock the only
    /// synchronization needed.
    ///
    fn take_inputs(&self, tagged: &TaggedNode, item: &NodeItem) -> Vec<Entry> {
        let mut frame_inner = tagged.frame.inner.lock();
        let iter_state = frame_inner.iteration_mut(tagged.iter);
        (0..item.num_inputs)
            .map(|i| std::mem::take(&mut iter_state.input_tensors[item.input_start + i]))
            .collect()
    }

    ///
    /// Materializes kernel inputs. Only Merge and transfer nodes may see
    /// missing values; reference entries are dereferenced under their mutex.
    ///
    fn prepare_inputs(
        &self,
        item: &NodeItem,
        entries: Vec<Entry>,
    ) -> Result<(
        Vec<Option<Tensor>>,
        Vec<AllocatorAttributes>,
        Vec<Option<Arc<dyn DeviceContext>>>,
        bool,
    )> {
        let mut inputs = Vec::with_capacity(entries.len());
        let mut alloc_attrs = Vec::with_capacity(entries.len());
        let mut device_contexts = Vec::with_capacity(entries.len());
        let mut is_input_dead = false;
        for (i, entry) in entries.into_iter().enumerate() {
            alloc_attrs.push(entry.alloc_attr);
            device_contexts.push(entry.device_context.clone());
            let tensor = match entry.value {
                EntryValue::Empty => {
                    if item.is_merge {
                        inputs.push(None);
                    } else if item.is_transfer {
                        inputs.push(None);
                        is_input_dead = true;
                    } else {
                        return Err(Status::internal(format!(
                            "input {i} of `{}` has no value",
                            item.name
                        )));
                    }
                    continue;
                }
                EntryValue::Val(t) => t,
                EntryValue::Ref(r) => r.lock().clone(),
            };
            if tensor.dtype() != item.input_type(i) {
                return Err(Status::invalid_argument(format!(
                    "input {i} of `{}` is {} but the op expects {}",
                    item.name,
                    tensor.dtype(),
                    item.input_type(i)
                )));
            }
            inputs.push(Some(tensor));
        }
        Ok((inputs, alloc_attrs, device_contexts, is_input_dead))
    }

    ///
    /// Validates the kernel's outputs and shapes them into entries. Only
    /// Switch and Recv may leave outputs unset (the unset side is dead).
    ///
    fn process_outputs(
        &self,
        item: &NodeItem,
        ctx: &mut OpKernelContext,
        outputs: &mut Vec<Entry>,
    ) -> Result<()> {
        outputs.clear();
        outputs.reserve(item.num_outputs);
        for i in 0..item.num_outputs {
            match ctx.outputs[i].take() {
                None => {
                    if !item.is_switch && !item.is_recv {
                        return Err(Status::internal(format!(
                            "missing output {i} of `{}`",
                            item.name
                        )));
                    }
                    outputs.push(Entry::default());
                }
                Some(t) => {
                    if t.dtype() != item.output_type(i) {
                        return Err(Status::invalid_argument(format!(
                            "output {i} of `{}` is {} but the graph declares {}",
                            item.name,
                            t.dtype(),
                            item.output_type(i)
                        )));
                    }
                    nodestats::set_output(&mut ctx.stats, i, &t);
                    outputs.push(Entry {
                        value: EntryValue::Val(t),
                        alloc_attr: AllocatorAttributes::default(),
                        device_context: ctx.op_device_context.clone(),
                        producer_device: Some(ctx.device.name().to_owned()),
                    });
                }
            }
        }
        Ok(())
    }

    ///
    /// Routes outputs to their destination (frame, iteration), handling
    /// Enter/Exit/NextIteration specially, and cascades frame cleanup when
    /// this node's completion finishes a frame.
    ///
    fn propagate_outputs(
        &self,
        tagged: &TaggedNode,
        item: &NodeItem,
        outputs: Vec<Entry>,
        ready: &mut TaggedNodeSeq,
    ) {
        let gview = self.impl_.gview();
        let input_frame = &tagged.frame;
        let input_iter = tagged.iter;
        let is_dead = tagged.is_dead;

        let is_frame_done;
        if let Some(enter) = &item.enter {
            let child = self.find_or_create_child_frame(input_frame, input_iter, item);
            {
                let mut child_inner = child.inner.lock();
                if enter.is_constant {
                    // A loop invariant: make it visible to all iterations.
                    child.add_loop_inv_locked(
                        &mut child_inner,
                        gview,
                        item,
                        outputs.into_iter().next().unwrap_or_default(),
                        ready,
                    );
                } else {
                    child.activate_nodes_locked(
                        &mut child_inner,
                        gview,
                        item,
                        is_dead,
                        0,
                        &outputs,
                        ready,
                    );
                }
                child_inner.num_pending_inputs -= 1;
            }
            let mut inner = input_frame.inner.lock();
            is_frame_done = input_frame.decrement_outstanding_ops_locked(
                &mut inner,
                gview,
                input_iter,
                ready,
            );
        } else if item.is_exit {
            if is_dead {
                let mut inner = input_frame.inner.lock();
                // Remember this node only for the current highest iteration;
                // dead exits fire only for the final iteration, at frame
                // deletion.
                if input_iter == inner.iteration_count {
                    inner.dead_exits.push(item.id);
                }
                is_frame_done = input_frame.decrement_outstanding_ops_locked(
                    &mut inner,
                    gview,
                    input_iter,
                    ready,
                );
            } else {
                let parent = input_frame
                    .parent()
                    .expect("Exit outside a frame was rejected at graph build");
                let parent_iter = input_frame.parent_iter;
                {
                    let mut parent_inner = parent.inner.lock();
                    parent.activate_nodes_locked(
                        &mut parent_inner,
                        gview,
                        item,
                        is_dead,
                        parent_iter,
                        &outputs,
                        ready,
                    );
                }
                let mut inner = input_frame.inner.lock();
                is_frame_done = input_frame.decrement_outstanding_ops_locked(
                    &mut inner,
                    gview,
                    input_iter,
                    ready,
                );
            }
        } else if item.is_next_iteration {
            let mut inner = input_frame.inner.lock();
            let output_iter = if is_dead {
                // Deadness stops at the back edge.
                None
            } else if input_iter == inner.iteration_count {
                if inner.num_outstanding_iterations == input_frame.max_parallel_iterations {
                    // The ring is full; defer until an iteration retires.
                    inner
                        .next_iter_roots
                        .push((item.id, outputs.first().cloned().unwrap_or_default()));
                    None
                } else {
                    input_frame.increment_iteration_locked(&mut inner, gview, ready);
                    Some(input_iter + 1)
                }
            } else {
                Some(input_iter + 1)
            };
            if let Some(output_iter) = output_iter {
                input_frame.activate_nodes_locked(
                    &mut inner,
                    gview,
                    item,
                    is_dead,
                    output_iter,
                    &outputs,
                    ready,
                );
            }
            is_frame_done = input_frame.decrement_outstanding_ops_locked(
                &mut inner,
                gview,
                input_iter,
                ready,
            );
        } else {
            let mut inner = input_frame.inner.lock();
            input_frame.activate_nodes_locked(
                &mut inner,
                gview,
                item,
                is_dead,
                input_iter,
                &outputs,
                ready,
            );
            is_frame_done = input_frame.decrement_outstanding_ops_locked(
                &mut inner,
                gview,
                input_iter,
                ready,
            );
        }

        if is_frame_done {
            let parent = input_frame.parent();
            let parent_iter = input_frame.parent_iter;
            self.delete_frame(input_frame, ready);
            if let Some(parent) = parent {
                // The completion of this frame may make a parent iteration
                // done.
                self.cleanup_frames_iterations(parent, parent_iter, ready);
            }
        }
    }

    fn make_frame_name(frame: &FrameState, iter: i64, attr_name: &str) -> String {
        format!("{};{};{}", frame.frame_name, iter, attr_name)
    }

    fn find_or_create_child_frame(
        &self,
        frame: &Arc<FrameState>,
        iter: i64,
        item: &NodeItem,
    ) -> Arc<FrameState> {
        let enter = item.enter.as_ref().expect("caller checked is_enter");
        let child_name = Self::make_frame_name(frame, iter, &enter.frame_name);
        {
            let inner = self.inner.lock();
            if let Some(child) = inner.outstanding_frames.get(&child_name) {
                return child.clone();
            }
        }

        // Construct the frame outside of any lock, then race to publish it.
        let finfo = self.impl_.frame_info(&enter.frame_name);
        let child = Arc::new(FrameState::new(
            child_name.clone(),
            enter.parallel_iterations,
            Some(Arc::downgrade(frame)),
            iter,
            finfo,
        ));
        log::trace!("step {}: created frame `{child_name}`", self.step_id);

        let mut inner = self.inner.lock();
        if let Some(existing) = inner.outstanding_frames.get(&child_name) {
            return existing.clone();
        }
        frame.inner.lock().iteration_mut(iter).outstanding_frame_count += 1;
        inner.outstanding_frames.insert(child_name, child.clone());
        child
    }

    ///
    /// Fires the recorded dead exits of a completed frame into its parent,
    /// then drops the frame.
    ///
    fn delete_frame(&self, frame: &Arc<FrameState>, ready: &mut TaggedNodeSeq) {
        let gview = self.impl_.gview();
        let dead_exits = std::mem::take(&mut frame.inner.lock().dead_exits);
        if let Some(parent) = frame.parent() {
            let parent_iter = frame.parent_iter;
            let mut parent_inner = parent.inner.lock();
            let iter_state = parent_inner.iteration_mut(parent_iter);
            for node in dead_exits {
                for e in &gview.node(node).out_edges {
                    let dst_item = gview.node(e.dst);
                    let h = dst_item.pending_handle;
                    let mut dst_dead = true;
                    let dst_ready;
                    if dst_item.is_merge {
                        if e.is_control {
                            iter_state.decrement_pending(h, 2);
                            let count = iter_state.pending(h);
                            let dead_cnt = iter_state.dead_count(h);
                            dst_dead = dead_cnt == dst_item.num_inputs;
                            dst_ready = count == 0 || (count == 1 && dst_dead);
                        } else {
                            iter_state.increment_dead_count(h);
                            let dead_cnt = iter_state.dead_count(h);
                            dst_dead = dead_cnt == dst_item.num_inputs;
                            dst_ready = iter_state.pending(h) == 1 && dst_dead;
                        }
                    } else {
                        iter_state.increment_dead_count(h);
                        dst_ready = iter_state.decrement_pending(h, 1) == 0;
                    }
                    if dst_ready {
                        ready.push(TaggedNode {
                            node: e.dst,
                            frame: parent.clone(),
                            iter: parent_iter,
                            is_dead: dst_dead,
                        });
                        iter_state.outstanding_ops += 1;
                    }
                }
            }
        }
        log::trace!("step {}: deleting frame `{}`", self.step_id, frame.frame_name);
        self.inner.lock().outstanding_frames.remove(&frame.frame_name);
    }

    ///
    /// A child frame at (frame, iter) completed: retire done iterations and
    /// walk completion up the frame chain.
    ///
    fn cleanup_frames_iterations(
        &self,
        frame: Arc<FrameState>,
        iter: i64,
        ready: &mut TaggedNodeSeq,
    ) {
        let gview = self.impl_.gview();
        let mut frame = frame;
        let mut iter = iter;
        loop {
            let is_frame_done = {
                let mut inner = frame.inner.lock();
                inner.iteration_mut(iter).outstanding_frame_count -= 1;
                frame.cleanup_iterations_locked(&mut inner, gview, iter, ready)
            };
            if !is_frame_done {
                break;
            }
            let parent = frame.parent();
            let parent_iter = frame.parent_iter;
            self.delete_frame(&frame, ready);
            match parent {
                Some(p) => {
                    frame = p;
                    iter = parent_iter;
                }
                None => break,
            }
        }
    }

    ///
    /// Completion bookkeeping for one node: record the first error, abort
    /// collaborators on it, update the outstanding-op count, and dispatch
    /// the newly ready nodes.
    ///
    fn node_done(
        self: &Arc<Self>,
        s: Status,
        tagged: &TaggedNode,
        item: &NodeItem,
        ready: TaggedNodeSeq,
        mut stats: Option<NodeExecStats>,
        inline_ready: Option<&mut VecDeque<TaggedNode>>,
    ) -> bool {
        nodestats::set_all_end(&mut stats);
        if let Some(collector) = &self.stats_collector {
            nodestats::set_timeline_label(
                &mut stats,
                &item.op,
                &item.name,
                &item.frame_name,
                tagged.iter,
            );
            if let Some(stats) = stats.take() {
                collector.save(&item.device, stats);
            }
        }

        let mut abort_run = false;
        if !s.is_ok() {
            let mut inner = self.inner.lock();
            if inner.status.is_ok() {
                abort_run = true;
                inner.status = s.clone();
            } else {
                log::warn!(
                    "step {}: dropping error from `{}` because an earlier error is being reported: {s}",
                    self.step_id,
                    item.name
                );
            }
        }
        if abort_run {
            log::error!("step {}: node `{}` failed: {s}", self.step_id, item.name);
            self.dump_state();
            if let Some(rendezvous) = &self.rendezvous {
                rendezvous.start_abort(s.clone());
            }
            if let Some(cm) = &self.cancellation_manager {
                cm.start_cancel();
            }
        }

        let completed;
        let ready_size = ready.len();
        if ready_size == 0 || !s.is_ok() {
            completed = self.num_outstanding_ops.fetch_sub(1, Ordering::SeqCst) == 1;
        } else {
            // This node is replaced by the first ready node; account for the
            // rest.
            if ready_size > 1 {
                self.num_outstanding_ops
                    .fetch_add(ready_size - 1, Ordering::Relaxed);
            }
            completed = false;
        }
        if s.is_ok() {
            self.schedule_ready(ready, inline_ready);
        }
        completed
    }

    ///
    /// Expensive nodes go to the Runner; cheap (or dead) nodes run inline on
    /// the current worker. At the top level (no inline queue) everything goes
    /// to the Runner.
    ///
    fn schedule_ready(
        self: &Arc<Self>,
        ready: TaggedNodeSeq,
        inline_ready: Option<&mut VecDeque<TaggedNode>>,
    ) {
        if ready.is_empty() {
            return;
        }
        let scheduled_usec = if self.stats_collector.is_some() {
            nodestats::now_in_usec()
        } else {
            0
        };
        let inline_ready = match inline_ready {
            None => {
                for tagged in ready {
                    let this = self.clone();
                    (self.runner)(Box::new(move || this.process(tagged, scheduled_usec)));
                }
                return;
            }
            Some(q) => q,
        };
        let gview = self.impl_.gview();
        let mut curr_expensive: Option<TaggedNode> = None;
        for tagged in ready {
            let item = gview.node(tagged.node);
            if tagged.is_dead || !item.expensive {
                inline_ready.push_back(tagged);
            } else if let Some(prev) = curr_expensive.replace(tagged) {
                // There is already plenty for this thread to do: hand the
                // previous expensive node to another worker.
                let this = self.clone();
                (self.runner)(Box::new(move || this.process(prev, scheduled_usec)));
            }
        }
        if let Some(last) = curr_expensive {
            if inline_ready.is_empty() {
                // Tail recursion optimization.
                inline_ready.push_back(last);
            } else {
                let this = self.clone();
                (self.runner)(Box::new(move || this.process(last, scheduled_usec)));
            }
        }
    }

    fn maybe_mark_completed(&self, tagged: &TaggedNode, item: &NodeItem) {
        let mut frame_inner = tagged.frame.inner.lock();
        frame_inner
            .iteration_mut(tagged.iter)
            .mark_completed(item.pending_handle);
    }

    fn lookup_device(&self, item: &NodeItem) -> Result<DeviceItem> {
        let spec: DeviceSpec = item.device.parse()?;
        let device = self.impl_.params.device_mgr.lookup_spec(&spec)?;
        let mut inner = self.inner.lock();
        if !inner.used_devices.iter().any(|d| d.name() == device.name()) {
            let context_map = device.fill_context_map(self.impl_.graph().num_node_ids())?;
            inner
                .device_context_maps
                .insert(device.name().to_owned(), context_map);
            inner.used_devices.push(device.clone());
        }
        let fruntime = inner
            .fruntimes
            .entry(device.name().to_owned())
            .or_insert_with(|| Arc::new(FunctionLibraryRuntime::new(device.clone())))
            .clone();
        Ok(DeviceItem { device, fruntime })
    }

    /// The device context assigned to this node at step start, or None for
    /// devices that do not use contexts.
    fn find_device_context(
        &self,
        item: &NodeItem,
        device: &Arc<dyn Device>,
    ) -> Option<Arc<dyn DeviceContext>> {
        let inner = self.inner.lock();
        inner
            .device_context_maps
            .get(device.name())
            .and_then(|map| map.get(item.id.index()).cloned())
            .flatten()
    }

    ///
    /// Returns the cached kernel for (device, node), instantiating it
    /// through the device's function library on first use.
    ///
    fn setup_kernel(&self, item: &NodeItem, ditem: &DeviceItem) -> Result<Arc<dyn OpKernel>> {
        let key = (ditem.device.name().to_owned(), item.id);
        if let Some(kernel) = self.impl_.kernel_cache.lock().get(&key) {
            return Ok(kernel.clone());
        }
        let kernel = ditem
            .fruntime
            .create_kernel(self.impl_.graph().node(item.id))?;
        Ok(self
            .impl_
            .kernel_cache
            .lock()
            .entry(key)
            .or_insert(kernel)
            .clone())
    }

    ///
    /// Logs the state of every live frame and iteration. Emitted at most
    /// once per invocation, on the first error.
    ///
    fn dump_state(&self) {
        let mut inner = self.inner.lock();
        if inner.dumped_on_error {
            return;
        }
        inner.dumped_on_error = true;
        let gview = self.impl_.gview();
        log::warn!("step {}: dumping state on error", self.step_id);
        for frame in inner.outstanding_frames.values() {
            let frame_inner = frame.inner.lock();
            for iter in 0..=frame_inner.iteration_count {
                let Some(iter_state) = frame_inner.iteration_state(iter) else {
                    continue;
                };
                log::warn!(
                    "  frame `{}` iter {iter}: {} outstanding ops, {} outstanding frames",
                    frame.frame_name,
                    iter_state.outstanding_ops,
                    iter_state.outstanding_frame_count
                );
                for &node in &frame.nodes {
                    let item = gview.node(node);
                    match iter_state.node_state(item.pending_handle) {
                        NodeState::PendingNotReady | NodeState::PendingReady => {
                            self.dump_pending_node_state(item, iter_state);
                        }
                        NodeState::Started => self.dump_active_node_state(item, iter_state),
                        NodeState::Completed => {}
                    }
                }
            }
        }
    }

    fn dump_pending_node_state(
        &self,
        item: &NodeItem,
        iter_state: &crate::frame::IterationState,
    ) {
        let ready_inputs = (0..item.num_inputs)
            .filter(|i| iter_state.input_tensors[item.input_start + i].has_value())
            .count();
        log::warn!(
            "    pending `{}` ({}): {} of {} inputs ready, pending count {}, dead count {}",
            item.name,
            item.op,
            ready_inputs,
            item.num_inputs,
            iter_state.pending(item.pending_handle),
            iter_state.dead_count(item.pending_handle)
        );
    }

    fn dump_active_node_state(&self, item: &NodeItem, _iter_state: &crate::frame::IterationState) {
        log::warn!("    active `{}` ({}) on {}", item.name, item.op, item.device);
    }

    ///
    /// The last outstanding op completed: capture the final status, sync
    /// used devices if asked to, and invoke the done callback exactly once,
    /// on a Runner thread.
    ///
    fn finish(self: &Arc<Self>) {
        let (mut status, used_devices) = {
            let inner = self.inner.lock();
            (inner.status.clone(), inner.used_devices.clone())
        };
        if self.sync_on_finish && status.is_ok() {
            // Block until the devices have finished all queued operations,
            // so that the step's side effects are visible when the callback
            // runs.
            for device in &used_devices {
                if let Err(e) = device.sync() {
                    status.update(e);
                }
            }
        }
        let done = self
            .done_cb
            .lock()
            .take()
            .expect("the done callback is invoked exactly once");
        log::debug!("step {} finished: {status}", self.step_id);
        (self.runner)(Box::new(move || done(status)));
    }
}
