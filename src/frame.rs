// Copyright 2019 Loom project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::{Arc, Weak};

use graph::pending_counts::{Handle, NodeState, PendingCounts};
use graph::{FrameInfo, GraphView, NodeId, NodeItem};
use parking_lot::Mutex;

use crate::entry::Entry;

/// A scheduling unit: a ready node tagged with the frame and iteration its
/// inputs live in, and whether it runs dead.
#[derive(Clone)]
pub(crate) struct TaggedNode {
    pub node: NodeId,
    pub frame: Arc<FrameState>,
    pub iter: i64,
    pub is_dead: bool,
}

pub(crate) type TaggedNodeSeq = Vec<TaggedNode>;

///
/// The state of one loop iteration: an input slot per frame-wide input edge,
/// counters for the work still in flight, and this iteration's copy of the
/// frame's pending counts.
///
pub(crate) struct IterationState {
    /// For iteration k, node i's j-th input lives at
    /// `input_tensors[item(i).input_start + j]`. Written once by the edge's
    /// source, taken once by its destination.
    pub input_tensors: Vec<Entry>,

    pub outstanding_ops: usize,
    pub outstanding_frame_count: usize,

    counts: PendingCounts,
}

impl IterationState {
    pub fn new(template: &PendingCounts, total_input_tensors: usize) -> IterationState {
        IterationState {
            input_tensors: std::iter::repeat_with(Entry::default)
                .take(total_input_tensors)
                .collect(),
            outstanding_ops: 0,
            outstanding_frame_count: 0,
            counts: template.clone(),
        }
    }

    pub fn pending(&self, h: Handle) -> usize {
        self.counts.pending(h)
    }

    pub fn decrement_pending(&mut self, h: Handle, v: usize) -> usize {
        self.counts.decrement_pending(h, v)
    }

    pub fn mark_live(&mut self, h: Handle) {
        self.counts.mark_live(h)
    }

    pub fn mark_started(&mut self, h: Handle) {
        self.counts.mark_started(h)
    }

    pub fn mark_completed(&mut self, h: Handle) {
        self.counts.mark_completed(h)
    }

    pub fn node_state(&self, h: Handle) -> NodeState {
        self.counts.node_state(h)
    }

    pub fn dead_count(&self, h: Handle) -> usize {
        self.counts.dead_count(h)
    }

    pub fn increment_dead_count(&mut self, h: Handle) {
        self.counts.increment_dead_count(h)
    }

    pub fn adjust_for_activation(&mut self, h: Handle, increment_dead: bool) -> (usize, usize) {
        self.counts.adjust_for_activation(h, increment_dead)
    }
}

pub(crate) struct FrameInner {
    /// The number of Enter edges this frame still waits for.
    pub num_pending_inputs: usize,

    /// The highest iteration started so far; monotonically non-decreasing.
    pub iteration_count: i64,

    pub num_outstanding_iterations: usize,

    /// Ring of live iterations, indexed by iter modulo the ring size.
    iterations: Vec<Option<IterationState>>,

    /// NextIteration values deferred because the ring is full; drained when
    /// an iteration retires.
    pub next_iter_roots: Vec<(NodeId, Entry)>,

    /// Loop invariants delivered so far; replayed into each new iteration.
    pub inv_values: Vec<(NodeId, Entry)>,

    /// Dead Exit nodes of the current highest iteration; only the final
    /// iteration's dead exits ever fire, at frame deletion.
    pub dead_exits: Vec<NodeId>,
}

impl FrameInner {
    fn slot(&self, iter: i64) -> usize {
        debug_assert!(iter >= 0);
        iter as usize % self.iterations.len()
    }

    pub fn iteration(&self, iter: i64) -> &IterationState {
        self.iterations[self.slot(iter)]
            .as_ref()
            .expect("iteration is live")
    }

    pub fn iteration_mut(&mut self, iter: i64) -> &mut IterationState {
        let slot = self.slot(iter);
        self.iterations[slot].as_mut().expect("iteration is live")
    }

    pub fn iteration_state(&self, iter: i64) -> Option<&IterationState> {
        self.iterations[self.slot(iter)].as_ref()
    }

    pub fn set_iteration(&mut self, iter: i64, state: IterationState) {
        let slot = self.slot(iter);
        debug_assert!(self.iterations[slot].is_none(), "iteration slot overwritten");
        self.iterations[slot] = Some(state);
    }

    pub fn clear_iteration(&mut self, iter: i64) {
        let slot = self.slot(iter);
        debug_assert!(self.iterations[slot].is_some());
        self.iterations[slot] = None;
    }

    pub fn is_frame_done(&self) -> bool {
        self.num_pending_inputs == 0 && self.num_outstanding_iterations == 0
    }
}

///
/// Mutable per-frame state. A frame is created by the first Enter that
/// reaches it and dies when all its inputs have entered and every iteration
/// has drained.
///
/// Lock ordering: the executor state's lock is acquired before any frame's
/// `inner`; no path acquires the executor lock while holding a frame lock.
///
pub(crate) struct FrameState {
    /// Concatenation of the parent frame name, the parent iteration, and the
    /// Enter node's frame_name attr; unique among live frames.
    pub frame_name: String,

    /// Fingerprint of `frame_name`.
    pub frame_id: u64,

    /// The parent outlives this frame; the back-pointer is non-owning.
    pub parent_frame: Option<Weak<FrameState>>,

    /// Iteration of the parent frame this frame was created at; -1 for the
    /// root frame.
    pub parent_iter: i64,

    pub max_parallel_iterations: usize,

    /// Static per-frame data, snapshotted from the executor's frame info.
    pub pending_counts: PendingCounts,
    pub total_input_tensors: usize,
    pub nodes: Vec<NodeId>,

    pub inner: Mutex<FrameInner>,
}

impl FrameState {
    pub fn new(
        frame_name: String,
        max_parallel_iterations: usize,
        parent_frame: Option<Weak<FrameState>>,
        parent_iter: i64,
        finfo: &FrameInfo,
    ) -> FrameState {
        let max_parallel_iterations = max_parallel_iterations.max(1);
        // One spare slot beyond the parallelism bound: the done check for
        // iteration i reads slot i-1, which must not alias a live wrapped
        // successor.
        let mut iterations: Vec<Option<IterationState>> = Vec::new();
        iterations.resize_with(max_parallel_iterations + 1, || None);
        iterations[0] = Some(IterationState::new(&finfo.pending_counts, finfo.total_inputs));
        FrameState {
            frame_id: graph::fingerprint(&frame_name),
            frame_name,
            parent_frame,
            parent_iter,
            max_parallel_iterations,
            pending_counts: finfo.pending_counts.clone(),
            total_input_tensors: finfo.total_inputs,
            nodes: finfo.nodes.clone(),
            inner: Mutex::new(FrameInner {
                num_pending_inputs: finfo.input_count,
                iteration_count: 0,
                num_outstanding_iterations: 1,
                iterations,
                next_iter_roots: Vec::new(),
                inv_values: Vec::new(),
                dead_exits: Vec::new(),
            }),
        }
    }

    pub fn parent(&self) -> Option<Arc<FrameState>> {
        self.parent_frame.as_ref().map(|w| {
            w.upgrade()
                .expect("a parent frame outlives its children")
        })
    }

    ///
    /// Activates the successors of `item` in `iter` with the given outputs,
    /// moving live values into destination slots and accounting dead ones.
    /// Newly ready nodes are appended to `ready`.
    ///
    pub fn activate_nodes_locked(
        self: &Arc<Self>,
        inner: &mut FrameInner,
        gview: &GraphView,
        item: &NodeItem,
        is_dead: bool,
        iter: i64,
        outputs: &[Entry],
        ready: &mut TaggedNodeSeq,
    ) {
        let iter_state = inner.iteration_mut(iter);
        for e in &item.out_edges {
            let dst_item = gview.node(e.dst);
            let h = dst_item.pending_handle;

            let mut dst_dead = false;
            let dst_ready;
            let mut dst_need_input = !e.is_control;

            if dst_item.is_merge {
                // A Merge is ready once all control inputs arrived and either
                // a live data input arrived or every data input is dead.
                if e.is_control {
                    iter_state.decrement_pending(h, 2);
                    let count = iter_state.pending(h);
                    let dead_cnt = iter_state.dead_count(h);
                    dst_dead = dead_cnt == dst_item.num_inputs;
                    dst_ready = count == 0 || (count == 1 && dst_dead);
                } else if outputs[e.src_output].has_value() {
                    // A live data input; only the first one ships a value.
                    let count = iter_state.pending(h);
                    iter_state.mark_live(h);
                    dst_ready = count == 1;
                    dst_need_input = (count & 1) == 1;
                } else {
                    // A dead data input. A dead Enter also kills the Merge,
                    // which handles a while loop on the untaken branch of a
                    // conditional.
                    iter_state.increment_dead_count(h);
                    let dead_cnt = iter_state.dead_count(h);
                    dst_dead = dead_cnt == dst_item.num_inputs || item.is_enter();
                    dst_ready = iter_state.pending(h) == 1 && dst_dead;
                    dst_need_input = false;
                }
            } else {
                let increment_dead =
                    is_dead || (!e.is_control && !outputs[e.src_output].has_value());
                let (pending, dead) = iter_state.adjust_for_activation(h, increment_dead);
                dst_dead = dead > 0;
                dst_ready = pending == 0;
            }

            if dst_need_input {
                let dst_slot = dst_item.input_start + e.dst_input;
                iter_state.input_tensors[dst_slot] = outputs[e.src_output].clone();
            }

            if dst_ready {
                ready.push(TaggedNode {
                    node: e.dst,
                    frame: self.clone(),
                    iter,
                    is_dead: dst_dead,
                });
                iter_state.outstanding_ops += 1;
            }
        }
    }

    /// Drains the deferred NextIteration roots into iteration `iter`.
    pub fn activate_nexts_locked(
        self: &Arc<Self>,
        inner: &mut FrameInner,
        gview: &GraphView,
        iter: i64,
        ready: &mut TaggedNodeSeq,
    ) {
        let roots = std::mem::take(&mut inner.next_iter_roots);
        for (node, entry) in roots {
            let item = gview.node(node);
            let is_dead = !entry.has_value();
            let outputs = [entry];
            self.activate_nodes_locked(inner, gview, item, is_dead, iter, &outputs, ready);
        }
    }

    /// Replays every loop invariant into iteration `iter`.
    pub fn activate_loop_invs_locked(
        self: &Arc<Self>,
        inner: &mut FrameInner,
        gview: &GraphView,
        iter: i64,
        ready: &mut TaggedNodeSeq,
    ) {
        let invs = inner.inv_values.clone();
        for (node, entry) in invs {
            let item = gview.node(node);
            let is_dead = !entry.has_value();
            let outputs = [entry];
            self.activate_nodes_locked(inner, gview, item, is_dead, iter, &outputs, ready);
        }
    }

    /// Records a new loop invariant and makes it visible to every live
    /// iteration.
    pub fn add_loop_inv_locked(
        self: &Arc<Self>,
        inner: &mut FrameInner,
        gview: &GraphView,
        item: &NodeItem,
        entry: Entry,
        ready: &mut TaggedNodeSeq,
    ) {
        inner.inv_values.push((item.id, entry.clone()));
        let is_dead = !entry.has_value();
        for iter in 0..=inner.iteration_count {
            let outputs = [entry.clone()];
            self.activate_nodes_locked(inner, gview, item, is_dead, iter, &outputs, ready);
        }
    }

    ///
    /// Starts the next iteration. REQUIRES: the ring has capacity, which the
    /// NextIteration deferral rule guarantees.
    ///
    pub fn increment_iteration_locked(
        self: &Arc<Self>,
        inner: &mut FrameInner,
        gview: &GraphView,
        ready: &mut TaggedNodeSeq,
    ) {
        inner.iteration_count += 1;
        let next_iter = inner.iteration_count;
        inner.set_iteration(
            next_iter,
            IterationState::new(&self.pending_counts, self.total_input_tensors),
        );
        inner.num_outstanding_iterations += 1;
        debug_assert!(inner.num_outstanding_iterations <= self.max_parallel_iterations);
        inner.dead_exits.clear();
        self.activate_nexts_locked(inner, gview, next_iter, ready);
        self.activate_loop_invs_locked(inner, gview, next_iter, ready);
    }

    ///
    /// An iteration is done when it has no outstanding ops or child frames,
    /// and its predecessor has been retired (for iteration 0: when the frame
    /// has no pending inputs).
    ///
    pub fn is_iteration_done(&self, inner: &FrameInner, iter: i64) -> bool {
        let iter_state = inner.iteration(iter);
        if iter_state.outstanding_ops != 0 || iter_state.outstanding_frame_count != 0 {
            return false;
        }
        if iter == 0 {
            inner.num_pending_inputs == 0
        } else {
            inner.iteration_state(iter - 1).is_none()
        }
    }

    ///
    /// Retires done iterations starting at `iter`, starting deferred
    /// iterations as capacity frees up. Returns true iff the whole frame is
    /// now done.
    ///
    pub fn cleanup_iterations_locked(
        self: &Arc<Self>,
        inner: &mut FrameInner,
        gview: &GraphView,
        iter: i64,
        ready: &mut TaggedNodeSeq,
    ) -> bool {
        let mut curr = iter;
        while curr <= inner.iteration_count && self.is_iteration_done(inner, curr) {
            inner.clear_iteration(curr);
            inner.num_outstanding_iterations -= 1;
            curr += 1;
            if !inner.next_iter_roots.is_empty() {
                self.increment_iteration_locked(inner, gview, ready);
            }
        }
        inner.is_frame_done()
    }

    /// Returns true iff the frame is done.
    pub fn decrement_outstanding_ops_locked(
        self: &Arc<Self>,
        inner: &mut FrameInner,
        gview: &GraphView,
        iter: i64,
        ready: &mut TaggedNodeSeq,
    ) -> bool {
        let iter_state = inner.iteration_mut(iter);
        debug_assert!(iter_state.outstanding_ops > 0);
        iter_state.outstanding_ops -= 1;
        if iter_state.outstanding_ops == 0 {
            self.cleanup_iterations_locked(inner, gview, iter, ready)
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FrameState, IterationState};
    use graph::FrameInfo;
    use std::sync::Arc;

    fn frame(parallel_iterations: usize) -> Arc<FrameState> {
        Arc::new(FrameState::new(
            "test".to_owned(),
            parallel_iterations,
            None,
            -1,
            &FrameInfo::default(),
        ))
    }

    #[test]
    fn ring_keeps_live_iterations_distinct() {
        let f = frame(2);
        let mut inner = f.inner.lock();
        assert!(inner.iteration_state(0).is_some());
        inner.set_iteration(1, IterationState::new(&f.pending_counts, 0));
        inner.set_iteration(2, IterationState::new(&f.pending_counts, 0));
        // Two live iterations plus the retired predecessor's slot coexist.
        assert!(inner.iteration_state(1).is_some());
        assert!(inner.iteration_state(2).is_some());
        inner.clear_iteration(0);
        assert!(inner.iteration_state(0).is_none());
        assert!(inner.iteration_state(1).is_some());
    }

    #[test]
    fn iteration_done_ordering() {
        let f = frame(2);
        let mut inner = f.inner.lock();
        inner.set_iteration(1, IterationState::new(&f.pending_counts, 0));

        // Iteration 0 waits for the frame's pending Enter inputs.
        inner.num_pending_inputs = 1;
        assert!(!f.is_iteration_done(&inner, 0));
        inner.num_pending_inputs = 0;
        assert!(f.is_iteration_done(&inner, 0));

        // Iteration 1 additionally waits for iteration 0 to retire.
        assert!(!f.is_iteration_done(&inner, 1));
        inner.clear_iteration(0);
        assert!(f.is_iteration_done(&inner, 1));

        // Outstanding work holds an iteration open.
        inner.iteration_mut(1).outstanding_ops = 1;
        assert!(!f.is_iteration_done(&inner, 1));
    }
}
