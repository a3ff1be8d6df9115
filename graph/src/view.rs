// Copyright 2018 Loom project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use status::{Result, Status};
use tensor::DataType;

use crate::control_flow::{ControlFlowInfo, FrameInfoMap};
use crate::pending_counts::{Handle, PendingCounts};
use crate::{EdgeKind, Graph, NodeId};

#[derive(Clone, Copy, Debug)]
pub struct EdgeInfo {
    pub dst: NodeId,
    pub src_output: usize,
    pub dst_input: usize,
    pub is_control: bool,
}

/// Attrs of an Enter node, denormalized for the scheduler.
#[derive(Clone, Debug)]
pub struct EnterInfo {
    pub frame_name: String,
    pub is_constant: bool,
    pub parallel_iterations: usize,
}

///
/// Everything the scheduler needs to know about one node, flattened out of
/// the graph once so the hot path never touches the petgraph store.
///
#[derive(Debug)]
pub struct NodeItem {
    pub id: NodeId,
    pub name: String,
    pub op: String,
    /// Placement spec string, e.g. `"CPU:0"`.
    pub device: String,
    pub num_inputs: usize,
    pub num_outputs: usize,
    pub input_types: Vec<DataType>,
    pub output_types: Vec<DataType>,

    /// Offset of this node's input slots in its frame's input-tensor array.
    pub input_start: usize,

    pub pending_handle: Handle,

    /// Expensive kernels go to the Runner; cheap ones may run inline on the
    /// worker that produced their inputs.
    pub expensive: bool,

    pub is_merge: bool,
    pub is_switch: bool,
    pub is_exit: bool,
    pub is_next_iteration: bool,
    pub is_transfer: bool,
    pub is_recv: bool,

    /// Present iff this node is an Enter.
    pub enter: Option<EnterInfo>,

    pub out_edges: Vec<EdgeInfo>,

    /// The frame this node executes in.
    pub frame_name: String,
}

impl NodeItem {
    pub fn input_type(&self, i: usize) -> DataType {
        self.input_types[i]
    }

    pub fn output_type(&self, i: usize) -> DataType {
        self.output_types[i]
    }

    pub fn is_enter(&self) -> bool {
        self.enter.is_some()
    }
}

pub struct GraphView {
    items: Vec<NodeItem>,
}

impl GraphView {
    ///
    /// Flattens `graph` and, as a side effect, lays out every frame's
    /// input-tensor array and pending-counts template into `frame_infos`.
    ///
    pub fn build(
        graph: &Graph,
        cf: &ControlFlowInfo,
        frame_infos: &mut FrameInfoMap,
        is_expensive: &dyn Fn(&crate::NodeDef) -> bool,
    ) -> Result<GraphView> {
        let num_nodes = graph.num_node_ids();
        let mut items = Vec::with_capacity(num_nodes);
        let mut max_pendings = vec![0_usize; num_nodes];

        for id in graph.node_ids() {
            debug_assert_eq!(id.index(), items.len());
            let def = graph.node(id);
            let frame_name = cf.frame_name(id).to_owned();

            let num_in_edges = graph.num_in_edges(id);
            let max_pending = if def.is_merge() {
                // A Merge waits for all control inputs plus one live data
                // input; the low bit tracks the latter.
                1 + 2 * graph.num_control_in_edges(id)
            } else {
                num_in_edges
            };
            max_pendings[id.index()] = max_pending;

            let finfo = frame_infos.entry(frame_name.clone()).or_default();
            let input_start = finfo.total_inputs;
            finfo.total_inputs += def.num_inputs();
            let pending_handle = finfo.layout.create_handle(max_pending, num_in_edges);
            finfo.nodes.push(id);

            let enter = if def.is_enter() {
                let child_name = def.attr_str("frame_name").ok_or_else(|| {
                    Status::invalid_argument(format!(
                        "Enter node `{}` has no frame_name attr",
                        def.name
                    ))
                })?;
                frame_infos.entry(child_name.to_owned()).or_default().input_count += 1;
                Some(EnterInfo {
                    frame_name: child_name.to_owned(),
                    is_constant: def.attr_bool("is_constant").unwrap_or(false),
                    parallel_iterations: def
                        .attr_i64("parallel_iterations")
                        .unwrap_or(10)
                        .max(1) as usize,
                })
            } else {
                None
            };

            let out_edges = graph
                .out_edges(id)
                .map(|(dst, kind)| match kind {
                    EdgeKind::Data {
                        src_output,
                        dst_input,
                    } => EdgeInfo {
                        dst,
                        src_output,
                        dst_input,
                        is_control: false,
                    },
                    EdgeKind::Control => EdgeInfo {
                        dst,
                        src_output: 0,
                        dst_input: 0,
                        is_control: true,
                    },
                })
                .collect();

            items.push(NodeItem {
                id,
                name: def.name.clone(),
                op: def.op.clone(),
                device: def.device.clone(),
                num_inputs: def.num_inputs(),
                num_outputs: def.num_outputs(),
                input_types: def.input_types.clone(),
                output_types: def.output_types.clone(),
                input_start,
                pending_handle,
                expensive: is_expensive(def),
                is_merge: def.is_merge(),
                is_switch: def.is_switch(),
                is_exit: def.is_exit(),
                is_next_iteration: def.is_next_iteration(),
                is_transfer: def.is_transfer_node(),
                is_recv: def.op == crate::ops::RECV,
                enter,
                out_edges,
                frame_name,
            });
        }

        // Second pass: seed every frame's pending-counts template.
        for finfo in frame_infos.values_mut() {
            let mut counts = PendingCounts::new(&finfo.layout);
            for &id in &finfo.nodes {
                counts.set_initial_count(items[id.index()].pending_handle, max_pendings[id.index()]);
            }
            finfo.pending_counts = counts;
        }

        Ok(GraphView { items })
    }

    pub fn node(&self, id: NodeId) -> &NodeItem {
        &self.items[id.index()]
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}
