// Copyright 2018 Loom project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]

pub mod control_flow;
pub mod pending_counts;
mod view;

pub use crate::control_flow::{ControlFlowInfo, FrameInfo, FrameInfoMap};
pub use crate::view::{EdgeInfo, GraphView, NodeItem};

use std::hash::Hasher;

use fnv::{FnvHashMap as HashMap, FnvHasher};
use petgraph::graph::DiGraph;
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde_derive::{Deserialize, Serialize};
use status::{Result, Status};
use tensor::{DataType, TensorDef};

// 2^32 nodes ought to be more than enough for anyone!
pub type NodeId = petgraph::graph::NodeIndex<u32>;

/// Well-known op names the scheduler gives special treatment.
pub mod ops {
    pub const ENTER: &str = "Enter";
    pub const EXIT: &str = "Exit";
    pub const SWITCH: &str = "Switch";
    pub const MERGE: &str = "Merge";
    pub const NEXT_ITERATION: &str = "NextIteration";
    pub const LOOP_COND: &str = "LoopCond";
    pub const SEND: &str = "_Send";
    pub const RECV: &str = "_Recv";
    pub const ARG: &str = "_Arg";
    pub const RETVAL: &str = "_Retval";
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    B(bool),
    I(i64),
    S(String),
    Type(DataType),
    Tensor(TensorDef),
}

///
/// One node of the dataflow graph as submitted by the client: an op name, a
/// device placement, typed input/output arity, and op-specific attrs.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
    pub name: String,
    pub op: String,
    pub device: String,
    #[serde(default)]
    pub input_types: Vec<DataType>,
    #[serde(default)]
    pub output_types: Vec<DataType>,
    #[serde(default)]
    pub attrs: HashMap<String, AttrValue>,
}

impl NodeDef {
    pub fn new(name: impl Into<String>, op: impl Into<String>) -> NodeDef {
        NodeDef {
            name: name.into(),
            op: op.into(),
            device: "CPU:0".to_owned(),
            input_types: Vec::new(),
            output_types: Vec::new(),
            attrs: HashMap::default(),
        }
    }

    pub fn on_device(mut self, device: impl Into<String>) -> NodeDef {
        self.device = device.into();
        self
    }

    pub fn inputs(mut self, types: &[DataType]) -> NodeDef {
        self.input_types = types.to_vec();
        self
    }

    pub fn outputs(mut self, types: &[DataType]) -> NodeDef {
        self.output_types = types.to_vec();
        self
    }

    pub fn attr(mut self, name: impl Into<String>, value: AttrValue) -> NodeDef {
        self.attrs.insert(name.into(), value);
        self
    }

    pub fn num_inputs(&self) -> usize {
        self.input_types.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.output_types.len()
    }

    pub fn attr_bool(&self, name: &str) -> Option<bool> {
        match self.attrs.get(name) {
            Some(AttrValue::B(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn attr_i64(&self, name: &str) -> Option<i64> {
        match self.attrs.get(name) {
            Some(AttrValue::I(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn attr_str(&self, name: &str) -> Option<&str> {
        match self.attrs.get(name) {
            Some(AttrValue::S(s)) => Some(s),
            _ => None,
        }
    }

    pub fn attr_tensor(&self, name: &str) -> Option<&TensorDef> {
        match self.attrs.get(name) {
            Some(AttrValue::Tensor(t)) => Some(t),
            _ => None,
        }
    }

    pub fn is_enter(&self) -> bool {
        self.op == ops::ENTER
    }

    pub fn is_exit(&self) -> bool {
        self.op == ops::EXIT
    }

    pub fn is_switch(&self) -> bool {
        self.op == ops::SWITCH
    }

    pub fn is_merge(&self) -> bool {
        self.op == ops::MERGE
    }

    pub fn is_next_iteration(&self) -> bool {
        self.op == ops::NEXT_ITERATION
    }

    pub fn is_loop_cond(&self) -> bool {
        self.op == ops::LOOP_COND
    }

    pub fn is_constant_enter(&self) -> bool {
        self.is_enter() && self.attr_bool("is_constant").unwrap_or(false)
    }

    /// Send/Recv run even when dead so that deadness crosses device (and
    /// process) boundaries.
    pub fn is_transfer_node(&self) -> bool {
        self.op == ops::SEND || self.op == ops::RECV
    }

    pub fn is_control_flow(&self) -> bool {
        self.is_enter()
            || self.is_exit()
            || self.is_switch()
            || self.is_merge()
            || self.is_next_iteration()
            || self.is_loop_cond()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EdgeKind {
    Data { src_output: usize, dst_input: usize },
    Control,
}

impl EdgeKind {
    pub fn is_control(&self) -> bool {
        matches!(self, EdgeKind::Control)
    }
}

///
/// The frozen graph handed to an executor. Construction validates names,
/// slot ranges and edge dtypes; `validate` additionally checks that every
/// data input is connected exactly once.
///
pub struct Graph {
    pg: DiGraph<NodeDef, EdgeKind, u32>,
    by_name: HashMap<String, NodeId>,
}

impl Graph {
    pub fn new() -> Graph {
        Graph {
            pg: DiGraph::new(),
            by_name: HashMap::default(),
        }
    }

    pub fn add_node(&mut self, def: NodeDef) -> Result<NodeId> {
        if self.by_name.contains_key(&def.name) {
            return Err(Status::invalid_argument(format!(
                "duplicate node name `{}`",
                def.name
            )));
        }
        let name = def.name.clone();
        let id = self.pg.add_node(def);
        self.by_name.insert(name, id);
        Ok(id)
    }

    pub fn add_edge(
        &mut self,
        src: NodeId,
        src_output: usize,
        dst: NodeId,
        dst_input: usize,
    ) -> Result<()> {
        let (src_def, dst_def) = (self.node(src), self.node(dst));
        if src_output >= src_def.num_outputs() {
            return Err(Status::invalid_argument(format!(
                "`{}` has no output {src_output}",
                src_def.name
            )));
        }
        if dst_input >= dst_def.num_inputs() {
            return Err(Status::invalid_argument(format!(
                "`{}` has no input {dst_input}",
                dst_def.name
            )));
        }
        let (src_type, dst_type) = (
            src_def.output_types[src_output],
            dst_def.input_types[dst_input],
        );
        if src_type != dst_type {
            return Err(Status::invalid_argument(format!(
                "edge {}:{src_output} -> {}:{dst_input} connects {src_type} to {dst_type}",
                src_def.name, dst_def.name
            )));
        }
        self.pg.add_edge(
            src,
            dst,
            EdgeKind::Data {
                src_output,
                dst_input,
            },
        );
        Ok(())
    }

    pub fn add_control_edge(&mut self, src: NodeId, dst: NodeId) {
        self.pg.add_edge(src, dst, EdgeKind::Control);
    }

    pub fn node(&self, id: NodeId) -> &NodeDef {
        &self.pg[id]
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    pub fn num_node_ids(&self) -> usize {
        self.pg.node_count()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.pg.node_indices()
    }

    pub fn in_edges(&self, id: NodeId) -> impl Iterator<Item = (NodeId, EdgeKind)> + '_ {
        self.pg
            .edges_directed(id, Direction::Incoming)
            .map(|e| (e.source(), *e.weight()))
    }

    pub fn out_edges(&self, id: NodeId) -> impl Iterator<Item = (NodeId, EdgeKind)> + '_ {
        self.pg
            .edges_directed(id, Direction::Outgoing)
            .map(|e| (e.target(), *e.weight()))
    }

    pub fn num_in_edges(&self, id: NodeId) -> usize {
        self.in_edges(id).count()
    }

    pub fn num_control_in_edges(&self, id: NodeId) -> usize {
        self.in_edges(id).filter(|(_, k)| k.is_control()).count()
    }

    /// Nodes with no incoming edges; these seed the ready queue.
    pub fn root_nodes(&self) -> Vec<NodeId> {
        self.node_ids()
            .filter(|&id| self.num_in_edges(id) == 0)
            .collect()
    }

    ///
    /// Checks that every data input slot of every node is fed by exactly one
    /// edge. Run after construction, before execution.
    ///
    pub fn validate(&self) -> Result<()> {
        for id in self.node_ids() {
            let def = self.node(id);
            let mut feeds = vec![0_usize; def.num_inputs()];
            for (_, kind) in self.in_edges(id) {
                if let EdgeKind::Data { dst_input, .. } = kind {
                    feeds[dst_input] += 1;
                }
            }
            for (slot, count) in feeds.iter().enumerate() {
                if *count != 1 {
                    return Err(Status::invalid_argument(format!(
                        "input {slot} of `{}` is fed by {count} edges",
                        def.name
                    )));
                }
            }
        }
        Ok(())
    }

    ///
    /// Builds a graph from its wire form. Data inputs are positional:
    /// `"src"` or `"src:k"` feeds the next input slot, `"^src"` adds a
    /// control edge.
    ///
    pub fn from_graph_def(def: &GraphDef) -> Result<Graph> {
        let mut graph = Graph::new();
        for n in &def.nodes {
            graph.add_node(n.def.clone())?;
        }
        for n in &def.nodes {
            let dst = graph.node_id(&n.def.name).expect("node was just added");
            let mut dst_input = 0;
            for input in &n.inputs {
                if let Some(src_name) = input.strip_prefix('^') {
                    let src = graph.node_id(src_name).ok_or_else(|| {
                        Status::invalid_argument(format!("unknown input node `{src_name}`"))
                    })?;
                    graph.add_control_edge(src, dst);
                } else {
                    let (src_name, src_output) = match input.rsplit_once(':') {
                        Some((name, slot)) => {
                            let slot = slot.parse::<usize>().map_err(|_| {
                                Status::invalid_argument(format!("malformed input `{input}`"))
                            })?;
                            (name, slot)
                        }
                        None => (input.as_str(), 0),
                    };
                    let src = graph.node_id(src_name).ok_or_else(|| {
                        Status::invalid_argument(format!("unknown input node `{src_name}`"))
                    })?;
                    graph.add_edge(src, src_output, dst, dst_input)?;
                    dst_input += 1;
                }
            }
        }
        graph.validate()?;
        Ok(graph)
    }
}

///
/// Wire form of a graph, as carried in request payloads.
///
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GraphDef {
    pub nodes: Vec<GraphDefNode>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraphDefNode {
    #[serde(flatten)]
    pub def: NodeDef,
    #[serde(default)]
    pub inputs: Vec<String>,
}

/// A stable 64-bit fingerprint of a frame name, used as the frame id.
pub fn fingerprint(name: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(name.as_bytes());
    hasher.finish()
}
