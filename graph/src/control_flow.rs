// Copyright 2018 Loom project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::VecDeque;

use fnv::{FnvHashMap as HashMap, FnvHashSet as HashSet};
use status::{Result, Status};

use crate::pending_counts::{Layout, PendingCounts};
use crate::{Graph, NodeId};

///
/// Static frame assignment for every node, derived once per graph. The root
/// frame has the empty name; an Enter node belongs to its *parent* frame
/// while its successors belong to the frame named by its `frame_name` attr.
///
#[derive(Debug, Default)]
pub struct ControlFlowInfo {
    /// Frame name per node, indexed by node id.
    pub frame_names: Vec<String>,
    pub unique_frame_names: HashSet<String>,
}

impl ControlFlowInfo {
    pub fn build(graph: &Graph) -> Result<ControlFlowInfo> {
        let num_nodes = graph.num_node_ids();
        let mut cf = ControlFlowInfo {
            frame_names: vec![String::new(); num_nodes],
            unique_frame_names: HashSet::default(),
        };
        // The Enter node that opened the frame each node sits in, if any.
        let mut parent_nodes: Vec<Option<NodeId>> = vec![None; num_nodes];
        let mut visited = vec![false; num_nodes];

        let mut ready: VecDeque<NodeId> = VecDeque::new();
        for id in graph.root_nodes() {
            visited[id.index()] = true;
            cf.unique_frame_names.insert(String::new());
            ready.push_back(id);
        }

        log::trace!(
            "control-flow info: {} nodes, {} roots",
            num_nodes,
            ready.len()
        );

        while let Some(curr) = ready.pop_front() {
            let curr_def = graph.node(curr);
            let (frame_name, parent) = if curr_def.is_enter() {
                let name = curr_def.attr_str("frame_name").ok_or_else(|| {
                    Status::invalid_argument(format!(
                        "Enter node `{}` has no frame_name attr",
                        curr_def.name
                    ))
                })?;
                (name.to_owned(), Some(curr))
            } else if curr_def.is_exit() {
                // Exit lands in the frame enclosing the one it leaves.
                let enter = parent_nodes[curr.index()].ok_or_else(|| {
                    Status::invalid_argument(format!(
                        "Exit node `{}` is not inside a frame",
                        curr_def.name
                    ))
                })?;
                (
                    cf.frame_names[enter.index()].clone(),
                    parent_nodes[enter.index()],
                )
            } else {
                (
                    cf.frame_names[curr.index()].clone(),
                    parent_nodes[curr.index()],
                )
            };

            for (out, _) in graph.out_edges(curr) {
                if !visited[out.index()] {
                    visited[out.index()] = true;
                    cf.frame_names[out.index()] = frame_name.clone();
                    parent_nodes[out.index()] = parent;
                    cf.unique_frame_names.insert(frame_name.clone());
                    ready.push_back(out);
                }
            }
        }

        Ok(cf)
    }

    pub fn frame_name(&self, id: NodeId) -> &str {
        &self.frame_names[id.index()]
    }
}

///
/// Static per-frame data: how many Enter edges feed the frame, the size of
/// an iteration's input-tensor array, and the pending-counts template every
/// iteration starts from.
///
#[derive(Debug, Default)]
pub struct FrameInfo {
    /// The number of Enter nodes targeting this frame; a frame is not done
    /// while any of them has yet to deliver.
    pub input_count: usize,

    /// == sum(node.num_inputs()) over the nodes in this frame.
    pub total_inputs: usize,

    pub layout: Layout,

    /// Each iteration starts from a copy of this.
    pub pending_counts: PendingCounts,

    pub nodes: Vec<NodeId>,
}

pub type FrameInfoMap = HashMap<String, FrameInfo>;

#[cfg(test)]
mod tests {
    use super::ControlFlowInfo;
    use crate::{AttrValue, Graph, NodeDef};
    use tensor::DataType;

    #[test]
    fn frames_assigned_through_enter_and_exit() {
        // const -> Enter(loop) -> Merge -> Exit -> sink
        let mut g = Graph::new();
        let t = &[DataType::Int64];
        let c = g
            .add_node(NodeDef::new("c", "Const").outputs(t))
            .unwrap();
        let enter = g
            .add_node(
                NodeDef::new("enter", "Enter")
                    .inputs(t)
                    .outputs(t)
                    .attr("frame_name", AttrValue::S("loop".to_owned())),
            )
            .unwrap();
        let merge = g
            .add_node(NodeDef::new("merge", "Merge").inputs(t).outputs(t))
            .unwrap();
        let exit = g
            .add_node(NodeDef::new("exit", "Exit").inputs(t).outputs(t))
            .unwrap();
        let sink = g
            .add_node(NodeDef::new("sink", "Identity").inputs(t).outputs(t))
            .unwrap();
        g.add_edge(c, 0, enter, 0).unwrap();
        g.add_edge(enter, 0, merge, 0).unwrap();
        g.add_edge(merge, 0, exit, 0).unwrap();
        g.add_edge(exit, 0, sink, 0).unwrap();

        let cf = ControlFlowInfo::build(&g).unwrap();
        assert_eq!(cf.frame_name(c), "");
        // The Enter node itself belongs to the parent frame.
        assert_eq!(cf.frame_name(enter), "");
        assert_eq!(cf.frame_name(merge), "loop");
        assert_eq!(cf.frame_name(exit), "loop");
        assert_eq!(cf.frame_name(sink), "");
        assert!(cf.unique_frame_names.contains("loop"));
    }

    #[test]
    fn enter_without_frame_name_rejected() {
        let mut g = Graph::new();
        let t = &[DataType::Int64];
        let c = g
            .add_node(NodeDef::new("c", "Const").outputs(t))
            .unwrap();
        let enter = g
            .add_node(NodeDef::new("enter", "Enter").inputs(t).outputs(t))
            .unwrap();
        g.add_edge(c, 0, enter, 0).unwrap();
        assert!(ControlFlowInfo::build(&g).is_err());
    }
}
