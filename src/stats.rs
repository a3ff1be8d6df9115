// Copyright 2019 Loom project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde_derive::{Deserialize, Serialize};

///
/// Memory drawn through one allocator during a node's execution.
///
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AllocatorMemoryUsed {
    pub allocator_name: String,
    pub total_bytes: usize,
    pub peak_bytes: usize,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeOutput {
    pub slot: usize,
    pub num_bytes: usize,
}

///
/// Timing and memory instrumentation for one node execution. Times are
/// micros; the `rel` fields are relative to `all_start_micros`, matching the
/// timeline consumers this feeds.
///
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeExecStats {
    pub node_name: String,
    pub scheduled_micros: i64,
    pub all_start_micros: i64,
    pub op_start_rel_micros: i64,
    pub op_end_rel_micros: i64,
    pub all_end_rel_micros: i64,
    pub memory: Vec<AllocatorMemoryUsed>,
    pub outputs: Vec<NodeOutput>,
    pub timeline_label: String,
}

impl NodeExecStats {
    pub fn new(node_name: &str) -> NodeExecStats {
        NodeExecStats {
            node_name: node_name.to_owned(),
            ..NodeExecStats::default()
        }
    }
}

///
/// Helpers called from the scheduler. Every function tolerates an absent
/// stats record so call sites need no collector checks.
///
pub mod nodestats {
    use super::{AllocatorMemoryUsed, NodeExecStats, NodeOutput};
    use devices::PerOpAllocator;
    use tensor::Tensor;

    pub fn now_in_usec() -> i64 {
        super::now_in_usec()
    }

    pub fn set_scheduled(stats: &mut Option<NodeExecStats>, micros: i64) {
        if let Some(s) = stats {
            s.scheduled_micros = micros;
        }
    }

    pub fn set_all_start(stats: &mut Option<NodeExecStats>) {
        if let Some(s) = stats {
            s.all_start_micros = now_in_usec();
        }
    }

    pub fn set_op_start(stats: &mut Option<NodeExecStats>) {
        if let Some(s) = stats {
            s.op_start_rel_micros = now_in_usec() - s.all_start_micros;
        }
    }

    pub fn set_op_end(stats: &mut Option<NodeExecStats>) {
        if let Some(s) = stats {
            s.op_end_rel_micros = now_in_usec() - s.all_start_micros;
        }
    }

    pub fn set_all_end(stats: &mut Option<NodeExecStats>) {
        if let Some(s) = stats {
            s.all_end_rel_micros = now_in_usec() - s.all_start_micros;
        }
    }

    pub fn set_output(stats: &mut Option<NodeExecStats>, slot: usize, tensor: &Tensor) {
        if let Some(s) = stats {
            s.outputs.push(NodeOutput {
                slot,
                num_bytes: tensor.total_bytes(),
            });
        }
    }

    pub fn set_memory(stats: &mut Option<NodeExecStats>, allocator: &PerOpAllocator) {
        if let Some(s) = stats {
            s.memory.push(AllocatorMemoryUsed {
                allocator_name: tensor::Allocator::name(allocator),
                total_bytes: allocator.current_alloc(),
                peak_bytes: allocator.peak_alloc_size(),
            });
        }
    }

    ///
    /// Control-flow nodes get a label naming the frame and iteration they
    /// ran in; returns false for everything else, matching the original's
    /// "label only interesting nodes" behavior.
    ///
    pub fn set_timeline_label(
        stats: &mut Option<NodeExecStats>,
        op: &str,
        name: &str,
        frame_name: &str,
        iter: i64,
    ) -> bool {
        let is_control_flow = matches!(
            op,
            "Enter" | "Exit" | "Switch" | "Merge" | "NextIteration" | "LoopCond"
        );
        if let Some(s) = stats {
            if is_control_flow {
                s.timeline_label = format!("{name} = {op}(frame `{frame_name}` iter {iter})");
            }
        }
        is_control_flow
    }
}

fn now_in_usec() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeviceStepStats {
    pub device: String,
    pub node_stats: Vec<NodeExecStats>,
}

///
/// Collects per-node stats for one step, grouped by device. Borrowed from
/// the caller for the duration of the invocation.
///
pub struct StepStatsCollector {
    devices: Mutex<Vec<DeviceStepStats>>,
}

impl StepStatsCollector {
    pub fn new() -> StepStatsCollector {
        StepStatsCollector {
            devices: Mutex::new(Vec::new()),
        }
    }

    pub fn save(&self, device: &str, stats: NodeExecStats) {
        let mut devices = self.devices.lock();
        match devices.iter_mut().find(|d| d.device == device) {
            Some(d) => d.node_stats.push(stats),
            None => devices.push(DeviceStepStats {
                device: device.to_owned(),
                node_stats: vec![stats],
            }),
        }
    }

    pub fn step_stats(&self) -> Vec<DeviceStepStats> {
        self.devices.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::{nodestats, NodeExecStats, StepStatsCollector};

    #[test]
    fn collector_groups_by_device() {
        let c = StepStatsCollector::new();
        c.save("CPU:0", NodeExecStats::new("a"));
        c.save("CPU:0", NodeExecStats::new("b"));
        c.save("CPU:1", NodeExecStats::new("c"));
        let stats = c.step_stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].node_stats.len(), 2);
    }

    #[test]
    fn timeline_label_only_for_control_flow() {
        let mut stats = Some(NodeExecStats::new("m"));
        assert!(nodestats::set_timeline_label(&mut stats, "Merge", "m", "loop", 2));
        assert!(stats.unwrap().timeline_label.contains("iter 2"));

        let mut stats = Some(NodeExecStats::new("a"));
        assert!(!nodestats::set_timeline_label(&mut stats, "Add", "a", "", 0));
        assert!(stats.unwrap().timeline_label.is_empty());
    }
}
