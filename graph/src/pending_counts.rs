// Copyright 2018 Loom project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

///
/// Per-node activation counters for one frame. A `Layout` is built once while
/// the graph is flattened; each iteration then clones the frame's initialized
/// template. All operations on a live instance are serialized by the owning
/// frame's lock.
///
/// The pending value for a Merge node uses the low bit as "no live data input
/// has been consumed yet": Merge initializes to `1 + 2 * num_control_edges`,
/// control-edge arrivals decrement by 2, and the first live data arrival
/// clears bit 0 via `mark_live`. A Merge is therefore ready exactly when its
/// count reaches 0, or reaches 1 with every data input dead.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Handle(usize);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeState {
    PendingNotReady,
    PendingReady,
    Started,
    Completed,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
enum Marker {
    #[default]
    NotStarted,
    Started,
    Completed,
}

#[derive(Clone, Copy, Debug, Default)]
struct Counts {
    pending: u32,
    dead_count: u32,
    marker: Marker,
}

#[derive(Clone, Debug, Default)]
pub struct Layout {
    num_handles: usize,
}

impl Layout {
    /// `max_pending` and `max_dead` bound the values the handle's counters
    /// will ever hold; a packed representation would size its fields from
    /// them. See spec notes on `PendingCounts` packing.
    pub fn create_handle(&mut self, _max_pending: usize, _max_dead: usize) -> Handle {
        let h = Handle(self.num_handles);
        self.num_handles += 1;
        h
    }
}

#[derive(Clone, Debug, Default)]
pub struct PendingCounts {
    counts: Vec<Counts>,
}

impl PendingCounts {
    pub fn new(layout: &Layout) -> PendingCounts {
        PendingCounts {
            counts: vec![Counts::default(); layout.num_handles],
        }
    }

    pub fn set_initial_count(&mut self, h: Handle, pending: usize) {
        let c = &mut self.counts[h.0];
        c.pending = pending as u32;
        c.dead_count = 0;
        c.marker = Marker::NotStarted;
    }

    pub fn pending(&self, h: Handle) -> usize {
        self.counts[h.0].pending as usize
    }

    pub fn decrement_pending(&mut self, h: Handle, v: usize) -> usize {
        let c = &mut self.counts[h.0];
        debug_assert!(c.pending as usize >= v);
        c.pending -= v as u32;
        c.pending as usize
    }

    /// Marks a Merge node as having consumed a live data input.
    /// REQUIRES: the node behind `h` is a Merge node.
    pub fn mark_live(&mut self, h: Handle) {
        let c = &mut self.counts[h.0];
        if c.marker == Marker::NotStarted {
            c.pending &= !1;
        }
    }

    pub fn mark_started(&mut self, h: Handle) {
        let c = &mut self.counts[h.0];
        debug_assert_eq!(c.marker, Marker::NotStarted);
        c.marker = Marker::Started;
    }

    pub fn mark_completed(&mut self, h: Handle) {
        let c = &mut self.counts[h.0];
        debug_assert_eq!(c.marker, Marker::Started);
        c.marker = Marker::Completed;
    }

    pub fn node_state(&self, h: Handle) -> NodeState {
        let c = &self.counts[h.0];
        match c.marker {
            Marker::Started => NodeState::Started,
            Marker::Completed => NodeState::Completed,
            Marker::NotStarted => {
                if c.pending == 0 {
                    NodeState::PendingReady
                } else {
                    NodeState::PendingNotReady
                }
            }
        }
    }

    pub fn dead_count(&self, h: Handle) -> usize {
        self.counts[h.0].dead_count as usize
    }

    pub fn increment_dead_count(&mut self, h: Handle) {
        let c = &mut self.counts[h.0];
        if c.marker == Marker::NotStarted {
            c.dead_count += 1;
        }
    }

    ///
    /// One incoming activation: optionally count a dead input, consume one
    /// pending unit, and report the new `(pending, dead_count)` pair.
    ///
    pub fn adjust_for_activation(&mut self, h: Handle, increment_dead: bool) -> (usize, usize) {
        let c = &mut self.counts[h.0];
        debug_assert!(c.pending > 0);
        if increment_dead && c.marker == Marker::NotStarted {
            c.dead_count += 1;
        }
        c.pending -= 1;
        (c.pending as usize, c.dead_count as usize)
    }
}
