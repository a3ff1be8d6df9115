// Copyright 2019 Loom project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;
use std::sync::Arc;

use devices::DeviceContext;
use parking_lot::Mutex;
use tensor::{AllocatorAttributes, Tensor};

///
/// What an input slot holds: nothing (the value is dead or not yet
/// produced), a tensor by value, or a mutable tensor behind a shared mutex
/// (reference-typed edges, e.g. variables).
///
#[derive(Clone, Default)]
pub enum EntryValue {
    #[default]
    Empty,
    Val(Tensor),
    Ref(Arc<Mutex<Tensor>>),
}

///
/// One slot of an iteration's input-tensor array. Written exactly once by
/// the source of its edge and taken exactly once by the destination; the
/// empty state doubles as the dead marker.
///
#[derive(Clone, Default)]
pub struct Entry {
    pub value: EntryValue,

    /// The attributes of the allocator that created the tensor.
    pub alloc_attr: AllocatorAttributes,

    /// Device-specific information about how the tensor was produced.
    pub device_context: Option<Arc<dyn DeviceContext>>,

    /// Name of the device that produced the tensor.
    pub producer_device: Option<String>,
}

impl Entry {
    pub fn from_tensor(t: Tensor) -> Entry {
        Entry {
            value: EntryValue::Val(t),
            ..Entry::default()
        }
    }

    pub fn has_value(&self) -> bool {
        !matches!(self.value, EntryValue::Empty)
    }

    /// Drops any held tensor, returning the slot to the empty state.
    pub fn clear(&mut self) {
        *self = Entry::default();
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.value {
            EntryValue::Empty => write!(f, "Entry(empty)"),
            EntryValue::Val(t) => write!(f, "Entry({t})"),
            EntryValue::Ref(_) => write!(f, "Entry(ref)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Entry, EntryValue};
    use tensor::Tensor;

    #[test]
    fn empty_is_dead() {
        let mut e = Entry::from_tensor(Tensor::scalar_i64(1));
        assert!(e.has_value());
        e.clear();
        assert!(!e.has_value());
        assert!(matches!(e.value, EntryValue::Empty));
    }
}
