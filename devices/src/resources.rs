// Copyright 2019 Loom project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use parking_lot::Mutex;

///
/// A byte quota shared by every allocation an invocation makes. Admission is
/// all-or-nothing: an allocation that would exceed the limit is refused and
/// the requester reports the failure, it does not block.
///
pub struct ResourceContext {
    limit_bytes: usize,
    used_bytes: Mutex<usize>,
}

impl ResourceContext {
    pub fn new(limit_bytes: usize) -> ResourceContext {
        ResourceContext {
            limit_bytes,
            used_bytes: Mutex::new(0),
        }
    }

    pub fn unbounded() -> ResourceContext {
        ResourceContext::new(usize::MAX)
    }

    pub fn limit_bytes(&self) -> usize {
        self.limit_bytes
    }

    pub fn used_bytes(&self) -> usize {
        *self.used_bytes.lock()
    }

    ///
    /// Attempts to admit an allocation of `num_bytes`. Returns false without
    /// side effects when the quota cannot cover it.
    ///
    pub fn try_allocate(&self, num_bytes: usize) -> bool {
        let mut used = self.used_bytes.lock();
        match used.checked_add(num_bytes) {
            Some(next) if next <= self.limit_bytes => {
                *used = next;
                true
            }
            _ => {
                log::trace!(
                    "resource context refused {num_bytes} bytes ({} of {} in use)",
                    *used,
                    self.limit_bytes
                );
                false
            }
        }
    }

    pub fn release(&self, num_bytes: usize) {
        let mut used = self.used_bytes.lock();
        debug_assert!(*used >= num_bytes, "released more than was allocated");
        *used = used.saturating_sub(num_bytes);
    }
}
