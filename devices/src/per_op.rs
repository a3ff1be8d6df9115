// Copyright 2019 Loom project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use fnv::FnvHashMap as HashMap;
use parking_lot::Mutex;
use tensor::{Allocator, BufferHandle, RawBuffer};

use crate::resources::ResourceContext;

const NAME_PREFIX: &str = "PerOp_";

#[derive(Default)]
struct PerOpInner {
    allocated: HashMap<u64, usize>,
    last_failed_alloc_size: usize,
    peak_alloc_size: usize,
    current_alloc: usize,
    mismatched_releases: usize,
}

///
/// Wraps a device allocator for one kernel invocation, charging every
/// admission against a shared ResourceContext and recording per-buffer sizes
/// so the caller's admission layer can observe peaks and failures.
///
/// Shared by reference count between the scheduler, the kernel, and any
/// buffer the kernel produced; a buffer that outlives NodeDone keeps its
/// accounting alive with it.
///
pub struct PerOpAllocator {
    rctx: Arc<ResourceContext>,
    actual: Arc<dyn Allocator>,
    inner: Mutex<PerOpInner>,
}

impl PerOpAllocator {
    pub fn new(rctx: Arc<ResourceContext>, actual: Arc<dyn Allocator>) -> PerOpAllocator {
        PerOpAllocator {
            rctx,
            actual,
            inner: Mutex::new(PerOpInner::default()),
        }
    }

    pub fn resource_context(&self) -> &Arc<ResourceContext> {
        &self.rctx
    }

    /// The size of the most recent allocation the quota refused, zero if none
    /// was. The admission layer reads this to size its reaction.
    pub fn last_failed_alloc_size(&self) -> usize {
        self.inner.lock().last_failed_alloc_size
    }

    pub fn peak_alloc_size(&self) -> usize {
        self.inner.lock().peak_alloc_size
    }

    pub fn current_alloc(&self) -> usize {
        self.inner.lock().current_alloc
    }

    pub fn mismatched_releases(&self) -> usize {
        self.inner.lock().mismatched_releases
    }
}

impl Allocator for PerOpAllocator {
    fn name(&self) -> String {
        format!("{}{}", NAME_PREFIX, self.actual.name())
    }

    fn allocate_raw(&self, alignment: usize, num_bytes: usize) -> Option<RawBuffer> {
        if !self.rctx.try_allocate(num_bytes) {
            let mut inner = self.inner.lock();
            inner.last_failed_alloc_size = num_bytes;
            log::warn!(
                "allocation of {num_bytes} bytes from {} not admitted ({} of {} bytes in use)",
                self.actual.name(),
                self.rctx.used_bytes(),
                self.rctx.limit_bytes()
            );
            return None;
        }
        let raw = match self.actual.allocate_raw(alignment, num_bytes) {
            Some(raw) => raw,
            None => {
                self.rctx.release(num_bytes);
                let mut inner = self.inner.lock();
                inner.last_failed_alloc_size = num_bytes;
                return None;
            }
        };
        let mut inner = self.inner.lock();
        inner.allocated.insert(raw.handle.0, num_bytes);
        inner.current_alloc += num_bytes;
        inner.peak_alloc_size = inner.peak_alloc_size.max(inner.current_alloc);
        Some(raw)
    }

    fn deallocate_raw(&self, handle: BufferHandle) {
        {
            let mut inner = self.inner.lock();
            match inner.allocated.remove(&handle.0) {
                Some(size) => {
                    inner.current_alloc -= size;
                    self.rctx.release(size);
                }
                None => {
                    inner.mismatched_releases += 1;
                    log::debug!("released {handle:?}, which this allocator did not hand out");
                }
            }
        }
        self.actual.deallocate_raw(handle);
    }

    fn tracks_allocation_sizes(&self) -> bool {
        true
    }

    fn requested_size(&self, handle: BufferHandle) -> Option<usize> {
        let inner = self.inner.lock();
        match inner.allocated.get(&handle.0) {
            Some(&size) => Some(size),
            None => self.actual.requested_size(handle),
        }
    }

    fn allocation_id(&self, handle: BufferHandle) -> i64 {
        let inner = self.inner.lock();
        if inner.allocated.contains_key(&handle.0) {
            handle.0 as i64
        } else {
            self.actual.allocation_id(handle)
        }
    }

    fn should_allocate_empty_tensors(&self) -> bool {
        self.actual.should_allocate_empty_tensors()
    }
}

impl Drop for PerOpAllocator {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if !inner.allocated.is_empty() {
            log::warn!(
                "per-op allocator for {} dropped with {} live allocations",
                self.actual.name(),
                inner.allocated.len()
            );
            for (_, size) in inner.allocated.drain() {
                self.rctx.release(size);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PerOpAllocator;
    use crate::allocator::SystemAllocator;
    use crate::resources::ResourceContext;
    use std::sync::Arc;
    use tensor::Allocator;

    fn per_op(limit: usize) -> (Arc<ResourceContext>, PerOpAllocator) {
        let rctx = Arc::new(ResourceContext::new(limit));
        let actual: Arc<dyn Allocator> = Arc::new(SystemAllocator::new("CPU:0"));
        (rctx.clone(), PerOpAllocator::new(rctx, actual))
    }

    #[test]
    fn accounting() {
        let (rctx, alloc) = per_op(1024);
        let a = alloc.allocate_raw(8, 100).unwrap();
        let b = alloc.allocate_raw(8, 200).unwrap();
        assert_eq!(alloc.current_alloc(), 300);
        assert_eq!(alloc.peak_alloc_size(), 300);
        assert_eq!(alloc.requested_size(a.handle), Some(100));
        assert_eq!(rctx.used_bytes(), 300);

        alloc.deallocate_raw(a.handle);
        assert_eq!(alloc.current_alloc(), 200);
        // Peak never decreases.
        assert_eq!(alloc.peak_alloc_size(), 300);

        alloc.deallocate_raw(b.handle);
        assert_eq!(alloc.current_alloc(), 0);
        assert_eq!(rctx.used_bytes(), 0);
    }

    #[test]
    fn admission_failure_recorded() {
        let (rctx, alloc) = per_op(1024);
        assert!(alloc.allocate_raw(8, 4096).is_none());
        assert_eq!(alloc.last_failed_alloc_size(), 4096);
        assert_eq!(alloc.current_alloc(), 0);
        assert_eq!(rctx.used_bytes(), 0);
        // A later admitted allocation leaves the failure record in place.
        assert!(alloc.allocate_raw(8, 16).is_some());
        assert_eq!(alloc.last_failed_alloc_size(), 4096);
    }

    #[test]
    fn unknown_release_is_not_fatal() {
        let (_rctx, alloc) = per_op(1024);
        alloc.deallocate_raw(tensor::BufferHandle(999));
        assert_eq!(alloc.mismatched_releases(), 1);
    }
}
