// Copyright 2019 Loom project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::atomic::{AtomicU64, Ordering};

use tensor::{Allocator, BufferHandle, RawBuffer};

///
/// The process-heap allocator backing CPU devices. Handles are only issued so
/// wrappers can key their bookkeeping; the storage itself is freed when the
/// owning buffer drops.
///
pub struct SystemAllocator {
    name: String,
    next_handle: AtomicU64,
}

impl SystemAllocator {
    pub fn new(device_name: &str) -> SystemAllocator {
        SystemAllocator {
            name: format!("system/{device_name}"),
            // Handle 0 is reserved for untracked buffers.
            next_handle: AtomicU64::new(1),
        }
    }
}

impl Allocator for SystemAllocator {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn allocate_raw(&self, _alignment: usize, num_bytes: usize) -> Option<RawBuffer> {
        let handle = BufferHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        Some(RawBuffer {
            handle,
            data: vec![0_u8; num_bytes].into_boxed_slice(),
        })
    }

    fn deallocate_raw(&self, _handle: BufferHandle) {}
}
