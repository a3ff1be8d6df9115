// Copyright 2019 Loom project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use fnv::FnvHashMap as HashMap;
use parking_lot::Mutex;

pub type CancelCallback = Box<dyn FnOnce() + Send + 'static>;

///
/// Cooperative cancellation for one invocation. The scheduler polls
/// `is_cancelled` at node dispatch; long-running collaborators (rendezvous,
/// async kernels) register callbacks to be kicked when cancellation starts.
/// In-flight kernels are never forcibly aborted.
///
pub struct CancellationManager {
    cancelled: AtomicBool,
    next_token: AtomicU64,
    callbacks: Mutex<HashMap<u64, CancelCallback>>,
}

impl CancellationManager {
    pub fn new() -> CancellationManager {
        CancellationManager {
            cancelled: AtomicBool::new(false),
            next_token: AtomicU64::new(0),
            callbacks: Mutex::new(HashMap::default()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    ///
    /// Marks the manager cancelled and runs every registered callback. Only
    /// the first call does anything.
    ///
    pub fn start_cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let callbacks: Vec<_> = {
            let mut map = self.callbacks.lock();
            map.drain().map(|(_, cb)| cb).collect()
        };
        // Run outside the lock: callbacks may re-enter this manager.
        for cb in callbacks {
            cb();
        }
    }

    pub fn get_cancellation_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    ///
    /// Registers `callback` under `token`. Returns false (without
    /// registering) if cancellation has already started; the caller must
    /// then handle cancellation itself.
    ///
    pub fn register_callback(&self, token: u64, callback: CancelCallback) -> bool {
        let mut map = self.callbacks.lock();
        if self.is_cancelled() {
            return false;
        }
        map.insert(token, callback);
        true
    }

    /// Returns true if the callback was still registered (and is now not).
    pub fn deregister_callback(&self, token: u64) -> bool {
        self.callbacks.lock().remove(&token).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::CancellationManager;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn cancel_runs_callbacks_once() {
        let cm = CancellationManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let token = cm.get_cancellation_token();
        let hits2 = hits.clone();
        assert!(cm.register_callback(token, Box::new(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        })));

        cm.start_cancel();
        cm.start_cancel();
        assert!(cm.is_cancelled());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!cm.deregister_callback(token));
    }

    #[test]
    fn register_after_cancel_refused() {
        let cm = CancellationManager::new();
        cm.start_cancel();
        let token = cm.get_cancellation_token();
        assert!(!cm.register_callback(token, Box::new(|| {})));
    }
}
