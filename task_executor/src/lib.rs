// Copyright 2019 Loom project contributors (see CONTRIBUTORS.md).
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

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};

/// A unit of work posted to the pool.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

///
/// The shape of worker pool the scheduler is given: it posts closures and
/// owns no threads of its own. Cloning is cheap; every in-flight continuation
/// holds one.
///
pub type Runner = Arc<dyn Fn(Task) + Send + Sync + 'static>;

///
/// Executors come in two flavors:
/// * "borrowed"
///     * Created with `Self::new()`.
///     * A borrowed Executor will not shut its Runtime down when dropped;
///       it relies on the runtime that was current at creation (generally
///       the one tokio's test macros provide) outliving it.
/// * "owned"
///     * Created with `Self::new_owned()`.
///     * When all handles of an owned Executor are dropped, its Runtime is
///       shut down, and the explicit shutdown method can be used to bound
///       that wait.
///
#[derive(Clone)]
pub struct Executor {
    runtime: Arc<Mutex<Option<Runtime>>>,
    handle: Handle,
}

impl Executor {
    ///
    /// Creates an Executor for an existing tokio Runtime (generally provided
    /// by tokio's test macros). The owner of that Runtime must keep it alive
    /// longer than all Executor instances.
    ///
    pub fn new() -> Executor {
        Executor {
            runtime: Arc::new(Mutex::new(None)),
            handle: Handle::current(),
        }
    }

    ///
    /// Creates an Executor with an owned Runtime of `num_worker_threads`
    /// workers (zero means one per core).
    ///
    pub fn new_owned(num_worker_threads: usize) -> Result<Executor, String> {
        let workers = if num_worker_threads == 0 {
            num_cpus::get()
        } else {
            num_worker_threads
        };
        let runtime = Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name("loom-worker")
            .build()
            .map_err(|e| format!("Failed to start the runtime: {e}"))?;
        let handle = runtime.handle().clone();
        Ok(Executor {
            runtime: Arc::new(Mutex::new(Some(runtime))),
            handle,
        })
    }

    ///
    /// Posts a closure to the pool. Work posted this way runs to completion
    /// even if the caller never observes it.
    ///
    pub fn spawn(&self, task: Task) {
        self.handle.spawn(async move { task() });
    }

    ///
    /// The posting interface handed to a scheduler. Kernels and
    /// continuations dispatched through the returned Runner land on this
    /// Executor's workers.
    ///
    pub fn runner(&self) -> Runner {
        let executor = self.clone();
        Arc::new(move |task: Task| executor.spawn(task))
    }

    ///
    /// A blocking call to shut down the Runtime associated with this "owned"
    /// Executor. If tasks do not shut down within the given timeout, they
    /// are leaked. Has no effect for "borrowed" Executors.
    ///
    pub fn shutdown(&self, timeout: Duration) {
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };
        let start = Instant::now();
        runtime.shutdown_timeout(timeout + Duration::from_millis(250));
        if start.elapsed() > timeout {
            log::warn!("Executor shutdown took unexpectedly long: tasks were likely leaked!");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Executor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn borrowed_runner_runs_tasks() {
        let executor = Executor::new();
        let runner = executor.runner();
        let (send, recv) = mpsc::channel();
        runner(Box::new(move || send.send(42_usize).unwrap()));
        let value = tokio::task::spawn_blocking(move || {
            recv.recv_timeout(Duration::from_secs(5)).unwrap()
        })
        .await
        .unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn owned_runner_runs_tasks() {
        let executor = Executor::new_owned(2).unwrap();
        let runner = executor.runner();
        let counter = Arc::new(AtomicUsize::new(0));
        let (send, recv) = mpsc::channel();
        for _ in 0..8 {
            let counter = counter.clone();
            let send = send.clone();
            runner(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                send.send(()).unwrap();
            }));
        }
        for _ in 0..8 {
            recv.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
        executor.shutdown(Duration::from_secs(1));
    }
}
