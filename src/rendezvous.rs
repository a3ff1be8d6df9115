// Copyright 2019 Loom project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

use fnv::FnvHashMap as HashMap;
use parking_lot::Mutex;
use status::{Result, Status};
use tensor::Tensor;

///
/// Addresses one value in flight between a Send and a Recv: the producing
/// and consuming devices, the edge name, and the (frame, iteration) the
/// transfer belongs to, so loop iterations do not collide.
///
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct RendezvousKey {
    pub src_device: String,
    pub dst_device: String,
    pub tensor_name: String,
    pub frame_id: u64,
    pub iter: i64,
}

impl fmt::Display for RendezvousKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{};{};{};{}:{}",
            self.src_device, self.dst_device, self.tensor_name, self.frame_id, self.iter
        )
    }
}

/// Invoked with the received value and its deadness, or with the abort
/// status.
pub type RecvDone = Box<dyn FnOnce(Result<(Option<Tensor>, bool)>) + Send + 'static>;

///
/// The channel Send/Recv kernels meet on. The executor borrows it from the
/// caller; delivery failures surface as Unavailable.
///
pub trait Rendezvous: Send + Sync {
    fn send(&self, key: RendezvousKey, value: Option<Tensor>, is_dead: bool) -> Result<()>;

    fn recv_async(&self, key: RendezvousKey, done: RecvDone);

    /// Fails every pending and future operation with `status`.
    fn start_abort(&self, status: Status);
}

enum Slot {
    Value(Option<Tensor>, bool),
    Waiter(RecvDone),
}

#[derive(Default)]
struct LocalInner {
    status: Option<Status>,
    slots: HashMap<String, Slot>,
}

///
/// In-process rendezvous: one slot per key, produced once and consumed once
/// per step. Whichever side arrives first parks in the table.
///
pub struct LocalRendezvous {
    inner: Mutex<LocalInner>,
}

impl LocalRendezvous {
    pub fn new() -> LocalRendezvous {
        LocalRendezvous {
            inner: Mutex::new(LocalInner::default()),
        }
    }
}

impl Rendezvous for LocalRendezvous {
    fn send(&self, key: RendezvousKey, value: Option<Tensor>, is_dead: bool) -> Result<()> {
        let waiter = {
            let mut inner = self.inner.lock();
            if let Some(status) = &inner.status {
                return Err(status.clone());
            }
            let key = key.to_string();
            match inner.slots.remove(&key) {
                Some(Slot::Waiter(done)) => Some(done),
                Some(Slot::Value(..)) => {
                    return Err(Status::internal(format!("duplicate send for key `{key}`")));
                }
                None => {
                    inner.slots.insert(key, Slot::Value(value.clone(), is_dead));
                    None
                }
            }
        };
        // Deliver outside the lock: the waiter re-enters the scheduler.
        if let Some(done) = waiter {
            done(Ok((value, is_dead)));
        }
        Ok(())
    }

    fn recv_async(&self, key: RendezvousKey, done: RecvDone) {
        let result = {
            let mut inner = self.inner.lock();
            if let Some(status) = &inner.status {
                Some(Err(status.clone()))
            } else {
                let key = key.to_string();
                match inner.slots.remove(&key) {
                    Some(Slot::Value(value, is_dead)) => Some(Ok((value, is_dead))),
                    Some(Slot::Waiter(prev)) => {
                        inner.slots.insert(key.clone(), Slot::Waiter(prev));
                        Some(Err(Status::internal(format!(
                            "duplicate recv for key `{key}`"
                        ))))
                    }
                    None => {
                        inner.slots.insert(key, Slot::Waiter(done));
                        return;
                    }
                }
            }
        };
        done(result.expect("checked above"));
    }

    fn start_abort(&self, status: Status) {
        let status = if status.is_ok() {
            Status::unavailable("rendezvous aborted")
        } else {
            status
        };
        let waiters: Vec<RecvDone> = {
            let mut inner = self.inner.lock();
            if inner.status.is_some() {
                return;
            }
            inner.status = Some(status.clone());
            inner
                .slots
                .drain()
                .filter_map(|(_, slot)| match slot {
                    Slot::Waiter(done) => Some(done),
                    Slot::Value(..) => None,
                })
                .collect()
        };
        for done in waiters {
            done(Err(status.clone()));
        }
    }
}
