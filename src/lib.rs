// Copyright 2019 Loom project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The multi-device executor: drives a frozen dataflow graph to completion,
//! propagating tensors (and deadness) along edges, tracking nested loop
//! frames and iterations, and dispatching kernels onto a caller-supplied
//! worker pool.

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

pub mod cancellation;
pub mod entry;
mod frame;
pub mod kernel;
pub mod kernels;
pub mod oplib;
pub mod rendezvous;
pub mod session;
pub mod stats;
mod state;

pub use crate::cancellation::CancellationManager;
pub use crate::entry::{Entry, EntryValue};
pub use crate::kernel::{
    AsyncDone, AsyncOpKernel, FunctionLibraryRuntime, KernelRegistry, OpKernel, OpKernelContext,
};
pub use crate::rendezvous::{LocalRendezvous, Rendezvous, RendezvousKey};
pub use crate::session::{
    FunctionCallFrame, ScopedStepContainer, Session, SessionMgr, SessionState, TensorStore,
};
pub use crate::state::{Args, DoneCallback, ExecutorImpl, MultiDeviceExecutorParams};
pub use crate::stats::{NodeExecStats, StepStatsCollector};

#[cfg(test)]
mod tests;
