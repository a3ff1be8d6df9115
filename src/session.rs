// Copyright 2020 Loom project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use devices::{DeviceManager, ResourceContext};
use fnv::FnvHashMap as HashMap;
use graph::{ops, Graph, GraphDef};
use parking_lot::Mutex;
use status::{Result, Status};
use tensor::Tensor;

use crate::cancellation::CancellationManager;
use crate::rendezvous::LocalRendezvous;
use crate::state::{Args, ExecutorImpl, MultiDeviceExecutorParams};
use crate::stats::StepStatsCollector;

///
/// Positional feeds and fetches for one step: `_Arg` kernels read args by
/// index, `_Retval` kernels write retvals by index.
///
pub struct FunctionCallFrame {
    args: Vec<Tensor>,
    retvals: Mutex<Vec<Option<Tensor>>>,
}

impl FunctionCallFrame {
    pub fn new(args: Vec<Tensor>, num_retvals: usize) -> FunctionCallFrame {
        FunctionCallFrame {
            args,
            retvals: Mutex::new(vec![None; num_retvals]),
        }
    }

    pub fn num_args(&self) -> usize {
        self.args.len()
    }

    pub fn arg(&self, index: usize) -> Result<Tensor> {
        self.args.get(index).cloned().ok_or_else(|| {
            Status::invalid_argument(format!(
                "arg {index} requested but only {} were fed",
                self.args.len()
            ))
        })
    }

    pub fn set_retval(&self, index: usize, value: Tensor) -> Result<()> {
        let mut retvals = self.retvals.lock();
        let slot = retvals.get_mut(index).ok_or_else(|| {
            Status::invalid_argument(format!("retval {index} out of range"))
        })?;
        if slot.is_some() {
            return Err(Status::internal(format!("retval {index} set twice")));
        }
        *slot = Some(value);
        Ok(())
    }

    /// Takes the produced retvals; a missing one means its `_Retval` node
    /// never ran (for example because control flow killed it).
    pub fn consume_retvals(&self) -> Result<Vec<Tensor>> {
        let mut retvals = self.retvals.lock();
        retvals
            .iter_mut()
            .enumerate()
            .map(|(i, slot)| {
                slot.take()
                    .ok_or_else(|| Status::internal(format!("retval {i} was not produced")))
            })
            .collect()
    }
}

///
/// Named tensors that survive across steps of a session (used by reader ops
/// and their friends).
///
pub struct SessionState {
    tensors: Mutex<HashMap<String, Tensor>>,
}

impl SessionState {
    pub fn new() -> SessionState {
        SessionState {
            tensors: Mutex::new(HashMap::default()),
        }
    }

    pub fn get_tensor(&self, name: &str) -> Result<Tensor> {
        self.tensors
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("session tensor `{name}` not found")))
    }

    pub fn add_tensor(&self, name: &str, tensor: Tensor) -> Result<()> {
        match self.tensors.lock().insert(name.to_owned(), tensor) {
            None => Ok(()),
            Some(_) => Err(Status::invalid_argument(format!(
                "session tensor `{name}` already exists"
            ))),
        }
    }

    pub fn delete_tensor(&self, name: &str) -> Result<()> {
        self.tensors
            .lock()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Status::not_found(format!("session tensor `{name}` not found")))
    }
}

///
/// Tensors a step wants published into the session state, held back until
/// the step completes successfully.
///
pub struct TensorStore {
    tensors: Mutex<Vec<(String, Tensor)>>,
}

impl TensorStore {
    pub fn new() -> TensorStore {
        TensorStore {
            tensors: Mutex::new(Vec::new()),
        }
    }

    pub fn add_tensor(&self, name: &str, tensor: Tensor) {
        self.tensors.lock().push((name.to_owned(), tensor));
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.lock().is_empty()
    }

    pub fn save_tensors(&self, session_state: &SessionState) -> Result<()> {
        for (name, tensor) in self.tensors.lock().drain(..) {
            session_state.add_tensor(&name, tensor)?;
        }
        Ok(())
    }
}

///
/// Names the per-step resource scope kernels may park state in.
///
pub struct ScopedStepContainer {
    step_id: u64,
}

impl ScopedStepContainer {
    pub fn new(step_id: u64) -> ScopedStepContainer {
        ScopedStepContainer { step_id }
    }

    pub fn name(&self) -> String {
        format!("__per_step_{}", self.step_id)
    }
}

struct PartialRunState {
    feeds: Vec<String>,
    fetches: Vec<String>,
}

struct SessionInner {
    graph_def: GraphDef,
    executor: Arc<ExecutorImpl>,
    partial_runs: HashMap<String, PartialRunState>,
}

///
/// One client session: a graph, the executor built from it, and the state
/// shared between its steps.
///
pub struct Session {
    handle: String,
    device_mgr: Arc<DeviceManager>,
    resource_context: Arc<ResourceContext>,
    pool: task_executor::Executor,
    session_state: Arc<SessionState>,
    inner: Mutex<SessionInner>,
    next_step_id: AtomicU64,
    next_partial_handle: AtomicU64,
}

impl Session {
    fn build_executor(
        device_mgr: &Arc<DeviceManager>,
        resource_context: &Arc<ResourceContext>,
        graph_def: &GraphDef,
    ) -> Result<Arc<ExecutorImpl>> {
        let graph = Graph::from_graph_def(graph_def)?;
        ExecutorImpl::new(
            MultiDeviceExecutorParams {
                device_mgr: device_mgr.clone(),
                resource_context: resource_context.clone(),
            },
            graph,
        )
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn session_state(&self) -> &Arc<SessionState> {
        &self.session_state
    }

    ///
    /// Appends the nodes of `fragment` to the session's graph and rebuilds
    /// the executor. In-flight steps keep running against the executor they
    /// started with.
    ///
    pub fn extend(&self, fragment: &GraphDef) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut extended = inner.graph_def.clone();
        extended.nodes.extend(fragment.nodes.iter().cloned());
        let executor =
            Self::build_executor(&self.device_mgr, &self.resource_context, &extended)?;
        inner.graph_def = extended;
        inner.executor = executor;
        Ok(())
    }

    ///
    /// Records the feeds/fetches of a partial run and hands back its handle.
    /// Delivering against that handle is not implemented; see the dispatch
    /// layer.
    ///
    pub fn partial_run_setup(&self, feeds: &[String], fetches: &[String]) -> Result<String> {
        let handle = format!(
            "{}/partial/{}",
            self.handle,
            self.next_partial_handle.fetch_add(1, Ordering::Relaxed)
        );
        self.inner.lock().partial_runs.insert(
            handle.clone(),
            PartialRunState {
                feeds: feeds.to_vec(),
                fetches: fetches.to_vec(),
            },
        );
        Ok(handle)
    }

    /// The feeds and fetches recorded for a partial run handle.
    pub fn partial_run_info(&self, handle: &str) -> Result<(Vec<String>, Vec<String>)> {
        let inner = self.inner.lock();
        let state = inner.partial_runs.get(handle).ok_or_else(|| {
            Status::not_found(format!("partial run `{handle}` not found"))
        })?;
        Ok((state.feeds.clone(), state.fetches.clone()))
    }

    pub fn run_step(
        &self,
        feeds: &[(String, Tensor)],
        fetches: &[String],
    ) -> Result<Vec<(String, Tensor)>> {
        self.run_step_with_options(feeds, fetches, None, None)
    }

    ///
    /// Runs one step to completion: builds the call frame from `feeds`,
    /// drives the executor, and maps retvals back onto `fetches`. Blocks
    /// until the executor's done callback fires.
    ///
    pub fn run_step_with_options(
        &self,
        feeds: &[(String, Tensor)],
        fetches: &[String],
        stats_collector: Option<Arc<StepStatsCollector>>,
        cancellation_manager: Option<Arc<CancellationManager>>,
    ) -> Result<Vec<(String, Tensor)>> {
        let (executor, arg_indices, retval_indices) = {
            let inner = self.inner.lock();
            let mut arg_indices: HashMap<String, usize> = HashMap::default();
            let mut retval_indices: HashMap<String, usize> = HashMap::default();
            for node in &inner.graph_def.nodes {
                let index = node.def.attr_i64("index").unwrap_or(-1);
                if node.def.op == ops::ARG && index >= 0 {
                    arg_indices.insert(node.def.name.clone(), index as usize);
                } else if node.def.op == ops::RETVAL && index >= 0 {
                    retval_indices.insert(node.def.name.clone(), index as usize);
                }
            }
            (inner.executor.clone(), arg_indices, retval_indices)
        };

        let mut args = vec![Tensor::scalar_i64(0); arg_indices.len()];
        let mut fed = vec![false; arg_indices.len()];
        for (name, tensor) in feeds {
            let index = *arg_indices.get(name).ok_or_else(|| {
                Status::invalid_argument(format!("feed `{name}` does not name an _Arg node"))
            })?;
            if index >= args.len() {
                return Err(Status::invalid_argument(format!(
                    "arg index {index} of `{name}` out of range"
                )));
            }
            args[index] = tensor.clone();
            fed[index] = true;
        }
        if let Some(missing) = fed.iter().position(|f| !f) {
            return Err(Status::invalid_argument(format!(
                "no feed provided for arg {missing}"
            )));
        }

        let mut fetch_indices = Vec::with_capacity(fetches.len());
        for name in fetches {
            let index = *retval_indices.get(name).ok_or_else(|| {
                Status::invalid_argument(format!("fetch `{name}` does not name a _Retval node"))
            })?;
            fetch_indices.push(index);
        }

        let step_id = self.next_step_id.fetch_add(1, Ordering::Relaxed);
        let call_frame = Arc::new(FunctionCallFrame::new(args, retval_indices.len()));
        let tensor_store = Arc::new(TensorStore::new());
        let exec_args = Args {
            step_id,
            rendezvous: Some(Arc::new(LocalRendezvous::new())),
            session_state: Some(self.session_state.clone()),
            tensor_store: Some(tensor_store.clone()),
            step_container: Some(Arc::new(ScopedStepContainer::new(step_id))),
            stats_collector,
            call_frame: Some(call_frame.clone()),
            cancellation_manager,
            runner: self.pool.runner(),
            sync_on_finish: true,
        };

        let (send, recv) = crossbeam_channel::bounded(1);
        executor.run_async(
            exec_args,
            Box::new(move |status| {
                let _ = send.send(status);
            }),
        );
        let status = recv
            .recv()
            .map_err(|_| Status::internal("executor dropped its done callback"))?;
        if !status.is_ok() {
            return Err(status);
        }

        tensor_store.save_tensors(&self.session_state)?;
        let retvals = call_frame.consume_retvals()?;
        Ok(fetches
            .iter()
            .zip(fetch_indices)
            .map(|(name, index)| (name.clone(), retvals[index].clone()))
            .collect())
    }
}

///
/// Owns the sessions of one server process. Deliberately thin: decode,
/// look up, delegate.
///
pub struct SessionMgr {
    device_mgr: Arc<DeviceManager>,
    resource_context: Arc<ResourceContext>,
    pool: task_executor::Executor,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    next_handle: AtomicU64,
}

impl SessionMgr {
    pub fn new(
        device_mgr: Arc<DeviceManager>,
        resource_context: Arc<ResourceContext>,
        pool: task_executor::Executor,
    ) -> SessionMgr {
        SessionMgr {
            device_mgr,
            resource_context,
            pool,
            sessions: Mutex::new(HashMap::default()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn create_session(&self, graph_def: &GraphDef) -> Result<String> {
        let executor = Session::build_executor(
            &self.device_mgr,
            &self.resource_context,
            graph_def,
        )?;
        let handle = format!("session-{}", self.next_handle.fetch_add(1, Ordering::Relaxed));
        let session = Arc::new(Session {
            handle: handle.clone(),
            device_mgr: self.device_mgr.clone(),
            resource_context: self.resource_context.clone(),
            pool: self.pool.clone(),
            session_state: Arc::new(SessionState::new()),
            inner: Mutex::new(SessionInner {
                graph_def: graph_def.clone(),
                executor,
                partial_runs: HashMap::default(),
            }),
            next_step_id: AtomicU64::new(1),
            next_partial_handle: AtomicU64::new(1),
        });
        self.sessions.lock().insert(handle.clone(), session);
        log::debug!("created session {handle}");
        Ok(handle)
    }

    pub fn find_session(&self, handle: &str) -> Result<Arc<Session>> {
        self.sessions
            .lock()
            .get(handle)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("session `{handle}` not found")))
    }

    pub fn close_session(&self, handle: &str) -> Result<()> {
        self.sessions
            .lock()
            .remove(handle)
            .map(|_| ())
            .ok_or_else(|| Status::not_found(format!("session `{handle}` not found")))
    }

    pub fn list_devices(&self) -> Vec<String> {
        self.device_mgr.device_names()
    }

    /// Drops every session.
    pub fn reset(&self) {
        self.sessions.lock().clear();
    }
}
