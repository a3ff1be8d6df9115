// Copyright 2020 Loom project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The request dispatch layer enclosing the executor. Deliberately thin:
//! decode the envelope, look the session up, serialize the result. Handlers
//! must not retain the executor past the done callback.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde_derive::{Deserialize, Serialize};
use status::{Result, Status};
use tensor::TensorDef;

use crate::session::SessionMgr;
use crate::stats::DeviceStepStats;

///
/// The request envelope: a serialized payload identified by a type tag.
///
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub kind: String,
    pub payload: serde_json::Value,
}

pub type DoneHandler = Box<dyn FnOnce(Result<serde_json::Value>) + Send + 'static>;

///
/// A pluggable library of operations behind the dispatcher. Libraries are
/// registered process-wide with a priority; the highest-priority library
/// accepting a tag wins.
///
pub trait OpLibrary: Send + Sync {
    fn initialize(&self) -> bool {
        true
    }

    fn uninitialize(&self) {}

    fn accepts(&self, library: &str) -> bool;

    fn on_custom(&self, envelope: RequestEnvelope, done: DoneHandler);

    fn on_run_graph(&self, _envelope: RequestEnvelope, done: DoneHandler) {
        done(Err(Status::unimplemented("onRunGraph is not implemented")));
    }

    fn on_run(&self, _envelope: RequestEnvelope, done: DoneHandler) {
        done(Err(Status::unimplemented("onRun is not implemented")));
    }
}

struct Registration {
    library: String,
    priority: i32,
    lib: Arc<dyn OpLibrary>,
}

///
/// Process-wide registry of op libraries, initialized at startup and
/// released at shutdown.
///
pub struct OpLibraryRegistry {
    entries: RwLock<Vec<Registration>>,
}

static GLOBAL_OPLIB_REGISTRY: Lazy<OpLibraryRegistry> = Lazy::new(|| OpLibraryRegistry {
    entries: RwLock::new(Vec::new()),
});

pub fn global_oplib_registry() -> &'static OpLibraryRegistry {
    &GLOBAL_OPLIB_REGISTRY
}

impl OpLibraryRegistry {
    pub fn register(&self, library: &str, priority: i32, lib: Arc<dyn OpLibrary>) {
        if !lib.initialize() {
            log::error!("op library for `{library}` failed to initialize; not registered");
            return;
        }
        let mut entries = self.entries.write();
        entries.push(Registration {
            library: library.to_owned(),
            priority,
            lib,
        });
        entries.sort_by_key(|r| std::cmp::Reverse(r.priority));
    }

    /// The highest-priority library accepting `library`.
    pub fn find(&self, library: &str) -> Option<Arc<dyn OpLibrary>> {
        self.entries
            .read()
            .iter()
            .find(|r| r.lib.accepts(library))
            .map(|r| r.lib.clone())
    }

    pub fn shutdown(&self) {
        for r in self.entries.write().drain(..) {
            log::debug!("unregistering op library `{}`", r.library);
            r.lib.uninitialize();
        }
    }
}

pub const DATAFLOW_LIBRARY: &str = "dataflow";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NamedTensor {
    pub name: String,
    pub tensor: TensorDef,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub graph: graph::GraphDef,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_handle: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloseSessionRequest {
    pub session_handle: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListDevicesRequest {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListDevicesResponse {
    pub devices: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResetRequest {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtendSessionRequest {
    pub session_handle: String,
    pub graph: graph::GraphDef,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartialRunSetupRequest {
    pub session_handle: String,
    pub feeds: Vec<String>,
    pub fetches: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartialRunSetupResponse {
    pub partial_run_handle: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunStepRequest {
    pub session_handle: String,
    #[serde(default)]
    pub partial_run_handle: Option<String>,
    #[serde(default)]
    pub feeds: Vec<NamedTensor>,
    pub fetches: Vec<String>,
    #[serde(default)]
    pub collect_stats: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunStepResponse {
    pub tensors: Vec<NamedTensor>,
    #[serde(default)]
    pub step_stats: Option<Vec<DeviceStepStats>>,
}

///
/// The dataflow op library: routes the typed session requests into a
/// SessionMgr.
///
pub struct DataflowOpLibrary {
    session_mgr: Arc<SessionMgr>,
}

impl DataflowOpLibrary {
    pub fn new(session_mgr: Arc<SessionMgr>) -> DataflowOpLibrary {
        DataflowOpLibrary { session_mgr }
    }

    /// Registers at priority 200, the standard slot for the built-in
    /// library.
    pub fn register(session_mgr: Arc<SessionMgr>) {
        global_oplib_registry().register(
            DATAFLOW_LIBRARY,
            200,
            Arc::new(DataflowOpLibrary::new(session_mgr)),
        );
    }

    fn parse<T: serde::de::DeserializeOwned>(kind: &str, payload: serde_json::Value) -> Result<T> {
        serde_json::from_value(payload)
            .map_err(|e| Status::invalid_argument(format!("failed to parse message as {kind}: {e}")))
    }

    fn serialize<T: serde::Serialize>(response: &T) -> Result<serde_json::Value> {
        serde_json::to_value(response)
            .map_err(|e| Status::internal(format!("failed to serialize response: {e}")))
    }

    fn dispatch(&self, envelope: RequestEnvelope) -> Result<serde_json::Value> {
        match envelope.kind.as_str() {
            "dataflow.CreateSessionRequest" => {
                let req: CreateSessionRequest = Self::parse(&envelope.kind, envelope.payload)?;
                let session_handle = self.session_mgr.create_session(&req.graph)?;
                Self::serialize(&CreateSessionResponse { session_handle })
            }
            "dataflow.CloseSessionRequest" => {
                let req: CloseSessionRequest = Self::parse(&envelope.kind, envelope.payload)?;
                self.session_mgr.close_session(&req.session_handle)?;
                Self::serialize(&serde_json::json!({}))
            }
            "dataflow.ListDevicesRequest" => {
                let _req: ListDevicesRequest = Self::parse(&envelope.kind, envelope.payload)?;
                Self::serialize(&ListDevicesResponse {
                    devices: self.session_mgr.list_devices(),
                })
            }
            "dataflow.ResetRequest" => {
                let _req: ResetRequest = Self::parse(&envelope.kind, envelope.payload)?;
                self.session_mgr.reset();
                Self::serialize(&serde_json::json!({}))
            }
            "dataflow.ExtendSessionRequest" => {
                let req: ExtendSessionRequest = Self::parse(&envelope.kind, envelope.payload)?;
                let session = self.session_mgr.find_session(&req.session_handle)?;
                session.extend(&req.graph)?;
                Self::serialize(&serde_json::json!({}))
            }
            "dataflow.PartialRunSetupRequest" => {
                let req: PartialRunSetupRequest = Self::parse(&envelope.kind, envelope.payload)?;
                let session = self.session_mgr.find_session(&req.session_handle)?;
                let partial_run_handle = session.partial_run_setup(&req.feeds, &req.fetches)?;
                Self::serialize(&PartialRunSetupResponse { partial_run_handle })
            }
            "dataflow.RunStepRequest" => {
                let req: RunStepRequest = Self::parse(&envelope.kind, envelope.payload)?;
                let session = self.session_mgr.find_session(&req.session_handle)?;
                if let Some(handle) = &req.partial_run_handle {
                    // The setup is recorded, but delivering against it is
                    // not implemented.
                    session.partial_run_info(handle)?;
                    return Err(Status::unimplemented(
                        "partial run delivery is not implemented",
                    ));
                }
                let mut feeds = Vec::with_capacity(req.feeds.len());
                for feed in &req.feeds {
                    feeds.push((feed.name.clone(), feed.tensor.to_tensor()?));
                }
                let stats_collector = if req.collect_stats {
                    Some(Arc::new(crate::stats::StepStatsCollector::new()))
                } else {
                    None
                };
                let outputs = session.run_step_with_options(
                    &feeds,
                    &req.fetches,
                    stats_collector.clone(),
                    None,
                )?;
                let mut tensors = Vec::with_capacity(outputs.len());
                for (name, tensor) in &outputs {
                    tensors.push(NamedTensor {
                        name: name.clone(),
                        tensor: TensorDef::from_tensor(tensor)?,
                    });
                }
                Self::serialize(&RunStepResponse {
                    tensors,
                    step_stats: stats_collector.map(|c| c.step_stats()),
                })
            }
            other => Err(Status::invalid_argument(format!(
                "`{other}` not found in registered custom tasks"
            ))),
        }
    }
}

impl OpLibrary for DataflowOpLibrary {
    fn uninitialize(&self) {
        log::debug!("dataflow op library unloaded");
    }

    fn accepts(&self, library: &str) -> bool {
        library == DATAFLOW_LIBRARY
    }

    fn on_custom(&self, envelope: RequestEnvelope, done: DoneHandler) {
        log::debug!("dispatching custom task {}", envelope.kind);
        let result = self.dispatch(envelope);
        if let Err(e) = &result {
            log::error!("error executing custom task: {e}");
        }
        done(result);
    }
}
