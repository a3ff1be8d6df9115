// Copyright 2019 Loom project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use devices::{Device, DeviceContext, DeviceType, PerOpAllocator};
use fnv::FnvHashMap as HashMap;
use graph::NodeDef;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use status::{Result, Status};
use tensor::{Allocator, AllocatorAttributes, DataType, Tensor, TensorShape};

use crate::cancellation::CancellationManager;
use crate::rendezvous::Rendezvous;
use crate::session::{FunctionCallFrame, ScopedStepContainer, SessionState, TensorStore};
use crate::stats::NodeExecStats;

///
/// Everything a kernel sees while it runs: its materialized inputs, the
/// per-op allocator its outputs are charged to, and the per-step
/// collaborators borrowed from the caller. Synchronous kernels receive it by
/// reference; asynchronous kernels take it by value so the state survives
/// until their continuation fires.
///
pub struct OpKernelContext {
    pub step_id: u64,
    pub node_name: String,
    pub op: String,

    /// One slot per data input; None is a dead input.
    pub inputs: Vec<Option<Tensor>>,
    pub input_alloc_attrs: Vec<AllocatorAttributes>,
    pub input_device_contexts: Vec<Option<Arc<dyn DeviceContext>>>,
    pub is_input_dead: bool,

    pub device: Arc<dyn Device>,
    pub op_device_context: Option<Arc<dyn DeviceContext>>,
    pub allocator: Arc<PerOpAllocator>,

    pub rendezvous: Option<Arc<dyn Rendezvous>>,
    pub session_state: Option<Arc<SessionState>>,
    pub tensor_store: Option<Arc<TensorStore>>,
    pub step_container: Option<Arc<ScopedStepContainer>>,
    pub call_frame: Option<Arc<FunctionCallFrame>>,
    pub cancellation_manager: Option<Arc<CancellationManager>>,

    /// The (frame, iteration) the node runs in, for rendezvous keys.
    pub frame_id: u64,
    pub iter: i64,

    pub outputs: Vec<Option<Tensor>>,
    pub status: Status,
    pub stats: Option<NodeExecStats>,
}

impl OpKernelContext {
    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn input(&self, i: usize) -> Result<&Tensor> {
        self.inputs
            .get(i)
            .ok_or_else(|| {
                Status::internal(format!("node `{}` has no input {i}", self.node_name))
            })?
            .as_ref()
            .ok_or_else(|| {
                Status::failed_precondition(format!(
                    "input {i} of node `{}` is dead",
                    self.node_name
                ))
            })
    }

    pub fn input_is_dead(&self, i: usize) -> bool {
        self.inputs.get(i).map(|t| t.is_none()).unwrap_or(true)
    }

    pub fn set_output(&mut self, i: usize, tensor: Tensor) -> Result<()> {
        let slot = self.outputs.get_mut(i).ok_or_else(|| {
            Status::internal(format!("node `{}` has no output {i}", self.node_name))
        })?;
        if slot.is_some() {
            return Err(Status::internal(format!(
                "output {i} of node `{}` set twice",
                self.node_name
            )));
        }
        *slot = Some(tensor);
        Ok(())
    }

    ///
    /// Allocates through the per-op allocator. Refusal is a kernel error,
    /// not a panic: the recorded failure size lets the admission layer react.
    ///
    pub fn allocate_tensor(&self, dtype: DataType, shape: TensorShape) -> Result<Tensor> {
        let num_bytes = shape.num_elements() * dtype.element_size();
        let allocator: Arc<dyn Allocator> = self.allocator.clone();
        Tensor::allocate(dtype, shape, &allocator).ok_or_else(|| {
            Status::resource_exhausted(format!(
                "failed to allocate {num_bytes} bytes for node `{}`",
                self.node_name
            ))
        })
    }

    pub fn set_status(&mut self, status: Status) {
        self.status.update(status);
    }
}

///
/// A compiled kernel, instantiated once per (node, device) and cached for
/// the executor's lifetime. Implementations must be re-entrant: concurrent
/// iterations may run the same kernel object at once.
///
pub trait OpKernel: Send + Sync {
    fn compute(&self, ctx: &mut OpKernelContext) -> Result<()>;

    fn as_async(&self) -> Option<&dyn AsyncOpKernel> {
        None
    }
}

pub type AsyncDone = Box<dyn FnOnce(OpKernelContext) + Send + 'static>;

pub trait AsyncOpKernel: OpKernel {
    /// Takes the context by value; `done` must be invoked exactly once, from
    /// any thread, when the kernel's outputs (or its error) are in place.
    fn compute_async(&self, ctx: OpKernelContext, done: AsyncDone);
}

pub type KernelFactory = Box<dyn Fn(&NodeDef) -> Result<Arc<dyn OpKernel>> + Send + Sync>;

struct KernelRegistration {
    factory: KernelFactory,
    expensive: bool,
}

///
/// Process-wide registry of kernel factories keyed by (op, device type).
/// Standard kernels are registered on first access; tests and embedders add
/// their own.
///
pub struct KernelRegistry {
    registrations: RwLock<HashMap<(String, String), KernelRegistration>>,
}

static GLOBAL_REGISTRY: Lazy<KernelRegistry> = Lazy::new(|| {
    let registry = KernelRegistry {
        registrations: RwLock::new(HashMap::default()),
    };
    crate::kernels::register_standard_kernels(&registry);
    registry
});

pub fn global_registry() -> &'static KernelRegistry {
    &GLOBAL_REGISTRY
}

impl KernelRegistry {
    pub fn register(
        &self,
        op: &str,
        device_type: &DeviceType,
        expensive: bool,
        factory: KernelFactory,
    ) {
        let mut registrations = self.registrations.write();
        if registrations
            .insert(
                (op.to_owned(), device_type.0.clone()),
                KernelRegistration { factory, expensive },
            )
            .is_some()
        {
            log::warn!("kernel for op `{op}` on {device_type} registered twice; keeping the last");
        }
    }

    pub fn create_kernel(&self, def: &NodeDef, device_type: &DeviceType) -> Result<Arc<dyn OpKernel>> {
        let registrations = self.registrations.read();
        let registration = registrations
            .get(&(def.op.clone(), device_type.0.clone()))
            .ok_or_else(|| {
                Status::not_found(format!(
                    "no kernel registered for op `{}` on device type {device_type}",
                    def.op
                ))
            })?;
        (registration.factory)(def)
    }

    /// Whether any registration of `op` is marked expensive. Drives the
    /// inline-vs-Runner scheduling split.
    pub fn is_expensive(&self, op: &str) -> bool {
        self.registrations
            .read()
            .iter()
            .any(|((k_op, _), reg)| k_op == op && reg.expensive)
    }
}

///
/// Per-device kernel instantiation service, memoized per device by the
/// executor state. Device-resident state a kernel library needs would hang
/// off this.
///
pub struct FunctionLibraryRuntime {
    device: Arc<dyn Device>,
}

impl FunctionLibraryRuntime {
    pub fn new(device: Arc<dyn Device>) -> FunctionLibraryRuntime {
        FunctionLibraryRuntime { device }
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn create_kernel(&self, def: &NodeDef) -> Result<Arc<dyn OpKernel>> {
        global_registry().create_kernel(def, self.device.device_type())
    }
}
