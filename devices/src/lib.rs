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

mod allocator;
mod per_op;
mod resources;

pub use crate::allocator::SystemAllocator;
pub use crate::per_op::PerOpAllocator;
pub use crate::resources::ResourceContext;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use fnv::FnvHashMap as HashMap;
use status::{Result, Status};
use tensor::{Allocator, AllocatorAttributes, Tensor};

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct DeviceType(pub String);

impl DeviceType {
    pub fn cpu() -> DeviceType {
        DeviceType("CPU".to_owned())
    }

    pub fn gpu() -> DeviceType {
        DeviceType("GPU".to_owned())
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

///
/// Placement of a node, as written in a node def: a device type plus an
/// index, rendered `"CPU:0"`.
///
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct DeviceSpec {
    pub device_type: DeviceType,
    pub index: usize,
}

impl DeviceSpec {
    pub fn cpu(index: usize) -> DeviceSpec {
        DeviceSpec {
            device_type: DeviceType::cpu(),
            index,
        }
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.device_type, self.index)
    }
}

impl FromStr for DeviceSpec {
    type Err = Status;

    fn from_str(s: &str) -> Result<DeviceSpec> {
        let (ty, index) = s.rsplit_once(':').ok_or_else(|| {
            Status::invalid_argument(format!("malformed device spec `{s}`: expected `TYPE:index`"))
        })?;
        if ty.is_empty() {
            return Err(Status::invalid_argument(format!(
                "malformed device spec `{s}`: empty device type"
            )));
        }
        let index = index.parse::<usize>().map_err(|_| {
            Status::invalid_argument(format!("malformed device spec `{s}`: bad index"))
        })?;
        Ok(DeviceSpec {
            device_type: DeviceType(ty.to_owned()),
            index,
        })
    }
}

///
/// Device-specific information about how a tensor was produced, assigned per
/// node at the start of a step. Devices that execute in-line (the thread-pool
/// CPU device) use no contexts.
///
pub trait DeviceContext: Send + Sync {
    fn copy_tensor_in_same_device(&self, input: &Tensor) -> Result<Tensor>;
}

pub trait Device: Send + Sync {
    /// The fully qualified name, e.g. `"CPU:0"`.
    fn name(&self) -> &str;

    fn device_type(&self) -> &DeviceType;

    fn allocator(&self, attrs: AllocatorAttributes) -> Arc<dyn Allocator>;

    ///
    /// Returns the per-node device contexts for a step, indexed by node id.
    /// An empty vector means the device assigns no contexts.
    ///
    fn fill_context_map(&self, _num_nodes: usize) -> Result<Vec<Option<Arc<dyn DeviceContext>>>> {
        Ok(Vec::new())
    }

    ///
    /// Blocks until previously enqueued work has completed. Devices that
    /// retire work in `compute` itself have nothing to wait for.
    ///
    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

///
/// The set of devices visible to one executor, looked up by spec or by full
/// name. Registration order is stable and is the order reported to clients.
///
pub struct DeviceManager {
    devices: Vec<Arc<dyn Device>>,
    by_name: HashMap<String, usize>,
}

impl DeviceManager {
    pub fn new(devices: Vec<Arc<dyn Device>>) -> Result<DeviceManager> {
        let mut by_name = HashMap::default();
        for (i, d) in devices.iter().enumerate() {
            if by_name.insert(d.name().to_owned(), i).is_some() {
                return Err(Status::invalid_argument(format!(
                    "duplicate device name `{}`",
                    d.name()
                )));
            }
        }
        Ok(DeviceManager { devices, by_name })
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn Device>> {
        self.by_name
            .get(name)
            .map(|&i| self.devices[i].clone())
            .ok_or_else(|| Status::invalid_argument(format!("unknown device `{name}`")))
    }

    pub fn lookup_spec(&self, spec: &DeviceSpec) -> Result<Arc<dyn Device>> {
        self.lookup(&spec.to_string())
    }

    pub fn devices(&self) -> &[Arc<dyn Device>] {
        &self.devices
    }

    pub fn device_names(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.name().to_owned()).collect()
    }
}

///
/// A CPU device: kernels run on the worker that dequeued them, memory comes
/// from the process heap through the system allocator.
///
pub struct ThreadPoolDevice {
    name: String,
    device_type: DeviceType,
    allocator: Arc<dyn Allocator>,
}

impl ThreadPoolDevice {
    pub fn new(index: usize) -> ThreadPoolDevice {
        let device_type = DeviceType::cpu();
        let name = format!("{device_type}:{index}");
        ThreadPoolDevice {
            allocator: Arc::new(SystemAllocator::new(&name)),
            name,
            device_type,
        }
    }
}

impl Device for ThreadPoolDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn device_type(&self) -> &DeviceType {
        &self.device_type
    }

    fn allocator(&self, _attrs: AllocatorAttributes) -> Arc<dyn Allocator> {
        self.allocator.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::{DeviceManager, DeviceSpec, ThreadPoolDevice};
    use std::sync::Arc;

    #[test]
    fn device_spec_parse() {
        let spec: DeviceSpec = "CPU:1".parse().unwrap();
        assert_eq!(spec, DeviceSpec::cpu(1));
        assert_eq!(spec.to_string(), "CPU:1");
        assert!("CPU".parse::<DeviceSpec>().is_err());
        assert!(":0".parse::<DeviceSpec>().is_err());
        assert!("CPU:x".parse::<DeviceSpec>().is_err());
    }

    #[test]
    fn manager_lookup() {
        let mgr = DeviceManager::new(vec![
            Arc::new(ThreadPoolDevice::new(0)),
            Arc::new(ThreadPoolDevice::new(1)),
        ])
        .unwrap();
        assert_eq!(mgr.lookup_spec(&DeviceSpec::cpu(1)).unwrap().name(), "CPU:1");
        assert!(mgr.lookup("GPU:0").is_err());
        assert_eq!(mgr.device_names(), vec!["CPU:0", "CPU:1"]);
    }

    #[test]
    fn duplicate_devices_rejected() {
        let result = DeviceManager::new(vec![
            Arc::new(ThreadPoolDevice::new(0)),
            Arc::new(ThreadPoolDevice::new(0)),
        ]);
        assert!(result.is_err());
    }
}
