//! Data exchanged across the hypervisor session boundary

use serde::{Deserialize, Serialize};

use crate::devices::DeviceChange;

/// Reference to a managed object (datacenter, host, pool, folder, datastore)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManagedRef(pub String);

impl ManagedRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ManagedRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a virtual machine
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmRef(pub String);

impl VmRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VmRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque reference to an asynchronous hypervisor-side operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskHandle(pub String);

impl std::fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// State of a task as reported by the hypervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Success,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datacenter {
    pub name: String,
    pub reference: ManagedRef,
    pub vm_folder: ManagedRef,
    pub host_folder: ManagedRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeResource {
    pub reference: ManagedRef,
    pub hosts: Vec<ManagedRef>,
    pub resource_pool: ManagedRef,
    pub environment_browser: ManagedRef,
}

impl ComputeResource {
    pub fn owns(&self, host: &ManagedRef) -> bool {
        self.hosts.iter().any(|h| h == host)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatastoreInfo {
    pub name: String,
    pub accessible: bool,
    pub reference: ManagedRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub name: String,
    pub accessible: bool,
}

/// Datastores and networks usable by VMs on a host, in the order the
/// hypervisor reports them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigTarget {
    pub datastores: Vec<DatastoreInfo>,
    pub networks: Vec<NetworkInfo>,
}

/// Entry of the default device catalog for new VMs on a host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefaultDevice {
    IdeController { key: i32 },
    Other { type_name: String, key: i32 },
}

/// One guest network interface as reported by the guest tools
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestNic {
    #[serde(default, alias = "ipAddress", alias = "IpAddress")]
    pub ip_addresses: Vec<String>,
}

/// Entry returned by a guest file listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestFile {
    pub path: String,
}

/// Request to create a VM from raw hardware specs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmCreateSpec {
    pub name: String,
    pub annotation: String,
    pub memory_mb: u64,
    pub num_cpus: u32,
    pub guest_id: String,
    /// Datastore volume holding the VM files, `[datastore]`
    pub vm_path_name: String,
    pub device_changes: Vec<DeviceChange>,
    pub folder: ManagedRef,
    pub pool: ManagedRef,
    pub host: ManagedRef,
}
