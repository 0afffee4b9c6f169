//! Hypervisor session boundary
//!
//! Workflows only sequence calls against [`Hypervisor`]; the protocol behind
//! it lives in an implementation such as [`crate::govc::GovcClient`].

mod types;

pub use types::*;

use std::ops::Deref;
use std::path::Path;
use std::time::Duration;

use crate::devices::{DeviceChange, VirtualDevice};
use crate::models::{EndpointCredentials, VmIdentity};
use crate::Result;

/// Calls a workflow may make against a hypervisor management endpoint.
///
/// Lookups that can legitimately come back empty return `Ok(None)`; `Err`
/// is reserved for failed calls.
#[cfg_attr(test, mockall::automock)]
pub trait Hypervisor {
    fn connect(&self, endpoint: &str, username: &str, password: &str) -> Result<()>;

    fn disconnect(&self) -> Result<()>;

    fn find_vm_by_name(&self, name: &str) -> Result<Option<VmRef>>;

    /// Block until the guest tools report a heartbeat or `timeout` passes
    fn wait_for_guest_tools(&self, vm: &VmRef, timeout: Duration) -> Result<()>;

    /// Authenticate for subsequent guest operations on `vm`
    fn login_to_guest(&self, vm: &VmRef, username: &str, password: &str) -> Result<()>;

    fn list_guest_files(&self, vm: &VmRef, path: &str) -> Result<Vec<GuestFile>>;

    /// Guest network interfaces, read live rather than from a property cache
    fn guest_nics(&self, vm: &VmRef) -> Result<Vec<GuestNic>>;

    fn upload_file_to_guest(
        &self,
        vm: &VmRef,
        local_path: &Path,
        remote_path: &str,
        overwrite: bool,
    ) -> Result<()>;

    fn run_guest_process(&self, vm: &VmRef, binary: &str, args: &[String], cwd: &str) -> Result<()>;

    fn is_powered_off(&self, vm: &VmRef) -> Result<bool>;

    fn power_on(&self, vm: &VmRef) -> Result<()>;

    fn shutdown_guest(&self, vm: &VmRef) -> Result<()>;

    fn clone_vm(&self, template: &VmRef, name: &str, power_on: bool) -> Result<VmRef>;

    fn submit_create_vm(&self, spec: &VmCreateSpec) -> Result<TaskHandle>;

    fn submit_reconfigure_vm(&self, vm: &VmRef, changes: &[DeviceChange]) -> Result<TaskHandle>;

    fn poll_task(&self, task: &TaskHandle) -> Result<TaskState>;

    fn destroy_vm(&self, vm: &VmRef) -> Result<TaskHandle>;

    /// Current virtual hardware of `vm`
    fn vm_devices(&self, vm: &VmRef) -> Result<Vec<VirtualDevice>>;

    fn find_datacenter(&self, name: &str) -> Result<Option<Datacenter>>;

    fn find_host(&self, datacenter: &Datacenter, name: &str) -> Result<Option<ManagedRef>>;

    fn compute_resources(&self, datacenter: &Datacenter) -> Result<Vec<ComputeResource>>;

    fn query_config_target(
        &self,
        compute: &ComputeResource,
        host: &ManagedRef,
    ) -> Result<ConfigTarget>;

    fn query_default_devices(
        &self,
        compute: &ComputeResource,
        host: &ManagedRef,
    ) -> Result<Vec<DefaultDevice>>;
}

/// Connected hypervisor, disconnected when dropped
pub struct Session<'a> {
    hypervisor: &'a dyn Hypervisor,
    endpoint: String,
}

impl<'a> Session<'a> {
    pub fn open(
        hypervisor: &'a dyn Hypervisor,
        endpoint: &str,
        credentials: &EndpointCredentials,
    ) -> Result<Self> {
        tracing::info!(endpoint, user = %credentials.username, "Connecting");
        hypervisor.connect(endpoint, &credentials.username, &credentials.password)?;
        Ok(Self {
            hypervisor,
            endpoint: endpoint.to_string(),
        })
    }

    /// Connect to the endpoint that manages `identity`
    pub fn for_identity(hypervisor: &'a dyn Hypervisor, identity: &VmIdentity) -> Result<Self> {
        tracing::debug!(vm = %identity.name, "Opening session");
        Self::open(hypervisor, &identity.endpoint, &identity.credentials)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl<'a> Deref for Session<'a> {
    type Target = dyn Hypervisor + 'a;

    fn deref(&self) -> &Self::Target {
        self.hypervisor
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        match self.hypervisor.disconnect() {
            Ok(()) => tracing::info!(endpoint = %self.endpoint, "Disconnected"),
            Err(e) => tracing::warn!(endpoint = %self.endpoint, error = %e, "Disconnect failed"),
        }
    }
}
