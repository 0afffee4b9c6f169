//! VM creation, from raw hardware specs or by cloning a template

use uuid::Uuid;

use crate::config::CreateRequest;
use crate::devices::{
    build_cdrom_backing, build_creation_devices, connect_cdrom_changes, find_ide_controller,
    iso_file_name, select_datastore, select_network, set_cdrom_backing, volume_name,
    CdromBackingKind, CreationContext, DeviceChange,
};
use crate::hypervisor::{
    ComputeResource, ConfigTarget, Datacenter, DefaultDevice, Hypervisor, ManagedRef, VmCreateSpec,
    VmRef,
};
use crate::models::VmLifecycle;
use crate::poll::{PollConfig, Poller};
use crate::task::{TaskRunner, DEFAULT_TASK_POLL};
use crate::workflow::steps::{StepChain, StepFailure};
use crate::{Error, Result};

/// Where a new VM goes, as resolved from the endpoint
#[derive(Debug, Clone)]
pub struct Placement {
    pub datacenter: Datacenter,
    pub host: ManagedRef,
    pub compute: ComputeResource,
    pub config_target: ConfigTarget,
    pub default_devices: Vec<DefaultDevice>,
}

/// Outcome of a creation run that got as far as a VM existing
#[derive(Debug, Clone)]
pub struct CreateReport {
    pub vm_name: String,
    pub vm: VmRef,
    pub lifecycle: VmLifecycle,
    pub media_connected: bool,
    /// Non-fatal failures after the VM existed, in order
    pub failures: Vec<StepFailure>,
}

impl CreateReport {
    pub fn last_error(&self) -> Option<&str> {
        self.failures.last().map(|f| f.error.as_str())
    }
}

pub struct VmCreator<'a> {
    hypervisor: &'a dyn Hypervisor,
    poller: Poller<'a>,
    task_poll: PollConfig,
}

impl<'a> VmCreator<'a> {
    pub fn new(hypervisor: &'a dyn Hypervisor, poller: Poller<'a>) -> Self {
        Self {
            hypervisor,
            poller,
            task_poll: DEFAULT_TASK_POLL,
        }
    }

    pub fn with_task_poll(mut self, config: PollConfig) -> Self {
        self.task_poll = config;
        self
    }

    fn tasks(&self) -> TaskRunner<'a> {
        TaskRunner::new(self.hypervisor, self.poller).with_config(self.task_poll)
    }

    /// Create a VM from raw hardware specs and boot it from the ISO.
    pub fn create(&self, request: &CreateRequest) -> Result<CreateReport> {
        let span = tracing::info_span!("create", run_id = %Uuid::new_v4(), vm = %request.name);
        let _enter = span.enter();

        request.validate()?;

        let placement = self.resolve_placement(&request.datacenter, &request.host)?;
        let datastore =
            select_datastore(&placement.config_target.datastores, request.datastore.as_deref())?;
        let network = select_network(&placement.config_target.networks);
        tracing::info!(
            datastore = %datastore.name,
            network = network.map(|n| n.name.as_str()).unwrap_or("<none>"),
            "Resolved placement"
        );

        let ctx = CreationContext {
            datastore: datastore.clone(),
            network_name: network.map(|n| n.name.clone()),
            iso_path: request.iso.clone(),
            disk_kb: request.disk_kb,
            ide_controller_key: find_ide_controller(&placement.default_devices),
            nic_model: request.nic_model,
            mac_address: request.mac_address.clone(),
        };

        let spec = VmCreateSpec {
            name: request.name.clone(),
            annotation: request.annotation.clone(),
            memory_mb: request.memory_mb,
            num_cpus: request.num_cpus,
            guest_id: request.guest_id.clone(),
            vm_path_name: volume_name(&datastore.name),
            device_changes: build_creation_devices(&ctx),
            folder: placement.datacenter.vm_folder.clone(),
            pool: placement.compute.resource_pool.clone(),
            host: placement.host.clone(),
        };

        tracing::info!(devices = spec.device_changes.len(), "Submitting VM creation");
        let task = self.hypervisor.submit_create_vm(&spec)?;
        self.tasks().complete(&task, Error::VmCreationFailed)?;
        tracing::info!("VM created");

        let vm = self.locate(&request.name)?;
        Ok(self.finish(&request.name, vm, None))
    }

    /// Clone a template, point its CD-ROM at the ISO and boot it.
    pub fn clone_from_template(&self, request: &CreateRequest) -> Result<CreateReport> {
        let span = tracing::info_span!("clone", run_id = %Uuid::new_v4(), vm = %request.name);
        let _enter = span.enter();

        request.validate()?;
        let (template_name, datastore) = match (&request.template, &request.datastore) {
            (Some(t), Some(d)) => (t.as_str(), d.as_str()),
            _ => return Err(Error::Config("cloning needs a template and a datastore".into())),
        };

        let template = self
            .hypervisor
            .find_vm_by_name(template_name)?
            .ok_or_else(|| Error::TemplateNotFound(template_name.to_string()))?;

        tracing::info!(template = %template_name, "Cloning template");
        let clone = self.hypervisor.clone_vm(&template, &request.name, false)?;

        let devices = self.hypervisor.vm_devices(&clone)?;
        let media = match devices.into_iter().find(|d| d.is_cdrom()) {
            Some(mut cdrom) => {
                let iso = iso_file_name(datastore, &request.iso);
                set_cdrom_backing(&mut cdrom, build_cdrom_backing(CdromBackingKind::Iso, &iso))?;
                tracing::info!(iso = %iso, "Pointing CD-ROM at ISO");
                Some(DeviceChange::edit(cdrom))
            }
            None => {
                tracing::warn!("Clone has no CD-ROM device, leaving media untouched");
                None
            }
        };

        let vm = self.locate(&request.name)?;
        Ok(self.finish(&request.name, vm, media))
    }

    /// Resolve datacenter, host, compute resource and host catalogs.
    pub fn resolve_placement(&self, datacenter: &str, host: &str) -> Result<Placement> {
        let datacenter = self
            .hypervisor
            .find_datacenter(datacenter)?
            .ok_or_else(|| Error::DatacenterNotFound(datacenter.to_string()))?;

        let host_ref = self
            .hypervisor
            .find_host(&datacenter, host)?
            .ok_or_else(|| Error::HostNotFound(host.to_string()))?;

        let compute = self
            .hypervisor
            .compute_resources(&datacenter)?
            .into_iter()
            .find(|cr| cr.owns(&host_ref))
            .ok_or_else(|| Error::ComputeResourceNotFound(host.to_string()))?;

        let config_target = self.hypervisor.query_config_target(&compute, &host_ref)?;
        let default_devices = self.hypervisor.query_default_devices(&compute, &host_ref)?;

        Ok(Placement {
            datacenter,
            host: host_ref,
            compute,
            config_target,
            default_devices,
        })
    }

    /// A VM that was just created but cannot be found is left for an operator to clean up.
    fn locate(&self, name: &str) -> Result<VmRef> {
        match self.hypervisor.find_vm_by_name(name)? {
            Some(vm) => Ok(vm),
            None => {
                tracing::error!(vm = %name, "Failed to locate the new VM, not rolling back");
                Err(Error::VmNotFound(name.to_string()))
            }
        }
    }

    /// Boot the new VM. `media` is a CD-ROM edit applied first; a failure
    /// there is recorded and the VM still boots.
    fn finish(&self, name: &str, vm: VmRef, media: Option<DeviceChange>) -> CreateReport {
        let tasks = self.tasks();
        let mut media_connected = false;
        let mut powered_on = false;

        let mut chain = StepChain::new("boot");
        if let Some(change) = media {
            let (tasks, vm) = (&tasks, &vm);
            chain = chain.step("set ISO", move || {
                tasks.reconfigure(vm, std::slice::from_ref(&change)).map_err(|e| {
                    tracing::error!(error = %e, "Error reconfiguring vm");
                    e
                })
            });
        }
        let report = chain
            .step("connect CD-ROMs", || {
                let changes = connect_cdrom_changes(&self.hypervisor.vm_devices(&vm)?);
                tasks.reconfigure(&vm, &changes)?;
                media_connected = true;
                Ok(())
            })
            .step("power on", || {
                self.hypervisor.power_on(&vm)?;
                powered_on = true;
                Ok(())
            })
            .run();

        let lifecycle = if powered_on {
            VmLifecycle::PoweredOn
        } else {
            VmLifecycle::Provisioning
        };
        tracing::info!(vm = %name, state = %lifecycle, "Creation finished");

        CreateReport {
            vm_name: name.to_string(),
            vm,
            lifecycle,
            media_connected,
            failures: report.failures(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{CdromBacking, DeviceKind, Operation, VirtualDevice};
    use crate::hypervisor::{DatastoreInfo, MockHypervisor, NetworkInfo, TaskHandle, TaskState};
    use crate::poll::SimulatedClock;

    fn datacenter() -> Datacenter {
        Datacenter {
            name: "DC1".into(),
            reference: ManagedRef::new("/DC1"),
            vm_folder: ManagedRef::new("/DC1/vm"),
            host_folder: ManagedRef::new("/DC1/host"),
        }
    }

    fn compute() -> ComputeResource {
        ComputeResource {
            reference: ManagedRef::new("/DC1/host/cluster"),
            hosts: vec![ManagedRef::new("/DC1/host/cluster/esx-01")],
            resource_pool: ManagedRef::new("/DC1/host/cluster/Resources"),
            environment_browser: ManagedRef::new("/DC1/host/cluster"),
        }
    }

    fn request() -> CreateRequest {
        CreateRequest::builder()
            .name("web-01")
            .datacenter("DC1")
            .host("esx-01")
            .iso("iso/centos.iso")
            .build()
    }

    fn cdrom(key: i32) -> VirtualDevice {
        VirtualDevice {
            key,
            controller_key: Some(200),
            unit_number: Some(0),
            connectable: None,
            kind: DeviceKind::Cdrom {
                backing: CdromBacking::ClientDevice,
            },
        }
    }

    fn expect_placement(mock: &mut MockHypervisor) {
        mock.expect_find_datacenter().returning(|_| Ok(Some(datacenter())));
        mock.expect_find_host()
            .returning(|_, _| Ok(Some(ManagedRef::new("/DC1/host/cluster/esx-01"))));
        mock.expect_compute_resources().returning(|_| Ok(vec![compute()]));
        mock.expect_query_config_target().returning(|_, _| {
            Ok(ConfigTarget {
                datastores: vec![DatastoreInfo {
                    name: "datastore1".into(),
                    accessible: true,
                    reference: ManagedRef::new("/DC1/datastore/datastore1"),
                }],
                networks: vec![
                    NetworkInfo { name: "VM Network".into(), accessible: true },
                    NetworkInfo { name: "Lab".into(), accessible: true },
                ],
            })
        });
        mock.expect_query_default_devices()
            .returning(|_, _| Ok(vec![DefaultDevice::IdeController { key: 200 }]));
    }

    fn creator<'a>(mock: &'a MockHypervisor, clock: &'a SimulatedClock) -> VmCreator<'a> {
        VmCreator::new(mock, Poller::new(clock))
    }

    #[test]
    fn test_create_happy_path() {
        let mut mock = MockHypervisor::new();
        expect_placement(&mut mock);
        mock.expect_submit_create_vm()
            .withf(|spec: &VmCreateSpec| {
                spec.vm_path_name == "[datastore1]"
                    && spec.device_changes.len() == 4
                    && spec.pool.as_str() == "/DC1/host/cluster/Resources"
                    && spec.folder.as_str() == "/DC1/vm"
                    && spec.guest_id == "centos64Guest"
                    && matches!(
                        &spec.device_changes[3].device.kind,
                        DeviceKind::NetworkAdapter { backing, .. } if backing.device_name == "Lab"
                    )
            })
            .times(1)
            .returning(|_| Ok(TaskHandle("create-1".into())));
        mock.expect_poll_task().returning(|_| Ok(TaskState::Success));
        mock.expect_find_vm_by_name()
            .returning(|_| Ok(Some(VmRef::new("vm-100"))));
        mock.expect_vm_devices().returning(|_| Ok(vec![cdrom(3000)]));
        mock.expect_submit_reconfigure_vm()
            .withf(|_, changes: &[DeviceChange]| {
                changes.len() == 1
                    && changes[0].operation == Operation::Edit
                    && changes[0].device.connectable.map(|c| c.connected && c.start_connected)
                        == Some(true)
            })
            .times(1)
            .returning(|_, _| Ok(TaskHandle("reconf-1".into())));
        mock.expect_power_on().times(1).returning(|_| Ok(()));

        let clock = SimulatedClock::new();
        let report = creator(&mock, &clock).create(&request()).unwrap();

        assert_eq!(report.vm, VmRef::new("vm-100"));
        assert_eq!(report.lifecycle, VmLifecycle::PoweredOn);
        assert!(report.media_connected);
        assert!(report.failures.is_empty());
    }

    #[test]
    fn test_missing_iso_fails_before_any_call() {
        let mock = MockHypervisor::new();
        let clock = SimulatedClock::new();
        let request = CreateRequest::builder()
            .name("web-01")
            .datacenter("DC1")
            .host("esx-01")
            .build();

        let err = creator(&mock, &clock).create(&request).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_host_not_found_is_fatal() {
        let mut mock = MockHypervisor::new();
        mock.expect_find_datacenter().returning(|_| Ok(Some(datacenter())));
        mock.expect_find_host().returning(|_, _| Ok(None));
        mock.expect_submit_create_vm().times(0);

        let clock = SimulatedClock::new();
        let err = creator(&mock, &clock).create(&request()).unwrap_err();
        assert!(matches!(err, Error::HostNotFound(h) if h == "esx-01"));
    }

    #[test]
    fn test_host_without_compute_resource_is_fatal() {
        let mut mock = MockHypervisor::new();
        mock.expect_find_datacenter().returning(|_| Ok(Some(datacenter())));
        mock.expect_find_host()
            .returning(|_, _| Ok(Some(ManagedRef::new("/DC1/host/orphan"))));
        mock.expect_compute_resources().returning(|_| Ok(vec![compute()]));
        mock.expect_submit_create_vm().times(0);

        let clock = SimulatedClock::new();
        let err = creator(&mock, &clock).create(&request()).unwrap_err();
        assert!(matches!(err, Error::ComputeResourceNotFound(_)));
    }

    #[test]
    fn test_unknown_datastore_is_fatal() {
        let mut mock = MockHypervisor::new();
        expect_placement(&mut mock);
        mock.expect_submit_create_vm().times(0);

        let mut request = request();
        request.datastore = Some("datastore9".into());

        let clock = SimulatedClock::new();
        let err = creator(&mock, &clock).create(&request).unwrap_err();
        assert!(matches!(err, Error::DatastoreNotFound(d) if d == "datastore9"));
    }

    #[test]
    fn test_create_task_error_is_verbatim() {
        let mut mock = MockHypervisor::new();
        expect_placement(&mut mock);
        mock.expect_submit_create_vm()
            .returning(|_| Ok(TaskHandle("create-1".into())));
        mock.expect_poll_task()
            .returning(|_| Ok(TaskState::Error("The name 'web-01' already exists.".into())));
        mock.expect_find_vm_by_name().times(0);

        let clock = SimulatedClock::new();
        let err = creator(&mock, &clock).create(&request()).unwrap_err();
        match err {
            Error::VmCreationFailed(msg) => assert_eq!(msg, "The name 'web-01' already exists."),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_unlocatable_vm_is_not_rolled_back() {
        let mut mock = MockHypervisor::new();
        expect_placement(&mut mock);
        mock.expect_submit_create_vm()
            .returning(|_| Ok(TaskHandle("create-1".into())));
        mock.expect_poll_task().returning(|_| Ok(TaskState::Success));
        mock.expect_find_vm_by_name().returning(|_| Ok(None));
        mock.expect_destroy_vm().times(0);
        mock.expect_power_on().times(0);

        let clock = SimulatedClock::new();
        let err = creator(&mock, &clock).create(&request()).unwrap_err();
        assert!(matches!(err, Error::VmNotFound(_)));
    }

    #[test]
    fn test_power_on_failure_is_reported_not_fatal() {
        let mut mock = MockHypervisor::new();
        expect_placement(&mut mock);
        mock.expect_submit_create_vm()
            .returning(|_| Ok(TaskHandle("create-1".into())));
        mock.expect_poll_task().returning(|_| Ok(TaskState::Success));
        mock.expect_find_vm_by_name()
            .returning(|_| Ok(Some(VmRef::new("vm-100"))));
        mock.expect_vm_devices().returning(|_| Ok(vec![]));
        mock.expect_submit_reconfigure_vm().times(0);
        mock.expect_power_on()
            .returning(|_| Err(Error::Hypervisor("insufficient resources".into())));

        let clock = SimulatedClock::new();
        let report = creator(&mock, &clock).create(&request()).unwrap();

        assert_eq!(report.lifecycle, VmLifecycle::Provisioning);
        assert!(report.media_connected);
        assert!(report.last_error().unwrap().contains("insufficient resources"));
    }

    #[test]
    fn test_clone_missing_template_is_fatal() {
        let mut mock = MockHypervisor::new();
        mock.expect_find_vm_by_name().returning(|_| Ok(None));
        mock.expect_clone_vm().times(0);

        let request = CreateRequest::builder()
            .name("web-02")
            .template("centos-template")
            .datastore("datastore1")
            .iso("iso/centos.iso")
            .build();

        let clock = SimulatedClock::new();
        let err = creator(&mock, &clock).clone_from_template(&request).unwrap_err();
        assert!(matches!(err, Error::TemplateNotFound(t) if t == "centos-template"));
    }

    #[test]
    fn test_clone_points_first_cdrom_at_iso() {
        let mut mock = MockHypervisor::new();
        mock.expect_find_vm_by_name()
            .withf(|name| name == "centos-template")
            .returning(|_| Ok(Some(VmRef::new("vm-tmpl"))));
        mock.expect_find_vm_by_name()
            .withf(|name| name == "web-02")
            .returning(|_| Ok(Some(VmRef::new("vm-200"))));
        mock.expect_clone_vm()
            .withf(|_, name, power_on| name == "web-02" && !*power_on)
            .times(1)
            .returning(|_, _, _| Ok(VmRef::new("vm-200")));
        mock.expect_vm_devices()
            .returning(|_| Ok(vec![cdrom(3000), cdrom(3001)]));
        mock.expect_submit_reconfigure_vm()
            .withf(|_, changes: &[DeviceChange]| {
                changes.len() == 1
                    && changes[0].device.key == 3000
                    && changes[0].device.cdrom_backing()
                        == Some(&CdromBacking::Iso {
                            file_name: "[datastore1] iso/centos.iso".into(),
                            datastore: None,
                        })
            })
            .times(1)
            .returning(|_, _| Ok(TaskHandle("reconf-iso".into())));
        mock.expect_submit_reconfigure_vm()
            .withf(|_, changes: &[DeviceChange]| changes.len() == 2)
            .times(1)
            .returning(|_, _| Ok(TaskHandle("reconf-connect".into())));
        mock.expect_poll_task().returning(|_| Ok(TaskState::Success));
        mock.expect_power_on().times(1).returning(|_| Ok(()));

        let request = CreateRequest::builder()
            .name("web-02")
            .template("centos-template")
            .datastore("datastore1")
            .iso("iso/centos.iso")
            .build();

        let clock = SimulatedClock::new();
        let report = creator(&mock, &clock).clone_from_template(&request).unwrap();
        assert_eq!(report.vm, VmRef::new("vm-200"));
        assert_eq!(report.lifecycle, VmLifecycle::PoweredOn);
    }

    #[test]
    fn test_clone_iso_rewrite_failure_still_boots() {
        let mut mock = MockHypervisor::new();
        mock.expect_find_vm_by_name()
            .withf(|name| name == "centos-template")
            .returning(|_| Ok(Some(VmRef::new("vm-tmpl"))));
        mock.expect_find_vm_by_name()
            .withf(|name| name == "web-02")
            .returning(|_| Ok(Some(VmRef::new("vm-200"))));
        mock.expect_clone_vm()
            .returning(|_, _, _| Ok(VmRef::new("vm-200")));
        mock.expect_vm_devices().returning(|_| Ok(vec![cdrom(3000)]));
        mock.expect_submit_reconfigure_vm()
            .withf(|_, changes: &[DeviceChange]| {
                matches!(changes[0].device.cdrom_backing(), Some(CdromBacking::Iso { .. }))
            })
            .times(1)
            .returning(|_, _| Ok(TaskHandle("reconf-iso".into())));
        mock.expect_submit_reconfigure_vm()
            .withf(|_, changes: &[DeviceChange]| {
                changes[0].device.cdrom_backing() == Some(&CdromBacking::ClientDevice)
            })
            .times(1)
            .returning(|_, _| Ok(TaskHandle("reconf-connect".into())));
        mock.expect_poll_task()
            .withf(|task| task.0 == "reconf-iso")
            .returning(|_| Ok(TaskState::Error("Invalid datastore path".into())));
        mock.expect_poll_task()
            .withf(|task| task.0 != "reconf-iso")
            .returning(|_| Ok(TaskState::Success));
        mock.expect_power_on().times(1).returning(|_| Ok(()));

        let request = CreateRequest::builder()
            .name("web-02")
            .template("centos-template")
            .datastore("datastore1")
            .iso("iso/centos.iso")
            .build();

        let clock = SimulatedClock::new();
        let report = creator(&mock, &clock).clone_from_template(&request).unwrap();

        assert_eq!(report.lifecycle, VmLifecycle::PoweredOn);
        assert!(report.media_connected);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].step, "set ISO");
        assert!(report.failures[0].error.contains("Invalid datastore path"));
    }
}
