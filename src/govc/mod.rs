//! Hypervisor session backed by the `govc` command-line client
//!
//! Every call runs one govc process against the connected endpoint. govc
//! blocks until vSphere tasks finish, so submissions run immediately and
//! their terminal state is parked under a fresh [`TaskHandle`] for
//! [`Hypervisor::poll_task`] to report.

mod commands;

pub use commands::GovcCommand;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::devices::{DeviceChange, VirtualDevice};
use crate::hypervisor::{
    ComputeResource, ConfigTarget, Datacenter, DatastoreInfo, DefaultDevice, GuestFile, GuestNic,
    Hypervisor, ManagedRef, NetworkInfo, TaskHandle, TaskState, VmCreateSpec, VmRef,
};
use crate::{Error, Result};
use commands::{
    escape_glob, govc, named_paths, parse_bool, parse_device_ls, parse_guest_ls, parse_guest_net,
    parse_paths, parse_refs,
};

/// Default devices vSphere puts on every new VM. The CD-ROM attaches to the last IDE controller.
const DEFAULT_DEVICE_CATALOG: &[(&str, i32)] = &[
    ("VirtualIDEController", 200),
    ("VirtualIDEController", 201),
    ("VirtualPS2Controller", 300),
    ("VirtualPCIController", 100),
    ("VirtualSIOController", 400),
    ("VirtualKeyboard", 600),
    ("VirtualPointingDevice", 700),
    ("VirtualMachineVideoCard", 500),
];

struct Connection {
    url: String,
    username: String,
    password: String,
}

pub struct GovcClient {
    binary: PathBuf,
    insecure: bool,
    connection: RwLock<Option<Connection>>,
    /// `user:password` for guest operations, per VM
    guest_logins: RwLock<HashMap<VmRef, String>>,
    tasks: Mutex<HashMap<TaskHandle, TaskState>>,
}

impl GovcClient {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            insecure: false,
            connection: RwLock::new(None),
            guest_logins: RwLock::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Skip TLS verification (`GOVC_INSECURE=1`)
    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    fn env(&self) -> Result<Vec<(&'static str, String)>> {
        let guard = self.connection.read();
        let conn = guard
            .as_ref()
            .ok_or_else(|| Error::Hypervisor("not connected".into()))?;
        Ok(vec![
            ("GOVC_URL", conn.url.clone()),
            ("GOVC_USERNAME", conn.username.clone()),
            ("GOVC_PASSWORD", conn.password.clone()),
            ("GOVC_INSECURE", if self.insecure { "1" } else { "0" }.to_string()),
        ])
    }

    fn run(&self, command: GovcCommand) -> Result<String> {
        govc(&self.binary, &self.env()?, &command)
    }

    fn guest_login(&self, vm: &VmRef) -> Result<String> {
        self.guest_logins
            .read()
            .get(vm)
            .cloned()
            .ok_or_else(|| Error::Hypervisor(format!("not logged in to the guest of {}", vm)))
    }

    /// Run a blocking govc operation and park its outcome as a finished task
    fn submit(&self, what: &str, commands: Vec<GovcCommand>) -> Result<TaskHandle> {
        let mut state = TaskState::Success;
        for command in commands {
            match self.run(command) {
                Ok(_) => {}
                Err(Error::Hypervisor(msg)) => {
                    state = TaskState::Error(msg);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let handle = TaskHandle(format!("task-{}", Uuid::new_v4()));
        tracing::debug!(task = %handle, what, state = ?state, "Task recorded");
        self.tasks.lock().insert(handle.clone(), state);
        Ok(handle)
    }

    fn collect_props(&self, object: &str, properties: &[&str]) -> Result<Vec<String>> {
        let mut cmd = GovcCommand::new("object.collect").flag("s", true).arg(object);
        for property in properties {
            cmd = cmd.arg(*property);
        }
        Ok(self.run(cmd)?.lines().map(|l| l.trim().to_string()).collect())
    }

    fn find(&self, root: &str, types: &[&str], name: Option<&str>) -> Result<Vec<String>> {
        let mut cmd = GovcCommand::new("find").arg(root);
        for t in types {
            cmd = cmd.flag("type", t);
        }
        match name {
            Some(name) => {
                cmd = cmd.flag("name", escape_glob(name));
                Ok(named_paths(parse_paths(&self.run(cmd)?), name))
            }
            None => Ok(parse_paths(&self.run(cmd)?)),
        }
    }

    /// Name and accessibility of each referenced datastore or network
    fn describe(&self, refs: &[String]) -> Result<Vec<(String, bool)>> {
        refs.iter()
            .map(|r| -> Result<(String, bool)> {
                let values = self.collect_props(r, &["name", "summary.accessible"])?;
                match values.as_slice() {
                    [name, accessible, ..] => Ok((name.clone(), parse_bool(accessible)?)),
                    _ => Err(Error::Hypervisor(format!("incomplete properties for {}", r))),
                }
            })
            .collect()
    }
}

impl Hypervisor for GovcClient {
    fn connect(&self, endpoint: &str, username: &str, password: &str) -> Result<()> {
        *self.connection.write() = Some(Connection {
            url: endpoint.to_string(),
            username: username.to_string(),
            password: password.to_string(),
        });
        if let Err(e) = self.run(GovcCommand::new("about")) {
            *self.connection.write() = None;
            return Err(e);
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        let result = self.run(GovcCommand::new("session.logout")).map(|_| ());
        *self.connection.write() = None;
        self.guest_logins.write().clear();
        self.tasks.lock().clear();
        result
    }

    fn find_vm_by_name(&self, name: &str) -> Result<Option<VmRef>> {
        Ok(self.find("/", &["m"], Some(name))?.into_iter().next().map(VmRef))
    }

    fn wait_for_guest_tools(&self, vm: &VmRef, timeout: Duration) -> Result<()> {
        self.run(
            GovcCommand::new("vm.ip")
                .flag("wait", format!("{}s", timeout.as_secs()))
                .arg(vm.as_str()),
        )
        .map(|_| ())
        .map_err(|e| match e {
            Error::Hypervisor(_) => Error::timeout("Guest tools", timeout),
            other => other,
        })
    }

    fn login_to_guest(&self, vm: &VmRef, username: &str, password: &str) -> Result<()> {
        let login = format!("{}:{}", username, password);
        self.run(GovcCommand::new("guest.ps").vm(vm).guest_login(&login))?;
        self.guest_logins.write().insert(vm.clone(), login);
        Ok(())
    }

    fn list_guest_files(&self, vm: &VmRef, path: &str) -> Result<Vec<GuestFile>> {
        let output = self.run(
            GovcCommand::new("guest.ls")
                .vm(vm)
                .guest_login(&self.guest_login(vm)?)
                .flag("json", true)
                .arg(path),
        )?;
        parse_guest_ls(&output)
    }

    fn guest_nics(&self, vm: &VmRef) -> Result<Vec<GuestNic>> {
        let output = self.run(
            GovcCommand::new("object.collect")
                .flag("json", true)
                .arg(vm.as_str())
                .arg("guest.net"),
        )?;
        parse_guest_net(&output)
    }

    fn upload_file_to_guest(
        &self,
        vm: &VmRef,
        local_path: &Path,
        remote_path: &str,
        overwrite: bool,
    ) -> Result<()> {
        self.run(
            GovcCommand::new("guest.upload")
                .vm(vm)
                .guest_login(&self.guest_login(vm)?)
                .flag("f", overwrite)
                .arg(local_path.to_string_lossy())
                .arg(remote_path),
        )
        .map(|_| ())
    }

    fn run_guest_process(
        &self,
        vm: &VmRef,
        binary: &str,
        args: &[String],
        cwd: &str,
    ) -> Result<()> {
        let mut cmd = GovcCommand::new("guest.start")
            .vm(vm)
            .guest_login(&self.guest_login(vm)?)
            .flag("C", cwd)
            .arg(binary);
        for arg in args {
            cmd = cmd.arg(arg.as_str());
        }
        let pid = self.run(cmd)?;
        tracing::debug!(vm = %vm, binary, pid = %pid.trim(), "Started guest process");
        Ok(())
    }

    fn is_powered_off(&self, vm: &VmRef) -> Result<bool> {
        let state = self.collect_props(vm.as_str(), &["runtime.powerState"])?;
        Ok(state.first().map(String::as_str) == Some("poweredOff"))
    }

    fn power_on(&self, vm: &VmRef) -> Result<()> {
        self.run(GovcCommand::new("vm.power").flag("on", true).arg(vm.as_str()))
            .map(|_| ())
    }

    fn shutdown_guest(&self, vm: &VmRef) -> Result<()> {
        self.run(GovcCommand::new("vm.power").flag("s", true).arg(vm.as_str()))
            .map(|_| ())
    }

    fn clone_vm(&self, template: &VmRef, name: &str, power_on: bool) -> Result<VmRef> {
        self.run(
            GovcCommand::new("vm.clone")
                .flag("vm", template)
                .flag("on", power_on)
                .arg(name),
        )?;
        self.find_vm_by_name(name)?
            .ok_or_else(|| Error::VmNotFound(name.to_string()))
    }

    fn submit_create_vm(&self, spec: &VmCreateSpec) -> Result<TaskHandle> {
        self.submit("create", vec![commands::create_command(spec)])
    }

    fn submit_reconfigure_vm(&self, vm: &VmRef, changes: &[DeviceChange]) -> Result<TaskHandle> {
        self.submit("reconfigure", commands::reconfigure_commands(vm, changes)?)
    }

    fn poll_task(&self, task: &TaskHandle) -> Result<TaskState> {
        self.tasks
            .lock()
            .get(task)
            .cloned()
            .ok_or_else(|| Error::Hypervisor(format!("unknown task {}", task)))
    }

    fn destroy_vm(&self, vm: &VmRef) -> Result<TaskHandle> {
        self.submit("destroy", vec![GovcCommand::new("vm.destroy").arg(vm.as_str())])
    }

    fn vm_devices(&self, vm: &VmRef) -> Result<Vec<VirtualDevice>> {
        Ok(parse_device_ls(&self.run(GovcCommand::new("device.ls").vm(vm))?))
    }

    fn find_datacenter(&self, name: &str) -> Result<Option<Datacenter>> {
        Ok(self.find("/", &["d"], Some(name))?.into_iter().next().map(|path| Datacenter {
            name: name.to_string(),
            vm_folder: ManagedRef::new(format!("{}/vm", path)),
            host_folder: ManagedRef::new(format!("{}/host", path)),
            reference: ManagedRef::new(path),
        }))
    }

    fn find_host(&self, datacenter: &Datacenter, name: &str) -> Result<Option<ManagedRef>> {
        Ok(self
            .find(datacenter.host_folder.as_str(), &["h"], Some(name))?
            .into_iter()
            .next()
            .map(ManagedRef))
    }

    fn compute_resources(&self, datacenter: &Datacenter) -> Result<Vec<ComputeResource>> {
        self.find(datacenter.host_folder.as_str(), &["c", "r"], None)?
            .into_iter()
            .map(|path| -> Result<ComputeResource> {
                let hosts = self.find(&path, &["h"], None)?.into_iter().map(ManagedRef).collect();
                Ok(ComputeResource {
                    hosts,
                    resource_pool: ManagedRef::new(format!("{}/Resources", path)),
                    environment_browser: ManagedRef::new(path.clone()),
                    reference: ManagedRef::new(path),
                })
            })
            .collect()
    }

    fn query_config_target(
        &self,
        _compute: &ComputeResource,
        host: &ManagedRef,
    ) -> Result<ConfigTarget> {
        let datastores = parse_refs(&self.collect_props(host.as_str(), &["datastore"])?.join("\n"));
        let networks = parse_refs(&self.collect_props(host.as_str(), &["network"])?.join("\n"));

        let datastores = datastores
            .iter()
            .zip(self.describe(&datastores)?)
            .map(|(reference, (name, accessible))| DatastoreInfo {
                name,
                accessible,
                reference: ManagedRef::new(reference.as_str()),
            })
            .collect();
        let networks = self
            .describe(&networks)?
            .into_iter()
            .map(|(name, accessible)| NetworkInfo { name, accessible })
            .collect();

        Ok(ConfigTarget { datastores, networks })
    }

    fn query_default_devices(
        &self,
        _compute: &ComputeResource,
        _host: &ManagedRef,
    ) -> Result<Vec<DefaultDevice>> {
        Ok(DEFAULT_DEVICE_CATALOG
            .iter()
            .map(|(type_name, key)| match *type_name {
                "VirtualIDEController" => DefaultDevice::IdeController { key: *key },
                other => DefaultDevice::Other {
                    type_name: other.to_string(),
                    key: *key,
                },
            })
            .collect())
    }
}
