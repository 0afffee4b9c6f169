//! govc command lines and output parsing

use std::path::Path;
use std::process::Command;

use serde::Deserialize;

use crate::devices::{CdromBacking, DeviceChange, DeviceKind, MacAddress, Operation, VirtualDevice};
use crate::hypervisor::{GuestFile, GuestNic, VmCreateSpec, VmRef};
use crate::{Error, Result};

/// One govc invocation: subcommand, flags, positional arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GovcCommand {
    args: Vec<String>,
}

impl GovcCommand {
    pub fn new(subcommand: &str) -> Self {
        Self {
            args: vec![subcommand.to_string()],
        }
    }

    /// `-name=value`
    pub fn flag(mut self, name: &str, value: impl std::fmt::Display) -> Self {
        self.args.push(format!("-{}={}", name, value));
        self
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn subcommand(&self) -> &str {
        &self.args[0]
    }

    /// Select a VM by inventory path for commands that take `-vm.ipath`
    pub fn vm(self, vm: &VmRef) -> Self {
        self.flag("vm.ipath", vm)
    }

    /// Guest credentials for `guest.*` commands
    pub fn guest_login(self, login: &str) -> Self {
        self.flag("l", login)
    }
}

/// Execute govc with the session environment
pub fn govc(binary: &Path, env: &[(&str, String)], command: &GovcCommand) -> Result<String> {
    tracing::debug!(command = %command.subcommand(), "Running govc");
    let output = Command::new(binary)
        .args(command.args())
        .envs(env.iter().map(|(k, v)| (*k, v.as_str())))
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::debug!(
            command = %command.subcommand(),
            code = ?output.status.code(),
            stderr = %stderr.trim(),
            "govc failed"
        );
        return Err(Error::Hypervisor(failure_message(&stderr)));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Last non-empty stderr line without the `govc: ` prefix
pub fn failure_message(stderr: &str) -> String {
    stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .map(|l| l.strip_prefix("govc: ").unwrap_or(l).to_string())
        .unwrap_or_else(|| "govc exited with an error".to_string())
}

/// Non-empty output lines, one inventory path each
pub fn parse_paths(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Quote `*`, `?`, `[` and `\\` so `find -name` matches the name literally
pub fn escape_glob(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for c in name.chars() {
        if matches!(c, '*' | '?' | '[' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Inventory paths whose last element is exactly `name`
pub fn named_paths(paths: Vec<String>, name: &str) -> Vec<String> {
    paths
        .into_iter()
        .filter(|p| p.rsplit('/').next() == Some(name))
        .collect()
}

/// Managed object references printed by `object.collect -s`, comma or line separated
pub fn parse_refs(output: &str) -> Vec<String> {
    output
        .split(|c| c == ',' || c == '\n')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn parse_bool(value: &str) -> Result<bool> {
    match value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(Error::Hypervisor(format!("expected a boolean, got '{}'", other))),
    }
}

/// `[datastore] path/to/file` into its two halves
pub fn split_datastore_path(file_name: &str) -> Option<(&str, &str)> {
    let rest = file_name.strip_prefix('[')?;
    let (datastore, path) = rest.split_once(']')?;
    Some((datastore, path.trim_start()))
}

/// Devices from `device.ls` text output
pub fn parse_device_ls(output: &str) -> Vec<VirtualDevice> {
    output
        .lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let name = cols.next()?;
            let type_name = cols.next()?;
            let summary = cols.collect::<Vec<_>>().join(" ");
            let key = name.rsplit('-').next()?.parse::<i32>().ok()?;

            let kind = match type_name {
                "VirtualIDEController" => DeviceKind::IdeController,
                "VirtualCdrom" => DeviceKind::Cdrom {
                    backing: cdrom_backing_from_summary(&summary),
                },
                other => DeviceKind::Other {
                    type_name: other.to_string(),
                },
            };

            Some(VirtualDevice {
                key,
                controller_key: None,
                unit_number: None,
                connectable: None,
                kind,
            })
        })
        .collect()
}

fn cdrom_backing_from_summary(summary: &str) -> CdromBacking {
    if let Some(file_name) = summary.strip_prefix("ISO ") {
        CdromBacking::Iso {
            file_name: file_name.to_string(),
            datastore: None,
        }
    } else if summary.starts_with("Remote") || summary.is_empty() {
        CdromBacking::ClientDevice
    } else {
        CdromBacking::HostDevice {
            device_name: summary.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct GuestListing {
    #[serde(default, alias = "Files")]
    files: Vec<GuestListingEntry>,
}

#[derive(Deserialize)]
struct GuestListingEntry {
    #[serde(alias = "Path")]
    path: String,
}

/// Entries from `guest.ls -json`
pub fn parse_guest_ls(output: &str) -> Result<Vec<GuestFile>> {
    if output.trim().is_empty() || output.trim() == "null" {
        return Ok(vec![]);
    }
    let listing: GuestListing = serde_json::from_str(output)?;
    Ok(listing
        .files
        .into_iter()
        .map(|f| GuestFile { path: f.path })
        .collect())
}

#[derive(Deserialize)]
struct CollectedProperty {
    #[serde(alias = "Name")]
    name: String,
    #[serde(alias = "Val")]
    val: serde_json::Value,
}

/// `guest.net` from `object.collect -json <vm> guest.net`
pub fn parse_guest_net(output: &str) -> Result<Vec<GuestNic>> {
    let props: Vec<CollectedProperty> = serde_json::from_str(output)?;
    let Some(net) = props.into_iter().find(|p| p.name == "guest.net") else {
        return Ok(vec![]);
    };

    // the array is wrapped as {"GuestNicInfo": [...]} by older govc releases
    let nics = match net.val {
        serde_json::Value::Object(mut map) => map
            .remove("GuestNicInfo")
            .or_else(|| map.remove("guestNicInfo"))
            .unwrap_or(serde_json::Value::Array(vec![])),
        other => other,
    };
    Ok(serde_json::from_value(nics)?)
}

/// `vm.create` flags expressing the creation device list
pub fn create_command(spec: &VmCreateSpec) -> GovcCommand {
    let datastore = split_datastore_path(&spec.vm_path_name)
        .map(|(ds, _)| ds)
        .unwrap_or(&spec.vm_path_name);

    let mut cmd = GovcCommand::new("vm.create")
        .flag("m", spec.memory_mb)
        .flag("c", spec.num_cpus)
        .flag("g", &spec.guest_id)
        .flag("annotation", &spec.annotation)
        .flag("folder", &spec.folder)
        .flag("pool", &spec.pool)
        .flag("host", &spec.host)
        .flag("ds", datastore)
        .flag("on", false);

    for change in &spec.device_changes {
        cmd = match &change.device.kind {
            DeviceKind::ScsiController { .. } => cmd.flag("disk.controller", "lsilogic"),
            DeviceKind::Cdrom {
                backing: CdromBacking::Iso { file_name, .. },
            } => match split_datastore_path(file_name) {
                Some((ds, path)) => cmd.flag("iso", path).flag("iso-datastore", ds),
                None => cmd.flag("iso", file_name),
            },
            DeviceKind::Disk { capacity_kb, .. } => cmd.flag("disk", format!("{}KB", capacity_kb)),
            DeviceKind::NetworkAdapter {
                model,
                backing,
                address,
            } => {
                let cmd = cmd
                    .flag("net", &backing.device_name)
                    .flag("net.adapter", model);
                match address {
                    MacAddress::Manual(mac) => cmd.flag("net.address", mac),
                    MacAddress::Generated => cmd,
                }
            }
            _ => cmd,
        };
    }

    cmd.arg(&spec.name)
}

/// govc calls applying CD-ROM edits, in order
pub fn reconfigure_commands(vm: &VmRef, changes: &[DeviceChange]) -> Result<Vec<GovcCommand>> {
    let mut commands = Vec::new();

    for change in changes {
        let device = &change.device;
        let backing = match (&change.operation, &device.kind) {
            (Operation::Edit, DeviceKind::Cdrom { backing }) => backing,
            (op, kind) => {
                return Err(Error::InvalidDevice(format!(
                    "govc cannot apply {:?} to {:?}",
                    op, kind
                )))
            }
        };
        let name = format!("cdrom-{}", device.key);

        let set_backing = match backing {
            CdromBacking::Iso { file_name, .. } => {
                let cmd = GovcCommand::new("device.cdrom.insert").vm(vm).flag("device", &name);
                match split_datastore_path(file_name) {
                    Some((ds, path)) => cmd.flag("ds", ds).arg(path),
                    None => cmd.arg(file_name),
                }
            }
            CdromBacking::ClientDevice => {
                GovcCommand::new("device.cdrom.eject").vm(vm).flag("device", &name)
            }
            CdromBacking::HostDevice { device_name } => {
                return Err(Error::InvalidDevice(format!(
                    "govc cannot back {} with host device {}",
                    name, device_name
                )))
            }
        };

        match device.connectable {
            Some(c) if c.connected => {
                commands.push(set_backing);
                commands.push(GovcCommand::new("device.connect").vm(vm).arg(&name));
            }
            Some(_) => {
                commands.push(GovcCommand::new("device.disconnect").vm(vm).arg(&name));
                commands.push(set_backing);
            }
            None => commands.push(set_backing),
        }
    }

    Ok(commands)
}
