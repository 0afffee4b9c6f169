//! Settings tables and workflow requests with builder pattern

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::devices::NicModel;
use crate::models::{EndpointCredentials, GuestCredentials, VmIdentity};
use crate::{Error, Result};

/// Disk sizes in KB
pub const DISK_20GB: u64 = 20_971_520;
pub const DISK_40GB: u64 = 41_943_040;
pub const DISK_100GB: u64 = 104_857_600;

/// RAM sizes in MB
pub const RAM_2GB: u64 = 2048;
pub const RAM_4GB: u64 = 4096;
pub const RAM_8GB: u64 = 8192;
pub const RAM_16GB: u64 = 16384;

pub const DEFAULT_RAM_MB: u64 = RAM_4GB;
pub const DEFAULT_CPUS: u32 = 2;
pub const DEFAULT_DISK_KB: u64 = DISK_40GB;
pub const DEFAULT_GUEST_ID: &str = "centos64Guest";
pub const DEFAULT_ANNOTATION: &str = "My Product Product Virtual Machine";

/// Presence of this file in the guest means the OS installer finished
pub const INSTALLATION_MARKER: &str = "/etc/INSTALLATION_COMPLETED";
/// Where the network fix-up daemon lives in the guest
pub const FIXUP_DAEMON_PATH: &str = "/etc/init.d/vm_network_fix";

pub const DEFAULT_IP_SAVE_FOLDER: &str = "/tmp";
pub const DEFAULT_FIXUP_SCRIPT: &str = "vm_network_fix";

pub const DEFAULT_SETTINGS_PATH: &str = "vm-mgmt.json";
pub const SETTINGS_ENV: &str = "VM_MGMT_SETTINGS";

/// A management endpoint and the placement defaults that go with it
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcenterProfile {
    pub ip: String,
    pub username: String,
    pub password: String,
    pub datacenter: String,
    #[serde(default)]
    pub datastore: Option<String>,
    /// ESX host new VMs are placed on
    pub hostname: String,
    #[serde(default)]
    pub template: Option<String>,
}

impl VcenterProfile {
    pub fn credentials(&self) -> EndpointCredentials {
        EndpointCredentials::new(&self.username, &self.password)
    }

    pub fn identity(&self, vm_name: &str) -> VmIdentity {
        VmIdentity::new(vm_name, &self.ip, self.credentials())
    }
}

impl std::fmt::Debug for VcenterProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VcenterProfile")
            .field("ip", &self.ip)
            .field("username", &self.username)
            .field("datacenter", &self.datacenter)
            .field("datastore", &self.datastore)
            .field("hostname", &self.hostname)
            .field("template", &self.template)
            .finish_non_exhaustive()
    }
}

/// Hardware preset for a kind of VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmType {
    pub name: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub datastore: Option<String>,
    pub ram: u64,
    pub cpus: u32,
    pub disksize: u64,
}

/// Settings file contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub vcenters: BTreeMap<String, VcenterProfile>,
    #[serde(default)]
    pub guest_logins: BTreeMap<String, GuestCredentials>,
    #[serde(default)]
    pub vm_types: BTreeMap<String, VmType>,
    #[serde(default = "default_ip_save_folder")]
    pub ip_save_folder: PathBuf,
    #[serde(default = "default_fixup_script")]
    pub fixup_script: PathBuf,
}

fn default_ip_save_folder() -> PathBuf {
    PathBuf::from(DEFAULT_IP_SAVE_FOLDER)
}

fn default_fixup_script() -> PathBuf {
    PathBuf::from(DEFAULT_FIXUP_SCRIPT)
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            vcenters: BTreeMap::new(),
            guest_logins: BTreeMap::new(),
            vm_types: BTreeMap::new(),
            ip_save_folder: default_ip_save_folder(),
            fixup_script: default_fixup_script(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read settings {}: {}", path.display(), e)))?;
        let settings: Settings = serde_json::from_str(&raw)?;
        tracing::debug!(
            path = %path.display(),
            vcenters = settings.vcenters.len(),
            vm_types = settings.vm_types.len(),
            "Loaded settings"
        );
        Ok(settings)
    }

    /// `explicit`, then `$VM_MGMT_SETTINGS`, then `./vm-mgmt.json`
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(SETTINGS_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH))
    }

    pub fn vcenter(&self, key: &str) -> Result<&VcenterProfile> {
        self.vcenters.get(key).ok_or_else(|| {
            Error::Config(format!(
                "unknown vCenter '{}', choices: {:?}",
                key,
                self.vcenters.keys().collect::<Vec<_>>()
            ))
        })
    }

    pub fn guest_login(&self, key: &str) -> Result<&GuestCredentials> {
        self.guest_logins.get(key).ok_or_else(|| {
            Error::Config(format!(
                "unknown guest login '{}', choices: {:?}",
                key,
                self.guest_logins.keys().collect::<Vec<_>>()
            ))
        })
    }

    pub fn vm_type(&self, key: &str) -> Result<&VmType> {
        self.vm_types.get(key).ok_or_else(|| {
            Error::Config(format!(
                "unknown VM type '{}', choices: {:?}",
                key,
                self.vm_types.keys().collect::<Vec<_>>()
            ))
        })
    }
}

/// Everything needed to create one VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub name: String,
    pub datacenter: String,
    pub host: String,
    /// Exact datastore name, or the first accessible one when unset
    pub datastore: Option<String>,
    /// ISO path relative to the datastore
    pub iso: String,
    pub memory_mb: u64,
    pub num_cpus: u32,
    pub disk_kb: u64,
    pub guest_id: String,
    pub annotation: String,
    pub nic_model: NicModel,
    pub mac_address: Option<String>,
    /// Clone from this template instead of building raw hardware
    pub template: Option<String>,
}

impl Default for CreateRequest {
    fn default() -> Self {
        Self {
            name: String::new(),
            datacenter: String::new(),
            host: String::new(),
            datastore: None,
            iso: String::new(),
            memory_mb: DEFAULT_RAM_MB,
            num_cpus: DEFAULT_CPUS,
            disk_kb: DEFAULT_DISK_KB,
            guest_id: DEFAULT_GUEST_ID.to_string(),
            annotation: DEFAULT_ANNOTATION.to_string(),
            nic_model: NicModel::default(),
            mac_address: None,
            template: None,
        }
    }
}

impl CreateRequest {
    pub fn builder() -> CreateRequestBuilder {
        CreateRequestBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("VM name cannot be empty".into()));
        }
        if self.iso.is_empty() {
            return Err(Error::Config(
                "cannot continue without ISO path, use --iso <iso-path-relative-to-datastore>"
                    .into(),
            ));
        }
        if self.memory_mb == 0 {
            return Err(Error::Config("memory must be at least 1MB".into()));
        }
        if self.num_cpus < 1 {
            return Err(Error::Config("cpu count must be at least 1".into()));
        }
        match &self.template {
            Some(template) if template.is_empty() => {
                return Err(Error::Config("template name cannot be empty".into()));
            }
            Some(_) => {
                if self.datastore.is_none() {
                    return Err(Error::Config("cloning needs a datastore for the ISO path".into()));
                }
            }
            None => {
                if self.datacenter.is_empty() {
                    return Err(Error::Config("datacenter cannot be empty".into()));
                }
                if self.host.is_empty() {
                    return Err(Error::Config("host cannot be empty".into()));
                }
                if self.disk_kb == 0 {
                    return Err(Error::Config("disk size must be non-zero".into()));
                }
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct CreateRequestBuilder {
    request: CreateRequest,
}

impl CreateRequestBuilder {
    /// Placement defaults from a vCenter profile
    pub fn vcenter(mut self, profile: &VcenterProfile) -> Self {
        self.request.datacenter = profile.datacenter.clone();
        self.request.host = profile.hostname.clone();
        self.request.datastore = profile.datastore.clone();
        self
    }

    /// Hardware preset; later setters still override it
    pub fn vm_type(mut self, preset: &VmType) -> Self {
        self.request.name = preset.name.clone();
        if let Some(host) = &preset.hostname {
            self.request.host = host.clone();
        }
        // a profile datastore beats the preset's
        if self.request.datastore.is_none() {
            self.request.datastore = preset.datastore.clone();
        }
        self.request.memory_mb = preset.ram;
        self.request.num_cpus = preset.cpus;
        self.request.disk_kb = preset.disksize;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.request.name = name.into();
        self
    }

    pub fn datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.request.datacenter = datacenter.into();
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.request.host = host.into();
        self
    }

    pub fn datastore(mut self, datastore: impl Into<String>) -> Self {
        self.request.datastore = Some(datastore.into());
        self
    }

    pub fn iso(mut self, iso: impl Into<String>) -> Self {
        self.request.iso = iso.into();
        self
    }

    pub fn memory_mb(mut self, mb: u64) -> Self {
        self.request.memory_mb = mb;
        self
    }

    pub fn num_cpus(mut self, count: u32) -> Self {
        self.request.num_cpus = count;
        self
    }

    pub fn disk_kb(mut self, kb: u64) -> Self {
        self.request.disk_kb = kb;
        self
    }

    pub fn guest_id(mut self, guest_id: impl Into<String>) -> Self {
        self.request.guest_id = guest_id.into();
        self
    }

    pub fn annotation(mut self, annotation: impl Into<String>) -> Self {
        self.request.annotation = annotation.into();
        self
    }

    pub fn nic_model(mut self, model: NicModel) -> Self {
        self.request.nic_model = model;
        self
    }

    pub fn mac_address(mut self, mac: impl Into<String>) -> Self {
        self.request.mac_address = Some(mac.into());
        self
    }

    pub fn template(mut self, template: impl Into<String>) -> Self {
        self.request.template = Some(template.into());
        self
    }

    pub fn build(self) -> CreateRequest {
        self.request
    }

    pub fn build_validated(self) -> Result<CreateRequest> {
        let request = self.build();
        request.validate()?;
        Ok(request)
    }
}

/// What to do once the installation marker shows up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionMode {
    /// Write the guest's first IP address to `<folder>/<vm>.txt`
    CaptureIp { folder: PathBuf },
    /// Install the network fix-up daemon, shut down, eject media
    FixUp { script: PathBuf },
}

/// Inputs of the installation-completion watcher
#[derive(Debug, Clone)]
pub struct InstallWatchConfig {
    pub vm_name: String,
    pub credentials: GuestCredentials,
    pub mode: CompletionMode,
}

impl InstallWatchConfig {
    pub fn builder() -> InstallWatchConfigBuilder {
        InstallWatchConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.vm_name.is_empty() {
            return Err(Error::Config("VM name cannot be empty".into()));
        }
        if self.credentials.username.is_empty() {
            return Err(Error::Config("guest login username cannot be empty".into()));
        }
        match &self.mode {
            CompletionMode::CaptureIp { folder } if folder.as_os_str().is_empty() => {
                Err(Error::Config("IP save folder cannot be empty".into()))
            }
            CompletionMode::FixUp { script } if script.as_os_str().is_empty() => {
                Err(Error::Config("fix-up script path cannot be empty".into()))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct InstallWatchConfigBuilder {
    vm_name: String,
    credentials: Option<GuestCredentials>,
    mode: Option<CompletionMode>,
}

impl InstallWatchConfigBuilder {
    pub fn vm_name(mut self, name: impl Into<String>) -> Self {
        self.vm_name = name.into();
        self
    }

    pub fn credentials(mut self, credentials: GuestCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn capture_ip(mut self, folder: impl Into<PathBuf>) -> Self {
        self.mode = Some(CompletionMode::CaptureIp { folder: folder.into() });
        self
    }

    pub fn fix_up(mut self, script: impl Into<PathBuf>) -> Self {
        self.mode = Some(CompletionMode::FixUp { script: script.into() });
        self
    }

    pub fn build(self) -> InstallWatchConfig {
        InstallWatchConfig {
            vm_name: self.vm_name,
            credentials: self
                .credentials
                .unwrap_or_else(|| GuestCredentials::new("", "")),
            mode: self.mode.unwrap_or(CompletionMode::FixUp {
                script: default_fixup_script(),
            }),
        }
    }

    pub fn build_validated(self) -> Result<InstallWatchConfig> {
        let config = self.build();
        config.validate()?;
        Ok(config)
    }
}
