//! vm-mgmt CLI

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use vm_mgmt::config::{CreateRequestBuilder, VcenterProfile};
use vm_mgmt::devices::NicModel;
use vm_mgmt::workflow::CreateReport;
use vm_mgmt::{
    logging, CreateRequest, Error, GovcClient, InstallWatchConfig, InstallWatcher, Poller, Result,
    Session, Settings, SystemClock, VmCreator, VmDeleter,
};

#[derive(Parser)]
#[command(name = "vm-mgmt")]
#[command(about = "Create, install and delete vSphere VMs", long_about = None)]
struct Cli {
    /// Settings file (vCenters, guest logins, VM types)
    #[arg(long, env = "VM_MGMT_SETTINGS")]
    settings: Option<PathBuf>,

    /// Log level for this crate, ignored when RUST_LOG is set
    #[arg(long)]
    log_level: Option<String>,

    /// govc binary
    #[arg(long, env = "GOVC_BIN", default_value = "govc")]
    govc: PathBuf,

    /// Skip TLS certificate verification
    #[arg(long, env = "GOVC_INSECURE")]
    insecure: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a VM from hardware specs and boot it from an ISO
    Create(CreateArgs),
    /// Clone a template and boot it from an ISO
    Clone {
        #[command(flatten)]
        args: CreateArgs,
        /// Template to clone, defaults to the vCenter's template
        #[arg(long)]
        template: Option<String>,
    },
    /// Wait for the OS installation to finish and post-process the VM
    DetectInstall {
        /// vCenter key in the settings file
        #[arg(long)]
        vcenter: String,
        /// Guest login key in the settings file
        #[arg(long)]
        login: String,
        /// VM name
        #[arg(long)]
        name: String,
        #[arg(long)]
        guest_login_username: Option<String>,
        #[arg(long)]
        guest_login_password: Option<String>,
        /// Only record the guest IP address instead of fixing up the network
        #[arg(long)]
        get_ip: bool,
    },
    /// Shut down and destroy a VM
    Delete {
        /// vCenter key in the settings file
        #[arg(long)]
        vcenter: String,
        /// VM name
        #[arg(long)]
        name: String,
    },
}

#[derive(Args)]
struct CreateArgs {
    /// vCenter key in the settings file
    #[arg(long)]
    vcenter: String,
    /// VM type key in the settings file
    #[arg(long = "type")]
    vm_type: Option<String>,
    /// VM name
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    datacenter: Option<String>,
    /// ESX host
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    datastore: Option<String>,
    /// ISO path relative to the datastore
    #[arg(long)]
    iso: Option<String>,
    /// Memory in MB
    #[arg(long)]
    ram: Option<u64>,
    #[arg(long)]
    cpus: Option<u32>,
    /// Disk size in KB
    #[arg(long)]
    disksize: Option<u64>,
    /// Manual MAC address for the NIC
    #[arg(long)]
    mac: Option<String>,
    /// e1000, vmxnet2, vmxnet3 or pcnet32
    #[arg(long)]
    network_adapter: Option<NicModel>,
    /// VM annotation
    #[arg(long)]
    notes: Option<String>,
    #[arg(long)]
    guest_id: Option<String>,
}

impl CreateArgs {
    fn request(
        &self,
        settings: &Settings,
        profile: &VcenterProfile,
    ) -> Result<CreateRequestBuilder> {
        let mut builder = CreateRequest::builder().vcenter(profile);
        if let Some(key) = &self.vm_type {
            builder = builder.vm_type(settings.vm_type(key)?);
        }
        if let Some(name) = &self.name {
            builder = builder.name(name);
        }
        if let Some(datacenter) = &self.datacenter {
            builder = builder.datacenter(datacenter);
        }
        if let Some(host) = &self.host {
            builder = builder.host(host);
        }
        if let Some(datastore) = &self.datastore {
            builder = builder.datastore(datastore);
        }
        if let Some(iso) = &self.iso {
            builder = builder.iso(iso);
        }
        if let Some(ram) = self.ram {
            builder = builder.memory_mb(ram);
        }
        if let Some(cpus) = self.cpus {
            builder = builder.num_cpus(cpus);
        }
        if let Some(disk) = self.disksize {
            builder = builder.disk_kb(disk);
        }
        if let Some(mac) = &self.mac {
            builder = builder.mac_address(mac);
        }
        if let Some(model) = self.network_adapter {
            builder = builder.nic_model(model);
        }
        if let Some(notes) = &self.notes {
            builder = builder.annotation(notes);
        }
        if let Some(guest_id) = &self.guest_id {
            builder = builder.guest_id(guest_id);
        }
        Ok(builder)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init(cli.log_level.as_deref()) {
        eprintln!("{}", e);
        return ExitCode::from(e.exit_code());
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(kind = ?e.kind(), "{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load(&Settings::resolve_path(cli.settings.as_deref()))?;
    let govc = GovcClient::new(&cli.govc).insecure(cli.insecure);

    match cli.command {
        Commands::Create(args) => cmd_create(&settings, &govc, &args),
        Commands::Clone { args, template } => cmd_clone(&settings, &govc, &args, template),
        Commands::DetectInstall {
            vcenter,
            login,
            name,
            guest_login_username,
            guest_login_password,
            get_ip,
        } => {
            let credentials = settings
                .guest_login(&login)?
                .clone()
                .with_overrides(guest_login_username, guest_login_password);
            let builder = InstallWatchConfig::builder().vm_name(&name).credentials(credentials);
            let config = if get_ip {
                builder.capture_ip(&settings.ip_save_folder)
            } else {
                builder.fix_up(&settings.fixup_script)
            }
            .build_validated()?;
            cmd_detect_install(&settings, &govc, &vcenter, &config)
        }
        Commands::Delete { vcenter, name } => cmd_delete(&settings, &govc, &vcenter, &name),
    }
}

fn cmd_create(settings: &Settings, govc: &GovcClient, args: &CreateArgs) -> Result<()> {
    let profile = settings.vcenter(&args.vcenter)?;
    let request = args.request(settings, profile)?.build_validated()?;

    let clock = SystemClock::new();
    let session = Session::for_identity(govc, &profile.identity(&request.name))?;
    let report = VmCreator::new(&*session, Poller::new(&clock)).create(&request)?;
    print_create(&report);
    Ok(())
}

fn cmd_clone(
    settings: &Settings,
    govc: &GovcClient,
    args: &CreateArgs,
    template: Option<String>,
) -> Result<()> {
    let profile = settings.vcenter(&args.vcenter)?;
    let template = template.or_else(|| profile.template.clone()).ok_or_else(|| {
        Error::Config(format!("no template given and vCenter '{}' has none", args.vcenter))
    })?;
    let request = args.request(settings, profile)?.template(template).build_validated()?;

    let clock = SystemClock::new();
    let session = Session::for_identity(govc, &profile.identity(&request.name))?;
    let report = VmCreator::new(&*session, Poller::new(&clock)).clone_from_template(&request)?;
    print_create(&report);
    Ok(())
}

fn cmd_detect_install(
    settings: &Settings,
    govc: &GovcClient,
    vcenter: &str,
    config: &InstallWatchConfig,
) -> Result<()> {
    let profile = settings.vcenter(vcenter)?;

    let clock = SystemClock::new();
    let session = Session::for_identity(govc, &profile.identity(&config.vm_name))?;
    let report = InstallWatcher::new(&*session, Poller::new(&clock)).run(config)?;
    println!("{}: {}", report.vm_name, report.reached);
    if let Some(ip) = &report.ip_address {
        println!("IP address: {}", ip);
    }
    for failure in &report.failures {
        println!("  warning: {}: {}", failure.step, failure.error);
    }
    Ok(())
}

fn cmd_delete(settings: &Settings, govc: &GovcClient, vcenter: &str, name: &str) -> Result<()> {
    let profile = settings.vcenter(vcenter)?;

    let clock = SystemClock::new();
    let session = Session::for_identity(govc, &profile.identity(name))?;
    let report = VmDeleter::new(&*session, Poller::new(&clock)).delete(name)?;
    println!("{}: {}", report.vm_name, report.state);
    for warning in &report.warnings {
        println!("  warning: {}", warning);
    }
    Ok(())
}

fn print_create(report: &CreateReport) {
    println!("{} ({}): {}", report.vm_name, report.vm, report.lifecycle);
    if let Some(error) = report.last_error() {
        println!("  last error: {}", error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_clone_takes_create_flags_and_template() {
        let cli = Cli::try_parse_from([
            "vm-mgmt", "clone", "--vcenter", "lab", "--name", "web-01", "--template", "centos7",
        ])
        .unwrap();
        match cli.command {
            Commands::Clone { args, template } => {
                assert_eq!(args.vcenter, "lab");
                assert_eq!(args.name.as_deref(), Some("web-01"));
                assert_eq!(template.as_deref(), Some("centos7"));
            }
            _ => panic!("expected clone"),
        }
    }

    #[test]
    fn test_detect_install_and_delete_require_vcenter() {
        assert!(Cli::try_parse_from(["vm-mgmt", "delete", "--name", "web-01"]).is_err());
        let cli = Cli::try_parse_from([
            "vm-mgmt", "detect-install", "--vcenter", "lab", "--login", "root", "--name", "web-01",
            "--get-ip",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::DetectInstall { get_ip: true, .. }));
    }
}
