//! Installation-completion watcher
//!
//! Drives a freshly booted VM from "installer running" to either a captured
//! IP address or a fixed-up, powered-off VM with its media ejected. Each
//! phase has its own deadline; the blocking phases (locate, guest tools,
//! login, marker) are fatal on timeout, everything after the marker is best
//! effort.

use std::path::{Path, PathBuf};
use std::time::Duration;

use uuid::Uuid;

use crate::config::{CompletionMode, InstallWatchConfig, FIXUP_DAEMON_PATH, INSTALLATION_MARKER};
use crate::devices::disconnect_cdrom_changes;
use crate::hypervisor::{Hypervisor, VmRef};
use crate::models::VmLifecycle;
use crate::poll::{Check, PollConfig, PollOutcome, Poller};
use crate::task::{TaskRunner, DEFAULT_TASK_POLL};
use crate::workflow::steps::{ChainReport, StepChain, StepFailure};
use crate::{Error, Result};

/// Interval and deadline of every wait in the workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTimings {
    pub locate: PollConfig,
    pub guest_tools: Duration,
    pub login: PollConfig,
    pub marker: PollConfig,
    /// Pause after each in-guest command
    pub settle: Duration,
    pub warm_up: Duration,
    pub warm_up_step: Duration,
    pub power_off: PollConfig,
    pub task: PollConfig,
}

impl Default for PhaseTimings {
    fn default() -> Self {
        Self {
            locate: PollConfig::secs(1, 10),
            guest_tools: Duration::from_secs(3600),
            login: PollConfig::secs(1, 300),
            marker: PollConfig::secs(180, 3600),
            settle: Duration::from_secs(1),
            warm_up: Duration::from_secs(60),
            warm_up_step: Duration::from_secs(2),
            power_off: PollConfig::secs(1, 900),
            task: DEFAULT_TASK_POLL,
        }
    }
}

/// Outcome of a watcher run that got past every fatal phase
#[derive(Debug, Clone)]
pub struct InstallReport {
    pub vm_name: String,
    pub vm: VmRef,
    /// Furthest lifecycle state reached
    pub reached: VmLifecycle,
    pub ip_address: Option<String>,
    pub ip_file: Option<PathBuf>,
    /// `None` when the fix-up daemon was already installed or in IP-capture mode
    pub fixup: Option<ChainReport>,
    /// Best-effort steps that did not complete
    pub failures: Vec<StepFailure>,
}

impl InstallReport {
    fn new(vm_name: &str, vm: VmRef) -> Self {
        Self {
            vm_name: vm_name.to_string(),
            vm,
            reached: VmLifecycle::PoweredOn,
            ip_address: None,
            ip_file: None,
            fixup: None,
            failures: Vec::new(),
        }
    }

    fn advance(&mut self, state: VmLifecycle) {
        tracing::info!(vm = %self.vm_name, state = %state, "Reached");
        self.reached = state;
    }

    fn record(&mut self, step: &str, error: impl ToString) {
        let error = error.to_string();
        tracing::error!(vm = %self.vm_name, step, error = %error, "Step failed, continuing");
        self.failures.push(StepFailure {
            chain: "post-install".to_string(),
            step: step.to_string(),
            error,
        });
    }

    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty() || self.fixup.as_ref().is_some_and(|c| !c.succeeded())
    }
}

pub struct InstallWatcher<'a> {
    hypervisor: &'a dyn Hypervisor,
    poller: Poller<'a>,
    timings: PhaseTimings,
}

impl<'a> InstallWatcher<'a> {
    pub fn new(hypervisor: &'a dyn Hypervisor, poller: Poller<'a>) -> Self {
        Self {
            hypervisor,
            poller,
            timings: PhaseTimings::default(),
        }
    }

    pub fn with_timings(mut self, timings: PhaseTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn run(&self, config: &InstallWatchConfig) -> Result<InstallReport> {
        config.validate()?;

        let span =
            tracing::info_span!("detect_install", run_id = %Uuid::new_v4(), vm = %config.vm_name);
        let _enter = span.enter();

        let vm = self.locate(&config.vm_name)?;
        let mut report = InstallReport::new(&config.vm_name, vm.clone());

        self.wait_for_guest(&vm)?;
        report.advance(VmLifecycle::GuestReachable);

        self.login(&vm, config)?;
        report.advance(VmLifecycle::LoggedIn);

        self.wait_for_marker(&vm)?;
        report.advance(VmLifecycle::InstallComplete);

        match &config.mode {
            CompletionMode::CaptureIp { folder } => self.capture_ip(&vm, folder, &mut report)?,
            CompletionMode::FixUp { script } => {
                self.fix_up(&vm, script, &mut report);
                self.shut_down(&vm, &mut report);
                self.eject_media(&vm, &mut report);
            }
        }

        tracing::info!(
            state = %report.reached,
            degraded = report.is_degraded(),
            "Installation workflow finished"
        );
        Ok(report)
    }

    fn locate(&self, name: &str) -> Result<VmRef> {
        tracing::info!("Attempting to locate the guest VM");
        let outcome = self.poller.poll_until("Locate VM", self.timings.locate, || {
            match self.hypervisor.find_vm_by_name(name) {
                Ok(Some(vm)) => Check::Ready(vm),
                Ok(None) => Check::Transient(Error::VmNotFound(name.to_string())),
                Err(e) => Check::Transient(e),
            }
        })?;

        match outcome {
            PollOutcome::Ready { value, .. } => {
                tracing::info!(vm_ref = %value, "Located VM");
                Ok(value)
            }
            PollOutcome::TimedOut { elapsed, last_error, .. } => {
                tracing::error!(
                    elapsed_secs = elapsed.as_secs(),
                    error = last_error.as_deref().unwrap_or("none"),
                    "Failed to locate the VM, please fix the issue on the ESXi server"
                );
                Err(Error::VmNotFound(name.to_string()))
            }
        }
    }

    fn wait_for_guest(&self, vm: &VmRef) -> Result<()> {
        tracing::info!(
            timeout_secs = self.timings.guest_tools.as_secs(),
            "Waiting for the guest OS to respond, no progress output until it does"
        );
        self.hypervisor
            .wait_for_guest_tools(vm, self.timings.guest_tools)
            .map_err(|e| {
                tracing::error!(error = %e, "Guest OS did not respond");
                match e {
                    Error::Timeout { .. } => e,
                    other => {
                        Error::timeout(format!("Guest tools ({})", other), self.timings.guest_tools)
                    }
                }
            })?;
        tracing::info!("Received response from the guest OS");
        Ok(())
    }

    fn login(&self, vm: &VmRef, config: &InstallWatchConfig) -> Result<()> {
        let creds = &config.credentials;
        tracing::info!(user = %creds.username, "Logging in to the guest");
        self.poller
            .poll_until("Guest login", self.timings.login, || {
                match self.hypervisor.login_to_guest(vm, &creds.username, &creds.password) {
                    Ok(()) => Check::Ready(()),
                    Err(e) => Check::Transient(e),
                }
            })?
            .into_result("Guest login")
    }

    fn wait_for_marker(&self, vm: &VmRef) -> Result<()> {
        tracing::info!(
            marker = INSTALLATION_MARKER,
            deadline_secs = self.timings.marker.deadline.as_secs(),
            "Waiting for the OS installation to complete"
        );
        let outcome = self.poller.poll_until("Installation", self.timings.marker, || {
            match self.hypervisor.list_guest_files(vm, INSTALLATION_MARKER) {
                Ok(files) if files.first().is_some_and(|f| f.path == INSTALLATION_MARKER) => {
                    Check::Ready(())
                }
                Ok(_) => Check::NotYet,
                Err(e) => Check::Transient(e),
            }
        })?;

        if let PollOutcome::Ready { elapsed, .. } = &outcome {
            tracing::info!(elapsed_secs = elapsed.as_secs(), "OS installation has completed");
        }
        outcome.into_result("Installation")
    }

    /// Read the guest's first address and persist it as `<folder>/<vm>.txt`.
    fn capture_ip(&self, vm: &VmRef, folder: &Path, report: &mut InstallReport) -> Result<()> {
        let nics = self.hypervisor.guest_nics(vm)?;
        let ip = nics
            .first()
            .and_then(|nic| nic.ip_addresses.first())
            .cloned()
            .ok_or_else(|| {
                Error::Hypervisor(format!("{} reported no IP address", report.vm_name))
            })?;
        tracing::info!(ip = %ip, "IP address of the deployed VM");
        report.ip_address = Some(ip.clone());

        let path = folder.join(format!("{}.txt", report.vm_name));
        match std::fs::write(&path, &ip) {
            Ok(()) => {
                tracing::info!(path = %path.display(), "Saved the IP of the deployed VM");
                report.ip_file = Some(path);
                report.advance(VmLifecycle::IpCaptured);
            }
            Err(e) => report.record("save IP address", format!("{}: {}", path.display(), e)),
        }
        Ok(())
    }

    fn fix_up(&self, vm: &VmRef, script: &Path, report: &mut InstallReport) {
        let installed = matches!(
            self.hypervisor.list_guest_files(vm, FIXUP_DAEMON_PATH),
            Ok(files) if !files.is_empty()
        );
        if installed {
            tracing::info!(path = FIXUP_DAEMON_PATH, "Network fix already exists, nothing to do");
            report.advance(VmLifecycle::PostInstallFixedUp);
            return;
        }

        tracing::info!(script = %script.display(), "Network fix does not exist, installing it");
        let chain = StepChain::new("fix-up")
            .stop_on_failure()
            .step("upload", || {
                self.hypervisor.upload_file_to_guest(vm, script, FIXUP_DAEMON_PATH, true)
            })
            .step("chmod", || {
                self.guest_command(vm, "/bin/chmod", &["755", "vm_network_fix"], "/etc/init.d")
            })
            .step("register", || {
                let args = ["--add", "vm_network_fix"];
                self.guest_command(vm, "/sbin/chkconfig", &args, "/etc/init.d")
            })
            .step("start", || {
                self.guest_command(vm, "/sbin/service", &["vm_network_fix", "start"], "/etc/init.d")
            })
            .run();

        if chain.succeeded() {
            tracing::info!("Daemon process started successfully");
            report.advance(VmLifecycle::PostInstallFixedUp);
        }
        report.fixup = Some(chain);
    }

    fn guest_command(&self, vm: &VmRef, binary: &str, args: &[&str], cwd: &str) -> Result<()> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.hypervisor.run_guest_process(vm, binary, &args, cwd)?;
        self.poller.clock().sleep(self.timings.settle);
        Ok(())
    }

    fn shut_down(&self, vm: &VmRef, report: &mut InstallReport) {
        tracing::info!(
            secs = self.timings.warm_up.as_secs(),
            "Waiting so that all services start successfully"
        );
        self.poller.pause("Warm-up", self.timings.warm_up, self.timings.warm_up_step);

        tracing::info!("Issuing a graceful shutdown request to the guest");
        if let Err(e) = self.guest_command(vm, "/sbin/shutdown", &["-h", "now"], "/root") {
            tracing::warn!("The VM may be hard powered off by downstream tooling");
            report.record("shutdown", e);
            return;
        }

        let outcome = self.poller.poll_until("Power off", self.timings.power_off, || {
            match self.hypervisor.is_powered_off(vm) {
                Ok(true) => Check::Ready(()),
                Ok(false) => Check::NotYet,
                Err(e) => Check::Transient(e),
            }
        });

        match outcome {
            Ok(PollOutcome::Ready { .. }) => report.advance(VmLifecycle::PoweredOff),
            Ok(PollOutcome::TimedOut { elapsed, .. }) => {
                tracing::warn!(
                    "The VM did not power off, downstream tooling may hard power it off"
                );
                report.record("wait for power off", Error::timeout("Power off", elapsed));
            }
            Err(e) => report.record("wait for power off", e),
        }
    }

    fn eject_media(&self, vm: &VmRef, report: &mut InstallReport) {
        let result = self.hypervisor.vm_devices(vm).and_then(|devices| {
            let changes = disconnect_cdrom_changes(&devices);
            if changes.is_empty() {
                tracing::info!("VM has no CD-ROMs to disconnect");
            }
            TaskRunner::new(self.hypervisor, self.poller)
                .with_config(self.timings.task)
                .reconfigure(vm, &changes)
        });

        match result {
            Ok(()) => {
                tracing::info!("Disconnected virtual CD-ROMs");
                report.advance(VmLifecycle::MediaDisconnected);
            }
            Err(e) => report.record("disconnect CD-ROMs", e),
        }
    }
}
