//! VM deletion: graceful shutdown, then destroy

use uuid::Uuid;

use crate::hypervisor::{Hypervisor, VmRef};
use crate::models::DeletionState;
use crate::poll::{Check, PollConfig, PollOutcome, Poller};
use crate::task::{TaskRunner, DEFAULT_TASK_POLL};
use crate::{Error, Result};

pub const DEFAULT_POWER_OFF_POLL: PollConfig = PollConfig::secs(1, 60);

#[derive(Debug, Clone)]
pub struct DeleteReport {
    pub vm_name: String,
    pub vm: VmRef,
    pub state: DeletionState,
    /// Shutdown problems that did not stop the destroy
    pub warnings: Vec<String>,
}

pub struct VmDeleter<'a> {
    hypervisor: &'a dyn Hypervisor,
    poller: Poller<'a>,
    power_off: PollConfig,
    task_poll: PollConfig,
}

impl<'a> VmDeleter<'a> {
    pub fn new(hypervisor: &'a dyn Hypervisor, poller: Poller<'a>) -> Self {
        Self {
            hypervisor,
            poller,
            power_off: DEFAULT_POWER_OFF_POLL,
            task_poll: DEFAULT_TASK_POLL,
        }
    }

    pub fn with_power_off(mut self, config: PollConfig) -> Self {
        self.power_off = config;
        self
    }

    pub fn with_task_poll(mut self, config: PollConfig) -> Self {
        self.task_poll = config;
        self
    }

    pub fn delete(&self, name: &str) -> Result<DeleteReport> {
        if name.is_empty() {
            return Err(Error::Config(
                "cannot continue without the name of the VM to delete, use --name".into(),
            ));
        }

        let span = tracing::info_span!("delete", run_id = %Uuid::new_v4(), vm = %name);
        let _enter = span.enter();

        let vm = self
            .hypervisor
            .find_vm_by_name(name)?
            .ok_or_else(|| Error::VmNotFound(name.to_string()))?;

        let mut report = DeleteReport {
            vm_name: name.to_string(),
            vm: vm.clone(),
            state: DeletionState::Located,
            warnings: Vec::new(),
        };
        tracing::info!(vm_ref = %vm, state = %report.state, "Located VM");

        match self.hypervisor.shutdown_guest(&vm) {
            Ok(()) => {
                report.state = DeletionState::ShutdownRequested;
                tracing::info!(state = %report.state, "Guest shutdown requested");
                self.wait_for_power_off(&vm, &mut report);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not shut down the guest, destroying anyway");
                report.warnings.push(format!("shutdown: {}", e));
            }
        }

        let task = self.hypervisor.destroy_vm(&vm)?;
        TaskRunner::new(self.hypervisor, self.poller)
            .with_config(self.task_poll)
            .complete(&task, |msg| {
                tracing::error!(error = %msg, "Error removing VM");
                Error::RemoteTask(msg)
            })?;

        report.state = DeletionState::Destroyed;
        tracing::info!(state = %report.state, "VM successfully deleted from disk");
        Ok(report)
    }

    fn wait_for_power_off(&self, vm: &VmRef, report: &mut DeleteReport) {
        let outcome = self.poller.poll_until("Power off", self.power_off, || {
            match self.hypervisor.is_powered_off(vm) {
                Ok(true) => Check::Ready(()),
                Ok(false) => Check::NotYet,
                Err(e) => Check::Transient(e),
            }
        });

        match outcome {
            Ok(PollOutcome::Ready { .. }) => {
                report.state = DeletionState::PoweredOff;
                tracing::info!(state = %report.state, "Guest powered off");
            }
            Ok(PollOutcome::TimedOut { elapsed, .. }) => {
                let elapsed_secs = elapsed.as_secs();
                tracing::warn!(elapsed_secs, "Guest did not power off, destroying anyway");
                report.warnings.push(Error::timeout("Power off", elapsed).to_string());
            }
            Err(e) => report.warnings.push(e.to_string()),
        }
    }
}
