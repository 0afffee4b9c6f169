//! Reconfiguration task runner
//!
//! Submits device changes for an existing VM and waits for the hypervisor
//! task to reach a terminal state. No retries happen here; callers decide
//! whether a failed task is fatal.

use crate::devices::DeviceChange;
use crate::hypervisor::{Hypervisor, TaskHandle, TaskState, VmRef};
use crate::poll::{Check, PollConfig, PollOutcome, Poller};
use crate::{Error, Result};

/// How often task state is queried and for how long
pub const DEFAULT_TASK_POLL: PollConfig = PollConfig::secs(1, 1800);

pub struct TaskRunner<'a> {
    hypervisor: &'a dyn Hypervisor,
    poller: Poller<'a>,
    config: PollConfig,
}

impl<'a> TaskRunner<'a> {
    pub fn new(hypervisor: &'a dyn Hypervisor, poller: Poller<'a>) -> Self {
        Self {
            hypervisor,
            poller,
            config: DEFAULT_TASK_POLL,
        }
    }

    pub fn with_config(mut self, config: PollConfig) -> Self {
        self.config = config;
        self
    }

    pub fn submit_reconfigure(&self, vm: &VmRef, changes: &[DeviceChange]) -> Result<TaskHandle> {
        tracing::debug!(vm = %vm, changes = changes.len(), "Submitting reconfigure");
        self.hypervisor.submit_reconfigure_vm(vm, changes)
    }

    /// Wait until `task` succeeds or fails.
    ///
    /// Returns `TaskState::Success` or `TaskState::Error(msg)` with the
    /// hypervisor's message untouched. Running out of time is an
    /// [`Error::Timeout`].
    pub fn await_task(&self, task: &TaskHandle) -> Result<TaskState> {
        let outcome = self.poller.poll_until("Task", self.config, || {
            match self.hypervisor.poll_task(task) {
                Ok(TaskState::Pending) => Check::NotYet,
                Ok(state) => Check::Ready(state),
                Err(e) => Check::Transient(e),
            }
        })?;

        match outcome {
            PollOutcome::Ready { value, elapsed, .. } => {
                let elapsed_secs = elapsed.as_secs();
                tracing::debug!(task = %task, elapsed_secs, state = ?value, "Task finished");
                Ok(value)
            }
            PollOutcome::TimedOut { elapsed, .. } => {
                Err(Error::timeout(format!("Task {}", task), elapsed))
            }
        }
    }

    /// Await `task` and turn a task error into `on_error(msg)`
    pub fn complete(
        &self,
        task: &TaskHandle,
        on_error: impl FnOnce(String) -> Error,
    ) -> Result<()> {
        match self.await_task(task)? {
            TaskState::Error(msg) => Err(on_error(msg)),
            _ => Ok(()),
        }
    }

    /// Submit `changes` and wait for them to apply. An empty change list is a no-op.
    pub fn reconfigure(&self, vm: &VmRef, changes: &[DeviceChange]) -> Result<()> {
        if changes.is_empty() {
            tracing::debug!(vm = %vm, "Nothing to reconfigure");
            return Ok(());
        }
        let task = self.submit_reconfigure(vm, changes)?;
        self.complete(&task, Error::RemoteTask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{build_cdrom_backing, CdromBackingKind, DeviceKind, VirtualDevice};
    use crate::hypervisor::MockHypervisor;
    use crate::poll::SimulatedClock;
    use mockall::Sequence;
    use std::time::Duration;

    fn cdrom_change() -> Vec<DeviceChange> {
        vec![DeviceChange::edit(VirtualDevice {
            key: 3000,
            controller_key: Some(200),
            unit_number: Some(0),
            connectable: None,
            kind: DeviceKind::Cdrom {
                backing: build_cdrom_backing(CdromBackingKind::Iso, "[ds1] iso/os.iso"),
            },
        })]
    }

    #[test]
    fn test_await_task_polls_until_terminal() {
        let mut mock = MockHypervisor::new();
        let mut seq = Sequence::new();
        mock.expect_poll_task()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Ok(TaskState::Pending));
        mock.expect_poll_task()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(TaskState::Success));

        let clock = SimulatedClock::new();
        let runner = TaskRunner::new(&mock, Poller::new(&clock));
        let state = runner.await_task(&TaskHandle("task-1".into())).unwrap();

        assert_eq!(state, TaskState::Success);
        assert_eq!(clock.total_slept(), Duration::from_secs(2));
    }

    #[test]
    fn test_error_message_is_verbatim() {
        let msg = "Invalid configuration for device '0'.";
        let mut mock = MockHypervisor::new();
        mock.expect_submit_reconfigure_vm()
            .times(1)
            .returning(|_, _| Ok(TaskHandle("task-7".into())));
        mock.expect_poll_task()
            .returning(move |_| Ok(TaskState::Error(msg.to_string())));

        let clock = SimulatedClock::new();
        let runner = TaskRunner::new(&mock, Poller::new(&clock));
        let err = runner
            .reconfigure(&VmRef::new("vm-42"), &cdrom_change())
            .unwrap_err();

        match err {
            Error::RemoteTask(m) => assert_eq!(m, msg),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_no_retry_on_task_error() {
        let mut mock = MockHypervisor::new();
        mock.expect_submit_reconfigure_vm()
            .times(1)
            .returning(|_, _| Ok(TaskHandle("task-7".into())));
        mock.expect_poll_task()
            .times(1)
            .returning(|_| Ok(TaskState::Error("boom".into())));

        let clock = SimulatedClock::new();
        let runner = TaskRunner::new(&mock, Poller::new(&clock));
        assert!(runner.reconfigure(&VmRef::new("vm-42"), &cdrom_change()).is_err());
    }

    #[test]
    fn test_empty_reconfigure_is_noop() {
        let mut mock = MockHypervisor::new();
        mock.expect_submit_reconfigure_vm().times(0);

        let clock = SimulatedClock::new();
        let runner = TaskRunner::new(&mock, Poller::new(&clock));
        runner.reconfigure(&VmRef::new("vm-42"), &[]).unwrap();
    }

    #[test]
    fn test_stuck_task_times_out() {
        let mut mock = MockHypervisor::new();
        mock.expect_poll_task().returning(|_| Ok(TaskState::Pending));

        let clock = SimulatedClock::new();
        let runner =
            TaskRunner::new(&mock, Poller::new(&clock)).with_config(PollConfig::secs(1, 5));
        let err = runner.await_task(&TaskHandle("task-9".into())).unwrap_err();

        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(clock.total_slept(), Duration::from_secs(5));
    }

    #[test]
    fn test_poll_errors_are_retried() {
        let mut mock = MockHypervisor::new();
        let mut seq = Sequence::new();
        mock.expect_poll_task()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(Error::Hypervisor("session busy".into())));
        mock.expect_poll_task()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(TaskState::Success));

        let clock = SimulatedClock::new();
        let runner = TaskRunner::new(&mock, Poller::new(&clock));
        assert_eq!(runner.await_task(&TaskHandle("t".into())).unwrap(), TaskState::Success);
    }
}
