//! Best-effort step chains
//!
//! A chain runs named steps in order and never propagates a step's error.
//! Failures are logged and collected in the returned [`ChainReport`].

use crate::Result;

type Action<'a> = Box<dyn FnOnce() -> Result<()> + 'a>;

/// Result of one step in a chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Done,
    Failed(String),
    /// Not run because an earlier step failed
    Skipped,
}

/// A step that did not complete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub chain: String,
    pub step: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainReport {
    pub chain: String,
    pub steps: Vec<(String, StepStatus)>,
}

impl ChainReport {
    pub fn succeeded(&self) -> bool {
        self.steps.iter().all(|(_, s)| *s == StepStatus::Done)
    }

    pub fn failures(&self) -> Vec<StepFailure> {
        self.steps
            .iter()
            .filter_map(|(step, status)| match status {
                StepStatus::Failed(error) => Some(StepFailure {
                    chain: self.chain.clone(),
                    step: step.clone(),
                    error: error.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    pub fn status_of(&self, step: &str) -> Option<&StepStatus> {
        self.steps.iter().find(|(s, _)| s == step).map(|(_, status)| status)
    }
}

pub struct StepChain<'a> {
    name: String,
    steps: Vec<(String, Action<'a>)>,
    stop_on_failure: bool,
}

impl<'a> StepChain<'a> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            stop_on_failure: false,
        }
    }

    /// Skip the remaining steps once one fails
    pub fn stop_on_failure(mut self) -> Self {
        self.stop_on_failure = true;
        self
    }

    pub fn step(
        mut self,
        name: impl Into<String>,
        action: impl FnOnce() -> Result<()> + 'a,
    ) -> Self {
        self.steps.push((name.into(), Box::new(action)));
        self
    }

    pub fn run(self) -> ChainReport {
        let chain = self.name;
        let stop_on_failure = self.stop_on_failure;

        let (steps, _) = self.steps.into_iter().fold(
            (Vec::new(), false),
            |(mut done, failed), (step, action)| {
                if failed && stop_on_failure {
                    tracing::warn!(chain = %chain, step = %step, "Skipped");
                    done.push((step, StepStatus::Skipped));
                    return (done, failed);
                }
                match action() {
                    Ok(()) => {
                        tracing::info!(chain = %chain, step = %step, "Done");
                        done.push((step, StepStatus::Done));
                        (done, failed)
                    }
                    Err(e) => {
                        tracing::error!(
                            chain = %chain,
                            step = %step,
                            error = %e,
                            "Step failed, continuing"
                        );
                        done.push((step, StepStatus::Failed(e.to_string())));
                        (done, true)
                    }
                }
            },
        );

        ChainReport { chain, steps }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::cell::RefCell;

    #[test]
    fn test_all_steps_run() {
        let log = RefCell::new(Vec::new());
        let report = StepChain::new("demo")
            .step("a", || {
                log.borrow_mut().push("a");
                Ok(())
            })
            .step("b", || {
                log.borrow_mut().push("b");
                Ok(())
            })
            .run();

        assert!(report.succeeded());
        assert_eq!(*log.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn test_failure_is_collected_not_propagated() {
        let log = RefCell::new(Vec::new());
        let report = StepChain::new("demo")
            .step("a", || Err(Error::Hypervisor("guest agent gone".into())))
            .step("b", || {
                log.borrow_mut().push("b");
                Ok(())
            })
            .run();

        assert!(!report.succeeded());
        assert_eq!(*log.borrow(), vec!["b"]);
        let failures = report.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].step, "a");
        assert!(failures[0].error.contains("guest agent gone"));
    }

    #[test]
    fn test_stop_on_failure_skips_rest() {
        let log = RefCell::new(Vec::new());
        let report = StepChain::new("demo")
            .stop_on_failure()
            .step("a", || Ok(()))
            .step("b", || Err(Error::Hypervisor("denied".into())))
            .step("c", || {
                log.borrow_mut().push("c");
                Ok(())
            })
            .run();

        assert!(log.borrow().is_empty());
        assert_eq!(report.status_of("a"), Some(&StepStatus::Done));
        assert!(matches!(report.status_of("b"), Some(StepStatus::Failed(_))));
        assert_eq!(report.status_of("c"), Some(&StepStatus::Skipped));
        assert_eq!(report.failures().len(), 1);
    }
}
