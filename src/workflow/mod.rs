//! VM lifecycle workflows
//!
//! Each workflow borrows a connected [`Hypervisor`](crate::hypervisor::Hypervisor)
//! and a [`Poller`](crate::poll::Poller); neither keeps any state between runs.

pub mod create;
pub mod delete;
pub mod install;
pub mod steps;

pub use create::{CreateReport, Placement, VmCreator};
pub use delete::{DeleteReport, VmDeleter};
pub use install::{InstallReport, InstallWatcher, PhaseTimings};
pub use steps::{ChainReport, StepChain, StepFailure, StepStatus};
