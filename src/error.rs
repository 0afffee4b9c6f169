//! Error types for VM lifecycle management

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("VM not found: {0}")]
    VmNotFound(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Datacenter not found: {0}")]
    DatacenterNotFound(String),

    #[error("Host not found: {0}")]
    HostNotFound(String),

    #[error("No compute resource owns host {0}")]
    ComputeResourceNotFound(String),

    #[error("Datastore not found: {0}")]
    DatastoreNotFound(String),

    #[error("Error creating vm: {0}")]
    VmCreationFailed(String),

    #[error("Remote task failed: {0}")]
    RemoteTask(String),

    #[error("Not ready yet: {0}")]
    Transient(String),

    #[error("{phase} did not finish within {} seconds", waited.as_secs())]
    Timeout { phase: String, waited: Duration },

    #[error("Invalid device: {0}")]
    InvalidDevice(String),

    #[error("Hypervisor call failed: {0}")]
    Hypervisor(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classes used to decide how a workflow reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    ResourceNotFound,
    RemoteTask,
    TransientUnavailable,
    Timeout,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Configuration,
            Error::VmNotFound(_)
            | Error::TemplateNotFound(_)
            | Error::DatacenterNotFound(_)
            | Error::HostNotFound(_)
            | Error::ComputeResourceNotFound(_)
            | Error::DatastoreNotFound(_) => ErrorKind::ResourceNotFound,
            Error::VmCreationFailed(_) | Error::RemoteTask(_) => ErrorKind::RemoteTask,
            Error::Transient(_) => ErrorKind::TransientUnavailable,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::InvalidDevice(_) | Error::Hypervisor(_) | Error::Io(_) | Error::Json(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Process exit code for a workflow that ended with this error
    pub fn exit_code(&self) -> u8 {
        1
    }

    pub fn timeout(phase: impl Into<String>, waited: Duration) -> Self {
        Error::Timeout {
            phase: phase.into(),
            waited,
        }
    }
}
