//! VM identity and the lifecycle states tracked by the workflows

use serde::{Deserialize, Serialize};

use super::EndpointCredentials;

/// One VM on one management endpoint. Fixed for the duration of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmIdentity {
    pub name: String,
    pub endpoint: String,
    pub credentials: EndpointCredentials,
}

impl VmIdentity {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        credentials: EndpointCredentials,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            credentials,
        }
    }
}

/// Progress of a VM through provisioning and OS installation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VmLifecycle {
    Provisioning,
    /// Powered on, OS installer running
    PoweredOn,
    /// Guest tools heartbeat received
    GuestReachable,
    LoggedIn,
    /// Completion marker observed in the guest
    InstallComplete,
    IpCaptured,
    PostInstallFixedUp,
    PoweredOff,
    MediaDisconnected,
}

impl std::fmt::Display for VmLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmLifecycle::Provisioning => write!(f, "Provisioning"),
            VmLifecycle::PoweredOn => write!(f, "PoweredOn"),
            VmLifecycle::GuestReachable => write!(f, "GuestReachable"),
            VmLifecycle::LoggedIn => write!(f, "LoggedIn"),
            VmLifecycle::InstallComplete => write!(f, "InstallComplete"),
            VmLifecycle::IpCaptured => write!(f, "IpCaptured"),
            VmLifecycle::PostInstallFixedUp => write!(f, "PostInstallFixedUp"),
            VmLifecycle::PoweredOff => write!(f, "PoweredOff"),
            VmLifecycle::MediaDisconnected => write!(f, "MediaDisconnected"),
        }
    }
}

/// Progress of the deletion workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeletionState {
    Located,
    ShutdownRequested,
    PoweredOff,
    Destroyed,
}

impl std::fmt::Display for DeletionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeletionState::Located => write!(f, "Located"),
            DeletionState::ShutdownRequested => write!(f, "ShutdownRequested"),
            DeletionState::PoweredOff => write!(f, "PoweredOff"),
            DeletionState::Destroyed => write!(f, "Destroyed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_display() {
        assert_eq!(VmLifecycle::InstallComplete.to_string(), "InstallComplete");
        assert_eq!(DeletionState::Destroyed.to_string(), "Destroyed");
    }

    #[test]
    fn test_lifecycle_ordering() {
        assert!(VmLifecycle::LoggedIn > VmLifecycle::GuestReachable);
        assert!(VmLifecycle::MediaDisconnected > VmLifecycle::PoweredOff);
        assert!(DeletionState::Destroyed > DeletionState::Located);
    }

    #[test]
    fn test_identity_serialization() {
        let id = VmIdentity::new("build-01", "10.0.0.10", EndpointCredentials::new("root", "pw"));
        let json = serde_json::to_string(&id).unwrap();
        let back: VmIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
