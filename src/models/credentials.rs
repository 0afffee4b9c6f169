//! Credentials for the management endpoint and for guest logins

use serde::{Deserialize, Serialize};

/// Username and password used to log in to the guest OS
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestCredentials {
    pub username: String,
    pub password: String,
}

impl GuestCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Apply CLI overrides on top of a login profile
    pub fn with_overrides(self, username: Option<String>, password: Option<String>) -> Self {
        Self {
            username: username.unwrap_or(self.username),
            password: password.unwrap_or(self.password),
        }
    }
}

impl std::fmt::Debug for GuestCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Login for the hypervisor management endpoint
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointCredentials {
    pub username: String,
    pub password: String,
}

impl EndpointCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for EndpointCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
