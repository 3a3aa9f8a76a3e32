//! Authentication Module
//!
//! The broker only needs a yes/no answer for a CONNECT's credentials; the
//! `Authenticator` trait is that seam. `AuthProvider` answers it from the
//! `[auth]` section of the configuration.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::debug;

use crate::config::AuthConfig;

#[cfg(test)]
mod tests;

/// Credential check for CONNECT
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Returns true if the client may connect with these credentials
    async fn check_valid(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> bool;
}

/// Authentication provider backed by configured users
pub struct AuthProvider {
    /// Whether auth is enabled
    enabled: bool,
    /// Allow connections without a username
    allow_anonymous: bool,
    /// username -> password (plaintext)
    users: HashMap<String, String>,
}

impl AuthProvider {
    /// Create a new auth provider from configuration
    pub fn new(config: &AuthConfig) -> Self {
        let users = config
            .users
            .iter()
            .map(|u| (u.username.clone(), u.password.clone()))
            .collect();

        Self {
            enabled: config.enabled,
            allow_anonymous: config.allow_anonymous,
            users,
        }
    }

    /// Check if auth is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn verify_password(password: &[u8], stored: &str) -> bool {
        password == stored.as_bytes()
    }
}

#[async_trait]
impl Authenticator for AuthProvider {
    async fn check_valid(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> bool {
        if !self.enabled {
            return true;
        }

        let Some(username) = username else {
            if !self.allow_anonymous {
                debug!(client_id = %client_id, "anonymous connection refused");
            }
            return self.allow_anonymous;
        };

        let Some(stored) = self.users.get(username) else {
            debug!(client_id = %client_id, username = %username, "unknown user");
            return false;
        };

        Self::verify_password(password.unwrap_or(&[]), stored)
    }
}

/// Authenticator that accepts every client
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    async fn check_valid(&self, _: &str, _: Option<&str>, _: Option<&[u8]>) -> bool {
        true
    }
}
