//! Out-of-band storage for feed and sync-account passwords.
//!
//! Folders only persist a username. Passwords live behind [`CredentialStore`]
//! so a platform keychain can be plugged in without touching the database.
use std::collections::HashMap;
use std::sync::Mutex;

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Credential store unavailable: {0}")]
    Unavailable(String),

    #[error("Username must not be empty")]
    EmptyUsername,
}

/// A username and password pair. The password is never printed.
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }
}

impl Clone for Credentials {
    fn clone(&self) -> Self {
        Self {
            username: self.username.clone(),
            password: SecretString::from(self.password.expose_secret().to_owned()),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Keyed password storage. Keys are feed URLs or sync server URLs.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Credentials>, CredentialError>;
    fn set(&self, key: &str, credentials: Credentials) -> Result<(), CredentialError>;
    fn remove(&self, key: &str) -> Result<(), CredentialError>;
}

/// Process-lifetime store. Used by the CLI and tests.
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<HashMap<String, Credentials>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Credentials>>, CredentialError> {
        self.entries
            .lock()
            .map_err(|_| CredentialError::Unavailable("credential store lock poisoned".into()))
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, key: &str) -> Result<Option<Credentials>, CredentialError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, credentials: Credentials) -> Result<(), CredentialError> {
        if credentials.username.trim().is_empty() {
            return Err(CredentialError::EmptyUsername);
        }
        tracing::debug!(key, username = %credentials.username, "credentials stored");
        self.lock()?.insert(key.to_string(), credentials);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CredentialError> {
        self.lock()?.remove(key);
        Ok(())
    }
}
