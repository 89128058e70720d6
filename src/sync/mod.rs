//! OpenReader synchronization.
//!
//! - [`SyncClient`] signs in, keeps tokens fresh and pulls subscriptions and
//!   stream contents into the store
//! - [`SyncOp`] describes a local change pushed back to the server

mod client;
mod ops;
mod token;

use thiserror::Error;

use crate::credentials::CredentialError;
use crate::feed::ParseError;
use crate::model::FolderId;
use crate::storage::DatabaseError;

pub use client::{RemoteCategory, RemoteSubscription, SubscriptionReport, SyncClient};
pub use ops::SyncOp;
pub use token::{parse_client_login, Token, AUTH_TOKEN_LIFETIME, EDIT_TOKEN_LIFETIME};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Sync request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Sync request timed out")]
    Timeout,

    #[error("Sync server returned HTTP {0}")]
    Status(u16),

    #[error("Sync server rejected the username or password")]
    AuthFailed,

    #[error("No password stored for the sync account")]
    MissingCredentials,

    #[error("Sync server rejected the edit token")]
    BadEditToken,

    #[error("Unexpected sync server response: {0}")]
    Protocol(String),

    #[error("Invalid sync server URL: {0}")]
    InvalidUrl(String),

    #[error("Folder {0} is not synchronized with the server")]
    NotSynced(FolderId),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Credential(#[from] CredentialError),
}

impl SyncError {
    /// Network trouble, 5xx and 429 are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Network(_) | SyncError::Timeout => true,
            SyncError::Status(status) => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}
