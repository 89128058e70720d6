//! Auth and edit token lifetimes for the OpenReader protocol.

use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tokio::time::Instant;

/// ClientLogin tokens are valid for about a day on common servers.
pub const AUTH_TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Edit (`T`) tokens expire much sooner.
pub const EDIT_TOKEN_LIFETIME: Duration = Duration::from_secs(30 * 60);

/// Renew this long before expiry.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

/// A server-issued token with a known lifetime.
pub struct Token {
    value: SecretString,
    obtained: Instant,
    lifetime: Duration,
}

impl Token {
    pub fn new(value: impl Into<String>, lifetime: Duration) -> Self {
        Self {
            value: SecretString::from(value.into()),
            obtained: Instant::now(),
            lifetime,
        }
    }

    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }

    pub fn expires_at(&self) -> Instant {
        self.obtained + self.lifetime
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at()
    }

    /// When a background refresher should renew this token.
    pub fn refresh_at(&self) -> Instant {
        self.expires_at()
            .checked_sub(REFRESH_MARGIN.min(self.lifetime / 2))
            .unwrap_or(self.obtained)
    }

    /// Valid and not yet inside the refresh margin.
    pub fn is_fresh(&self) -> bool {
        Instant::now() < self.refresh_at()
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("value", &"[REDACTED]")
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

/// Pull the `Auth=` line out of a ClientLogin response body.
pub fn parse_client_login(body: &str) -> Option<&str> {
    body.lines()
        .filter_map(|line| line.trim().strip_prefix("Auth="))
        .map(str::trim)
        .find(|token| !token.is_empty())
}
