// Lease model shared by credential sources and the rotation policy

pub mod file;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub use file::FileCredentialSource;

/// How the backend keeps a watched lease alive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseMode {
    /// Extend the same credential set; on expiry fall back to rotation
    Renew,
    /// Replace the credential set entirely each time
    Rotate,
}

impl LeaseMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "renew" => Some(LeaseMode::Renew),
            "rotate" => Some(LeaseMode::Rotate),
            _ => None,
        }
    }
}

impl fmt::Display for LeaseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseMode::Renew => f.write_str("renew"),
            LeaseMode::Rotate => f.write_str("rotate"),
        }
    }
}

/// A time-boxed credential set. Fields are fixed at construction.
#[derive(Clone)]
pub struct Credentials {
    lease_id: String,
    username: String,
    secret: SecretString,
    issued_at: DateTime<Utc>,
    renewable: bool,
    ttl: Duration,
}

impl Credentials {
    pub fn new(
        lease_id: impl Into<String>,
        username: impl Into<String>,
        secret: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            lease_id: lease_id.into(),
            username: username.into(),
            secret: SecretString::from(secret.into()),
            issued_at: Utc::now(),
            renewable: false,
            ttl,
        }
    }

    pub fn renewable(mut self, renewable: bool) -> Self {
        self.renewable = renewable;
        self
    }

    pub fn issued_at(mut self, issued_at: DateTime<Utc>) -> Self {
        self.issued_at = issued_at;
        self
    }

    pub fn lease_id(&self) -> &str {
        &self.lease_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn secret(&self) -> &str {
        self.secret.expose_secret()
    }

    pub fn issued(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn is_renewable(&self) -> bool {
        self.renewable
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Reject credential sets no resource could be built from
    pub fn validate(&self) -> Result<(), String> {
        if self.lease_id.trim().is_empty() {
            return Err("lease id is empty".to_string());
        }
        if self.username.trim().is_empty() {
            return Err(format!("lease {} has no username", self.lease_id));
        }
        if self.secret.expose_secret().is_empty() {
            return Err(format!("lease {} has no password", self.lease_id));
        }
        Ok(())
    }

    /// True when `other` carries the same lease, however often it was delivered
    pub fn same_lease(&self, other: &Credentials) -> bool {
        self.lease_id == other.lease_id
    }

    /// True when this is a different lease issued no earlier than `other`
    pub fn supersedes(&self, other: &Credentials) -> bool {
        !self.same_lease(other) && self.issued_at >= other.issued_at
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("lease_id", &self.lease_id)
            .field("username", &self.username)
            .field("secret", &"***")
            .field("issued_at", &self.issued_at)
            .field("renewable", &self.renewable)
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Lifecycle notification for one watched path
#[derive(Debug, Clone)]
pub struct LeaseEvent {
    pub path: String,
    pub kind: LeaseEventKind,
}

#[derive(Debug, Clone)]
pub enum LeaseEventKind {
    Issued(Credentials),
    Rotated(Credentials),
    Renewed { lease_id: String, ttl: Duration },
    RenewalFailed(String),
    Expired,
}

impl LeaseEvent {
    pub fn issued(path: impl Into<String>, credentials: Credentials) -> Self {
        Self { path: path.into(), kind: LeaseEventKind::Issued(credentials) }
    }

    pub fn rotated(path: impl Into<String>, credentials: Credentials) -> Self {
        Self { path: path.into(), kind: LeaseEventKind::Rotated(credentials) }
    }

    pub fn renewed(path: impl Into<String>, lease_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            kind: LeaseEventKind::Renewed { lease_id: lease_id.into(), ttl },
        }
    }

    pub fn renewal_failed(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self { path: path.into(), kind: LeaseEventKind::RenewalFailed(reason.into()) }
    }

    pub fn expired(path: impl Into<String>) -> Self {
        Self { path: path.into(), kind: LeaseEventKind::Expired }
    }

    /// Credentials carried by Issued/Rotated events
    pub fn credentials(&self) -> Option<&Credentials> {
        match &self.kind {
            LeaseEventKind::Issued(c) | LeaseEventKind::Rotated(c) => Some(c),
            _ => None,
        }
    }
}

/// Errors raised by a credential source
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SourceError {
    #[error("Unknown lease path: {0}")]
    UnknownPath(String),

    #[error("Lease unavailable for {path}: {reason}")]
    Unavailable { path: String, reason: String },
}

pub type LeaseStream = BoxStream<'static, LeaseEvent>;

/// Provider of time-boxed credentials for a path.
///
/// Rotation and renewal requests are fire-and-forget: the outcome arrives
/// later as an event on the stream returned by `subscribe`.
#[async_trait]
pub trait CredentialSource: Send + Sync + 'static {
    /// Open a subscription for `path`. Events arrive in issuance order and
    /// may be delivered more than once.
    async fn subscribe(&self, path: &str, mode: LeaseMode) -> Result<LeaseStream, SourceError>;

    async fn request_rotation(&self, path: &str) -> Result<(), SourceError>;

    async fn request_renewal(&self, path: &str) -> Result<(), SourceError>;
}

/// Adapt an mpsc receiver into a lease stream
pub(crate) fn receiver_stream(rx: tokio::sync::mpsc::UnboundedReceiver<LeaseEvent>) -> LeaseStream {
    use futures::StreamExt;

    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_hides_secret() {
        let creds = Credentials::new("lease-1", "v-app-role-x1", "hunter2", Duration::from_secs(60));
        let printed = format!("{:?}", creds);
        assert!(printed.contains("v-app-role-x1"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn validate_rejects_missing_fields() {
        let ok = Credentials::new("lease-1", "user", "pass", Duration::from_secs(60));
        assert!(ok.validate().is_ok());

        let no_user = Credentials::new("lease-1", " ", "pass", Duration::from_secs(60));
        assert!(no_user.validate().is_err());

        let no_secret = Credentials::new("lease-1", "user", "", Duration::from_secs(60));
        assert!(no_secret.validate().is_err());

        let no_lease = Credentials::new("", "user", "pass", Duration::from_secs(60));
        assert!(no_lease.validate().is_err());
    }

    #[test]
    fn lease_ordering_uses_id_then_issue_time() {
        let issued = Utc::now();
        let earlier = issued - chrono::Duration::seconds(30);
        let a = Credentials::new("lease-1", "u", "p", Duration::from_secs(60)).issued_at(issued);
        let replay = Credentials::new("lease-1", "u", "p", Duration::from_secs(60)).issued_at(earlier);
        let newer = Credentials::new("lease-2", "u", "p", Duration::from_secs(60)).issued_at(issued);
        let older = Credentials::new("lease-0", "u", "p", Duration::from_secs(60)).issued_at(earlier);

        assert!(a.same_lease(&replay));
        assert!(!a.supersedes(&replay));
        assert!(newer.supersedes(&a));
        assert!(!older.supersedes(&a));
    }

    #[test]
    fn parses_lease_mode() {
        assert_eq!(LeaseMode::parse("RENEW"), Some(LeaseMode::Renew));
        assert_eq!(LeaseMode::parse("rotate"), Some(LeaseMode::Rotate));
        assert_eq!(LeaseMode::parse("other"), None);
    }
}
