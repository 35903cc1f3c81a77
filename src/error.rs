// Rotation error taxonomy
use std::time::Duration;
use thiserror::Error;

use crate::lease::SourceError;
use crate::resource::BuildError;

/// Failures of the rotation machinery. None of these reach consumers of the
/// proxy; they go to logs and the report channel.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RotationError {
    /// No Issued/Rotated event arrived within the request window.
    /// Retried on the next scheduled tick.
    #[error("No new lease for {path} within {timeout:?}")]
    CredentialRequestTimeout { path: String, timeout: Duration },

    /// The new credentials could not be turned into a handle; the old one stays active
    #[error("Failed to build handle for lease {lease_id}: {source}")]
    Build { lease_id: String, source: BuildError },

    #[error(transparent)]
    Source(#[from] SourceError),

    /// The credentials were already applied. Ignored, never reported.
    #[error("Lease {0} already applied")]
    DuplicateEvent(String),

    /// The active lease has expired and replacements keep failing to build.
    /// There is no local recovery from this.
    #[error("Lease {lease_id} for {path} expired and {failures} consecutive builds failed")]
    HardExpired { path: String, lease_id: String, failures: u32 },

    /// No usable handle could be built at startup
    #[error("Could not start rotation for {path}: {reason}")]
    Startup { path: String, reason: String },
}

impl RotationError {
    pub fn build(lease_id: impl Into<String>, source: BuildError) -> Self {
        RotationError::Build { lease_id: lease_id.into(), source }
    }

    pub fn startup(path: impl Into<String>, reason: impl Into<String>) -> Self {
        RotationError::Startup { path: path.into(), reason: reason.into() }
    }

    /// Machine-readable code for report consumers
    pub fn error_code(&self) -> &'static str {
        match self {
            RotationError::CredentialRequestTimeout { .. } => "CREDENTIAL_REQUEST_TIMEOUT",
            RotationError::Build { .. } => "BUILD_ERROR",
            RotationError::Source(_) => "SOURCE_ERROR",
            RotationError::DuplicateEvent(_) => "DUPLICATE_EVENT",
            RotationError::HardExpired { .. } => "HARD_EXPIRED",
            RotationError::Startup { .. } => "STARTUP_ERROR",
        }
    }

    /// True when operators must step in
    pub fn is_fatal(&self) -> bool {
        matches!(self, RotationError::HardExpired { .. } | RotationError::Startup { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_hard_expiry_and_startup_are_fatal() {
        let timeout = RotationError::CredentialRequestTimeout {
            path: "database/creds/app-role".to_string(),
            timeout: Duration::from_secs(10),
        };
        let build = RotationError::build("lease-1", BuildError::Unreachable("refused".to_string()));
        let expired = RotationError::HardExpired {
            path: "database/creds/app-role".to_string(),
            lease_id: "lease-1".to_string(),
            failures: 3,
        };

        assert!(!timeout.is_fatal());
        assert!(!build.is_fatal());
        assert!(expired.is_fatal());
        assert_eq!(build.error_code(), "BUILD_ERROR");
        assert!(build.to_string().contains("lease-1"));
    }
}
