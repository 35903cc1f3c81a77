// Resource handles built from lease credentials

use async_trait::async_trait;
use thiserror::Error;

use crate::lease::Credentials;

/// Errors from building a handle. The builder never retries; the rotation
/// policy keeps the previous handle active when this is returned.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BuildError {
    #[error("Malformed credentials: {0}")]
    MalformedCredentials(String),

    #[error("Invalid resource URL: {0}")]
    InvalidUrl(String),

    #[error("Resource unreachable: {0}")]
    Unreachable(String),
}

/// An independently closeable resource that owns its own connections
#[async_trait]
pub trait ResourceHandle: Send + Sync + 'static {
    /// Close the handle and release everything it owns
    async fn close(&self);

    fn is_closed(&self) -> bool;

    /// True while work checked out of the handle is still outstanding,
    /// even if nobody holds the handle itself
    fn in_use(&self) -> bool {
        false
    }

    /// Lease the handle was built from, for logs and reports
    fn lease_id(&self) -> &str;
}

/// Turns one credential set into one handle
#[async_trait]
pub trait ResourceBuilder: Send + Sync + 'static {
    type Handle: ResourceHandle;

    async fn build(&self, credentials: &Credentials) -> Result<Self::Handle, BuildError>;
}
