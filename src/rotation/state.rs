use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::lease::{Credentials, LeaseMode};
use crate::proxy::LeaseAwareProxy;

/// Where the policy is in one refresh cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PolicyPhase {
    Idle,
    AwaitingNewLease,
    Swapping,
}

/// How incoming credentials relate to the ones already applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    New,
    /// Same lease delivered again
    Duplicate,
    /// A different lease issued before the applied one
    Stale,
}

/// Per-path rotation state. The mode is fixed for the life of the path and the
/// proxy's active handle only changes through [`RotationState::install`].
pub struct RotationState<H> {
    path: String,
    mode: LeaseMode,
    last_credentials: Credentials,
    proxy: Arc<LeaseAwareProxy<H>>,
    generation: u64,
}

impl<H> RotationState<H> {
    pub fn new(
        path: impl Into<String>,
        mode: LeaseMode,
        credentials: Credentials,
        proxy: Arc<LeaseAwareProxy<H>>,
    ) -> Self {
        Self {
            path: path.into(),
            mode,
            last_credentials: credentials,
            proxy,
            generation: 0,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn mode(&self) -> LeaseMode {
        self.mode
    }

    pub fn last_credentials(&self) -> &Credentials {
        &self.last_credentials
    }

    pub fn proxy(&self) -> &Arc<LeaseAwareProxy<H>> {
        &self.proxy
    }

    /// Number of swaps applied since startup
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn classify(&self, incoming: &Credentials) -> Freshness {
        if incoming.same_lease(&self.last_credentials) {
            Freshness::Duplicate
        } else if incoming.supersedes(&self.last_credentials) {
            Freshness::New
        } else {
            Freshness::Stale
        }
    }

    /// Make `handle`, built from `credentials`, the active one. Returns the
    /// superseded handle, which the caller now owns and must drain.
    pub fn install(&mut self, credentials: Credentials, handle: Arc<H>) -> Arc<H> {
        let previous = self.proxy.swap(handle);
        self.last_credentials = credentials;
        self.generation += 1;
        previous
    }
}

/// Lease timing on the monotonic clock, restarted whenever a lease is
/// applied or renewed
#[derive(Debug, Clone)]
pub struct LeaseTimer {
    expires_at: Instant,
    renew_at: Option<Instant>,
    renewable: bool,
    expired: bool,
}

impl LeaseTimer {
    pub fn start(credentials: &Credentials, mode: LeaseMode, renew_margin: Duration) -> Self {
        Self::from_ttl(credentials.ttl(), mode == LeaseMode::Renew && credentials.is_renewable(), renew_margin)
    }

    fn from_ttl(ttl: Duration, renewable: bool, renew_margin: Duration) -> Self {
        let now = Instant::now();
        let renew_at = renewable.then(|| {
            let lead = if ttl > renew_margin { ttl - renew_margin } else { ttl / 2 };
            now + lead
        });
        Self {
            expires_at: now + ttl,
            renew_at,
            renewable,
            expired: false,
        }
    }

    /// Restart after the backend extended the same lease
    pub fn renewed(&mut self, ttl: Duration, renew_margin: Duration) {
        *self = Self::from_ttl(ttl, self.renewable, renew_margin);
    }

    pub fn renewal_due(&self) -> Option<Instant> {
        self.renew_at
    }

    /// Renewal is requested once per lease window
    pub fn renewal_requested(&mut self) {
        self.renew_at = None;
    }

    pub fn mark_expired(&mut self) {
        self.expired = true;
        self.renew_at = None;
    }

    pub fn is_expired(&self) -> bool {
        self.expired || Instant::now() >= self.expires_at
    }
}
