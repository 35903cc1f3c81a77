// In-memory stand-ins for the credential source and the resource,
// used to drive rotation without a secrets backend or Postgres.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use uuid::Uuid;

use crate::lease::{
    receiver_stream, CredentialSource, Credentials, LeaseEvent, LeaseMode, LeaseStream, SourceError,
};
use crate::resource::{BuildError, ResourceBuilder, ResourceHandle};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle that remembers the credentials it was built from
#[derive(Debug)]
pub struct MockHandle {
    lease_id: String,
    username: String,
    secret: String,
    closed: Arc<AtomicBool>,
    in_use: Arc<AtomicBool>,
    close_delay: Duration,
}

impl MockHandle {
    pub fn named(lease_id: &str) -> Self {
        Self {
            lease_id: lease_id.to_string(),
            username: format!("user-{}", lease_id),
            secret: format!("secret-{}", lease_id),
            closed: Arc::new(AtomicBool::new(false)),
            in_use: Arc::new(AtomicBool::new(false)),
            close_delay: Duration::ZERO,
        }
    }

    pub fn from_credentials(credentials: &Credentials) -> Self {
        Self {
            lease_id: credentials.lease_id().to_string(),
            username: credentials.username().to_string(),
            secret: credentials.secret().to_string(),
            closed: Arc::new(AtomicBool::new(false)),
            in_use: Arc::new(AtomicBool::new(false)),
            close_delay: Duration::ZERO,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Shared flag that flips when the handle is closed
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }

    /// Set to mimic work checked out of the handle, like a pooled connection
    pub fn in_use_flag(&self) -> Arc<AtomicBool> {
        self.in_use.clone()
    }

    /// Make `close` wait this long after refusing new work, the way a pool
    /// waits for checked-out connections
    pub fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }
}

#[async_trait]
impl ResourceHandle for MockHandle {
    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if !self.close_delay.is_zero() {
            tokio::time::sleep(self.close_delay).await;
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn in_use(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }

    fn lease_id(&self) -> &str {
        &self.lease_id
    }
}

/// Builder that records every build and fails on demand
#[derive(Debug, Default)]
pub struct MockBuilder {
    builds: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    fail_all: AtomicBool,
    close_delay_ms: AtomicU64,
}

impl MockBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make builds for `lease_id` fail as if the backend were unreachable
    pub fn fail_lease(&self, lease_id: &str) {
        locked(&self.failing).insert(lease_id.to_string());
    }

    pub fn fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Handles built from now on take `delay` to finish closing
    pub fn close_delay(&self, delay: Duration) {
        self.close_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Lease ids of every build attempt, in order
    pub fn builds(&self) -> Vec<String> {
        locked(&self.builds).clone()
    }
}

#[async_trait]
impl ResourceBuilder for MockBuilder {
    type Handle = MockHandle;

    async fn build(&self, credentials: &Credentials) -> Result<MockHandle, BuildError> {
        credentials.validate().map_err(BuildError::MalformedCredentials)?;
        locked(&self.builds).push(credentials.lease_id().to_string());

        if self.fail_all.load(Ordering::SeqCst)
            || locked(&self.failing).contains(credentials.lease_id())
        {
            return Err(BuildError::Unreachable(format!(
                "mock backend refused lease {}",
                credentials.lease_id()
            )));
        }
        let delay = Duration::from_millis(self.close_delay_ms.load(Ordering::SeqCst));
        Ok(MockHandle::from_credentials(credentials).with_close_delay(delay))
    }
}

/// Requests the policy made against the source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRequest {
    Subscribe { path: String, mode: LeaseMode },
    Rotation(String),
    Renewal(String),
}

#[derive(Default)]
struct SourceState {
    leases: HashMap<String, Credentials>,
    subscribers: HashMap<String, Vec<UnboundedSender<LeaseEvent>>>,
    requests: Vec<SourceRequest>,
}

/// Credential source whose events are driven by the test
pub struct InMemoryCredentialSource {
    state: Mutex<SourceState>,
    auto_rotate: AtomicBool,
    auto_renew: AtomicBool,
    fail_subscribe: AtomicBool,
    ttl: Duration,
    serial: AtomicU64,
}

impl InMemoryCredentialSource {
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_secs(3600))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            state: Mutex::new(SourceState::default()),
            auto_rotate: AtomicBool::new(false),
            auto_renew: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            ttl,
            serial: AtomicU64::new(0),
        }
    }

    /// Answer rotation requests with freshly minted credentials
    pub fn auto_rotate(&self, enabled: bool) {
        self.auto_rotate.store(enabled, Ordering::SeqCst);
    }

    /// Answer renewal requests with a Renewed event for the current lease
    pub fn auto_renew(&self, enabled: bool) {
        self.auto_renew.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// New credentials for `path` with a unique lease id
    pub fn mint(&self, path: &str) -> Credentials {
        let n = self.serial.fetch_add(1, Ordering::SeqCst);
        Credentials::new(
            format!("{}/{}", path, Uuid::new_v4().simple()),
            format!("v-app-{}", n),
            format!("pw-{}", Uuid::new_v4().simple()),
            self.ttl,
        )
        .renewable(true)
    }

    /// Make `credentials` the current lease and announce it as Issued
    pub fn issue(&self, path: &str, credentials: Credentials) {
        self.emit(LeaseEvent::issued(path, credentials));
    }

    /// Deliver `event` to every open subscription for its path
    pub fn emit(&self, event: LeaseEvent) {
        let mut state = locked(&self.state);
        if let Some(credentials) = event.credentials() {
            state.leases.insert(event.path.clone(), credentials.clone());
        }
        if let Some(senders) = state.subscribers.get_mut(&event.path) {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    /// End every open subscription for `path`
    pub fn close_subscriptions(&self, path: &str) {
        locked(&self.state).subscribers.remove(path);
    }

    pub fn requests(&self) -> Vec<SourceRequest> {
        locked(&self.state).requests.clone()
    }

    pub fn rotation_requests(&self, path: &str) -> usize {
        self.count(|r| matches!(r, SourceRequest::Rotation(p) if p == path))
    }

    pub fn renewal_requests(&self, path: &str) -> usize {
        self.count(|r| matches!(r, SourceRequest::Renewal(p) if p == path))
    }

    pub fn subscriptions(&self, path: &str) -> usize {
        self.count(|r| matches!(r, SourceRequest::Subscribe { path: p, .. } if p == path))
    }

    fn count(&self, pred: impl Fn(&SourceRequest) -> bool) -> usize {
        locked(&self.state).requests.iter().filter(|r| pred(r)).count()
    }
}

impl Default for InMemoryCredentialSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialSource for InMemoryCredentialSource {
    async fn subscribe(&self, path: &str, mode: LeaseMode) -> Result<LeaseStream, SourceError> {
        let mut state = locked(&self.state);
        state.requests.push(SourceRequest::Subscribe { path: path.to_string(), mode });
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable {
                path: path.to_string(),
                reason: "subscriptions disabled".to_string(),
            });
        }

        let (tx, rx) = unbounded_channel();
        if let Some(current) = state.leases.get(path) {
            let _ = tx.send(LeaseEvent::issued(path, current.clone()));
        }
        state.subscribers.entry(path.to_string()).or_default().push(tx);
        Ok(receiver_stream(rx))
    }

    async fn request_rotation(&self, path: &str) -> Result<(), SourceError> {
        locked(&self.state).requests.push(SourceRequest::Rotation(path.to_string()));
        if self.auto_rotate.load(Ordering::SeqCst) {
            let fresh = self.mint(path);
            self.emit(LeaseEvent::rotated(path, fresh));
        }
        Ok(())
    }

    async fn request_renewal(&self, path: &str) -> Result<(), SourceError> {
        let current = {
            let mut state = locked(&self.state);
            state.requests.push(SourceRequest::Renewal(path.to_string()));
            state.leases.get(path).map(|c| c.lease_id().to_string())
        };
        if self.auto_renew.load(Ordering::SeqCst) {
            if let Some(lease_id) = current {
                self.emit(LeaseEvent::renewed(path, lease_id, self.ttl));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn subscribe_replays_current_lease() {
        let source = InMemoryCredentialSource::new();
        let creds = source.mint("database/creds/app-role");
        source.issue("database/creds/app-role", creds.clone());

        let mut events = source.subscribe("database/creds/app-role", LeaseMode::Rotate).await.unwrap();
        let first = events.next().await.unwrap();

        assert_eq!(first.credentials().unwrap().lease_id(), creds.lease_id());
        assert_eq!(source.subscriptions("database/creds/app-role"), 1);
    }

    #[tokio::test]
    async fn auto_rotate_answers_requests() {
        let source = InMemoryCredentialSource::new();
        source.auto_rotate(true);
        let mut events = source.subscribe("p", LeaseMode::Rotate).await.unwrap();

        source.request_rotation("p").await.unwrap();

        let event = events.next().await.unwrap();
        assert!(matches!(event.kind, crate::lease::LeaseEventKind::Rotated(_)));
        assert_eq!(source.rotation_requests("p"), 1);
    }

    #[tokio::test]
    async fn mock_builder_fails_marked_leases() {
        let builder = MockBuilder::new();
        let good = Credentials::new("lease-1", "u", "p", Duration::from_secs(60));
        let bad = Credentials::new("lease-2", "u", "p", Duration::from_secs(60));
        builder.fail_lease("lease-2");

        assert!(builder.build(&good).await.is_ok());
        assert!(matches!(builder.build(&bad).await, Err(BuildError::Unreachable(_))));
        assert_eq!(builder.builds(), vec!["lease-1".to_string(), "lease-2".to_string()]);
    }
}
