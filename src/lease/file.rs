// Credential source backed by lease files rendered by a secrets agent.
//
// Each watched path maps to a JSON file shaped like a secrets-engine
// response:
//   {"lease_id": "...", "lease_duration": 3600, "renewable": true,
//    "data": {"username": "...", "password": "..."}}
// The agent rewrites the file when it rotates or renews the lease.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{receiver_stream, CredentialSource, Credentials, LeaseEvent, LeaseMode, LeaseStream, SourceError};

#[derive(Debug, Deserialize)]
struct LeaseFile {
    lease_id: String,
    lease_duration: u64,
    #[serde(default)]
    renewable: bool,
    data: LeaseData,
}

#[derive(Debug, Deserialize)]
struct LeaseData {
    username: String,
    password: String,
}

#[derive(Default)]
struct Watch {
    subscribers: Vec<UnboundedSender<LeaseEvent>>,
    current: Option<Credentials>,
    expiry: Option<JoinHandle<()>>,
}

impl Watch {
    fn publish(&mut self, event: LeaseEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// State shared with the expiry timers
#[derive(Default)]
struct Inner {
    watches: Mutex<HashMap<String, Watch>>,
}

impl Inner {
    fn watches(&self) -> MutexGuard<'_, HashMap<String, Watch>> {
        self.watches.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Reads leases from files; rotation and renewal requests re-read the file
pub struct FileCredentialSource {
    files: HashMap<String, PathBuf>,
    inner: Arc<Inner>,
}

impl FileCredentialSource {
    pub fn new() -> Self {
        Self {
            files: HashMap::new(),
            inner: Arc::new(Inner::default()),
        }
    }

    /// Serve lease `path` from `file`
    pub fn with_lease_file(mut self, path: impl Into<String>, file: impl Into<PathBuf>) -> Self {
        self.add_lease_file(path, file);
        self
    }

    /// Serve lease `path` from `file`, replacing any earlier mapping
    pub fn add_lease_file(&mut self, path: impl Into<String>, file: impl Into<PathBuf>) {
        self.files.insert(path.into(), file.into());
    }

    fn file_for(&self, path: &str) -> Result<&Path, SourceError> {
        self.files
            .get(path)
            .map(PathBuf::as_path)
            .ok_or_else(|| SourceError::UnknownPath(path.to_string()))
    }

    async fn read(&self, path: &str) -> Result<Credentials, SourceError> {
        let file = self.file_for(path)?;
        let unavailable = |reason: String| SourceError::Unavailable {
            path: path.to_string(),
            reason,
        };

        let raw = tokio::fs::read_to_string(file)
            .await
            .map_err(|e| unavailable(format!("{}: {}", file.display(), e)))?;
        let lease: LeaseFile = serde_json::from_str(&raw)
            .map_err(|e| unavailable(format!("{}: {}", file.display(), e)))?;

        Ok(Credentials::new(
            lease.lease_id,
            lease.data.username,
            lease.data.password,
            Duration::from_secs(lease.lease_duration),
        )
        .renewable(lease.renewable))
    }

    /// Record `fresh` as current unless it is the lease already held.
    /// Returns the event to publish, if any.
    fn refresh(&self, path: &str, fresh: Credentials, renewal: bool) -> Option<LeaseEvent> {
        let mut watches = self.inner.watches();
        let watch = watches.entry(path.to_string()).or_default();

        let unchanged = watch.current.as_ref().map(|c| c.same_lease(&fresh)).unwrap_or(false);
        let event = if unchanged {
            if !renewal {
                debug!("Lease file for {} unchanged", path);
                return None;
            }
            LeaseEvent::renewed(path, fresh.lease_id(), fresh.ttl())
        } else {
            info!("Lease file for {} now holds lease {}", path, fresh.lease_id());
            watch.current = Some(fresh.clone());
            LeaseEvent::rotated(path, fresh.clone())
        };

        self.arm_expiry(watch, path, &fresh);
        watch.publish(event.clone());
        Some(event)
    }

    /// Emit Expired for `path` once `lease` outlives its TTL
    fn arm_expiry(&self, watch: &mut Watch, path: &str, lease: &Credentials) {
        if let Some(previous) = watch.expiry.take() {
            previous.abort();
        }

        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let path = path.to_string();
        let lease_id = lease.lease_id().to_string();
        let ttl = lease.ttl();

        watch.expiry = Some(tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut watches = inner.watches();
            if let Some(watch) = watches.get_mut(&path) {
                let still_current = watch.current.as_ref().map(|c| c.lease_id() == lease_id).unwrap_or(false);
                if still_current {
                    warn!("Lease {} for {} expired", lease_id, path);
                    watch.publish(LeaseEvent::expired(&path));
                }
            }
        }));
    }
}

impl Default for FileCredentialSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for watch in self.watches().values_mut() {
            if let Some(expiry) = watch.expiry.take() {
                expiry.abort();
            }
        }
    }
}

#[async_trait]
impl CredentialSource for FileCredentialSource {
    async fn subscribe(&self, path: &str, _mode: LeaseMode) -> Result<LeaseStream, SourceError> {
        let lease = self.read(path).await?;
        let (tx, rx) = unbounded_channel();

        let mut watches = self.inner.watches();
        let watch = watches.entry(path.to_string()).or_default();

        let current = match watch.current.clone() {
            Some(current) if current.same_lease(&lease) => current,
            _ => {
                watch.current = Some(lease.clone());
                self.arm_expiry(watch, path, &lease);
                lease
            }
        };

        let _ = tx.send(LeaseEvent::issued(path, current));
        watch.subscribers.push(tx);
        Ok(receiver_stream(rx))
    }

    async fn request_rotation(&self, path: &str) -> Result<(), SourceError> {
        let lease = self.read(path).await?;
        self.refresh(path, lease, false);
        Ok(())
    }

    async fn request_renewal(&self, path: &str) -> Result<(), SourceError> {
        let lease = self.read(path).await?;
        self.refresh(path, lease, true);
        Ok(())
    }
}
