use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::RotationError;
use crate::proxy::DrainOutcome;

/// What prompted a rotation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
    /// The refresh interval elapsed
    Scheduled,
    /// A renew-mode lease expired
    LeaseExpired,
    /// The backend refused to renew a renew-mode lease
    RenewalFailed,
}

/// Observable outcome of the rotation machinery
#[derive(Debug, Clone, PartialEq)]
pub enum RotationReport {
    RotationRequested { path: String, trigger: RefreshTrigger },
    RenewalRequested { path: String, lease_id: String },
    Swapped { path: String, lease_id: String, generation: u64 },
    Renewed { path: String, lease_id: String, ttl: Duration },
    HandleClosed { path: String, lease_id: String, outcome: DrainOutcome },
    Failed { path: String, error: RotationError },
    /// No local recovery exists; operators must act
    Alert { path: String, error: RotationError },
}

impl RotationReport {
    pub fn path(&self) -> &str {
        match self {
            RotationReport::RotationRequested { path, .. }
            | RotationReport::RenewalRequested { path, .. }
            | RotationReport::Swapped { path, .. }
            | RotationReport::Renewed { path, .. }
            | RotationReport::HandleClosed { path, .. }
            | RotationReport::Failed { path, .. }
            | RotationReport::Alert { path, .. } => path,
        }
    }

    pub fn error(&self) -> Option<&RotationError> {
        match self {
            RotationReport::Failed { error, .. } | RotationReport::Alert { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Fan-out of reports to whoever is listening. Sending with no listeners is fine.
#[derive(Debug, Clone)]
pub struct ReportSink {
    tx: broadcast::Sender<RotationReport>,
}

impl ReportSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RotationReport> {
        self.tx.subscribe()
    }

    pub fn publish(&self, report: RotationReport) {
        let _ = self.tx.send(report);
    }
}
