use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{interval_at, sleep, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RotationConfig;
use crate::error::RotationError;
use crate::lease::{CredentialSource, Credentials, LeaseEvent, LeaseEventKind, LeaseMode, LeaseStream};
use crate::proxy::{close_within, drain_and_close, DrainOutcome, LeaseAwareProxy};
use crate::resource::{ResourceBuilder, ResourceHandle};
use crate::rotation::report::{RefreshTrigger, ReportSink, RotationReport};
use crate::rotation::state::{Freshness, LeaseTimer, PolicyPhase, RotationState};

const REPORT_CAPACITY: usize = 256;

/// Decides when to ask for new credentials and when to swap the proxy's
/// handle, for one watched lease path.
pub struct RotationPolicy<S, B> {
    config: RotationConfig,
    source: Arc<S>,
    builder: Arc<B>,
    reports: ReportSink,
}

impl<S, B> RotationPolicy<S, B>
where
    S: CredentialSource,
    B: ResourceBuilder,
{
    pub fn new(config: RotationConfig, source: Arc<S>, builder: Arc<B>) -> Self {
        Self {
            config,
            source,
            builder,
            reports: ReportSink::new(REPORT_CAPACITY),
        }
    }

    /// Receive reports from startup onwards
    pub fn reports(&self) -> broadcast::Receiver<RotationReport> {
        self.reports.subscribe()
    }

    /// Subscribe to the lease path, build the first handle from the first
    /// issued lease and start the policy task.
    ///
    /// Fails if no lease arrives within the request timeout or the first
    /// handle cannot be built: there is nothing to fall back on yet.
    pub async fn start(self) -> Result<Rotation<B::Handle>, RotationError> {
        let path = self.config.path();
        let mode = self.config.mode;

        let mut events = self
            .source
            .subscribe(&path, mode)
            .await
            .map_err(|e| RotationError::startup(&path, e.to_string()))?;

        let initial = timeout(self.config.request_timeout(), first_lease(&mut events, &path))
            .await
            .map_err(|_| {
                RotationError::startup(
                    &path,
                    format!("no lease issued within {:?}", self.config.request_timeout()),
                )
            })?
            .ok_or_else(|| RotationError::startup(&path, "subscription ended before a lease was issued"))?;

        let handle = self
            .builder
            .build(&initial)
            .await
            .map_err(|e| RotationError::startup(&path, e.to_string()))?;

        info!("Rotation for {} ({} mode) started with lease {}", path, mode, initial.lease_id());

        let proxy = Arc::new(LeaseAwareProxy::new(handle));
        let lease = LeaseTimer::start(&initial, mode, self.config.renew_margin());
        let (phase_tx, phase_rx) = watch::channel(PolicyPhase::Idle);
        let cancel = CancellationToken::new();

        let worker = PolicyWorker {
            state: RotationState::new(path, mode, initial, proxy.clone()),
            config: self.config,
            source: self.source,
            builder: self.builder,
            lease,
            pending: None,
            build_failures: 0,
            phase: phase_tx,
            reports: self.reports.clone(),
            cancel: cancel.clone(),
            drains: JoinSet::new(),
        };
        let task = tokio::spawn(worker.run(events));

        Ok(Rotation {
            proxy,
            phase: phase_rx,
            reports: self.reports,
            cancel,
            task,
        })
    }
}

/// A running rotation. Dropping it leaves the task running; call
/// [`Rotation::shutdown`] to stop it and close the active handle.
pub struct Rotation<H> {
    proxy: Arc<LeaseAwareProxy<H>>,
    phase: watch::Receiver<PolicyPhase>,
    reports: ReportSink,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl<H: ResourceHandle> Rotation<H> {
    /// The long-lived reference consumers should hold
    pub fn proxy(&self) -> Arc<LeaseAwareProxy<H>> {
        self.proxy.clone()
    }

    pub fn phase(&self) -> PolicyPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_reports(&self) -> broadcast::Receiver<RotationReport> {
        self.reports.subscribe()
    }

    /// Cancel the subscription and timer, close draining handles without
    /// waiting out their grace period, then close the active handle.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!("Rotation task ended abnormally: {}", e);
        }
    }
}

/// An outstanding rotation request, correlated with the next new lease
#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    deadline: Instant,
    trigger: RefreshTrigger,
}

struct PolicyWorker<S, B: ResourceBuilder> {
    config: RotationConfig,
    source: Arc<S>,
    builder: Arc<B>,
    state: RotationState<B::Handle>,
    lease: LeaseTimer,
    pending: Option<PendingRequest>,
    build_failures: u32,
    phase: watch::Sender<PolicyPhase>,
    reports: ReportSink,
    cancel: CancellationToken,
    drains: JoinSet<()>,
}

impl<S, B> PolicyWorker<S, B>
where
    S: CredentialSource,
    B: ResourceBuilder,
{
    async fn run(mut self, mut events: LeaseStream) {
        let mut ticker = interval_at(
            Instant::now() + self.config.initial_delay(),
            self.config.refresh_interval(),
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let request_deadline = self.pending.map(|p| p.deadline);
            let renewal_due = self.lease.renewal_due();

            // Order matters: lease events outrank timeouts and the proactive
            // refresh tick when several are ready at once.
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = events.next() => match event {
                    Some(event) => self.on_event(event).await,
                    None => match self.resubscribe().await {
                        Some(stream) => events = stream,
                        None => break,
                    },
                },
                _ = wait_until(request_deadline) => self.on_request_timeout(),
                _ = wait_until(renewal_due) => self.on_renewal_due().await,
                _ = ticker.tick() => self.on_tick().await,
            }
        }

        self.shutdown().await;
    }

    async fn on_event(&mut self, event: LeaseEvent) {
        if event.path != self.state.path() {
            warn!("Ignoring lease event for {} on subscription {}", event.path, self.state.path());
            return;
        }

        match event.kind {
            LeaseEventKind::Issued(credentials) | LeaseEventKind::Rotated(credentials) => {
                self.apply(credentials).await
            }
            LeaseEventKind::Renewed { lease_id, ttl } => {
                if lease_id != self.state.last_credentials().lease_id() {
                    debug!("Ignoring renewal of superseded lease {}", lease_id);
                    return;
                }
                self.lease.renewed(ttl, self.config.renew_margin());
                info!("Lease {} renewed for {:?}", lease_id, ttl);
                self.reports.publish(RotationReport::Renewed {
                    path: self.state.path().to_string(),
                    lease_id,
                    ttl,
                });
            }
            LeaseEventKind::RenewalFailed(reason) => {
                warn!("Renewal failed for {}: {}", self.state.path(), reason);
                if self.state.mode() == LeaseMode::Renew {
                    self.request_rotation(RefreshTrigger::RenewalFailed).await;
                }
            }
            LeaseEventKind::Expired => {
                self.lease.mark_expired();
                match self.state.mode() {
                    LeaseMode::Renew => {
                        info!("Expiring lease, rotate database credentials");
                        self.request_rotation(RefreshTrigger::LeaseExpired).await;
                    }
                    LeaseMode::Rotate => {
                        warn!(
                            "Lease {} expired; waiting for the backend to rotate it",
                            self.state.last_credentials().lease_id()
                        );
                    }
                }
            }
        }
    }

    /// Build a handle for `credentials` and swap it in. A failed build leaves
    /// the current handle active.
    async fn apply(&mut self, credentials: Credentials) {
        match self.state.classify(&credentials) {
            Freshness::Duplicate => {
                debug!("{}", RotationError::DuplicateEvent(credentials.lease_id().to_string()));
                return;
            }
            Freshness::Stale => {
                warn!(
                    "Ignoring lease {} issued before active lease {}",
                    credentials.lease_id(),
                    self.state.last_credentials().lease_id()
                );
                return;
            }
            Freshness::New => {}
        }

        self.set_phase(PolicyPhase::Swapping);
        let built = self.builder.build(&credentials).await;
        self.pending = None;

        match built {
            Ok(handle) => {
                info!("Updating database properties : {}", credentials.username());
                let lease_id = credentials.lease_id().to_string();
                self.lease = LeaseTimer::start(&credentials, self.state.mode(), self.config.renew_margin());
                let previous = self.state.install(credentials, Arc::new(handle));
                self.build_failures = 0;

                self.reports.publish(RotationReport::Swapped {
                    path: self.state.path().to_string(),
                    lease_id,
                    generation: self.state.generation(),
                });
                self.drain(previous);
            }
            Err(e) => {
                self.build_failures += 1;
                let failure = RotationError::build(credentials.lease_id(), e);
                error!("{}; keeping lease {}", failure, self.state.last_credentials().lease_id());
                self.report_failure(failure);
                self.check_hard_expiry();
            }
        }

        self.set_phase(PolicyPhase::Idle);
    }

    fn check_hard_expiry(&self) {
        if !self.lease.is_expired() || self.build_failures < self.config.alert_threshold.max(1) {
            return;
        }
        let alert = RotationError::HardExpired {
            path: self.state.path().to_string(),
            lease_id: self.state.last_credentials().lease_id().to_string(),
            failures: self.build_failures,
        };
        error!("ALERT: {}", alert);
        self.reports.publish(RotationReport::Alert {
            path: self.state.path().to_string(),
            error: alert,
        });
    }

    async fn on_tick(&mut self) {
        if self.pending.is_some() {
            debug!("Refresh tick for {} skipped; rotation already requested", self.state.path());
            return;
        }
        self.request_rotation(RefreshTrigger::Scheduled).await;
    }

    /// Ask the source for new credentials. At most one request is in flight.
    async fn request_rotation(&mut self, trigger: RefreshTrigger) {
        if let Some(pending) = self.pending {
            debug!(
                "Rotation already requested for {} ({:?}); not requesting again for {:?}",
                self.state.path(),
                pending.trigger,
                trigger
            );
            return;
        }

        info!("Requesting new credentials for {} ({:?})", self.state.path(), trigger);
        match self.source.request_rotation(self.state.path()).await {
            Ok(()) => {
                self.pending = Some(PendingRequest {
                    deadline: Instant::now() + self.config.request_timeout(),
                    trigger,
                });
                self.set_phase(PolicyPhase::AwaitingNewLease);
                self.reports.publish(RotationReport::RotationRequested {
                    path: self.state.path().to_string(),
                    trigger,
                });
            }
            Err(e) => {
                warn!("Rotation request for {} failed: {}", self.state.path(), e);
                self.report_failure(e.into());
            }
        }
    }

    fn on_request_timeout(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let failure = RotationError::CredentialRequestTimeout {
            path: self.state.path().to_string(),
            timeout: self.config.request_timeout(),
        };
        warn!("{} ({:?}); retrying on the next refresh", failure, pending.trigger);
        self.report_failure(failure);
        self.set_phase(PolicyPhase::Idle);
    }

    async fn on_renewal_due(&mut self) {
        self.lease.renewal_requested();
        let lease_id = self.state.last_credentials().lease_id().to_string();

        info!("Requesting renewal of lease {}", lease_id);
        match self.source.request_renewal(self.state.path()).await {
            Ok(()) => self.reports.publish(RotationReport::RenewalRequested {
                path: self.state.path().to_string(),
                lease_id,
            }),
            Err(e) => {
                warn!("Renewal request for {} failed: {}", lease_id, e);
                self.report_failure(e.into());
            }
        }
    }

    /// Reopen an ended subscription. Returns `None` on shutdown.
    async fn resubscribe(&mut self) -> Option<LeaseStream> {
        warn!("Lease subscription for {} ended; resubscribing", self.state.path());
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = sleep(self.config.resubscribe_delay()) => {}
            }
            match self.source.subscribe(self.state.path(), self.state.mode()).await {
                Ok(stream) => {
                    info!("Resubscribed to {}", self.state.path());
                    return Some(stream);
                }
                Err(e) => {
                    warn!("Resubscribe to {} failed: {}", self.state.path(), e);
                    self.report_failure(e.into());
                }
            }
        }
    }

    /// Close a superseded handle once its users are done or the grace period ends
    fn drain(&mut self, previous: Arc<B::Handle>) {
        let path = self.state.path().to_string();
        let grace = self.config.grace_period();
        let cancel = self.cancel.clone();
        let reports = self.reports.clone();

        while let Some(joined) = self.drains.try_join_next() {
            log_drain_result(joined);
        }
        self.drains.spawn(async move {
            let lease_id = previous.lease_id().to_string();
            let outcome = drain_and_close(previous, grace, cancel).await;
            reports.publish(RotationReport::HandleClosed { path, lease_id, outcome });
        });
    }

    async fn shutdown(mut self) {
        info!("Rotation for {} shutting down", self.state.path());
        self.set_phase(PolicyPhase::Idle);

        while let Some(joined) = self.drains.join_next().await {
            log_drain_result(joined);
        }

        let active = self.state.proxy().current();
        close_within(active.as_ref(), self.config.grace_period()).await;
        info!("Closed active handle for lease {}", active.lease_id());
        self.reports.publish(RotationReport::HandleClosed {
            path: self.state.path().to_string(),
            lease_id: active.lease_id().to_string(),
            outcome: DrainOutcome::Shutdown,
        });
    }

    fn report_failure(&self, error: RotationError) {
        self.reports.publish(RotationReport::Failed {
            path: self.state.path().to_string(),
            error,
        });
    }

    fn set_phase(&self, phase: PolicyPhase) {
        self.phase.send_replace(phase);
    }
}

fn log_drain_result(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        error!("Drain task ended abnormally: {}", e);
    }
}

async fn first_lease(events: &mut LeaseStream, path: &str) -> Option<Credentials> {
    while let Some(event) = events.next().await {
        if event.path != path {
            continue;
        }
        if let Some(credentials) = event.credentials() {
            return Some(credentials.clone());
        }
    }
    None
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn panicked_drains_are_reaped_not_dropped() {
        let mut drains = JoinSet::new();
        drains.spawn(async { panic!("close blew up") });
        drains.spawn(async {});

        let mut failures = 0;
        while let Some(joined) = drains.join_next().await {
            if joined.as_ref().is_err_and(|e| e.is_panic()) {
                failures += 1;
            }
            log_drain_result(joined);
        }

        assert_eq!(failures, 1);
        assert!(drains.is_empty());
    }
}
