use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::resource::ResourceHandle;

const RELEASE_POLL: Duration = Duration::from_millis(50);

/// Why a superseded handle was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every consumer that held the handle let go of it
    Released,
    /// The grace period ran out with consumers still holding it
    GraceElapsed,
    /// Process shutdown cut the grace period short
    Shutdown,
}

/// Wait until nobody else holds `handle` or `grace` runs out, then close it.
///
/// The caller must pass the last reference the proxy gave up; any other
/// strong reference, or work still checked out of the handle, is a consumer
/// still using it. Closing is itself bounded by `grace` so a consumer that
/// never returns its work cannot stall shutdown.
pub async fn drain_and_close<H: ResourceHandle>(
    handle: Arc<H>,
    grace: Duration,
    shutdown: CancellationToken,
) -> DrainOutcome {
    let deadline = Instant::now() + grace;
    debug!("Draining handle for lease {} (grace {:?})", handle.lease_id(), grace);

    let outcome = tokio::select! {
        biased;
        _ = wait_released(&handle) => DrainOutcome::Released,
        _ = shutdown.cancelled() => DrainOutcome::Shutdown,
        _ = sleep_until(deadline) => DrainOutcome::GraceElapsed,
    };

    close_within(handle.as_ref(), grace).await;
    info!("Closed handle for lease {} ({:?})", handle.lease_id(), outcome);
    outcome
}

/// Close `handle`, giving up on outstanding work after `limit`. The handle
/// refuses new work from the moment closing starts.
pub async fn close_within<H: ResourceHandle>(handle: &H, limit: Duration) {
    if timeout(limit, handle.close()).await.is_err() {
        warn!(
            "Handle for lease {} still had work checked out after {:?}; abandoning it",
            handle.lease_id(),
            limit
        );
    }
}

async fn wait_released<H: ResourceHandle>(handle: &Arc<H>) {
    let mut poll = interval(RELEASE_POLL);
    loop {
        poll.tick().await;
        if Arc::strong_count(handle) == 1 && !handle.in_use() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockHandle;
    use std::sync::atomic::Ordering;

    #[tokio::test(start_paused = true)]
    async fn closes_immediately_when_unreferenced() {
        let handle = Arc::new(MockHandle::named("lease-0"));
        let closed = handle.closed_flag();

        let outcome = drain_and_close(handle, Duration::from_secs(30), CancellationToken::new()).await;

        assert_eq!(outcome, DrainOutcome::Released);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_checked_out_work_without_references() {
        let handle = Arc::new(MockHandle::named("lease-0"));
        let in_use = handle.in_use_flag();
        let closed = handle.closed_flag();
        in_use.store(true, Ordering::SeqCst);
        let started = Instant::now();

        let drain = tokio::spawn(drain_and_close(
            handle,
            Duration::from_secs(30),
            CancellationToken::new(),
        ));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!closed.load(Ordering::SeqCst));
        in_use.store(false, Ordering::SeqCst);

        let outcome = drain.await.unwrap();
        assert_eq!(outcome, DrainOutcome::Released);
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_bounded_when_work_never_returns() {
        let handle = Arc::new(MockHandle::named("lease-0").with_close_delay(Duration::from_secs(3600)));
        handle.in_use_flag().store(true, Ordering::SeqCst);
        let consumer = handle.clone();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let started = Instant::now();

        let outcome = drain_and_close(handle, Duration::from_secs(30), shutdown).await;

        assert_eq!(outcome, DrainOutcome::Shutdown);
        assert!(started.elapsed() <= Duration::from_secs(31));
        assert!(consumer.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_consumer_to_release() {
        let handle = Arc::new(MockHandle::named("lease-0"));
        let consumer = handle.clone();
        let started = Instant::now();

        let drain = tokio::spawn(drain_and_close(
            handle,
            Duration::from_secs(30),
            CancellationToken::new(),
        ));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!consumer.is_closed());
        drop(consumer);

        let outcome = drain.await.unwrap();
        assert_eq!(outcome, DrainOutcome::Released);
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn closes_after_grace_when_still_held() {
        let handle = Arc::new(MockHandle::named("lease-0"));
        let consumer = handle.clone();
        let started = Instant::now();

        let outcome = drain_and_close(handle, Duration::from_secs(30), CancellationToken::new()).await;

        assert_eq!(outcome, DrainOutcome::GraceElapsed);
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(consumer.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cuts_grace_short() {
        let handle = Arc::new(MockHandle::named("lease-0"));
        let consumer = handle.clone();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let outcome = drain_and_close(handle, Duration::from_secs(30), shutdown).await;

        assert_eq!(outcome, DrainOutcome::Shutdown);
        assert!(consumer.is_closed());
    }
}
