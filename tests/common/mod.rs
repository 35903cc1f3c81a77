#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing_subscriber::EnvFilter;
use vault_lease_pool::config::RotationConfig;
use vault_lease_pool::lease::LeaseMode;
use vault_lease_pool::rotation::{Rotation, RotationPolicy, RotationReport};
use vault_lease_pool::testing::{InMemoryCredentialSource, MockBuilder, MockHandle};
use vault_lease_pool::ResourceHandle;

pub const PATH: &str = "database/creds/app-role";

/// Refresh every 30s, give up on a request after 10s, drain for 5s
pub fn rotation_config(mode: LeaseMode) -> RotationConfig {
    let mut config = RotationConfig::new("database", "app-role", mode);
    config.refresh_interval = 30;
    config.initial_delay = 30;
    config.request_timeout = 10;
    config.grace_period = 5;
    config.renew_margin = 60;
    config.resubscribe_delay = 1;
    config.alert_threshold = 2;
    config
}

/// Same as [`rotation_config`] with the refresh timer pushed out of the way
pub fn quiet_config(mode: LeaseMode) -> RotationConfig {
    let mut config = rotation_config(mode);
    config.refresh_interval = 3600;
    config.initial_delay = 3600;
    config
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Harness {
    pub source: Arc<InMemoryCredentialSource>,
    pub builder: Arc<MockBuilder>,
    pub rotation: Rotation<MockHandle>,
    pub reports: broadcast::Receiver<RotationReport>,
    pub initial_lease: String,
}

impl Harness {
    pub async fn start(config: RotationConfig) -> Self {
        Self::start_with(config, InMemoryCredentialSource::new()).await
    }

    pub async fn start_with(config: RotationConfig, source: InMemoryCredentialSource) -> Self {
        init_tracing();
        let source = Arc::new(source);
        let builder = Arc::new(MockBuilder::new());

        let initial = source.mint(PATH);
        let initial_lease = initial.lease_id().to_string();
        source.issue(PATH, initial);

        let policy = RotationPolicy::new(config, source.clone(), builder.clone());
        let reports = policy.reports();
        let rotation = policy.start().await.expect("rotation should start");

        Self {
            source,
            builder,
            rotation,
            reports,
            initial_lease,
        }
    }

    pub fn current_lease(&self) -> String {
        self.rotation.proxy().current().lease_id().to_string()
    }

    /// Everything reported since the last call
    pub fn take_reports(&mut self) -> Vec<RotationReport> {
        let mut reports = Vec::new();
        loop {
            match self.reports.try_recv() {
                Ok(report) => reports.push(report),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => return reports,
            }
        }
    }
}

/// Let spawned tasks run until they block, moving paused time by 1ms
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn swapped(reports: &[RotationReport]) -> Vec<String> {
    reports
        .iter()
        .filter_map(|r| match r {
            RotationReport::Swapped { lease_id, .. } => Some(lease_id.clone()),
            _ => None,
        })
        .collect()
}
