use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::lease::LeaseMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub environment: Environment,
    pub database: DatabaseConfig,
    pub rotation: RotationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Base URL; the lease's username and password are substituted in
    pub url: String,
    pub max_connections: u32,
    /// Connection checkout timeout, seconds
    pub connection_timeout: u64,
    /// Open a connection while building a pool so a bad lease never goes live
    pub verify_on_build: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    pub backend: String,
    pub role: String,
    pub mode: LeaseMode,
    /// All durations below are in seconds
    pub refresh_interval: u64,
    pub initial_delay: u64,
    pub request_timeout: u64,
    pub grace_period: u64,
    pub renew_margin: u64,
    pub resubscribe_delay: u64,
    /// Consecutive build failures on a hard-expired lease before alerting
    pub alert_threshold: u32,
    pub credentials_file: Option<String>,
}

impl RotationConfig {
    /// Lease path watched for this role, e.g. `database/creds/app-role`
    pub fn path(&self) -> String {
        format!("{}/creds/{}", self.backend, self.role)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval.max(1))
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout.max(1))
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period)
    }

    pub fn renew_margin(&self) -> Duration {
        Duration::from_secs(self.renew_margin)
    }

    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_secs(self.resubscribe_delay.max(1))
    }

    /// Development defaults for one lease path
    pub fn new(backend: impl Into<String>, role: impl Into<String>, mode: LeaseMode) -> Self {
        Self {
            backend: backend.into(),
            role: role.into(),
            mode,
            ..AppConfig::development().rotation
        }
    }

    fn for_database(database: &DatabaseConfig, refresh_interval: u64) -> Self {
        Self {
            backend: "database".to_string(),
            role: "app-role".to_string(),
            mode: LeaseMode::Rotate,
            refresh_interval,
            initial_delay: refresh_interval,
            request_timeout: 10,
            grace_period: database.connection_timeout,
            renew_margin: 60,
            resubscribe_delay: 5,
            alert_threshold: 3,
            credentials_file: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let environment = match env::var("APP_ENV").as_deref() {
            Ok("production") | Ok("prod") => Environment::Production,
            Ok("staging") | Ok("stage") => Environment::Staging,
            _ => Environment::Development,
        };

        // Set defaults based on environment, then override with specific env vars
        match environment {
            Environment::Production => Self::production(),
            Environment::Staging => Self::staging(),
            Environment::Development => Self::development(),
        }
        .with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Self {
        // Database overrides
        if let Ok(v) = env::var("DATABASE_URL") {
            self.database.url = v;
        }
        if let Ok(v) = env::var("DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = v.parse().unwrap_or(self.database.max_connections);
        }
        if let Ok(v) = env::var("DATABASE_CONNECTION_TIMEOUT") {
            self.database.connection_timeout = v.parse().unwrap_or(self.database.connection_timeout);
            // grace period follows checkout timeout unless set explicitly below
            self.rotation.grace_period = self.database.connection_timeout;
        }
        if let Ok(v) = env::var("DATABASE_VERIFY_ON_BUILD") {
            self.database.verify_on_build = v.parse().unwrap_or(self.database.verify_on_build);
        }

        // Lease overrides
        if let Ok(v) = env::var("VAULT_DATABASE_BACKEND") {
            self.rotation.backend = v;
        }
        if let Ok(v) = env::var("VAULT_DATABASE_ROLE") {
            self.rotation.role = v;
        }
        if let Ok(v) = env::var("VAULT_LEASE_MODE") {
            self.rotation.mode = LeaseMode::parse(&v).unwrap_or(self.rotation.mode);
        }
        if let Ok(v) = env::var("VAULT_CREDENTIALS_FILE") {
            self.rotation.credentials_file = Some(v);
        }

        // Rotation overrides
        if let Ok(v) = env::var("KV_REFRESH_INTERVAL") {
            self.rotation.refresh_interval = v.parse().unwrap_or(self.rotation.refresh_interval);
            self.rotation.initial_delay = self.rotation.refresh_interval;
        }
        if let Ok(v) = env::var("ROTATION_INITIAL_DELAY") {
            self.rotation.initial_delay = v.parse().unwrap_or(self.rotation.initial_delay);
        }
        if let Ok(v) = env::var("ROTATION_REQUEST_TIMEOUT") {
            self.rotation.request_timeout = v.parse().unwrap_or(self.rotation.request_timeout);
        }
        if let Ok(v) = env::var("ROTATION_GRACE_PERIOD") {
            self.rotation.grace_period = v.parse().unwrap_or(self.rotation.grace_period);
        }
        if let Ok(v) = env::var("ROTATION_RENEW_MARGIN") {
            self.rotation.renew_margin = v.parse().unwrap_or(self.rotation.renew_margin);
        }
        if let Ok(v) = env::var("ROTATION_RESUBSCRIBE_DELAY") {
            self.rotation.resubscribe_delay = v.parse().unwrap_or(self.rotation.resubscribe_delay);
        }
        if let Ok(v) = env::var("ROTATION_ALERT_THRESHOLD") {
            self.rotation.alert_threshold = v.parse().unwrap_or(self.rotation.alert_threshold);
        }

        self
    }

    fn development() -> Self {
        let database = DatabaseConfig {
            url: "postgres://localhost:5432/payments".to_string(),
            max_connections: 5,
            connection_timeout: 30,
            verify_on_build: true,
        };
        Self {
            environment: Environment::Development,
            rotation: RotationConfig::for_database(&database, 30),
            database,
        }
    }

    fn staging() -> Self {
        let database = DatabaseConfig {
            url: "postgres://localhost:5432/payments".to_string(),
            max_connections: 10,
            connection_timeout: 10,
            verify_on_build: true,
        };
        Self {
            environment: Environment::Staging,
            rotation: RotationConfig::for_database(&database, 300),
            database,
        }
    }

    fn production() -> Self {
        let database = DatabaseConfig {
            url: "postgres://localhost:5432/payments".to_string(),
            max_connections: 20,
            connection_timeout: 5,
            verify_on_build: true,
        };
        Self {
            environment: Environment::Production,
            rotation: RotationConfig::for_database(&database, 900),
            database,
        }
    }
}

// Global singleton config - initialized once at startup
pub static CONFIG: Lazy<AppConfig> = Lazy::new(AppConfig::from_env);

// Convenience function for accessing config
pub fn config() -> &'static AppConfig {
    &CONFIG
}
