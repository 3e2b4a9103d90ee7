use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::BootstrapAppError;
use crate::retry::RetryPolicy;

/// How the bootstrap coordinator guards against two concurrent first signups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SeedGuard {
    /// Claim a single-row seed marker atomically before promoting.
    #[default]
    Marker,
    /// Emptiness check followed by the fallback chain, with no claim.
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub service_database_url: Option<String>,
    pub migrations_dir: String,
    pub connect_timeout_secs: u64,
    pub statement_timeout_ms: u64,
    pub connect_attempts: u32,
    pub statement_attempts: u32,
    pub retry_delay_secs: u64,
    pub session_role: String,
    pub seed_guard: SeedGuard,
    pub seed_lease_secs: u64,
    pub migration_secret: Option<String>,
    pub server_host: String,
    pub server_port: u16,
}

/// Shape read from the environment before aliases and blanks are resolved.
#[derive(Debug, Deserialize)]
struct RawConfig {
    database_url: Option<String>,
    supabase_db_url: Option<String>,
    service_database_url: Option<String>,
    migrations_dir: String,
    connect_timeout_secs: u64,
    statement_timeout_ms: u64,
    connect_attempts: u32,
    statement_attempts: u32,
    retry_delay_secs: u64,
    session_role: String,
    seed_guard: SeedGuard,
    seed_lease_secs: u64,
    migration_secret: Option<String>,
    server_host: String,
    server_port: u16,
}

impl AppConfig {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Self, BootstrapAppError> {
        Self::from_source(::config::Environment::default().try_parsing(true))
    }

    /// Load configuration from any `config` source, applying defaults first.
    pub fn from_source<S>(source: S) -> Result<Self, BootstrapAppError>
    where
        S: ::config::Source + Send + Sync + 'static,
    {
        let raw: RawConfig = ::config::Config::builder()
            .set_default("migrations_dir", "migrations")?
            .set_default("connect_timeout_secs", 30)?
            .set_default("statement_timeout_ms", 600_000)?
            .set_default("connect_attempts", 3)?
            .set_default("statement_attempts", 3)?
            .set_default("retry_delay_secs", 5)?
            .set_default("session_role", "authenticated")?
            .set_default("seed_guard", "marker")?
            .set_default("seed_lease_secs", 300)?
            .set_default("server_host", "0.0.0.0")?
            .set_default("server_port", 3000)?
            .add_source(source)
            .build()?
            .try_deserialize()?;

        let database_url = non_blank(raw.database_url)
            .or_else(|| non_blank(raw.supabase_db_url))
            .ok_or_else(|| {
                BootstrapAppError::ConfigError(
                    "DATABASE_URL (or SUPABASE_DB_URL) is required".to_string(),
                )
            })?;

        Ok(AppConfig {
            database_url,
            service_database_url: non_blank(raw.service_database_url),
            migrations_dir: raw.migrations_dir,
            connect_timeout_secs: raw.connect_timeout_secs,
            statement_timeout_ms: raw.statement_timeout_ms,
            connect_attempts: raw.connect_attempts,
            statement_attempts: raw.statement_attempts,
            retry_delay_secs: raw.retry_delay_secs,
            session_role: raw.session_role,
            seed_guard: raw.seed_guard,
            seed_lease_secs: raw.seed_lease_secs,
            migration_secret: non_blank(raw.migration_secret),
            server_host: raw.server_host,
            server_port: raw.server_port,
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_millis(self.statement_timeout_ms)
    }

    pub fn connect_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.connect_attempts, Duration::from_secs(self.retry_delay_secs))
    }

    pub fn seed_lease(&self) -> Duration {
        Duration::from_secs(self.seed_lease_secs)
    }

    pub fn statement_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.statement_attempts, Duration::from_secs(self.retry_delay_secs))
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
