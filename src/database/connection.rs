//! Connection Manager
//!
//! Establishes the single connection a migration run holds, with bounded
//! retry, a connect timeout and a per-session statement timeout.

use std::time::Duration;

use sqlx::{AnyConnection, Connection};
use tracing::{info, warn};

use super::Backend;
use crate::config::AppConfig;
use crate::error::ConnectionError;
use crate::retry::{retry, ErrorClass, RetryPolicy};

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct ConnectionTarget {
    pub url: String,
    pub connect_timeout: Duration,
    pub statement_timeout: Duration,
}

impl ConnectionTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(30),
            statement_timeout: Duration::from_millis(600_000),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            url: config.database_url.clone(),
            connect_timeout: config.connect_timeout(),
            statement_timeout: config.statement_timeout(),
        }
    }

    pub fn backend(&self) -> Backend {
        Backend::from_url(&self.url)
    }
}

/// One open connection to the store. Closed explicitly with [`StoreConnection::close`].
pub struct StoreConnection {
    conn: Option<AnyConnection>,
    backend: Backend,
    target: ConnectionTarget,
}

impl StoreConnection {
    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    /// Borrow the live connection, failing once it has been closed.
    pub fn inner(&mut self) -> Result<&mut AnyConnection, sqlx::Error> {
        self.conn.as_mut().ok_or(sqlx::Error::PoolClosed)
    }

    /// Run `sql` as one unprepared batch.
    pub async fn execute_raw(&mut self, sql: &str) -> Result<(), sqlx::Error> {
        let conn: &mut AnyConnection = self.inner()?;
        sqlx::Executor::execute(conn, sqlx::raw_sql(sql)).await?;
        Ok(())
    }

    /// Drop the current connection and open a fresh one to the same target.
    ///
    /// Makes a single attempt; callers that want more wrap it in their own retry.
    pub async fn reconnect(&mut self) -> Result<(), sqlx::Error> {
        self.close().await;
        let conn = open_once(&self.target, self.backend, 1).await?;
        self.conn = Some(conn);
        info!("Reconnected to {} store", self.backend.as_str());
        Ok(())
    }

    /// Release the connection. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.close().await {
                warn!("Error while closing store connection: {}", e);
            }
        }
    }
}

/// Open a connection, retrying any failure per `policy`.
///
/// Exhausting the policy surfaces the last error.
pub async fn connect(
    target: &ConnectionTarget,
    policy: RetryPolicy,
) -> Result<StoreConnection, ConnectionError> {
    if target.url.trim().is_empty() {
        return Err(ConnectionError::EmptyTarget);
    }

    sqlx::any::install_default_drivers();
    let backend = target.backend();

    let conn = retry("connect", policy, |_| ErrorClass::Transient, |attempt| {
        open_once(target, backend, attempt)
    })
    .await
    .map_err(|e| ConnectionError::Exhausted {
        attempts: e.attempts,
        message: e.error.to_string(),
    })?;

    info!("Connected to {} store", backend.as_str());
    Ok(StoreConnection {
        conn: Some(conn),
        backend,
        target: target.clone(),
    })
}

async fn open_once(
    target: &ConnectionTarget,
    backend: Backend,
    attempt: u32,
) -> Result<AnyConnection, sqlx::Error> {
    let mut conn = tokio::time::timeout(target.connect_timeout, AnyConnection::connect(&target.url))
        .await
        .map_err(|_| {
            sqlx::Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect timed out after {:?}", target.connect_timeout),
            ))
        })??;

    if backend == Backend::Postgres {
        let set_timeout = format!(
            "SET statement_timeout = {}",
            target.statement_timeout.as_millis()
        );
        sqlx::Executor::execute(&mut conn, sqlx::raw_sql(&set_timeout)).await?;
    }

    if attempt > 1 {
        info!("Connection established on attempt {}", attempt);
    }
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_target_rejected() {
        let result = connect(&ConnectionTarget::new("   "), RetryPolicy::default()).await;
        assert!(matches!(result, Err(ConnectionError::EmptyTarget)));
    }

    #[tokio::test]
    async fn test_unreachable_target_exhausts_attempts() {
        let dir = tempfile::tempdir().unwrap();
        // mode=ro on a missing file cannot be opened
        let url = format!("sqlite://{}/missing.db?mode=ro", dir.path().display());
        let policy = RetryPolicy::new(3, Duration::ZERO);

        match connect(&ConnectionTarget::new(url), policy).await {
            Err(ConnectionError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("connection to a missing read-only file should fail"),
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/store.db?mode=rwc", dir.path().display());
        let mut conn = connect(&ConnectionTarget::new(url), RetryPolicy::default())
            .await
            .unwrap();

        assert!(conn.is_open());
        conn.close().await;
        conn.close().await;
        assert!(!conn.is_open());
        assert!(conn.inner().is_err());
    }

    #[tokio::test]
    async fn test_reconnect_reopens_closed_connection() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/store.db?mode=rwc", dir.path().display());
        let mut conn = connect(&ConnectionTarget::new(url), RetryPolicy::default())
            .await
            .unwrap();
        conn.execute_raw("CREATE TABLE kept (id INTEGER PRIMARY KEY)")
            .await
            .unwrap();

        conn.close().await;
        assert!(matches!(
            conn.execute_raw("SELECT 1").await,
            Err(sqlx::Error::PoolClosed)
        ));

        conn.reconnect().await.unwrap();
        assert!(conn.is_open());
        conn.execute_raw("INSERT INTO kept (id) VALUES (1)")
            .await
            .unwrap();
        conn.close().await;
    }
}
