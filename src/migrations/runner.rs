//! Migration Runner
//!
//! Applies ordered scripts over one connection, each inside its own
//! transaction. Transient failures retry the same script in a fresh
//! transaction, on a fresh connection if the old one was lost; anything else aborts the run. There is no applied-set
//! bookkeeping: a re-run starts again from the first script, so scripts must
//! be safe to re-apply.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::MigrationScript;
use crate::database::{connect, ConnectionTarget, StoreConnection};
use crate::error::MigrationError;
use crate::retry::{classify_sqlx, is_connection_loss, retry, ErrorClass, RetryPolicy};

/// Transaction primitives the runner needs from a connection.
#[async_trait]
pub trait MigrationConnection: Send {
    async fn begin(&mut self) -> Result<(), sqlx::Error>;

    /// Execute a script body as one statement batch.
    async fn execute_batch(&mut self, sql: &str) -> Result<(), sqlx::Error>;

    async fn commit(&mut self) -> Result<(), sqlx::Error>;

    async fn rollback(&mut self) -> Result<(), sqlx::Error>;

    /// Replace a connection that was lost mid-attempt.
    async fn reconnect(&mut self) -> Result<(), sqlx::Error>;
}

#[async_trait]
impl MigrationConnection for StoreConnection {
    async fn begin(&mut self) -> Result<(), sqlx::Error> {
        self.execute_raw("BEGIN").await
    }

    async fn execute_batch(&mut self, sql: &str) -> Result<(), sqlx::Error> {
        self.execute_raw(sql).await
    }

    async fn commit(&mut self) -> Result<(), sqlx::Error> {
        self.execute_raw("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<(), sqlx::Error> {
        self.execute_raw("ROLLBACK").await
    }

    async fn reconnect(&mut self) -> Result<(), sqlx::Error> {
        StoreConnection::reconnect(self).await
    }
}

/// The connection shared by every attempt of a run.
struct Attempts<'c, C: ?Sized> {
    conn: &'c mut C,
    connection_lost: bool,
}

/// Names of the scripts committed by a run, in application order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub applied: Vec<String>,
}

impl RunReport {
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }
}

pub struct MigrationRunner {
    statement_retry: RetryPolicy,
}

impl MigrationRunner {
    pub fn new(statement_retry: RetryPolicy) -> Self {
        Self { statement_retry }
    }

    /// Apply `scripts` in the given order over `conn`.
    ///
    /// Stops at the first unrecovered failure; scripts committed before it stay committed.
    pub async fn run<C>(
        &self,
        scripts: &[MigrationScript],
        conn: &mut C,
    ) -> Result<RunReport, MigrationError>
    where
        C: MigrationConnection,
    {
        let mut report = RunReport::default();
        if scripts.is_empty() {
            info!("No migration files found");
            return Ok(report);
        }

        // attempts need exclusive access to the connection across awaits
        let state = Mutex::new(Attempts {
            conn,
            connection_lost: false,
        });

        for script in scripts {
            info!("Applying migration: {}", script.name);
            let body = script.body.as_str();
            let state = &state;

            let result = retry(&script.name, self.statement_retry, classify_sqlx, move |_| async move {
                let mut attempts = state.lock().await;
                if attempts.connection_lost {
                    if let Err(e) = attempts.conn.reconnect().await {
                        return Err(e);
                    }
                    attempts.connection_lost = false;
                }

                let outcome = apply_once(&mut *attempts.conn, body).await;
                if let Err(e) = &outcome {
                    attempts.connection_lost = is_connection_loss(e);
                }
                outcome
            })
            .await;

            match result {
                Ok(()) => {
                    info!("Applied: {}", script.name);
                    report.applied.push(script.name.clone());
                }
                Err(failure) => {
                    error!("Failed migration: {}", script.name);
                    error!("{}", failure.error);
                    let message = failure.error.to_string();
                    return Err(match failure.class {
                        ErrorClass::Permanent => MigrationError::Semantic {
                            script: script.name.clone(),
                            message,
                        },
                        ErrorClass::Transient => MigrationError::TransientExhausted {
                            script: script.name.clone(),
                            attempts: failure.attempts,
                            message,
                        },
                    });
                }
            }
        }

        info!("{} migrations applied", report.applied_count());
        Ok(report)
    }

    /// Connect to `target`, run `scripts`, and close the connection on every exit path.
    ///
    /// An empty script set succeeds without connecting.
    pub async fn run_against(
        &self,
        scripts: &[MigrationScript],
        target: &ConnectionTarget,
        connect_retry: RetryPolicy,
    ) -> Result<RunReport, MigrationError> {
        if scripts.is_empty() {
            info!("No migration files found");
            return Ok(RunReport::default());
        }

        let mut conn = connect(target, connect_retry).await?;
        let result = self.run(scripts, &mut conn).await;
        conn.close().await;
        result
    }
}

/// One attempt: a fresh transaction around the script body.
async fn apply_once<C>(conn: &mut C, body: &str) -> Result<(), sqlx::Error>
where
    C: MigrationConnection + ?Sized,
{
    conn.begin().await?;
    match conn.execute_batch(body).await {
        Ok(()) => conn.commit().await,
        Err(e) => {
            if let Err(rollback_err) = conn.rollback().await {
                warn!("Rollback failed: {}", rollback_err);
            }
            Err(e)
        }
    }
}
