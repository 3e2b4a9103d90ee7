use thiserror::Error;

impl From<::config::ConfigError> for BootstrapAppError {
    fn from(err: ::config::ConfigError) -> Self {
        Self::ConfigError(err.to_string())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Top-level error for process setup (configuration, pools, server).
#[derive(Error, Debug)]
pub enum BootstrapAppError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),
}

/// Failure to establish a connection to the relational store.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Connection target is empty")]
    EmptyTarget,

    #[error("Failed to connect after {attempts} attempts: {message}")]
    Exhausted { attempts: u32, message: String },
}

/// Errors surfaced by the migration runner. All of them are fatal to the run.
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Failed to discover migrations in {path}: {message}")]
    Discovery { path: String, message: String },

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Migration {script} failed: {message}")]
    Semantic { script: String, message: String },

    #[error("Migration {script} failed after {attempts} attempts: {message}")]
    TransientExhausted {
        script: String,
        attempts: u32,
        message: String,
    },
}

impl MigrationError {
    /// Name of the script that failed, if the failure belongs to one.
    pub fn script(&self) -> Option<&str> {
        match self {
            Self::Semantic { script, .. } | Self::TransientExhausted { script, .. } => Some(script),
            _ => None,
        }
    }
}

/// Errors from profile and remote-procedure calls made by the bootstrap coordinator.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid role value: {0}")]
    InvalidRole(String),
}

/// Every promotion strategy was tried and the identity still does not read back as admin.
///
/// Never propagated to the login flow; the coordinator folds it into
/// [`crate::bootstrap::BootstrapOutcome::Failed`].
#[derive(Error, Debug)]
#[error("First administrator bootstrap exhausted for {identity}: {attempts:?}")]
pub struct BootstrapExhaustedError {
    pub identity: String,
    pub attempts: Vec<String>,
}

pub type StoreResult<T> = Result<T, StoreError>;
