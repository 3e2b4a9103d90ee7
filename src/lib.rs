pub mod bootstrap;
pub mod config;
pub mod database;
pub mod error;
pub mod migrations;
pub mod retry;
pub mod server;
pub mod status;

pub use error::{BootstrapAppError, MigrationError};
