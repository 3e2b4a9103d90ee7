pub mod connection;
pub mod pool;

pub use connection::{connect, ConnectionTarget, StoreConnection};
pub use pool::connect_pool;

/// Store flavour behind a connection string, used where SQL differs by backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Postgres,
    Sqlite,
    Other,
}

impl Backend {
    pub fn from_url(url: &str) -> Self {
        let scheme = url.split(':').next().unwrap_or_default().to_ascii_lowercase();
        match scheme.as_str() {
            "postgres" | "postgresql" => Backend::Postgres,
            "sqlite" => Backend::Sqlite,
            _ => Backend::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Postgres => "postgres",
            Backend::Sqlite => "sqlite",
            Backend::Other => "other",
        }
    }
}
