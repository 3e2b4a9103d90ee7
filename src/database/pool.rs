use std::time::Duration;

use sqlx::pool::PoolOptions;
use sqlx::{Any, AnyPool};
use tracing::info;

use super::Backend;

/// Connect a pool for one credential tier.
pub async fn connect_pool(
    url: &str,
    connect_timeout: Duration,
    max_connections: u32,
) -> Result<AnyPool, sqlx::Error> {
    sqlx::any::install_default_drivers();

    let pool = PoolOptions::<Any>::new()
        .max_connections(max_connections)
        .acquire_timeout(connect_timeout)
        .connect(url)
        .await?;

    info!(
        "Connection pool ready ({} backend, max {} connections)",
        Backend::from_url(url).as_str(),
        max_connections
    );
    Ok(pool)
}
