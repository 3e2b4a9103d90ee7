//! Two-tier credential model.
//!
//! A [`RestrictedHandle`] is bound to one end-user session and is subject to
//! row-level policies. An [`ElevatedHandle`] bypasses those policies and is
//! the only way to reach the promotion procedures.

use std::sync::Arc;

use sqlx::AnyPool;
use tracing::{info, warn};

use super::identity::Identity;
use super::store::{
    AdminProcedures, ProfileStore, SessionProfileStore, SqlAdminProcedures, SqlProfileStore,
};
use crate::config::AppConfig;
use crate::database::{connect_pool, Backend};
use crate::error::BootstrapAppError;

#[derive(Clone)]
pub struct RestrictedHandle {
    profiles: Arc<dyn ProfileStore>,
}

impl RestrictedHandle {
    pub fn new(profiles: Arc<dyn ProfileStore>) -> Self {
        Self { profiles }
    }

    pub fn profiles(&self) -> &dyn ProfileStore {
        self.profiles.as_ref()
    }
}

#[derive(Clone)]
pub struct ElevatedHandle {
    profiles: Arc<dyn ProfileStore>,
    procedures: Arc<dyn AdminProcedures>,
}

impl ElevatedHandle {
    pub fn new(profiles: Arc<dyn ProfileStore>, procedures: Arc<dyn AdminProcedures>) -> Self {
        Self {
            profiles,
            procedures,
        }
    }

    pub fn profiles(&self) -> &dyn ProfileStore {
        self.profiles.as_ref()
    }

    pub fn procedures(&self) -> &dyn AdminProcedures {
        self.procedures.as_ref()
    }
}

/// Hands out restricted handles per session and the shared elevated handle, if configured.
#[derive(Clone)]
pub struct CredentialProvider {
    session_pool: AnyPool,
    session_backend: Backend,
    session_role: String,
    elevated: Option<ElevatedHandle>,
}

impl CredentialProvider {
    /// Connect the session pool and, when `SERVICE_DATABASE_URL` is set, the elevated pool.
    pub async fn connect(config: &AppConfig) -> Result<Self, BootstrapAppError> {
        let session_pool = connect_pool(&config.database_url, config.connect_timeout(), 5)
            .await
            .map_err(|e| BootstrapAppError::DatabaseError(e.to_string()))?;

        let elevated_pool = match &config.service_database_url {
            Some(url) => {
                let pool = connect_pool(url, config.connect_timeout(), 2)
                    .await
                    .map_err(|e| BootstrapAppError::DatabaseError(e.to_string()))?;
                info!("Elevated credential configured");
                Some((pool, Backend::from_url(url)))
            }
            None => {
                warn!("No elevated credential configured; bootstrap will use session credentials only");
                None
            }
        };

        Ok(Self::from_pools(
            session_pool,
            Backend::from_url(&config.database_url),
            config.session_role.clone(),
            elevated_pool,
        ))
    }

    pub fn from_pools(
        session_pool: AnyPool,
        session_backend: Backend,
        session_role: String,
        elevated_pool: Option<(AnyPool, Backend)>,
    ) -> Self {
        let elevated = elevated_pool.map(|(pool, backend)| {
            ElevatedHandle::new(
                Arc::new(SqlProfileStore::new(pool.clone())),
                Arc::new(SqlAdminProcedures::new(pool, backend)),
            )
        });

        Self {
            session_pool,
            session_backend,
            session_role,
            elevated,
        }
    }

    pub fn restricted(&self, identity: &Identity) -> RestrictedHandle {
        RestrictedHandle::new(Arc::new(SessionProfileStore::new(
            self.session_pool.clone(),
            self.session_backend,
            identity.id.clone(),
            self.session_role.clone(),
        )))
    }

    pub fn elevated(&self) -> Option<ElevatedHandle> {
        self.elevated.clone()
    }
}
