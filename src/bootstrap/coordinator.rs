//! Bootstrap Coordinator
//!
//! Promotes the first identity to complete an initial signup against an empty
//! profile registry. Promotion walks an ordered chain of strategies, each safe
//! to repeat after an earlier one already succeeded, and stops at the first
//! one whose effect is confirmed by re-reading the stored role.
//!
//! Failures never reach the login flow: the caller always gets a
//! [`BootstrapOutcome`].

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::credentials::{ElevatedHandle, RestrictedHandle};
use super::identity::{Identity, Role};
use super::store::ProfileStore;
use crate::config::{AppConfig, SeedGuard};
use crate::error::BootstrapExhaustedError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum BootstrapOutcome {
    Promoted,
    Skipped(SkipReason),
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The caller did not flag this login as an initial signup.
    NotInitialSignup,
    /// A seed administrator already exists.
    RegistryNotEmpty,
    /// Another identity claimed the seed slot first.
    SeedHeldByOther,
}

/// Result of one promotion strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Success,
    NoEffect(&'static str),
    Error(String),
}

/// Promotion strategies in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    PromoteById,
    PromoteByEmail,
    UpsertProfile,
    InsertProfile,
    UpdateExistingRole,
}

pub const PROMOTION_CHAIN: [Strategy; 5] = [
    Strategy::PromoteById,
    Strategy::PromoteByEmail,
    Strategy::UpsertProfile,
    Strategy::InsertProfile,
    Strategy::UpdateExistingRole,
];

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::PromoteById => "promote_by_id",
            Strategy::PromoteByEmail => "promote_by_email",
            Strategy::UpsertProfile => "upsert_profile",
            Strategy::InsertProfile => "insert_profile",
            Strategy::UpdateExistingRole => "update_existing_role",
        }
    }
}

/// Handles for one promotion attempt.
struct Session<'a> {
    identity: &'a Identity,
    restricted: &'a RestrictedHandle,
    elevated: Option<&'a ElevatedHandle>,
}

impl Session<'_> {
    /// Profile access on the most privileged credential available.
    fn profiles(&self) -> &dyn ProfileStore {
        match self.elevated {
            Some(elevated) => elevated.profiles(),
            None => self.restricted.profiles(),
        }
    }

    async fn is_admin(&self) -> Result<bool, String> {
        self.profiles()
            .read_role(&self.identity.id)
            .await
            .map(|role| role == Some(Role::Admin))
            .map_err(|e| e.to_string())
    }
}

/// How long a seed claim protects a holder that has not become admin yet.
pub const DEFAULT_SEED_LEASE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct BootstrapCoordinator {
    seed_guard: SeedGuard,
    seed_lease: Duration,
}

impl Default for BootstrapCoordinator {
    fn default() -> Self {
        Self::new(SeedGuard::default())
    }
}

impl BootstrapCoordinator {
    pub fn new(seed_guard: SeedGuard) -> Self {
        Self {
            seed_guard,
            seed_lease: DEFAULT_SEED_LEASE,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.seed_guard).with_seed_lease(config.seed_lease())
    }

    pub fn with_seed_lease(mut self, seed_lease: Duration) -> Self {
        self.seed_lease = seed_lease;
        self
    }

    /// Promote `identity` to administrator if, and only if, no administrator exists yet.
    ///
    /// Without `initial_signup` this returns `Skipped` without touching the store.
    pub async fn maybe_promote_first_admin(
        &self,
        identity: &Identity,
        restricted: &RestrictedHandle,
        elevated: Option<&ElevatedHandle>,
        initial_signup: bool,
    ) -> BootstrapOutcome {
        if !initial_signup {
            return BootstrapOutcome::Skipped(SkipReason::NotInitialSignup);
        }

        let session = Session {
            identity,
            restricted,
            elevated,
        };

        match session.profiles().count_profiles().await {
            Ok(0) => {}
            Ok(count) => {
                // a retried signup of the seed admin itself still reports success
                if let Ok(true) = session.is_admin().await {
                    debug!("{} is already the seed administrator", identity.id);
                    return BootstrapOutcome::Promoted;
                }
                debug!("Registry holds {} profiles; skipping first-admin bootstrap", count);
                return BootstrapOutcome::Skipped(SkipReason::RegistryNotEmpty);
            }
            Err(e) => {
                error!("First-admin emptiness check failed for {}: {}", identity.id, e);
                return BootstrapOutcome::Failed(format!("emptiness check failed: {}", e));
            }
        }

        if self.seed_guard == SeedGuard::Marker {
            match session.profiles().claim_seed(&identity.id, self.seed_lease).await {
                Ok(Some(holder)) if holder != identity.id => {
                    warn!(
                        "Seed administrator slot already claimed by {}; {} stays a regular user",
                        holder, identity.id
                    );
                    return BootstrapOutcome::Skipped(SkipReason::SeedHeldByOther);
                }
                Ok(_) => info!("Claimed seed administrator slot for {}", identity.id),
                Err(e) => warn!(
                    "Seed claim failed for {}, continuing without it: {}",
                    identity.id, e
                ),
            }
        }

        let outcome = self.run_chain(&session).await;

        // a failed holder must not keep later signups out
        if self.seed_guard == SeedGuard::Marker && matches!(outcome, BootstrapOutcome::Failed(_)) {
            match session.profiles().release_seed(&identity.id).await {
                Ok(()) => info!("Released seed administrator slot held by {}", identity.id),
                Err(e) => warn!(
                    "Could not release seed slot for {}, it frees up once the lease expires: {}",
                    identity.id, e
                ),
            }
        }

        outcome
    }

    async fn run_chain(&self, session: &Session<'_>) -> BootstrapOutcome {
        let id = &session.identity.id;
        let mut attempts = Vec::new();

        for strategy in PROMOTION_CHAIN {
            let outcome = attempt(strategy, session).await;
            match &outcome {
                StepOutcome::Success => match session.is_admin().await {
                    Ok(true) => {
                        info!("Promoted {} to administrator via {}", id, strategy.as_str());
                        return BootstrapOutcome::Promoted;
                    }
                    Ok(false) => {
                        warn!("{} reported success but {} is not admin", strategy.as_str(), id);
                        attempts.push(format!("{}: unverified", strategy.as_str()));
                    }
                    Err(e) => {
                        warn!("Verification after {} failed: {}", strategy.as_str(), e);
                        attempts.push(format!("{}: verification failed: {}", strategy.as_str(), e));
                    }
                },
                StepOutcome::NoEffect(why) => {
                    debug!("{} had no effect: {}", strategy.as_str(), why);
                    attempts.push(format!("{}: {}", strategy.as_str(), why));
                }
                StepOutcome::Error(e) => {
                    warn!("{} failed for {}: {}", strategy.as_str(), id, e);
                    attempts.push(format!("{}: {}", strategy.as_str(), e));
                }
            }
        }

        // a step may have landed server-side while its reply was lost
        if let Ok(true) = session.is_admin().await {
            info!("Promotion of {} confirmed on final re-read", id);
            return BootstrapOutcome::Promoted;
        }

        let exhausted = BootstrapExhaustedError {
            identity: id.to_string(),
            attempts,
        };
        error!("{}", exhausted);
        BootstrapOutcome::Failed(exhausted.to_string())
    }
}

async fn attempt(strategy: Strategy, session: &Session<'_>) -> StepOutcome {
    let id = &session.identity.id;

    match strategy {
        Strategy::PromoteById => {
            let Some(elevated) = session.elevated else {
                return StepOutcome::NoEffect("no elevated credential");
            };
            match elevated.procedures().promote_by_id(id).await {
                Ok(true) => StepOutcome::Success,
                Ok(false) => StepOutcome::NoEffect("procedure declined"),
                Err(e) => StepOutcome::Error(e.to_string()),
            }
        }
        Strategy::PromoteByEmail => {
            let Some(elevated) = session.elevated else {
                return StepOutcome::NoEffect("no elevated credential");
            };
            let Some(email) = session.identity.email.as_deref() else {
                return StepOutcome::NoEffect("identity has no email");
            };
            match elevated.procedures().promote_by_email(email).await {
                Ok(Some(promoted)) if &promoted == id => StepOutcome::Success,
                Ok(Some(_)) => StepOutcome::NoEffect("email resolved to another identity"),
                Ok(None) => StepOutcome::NoEffect("procedure declined"),
                Err(e) => StepOutcome::Error(e.to_string()),
            }
        }
        Strategy::UpsertProfile => match session.profiles().upsert_role(id, Role::Admin).await {
            Ok(()) => StepOutcome::Success,
            Err(e) => StepOutcome::Error(e.to_string()),
        },
        Strategy::InsertProfile => match session.profiles().insert_profile(id, Role::Admin).await {
            Ok(()) => StepOutcome::Success,
            Err(e) => StepOutcome::Error(e.to_string()),
        },
        Strategy::UpdateExistingRole => {
            // session credentials may insert their own row but never change a role
            let Some(elevated) = session.elevated else {
                return StepOutcome::NoEffect("no elevated credential");
            };
            let profiles = elevated.profiles();
            match profiles.read_role(id).await {
                Ok(Some(Role::Admin)) => StepOutcome::Success,
                Ok(Some(Role::User)) => match profiles.update_role(id, Role::Admin).await {
                    Ok(0) => StepOutcome::NoEffect("row vanished before update"),
                    Ok(_) => StepOutcome::Success,
                    Err(e) => StepOutcome::Error(e.to_string()),
                },
                Ok(None) => StepOutcome::NoEffect("no profile row"),
                Err(e) => StepOutcome::Error(e.to_string()),
            }
        }
    }
}
