//! Profile registry and remote-procedure access.
//!
//! [`ProfileStore`] covers the `profiles` table and the seed marker, and is
//! implemented for both credential tiers. [`AdminProcedures`] covers the
//! server-side promotion functions, which only the elevated tier may call.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Any, AnyConnection, AnyPool, Transaction};
use tracing::debug;

use super::identity::{IdentityId, Role};
use crate::database::Backend;
use crate::error::StoreResult;

pub const PROMOTE_BY_ID: &str = "set_first_admin_by_id";
pub const PROMOTE_BY_EMAIL: &str = "set_first_admin_by_email";
pub const IS_ADMIN: &str = "is_admin";

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn count_profiles(&self) -> StoreResult<i64>;

    async fn read_role(&self, id: &IdentityId) -> StoreResult<Option<Role>>;

    /// Insert, or update the role of an existing row keyed by identity id.
    async fn upsert_role(&self, id: &IdentityId, role: Role) -> StoreResult<()>;

    /// Plain insert; fails if a row for `id` already exists.
    async fn insert_profile(&self, id: &IdentityId, role: Role) -> StoreResult<()>;

    /// Update an existing row. Returns the number of rows changed.
    async fn update_role(&self, id: &IdentityId, role: Role) -> StoreResult<u64>;

    /// Try to claim the single seed-administrator slot for `id`.
    ///
    /// A claim older than `lease` whose holder never became admin is taken
    /// over. Returns whoever holds the slot afterwards.
    async fn claim_seed(&self, id: &IdentityId, lease: Duration) -> StoreResult<Option<IdentityId>>;

    /// Give up the seed slot if `id` still holds it.
    async fn release_seed(&self, id: &IdentityId) -> StoreResult<()>;
}

#[async_trait]
pub trait AdminProcedures: Send + Sync {
    /// True iff `id` is now the sole administrator.
    async fn promote_by_id(&self, id: &IdentityId) -> StoreResult<bool>;

    /// Id of the promoted identity, if the email resolved and promotion succeeded.
    async fn promote_by_email(&self, email: &str) -> StoreResult<Option<IdentityId>>;

    async fn is_admin(&self, id: &IdentityId) -> StoreResult<bool>;

    /// Whether all three procedures exist in the store.
    async fn installed(&self) -> StoreResult<bool>;
}

mod sql {
    use super::*;

    pub async fn count_profiles(conn: &mut AnyConnection) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM profiles")
            .fetch_one(&mut *conn)
            .await?;
        Ok(count)
    }

    pub async fn read_role(conn: &mut AnyConnection, id: &IdentityId) -> StoreResult<Option<Role>> {
        let role: Option<String> =
            sqlx::query_scalar("SELECT role FROM profiles WHERE identity_id = $1")
                .bind(id.as_str())
                .fetch_optional(&mut *conn)
                .await?;
        role.map(|r| r.parse()).transpose()
    }

    pub async fn upsert_role(conn: &mut AnyConnection, id: &IdentityId, role: Role) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO profiles (identity_id, role)
            VALUES ($1, $2)
            ON CONFLICT (identity_id) DO UPDATE SET role = excluded.role
            "#,
        )
        .bind(id.as_str())
        .bind(role.as_str())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn insert_profile(conn: &mut AnyConnection, id: &IdentityId, role: Role) -> StoreResult<()> {
        sqlx::query("INSERT INTO profiles (identity_id, role) VALUES ($1, $2)")
            .bind(id.as_str())
            .bind(role.as_str())
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn update_role(conn: &mut AnyConnection, id: &IdentityId, role: Role) -> StoreResult<u64> {
        let result = sqlx::query("UPDATE profiles SET role = $2 WHERE identity_id = $1")
            .bind(id.as_str())
            .bind(role.as_str())
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn claim_seed(
        conn: &mut AnyConnection,
        id: &IdentityId,
        lease: Duration,
    ) -> StoreResult<Option<IdentityId>> {
        let now = Utc::now().timestamp();
        let stale_before = now.saturating_sub(i64::try_from(lease.as_secs()).unwrap_or(i64::MAX));

        sqlx::query(
            r#"
            INSERT INTO admin_seed (slot, identity_id, claimed_at)
            VALUES (1, $1, $2)
            ON CONFLICT (slot) DO NOTHING
            "#,
        )
        .bind(id.as_str())
        .bind(now)
        .execute(&mut *conn)
        .await?;

        // an abandoned claim must not keep the registry admin-less forever
        let taken_over = sqlx::query(
            r#"
            UPDATE admin_seed SET identity_id = $1, claimed_at = $2
            WHERE slot = 1
              AND identity_id <> $1
              AND claimed_at < $3
              AND NOT EXISTS (SELECT 1 FROM profiles WHERE role = 'admin')
            "#,
        )
        .bind(id.as_str())
        .bind(now)
        .bind(stale_before)
        .execute(&mut *conn)
        .await?
        .rows_affected();
        if taken_over > 0 {
            debug!("Took over stale seed claim for {}", id);
        }

        let holder: Option<String> =
            sqlx::query_scalar("SELECT identity_id FROM admin_seed WHERE slot = 1")
                .fetch_optional(&mut *conn)
                .await?;
        Ok(holder.map(IdentityId::new))
    }

    pub async fn release_seed(conn: &mut AnyConnection, id: &IdentityId) -> StoreResult<()> {
        sqlx::query("DELETE FROM admin_seed WHERE slot = 1 AND identity_id = $1")
            .bind(id.as_str())
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}

/// Profile access on the elevated (policy-bypassing) pool.
#[derive(Clone)]
pub struct SqlProfileStore {
    pool: AnyPool,
}

impl SqlProfileStore {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProfileStore for SqlProfileStore {
    async fn count_profiles(&self) -> StoreResult<i64> {
        let mut conn = self.pool.acquire().await?;
        sql::count_profiles(&mut conn).await
    }

    async fn read_role(&self, id: &IdentityId) -> StoreResult<Option<Role>> {
        let mut conn = self.pool.acquire().await?;
        sql::read_role(&mut conn, id).await
    }

    async fn upsert_role(&self, id: &IdentityId, role: Role) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        sql::upsert_role(&mut conn, id, role).await
    }

    async fn insert_profile(&self, id: &IdentityId, role: Role) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        sql::insert_profile(&mut conn, id, role).await
    }

    async fn update_role(&self, id: &IdentityId, role: Role) -> StoreResult<u64> {
        let mut conn = self.pool.acquire().await?;
        sql::update_role(&mut conn, id, role).await
    }

    async fn claim_seed(&self, id: &IdentityId, lease: Duration) -> StoreResult<Option<IdentityId>> {
        let mut conn = self.pool.acquire().await?;
        sql::claim_seed(&mut conn, id, lease).await
    }

    async fn release_seed(&self, id: &IdentityId) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        sql::release_seed(&mut conn, id).await
    }
}

/// Profile access scoped to one end-user session.
///
/// On PostgreSQL every call runs in a transaction that switches to the
/// session role and publishes the identity as JWT claims, so row-level
/// policies apply exactly as they would for the user's own requests.
#[derive(Clone)]
pub struct SessionProfileStore {
    pool: AnyPool,
    backend: Backend,
    identity: IdentityId,
    session_role: String,
}

impl SessionProfileStore {
    pub fn new(pool: AnyPool, backend: Backend, identity: IdentityId, session_role: String) -> Self {
        Self {
            pool,
            backend,
            identity,
            session_role,
        }
    }

    async fn scoped(&self) -> StoreResult<Transaction<'static, Any>> {
        let mut tx = self.pool.begin().await?;
        if self.backend == Backend::Postgres {
            let claims = session_claims(&self.identity, &self.session_role);
            sqlx::query("SELECT set_config('request.jwt.claims', $1, true)")
                .bind(claims.as_str())
                .execute(&mut *tx)
                .await?;
            sqlx::query("SELECT set_config('request.jwt.claim.sub', $1, true)")
                .bind(self.identity.as_str())
                .execute(&mut *tx)
                .await?;
            sqlx::query("SELECT set_config('role', $1, true)")
                .bind(self.session_role.as_str())
                .execute(&mut *tx)
                .await?;
            debug!("Session scope set for {}", self.identity);
        }
        Ok(tx)
    }
}

#[async_trait]
impl ProfileStore for SessionProfileStore {
    async fn count_profiles(&self) -> StoreResult<i64> {
        let mut tx = self.scoped().await?;
        let count = sql::count_profiles(&mut tx).await?;
        tx.commit().await?;
        Ok(count)
    }

    async fn read_role(&self, id: &IdentityId) -> StoreResult<Option<Role>> {
        let mut tx = self.scoped().await?;
        let role = sql::read_role(&mut tx, id).await?;
        tx.commit().await?;
        Ok(role)
    }

    async fn upsert_role(&self, id: &IdentityId, role: Role) -> StoreResult<()> {
        let mut tx = self.scoped().await?;
        sql::upsert_role(&mut tx, id, role).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert_profile(&self, id: &IdentityId, role: Role) -> StoreResult<()> {
        let mut tx = self.scoped().await?;
        sql::insert_profile(&mut tx, id, role).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_role(&self, id: &IdentityId, role: Role) -> StoreResult<u64> {
        let mut tx = self.scoped().await?;
        let changed = sql::update_role(&mut tx, id, role).await?;
        tx.commit().await?;
        Ok(changed)
    }

    async fn claim_seed(&self, id: &IdentityId, lease: Duration) -> StoreResult<Option<IdentityId>> {
        let mut tx = self.scoped().await?;
        let holder = sql::claim_seed(&mut tx, id, lease).await?;
        tx.commit().await?;
        Ok(holder)
    }

    async fn release_seed(&self, id: &IdentityId) -> StoreResult<()> {
        let mut tx = self.scoped().await?;
        sql::release_seed(&mut tx, id).await?;
        tx.commit().await?;
        Ok(())
    }
}

/// JWT claims a session-scoped transaction publishes for row-level policies.
fn session_claims(identity: &IdentityId, session_role: &str) -> String {
    serde_json::json!({
        "sub": identity.as_str(),
        "role": session_role,
    })
    .to_string()
}

/// Calls the fixed-name promotion functions installed by the schema migrations.
#[derive(Clone)]
pub struct SqlAdminProcedures {
    pool: AnyPool,
    backend: Backend,
}

impl SqlAdminProcedures {
    pub fn new(pool: AnyPool, backend: Backend) -> Self {
        Self { pool, backend }
    }
}

#[async_trait]
impl AdminProcedures for SqlAdminProcedures {
    async fn promote_by_id(&self, id: &IdentityId) -> StoreResult<bool> {
        let promoted: Option<bool> =
            sqlx::query_scalar(&format!("SELECT {}($1)", PROMOTE_BY_ID))
                .bind(id.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(promoted.unwrap_or(false))
    }

    async fn promote_by_email(&self, email: &str) -> StoreResult<Option<IdentityId>> {
        let promoted: Option<String> =
            sqlx::query_scalar(&format!("SELECT {}($1)", PROMOTE_BY_EMAIL))
                .bind(email)
                .fetch_one(&self.pool)
                .await?;
        Ok(promoted.map(IdentityId::new))
    }

    async fn is_admin(&self, id: &IdentityId) -> StoreResult<bool> {
        let admin: Option<bool> = sqlx::query_scalar(&format!("SELECT {}($1)", IS_ADMIN))
            .bind(id.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(admin.unwrap_or(false))
    }

    async fn installed(&self) -> StoreResult<bool> {
        if self.backend != Backend::Postgres {
            return Ok(false);
        }

        let found: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT proname) FROM pg_proc WHERE proname IN ($1, $2, $3)",
        )
        .bind(PROMOTE_BY_ID)
        .bind(PROMOTE_BY_EMAIL)
        .bind(IS_ADMIN)
        .fetch_one(&self.pool)
        .await?;
        Ok(found == 3)
    }
}
