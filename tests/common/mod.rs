#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::AnyPool;
use tempfile::TempDir;

use asset_bootstrap::bootstrap::store::SqlProfileStore;
use asset_bootstrap::bootstrap::{
    AdminProcedures, ElevatedHandle, IdentityId, ProfileStore, RestrictedHandle, Role,
};
use asset_bootstrap::database::{connect, connect_pool, ConnectionTarget};
use asset_bootstrap::error::{StoreError, StoreResult};
use asset_bootstrap::migrations::{MigrationRunner, MigrationScript};
use asset_bootstrap::retry::RetryPolicy;

/// SQLite rendition of the registry schema.
pub const REGISTRY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS identities (
    id TEXT PRIMARY KEY,
    email TEXT UNIQUE
);
CREATE TABLE IF NOT EXISTS profiles (
    identity_id TEXT PRIMARY KEY,
    role TEXT NOT NULL DEFAULT 'user' CHECK (role IN ('admin', 'user'))
);
CREATE TABLE IF NOT EXISTS admin_seed (
    slot INTEGER PRIMARY KEY CHECK (slot = 1),
    identity_id TEXT NOT NULL,
    claimed_at INTEGER NOT NULL
);
"#;

/// A fresh identity id shaped like the ones the auth provider issues.
pub fn fresh_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Retry policy with no delay between attempts.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::ZERO)
}

/// An on-disk SQLite store living as long as the value.
pub struct TestStore {
    pub dir: TempDir,
    pub url: String,
    pub pool: AnyPool,
}

impl TestStore {
    /// Empty database, no schema.
    pub async fn empty() -> TestStore {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let url = format!("sqlite://{}/store.db?mode=rwc", dir.path().display());
        let pool = connect_pool(&url, Duration::from_secs(5), 4)
            .await
            .expect("Failed to open test pool");
        TestStore { dir, url, pool }
    }

    /// Database with the registry schema applied through the migration runner.
    pub async fn with_registry() -> TestStore {
        let store = TestStore::empty().await;
        let scripts = vec![MigrationScript::new("0001_registry_init.sql", REGISTRY_SCHEMA)];
        let mut conn = connect(&store.target(), fast_retry())
            .await
            .expect("Failed to connect");
        MigrationRunner::new(fast_retry())
            .run(&scripts, &mut conn)
            .await
            .expect("Failed to apply registry schema");
        conn.close().await;
        store
    }

    pub fn target(&self) -> ConnectionTarget {
        ConnectionTarget::new(self.url.clone())
    }

    pub fn profiles(&self) -> Arc<SqlProfileStore> {
        Arc::new(SqlProfileStore::new(self.pool.clone()))
    }

    pub fn restricted(&self) -> RestrictedHandle {
        RestrictedHandle::new(self.profiles())
    }

    pub fn elevated(&self) -> ElevatedHandle {
        ElevatedHandle::new(self.profiles(), Arc::new(EmulatedProcedures::new(self.pool.clone())))
    }

    pub async fn register_identity(&self, id: &str, email: &str) {
        sqlx::query("INSERT INTO identities (id, email) VALUES ($1, $2)")
            .bind(id)
            .bind(email)
            .execute(&self.pool)
            .await
            .expect("Failed to register identity");
    }

    pub async fn role_of(&self, id: &str) -> Option<String> {
        sqlx::query_scalar("SELECT role FROM profiles WHERE identity_id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .expect("Failed to read role")
    }

    pub async fn count(&self, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&self.pool)
            .await
            .expect("Failed to count rows")
    }

    /// Plant a seed claim held by `id`, made `age_secs` ago.
    pub async fn plant_seed(&self, id: &str, age_secs: i64) {
        sqlx::query("INSERT INTO admin_seed (slot, identity_id, claimed_at) VALUES (1, $1, $2)")
            .bind(id)
            .bind(chrono::Utc::now().timestamp() - age_secs)
            .execute(&self.pool)
            .await
            .expect("Failed to plant seed claim");
    }

    pub async fn seed_holder(&self) -> Option<String> {
        sqlx::query_scalar("SELECT identity_id FROM admin_seed WHERE slot = 1")
            .fetch_optional(&self.pool)
            .await
            .expect("Failed to read seed claim")
    }

    pub async fn admin_count(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM profiles WHERE role = 'admin'")
            .fetch_one(&self.pool)
            .await
            .expect("Failed to count admins")
    }
}

/// The promotion procedures, reproduced against SQLite.
pub struct EmulatedProcedures {
    pool: AnyPool,
}

impl EmulatedProcedures {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AdminProcedures for EmulatedProcedures {
    async fn promote_by_id(&self, id: &IdentityId) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        let others: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM profiles WHERE identity_id <> $1")
                .bind(id.as_str())
                .fetch_one(&mut *tx)
                .await?;
        if others > 0 {
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO profiles (identity_id, role) VALUES ($1, 'admin') \
             ON CONFLICT (identity_id) DO UPDATE SET role = 'admin'",
        )
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn promote_by_email(&self, email: &str) -> StoreResult<Option<IdentityId>> {
        let id: Option<String> =
            sqlx::query_scalar("SELECT id FROM identities WHERE lower(email) = lower($1)")
                .bind(email)
                .fetch_optional(&self.pool)
                .await?;
        let Some(id) = id.map(IdentityId::new) else {
            return Ok(None);
        };
        if self.promote_by_id(&id).await? {
            Ok(Some(id))
        } else {
            Ok(None)
        }
    }

    async fn is_admin(&self, id: &IdentityId) -> StoreResult<bool> {
        let role: Option<String> =
            sqlx::query_scalar("SELECT role FROM profiles WHERE identity_id = $1")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(role.as_deref() == Some("admin"))
    }

    async fn installed(&self) -> StoreResult<bool> {
        Ok(true)
    }
}

/// Procedures that always fail, as when they are missing from the store.
pub struct MissingProcedures;

#[async_trait]
impl AdminProcedures for MissingProcedures {
    async fn promote_by_id(&self, _id: &IdentityId) -> StoreResult<bool> {
        Err(StoreError::Database("function set_first_admin_by_id does not exist".into()))
    }

    async fn promote_by_email(&self, _email: &str) -> StoreResult<Option<IdentityId>> {
        Err(StoreError::Database("function set_first_admin_by_email does not exist".into()))
    }

    async fn is_admin(&self, _id: &IdentityId) -> StoreResult<bool> {
        Err(StoreError::Database("function is_admin does not exist".into()))
    }

    async fn installed(&self) -> StoreResult<bool> {
        Ok(false)
    }
}

/// Wraps a store to count calls and inject failures.
pub struct ScriptedStore {
    inner: Arc<dyn ProfileStore>,
    pub count_override: Option<i64>,
    pub fail_writes: bool,
    pub fail_upsert: bool,
    pub fail_insert: bool,
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
    ops: Mutex<Vec<&'static str>>,
}

impl ScriptedStore {
    pub fn new(inner: Arc<dyn ProfileStore>) -> Self {
        Self {
            inner,
            count_override: None,
            fail_writes: false,
            fail_upsert: false,
            fail_insert: false,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            ops: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.reads.load(Ordering::SeqCst) + self.writes.load(Ordering::SeqCst)
    }

    /// Store operations in the order they were called.
    pub fn ops(&self) -> Vec<&'static str> {
        self.ops.lock().unwrap().clone()
    }

    fn read(&self, op: &'static str) {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.ops.lock().unwrap().push(op);
    }

    fn write(&self, op: &'static str) -> StoreResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.ops.lock().unwrap().push(op);
        if self.fail_writes {
            return Err(StoreError::Database("permission denied for table profiles".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for ScriptedStore {
    async fn count_profiles(&self) -> StoreResult<i64> {
        self.read("count_profiles");
        match self.count_override {
            Some(count) => Ok(count),
            None => self.inner.count_profiles().await,
        }
    }

    async fn read_role(&self, id: &IdentityId) -> StoreResult<Option<Role>> {
        self.read("read_role");
        self.inner.read_role(id).await
    }

    async fn upsert_role(&self, id: &IdentityId, role: Role) -> StoreResult<()> {
        self.write("upsert_role")?;
        if self.fail_upsert {
            return Err(StoreError::Database(
                "there is no unique or exclusion constraint matching the ON CONFLICT specification"
                    .into(),
            ));
        }
        self.inner.upsert_role(id, role).await
    }

    async fn insert_profile(&self, id: &IdentityId, role: Role) -> StoreResult<()> {
        self.write("insert_profile")?;
        if self.fail_insert {
            return Err(StoreError::Database("connection reset by peer".into()));
        }
        self.inner.insert_profile(id, role).await
    }

    async fn update_role(&self, id: &IdentityId, role: Role) -> StoreResult<u64> {
        self.write("update_role")?;
        self.inner.update_role(id, role).await
    }

    async fn claim_seed(&self, id: &IdentityId, lease: Duration) -> StoreResult<Option<IdentityId>> {
        self.write("claim_seed")?;
        self.inner.claim_seed(id, lease).await
    }

    async fn release_seed(&self, id: &IdentityId) -> StoreResult<()> {
        self.write("release_seed")?;
        self.inner.release_seed(id).await
    }
}
