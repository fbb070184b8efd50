//! PostgreSQL policy store.
//!
//! Schema:
//!
//! ```sql
//! CREATE TABLE permissions (tenant TEXT, subject TEXT, object TEXT, action TEXT,
//!                           UNIQUE (tenant, subject, object, action));
//! CREATE TABLE groupings   (tenant TEXT, subject TEXT, role TEXT,
//!                           UNIQUE (tenant, subject, role));
//! ```
//!
//! Saves run in one serializable transaction, so readers see either the old
//! or the new tuple set and never a permission without its groupings.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, Postgres};
use sqlx::{Row, Transaction};

use crate::error::StoreError;
use crate::store::PolicyStore;
use crate::tuple::{GroupingTuple, PermissionTuple, Policies};
use crate::types::{ActionId, ObjectId, SubjectId, TenantId};

const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const UNIQUE_VIOLATION: &str = "23505";
/// `statement_timeout` is an int4 number of milliseconds.
const MAX_STATEMENT_TIMEOUT_MS: u128 = i32::MAX as u128;

/// Relational [`PolicyStore`] backed by a PostgreSQL pool.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wraps an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a new pool to `database_url`.
    pub async fn connect(database_url: &str) -> std::result::Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(3))
            .connect(database_url)
            .await
            .map_err(map_sqlx_error)?;
        Ok(Self { pool })
    }

    /// Creates the policy tables if they do not exist.
    pub async fn run_migrations(&self) -> std::result::Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS permissions (
                tenant   TEXT NOT NULL,
                subject  TEXT NOT NULL,
                object   TEXT NOT NULL,
                action   TEXT NOT NULL,
                UNIQUE (tenant, subject, object, action)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS groupings (
                tenant   TEXT NOT NULL,
                subject  TEXT NOT NULL,
                role     TEXT NOT NULL,
                UNIQUE (tenant, subject, role)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin(
        &self,
        deadline: Instant,
    ) -> std::result::Result<Transaction<'static, Postgres>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        let budget = deadline.saturating_duration_since(Instant::now());
        if budget.is_zero() {
            return Err(StoreError::DeadlineExceeded(budget));
        }
        // SET does not take bind parameters.
        let millis = budget.as_millis().min(MAX_STATEMENT_TIMEOUT_MS);
        let statement_timeout = format!("SET LOCAL statement_timeout = {millis}");
        sqlx::query(&statement_timeout)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(tx)
    }

    async fn load(
        &self,
        tenant: Option<&TenantId>,
        deadline: Instant,
    ) -> std::result::Result<Policies, StoreError> {
        let mut tx = self.begin(deadline).await?;
        let tenant = tenant.map(TenantId::as_str);

        let permission_rows = sqlx::query(
            "SELECT tenant, subject, object, action FROM permissions \
             WHERE $1::text IS NULL OR tenant = $1",
        )
        .bind(tenant)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        let grouping_rows = sqlx::query(
            "SELECT tenant, subject, role FROM groupings WHERE $1::text IS NULL OR tenant = $1",
        )
        .bind(tenant)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;

        let mut policies = Policies::new();
        for row in permission_rows {
            policies.permissions.insert(PermissionTuple::new(
                TenantId::from_trusted(row.try_get("tenant").map_err(map_sqlx_error)?),
                SubjectId::from_trusted(row.try_get("subject").map_err(map_sqlx_error)?),
                ObjectId::from_trusted(row.try_get("object").map_err(map_sqlx_error)?),
                ActionId::from_trusted(row.try_get("action").map_err(map_sqlx_error)?),
            ));
        }
        for row in grouping_rows {
            policies.groupings.insert(GroupingTuple::new(
                TenantId::from_trusted(row.try_get("tenant").map_err(map_sqlx_error)?),
                SubjectId::from_trusted(row.try_get("subject").map_err(map_sqlx_error)?),
                SubjectId::from_trusted(row.try_get("role").map_err(map_sqlx_error)?),
            ));
        }
        Ok(policies)
    }

    async fn replace(
        &self,
        tenant: Option<&TenantId>,
        policies: &Policies,
        deadline: Instant,
    ) -> std::result::Result<(), StoreError> {
        let mut tx = self.begin(deadline).await?;
        let scope = tenant.map(TenantId::as_str);

        sqlx::query("DELETE FROM permissions WHERE $1::text IS NULL OR tenant = $1")
            .bind(scope)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        sqlx::query("DELETE FROM groupings WHERE $1::text IS NULL OR tenant = $1")
            .bind(scope)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        let in_scope = |candidate: &TenantId| tenant.is_none_or(|tenant| tenant == candidate);

        let mut columns: [Vec<String>; 4] = Default::default();
        for tuple in policies.permissions.iter().filter(|t| in_scope(&t.tenant)) {
            columns[0].push(tuple.tenant.to_string());
            columns[1].push(tuple.subject.to_string());
            columns[2].push(tuple.object.to_string());
            columns[3].push(tuple.action.to_string());
        }
        let [tenants, subjects, objects, actions] = columns;
        sqlx::query(
            "INSERT INTO permissions (tenant, subject, object, action) \
             SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[], $4::text[])",
        )
        .bind(tenants)
        .bind(subjects)
        .bind(objects)
        .bind(actions)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        let mut columns: [Vec<String>; 3] = Default::default();
        for tuple in policies.groupings.iter().filter(|t| in_scope(&t.tenant)) {
            columns[0].push(tuple.tenant.to_string());
            columns[1].push(tuple.subject.to_string());
            columns[2].push(tuple.role.to_string());
        }
        let [tenants, subjects, roles] = columns;
        sqlx::query(
            "INSERT INTO groupings (tenant, subject, role) \
             SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[])",
        )
        .bind(tenants)
        .bind(subjects)
        .bind(roles)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)
    }
}

#[async_trait]
impl PolicyStore for PostgresStore {
    async fn load_all(&self, deadline: Instant) -> std::result::Result<Policies, StoreError> {
        self.load(None, deadline).await
    }

    async fn load_for_tenant(
        &self,
        tenant: &TenantId,
        deadline: Instant,
    ) -> std::result::Result<Policies, StoreError> {
        self.load(Some(tenant), deadline).await
    }

    async fn save_all(
        &self,
        policies: &Policies,
        deadline: Instant,
    ) -> std::result::Result<(), StoreError> {
        self.replace(None, policies, deadline).await
    }

    async fn save_for_tenant(
        &self,
        tenant: &TenantId,
        policies: &Policies,
        deadline: Instant,
    ) -> std::result::Result<(), StoreError> {
        self.replace(Some(tenant), policies, deadline).await
    }
}

fn map_sqlx_error(error: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &error {
        let code = db.code();
        if matches!(
            code.as_deref(),
            Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED | UNIQUE_VIOLATION)
        ) {
            return StoreError::WriteConflict(db.message().to_string());
        }
    }
    StoreError::unavailable(error)
}
