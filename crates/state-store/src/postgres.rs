use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::{
    Result, SagaId, StateRecord, StateStoreError, Version,
    store::{DEFAULT_TTL, StateStore, state_key},
};

/// PostgreSQL-backed state store.
///
/// Postgres has no native key expiry, so every row carries an `expires_at`
/// timestamp: reads ignore expired rows and [`StateStore::purge_expired`]
/// deletes them.
#[derive(Clone)]
pub struct PostgresStateStore {
    pool: PgPool,
    ttl: Duration,
}

impl PostgresStateStore {
    /// Creates a new PostgreSQL state store with the default 24 hour TTL.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            ttl: DEFAULT_TTL,
        }
    }

    /// Overrides the TTL applied on save and extend.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn expires_at(&self) -> chrono::DateTime<Utc> {
        Utc::now() + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::days(1))
    }

    async fn current_version(&self, key: &str) -> Result<Version> {
        let version: Option<i64> = sqlx::query_scalar(
            "SELECT version FROM saga_state WHERE key = $1 AND expires_at > NOW()",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(Version::new(version.unwrap_or(0)))
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn save(
        &self,
        saga_id: SagaId,
        payload: serde_json::Value,
        expected: Version,
    ) -> Result<Version> {
        let key = state_key(saga_id);
        let next = expected.next();

        let result = if expected == Version::initial() {
            // An expired row with the same key may still be present.
            sqlx::query(
                r#"
                INSERT INTO saga_state (key, saga_id, version, state, updated_at, expires_at)
                VALUES ($1, $2, $3, $4, NOW(), $5)
                ON CONFLICT (key) DO UPDATE
                SET version = EXCLUDED.version,
                    state = EXCLUDED.state,
                    updated_at = EXCLUDED.updated_at,
                    expires_at = EXCLUDED.expires_at
                WHERE saga_state.expires_at <= NOW()
                "#,
            )
            .bind(&key)
            .bind(saga_id.as_uuid())
            .bind(next.as_i64())
            .bind(&payload)
            .bind(self.expires_at())
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE saga_state
                SET version = $3, state = $4, updated_at = NOW(), expires_at = $5
                WHERE key = $1 AND version = $2 AND expires_at > NOW()
                "#,
            )
            .bind(&key)
            .bind(expected.as_i64())
            .bind(next.as_i64())
            .bind(&payload)
            .bind(self.expires_at())
            .execute(&self.pool)
            .await?
        };

        if result.rows_affected() == 0 {
            let actual = self.current_version(&key).await?;
            return Err(StateStoreError::ConcurrencyConflict {
                saga_id,
                expected,
                actual,
            });
        }

        tracing::debug!(%saga_id, version = %next, "saved saga state");
        Ok(next)
    }

    async fn get(&self, saga_id: SagaId) -> Result<Option<StateRecord>> {
        let row = sqlx::query(
            r#"
            SELECT saga_id, version, state
            FROM saga_state
            WHERE key = $1 AND expires_at > NOW()
            "#,
        )
        .bind(state_key(saga_id))
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(StateRecord {
                saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
                version: Version::new(row.try_get("version")?),
                payload: row.try_get("state")?,
            })
        })
        .transpose()
    }

    async fn delete(&self, saga_id: SagaId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM saga_state WHERE key = $1 AND expires_at > NOW()")
            .bind(state_key(saga_id))
            .execute(&self.pool)
            .await?;
        tracing::debug!(%saga_id, "deleted saga state");
        Ok(result.rows_affected() > 0)
    }

    async fn exists(&self, saga_id: SagaId) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM saga_state WHERE key = $1 AND expires_at > NOW())",
        )
        .bind(state_key(saga_id))
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn extend_ttl(&self, saga_id: SagaId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE saga_state SET expires_at = $2 WHERE key = $1 AND expires_at > NOW()",
        )
        .bind(state_key(saga_id))
        .bind(self.expires_at())
        .execute(&self.pool)
        .await?;
        tracing::debug!(%saga_id, "extended saga state TTL");
        Ok(result.rows_affected() > 0)
    }

    async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM saga_state WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?;
        let purged = result.rows_affected();
        if purged > 0 {
            metrics::counter!("saga_state_purged_total").increment(purged);
        }
        Ok(purged)
    }
}
