use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use trailkeep_application::{AuditLogStore, AuditOptions};
use trailkeep_core::{AppError, AppResult};
use trailkeep_domain::{AuditLogRecord, AuditSchema};

use crate::merge_statement::MergeStatement;
use crate::merge_statement_cache::MergeStatementCache;

mod insert;
mod payload;


/// Where the generated merge routine lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Persistent routine created once per database and reused.
    StoredRoutine,
    /// Routine created in `pg_temp` on the connection that calls it.
    SessionScoped,
}

impl MergeStrategy {
    /// Picks the strategy configured in `options`.
    #[must_use]
    pub fn for_options(options: &AuditOptions) -> Self {
        if options.use_stored_routines {
            Self::StoredRoutine
        } else {
            Self::SessionScoped
        }
    }
}

/// PostgreSQL-backed audit log store.
#[derive(Clone)]
pub struct PostgresAuditLogStore {
    pool: PgPool,
    schema: AuditSchema,
    cache: MergeStatementCache,
    strategy: MergeStrategy,
    database: String,
}

impl PostgresAuditLogStore {
    /// Creates a store writing to the tables described by `schema`.
    #[must_use]
    pub fn new(pool: PgPool, schema: AuditSchema, cache: MergeStatementCache) -> Self {
        let database = database_identity(&pool);
        Self {
            pool,
            schema,
            cache,
            strategy: MergeStrategy::StoredRoutine,
            database,
        }
    }

    /// Sets how the merge routine is installed.
    #[must_use]
    pub fn with_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Creates or replaces the stored merge routine, returning its name.
    pub async fn install_merge_routine(&self) -> AppResult<String> {
        let statement = self.cache.statement(&self.schema);
        self.create_stored_routine(&statement).await?;
        self.cache
            .mark_routine_verified(&self.database, statement.routine_name());

        info!(
            routine = statement.routine_name(),
            record_table = %self.schema.record_table(),
            "installed audit merge routine"
        );
        Ok(statement.routine_name().to_owned())
    }

    async fn ensure_stored_routine(&self, statement: &MergeStatement) -> AppResult<()> {
        if self
            .cache
            .is_routine_verified(&self.database, statement.routine_name())
        {
            return Ok(());
        }

        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM pg_proc
                WHERE proname = $1
                    AND pg_function_is_visible(oid)
            )
            "#,
        )
        .bind(statement.routine_name())
        .fetch_one(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to look up audit merge routine '{}': {error}",
                statement.routine_name()
            ))
        })?;

        if !exists {
            warn!(
                routine = statement.routine_name(),
                "audit merge routine missing, creating it"
            );
            self.create_stored_routine(statement).await?;
        }

        self.cache
            .mark_routine_verified(&self.database, statement.routine_name());
        Ok(())
    }

    async fn create_stored_routine(&self, statement: &MergeStatement) -> AppResult<()> {
        let definition = statement.stored_definition();
        sqlx::query(&definition)
            .execute(&self.pool)
            .await
            .map_err(|error| {
                AppError::Internal(format!(
                    "failed to create audit merge routine '{}': {error}",
                    statement.routine_name()
                ))
            })?;
        Ok(())
    }

    async fn call_stored_routine(
        &self,
        statement: &MergeStatement,
        payload: String,
        window_seconds: f64,
    ) -> AppResult<i32> {
        self.ensure_stored_routine(statement).await?;

        let call = statement.stored_call();
        sqlx::query_scalar(&call)
            .bind(payload)
            .bind(window_seconds)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| {
                AppError::Internal(format!(
                    "failed to execute audit merge routine '{}': {error}",
                    statement.routine_name()
                ))
            })
    }

    async fn call_session_routine(
        &self,
        statement: &MergeStatement,
        payload: String,
        window_seconds: f64,
    ) -> AppResult<i32> {
        let mut connection = self.pool.acquire().await.map_err(|error| {
            AppError::Internal(format!(
                "failed to acquire connection for audit merge: {error}"
            ))
        })?;

        let definition = statement.session_definition();
        sqlx::query(&definition)
            .execute(&mut *connection)
            .await
            .map_err(|error| {
                AppError::Internal(format!(
                    "failed to create session audit merge routine '{}': {error}",
                    statement.routine_name()
                ))
            })?;

        let call = statement.session_call();
        sqlx::query_scalar(&call)
            .bind(payload)
            .bind(window_seconds)
            .fetch_one(&mut *connection)
            .await
            .map_err(|error| {
                AppError::Internal(format!(
                    "failed to execute session audit merge routine '{}': {error}",
                    statement.routine_name()
                ))
            })
    }
}

#[async_trait]
impl AuditLogStore for PostgresAuditLogStore {
    fn schema(&self) -> &AuditSchema {
        &self.schema
    }

    fn supports_merge(&self) -> bool {
        true
    }

    async fn merge_records(
        &self,
        records: &[AuditLogRecord],
        window: Duration,
    ) -> AppResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let statement = self.cache.statement(&self.schema);
        let payload = payload::encode(&self.schema, records)?;
        let window_seconds = window.as_secs_f64();

        let processed = match self.strategy {
            MergeStrategy::StoredRoutine => {
                self.call_stored_routine(&statement, payload, window_seconds)
                    .await?
            }
            MergeStrategy::SessionScoped => {
                self.call_session_routine(&statement, payload, window_seconds)
                    .await?
            }
        };

        debug!(
            routine = statement.routine_name(),
            records = records.len(),
            processed,
            "merged audit batch"
        );
        Ok(u64::try_from(processed).unwrap_or_default())
    }

    async fn insert_records(&self, records: &[AuditLogRecord]) -> AppResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        self.insert_plain(records).await
    }
}

fn database_identity(pool: &PgPool) -> String {
    let options = pool.connect_options();
    format!(
        "{}:{}/{}",
        options.get_host(),
        options.get_port(),
        options.get_database().unwrap_or_default()
    )
}
