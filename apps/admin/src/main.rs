//! Trailkeep audit store administration.

#![forbid(unsafe_code)]

use std::env;

use chrono::{TimeDelta, Utc};
use sqlx::PgPool;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

use trailkeep_application::{AuditLogReader, AuditOptions};
use trailkeep_core::{AppError, AppResult};
use trailkeep_domain::TableDescriptor;
use trailkeep_infrastructure::{
    MergeStatementCache, MergeStrategy, PostgresAuditLogReader, PostgresAuditLogStore,
    PostgresSchemaInspector,
};

static MIGRATOR: Migrator = sqlx::migrate!("../../crates/infrastructure/migrations");

const USAGE: &str = "usage: trailkeep-admin <migrate|install-merge-routine|purge>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Migrate,
    InstallMergeRoutine,
    Purge,
}

impl Command {
    fn parse(argument: Option<&str>) -> AppResult<Self> {
        match argument {
            Some("migrate") => Ok(Self::Migrate),
            Some("install-merge-routine") => Ok(Self::InstallMergeRoutine),
            Some("purge") => Ok(Self::Purge),
            Some(other) => Err(AppError::Validation(format!(
                "unknown command '{other}'; {USAGE}"
            ))),
            None => Err(AppError::Validation(USAGE.to_owned())),
        }
    }
}

#[derive(Debug, Clone)]
struct AdminConfig {
    database_url: String,
    record_table: TableDescriptor,
    property_table: TableDescriptor,
    retention_days: u32,
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_tracing();

    let command = Command::parse(env::args().nth(1).as_deref())?;
    let config = AdminConfig::load()?;
    let pool = connect_pool(config.database_url.as_str()).await?;

    match command {
        Command::Migrate => migrate(&pool).await,
        Command::InstallMergeRoutine => install_merge_routine(pool, &config).await,
        Command::Purge => purge(pool, &config).await,
    }
}

async fn migrate(pool: &PgPool) -> AppResult<()> {
    MIGRATOR
        .run(pool)
        .await
        .map_err(|error| AppError::Internal(format!("failed to run migrations: {error}")))?;

    info!("audit migrations applied");
    Ok(())
}

async fn install_merge_routine(pool: PgPool, config: &AdminConfig) -> AppResult<()> {
    let options = AuditOptions::from_env()?;
    let schema = PostgresSchemaInspector::new(pool.clone())
        .inspect(&config.record_table, &config.property_table)
        .await?;
    let strategy = MergeStrategy::for_options(&options);
    let store = PostgresAuditLogStore::new(pool, schema, MergeStatementCache::default())
        .with_strategy(strategy);

    let routine_name = store.install_merge_routine().await?;
    info!(
        routine_name = %routine_name,
        strategy = ?strategy,
        "merge routine ready"
    );
    Ok(())
}

async fn purge(pool: PgPool, config: &AdminConfig) -> AppResult<()> {
    let schema = PostgresSchemaInspector::new(pool.clone())
        .inspect(&config.record_table, &config.property_table)
        .await?;
    let reader = PostgresAuditLogReader::new(pool, schema);
    let cutoff = Utc::now() - TimeDelta::days(i64::from(config.retention_days));

    let purged = reader.purge_older_than(cutoff).await?;
    info!(
        purged,
        retention_days = config.retention_days,
        cutoff = %cutoff,
        "purged expired audit records"
    );
    Ok(())
}

async fn connect_pool(database_url: &str) -> AppResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .map_err(|error| AppError::Internal(format!("failed to connect to database: {error}")))
}

impl AdminConfig {
    fn load() -> AppResult<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> AppResult<Self> {
        let database_url = lookup("DATABASE_URL")
            .ok_or_else(|| AppError::Validation("DATABASE_URL is required".to_owned()))?;
        let record_table = TableDescriptor::parse(
            lookup("AUDIT_RECORD_TABLE")
                .as_deref()
                .unwrap_or("audit_logs"),
        )?;
        let property_table = TableDescriptor::parse(
            lookup("AUDIT_PROPERTY_TABLE")
                .as_deref()
                .unwrap_or("audit_log_properties"),
        )?;
        let retention_days = match lookup("AUDIT_RETENTION_DAYS") {
            Some(value) => value.trim().parse::<u32>().map_err(|error| {
                AppError::Validation(format!(
                    "invalid AUDIT_RETENTION_DAYS value '{value}': {error}"
                ))
            })?,
            None => 90,
        };

        if retention_days == 0 {
            return Err(AppError::Validation(
                "AUDIT_RETENTION_DAYS must be greater than zero".to_owned(),
            ));
        }

        Ok(Self {
            database_url,
            record_table,
            property_table,
            retention_days,
        })
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use trailkeep_core::AppError;

    use super::{AdminConfig, Command};

    fn config(pairs: &[(&str, &str)]) -> Result<AdminConfig, AppError> {
        let values: HashMap<String, String> = pairs
            .iter()
            .map(|(name, value)| ((*name).to_owned(), (*value).to_owned()))
            .collect();
        AdminConfig::from_lookup(|name| values.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_only_the_database_is_set() {
        let config = config(&[("DATABASE_URL", "postgres://localhost/audit")])
            .unwrap_or_else(|_| unreachable!());

        assert_eq!(config.record_table.name(), "audit_logs");
        assert_eq!(config.property_table.name(), "audit_log_properties");
        assert_eq!(config.retention_days, 90);
    }

    #[test]
    fn schema_qualified_tables_and_retention_are_read() {
        let config = config(&[
            ("DATABASE_URL", "postgres://localhost/audit"),
            ("AUDIT_RECORD_TABLE", "history.changes"),
            ("AUDIT_RETENTION_DAYS", "7"),
        ])
        .unwrap_or_else(|_| unreachable!());

        assert_eq!(config.record_table.schema(), Some("history"));
        assert_eq!(config.record_table.name(), "changes");
        assert_eq!(config.retention_days, 7);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(config(&[]), Err(AppError::Validation(_))));
        assert!(matches!(
            config(&[
                ("DATABASE_URL", "postgres://localhost/audit"),
                ("AUDIT_RETENTION_DAYS", "0"),
            ]),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            config(&[
                ("DATABASE_URL", "postgres://localhost/audit"),
                ("AUDIT_RETENTION_DAYS", "soon"),
            ]),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn commands_are_parsed_by_name() {
        assert_eq!(Command::parse(Some("purge")).ok(), Some(Command::Purge));
        assert_eq!(
            Command::parse(Some("install-merge-routine")).ok(),
            Some(Command::InstallMergeRoutine)
        );
        assert!(Command::parse(Some("vacuum")).is_err());
        assert!(Command::parse(None).is_err());
    }
}
