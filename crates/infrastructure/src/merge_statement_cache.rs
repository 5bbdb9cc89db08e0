use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;

use trailkeep_domain::AuditSchema;

use crate::merge_statement::MergeStatement;

/// Upper bound on cached statement text, in bytes.
pub const DEFAULT_STATEMENT_CAPACITY: u64 = 4_000_000;

const ROUTINE_VERIFICATION_TTL: Duration = Duration::from_secs(3600);
const ROUTINE_VERIFICATION_CAPACITY: u64 = 1_024;

/// Size-bounded cache of generated merge statements, keyed by schema fingerprint.
///
/// Also remembers, for one hour, which stored routines were verified to exist
/// in which database. Clones share the same underlying caches.
#[derive(Clone)]
pub struct MergeStatementCache {
    statements: Cache<String, Arc<MergeStatement>>,
    verified_routines: Cache<String, ()>,
}

impl MergeStatementCache {
    /// Creates a cache holding at most `max_bytes` of generated text.
    #[must_use]
    pub fn new(max_bytes: u64) -> Self {
        let statements = Cache::builder()
            .max_capacity(max_bytes)
            .weigher(|_fingerprint: &String, statement: &Arc<MergeStatement>| statement.weight())
            .build();
        let verified_routines = Cache::builder()
            .max_capacity(ROUTINE_VERIFICATION_CAPACITY)
            .time_to_live(ROUTINE_VERIFICATION_TTL)
            .build();

        Self {
            statements,
            verified_routines,
        }
    }

    /// Returns the statement for `schema`, generating it on first use.
    pub fn statement(&self, schema: &AuditSchema) -> Arc<MergeStatement> {
        let fingerprint = schema.fingerprint();
        self.statements
            .get_with(fingerprint.as_str().to_owned(), || {
                Arc::new(MergeStatement::generate(schema))
            })
    }

    /// Returns whether the routine was recently verified in `database`.
    #[must_use]
    pub fn is_routine_verified(&self, database: &str, routine_name: &str) -> bool {
        self.verified_routines
            .contains_key(&routine_key(database, routine_name))
    }

    /// Records that the routine exists in `database`.
    pub fn mark_routine_verified(&self, database: &str, routine_name: &str) {
        self.verified_routines
            .insert(routine_key(database, routine_name), ());
    }
}

impl Default for MergeStatementCache {
    fn default() -> Self {
        Self::new(DEFAULT_STATEMENT_CAPACITY)
    }
}

fn routine_key(database: &str, routine_name: &str) -> String {
    format!("{database}/{routine_name}")
}
