use crate::history::{HistoryFilter, HistoryRow};
use crate::rollup::{CallerReference, Rollup, StatementReference};
use anyhow::Result;
use chrono::{DateTime, Utc};

/// Where rollups and reference rows end up.
///
/// Caller keys are `(statement_hash, caller_hash)` pairs throughout.
#[async_trait::async_trait]
pub trait Store: Send + Sync + 'static {
    /// Creates the tables if they are missing.
    async fn migrate(&self) -> Result<()> {
        Ok(())
    }

    /// Returns the surrogate id for an instance label, creating it on first use.
    async fn register_instance(&self, name: &str) -> Result<i64>;

    async fn statement_hashes(&self) -> Result<Vec<String>>;

    async fn caller_hashes(&self) -> Result<Vec<(String, String)>>;

    /// Returns the subset of `hashes` already stored.
    async fn existing_statements(&self, hashes: &[String]) -> Result<Vec<String>>;

    /// Returns the subset of `keys` already stored.
    async fn existing_callers(&self, keys: &[(String, String)]) -> Result<Vec<(String, String)>>;

    async fn insert_statements(&self, rows: &[StatementReference]) -> Result<()>;

    async fn insert_callers(&self, rows: &[CallerReference]) -> Result<()>;

    async fn insert_history(&self, rows: &[Rollup]) -> Result<()>;

    /// Deletes history rows of `instance_id` created before `before`, returning how many were removed.
    async fn purge_history(&self, instance_id: i64, before: DateTime<Utc>) -> Result<u64>;

    /// History rows matching `filter`, oldest first.
    async fn history(&self, filter: &HistoryFilter) -> Result<Vec<HistoryRow>>;
}
