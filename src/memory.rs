use crate::history::{HistoryFilter, HistoryRow};
use crate::rollup::{CallerReference, Rollup, StatementReference};
use crate::store::Store;
use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
struct Tables {
    instances: Vec<String>,
    statements: BTreeMap<String, StatementReference>,
    callers: BTreeMap<(String, String), CallerReference>,
    history: Vec<HistoryRow>,
    next_history_id: i64,
    statement_writes: HashMap<String, usize>,
    caller_writes: HashMap<(String, String), usize>,
}

/// A [`Store`] kept in process memory.
///
/// Useful without a database and in tests: it counts how often each reference row was written
/// and can be told to fail every call.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call return an error until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn statements(&self) -> Vec<StatementReference> {
        self.tables().statements.values().cloned().collect()
    }

    pub fn callers(&self) -> Vec<CallerReference> {
        self.tables().callers.values().cloned().collect()
    }

    pub fn rollups(&self) -> Vec<Rollup> {
        self.tables().history.iter().map(|r| r.rollup.clone()).collect()
    }

    /// How many times a statement reference was submitted for insert.
    pub fn statement_writes(&self, hash: &str) -> usize {
        self.tables().statement_writes.get(hash).copied().unwrap_or(0)
    }

    pub fn caller_writes(&self, statement_hash: &str, caller_hash: &str) -> usize {
        self.tables().caller_writes.get(&(statement_hash.to_string(), caller_hash.to_string())).copied().unwrap_or(0)
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        // a panicking test thread must not take the other assertions down with it
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("memory store is failing");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn register_instance(&self, name: &str) -> Result<i64> {
        self.check()?;
        let mut tables = self.tables();
        let index = match tables.instances.iter().position(|i| i == name) {
            Some(index) => index,
            None => {
                tables.instances.push(name.to_string());
                tables.instances.len() - 1
            }
        };
        Ok(index as i64 + 1)
    }

    async fn statement_hashes(&self) -> Result<Vec<String>> {
        self.check()?;
        Ok(self.tables().statements.keys().cloned().collect())
    }

    async fn caller_hashes(&self) -> Result<Vec<(String, String)>> {
        self.check()?;
        Ok(self.tables().callers.keys().cloned().collect())
    }

    async fn existing_statements(&self, hashes: &[String]) -> Result<Vec<String>> {
        self.check()?;
        let tables = self.tables();
        Ok(hashes.iter().filter(|h| tables.statements.contains_key(*h)).cloned().collect())
    }

    async fn existing_callers(&self, keys: &[(String, String)]) -> Result<Vec<(String, String)>> {
        self.check()?;
        let tables = self.tables();
        Ok(keys.iter().filter(|k| tables.callers.contains_key(*k)).cloned().collect())
    }

    async fn insert_statements(&self, rows: &[StatementReference]) -> Result<()> {
        self.check()?;
        let mut tables = self.tables();
        for row in rows {
            *tables.statement_writes.entry(row.hash.clone()).or_default() += 1;
            tables.statements.entry(row.hash.clone()).or_insert_with(|| row.clone());
        }
        Ok(())
    }

    async fn insert_callers(&self, rows: &[CallerReference]) -> Result<()> {
        self.check()?;
        let mut tables = self.tables();
        for row in rows {
            let key = (row.statement_hash.clone(), row.caller_hash.clone());
            *tables.caller_writes.entry(key.clone()).or_default() += 1;
            tables.callers.entry(key).or_insert_with(|| row.clone());
        }
        Ok(())
    }

    async fn insert_history(&self, rows: &[Rollup]) -> Result<()> {
        self.check()?;
        let mut tables = self.tables();
        for rollup in rows {
            tables.next_history_id += 1;
            let id = tables.next_history_id;
            let index = usize::try_from(rollup.instance_id - 1).ok();
            let instance_name = index.and_then(|i| tables.instances.get(i)).cloned().unwrap_or_default();
            tables.history.push(HistoryRow { id, instance_name, rollup: rollup.clone() });
        }
        Ok(())
    }

    async fn purge_history(&self, instance_id: i64, before: DateTime<Utc>) -> Result<u64> {
        self.check()?;
        let mut tables = self.tables();
        let len = tables.history.len();
        tables.history.retain(|r| r.rollup.instance_id != instance_id || r.rollup.created_at >= before);
        Ok((len - tables.history.len()) as u64)
    }

    async fn history(&self, filter: &HistoryFilter) -> Result<Vec<HistoryRow>> {
        self.check()?;
        let mut rows: Vec<_> =
            self.tables().history.iter().filter(|r| filter.matches(&r.instance_name, r.rollup.created_at)).cloned().collect();
        rows.sort_by_key(|r| (r.rollup.created_at, r.id));
        Ok(rows)
    }
}
