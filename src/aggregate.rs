use crate::error::Error;
use crate::resources::ResourceSampler;
use crate::rollup::{self, CallerReference, Rollup, StatementReference};
use crate::stat::{Stat, StatKind};
use crate::store::Store;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Sample count of one aggregation bucket.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct BucketSnapshot {
    pub kind: StatKind,
    pub statement_hash: String,
    pub samples: usize,
}

/// Statement hashes and `(statement_hash, caller_hash)` pairs known to be persisted. Never shrinks.
#[derive(Debug, Default)]
pub(crate) struct DedupCache {
    statements: HashSet<String>,
    callers: HashSet<(String, String)>,
}

impl DedupCache {
    pub(crate) async fn load(store: &dyn Store, track_callers: bool) -> Self {
        let mut cache = Self::default();
        match store.statement_hashes().await {
            Ok(hashes) => cache.statements.extend(hashes),
            Err(err) => warn!(error = %err, "failed to load known statement hashes"),
        }
        if track_callers {
            match store.caller_hashes().await {
                Ok(keys) => cache.callers.extend(keys),
                Err(err) => warn!(error = %err, "failed to load known caller hashes"),
            }
        }
        cache
    }
}

/// State owned by the collector: buckets of samples since the last flush plus the dedup cache.
pub(crate) struct Collector {
    buckets: HashMap<(StatKind, String), Vec<Stat>>,
    dedup: DedupCache,
    resources: Option<ResourceSampler>,
    /// Set when a sample arrived since the last flush.
    pending: bool,
    instance_id: i64,
    track_callers: bool,
}

impl Collector {
    pub(crate) fn new(instance_id: i64, dedup: DedupCache, track_callers: bool, system_resources: bool) -> Self {
        Self {
            buckets: HashMap::new(),
            dedup,
            resources: system_resources.then(ResourceSampler::default),
            pending: false,
            instance_id,
            track_callers,
        }
    }

    pub(crate) fn add(&mut self, stat: Stat) {
        if stat.statement_hash.is_empty() {
            return;
        }
        self.buckets.entry((stat.kind, stat.statement_hash.clone())).or_default().push(stat);
        self.pending = true;
    }

    pub(crate) fn pending(&self) -> bool {
        self.pending
    }

    pub(crate) fn snapshot(&self) -> Vec<BucketSnapshot> {
        let mut buckets: Vec<_> = self
            .buckets
            .iter()
            .filter(|(_, stats)| !stats.is_empty())
            .map(|((kind, hash), stats)| BucketSnapshot { kind: *kind, statement_hash: hash.clone(), samples: stats.len() })
            .collect();
        buckets.sort();
        buckets
    }

    /// Moves everything currently buffered in `rx` into the buckets.
    pub(crate) fn drain_all(&mut self, rx: &mut mpsc::Receiver<Stat>) -> usize {
        let mut drained = 0;
        while let Ok(stat) = rx.try_recv() {
            self.add(stat);
            drained += 1;
        }
        drained
    }

    /// Moves whatever is buffered in `rx` into the buckets.
    ///
    /// Gives up with [`Error::TimedOut`] once `timeout` has passed and records are still queued;
    /// everything received up to that point stays in the buckets.
    pub(crate) fn drain(&mut self, rx: &mut mpsc::Receiver<Stat>, timeout: std::time::Duration) -> Result<usize, Error> {
        let deadline = Instant::now() + timeout;
        let mut drained = 0;
        while let Ok(stat) = rx.try_recv() {
            self.add(stat);
            drained += 1;
            if Instant::now() >= deadline && !rx.is_empty() {
                return Err(Error::TimedOut);
            }
        }
        Ok(drained)
    }

    /// Builds a rollup for every non-empty bucket, writes new reference rows and the rollups, then empties the buckets.
    ///
    /// Store failures are logged and the cycle's data is discarded. Returns the number of rollups built.
    pub(crate) async fn flush(&mut self, store: &dyn Store, now: DateTime<Utc>) -> usize {
        let resources = self.resources.as_mut().map(ResourceSampler::sample);
        let mut statements: HashMap<&str, StatementReference> = HashMap::new();
        let mut callers: HashMap<(String, String), CallerReference> = HashMap::new();
        let mut rollups: Vec<Rollup> = Vec::new();
        for ((kind, hash), stats) in &self.buckets {
            let Some((rollup, caller_refs)) = rollup::build(now, self.instance_id, *kind, hash, stats) else {
                continue;
            };
            if !self.dedup.statements.contains(hash) {
                statements.entry(hash.as_str()).or_insert_with(|| StatementReference {
                    hash: hash.clone(),
                    created_at: now,
                    statement: stats[0].statement.clone(),
                    param_count: stats[0].param_count,
                });
            }
            rollups.push(match resources {
                Some(resources) => rollup.with_resources(resources),
                None => rollup,
            });
            if self.track_callers {
                for caller in caller_refs {
                    let key = (caller.statement_hash.clone(), caller.caller_hash.clone());
                    if !self.dedup.callers.contains(&key) {
                        callers.entry(key).or_insert(caller);
                    }
                }
            }
        }
        let statements: Vec<_> = statements.into_values().collect();
        let callers: Vec<_> = callers.into_values().collect();

        if !statements.is_empty() {
            match write_statements(store, statements).await {
                Ok(written) => self.dedup.statements.extend(written),
                Err(err) => warn!(error = %err, "failed to persist statement references"),
            }
        }
        if !callers.is_empty() {
            match write_callers(store, callers).await {
                Ok(written) => self.dedup.callers.extend(written),
                Err(err) => warn!(error = %err, "failed to persist caller references"),
            }
        }
        let count = rollups.len();
        if count > 0 {
            match store.insert_history(&rollups).await {
                Ok(()) => debug!(rollups = count, instance_id = self.instance_id, "persisted statistics rollups"),
                Err(err) => warn!(error = %err, rollups = count, "failed to persist statistics rollups"),
            }
        }

        // keep each bucket's allocation for the next cycle
        for stats in self.buckets.values_mut() {
            stats.clear();
        }
        self.pending = false;
        count
    }
}

/// Inserts the references the store does not have yet, returning every hash now known to be stored.
async fn write_statements(store: &dyn Store, mut rows: Vec<StatementReference>) -> anyhow::Result<Vec<String>> {
    let candidates: Vec<String> = rows.iter().map(|r| r.hash.clone()).collect();
    let existing: HashSet<String> = store.existing_statements(&candidates).await?.into_iter().collect();
    rows.retain(|r| !existing.contains(&r.hash));
    if !rows.is_empty() {
        store.insert_statements(&rows).await?;
        debug!(statements = rows.len(), "persisted new statement references");
    }
    Ok(candidates)
}

async fn write_callers(store: &dyn Store, mut rows: Vec<CallerReference>) -> anyhow::Result<Vec<(String, String)>> {
    let candidates: Vec<(String, String)> = rows.iter().map(|r| (r.statement_hash.clone(), r.caller_hash.clone())).collect();
    let existing: HashSet<(String, String)> = store.existing_callers(&candidates).await?.into_iter().collect();
    rows.retain(|r| !existing.contains(&(r.statement_hash.clone(), r.caller_hash.clone())));
    if !rows.is_empty() {
        store.insert_callers(&rows).await?;
        debug!(callers = rows.len(), "persisted new caller references");
    }
    Ok(candidates)
}
