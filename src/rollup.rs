use crate::resources::SystemResources;
use crate::stat::{Stat, StatKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Aggregated statistics for one statement over one flush cycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rollup {
    pub instance_id: i64,
    /// The flush instant, not a sample instant.
    pub created_at: DateTime<Utc>,
    pub kind: StatKind,
    pub statement_hash: String,
    pub count: i64,
    pub errors: i64,
    /// CPU usage as a fraction, shared by every rollup of a cycle.
    pub cpu: f64,
    /// Memory usage as a fraction, shared by every rollup of a cycle.
    pub mem: f64,
    pub rows_min: i64,
    pub rows_max: i64,
    pub rows_avg: i64,
    pub rows_sum: i64,
    pub rows_median: i64,
    pub duration_min: f64,
    pub duration_max: f64,
    pub duration_avg: f64,
    pub duration_sum: f64,
    pub duration_median: f64,
}

impl Rollup {
    pub fn with_resources(mut self, resources: SystemResources) -> Self {
        self.cpu = resources.cpu;
        self.mem = resources.mem;
        self
    }
}

/// First-seen record of a statement text.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementReference {
    pub hash: String,
    pub created_at: DateTime<Utc>,
    pub statement: String,
    pub param_count: i32,
}

/// First-seen caller chain of a statement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerReference {
    pub caller_hash: String,
    pub statement_hash: String,
    pub created_at: DateTime<Utc>,
    /// JSON array of [`CallerFrame`](crate::CallerFrame).
    pub callers: Vec<u8>,
}

/// Builds the rollup for one bucket, plus one caller reference per distinct caller hash seen in it.
///
/// Errored samples only count towards `count` and `errors`; when every sample errored the
/// duration and row statistics are all zero.
pub fn build(
    now: DateTime<Utc>,
    instance_id: i64,
    kind: StatKind,
    statement_hash: &str,
    stats: &[Stat],
) -> Option<(Rollup, Vec<CallerReference>)> {
    if stats.is_empty() {
        return None;
    }
    let mut durations = Vec::with_capacity(stats.len());
    let mut rows = Vec::with_capacity(stats.len());
    let mut errors = 0;
    let mut callers = Vec::new();
    let mut seen = HashSet::new();
    for stat in stats {
        if stat.error {
            errors += 1;
        } else {
            durations.push(stat.took_ms);
            rows.push(stat.rows);
        }
        if let Some(caller_hash) = &stat.caller_hash {
            if seen.insert(caller_hash.as_str()) {
                callers.push(CallerReference {
                    caller_hash: caller_hash.clone(),
                    statement_hash: statement_hash.to_string(),
                    created_at: now,
                    callers: stat.caller_json.clone(),
                });
            }
        }
    }

    let mut rollup = Rollup {
        instance_id,
        created_at: now,
        kind,
        statement_hash: statement_hash.to_string(),
        count: stats.len() as i64,
        errors,
        cpu: 0.0,
        mem: 0.0,
        rows_min: rows.iter().copied().min().unwrap_or(0),
        rows_max: rows.iter().copied().max().unwrap_or(0),
        rows_avg: 0,
        rows_sum: rows.iter().sum(),
        rows_median: 0,
        duration_min: durations.iter().copied().reduce(f64::min).unwrap_or(0.0),
        duration_max: durations.iter().copied().reduce(f64::max).unwrap_or(0.0),
        duration_avg: 0.0,
        duration_sum: durations.iter().sum(),
        duration_median: 0.0,
    };
    let valid = durations.len();
    if valid > 0 {
        rollup.duration_avg = rollup.duration_sum / valid as f64;
        rollup.rows_avg = rollup.rows_sum / valid as i64;
        rollup.duration_median = median_f64(&mut durations);
        rollup.rows_median = median_i64(&mut rows);
    }
    Some((rollup, callers))
}

/// Median of `values`, sorting them in place. Zero for an empty slice.
pub fn median_f64(values: &mut [f64]) -> f64 {
    values.sort_by(f64::total_cmp);
    let len = values.len();
    match len {
        0 => 0.0,
        _ if len % 2 == 0 => (values[len / 2 - 1] + values[len / 2]) / 2.0,
        _ => values[len / 2],
    }
}

/// Median of `values`, sorting them in place. The even case truncates like the rest of the row statistics.
pub fn median_i64(values: &mut [i64]) -> i64 {
    values.sort_unstable();
    let len = values.len();
    match len {
        0 => 0,
        _ if len % 2 == 0 => (values[len / 2 - 1] + values[len / 2]) / 2,
        _ => values[len / 2],
    }
}
