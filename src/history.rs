use crate::rollup::Rollup;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const DEFAULT_RANGE_DAYS: i64 = 7;

/// Selects persisted history rows. Empty `instances` matches every instance.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HistoryFilter {
    pub instances: Vec<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl HistoryFilter {
    pub fn new(instances: &[&str], from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { instances: instances.iter().map(|i| i.to_string()).collect(), from: Some(from), to: Some(to) }
    }

    /// The inclusive time range, defaulting to the last seven days.
    pub fn range(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let now = Utc::now();
        let from = self.from.unwrap_or(now - Duration::days(DEFAULT_RANGE_DAYS));
        (from, self.to.unwrap_or(now))
    }

    pub fn matches(&self, instance: &str, created_at: DateTime<Utc>) -> bool {
        let (from, to) = self.range();
        (self.instances.is_empty() || self.instances.iter().any(|i| i == instance)) && created_at >= from && created_at <= to
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub id: i64,
    pub instance_name: String,
    #[serde(flatten)]
    pub rollup: Rollup,
}

/// Per-day totals for one instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryCounts {
    pub instance_name: String,
    pub instance_id: i64,
    pub days: Vec<DaySummary>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaySummary {
    pub day: NaiveDate,
    /// Number of rollup rows, i.e. distinct statements per flush cycle.
    pub rollups: i64,
    /// Sum of executions across those rollups.
    pub executions: i64,
}

/// Groups history rows by instance and by calendar day in `tz`.
pub fn query_counts<Tz: TimeZone>(rows: &[HistoryRow], tz: &Tz) -> Vec<QueryCounts> {
    let mut grouped: BTreeMap<&str, (i64, BTreeMap<NaiveDate, DaySummary>)> = BTreeMap::new();
    for row in rows {
        let day = row.rollup.created_at.with_timezone(tz).date_naive();
        let (_, days) = grouped.entry(row.instance_name.as_str()).or_insert_with(|| (row.rollup.instance_id, BTreeMap::new()));
        let summary = days.entry(day).or_insert(DaySummary { day, rollups: 0, executions: 0 });
        summary.rollups += 1;
        summary.executions += row.rollup.count;
    }
    grouped
        .into_iter()
        .map(|(name, (instance_id, days))| QueryCounts {
            instance_name: name.to_string(),
            instance_id,
            days: days.into_values().collect(),
        })
        .collect()
}
