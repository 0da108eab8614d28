use crate::{history_rollup, init_tracing};
use chrono::{DateTime, Utc};
use sql_insights::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

const USERS: &str = "SELECT * FROM users WHERE id = $1";

struct StaticSampler(Vec<CallerFrame>);

impl CallerSampler for StaticSampler {
    fn sample(&self, max_depth: usize) -> Vec<CallerFrame> {
        self.0.iter().take(max_depth).cloned().collect()
    }
}

fn frame(function: &str, line: u32) -> CallerFrame {
    CallerFrame { file: "src/users.rs".into(), line, function: function.into() }
}

fn config() -> Config {
    Config { instance_id: "engine-tests".into(), ..Default::default() }
}

async fn start(config: Config) -> (Insights, Arc<MemoryStore>) {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    (Insights::start(config, store.clone()).await, store)
}

fn executions(store: &MemoryStore) -> i64 {
    store.rollups().iter().map(|r| r.count).sum()
}

/// Holds the first history write until released.
struct GateStore {
    inner: MemoryStore,
    gated: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl GateStore {
    fn new() -> Self {
        Self { inner: MemoryStore::new(), gated: AtomicBool::new(true), entered: Notify::new(), release: Notify::new() }
    }
}

#[async_trait::async_trait]
impl Store for GateStore {
    async fn register_instance(&self, name: &str) -> anyhow::Result<i64> {
        self.inner.register_instance(name).await
    }

    async fn statement_hashes(&self) -> anyhow::Result<Vec<String>> {
        self.inner.statement_hashes().await
    }

    async fn caller_hashes(&self) -> anyhow::Result<Vec<(String, String)>> {
        self.inner.caller_hashes().await
    }

    async fn existing_statements(&self, hashes: &[String]) -> anyhow::Result<Vec<String>> {
        self.inner.existing_statements(hashes).await
    }

    async fn existing_callers(&self, keys: &[(String, String)]) -> anyhow::Result<Vec<(String, String)>> {
        self.inner.existing_callers(keys).await
    }

    async fn insert_statements(&self, rows: &[StatementReference]) -> anyhow::Result<()> {
        self.inner.insert_statements(rows).await
    }

    async fn insert_callers(&self, rows: &[CallerReference]) -> anyhow::Result<()> {
        self.inner.insert_callers(rows).await
    }

    async fn insert_history(&self, rows: &[Rollup]) -> anyhow::Result<()> {
        if self.gated.swap(false, Ordering::AcqRel) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.insert_history(rows).await
    }

    async fn purge_history(&self, instance_id: i64, before: DateTime<Utc>) -> anyhow::Result<u64> {
        self.inner.purge_history(instance_id, before).await
    }

    async fn history(&self, filter: &HistoryFilter) -> anyhow::Result<Vec<HistoryRow>> {
        self.inner.history(filter).await
    }
}

#[tokio::test]
async fn concurrent_executions() -> anyhow::Result<()> {
    let (insights, store) = start(config()).await;
    let mut tasks = Vec::new();
    for took_ms in 1..=10 {
        let insights = insights.clone();
        tasks.push(tokio::spawn(async move { insights.record(StatKind::Query, USERS, 1, took_ms as f64, 1, false).await }));
    }
    for task in tasks {
        task.await??;
    }
    assert_eq!(insights.flush().await?, 1);

    let rollups = store.rollups();
    assert_eq!(rollups.len(), 1);
    let r = &rollups[0];
    assert_eq!((r.count, r.errors), (10, 0));
    assert_eq!((r.duration_min, r.duration_max, r.duration_avg, r.duration_median, r.duration_sum), (1.0, 10.0, 5.5, 5.5, 55.0));
    assert_eq!((r.rows_min, r.rows_max, r.rows_avg, r.rows_median, r.rows_sum), (1, 1, 1, 1, 10));
    assert_eq!(r.instance_id, insights.instance_id());
    assert_eq!(r.statement_hash, hash::hash(USERS));

    let statements = store.statements();
    assert_eq!(statements.len(), 1);
    assert_eq!((statements[0].statement.as_str(), statements[0].param_count), (USERS, 1));
    insights.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn errors_excluded_from_statistics() -> anyhow::Result<()> {
    let (insights, store) = start(config()).await;
    insights.record(StatKind::Query, USERS, 1, 2.0, 1, false).await?;
    insights.record(StatKind::Query, USERS, 1, 4.0, 3, false).await?;
    insights.record(StatKind::Query, USERS, 1, 100.0, 0, true).await?;
    insights.flush().await?;

    let r = &store.rollups()[0];
    assert_eq!((r.count, r.errors), (3, 1));
    assert_eq!((r.duration_min, r.duration_max, r.duration_avg, r.duration_median), (2.0, 4.0, 3.0, 3.0));
    assert_eq!((r.rows_min, r.rows_max, r.rows_avg, r.rows_median, r.rows_sum), (1, 3, 2, 2, 4));
    Ok(())
}

#[tokio::test]
async fn kinds_are_separate_buckets() -> anyhow::Result<()> {
    let (insights, store) = start(config()).await;
    insights.record(StatKind::Query, USERS, 1, 1.0, 1, false).await?;
    insights.record(StatKind::RawExecution, USERS, 1, 1.0, 1, false).await?;
    insights.record(StatKind::RawExecution, "DELETE FROM sessions", 0, 1.0, 7, false).await?;
    insights.drain(Duration::from_secs(1)).await?;
    let snapshot = insights.snapshot().await;
    assert_eq!(snapshot.len(), 3);
    assert_eq!(snapshot.iter().map(|b| b.samples).sum::<usize>(), 3);

    assert_eq!(insights.flush().await?, 3);
    assert!(insights.snapshot().await.is_empty());
    assert_eq!(store.statements().len(), 2);
    Ok(())
}

#[tokio::test]
async fn empty_statement_rejected() -> anyhow::Result<()> {
    let (insights, store) = start(config()).await;
    assert!(matches!(insights.record(StatKind::Query, "", 0, 1.0, 1, false).await, Err(Error::EmptyInput)));
    assert!(matches!(insights.submit(Stat::new(StatKind::Query, "", 1.0, 1, false)).await, Err(Error::EmptyInput)));
    assert_eq!(insights.flush().await?, 0);
    assert!(store.rollups().is_empty());
    Ok(())
}

#[tokio::test]
async fn stop_persists_buffered_samples() -> anyhow::Result<()> {
    let (insights, store) = start(config()).await;
    assert_eq!(insights.lifecycle(), Lifecycle::Running);
    for took_ms in [1.0, 2.0, 3.0, 4.0, 5.0] {
        insights.record(StatKind::Query, USERS, 1, took_ms, 1, false).await?;
    }
    insights.stop(Duration::from_secs(1)).await?;
    assert_eq!(insights.lifecycle(), Lifecycle::Stopped);

    let rollups = store.rollups();
    assert_eq!(rollups.len(), 1);
    assert_eq!(rollups[0].count, 5);
    assert_eq!(rollups[0].duration_median, 3.0);

    // nothing is accepted afterwards, and stopping again does nothing
    assert!(matches!(insights.record(StatKind::Query, USERS, 1, 1.0, 1, false).await, Err(Error::Stopped)));
    assert!(matches!(insights.flush().await, Err(Error::Stopped)));
    insights.stop(Duration::ZERO).await?;
    assert_eq!(store.rollups().len(), 1);
    Ok(())
}

#[tokio::test]
async fn shutdown_persists_queued_samples() -> anyhow::Result<()> {
    let config = Config { instance_id: "engine-tests".into(), ..Config::from_env() };
    let (insights, store) = start(config).await;
    for _ in 0..20 {
        insights.record(StatKind::Query, "SELECT 1", 0, 1.0, 1, false).await?;
    }
    insights.shutdown().await?;
    assert_eq!(executions(&store), 20);
    Ok(())
}

#[tokio::test]
async fn zero_stop_timeout_keeps_queued_samples() -> anyhow::Result<()> {
    let (insights, store) = start(config()).await;
    for took_ms in 0..40 {
        insights.record(StatKind::Query, USERS, 1, took_ms as f64, 1, false).await?;
    }
    let stopped = insights.stop(Duration::ZERO).await;
    assert!(matches!(stopped, Ok(()) | Err(Error::TimedOut)), "{stopped:?}");
    assert!(insights.is_stopped());
    assert_eq!(executions(&store), 40);
    Ok(())
}

#[tokio::test]
async fn full_buffer_applies_backpressure() -> anyhow::Result<()> {
    let (insights, store) = start(Config { buffer_size: 1, ..config() }).await;
    let mut tasks = Vec::new();
    for took_ms in 0..50 {
        let insights = insights.clone();
        tasks.push(tokio::spawn(async move { insights.record(StatKind::Query, USERS, 1, took_ms as f64, 1, false).await }));
    }
    for task in tasks {
        task.await??;
    }
    assert_eq!(insights.flush().await?, 1);
    assert_eq!(executions(&store), 50);
    Ok(())
}

#[tokio::test]
async fn stop_releases_blocked_producers() -> anyhow::Result<()> {
    init_tracing();
    let store = Arc::new(GateStore::new());
    let config = Config { buffer_size: 1, ..config() };
    let insights = Insights::start_with_sampler(config, store.clone(), Arc::new(NoopSampler)).await;

    // the collector is stuck writing the first record while the second fills the buffer
    insights.record(StatKind::Query, USERS, 1, 1.0, 1, false).await?;
    let flush = tokio::spawn({
        let insights = insights.clone();
        async move { insights.flush().await }
    });
    store.entered.notified().await;
    insights.record(StatKind::Query, USERS, 1, 2.0, 1, false).await?;

    let mut producers = Vec::new();
    for _ in 0..3 {
        let insights = insights.clone();
        producers.push(tokio::spawn(async move { insights.record(StatKind::Query, USERS, 1, 3.0, 1, false).await }));
    }
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    let stop = tokio::spawn({
        let insights = insights.clone();
        async move { insights.stop(Duration::from_secs(5)).await }
    });
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    store.release.notify_one();

    for producer in producers {
        let outcome = tokio::time::timeout(Duration::from_secs(5), producer).await??;
        assert!(matches!(outcome, Err(Error::Stopped)), "{outcome:?}");
    }
    stop.await??;
    assert_eq!(flush.await??, 1);
    assert!(insights.is_stopped());
    assert_eq!(executions(&store.inner), 2);
    Ok(())
}

#[tokio::test]
async fn statement_written_once() -> anyhow::Result<()> {
    let (insights, store) = start(config()).await;
    for _ in 0..3 {
        for took_ms in 0..50 {
            insights.record(StatKind::Query, USERS, 1, took_ms as f64, 1, false).await?;
        }
        insights.flush().await?;
    }
    assert_eq!(store.rollups().len(), 3);
    assert_eq!(store.statement_writes(&hash::hash(USERS)), 1);

    // a restarted engine loads what is already stored
    insights.shutdown().await?;
    let insights = Insights::start(config(), store.clone()).await;
    insights.record(StatKind::Query, USERS, 1, 1.0, 1, false).await?;
    insights.flush().await?;
    assert_eq!(store.statement_writes(&hash::hash(USERS)), 1);
    Ok(())
}

#[tokio::test]
async fn caller_written_once_per_statement() -> anyhow::Result<()> {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let sampler = Arc::new(StaticSampler(vec![frame("app::users::load", 10), frame("app::handlers::show", 42)]));
    let config = Config { caller_depth: 2, ..config() };
    let insights = Insights::start_with_sampler(config, store.clone(), sampler).await;
    for _ in 0..2 {
        insights.record(StatKind::Query, USERS, 1, 1.0, 1, false).await?;
        insights.record(StatKind::Query, USERS, 1, 2.0, 1, false).await?;
        insights.record(StatKind::Query, "SELECT count(*) FROM users", 0, 2.0, 1, false).await?;
        insights.flush().await?;
    }

    let callers = store.callers();
    assert_eq!(callers.len(), 2);
    assert_eq!(callers[0].caller_hash, callers[1].caller_hash);
    for caller in &callers {
        assert_eq!(store.caller_writes(&caller.statement_hash, &caller.caller_hash), 1);
        assert_eq!(caller.caller_hash, hash::hash_bytes(&caller.callers));
    }
    let frames: Vec<CallerFrame> = serde_json::from_slice(&callers[0].callers)?;
    assert_eq!(frames, vec![frame("app::users::load", 10), frame("app::handlers::show", 42)]);
    Ok(())
}

#[tokio::test]
async fn callers_ignored_at_depth_zero() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let sampler = Arc::new(StaticSampler(vec![frame("app::users::load", 10)]));
    let insights = Insights::start_with_sampler(config(), store.clone(), sampler).await;
    insights.submit(Stat::new(StatKind::Query, USERS, 1.0, 1, false).with_callers(vec![frame("app::users::load", 10)])).await?;
    insights.flush().await?;
    assert_eq!(store.rollups().len(), 1);
    assert!(store.callers().is_empty());
    Ok(())
}

#[tokio::test]
async fn drain() -> anyhow::Result<()> {
    let (insights, _store) = start(config()).await;
    assert_eq!(insights.drain(Duration::ZERO).await?, 0);

    for took_ms in [1.0, 2.0, 3.0] {
        insights.record(StatKind::Query, USERS, 1, took_ms, 1, false).await?;
    }
    insights.drain(Duration::from_secs(1)).await?;
    let snapshot = insights.snapshot().await;
    assert_eq!(snapshot, vec![BucketSnapshot { kind: StatKind::Query, statement_hash: hash::hash(USERS), samples: 3 }]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn flush_interval() -> anyhow::Result<()> {
    let config = Config { flush_interval: Duration::from_secs(30), ..config() };
    let (insights, store) = start(config).await;
    insights.record(StatKind::Query, USERS, 1, 1.0, 1, false).await?;
    tokio::time::sleep(Duration::from_secs(29)).await;
    assert!(store.rollups().is_empty());
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(store.rollups().len(), 1);

    // idle cycles write nothing
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(store.rollups().len(), 1);
    Ok(())
}

#[tokio::test]
async fn persistence_failures_are_swallowed() -> anyhow::Result<()> {
    let (insights, store) = start(config()).await;
    store.set_failing(true);
    insights.record(StatKind::Query, USERS, 1, 1.0, 1, false).await?;
    assert_eq!(insights.flush().await?, 1);
    assert!(store.rollups().is_empty());

    // the failed cycle is gone, the statement is retried
    store.set_failing(false);
    insights.record(StatKind::Query, USERS, 1, 2.0, 1, false).await?;
    insights.flush().await?;
    let rollups = store.rollups();
    assert_eq!(rollups.len(), 1);
    assert_eq!((rollups[0].count, rollups[0].duration_sum), (1, 2.0));
    assert_eq!(store.statements().len(), 1);

    // reads are the only failures callers see
    store.set_failing(true);
    assert!(matches!(insights.history(&HistoryFilter::default()).await, Err(Error::Persistence(_))));
    Ok(())
}

#[tokio::test]
async fn start_without_store() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.set_failing(true);
    let insights = Insights::start(config(), store.clone()).await;
    assert_eq!(insights.instance_id(), 0);
    assert!(insights.is_running());
    insights.record(StatKind::Query, USERS, 1, 1.0, 1, false).await?;
    insights.stop(Duration::from_secs(1)).await?;
    assert!(insights.is_stopped());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn purge_expired_history() -> anyhow::Result<()> {
    let config = Config { retention: Duration::from_secs(2 * 3600), ..config() };
    let (insights, store) = start(config).await;
    let id = insights.instance_id();
    let now = Utc::now();
    let old = history_rollup(id, now - chrono::Duration::hours(3), 1);
    let other_instance = history_rollup(id + 1, now - chrono::Duration::hours(3), 1);
    let recent = history_rollup(id, now, 1);
    store.insert_history(&[old, other_instance, recent.clone()]).await?;

    tokio::time::sleep(Duration::from_secs(3600 + 1)).await;
    let rollups = store.rollups();
    assert_eq!(rollups.len(), 2);
    assert!(rollups.contains(&recent));
    assert!(rollups.iter().any(|r| r.instance_id == id + 1));
    Ok(())
}

#[tokio::test]
async fn no_purge_without_retention() -> anyhow::Result<()> {
    let (insights, store) = start(config()).await;
    let old = history_rollup(insights.instance_id(), Utc::now() - chrono::Duration::days(365), 1);
    store.insert_history(&[old]).await?;
    insights.shutdown().await?;
    assert_eq!(store.rollups().len(), 1);
    Ok(())
}

#[tokio::test]
async fn read_side() -> anyhow::Result<()> {
    let (insights, _store) = start(config()).await;
    insights.record(StatKind::Query, USERS, 1, 1.0, 1, false).await?;
    insights.record(StatKind::Query, USERS, 1, 1.0, 1, false).await?;
    insights.record(StatKind::RawExecution, "VACUUM", 0, 1.0, 0, false).await?;
    insights.flush().await?;

    let rows = insights.history(&HistoryFilter::default()).await?;
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.instance_name == "engine-tests"));
    assert!(insights.history(&HistoryFilter { instances: vec!["elsewhere".into()], ..Default::default() }).await?.is_empty());

    let counts = insights.query_counts(&HistoryFilter::default(), &Utc).await?;
    assert_eq!(counts.len(), 1);
    assert_eq!(counts[0].instance_name, "engine-tests");
    assert_eq!(counts[0].days.iter().map(|d| (d.rollups, d.executions)).fold((0, 0), |a, d| (a.0 + d.0, a.1 + d.1)), (2, 3));
    Ok(())
}
