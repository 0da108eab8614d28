use crate::aggregate::{BucketSnapshot, Collector, DedupCache};
use crate::callers::{BacktraceSampler, CallerSampler};
use crate::config::Config;
use crate::error::Error;
use crate::history::{self, HistoryFilter, HistoryRow, QueryCounts};
use crate::stat::{Stat, StatKind};
use crate::store::Store;
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Lifecycle of an [`Insights`] engine. Moves forward only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    Created = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Lifecycle::Created,
            1 => Lifecycle::Running,
            2 => Lifecycle::Stopping,
            _ => Lifecycle::Stopped,
        }
    }
}

enum Command {
    Drain { timeout: Duration, reply: oneshot::Sender<Result<usize, Error>> },
    Flush(oneshot::Sender<usize>),
    Stop(oneshot::Sender<()>),
}

struct Shared {
    config: Config,
    instance_id: i64,
    store: Arc<dyn Store>,
    collector: Mutex<Collector>,
    lifecycle: AtomicU8,
}

impl Shared {
    fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    fn set_lifecycle(&self, lifecycle: Lifecycle) {
        self.lifecycle.store(lifecycle as u8, Ordering::Release);
    }

    /// Issues a background delete of expired history when retention is on and a full retention
    /// period has passed since the previous purge. Returns the new last-purge instant.
    fn purge(&self, last: Option<Instant>) -> Option<Instant> {
        let retention = self.config.retention;
        if retention.is_zero() || last.is_some_and(|last| last.elapsed() < retention) {
            return last;
        }
        let Some(before) = chrono::Duration::from_std(retention).ok().and_then(|r| Utc::now().checked_sub_signed(r)) else {
            warn!(?retention, "retention out of range, not purging");
            return last;
        };
        let store = self.store.clone();
        let instance_id = self.instance_id;
        tokio::spawn(async move {
            match store.purge_history(instance_id, before).await {
                Ok(deleted) => debug!(deleted, instance_id, %before, "purged expired statistics history"),
                Err(err) => warn!(error = %err, instance_id, "failed to purge expired statistics history"),
            }
        });
        Some(Instant::now())
    }
}

/// Collects per-statement execution statistics and periodically persists rollups of them.
///
/// Cloning is cheap; every clone feeds the same engine. A single background task owns the
/// aggregation state: it appends incoming records, flushes rollups every
/// [`Config::flush_interval`], purges expired history, and exits on [`stop`](Self::stop).
#[derive(Clone)]
pub struct Insights {
    shared: Arc<Shared>,
    sampler: Arc<dyn CallerSampler>,
    tx: mpsc::Sender<Stat>,
    control: mpsc::Sender<Command>,
    task: Arc<std::sync::Mutex<Option<JoinHandle<mpsc::Receiver<Stat>>>>>,
}

impl Insights {
    /// Starts an engine that captures callers with a [`BacktraceSampler`].
    pub async fn start(config: Config, store: Arc<dyn Store>) -> Self {
        Self::start_with_sampler(config, store, Arc::new(BacktraceSampler::default())).await
    }

    /// Prepares the store, loads the hashes it already knows and spawns the collector task.
    ///
    /// Store failures are logged and the engine starts anyway: with instance id 0 when the
    /// instance could not be registered, and with an empty dedup cache when it could not be loaded.
    pub async fn start_with_sampler(mut config: Config, store: Arc<dyn Store>, sampler: Arc<dyn CallerSampler>) -> Self {
        config.apply_defaults();
        if !config.skip_migration {
            if let Err(err) = store.migrate().await {
                warn!(error = %err, "failed to migrate statistics tables");
            }
        }
        let instance_id = match store.register_instance(&config.instance_id).await {
            Ok(id) => id,
            Err(err) => {
                warn!(error = %err, instance = %config.instance_id, "failed to register instance");
                0
            }
        };
        let dedup = DedupCache::load(store.as_ref(), config.track_callers()).await;
        let collector = Collector::new(instance_id, dedup, config.track_callers(), config.system_resources);
        let (tx, rx) = mpsc::channel(config.buffer_size);
        let (control, commands) = mpsc::channel(4);
        let shared = Arc::new(Shared {
            config,
            instance_id,
            store,
            collector: Mutex::new(collector),
            lifecycle: AtomicU8::new(Lifecycle::Created as u8),
        });
        let task = tokio::spawn(collect(shared.clone(), rx, commands));
        shared.set_lifecycle(Lifecycle::Running);
        info!(instance = %shared.config.instance_id, instance_id, "sql insights started");
        Self { shared, sampler, tx, control, task: Arc::new(std::sync::Mutex::new(Some(task))) }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn instance_id(&self) -> i64 {
        self.shared.instance_id
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.lifecycle()
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle() == Lifecycle::Running
    }

    pub fn is_stopped(&self) -> bool {
        self.lifecycle() == Lifecycle::Stopped
    }

    /// Captures callers for a finished execution and submits it.
    pub async fn record(&self, kind: StatKind, statement: &str, param_count: usize, took_ms: f64, rows: i64, error: bool) -> Result<(), Error> {
        if statement.is_empty() {
            return Err(Error::EmptyInput);
        }
        let callers = self.sampler.sample(self.shared.config.caller_depth);
        let stat = Stat::new(kind, statement, took_ms, rows, error).with_params(param_count).with_callers(callers);
        self.submit(stat).await
    }

    /// Hashes `stat` and queues it for the collector, waiting while the channel is full.
    pub async fn submit(&self, mut stat: Stat) -> Result<(), Error> {
        stat.seal(self.shared.config.track_callers())?;
        if !self.is_running() {
            return Err(Error::Stopped);
        }
        self.tx.send(stat).await.map_err(|_| Error::Stopped)
    }

    /// Has the collector move everything queued so far into the aggregation table.
    pub async fn drain(&self, timeout: Duration) -> Result<usize, Error> {
        let (reply, response) = oneshot::channel();
        self.control.send(Command::Drain { timeout, reply }).await.map_err(|_| Error::Stopped)?;
        response.await.map_err(|_| Error::Stopped)?
    }

    /// Runs a rollup and persist cycle now over everything submitted so far, returning the number of rollups built.
    pub async fn flush(&self) -> Result<usize, Error> {
        let (reply, response) = oneshot::channel();
        self.control.send(Command::Flush(reply)).await.map_err(|_| Error::Stopped)?;
        response.await.map_err(|_| Error::Stopped)
    }

    /// Sample counts of the buckets that will be rolled up at the next flush.
    pub async fn snapshot(&self) -> Vec<BucketSnapshot> {
        self.shared.collector.lock().await.snapshot()
    }

    /// Stops the collector, persists a final rollup of everything still queued, and marks the engine stopped.
    ///
    /// The ingestion channel is closed first, so producers still waiting on a full channel get
    /// [`Error::Stopped`] and every record already queued ends up in the final rollup. `timeout` bounds
    /// how long the collector may take to finish its current step and hand over; when it takes longer
    /// the stop still completes and then returns [`Error::TimedOut`].
    /// Calling this on a stopping or stopped engine does nothing.
    pub async fn stop(&self, timeout: Duration) -> Result<(), Error> {
        let swapped = self.shared.lifecycle.compare_exchange(
            Lifecycle::Running as u8,
            Lifecycle::Stopping as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if swapped.is_err() {
            return Ok(());
        }
        let handoff = self.handoff();
        futures::pin_mut!(handoff);
        let (rx, result) = match time::timeout(timeout, handoff.as_mut()).await {
            Ok(rx) => (rx, Ok(())),
            Err(_) => {
                warn!(?timeout, "statistics collector slow to stop");
                (handoff.await, Err(Error::TimedOut))
            }
        };

        let mut collector = self.shared.collector.lock().await;
        if let Some(mut rx) = rx {
            rx.close();
            let drained = collector.drain_all(&mut rx);
            debug!(drained, "drained queued statistics while stopping");
        }
        let rollups = collector.flush(self.shared.store.as_ref(), Utc::now()).await;
        self.shared.set_lifecycle(Lifecycle::Stopped);
        info!(rollups, instance = %self.shared.config.instance_id, "sql insights stopped");
        result
    }

    /// Tells the collector task to exit and takes back its ingestion receiver.
    async fn handoff(&self) -> Option<mpsc::Receiver<Stat>> {
        let (ack, acked) = oneshot::channel();
        if self.control.send(Command::Stop(ack)).await.is_ok() {
            let _ = acked.await;
        }
        let task = self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take()?;
        match task.await {
            Ok(rx) => Some(rx),
            Err(err) => {
                warn!(error = %err, "statistics collector task failed");
                None
            }
        }
    }

    /// [`stop`](Self::stop) with [`Config::stop_timeout`].
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.stop(self.shared.config.stop_timeout).await
    }

    pub async fn history(&self, filter: &HistoryFilter) -> Result<Vec<HistoryRow>, Error> {
        Ok(self.shared.store.history(filter).await?)
    }

    /// Executions per instance per calendar day in `tz`.
    pub async fn query_counts<Tz: TimeZone>(&self, filter: &HistoryFilter, tz: &Tz) -> Result<Vec<QueryCounts>, Error> {
        let rows = self.shared.store.history(filter).await?;
        Ok(history::query_counts(&rows, tz))
    }
}

/// The collector task. Hands the ingestion receiver back on exit so a stop can drain it.
async fn collect(shared: Arc<Shared>, mut rx: mpsc::Receiver<Stat>, mut commands: mpsc::Receiver<Command>) -> mpsc::Receiver<Stat> {
    let every = shared.config.flush_interval;
    let mut flush = time::interval_at(Instant::now() + every, every);
    flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let every = shared.config.purge_interval();
    let mut purge = time::interval_at(Instant::now() + every, every);
    purge.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_purge = None;
    loop {
        tokio::select! {
            // control commands win over queued records
            biased;
            command = commands.recv() => match command {
                Some(Command::Drain { timeout, reply }) => {
                    let drained = shared.collector.lock().await.drain(&mut rx, timeout);
                    let _ = reply.send(drained);
                }
                Some(Command::Flush(reply)) => {
                    let mut collector = shared.collector.lock().await;
                    collector.drain_all(&mut rx);
                    let rollups = collector.flush(shared.store.as_ref(), Utc::now()).await;
                    let _ = reply.send(rollups);
                }
                Some(Command::Stop(ack)) => {
                    let _ = ack.send(());
                    break;
                }
                // every handle is gone
                None => break,
            },
            Some(stat) = rx.recv() => shared.collector.lock().await.add(stat),
            _ = flush.tick() => {
                let mut collector = shared.collector.lock().await;
                if collector.pending() {
                    collector.flush(shared.store.as_ref(), Utc::now()).await;
                }
            }
            _ = purge.tick() => last_purge = shared.purge(last_purge),
        }
    }
    rx
}
