use crate::engine::Insights;
use crate::error::Error;
use crate::stat::StatKind;
use dashmap::DashMap;
use std::future::Future;
use std::time::Instant;
use tracing::{debug, warn};

/// What a database layer knows about one execution when it calls the hooks.
#[derive(Clone, Copy, Debug)]
pub struct ExecutionContext<'a> {
    /// Unique per in-flight execution; pairs `before_execute` with `after_execute`.
    pub token: u64,
    pub kind: StatKind,
    pub statement: &'a str,
    pub param_count: usize,
    /// Rows affected or returned. Only read by `after_execute`.
    pub rows: i64,
    pub error: bool,
    /// Simulated executions are never recorded.
    pub dry_run: bool,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(token: u64, kind: StatKind, statement: &'a str) -> Self {
        Self { token, kind, statement, param_count: 0, rows: 0, error: false, dry_run: false }
    }
}

/// Before/after callbacks for a database access layer, feeding an [`Insights`] engine.
pub struct Instrumentation {
    insights: Insights,
    started: DashMap<(StatKind, u64), Instant>,
}

impl Instrumentation {
    pub fn new(insights: Insights) -> Self {
        Self { insights, started: DashMap::new() }
    }

    pub fn insights(&self) -> &Insights {
        &self.insights
    }

    /// Executions started but not finished yet.
    pub fn in_flight(&self) -> usize {
        self.started.len()
    }

    /// Remembers when the execution under `ctx.token` started.
    ///
    /// The entry lives until the matching [`after_execute`](Self::after_execute) or
    /// [`cancel_execute`](Self::cancel_execute); a layer that can abandon an execution without
    /// reaching its after hook must cancel it, or the entry stays until [`unregister`](Self::unregister).
    pub fn before_execute(&self, ctx: &ExecutionContext<'_>) {
        if ctx.dry_run || ctx.statement.is_empty() {
            return;
        }
        self.started.insert((ctx.kind, ctx.token), Instant::now());
    }

    /// Records the execution started under the same token. Ignores contexts `before_execute` never saw.
    pub async fn after_execute(&self, ctx: &ExecutionContext<'_>) {
        if ctx.dry_run {
            return;
        }
        let Some((_, started)) = self.started.remove(&(ctx.kind, ctx.token)) else {
            return;
        };
        let took_ms = started.elapsed().as_micros() as f64 / 1000.0;
        if let Err(err) = self.insights.record(ctx.kind, ctx.statement, ctx.param_count, took_ms, ctx.rows, ctx.error).await {
            debug!(error = %err, token = ctx.token, "statistic not recorded");
        }
    }

    /// Forgets an execution that will never finish, e.g. because its future was dropped. Nothing is recorded.
    pub fn cancel_execute(&self, ctx: &ExecutionContext<'_>) {
        self.started.remove(&(ctx.kind, ctx.token));
    }

    /// Awaits `execution` and records how long it took. The output is returned as is.
    ///
    /// `rows_of` extracts the row count from a successful output; failed executions record zero rows.
    pub async fn observe<T, E, F>(&self, kind: StatKind, statement: &str, param_count: usize, rows_of: impl FnOnce(&T) -> i64, execution: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let result = execution.await;
        let took_ms = started.elapsed().as_micros() as f64 / 1000.0;
        let (rows, error) = match &result {
            Ok(output) => (rows_of(output), false),
            Err(_) => (0, true),
        };
        if let Err(err) = self.insights.record(kind, statement, param_count, took_ms, rows, error).await {
            debug!(error = %err, "statistic not recorded");
        }
        result
    }

    /// Stops the engine with its configured stop timeout.
    pub async fn unregister(&self) {
        self.started.clear();
        match self.insights.shutdown().await {
            Ok(()) => {}
            Err(Error::TimedOut) => warn!(timeout = ?self.insights.config().stop_timeout, "statistics collector exceeded stop timeout"),
            Err(err) => warn!(error = %err, "failed to stop sql insights"),
        }
    }
}
