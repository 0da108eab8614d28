//! Per-statement execution statistics for SQL workloads.
//!
//! Hooks around query execution submit one [`Stat`] per execution to an [`Insights`] engine. The engine
//! buckets them by statement, and every flush interval persists one [`Rollup`] per statement with
//! count, error count, and min/max/avg/sum/median of duration and rows. Statement texts and caller
//! chains are written once per distinct hash.
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! use std::sync::Arc;
//! use sql_insights::{Config, Insights, Instrumentation, PgStore, StatKind};
//!
//! let store = Arc::new(PgStore::connect("postgresql://localhost:5432/postgres")?);
//! let insights = Insights::start(Config { caller_depth: 5, ..Config::from_env() }, store).await;
//! let hooks = Instrumentation::new(insights);
//! let rows = hooks.observe(StatKind::Query, "SELECT 1", 0, |rows: &u64| *rows as i64, async { Ok::<_, anyhow::Error>(1) }).await?;
//! hooks.unregister().await;
//! # Ok(())
//! # }
//! ```

mod aggregate;
pub mod callers;
pub mod config;
mod engine;
mod error;
pub mod hash;
pub mod history;
pub mod hooks;
pub mod memory;
pub mod postgres;
pub mod resources;
pub mod rollup;
pub mod stat;
pub mod store;

pub use aggregate::BucketSnapshot;
pub use callers::{BacktraceSampler, CallerSampler, NoopSampler};
pub use config::Config;
pub use engine::{Insights, Lifecycle};
pub use error::Error;
pub use history::{DaySummary, HistoryFilter, HistoryRow, QueryCounts};
pub use hooks::{ExecutionContext, Instrumentation};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use resources::SystemResources;
pub use rollup::{CallerReference, Rollup, StatementReference};
pub use stat::{CallerFrame, Stat, StatKind};
pub use store::Store;
