use crate::history::{HistoryFilter, HistoryRow};
use crate::rollup::{CallerReference, Rollup, StatementReference};
use crate::store::Store;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::str::FromStr;
use tokio_postgres::types::Type;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS sql_insights_statements (
        id text PRIMARY KEY,
        created_at timestamptz NOT NULL,
        statement_text text NOT NULL,
        param_count integer NOT NULL
    );
    CREATE TABLE IF NOT EXISTS sql_insights_instances (
        id bigserial PRIMARY KEY,
        instance_name text NOT NULL UNIQUE
    );
    CREATE TABLE IF NOT EXISTS sql_insights_history (
        id bigserial PRIMARY KEY,
        instance_id bigint NOT NULL,
        created_at timestamptz NOT NULL,
        statement_hash text NOT NULL,
        kind text NOT NULL,
        error_count bigint NOT NULL,
        cpu_pct double precision NOT NULL,
        mem_pct double precision NOT NULL,
        count bigint NOT NULL,
        rows_min bigint NOT NULL,
        rows_max bigint NOT NULL,
        rows_avg bigint NOT NULL,
        rows_sum bigint NOT NULL,
        rows_median bigint NOT NULL,
        duration_min double precision NOT NULL,
        duration_max double precision NOT NULL,
        duration_avg double precision NOT NULL,
        duration_sum double precision NOT NULL,
        duration_median double precision NOT NULL
    );
    CREATE INDEX IF NOT EXISTS sql_insights_history_instance_created_at ON sql_insights_history USING btree (instance_id, created_at);
    CREATE TABLE IF NOT EXISTS sql_insights_callers (
        caller_hash text NOT NULL,
        statement_hash text NOT NULL,
        created_at timestamptz NOT NULL,
        callers bytea NOT NULL,
        PRIMARY KEY (caller_hash, statement_hash)
    );
";

const HISTORY_FIELDS: &str = "instance_id, created_at, statement_hash, kind, error_count, cpu_pct, mem_pct, count, \
    rows_min, rows_max, rows_avg, rows_sum, rows_median, \
    duration_min, duration_max, duration_avg, duration_sum, duration_median";

const HISTORY_TYPES: &[Type] = &[
    Type::INT8,
    Type::TIMESTAMPTZ,
    Type::TEXT,
    Type::TEXT,
    Type::INT8,
    Type::FLOAT8,
    Type::FLOAT8,
    Type::INT8,
    Type::INT8,
    Type::INT8,
    Type::INT8,
    Type::INT8,
    Type::INT8,
    Type::FLOAT8,
    Type::FLOAT8,
    Type::FLOAT8,
    Type::FLOAT8,
    Type::FLOAT8,
];

/// [`Store`] backed by Postgres through a `deadpool-postgres` pool.
#[derive(Clone)]
pub struct PgStore {
    pool: deadpool_postgres::Pool,
}

impl PgStore {
    pub fn new(pool: deadpool_postgres::Pool) -> Self {
        Self { pool }
    }

    /// Builds a pool for a `postgresql://` URL. Connections are opened lazily.
    pub fn connect(url: &str) -> Result<Self> {
        let pg_config = tokio_postgres::Config::from_str(url)?;
        let mgr_config = deadpool_postgres::ManagerConfig { recycling_method: deadpool_postgres::RecyclingMethod::Fast };
        let mgr = deadpool_postgres::Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);
        Ok(Self::new(deadpool_postgres::Pool::builder(mgr).build()?))
    }

    pub fn pool(&self) -> &deadpool_postgres::Pool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Store for PgStore {
    async fn migrate(&self) -> Result<()> {
        self.pool.get().await?.batch_execute(SCHEMA).await?;
        Ok(())
    }

    async fn register_instance(&self, name: &str) -> Result<i64> {
        let db = self.pool.get().await?;
        let sql = "INSERT INTO sql_insights_instances (instance_name) VALUES ($1)
            ON CONFLICT (instance_name) DO UPDATE SET instance_name = EXCLUDED.instance_name RETURNING id";
        Ok(db.query_one(&db.prepare_cached(sql).await?, &[&name]).await?.get(0))
    }

    async fn statement_hashes(&self) -> Result<Vec<String>> {
        let db = self.pool.get().await?;
        let rows = db.query(&db.prepare_cached("SELECT id FROM sql_insights_statements").await?, &[]).await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn caller_hashes(&self) -> Result<Vec<(String, String)>> {
        let db = self.pool.get().await?;
        let rows = db.query(&db.prepare_cached("SELECT statement_hash, caller_hash FROM sql_insights_callers").await?, &[]).await?;
        Ok(rows.iter().map(|r| (r.get(0), r.get(1))).collect())
    }

    async fn existing_statements(&self, hashes: &[String]) -> Result<Vec<String>> {
        let db = self.pool.get().await?;
        let sql = "SELECT id FROM sql_insights_statements WHERE id = ANY($1)";
        let rows = db.query(&db.prepare_cached(sql).await?, &[&hashes]).await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn existing_callers(&self, keys: &[(String, String)]) -> Result<Vec<(String, String)>> {
        let db = self.pool.get().await?;
        let (statement_hashes, caller_hashes): (Vec<&str>, Vec<&str>) = keys.iter().map(|(s, c)| (s.as_str(), c.as_str())).unzip();
        let sql = "SELECT statement_hash, caller_hash FROM sql_insights_callers
            WHERE (statement_hash, caller_hash) IN (SELECT * FROM UNNEST($1::text[], $2::text[]))";
        let rows = db.query(&db.prepare_cached(sql).await?, &[&statement_hashes, &caller_hashes]).await?;
        Ok(rows.iter().map(|r| (r.get(0), r.get(1))).collect())
    }

    async fn insert_statements(&self, rows: &[StatementReference]) -> Result<()> {
        let db = self.pool.get().await?;
        let hashes: Vec<&str> = rows.iter().map(|r| r.hash.as_str()).collect();
        let created_at: Vec<DateTime<Utc>> = rows.iter().map(|r| r.created_at).collect();
        let statements: Vec<&str> = rows.iter().map(|r| r.statement.as_str()).collect();
        let param_counts: Vec<i32> = rows.iter().map(|r| r.param_count).collect();
        let sql = "INSERT INTO sql_insights_statements (id, created_at, statement_text, param_count)
            SELECT * FROM UNNEST($1::text[], $2::timestamptz[], $3::text[], $4::integer[]) ON CONFLICT DO NOTHING";
        db.execute(&db.prepare_cached(sql).await?, &[&hashes, &created_at, &statements, &param_counts]).await?;
        Ok(())
    }

    async fn insert_callers(&self, rows: &[CallerReference]) -> Result<()> {
        let db = self.pool.get().await?;
        let caller_hashes: Vec<&str> = rows.iter().map(|r| r.caller_hash.as_str()).collect();
        let statement_hashes: Vec<&str> = rows.iter().map(|r| r.statement_hash.as_str()).collect();
        let created_at: Vec<DateTime<Utc>> = rows.iter().map(|r| r.created_at).collect();
        let callers: Vec<&[u8]> = rows.iter().map(|r| r.callers.as_slice()).collect();
        let sql = "INSERT INTO sql_insights_callers (caller_hash, statement_hash, created_at, callers)
            SELECT * FROM UNNEST($1::text[], $2::text[], $3::timestamptz[], $4::bytea[]) ON CONFLICT DO NOTHING";
        db.execute(&db.prepare_cached(sql).await?, &[&caller_hashes, &statement_hashes, &created_at, &callers]).await?;
        Ok(())
    }

    async fn insert_history(&self, rows: &[Rollup]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let db = self.pool.get().await?;
        let sql = format!("COPY sql_insights_history ({HISTORY_FIELDS}) FROM STDIN BINARY");
        let stmt = db.copy_in(&db.prepare_cached(&sql).await?).await?;
        let writer = tokio_postgres::binary_copy::BinaryCopyInWriter::new(stmt, HISTORY_TYPES);
        futures::pin_mut!(writer);
        for r in rows {
            writer
                .as_mut()
                .write(&[
                    &r.instance_id,
                    &r.created_at,
                    &r.statement_hash,
                    &r.kind.as_str(),
                    &r.errors,
                    &r.cpu,
                    &r.mem,
                    &r.count,
                    &r.rows_min,
                    &r.rows_max,
                    &r.rows_avg,
                    &r.rows_sum,
                    &r.rows_median,
                    &r.duration_min,
                    &r.duration_max,
                    &r.duration_avg,
                    &r.duration_sum,
                    &r.duration_median,
                ])
                .await?;
        }
        writer.finish().await?;
        Ok(())
    }

    async fn purge_history(&self, instance_id: i64, before: DateTime<Utc>) -> Result<u64> {
        let db = self.pool.get().await?;
        let sql = "DELETE FROM sql_insights_history WHERE instance_id = $1 AND created_at < $2";
        Ok(db.execute(&db.prepare_cached(sql).await?, &[&instance_id, &before]).await?)
    }

    async fn history(&self, filter: &HistoryFilter) -> Result<Vec<HistoryRow>> {
        let db = self.pool.get().await?;
        let (from, to) = filter.range();
        let mut sql = format!(
            "SELECT h.id, i.instance_name, {} FROM sql_insights_history h
            JOIN sql_insights_instances i ON i.id = h.instance_id
            WHERE h.created_at >= $1 AND h.created_at <= $2",
            HISTORY_FIELDS.split(", ").map(|f| format!("h.{}", f.trim())).collect::<Vec<_>>().join(", ")
        );
        let rows = if filter.instances.is_empty() {
            sql += " ORDER BY h.created_at, h.id";
            db.query(&db.prepare_cached(&sql).await?, &[&from, &to]).await?
        } else {
            sql += " AND i.instance_name = ANY($3) ORDER BY h.created_at, h.id";
            db.query(&db.prepare_cached(&sql).await?, &[&from, &to, &filter.instances]).await?
        };
        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let rollup = Rollup {
                instance_id: row.get("instance_id"),
                created_at: row.get("created_at"),
                statement_hash: row.get("statement_hash"),
                kind: row.get::<_, &str>("kind").parse()?,
                errors: row.get("error_count"),
                cpu: row.get("cpu_pct"),
                mem: row.get("mem_pct"),
                count: row.get("count"),
                rows_min: row.get("rows_min"),
                rows_max: row.get("rows_max"),
                rows_avg: row.get("rows_avg"),
                rows_sum: row.get("rows_sum"),
                rows_median: row.get("rows_median"),
                duration_min: row.get("duration_min"),
                duration_max: row.get("duration_max"),
                duration_avg: row.get("duration_avg"),
                duration_sum: row.get("duration_sum"),
                duration_median: row.get("duration_median"),
            };
            results.push(HistoryRow { id: row.get("id"), instance_name: row.get("instance_name"), rollup });
        }
        Ok(results)
    }
}
