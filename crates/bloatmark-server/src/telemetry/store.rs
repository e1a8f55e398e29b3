//! The telemetry store: an append-only ring of the most recent test
//! results in a single-file SQLite database.
//!
//! Writes are serialised by the pool; reads are plain queries. The ring
//! discipline runs inside the submit path: after every insert, anything
//! beyond capacity is deleted oldest-`ts`-first, so `count ≤ K` holds at
//! every observable moment.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use bloatmark_common::model::TestResult;

/// Re-submissions for a test id newer than this are discarded instead of
/// overwriting.
const IDEMPOTENCE_WINDOW_MS: i64 = 5 * 60 * 1000;

/// Connect to (or create) the single-file database.
pub async fn connect(path: &str) -> anyhow::Result<SqlitePool> {
    let opts = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(opts)
        .await?;
    tracing::info!(path, "telemetry database opened");
    Ok(pool)
}

/// In-memory database for tests. One connection, or every handle would
/// see its own empty database.
pub async fn connect_memory() -> anyhow::Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    Ok(pool)
}

/// Create the schema.
pub async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS results (
            test_id         TEXT PRIMARY KEY,
            kind            TEXT NOT NULL,
            client_addr     TEXT NOT NULL,
            grade           TEXT NOT NULL,
            baseline_rtt_ms REAL NOT NULL,
            loaded_rtt_ms   REAL NOT NULL,
            download_mbps   REAL NOT NULL,
            upload_mbps     REAL NOT NULL,
            duration_s      REAL NOT NULL,
            ts              INTEGER NOT NULL,
            raw_json        TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_results_ts ON results(ts)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_results_client ON results(client_addr, ts)")
        .execute(pool)
        .await?;
    tracing::info!("telemetry schema ready");
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Inserted,
    /// Same test id re-submitted inside the idempotence window:
    /// last write wins.
    Updated,
    /// Same test id re-submitted after the window: dropped.
    Discarded,
}

impl SubmitOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmitOutcome::Inserted => "inserted",
            SubmitOutcome::Updated => "updated",
            SubmitOutcome::Discarded => "discarded",
        }
    }
}

/// One stored row, as served by the admin reads.
#[derive(Debug, Clone, Serialize)]
pub struct StoredResult {
    pub test_id: String,
    pub kind: String,
    pub client_addr: String,
    pub grade: String,
    pub baseline_rtt_ms: f64,
    pub loaded_rtt_ms: f64,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub duration_s: f64,
    pub ts: i64,
    pub raw: serde_json::Value,
}

type Row = (
    String,
    String,
    String,
    String,
    f64,
    f64,
    f64,
    f64,
    f64,
    i64,
    String,
);

fn row_to_result(row: Row) -> StoredResult {
    let raw = serde_json::from_str(&row.10).unwrap_or(serde_json::Value::Null);
    StoredResult {
        test_id: row.0,
        kind: row.1,
        client_addr: row.2,
        grade: row.3,
        baseline_rtt_ms: row.4,
        loaded_rtt_ms: row.5,
        download_mbps: row.6,
        upload_mbps: row.7,
        duration_s: row.8,
        ts: row.9,
        raw,
    }
}

const SELECT_COLUMNS: &str = "test_id, kind, client_addr, grade, baseline_rtt_ms, \
     loaded_rtt_ms, download_mbps, upload_mbps, duration_s, ts, raw_json";

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total: i64,
    pub grades: BTreeMap<String, i64>,
    pub tests_last_24h: i64,
    pub rate_per_hour_24h: f64,
}

#[derive(Clone)]
pub struct TelemetryStore {
    pool: SqlitePool,
    ring_size: u32,
}

impl TelemetryStore {
    pub fn new(pool: SqlitePool, ring_size: u32) -> Self {
        TelemetryStore { pool, ring_size }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Persist a result. Idempotent on test id: a rewrite inside the
    /// window wins, a later one is discarded.
    pub async fn submit(
        &self,
        result: &TestResult,
        raw_json: &str,
    ) -> anyhow::Result<SubmitOutcome> {
        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT ts FROM results WHERE test_id = ?")
                .bind(&result.test_id)
                .fetch_optional(&self.pool)
                .await?;

        match existing {
            Some((stored_ts,)) => {
                if result.ts.saturating_sub(stored_ts) > IDEMPOTENCE_WINDOW_MS {
                    tracing::debug!(test_id = %result.test_id, "re-submission outside window discarded");
                    return Ok(SubmitOutcome::Discarded);
                }
                sqlx::query(
                    "UPDATE results SET kind = ?, client_addr = ?, grade = ?, \
                     baseline_rtt_ms = ?, loaded_rtt_ms = ?, download_mbps = ?, \
                     upload_mbps = ?, duration_s = ?, ts = ?, raw_json = ? \
                     WHERE test_id = ?",
                )
                .bind(result.kind.as_str())
                .bind(&result.client_addr)
                .bind(&result.grade)
                .bind(result.baseline_rtt_ms)
                .bind(result.loaded_rtt_ms)
                .bind(result.download_mbps)
                .bind(result.upload_mbps)
                .bind(result.duration_s)
                .bind(result.ts)
                .bind(raw_json)
                .bind(&result.test_id)
                .execute(&self.pool)
                .await?;
                Ok(SubmitOutcome::Updated)
            }
            None => {
                sqlx::query(
                    "INSERT INTO results (test_id, kind, client_addr, grade, \
                     baseline_rtt_ms, loaded_rtt_ms, download_mbps, upload_mbps, \
                     duration_s, ts, raw_json) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&result.test_id)
                .bind(result.kind.as_str())
                .bind(&result.client_addr)
                .bind(&result.grade)
                .bind(result.baseline_rtt_ms)
                .bind(result.loaded_rtt_ms)
                .bind(result.download_mbps)
                .bind(result.upload_mbps)
                .bind(result.duration_s)
                .bind(result.ts)
                .bind(raw_json)
                .execute(&self.pool)
                .await?;
                self.evict().await?;
                Ok(SubmitOutcome::Inserted)
            }
        }
    }

    /// Ring discipline: delete the oldest rows beyond capacity.
    async fn evict(&self) -> anyhow::Result<()> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM results")
            .fetch_one(&self.pool)
            .await?;
        let excess = count - self.ring_size as i64;
        if excess > 0 {
            sqlx::query(
                "DELETE FROM results WHERE test_id IN \
                 (SELECT test_id FROM results ORDER BY ts ASC, test_id ASC LIMIT ?)",
            )
            .bind(excess)
            .execute(&self.pool)
            .await?;
            tracing::debug!(evicted = excess, "telemetry ring trimmed");
        }
        Ok(())
    }

    pub async fn contains(&self, test_id: &str) -> anyhow::Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM results WHERE test_id = ?")
                .bind(test_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    pub async fn recent(&self, limit: u32) -> anyhow::Result<Vec<StoredResult>> {
        let rows: Vec<Row> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM results ORDER BY ts DESC, test_id DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_result).collect())
    }

    pub async fn by_client(&self, addr: &str, limit: u32) -> anyhow::Result<Vec<StoredResult>> {
        let rows: Vec<Row> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM results WHERE client_addr = ? \
             ORDER BY ts DESC, test_id DESC LIMIT ?"
        ))
        .bind(addr)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_result).collect())
    }

    pub async fn stats(&self) -> anyhow::Result<StoreStats> {
        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM results")
            .fetch_one(&self.pool)
            .await?;

        let grade_rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT grade, COUNT(*) FROM results GROUP BY grade")
                .fetch_all(&self.pool)
                .await?;
        let grades: BTreeMap<String, i64> = grade_rows.into_iter().collect();

        let cutoff = Utc::now().timestamp_millis() - 24 * 3600 * 1000;
        let (tests_last_24h,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM results WHERE ts >= ?")
                .bind(cutoff)
                .fetch_one(&self.pool)
                .await?;

        Ok(StoreStats {
            total,
            grades,
            tests_last_24h,
            rate_per_hour_24h: tests_last_24h as f64 / 24.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bloatmark_common::model::TestKind;

    fn result(test_id: &str, grade: &str, ts: i64) -> TestResult {
        TestResult {
            test_id: test_id.into(),
            kind: TestKind::Single,
            client_addr: "203.0.113.9".into(),
            grade: grade.into(),
            baseline_rtt_ms: 12.0,
            loaded_rtt_ms: 48.0,
            download_mbps: 240.0,
            upload_mbps: 36.0,
            duration_s: 40.0,
            ts,
        }
    }

    async fn store(ring: u32) -> TelemetryStore {
        let pool = connect_memory().await.unwrap();
        migrate(&pool).await.unwrap();
        TelemetryStore::new(pool, ring)
    }

    #[tokio::test]
    async fn submit_and_read_back() {
        let store = store(10).await;
        let r = result("abcdef0123456789", "A", 1_000);
        let outcome = store.submit(&r, "{\"grade\":\"A\"}").await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Inserted);

        let rows = store.recent(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].test_id, "abcdef0123456789");
        assert_eq!(rows[0].grade, "A");
        assert_eq!(rows[0].raw["grade"], "A");
    }

    #[tokio::test]
    async fn duplicate_within_window_wins() {
        let store = store(10).await;
        store
            .submit(&result("abcdef0123456789", "B", 1_000), "{}")
            .await
            .unwrap();
        let outcome = store
            .submit(&result("abcdef0123456789", "A", 2_000), "{}")
            .await
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::Updated);

        let rows = store.recent(10).await.unwrap();
        assert_eq!(rows.len(), 1, "idempotent on test id");
        assert_eq!(rows[0].grade, "A", "last write wins");
    }

    #[tokio::test]
    async fn duplicate_after_window_discarded() {
        let store = store(10).await;
        store
            .submit(&result("abcdef0123456789", "B", 1_000), "{}")
            .await
            .unwrap();
        let late_ts = 1_000 + IDEMPOTENCE_WINDOW_MS + 1;
        let outcome = store
            .submit(&result("abcdef0123456789", "A", late_ts), "{}")
            .await
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::Discarded);

        let rows = store.recent(10).await.unwrap();
        assert_eq!(rows[0].grade, "B", "original row untouched");
    }

    #[tokio::test]
    async fn ring_evicts_oldest_by_ts() {
        let store = store(5).await;
        for i in 0..8i64 {
            let id = format!("test-ring-{i:04}");
            store.submit(&result(&id, "C", 1_000 + i), "{}").await.unwrap();
        }
        let rows = store.recent(100).await.unwrap();
        assert_eq!(rows.len(), 5, "count ≤ K after every submit");
        // The three oldest are gone.
        let ids: Vec<&str> = rows.iter().map(|r| r.test_id.as_str()).collect();
        assert!(!ids.contains(&"test-ring-0000"));
        assert!(!ids.contains(&"test-ring-0001"));
        assert!(!ids.contains(&"test-ring-0002"));
        assert!(ids.contains(&"test-ring-0007"));
    }

    #[tokio::test]
    async fn recent_is_newest_first() {
        let store = store(10).await;
        for i in 0..4i64 {
            let id = format!("test-order-{i:04}");
            store.submit(&result(&id, "A", 1_000 + i), "{}").await.unwrap();
        }
        let rows = store.recent(2).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].test_id, "test-order-0003");
        assert_eq!(rows[1].test_id, "test-order-0002");
    }

    #[tokio::test]
    async fn by_client_filters_exact_address() {
        let store = store(10).await;
        let mut a = result("test-client-aaaa", "A", 1_000);
        a.client_addr = "203.0.113.9".into();
        let mut b = result("test-client-bbbb", "B", 2_000);
        b.client_addr = "198.51.100.7".into();
        store.submit(&a, "{}").await.unwrap();
        store.submit(&b, "{}").await.unwrap();

        let rows = store.by_client("203.0.113.9", 50).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].test_id, "test-client-aaaa");
    }

    #[tokio::test]
    async fn stats_histogram_and_rate() {
        let store = store(10).await;
        let now = Utc::now().timestamp_millis();
        store.submit(&result("test-stats-aaaa", "A", now), "{}").await.unwrap();
        store.submit(&result("test-stats-bbbb", "A", now), "{}").await.unwrap();
        store.submit(&result("test-stats-cccc", "F", now), "{}").await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.grades.get("A"), Some(&2));
        assert_eq!(stats.grades.get("F"), Some(&1));
        assert_eq!(stats.tests_last_24h, 3);
        assert!((stats.rate_per_hour_24h - 3.0 / 24.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn contains_round_trip() {
        let store = store(10).await;
        assert!(!store.contains("test-contains-01").await.unwrap());
        store
            .submit(&result("test-contains-01", "A", 1_000), "{}")
            .await
            .unwrap();
        assert!(store.contains("test-contains-01").await.unwrap());
    }
}
