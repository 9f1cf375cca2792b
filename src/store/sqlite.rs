use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Transaction, TransactionBehavior};

use super::RollupStore;
use crate::config::SqliteConfig;
use crate::migrate::SqliteMigrator;
use crate::rollup::key::GroupKey;
use crate::rollup::record::{sort_records, RecordId, RecordQuery, RollupRecord};
use crate::rollup::resolution::Resolution;
use crate::rollup::update::{FieldPath, UpdateOp};

const UPSERT_RECORD: &str = "INSERT INTO rollup_records
        (series, resolution, bucket_start, group_key, bucket_end)
    VALUES (?1, ?2, ?3, ?4, ?5)
    ON CONFLICT (series, resolution, bucket_start, group_key)
    DO UPDATE SET bucket_end = MAX(bucket_end, excluded.bucket_end)";

const INCREMENT_FIELD: &str = "INSERT INTO rollup_fields
        (series, resolution, bucket_start, group_key, path, value)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
    ON CONFLICT (series, resolution, bucket_start, group_key, path)
    DO UPDATE SET value = value + excluded.value";

const FLOOR_FIELD: &str = "INSERT INTO rollup_fields
        (series, resolution, bucket_start, group_key, path, value)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
    ON CONFLICT (series, resolution, bucket_start, group_key, path)
    DO UPDATE SET value = MIN(value, excluded.value)";

const CEIL_FIELD: &str = "INSERT INTO rollup_fields
        (series, resolution, bucket_start, group_key, path, value)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
    ON CONFLICT (series, resolution, bucket_start, group_key, path)
    DO UPDATE SET value = MAX(value, excluded.value)";

const SELECT_RECORD: &str = "SELECT r.bucket_end, f.path, f.value
    FROM rollup_records r
    LEFT JOIN rollup_fields f
        USING (series, resolution, bucket_start, group_key)
    WHERE r.series = ?1 AND r.resolution = ?2 AND r.bucket_start = ?3 AND r.group_key = ?4";

/// SQLite-backed rollup store.
///
/// Every upsert runs in its own `BEGIN IMMEDIATE` transaction and expresses
/// each field operation as an `ON CONFLICT DO UPDATE` clause, so the
/// arithmetic happens inside SQLite and concurrent processes sharing the
/// file never lose an update.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (or creates) the database file described by `cfg`.
    ///
    /// Schema migrations are applied only when enabled in the config.
    pub fn open(cfg: &SqliteConfig) -> Result<Self> {
        let conn = Connection::open(&cfg.path)
            .with_context(|| format!("opening sqlite database {}", cfg.path.display()))?;
        let store = Self::from_connection(conn, cfg.busy_timeout)?;

        if cfg.migrations.enabled {
            store.migrate_blocking()?;
        }

        tracing::info!(path = %cfg.path.display(), "opened sqlite store");

        Ok(store)
    }

    /// Opens a private in-memory database with the schema applied.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory sqlite database")?;
        let store = Self::from_connection(conn, Duration::from_secs(5))?;
        store.migrate_blocking()?;
        Ok(store)
    }

    /// Opens `path` and applies migrations, for tests and tooling.
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(&SqliteConfig {
            path: path.to_path_buf(),
            ..Default::default()
        })
    }

    fn from_connection(conn: Connection, busy_timeout: Duration) -> Result<Self> {
        conn.busy_timeout(busy_timeout)
            .context("setting sqlite busy timeout")?;
        let mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .context("enabling sqlite WAL journal")?;
        tracing::debug!(journal_mode = %mode, "sqlite journal mode");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Migration runner sharing this store's connection.
    pub fn migrator(&self) -> SqliteMigrator {
        SqliteMigrator::new(Arc::clone(&self.conn))
    }

    fn migrate_blocking(&self) -> Result<()> {
        let conn = self.conn.lock();
        crate::migrate::apply_up(&conn).context("applying sqlite migrations")
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .context("sqlite task panicked")?
    }
}

impl RollupStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn upsert(
        &self,
        id: &RecordId,
        update: &UpdateOp,
        written_at: DateTime<Utc>,
    ) -> Result<RollupRecord> {
        let id = id.clone();
        let update = update.clone();
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("beginning upsert transaction")?;
            let record = upsert_in(&tx, &id, &update, written_at)?;
            tx.commit().context("committing upsert")?;
            Ok(record)
        })
        .await
    }

    async fn find(&self, query: &RecordQuery) -> Result<Vec<RollupRecord>> {
        let query = query.clone();
        self.with_conn(move |conn| find_in(conn, &query)).await
    }
}

fn upsert_in(
    tx: &Transaction<'_>,
    id: &RecordId,
    update: &UpdateOp,
    written_at: DateTime<Utc>,
) -> Result<RollupRecord> {
    let series = id.series.as_str();
    let resolution = id.resolution.as_str();
    let bucket_start = id.bucket_start.timestamp_millis();
    let key = id.key.canonical();

    tx.execute(
        UPSERT_RECORD,
        params![series, resolution, bucket_start, key, written_at.timestamp_millis()],
    )
    .context("upserting rollup record")?;

    let statements = [
        (INCREMENT_FIELD, update.increments().collect::<Vec<_>>()),
        (FLOOR_FIELD, update.floor_bounds().collect()),
        (CEIL_FIELD, update.ceil_bounds().collect()),
    ];
    for (sql, ops) in statements {
        if ops.is_empty() {
            continue;
        }
        let mut stmt = tx.prepare_cached(sql).context("preparing field update")?;
        for (path, value) in ops {
            stmt.execute(params![series, resolution, bucket_start, key, path.as_str(), value])
                .with_context(|| format!("updating field {path}"))?;
        }
    }

    let mut stmt = tx
        .prepare_cached(SELECT_RECORD)
        .context("preparing record read")?;
    let rows = stmt
        .query_map(params![series, resolution, bucket_start, key], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<f64>>(2)?,
            ))
        })
        .context("reading rollup record")?;

    let mut bucket_end = written_at;
    let mut fields = Vec::new();
    for row in rows {
        let (end_ms, path, value) = row.context("reading rollup field")?;
        bucket_end = from_millis(end_ms)?;
        if let (Some(path), Some(value)) = (path, value) {
            fields.push((FieldPath::from_raw(path), value));
        }
    }

    Ok(RollupRecord::from_fields(
        id.clone(),
        bucket_end,
        fields.iter().map(|(p, v)| (p, *v)),
    ))
}

/// Raw row of the find join: identity, bucket end and one optional field.
struct FieldRow {
    resolution: String,
    bucket_start: i64,
    group_key: String,
    bucket_end: i64,
    path: Option<String>,
    value: Option<f64>,
}

fn find_in(conn: &Connection, query: &RecordQuery) -> Result<Vec<RollupRecord>> {
    let mut sql = String::from(
        "SELECT r.resolution, r.bucket_start, r.group_key, r.bucket_end, f.path, f.value
        FROM rollup_records r
        LEFT JOIN rollup_fields f
            USING (series, resolution, bucket_start, group_key)
        WHERE r.series = ?",
    );
    let mut params: Vec<Value> = vec![Value::Text(query.series.clone())];

    if let Some(resolution) = query.resolution {
        sql.push_str(" AND r.resolution = ?");
        params.push(Value::Text(resolution.as_str().to_string()));
    }
    if let Some(from) = query.from {
        sql.push_str(" AND r.bucket_start >= ?");
        params.push(Value::Integer(from.timestamp_millis()));
    }
    if let Some(to) = query.to {
        sql.push_str(" AND r.bucket_start < ?");
        params.push(Value::Integer(to.timestamp_millis()));
    }
    sql.push_str(" ORDER BY r.bucket_start, r.resolution, r.group_key, f.path");

    let mut stmt = conn.prepare(&sql).context("preparing rollup query")?;
    let rows = stmt
        .query_map(params_from_iter(params), |row| {
            Ok(FieldRow {
                resolution: row.get(0)?,
                bucket_start: row.get(1)?,
                group_key: row.get(2)?,
                bucket_end: row.get(3)?,
                path: row.get(4)?,
                value: row.get(5)?,
            })
        })
        .context("querying rollup records")?;

    let mut records = Vec::new();
    let mut current: Option<(RecordId, i64, Vec<(FieldPath, f64)>)> = None;

    for row in rows {
        let row = row.context("reading rollup row")?;
        let same_record = current.as_ref().is_some_and(|(id, _, _)| {
            id.resolution.as_str() == row.resolution
                && id.bucket_start.timestamp_millis() == row.bucket_start
                && id.key.canonical() == row.group_key
        });

        if !same_record {
            if let Some(done) = current.take() {
                push_record(&mut records, query, done)?;
            }
            let id = RecordId {
                series: query.series.clone(),
                resolution: Resolution::from_name(&row.resolution)
                    .with_context(|| format!("unknown stored resolution {}", row.resolution))?,
                bucket_start: from_millis(row.bucket_start)?,
                key: GroupKey::from_canonical(&row.group_key)
                    .with_context(|| format!("decoding stored group key {}", row.group_key))?,
            };
            current = Some((id, row.bucket_end, Vec::new()));
        }

        if let (Some((_, _, fields)), Some(path), Some(value)) = (current.as_mut(), row.path, row.value) {
            fields.push((FieldPath::from_raw(path), value));
        }
    }
    if let Some(done) = current.take() {
        push_record(&mut records, query, done)?;
    }

    sort_records(&mut records);
    Ok(records)
}

fn push_record(
    records: &mut Vec<RollupRecord>,
    query: &RecordQuery,
    (id, bucket_end, fields): (RecordId, i64, Vec<(FieldPath, f64)>),
) -> Result<()> {
    if !query.matches(&id) {
        return Ok(());
    }
    records.push(RollupRecord::from_fields(
        id,
        from_millis(bucket_end)?,
        fields.iter().map(|(p, v)| (p, *v)),
    ));
    Ok(())
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .with_context(|| format!("invalid stored timestamp {ms}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollup::update::ChannelStat;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .expect("valid timestamp")
            .with_timezone(&Utc)
    }

    fn id(resolution: Resolution, start: &str, url: &str) -> RecordId {
        RecordId {
            series: "pageviews".to_string(),
            resolution,
            bucket_start: utc(start),
            key: GroupKey::new(BTreeMap::from([("url".to_string(), json!(url))])),
        }
    }

    fn sample(value: Option<f64>) -> UpdateOp {
        let mut update = UpdateOp::new();
        update.increment(FieldPath::count(), 1.0).expect("count");
        if let Some(value) = value {
            update
                .increment(FieldPath::channel("duration", ChannelStat::Sum), value)
                .expect("sum");
            update
                .increment(FieldPath::channel("duration", ChannelStat::Count), 1.0)
                .expect("channel count");
            update
                .floor(FieldPath::channel("duration", ChannelStat::Min), value)
                .expect("min");
            update
                .ceil(FieldPath::channel("duration", ChannelStat::Max), value)
                .expect("max");
        }
        update
    }

    #[tokio::test]
    async fn test_upsert_returns_post_update_record() {
        let store = SqliteStore::open_in_memory().expect("open");
        let rid = id(Resolution::Hour, "2024-03-17T09:00:00Z", "/");
        let t0 = utc("2024-03-17T09:12:00Z");

        let first = store.upsert(&rid, &sample(Some(120.0)), t0).await.expect("upsert");
        assert_eq!(first.count, 1);

        let second = store
            .upsert(&rid, &sample(Some(300.0)), t0 + ChronoDuration::minutes(35))
            .await
            .expect("upsert");
        let duration = second.channel("duration").expect("channel");
        assert_eq!(second.count, 2);
        assert_eq!(duration.sum, Some(420.0));
        assert_eq!(duration.count, Some(2));
        assert_eq!(duration.min, Some(120.0));
        assert_eq!(duration.max, Some(300.0));
        assert_eq!(second.bucket_end, t0 + ChronoDuration::minutes(35));

        let stale = store.upsert(&rid, &sample(None), t0).await.expect("upsert");
        assert_eq!(stale.bucket_end, t0 + ChronoDuration::minutes(35));
        assert_eq!(stale.count, 3);
        assert_eq!(stale.channel("duration").expect("channel").count, Some(2));
    }

    #[tokio::test]
    async fn test_record_without_channels_has_no_channel_stats() {
        let store = SqliteStore::open_in_memory().expect("open");
        let rid = id(Resolution::Day, "2024-03-17T00:00:00Z", "/");

        let record = store
            .upsert(&rid, &sample(None), Utc::now())
            .await
            .expect("upsert");
        assert_eq!(record.count, 1);
        assert!(record.channels.is_empty());
    }

    #[tokio::test]
    async fn test_find_filters_and_orders() {
        let store = SqliteStore::open_in_memory().expect("open");
        let now = Utc::now();
        for rid in [
            id(Resolution::Hour, "2024-03-17T10:00:00Z", "/"),
            id(Resolution::Hour, "2024-03-17T09:00:00Z", "/b"),
            id(Resolution::Hour, "2024-03-17T09:00:00Z", "/a"),
            id(Resolution::Day, "2024-03-17T00:00:00Z", "/"),
        ] {
            store.upsert(&rid, &sample(Some(1.0)), now).await.expect("upsert");
        }

        let all = store
            .find(&RecordQuery::series("pageviews"))
            .await
            .expect("find");
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].resolution, Resolution::Day);
        assert_eq!(all[1].key.get("url"), Some(&json!("/a")));
        assert_eq!(all[3].bucket_start, utc("2024-03-17T10:00:00Z"));
        assert!(all.iter().all(|r| r.channel("duration").is_some()));

        let hours_before_ten = store
            .find(
                &RecordQuery::series("pageviews")
                    .resolution(Resolution::Hour)
                    .between(None, Some(utc("2024-03-17T10:00:00Z"))),
            )
            .await
            .expect("find");
        assert_eq!(hours_before_ten.len(), 2);

        let by_key = store
            .find(&RecordQuery::series("pageviews").key_field("url", json!("/")))
            .await
            .expect("find");
        assert_eq!(by_key.len(), 2);

        let other = store
            .find(&RecordQuery::series("signups"))
            .await
            .expect("find");
        assert!(other.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_connections_share_one_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rollups.db");
        let a = SqliteStore::open_path(&path).expect("open a");
        let b = SqliteStore::open_path(&path).expect("open b");
        let rid = id(Resolution::Minute, "2024-03-17T09:12:00Z", "/");
        let now = Utc::now();

        let mut handles = Vec::new();
        for i in 1..=40 {
            let store = if i % 2 == 0 { a.clone() } else { b.clone() };
            let rid = rid.clone();
            handles.push(tokio::spawn(async move {
                store.upsert(&rid, &sample(Some(f64::from(i))), now).await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("upsert");
        }

        let records = a.find(&RecordQuery::series("pageviews")).await.expect("find");
        assert_eq!(records.len(), 1);
        let duration = records[0].channel("duration").expect("channel");
        assert_eq!(records[0].count, 40);
        assert_eq!(duration.sum, Some(820.0));
        assert_eq!(duration.min, Some(1.0));
        assert_eq!(duration.max, Some(40.0));
    }
}
