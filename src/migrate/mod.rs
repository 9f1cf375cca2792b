use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

/// Embedded SQL migration with version, direction, and content.
struct Migration {
    version: u32,
    up_sql: &'static str,
    down_sql: &'static str,
}

/// All embedded migrations, ordered by version.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        up_sql: include_str!("sql/001_init.up.sql"),
        down_sql: include_str!("sql/001_init.down.sql"),
    },
    Migration {
        version: 2,
        up_sql: include_str!("sql/002_series_bucket_index.up.sql"),
        down_sql: include_str!("sql/002_series_bucket_index.down.sql"),
    },
];

/// Latest embedded schema version.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

/// Manages the rollup store schema.
///
/// Tracks the applied version in a `schema_migrations` table with a dirty
/// flag that is set while a migration is in progress.
pub trait Migrator: Send {
    /// Applies all pending forward migrations.
    fn up(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Rolls back the last applied migration.
    fn down(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Returns the current migration version and dirty flag.
    fn status(&self) -> impl std::future::Future<Output = Result<(u32, bool)>> + Send;
}

/// SQLite migration runner sharing the store's connection.
#[derive(Clone)]
pub struct SqliteMigrator {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMigrator {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await
        .context("migration task panicked")?
    }
}

impl Migrator for SqliteMigrator {
    async fn up(&self) -> Result<()> {
        self.with_conn(apply_up).await
    }

    async fn down(&self) -> Result<()> {
        self.with_conn(apply_down).await
    }

    async fn status(&self) -> Result<(u32, bool)> {
        self.with_conn(|conn| {
            ensure_migrations_table(conn)?;
            current_version(conn)
        })
        .await
    }
}

/// Ensures the schema_migrations tracking table exists.
fn ensure_migrations_table(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER NOT NULL,
            dirty INTEGER NOT NULL,
            sequence INTEGER NOT NULL
        )",
        [],
    )
    .context("creating schema_migrations table")?;

    Ok(())
}

/// Returns the current migration version and dirty state.
fn current_version(conn: &Connection) -> Result<(u32, bool)> {
    let row = conn
        .query_row(
            "SELECT version, dirty FROM schema_migrations ORDER BY sequence DESC LIMIT 1",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()
        .context("querying migration version")?;

    match row {
        Some((version, dirty)) => {
            let version = u32::try_from(version).context("migration version out of range")?;
            Ok((version, dirty != 0))
        }
        None => Ok((0, false)),
    }
}

/// Replaces the tracked version.
fn set_version(conn: &Connection, version: u32, dirty: bool) -> Result<()> {
    conn.execute("DELETE FROM schema_migrations", [])
        .context("clearing schema_migrations")?;

    conn.execute(
        "INSERT INTO schema_migrations (version, dirty, sequence) VALUES (?1, ?2, 1)",
        params![i64::from(version), i64::from(dirty)],
    )
    .context("inserting migration version")?;

    Ok(())
}

/// Splits a SQL string into individual statements and executes each.
fn execute_sql(conn: &Connection, sql: &str) -> Result<()> {
    for statement in split_statements(sql) {
        conn.execute(statement, []).with_context(|| {
            let preview: String = statement.chars().take(80).collect();
            format!("executing migration statement: {preview}...")
        })?;
    }

    Ok(())
}

/// Applies pending migrations on the calling thread.
pub(crate) fn apply_up(conn: &Connection) -> Result<()> {
    ensure_migrations_table(conn)?;

    let (current_version, dirty) = current_version(conn)?;

    if dirty {
        anyhow::bail!("migration version {current_version} is dirty, manual intervention required");
    }

    tracing::debug!(current_version, "running migrations");

    let mut applied = 0u32;

    for migration in MIGRATIONS {
        if migration.version <= current_version {
            continue;
        }

        tracing::info!(version = migration.version, "applying migration");

        set_version(conn, migration.version, true)?;

        execute_sql(conn, migration.up_sql)
            .with_context(|| format!("applying migration version {}", migration.version))?;

        set_version(conn, migration.version, false)?;

        applied += 1;
    }

    if applied == 0 {
        tracing::debug!("no pending migrations");
    } else {
        tracing::info!(version = latest_version(), applied, "migrations completed");
    }

    Ok(())
}

fn apply_down(conn: &Connection) -> Result<()> {
    ensure_migrations_table(conn)?;

    let (current_version, _) = current_version(conn)?;

    if current_version == 0 {
        tracing::info!("no migrations to roll back");
        return Ok(());
    }

    let migration = MIGRATIONS
        .iter()
        .find(|m| m.version == current_version)
        .with_context(|| format!("migration version {current_version} not found"))?;

    tracing::info!(version = current_version, "rolling back migration");

    set_version(conn, current_version, true)?;

    execute_sql(conn, migration.down_sql)
        .with_context(|| format!("rolling back migration version {current_version}"))?;

    let prev_version = MIGRATIONS
        .iter()
        .filter(|m| m.version < current_version)
        .map(|m| m.version)
        .max()
        .unwrap_or(0);

    if prev_version == 0 {
        conn.execute("DELETE FROM schema_migrations", [])
            .context("clearing schema_migrations after rollback")?;
    } else {
        set_version(conn, prev_version, false)?;
    }

    tracing::info!(version = prev_version, "rollback completed");

    Ok(())
}

/// Splits SQL text into individual statements by semicolons.
///
/// Handles empty lines and whitespace-only segments.
fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migrator() -> SqliteMigrator {
        let conn = Connection::open_in_memory().expect("open sqlite");
        SqliteMigrator::new(Arc::new(Mutex::new(conn)))
    }

    fn table_exists(m: &SqliteMigrator, name: &str) -> bool {
        let conn = m.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get::<_, i64>(0),
        )
        .expect("query sqlite_master")
            > 0
    }

    #[test]
    fn test_split_statements_basic() {
        let sql = "CREATE TABLE foo (id INTEGER); CREATE TABLE bar (id INTEGER);";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].starts_with("CREATE TABLE foo"));
        assert!(stmts[1].starts_with("CREATE TABLE bar"));
    }

    #[test]
    fn test_split_statements_trailing_semicolons() {
        let stmts = split_statements("SELECT 1;;;\n\n");
        assert_eq!(stmts.len(), 1);
        assert!(split_statements("").is_empty());
    }

    #[test]
    fn test_migrations_embedded_and_ordered() {
        for m in MIGRATIONS {
            assert!(m.version > 0);
            assert!(!m.up_sql.trim().is_empty(), "migration {} up SQL is empty", m.version);
            assert!(!m.down_sql.trim().is_empty(), "migration {} down SQL is empty", m.version);
        }
        for window in MIGRATIONS.windows(2) {
            assert!(
                window[0].version < window[1].version,
                "migrations not in order: {} >= {}",
                window[0].version,
                window[1].version,
            );
        }
    }

    #[tokio::test]
    async fn test_up_is_idempotent() {
        let m = migrator();
        assert_eq!(m.status().await.expect("status"), (0, false));

        m.up().await.expect("first up");
        m.up().await.expect("second up");

        assert_eq!(m.status().await.expect("status"), (latest_version(), false));
        assert!(table_exists(&m, "rollup_records"));
        assert!(table_exists(&m, "rollup_fields"));
    }

    #[tokio::test]
    async fn test_down_steps_back_one_version() {
        let m = migrator();
        m.up().await.expect("up");

        m.down().await.expect("down");
        assert_eq!(m.status().await.expect("status"), (1, false));

        m.down().await.expect("down");
        assert_eq!(m.status().await.expect("status"), (0, false));
        assert!(!table_exists(&m, "rollup_records"));

        m.down().await.expect("down with nothing applied");
    }

    #[tokio::test]
    async fn test_dirty_version_blocks_up() {
        let m = migrator();
        {
            let conn = m.conn.lock();
            ensure_migrations_table(&conn).expect("table");
            set_version(&conn, 1, true).expect("set version");
        }
        let err = m.up().await.unwrap_err();
        assert!(err.to_string().contains("dirty"));
    }
}
