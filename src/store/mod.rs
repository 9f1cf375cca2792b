pub mod memory;
pub mod sqlite;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::config::{StoreBackend, StoreConfig};
use crate::rollup::record::{RecordId, RecordQuery, RollupRecord};
use crate::rollup::update::UpdateOp;

use self::memory::MemoryStore;
use self::sqlite::SqliteStore;

/// Backing store for rollup records.
///
/// `upsert` must apply every operation of the update, create the record on
/// first touch and advance `bucket_end` as one atomic step, then return the
/// record as it stands after the write.
pub trait RollupStore: Send + Sync + 'static {
    /// Returns the store's name for logging and metrics.
    fn name(&self) -> &'static str;

    /// Atomically applies `update` to the record identified by `id`.
    fn upsert(
        &self,
        id: &RecordId,
        update: &UpdateOp,
        written_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<RollupRecord>> + Send;

    /// Returns raw records matching the query.
    fn find(
        &self,
        query: &RecordQuery,
    ) -> impl std::future::Future<Output = Result<Vec<RollupRecord>>> + Send;
}

/// Store dispatches to the configured backend.
///
/// Uses enum dispatch rather than trait objects, which keeps the trait's
/// `impl Future` methods usable without boxing.
pub enum Store {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

impl Store {
    /// Opens the backend named in the configuration.
    pub fn open(cfg: &StoreConfig) -> Result<Self> {
        match cfg.backend {
            StoreBackend::Memory => Ok(Self::Memory(MemoryStore::new())),
            StoreBackend::Sqlite => Ok(Self::Sqlite(SqliteStore::open(&cfg.sqlite)?)),
        }
    }

    /// Returns the SQLite store, if that is the active backend.
    pub fn as_sqlite(&self) -> Option<&SqliteStore> {
        match self {
            Self::Sqlite(s) => Some(s),
            Self::Memory(_) => None,
        }
    }
}

impl RollupStore for Store {
    fn name(&self) -> &'static str {
        match self {
            Self::Memory(s) => s.name(),
            Self::Sqlite(s) => s.name(),
        }
    }

    async fn upsert(
        &self,
        id: &RecordId,
        update: &UpdateOp,
        written_at: DateTime<Utc>,
    ) -> Result<RollupRecord> {
        match self {
            Self::Memory(s) => s.upsert(id, update, written_at).await,
            Self::Sqlite(s) => s.upsert(id, update, written_at).await,
        }
    }

    async fn find(&self, query: &RecordQuery) -> Result<Vec<RollupRecord>> {
        match self {
            Self::Memory(s) => s.find(query).await,
            Self::Sqlite(s) => s.find(query).await,
        }
    }
}

impl From<MemoryStore> for Store {
    fn from(store: MemoryStore) -> Self {
        Self::Memory(store)
    }
}

impl From<SqliteStore> for Store {
    fn from(store: SqliteStore) -> Self {
        Self::Sqlite(store)
    }
}
