use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::RollupStore;
use crate::rollup::record::{sort_records, RecordId, RecordQuery, RollupRecord};
use crate::rollup::update::{FieldPath, UpdateOp};

/// Stored numeric fields of one record.
#[derive(Debug)]
struct Document {
    bucket_end: DateTime<Utc>,
    fields: BTreeMap<FieldPath, f64>,
}

impl Document {
    fn to_record(&self, id: RecordId) -> RollupRecord {
        RollupRecord::from_fields(
            id,
            self.bucket_end,
            self.fields.iter().map(|(path, value)| (path, *value)),
        )
    }
}

/// In-process rollup store.
///
/// Each document is updated while its map entry is locked, so concurrent
/// writers to the same record serialize on that entry and writers to other
/// records proceed in parallel.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<RecordId, Document>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn upsert_sync(&self, id: &RecordId, update: &UpdateOp, written_at: DateTime<Utc>) -> RollupRecord {
        let mut doc = self.records.entry(id.clone()).or_insert_with(|| Document {
            bucket_end: written_at,
            fields: BTreeMap::new(),
        });

        for (path, op) in update.iter() {
            let current = doc.fields.get(path).copied();
            doc.fields.insert(path.clone(), op.apply(current));
        }
        if written_at > doc.bucket_end {
            doc.bucket_end = written_at;
        }

        doc.to_record(id.clone())
    }

    fn find_sync(&self, query: &RecordQuery) -> Vec<RollupRecord> {
        let mut records: Vec<RollupRecord> = self
            .records
            .iter()
            .filter(|entry| query.matches(entry.key()))
            .map(|entry| entry.value().to_record(entry.key().clone()))
            .collect();
        sort_records(&mut records);
        records
    }
}

impl RollupStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn upsert(
        &self,
        id: &RecordId,
        update: &UpdateOp,
        written_at: DateTime<Utc>,
    ) -> Result<RollupRecord> {
        Ok(self.upsert_sync(id, update, written_at))
    }

    async fn find(&self, query: &RecordQuery) -> Result<Vec<RollupRecord>> {
        Ok(self.find_sync(query))
    }
}
