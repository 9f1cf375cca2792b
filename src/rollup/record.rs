use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::key::GroupKey;
use super::resolution::Resolution;
use super::update::{ChannelStat, FieldPath, FieldTarget};

/// Identity tuple of a rollup record.
///
/// Records for different resolutions of the same event never share an
/// identity, so their upserts never contend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordId {
    pub series: String,
    pub resolution: Resolution,
    pub bucket_start: DateTime<Utc>,
    pub key: GroupKey,
}

/// Accumulators and derived statistics of one channel within a record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sum: Option<f64>,
    /// Number of events that contributed a value to `sum`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_max: Option<f64>,
}

impl ChannelStats {
    fn set(&mut self, stat: ChannelStat, value: f64) {
        match stat {
            ChannelStat::Sum => self.sum = Some(value),
            ChannelStat::Count => self.count = Some(as_count(value)),
            ChannelStat::Min => self.min = Some(value),
            ChannelStat::Max => self.max = Some(value),
        }
    }
}

/// One bucket of one series at one resolution for one grouping key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupRecord {
    pub series: String,
    pub resolution: Resolution,
    pub bucket_start: DateTime<Utc>,
    /// Wall-clock time of the most recent write.
    pub bucket_end: DateTime<Utc>,
    pub key: GroupKey,
    /// Number of events folded into this bucket.
    pub count: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub channels: BTreeMap<String, ChannelStats>,
}

impl RollupRecord {
    /// Materializes a record from its identity and stored numeric fields.
    ///
    /// Paths that do not address a record field are ignored.
    pub fn from_fields<'a, I>(id: RecordId, bucket_end: DateTime<Utc>, fields: I) -> Self
    where
        I: IntoIterator<Item = (&'a FieldPath, f64)>,
    {
        let mut record = Self {
            series: id.series,
            resolution: id.resolution,
            bucket_start: id.bucket_start,
            bucket_end,
            key: id.key,
            count: 0,
            channels: BTreeMap::new(),
        };

        for (path, value) in fields {
            match path.target() {
                Some(FieldTarget::Count) => record.count = as_count(value),
                Some(FieldTarget::Channel { name, stat }) => record
                    .channels
                    .entry(name.to_string())
                    .or_default()
                    .set(stat, value),
                None => {}
            }
        }

        record
    }

    /// Identity tuple of this record.
    pub fn id(&self) -> RecordId {
        RecordId {
            series: self.series.clone(),
            resolution: self.resolution,
            bucket_start: self.bucket_start,
            key: self.key.clone(),
        }
    }

    pub fn channel(&self, name: &str) -> Option<&ChannelStats> {
        self.channels.get(name)
    }
}

fn as_count(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value.round() as u64
    } else {
        0
    }
}

/// Read filter over one series' records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordQuery {
    pub series: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    /// Inclusive lower bound on `bucket_start`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `bucket_start`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<DateTime<Utc>>,
    /// Key fields that must be present with deep-equal values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub key: BTreeMap<String, Value>,
}

impl RecordQuery {
    pub fn series(series: impl Into<String>) -> Self {
        Self {
            series: series.into(),
            ..Default::default()
        }
    }

    pub fn resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = Some(resolution);
        self
    }

    pub fn between(mut self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    pub fn key_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.key.insert(name.into(), value);
        self
    }

    /// Returns true if a record with this identity satisfies the filter.
    pub fn matches(&self, id: &RecordId) -> bool {
        id.series == self.series
            && self.resolution.map_or(true, |r| r == id.resolution)
            && self.from.map_or(true, |from| id.bucket_start >= from)
            && self.to.map_or(true, |to| id.bucket_start < to)
            && self
                .key
                .iter()
                .all(|(name, value)| id.key.get(name) == Some(value))
    }
}

/// Orders records by bucket start, resolution label, then key.
pub fn sort_records(records: &mut [RollupRecord]) {
    records.sort_by(|a, b| {
        a.bucket_start
            .cmp(&b.bucket_start)
            .then_with(|| a.resolution.as_str().cmp(b.resolution.as_str()))
            .then_with(|| a.key.cmp(&b.key))
    });
}
