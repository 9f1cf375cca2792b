//! Path-keyed update payloads.
//!
//! Every operation targets a full dotted field path, so combining the
//! contributions of several channels never replaces a nested object: two
//! writes under `channels.duration.*` are two independent map entries.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;

use tracing::trace;

use super::channel::{ChannelSpec, Operation};
use super::error::RollupError;
use super::event::SourceEvent;

/// Accumulator stored per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelStat {
    Sum,
    Count,
    Min,
    Max,
}

impl ChannelStat {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Count => "count",
            Self::Min => "min",
            Self::Max => "max",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sum" => Some(Self::Sum),
            "count" => Some(Self::Count),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            _ => None,
        }
    }
}

/// Field a path resolves to within a rollup record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldTarget<'a> {
    /// The record's own event count.
    Count,
    Channel { name: &'a str, stat: ChannelStat },
}

/// Full dotted path of a numeric record field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPath(String);

const CHANNELS_PREFIX: &str = "channels";

impl FieldPath {
    /// Path of the record's event count.
    pub fn count() -> Self {
        Self("count".to_string())
    }

    /// Path of one channel accumulator, e.g. `channels.duration.sum`.
    pub fn channel(name: &str, stat: ChannelStat) -> Self {
        Self(format!("{CHANNELS_PREFIX}.{name}.{}", stat.as_str()))
    }

    /// Wraps a path read back from storage.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parses the path into the record field it addresses.
    pub fn target(&self) -> Option<FieldTarget<'_>> {
        if self.0 == "count" {
            return Some(FieldTarget::Count);
        }
        let rest = self.0.strip_prefix(CHANNELS_PREFIX)?.strip_prefix('.')?;
        let (name, stat) = rest.rsplit_once('.')?;
        if name.is_empty() || name.contains('.') {
            return None;
        }
        Some(FieldTarget::Channel {
            name,
            stat: ChannelStat::from_name(stat)?,
        })
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Atomic operation applied to one field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldOp {
    /// Add the delta, creating the field at zero.
    Increment(f64),
    /// Set if absent or smaller than the stored value.
    Min(f64),
    /// Set if absent or larger than the stored value.
    Max(f64),
}

impl FieldOp {
    /// Applies this operation to a stored value.
    pub fn apply(self, current: Option<f64>) -> f64 {
        match (self, current) {
            (Self::Increment(delta), Some(v)) => v + delta,
            (Self::Increment(delta), None) => delta,
            (Self::Min(candidate), Some(v)) => v.min(candidate),
            (Self::Max(candidate), Some(v)) => v.max(candidate),
            (Self::Min(candidate) | Self::Max(candidate), None) => candidate,
        }
    }

    /// Folds another operation on the same path into this one.
    fn combine(self, other: FieldOp) -> Option<FieldOp> {
        match (self, other) {
            (Self::Increment(a), Self::Increment(b)) => Some(Self::Increment(a + b)),
            (Self::Min(a), Self::Min(b)) => Some(Self::Min(a.min(b))),
            (Self::Max(a), Self::Max(b)) => Some(Self::Max(a.max(b))),
            _ => None,
        }
    }
}

/// One event's combined update, shared by every resolution's upsert.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOp {
    ops: BTreeMap<FieldPath, FieldOp>,
}

impl UpdateOp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `op` on `path`, combining with an existing op of the same kind.
    pub fn record(&mut self, path: FieldPath, op: FieldOp) -> Result<(), RollupError> {
        match self.ops.entry(path) {
            Entry::Vacant(slot) => {
                slot.insert(op);
                Ok(())
            }
            Entry::Occupied(mut slot) => match slot.get().combine(op) {
                Some(combined) => {
                    slot.insert(combined);
                    Ok(())
                }
                None => Err(RollupError::ConflictingFieldOp {
                    path: slot.key().to_string(),
                }),
            },
        }
    }

    pub fn increment(&mut self, path: FieldPath, delta: f64) -> Result<(), RollupError> {
        self.record(path, FieldOp::Increment(delta))
    }

    pub fn floor(&mut self, path: FieldPath, candidate: f64) -> Result<(), RollupError> {
        self.record(path, FieldOp::Min(candidate))
    }

    pub fn ceil(&mut self, path: FieldPath, candidate: f64) -> Result<(), RollupError> {
        self.record(path, FieldOp::Max(candidate))
    }

    /// Merges another update path by path.
    pub fn merge(&mut self, other: UpdateOp) -> Result<(), RollupError> {
        for (path, op) in other.ops {
            self.record(path, op)?;
        }
        Ok(())
    }

    pub fn get(&self, path: &FieldPath) -> Option<FieldOp> {
        self.ops.get(path).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FieldPath, FieldOp)> + '_ {
        self.ops.iter().map(|(path, op)| (path, *op))
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Field path to numeric delta.
    pub fn increments(&self) -> impl Iterator<Item = (&FieldPath, f64)> + '_ {
        self.iter().filter_map(|(path, op)| match op {
            FieldOp::Increment(delta) => Some((path, delta)),
            _ => None,
        })
    }

    /// Field path to candidate applied only when smaller.
    pub fn floor_bounds(&self) -> impl Iterator<Item = (&FieldPath, f64)> + '_ {
        self.iter().filter_map(|(path, op)| match op {
            FieldOp::Min(candidate) => Some((path, candidate)),
            _ => None,
        })
    }

    /// Field path to candidate applied only when larger.
    pub fn ceil_bounds(&self) -> impl Iterator<Item = (&FieldPath, f64)> + '_ {
        self.iter().filter_map(|(path, op)| match op {
            FieldOp::Max(candidate) => Some((path, candidate)),
            _ => None,
        })
    }
}

/// Builds the update one event contributes to its buckets.
///
/// The record count always increments. A channel contributes only when its
/// source path resolves to a number on the event.
pub fn build_update<'a, I>(event: &SourceEvent, channels: I) -> Result<UpdateOp, RollupError>
where
    I: IntoIterator<Item = (&'a String, &'a ChannelSpec)>,
{
    let mut update = UpdateOp::new();
    update.increment(FieldPath::count(), 1.0)?;

    for (name, spec) in channels {
        let Some(value) = event.lookup(&spec.source).and_then(|v| v.as_f64()) else {
            trace!(channel = %name, source = %spec.source, "channel source absent, skipping");
            continue;
        };

        let mut contribution = UpdateOp::new();
        if spec.accumulates(Operation::Sum) {
            contribution.increment(FieldPath::channel(name, ChannelStat::Sum), value)?;
            contribution.increment(FieldPath::channel(name, ChannelStat::Count), 1.0)?;
        }
        if spec.accumulates(Operation::Min) {
            contribution.floor(FieldPath::channel(name, ChannelStat::Min), value)?;
        }
        if spec.accumulates(Operation::Max) {
            contribution.ceil(FieldPath::channel(name, ChannelStat::Max), value)?;
        }
        update.merge(contribution)?;
    }

    Ok(update)
}
