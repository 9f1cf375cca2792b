//! Multi-resolution rollup engine.
//!
//! Persisted source events are folded into per-minute, -hour, -day and
//! -month buckets keyed by a configurable grouping key, accumulating counts
//! and per-channel sum/min/max with atomic store-side upserts.

pub mod agent;
pub mod config;
pub mod export;
pub mod ingest;
pub mod migrate;
pub mod rollup;
pub mod store;

pub use rollup::error::RollupError;
pub use rollup::event::SourceEvent;
pub use rollup::record::{RecordQuery, RollupRecord};
pub use rollup::registry::{SeriesDefinition, SeriesRegistry};
pub use rollup::resolution::{CalendarZone, Resolution};
pub use rollup::{RollupEngine, RollupOutcome};
