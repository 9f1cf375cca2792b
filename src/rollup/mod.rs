//! Multi-resolution rollup engine.
//!
//! Each persisted source event is folded into one record per configured
//! resolution of every series attached to its source. A record is identified
//! by (series, resolution, bucket start, grouping key) and accumulates the
//! event count plus per-channel sum/count/min/max. Derived statistics are
//! computed on read.

pub mod channel;
pub mod derived;
pub mod error;
pub mod event;
pub mod key;
pub mod record;
pub mod registry;
pub mod resolution;
pub mod update;

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::export::health::HealthMetrics;
use crate::store::{RollupStore, Store};

use self::error::RollupError;
use self::event::SourceEvent;
use self::key::GroupKey;
use self::record::{RecordId, RecordQuery, RollupRecord};
use self::registry::{SeriesDefinition, SeriesRegistry};
use self::resolution::{CalendarZone, Resolution};
use self::update::{build_update, UpdateOp};

/// Everything needed to roll one event into one series.
#[derive(Debug, Clone)]
pub struct RollupPlan {
    pub series: Arc<SeriesDefinition>,
    pub key: GroupKey,
    /// Shared, read-only by every resolution's upsert.
    pub update: Arc<UpdateOp>,
    /// One record identity per resolution, in configured order.
    pub ids: Vec<RecordId>,
}

/// Result of one resolution's upsert.
#[derive(Debug)]
pub struct ResolutionOutcome {
    pub resolution: Resolution,
    pub bucket_start: DateTime<Utc>,
    /// The record after the write, or the store error.
    pub result: anyhow::Result<RollupRecord>,
}

/// Per-resolution results of rolling one event into one series.
#[derive(Debug)]
pub struct RollupOutcome {
    pub series: String,
    pub resolutions: Vec<ResolutionOutcome>,
}

impl RollupOutcome {
    /// Returns true if every resolution was written.
    pub fn is_complete(&self) -> bool {
        self.resolutions.iter().all(|r| r.result.is_ok())
    }

    /// Resolutions whose upsert failed.
    pub fn failures(&self) -> impl Iterator<Item = &ResolutionOutcome> + '_ {
        self.resolutions.iter().filter(|r| r.result.is_err())
    }

    /// Post-write record for a resolution, if it succeeded.
    pub fn record(&self, resolution: Resolution) -> Option<&RollupRecord> {
        self.resolutions
            .iter()
            .find(|r| r.resolution == resolution)
            .and_then(|r| r.result.as_ref().ok())
    }
}

/// Coordinates upserts for every registered series against one store.
///
/// Cloning is cheap; clones share the registry, store and metrics.
pub struct RollupEngine<S: RollupStore = Store> {
    registry: Arc<SeriesRegistry>,
    store: Arc<S>,
    zone: CalendarZone,
    health: Option<Arc<HealthMetrics>>,
}

impl<S: RollupStore> Clone for RollupEngine<S> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            store: Arc::clone(&self.store),
            zone: self.zone,
            health: self.health.clone(),
        }
    }
}

impl<S: RollupStore> RollupEngine<S> {
    pub fn new(registry: SeriesRegistry, store: S, zone: CalendarZone) -> Self {
        Self {
            registry: Arc::new(registry),
            store: Arc::new(store),
            zone,
            health: None,
        }
    }

    /// Records engine activity in the given metrics.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        health.series_registered.set(self.registry.len() as f64);
        self.health = Some(health);
        self
    }

    pub fn registry(&self) -> &SeriesRegistry {
        &self.registry
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn zone(&self) -> CalendarZone {
        self.zone
    }

    /// Computes the bucket identities and shared update for one event.
    pub fn plan(&self, series: &str, event: &SourceEvent) -> Result<RollupPlan, RollupError> {
        let definition = self.registry.get(series)?;
        self.plan_for(definition, event)
    }

    fn plan_for(
        &self,
        definition: &Arc<SeriesDefinition>,
        event: &SourceEvent,
    ) -> Result<RollupPlan, RollupError> {
        let ts = event.timestamp(&definition.name, definition.date_field.as_deref())?;
        let key = definition.key.extract(event);
        let update = Arc::new(build_update(event, &definition.channels)?);

        let ids = definition
            .resolutions
            .iter()
            .map(|&resolution| RecordId {
                series: definition.name.clone(),
                resolution,
                bucket_start: self.zone.truncate(ts, resolution),
                key: key.clone(),
            })
            .collect();

        Ok(RollupPlan {
            series: Arc::clone(definition),
            key,
            update,
            ids,
        })
    }

    /// Rolls one event into one series and waits for every resolution.
    ///
    /// Store failures are reported per resolution in the outcome; only
    /// planning errors fail the call.
    pub async fn apply(
        &self,
        series: &str,
        event: &SourceEvent,
    ) -> Result<RollupOutcome, RollupError> {
        let plan = self.plan(series, event)?;
        Ok(self.execute(plan).await)
    }

    /// Rolls the event into every series attached to its source in the
    /// background.
    ///
    /// The returned handle may be dropped; failures are logged and counted
    /// either way and are never retried.
    pub fn notify(&self, event: SourceEvent) -> JoinHandle<Vec<RollupOutcome>> {
        if let Some(health) = &self.health {
            health.events_received.inc();
        }

        let engine = self.clone();
        tokio::spawn(async move { engine.dispatch(&event).await })
    }

    async fn dispatch(&self, event: &SourceEvent) -> Vec<RollupOutcome> {
        let attached = self.registry.for_source(&event.source);
        if attached.is_empty() {
            debug!(source = %event.source, "no series attached to source");
        }

        let mut outcomes = Vec::with_capacity(attached.len());
        for definition in attached {
            match self.plan_for(definition, event) {
                Ok(plan) => outcomes.push(self.execute(plan).await),
                Err(e) => {
                    if e.is_per_event() {
                        warn!(series = %definition.name, error = %e, "skipping event");
                    } else {
                        error!(series = %definition.name, error = %e, "cannot roll up event");
                    }
                    if let Some(health) = &self.health {
                        health.events_skipped.inc();
                    }
                }
            }
        }
        outcomes
    }

    /// Issues one concurrent upsert per resolution and collects the results.
    async fn execute(&self, plan: RollupPlan) -> RollupOutcome {
        let written_at = Utc::now();
        let series = plan.series.name.clone();

        let handles: Vec<_> = plan
            .ids
            .into_iter()
            .map(|id| {
                let store = Arc::clone(&self.store);
                let update = Arc::clone(&plan.update);
                let health = self.health.clone();
                let resolution = id.resolution;
                let bucket_start = id.bucket_start;
                let handle = tokio::spawn(async move {
                    let started = Instant::now();
                    let result = store.upsert(&id, &update, written_at).await;
                    if let Some(health) = &health {
                        health
                            .upsert_duration
                            .with_label_values(&[store.name()])
                            .observe(started.elapsed().as_secs_f64());
                    }
                    result
                });
                (resolution, bucket_start, handle)
            })
            .collect();

        let mut resolutions = Vec::with_capacity(handles.len());
        for (resolution, bucket_start, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("upsert task failed: {e}")),
            };

            match &result {
                Ok(record) => {
                    debug!(
                        series = %series,
                        resolution = %resolution,
                        bucket_start = %bucket_start,
                        count = record.count,
                        "rollup updated",
                    );
                    if let Some(health) = &self.health {
                        health.upserts.with_label_values(&[resolution.as_str()]).inc();
                    }
                }
                Err(e) => {
                    error!(
                        series = %series,
                        resolution = %resolution,
                        bucket_start = %bucket_start,
                        error = %e,
                        "rollup upsert failed",
                    );
                    if let Some(health) = &self.health {
                        health
                            .upsert_errors
                            .with_label_values(&[resolution.as_str()])
                            .inc();
                    }
                }
            }

            resolutions.push(ResolutionOutcome {
                resolution,
                bucket_start,
                result,
            });
        }

        RollupOutcome {
            series,
            resolutions,
        }
    }

    /// Reads records of one series with derived statistics added.
    pub async fn find(&self, query: &RecordQuery) -> anyhow::Result<Vec<RollupRecord>> {
        let definition = self.registry.get(&query.series)?;
        let mut records = self.store.find(query).await?;
        derived::decorate(&mut records, &definition.channels);

        if let Some(health) = &self.health {
            health.queries.inc();
        }

        Ok(records)
    }
}
