//! Newline-delimited JSON trigger: each line is one persisted source event.

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::rollup::event::SourceEvent;
use crate::rollup::{RollupEngine, RollupOutcome};
use crate::store::RollupStore;

/// Counters for one ingest run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    /// Events handed to the engine.
    pub events: u64,
    /// Lines that did not parse as a source event.
    pub malformed: u64,
    /// Series rollups whose upserts all succeeded.
    pub rollups: u64,
    /// Series rollups with at least one failed resolution.
    pub failed_rollups: u64,
}

impl IngestStats {
    fn record(&mut self, outcomes: &[RollupOutcome]) {
        for outcome in outcomes {
            if outcome.is_complete() {
                self.rollups += 1;
            } else {
                self.failed_rollups += 1;
            }
        }
    }
}

/// Reads events until EOF or cancellation, dispatching each through
/// [`RollupEngine::notify`].
///
/// Reading never waits for rollups to finish. Outstanding rollups are
/// drained before returning so none are lost on shutdown.
pub async fn run<R, S>(
    reader: R,
    engine: RollupEngine<S>,
    cancel: CancellationToken,
) -> Result<IngestStats>
where
    R: AsyncBufRead + Unpin,
    S: RollupStore,
{
    let mut lines = reader.lines();
    let mut stats = IngestStats::default();
    let mut in_flight: Vec<JoinHandle<Vec<RollupOutcome>>> = Vec::new();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => {
                info!("ingest cancelled");
                break;
            }
            line = lines.next_line() => line.context("reading event stream")?,
        };

        let Some(line) = line else {
            debug!("event stream closed");
            break;
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let event: SourceEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "skipping malformed event line");
                stats.malformed += 1;
                continue;
            }
        };

        stats.events += 1;
        in_flight.push(engine.notify(event));

        // Collect rollups that already finished so the list stays short.
        if in_flight.len() >= 64 {
            let (done, pending): (Vec<_>, Vec<_>) =
                in_flight.into_iter().partition(|h| h.is_finished());
            in_flight = pending;
            for handle in done {
                collect(handle, &mut stats).await;
            }
        }
    }

    if !in_flight.is_empty() {
        debug!(pending = in_flight.len(), "draining in-flight rollups");
    }
    for handle in in_flight {
        collect(handle, &mut stats).await;
    }

    info!(
        events = stats.events,
        malformed = stats.malformed,
        rollups = stats.rollups,
        failed_rollups = stats.failed_rollups,
        "ingest finished",
    );

    Ok(stats)
}

async fn collect(handle: JoinHandle<Vec<RollupOutcome>>, stats: &mut IngestStats) {
    match handle.await {
        Ok(outcomes) => stats.record(&outcomes),
        Err(e) => error!(error = %e, "rollup task failed"),
    }
}
