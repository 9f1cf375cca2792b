use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncBufRead;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::ingest::{self, IngestStats};
use crate::rollup::RollupEngine;
use crate::store::{RollupStore, Store};

/// Agent orchestrates all components: health server, store, series
/// registry, rollup engine and the ingest loop.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    engine: Option<RollupEngine>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            engine: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Start the health server (if enabled), open the store and install
    /// the engine.
    pub async fn start(&mut self) -> Result<()> {
        if self.cfg.health.enabled {
            self.health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        let engine = self.build_engine()?.with_health(Arc::clone(&self.health));
        info!(
            series = engine.registry().len(),
            store = engine.store().name(),
            "rollup engine installed",
        );
        self.engine = Some(engine);

        Ok(())
    }

    /// Builds an engine from the configuration without starting anything.
    pub fn build_engine(&self) -> Result<RollupEngine> {
        let registry = self.cfg.registry().context("building series registry")?;
        let zone = self.cfg.zone()?;
        let store = Store::open(&self.cfg.store).context("opening rollup store")?;

        Ok(RollupEngine::new(registry, store, zone))
    }

    /// Returns the installed engine.
    pub fn engine(&self) -> Result<&RollupEngine> {
        self.engine.as_ref().context("agent not started")
    }

    /// Token that stops the ingest loop when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Feeds newline-delimited source events to the engine until EOF or
    /// shutdown.
    pub async fn ingest<R>(&self, reader: R) -> Result<IngestStats>
    where
        R: AsyncBufRead + Unpin,
    {
        let engine = self.engine()?.clone();
        ingest::run(reader, engine, self.cancel.child_token()).await
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Err(e) = self.health.stop().await {
            error!(error = %e, "error stopping health metrics server");
        }

        self.engine = None;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollup::record::RecordQuery;
    use tokio::io::BufReader;

    const CONFIG: &str = r#"
timezone: utc
health:
  enabled: false
series:
  - name: pageviews
    source: pageview
    resolutions: [hour]
    key: { url: 1 }
    channels:
      duration:
        source: loadMs
        operations: [sum]
        calculations: [average]
"#;

    #[tokio::test]
    async fn test_agent_ingests_and_serves_queries() {
        let cfg = Config::from_yaml(CONFIG).expect("config");
        let mut agent = Agent::new(cfg).expect("agent");
        assert!(agent.engine().is_err());

        agent.start().await.expect("start");

        let input = concat!(
            r#"{"source":"pageview","created_at":"2024-03-17T09:12:00Z","fields":{"url":"/","loadMs":100}}"#,
            "\n",
            r#"{"source":"pageview","created_at":"2024-03-17T09:40:00Z","fields":{"url":"/","loadMs":300}}"#,
            "\n",
        );
        let stats = agent
            .ingest(BufReader::new(input.as_bytes()))
            .await
            .expect("ingest");
        assert_eq!(stats.events, 2);

        let records = agent
            .engine()
            .expect("engine")
            .find(&RecordQuery::series("pageviews"))
            .await
            .expect("find");
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].channel("duration").and_then(|d| d.average),
            Some(200.0)
        );

        agent.stop().await.expect("stop");
    }
}
