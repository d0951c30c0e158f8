//! # tpsctl: carrier TPS capacity allocation
//!
//! `tpsctl` decides how a request for transactions-per-second capacity is split across
//! outbound carriers. A request names a volume, a set of destination countries and the hours
//! it needs; the engine either grants the full volume across one or more carriers or rejects
//! it with a precise reason. It never grants part of a request and never hands out more than
//! a carrier has left.
//!
//! ## Pipeline
//!
//! Each request runs through a fixed sequence of stages (see [`allocation`]):
//!
//! 1. **Validation**: the raw payload becomes an [`AllocationRequest`] or is rejected as
//!    malformed.
//! 2. **Eligibility**: carriers are narrowed by destination coverage, remaining headroom and
//!    peak-window overlap, in that order. The first stage that leaves nothing decides the
//!    rejection reason.
//! 3. **Formulation**: the eligible carriers become a linear program. The total must equal the
//!    requested volume, each carrier is capped at its headroom, and every destination must get
//!    at least an even share from carriers that serve it.
//! 4. **Solving**: the [`solver`] finds a feasible split, on the blocking pool and under a
//!    time limit.
//! 5. **Commit**: the rounded split is subtracted from carrier headroom in one atomic step
//!    through a [`CapacityStore`]. Commits re-check headroom under per-carrier locks, so
//!    concurrent requests cannot overcommit a carrier.
//!
//! Every call, approved or rejected, produces one audit record (see [`audit`]).
//!
//! ## Capacity data
//!
//! Carrier records are rebuilt periodically from usage profiles by the [`refresh`] job. The
//! in-memory store is fed from a YAML/JSON profile file; with the `postgres` feature the
//! records can live in PostgreSQL instead, where commits use row locks.
//!
//! ## Running
//!
//! The `tpsctl` binary reads one JSON request per line from stdin (or `--requests <file>`)
//! and writes one JSON result per line to stdout:
//!
//! ```text
//! $ echo '{"requested_tps": 50, "destinations": ["US", "CA"], "peak_window": "9-12"}' | tpsctl -f config.yaml
//! {"status":"success","allocation_id":"...","total_requested_tps":50.0,"total_allocated_tps":50.0,"allocations":[...]}
//! ```
//!
//! See [`config`] for configuration options.

use std::sync::Arc;

use anyhow::Context;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod allocation;
pub mod audit;
pub mod carrier;
pub mod config;
pub mod engine;
pub mod errors;
pub mod refresh;
pub mod request;
pub mod solver;
pub mod storage;
pub mod telemetry;
pub mod types;

#[cfg(test)]
mod test;

pub use allocation::{AllocationResult, CarrierAllocation, RejectionReason};
pub use carrier::CarrierCapacityRecord;
pub use config::Config;
pub use engine::AllocationEngine;
pub use errors::{Error, Result};
pub use request::AllocationRequest;
pub use storage::{CapacityStore, InMemoryCapacityStore};

use audit::{AuditSink, NoopAuditSink, TracingAuditSink};
use config::{AuditSinkKind, CapacityBackend};
use refresh::{CapacityRefresher, FileCarrierSource};

#[cfg(feature = "postgres")]
use storage::postgres::PostgresCapacityStore;

/// Engines are generic over their store; the application picks one at startup.
enum Engine {
    InMemory(AllocationEngine<InMemoryCapacityStore>),
    #[cfg(feature = "postgres")]
    Postgres(AllocationEngine<PostgresCapacityStore>),
}

impl Engine {
    async fn handle_line(&self, line: &str) -> AllocationResult {
        let payload = match serde_json::from_str::<Value>(line) {
            Ok(payload) => payload,
            Err(e) => {
                let message = format!("request is not valid JSON: {e}");
                return match self {
                    Engine::InMemory(engine) => engine.reject_malformed(message).await,
                    #[cfg(feature = "postgres")]
                    Engine::Postgres(engine) => engine.reject_malformed(message).await,
                };
            }
        };

        match self {
            Engine::InMemory(engine) => engine.allocate_value(payload).await,
            #[cfg(feature = "postgres")]
            Engine::Postgres(engine) => engine.allocate_value(payload).await,
        }
    }

    async fn serve_lines<R, W, F>(&self, input: R, mut output: W, shutdown: F) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
        F: std::future::Future<Output = ()>,
    {
        let mut lines = input.lines();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting requests");
                    return Ok(());
                }
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        debug!("Request stream closed");
                        return Ok(());
                    };
                    if line.trim().is_empty() {
                        continue;
                    }

                    let result = self.handle_line(&line).await;
                    let mut encoded = serde_json::to_vec(&result)?;
                    encoded.push(b'\n');
                    output.write_all(&encoded).await?;
                    output.flush().await?;
                }
            }
        }
    }
}

/// Background tasks started with the application, stopped on shutdown.
struct BackgroundServices {
    tasks: Vec<tokio::task::JoinHandle<()>>,
    shutdown_token: CancellationToken,
}

impl BackgroundServices {
    fn new() -> Self {
        Self {
            tasks: Vec::new(),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Load the initial carrier set, then keep refreshing it in the background.
    async fn start_refresher<S: CapacityStore>(
        &mut self,
        store: Arc<S>,
        source: FileCarrierSource,
        interval: std::time::Duration,
    ) -> anyhow::Result<()> {
        let path = source.path().display().to_string();
        let refresher = CapacityRefresher::new(store, Arc::new(source));
        refresher
            .refresh_once()
            .await
            .with_context(|| format!("failed to load initial carrier set from {path}"))?;

        if interval.is_zero() {
            info!("Periodic capacity refresh disabled");
            return Ok(());
        }

        let shutdown = self.shutdown_token.clone();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = refresher.run(interval, shutdown).await {
                warn!("Capacity refresher stopped: {:#}", e);
            }
        }));
        Ok(())
    }

    async fn shutdown(self) {
        self.shutdown_token.cancel();
        for handle in self.tasks {
            let _ = handle.await;
        }
    }
}

pub struct Application {
    engine: Engine,
    background: BackgroundServices,
}

impl Application {
    /// Build the store, audit sink and engine described by `config`, and load the initial
    /// carrier set.
    pub async fn new(config: Config) -> Result<Self> {
        debug!("Starting tpsctl with configuration: {:#?}", config);
        config.validate()?;

        let mut background = BackgroundServices::new();

        #[cfg(feature = "postgres")]
        let pool = match config.database.url.as_deref() {
            Some(url)
                if config.capacity.backend == CapacityBackend::Postgres
                    || config.audit.sink == AuditSinkKind::Postgres =>
            {
                let pool = sqlx::postgres::PgPoolOptions::new()
                    .max_connections(config.database.max_connections)
                    .connect(url)
                    .await
                    .context("failed to connect to database")?;
                let store = PostgresCapacityStore::new(pool.clone());
                store.migrate().await.context("failed to apply database migrations")?;
                Some(store)
            }
            _ => None,
        };

        let audit: Arc<dyn AuditSink> = match config.audit.sink {
            AuditSinkKind::Tracing => Arc::new(TracingAuditSink),
            AuditSinkKind::None => Arc::new(NoopAuditSink),
            #[cfg(feature = "postgres")]
            AuditSinkKind::Postgres => Arc::new(pool.clone().ok_or_else(|| Error::config("audit sink needs a database"))?),
            #[cfg(not(feature = "postgres"))]
            AuditSinkKind::Postgres => return Err(Error::config("postgres audit sink requires the `postgres` feature")),
        };

        let engine = match config.capacity.backend {
            CapacityBackend::File => {
                let path = config
                    .capacity
                    .path
                    .clone()
                    .ok_or_else(|| Error::config("capacity.path is required for the file backend"))?;
                let store = Arc::new(InMemoryCapacityStore::new());
                background
                    .start_refresher(store.clone(), FileCarrierSource::new(path), config.capacity.refresh_interval)
                    .await?;
                Engine::InMemory(AllocationEngine::new(store, audit, config.engine.clone()))
            }
            #[cfg(feature = "postgres")]
            CapacityBackend::Postgres => {
                let store = Arc::new(pool.ok_or_else(|| Error::config("postgres backend needs a database"))?);
                match config.capacity.path.clone() {
                    Some(path) => {
                        background
                            .start_refresher(store.clone(), FileCarrierSource::new(path), config.capacity.refresh_interval)
                            .await?
                    }
                    None => info!("No capacity.path configured; carrier_capacity is maintained externally"),
                }
                Engine::Postgres(AllocationEngine::new(store, audit, config.engine.clone()))
            }
            #[cfg(not(feature = "postgres"))]
            CapacityBackend::Postgres => return Err(Error::config("postgres backend requires the `postgres` feature")),
        };

        Ok(Self { engine, background })
    }

    /// Process newline-delimited JSON requests from `input` until it ends or `shutdown`
    /// completes, writing one JSON result per line to `output`.
    ///
    /// Requests are handled one at a time so results come out in input order. Blank lines
    /// are skipped. Background services are stopped before returning, also when reading or
    /// writing fails.
    pub async fn serve<R, W, F>(self, input: R, output: W, shutdown: F) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let Application { engine, background } = self;

        info!("Accepting allocation requests");
        let served = engine.serve_lines(input, output, shutdown).await;
        if let Err(e) = &served {
            warn!("Request stream failed: {}", e);
        }

        info!("Stopping background services...");
        background.shutdown().await;
        served
    }
}
