//! Periodic rebuild of carrier capacity records.
//!
//! A [`CarrierSource`] produces fresh records (usually from the analytics job's profile
//! export); [`CapacityRefresher`] pushes them into the store on a fixed interval. A failed
//! refresh keeps the previous carrier set in place: the engine never waits on a refresh.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use figment::Figment;
use figment::providers::{Format, Json, Yaml};
use metrics::counter;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::carrier::{CarrierCapacityRecord, CarrierProfileRow, UtilizationLevel};
use crate::storage::CapacityStore;

#[async_trait]
pub trait CarrierSource: Send + Sync {
    async fn load(&self) -> anyhow::Result<Vec<CarrierCapacityRecord>>;
}

/// Carrier profiles read from a YAML or JSON file with a top-level `carriers` list.
///
/// `.json` files are parsed as JSON, anything else as YAML. Rows that cannot be read are
/// skipped with a warning; the rest of the file still loads.
#[derive(Debug, Clone)]
pub struct FileCarrierSource {
    path: PathBuf,
}

#[derive(Deserialize)]
struct CarrierFile {
    carriers: Vec<serde_json::Value>,
}

impl FileCarrierSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> anyhow::Result<Vec<CarrierCapacityRecord>> {
        if !self.path.is_file() {
            return Err(anyhow!("carrier file {} does not exist", self.path.display()));
        }

        let is_json = self.path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let figment = if is_json {
            Figment::new().merge(Json::file(&self.path))
        } else {
            Figment::new().merge(Yaml::file(&self.path))
        };
        let file: CarrierFile = figment
            .extract()
            .with_context(|| format!("failed to parse carrier file {}", self.path.display()))?;

        let mut records = Vec::with_capacity(file.carriers.len());
        for (index, raw) in file.carriers.into_iter().enumerate() {
            let row: CarrierProfileRow = match serde_json::from_value(raw) {
                Ok(row) => row,
                Err(e) => {
                    warn!(index, "Skipping unreadable carrier row: {}", e);
                    continue;
                }
            };
            let carrier = row.carrier_name.clone();
            match row.into_record() {
                Ok(record) => records.push(record),
                Err(e) => warn!(index, carrier = %carrier, "Skipping carrier row: {}", e),
            }
        }

        Ok(records)
    }
}

#[async_trait]
impl CarrierSource for FileCarrierSource {
    async fn load(&self) -> anyhow::Result<Vec<CarrierCapacityRecord>> {
        let source = self.clone();
        tokio::task::spawn_blocking(move || source.read())
            .await
            .context("carrier file loader panicked")?
    }
}

/// Moves records from a [`CarrierSource`] into a [`CapacityStore`].
pub struct CapacityRefresher<S> {
    store: Arc<S>,
    source: Arc<dyn CarrierSource>,
}

impl<S: CapacityStore> CapacityRefresher<S> {
    pub fn new(store: Arc<S>, source: Arc<dyn CarrierSource>) -> Self {
        Self { store, source }
    }

    /// Load once and replace the store's carrier set. Returns the number of carriers held.
    #[instrument(skip(self), err)]
    pub async fn refresh_once(&self) -> anyhow::Result<usize> {
        let records = match self.source.load().await {
            Ok(records) => records,
            Err(e) => {
                counter!("tpsctl_capacity_refresh_total", "status" => "failure").increment(1);
                return Err(e);
            }
        };

        for record in &records {
            log_utilization(record);
        }

        match self.store.refresh(records).await {
            Ok(held) => {
                counter!("tpsctl_capacity_refresh_total", "status" => "success").increment(1);
                info!(carriers = held, "Carrier capacity refreshed");
                Ok(held)
            }
            Err(e) => {
                counter!("tpsctl_capacity_refresh_total", "status" => "failure").increment(1);
                Err(e.into())
            }
        }
    }

    /// Refresh every `interval` until `shutdown` fires.
    ///
    /// The first refresh happens one full interval after start; callers load the initial
    /// carrier set themselves so that startup fails fast on a bad source.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!("Starting capacity refresher with {:?} interval", interval);

        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Consume the immediate first tick
        timer.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Capacity refresher shutting down");
                    break;
                }
                _ = timer.tick() => {
                    if let Err(e) = self.refresh_once().await {
                        warn!("Capacity refresh failed, keeping previous carrier set: {:#}", e);
                    }
                }
            }
        }

        Ok(())
    }
}

fn log_utilization(record: &CarrierCapacityRecord) {
    // Allocated volume is whatever the ceiling does not account for as usage or headroom
    let allocated = (record.allowed_tps - record.consumed_tps - record.allocatable_tps).max(Decimal::ZERO);
    let level = UtilizationLevel::classify(record.allowed_tps, record.consumed_tps, allocated);

    if level == UtilizationLevel::OverCapacity {
        warn!(carrier = %record.carrier_id, allowed = %record.allowed_tps, consumed = %record.consumed_tps, "Carrier over capacity");
    } else {
        debug!(carrier = %record.carrier_id, ?level, allocatable = %record.allocatable_tps, "Carrier utilization");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryCapacityStore;
    use rust_decimal_macros::dec;
    use std::io::Write;

    fn write_file(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test_log::test(tokio::test)]
    async fn test_loads_yaml_profiles_and_skips_bad_rows() {
        let file = write_file(
            ".yaml",
            r#"
carriers:
  - carrier_name: carrier-a
    allowed_tps: 100
    avg_tps_actual: 40
    allocatable_tps: 60
    actual_peak_start_time: 0
    actual_peak_end_time: 6
    supported_countries_list: [US, CA]
  - carrier_id: carrier-b
    allowed_tps: "80"
    avg_tps_actual: 20.5
    total_allocated_tps: 10
    actual_peak_hour: 10
    supported_countries: [US]
  - carrier_name: carrier-c
    allowed_tps: 50
    actual_peak_start_time: 20
    actual_peak_end_time: 4
  - allowed_tps: 10
"#,
        );

        let records = FileCarrierSource::new(file.path()).load().await.unwrap();
        assert_eq!(records.len(), 2);

        assert_eq!(records[0].carrier_id, "carrier-a");
        assert_eq!(records[0].allocatable_tps, dec!(60));
        assert_eq!(records[0].peak_window, "0-6".parse().unwrap());

        // floor(80 - 20.5 - 10)
        assert_eq!(records[1].carrier_id, "carrier-b");
        assert_eq!(records[1].allocatable_tps, dec!(49));
        assert_eq!(records[1].peak_window, "6-13".parse().unwrap());
    }

    #[test_log::test(tokio::test)]
    async fn test_loads_json_profiles() {
        let file = write_file(
            ".json",
            r#"{"carriers": [{"carrier_name": "j", "allowed_tps": 10, "allocatable_tps": "garbage", "supported_countries_list": ["GB"]}]}"#,
        );

        let records = FileCarrierSource::new(file.path()).load().await.unwrap();
        assert_eq!(records.len(), 1);
        // Unreadable capacity reads as zero
        assert_eq!(records[0].allocatable_tps, dec!(0));
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let source = FileCarrierSource::new("/nonexistent/carriers.yaml");
        assert!(source.load().await.is_err());
    }

    #[test_log::test(tokio::test)]
    async fn test_failed_refresh_keeps_previous_carriers() {
        let file = write_file(
            ".yaml",
            "carriers:\n  - carrier_name: a\n    allowed_tps: 10\n    allocatable_tps: 10\n    supported_countries_list: [US]\n",
        );
        let store = Arc::new(InMemoryCapacityStore::new());
        let refresher = CapacityRefresher::new(store.clone(), Arc::new(FileCarrierSource::new(file.path())));
        assert_eq!(refresher.refresh_once().await.unwrap(), 1);

        let broken = CapacityRefresher::new(store.clone(), Arc::new(FileCarrierSource::new("/nonexistent/carriers.yaml")));
        assert!(broken.refresh_once().await.is_err());
        assert_eq!(store.snapshot().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_refreshes_on_interval_and_stops() {
        let file = write_file(
            ".yaml",
            "carriers:\n  - carrier_name: a\n    allowed_tps: 10\n    allocatable_tps: 10\n    supported_countries_list: [US]\n",
        );
        let store = Arc::new(InMemoryCapacityStore::new());
        let refresher = CapacityRefresher::new(store.clone(), Arc::new(FileCarrierSource::new(file.path())));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(refresher.run(Duration::from_millis(50), shutdown.clone()));

        // Nothing happens before the first interval elapses
        tokio::task::yield_now().await;
        assert!(store.snapshot().await.unwrap().is_empty());

        let mut loaded = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if !store.snapshot().await.unwrap().is_empty() {
                loaded = true;
                break;
            }
        }
        assert!(loaded);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }
}
