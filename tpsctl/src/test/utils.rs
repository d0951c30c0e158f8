use std::sync::Arc;

use rust_decimal::Decimal;

use crate::audit::InMemoryAuditSink;
use crate::carrier::CarrierCapacityRecord;
use crate::config::EngineConfig;
use crate::engine::AllocationEngine;
use crate::storage::InMemoryCapacityStore;
use crate::types::PeakWindow;

pub fn create_test_carrier(id: &str, countries: &[&str], allocatable: Decimal, peak: &str) -> CarrierCapacityRecord {
    CarrierCapacityRecord {
        carrier_id: id.to_string(),
        allowed_tps: allocatable.max(Decimal::ONE_HUNDRED),
        consumed_tps: Decimal::ZERO,
        allocatable_tps: allocatable,
        peak_window: peak.parse::<PeakWindow>().unwrap(),
        supported_countries: countries.iter().map(|c| c.parse().unwrap()).collect(),
    }
}

pub fn create_test_engine(
    carriers: Vec<CarrierCapacityRecord>,
) -> (AllocationEngine<InMemoryCapacityStore>, InMemoryAuditSink) {
    let audit = InMemoryAuditSink::new();
    let store = Arc::new(InMemoryCapacityStore::with_records(carriers));
    (AllocationEngine::new(store, Arc::new(audit.clone()), EngineConfig::default()), audit)
}

pub async fn allocatable(engine: &AllocationEngine<InMemoryCapacityStore>, carrier_id: &str) -> Decimal {
    use crate::storage::CapacityStore;
    engine.store().get(carrier_id).await.unwrap().allocatable_tps
}
