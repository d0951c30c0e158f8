pub mod utils;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{Value, json};

use crate::allocation::{AllocationResult, RejectionReason};
use crate::audit::NoopAuditSink;
use crate::config::{AuditConfig, AuditSinkKind, CapacityConfig, Config, EngineConfig};
use crate::engine::AllocationEngine;
use crate::refresh::{CapacityRefresher, FileCarrierSource};
use crate::storage::{CapacityStore, InMemoryCapacityStore};
use crate::{Application, CarrierAllocation, Error};
use utils::{allocatable, create_test_carrier, create_test_engine};

fn shares(result: &AllocationResult) -> &[CarrierAllocation] {
    match result {
        AllocationResult::Success { per_carrier, .. } => per_carrier,
        AllocationResult::Rejected { reason, .. } => panic!("expected success, got rejection: {reason}"),
    }
}

fn share_of(result: &AllocationResult, carrier_id: &str) -> Decimal {
    shares(result)
        .iter()
        .find(|s| s.carrier_id == carrier_id)
        .map(|s| s.allocated_tps)
        .unwrap_or(Decimal::ZERO)
}

fn file_config(path: Option<std::path::PathBuf>) -> Config {
    Config {
        capacity: CapacityConfig {
            path,
            refresh_interval: Duration::ZERO,
            ..Default::default()
        },
        audit: AuditConfig {
            sink: AuditSinkKind::None,
        },
        ..Default::default()
    }
}

#[test_log::test(tokio::test)]
async fn test_two_carriers_jointly_cover_two_destinations() {
    let (engine, _) = create_test_engine(vec![
        create_test_carrier("A", &["US", "CA"], dec!(30), "8-16"),
        create_test_carrier("B", &["US"], dec!(40), "0-24"),
    ]);

    let result = engine
        .allocate_value(json!({"requested_tps": 50, "destinations": ["US", "CA"], "peak_window": "9-12"}))
        .await;

    let a = share_of(&result, "A");
    let b = share_of(&result, "B");
    assert_eq!(a + b, dec!(50));
    // Only A serves CA, so it must carry CA's even share
    assert!(a >= dec!(25) && a <= dec!(30), "A got {a}");
    assert!(b <= dec!(40), "B got {b}");

    assert_eq!(allocatable(&engine, "A").await, dec!(30) - a);
    assert_eq!(allocatable(&engine, "B").await, dec!(40) - b);
}

#[test_log::test(tokio::test)]
async fn test_unserved_destination_is_rejected() {
    let (engine, _) = create_test_engine(vec![
        create_test_carrier("A", &["US", "CA"], dec!(30), "8-16"),
        create_test_carrier("B", &["US"], dec!(40), "0-24"),
    ]);

    let result = engine
        .allocate_value(json!({"requested_tps": 50, "destinations": ["MX"], "peak_window": "9-12"}))
        .await;

    assert_eq!(result.rejection(), Some(&RejectionReason::NoCarrierForDestinations));
    assert_eq!(allocatable(&engine, "A").await, dec!(30));
    assert_eq!(allocatable(&engine, "B").await, dec!(40));
}

#[test_log::test(tokio::test)]
async fn test_exhausted_carrier_is_rejected() {
    let (engine, _) = create_test_engine(vec![create_test_carrier("A", &["US"], dec!(0), "0-24")]);

    let result = engine
        .allocate_value(json!({"requested_tps": 10, "destinations": ["US"]}))
        .await;

    assert_eq!(result.rejection(), Some(&RejectionReason::NoCapacityAvailable));
}

#[test_log::test(tokio::test)]
async fn test_disjoint_peak_window_is_rejected() {
    let (engine, _) = create_test_engine(vec![create_test_carrier("A", &["US"], dec!(100), "0-6")]);

    let result = engine
        .allocate_value(json!({"requested_tps": 10, "destinations": ["US"], "peak_window": "12-14"}))
        .await;

    assert_eq!(result.rejection(), Some(&RejectionReason::NoPeakWindowOverlap));
    assert_eq!(allocatable(&engine, "A").await, dec!(100));
}

#[test_log::test(tokio::test)]
async fn test_insufficient_total_capacity_is_rejected() {
    let (engine, _) = create_test_engine(vec![
        create_test_carrier("A", &["US"], dec!(10), "0-24"),
        create_test_carrier("B", &["CA"], dec!(10), "0-24"),
    ]);

    let result = engine
        .allocate_value(json!({"requested_tps": 30, "destinations": ["US", "CA"]}))
        .await;

    assert_eq!(result.rejection(), Some(&RejectionReason::NoFeasibleAllocation));
    assert_eq!(allocatable(&engine, "A").await, dec!(10));
    assert_eq!(allocatable(&engine, "B").await, dec!(10));
}

#[test_log::test(tokio::test)]
async fn test_unmeetable_destination_share_is_rejected() {
    // Plenty of total capacity, but CA's even share (20) exceeds what CA carriers have left
    let (engine, _) = create_test_engine(vec![
        create_test_carrier("A", &["US"], dec!(100), "0-24"),
        create_test_carrier("B", &["CA"], dec!(15), "0-24"),
    ]);

    let result = engine
        .allocate_value(json!({"requested_tps": 40, "destinations": ["US", "CA"]}))
        .await;

    assert_eq!(result.rejection(), Some(&RejectionReason::NoFeasibleAllocation));
}

#[test_log::test(tokio::test)]
async fn test_fractional_request_is_fully_allocated() {
    let (engine, _) = create_test_engine(vec![
        create_test_carrier("A", &["US"], dec!(5.25), "0-24"),
        create_test_carrier("B", &["US"], dec!(10), "0-24"),
    ]);

    let result = engine
        .allocate_value(json!({"requested_tps": 12.5, "destinations": ["US"]}))
        .await;

    let total: Decimal = shares(&result).iter().map(|s| s.allocated_tps).sum();
    assert_eq!(total, dec!(12.5));
    match &result {
        AllocationResult::Success {
            total_allocated_tps,
            total_requested_tps,
            ..
        } => {
            assert_eq!(*total_allocated_tps, dec!(12.5));
            assert_eq!(*total_requested_tps, dec!(12.5));
        }
        AllocationResult::Rejected { .. } => unreachable!(),
    }
}

#[test_log::test(tokio::test)]
async fn test_repeated_requests_drain_capacity_then_reject() {
    let (engine, audit) = create_test_engine(vec![create_test_carrier("A", &["US"], dec!(25), "0-24")]);

    for expected_left in [dec!(15), dec!(5)] {
        let result = engine
            .allocate_value(json!({"requested_tps": 10, "destinations": ["US"]}))
            .await;
        assert!(result.is_success());
        assert_eq!(allocatable(&engine, "A").await, expected_left);
    }

    let result = engine
        .allocate_value(json!({"requested_tps": 10, "destinations": ["US"]}))
        .await;
    assert_eq!(result.rejection(), Some(&RejectionReason::NoFeasibleAllocation));
    assert_eq!(allocatable(&engine, "A").await, dec!(5));

    assert_eq!(audit.records().len(), 3);
}

#[test_log::test(tokio::test)]
async fn test_application_serves_json_lines() {
    let dir = tempfile::tempdir().unwrap();
    let carriers_path = dir.path().join("carriers.yaml");
    let mut file = std::fs::File::create(&carriers_path).unwrap();
    write!(
        file,
        r#"
carriers:
  - carrier_name: A
    allowed_tps: 100
    avg_tps_actual: 70
    allocatable_tps: 30
    actual_peak_start_time: 8
    actual_peak_end_time: 16
    supported_countries_list: [US, CA]
  - carrier_name: B
    allowed_tps: 100
    avg_tps_actual: 60
    allocatable_tps: 40
    actual_peak_start_time: 0
    actual_peak_end_time: 24
    supported_countries_list: [US]
"#
    )
    .unwrap();

    let config = file_config(Some(carriers_path));

    let input = concat!(
        r#"{"requested_tps": 50, "destinations": ["US", "CA"], "peak_window": "9-12"}"#,
        "\n",
        "\n",
        r#"{"requested_tps": 10, "destinations": ["MX"]}"#,
        "\n",
        "not json\n",
        r#"{"requested_tps": 50, "destinations": ["US", "CA"], "peak_window": "9-12"}"#,
        "\n",
    );
    let mut output = Vec::new();

    let app = Application::new(config).await.unwrap();
    app.serve(input.as_bytes(), &mut output, std::future::pending()).await.unwrap();

    let results: Vec<Value> = String::from_utf8(output)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(results.len(), 4);

    assert_eq!(results[0]["status"], "success");
    assert_eq!(results[0]["total_allocated_tps"], 50.0);
    assert_eq!(results[0]["allocations"].as_array().unwrap().len(), 2);

    assert_eq!(results[1]["status"], "failure");
    assert_eq!(results[1]["message"], "No carriers found supporting the requested destinations");

    assert_eq!(results[2]["status"], "failure");
    assert_eq!(results[2]["reason"], "malformed_request");

    // 20 TPS left in total, so the same request no longer fits
    assert_eq!(results[3]["status"], "failure");
    assert_eq!(results[3]["reason"], "no_feasible_allocation");
}

#[test_log::test(tokio::test)]
async fn test_refresh_does_not_restore_committed_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let carriers_path = dir.path().join("carriers.yaml");
    std::fs::write(
        &carriers_path,
        r#"
carriers:
  - carrier_name: A
    allowed_tps: 100
    avg_tps_actual: 70
    actual_peak_hour: 10
    supported_countries_list: [US]
"#,
    )
    .unwrap();

    let store = Arc::new(InMemoryCapacityStore::new());
    let refresher = CapacityRefresher::new(store.clone(), Arc::new(FileCarrierSource::new(&carriers_path)));
    refresher.refresh_once().await.unwrap();
    assert_eq!(store.get("A").await.unwrap().allocatable_tps, dec!(30));

    let engine = AllocationEngine::new(store.clone(), Arc::new(NoopAuditSink), EngineConfig::default());

    let mut committed = Decimal::ZERO;
    for round in 0..3 {
        let result = engine
            .allocate_value(json!({"requested_tps": 30, "destinations": ["US"]}))
            .await;
        if round == 0 {
            committed += shares(&result).iter().map(|s| s.allocated_tps).sum::<Decimal>();
        } else {
            assert_eq!(result.rejection(), Some(&RejectionReason::NoCapacityAvailable));
        }

        // The profile export still reports 30 of headroom
        refresher.refresh_once().await.unwrap();
        assert_eq!(store.get("A").await.unwrap().allocatable_tps, Decimal::ZERO);
    }

    assert_eq!(committed, dec!(30));
}

#[test_log::test(tokio::test)]
async fn test_application_startup_errors() {
    assert!(matches!(Application::new(file_config(None)).await, Err(Error::Config { .. })));

    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.yaml");
    match Application::new(file_config(Some(missing))).await {
        Err(Error::Other(e)) => assert!(format!("{e:#}").contains("does not exist"), "{e:#}"),
        Err(e) => panic!("expected a carrier file error, got {e}"),
        Ok(_) => panic!("expected startup to fail"),
    }
}

#[test_log::test(tokio::test)]
async fn test_unreadable_request_stream_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let carriers_path = dir.path().join("carriers.yaml");
    std::fs::write(
        &carriers_path,
        "carriers:\n  - {carrier_name: A, allowed_tps: 100, avg_tps_actual: 70, supported_countries_list: [US]}\n",
    )
    .unwrap();

    let mut input = br#"{"requested_tps": 10, "destinations": ["US"]}"#.to_vec();
    input.extend_from_slice(b"\n\xff\xfe\n");
    let mut output = Vec::new();

    let app = Application::new(file_config(Some(carriers_path))).await.unwrap();
    let served = app.serve(input.as_slice(), &mut output, std::future::pending()).await;
    assert!(matches!(served, Err(Error::Io(_))), "{served:?}");

    // The line before the bad bytes was still answered
    let output = String::from_utf8(output).unwrap();
    assert_eq!(output.lines().count(), 1);
    assert!(output.contains(r#""status":"success""#), "{output}");
}
