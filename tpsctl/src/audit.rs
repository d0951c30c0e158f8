//! Audit trail for allocation decisions.
//!
//! Every call to the engine produces exactly one [`AuditRecord`], approved or rejected,
//! carrying the request metadata and the result as returned to the caller. Sinks are
//! best-effort: a sink failure is logged and never changes the allocation outcome.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::allocation::AllocationResult;
use crate::request::AllocationRequest;
use crate::types::{AllocationId, PeakWindow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditStatus {
    Approved,
    Rejected,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Approved => "Approved",
            AuditStatus::Rejected => "Rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub allocation_id: AllocationId,
    pub requester_id: Option<String>,
    /// Absent when the payload never validated
    pub requested_tps: Option<Decimal>,
    pub destinations: Vec<String>,
    pub peak_window: Option<PeakWindow>,
    pub status: AuditStatus,
    /// The result exactly as returned to the caller
    pub allocation_detail: Value,
    pub metadata: Value,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    /// Build the record for one engine call. `request` is `None` for malformed payloads.
    pub fn new(request: Option<&AllocationRequest>, result: &AllocationResult) -> Self {
        let status = if result.is_success() {
            AuditStatus::Approved
        } else {
            AuditStatus::Rejected
        };

        Self {
            allocation_id: result.allocation_id(),
            requester_id: request.and_then(|r| r.metadata.requester_id.clone()),
            requested_tps: request.map(|r| r.requested_tps),
            destinations: request
                .map(|r| r.destinations.iter().map(|d| d.to_string()).collect())
                .unwrap_or_default(),
            peak_window: request.map(|r| r.peak_window),
            status,
            allocation_detail: serde_json::to_value(result).unwrap_or(Value::Null),
            metadata: request
                .and_then(|r| serde_json::to_value(&r.metadata).ok())
                .unwrap_or(Value::Null),
            recorded_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> anyhow::Result<()>;
}

/// Writes audit records to the structured log under the `tpsctl::audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: AuditRecord) -> anyhow::Result<()> {
        info!(
            target: "tpsctl::audit",
            allocation_id = %record.allocation_id,
            status = record.status.as_str(),
            requester_id = record.requester_id.as_deref().unwrap_or("-"),
            requested_tps = ?record.requested_tps,
            destinations = ?record.destinations,
            detail = %record.allocation_detail,
            "Allocation decision"
        );
        Ok(())
    }
}

/// Discards every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn record(&self, _record: AuditRecord) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Keeps records in memory, for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAuditSink {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, record: AuditRecord) -> anyhow::Result<()> {
        self.records.lock().push(record);
        Ok(())
    }
}
