//! PostgreSQL capacity store.
//!
//! Commits lock the affected `carrier_capacity` rows with `SELECT ... FOR UPDATE` in
//! `carrier_id` order, check headroom, and apply every share in one transaction. Each applied
//! share is also added to the row's `committed_tps`, which refreshes subtract from incoming
//! headroom. Refreshes rewrite the table in a single transaction as well, so readers see
//! either the old carrier set or the new one.

use std::collections::BTreeSet;

use anyhow::anyhow;
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgRow};
use tracing::debug;

use crate::allocation::CarrierAllocation;
use crate::audit::{AuditRecord, AuditSink};
use crate::carrier::CarrierCapacityRecord;
use crate::types::{CountryCode, PeakWindow};

use super::{CapacityStore, Result, StoreError, normalise_record, validate_plan};

const SELECT_COLUMNS: &str =
    "carrier_id, allowed_tps, consumed_tps, allocatable_tps, peak_start, peak_end, supported_countries";

/// Capacity store and audit sink backed by PostgreSQL.
#[derive(Clone)]
pub struct PostgresCapacityStore {
    pool: PgPool,
}

impl PostgresCapacityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Other(anyhow!("migration failed: {e}")))
    }
}

fn record_from_row(row: &PgRow) -> Result<CarrierCapacityRecord> {
    let carrier_id: String = row.try_get("carrier_id")?;
    let peak_start: i16 = row.try_get("peak_start")?;
    let peak_end: i16 = row.try_get("peak_end")?;
    let countries: Vec<String> = row.try_get("supported_countries")?;

    let hour = |h: i16| u8::try_from(h).map_err(|_| anyhow!("peak hour {h} out of range for {carrier_id}"));
    let peak_window = PeakWindow::new(hour(peak_start)?, hour(peak_end)?).map_err(anyhow::Error::from)?;
    let supported_countries: BTreeSet<CountryCode> = countries
        .iter()
        .map(|c| c.parse::<CountryCode>())
        .collect::<std::result::Result<_, _>>()
        .map_err(anyhow::Error::from)?;

    Ok(CarrierCapacityRecord {
        allowed_tps: row.try_get("allowed_tps")?,
        consumed_tps: row.try_get("consumed_tps")?,
        allocatable_tps: row.try_get("allocatable_tps")?,
        peak_window,
        supported_countries,
        carrier_id,
    })
}

impl CapacityStore for PostgresCapacityStore {
    async fn snapshot(&self) -> Result<Vec<CarrierCapacityRecord>> {
        let rows = sqlx::query(&format!("SELECT {SELECT_COLUMNS} FROM carrier_capacity ORDER BY carrier_id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn get(&self, carrier_id: &str) -> Result<CarrierCapacityRecord> {
        let row = sqlx::query(&format!("SELECT {SELECT_COLUMNS} FROM carrier_capacity WHERE carrier_id = $1"))
            .bind(carrier_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(carrier_id.to_string()))?;
        record_from_row(&row)
    }

    async fn commit(&self, plan: &[CarrierAllocation]) -> Result<Vec<CarrierCapacityRecord>> {
        validate_plan(plan)?;

        let mut ids: Vec<String> = plan.iter().map(|p| p.carrier_id.clone()).collect();
        ids.sort();

        let mut tx = self.pool.begin().await?;

        let locked: Vec<(String, Decimal)> = sqlx::query_as(
            "SELECT carrier_id, allocatable_tps FROM carrier_capacity WHERE carrier_id = ANY($1) ORDER BY carrier_id FOR UPDATE",
        )
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await?;

        for share in plan {
            let available = locked
                .iter()
                .find(|(id, _)| *id == share.carrier_id)
                .map(|(_, tps)| *tps)
                .ok_or_else(|| StoreError::UnknownCarrier(share.carrier_id.clone()))?;
            if share.allocated_tps > available {
                // Dropping the transaction rolls it back
                return Err(StoreError::InsufficientCapacity {
                    carrier_id: share.carrier_id.clone(),
                    requested: share.allocated_tps,
                    available,
                });
            }
        }

        let mut updated = Vec::with_capacity(plan.len());
        for share in plan {
            let row = sqlx::query(&format!(
                "UPDATE carrier_capacity SET allocatable_tps = GREATEST(0, allocatable_tps - $2), \
                 committed_tps = committed_tps + $2, updated_at = now() \
                 WHERE carrier_id = $1 RETURNING {SELECT_COLUMNS}"
            ))
            .bind(&share.carrier_id)
            .bind(share.allocated_tps)
            .fetch_one(&mut *tx)
            .await?;
            updated.push(record_from_row(&row)?);
        }

        tx.commit().await?;
        updated.sort_by(|a, b| a.carrier_id.cmp(&b.carrier_id));
        Ok(updated)
    }

    async fn refresh(&self, records: Vec<CarrierCapacityRecord>) -> Result<usize> {
        let records: Vec<CarrierCapacityRecord> = records.into_iter().map(normalise_record).collect();
        let ids: Vec<String> = records.iter().map(|r| r.carrier_id.clone()).collect();

        let mut tx = self.pool.begin().await?;
        // Rows that survive keep their committed_tps
        sqlx::query("DELETE FROM carrier_capacity WHERE carrier_id <> ALL($1)")
            .bind(&ids)
            .execute(&mut *tx)
            .await?;

        let mut count = 0;
        for record in records {
            let countries: Vec<String> = record.supported_countries.iter().map(|c| c.to_string()).collect();
            sqlx::query(
                "INSERT INTO carrier_capacity \
                 (carrier_id, allowed_tps, consumed_tps, allocatable_tps, peak_start, peak_end, supported_countries) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 ON CONFLICT (carrier_id) DO UPDATE SET \
                 allowed_tps = EXCLUDED.allowed_tps, consumed_tps = EXCLUDED.consumed_tps, \
                 allocatable_tps = GREATEST(0, EXCLUDED.allocatable_tps - carrier_capacity.committed_tps), \
                 peak_start = EXCLUDED.peak_start, \
                 peak_end = EXCLUDED.peak_end, supported_countries = EXCLUDED.supported_countries, updated_at = now()",
            )
            .bind(&record.carrier_id)
            .bind(record.allowed_tps)
            .bind(record.consumed_tps)
            .bind(record.allocatable_tps)
            .bind(i16::from(record.peak_window.start()))
            .bind(i16::from(record.peak_window.end()))
            .bind(&countries)
            .execute(&mut *tx)
            .await?;
            count += 1;
        }

        tx.commit().await?;
        let held: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM carrier_capacity").fetch_one(&self.pool).await?;
        debug!(written = count, held, "Replaced carrier_capacity contents");
        Ok(usize::try_from(held).unwrap_or(count))
    }
}

#[async_trait]
impl AuditSink for PostgresCapacityStore {
    async fn record(&self, record: AuditRecord) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO allocation_audit \
             (allocation_id, requester_id, requested_tps, destinations, peak_window, status, allocation_description, metadata, recorded_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(record.allocation_id)
        .bind(&record.requester_id)
        .bind(record.requested_tps)
        .bind(&record.destinations)
        .bind(record.peak_window.map(|w| w.to_string()))
        .bind(record.status.as_str())
        .bind(&record.allocation_detail)
        .bind(&record.metadata)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
