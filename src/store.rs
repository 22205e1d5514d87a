//! Read-only access to the external occupancy observation store.
//!
//! The store is populated by a separate ingestion pipeline; this crate only
//! issues filtered reads against the `observations` table. Store failures
//! are surfaced to the caller as-is, never retried here.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres, Row};
use thiserror::Error;

use crate::models::{clean_postcode, ObservationRecord};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("observation store query failed: {0}")]
    Query(#[from] sqlx::Error),
}

/// Day and postcode predicates pushed down to the store. An absent field
/// disables that predicate (matches every record).
#[derive(Clone, Debug, Default)]
pub struct ObservationFilters {
    /// Exact, case-sensitive weekday name as stored (e.g. "Monday").
    pub day: Option<String>,
    /// Compared comma-stripped on both sides.
    pub postcode: Option<String>,
}

impl ObservationFilters {
    pub fn matches(&self, record: &ObservationRecord) -> bool {
        if let Some(day) = &self.day {
            if record.day_of_week != *day {
                return false;
            }
        }
        if let Some(postcode) = &self.postcode {
            if clean_postcode(&record.postcode) != clean_postcode(postcode) {
                return false;
            }
        }
        true
    }
}

#[async_trait]
pub trait ObservationStore: Send + Sync {
    /// Every observation satisfying the filters, in no particular order.
    async fn fetch(
        &self,
        filters: &ObservationFilters,
    ) -> Result<Vec<ObservationRecord>, StoreError>;
}

/// Postgres-backed observation store.
pub struct PgObservationStore {
    pool: Pool<Postgres>,
}

impl PgObservationStore {
    pub async fn connect(database_url: &str) -> Result<PgObservationStore, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(PgObservationStore { pool })
    }

    pub fn with_pool(pool: Pool<Postgres>) -> PgObservationStore {
        PgObservationStore { pool }
    }

    /// Round-trips a trivial query, for health checks.
    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ObservationStore for PgObservationStore {
    async fn fetch(
        &self,
        filters: &ObservationFilters,
    ) -> Result<Vec<ObservationRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT address, postcode, suburb, day_of_week, status_description, \
                    status_timestamp, lat, lon \
             FROM observations \
             WHERE ($1::text IS NULL OR day_of_week = $1) \
               AND ($2::text IS NULL OR REPLACE(postcode, ',', '') = $2)",
        )
        .bind(filters.day.as_deref())
        .bind(filters.postcode.as_deref().map(clean_postcode))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(ObservationRecord {
                    address: row.try_get("address")?,
                    postcode: row.try_get("postcode")?,
                    suburb: row.try_get("suburb")?,
                    day_of_week: row.try_get("day_of_week")?,
                    status_description: row.try_get("status_description")?,
                    status_timestamp: row.try_get("status_timestamp")?,
                    lat: row.try_get("lat")?,
                    lon: row.try_get("lon")?,
                })
            })
            .collect()
    }
}
