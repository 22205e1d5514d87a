use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::stop_index::{Proximity, TransitMatch};

/// Status text marking a free bay in the observation store.
pub const UNOCCUPIED: &str = "Unoccupied";

/// One sampled occupancy reading from the external store. Ingested by a
/// separate pipeline; this crate only ever reads them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub address: String,
    pub postcode: String,
    pub suburb: String,
    pub day_of_week: String,
    pub status_description: String,
    pub status_timestamp: NaiveDateTime,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

impl ObservationRecord {
    pub fn is_unoccupied(&self) -> bool {
        self.status_description == UNOCCUPIED
    }
}

/// Request-level filters. An absent field disables that predicate entirely;
/// it never means "match nothing".
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RecommendationCriteria {
    pub day: Option<String>,
    /// 12-hour clock label, e.g. "3 PM" or "12:30 AM". A label that fails to
    /// parse also disables the hour predicate.
    pub time: Option<String>,
    pub postcode: Option<String>,
}

/// Strips the thousands separators that leak into postcodes upstream, so
/// "3,000" and "3000" compare equal.
pub fn clean_postcode(postcode: &str) -> String {
    postcode.replace(',', "")
}

/// One recommended parking location. Produced fresh per request, never
/// persisted. Ordering is decided by the ranking tiers before enrichment.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationRow {
    pub address: String,
    /// Comma-stripped.
    pub postcode: String,
    pub suburb: String,
    /// Share of observations that found the bay free, in [0, 1].
    pub free_rate: f64,
    pub total_samples: i64,
    pub latest_ts: NaiveDateTime,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub nearest_stop: Option<TransitMatch>,
    pub proximity: Proximity,
}
