//! The recommendation engine.
//!
//! Two ranking tiers are tried in order: a grouped occupancy aggregation,
//! then (only when the first yields nothing) a most-recent-free fallback.
//! Whichever row set is produced is passed through a pure per-row transit
//! enrichment pass. At most three rows are ever returned.

use ahash::AHashMap;
use chrono::{NaiveDateTime, Timelike};
use tracing::debug;

use crate::models::{clean_postcode, ObservationRecord, RecommendationCriteria, RecommendationRow};
use crate::stop_index::{Proximity, StopIndex};
use crate::store::{ObservationFilters, ObservationStore, StoreError};

pub const MAX_RESULTS: usize = 3;

/// Parses a 12-hour clock label ("3 PM", "12:30 AM") into an hour in 0..=23.
/// `None` means the label is unusable; callers treat that as "no hour
/// filter" rather than an error.
pub fn to_24h(label: &str) -> Option<u32> {
    let mut parts = label.split_whitespace();
    let clock = parts.next()?;
    let meridiem = parts.next()?;

    let hour: u32 = clock.split(':').next()?.parse().ok()?;
    if !(1..=12).contains(&hour) {
        return None;
    }

    match meridiem.to_ascii_uppercase().as_str() {
        "AM" => Some(if hour == 12 { 0 } else { hour }),
        "PM" => Some(if hour == 12 { 12 } else { hour + 12 }),
        _ => None,
    }
}

/// Inclusive hour window [h-1, h+1] clamped to [0, 23]. Requests at the day
/// boundary get a narrower window rather than one wrapping past midnight.
pub fn hour_window(hour: u32) -> (u32, u32) {
    (hour.saturating_sub(1), (hour + 1).min(23))
}

fn store_filters(criteria: &RecommendationCriteria) -> ObservationFilters {
    ObservationFilters {
        day: criteria.day.clone(),
        postcode: criteria.postcode.as_deref().map(clean_postcode),
    }
}

struct GroupAccumulator {
    unoccupied: i64,
    total: i64,
    latest_ts: NaiveDateTime,
    lat_sum: f64,
    lon_sum: f64,
    coord_count: u32,
}

/// Grouped occupancy ranking over pre-filtered observations: one row per
/// (address, comma-stripped postcode, suburb) with its free rate, sample
/// count, latest timestamp and coordinate centroid, ordered by free rate
/// descending then latest timestamp descending, truncated to [`MAX_RESULTS`].
pub fn rank_groups(
    records: &[ObservationRecord],
    window: Option<(u32, u32)>,
) -> Vec<RecommendationRow> {
    let mut groups: AHashMap<(String, String, String), GroupAccumulator> = AHashMap::new();

    for record in records {
        if let Some((start, end)) = window {
            let hour = record.status_timestamp.hour();
            if hour < start || hour > end {
                continue;
            }
        }

        let key = (
            record.address.clone(),
            clean_postcode(&record.postcode),
            record.suburb.clone(),
        );
        let entry = groups.entry(key).or_insert_with(|| GroupAccumulator {
            unoccupied: 0,
            total: 0,
            latest_ts: record.status_timestamp,
            lat_sum: 0.0,
            lon_sum: 0.0,
            coord_count: 0,
        });

        entry.total += 1;
        if record.is_unoccupied() {
            entry.unoccupied += 1;
        }
        if record.status_timestamp > entry.latest_ts {
            entry.latest_ts = record.status_timestamp;
        }
        if let (Some(lat), Some(lon)) = (record.lat, record.lon) {
            if lat.is_finite() && lon.is_finite() {
                entry.lat_sum += lat;
                entry.lon_sum += lon;
                entry.coord_count += 1;
            }
        }
    }

    let mut rows = groups
        .into_iter()
        .map(|((address, postcode, suburb), acc)| {
            let centroid = (acc.coord_count > 0).then(|| {
                (
                    acc.lat_sum / f64::from(acc.coord_count),
                    acc.lon_sum / f64::from(acc.coord_count),
                )
            });
            RecommendationRow {
                address,
                postcode,
                suburb,
                free_rate: acc.unoccupied as f64 / acc.total as f64,
                total_samples: acc.total,
                latest_ts: acc.latest_ts,
                lat: centroid.map(|(lat, _)| lat),
                lon: centroid.map(|(_, lon)| lon),
                nearest_stop: None,
                proximity: Proximity::Unknown,
            }
        })
        .collect::<Vec<RecommendationRow>>();

    rows.sort_by(|a, b| {
        b.free_rate
            .total_cmp(&a.free_rate)
            .then_with(|| b.latest_ts.cmp(&a.latest_ts))
    });
    rows.truncate(MAX_RESULTS);
    rows
}

/// Most recent individually-free observations, one row per observation, with
/// `free_rate` fixed at 1.0 and `total_samples` at 1.
pub fn latest_unoccupied(records: &[ObservationRecord]) -> Vec<RecommendationRow> {
    let mut free = records
        .iter()
        .filter(|record| record.is_unoccupied())
        .collect::<Vec<&ObservationRecord>>();
    free.sort_by(|a, b| b.status_timestamp.cmp(&a.status_timestamp));

    free.into_iter()
        .take(MAX_RESULTS)
        .map(|record| RecommendationRow {
            address: record.address.clone(),
            postcode: clean_postcode(&record.postcode),
            suburb: record.suburb.clone(),
            free_rate: 1.0,
            total_samples: 1,
            latest_ts: record.status_timestamp,
            lat: record.lat,
            lon: record.lon,
            nearest_stop: None,
            proximity: Proximity::Unknown,
        })
        .collect()
}

/// First tier: aggregated ranking. The hour-window predicate only exists
/// here; the fallback tier ignores the time label entirely.
pub async fn aggregation_tier(
    store: &dyn ObservationStore,
    criteria: &RecommendationCriteria,
) -> Result<Vec<RecommendationRow>, StoreError> {
    let records = store.fetch(&store_filters(criteria)).await?;
    let window = criteria.time.as_deref().and_then(to_24h).map(hour_window);
    Ok(rank_groups(&records, window))
}

/// Second tier: most recent free bays matching the same day/postcode
/// filters. There is no tier below this one.
pub async fn fallback_tier(
    store: &dyn ObservationStore,
    criteria: &RecommendationCriteria,
) -> Result<Vec<RecommendationRow>, StoreError> {
    let records = store.fetch(&store_filters(criteria)).await?;
    Ok(latest_unoccupied(&records))
}

/// Pure annotation pass: attaches the nearest stop and its proximity bucket
/// when the row carries finite coordinates. Never reorders, filters, or
/// drops a row.
pub fn enrich_row(mut row: RecommendationRow, index: &StopIndex) -> RecommendationRow {
    if let (Some(lat), Some(lon)) = (row.lat, row.lon) {
        if lat.is_finite() && lon.is_finite() {
            row.nearest_stop = index.nearest(lat, lon);
        }
    }
    row.proximity = match &row.nearest_stop {
        Some(matched) => Proximity::classify(matched.distance_m),
        None => Proximity::Unknown,
    };
    row
}

/// Runs the two ranking tiers in order and enriches whichever row set the
/// first non-empty tier produced. Zero rows from both tiers is a valid
/// terminal state, not an error.
pub async fn recommend(
    store: &dyn ObservationStore,
    index: &StopIndex,
    criteria: &RecommendationCriteria,
) -> Result<Vec<RecommendationRow>, StoreError> {
    let mut rows = aggregation_tier(store, criteria).await?;
    if rows.is_empty() {
        debug!("aggregation tier produced no rows, trying fallback tier");
        rows = fallback_tier(store, criteria).await?;
    }
    Ok(rows
        .into_iter()
        .map(|row| enrich_row(row, index))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::{FailingStore, MemStore};
    use chrono::NaiveDate;

    fn ts(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn observation(
        address: &str,
        postcode: &str,
        day: &str,
        status: &str,
        timestamp: NaiveDateTime,
    ) -> ObservationRecord {
        ObservationRecord {
            address: address.to_string(),
            postcode: postcode.to_string(),
            suburb: String::from("Carlton"),
            day_of_week: day.to_string(),
            status_description: status.to_string(),
            status_timestamp: timestamp,
            lat: Some(-37.8),
            lon: Some(144.96),
        }
    }

    fn empty_index() -> StopIndex {
        StopIndex::from_geojson_str(r#"{ "type": "FeatureCollection", "features": [] }"#).unwrap()
    }

    fn one_stop_index() -> StopIndex {
        StopIndex::from_geojson_str(
            r#"{
                "type": "FeatureCollection",
                "features": [{
                    "type": "Feature",
                    "geometry": { "type": "Point", "coordinates": [144.96, -37.8] },
                    "properties": { "stop_id": "s1", "name": "Corner Stop", "mode": "tram" }
                }]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn to_24h_handles_meridiem_edges() {
        assert_eq!(to_24h("12:00 AM"), Some(0));
        assert_eq!(to_24h("12:00 PM"), Some(12));
        assert_eq!(to_24h("3 PM"), Some(15));
        assert_eq!(to_24h("11:30 am"), Some(11));
        assert_eq!(to_24h("noonish"), None);
        assert_eq!(to_24h("15 PM"), None);
        assert_eq!(to_24h(""), None);
    }

    #[test]
    fn hour_window_clamps_at_day_boundaries() {
        assert_eq!(hour_window(0), (0, 1));
        assert_eq!(hour_window(12), (11, 13));
        assert_eq!(hour_window(23), (22, 23));
    }

    #[test]
    fn rank_groups_orders_by_free_rate_then_recency() {
        let records = vec![
            // "A": 1/2 free, latest 09:00 on the 5th.
            observation("A", "3000", "Monday", "Unoccupied", ts(4, 9)),
            observation("A", "3000", "Monday", "Occupied", ts(5, 9)),
            // "B": all free, older.
            observation("B", "3000", "Monday", "Unoccupied", ts(3, 9)),
            // "C": all free, newer than B -> ties on free rate, wins on time.
            observation("C", "3000", "Monday", "Unoccupied", ts(6, 9)),
        ];
        let rows = rank_groups(&records, None);

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].address, "C");
        assert_eq!(rows[1].address, "B");
        assert_eq!(rows[2].address, "A");
        assert_eq!(rows[2].free_rate, 0.5);
        assert_eq!(rows[2].total_samples, 2);
        assert_eq!(rows[2].latest_ts, ts(5, 9));
        for pair in rows.windows(2) {
            assert!(pair[0].free_rate >= pair[1].free_rate);
        }
    }

    #[test]
    fn rank_groups_truncates_to_three() {
        let records = ["A", "B", "C", "D", "E"]
            .into_iter()
            .map(|address| observation(address, "3000", "Monday", "Unoccupied", ts(4, 9)))
            .collect::<Vec<ObservationRecord>>();
        assert_eq!(rank_groups(&records, None).len(), 3);
    }

    #[test]
    fn rank_groups_applies_hour_window() {
        let records = vec![
            observation("A", "3000", "Monday", "Unoccupied", ts(4, 8)),
            observation("A", "3000", "Monday", "Occupied", ts(4, 11)),
        ];
        // Window around 9 AM keeps only the 08:00 reading.
        let rows = rank_groups(&records, Some(hour_window(9)));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_samples, 1);
        assert_eq!(rows[0].free_rate, 1.0);

        // No window keeps both.
        let rows = rank_groups(&records, None);
        assert_eq!(rows[0].total_samples, 2);
    }

    #[test]
    fn rank_groups_strips_postcode_commas_and_averages_coordinates() {
        let mut first = observation("A", "3,000", "Monday", "Unoccupied", ts(4, 9));
        first.lat = Some(-37.0);
        first.lon = Some(144.0);
        let mut second = observation("A", "3000", "Monday", "Occupied", ts(4, 10));
        second.lat = Some(-39.0);
        second.lon = Some(146.0);
        // Missing coordinates are left out of the centroid, not zero-filled.
        let mut third = observation("A", "3000", "Monday", "Occupied", ts(4, 11));
        third.lat = None;
        third.lon = None;

        let rows = rank_groups(&[first, second, third], None);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].postcode, "3000");
        assert_eq!(rows[0].lat, Some(-38.0));
        assert_eq!(rows[0].lon, Some(145.0));
    }

    #[test]
    fn latest_unoccupied_projects_single_observations() {
        let records = vec![
            observation("A", "3000", "Monday", "Occupied", ts(6, 9)),
            observation("B", "3000", "Monday", "Unoccupied", ts(3, 9)),
            observation("C", "3000", "Monday", "Unoccupied", ts(5, 9)),
            observation("D", "3000", "Monday", "Unoccupied", ts(4, 9)),
            observation("E", "3000", "Monday", "Unoccupied", ts(2, 9)),
        ];
        let rows = latest_unoccupied(&records);

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].address, "C");
        assert_eq!(rows[1].address, "D");
        assert_eq!(rows[2].address, "B");
        for row in &rows {
            assert_eq!(row.free_rate, 1.0);
            assert_eq!(row.total_samples, 1);
        }
    }

    #[tokio::test]
    async fn recommend_aggregates_a_single_group() {
        let mut records = Vec::new();
        for day in 1..=5 {
            records.push(observation("A", "3000", "Monday", "Unoccupied", ts(day, 9)));
            records.push(observation("A", "3000", "Monday", "Occupied", ts(day, 10)));
        }
        let store = MemStore { records };
        let criteria = RecommendationCriteria {
            day: Some(String::from("Monday")),
            time: None,
            postcode: Some(String::from("3000")),
        };

        let rows = recommend(&store, &one_stop_index(), &criteria).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].address, "A");
        assert_eq!(rows[0].free_rate, 0.5);
        assert_eq!(rows[0].total_samples, 10);
        // Sitting on top of the only stop.
        let matched = rows[0].nearest_stop.as_ref().unwrap();
        assert_eq!(matched.stop.id, "s1");
        assert_eq!(rows[0].proximity, Proximity::Near);
    }

    #[tokio::test]
    async fn recommend_returns_empty_when_nothing_matches() {
        let store = MemStore {
            records: vec![observation("A", "3000", "Monday", "Unoccupied", ts(4, 9))],
        };
        let criteria = RecommendationCriteria {
            day: Some(String::from("Monday")),
            time: None,
            postcode: Some(String::from("9999")),
        };

        let rows = recommend(&store, &one_stop_index(), &criteria).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn recommend_falls_back_when_hour_window_empties_tier_one() {
        // The only matching records sit outside the requested window, so the
        // aggregation tier is empty; the fallback ignores the time label and
        // still surfaces the free bay.
        let store = MemStore {
            records: vec![
                observation("A", "3000", "Monday", "Unoccupied", ts(4, 20)),
                observation("B", "3000", "Monday", "Occupied", ts(4, 21)),
            ],
        };
        let criteria = RecommendationCriteria {
            day: Some(String::from("Monday")),
            time: Some(String::from("9 AM")),
            postcode: Some(String::from("3000")),
        };

        let rows = recommend(&store, &one_stop_index(), &criteria).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].address, "A");
        assert_eq!(rows[0].free_rate, 1.0);
        assert_eq!(rows[0].total_samples, 1);
    }

    #[tokio::test]
    async fn unparseable_time_label_disables_the_hour_filter() {
        let store = MemStore {
            records: vec![observation("A", "3000", "Monday", "Unoccupied", ts(4, 20))],
        };
        let criteria = RecommendationCriteria {
            day: Some(String::from("Monday")),
            time: Some(String::from("around lunch")),
            postcode: Some(String::from("3000")),
        };

        // Tier one matches despite the nonsense label: no partial matching.
        let rows = recommend(&store, &one_stop_index(), &criteria).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_samples, 1);
        assert_eq!(rows[0].free_rate, 1.0);
    }

    #[tokio::test]
    async fn enrichment_degrades_to_unknown_without_stops_or_coordinates() {
        let mut no_coords = observation("A", "3000", "Monday", "Unoccupied", ts(4, 9));
        no_coords.lat = None;
        no_coords.lon = None;
        let store = MemStore {
            records: vec![
                no_coords,
                observation("B", "3000", "Monday", "Unoccupied", ts(4, 9)),
            ],
        };
        let criteria = RecommendationCriteria::default();

        // Empty stop set: every row degrades, none are dropped.
        let rows = recommend(&store, &empty_index(), &criteria).await.unwrap();
        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert!(row.nearest_stop.is_none());
            assert_eq!(row.proximity, Proximity::Unknown);
        }
    }

    #[tokio::test]
    async fn store_failure_propagates() {
        let criteria = RecommendationCriteria::default();
        let result = recommend(&FailingStore, &one_stop_index(), &criteria).await;
        assert!(matches!(result, Err(StoreError::Query(_))));
    }
}
