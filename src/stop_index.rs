//! Nearest-transit-stop index built from a static GeoJSON point dataset.
//!
//! The stop set is loaded once at process start and never changes, so
//! nearest-neighbor results are memoized forever: the cache is keyed by the
//! query coordinate quantized to 6 decimal places (~0.11 m) and entries are
//! never invalidated.

use dashmap::DashMap;
use geojson::GeoJson;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TransitStop {
    pub id: String,
    pub name: String,
    pub mode: String,
    pub lat: f64,
    pub lon: f64,
}

/// A nearest-neighbor result: the stop plus the great-circle distance from
/// the query point, rounded to the nearest meter.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TransitMatch {
    pub stop: TransitStop,
    pub distance_m: f64,
}

/// Coarse walking-distance bucket for a transit match.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Proximity {
    Near,
    Moderate,
    Far,
    Unknown,
}

impl Proximity {
    /// Boundaries are inclusive on the lower tier: exactly 50 m is Near and
    /// exactly 600 m is Moderate.
    pub fn classify(distance_m: f64) -> Proximity {
        if !distance_m.is_finite() {
            Proximity::Unknown
        } else if distance_m <= 50.0 {
            Proximity::Near
        } else if distance_m <= 600.0 {
            Proximity::Moderate
        } else {
            Proximity::Far
        }
    }
}

#[derive(Error, Debug)]
pub enum StopIndexError {
    #[error("failed to read stop dataset '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse stop dataset as GeoJSON: {0}")]
    Parse(#[from] geojson::Error),
    #[error("stop dataset is not a GeoJSON FeatureCollection")]
    NotACollection,
}

/// Immutable set of transit stops with a memoizing nearest-neighbor query.
///
/// Each index owns its cache, so tests can construct isolated instances.
pub struct StopIndex {
    stops: Vec<TransitStop>,
    cache: DashMap<(i64, i64), TransitMatch>,
    scans: AtomicU64,
}

impl StopIndex {
    /// Loads the stop dataset from disk. Intended to run once at startup;
    /// any failure here should abort process initialization.
    pub fn from_geojson_file(path: impl AsRef<Path>) -> Result<StopIndex, StopIndexError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| StopIndexError::Io {
            path: path.display().to_string(),
            source,
        })?;
        StopIndex::from_geojson_str(&raw)
    }

    /// Builds the index from a GeoJSON FeatureCollection of Point features
    /// (coordinates are `[lon, lat]`). Features without a finite coordinate
    /// pair are dropped; missing metadata falls back to a positional
    /// placeholder name and the "other" mode.
    pub fn from_geojson_str(raw: &str) -> Result<StopIndex, StopIndexError> {
        let geojson: GeoJson = raw.parse()?;
        let GeoJson::FeatureCollection(collection) = geojson else {
            return Err(StopIndexError::NotACollection);
        };

        let stops = collection
            .features
            .iter()
            .enumerate()
            .filter_map(|(idx, feature)| {
                let geometry = feature.geometry.as_ref()?;
                let geojson::Value::Point(coordinates) = &geometry.value else {
                    return None;
                };
                let [lon, lat, ..] = coordinates.as_slice() else {
                    return None;
                };
                if !lat.is_finite() || !lon.is_finite() {
                    return None;
                }

                let props = feature.properties.as_ref();
                let name = property_string(props, &["name", "stop_name", "title", "station_name"])
                    .unwrap_or_else(|| format!("Stop #{}", idx + 1));
                let mode =
                    property_string(props, &["mode", "route_type", "transport", "public_transport"])
                        .unwrap_or_else(|| String::from("other"));
                let id = property_string(props, &["stop_id"]).unwrap_or_else(|| idx.to_string());

                Some(TransitStop {
                    id,
                    name,
                    mode,
                    lat: *lat,
                    lon: *lon,
                })
            })
            .collect::<Vec<TransitStop>>();

        Ok(StopIndex {
            stops,
            cache: DashMap::new(),
            scans: AtomicU64::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.stops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stops.is_empty()
    }

    /// Number of full linear scans performed so far; cache hits do not scan.
    pub fn scan_count(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }

    fn quantize(lat: f64, lon: f64) -> (i64, i64) {
        ((lat * 1e6).round() as i64, (lon * 1e6).round() as i64)
    }

    /// Returns the closest stop to the query point, or `None` only when the
    /// stop set is empty. Exact distance ties go to the stop loaded first.
    pub fn nearest(&self, lat: f64, lon: f64) -> Option<TransitMatch> {
        if self.stops.is_empty() {
            return None;
        }

        let key = StopIndex::quantize(lat, lon);
        if let Some(hit) = self.cache.get(&key) {
            return Some(hit.clone());
        }

        self.scans.fetch_add(1, Ordering::Relaxed);
        let mut best: Option<(&TransitStop, f64)> = None;
        for stop in &self.stops {
            let distance = haversine_distance(lat, lon, stop.lat, stop.lon);
            let better = match best {
                None => true,
                Some((_, best_distance)) => distance < best_distance,
            };
            if better {
                best = Some((stop, distance));
            }
        }

        let (stop, distance) = best?;
        let matched = TransitMatch {
            stop: stop.clone(),
            distance_m: distance.round(),
        };
        // Concurrent writers for the same key always compute the same value,
        // so a last-writer-wins race is harmless.
        self.cache.insert(key, matched.clone());
        Some(matched)
    }
}

/// First usable value among `keys`, accepting both string and numeric
/// property values (route_type in particular is often numeric).
fn property_string(props: Option<&geojson::JsonObject>, keys: &[&str]) -> Option<String> {
    let props = props?;
    for key in keys {
        match props.get(*key) {
            Some(serde_json::Value::String(text)) if !text.is_empty() => return Some(text.clone()),
            Some(serde_json::Value::Number(number)) => return Some(number.to_string()),
            _ => {}
        }
    }
    None
}
