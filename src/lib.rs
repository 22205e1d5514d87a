//! Parking recommendation backend.
//!
//! Ranks parking locations by historical bay occupancy for a requested
//! day-of-week / time-of-day / postcode, and annotates each result with the
//! nearest public transit stop and a coarse walking-distance bucket.

pub mod models;
pub mod recommendations;
pub mod stop_index;
pub mod store;
