//! Pre-connection filtering of scan results.
//!
//! Runs on the scan-result delivery path, so everything here is pure and
//! allocation-free.

use crate::{
    types::{AdvertisementRecord, StationId},
    PUCK_MANUFACTURER_ID,
};

/// Manufacturer payload a record carries under [`PUCK_MANUFACTURER_ID`]
#[must_use]
pub fn manufacturer_payload(record: &AdvertisementRecord) -> Option<&[u8]> {
    record
        .manufacturer_data
        .get(&PUCK_MANUFACTURER_ID)
        .map(Vec::as_slice)
}

/// Check if an advertisement comes from the Puck paired with `expected`
///
/// The payload under [`PUCK_MANUFACTURER_ID`] must equal the station token
/// byte for byte. A missing entry, a length difference or any differing byte
/// is simply a non-match so scanning can continue.
#[must_use]
pub fn matches_station(record: &AdvertisementRecord, expected: &StationId) -> bool {
    manufacturer_payload(record).is_some_and(|payload| payload == expected.as_bytes())
}

/// Station token a Puck advertises, if the payload is a valid token
#[must_use]
pub fn station_of(record: &AdvertisementRecord) -> Option<StationId> {
    manufacturer_payload(record).and_then(|payload| StationId::from_bytes(payload).ok())
}
