//! Content fingerprints for trip shapes
//!
//! Two trips share a fingerprint when destination, interest set and duration
//! match after normalisation. Interest order and letter case never matter.

use sha2::{Digest, Sha256};

use crate::types::Trip;

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Fingerprint of a trip shape as a lowercase hex SHA-256 digest
pub fn fingerprint<'a, I>(destination: &str, interests: I, duration_days: u32) -> String
where
    I: IntoIterator<Item = &'a String>,
{
    let mut tags: Vec<String> = interests
        .into_iter()
        .map(|t| normalize(t))
        .filter(|t| !t.is_empty())
        .collect();
    tags.sort();
    tags.dedup();

    let mut hasher = Sha256::new();
    hasher.update(normalize(destination).as_bytes());
    hasher.update([0x1f]);
    hasher.update(tags.join("\u{1e}").as_bytes());
    hasher.update([0x1f]);
    hasher.update(duration_days.to_le_bytes());
    hex::encode(hasher.finalize())
}

pub fn trip_fingerprint(trip: &Trip) -> String {
    fingerprint(&trip.destination, &trip.interests, trip.duration_days)
}
