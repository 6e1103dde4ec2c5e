//! Serializes a [`Duration`] as an integer number of milliseconds.
//!
//! Used with `#[serde(with = "volta_common::utils::serde_millis")]` so config
//! files read `"maxRecheckDelay": 5000` instead of `{ "secs": 5, "nanos": 0 }`.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    serializer.serialize_u64(millis)
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}
