//! Serde helpers for durations written as human strings ("30s", "5m", "1h 30m")

use serde::{de, Deserialize, Deserializer, Serializer};
use std::time::Duration;

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Text(String),
    Seconds(u64),
}

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*duration).to_string())
}

/// Accepts a humantime string or a bare number of seconds
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match RawDuration::deserialize(deserializer)? {
        RawDuration::Text(text) => humantime::parse_duration(text.trim()).map_err(de::Error::custom),
        RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
    }
}
