pub mod ingest_warning;

use chrono::{DateTime, NaiveDateTime, Utc};
use common_types::format::{format_ch_seconds, CH_SECONDS_FORMAT};
use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize_datetime<S>(timestamp: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_ch_seconds(*timestamp))
}

pub fn deserialize_datetime<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    NaiveDateTime::parse_from_str(&raw, CH_SECONDS_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(serde::de::Error::custom)
}
