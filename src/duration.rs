//! Human-readable durations for configuration values ("500ms", "30s", "5m").

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{de, Deserialize, Deserializer, Serializer};

const UNITS: [(&str, u64); 5] = [
    ("ms", 1),
    ("s", 1_000),
    ("m", 60 * 1_000),
    ("h", 60 * 60 * 1_000),
    ("d", 24 * 60 * 60 * 1_000),
];

/// Parse a duration string like "250ms", "30s", "5m", "1h" or "1d".
///
/// The input is case-insensitive and surrounding whitespace is ignored.
///
/// ```
/// use evergreen_vault::duration::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
/// assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
/// ```
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .context("Duration must end with ms, s, m, h or d")?;
    let (num, unit) = s.split_at(split);

    let factor = UNITS
        .iter()
        .find(|(name, _)| *name == unit)
        .map(|(_, factor)| *factor)
        .with_context(|| format!("Unknown duration unit {unit:?}"))?;

    let num: u64 = num.parse().context("Invalid number in duration")?;
    let millis = num.checked_mul(factor).context("Duration is too large")?;

    Ok(Duration::from_millis(millis))
}

/// Format a duration using the largest unit that divides it evenly.
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis == 0 {
        return "0s".to_string();
    }

    UNITS
        .iter()
        .rev()
        .find(|(_, factor)| millis % u128::from(*factor) == 0)
        .map(|(unit, factor)| format!("{}{unit}", millis / u128::from(*factor)))
        .unwrap_or_else(|| format!("{millis}ms"))
}

/// Serde deserializer accepting either a duration string or a bare number of seconds.
///
/// Use with `#[serde(deserialize_with = "deserialize_duration")]`.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(s) => parse_duration(&s).map_err(de::Error::custom),
    }
}

pub fn serialize_duration<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_duration(*d))
}
