use serde::de::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::Display;
use std::ops::{Deref, Neg};
use std::str::FromStr;
use std::time::Duration;

pub fn parse_duration(s: &str) -> Result<Duration, String> {
    cyborgtime::parse_duration(s).map_err(|e| format!("Invalid duration: {e}"))
}

/// A duration as written in the configuration file, e.g. `14d` or `30s`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedDuration {
    inner: Duration,
}

impl From<Duration> for ParsedDuration {
    fn from(inner: Duration) -> Self {
        ParsedDuration { inner }
    }
}

impl From<u64> for ParsedDuration {
    fn from(seconds: u64) -> Self {
        Duration::from_secs(seconds).into()
    }
}

impl Deref for ParsedDuration {
    type Target = Duration;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl FromStr for ParsedDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_duration(s).map(ParsedDuration::from)
    }
}

impl Display for ParsedDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match time::Duration::try_from(self.inner) {
            Ok(duration) => write!(f, "{}", humanize_duration(duration)),
            Err(_) => write!(f, "Time too long to display"),
        }
    }
}

impl Serialize for ParsedDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.inner.subsec_nanos() == 0 {
            serializer.serialize_str(&format!("{}s", self.inner.as_secs()))
        } else {
            // Finest unit the configuration needs, e.g. for a short debounce
            serializer.serialize_str(&format!("{}ms", self.inner.as_millis()))
        }
    }
}

impl<'de> Deserialize<'de> for ParsedDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

/// Converts a signed `time` duration into a std duration, clamping negative durations to zero
pub fn saturating_std_duration(duration: time::Duration) -> Duration {
    Duration::try_from(duration).unwrap_or(Duration::ZERO)
}

pub fn humanize_duration(mut duration: time::Duration) -> String {
    const SECONDS_IN_MINUTE: i64 = 60;
    const SECONDS_IN_HOUR: i64 = 3600;
    const SECONDS_IN_DAY: i64 = 86400;
    const SECONDS_IN_MONTH: i64 = 2_630_016; // Approximation (30.44 days)
    const SECONDS_IN_YEAR: i64 = 31_557_600; // Approximation (365.25 days)

    if duration.is_negative() {
        duration = duration.neg();
    }

    let mut remaining_seconds = duration.whole_seconds();

    let units = [
        ("year", SECONDS_IN_YEAR),
        ("month", SECONDS_IN_MONTH),
        ("day", SECONDS_IN_DAY),
        ("hour", SECONDS_IN_HOUR),
        ("minute", SECONDS_IN_MINUTE),
    ];
    let mut components = Vec::new();
    for (unit, seconds_per_unit) in units {
        let amount = remaining_seconds / seconds_per_unit;
        remaining_seconds %= seconds_per_unit;
        if amount > 0 {
            components.push(format!("{amount} {unit}{}", if amount > 1 { "s" } else { "" }));
        }
    }
    if remaining_seconds > 0 || components.is_empty() {
        components.push(format!(
            "{remaining_seconds} second{}",
            if remaining_seconds == 1 { "" } else { "s" }
        ));
    }

    components.join(", ")
}
