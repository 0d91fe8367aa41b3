use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A duration stored and rendered as a compound unit string (`"1h30m"`,
/// `"5m"`, `"100ms"`). Rendering always produces the canonical form, so a
/// parsed `"5m"` re-renders as `"5m0s"` and task files written by earlier
/// releases load unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Duration(std::time::Duration);

impl Duration {
    pub const ZERO: Duration = Duration(std::time::Duration::ZERO);

    pub fn new(d: std::time::Duration) -> Self {
        Duration(d)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn as_std(&self) -> std::time::Duration {
        self.0
    }
}

impl From<std::time::Duration> for Duration {
    fn from(d: std::time::Duration) -> Self {
        Duration(d)
    }
}

impl FromStr for Duration {
    type Err = ParseDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseDurationError::Empty);
        }
        // A bare "0" is accepted without a unit.
        if s == "0" {
            return Ok(Duration::ZERO);
        }

        let mut total_nanos: u128 = 0;
        let mut rest = s;
        while !rest.is_empty() {
            let num_end = rest
                .char_indices()
                .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
                .map(|(i, _)| i)
                .unwrap_or(rest.len());
            if num_end == 0 {
                return Err(ParseDurationError::Invalid(s.to_string()));
            }
            let value: f64 = rest[..num_end]
                .parse()
                .map_err(|_| ParseDurationError::Invalid(s.to_string()))?;
            rest = &rest[num_end..];

            let unit_end = rest
                .char_indices()
                .find(|(_, c)| c.is_ascii_digit())
                .map(|(i, _)| i)
                .unwrap_or(rest.len());
            let unit = &rest[..unit_end];
            rest = &rest[unit_end..];

            let scale: u128 = match unit {
                "ns" => 1,
                "us" | "\u{00b5}s" => 1_000,
                "ms" => 1_000_000,
                "s" => 1_000_000_000,
                "m" => 60 * 1_000_000_000,
                "h" => 3_600 * 1_000_000_000,
                _ => return Err(ParseDurationError::UnknownUnit(s.to_string())),
            };
            total_nanos = total_nanos.saturating_add((value * scale as f64) as u128);
        }

        let secs = (total_nanos / 1_000_000_000) as u64;
        let nanos = (total_nanos % 1_000_000_000) as u32;
        Ok(Duration(std::time::Duration::new(secs, nanos)))
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nanos = self.0.as_nanos();
        if nanos == 0 {
            return write!(f, "0s");
        }
        if nanos < 1_000 {
            return write!(f, "{nanos}ns");
        }
        if nanos < 1_000_000 {
            return write_with_fraction(f, nanos, 1_000, "\u{00b5}s");
        }
        if nanos < 1_000_000_000 {
            return write_with_fraction(f, nanos, 1_000_000, "ms");
        }

        let secs = self.0.as_secs();
        let sub = self.0.subsec_nanos() as u128;
        let hours = secs / 3_600;
        let mins = (secs % 3_600) / 60;
        let s = secs % 60;
        if hours > 0 {
            write!(f, "{hours}h")?;
        }
        if hours > 0 || mins > 0 {
            write!(f, "{mins}m")?;
        }
        write_with_fraction(f, s as u128 * 1_000_000_000 + sub, 1_000_000_000, "s")
    }
}

/// Renders `value / scale` with the fractional part trimmed of trailing
/// zeros, e.g. `1500ms / 1000 -> "1.5s"`, `5000ms / 1000 -> "5s"`.
fn write_with_fraction(
    f: &mut fmt::Formatter<'_>,
    value: u128,
    scale: u128,
    unit: &str,
) -> fmt::Result {
    let whole = value / scale;
    let frac = value % scale;
    if frac == 0 {
        return write!(f, "{whole}{unit}");
    }
    let digits = scale.ilog10() as usize;
    let mut frac_str = format!("{frac:0digits$}");
    while frac_str.ends_with('0') {
        frac_str.pop();
    }
    write!(f, "{whole}.{frac_str}{unit}")
}

impl Serialize for Duration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(Duration::ZERO);
        }
        s.parse().map_err(D::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseDurationError {
    #[error("empty duration")]
    Empty,
    #[error("invalid duration: {0}")]
    Invalid(String),
    #[error("unknown duration unit in {0:?} (use ns|us|ms|s|m|h)")]
    UnknownUnit(String),
}
