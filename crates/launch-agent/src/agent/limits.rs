//! Concurrency limits for regular jobs and sweep schedulers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Value as written in config or on the command line: a number or a
/// numeric string. `-1` means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LimitValue {
    Number(i64),
    Text(String),
}

impl From<i64> for LimitValue {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for LimitValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl fmt::Display for LimitValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Validated limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Bounded(usize),
    Unbounded,
}

impl Limit {
    /// Limit used when the setting is absent.
    pub const DEFAULT: Self = Self::Bounded(1);

    /// Parse `field`. Absent → 1; `-1` → unbounded; other negatives and
    /// non-numeric text are rejected.
    pub fn parse(field: &'static str, value: Option<&LimitValue>) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidLimit {
            field,
            value: value.map(ToString::to_string).unwrap_or_default(),
        };
        let number = match value {
            None => return Ok(Self::DEFAULT),
            Some(LimitValue::Number(n)) => *n,
            Some(LimitValue::Text(raw)) => raw.trim().parse::<i64>().map_err(|_| invalid())?,
        };
        match number {
            -1 => Ok(Self::Unbounded),
            n if n >= 0 => usize::try_from(n).map(Self::Bounded).map_err(|_| invalid()),
            _ => Err(invalid()),
        }
    }

    /// Whether one more job fits next to `running` ones.
    #[must_use]
    pub const fn allows(self, running: usize) -> bool {
        match self {
            Self::Bounded(max) => running < max,
            Self::Unbounded => true,
        }
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bounded(n) => write!(f, "{n}"),
            Self::Unbounded => f.write_str("unbounded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_limits() {
        assert_eq!(Limit::parse("max_jobs", None).unwrap(), Limit::Bounded(1));
        assert_eq!(
            Limit::parse("max_jobs", Some(&LimitValue::Number(-1))).unwrap(),
            Limit::Unbounded
        );
        assert_eq!(
            Limit::parse("max_jobs", Some(&"8".into())).unwrap(),
            Limit::Bounded(8)
        );
        assert_eq!(
            Limit::parse("max_jobs", Some(&" -1 ".into())).unwrap(),
            Limit::Unbounded
        );
        assert_eq!(
            Limit::parse("max_schedulers", Some(&LimitValue::Number(0))).unwrap(),
            Limit::Bounded(0)
        );
        assert_eq!(
            Limit::parse("max_schedulers", Some(&LimitValue::Number(1_000_000))).unwrap(),
            Limit::Bounded(1_000_000)
        );
    }

    #[test]
    fn invalid_limits() {
        for value in [LimitValue::Number(-29), LimitValue::from("weird"), LimitValue::from("")] {
            let err = Limit::parse("max_jobs", Some(&value)).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidLimit { field: "max_jobs", .. }));
        }
    }

    #[test]
    fn limits_deserialize_from_numbers_or_strings() {
        let values: Vec<LimitValue> = serde_yaml::from_str("[3, \"4\", -1]").unwrap();
        assert_eq!(
            values,
            vec![LimitValue::Number(3), LimitValue::Text("4".into()), LimitValue::Number(-1)]
        );
    }

    #[test]
    fn allows_respects_bounds() {
        assert!(Limit::Bounded(2).allows(1));
        assert!(!Limit::Bounded(2).allows(2));
        assert!(!Limit::Bounded(0).allows(0));
        assert!(Limit::Unbounded.allows(usize::MAX));
    }
}
