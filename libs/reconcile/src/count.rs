//! Target counts: a fixed number or a share of the matched population.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// How many targets a disruption wants.
///
/// Serialized as a bare integer (`3`) or a percentage string (`"50%"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Count {
    /// An absolute number of targets.
    Fixed(u32),

    /// A share of the matched population, `0..=100`.
    Percentage(u8),
}

/// Errors parsing a [`Count`] from text.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CountParseError {
    #[error("invalid count {0:?}: expected an integer or a percentage like \"50%\"")]
    Malformed(String),

    #[error("percentage {0} is out of range 0..=100")]
    OutOfRange(u32),
}

impl Count {
    /// Resolve against a population.
    ///
    /// Percentages round up when `round_up` is set (a 1-of-3 population at
    /// 50% yields 2), down otherwise. Fixed counts are capped at the
    /// population, since nothing beyond it can be selected.
    pub fn scale(self, population: usize, round_up: bool) -> usize {
        match self {
            Count::Fixed(n) => (n as usize).min(population),
            Count::Percentage(pct) => {
                let numerator = population * pct as usize;
                if round_up {
                    numerator.div_ceil(100)
                } else {
                    numerator / 100
                }
            }
        }
    }

    /// Whether this count is a percentage.
    pub fn is_percentage(self) -> bool {
        matches!(self, Count::Percentage(_))
    }
}

impl fmt::Display for Count {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Count::Fixed(n) => write!(f, "{n}"),
            Count::Percentage(pct) => write!(f, "{pct}%"),
        }
    }
}

impl FromStr for Count {
    type Err = CountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let malformed = || CountParseError::Malformed(s.to_string());

        match trimmed.strip_suffix('%') {
            Some(pct) => {
                let value: u32 = pct.trim().parse().map_err(|_| malformed())?;
                if value > 100 {
                    return Err(CountParseError::OutOfRange(value));
                }
                Ok(Count::Percentage(value as u8))
            }
            None => trimmed.parse().map(Count::Fixed).map_err(|_| malformed()),
        }
    }
}

impl Serialize for Count {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Count::Fixed(n) => serializer.serialize_u32(*n),
            Count::Percentage(_) => serializer.serialize_str(&self.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for Count {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u32),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(n) => Ok(Count::Fixed(n)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(Count::Percentage(50), 10, 5)]
    #[case(Count::Percentage(50), 3, 2)]
    #[case(Count::Percentage(1), 10, 1)]
    #[case(Count::Percentage(0), 10, 0)]
    #[case(Count::Percentage(100), 7, 7)]
    #[case(Count::Fixed(3), 10, 3)]
    #[case(Count::Fixed(30), 10, 10)]
    #[case(Count::Fixed(2), 0, 0)]
    fn test_scale_rounding_up(#[case] count: Count, #[case] population: usize, #[case] want: usize) {
        assert_eq!(count.scale(population, true), want);
    }

    #[test]
    fn test_scale_rounding_down() {
        assert_eq!(Count::Percentage(50).scale(3, false), 1);
        assert_eq!(Count::Percentage(1).scale(10, false), 0);
    }

    #[rstest]
    #[case("3", Count::Fixed(3))]
    #[case("50%", Count::Percentage(50))]
    #[case(" 100% ", Count::Percentage(100))]
    fn test_parse(#[case] input: &str, #[case] want: Count) {
        assert_eq!(input.parse::<Count>().unwrap(), want);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(
            "101%".parse::<Count>().unwrap_err(),
            CountParseError::OutOfRange(101)
        );
        assert!(matches!(
            "half".parse::<Count>().unwrap_err(),
            CountParseError::Malformed(_)
        ));
        assert!("-1".parse::<Count>().is_err());
    }

    #[test]
    fn test_serde_accepts_int_and_string() {
        let fixed: Count = serde_json::from_str("4").unwrap();
        let fixed_text: Count = serde_json::from_str("\"4\"").unwrap();
        let pct: Count = serde_json::from_str("\"25%\"").unwrap();

        assert_eq!(fixed, Count::Fixed(4));
        assert_eq!(fixed_text, Count::Fixed(4));
        assert_eq!(pct, Count::Percentage(25));
        assert_eq!(serde_json::to_string(&pct).unwrap(), "\"25%\"");
        assert_eq!(serde_json::to_string(&fixed).unwrap(), "4");
        assert!(serde_json::from_str::<Count>("\"250%\"").is_err());
    }

    proptest! {
        #[test]
        fn prop_percentage_matches_ceiling(pct in 0u8..=100, population in 0usize..10_000) {
            let desired = Count::Percentage(pct).scale(population, true);
            let share = pct as usize * population;

            // desired is the smallest integer whose hundredfold covers the share
            prop_assert!(desired <= population);
            prop_assert!(desired * 100 >= share);
            prop_assert!(desired == 0 || (desired - 1) * 100 < share);
        }

        #[test]
        fn prop_fixed_never_exceeds_population(n in 0u32..1_000, population in 0usize..1_000) {
            prop_assert!(Count::Fixed(n).scale(population, true) <= population);
        }
    }
}
