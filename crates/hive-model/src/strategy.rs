use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::ModelError;

/// How the master picks slaves out of a candidate set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectStrategy {
    Random,
    #[default]
    LeastLoaded,
    LocationAware,
    RoundRobin,
}

impl fmt::Display for SelectStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SelectStrategy::Random => "random",
            SelectStrategy::LeastLoaded => "least-loaded",
            SelectStrategy::LocationAware => "location-aware",
            SelectStrategy::RoundRobin => "round-robin",
        })
    }
}

impl FromStr for SelectStrategy {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_ascii_lowercase().replace('_', "-");
        match norm.as_str() {
            "random" => Ok(SelectStrategy::Random),
            "least-loaded" => Ok(SelectStrategy::LeastLoaded),
            "location-aware" | "location" => Ok(SelectStrategy::LocationAware),
            "round-robin" => Ok(SelectStrategy::RoundRobin),
            _ => Err(ModelError::UnknownSelectStrategy(s.to_string())),
        }
    }
}

/// How a task's workers are partitioned across the chosen slaves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SplitStrategy {
    #[default]
    Equal,
    Weighted,
}

impl fmt::Display for SplitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SplitStrategy::Equal => "equal",
            SplitStrategy::Weighted => "weighted",
        })
    }
}

impl FromStr for SplitStrategy {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "equal" => Ok(SplitStrategy::Equal),
            "weighted" => Ok(SplitStrategy::Weighted),
            _ => Err(ModelError::UnknownSplitStrategy(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_select_strategy() {
        assert_eq!("round_robin".parse::<SelectStrategy>(), Ok(SelectStrategy::RoundRobin));
        assert_eq!("Least-Loaded".parse::<SelectStrategy>(), Ok(SelectStrategy::LeastLoaded));
        assert!("fastest".parse::<SelectStrategy>().is_err());
    }

    #[test]
    fn display_matches_parse() {
        for s in [
            SelectStrategy::Random,
            SelectStrategy::LeastLoaded,
            SelectStrategy::LocationAware,
            SelectStrategy::RoundRobin,
        ] {
            assert_eq!(s.to_string().parse::<SelectStrategy>(), Ok(s));
        }
        assert_eq!("weighted".parse::<SplitStrategy>(), Ok(SplitStrategy::Weighted));
    }
}
