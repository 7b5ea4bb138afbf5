//! Strategy table.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Ways of reaching a peer, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyKind {
    /// Dial the peer's listen address
    Direct,
    /// Ask the peer to dial us
    Reverse,
    /// TCP hole punch
    Punch,
    /// Relay through an allocated endpoint
    Relay,
}

impl StrategyKind {
    /// Default order
    pub const DEFAULT_ORDER: [Self; 4] = [Self::Direct, Self::Reverse, Self::Punch, Self::Relay];

    /// Table entry for this strategy.
    #[must_use]
    pub fn spec(self) -> StrategySpec {
        match self {
            Self::Direct => StrategySpec {
                kind: self,
                timeout: Duration::from_secs(2),
                has_cleanup: false,
                same_if: true,
                max_pairs: 6,
                label: "direct",
            },
            Self::Reverse => StrategySpec {
                kind: self,
                timeout: Duration::from_secs(4),
                has_cleanup: false,
                same_if: true,
                max_pairs: 6,
                label: "reverse",
            },
            Self::Punch => StrategySpec {
                kind: self,
                timeout: Duration::from_secs(20),
                has_cleanup: true,
                same_if: false,
                max_pairs: 4,
                label: "punch",
            },
            Self::Relay => StrategySpec {
                kind: self,
                timeout: Duration::from_secs(20),
                has_cleanup: true,
                same_if: true,
                max_pairs: 2,
                label: "relay",
            },
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.spec().label)
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "reverse" => Ok(Self::Reverse),
            "punch" => Ok(Self::Punch),
            "relay" | "turn" => Ok(Self::Relay),
            other => Err(format!("unknown strategy '{other}'")),
        }
    }
}

/// How one strategy is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategySpec {
    /// Strategy
    pub kind: StrategyKind,
    /// Bound on one candidate attempt
    pub timeout: Duration,
    /// Whether abandoned attempts need cleanup
    pub has_cleanup: bool,
    /// The attempt binds to the chosen local interface
    pub same_if: bool,
    /// Candidate address pairs to try
    pub max_pairs: usize,
    /// Name for logs
    pub label: &'static str,
}

/// The default table, in default order.
#[must_use]
pub fn default_table() -> Vec<StrategySpec> {
    StrategyKind::DEFAULT_ORDER.iter().map(|k| k.spec()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_values() {
        let table = default_table();
        let kinds: Vec<_> = table.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, StrategyKind::DEFAULT_ORDER);

        let punch = StrategyKind::Punch.spec();
        assert_eq!(punch.timeout, Duration::from_secs(20));
        assert!(punch.has_cleanup && !punch.same_if);
        assert_eq!(punch.max_pairs, 4);
        assert_eq!(StrategyKind::Relay.spec().max_pairs, 2);
        assert!(!StrategyKind::Direct.spec().has_cleanup);
    }

    #[test]
    fn test_parse() {
        assert_eq!("Punch".parse::<StrategyKind>().unwrap(), StrategyKind::Punch);
        assert_eq!("turn".parse::<StrategyKind>().unwrap(), StrategyKind::Relay);
        assert!("carrier-pigeon".parse::<StrategyKind>().is_err());
        assert_eq!(StrategyKind::Reverse.to_string(), "reverse");
    }
}
