use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Health taxonomy, ordered by badness.
///
/// `Unknown` is the "no data yet" pseudo-level: it ranks below `Normal` and
/// never wins a [`worse_of`] against a real observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeverityLevel {
    Unknown,
    Normal,
    Slow,
    Degraded,
    Changed,
    Other,
    DownDependency,
    Down,
    DownAcknowledged,
}

impl SeverityLevel {
    pub const ALL: [SeverityLevel; 9] = [
        SeverityLevel::Unknown,
        SeverityLevel::Normal,
        SeverityLevel::Slow,
        SeverityLevel::Degraded,
        SeverityLevel::Changed,
        SeverityLevel::Other,
        SeverityLevel::DownDependency,
        SeverityLevel::Down,
        SeverityLevel::DownAcknowledged,
    ];

    pub fn rank(self) -> i32 {
        match self {
            SeverityLevel::Unknown => -1,
            SeverityLevel::Normal => 0,
            SeverityLevel::Slow => 1,
            SeverityLevel::Degraded => 2,
            SeverityLevel::Changed => 3,
            SeverityLevel::Other => 4,
            SeverityLevel::DownDependency => 5,
            SeverityLevel::Down => 6,
            SeverityLevel::DownAcknowledged => 7,
        }
    }

    pub fn is_hard_down(self) -> bool {
        matches!(self, SeverityLevel::Down | SeverityLevel::DownAcknowledged)
    }

    /// Down for any reason, including a failed dependency.
    pub fn is_down_class(self) -> bool {
        matches!(
            self,
            SeverityLevel::Down | SeverityLevel::DownAcknowledged | SeverityLevel::DownDependency
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SeverityLevel::Unknown => "UNKNOWN",
            SeverityLevel::Normal => "NORMAL",
            SeverityLevel::Slow => "SLOW",
            SeverityLevel::Degraded => "DEGRADED",
            SeverityLevel::Changed => "CHANGED",
            SeverityLevel::Other => "OTHER",
            SeverityLevel::DownDependency => "DOWN_DEPENDENCY",
            SeverityLevel::Down => "DOWN",
            SeverityLevel::DownAcknowledged => "DOWN_ACKNOWLEDGED",
        }
    }
}

impl Default for SeverityLevel {
    fn default() -> Self {
        SeverityLevel::Unknown
    }
}

impl PartialOrd for SeverityLevel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SeverityLevel {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for SeverityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeverityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        SeverityLevel::ALL
            .iter()
            .copied()
            .find(|level| level.as_str() == normalized)
            .ok_or_else(|| format!("unknown severity '{s}'"))
    }
}

pub fn worse_of(a: SeverityLevel, b: SeverityLevel) -> SeverityLevel {
    if b.rank() > a.rank() {
        b
    } else {
        a
    }
}

/// Combines an entity's own observation with the worst state among its
/// dependencies.
///
/// A healthy entity sitting on a hard-down dependency becomes
/// `DownDependency` rather than `Down`, so "this died" and "something under
/// this died" stay distinguishable.
pub fn escalate_for_dependency(own: SeverityLevel, dependency: SeverityLevel) -> SeverityLevel {
    use SeverityLevel::*;

    match (own, dependency) {
        (_, Unknown) => own,
        (Normal | Slow | Unknown, Down | DownAcknowledged) => DownDependency,
        (Unknown, DownDependency) => DownDependency,
        (Unknown, _) => Unknown,
        (Normal, Degraded | Slow) => Degraded,
        _ => worse_of(own, dependency),
    }
}
