//! Priority tiers used by the notification scheduler.
//!
//! Job priority is a small integer where higher means more urgent. Tiers are
//! coarse bands over that integer, numbered 1 (urgent) to 4 (low) for operators:
//!
//! | Tier | Number | Job priority band |
//! |------|--------|-------------------|
//! | Urgent | 1 | `>= 4` |
//! | High | 2 | `3` |
//! | Normal | 3 | `2` |
//! | Low | 4 | `<= 1` |

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityTier {
    Urgent,
    High,
    Normal,
    Low,
}

impl PriorityTier {
    /// All tiers, most urgent first.
    pub const ALL: [PriorityTier; 4] = [Self::Urgent, Self::High, Self::Normal, Self::Low];

    /// Operator-facing tier number (1 = urgent .. 4 = low).
    pub const fn number(self) -> u8 {
        match self {
            Self::Urgent => 1,
            Self::High => 2,
            Self::Normal => 3,
            Self::Low => 4,
        }
    }

    pub fn from_number(n: u8) -> DomainResult<Self> {
        match n {
            1 => Ok(Self::Urgent),
            2 => Ok(Self::High),
            3 => Ok(Self::Normal),
            4 => Ok(Self::Low),
            other => Err(DomainError::UnknownTier(other.to_string())),
        }
    }

    /// Default job priority used when enqueuing work for this tier.
    pub const fn job_priority(self) -> i16 {
        match self {
            Self::Urgent => 4,
            Self::High => 3,
            Self::Normal => 2,
            Self::Low => 1,
        }
    }

    /// Inclusive `(min, max)` job priority band; `None` means unbounded.
    pub const fn priority_band(self) -> (Option<i16>, Option<i16>) {
        match self {
            Self::Urgent => (Some(4), None),
            Self::High => (Some(3), Some(3)),
            Self::Normal => (Some(2), Some(2)),
            Self::Low => (None, Some(1)),
        }
    }

    /// Tier a job with the given priority belongs to.
    pub const fn for_priority(priority: i16) -> Self {
        if priority >= 4 {
            Self::Urgent
        } else if priority == 3 {
            Self::High
        } else if priority == 2 {
            Self::Normal
        } else {
            Self::Low
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl core::fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PriorityTier {
    type Err = DomainError;

    /// Accepts either the tier number or its name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(n) = s.parse::<u8>() {
            return Self::from_number(n);
        }
        match s.to_ascii_lowercase().as_str() {
            "urgent" => Ok(Self::Urgent),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            _ => Err(DomainError::UnknownTier(s.to_string())),
        }
    }
}
