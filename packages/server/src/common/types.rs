//! Core enums and policies shared between the queue layer and the domains.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::Error;

/// The kind of work a job performs. One dispatch queue exists per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Scrape,
    Ocr,
}

impl JobKind {
    pub const ALL: [JobKind; 2] = [JobKind::Scrape, JobKind::Ocr];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Scrape => "scrape",
            JobKind::Ocr => "ocr",
        }
    }

    /// Hard per-kind execution ceiling. A job's effective deadline is the
    /// minimum of its own timeout and this ceiling.
    pub fn timeout_ceiling(&self) -> Duration {
        match self {
            JobKind::Scrape => Duration::minutes(2),
            JobKind::Ocr => Duration::minutes(5),
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scrape" => Ok(JobKind::Scrape),
            "ocr" => Ok(JobKind::Ocr),
            other => Err(Error::SchemaNotFound(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Integer rank for storage ordering (lower = higher priority).
    pub fn rank(&self) -> i16 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }

    /// Pull weight of the band (high : normal : low = 8 : 4 : 1).
    pub fn weight(&self) -> u32 {
        match self {
            Priority::High => 8,
            Priority::Normal => 4,
            Priority::Low => 1,
        }
    }
}

/// Retry policy carried by every job and enforced by the dispatch bus.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: i64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: i64,
}

fn default_max_attempts() -> i32 {
    5
}
fn default_initial_backoff_ms() -> i64 {
    1_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_backoff_ms() -> i64 {
    300_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            multiplier: default_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_attempts < 1 {
            return Err(Error::InvalidRequest(
                "retry_policy.max_attempts must be >= 1".into(),
            ));
        }
        if self.initial_backoff_ms < 0 || self.max_backoff_ms < 0 {
            return Err(Error::InvalidRequest(
                "retry_policy backoff values must be non-negative".into(),
            ));
        }
        if self.multiplier < 1.0 {
            return Err(Error::InvalidRequest(
                "retry_policy.multiplier must be >= 1.0".into(),
            ));
        }
        Ok(())
    }

    /// Backoff before re-delivering attempt `attempt + 1`:
    /// `min(initial * multiplier^(attempt-1), max)`. Jitter is applied by
    /// the queue, not here.
    pub fn backoff_for_attempt(&self, attempt: i32) -> Duration {
        let exp = (attempt - 1).max(0) as f64;
        let raw = self.initial_backoff_ms as f64 * self.multiplier.powf(exp);
        let capped = raw.min(self.max_backoff_ms as f64);
        Duration::milliseconds(capped as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips() {
        for kind in JobKind::ALL {
            let parsed: JobKind = kind.as_str().parse().unwrap();
            assert_eq!(kind, parsed);
        }
    }

    #[test]
    fn unknown_kind_is_schema_not_found() {
        assert!(matches!(
            "video".parse::<JobKind>(),
            Err(Error::SchemaNotFound(_))
        ));
    }

    #[test]
    fn priority_rank_orders_high_first() {
        assert!(Priority::High.rank() < Priority::Normal.rank());
        assert!(Priority::Normal.rank() < Priority::Low.rank());
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 1_000,
            multiplier: 2.0,
            max_backoff_ms: 5_000,
        };
        assert_eq!(policy.backoff_for_attempt(1).num_milliseconds(), 1_000);
        assert_eq!(policy.backoff_for_attempt(2).num_milliseconds(), 2_000);
        assert_eq!(policy.backoff_for_attempt(3).num_milliseconds(), 4_000);
        assert_eq!(policy.backoff_for_attempt(4).num_milliseconds(), 5_000);
        assert_eq!(policy.backoff_for_attempt(9).num_milliseconds(), 5_000);
    }

    #[test]
    fn zero_attempts_rejected() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }
}
