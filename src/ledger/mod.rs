// Skip ledger - durable per-track skip statistics
// One row per song, upserted by the monitor, read by the analytics endpoints

pub mod database;

pub use database::SkipLedger;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A persisted skip record. JSON field names match what the dashboard
/// already consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkipRecord {
    #[serde(rename = "track_id")]
    pub song_id: String,
    #[serde(rename = "track_name")]
    pub song_name: String,
    pub artist_name: Option<String>,
    pub skip_count: i64,
    pub last_skipped: Option<DateTime<Utc>>,
}

/// Skips bucketed by the calendar date of their latest occurrence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendPoint {
    pub date: String,
    pub total_skips: i64,
}

/// Whole-ledger summary for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerStats {
    pub tracked_songs: i64,
    pub total_skips: i64,
    pub first_skip: Option<DateTime<Utc>>,
    pub last_skip: Option<DateTime<Utc>>,
}

/// Named recency window for the analytics queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeframe {
    Week,
    Month,
    Year,
    #[default]
    All,
}

impl Timeframe {
    /// Lower date bound for the window, or `None` for all time.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Timeframe::Week => Some(now - Duration::days(7)),
            Timeframe::Month => Some(now - Duration::days(30)),
            Timeframe::Year => Some(now - Duration::days(365)),
            Timeframe::All => None,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Timeframe::Week => "week",
            Timeframe::Month => "month",
            Timeframe::Year => "year",
            Timeframe::All => "all",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
#[error("unknown timeframe '{0}' (expected week, month, year or all)")]
pub struct ParseTimeframeError(String);

impl FromStr for Timeframe {
    type Err = ParseTimeframeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "week" => Ok(Timeframe::Week),
            "month" => Ok(Timeframe::Month),
            "year" => Ok(Timeframe::Year),
            "all" => Ok(Timeframe::All),
            other => Err(ParseTimeframeError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_parses_known_names() {
        assert_eq!("week".parse::<Timeframe>().unwrap(), Timeframe::Week);
        assert_eq!("month".parse::<Timeframe>().unwrap(), Timeframe::Month);
        assert_eq!("year".parse::<Timeframe>().unwrap(), Timeframe::Year);
        assert_eq!("all".parse::<Timeframe>().unwrap(), Timeframe::All);
        assert!("fortnight".parse::<Timeframe>().is_err());
    }

    #[test]
    fn cutoffs_match_window_lengths() {
        let now = Utc::now();
        assert_eq!(Timeframe::Week.cutoff(now), Some(now - Duration::days(7)));
        assert_eq!(Timeframe::Month.cutoff(now), Some(now - Duration::days(30)));
        assert_eq!(Timeframe::Year.cutoff(now), Some(now - Duration::days(365)));
        assert_eq!(Timeframe::All.cutoff(now), None);
    }
}
