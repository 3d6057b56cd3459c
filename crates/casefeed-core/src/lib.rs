//! Core domain model, lookback scoring, and the active-case estimator.

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "casefeed-core";

/// Feed dates are ISO calendar dates, e.g. `2021-01-30`.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Reserved entity key for New York City, which the source feed publishes
/// without a Fips code.
pub const NYC_SENTINEL_KEY: &str = "NYC";

/// Day-offsets the lookback scorer anchors on. Offset 1 feeds the
/// day-over-day deltas; the remaining five feed the active-case formula.
pub const LOOKBACK_TARGETS: [i64; 6] = [1, 14, 15, 25, 26, 49];

/// At most this many of an entity's most recent historical snapshots are
/// scanned per estimation.
pub const LOOKBACK_WINDOW: usize = 50;

/// Ingestion source category. Each scope has its own feed URLs, store
/// collections, and byte-offset record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    States,
    Counties,
}

impl Scope {
    /// Key of this scope's document in the `offsets` collection.
    pub fn offset_key(&self) -> &'static str {
        match self {
            Scope::States => "state",
            Scope::Counties => "county",
        }
    }

    pub fn live_collection(&self) -> &'static str {
        match self {
            Scope::States => "states-live",
            Scope::Counties => "counties-live",
        }
    }

    pub fn historical_collection(&self) -> &'static str {
        match self {
            Scope::States => "states-historical",
            Scope::Counties => "counties-historical",
        }
    }

    pub fn api_collection(&self) -> &'static str {
        match self {
            Scope::States => "states-api",
            Scope::Counties => "counties-api",
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Scope::States => "states",
            Scope::Counties => "counties",
        })
    }
}

/// Maps a row's county/Fips pair to the entity key used for every store
/// operation. The feed omits a Fips code for New York City, so that county
/// is remapped to [`NYC_SENTINEL_KEY`] regardless of the Fips value.
pub fn normalize_entity_key(county: &str, fips: &str) -> String {
    if county == "New York City" {
        NYC_SENTINEL_KEY.to_string()
    } else {
        fips.trim().to_string()
    }
}

/// Current point-in-time counters for one entity, as published by the live
/// feed. Numeric fields arrive as text; an empty death figure is a valid
/// state for some entities, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LiveSnapshot {
    pub date: String,
    #[serde(default)]
    pub county: String,
    pub state: String,
    pub fips: String,
    pub cases: String,
    pub deaths: String,
    pub confirmed_cases: String,
    pub confirmed_deaths: String,
    pub probable_cases: String,
    pub probable_deaths: String,
}

/// One dated cumulative record per entity. Identity is `(entity key, date)`;
/// re-ingestion upserts rather than appends.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HistoricalSnapshot {
    pub date: String,
    #[serde(default)]
    pub county: String,
    pub state: String,
    pub fips: String,
    pub cases: String,
    pub deaths: String,
}

/// Derived output per entity, fully recomputed and overwritten on every
/// estimation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ComputedSnapshot {
    pub date: String,
    #[serde(default)]
    pub county: String,
    pub state: String,
    pub fips: String,
    pub cases: String,
    pub deaths: String,
    pub confirmed_cases: String,
    pub confirmed_deaths: String,
    pub probable_cases: String,
    pub probable_deaths: String,
    pub active_cases: i64,
    pub new_cases_today: i64,
    pub new_deaths_today: i64,
    /// True when the death count fed into the formula was estimated rather
    /// than reported; see [`estimate_active_cases`].
    pub calculated_deaths: bool,
    /// Sum of the five formula offsets' lookback scores. Lower is fresher;
    /// zero means every offset matched a snapshot of exactly that age.
    pub score: i64,
}

/// The winning historical snapshot for one target day-offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LookbackHit {
    pub cases: i64,
    pub deaths: i64,
    /// Absolute difference between the snapshot's age in days and the
    /// target offset. Zero is a perfect match.
    pub score: i64,
}

/// Scores a window of historical snapshots against [`LOOKBACK_TARGETS`].
///
/// For each snapshot, `day_diff` is its age in whole days relative to
/// `today`; for each target `d` the score is `|day_diff - d|` and the
/// strictly lowest score wins, first scanned winning ties. Snapshots whose
/// date or counters fail to parse are skipped, which can leave a target
/// with no entry at all; callers treat an absent target as zeroes.
///
/// Historical feeds have missing dates and irregular cadence; nearest-match
/// scoring tolerates gaps instead of requiring an exact date hit.
pub fn build_lookback(
    today: NaiveDate,
    window: &[HistoricalSnapshot],
) -> HashMap<i64, LookbackHit> {
    let mut hits: HashMap<i64, LookbackHit> = HashMap::new();

    for snapshot in window {
        let Ok(date) = NaiveDate::parse_from_str(&snapshot.date, DATE_FORMAT) else {
            continue;
        };
        let day_diff = (today - date).num_days();

        let Ok(cases) = snapshot.cases.trim().parse::<i64>() else {
            continue;
        };
        let Ok(deaths) = snapshot.deaths.trim().parse::<i64>() else {
            continue;
        };

        for target in LOOKBACK_TARGETS {
            let score = (day_diff - target).abs();
            let better = match hits.get(&target) {
                Some(existing) => score < existing.score,
                None => true,
            };
            if better {
                hits.insert(
                    target,
                    LookbackHit {
                        cases,
                        deaths,
                        score,
                    },
                );
            }
        }
    }

    hits
}

/// Active-case heuristic: cases lagged 14 days, two decaying correction
/// terms, minus cumulative deaths. Float intermediate, truncated result.
/// The coefficients are fixed, not configurable.
pub fn compute_active_case_count(
    current: i64,
    days14: i64,
    days15: i64,
    days25: i64,
    days26: i64,
    days49: i64,
    deaths: i64,
) -> i64 {
    ((current - days14) as f64
        + 0.19 * (days15 - days25) as f64
        + 0.05 * (days26 - days49) as f64
        - deaths as f64) as i64
}

/// Result of combining a live snapshot with lookback hits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Estimate {
    pub active_cases: i64,
    pub new_cases_today: i64,
    pub new_deaths_today: i64,
    pub calculated_deaths: bool,
    pub score: i64,
}

/// Derives the active-case estimate and day-over-day deltas for one entity.
///
/// `reported_deaths` is the live feed's death count when it parsed to a
/// positive figure. When it is zero or unavailable, 1% of the current case
/// count stands in for the formula only; `new_deaths_today` is reported as
/// zero in that case so an estimated death count never produces a
/// fabricated delta, and `calculated_deaths` marks the output.
pub fn estimate_active_cases(
    current_cases: i64,
    reported_deaths: Option<i64>,
    lookback: &HashMap<i64, LookbackHit>,
) -> Estimate {
    let hit = |target: i64| lookback.get(&target).copied().unwrap_or_default();

    let calculated_deaths = !matches!(reported_deaths, Some(d) if d > 0);
    let deaths = if calculated_deaths {
        (current_cases as f64 * 0.01) as i64
    } else {
        reported_deaths.unwrap_or(0)
    };

    let active_cases = compute_active_case_count(
        current_cases,
        hit(14).cases,
        hit(15).cases,
        hit(25).cases,
        hit(26).cases,
        hit(49).cases,
        deaths,
    );

    let new_deaths_today = if calculated_deaths {
        0
    } else {
        deaths - hit(1).deaths
    };

    Estimate {
        active_cases,
        new_cases_today: current_cases - hit(1).cases,
        new_deaths_today,
        calculated_deaths,
        score: [14, 15, 25, 26, 49]
            .iter()
            .map(|&d| hit(d).score)
            .sum(),
    }
}
