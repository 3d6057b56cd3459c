//! Dataset-shape-aware CSV row parsers and the remote feed registry.

use casefeed_core::{HistoricalSnapshot, LiveSnapshot, Scope};
use csv::StringRecord;
use thiserror::Error;

pub const CRATE_NAME: &str = "casefeed-feeds";

/// Whether a feed is the current-snapshot dataset or the append-only log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Grain {
    Live,
    Historical,
}

const DEFAULT_STATES_LIVE_URL: &str =
    "https://raw.githubusercontent.com/nytimes/covid-19-data/master/live/us-states.csv";
const DEFAULT_COUNTIES_LIVE_URL: &str =
    "https://raw.githubusercontent.com/nytimes/covid-19-data/master/live/us-counties.csv";
const DEFAULT_STATES_HISTORICAL_URL: &str =
    "https://raw.githubusercontent.com/nytimes/covid-19-data/master/us-states.csv";
const DEFAULT_COUNTIES_HISTORICAL_URL: &str =
    "https://raw.githubusercontent.com/nytimes/covid-19-data/master/us-counties.csv";

/// Resolves `(scope, grain)` to a feed URL. Exactly one append-only source
/// exists per scope; the defaults point at the published dataset and can be
/// overridden for tests or mirrors.
#[derive(Debug, Clone)]
pub struct FeedRegistry {
    states_live: String,
    counties_live: String,
    states_historical: String,
    counties_historical: String,
}

impl Default for FeedRegistry {
    fn default() -> Self {
        Self {
            states_live: DEFAULT_STATES_LIVE_URL.to_string(),
            counties_live: DEFAULT_COUNTIES_LIVE_URL.to_string(),
            states_historical: DEFAULT_STATES_HISTORICAL_URL.to_string(),
            counties_historical: DEFAULT_COUNTIES_HISTORICAL_URL.to_string(),
        }
    }
}

impl FeedRegistry {
    pub fn url(&self, scope: Scope, grain: Grain) -> &str {
        match (scope, grain) {
            (Scope::States, Grain::Live) => &self.states_live,
            (Scope::Counties, Grain::Live) => &self.counties_live,
            (Scope::States, Grain::Historical) => &self.states_historical,
            (Scope::Counties, Grain::Historical) => &self.counties_historical,
        }
    }

    pub fn with_url(mut self, scope: Scope, grain: Grain, url: impl Into<String>) -> Self {
        let slot = match (scope, grain) {
            (Scope::States, Grain::Live) => &mut self.states_live,
            (Scope::Counties, Grain::Live) => &mut self.counties_live,
            (Scope::States, Grain::Historical) => &mut self.states_historical,
            (Scope::Counties, Grain::Historical) => &mut self.counties_historical,
        };
        *slot = url.into();
        self
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    /// A column-count mismatch means the remote schema changed (or the byte
    /// offset landed mid-row), never a single bad row; callers must abort
    /// the whole pass.
    #[error("{shape} row has {got} columns, expected {expected}")]
    MalformedRow {
        shape: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("csv read failed: {0}")]
    Csv(#[from] csv::Error),
}

/// CSV reader over an in-memory body. Header handling is the caller's
/// responsibility because a resumed fetch starts mid-data with no header
/// present.
pub fn csv_reader(bytes: &[u8]) -> csv::Reader<&[u8]> {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes)
}

fn check_width(
    shape: &'static str,
    expected: usize,
    record: &StringRecord,
) -> Result<(), ParseError> {
    if record.len() != expected {
        return Err(ParseError::MalformedRow {
            shape,
            expected,
            got: record.len(),
        });
    }
    Ok(())
}

/// One historical row → typed snapshot. State rows carry 5 columns, county
/// rows 6 (an extra county name after the date).
pub fn parse_historical_row(
    scope: Scope,
    record: &StringRecord,
) -> Result<HistoricalSnapshot, ParseError> {
    let field = |i: usize| record.get(i).unwrap_or_default().to_string();

    match scope {
        Scope::States => {
            check_width("historical state", 5, record)?;
            Ok(HistoricalSnapshot {
                date: field(0),
                county: String::new(),
                state: field(1),
                fips: field(2),
                cases: field(3),
                deaths: field(4),
            })
        }
        Scope::Counties => {
            check_width("historical county", 6, record)?;
            Ok(HistoricalSnapshot {
                date: field(0),
                county: field(1),
                state: field(2),
                fips: field(3),
                cases: field(4),
                deaths: field(5),
            })
        }
    }
}

/// One live row → typed snapshot. State rows carry 9 columns, county rows
/// 10.
pub fn parse_live_row(scope: Scope, record: &StringRecord) -> Result<LiveSnapshot, ParseError> {
    let field = |i: usize| record.get(i).unwrap_or_default().to_string();

    match scope {
        Scope::States => {
            check_width("live state", 9, record)?;
            Ok(LiveSnapshot {
                date: field(0),
                county: String::new(),
                state: field(1),
                fips: field(2),
                cases: field(3),
                deaths: field(4),
                confirmed_cases: field(5),
                confirmed_deaths: field(6),
                probable_cases: field(7),
                probable_deaths: field(8),
            })
        }
        Scope::Counties => {
            check_width("live county", 10, record)?;
            Ok(LiveSnapshot {
                date: field(0),
                county: field(1),
                state: field(2),
                fips: field(3),
                cases: field(4),
                deaths: field(5),
                confirmed_cases: field(6),
                confirmed_deaths: field(7),
                probable_cases: field(8),
                probable_deaths: field(9),
            })
        }
    }
}
