//! Ingestion passes and the active-case batch coordinator.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn};
use uuid::Uuid;

use casefeed_core::{
    build_lookback, estimate_active_cases, normalize_entity_key, ComputedSnapshot,
    HistoricalSnapshot, LiveSnapshot, Scope, DATE_FORMAT, LOOKBACK_WINDOW,
};
use casefeed_feeds::{csv_reader, parse_historical_row, parse_live_row, FeedRegistry, Grain, ParseError};
use casefeed_storage::{
    upsert_typed, DocumentStore, FeedFetcher, FetchError, FetchOutcome, HttpClientConfig,
    HttpFeedFetcher, JsonDirStore, OffsetStore, StoreError,
};

pub const CRATE_NAME: &str = "casefeed-pipeline";

/// Environment-driven process configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    /// Upper bound on concurrent upsert/estimation tasks per pass.
    pub workers: usize,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub ingest_cron: String,
    pub compute_cron: String,
    pub states_live_url: Option<String>,
    pub counties_live_url: Option<String>,
    pub states_historical_url: Option<String>,
    pub counties_historical_url: Option<String>,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("CASEFEED_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            workers: std::env::var("CASEFEED_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(16),
            http_timeout_secs: std::env::var("CASEFEED_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: std::env::var("CASEFEED_USER_AGENT")
                .unwrap_or_else(|_| "casefeed/0.1".to_string()),
            scheduler_enabled: std::env::var("CASEFEED_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            ingest_cron: std::env::var("CASEFEED_INGEST_CRON")
                .unwrap_or_else(|_| "0 0 * * * *".to_string()),
            compute_cron: std::env::var("CASEFEED_COMPUTE_CRON")
                .unwrap_or_else(|_| "0 30 * * * *".to_string()),
            states_live_url: std::env::var("CASEFEED_STATES_LIVE_URL").ok(),
            counties_live_url: std::env::var("CASEFEED_COUNTIES_LIVE_URL").ok(),
            states_historical_url: std::env::var("CASEFEED_STATES_HISTORICAL_URL").ok(),
            counties_historical_url: std::env::var("CASEFEED_COUNTIES_HISTORICAL_URL").ok(),
        }
    }

    fn registry(&self) -> FeedRegistry {
        let mut registry = FeedRegistry::default();
        if let Some(url) = &self.states_live_url {
            registry = registry.with_url(Scope::States, Grain::Live, url);
        }
        if let Some(url) = &self.counties_live_url {
            registry = registry.with_url(Scope::Counties, Grain::Live, url);
        }
        if let Some(url) = &self.states_historical_url {
            registry = registry.with_url(Scope::States, Grain::Historical, url);
        }
        if let Some(url) = &self.counties_historical_url {
            registry = registry.with_url(Scope::Counties, Grain::Historical, url);
        }
        registry
    }
}

#[derive(Debug, Error)]
pub enum PassError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// Some upserts failed while their siblings completed. The pass is
    /// non-clean and the offset has not been advanced; re-running is safe
    /// because every upsert is idempotent.
    #[error("{failed} of {total} upserts failed; offset not advanced")]
    PartialFailure { failed: usize, total: usize },
    #[error("entity {key}: {field} is not numeric ({value:?})")]
    NonNumeric {
        key: String,
        field: &'static str,
        value: String,
    },
}

/// Outcome of one ingestion pass.
#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub run_id: Uuid,
    pub scope: Scope,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Byte offsets only apply to the historical (append-only) feeds.
    pub previous_offset: Option<u64>,
    pub committed_offset: Option<u64>,
    pub rows: usize,
    pub upserted: usize,
    pub skipped: usize,
}

/// Outcome of one estimation batch.
#[derive(Debug, Clone, Serialize)]
pub struct ComputeSummary {
    pub run_id: Uuid,
    pub scope: Scope,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub entities: usize,
    pub computed: usize,
    pub failed: usize,
}

/// Orchestrates the four pass types against one store-client handle and one
/// fetcher, both constructed once per process and injected.
pub struct Pipeline {
    store: Arc<dyn DocumentStore>,
    fetcher: Arc<dyn FeedFetcher>,
    registry: FeedRegistry,
    offsets: OffsetStore,
    workers: usize,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        fetcher: Arc<dyn FeedFetcher>,
        registry: FeedRegistry,
        workers: usize,
    ) -> Self {
        let offsets = OffsetStore::new(Arc::clone(&store));
        Self {
            store,
            fetcher,
            registry,
            offsets,
            workers: workers.max(1),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn DocumentStore> = Arc::new(JsonDirStore::new(config.data_dir.clone()));
        let fetcher = HttpFeedFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })
        .context("building http fetcher")?;
        Ok(Self::new(
            store,
            Arc::new(fetcher),
            config.registry(),
            config.workers,
        ))
    }

    /// Ingests the unconsumed tail of a scope's append-only historical feed.
    ///
    /// The committed offset only ever advances after every upsert of the
    /// pass has been joined; committing earlier would mark bytes consumed
    /// that in-flight tasks might still fail to ingest.
    pub async fn ingest_historical(&self, scope: Scope) -> Result<PassSummary, PassError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("ingest_historical", %run_id, %scope);
        let _guard = span.enter();

        let previous = match self.offsets.get(scope.offset_key()).await {
            Ok(offset) => offset,
            // First-ever pass for this scope; the commit below seeds it.
            Err(StoreError::NotFound { .. }) => 0,
            Err(err) => return Err(err.into()),
        };

        let url = self.registry.url(scope, Grain::Historical);
        let (body, total_len) = match self.fetcher.fetch_from_offset(url, previous).await? {
            FetchOutcome::NoNewData { total_len } => {
                let refreshed = total_len.max(previous);
                self.offsets.commit(scope.offset_key(), refreshed).await?;
                let summary = PassSummary {
                    run_id,
                    scope,
                    started_at,
                    finished_at: Utc::now(),
                    previous_offset: Some(previous),
                    committed_offset: Some(refreshed),
                    rows: 0,
                    upserted: 0,
                    skipped: 0,
                };
                info!(summary = %summary_json(&summary), "no new data in historical feed");
                return Ok(summary);
            }
            FetchOutcome::NewData { body, total_len } => (body, total_len),
        };

        // Shape errors abort before any upsert is dispatched: a column-count
        // mismatch means schema drift, not one bad row.
        let rows = parse_all_historical(scope, &body, previous == 0)?;
        let total = rows.len();

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        for mut snapshot in rows {
            let key = normalize_entity_key(&snapshot.county, &snapshot.fips);
            snapshot.fips = key.clone();
            let doc_key = format!("{}_{}", key, snapshot.date);
            let collection = scope.historical_collection();
            let store = Arc::clone(&self.store);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore not closed");
                upsert_typed(store.as_ref(), collection, &doc_key, &snapshot)
                    .await
                    .map_err(|err| (doc_key, err))
            });
        }

        let failed = join_upserts(&mut tasks).await;
        if failed > 0 {
            return Err(PassError::PartialFailure { failed, total });
        }

        self.offsets.commit(scope.offset_key(), total_len).await?;
        let summary = PassSummary {
            run_id,
            scope,
            started_at,
            finished_at: Utc::now(),
            previous_offset: Some(previous),
            committed_offset: Some(total_len),
            rows: total,
            upserted: total,
            skipped: 0,
        };
        info!(summary = %summary_json(&summary), "historical ingestion committed");
        Ok(summary)
    }

    /// Re-reads a scope's live feed in full and upserts one document per
    /// entity. The live feed is a current snapshot, not an append log, so
    /// there is no offset to resume from and the header is always present.
    pub async fn ingest_live(&self, scope: Scope) -> Result<PassSummary, PassError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("ingest_live", %run_id, %scope);
        let _guard = span.enter();

        let url = self.registry.url(scope, Grain::Live);
        let body = self.fetcher.fetch_full(url).await?;
        let rows = parse_all_live(scope, &body)?;

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        let mut skipped = 0usize;
        let mut total = 0usize;
        for mut snapshot in rows {
            let key = normalize_entity_key(&snapshot.county, &snapshot.fips);
            // Rows without a usable key (territories with no Fips code)
            // cannot be stored under a stable identity.
            if key.is_empty() {
                skipped += 1;
                continue;
            }
            total += 1;
            snapshot.fips = key.clone();
            let collection = scope.live_collection();
            let store = Arc::clone(&self.store);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore not closed");
                upsert_typed(store.as_ref(), collection, &key, &snapshot)
                    .await
                    .map_err(|err| (key, err))
            });
        }

        let failed = join_upserts(&mut tasks).await;
        if failed > 0 {
            return Err(PassError::PartialFailure { failed, total });
        }

        let summary = PassSummary {
            run_id,
            scope,
            started_at,
            finished_at: Utc::now(),
            previous_offset: None,
            committed_offset: None,
            rows: total + skipped,
            upserted: total,
            skipped,
        };
        info!(summary = %summary_json(&summary), "live ingestion complete");
        Ok(summary)
    }

    /// Estimates active cases for every entity in the scope's live
    /// collection. One bad entity never aborts the batch; its failure is
    /// logged and counted, and its computed document is simply omitted for
    /// this run.
    pub async fn compute_active(&self, scope: Scope) -> Result<ComputeSummary, PassError> {
        self.compute_active_as_of(scope, Utc::now().date_naive())
            .await
    }

    pub async fn compute_active_as_of(
        &self,
        scope: Scope,
        today: NaiveDate,
    ) -> Result<ComputeSummary, PassError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("compute_active", %run_id, %scope);
        let _guard = span.enter();

        let entities = self.store.list(scope.live_collection()).await?;
        let total = entities.len();

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        for (key, live_doc) in entities {
            let store = Arc::clone(&self.store);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore not closed");
                compute_entity(store.as_ref(), scope, &key, live_doc, today)
                    .await
                    .map_err(|err| (key, err))
            });
        }

        let mut failed = 0usize;
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err((key, error))) => {
                    warn!(%key, %error, "active-case estimation failed");
                    failed += 1;
                }
                Err(join_error) => {
                    warn!(%join_error, "estimation task aborted");
                    failed += 1;
                }
            }
        }

        let summary = ComputeSummary {
            run_id,
            scope,
            started_at,
            finished_at: Utc::now(),
            entities: total,
            computed: total - failed,
            failed,
        };
        info!(summary = %summary_json(&summary), "estimation batch complete");
        Ok(summary)
    }
}

/// Summaries are emitted as one JSON value on the completion log line.
fn summary_json<T: Serialize>(summary: &T) -> String {
    serde_json::to_string(summary).unwrap_or_default()
}

fn parse_all_historical(
    scope: Scope,
    body: &[u8],
    skip_header: bool,
) -> Result<Vec<HistoricalSnapshot>, ParseError> {
    let mut reader = csv_reader(body);
    let mut rows = Vec::new();
    let mut first = true;
    for record in reader.records() {
        let record = record?;
        if first {
            first = false;
            // A resumed stream starts mid-data; only a fetch from offset
            // zero carries the column header.
            if skip_header {
                continue;
            }
        }
        rows.push(parse_historical_row(scope, &record)?);
    }
    Ok(rows)
}

fn parse_all_live(scope: Scope, body: &[u8]) -> Result<Vec<LiveSnapshot>, ParseError> {
    let mut reader = csv_reader(body);
    let mut rows = Vec::new();
    let mut first = true;
    for record in reader.records() {
        let record = record?;
        if first {
            first = false;
            continue;
        }
        rows.push(parse_live_row(scope, &record)?);
    }
    Ok(rows)
}

/// Join barrier for a pass's upsert fan-out. Every task is drained; one
/// failure never cancels its siblings.
async fn join_upserts(tasks: &mut JoinSet<Result<(), (String, StoreError)>>) -> usize {
    let mut failed = 0usize;
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err((key, error))) => {
                warn!(%key, %error, "upsert failed");
                failed += 1;
            }
            Err(join_error) => {
                warn!(%join_error, "upsert task aborted");
                failed += 1;
            }
        }
    }
    failed
}

async fn compute_entity(
    store: &dyn DocumentStore,
    scope: Scope,
    key: &str,
    live_doc: Value,
    today: NaiveDate,
) -> Result<(), PassError> {
    let live: LiveSnapshot =
        serde_json::from_value(live_doc).map_err(|source| StoreError::Shape {
            collection: scope.live_collection().to_string(),
            key: key.to_string(),
            source,
        })?;

    let current_cases: i64 =
        live.cases
            .trim()
            .parse()
            .map_err(|_| PassError::NonNumeric {
                key: key.to_string(),
                field: "Cases",
                value: live.cases.clone(),
            })?;
    // An absent or garbled death figure is a valid state for some entities;
    // it degrades to the estimated-deaths policy instead of failing here.
    let reported_deaths = live.deaths.trim().parse::<i64>().ok();

    let mut window: Vec<HistoricalSnapshot> = store
        .list_prefix(scope.historical_collection(), &format!("{key}_"))
        .await?
        .into_iter()
        .filter_map(|(_, value)| serde_json::from_value(value).ok())
        .filter(|snapshot: &HistoricalSnapshot| {
            NaiveDate::parse_from_str(&snapshot.date, DATE_FORMAT)
                .map(|date| date <= today)
                .unwrap_or(false)
        })
        .collect();
    // ISO dates order lexicographically, so this is most-recent-first.
    window.sort_by(|a, b| b.date.cmp(&a.date));
    window.truncate(LOOKBACK_WINDOW);

    let lookback = build_lookback(today, &window);
    let estimate = estimate_active_cases(current_cases, reported_deaths, &lookback);

    let computed = ComputedSnapshot {
        date: live.date,
        county: live.county,
        state: live.state,
        fips: live.fips,
        cases: live.cases,
        deaths: live.deaths,
        confirmed_cases: live.confirmed_cases,
        confirmed_deaths: live.confirmed_deaths,
        probable_cases: live.probable_cases,
        probable_deaths: live.probable_deaths,
        active_cases: estimate.active_cases,
        new_cases_today: estimate.new_cases_today,
        new_deaths_today: estimate.new_deaths_today,
        calculated_deaths: estimate.calculated_deaths,
        score: estimate.score,
    };

    upsert_typed(store, scope.api_collection(), key, &computed).await?;
    Ok(())
}

/// Builds the cron scheduler when enabled: one job re-ingesting both feeds
/// for both scopes, one job re-running estimation. Scheduled failures are
/// logged, never fatal to the scheduler.
pub async fn build_scheduler(
    pipeline: Arc<Pipeline>,
    config: &PipelineConfig,
) -> anyhow::Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let ingest_pipeline = Arc::clone(&pipeline);
    let ingest = Job::new_async(config.ingest_cron.as_str(), move |_uuid, _lock| {
        let pipeline = Arc::clone(&ingest_pipeline);
        Box::pin(async move {
            for scope in [Scope::States, Scope::Counties] {
                if let Err(error) = pipeline.ingest_live(scope).await {
                    warn!(%scope, %error, "scheduled live ingestion failed");
                }
                if let Err(error) = pipeline.ingest_historical(scope).await {
                    warn!(%scope, %error, "scheduled historical ingestion failed");
                }
            }
        })
    })
    .with_context(|| format!("creating ingest job for cron {}", config.ingest_cron))?;
    sched.add(ingest).await.context("adding ingest job")?;

    let compute_pipeline = Arc::clone(&pipeline);
    let compute = Job::new_async(config.compute_cron.as_str(), move |_uuid, _lock| {
        let pipeline = Arc::clone(&compute_pipeline);
        Box::pin(async move {
            for scope in [Scope::States, Scope::Counties] {
                if let Err(error) = pipeline.compute_active(scope).await {
                    warn!(%scope, %error, "scheduled estimation failed");
                }
            }
        })
    })
    .with_context(|| format!("creating compute job for cron {}", config.compute_cron))?;
    sched.add(compute).await.context("adding compute job")?;

    Ok(Some(sched))
}
