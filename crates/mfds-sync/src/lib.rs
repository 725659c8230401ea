//! Run driver for the MFDS tracker: one list scan, then fetch, fingerprint
//! and reconcile every candidate in order, committing per item.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use mfds_adapters::{
    fetch_detail, scan_list_page, DetailExtractor, HttpPortal, ListScan, PortalClient,
    PortalProfile,
};
use mfds_core::ReconcileOutcome;
use mfds_storage::{
    BackoffPolicy, HttpClientConfig, PgProductStore, ProductStore, DEFAULT_USER_AGENT,
};
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mfds-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_retries: usize,
    pub min_request_interval_ms: u64,
    pub delay: DelayPolicy,
    pub fail_fast: bool,
    pub profile_path: Option<PathBuf>,
    pub max_items: Option<usize>,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SyncConfig::from_env`] but reads variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let delay_min = parse_var::<u64>(&var, "MFDS_DELAY_MIN_MS")?.unwrap_or(500);
        let delay_max = parse_var::<u64>(&var, "MFDS_DELAY_MAX_MS")?.unwrap_or(1500);
        if delay_min > delay_max {
            bail!("MFDS_DELAY_MIN_MS ({delay_min}) is greater than MFDS_DELAY_MAX_MS ({delay_max})");
        }

        Ok(Self {
            database_url: var("DATABASE_URL"),
            user_agent: var("MFDS_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: parse_var(&var, "MFDS_HTTP_TIMEOUT_SECS")?.unwrap_or(30),
            http_retries: parse_var(&var, "MFDS_HTTP_RETRIES")?.unwrap_or(0),
            min_request_interval_ms: parse_var(&var, "MFDS_MIN_REQUEST_INTERVAL_MS")?.unwrap_or(0),
            delay: DelayPolicy::new(
                Duration::from_millis(delay_min),
                Duration::from_millis(delay_max),
            ),
            fail_fast: var("MFDS_FAIL_FAST")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True" | "yes"))
                .unwrap_or(false),
            profile_path: var("MFDS_PROFILE_PATH").map(PathBuf::from),
            max_items: parse_var(&var, "MFDS_MAX_ITEMS")?,
        })
    }

    pub fn database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL is not set")
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
            min_request_interval: Duration::from_millis(self.min_request_interval_ms),
            backoff: BackoffPolicy {
                max_retries: self.http_retries,
                ..BackoffPolicy::default()
            },
        }
    }

    /// Built-in MFDS profile unless `MFDS_PROFILE_PATH` points at an override.
    pub fn load_profile(&self) -> Result<PortalProfile> {
        match &self.profile_path {
            Some(path) => PortalProfile::from_yaml_file(path)
                .with_context(|| format!("loading portal profile {}", path.display())),
            None => Ok(PortalProfile::default()),
        }
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(key)
        .map(|raw| {
            raw.parse::<T>()
                .with_context(|| format!("{key} has invalid value {raw:?}"))
        })
        .transpose()
}

/// Randomised pause between items, drawn uniformly from `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayPolicy {
    pub min: Duration,
    pub max: Duration,
}

impl DelayPolicy {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let min_ms = self.min.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(min_ms..=max_ms))
    }

    async fn pause(&self) {
        let delay = self.sample();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Fetch,
    Store,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fetch => "fetch",
            Self::Store => "store",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub item_seq: String,
    pub stage: FailureStage,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Candidates found on the list page, before any `max_items` cap.
    pub candidates: usize,
    pub processed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failures: Vec<ItemFailure>,
}

impl SyncRunSummary {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("serializing run summary")
    }
}

/// A run stopped before finishing its candidate list. `summary` covers the
/// items committed before the failure.
#[derive(Debug, Error)]
#[error("sync run aborted at item {} during {}: {}", .failure.item_seq, .failure.stage, .failure.message)]
pub struct RunAborted {
    pub failure: ItemFailure,
    pub summary: SyncRunSummary,
}

struct RunTally {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    candidates: usize,
    inserted: usize,
    updated: usize,
    unchanged: usize,
    failures: Vec<ItemFailure>,
}

impl RunTally {
    fn start() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            candidates: 0,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            failures: Vec::new(),
        }
    }

    fn record(&mut self, outcome: ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Inserted => self.inserted += 1,
            ReconcileOutcome::Updated => self.updated += 1,
            ReconcileOutcome::Unchanged => self.unchanged += 1,
        }
    }

    fn finish(self) -> SyncRunSummary {
        SyncRunSummary {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            candidates: self.candidates,
            processed: self.inserted + self.updated + self.unchanged,
            inserted: self.inserted,
            updated: self.updated,
            unchanged: self.unchanged,
            failures: self.failures,
        }
    }

    fn abort(self, failure: ItemFailure) -> anyhow::Error {
        RunAborted {
            failure,
            summary: self.finish(),
        }
        .into()
    }
}

pub struct SyncPipeline {
    portal: Arc<dyn PortalClient>,
    store: Arc<dyn ProductStore>,
    profile: PortalProfile,
    extractor: DetailExtractor,
    delay: DelayPolicy,
    fail_fast: bool,
    max_items: Option<usize>,
}

impl SyncPipeline {
    pub fn new(
        portal: Arc<dyn PortalClient>,
        store: Arc<dyn ProductStore>,
        profile: PortalProfile,
    ) -> Result<Self> {
        let extractor =
            DetailExtractor::new(profile.detail.clone()).context("building detail extractor")?;
        Ok(Self {
            portal,
            store,
            profile,
            extractor,
            delay: DelayPolicy::new(Duration::from_millis(500), Duration::from_millis(1500)),
            fail_fast: false,
            max_items: None,
        })
    }

    pub fn with_delay(mut self, delay: DelayPolicy) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_max_items(mut self, max_items: Option<usize>) -> Self {
        self.max_items = max_items;
        self
    }

    /// Fetch the list page and scan it for candidates. A failed list fetch is
    /// fatal; a page without a table is an empty scan.
    pub async fn scan(&self) -> Result<ListScan> {
        let html = self
            .portal
            .fetch_list_page()
            .await
            .context("fetching list page")?;
        Ok(scan_list_page(&html, &self.profile.list))
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let tally = RunTally::start();
        let span = info_span!("sync_run", run_id = %tally.run_id);
        async move {
            let scan = self.scan().await?;
            self.process(tally, scan.candidates).await
        }
        .instrument(span)
        .await
    }

    /// Run the per-item pipeline over an already known candidate list.
    pub async fn sync_candidates(&self, candidates: Vec<String>) -> Result<SyncRunSummary> {
        let tally = RunTally::start();
        let span = info_span!("sync_run", run_id = %tally.run_id);
        self.process(tally, candidates).instrument(span).await
    }

    async fn process(&self, mut tally: RunTally, candidates: Vec<String>) -> Result<SyncRunSummary> {
        tally.candidates = candidates.len();
        let limit = self.max_items.unwrap_or(candidates.len());
        let total = limit.min(candidates.len());
        info!(candidates = tally.candidates, to_process = total, "sync run started");

        for (idx, item_seq) in candidates.iter().take(limit).enumerate() {
            self.delay.pause().await;

            let detail = match fetch_detail(self.portal.as_ref(), &self.extractor, item_seq).await {
                Ok(detail) => detail,
                Err(err) => {
                    let failure = ItemFailure {
                        item_seq: item_seq.clone(),
                        stage: FailureStage::Fetch,
                        message: err.to_string(),
                    };
                    if self.fail_fast {
                        error!(item_seq = %item_seq, stage = %FailureStage::Fetch, error = %err, "item failed; aborting run");
                        return Err(tally.abort(failure));
                    }
                    warn!(item_seq = %item_seq, stage = %FailureStage::Fetch, error = %err, "item failed; skipping");
                    tally.failures.push(failure);
                    continue;
                }
            };

            let observed_at = Utc::now();
            let outcome = match self.store.reconcile(&detail, observed_at).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(item_seq = %item_seq, stage = %FailureStage::Store, error = %err, "storage failure; aborting run");
                    return Err(tally.abort(ItemFailure {
                        item_seq: item_seq.clone(),
                        stage: FailureStage::Store,
                        message: err.to_string(),
                    }));
                }
            };
            tally.record(outcome);

            info!(
                item_seq = %item_seq,
                position = idx + 1,
                total,
                ?outcome,
                product_name = %detail.product_name,
                "item reconciled"
            );
        }

        let summary = tally.finish();
        info!(
            processed = summary.processed,
            inserted = summary.inserted,
            updated = summary.updated,
            unchanged = summary.unchanged,
            failures = summary.failures.len(),
            "sync run finished"
        );
        Ok(summary)
    }
}

/// Portal and profile for commands that never touch storage.
pub fn portal_from_config(config: &SyncConfig) -> Result<(HttpPortal, PortalProfile)> {
    let profile = config.load_profile()?;
    let portal = HttpPortal::new(config.http_client_config(), &profile)
        .context("building http portal client")?;
    Ok((portal, profile))
}

pub async fn connect_store(config: &SyncConfig) -> Result<PgProductStore> {
    let store = PgProductStore::connect(config.database_url()?)
        .await
        .context("connecting to database")?;
    store.migrate().await.context("applying schema migrations")?;
    Ok(store)
}

pub async fn pipeline_from_config(config: &SyncConfig) -> Result<SyncPipeline> {
    let (portal, profile) = portal_from_config(config)?;
    let store = connect_store(config).await?;
    Ok(SyncPipeline::new(Arc::new(portal), Arc::new(store), profile)?
        .with_delay(config.delay)
        .with_fail_fast(config.fail_fast)
        .with_max_items(config.max_items))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use mfds_adapters::{
        detail_url_for, PortalError, StaticPortal, DEFAULT_DETAIL_URL, DEFAULT_LIST_URL,
    };
    use mfds_core::{DrugDetail, StoredProduct};
    use mfds_storage::{FetchError, MemoryProductStore, StoreError};

    use super::*;

    fn detail_page(name: &str, company: &str, ingredients: &[&str]) -> String {
        let rows: String = ingredients
            .iter()
            .map(|i| format!("<tr><td>{i}</td><td>1</td></tr>"))
            .collect();
        format!(
            "<table>\
               <tr><th>제품명</th><td>{name}</td></tr>\
               <tr><th>업체명</th><td>{company}</td></tr>\
               <tr><th>허가일자</th><td>2024-03-05</td></tr>\
             </table>\
             <h3>효능효과</h3><div>고혈압</div>\
             <h3>원료약품 및 분량</h3>\
             <table><tr><th>성분명</th><th>분량</th></tr>{rows}</table>"
        )
    }

    fn list_page(item_seqs: &[&str]) -> String {
        let rows: String = item_seqs
            .iter()
            .map(|s| {
                format!(
                    "<tr><td><a href=\"/detail?itemSeq={s}\">x</a></td><td>c</td><td>rx</td><td>d</td><td></td></tr>"
                )
            })
            .collect();
        format!(
            "<table><tr><th>제품명</th><th>업체명</th><th>전문/일반</th><th>허가일자</th><th>취소/취하일자</th></tr>{rows}</table>"
        )
    }

    fn pipeline(portal: StaticPortal, store: Arc<dyn ProductStore>) -> SyncPipeline {
        SyncPipeline::new(Arc::new(portal), store, PortalProfile::default())
            .unwrap()
            .with_delay(DelayPolicy::none())
    }

    async fn stored(store: &MemoryProductStore, item_seq: &str) -> StoredProduct {
        store.get_product(item_seq).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn second_run_updates_only_the_changed_item() {
        let store = Arc::new(MemoryProductStore::new());

        let first = StaticPortal::new("")
            .with_detail("A1", detail_page("Alpha Tab.", "Alpha Pharm", &["X"]))
            .with_detail("A2", detail_page("Beta Cap.", "Beta Pharm", &["Y", "Z"]));
        let summary = pipeline(first, store.clone())
            .sync_candidates(vec!["A1".into(), "A2".into()])
            .await
            .unwrap();
        assert_eq!(summary.inserted, 2);
        assert!(summary.is_clean());

        let a1_before = stored(&store, "A1").await;
        let a2_before = stored(&store, "A2").await;
        assert_eq!(a1_before.first_seen_at, a1_before.last_updated_at);
        assert_eq!(a2_before.first_seen_at, a2_before.last_updated_at);
        assert_ne!(a1_before.content_hash, a2_before.content_hash);

        tokio::time::sleep(Duration::from_millis(5)).await;

        let second = StaticPortal::new("")
            .with_detail("A1", detail_page("Alpha Tab.", "Alpha Pharm Co., Ltd.", &["X"]));
        let summary = pipeline(second, store.clone())
            .sync_candidates(vec!["A1".into()])
            .await
            .unwrap();
        assert_eq!(summary.updated, 1);

        let a1_after = stored(&store, "A1").await;
        assert_eq!(a1_after.first_seen_at, a1_before.first_seen_at);
        assert!(a1_after.last_updated_at > a1_before.last_updated_at);
        assert_ne!(a1_after.last_updated_at, a1_after.first_seen_at);
        assert_eq!(a1_after.company_name, "Alpha Pharm Co., Ltd.");
        assert_eq!(stored(&store, "A2").await, a2_before);
    }

    #[tokio::test]
    async fn run_once_scans_list_and_reconciles_candidates() {
        let store = Arc::new(MemoryProductStore::new());
        let portal = StaticPortal::new(list_page(&["111", "222", "111"]))
            .with_detail("111", detail_page("One", "Co", &["B", "A", "B"]))
            .with_detail("222", detail_page("Two", "Co", &[]));
        let summary = pipeline(portal, store.clone()).run_once().await.unwrap();

        assert_eq!(summary.candidates, 2);
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.inserted, 2);
        assert_eq!(
            store.ingredients_for("111").await.unwrap(),
            vec!["A".to_string(), "B".to_string()]
        );
        let one = stored(&store, "111").await;
        assert_eq!(one.source_url, detail_url_for(DEFAULT_DETAIL_URL, "111"));
        assert_eq!(one.approval_date, chrono::NaiveDate::from_ymd_opt(2024, 3, 5));
        assert_eq!(one.efficacy_text, "고혈압");
    }

    #[tokio::test]
    async fn rerun_with_identical_pages_is_unchanged() {
        let store = Arc::new(MemoryProductStore::new());
        let portal = StaticPortal::new(list_page(&["111"]))
            .with_detail("111", detail_page("One", "Co", &["A"]));
        let pipeline = pipeline(portal, store.clone());

        pipeline.run_once().await.unwrap();
        let before = stored(&store, "111").await;
        let summary = pipeline.run_once().await.unwrap();
        let after = stored(&store, "111").await;

        assert_eq!(summary.unchanged, 1);
        assert_eq!(after.content_hash, before.content_hash);
        assert_eq!(after.last_updated_at, before.last_updated_at);
        assert!(after.last_seen_at >= before.last_seen_at);
    }

    #[tokio::test]
    async fn empty_list_page_is_an_empty_run() {
        let store = Arc::new(MemoryProductStore::new());
        let summary = pipeline(StaticPortal::new("<p>no results</p>"), store.clone())
            .run_once()
            .await
            .unwrap();
        assert_eq!(summary.candidates, 0);
        assert_eq!(summary.processed, 0);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn failed_fetch_is_tallied_and_run_continues() {
        let store = Arc::new(MemoryProductStore::new());
        let portal = StaticPortal::new("").with_detail("B2", detail_page("Two", "Co", &[]));
        let summary = pipeline(portal, store.clone())
            .sync_candidates(vec!["B1".into(), "B2".into()])
            .await
            .unwrap();

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].item_seq, "B1");
        assert_eq!(summary.failures[0].stage, FailureStage::Fetch);
        assert!(summary.failures[0].message.contains("404"));
        assert!(store.get_product("B2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn fail_fast_aborts_on_first_failed_item() {
        let store = Arc::new(MemoryProductStore::new());
        let portal = StaticPortal::new("").with_detail("C2", detail_page("Two", "Co", &[]));
        let err = pipeline(portal, store.clone())
            .with_fail_fast(true)
            .sync_candidates(vec!["C1".into(), "C2".into()])
            .await
            .unwrap_err();

        let aborted = err.downcast_ref::<RunAborted>().expect("run aborted error");
        assert_eq!(aborted.failure.item_seq, "C1");
        assert_eq!(aborted.summary.processed, 0);
        assert!(store.is_empty().await);
    }

    struct BrokenStore;

    #[async_trait]
    impl ProductStore for BrokenStore {
        async fn reconcile(
            &self,
            _detail: &DrugDetail,
            _observed_at: DateTime<Utc>,
        ) -> Result<ReconcileOutcome, StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolClosed))
        }

        async fn get_product(&self, _item_seq: &str) -> Result<Option<StoredProduct>, StoreError> {
            Ok(None)
        }

        async fn ingredients_for(&self, _item_seq: &str) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn storage_failure_aborts_run_even_without_fail_fast() {
        let portal = StaticPortal::new("")
            .with_detail("D1", detail_page("One", "Co", &[]))
            .with_detail("D2", detail_page("Two", "Co", &[]));
        let err = pipeline(portal, Arc::new(BrokenStore))
            .sync_candidates(vec!["D1".into(), "D2".into()])
            .await
            .unwrap_err();

        let aborted = err.downcast_ref::<RunAborted>().expect("run aborted error");
        assert_eq!(aborted.failure.stage, FailureStage::Store);
        assert_eq!(aborted.failure.item_seq, "D1");
    }

    #[tokio::test]
    async fn max_items_caps_processing_but_reports_all_candidates() {
        let store = Arc::new(MemoryProductStore::new());
        let portal = StaticPortal::new(list_page(&["1", "2", "3"]))
            .with_detail("1", detail_page("One", "Co", &[]))
            .with_detail("2", detail_page("Two", "Co", &[]))
            .with_detail("3", detail_page("Three", "Co", &[]));
        let summary = pipeline(portal, store.clone())
            .with_max_items(Some(2))
            .run_once()
            .await
            .unwrap();

        assert_eq!(summary.candidates, 3);
        assert_eq!(summary.processed, 2);
        assert!(store.get_product("3").await.unwrap().is_none());
    }

    struct FailingListPortal;

    #[async_trait]
    impl PortalClient for FailingListPortal {
        async fn fetch_list_page(&self) -> Result<String, PortalError> {
            Err(FetchError::HttpStatus {
                status: 503,
                url: DEFAULT_LIST_URL.to_string(),
            }
            .into())
        }

        async fn fetch_detail_page(&self, _item_seq: &str) -> Result<String, PortalError> {
            Ok(String::new())
        }

        fn detail_url(&self, item_seq: &str) -> String {
            detail_url_for(DEFAULT_DETAIL_URL, item_seq)
        }
    }

    #[tokio::test]
    async fn list_fetch_failure_is_fatal() {
        let store: Arc<dyn ProductStore> = Arc::new(MemoryProductStore::new());
        let pipeline = SyncPipeline::new(Arc::new(FailingListPortal), store, PortalProfile::default())
            .unwrap();
        let err = pipeline.run_once().await.unwrap_err();
        let chain = format!("{err:#}");
        assert!(chain.contains("fetching list page"), "{chain}");
        assert!(chain.contains("503"), "{chain}");
    }

    fn config_from(pairs: &[(&str, &str)]) -> Result<SyncConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SyncConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn config_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.user_agent, DEFAULT_USER_AGENT);
        assert_eq!(config.http_timeout_secs, 30);
        assert_eq!(config.http_retries, 0);
        assert_eq!(
            config.delay,
            DelayPolicy::new(Duration::from_millis(500), Duration::from_millis(1500))
        );
        assert!(!config.fail_fast);
        assert!(config.max_items.is_none());
        assert!(config.database_url().is_err());
        assert_eq!(config.load_profile().unwrap(), PortalProfile::default());
    }

    #[test]
    fn config_reads_overrides() {
        let config = config_from(&[
            ("DATABASE_URL", "postgres://localhost/mfds"),
            ("MFDS_HTTP_RETRIES", "2"),
            ("MFDS_MIN_REQUEST_INTERVAL_MS", "250"),
            ("MFDS_DELAY_MIN_MS", "0"),
            ("MFDS_DELAY_MAX_MS", "0"),
            ("MFDS_FAIL_FAST", "true"),
            ("MFDS_MAX_ITEMS", "10"),
        ])
        .unwrap();
        assert_eq!(config.database_url().unwrap(), "postgres://localhost/mfds");
        assert!(config.fail_fast);
        assert_eq!(config.max_items, Some(10));
        assert_eq!(config.delay, DelayPolicy::none());

        let http = config.http_client_config();
        assert_eq!(http.backoff.max_retries, 2);
        assert_eq!(http.min_request_interval, Duration::from_millis(250));
    }

    #[test]
    fn config_rejects_bad_numbers_and_inverted_delay() {
        let err = config_from(&[("MFDS_HTTP_TIMEOUT_SECS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("MFDS_HTTP_TIMEOUT_SECS"));
        assert!(config_from(&[("MFDS_DELAY_MIN_MS", "900"), ("MFDS_DELAY_MAX_MS", "100")]).is_err());
    }

    #[test]
    fn delay_samples_stay_in_window() {
        let policy = DelayPolicy::new(Duration::from_millis(10), Duration::from_millis(20));
        for _ in 0..100 {
            let d = policy.sample();
            assert!(d >= policy.min && d <= policy.max, "{d:?}");
        }
        assert_eq!(DelayPolicy::none().sample(), Duration::ZERO);
    }

    #[test]
    fn summary_serializes_failures() {
        let summary = RunTally {
            failures: vec![ItemFailure {
                item_seq: "9".into(),
                stage: FailureStage::Fetch,
                message: "http status 500".into(),
            }],
            ..RunTally::start()
        }
        .finish();
        let json: serde_json::Value = serde_json::from_str(&summary.to_json_pretty().unwrap()).unwrap();
        assert_eq!(json["failures"][0]["stage"], "fetch");
        assert_eq!(json["processed"], 0);
        assert!(!summary.is_clean());
    }
}
