//! Batch orchestration: settings, site registry, scrape runs and store seeding.

pub mod seed;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ricewatch_adapters::{
    GeminiClient, GeminiConfig, ItemPolicy, LlmProductExtractor, ProductSource,
    DEFAULT_GEMINI_MODEL,
};
use ricewatch_storage::{ArtifactStore, D1Client, D1Config, HttpClientConfig, ProductStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

pub use seed::{run_seed, run_seed_once_from_env, sample_products, SeedSummary};

pub const CRATE_NAME: &str = "ricewatch-sync";

pub const GEMINI_API_KEY: &str = "GEMINI_API_KEY";
pub const CF_ACCOUNT_ID: &str = "CF_ACCOUNT_ID";
pub const CF_DATABASE_ID: &str = "CF_DATABASE_ID";
pub const CF_API_TOKEN: &str = "CF_API_TOKEN";

pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {}", .keys.join(", "))]
    Missing { keys: Vec<&'static str> },
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Process settings as read from the environment, before validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub gemini_api_key: Option<String>,
    pub cf_account_id: Option<String>,
    pub cf_database_id: Option<String>,
    pub cf_api_token: Option<String>,
    pub gemini_model: String,
    pub item_policy: Option<String>,
    pub sites_file: PathBuf,
    pub artifacts_dir: Option<PathBuf>,
    /// Raw `RICEWATCH_HTTP_TIMEOUT_SECS`; validated by [`Settings::http_config`].
    pub http_timeout_secs: Option<String>,
    pub user_agent: String,
}

/// Everything a scrape run needs, validated.
#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub gemini: GeminiConfig,
    pub store: D1Config,
    pub http: HttpClientConfig,
    pub item_policy: ItemPolicy,
    pub artifacts_dir: Option<PathBuf>,
}

impl Settings {
    /// Reads `.env` (when present) and then the process environment.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            gemini_api_key: get(GEMINI_API_KEY),
            cf_account_id: get(CF_ACCOUNT_ID),
            cf_database_id: get(CF_DATABASE_ID),
            cf_api_token: get(CF_API_TOKEN),
            gemini_model: get("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            item_policy: get("RICEWATCH_ITEM_POLICY"),
            sites_file: get("RICEWATCH_SITES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("sites.yaml")),
            artifacts_dir: get("RICEWATCH_ARTIFACTS_DIR").map(PathBuf::from),
            http_timeout_secs: get("RICEWATCH_HTTP_TIMEOUT_SECS"),
            user_agent: get("RICEWATCH_USER_AGENT").unwrap_or_else(|| "ricewatch/0.1".to_string()),
        }
    }

    pub fn http_config(&self) -> Result<HttpClientConfig, ConfigError> {
        Ok(HttpClientConfig {
            timeout: self.parsed_http_timeout()?,
            user_agent: Some(self.user_agent.clone()),
        })
    }

    /// Store credentials only; enough for seeding.
    pub fn store_config(&self) -> Result<D1Config, ConfigError> {
        match (&self.cf_account_id, &self.cf_database_id, &self.cf_api_token) {
            (Some(account), Some(database), Some(token)) => {
                Ok(D1Config::new(account, database, token))
            }
            _ => Err(ConfigError::Missing {
                keys: self.missing_keys(false),
            }),
        }
    }

    pub fn scrape_config(&self) -> Result<ScrapeConfig, ConfigError> {
        let missing = self.missing_keys(true);
        if !missing.is_empty() {
            return Err(ConfigError::Missing { keys: missing });
        }
        let api_key = self.gemini_api_key.clone().unwrap_or_default();
        Ok(ScrapeConfig {
            gemini: GeminiConfig::new(api_key).with_model(self.gemini_model.clone()),
            store: self.store_config()?,
            http: self.http_config()?,
            item_policy: self.parsed_item_policy()?,
            artifacts_dir: self.artifacts_dir.clone(),
        })
    }

    /// Whole seconds, at least one.
    fn parsed_http_timeout(&self) -> Result<Duration, ConfigError> {
        let Some(raw) = self.http_timeout_secs.as_deref() else {
            return Ok(Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS));
        };
        match raw.trim().parse::<u64>() {
            Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
            _ => Err(ConfigError::Invalid {
                key: "RICEWATCH_HTTP_TIMEOUT_SECS",
                value: raw.to_string(),
            }),
        }
    }

    fn parsed_item_policy(&self) -> Result<ItemPolicy, ConfigError> {
        match self.item_policy.as_deref() {
            None => Ok(ItemPolicy::default()),
            Some("skip_invalid") => Ok(ItemPolicy::SkipInvalid),
            Some("abort_on_invalid") => Ok(ItemPolicy::AbortOnInvalid),
            Some(other) => Err(ConfigError::Invalid {
                key: "RICEWATCH_ITEM_POLICY",
                value: other.to_string(),
            }),
        }
    }

    fn missing_keys(&self, include_provider: bool) -> Vec<&'static str> {
        let mut required = Vec::new();
        if include_provider {
            required.push((GEMINI_API_KEY, &self.gemini_api_key));
        }
        required.extend([
            (CF_ACCOUNT_ID, &self.cf_account_id),
            (CF_DATABASE_ID, &self.cf_database_id),
            (CF_API_TOKEN, &self.cf_api_token),
        ]);
        required
            .into_iter()
            .filter(|(_, value)| value.is_none())
            .map(|(key, _)| key)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteTarget {
    pub name: String,
    pub url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl SiteTarget {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteRegistry {
    pub sites: Vec<SiteTarget>,
}

impl SiteRegistry {
    pub fn builtin() -> Self {
        Self {
            sites: vec![
                SiteTarget::new("楽天市場", "https://search.rakuten.co.jp/search/mall/お米/"),
                SiteTarget::new("Amazon", "https://www.amazon.co.jp/s?k=お米"),
            ],
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing site registry")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Falls back to [`SiteRegistry::builtin`] when `path` does not exist.
    pub async fn load_or_builtin(path: &Path) -> Result<Self> {
        let exists = fs::try_exists(path)
            .await
            .with_context(|| format!("checking {}", path.display()))?;
        if exists {
            Self::load(path).await
        } else {
            info!(path = %path.display(), "no site registry file; using built-in sites");
            Ok(Self::builtin())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteSummary {
    pub site_name: String,
    pub url: String,
    pub extracted: usize,
    pub saved: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sites: Vec<SiteSummary>,
}

impl RunSummary {
    pub fn total_extracted(&self) -> usize {
        self.sites.iter().map(|s| s.extracted).sum()
    }

    pub fn total_saved(&self) -> usize {
        self.sites.iter().map(|s| s.saved).sum()
    }
}

/// Sequential extract-then-upsert over a list of sites.
pub struct BatchRunner {
    source: Box<dyn ProductSource>,
    store: Box<dyn ProductStore>,
}

impl BatchRunner {
    pub fn new(source: Box<dyn ProductSource>, store: Box<dyn ProductStore>) -> Self {
        Self { source, store }
    }

    /// Gemini extraction + D1 persistence, as configured.
    pub fn from_config(config: &ScrapeConfig) -> Result<Self> {
        let gemini = GeminiClient::new(config.gemini.clone(), &config.http)?;
        let extractor = LlmProductExtractor::new(gemini)
            .with_item_policy(config.item_policy)
            .with_archive(config.artifacts_dir.clone().map(ArtifactStore::new));
        let store = D1Client::new(&config.store, &config.http)?;
        Ok(Self::new(Box::new(extractor), Box::new(store)))
    }

    pub async fn run(&self, sites: &[SiteTarget]) -> RunSummary {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let mut summaries = Vec::new();

        for site in sites.iter().filter(|s| s.enabled) {
            info!(%run_id, site = %site.name, url = %site.url, "scraping {}", site.name);
            let records = self.source.extract(&site.url, &site.name).await;
            info!(site = %site.name, found = records.len(), "found {} products", records.len());

            let mut saved = 0usize;
            for record in &records {
                if self.store.upsert(record).await {
                    saved += 1;
                }
            }
            if saved < records.len() {
                warn!(site = %site.name, failed = records.len() - saved, "some products were not saved");
            }
            info!(
                site = %site.name,
                saved,
                total = records.len(),
                "saved {}/{} products from {}",
                saved,
                records.len(),
                site.name
            );

            summaries.push(SiteSummary {
                site_name: site.name.clone(),
                url: site.url.clone(),
                extracted: records.len(),
                saved,
            });
        }

        let finished_at = Utc::now();
        info!(%run_id, sites = summaries.len(), "scraping completed");
        RunSummary {
            run_id,
            started_at,
            finished_at,
            sites: summaries,
        }
    }
}

/// Validate settings, build the runner, run it. Nothing is built or called when settings
/// are incomplete.
pub async fn run_scrape<F>(settings: &Settings, sites: &[SiteTarget], build: F) -> Result<RunSummary>
where
    F: FnOnce(&ScrapeConfig) -> Result<BatchRunner>,
{
    let config = settings.scrape_config()?;
    let runner = build(&config)?;
    Ok(runner.run(sites).await)
}

/// Like [`run_scrape`], with the sites read from `sites_file` (or the configured registry).
/// Settings are validated before the registry is read.
pub async fn run_scrape_with_registry<F>(
    settings: &Settings,
    sites_file: Option<PathBuf>,
    build: F,
) -> Result<RunSummary>
where
    F: FnOnce(&ScrapeConfig) -> Result<BatchRunner>,
{
    let config = settings.scrape_config()?;
    let path = sites_file.unwrap_or_else(|| settings.sites_file.clone());
    let registry = SiteRegistry::load_or_builtin(&path).await?;
    let runner = build(&config)?;
    Ok(runner.run(&registry.sites).await)
}

pub async fn run_scrape_once_from_env(sites_file: Option<PathBuf>) -> Result<RunSummary> {
    let settings = Settings::from_env();
    run_scrape_with_registry(&settings, sites_file, BatchRunner::from_config).await
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use ricewatch_adapters::ProductSource;
    use ricewatch_core::Record;
    use ricewatch_storage::{ProductStore, StoreError};

    #[derive(Default, Clone)]
    pub struct FakeSource {
        pub by_url: HashMap<String, Vec<Record>>,
        pub calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ProductSource for FakeSource {
        async fn extract(&self, url: &str, _site_name: &str) -> Vec<Record> {
            self.calls.lock().unwrap().push(url.to_string());
            self.by_url.get(url).cloned().unwrap_or_default()
        }
    }

    #[derive(Default, Clone)]
    pub struct FakeStore {
        pub failing_ids: HashSet<String>,
        pub row_count: Option<i64>,
        pub upserts: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ProductStore for FakeStore {
        async fn upsert(&self, record: &Record) -> bool {
            self.upserts.lock().unwrap().push(record.id().to_string());
            !self.failing_ids.contains(record.id())
        }

        async fn count_products(&self) -> Result<i64, StoreError> {
            self.row_count
                .ok_or_else(|| StoreError::Shape("no count".to_string()))
        }
    }

    pub fn record(site: &str, url: &str, price: i64) -> Record {
        Record::new(site, url, format!("rice {price}"), price).unwrap()
    }
}
