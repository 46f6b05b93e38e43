//! Remote product store (Cloudflare D1 over HTTP) + shared HTTP and artifact utilities.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ricewatch_core::Record;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ricewatch-storage";

pub const DEFAULT_D1_BASE_URL: &str = "https://api.cloudflare.com";

/// Insert a product, or refresh its mutable columns when the id already exists.
/// `created_at` is only ever written by the insert branch.
pub const UPSERT_PRODUCT_SQL: &str = "\
INSERT INTO products (
    id, name, price, product_url, affiliate_url,
    image_url, site_name, last_scraped_at, created_at, updated_at
) VALUES (?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP, CURRENT_TIMESTAMP, CURRENT_TIMESTAMP)
ON CONFLICT(id) DO UPDATE SET
    name = excluded.name,
    price = excluded.price,
    affiliate_url = excluded.affiliate_url,
    image_url = excluded.image_url,
    last_scraped_at = CURRENT_TIMESTAMP,
    updated_at = CURRENT_TIMESTAMP";

pub const COUNT_PRODUCTS_SQL: &str = "SELECT COUNT(*) AS count FROM products";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
        }
    }
}

pub fn build_http_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build().context("building reqwest client")
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("store returned http status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("store reply could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("store rejected the statement: {0}")]
    Rejected(String),
    #[error("unexpected store reply shape: {0}")]
    Shape(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryRequest<'a> {
    pub sql: &'a str,
    pub params: Vec<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub errors: Vec<ApiMessage>,
    #[serde(default)]
    pub result: Vec<StatementResult>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatementResult {
    #[serde(default)]
    pub results: Vec<Map<String, Value>>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub meta: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiMessage {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: String,
}

impl QueryResponse {
    pub fn first_row(&self) -> Option<&Map<String, Value>> {
        self.result.first().and_then(|statement| statement.results.first())
    }

    fn rejection(&self) -> Option<String> {
        let statement_failed = self.result.iter().any(|s| s.success == Some(false));
        if self.success != Some(false) && !statement_failed {
            return None;
        }
        let messages = self
            .errors
            .iter()
            .map(|e| match e.code {
                Some(code) => format!("{code}: {}", e.message),
                None => e.message.clone(),
            })
            .collect::<Vec<_>>();
        Some(if messages.is_empty() {
            "success=false".to_string()
        } else {
            messages.join("; ")
        })
    }
}

/// Positional parameters for [`UPSERT_PRODUCT_SQL`].
pub fn upsert_params(record: &Record) -> Vec<Value> {
    vec![
        Value::from(record.id()),
        Value::from(record.name()),
        Value::from(record.price()),
        Value::from(record.product_url()),
        record.affiliate_url().map_or(Value::Null, Value::from),
        record.image_url().map_or(Value::Null, Value::from),
        Value::from(record.site_name()),
    ]
}

/// Write side used by the batch runner and the seeder.
#[async_trait]
pub trait ProductStore: Send + Sync {
    /// Upsert one record. Failures are logged and reported as `false`.
    async fn upsert(&self, record: &Record) -> bool;

    async fn count_products(&self) -> Result<i64, StoreError>;
}

#[derive(Debug, Clone)]
pub struct D1Config {
    pub account_id: String,
    pub database_id: String,
    pub api_token: String,
    pub base_url: String,
}

impl D1Config {
    pub fn new(
        account_id: impl Into<String>,
        database_id: impl Into<String>,
        api_token: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            database_id: database_id.into(),
            api_token: api_token.into(),
            base_url: DEFAULT_D1_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn query_endpoint(&self) -> String {
        format!(
            "{}/client/v4/accounts/{}/d1/database/{}/query",
            self.base_url.trim_end_matches('/'),
            self.account_id,
            self.database_id
        )
    }
}

#[derive(Debug, Clone)]
pub struct D1Client {
    client: reqwest::Client,
    endpoint: String,
    api_token: String,
}

impl D1Client {
    pub fn new(config: &D1Config, http: &HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self::with_client(build_http_client(http)?, config))
    }

    pub fn with_client(client: reqwest::Client, config: &D1Config) -> Self {
        Self {
            client,
            endpoint: config.query_endpoint(),
            api_token: config.api_token.clone(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Run one parameterized statement and return the decoded reply.
    pub async fn execute_query(
        &self,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<QueryResponse, StoreError> {
        let span = info_span!("d1_query", statement = statement_kind(sql));
        async move {
            let resp = self
                .client
                .post(&self.endpoint)
                .bearer_auth(&self.api_token)
                .json(&QueryRequest { sql, params })
                .send()
                .await?;

            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(StoreError::HttpStatus {
                    status: status.as_u16(),
                    body,
                });
            }

            let bytes = resp.bytes().await?;
            let reply: QueryResponse = serde_json::from_slice(&bytes)?;
            if let Some(reason) = reply.rejection() {
                return Err(StoreError::Rejected(reason));
            }
            debug!(status = status.as_u16(), statements = reply.result.len(), "query ok");
            Ok(reply)
        }
        .instrument(span)
        .await
    }

    pub async fn upsert_product(&self, record: &Record) -> bool {
        match self
            .execute_query(UPSERT_PRODUCT_SQL, upsert_params(record))
            .await
        {
            Ok(_) => {
                debug!(record_id = record.id(), site = record.site_name(), "upserted product");
                true
            }
            Err(err) => {
                error!(record_id = record.id(), error = %err, "error upserting product");
                false
            }
        }
    }

    pub async fn count_rows(&self) -> Result<i64, StoreError> {
        let reply = self.execute_query(COUNT_PRODUCTS_SQL, Vec::new()).await?;
        reply
            .first_row()
            .and_then(|row| row.get("count"))
            .and_then(Value::as_i64)
            .ok_or_else(|| StoreError::Shape("missing result[0].results[0].count".to_string()))
    }
}

#[async_trait]
impl ProductStore for D1Client {
    async fn upsert(&self, record: &Record) -> bool {
        self.upsert_product(record).await
    }

    async fn count_products(&self) -> Result<i64, StoreError> {
        self.count_rows().await
    }
}

fn statement_kind(sql: &str) -> &str {
    sql.split_whitespace().next().unwrap_or("")
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed, write-once archive for raw provider replies.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn artifact_relative_path(
        &self,
        captured_at: DateTime<Utc>,
        key: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = match extension.trim_start_matches('.').trim() {
            "" => "bin",
            ext => ext,
        };
        PathBuf::from(captured_at.format("%Y%m%d_%H%M%S").to_string())
            .join(key)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Write `bytes` under its content hash; an existing file with the same hash is reused.
    pub async fn store_bytes(
        &self,
        captured_at: DateTime<Utc>,
        key: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.artifact_relative_path(captured_at, key, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .with_context(|| format!("artifact path {} has no parent", absolute_path.display()))?;

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?;

        if !deduplicated {
            let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
            fs::write(&temp_path, bytes)
                .await
                .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
            if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
                let _ = fs::remove_file(&temp_path).await;
                return Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp artifact {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                });
            }
        }

        Ok(StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}
