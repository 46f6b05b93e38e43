//! LLM-backed product extraction: provider client, reply parsing, record materialization.

use async_trait::async_trait;
use chrono::Utc;
use ricewatch_core::{derive_id, is_absolute_url, Record, RecordError};
use ricewatch_storage::{build_http_client, ArtifactStore, HttpClientConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "ricewatch-adapters";

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-flash";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned http status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("provider reply could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("provider reply contained no text")]
    EmptyResponse,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("no {{...}} span found in provider reply")]
    NoJsonObject,
    #[error("embedded json is invalid: {0}")]
    InvalidJson(String),
    #[error("`products` is not an array")]
    ProductsNotArray,
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error(transparent)]
    Provider(#[from] AdapterError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("product #{index} is invalid: {source}")]
    InvalidItem {
        index: usize,
        #[source]
        source: RecordError,
    },
}

/// Text-in/text-out generation provider.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, AdapterError>;
}

/// Turns free-form provider text into a JSON document.
pub trait ResponseParser: Send + Sync {
    fn parse(&self, text: &str) -> Result<JsonValue, ParseError>;
}

/// Parses the span from the first `{` to the last `}`, ignoring any chatter around it.
#[derive(Debug, Clone, Copy, Default)]
pub struct BraceSpanParser;

impl ResponseParser for BraceSpanParser {
    fn parse(&self, text: &str) -> Result<JsonValue, ParseError> {
        let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
            return Err(ParseError::NoJsonObject);
        };
        if end <= start {
            return Err(ParseError::NoJsonObject);
        }
        let span = text.get(start..=end).ok_or(ParseError::NoJsonObject)?;
        serde_json::from_str(span).map_err(|e| ParseError::InvalidJson(e.to_string()))
    }
}

/// What to do when one entry of `products` cannot become a [`Record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemPolicy {
    /// Drop the bad entry and keep the rest.
    #[default]
    SkipInvalid,
    /// Discard the whole reply.
    AbortOnInvalid,
}

/// Read side used by the batch runner.
#[async_trait]
pub trait ProductSource: Send + Sync {
    /// Extract the products listed at `url`. Never fails; problems yield an empty list.
    async fn extract(&self, url: &str, site_name: &str) -> Vec<Record>;
}

pub fn build_prompt(url: &str) -> String {
    format!(
        r#"Extract the rice products listed on the following e-commerce page.
URL: {url}

For every product, extract:
- name: product name (rice variety, origin and bag size)
- price: tax-inclusive price in yen, digits only
- product_url: URL of the product detail page
- image_url: URL of the product image

Respond with JSON in exactly this shape:
{{
    "products": [
        {{
            "name": "product name",
            "price": 0,
            "product_url": "https://...",
            "image_url": "https://..."
        }}
    ]
}}

Rules:
- Exclude anything that is not rice.
- Use the tax-inclusive price.
- All URLs must be absolute and start with https://.
"#
    )
}

pub fn coerce_price(value: &JsonValue) -> Result<i64, RecordError> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| {
                // i64::MAX as f64 rounds up to 2^63, so the upper bound is exclusive.
                n.as_f64()
                    .filter(|f| f.is_finite() && f.fract() == 0.0)
                    .filter(|&f| f >= i64::MIN as f64 && f < i64::MAX as f64)
                    .map(|f| f as i64)
            })
            .ok_or_else(|| RecordError::InvalidPrice(n.to_string())),
        JsonValue::String(s) => s
            .chars()
            .filter(|&c| !matches!(c, ',' | '¥' | '￥' | '円') && !c.is_whitespace())
            .collect::<String>()
            .parse::<i64>()
            .map_err(|_| RecordError::InvalidPrice(s.clone())),
        other => Err(RecordError::InvalidPrice(other.to_string())),
    }
}

fn required_str<'a>(item: &'a JsonValue, key: &'static str) -> Result<&'a str, RecordError> {
    item.get(key)
        .and_then(JsonValue::as_str)
        .ok_or(RecordError::MissingField(key))
}

pub fn item_to_record(item: &JsonValue, site_name: &str) -> Result<Record, RecordError> {
    let name = required_str(item, "name")?;
    let price = item
        .get("price")
        .filter(|v| !v.is_null())
        .ok_or(RecordError::MissingField("price"))
        .and_then(coerce_price)?;
    let product_url = required_str(item, "product_url")?;
    let image_url = item
        .get("image_url")
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|url| !url.is_empty());
    if let Some(url) = image_url.filter(|url| !is_absolute_url(url)) {
        warn!(site = site_name, product_url, image_url = url, "dropping non-absolute image url");
    }

    Ok(Record::new(site_name, product_url, name, price)?
        .with_image_url(image_url.map(ToString::to_string)))
}

/// Materialize every entry of `document.products` for `site_name`.
pub fn records_from_document(
    document: &JsonValue,
    site_name: &str,
    policy: ItemPolicy,
) -> Result<Vec<Record>, ExtractionError> {
    let items = match document.get("products") {
        None | Some(JsonValue::Null) => return Ok(Vec::new()),
        Some(JsonValue::Array(items)) => items,
        Some(_) => return Err(ParseError::ProductsNotArray.into()),
    };

    let mut records = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        match item_to_record(item, site_name) {
            Ok(record) => records.push(record),
            Err(source) if policy == ItemPolicy::SkipInvalid => {
                warn!(site = site_name, index, error = %source, "skipping invalid product");
            }
            Err(source) => return Err(ExtractionError::InvalidItem { index, source }),
        }
    }
    Ok(records)
}

pub struct LlmProductExtractor<G> {
    generator: G,
    parser: Box<dyn ResponseParser>,
    item_policy: ItemPolicy,
    archive: Option<ArtifactStore>,
}

impl<G: TextGenerator> LlmProductExtractor<G> {
    pub fn new(generator: G) -> Self {
        Self {
            generator,
            parser: Box::new(BraceSpanParser),
            item_policy: ItemPolicy::default(),
            archive: None,
        }
    }

    pub fn with_parser(mut self, parser: Box<dyn ResponseParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_item_policy(mut self, item_policy: ItemPolicy) -> Self {
        self.item_policy = item_policy;
        self
    }

    pub fn with_archive(mut self, archive: Option<ArtifactStore>) -> Self {
        self.archive = archive;
        self
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub async fn try_extract(
        &self,
        url: &str,
        site_name: &str,
    ) -> Result<Vec<Record>, ExtractionError> {
        let reply = self.generator.generate(&build_prompt(url)).await?;
        debug!(site = site_name, reply_len = reply.len(), "provider reply received");
        self.archive_reply(url, site_name, &reply).await;

        let document = self.parser.parse(&reply)?;
        records_from_document(&document, site_name, self.item_policy)
    }

    async fn archive_reply(&self, url: &str, site_name: &str, reply: &str) {
        let Some(archive) = &self.archive else {
            return;
        };
        let key = derive_id(site_name, url);
        match archive
            .store_bytes(Utc::now(), &key, "txt", reply.as_bytes())
            .await
        {
            Ok(stored) => debug!(
                site = site_name,
                path = %stored.relative_path.display(),
                deduplicated = stored.deduplicated,
                "archived provider reply"
            ),
            Err(err) => warn!(site = site_name, error = %err, "could not archive provider reply"),
        }
    }
}

#[async_trait]
impl<G: TextGenerator> ProductSource for LlmProductExtractor<G> {
    async fn extract(&self, url: &str, site_name: &str) -> Vec<Record> {
        match self.try_extract(url, site_name).await {
            Ok(records) => records,
            Err(err) => {
                error!(site = site_name, url, error = %err, "error extracting products");
                Vec::new()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_GEMINI_MODEL.to_string(),
            base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        )
    }
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest<'a> {
    contents: Vec<RequestContent<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestContent<'a> {
    parts: Vec<RequestPart<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

impl GenerateContentResponse {
    fn into_text(self) -> Option<String> {
        let text = self
            .candidates
            .into_iter()
            .next()?
            .content?
            .parts
            .into_iter()
            .filter_map(|p| p.text)
            .collect::<String>();
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

/// Gemini `generateContent` over plain HTTPS.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    client: reqwest::Client,
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig, http: &HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_http_client(http)?,
            config,
        })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }
}

#[async_trait]
impl TextGenerator for GeminiClient {
    async fn generate(&self, prompt: &str) -> Result<String, AdapterError> {
        let span = info_span!("gemini_generate", model = %self.config.model);
        async move {
            info!(prompt_len = prompt.len(), "calling provider");
            let request = GenerateContentRequest {
                contents: vec![RequestContent {
                    parts: vec![RequestPart { text: prompt }],
                }],
            };
            let resp = self
                .client
                .post(self.config.endpoint())
                .header("x-goog-api-key", self.config.api_key.as_str())
                .json(&request)
                .send()
                .await?;

            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(AdapterError::Status {
                    status: status.as_u16(),
                    body,
                });
            }

            let bytes = resp.bytes().await?;
            let decoded: GenerateContentResponse = serde_json::from_slice(&bytes)?;
            decoded.into_text().ok_or(AdapterError::EmptyResponse)
        }
        .instrument(span)
        .await
    }
}
