//! Core product model and identity derivation for ricewatch.

use serde::Serialize;
use thiserror::Error;
use url::Url;

pub const CRATE_NAME: &str = "ricewatch-core";

/// Length of a derived product id, in hex characters.
pub const PRODUCT_ID_LEN: usize = 16;

/// Stable product id for a listing: first 16 hex chars of `md5("{site_name}_{product_url}")`.
///
/// URLs are hashed verbatim. A trailing slash or reordered query string yields a different id.
pub fn derive_id(site_name: &str, product_url: &str) -> String {
    let digest = md5::compute(format!("{site_name}_{product_url}").as_bytes());
    let mut hex = format!("{digest:x}");
    hex.truncate(PRODUCT_ID_LEN);
    hex
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("product name is empty")]
    EmptyName,
    #[error("site name is empty")]
    EmptySiteName,
    #[error("price must be non-negative, got {0}")]
    NegativePrice(i64),
    #[error("price is not a whole number: {0}")]
    InvalidPrice(String),
    #[error("product url is not an absolute url: {0}")]
    InvalidUrl(String),
}

/// One product listing as persisted in the `products` table.
///
/// `id`, `product_url` and `site_name` are fixed once built. The remaining fields change only
/// through [`Record::refresh_from`], so every value a record holds passed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    id: String,
    name: String,
    price: i64,
    product_url: String,
    affiliate_url: Option<String>,
    image_url: Option<String>,
    site_name: String,
}

/// `true` when `value` parses as an absolute URL (scheme included).
pub fn is_absolute_url(value: &str) -> bool {
    Url::parse(value).is_ok()
}

impl Record {
    pub fn new(
        site_name: impl Into<String>,
        product_url: impl Into<String>,
        name: impl Into<String>,
        price: i64,
    ) -> Result<Self, RecordError> {
        let site_name = site_name.into();
        let product_url = product_url.into();
        let name = name.into();

        if site_name.trim().is_empty() {
            return Err(RecordError::EmptySiteName);
        }
        if name.trim().is_empty() {
            return Err(RecordError::EmptyName);
        }
        if price < 0 {
            return Err(RecordError::NegativePrice(price));
        }
        if !is_absolute_url(&product_url) {
            return Err(RecordError::InvalidUrl(product_url));
        }

        Ok(Self {
            id: derive_id(&site_name, &product_url),
            name,
            price,
            product_url,
            affiliate_url: None,
            image_url: None,
            site_name,
        })
    }

    /// Blank or non-absolute values are stored as absent.
    pub fn with_image_url(mut self, image_url: Option<String>) -> Self {
        self.image_url = image_url.and_then(optional_url);
        self
    }

    /// Blank or non-absolute values are stored as absent.
    pub fn with_affiliate_url(mut self, affiliate_url: Option<String>) -> Self {
        self.affiliate_url = affiliate_url.and_then(optional_url);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn price(&self) -> i64 {
        self.price
    }

    pub fn affiliate_url(&self) -> Option<&str> {
        self.affiliate_url.as_deref()
    }

    pub fn image_url(&self) -> Option<&str> {
        self.image_url.as_deref()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn product_url(&self) -> &str {
        &self.product_url
    }

    pub fn site_name(&self) -> &str {
        &self.site_name
    }

    /// Overwrite the mutable attributes with a fresher extraction of the same listing.
    pub fn refresh_from(&mut self, newer: &Record) {
        if newer.id != self.id {
            return;
        }
        self.name = newer.name.clone();
        self.price = newer.price;
        self.affiliate_url = newer.affiliate_url.clone();
        self.image_url = newer.image_url.clone();
    }
}

fn optional_url(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || !is_absolute_url(trimmed) {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_id_is_deterministic_and_sixteen_hex_chars() {
        let a = derive_id("Amazon", "https://example-shop2.com/akitakomachi-10kg");
        let b = derive_id("Amazon", "https://example-shop2.com/akitakomachi-10kg");
        assert_eq!(a, b);
        assert_eq!(a.len(), PRODUCT_ID_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn derive_id_matches_md5_prefix_of_joined_input() {
        let full = format!("{:x}", md5::compute(b"a_b"));
        assert_eq!(derive_id("a", "b"), full[..16]);
    }

    #[test]
    fn derive_id_separates_urls_and_sites() {
        let base = derive_id("楽天市場", "https://x/a");
        assert_ne!(base, derive_id("楽天市場", "https://x/b"));
        assert_ne!(base, derive_id("Amazon", "https://x/a"));
        assert_ne!(base, derive_id("楽天市場", "https://x/a/"));
    }

    #[test]
    fn record_id_ignores_mutable_fields() {
        let cheap = Record::new("Amazon", "https://x/a", "Rice 5kg", 1000).unwrap();
        let pricey = Record::new("Amazon", "https://x/a", "Rice 5kg (new label)", 2000)
            .unwrap()
            .with_image_url(Some("https://img/x.png".into()));
        assert_eq!(cheap.id(), pricey.id());
        assert_eq!(cheap.id(), derive_id("Amazon", "https://x/a"));
    }

    #[test]
    fn record_validation_rejects_bad_input() {
        assert_eq!(
            Record::new("Amazon", "https://x/a", "  ", 10),
            Err(RecordError::EmptyName)
        );
        assert_eq!(
            Record::new("", "https://x/a", "Rice", 10),
            Err(RecordError::EmptySiteName)
        );
        assert_eq!(
            Record::new("Amazon", "https://x/a", "Rice", -1),
            Err(RecordError::NegativePrice(-1))
        );
        assert!(matches!(
            Record::new("Amazon", "/relative/path", "Rice", 10),
            Err(RecordError::InvalidUrl(_))
        ));
    }

    #[test]
    fn blank_optional_urls_become_absent() {
        let record = Record::new("Amazon", "https://x/a", "Rice", 10)
            .unwrap()
            .with_image_url(Some("   ".into()))
            .with_affiliate_url(None);
        assert_eq!(record.image_url(), None);
        assert_eq!(record.affiliate_url(), None);
    }

    #[test]
    fn relative_optional_urls_become_absent() {
        let record = Record::new("Amazon", "https://x/a", "Rice", 10)
            .unwrap()
            .with_image_url(Some("/img/a.png".into()))
            .with_affiliate_url(Some("track?id=1".into()));
        assert_eq!(record.image_url(), None);
        assert_eq!(record.affiliate_url(), None);

        let record = record.with_image_url(Some(" https://img/a.png ".into()));
        assert_eq!(record.image_url(), Some("https://img/a.png"));
    }

    #[test]
    fn refresh_keeps_identity_and_updates_attributes() {
        let mut stored = Record::new("Amazon", "https://x/a", "Rice", 1000).unwrap();
        let newer = Record::new("Amazon", "https://x/a", "Rice", 2000)
            .unwrap()
            .with_image_url(Some("https://img/a.png".into()));
        stored.refresh_from(&newer);
        assert_eq!(stored.price(), 2000);
        assert_eq!(stored.image_url(), Some("https://img/a.png"));
        assert_eq!(stored.id(), derive_id("Amazon", "https://x/a"));

        let other = Record::new("Amazon", "https://x/b", "Other", 5).unwrap();
        stored.refresh_from(&other);
        assert_eq!(stored.price(), 2000);
        assert_eq!(stored.name(), "Rice");
    }

    #[test]
    fn record_serializes_all_columns() {
        let record = Record::new("Amazon", "https://x/a", "Rice", 10).unwrap();
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["id"], derive_id("Amazon", "https://x/a"));
        assert_eq!(value["site_name"], "Amazon");
        assert!(value["image_url"].is_null());
    }
}
