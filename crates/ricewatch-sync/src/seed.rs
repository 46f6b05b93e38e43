//! Seed the product store with a fixed set of sample listings.

use anyhow::{Context, Result};
use ricewatch_core::{Record, RecordError};
use ricewatch_storage::{D1Client, ProductStore};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::Settings;

struct SampleProduct {
    name: &'static str,
    price: i64,
    product_url: &'static str,
    affiliate_url: &'static str,
    image_url: &'static str,
    site_name: &'static str,
}

const SAMPLE_PRODUCTS: [SampleProduct; 6] = [
    SampleProduct {
        name: "新潟県産コシヒカリ 5kg",
        price: 2980,
        product_url: "https://example-shop1.com/koshihikari-5kg",
        affiliate_url: "https://affiliate.example.com/track?id=1234",
        image_url: "https://placehold.co/300x300/e8f4f8/2c3e50?text=コシヒカリ+5kg",
        site_name: "楽天市場",
    },
    SampleProduct {
        name: "秋田県産あきたこまち 10kg",
        price: 4580,
        product_url: "https://example-shop2.com/akitakomachi-10kg",
        affiliate_url: "https://affiliate.example.com/track?id=5678",
        image_url: "https://placehold.co/300x300/f8e8e8/2c3e50?text=あきたこまち+10kg",
        site_name: "Amazon",
    },
    SampleProduct {
        name: "北海道産ゆめぴりか 5kg",
        price: 3480,
        product_url: "https://example-shop3.com/yumepirika-5kg",
        affiliate_url: "https://affiliate.example.com/track?id=9012",
        image_url: "https://placehold.co/300x300/e8e8f8/2c3e50?text=ゆめぴりか+5kg",
        site_name: "楽天市場",
    },
    SampleProduct {
        name: "山形県産つや姫 5kg",
        price: 3280,
        product_url: "https://example-shop4.com/tsuyahime-5kg",
        affiliate_url: "https://affiliate.example.com/track?id=3456",
        image_url: "https://placehold.co/300x300/f8f4e8/2c3e50?text=つや姫+5kg",
        site_name: "Amazon",
    },
    SampleProduct {
        name: "宮城県産ひとめぼれ 10kg",
        price: 4280,
        product_url: "https://example-shop5.com/hitomebore-10kg",
        affiliate_url: "https://affiliate.example.com/track?id=7890",
        image_url: "https://placehold.co/300x300/e8f8e8/2c3e50?text=ひとめぼれ+10kg",
        site_name: "楽天市場",
    },
    SampleProduct {
        name: "福岡県産夢つくし 5kg お買い得品",
        price: 2480,
        product_url: "https://example-shop6.com/yumetsukushi-5kg",
        affiliate_url: "https://affiliate.example.com/track?id=2468",
        image_url: "https://placehold.co/300x300/f4f8e8/2c3e50?text=夢つくし+5kg",
        site_name: "Amazon",
    },
];

pub fn sample_products() -> Result<Vec<Record>, RecordError> {
    SAMPLE_PRODUCTS
        .iter()
        .map(|p| -> Result<Record, RecordError> {
            Ok(Record::new(p.site_name, p.product_url, p.name, p.price)?
                .with_affiliate_url(Some(p.affiliate_url.to_string()))
                .with_image_url(Some(p.image_url.to_string())))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeedSummary {
    pub attempted: usize,
    pub inserted: usize,
    /// `None` when the count query failed.
    pub row_count: Option<i64>,
}

pub async fn run_seed(store: &dyn ProductStore) -> Result<SeedSummary> {
    let products = sample_products().context("building sample products")?;

    let mut inserted = 0usize;
    for product in &products {
        if store.upsert(product).await {
            inserted += 1;
            info!(record_id = product.id(), price = product.price(), "seeded {}", product.name());
        } else {
            warn!(record_id = product.id(), "failed to seed {}", product.name());
        }
    }
    info!(inserted, total = products.len(), "seeded {inserted}/{} products", products.len());

    let row_count = match store.count_products().await {
        Ok(count) => {
            info!(count, "products currently in store");
            Some(count)
        }
        Err(err) => {
            error!(error = %err, "could not count products");
            None
        }
    };

    Ok(SeedSummary {
        attempted: products.len(),
        inserted,
        row_count,
    })
}

pub async fn run_seed_once_from_env() -> Result<SeedSummary> {
    let settings = Settings::from_env();
    let config = settings.store_config()?;
    let client = D1Client::new(&config, &settings.http_config()?)?;
    run_seed(&client).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeStore;
    use ricewatch_core::derive_id;
    use std::collections::HashSet;

    #[test]
    fn sample_products_have_stable_ids_and_all_columns() {
        let products = sample_products().unwrap();
        assert_eq!(products.len(), 6);

        let ids = products.iter().map(|p| p.id()).collect::<HashSet<_>>();
        assert_eq!(ids.len(), 6);

        let first = &products[0];
        assert_eq!(
            first.id(),
            derive_id("楽天市場", "https://example-shop1.com/koshihikari-5kg")
        );
        assert_eq!(first.price(), 2980);
        assert!(products
            .iter()
            .all(|p| p.affiliate_url().is_some() && p.image_url().is_some()));
    }

    #[tokio::test]
    async fn seed_counts_successes_and_reads_row_count() {
        let products = sample_products().unwrap();
        let store = FakeStore {
            failing_ids: [products[3].id().to_string()].into_iter().collect(),
            row_count: Some(11),
            ..Default::default()
        };

        let summary = run_seed(&store).await.unwrap();

        assert_eq!(
            summary,
            SeedSummary {
                attempted: 6,
                inserted: 5,
                row_count: Some(11)
            }
        );
        assert_eq!(store.upserts.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn failed_count_does_not_fail_the_seed() {
        let store = FakeStore::default();
        let summary = run_seed(&store).await.unwrap();
        assert_eq!(summary.inserted, 6);
        assert_eq!(summary.row_count, None);
    }
}
