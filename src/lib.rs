pub mod cli {
    pub mod counts;
}
pub mod database_ops;
pub mod embedding;
pub mod normalization;

pub mod util {
    pub mod env;
}

pub use database_ops::db::Db;

// Listing ingest pipeline (library function, not a bin): resolves each
// scraped record to a canonical brand/product, links it to its retailer,
// appends the price observation, and escalates anything ambiguous to the
// review queue.
use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

use crate::database_ops::catalog::{ensure_retailer, load_brand_catalog};
use crate::database_ops::interventions::{self, NewIntervention};
use crate::database_ops::prices::{insert_price_observation, parse_price_amount};
use crate::database_ops::products::{
    best_product_match, create_product, ensure_listing, find_product_by_display_name,
    load_product_candidates, products_missing_embedding, set_product_embedding, ListingMeta,
    NewProduct,
};
use crate::embedding::Embedder;
use crate::normalization::brand::{resolve_brand, BrandEntry};
use crate::normalization::clean::clean_display_name;
use crate::normalization::units::{parse_decimal, UnitKind, UnitTable, CONTAINER_DEFAULT_QUANTITY};

/// One scraped listing record, as handed over by a crawler batch file.
/// Only the product name and the retailer identity are mandatory.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawListing {
    pub name: String,
    #[serde(default)]
    pub brand_text: Option<String>,
    #[serde(default)]
    pub price_text: Option<String>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub unit_hint: Option<String>,
    #[serde(default)]
    pub quantity_hint: Option<String>,
    #[serde(default)]
    pub retailer_name: Option<String>,
    #[serde(default)]
    pub retailer_url: Option<String>,
    #[serde(default)]
    pub retailer_city: Option<String>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IngestStats {
    pub processed: usize,
    pub rejected: usize,
    pub products_created: usize,
    pub products_matched: usize,
    pub price_points: usize,
    pub prices_skipped: usize,
    pub interventions: usize,
    pub embedding_failures: usize,
}

fn blank(v: &Option<String>) -> bool {
    v.as_deref().map(str::trim).map_or(true, str::is_empty)
}

/// Why a record cannot be ingested at all, or `None` when it can. Rejected
/// records mutate nothing.
fn listing_rejection(listing: &RawListing) -> Option<&'static str> {
    if listing.name.trim().is_empty() {
        return Some("empty product name");
    }
    if blank(&listing.retailer_name) {
        return Some("missing retailer_name");
    }
    if blank(&listing.retailer_url) {
        return Some("missing retailer_url");
    }
    None
}

#[derive(Debug, Default, PartialEq)]
struct UnitFields {
    unit: Option<&'static str>,
    value: Option<f64>,
    /// Substring found in the name, later stripped by the cleaner. Hints
    /// never produce one; they live outside the name text.
    matched: Option<String>,
}

/// Crawler hints win over pattern detection; a measurement hint without a
/// usable quantity stays open instead of borrowing a number detected next to
/// a different unit token.
fn resolve_unit_fields(units: &UnitTable, listing: &RawListing) -> UnitFields {
    let detected = units.detect(&listing.name);
    let hint_unit = listing.unit_hint.as_deref().and_then(UnitKind::from_token);
    let hint_value = listing.quantity_hint.as_deref().and_then(parse_decimal);

    let (kind, value) = if let Some(k) = hint_unit {
        let v = hint_value.or_else(|| k.is_container().then_some(CONTAINER_DEFAULT_QUANTITY));
        (Some(k), v)
    } else if let Some(m) = &detected {
        (Some(m.unit), Some(hint_value.unwrap_or(m.value)))
    } else {
        (None, hint_value)
    };

    UnitFields {
        unit: kind.map(|k| k.canonical()),
        value,
        matched: detected.map(|m| m.matched),
    }
}

#[allow(clippy::too_many_arguments)]
async fn ingest_listing(
    db: &Db,
    embedder: &dyn Embedder,
    units: &UnitTable,
    catalog: &[BrandEntry],
    retailer_cache: &mut HashMap<String, i64>,
    default_currency: &str,
    today: NaiveDate,
    listing: &RawListing,
    stats: &mut IngestStats,
) -> Result<()> {
    if let Some(reason) = listing_rejection(listing) {
        warn!(name = %listing.name, reason, "rejecting listing record");
        stats.rejected += 1;
        return Ok(());
    }
    let retailer_name = listing.retailer_name.as_deref().unwrap_or_default().trim();
    let retailer_url = listing.retailer_url.as_deref().unwrap_or_default().trim();

    let retailer_id = match retailer_cache.get(retailer_name) {
        Some(id) => *id,
        None => {
            let id = ensure_retailer(
                db,
                retailer_name,
                retailer_url,
                listing.retailer_city.as_deref(),
            )
            .await?;
            retailer_cache.insert(retailer_name.to_string(), id);
            id
        }
    };

    let unit_fields = resolve_unit_fields(units, listing);

    // The dedicated brand field is authoritative when the crawler filled it;
    // otherwise the brand hides somewhere in the name.
    let brand_input = listing
        .brand_text
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(&listing.name);
    let (brand_hit, mut degraded) = match resolve_brand(brand_input, catalog, embedder).await {
        Ok(hit) => (hit, false),
        Err(err) => {
            warn!(name = %listing.name, error = %err, "brand resolution degraded to lexical-only");
            (None, true)
        }
    };

    let brand_token = brand_hit
        .as_ref()
        .map(|h| h.matched_token.as_deref().unwrap_or(h.canonical_name.as_str()));
    let cleaned = clean_display_name(&listing.name, unit_fields.matched.as_deref(), brand_token);
    let brand_id = brand_hit.as_ref().map(|h| h.brand_id);

    let product_id = match embedder.embed_one(&listing.name).await {
        Ok(vector) => {
            let candidates = load_product_candidates(db, brand_id).await?;
            match best_product_match(&candidates, &vector) {
                Some((id, similarity)) => {
                    info!(product_id = id, similarity, name = %listing.name, "listing matched existing product");
                    stats.products_matched += 1;
                    id
                }
                None => {
                    let id = create_product(
                        db,
                        &NewProduct {
                            display_name: &cleaned,
                            source_name: &listing.name,
                            embedding: Some(&vector),
                            brand_id,
                            unit: unit_fields.unit,
                            unit_value: unit_fields.value,
                        },
                    )
                    .await?;
                    stats.products_created += 1;
                    id
                }
            }
        }
        Err(err) => {
            warn!(name = %listing.name, error = %err, "embedding unavailable; falling back to exact-name dedup");
            stats.embedding_failures += 1;
            degraded = true;
            match find_product_by_display_name(db, brand_id, &cleaned).await? {
                Some(id) => {
                    stats.products_matched += 1;
                    id
                }
                None => {
                    let id = create_product(
                        db,
                        &NewProduct {
                            display_name: &cleaned,
                            source_name: &listing.name,
                            embedding: None,
                            brand_id,
                            unit: unit_fields.unit,
                            unit_value: unit_fields.value,
                        },
                    )
                    .await?;
                    stats.products_created += 1;
                    id
                }
            }
        }
    };

    let listing_id = ensure_listing(
        db,
        retailer_id,
        product_id,
        &ListingMeta {
            external_id: listing.external_id.as_deref(),
            external_name: &listing.name,
            url: listing.url.as_deref(),
            brand_text: listing.brand_text.as_deref(),
            quantity_text: listing.quantity_hint.as_deref(),
        },
    )
    .await?;

    if let Some(price_text) = listing
        .price_text
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        match parse_price_amount(price_text) {
            Some(amount) => {
                insert_price_observation(db, listing_id, amount, default_currency, today).await?;
                stats.price_points += 1;
            }
            None => {
                warn!(name = %listing.name, price_text, "unparseable price text; observation skipped");
                stats.prices_skipped += 1;
            }
        }
    }

    let mut reasons: Vec<&str> = Vec::new();
    if brand_hit.is_none() {
        reasons.push("brand_unresolved");
    }
    if unit_fields.unit.is_none() || unit_fields.value.is_none() {
        reasons.push("unit_unresolved");
    }
    if degraded {
        reasons.push("embedding_unavailable");
    }
    if !reasons.is_empty() {
        let reason = reasons.join(",");
        interventions::enqueue(
            db,
            &NewIntervention {
                original_name: &listing.name,
                cleaned_name: Some(&cleaned),
                unit: unit_fields.unit,
                value: unit_fields.value,
                brand_detected: brand_hit.as_ref().map(|h| h.canonical_name.as_str()),
                reason: &reason,
                motive: None,
            },
        )
        .await?;
        stats.interventions += 1;
    }

    stats.processed += 1;
    Ok(())
}

/// Ingests one crawler batch file: a JSON array of [`RawListing`] records.
/// The review queue is reconciled first so human corrections feed the brand
/// catalog before any new listing is resolved against it. Database errors
/// abort the batch; per-record problems are logged and skipped.
pub async fn run_ingest(db: &Db, embedder: &dyn Embedder, path: &Path) -> Result<IngestStats> {
    interventions::reconcile_pending(db, embedder).await?;

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read listing batch {}", path.display()))?;
    let listings: Vec<RawListing> = serde_json::from_str(&raw)
        .with_context(|| format!("parse listing batch {}", path.display()))?;
    info!(count = listings.len(), file = %path.display(), "ingesting listing batch");

    let units = UnitTable::with_defaults();
    let catalog = load_brand_catalog(db).await?;
    let default_currency =
        util::env::env_opt("DEFAULT_CURRENCY").unwrap_or_else(|| "ARS".to_string());
    let today = Utc::now().date_naive();

    let mut retailer_cache: HashMap<String, i64> = HashMap::new();
    let mut stats = IngestStats::default();
    for listing in &listings {
        ingest_listing(
            db,
            embedder,
            &units,
            &catalog,
            &mut retailer_cache,
            &default_currency,
            today,
            listing,
            &mut stats,
        )
        .await?;
    }

    info!(
        processed = stats.processed,
        rejected = stats.rejected,
        products_created = stats.products_created,
        products_matched = stats.products_matched,
        price_points = stats.price_points,
        prices_skipped = stats.prices_skipped,
        interventions = stats.interventions,
        embedding_failures = stats.embedding_failures,
        "listing batch done"
    );
    Ok(stats)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BackfillStats {
    pub scanned: usize,
    pub filled: usize,
    pub failed: usize,
}

/// Fills in embeddings for products created while the provider was down.
/// Works in batches with bounded concurrency and commits progress row by
/// row, so an interrupted run loses nothing.
pub async fn run_backfill(
    db: &Db,
    embedder: &dyn Embedder,
    batch_size: i64,
    concurrency: usize,
) -> Result<BackfillStats> {
    use futures::stream::{self, StreamExt};

    let mut stats = BackfillStats::default();
    loop {
        let pending = products_missing_embedding(db, batch_size).await?;
        if pending.is_empty() {
            break;
        }
        stats.scanned += pending.len();

        let results: Vec<(i64, Result<Vec<f32>>)> =
            stream::iter(pending.into_iter().map(|(id, source_name)| async move {
                let vector = embedder.embed_one(&source_name).await;
                (id, vector)
            }))
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let mut progressed = false;
        for (id, result) in results {
            match result {
                Ok(vector) => {
                    set_product_embedding(db, id, &vector).await?;
                    stats.filled += 1;
                    progressed = true;
                }
                Err(err) => {
                    warn!(product_id = id, error = %err, "embedding backfill failed");
                    stats.failed += 1;
                }
            }
        }
        // The same rows would come straight back; stop instead of spinning
        // while the provider is down.
        if !progressed {
            break;
        }
    }

    info!(
        scanned = stats.scanned,
        filled = stats.filled,
        failed = stats.failed,
        "embedding backfill done"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_listing_record_parses() {
        let json = r#"[{"name": "Pan Lactal Bimbo 550 g",
                        "retailer_name": "SuperA",
                        "retailer_url": "https://supera.example"}]"#;
        let listings: Vec<RawListing> = serde_json::from_str(json).unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].name, "Pan Lactal Bimbo 550 g");
        assert!(listings[0].brand_text.is_none());
        assert!(listings[0].price_text.is_none());
    }

    #[test]
    fn records_without_retailer_identity_are_rejected() {
        let mut listing = RawListing {
            name: "Leche entera 1 l".to_string(),
            retailer_name: Some("SuperA".to_string()),
            retailer_url: Some("https://supera.example".to_string()),
            ..Default::default()
        };
        assert_eq!(listing_rejection(&listing), None);

        listing.retailer_url = Some("   ".to_string());
        assert_eq!(listing_rejection(&listing), Some("missing retailer_url"));

        listing.retailer_name = None;
        assert_eq!(listing_rejection(&listing), Some("missing retailer_name"));

        listing.name = "".to_string();
        assert_eq!(listing_rejection(&listing), Some("empty product name"));
    }

    #[test]
    fn unit_hints_override_pattern_detection() {
        let units = UnitTable::with_defaults();
        let listing = RawListing {
            name: "yerba 500 g".to_string(),
            unit_hint: Some("kg".to_string()),
            quantity_hint: Some("1".to_string()),
            ..Default::default()
        };
        let fields = resolve_unit_fields(&units, &listing);
        assert_eq!(fields.unit, Some("kg"));
        assert_eq!(fields.value, Some(1.0));
        // the in-name token is still reported so the cleaner can strip it
        assert_eq!(fields.matched.as_deref(), Some("500 g"));
    }

    #[test]
    fn container_hint_defaults_to_a_single_unit() {
        let units = UnitTable::with_defaults();
        let listing = RawListing {
            name: "cerveza rubia".to_string(),
            unit_hint: Some("pack".to_string()),
            ..Default::default()
        };
        let fields = resolve_unit_fields(&units, &listing);
        assert_eq!(fields.unit, Some("pack"));
        assert_eq!(fields.value, Some(CONTAINER_DEFAULT_QUANTITY));
        assert!(fields.matched.is_none());
    }

    #[test]
    fn measurement_hint_without_quantity_stays_open() {
        let units = UnitTable::with_defaults();
        let listing = RawListing {
            name: "queso rallado".to_string(),
            unit_hint: Some("kg".to_string()),
            ..Default::default()
        };
        let fields = resolve_unit_fields(&units, &listing);
        assert_eq!(fields.unit, Some("kg"));
        assert_eq!(fields.value, None);
    }

    #[test]
    fn pattern_detection_fills_unhinted_records() {
        let units = UnitTable::with_defaults();
        let listing = RawListing {
            name: "Leche entera 1 l".to_string(),
            ..Default::default()
        };
        let fields = resolve_unit_fields(&units, &listing);
        assert_eq!(fields.unit, Some("litro"));
        assert_eq!(fields.value, Some(1.0));
        assert_eq!(fields.matched.as_deref(), Some("1 l"));

        let bare = RawListing {
            name: "pan casero".to_string(),
            ..Default::default()
        };
        let fields = resolve_unit_fields(&units, &bare);
        assert_eq!(fields, UnitFields::default());
    }
}
