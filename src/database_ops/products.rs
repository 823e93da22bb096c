//! Canonical products and per-retailer listings.
//!
//! A product is the dedup target: listings from different retailers that
//! score close enough in embedding space collapse onto one products row.
//! Matching is scoped by brand so that two brands' "yerba 500" never merge.

use anyhow::{anyhow, Result};
use sqlx::Row;
use tracing::info;

use crate::database_ops::db::Db;
use crate::embedding::cosine;

/// Minimum cosine similarity for attaching a listing to an existing product.
/// Stricter than the brand threshold: a false merge pollutes price history
/// for every retailer involved, while a missed merge only splits it.
pub const MIN_PRODUCT_SIMILARITY: f64 = 0.85;

#[derive(Debug, Clone)]
pub struct ProductCandidate {
    pub id: i64,
    pub display_name: String,
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Default)]
pub struct NewProduct<'a> {
    pub display_name: &'a str,
    pub source_name: &'a str,
    pub embedding: Option<&'a [f32]>,
    pub brand_id: Option<i64>,
    pub unit: Option<&'a str>,
    pub unit_value: Option<f64>,
}

#[derive(Debug, Default)]
pub struct ListingMeta<'a> {
    pub external_id: Option<&'a str>,
    pub external_name: &'a str,
    pub url: Option<&'a str>,
    pub brand_text: Option<&'a str>,
    pub quantity_text: Option<&'a str>,
}

/// Candidates for dedup, restricted to one brand scope. `None` scopes to
/// brand-less products; they only ever compare against each other.
pub async fn load_product_candidates(
    db: &Db,
    brand_id: Option<i64>,
) -> Result<Vec<ProductCandidate>> {
    let rows = match brand_id {
        Some(id) => {
            sqlx::query(
                "SELECT id, display_name, embedding FROM products WHERE brand_id = $1 ORDER BY id",
            )
            .persistent(false)
            .bind(id)
            .fetch_all(&db.pool)
            .await?
        }
        None => {
            sqlx::query(
                "SELECT id, display_name, embedding FROM products WHERE brand_id IS NULL ORDER BY id",
            )
            .persistent(false)
            .fetch_all(&db.pool)
            .await?
        }
    };
    Ok(rows
        .into_iter()
        .map(|r| ProductCandidate {
            id: r.get("id"),
            display_name: r.get("display_name"),
            embedding: r.get::<Option<Vec<f32>>, _>("embedding"),
        })
        .collect())
}

/// Scans candidates for the best cosine match against `embedding`. Returns
/// `Some((product_id, similarity))` only when the maximum clears
/// [`MIN_PRODUCT_SIMILARITY`]; ties keep the earliest candidate. Candidates
/// without a stored embedding never match here.
pub fn best_product_match(candidates: &[ProductCandidate], embedding: &[f32]) -> Option<(i64, f64)> {
    let mut best: Option<(i64, f64)> = None;
    for cand in candidates {
        let Some(cand_emb) = cand.embedding.as_deref() else {
            continue;
        };
        let sim = cosine(embedding, cand_emb);
        if best.map(|(_, b)| sim > b).unwrap_or(true) {
            best = Some((cand.id, sim));
        }
    }
    best.filter(|&(_, sim)| sim >= MIN_PRODUCT_SIMILARITY)
}

/// Degraded-mode dedup: exact cleaned-name match inside the brand scope,
/// used when no embedding could be computed for the incoming listing.
pub async fn find_product_by_display_name(
    db: &Db,
    brand_id: Option<i64>,
    display_name: &str,
) -> Result<Option<i64>> {
    let rec = match brand_id {
        Some(id) => {
            sqlx::query(
                "SELECT id FROM products WHERE brand_id = $1 AND display_name = $2 \
                 ORDER BY id LIMIT 1",
            )
            .persistent(false)
            .bind(id)
            .bind(display_name)
            .fetch_optional(&db.pool)
            .await?
        }
        None => {
            sqlx::query(
                "SELECT id FROM products WHERE brand_id IS NULL AND display_name = $1 \
                 ORDER BY id LIMIT 1",
            )
            .persistent(false)
            .bind(display_name)
            .fetch_optional(&db.pool)
            .await?
        }
    };
    Ok(rec.map(|r| r.get("id")))
}

pub async fn create_product(db: &Db, product: &NewProduct<'_>) -> Result<i64> {
    let row = sqlx::query(
        "INSERT INTO products (display_name, source_name, embedding, brand_id, unit, unit_value) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING id",
    )
    .persistent(false)
    .bind(product.display_name)
    .bind(product.source_name)
    .bind(product.embedding)
    .bind(product.brand_id)
    .bind(product.unit)
    .bind(product.unit_value)
    .fetch_one(&db.pool)
    .await?;
    let id: i64 = row.get("id");
    info!(product_id = id, display_name = product.display_name, "created product");
    Ok(id)
}

/// Get-or-create the (retailer, product) listing row. On an existing row only
/// NULL columns are backfilled, so earlier scrape data is never overwritten.
pub async fn ensure_listing(
    db: &Db,
    retailer_id: i64,
    product_id: i64,
    meta: &ListingMeta<'_>,
) -> Result<i64> {
    if let Some(rec) =
        sqlx::query("SELECT id FROM retailer_listings WHERE retailer_id = $1 AND product_id = $2")
            .persistent(false)
            .bind(retailer_id)
            .bind(product_id)
            .fetch_optional(&db.pool)
            .await?
    {
        let id: i64 = rec.get("id");
        if meta.external_id.is_some() || meta.url.is_some() {
            sqlx::query(
                "UPDATE retailer_listings \
                 SET external_id = COALESCE(external_id, $2), url = COALESCE(url, $3) \
                 WHERE id = $1",
            )
            .persistent(false)
            .bind(id)
            .bind(meta.external_id)
            .bind(meta.url)
            .execute(&db.pool)
            .await?;
        }
        return Ok(id);
    }

    if let Some(row) = sqlx::query(
        "INSERT INTO retailer_listings \
         (retailer_id, product_id, external_id, external_name, url, brand_text, quantity_text) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         ON CONFLICT (retailer_id, product_id) DO NOTHING \
         RETURNING id",
    )
    .persistent(false)
    .bind(retailer_id)
    .bind(product_id)
    .bind(meta.external_id)
    .bind(meta.external_name)
    .bind(meta.url)
    .bind(meta.brand_text)
    .bind(meta.quantity_text)
    .fetch_optional(&db.pool)
    .await?
    {
        return Ok(row.get("id"));
    }

    let rec =
        sqlx::query("SELECT id FROM retailer_listings WHERE retailer_id = $1 AND product_id = $2")
            .persistent(false)
            .bind(retailer_id)
            .bind(product_id)
            .fetch_optional(&db.pool)
            .await?
            .ok_or_else(|| {
                anyhow!(
                    "retailer_listings insert raced but no row found for retailer {} product {}",
                    retailer_id,
                    product_id
                )
            })?;
    Ok(rec.get("id"))
}

/// Products created in degraded mode carry no embedding; the backfill job
/// walks them oldest-first.
pub async fn products_missing_embedding(db: &Db, limit: i64) -> Result<Vec<(i64, String)>> {
    let rows = sqlx::query(
        "SELECT id, source_name FROM products WHERE embedding IS NULL ORDER BY id LIMIT $1",
    )
    .persistent(false)
    .bind(limit)
    .fetch_all(&db.pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| (r.get("id"), r.get("source_name")))
        .collect())
}

pub async fn set_product_embedding(db: &Db, product_id: i64, embedding: &[f32]) -> Result<()> {
    sqlx::query("UPDATE products SET embedding = $2 WHERE id = $1")
        .persistent(false)
        .bind(product_id)
        .bind(embedding)
        .execute(&db.pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(id: i64, embedding: Option<Vec<f32>>) -> ProductCandidate {
        ProductCandidate {
            id,
            display_name: format!("product {id}"),
            embedding,
        }
    }

    #[test]
    fn attaches_at_the_threshold() {
        let candidates = vec![cand(7, Some(vec![1.0, 0.0]))];
        let hit = best_product_match(&candidates, &[0.85, 0.5268]);
        let (id, sim) = hit.expect("0.85 is inside the acceptance band");
        assert_eq!(id, 7);
        assert!(sim >= MIN_PRODUCT_SIMILARITY);
    }

    #[test]
    fn rejects_just_below_the_threshold() {
        let candidates = vec![cand(7, Some(vec![1.0, 0.0]))];
        assert_eq!(best_product_match(&candidates, &[0.8499, 0.5269]), None);
    }

    #[test]
    fn earliest_candidate_wins_a_tie() {
        let candidates = vec![
            cand(3, Some(vec![1.0, 0.0])),
            cand(9, Some(vec![1.0, 0.0])),
        ];
        let (id, _) = best_product_match(&candidates, &[1.0, 0.0]).unwrap();
        assert_eq!(id, 3);
    }

    #[test]
    fn candidates_without_embeddings_never_match() {
        let candidates = vec![cand(3, None), cand(9, Some(vec![1.0, 0.0]))];
        let (id, _) = best_product_match(&candidates, &[1.0, 0.0]).unwrap();
        assert_eq!(id, 9);

        assert_eq!(best_product_match(&[cand(3, None)], &[1.0, 0.0]), None);
    }
}
