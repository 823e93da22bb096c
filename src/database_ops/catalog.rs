//! Brand and retailer registry: catalog loading plus race-safe get-or-create.

use anyhow::{anyhow, Result};
use sqlx::Row;
use tracing::info;

use crate::database_ops::db::Db;
use crate::normalization::alias::{basic_aliases, merge_synonyms};
use crate::normalization::brand::BrandEntry;
use crate::normalization::clean::normalize_lookup;

/// Loads every brand in id order. Resolution walks this in order, so insertion
/// order doubles as match priority.
pub async fn load_brand_catalog(db: &Db) -> Result<Vec<BrandEntry>> {
    let rows = sqlx::query("SELECT id, name, synonyms, embedding FROM brands ORDER BY id")
        .persistent(false)
        .fetch_all(&db.pool)
        .await?;
    Ok(rows
        .into_iter()
        .map(|r| BrandEntry {
            id: r.get("id"),
            name: r.get("name"),
            synonyms: r.get("synonyms"),
            embedding: r.get::<Option<Vec<f32>>, _>("embedding"),
        })
        .collect())
}

/// Get-or-create a brand by its accent/case-insensitive key. New brands are
/// seeded with generated aliases; existing brands absorb any aliases they are
/// still missing. Returns the brand id.
pub async fn ensure_brand(db: &Db, name: &str, embedding: Option<&[f32]>) -> Result<i64> {
    let name_key = normalize_lookup(name);

    if let Some(rec) = sqlx::query("SELECT id FROM brands WHERE name_key = $1")
        .persistent(false)
        .bind(&name_key)
        .fetch_optional(&db.pool)
        .await?
    {
        let id: i64 = rec.get("id");
        let added = add_brand_synonyms(db, id, &basic_aliases(name)).await?;
        if added > 0 {
            info!(brand_id = id, added, "merged aliases into existing brand");
        }
        return Ok(id);
    }

    let (seed_synonyms, _) = merge_synonyms(name, &[], &basic_aliases(name));
    // ON CONFLICT DO NOTHING keeps racing creations of the same key quiet;
    // the loser falls through to the re-select below.
    if let Some(row) = sqlx::query(
        "INSERT INTO brands (name, name_key, synonyms, embedding) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (name_key) DO NOTHING \
         RETURNING id",
    )
    .persistent(false)
    .bind(name)
    .bind(&name_key)
    .bind(&seed_synonyms)
    .bind(embedding)
    .fetch_optional(&db.pool)
    .await?
    {
        let id: i64 = row.get("id");
        info!(brand_id = id, name, "created brand");
        return Ok(id);
    }

    let rec = sqlx::query("SELECT id FROM brands WHERE name_key = $1")
        .persistent(false)
        .bind(&name_key)
        .fetch_optional(&db.pool)
        .await?
        .ok_or_else(|| anyhow!("brands insert raced but no row found for key {}", name_key))?;
    Ok(rec.get("id"))
}

/// Merges new aliases into an existing brand's synonym set. The canonical name
/// never enters the set; duplicates are compared accent/case-insensitively.
/// Returns how many synonyms were actually added.
pub async fn add_brand_synonyms(db: &Db, brand_id: i64, additions: &[String]) -> Result<usize> {
    let rec = sqlx::query("SELECT name, synonyms FROM brands WHERE id = $1")
        .persistent(false)
        .bind(brand_id)
        .fetch_optional(&db.pool)
        .await?
        .ok_or_else(|| anyhow!("no brand with id {}", brand_id))?;
    let name: String = rec.get("name");
    let existing: Vec<String> = rec.get("synonyms");

    let (merged, added) = merge_synonyms(&name, &existing, additions);
    if added == 0 {
        return Ok(0);
    }
    sqlx::query("UPDATE brands SET synonyms = $2 WHERE id = $1")
        .persistent(false)
        .bind(brand_id)
        .bind(&merged)
        .execute(&db.pool)
        .await?;
    Ok(added)
}

/// Get-or-create a retailer by unique name. `url` is required by the input
/// contract; `city` is optional color.
pub async fn ensure_retailer(db: &Db, name: &str, url: &str, city: Option<&str>) -> Result<i64> {
    if let Some(rec) = sqlx::query("SELECT id FROM retailers WHERE name = $1")
        .persistent(false)
        .bind(name)
        .fetch_optional(&db.pool)
        .await?
    {
        return Ok(rec.get("id"));
    }

    if let Some(row) = sqlx::query(
        "INSERT INTO retailers (name, url, city) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (name) DO NOTHING \
         RETURNING id",
    )
    .persistent(false)
    .bind(name)
    .bind(url)
    .bind(city)
    .fetch_optional(&db.pool)
    .await?
    {
        let id: i64 = row.get("id");
        info!(retailer_id = id, name, "created retailer");
        return Ok(id);
    }

    let rec = sqlx::query("SELECT id FROM retailers WHERE name = $1")
        .persistent(false)
        .bind(name)
        .fetch_optional(&db.pool)
        .await?
        .ok_or_else(|| anyhow!("retailers insert raced but no row found for {}", name))?;
    Ok(rec.get("id"))
}
