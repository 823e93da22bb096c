use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::Row;

use crate::database_ops::db::Db;
use crate::util::env as env_util;

#[derive(Debug, Clone, Default)]
pub struct CountsConfig {
    /// Optional override for the Postgres connection string.
    pub database_url: Option<String>,
    /// Force whether recent price observations are displayed (defaults to env RECENT_PRICES).
    pub show_recent_prices: Option<bool>,
    /// Override the recent observations LIMIT (defaults to env RECENT_PRICES_LIMIT or 20).
    pub recent_prices_limit: Option<i64>,
}

/// Prints a health summary of the catalog: row counts, review-queue backlog,
/// per-retailer price coverage. Tolerates a partially migrated database so it
/// stays usable as a first diagnostic.
pub async fn run(cfg: CountsConfig) -> Result<()> {
    env_util::init_env();
    let db_url = if let Some(url) = cfg.database_url.clone() {
        url
    } else {
        env_util::db_url().map_err(|e| {
            anyhow::anyhow!(
                "Database URL env resolved to empty string; check SUPER_DB_URL / DATABASE_URL ({e})"
            )
        })?
    };
    let db = Db::connect(&db_url, 5).await?;
    let pool = &db.pool;

    fn is_undefined_table_error(err: &sqlx::Error) -> bool {
        match err {
            sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("42P01"),
            _ => false,
        }
    }

    macro_rules! count {
        ($sql:expr) => {
            match sqlx::query_scalar::<_, i64>($sql)
                .persistent(false)
                .fetch_one(pool)
                .await
            {
                Ok(val) => val,
                Err(e) if is_undefined_table_error(&e) => 0,
                Err(e) => return Err(e.into()),
            }
        };
    }

    async fn latest_date(pool: &sqlx::PgPool, sql: &str) -> Result<Option<NaiveDate>> {
        match sqlx::query_scalar::<_, Option<NaiveDate>>(sql)
            .persistent(false)
            .fetch_one(pool)
            .await
        {
            Ok(v) => Ok(v),
            Err(e) if is_undefined_table_error(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn oldest_timestamp(pool: &sqlx::PgPool, sql: &str) -> Result<Option<DateTime<Utc>>> {
        match sqlx::query_scalar::<_, Option<DateTime<Utc>>>(sql)
            .persistent(false)
            .fetch_one(pool)
            .await
        {
            Ok(v) => Ok(v),
            Err(e) if is_undefined_table_error(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    let brands = count!("SELECT count(*) FROM brands");
    let brands_with_embedding = count!("SELECT count(*) FROM brands WHERE embedding IS NOT NULL");
    let retailers = count!("SELECT count(*) FROM retailers");
    let products = count!("SELECT count(*) FROM products");
    let products_missing_embedding = count!("SELECT count(*) FROM products WHERE embedding IS NULL");
    let products_without_brand = count!("SELECT count(*) FROM products WHERE brand_id IS NULL");
    let products_without_unit =
        count!("SELECT count(*) FROM products WHERE unit IS NULL OR unit_value IS NULL");
    let listings = count!("SELECT count(*) FROM retailer_listings");
    let observations = count!("SELECT count(*) FROM price_observations");
    let observations_7d = count!(
        "SELECT count(*) FROM price_observations WHERE observed_on > CURRENT_DATE - INTERVAL '7 days'"
    );
    let latest_observed =
        latest_date(pool, "SELECT MAX(observed_on) FROM price_observations").await?;
    let lists = count!("SELECT count(*) FROM shopping_lists");
    let list_items = count!("SELECT count(*) FROM shopping_list_items");
    let queue_pending =
        count!("SELECT count(*) FROM pending_interventions WHERE status = 'pending'");
    let queue_resolved =
        count!("SELECT count(*) FROM pending_interventions WHERE status = 'resolved'");
    let queue_discarded =
        count!("SELECT count(*) FROM pending_interventions WHERE status = 'discarded'");
    let queue_oldest = oldest_timestamp(
        pool,
        "SELECT MIN(queued_at) FROM pending_interventions WHERE status = 'pending'",
    )
    .await?;

    use std::fmt::Write as _;
    let mut out = String::new();
    writeln!(out, "DB COUNTS SUMMARY:").ok();
    writeln!(out, "brands: {brands} (with embedding: {brands_with_embedding})").ok();
    writeln!(out, "retailers: {retailers}").ok();
    writeln!(
        out,
        "products: {products} (missing embedding: {products_missing_embedding}, without brand: {products_without_brand}, without unit: {products_without_unit})"
    )
    .ok();
    writeln!(out, "retailer_listings: {listings}").ok();
    writeln!(
        out,
        "price_observations: {observations} (last 7 days: {observations_7d}, latest: {})",
        latest_observed
            .map(|d| d.to_string())
            .unwrap_or_else(|| "(none)".to_string())
    )
    .ok();
    writeln!(out, "shopping_lists: {lists} (items: {list_items})").ok();
    writeln!(
        out,
        "review queue: pending {queue_pending}, resolved {queue_resolved}, discarded {queue_discarded}"
    )
    .ok();
    if let Some(oldest) = queue_oldest {
        writeln!(
            out,
            "  oldest pending entry queued at {} UTC",
            oldest.format("%Y-%m-%d %H:%M")
        )
        .ok();
    }
    println!("{out}");
    out.clear();

    let reason_breakdown = sqlx::query(
        r#"
        SELECT reason AS k, COUNT(*)::bigint AS n
        FROM pending_interventions
        WHERE status = 'pending'
        GROUP BY reason
        ORDER BY n DESC
        LIMIT 10
        "#,
    )
    .persistent(false)
    .fetch_all(pool)
    .await
    .unwrap_or_default();
    if !reason_breakdown.is_empty() {
        writeln!(out, "pending queue by reason (top 10):").ok();
        for r in reason_breakdown {
            let k: String = r.get("k");
            let n: i64 = r.get("n");
            writeln!(out, "  {k}: {n}").ok();
        }
        println!("{out}");
        out.clear();
    }

    let coverage_rows = sqlx::query(
        r#"
        WITH priced AS (
            SELECT listing_id, MAX(observed_on) AS latest_observed_on
            FROM price_observations
            GROUP BY listing_id
        )
        SELECT
            r.id,
            r.name,
            COUNT(l.id) AS listings,
            COUNT(l.id) FILTER (WHERE pr.listing_id IS NOT NULL) AS listings_with_price,
            MAX(pr.latest_observed_on) AS latest_observed_on
        FROM retailers r
        LEFT JOIN retailer_listings l ON l.retailer_id = r.id
        LEFT JOIN priced pr ON pr.listing_id = l.id
        GROUP BY r.id, r.name
        ORDER BY r.name
        "#,
    )
    .persistent(false)
    .fetch_all(pool)
    .await
    .unwrap_or_default();
    if !coverage_rows.is_empty() {
        writeln!(out, "retailer coverage summary:").ok();
        for row in coverage_rows {
            let retailer_id: i64 = row.get("id");
            let name: String = row.get("name");
            let listings: i64 = row.get("listings");
            let listings_with_price: i64 = row.get("listings_with_price");
            let latest: Option<NaiveDate> = row.try_get("latest_observed_on").ok().flatten();

            let pct = if listings > 0 {
                ((listings_with_price as f64) / (listings as f64)) * 100.0
            } else {
                0.0
            };

            let mut flags: Vec<&str> = Vec::new();
            if listings == 0 {
                flags.push("no listings");
            } else if listings_with_price == 0 {
                flags.push("no price coverage");
            } else if listings_with_price < listings {
                flags.push("partial price coverage");
            }
            let note = if flags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", flags.join("; "))
            };
            let latest_s = latest
                .map(|d| d.to_string())
                .unwrap_or_else(|| "never".to_string());

            writeln!(
                out,
                "  {name} #{retailer_id}: listings {listings} (priced {listings_with_price}, {pct:.1}%), latest observation {latest_s}{note}"
            )
            .ok();
        }
        println!("{out}");
        out.clear();
    }

    let want_recent = cfg
        .show_recent_prices
        .unwrap_or_else(|| env_util::env_flag("RECENT_PRICES", false));
    if want_recent {
        let limit: i64 = cfg
            .recent_prices_limit
            .unwrap_or_else(|| env_util::env_parse("RECENT_PRICES_LIMIT", 20));
        let recent = sqlx::query(
            r#"
            SELECT po.observed_on, po.amount, po.currency, r.name AS retailer_name, p.display_name
            FROM price_observations po
            JOIN retailer_listings l ON l.id = po.listing_id
            JOIN retailers r ON r.id = l.retailer_id
            JOIN products p ON p.id = l.product_id
            ORDER BY po.id DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .persistent(false)
        .fetch_all(pool)
        .await
        .unwrap_or_default();
        writeln!(out, "recent price observations (limit {limit}):").ok();
        for r in recent {
            let observed_on: NaiveDate = r.get("observed_on");
            let amount: f64 = r.get("amount");
            let currency: String = r.get("currency");
            let retailer_name: String = r.get("retailer_name");
            let display_name: String = r.get("display_name");
            writeln!(
                out,
                "  {observed_on} {retailer_name}: {display_name} -> {amount:.2} {currency}"
            )
            .ok();
        }
        println!("{out}");
    }

    Ok(())
}
