//! Append-only price history and best-price lookups.

use anyhow::Result;
use chrono::NaiveDate;
use serde::Serialize;
use sqlx::Row;

use crate::database_ops::db::Db;

/// Cheapest known price for one product, with the retailer that offered it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BestPrice {
    pub price: f64,
    pub retailer_name: String,
}

/// History is append-only: every ingest writes a fresh row, nothing is
/// updated in place.
pub async fn insert_price_observation(
    db: &Db,
    listing_id: i64,
    amount: f64,
    currency: &str,
    observed_on: NaiveDate,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO price_observations (listing_id, amount, currency, observed_on) \
         VALUES ($1, $2, $3, $4)",
    )
    .persistent(false)
    .bind(listing_id)
    .bind(amount)
    .bind(currency)
    .bind(observed_on)
    .execute(&db.pool)
    .await?;
    Ok(())
}

/// Lowest observation ever recorded for the product, across every retailer
/// that lists it. `None` when the product has no price history at all.
pub async fn best_price_for_product(db: &Db, product_id: i64) -> Result<Option<BestPrice>> {
    let rec = sqlx::query(
        "SELECT po.amount, r.name AS retailer_name \
         FROM price_observations po \
         JOIN retailer_listings rl ON rl.id = po.listing_id \
         JOIN retailers r ON r.id = rl.retailer_id \
         WHERE rl.product_id = $1 \
         ORDER BY po.amount ASC, po.observed_on ASC \
         LIMIT 1",
    )
    .persistent(false)
    .bind(product_id)
    .fetch_optional(&db.pool)
    .await?;
    Ok(rec.map(|r| BestPrice {
        price: r.get("amount"),
        retailer_name: r.get("retailer_name"),
    }))
}

/// Parses scraped price text into an amount. Handles both regional formats:
/// "$ 1.234,56" (dot thousands, comma decimals) and "1,234.56". A lone
/// separator is decimal only when 1-2 digits follow it, so "1.234" reads as
/// one thousand two hundred thirty-four.
pub fn parse_price_amount(text: &str) -> Option<f64> {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    if !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    let normalized = match (cleaned.rfind('.'), cleaned.rfind(',')) {
        (Some(dot), Some(comma)) => {
            // Both present: the later separator is the decimal point.
            let thousands = if dot > comma { ',' } else { '.' };
            let s: String = cleaned.chars().filter(|&ch| ch != thousands).collect();
            s.replace(',', ".")
        }
        (None, Some(comma)) => {
            let frac_digits = cleaned.len() - comma - 1;
            if (1..=2).contains(&frac_digits) {
                cleaned.replace(',', ".")
            } else {
                cleaned.replace(',', "")
            }
        }
        (Some(dot), None) => {
            let frac_digits = cleaned.len() - dot - 1;
            if (1..=2).contains(&frac_digits) {
                cleaned
            } else {
                cleaned.replace('.', "")
            }
        }
        (None, None) => cleaned,
    };
    normalized
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dot_thousands_comma_decimals() {
        assert_eq!(parse_price_amount("$ 1.234,56"), Some(1234.56));
        assert_eq!(parse_price_amount("$ 2.799"), Some(2799.0));
    }

    #[test]
    fn parses_comma_thousands_dot_decimals() {
        assert_eq!(parse_price_amount("1,234.56"), Some(1234.56));
    }

    #[test]
    fn lone_separator_with_short_fraction_is_decimal() {
        assert_eq!(parse_price_amount("129,99"), Some(129.99));
        assert_eq!(parse_price_amount("9.5"), Some(9.5));
    }

    #[test]
    fn rejects_text_without_digits() {
        assert_eq!(parse_price_amount("consultar precio"), None);
        assert_eq!(parse_price_amount(""), None);
    }

    #[test]
    fn rejects_ambiguous_separator_runs() {
        assert_eq!(parse_price_amount("12,34,56"), None);
    }
}
