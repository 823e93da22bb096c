//! Shopping lists and the per-retailer basket comparison.
//!
//! The aggregation itself is pure: SQL collapses price history into one quote
//! per (product, retailer) under the chosen policy, and `build_baskets` /
//! `cheapest` do the rest in memory where they can be tested directly.

use anyhow::{bail, Result};
use indexmap::IndexMap;
use serde::Serialize;
use sqlx::Row;
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

use crate::database_ops::db::Db;

/// How "best known price" is read from the observation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PricePolicy {
    /// Lowest observation ever recorded.
    #[default]
    LowestEver,
    /// Latest observation wins, regardless of amount.
    MostRecent,
}

/// Whether a retailer missing part of the list can still win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoveragePolicy {
    /// Compare retailers on the items they carry; missing items are omitted
    /// from the subtotal, not penalized.
    #[default]
    Partial,
    /// Only retailers carrying every item are eligible to win.
    Full,
}

#[derive(Debug, Clone)]
pub struct ListItem {
    pub product_id: i64,
    pub display_name: String,
    pub quantity: f64,
}

/// One resolved price for a (product, retailer) pair under some policy.
#[derive(Debug, Clone)]
pub struct PriceQuote {
    pub product_id: i64,
    pub retailer_id: i64,
    pub retailer_name: String,
    pub price: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BasketItem {
    pub product_name: String,
    pub price: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetailerBasket {
    pub retailer_name: String,
    pub items: Vec<BasketItem>,
    pub subtotal: f64,
    pub missing_items: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComparisonResult {
    pub baskets: Vec<RetailerBasket>,
    /// Name of the winning retailer, or `None` when nobody stocks anything
    /// (or, under full coverage, nobody carries the whole list).
    pub winner: Option<String>,
}

pub async fn create_list(db: &Db, name: &str) -> Result<(i64, Uuid)> {
    let owner_token = Uuid::new_v4();
    let row = sqlx::query("INSERT INTO shopping_lists (name, owner_token) VALUES ($1, $2) RETURNING id")
        .persistent(false)
        .bind(name)
        .bind(owner_token)
        .fetch_one(&db.pool)
        .await?;
    let id: i64 = row.get("id");
    info!(list_id = id, name, "created shopping list");
    Ok((id, owner_token))
}

pub async fn add_list_item(db: &Db, list_id: i64, product_id: i64, quantity: f64) -> Result<()> {
    if quantity.is_nan() || quantity <= 0.0 {
        bail!("quantity must be positive, got {}", quantity);
    }
    sqlx::query(
        "INSERT INTO shopping_list_items (list_id, product_id, quantity) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (list_id, product_id) DO UPDATE SET quantity = EXCLUDED.quantity",
    )
    .persistent(false)
    .bind(list_id)
    .bind(product_id)
    .bind(quantity)
    .execute(&db.pool)
    .await?;
    Ok(())
}

pub async fn load_list_items(db: &Db, list_id: i64) -> Result<Vec<ListItem>> {
    let exists = sqlx::query("SELECT id FROM shopping_lists WHERE id = $1")
        .persistent(false)
        .bind(list_id)
        .fetch_optional(&db.pool)
        .await?;
    if exists.is_none() {
        bail!("no shopping list with id {}", list_id);
    }
    let rows = sqlx::query(
        "SELECT sli.product_id, sli.quantity, p.display_name \
         FROM shopping_list_items sli \
         JOIN products p ON p.id = sli.product_id \
         WHERE sli.list_id = $1 \
         ORDER BY sli.id",
    )
    .persistent(false)
    .bind(list_id)
    .fetch_all(&db.pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| ListItem {
            product_id: r.get("product_id"),
            display_name: r.get("display_name"),
            quantity: r.get("quantity"),
        })
        .collect())
}

/// One quote per (product, retailer) for the given products, under `policy`.
/// Retailers with no observations for any listed product simply do not
/// appear.
pub async fn load_quotes(
    db: &Db,
    product_ids: &[i64],
    policy: PricePolicy,
) -> Result<Vec<PriceQuote>> {
    let sql = match policy {
        PricePolicy::LowestEver => {
            "SELECT rl.product_id, rl.retailer_id, r.name AS retailer_name, \
                    MIN(po.amount) AS price \
             FROM retailer_listings rl \
             JOIN retailers r ON r.id = rl.retailer_id \
             JOIN price_observations po ON po.listing_id = rl.id \
             WHERE rl.product_id = ANY($1) \
             GROUP BY rl.product_id, rl.retailer_id, r.name \
             ORDER BY r.name, rl.product_id"
        }
        PricePolicy::MostRecent => {
            "SELECT DISTINCT ON (rl.product_id, rl.retailer_id) \
                    rl.product_id, rl.retailer_id, r.name AS retailer_name, \
                    po.amount AS price \
             FROM retailer_listings rl \
             JOIN retailers r ON r.id = rl.retailer_id \
             JOIN price_observations po ON po.listing_id = rl.id \
             WHERE rl.product_id = ANY($1) \
             ORDER BY rl.product_id, rl.retailer_id, po.observed_on DESC, po.id DESC"
        }
    };
    let rows = sqlx::query(sql)
        .persistent(false)
        .bind(product_ids)
        .fetch_all(&db.pool)
        .await?;
    Ok(rows
        .into_iter()
        .map(|r| PriceQuote {
            product_id: r.get("product_id"),
            retailer_id: r.get("retailer_id"),
            retailer_name: r.get("retailer_name"),
            price: r.get("price"),
        })
        .collect())
}

/// Folds quotes into one basket per retailer. Item order follows the shopping
/// list; basket order is cheapest-first with the retailer name as tiebreak.
pub fn build_baskets(items: &[ListItem], quotes: &[PriceQuote]) -> Vec<RetailerBasket> {
    let mut price_by_key: HashMap<(i64, i64), f64> = HashMap::new();
    let mut retailer_names: IndexMap<i64, &str> = IndexMap::new();
    for q in quotes {
        price_by_key.insert((q.product_id, q.retailer_id), q.price);
        retailer_names
            .entry(q.retailer_id)
            .or_insert(q.retailer_name.as_str());
    }

    let mut baskets: Vec<RetailerBasket> = Vec::with_capacity(retailer_names.len());
    for (retailer_id, name) in &retailer_names {
        let mut basket = RetailerBasket {
            retailer_name: (*name).to_string(),
            items: Vec::new(),
            subtotal: 0.0,
            missing_items: 0,
        };
        for item in items {
            match price_by_key.get(&(item.product_id, *retailer_id)) {
                Some(price) => {
                    basket.subtotal += price * item.quantity;
                    basket.items.push(BasketItem {
                        product_name: item.display_name.clone(),
                        price: *price,
                    });
                }
                None => basket.missing_items += 1,
            }
        }
        baskets.push(basket);
    }
    baskets.sort_by(|a, b| {
        a.subtotal
            .total_cmp(&b.subtotal)
            .then_with(|| a.retailer_name.cmp(&b.retailer_name))
    });
    baskets
}

/// Picks the winner among eligible baskets. Under [`CoveragePolicy::Full`] a
/// basket with any missing item is ineligible (it still appears in the
/// comparison output for context).
pub fn cheapest(baskets: &[RetailerBasket], coverage: CoveragePolicy) -> Option<&RetailerBasket> {
    baskets
        .iter()
        .filter(|b| match coverage {
            CoveragePolicy::Partial => true,
            CoveragePolicy::Full => b.missing_items == 0,
        })
        .min_by(|a, b| {
            a.subtotal
                .total_cmp(&b.subtotal)
                .then_with(|| a.retailer_name.cmp(&b.retailer_name))
        })
}

pub async fn compare_list(
    db: &Db,
    list_id: i64,
    price_policy: PricePolicy,
    coverage: CoveragePolicy,
) -> Result<ComparisonResult> {
    let items = load_list_items(db, list_id).await?;
    if items.is_empty() {
        return Ok(ComparisonResult {
            baskets: vec![],
            winner: None,
        });
    }
    let product_ids: Vec<i64> = items.iter().map(|i| i.product_id).collect();
    let quotes = load_quotes(db, &product_ids, price_policy).await?;
    let baskets = build_baskets(&items, &quotes);
    let winner = cheapest(&baskets, coverage).map(|b| b.retailer_name.clone());
    Ok(ComparisonResult { baskets, winner })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(product_id: i64, name: &str, quantity: f64) -> ListItem {
        ListItem {
            product_id,
            display_name: name.to_string(),
            quantity,
        }
    }

    fn quote(product_id: i64, retailer_id: i64, retailer: &str, price: f64) -> PriceQuote {
        PriceQuote {
            product_id,
            retailer_id,
            retailer_name: retailer.to_string(),
            price,
        }
    }

    fn bread_and_eggs() -> (Vec<ListItem>, Vec<PriceQuote>) {
        let items = vec![item(1, "pan lactal", 2.0), item(2, "huevos", 1.0)];
        let quotes = vec![
            quote(1, 10, "RetailerA", 150.0),
            quote(2, 10, "RetailerA", 300.0),
            quote(1, 20, "RetailerB", 140.0),
        ];
        (items, quotes)
    }

    #[test]
    fn partial_coverage_lets_the_cheaper_incomplete_basket_win() {
        let (items, quotes) = bread_and_eggs();
        let baskets = build_baskets(&items, &quotes);
        assert_eq!(baskets.len(), 2);

        let b = &baskets[0];
        assert_eq!(b.retailer_name, "RetailerB");
        assert_eq!(b.subtotal, 280.0);
        assert_eq!(b.missing_items, 1);

        let a = &baskets[1];
        assert_eq!(a.retailer_name, "RetailerA");
        assert_eq!(a.subtotal, 600.0);
        assert_eq!(a.missing_items, 0);

        let winner = cheapest(&baskets, CoveragePolicy::Partial).unwrap();
        assert_eq!(winner.retailer_name, "RetailerB");
    }

    #[test]
    fn full_coverage_excludes_baskets_with_missing_items() {
        let (items, quotes) = bread_and_eggs();
        let baskets = build_baskets(&items, &quotes);
        let winner = cheapest(&baskets, CoveragePolicy::Full).unwrap();
        assert_eq!(winner.retailer_name, "RetailerA");
    }

    #[test]
    fn full_coverage_can_leave_no_winner() {
        let items = vec![item(1, "pan lactal", 2.0), item(2, "huevos", 1.0)];
        let quotes = vec![quote(1, 20, "RetailerB", 140.0)];
        let baskets = build_baskets(&items, &quotes);
        assert_eq!(baskets.len(), 1);
        assert!(cheapest(&baskets, CoveragePolicy::Full).is_none());
    }

    #[test]
    fn no_quotes_means_no_baskets_and_no_winner() {
        let items = vec![item(1, "pan lactal", 1.0)];
        let baskets = build_baskets(&items, &[]);
        assert!(baskets.is_empty());
        assert!(cheapest(&baskets, CoveragePolicy::Partial).is_none());
    }

    #[test]
    fn equal_subtotals_break_ties_by_retailer_name() {
        let items = vec![item(1, "pan lactal", 1.0)];
        let quotes = vec![
            quote(1, 20, "Zeta", 99.0),
            quote(1, 10, "Alfa", 99.0),
        ];
        let baskets = build_baskets(&items, &quotes);
        assert_eq!(baskets[0].retailer_name, "Alfa");
        let winner = cheapest(&baskets, CoveragePolicy::Partial).unwrap();
        assert_eq!(winner.retailer_name, "Alfa");
    }

    #[test]
    fn item_order_follows_the_shopping_list() {
        let (items, quotes) = bread_and_eggs();
        let baskets = build_baskets(&items, &quotes);
        let a = baskets
            .iter()
            .find(|b| b.retailer_name == "RetailerA")
            .unwrap();
        let names: Vec<&str> = a.items.iter().map(|i| i.product_name.as_str()).collect();
        assert_eq!(names, vec!["pan lactal", "huevos"]);
        assert_eq!(a.items[0].price, 150.0);
    }
}
