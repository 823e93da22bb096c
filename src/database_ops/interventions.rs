//! Durable human-review queue.
//!
//! Listings whose brand or unit could not be determined land here. The queue
//! lives in the database (`pending_interventions` with a status column);
//! editors exchange it as CSV through explicit export/import commands. A row
//! leaves the pending state only when brand, unit and value are all present,
//! or through an explicit discard/purge.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Row};
use std::path::Path;
use tracing::{info, warn};

use crate::database_ops::catalog::{ensure_brand, load_brand_catalog};
use crate::database_ops::db::Db;
use crate::embedding::Embedder;
use crate::normalization::brand::{resolve_brand, BrandEntry};
use crate::normalization::clean::normalize_lookup;
use crate::normalization::units::{parse_decimal, UnitKind, UnitTable};

pub const CSV_HEADERS: [&str; 9] = [
    "id",
    "timestamp",
    "original_name",
    "cleaned_name",
    "unit",
    "value",
    "brand_detected",
    "intervention_reason",
    "motive",
];

#[derive(Debug, Clone)]
pub struct PendingIntervention {
    pub id: i64,
    pub queued_at: DateTime<Utc>,
    pub original_name: String,
    pub cleaned_name: Option<String>,
    pub unit: Option<String>,
    /// Kept as text so human edits survive verbatim; parsed at reconcile time.
    pub value: Option<String>,
    pub brand_detected: Option<String>,
    pub reason: String,
    pub motive: Option<String>,
}

#[derive(Debug, Default)]
pub struct NewIntervention<'a> {
    pub original_name: &'a str,
    pub cleaned_name: Option<&'a str>,
    pub unit: Option<&'a str>,
    pub value: Option<f64>,
    pub brand_detected: Option<&'a str>,
    pub reason: &'a str,
    pub motive: Option<&'a str>,
}

pub async fn enqueue(db: &Db, item: &NewIntervention<'_>) -> Result<i64> {
    let row = sqlx::query(
        "INSERT INTO pending_interventions \
         (original_name, cleaned_name, unit, value, brand_detected, reason, motive) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING id",
    )
    .persistent(false)
    .bind(item.original_name)
    .bind(item.cleaned_name)
    .bind(item.unit)
    .bind(item.value.map(|v| v.to_string()))
    .bind(item.brand_detected)
    .bind(item.reason)
    .bind(item.motive)
    .fetch_one(&db.pool)
    .await?;
    Ok(row.get("id"))
}

pub async fn load_pending(db: &Db) -> Result<Vec<PendingIntervention>> {
    let rows = sqlx::query(
        "SELECT id, queued_at, original_name, cleaned_name, unit, value, brand_detected, \
                reason, motive \
         FROM pending_interventions WHERE status = 'pending' ORDER BY id",
    )
    .persistent(false)
    .fetch_all(&db.pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| PendingIntervention {
            id: r.get("id"),
            queued_at: r.get("queued_at"),
            original_name: r.get("original_name"),
            cleaned_name: r.get("cleaned_name"),
            unit: r.get("unit"),
            value: r.get("value"),
            brand_detected: r.get("brand_detected"),
            reason: r.get("reason"),
            motive: r.get("motive"),
        })
        .collect())
}

pub async fn mark_resolved(db: &Db, id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE pending_interventions SET status = 'resolved', resolved_at = now() WHERE id = $1",
    )
    .persistent(false)
    .bind(id)
    .execute(&db.pool)
    .await?;
    Ok(())
}

pub async fn mark_discarded(db: &Db, id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE pending_interventions SET status = 'discarded', resolved_at = now() WHERE id = $1",
    )
    .persistent(false)
    .bind(id)
    .execute(&db.pool)
    .await?;
    Ok(())
}

/// Deletes resolution tombstones. Pending and discarded rows are untouched.
pub async fn purge_resolved(db: &Db) -> Result<u64> {
    let res = sqlx::query("DELETE FROM pending_interventions WHERE status = 'resolved'")
        .persistent(false)
        .execute(&db.pool)
        .await?;
    Ok(res.rows_affected())
}

/// Writes every pending row to `path` for offline editing. Returns the row
/// count.
pub async fn export_csv(db: &Db, path: &Path) -> Result<usize> {
    let rows = load_pending(db).await?;
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("create {}", path.display()))?;
    wtr.write_record(CSV_HEADERS)?;
    for row in &rows {
        wtr.write_record([
            row.id.to_string(),
            row.queued_at.to_rfc3339(),
            row.original_name.clone(),
            row.cleaned_name.clone().unwrap_or_default(),
            row.unit.clone().unwrap_or_default(),
            row.value.clone().unwrap_or_default(),
            row.brand_detected.clone().unwrap_or_default(),
            row.reason.clone(),
            row.motive.clone().unwrap_or_default(),
        ])?;
    }
    wtr.flush()?;
    info!(count = rows.len(), path = %path.display(), "exported pending interventions");
    Ok(rows.len())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ImportStats {
    pub updated: usize,
    pub appended: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
struct CsvRow {
    id: Option<i64>,
    original_name: String,
    unit: Option<String>,
    value: Option<String>,
    brand_detected: Option<String>,
    reason: Option<String>,
    motive: Option<String>,
}

impl CsvRow {
    fn is_structurally_empty(&self) -> bool {
        self.original_name.trim().is_empty()
            && self.unit.is_none()
            && self.value.is_none()
            && self.brand_detected.is_none()
    }
}

fn field(record: &csv::StringRecord, idx: Option<usize>) -> Option<String> {
    idx.and_then(|i| record.get(i))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Parses the whole file up front. Any malformed record or unreadable id is a
/// hard stop, so a broken file never half-applies.
fn parse_csv_rows<R: std::io::Read>(rdr: &mut csv::Reader<R>) -> Result<Vec<CsvRow>> {
    let headers = rdr.headers()?.clone();
    let col = |name: &str| headers.iter().position(|h| h == name);
    let idx_id = col("id");
    let idx_original = col("original_name")
        .ok_or_else(|| anyhow!("csv is missing the original_name column"))?;
    let idx_unit = col("unit");
    let idx_value = col("value");
    let idx_brand = col("brand_detected");
    let idx_reason = col("intervention_reason");
    let idx_motive = col("motive");

    let mut rows = Vec::new();
    for (line, record) in rdr.records().enumerate() {
        let record = record.with_context(|| format!("malformed csv record at data row {}", line + 1))?;
        let id = match field(&record, idx_id) {
            Some(raw) => Some(raw.parse::<i64>().with_context(|| {
                format!("unreadable id {:?} at data row {}", raw, line + 1)
            })?),
            None => None,
        };
        rows.push(CsvRow {
            id,
            original_name: field(&record, Some(idx_original)).unwrap_or_default(),
            unit: field(&record, idx_unit),
            value: field(&record, idx_value),
            brand_detected: field(&record, idx_brand),
            reason: field(&record, idx_reason),
            motive: field(&record, idx_motive),
        });
    }
    Ok(rows)
}

/// Reads an edited queue file back. Rows with an id overwrite the matching
/// pending row's editable fields; rows without one are appended as new
/// pending entries. Nothing is written unless the whole file parses.
pub async fn import_csv(db: &Db, path: &Path) -> Result<ImportStats> {
    let mut rdr = csv::Reader::from_path(path)
        .with_context(|| format!("open {}", path.display()))?;
    let rows = parse_csv_rows(&mut rdr)
        .with_context(|| format!("refusing to import {}", path.display()))?;

    let mut stats = ImportStats::default();
    let mut appends: Vec<CsvRow> = Vec::new();
    for row in rows {
        if row.id.is_none() && row.is_structurally_empty() {
            warn!("skipping structurally empty csv row");
            stats.skipped += 1;
            continue;
        }
        match row.id {
            Some(id) => {
                let res = sqlx::query(
                    "UPDATE pending_interventions \
                     SET unit = $2, value = $3, brand_detected = $4, motive = $5 \
                     WHERE id = $1 AND status = 'pending'",
                )
                .persistent(false)
                .bind(id)
                .bind(&row.unit)
                .bind(&row.value)
                .bind(&row.brand_detected)
                .bind(&row.motive)
                .execute(&db.pool)
                .await?;
                if res.rows_affected() == 0 {
                    warn!(intervention_id = id, "csv row targets no pending intervention; skipped");
                    stats.skipped += 1;
                } else {
                    stats.updated += 1;
                }
            }
            None => appends.push(row),
        }
    }

    if !appends.is_empty() {
        let mut qb: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO pending_interventions \
             (original_name, unit, value, brand_detected, reason, motive) ",
        );
        qb.push_values(appends.iter(), |mut b, r| {
            b.push_bind(&r.original_name)
                .push_bind(r.unit.as_ref())
                .push_bind(r.value.as_ref())
                .push_bind(r.brand_detected.as_ref())
                .push_bind(r.reason.clone().unwrap_or_else(|| "manual_entry".to_string()))
                .push_bind(r.motive.as_ref());
        });
        qb.build().persistent(false).execute(&db.pool).await?;
        stats.appended = appends.len();
    }

    info!(
        updated = stats.updated,
        appended = stats.appended,
        skipped = stats.skipped,
        "imported intervention csv"
    );
    Ok(stats)
}

/// Where a closing brand name came from. Human entries may name a brand the
/// catalog has never seen; auto entries always reference an existing row.
#[derive(Debug, Clone, PartialEq)]
pub enum BrandResolution {
    Human(String),
    Existing { brand_id: i64 },
}

/// Per-row outcome of one reconciliation attempt. Human-supplied fields win;
/// auto-detection against the original name fills the rest.
#[derive(Debug, Default)]
pub struct RowResolution {
    pub unit: Option<String>,
    pub value: Option<f64>,
    pub brand: Option<BrandResolution>,
    /// A human wrote something unreadable (bad unit token, bad number). The
    /// row must stay pending rather than close on a silent fallback.
    pub malformed: bool,
}

impl RowResolution {
    pub fn is_complete(&self) -> bool {
        !self.malformed && self.unit.is_some() && self.value.is_some() && self.brand.is_some()
    }
}

fn blank(v: &Option<String>) -> bool {
    v.as_deref().map(str::trim).map_or(true, str::is_empty)
}

pub fn is_structurally_empty(row: &PendingIntervention) -> bool {
    row.original_name.trim().is_empty()
        && blank(&row.unit)
        && blank(&row.value)
        && blank(&row.brand_detected)
}

pub async fn resolve_row(
    row: &PendingIntervention,
    units: &UnitTable,
    catalog: &[BrandEntry],
    embedder: &dyn Embedder,
) -> RowResolution {
    let mut out = RowResolution::default();
    let auto = units.detect(&row.original_name);

    match row.unit.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => match UnitKind::from_token(raw) {
            Some(kind) => out.unit = Some(kind.canonical().to_string()),
            None => {
                warn!(intervention_id = row.id, unit = raw, "unreadable unit token; row stays pending");
                out.malformed = true;
            }
        },
        None => out.unit = auto.as_ref().map(|m| m.unit.canonical().to_string()),
    }

    match row.value.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => match parse_decimal(raw) {
            Some(v) => out.value = Some(v),
            None => {
                warn!(intervention_id = row.id, value = raw, "unreadable value; row stays pending");
                out.malformed = true;
            }
        },
        None => out.value = auto.as_ref().map(|m| m.value),
    }

    match row.brand_detected.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(name) => out.brand = Some(BrandResolution::Human(name.to_string())),
        None => match resolve_brand(&row.original_name, catalog, embedder).await {
            Ok(Some(hit)) => {
                out.brand = Some(BrandResolution::Existing {
                    brand_id: hit.brand_id,
                })
            }
            Ok(None) => {}
            Err(err) => {
                // Embedding outage: the row simply stays pending this pass.
                warn!(intervention_id = row.id, error = %err, "brand resolution degraded");
            }
        },
    }

    out
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileStats {
    pub scanned: usize,
    pub resolved: usize,
    pub discarded: usize,
    pub still_pending: usize,
}

/// Drains the queue: discards structurally empty rows, closes rows whose
/// brand, unit and value are all determinable, leaves everything else
/// pending. Human-named brands are created (or alias-merged) in the catalog
/// before the row closes.
pub async fn reconcile_pending(db: &Db, embedder: &dyn Embedder) -> Result<ReconcileStats> {
    let units = UnitTable::with_defaults();
    let rows = load_pending(db).await?;
    let mut catalog = load_brand_catalog(db).await?;
    let mut catalog_dirty = false;

    let mut stats = ReconcileStats {
        scanned: rows.len(),
        ..Default::default()
    };
    for row in &rows {
        if catalog_dirty {
            catalog = load_brand_catalog(db).await?;
            catalog_dirty = false;
        }
        if is_structurally_empty(row) {
            warn!(intervention_id = row.id, "discarding structurally empty intervention");
            mark_discarded(db, row.id).await?;
            stats.discarded += 1;
            continue;
        }

        let resolution = resolve_row(row, &units, &catalog, embedder).await;
        let RowResolution {
            unit: Some(unit),
            value: Some(value),
            brand: Some(brand),
            malformed: false,
        } = resolution
        else {
            stats.still_pending += 1;
            continue;
        };

        if let BrandResolution::Human(name) = &brand {
            let already_known = catalog
                .iter()
                .any(|b| normalize_lookup(&b.name) == normalize_lookup(name));
            let embedding = if already_known {
                None
            } else {
                match embedder.embed_one(&normalize_lookup(name)).await {
                    Ok(v) => Some(v),
                    Err(err) => {
                        warn!(brand = %name, error = %err, "no embedding for new brand; storing without vector");
                        None
                    }
                }
            };
            let brand_id = ensure_brand(db, name, embedding.as_deref()).await?;
            info!(intervention_id = row.id, brand_id, brand = %name, "human brand accepted");
            catalog_dirty = true;
        }

        mark_resolved(db, row.id).await?;
        stats.resolved += 1;
        info!(intervention_id = row.id, unit = %unit, value, "intervention resolved");
    }

    info!(
        scanned = stats.scanned,
        resolved = stats.resolved,
        discarded = stats.discarded,
        still_pending = stats.still_pending,
        "reconcile pass finished"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::FakeEmbedder;

    fn row(
        original_name: &str,
        unit: Option<&str>,
        value: Option<&str>,
        brand: Option<&str>,
    ) -> PendingIntervention {
        PendingIntervention {
            id: 1,
            queued_at: Utc::now(),
            original_name: original_name.to_string(),
            cleaned_name: None,
            unit: unit.map(str::to_string),
            value: value.map(str::to_string),
            brand_detected: brand.map(str::to_string),
            reason: "unit_unresolved".to_string(),
            motive: None,
        }
    }

    fn brand_entry(id: i64, name: &str) -> BrandEntry {
        BrandEntry {
            id,
            name: name.to_string(),
            synonyms: vec![],
            embedding: None,
        }
    }

    #[test]
    fn empty_rows_are_structurally_empty_even_with_whitespace() {
        assert!(is_structurally_empty(&row("  ", Some(" "), None, None)));
        assert!(!is_structurally_empty(&row("", None, None, Some("Coto"))));
        assert!(!is_structurally_empty(&row("algo", None, None, None)));
    }

    #[tokio::test]
    async fn brand_alone_does_not_close_a_row() {
        let units = UnitTable::with_defaults();
        let r = row("promo sin cantidad", None, None, Some("Coto"));
        let res = resolve_row(&r, &units, &[], &FakeEmbedder::new()).await;
        assert_eq!(res.brand, Some(BrandResolution::Human("Coto".to_string())));
        assert!(res.unit.is_none());
        assert!(!res.is_complete());
    }

    #[tokio::test]
    async fn all_three_human_fields_close_a_row() {
        let units = UnitTable::with_defaults();
        let r = row("promo sin cantidad", Some("g"), Some("500"), Some("Coto"));
        let res = resolve_row(&r, &units, &[], &FakeEmbedder::new()).await;
        assert!(res.is_complete());
        assert_eq!(res.unit.as_deref(), Some("g"));
        assert_eq!(res.value, Some(500.0));
    }

    #[tokio::test]
    async fn auto_detection_closes_once_the_catalog_knows_the_brand() {
        let units = UnitTable::with_defaults();
        let r = row("Yerba Taragui 500 g", None, None, None);
        let catalog = vec![brand_entry(4, "Taragui")];
        let res = resolve_row(&r, &units, &catalog, &FakeEmbedder::new()).await;
        assert!(res.is_complete());
        assert_eq!(res.brand, Some(BrandResolution::Existing { brand_id: 4 }));
        assert_eq!(res.unit.as_deref(), Some("g"));
        assert_eq!(res.value, Some(500.0));
    }

    #[tokio::test]
    async fn unreadable_human_value_keeps_the_row_pending() {
        let units = UnitTable::with_defaults();
        let r = row("Yerba Taragui 500 g", None, Some("quinientos"), None);
        let catalog = vec![brand_entry(4, "Taragui")];
        let res = resolve_row(&r, &units, &catalog, &FakeEmbedder::new()).await;
        assert!(res.malformed);
        assert!(!res.is_complete());
    }

    #[tokio::test]
    async fn human_value_accepts_comma_decimals() {
        let units = UnitTable::with_defaults();
        let r = row("gaseosa", Some("l"), Some("2,25"), Some("Manaos"));
        let res = resolve_row(&r, &units, &[], &FakeEmbedder::new()).await;
        assert!(res.is_complete());
        assert_eq!(res.unit.as_deref(), Some("litro"));
        assert_eq!(res.value, Some(2.25));
    }

    #[tokio::test]
    async fn embedder_outage_leaves_brand_unresolved_without_failing() {
        let units = UnitTable::with_defaults();
        let r = row("galletitas surtidas 300 g", None, None, None);
        // A brand with a stored vector forces the semantic fallback, and the
        // fake embedder errors on any text it was not primed with.
        let mut with_vector = brand_entry(9, "Bagley");
        with_vector.embedding = Some(vec![1.0, 0.0]);
        let res = resolve_row(&r, &units, &[with_vector], &FakeEmbedder::new()).await;
        assert!(res.brand.is_none());
        assert!(res.unit.is_some());
        assert!(!res.is_complete());
    }

    #[test]
    fn csv_parse_is_order_tolerant_and_strict_on_ids() {
        let data = "original_name,brand_detected,id,unit,value,intervention_reason,motive,timestamp,cleaned_name\n\
                    Yerba 500 g,Taragui,12,,,unit_unresolved,,2024-01-01T00:00:00Z,\n";
        let mut rdr = csv::Reader::from_reader(data.as_bytes());
        let rows = parse_csv_rows(&mut rdr).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, Some(12));
        assert_eq!(rows[0].brand_detected.as_deref(), Some("Taragui"));

        let bad = "id,original_name\nnot-a-number,algo\n";
        let mut rdr = csv::Reader::from_reader(bad.as_bytes());
        assert!(parse_csv_rows(&mut rdr).is_err());
    }

    #[test]
    fn csv_rows_without_id_or_content_are_flagged_empty() {
        let data = "id,original_name,unit,value,brand_detected\n,,,,\n,leche entera,,,\n";
        let mut rdr = csv::Reader::from_reader(data.as_bytes());
        let rows = parse_csv_rows(&mut rdr).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].is_structurally_empty());
        assert!(!rows[1].is_structurally_empty());
    }
}
