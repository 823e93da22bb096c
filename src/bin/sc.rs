use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use super_compare::cli::counts::{run as run_counts, CountsConfig};
use super_compare::database_ops::baskets::{self, ComparisonResult, CoveragePolicy, PricePolicy};
use super_compare::database_ops::db::Db;
use super_compare::database_ops::interventions;
use super_compare::database_ops::prices::best_price_for_product;
use super_compare::embedding;
use super_compare::util::env;
use super_compare::{run_backfill, run_ingest};

#[derive(Parser, Debug)]
#[command(name = "sc", version, about = "SuperCompare admin CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Apply pending schema migrations from ./migrations
    Migrate {
        /// Optional override for the database URL
        #[arg(long)]
        db_url: Option<String>,
    },
    /// Ingest a crawler batch file (JSON array of listing records)
    Ingest {
        /// Optional override for the database URL
        #[arg(long)]
        db_url: Option<String>,
        /// Path to the batch file
        #[arg(long)]
        file: PathBuf,
    },
    /// Replay pending review-queue entries against the current catalog
    Reconcile {
        /// Optional override for the database URL
        #[arg(long)]
        db_url: Option<String>,
    },
    /// Export the pending review queue to CSV for offline editing
    ExportInterventions {
        /// Optional override for the database URL
        #[arg(long)]
        db_url: Option<String>,
        /// Output CSV path
        #[arg(long, default_value = "interventions.csv")]
        file: PathBuf,
    },
    /// Import an edited review CSV back into the queue
    ImportInterventions {
        /// Optional override for the database URL
        #[arg(long)]
        db_url: Option<String>,
        /// Input CSV path
        #[arg(long, default_value = "interventions.csv")]
        file: PathBuf,
    },
    /// Delete review entries already marked resolved
    PurgeResolved {
        /// Optional override for the database URL
        #[arg(long)]
        db_url: Option<String>,
    },
    /// Compute embeddings for products created while the provider was down
    BackfillEmbeddings {
        /// Optional override for the database URL
        #[arg(long)]
        db_url: Option<String>,
        /// Rows fetched per round
        #[arg(long, default_value_t = 200)]
        batch_size: i64,
        /// Concurrent embedding requests
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
    },
    /// Create a shopping list and print its id and owner token
    ListCreate {
        /// Optional override for the database URL
        #[arg(long)]
        db_url: Option<String>,
        /// Display name for the list
        #[arg(long)]
        name: String,
    },
    /// Add a product to a shopping list (re-adding updates the quantity)
    ListAdd {
        /// Optional override for the database URL
        #[arg(long)]
        db_url: Option<String>,
        /// Shopping list id
        #[arg(long)]
        list: i64,
        /// Product id
        #[arg(long)]
        product: i64,
        /// How many units of the product
        #[arg(long, default_value_t = 1.0)]
        quantity: f64,
    },
    /// Compare a shopping list across retailers
    Compare {
        /// Optional override for the database URL
        #[arg(long)]
        db_url: Option<String>,
        /// Shopping list id
        #[arg(long)]
        list: i64,
        /// Price each item by its latest observation instead of the lowest ever
        #[arg(long, default_value_t = false)]
        latest: bool,
        /// Only retailers carrying the whole list may win
        #[arg(long, default_value_t = false)]
        full_coverage: bool,
        /// Emit machine-readable JSON instead of text
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print the best known price for one product
    BestPrice {
        /// Optional override for the database URL
        #[arg(long)]
        db_url: Option<String>,
        /// Product id
        #[arg(long)]
        product: i64,
    },
    /// Print row counts and coverage for key database tables
    Counts {
        /// Optional override for the database URL
        #[arg(long)]
        db_url: Option<String>,
        /// Force printing of recent price observations (otherwise follows env)
        #[arg(long, default_value_t = false)]
        recent_prices: bool,
        /// Override RECENT_PRICES_LIMIT (defaults to env/20)
        #[arg(long)]
        recent_prices_limit: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env::init_env();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .try_init();

    if std::env::var_os("SC_LIST_SUBCOMMANDS").is_some() {
        let names: Vec<String> = Cli::command()
            .get_subcommands()
            .map(|cmd| cmd.get_name().to_string())
            .collect();
        eprintln!("available subcommands: {:?}", names);
        return Ok(());
    }

    let cli = Cli::parse();

    match cli.command {
        Commands::Migrate { db_url } => {
            env::preflight_check("migrate", &[], &["SUPER_DB_URL", "DATABASE_URL", "MIGRATIONS_DIR"])
                .ok();
            let database_url = resolve_database_url(db_url)?;
            info!(url = %redact_postgres_url(&database_url), "migrate: connecting");
            let db = connect_with_retries(&database_url, 1).await?;
            Db::run_migrations(&db.pool).await?;
            info!("migrate: finished");
        }
        Commands::Ingest { db_url, file } => {
            env::preflight_check(
                "ingest",
                &[],
                &[
                    "SUPER_DB_URL",
                    "DATABASE_URL",
                    "EMBEDDINGS_API_BASE",
                    "EMBEDDINGS_API_KEY",
                    "EMBEDDINGS_MODEL",
                    "DEFAULT_CURRENCY",
                ],
            )
            .ok();
            let database_url = resolve_database_url(db_url)?;
            info!(url = %redact_postgres_url(&database_url), file = %file.display(), "ingest: connecting");
            let db = connect_with_retries(&database_url, 5).await?;
            let embedder = embedding::from_env();
            let stats = run_ingest(&db, embedder.as_ref(), &file).await?;
            info!(
                processed = stats.processed,
                rejected = stats.rejected,
                interventions = stats.interventions,
                "ingest: finished"
            );
        }
        Commands::Reconcile { db_url } => {
            let database_url = resolve_database_url(db_url)?;
            info!(url = %redact_postgres_url(&database_url), "reconcile: connecting");
            let db = connect_with_retries(&database_url, 5).await?;
            let embedder = embedding::from_env();
            let stats = interventions::reconcile_pending(&db, embedder.as_ref()).await?;
            info!(
                scanned = stats.scanned,
                resolved = stats.resolved,
                discarded = stats.discarded,
                still_pending = stats.still_pending,
                "reconcile: finished"
            );
        }
        Commands::ExportInterventions { db_url, file } => {
            let database_url = resolve_database_url(db_url)?;
            let db = connect_with_retries(&database_url, 2).await?;
            let rows = interventions::export_csv(&db, &file).await?;
            info!(rows, file = %file.display(), "export-interventions: finished");
        }
        Commands::ImportInterventions { db_url, file } => {
            let database_url = resolve_database_url(db_url)?;
            let db = connect_with_retries(&database_url, 2).await?;
            let stats = interventions::import_csv(&db, &file).await?;
            info!(
                updated = stats.updated,
                appended = stats.appended,
                skipped = stats.skipped,
                file = %file.display(),
                "import-interventions: finished"
            );
        }
        Commands::PurgeResolved { db_url } => {
            let database_url = resolve_database_url(db_url)?;
            let db = connect_with_retries(&database_url, 2).await?;
            let purged = interventions::purge_resolved(&db).await?;
            info!(purged, "purge-resolved: finished");
        }
        Commands::BackfillEmbeddings {
            db_url,
            batch_size,
            concurrency,
        } => {
            let database_url = resolve_database_url(db_url)?;
            info!(url = %redact_postgres_url(&database_url), "backfill-embeddings: connecting");
            let db = connect_with_retries(&database_url, 5).await?;
            let embedder = embedding::from_env();
            let stats = run_backfill(&db, embedder.as_ref(), batch_size, concurrency).await?;
            info!(
                scanned = stats.scanned,
                filled = stats.filled,
                failed = stats.failed,
                "backfill-embeddings: finished"
            );
        }
        Commands::ListCreate { db_url, name } => {
            let database_url = resolve_database_url(db_url)?;
            let db = connect_with_retries(&database_url, 2).await?;
            let (id, owner_token) = baskets::create_list(&db, &name).await?;
            println!("created list #{id} (owner token {owner_token})");
        }
        Commands::ListAdd {
            db_url,
            list,
            product,
            quantity,
        } => {
            let database_url = resolve_database_url(db_url)?;
            let db = connect_with_retries(&database_url, 2).await?;
            baskets::add_list_item(&db, list, product, quantity).await?;
            println!("list #{list}: product #{product} x{quantity}");
        }
        Commands::Compare {
            db_url,
            list,
            latest,
            full_coverage,
            json,
        } => {
            let database_url = resolve_database_url(db_url)?;
            let db = connect_with_retries(&database_url, 5).await?;
            let price_policy = if latest {
                PricePolicy::MostRecent
            } else {
                PricePolicy::LowestEver
            };
            let coverage = if full_coverage {
                CoveragePolicy::Full
            } else {
                CoveragePolicy::Partial
            };
            let result = baskets::compare_list(&db, list, price_policy, coverage).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_comparison(&result);
            }
        }
        Commands::BestPrice { db_url, product } => {
            let database_url = resolve_database_url(db_url)?;
            let db = connect_with_retries(&database_url, 2).await?;
            match best_price_for_product(&db, product).await? {
                Some(best) => println!(
                    "product #{product}: {:.2} at {}",
                    best.price, best.retailer_name
                ),
                None => println!("product #{product}: no price recorded"),
            }
        }
        Commands::Counts {
            db_url,
            recent_prices,
            recent_prices_limit,
        } => {
            let cfg = CountsConfig {
                database_url: db_url,
                show_recent_prices: if recent_prices { Some(true) } else { None },
                recent_prices_limit,
            };
            run_counts(cfg).await?;
        }
    }

    Ok(())
}

fn print_comparison(result: &ComparisonResult) {
    if result.baskets.is_empty() {
        println!("no retailer carries any item on this list");
        return;
    }
    for basket in &result.baskets {
        let missing = if basket.missing_items > 0 {
            format!(" ({} item(s) missing)", basket.missing_items)
        } else {
            String::new()
        };
        println!("{}: {:.2}{missing}", basket.retailer_name, basket.subtotal);
        for item in &basket.items {
            println!("  {} -> {:.2}", item.product_name, item.price);
        }
    }
    match &result.winner {
        Some(winner) => println!("cheapest: {winner}"),
        None => println!("no winner under the requested coverage"),
    }
}

/// Transient connect failures (database container still coming up, pooler
/// restart) are retried with jittered exponential backoff before giving up.
async fn connect_with_retries(database_url: &str, max_connections: u32) -> Result<Db> {
    let attempts: u32 = env::env_parse("DB_CONNECT_ATTEMPTS", 3);
    let mut backoff = 1u64;
    let mut last_err = None;
    for attempt in 1..=attempts.max(1) {
        match Db::connect(database_url, max_connections).await {
            Ok(db) => return Ok(db),
            Err(err) => {
                warn!(attempt, error = %err, "database connect failed");
                last_err = Some(err);
                if attempt < attempts {
                    let jitter = rand::thread_rng().gen_range(0..=backoff);
                    tokio::time::sleep(Duration::from_secs(backoff + jitter)).await;
                    backoff = backoff.saturating_mul(2).min(30);
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("database connect failed")))
}

fn resolve_database_url(db_url: Option<String>) -> Result<String> {
    if let Some(url) = db_url {
        let trimmed = url.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }

    let env_url = env::db_url().with_context(|| "resolve_database_url: missing database URL")?;
    let trimmed = env_url.trim();
    if trimmed.is_empty() {
        bail!("database URL is empty; set SUPER_DB_URL / DATABASE_URL or pass --db-url");
    }
    Ok(trimmed.to_string())
}

fn redact_postgres_url(raw: &str) -> String {
    // Best-effort redaction for DSNs so credentials never reach the logs.
    // Host, port, database and query params stay visible for debugging.
    match url::Url::parse(raw.trim()) {
        Ok(mut u) => {
            let scheme = u.scheme().to_ascii_lowercase();
            if scheme == "postgres" || scheme == "postgresql" {
                let _ = u.set_username("***");
                let _ = u.set_password(Some("***"));
            }
            u.to_string()
        }
        Err(_) => {
            if raw.starts_with("postgres://") || raw.starts_with("postgresql://") {
                if let Some(proto) = raw.find("//") {
                    if let Some(at) = raw[proto + 2..].find('@') {
                        let host_part = &raw[proto + 2 + at + 1..];
                        return format!("{}***:{}", &raw[..proto + 2], host_part);
                    }
                }
            }
            raw.to_string()
        }
    }
}
