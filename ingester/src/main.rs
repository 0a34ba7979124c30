mod app;
mod auth;
mod budget;
mod engine;
mod fetch;
mod model;
mod sink;
mod transform;

use clap::{Parser, Subcommand};
use listings_core::{telemetry, Config};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::process;
use tracing::{error, info};

#[derive(Parser)]
#[clap(name = "ingester")]
#[clap(about = "Adoption listings pagination and ingestion engine", version)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,

    /// Sweep every page of the listing collection and land it
    Export {
        /// Override the per-run request budget
        #[clap(long, env = "EXPORT_BUDGET")]
        budget: Option<u64>,

        /// Override the number of concurrent page workers
        #[clap(long, env = "EXPORT_CONCURRENCY")]
        concurrency: Option<usize>,
    },

    /// Walk time windows backwards from a starting point
    Backfill {
        /// Upper bound of the first window (RFC3339, defaults to NOW)
        #[clap(long, env = "BACKFILL_BEFORE")]
        before: Option<chrono::DateTime<chrono::Utc>>,

        /// Lower bound of the first window (RFC3339)
        #[clap(long, env = "BACKFILL_AFTER", conflicts_with = "days")]
        after: Option<chrono::DateTime<chrono::Utc>>,

        /// Window length in days
        #[clap(long, env = "BACKFILL_DAYS")]
        days: Option<i64>,

        /// Keep only listings with this contact email
        #[clap(long, env = "BACKFILL_CONTACT_EMAIL")]
        contact_email: Option<String>,

        /// Number of consecutive windows to sweep
        #[clap(long, env = "BACKFILL_MAX_WINDOWS")]
        max_windows: Option<u32>,
    },

    /// Print the total number of listings the API reports
    Count,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(error = %e, "Fatal error");
        process::exit(1);
    }
}

async fn connect(config: &Config) -> anyhow::Result<PgPool> {
    let warehouse = &config.warehouse;
    let pool = PgPoolOptions::new()
        .max_connections(warehouse.max_connections)
        .min_connections(warehouse.min_connections)
        .acquire_timeout(std::time::Duration::from_secs(warehouse.connect_timeout_secs))
        .idle_timeout(std::time::Duration::from_secs(warehouse.idle_timeout_secs))
        .connect(&warehouse.url)
        .await?;
    Ok(pool)
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load()
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    telemetry::init(&config.telemetry)?;

    if !matches!(cli.command, Commands::Migrate) {
        config.require_credentials()?;
    }

    match cli.command {
        Commands::Migrate => {
            let pool = connect(&config).await?;
            info!("Running database migrations");
            sqlx::migrate!("../migrations").run(&pool).await?;
            info!("Migrations completed successfully");
        }

        Commands::Export {
            budget,
            concurrency,
        } => {
            if let Some(budget) = budget {
                config.fetch.request_budget = budget;
            }
            if let Some(concurrency) = concurrency {
                config.fetch.concurrency = concurrency.max(1);
            }

            info!(
                budget = config.fetch.request_budget,
                concurrency = config.fetch.concurrency,
                "Starting export"
            );

            let pool = connect(&config).await?;
            let sink = app::App::landing_sink(&config, pool).await?;
            let app = app::App::new(config)?;
            let receipt = app.run_export(sink.as_ref()).await?;

            info!(
                destination = %receipt.destination,
                rows = receipt.rows_loaded,
                uri = ?receipt.blob_uri,
                "Export completed"
            );
        }

        Commands::Backfill {
            before,
            after,
            days,
            contact_email,
            max_windows,
        } => {
            let plan = app::BackfillPlan {
                before: before.unwrap_or_else(chrono::Utc::now),
                after,
                days: days.unwrap_or(config.backfill.days_to_fetch),
                max_windows: max_windows.unwrap_or(config.backfill.max_windows),
                contact_email: contact_email.or_else(|| config.backfill.contact_email.clone()),
            };

            if plan.days <= 0 {
                anyhow::bail!("--days must be positive, got {}", plan.days);
            }

            info!(
                before = %plan.before,
                after = ?plan.after,
                days = plan.days,
                max_windows = plan.max_windows,
                "Starting backfill"
            );

            let pool = connect(&config).await?;
            let sink = app::App::landing_sink(&config, pool).await?;
            let app = app::App::new(config)?;
            let receipts = app.run_backfill(plan, sink.as_ref()).await?;

            let rows: u64 = receipts.iter().map(|r| r.rows_loaded).sum();
            info!(windows = receipts.len(), rows, "Backfill completed");
        }

        Commands::Count => {
            let app = app::App::new(config)?;
            let total = app.run_count().await?;
            println!("{total}");
        }
    }

    telemetry::shutdown();
    Ok(())
}
