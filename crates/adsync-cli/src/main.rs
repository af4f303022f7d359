use adsync_storage::PgStore;
use adsync_sync::SyncConfig;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "adsync")]
#[command(about = "CRM and warehouse ingestion jobs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync products, Closed Won deals and their monthly budgets from the CRM.
    Crm(CrmArgs),
    /// Sync one day of delivered flights from the warehouse.
    Warehouse(WarehouseArgs),
    /// Apply database migrations.
    Migrate,
}

#[derive(Debug, Args)]
struct CrmArgs {
    #[arg(long, env = "CRM_BASE_URL")]
    base_url: Option<String>,
    #[arg(long, env = "CRM_EMAIL")]
    email: Option<String>,
    #[arg(long, env = "CRM_PASSWORD", hide_env_values = true)]
    password: Option<String>,
    #[arg(long, env = "ADSYNC_MAX_DEAL_PAGES")]
    max_deal_pages: Option<u32>,
    /// Also copy media-plan rate terms onto synced budget lines.
    #[arg(long)]
    media_plans: bool,
    /// Business date stamped on the audit row, YYYY-MM-DD; defaults to today (UTC).
    #[arg(long)]
    date: Option<String>,
}

#[derive(Debug, Args)]
struct WarehouseArgs {
    /// Business date as YYYY-MM-DD; defaults to today (UTC).
    #[arg(long)]
    date: Option<String>,
    #[arg(long, env = "WAREHOUSE_TABLE")]
    table: Option<String>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command {
        Commands::Crm(args) => {
            if let Some(base_url) = args.base_url {
                config.crm_base_url = Some(base_url);
            }
            if let Some(email) = args.email {
                config.crm_email = Some(email);
            }
            if let Some(password) = args.password {
                config.crm_password = Some(password);
            }
            if let Some(max_deal_pages) = args.max_deal_pages {
                config.max_deal_pages = max_deal_pages;
            }
            if args.media_plans {
                config.sync_media_plans = true;
            }

            let summary = adsync_sync::run_crm_sync(&config, args.date.as_deref()).await?;
            println!(
                "crm sync complete: run_id={} products={} deals={} skipped={} line_items={} pages={} status_id={}",
                summary.run_id,
                summary.products.total(),
                summary.deals.deals.total(),
                summary.deals.skipped,
                summary.deals.line_items.total(),
                summary.deals.pages,
                summary.status_id
            );
            if let Some(plans) = &summary.media_plans {
                println!(
                    "media plans: applied={} unmatched={} skipped_plans={} pages={}",
                    plans.applied, plans.unmatched, plans.skipped_plans, plans.pages
                );
            }
        }
        Commands::Warehouse(args) => {
            if let Some(table) = args.table {
                config.warehouse_table = table;
            }

            let summary = adsync_sync::run_warehouse_sync(&config, args.date.as_deref()).await?;
            println!(
                "warehouse sync complete: run_id={} date={} rows={} created={} updated={} status_id={}",
                summary.run_id,
                summary.query_date,
                summary.rows,
                summary.flights.created,
                summary.flights.updated,
                summary.status_id
            );
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("applying migrations")?;
            info!("migrations applied");
            println!("migrations applied");
        }
    }

    Ok(())
}
