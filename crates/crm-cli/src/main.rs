use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crm_import::{ImportConfig, ImportPipeline, ImportSummary, IdentityResolver};
use crm_ingest::{DateOrder, SourceFormat};
use crm_storage::{MemoryGateway, PersistenceGateway, PgGateway};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "crm-cli")]
#[command(about = "Import broker chat exports into the CRM")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, clap::Args)]
struct SourceArgs {
    /// Chat transcript (.txt) or CSV export.
    path: PathBuf,
    /// Force a format instead of guessing from the extension (whatsapp, csv).
    #[arg(long)]
    format: Option<String>,
    /// Header date order: mdy or dmy.
    #[arg(long, value_parser = parse_date_order)]
    date_order: Option<DateOrder>,
    /// YAML file overriding keyword tables.
    #[arg(long)]
    rules: Option<PathBuf>,
    /// Country code for local mobile numbers.
    #[arg(long)]
    country_code: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import one export file.
    Import {
        #[command(flatten)]
        source: SourceArgs,
        /// Use an in-memory store; nothing is archived or written to the database.
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        no_reports: bool,
    },
    /// Print the extraction result of every message as JSON lines.
    Extract {
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Apply database migrations.
    Migrate,
}

fn parse_date_order(value: &str) -> Result<DateOrder, String> {
    DateOrder::parse(value).ok_or_else(|| format!("expected mdy or dmy, got {value:?}"))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn apply_overrides(config: &mut ImportConfig, source: &SourceArgs) {
    if let Some(order) = source.date_order {
        config.date_order = order;
    }
    if let Some(rules) = &source.rules {
        config.rules_path = Some(rules.clone());
    }
    if let Some(code) = &source.country_code {
        config.country_code = code.trim_start_matches('+').to_string();
    }
}

async fn connect(config: &ImportConfig) -> Result<PgGateway> {
    let Some(url) = config.database_url.as_deref() else {
        bail!("DATABASE_URL is not set (use --dry-run to import without a database)");
    };
    PgGateway::connect(url).await
}

fn print_summary(summary: &ImportSummary) {
    println!(
        "import complete: run_id={} parsed={} skipped={} brokers={} (created={} matched={}) properties={} messages={} errors={}",
        summary.run_id,
        summary.messages_parsed,
        summary.skipped_total(),
        summary.brokers_resolved,
        summary.brokers_created,
        summary.brokers_matched,
        summary.properties_created,
        summary.messages_persisted,
        summary.errors.len(),
    );
    for error in &summary.errors {
        println!("  {}: {}", error.record, error.reason);
    }
    if let Some(dir) = &summary.reports_dir {
        println!("reports: {dir}");
    }
}

async fn extract(config: ImportConfig, source: &SourceArgs) -> Result<()> {
    let pipeline = ImportPipeline::new(config.clone(), Arc::new(MemoryGateway::new()))?;
    let format = pipeline.resolve_format(&source.path, source.format.as_deref())?;
    let text = tokio::fs::read_to_string(&source.path)
        .await
        .with_context(|| format!("reading {}", source.path.display()))?;
    let resolver = IdentityResolver::new(config.country_code);

    for raw in format.messages(&text) {
        let sender = resolver.canonicalize(&raw.sender_raw, raw.phone_hint.as_deref());
        let line = serde_json::json!({
            "line": raw.source_line,
            "timestamp": raw.timestamp,
            "sender": raw.sender_raw,
            "phone": sender.phone,
            "extraction": pipeline.extractor().extract(&raw.text),
        });
        println!("{line}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);
    let mut config = ImportConfig::from_env();

    match cli.command {
        Commands::Import {
            source,
            dry_run,
            no_reports,
        } => {
            apply_overrides(&mut config, &source);
            config.dry_run = dry_run;
            if no_reports {
                config.write_reports = false;
            }
            let gateway: Arc<dyn PersistenceGateway> = if dry_run {
                Arc::new(MemoryGateway::new())
            } else {
                Arc::new(connect(&config).await?)
            };
            let pipeline = ImportPipeline::new(config, gateway)?;
            let summary = pipeline.run(&source.path, source.format.as_deref()).await?;
            print_summary(&summary);
        }
        Commands::Extract { source } => {
            apply_overrides(&mut config, &source);
            extract(config, &source).await?;
        }
        Commands::Migrate => {
            let gateway = connect(&config).await?;
            gateway.migrate().await?;
            info!("migrations applied");
        }
    }

    Ok(())
}
