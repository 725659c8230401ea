use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mfds_adapters::{fetch_detail, scan_list_page, DetailExtractor, PortalClient};
use mfds_sync::{
    connect_store, pipeline_from_config, portal_from_config, RunAborted, SyncConfig,
    SyncRunSummary,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mfds-cli")]
#[command(about = "MFDS new-drug registration tracker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scan the list page and reconcile every candidate into Postgres.
    Sync {
        /// Process at most this many candidates.
        #[arg(long)]
        limit: Option<usize>,
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Apply the embedded schema migrations.
    Migrate,
    /// Print list-page candidates and the resolved column map.
    Scan,
    /// Fetch and extract one item, printing the record and its fingerprint.
    Inspect { item_seq: String },
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("mfds=info"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing()?;
    let cli = Cli::parse();
    let mut config = SyncConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Sync {
        limit: None,
        json: false,
    }) {
        Commands::Sync { limit, json } => {
            if limit.is_some() {
                config.max_items = limit;
            }
            let pipeline = pipeline_from_config(&config).await?;
            match pipeline.run_once().await {
                Ok(summary) => {
                    print_summary(&summary, json)?;
                    Ok(exit_code(&summary))
                }
                Err(err) => {
                    if let Some(aborted) = err.downcast_ref::<RunAborted>() {
                        print_summary(&aborted.summary, json)?;
                    }
                    Err(err)
                }
            }
        }
        Commands::Migrate => {
            connect_store(&config).await?;
            println!("migrations applied");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Scan => {
            let (portal, profile) = portal_from_config(&config)?;
            let html = portal
                .fetch_list_page()
                .await
                .context("fetching list page")?;
            let scan = scan_list_page(&html, &profile.list);
            println!("{}", serde_json::to_string_pretty(&scan)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Inspect { item_seq } => {
            let (portal, profile) = portal_from_config(&config)?;
            let extractor = DetailExtractor::new(profile.detail.clone())?;
            let detail = fetch_detail(&portal, &extractor, &item_seq)
                .await
                .with_context(|| format!("fetching detail for item {item_seq}"))?;
            let report = json!({
                "content_hash": detail.content_hash(),
                "approval_date_parsed": detail.approval_date_parsed(),
                "detail": detail,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_summary(summary: &SyncRunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", summary.to_json_pretty()?);
        return Ok(());
    }
    println!(
        "sync complete: run_id={} candidates={} processed={} inserted={} updated={} unchanged={} failures={}",
        summary.run_id,
        summary.candidates,
        summary.processed,
        summary.inserted,
        summary.updated,
        summary.unchanged,
        summary.failures.len()
    );
    for failure in &summary.failures {
        eprintln!(
            "  failed item {} during {}: {}",
            failure.item_seq, failure.stage, failure.message
        );
    }
    Ok(())
}

fn exit_code(summary: &SyncRunSummary) -> ExitCode {
    if summary.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
