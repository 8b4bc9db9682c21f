use std::sync::Arc;

use anyhow::Result;
use carr_enrich::{EnrichConfig, EnrichmentProvider, HttpEnrichmentProvider};
use carr_resolve::{ResolveConfig, ResolvePass};
use carr_store::{LookupClient, LookupClientConfig};
use carr_sync::{run_session_sync, SyncConfig, SyncSession};
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "carr-cli")]
#[command(about = "Conference actor registry command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one dedup/merge batch pass over the authoritative store.
    Resolve,
    /// Run asynchronous enrichment lookups for every stored actor.
    Enrich,
    /// Reconcile the authoritative store into the client cache.
    Sync,
    /// Serve the sync API.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Resolve) {
        Commands::Resolve => {
            let config = ResolveConfig::from_env();
            let pass = ResolvePass::new(&config)?;
            let summary = pass.run_once().await?;
            println!(
                "resolve complete: run_id={} input={} survivors={} merged_groups={} retired={}",
                summary.run_id,
                summary.input_records,
                summary.surviving_records,
                summary.merged_groups,
                summary.retired.len()
            );
        }
        Commands::Enrich => {
            let config = EnrichConfig::from_env();
            let providers = providers_from_env()?;
            if providers.is_empty() {
                eprintln!("no enrichment providers configured; set CARR_BIOGRAPHY_URL / CARR_PROFILE_URL / CARR_PUBLICATIONS_URL");
                return Ok(());
            }
            let outcome = carr_enrich::run_enrichment_once(&config, providers).await?;
            println!(
                "enrich complete: run_id={} considered={} enriched={} failed_lookups={}",
                outcome.run_id,
                outcome.actors_considered,
                outcome.actors_enriched,
                outcome.lookups_failed
            );
        }
        Commands::Sync => {
            let config = SyncConfig::from_env();
            let session = SyncSession::new();
            match run_session_sync(&config, &session).await? {
                Some(outcome) => println!(
                    "sync complete: added={} backfilled={} refresh={}",
                    outcome.added.len(),
                    outcome.backfilled.len(),
                    outcome.requires_refresh()
                ),
                None => println!("sync skipped: already ran this session"),
            }
        }
        Commands::Serve => {
            carr_web::serve_from_env().await?;
        }
    }

    Ok(())
}

fn providers_from_env() -> Result<Vec<Arc<dyn EnrichmentProvider>>> {
    let client = Arc::new(LookupClient::new(LookupClientConfig::default())?);
    let mut providers: Vec<Arc<dyn EnrichmentProvider>> = Vec::new();
    for (name, var) in [
        ("biography", "CARR_BIOGRAPHY_URL"),
        ("profile", "CARR_PROFILE_URL"),
        ("publications", "CARR_PUBLICATIONS_URL"),
    ] {
        if let Ok(base_url) = std::env::var(var) {
            providers.push(Arc::new(HttpEnrichmentProvider::new(
                name,
                base_url,
                client.clone(),
            )));
        }
    }
    Ok(providers)
}
