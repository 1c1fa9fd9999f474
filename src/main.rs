//! Service Tag Mirror CLI
//!
//! Maintains the local service tag mirror and runs queries against it.
//!
//! # Usage
//! ```bash
//! # Refresh every cloud
//! servicetag-mirror update
//!
//! # Which service owns an address?
//! servicetag-mirror lookup --address 13.66.60.119
//!
//! # Route table template for two tags
//! servicetag-mirror export route-template --cloud Public --ids "Storage;Sql" --out .
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use servicetag_mirror::config::{DATA_DIR_ENV, HTTP_TIMEOUT_ENV};
use servicetag_mirror::mirror::parse_ids;
use servicetag_mirror::{Artifact, MirrorConfig, ServiceTagMirror};

// ============================================================
// CLI Definition
// ============================================================

#[derive(Parser)]
#[command(name = "servicetag-mirror")]
#[command(about = "Local mirror of cloud service tag IP ranges", long_about = None)]
#[command(version)]
struct Cli {
    /// Directory holding the mirrored dataset files
    #[arg(long, env = DATA_DIR_ENV)]
    data_dir: Option<PathBuf>,

    /// HTTP timeout in seconds
    #[arg(long, env = HTTP_TIMEOUT_ENV)]
    timeout: Option<u64>,

    /// Enable verbose logging (ignored when RUST_LOG is set)
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the service tags of a cloud
    List {
        /// Cloud name (unknown names use the first cloud)
        #[arg(long, default_value = "")]
        cloud: String,
    },

    /// Search service tags by substring
    Search {
        #[arg(long, default_value = "")]
        cloud: String,

        /// Matched against id, name, system service and region
        #[arg(long)]
        term: String,
    },

    /// Find the service tags containing an IP address
    Lookup {
        #[arg(long)]
        address: String,
    },

    /// Re-download datasets
    Update {
        /// Single cloud to refresh (default: all)
        #[arg(long)]
        cloud: Option<String>,
    },

    /// Generate a downloadable artifact
    Export {
        #[arg(value_enum)]
        kind: ExportKind,

        #[arg(long, default_value = "")]
        cloud: String,

        /// Semicolon-separated service tag ids
        #[arg(long)]
        ids: String,

        /// Write into this directory instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ExportKind {
    Prefixes,
    RouteTemplate,
    Allowlist,
}

// ============================================================
// Main Entry Point
// ============================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.json {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }

    // Flags fall back to their env vars through clap
    let mut config = MirrorConfig::default();
    if let Some(dir) = cli.data_dir {
        config = config.with_data_dir(dir);
    }
    if let Some(secs) = cli.timeout {
        config = config.with_http_timeout(Duration::from_secs(secs.max(1)));
    }

    let mirror = ServiceTagMirror::new(&config).context("Failed to initialize mirror")?;

    match cli.command {
        Commands::List { cloud } => {
            let dataset = mirror.list_services(&cloud).await?;

            println!(
                "Cloud: {} - Changenumber: {}",
                dataset.cloud_name, dataset.change_number
            );
            println!("\n{:<48} {:<24} {:>8}", "ID", "REGION", "PREFIXES");
            println!("{}", "-".repeat(82));
            for entry in &dataset.services {
                println!(
                    "{:<48} {:<24} {:>8}",
                    truncate(&entry.id, 48),
                    truncate(&entry.properties.region, 24),
                    entry.properties.address_prefixes.len()
                );
            }

            info!("✅ Listed {} service tags", dataset.services.len());
        }

        Commands::Search { cloud, term } => {
            let entries = mirror.search_services(&cloud, &term).await?;
            for entry in &entries {
                println!("{}", entry.id);
            }
            info!("✅ {} service tags match {:?}", entries.len(), term);
        }

        Commands::Lookup { address } => {
            let hits = mirror.search_address(&address).await?;
            if hits.is_empty() {
                println!("{} is not in any known service tag", address);
            }
            for (cloud, entry) in &hits {
                println!(
                    "{:<16} {:<48} {}",
                    cloud, entry.id, entry.properties.system_service
                );
            }
        }

        Commands::Update { cloud } => {
            let targets = match &cloud {
                Some(name) => name.clone(),
                None => mirror.registry().names().join(", "),
            };
            info!("🔄 Updating service tag datasets: {}", targets);
            let reports = mirror.update(cloud.as_deref()).await;

            let mut failed = 0;
            for report in &reports {
                match &report.error {
                    None => println!(
                        "{:<16} {:<10} changenumber {}",
                        report.cloud,
                        report.action,
                        report.change_number.unwrap_or_default()
                    ),
                    Some(e) => {
                        failed += 1;
                        error!(cloud = %report.cloud, error = %e, "Update failed");
                        println!("{:<16} {:<10} {}", report.cloud, report.action, e);
                    }
                }
            }

            if failed > 0 {
                anyhow::bail!("{} of {} clouds failed to update", failed, reports.len());
            }
        }

        Commands::Export { kind, cloud, ids, out } => {
            let ids = parse_ids(&ids);
            let artifact = match kind {
                ExportKind::Prefixes => mirror.export_prefixes(&cloud, &ids).await?,
                ExportKind::RouteTemplate => mirror.export_route_template(&cloud, &ids).await?,
                ExportKind::Allowlist => {
                    let origin = format!("servicetag-mirror export allowlist --cloud {} --ids {}", cloud, ids.join(";"));
                    mirror.export_allowlist(&cloud, &ids, &origin).await?
                }
            };
            write_artifact(&artifact, out).await?;
        }
    }

    Ok(())
}

async fn write_artifact(artifact: &Artifact, out: Option<PathBuf>) -> Result<()> {
    match out {
        Some(dir) => {
            let path = dir.join(&artifact.filename);
            tokio::fs::write(&path, &artifact.bytes)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!(
                "📄 Wrote {} ({}, {} bytes)",
                path.display(),
                artifact.content_type,
                artifact.bytes.len()
            );
        }
        None => {
            println!("{}", String::from_utf8_lossy(&artifact.bytes));
        }
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let kept: String = s.chars().take(max - 3).collect();
        format!("{}...", kept)
    } else {
        s.to_string()
    }
}
