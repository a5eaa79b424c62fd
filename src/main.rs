//! Command-line interface for fin-sync
//!
//! # Usage Examples
//!
//! ```bash
//! # List declared resources
//! fin-sync --config fin-sync.toml resources
//!
//! # Incremental update of two identities
//! fin-sync update Market.Daily --identity 000001.SZ --identity 600000.SH
//!
//! # Full re-fetch of a window, bypassing the planner
//! fin-sync update Market.Daily --identity 000001.SZ --since 2021-01-01 --force
//!
//! # Query by readable labels
//! fin-sync query Finance.BalanceSheet --identity 000001.SZ --field "Total Assets" --labels
//!
//! # Coverage and alias inspection
//! fin-sync coverage Market.Daily --identity 000001.SZ
//! fin-sync aliases --group "Total Assets" --group close
//! ```

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use fin_sync::{Config, PatchOutcome, QueryOptions, Registry, RegistryBuilder, TimeRange};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "fin-sync")]
#[command(about = "Incremental synchronization of financial data into a local store")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file (TOML); defaults apply when it does not exist
    #[arg(
        long,
        global = true,
        default_value = "fin-sync.toml",
        env = "FIN_SYNC_CONFIG"
    )]
    config: PathBuf,

    /// Resource declaration file, overriding the configured one
    #[arg(long, global = true, env = "FIN_SYNC_DECLARATIONS")]
    declarations: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct WindowArgs {
    /// Window start (YYYY-MM-DD, YYYYMMDD or RFC3339)
    #[arg(long)]
    since: Option<String>,

    /// Window end (YYYY-MM-DD, YYYYMMDD or RFC3339)
    #[arg(long)]
    until: Option<String>,
}

impl WindowArgs {
    fn range(&self) -> anyhow::Result<TimeRange> {
        let parse = |s: &Option<String>, name: &str| -> anyhow::Result<_> {
            s.as_deref()
                .map(|s| {
                    sync_core::parse_timestamp(s)
                        .with_context(|| format!("Invalid --{name} '{s}'"))
                })
                .transpose()
        };
        Ok(TimeRange::new(
            parse(&self.since, "since")?,
            parse(&self.until, "until")?,
        ))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List declared resources
    Resources,

    /// Print stored rows as JSON lines
    Query {
        /// Resource URI
        uri: String,

        #[arg(long = "identity", value_name = "IDENTITY")]
        identities: Vec<String>,

        #[command(flatten)]
        window: WindowArgs,

        /// Fields to return besides the key columns
        #[arg(long = "field", value_name = "FIELD")]
        fields: Vec<String>,

        /// Fields are readable labels; output columns are relabelled
        #[arg(long)]
        labels: bool,
    },

    /// Synchronize a resource from its sources
    Update {
        /// Resource URI
        uri: String,

        /// Identities to synchronize concurrently; none synchronizes the whole resource
        #[arg(long = "identity", value_name = "IDENTITY")]
        identities: Vec<String>,

        #[command(flatten)]
        window: WindowArgs,

        /// Skip planning and fetch the whole window
        #[arg(long)]
        force: bool,
    },

    /// Show stored coverage
    Coverage {
        /// Resource URI; all records when omitted
        uri: Option<String>,

        #[arg(long)]
        identity: Option<String>,
    },

    /// Delete stored rows
    Delete {
        /// Resource URI
        uri: String,

        #[arg(long)]
        identity: Option<String>,

        #[command(flatten)]
        window: WindowArgs,
    },

    /// Show the field alias index
    Aliases {
        /// Group these labels by owning resource instead
        #[arg(long = "group", value_name = "LABEL")]
        group: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load_or_default(&cli.config)?;
    if let Some(path) = cli.declarations {
        config.declarations = Some(path);
    }

    // RUST_LOG wins over the configured level
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cancel = CancellationToken::new();
    let registry = RegistryBuilder::from_config(&config)?
        .cancellation(cancel.clone())
        .build()
        .context("Failed to set up the registry")?;

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling in-flight fetches");
            cancel.cancel();
        }
    });

    match cli.command {
        Commands::Resources => {
            for descriptor in registry.resources() {
                println!(
                    "{}\t{}\tidentity={}\ttime={}",
                    descriptor.uri,
                    descriptor.collection(),
                    descriptor.identity_field.as_deref().unwrap_or("-"),
                    descriptor.time_field.as_deref().unwrap_or("-"),
                );
            }
        }
        Commands::Query {
            uri,
            identities,
            window,
            fields,
            labels,
        } => {
            let options = QueryOptions {
                identities,
                range: window.range()?,
                fields,
                use_labels: labels,
                ..QueryOptions::default()
            };
            let table = registry
                .query(&uri, &options)
                .await
                .with_context(|| failure(&registry, "Query failed"))?;
            for row in table.rows() {
                println!("{}", serde_json::to_string(row)?);
            }
        }
        Commands::Update {
            uri,
            identities,
            window,
            force,
        } => run_update(&registry, &uri, identities, window.range()?, force).await?,
        Commands::Coverage { uri, identity } => {
            let records: Vec<_> = match uri {
                Some(uri) => registry
                    .coverage(&uri, identity.as_deref())
                    .await
                    .into_iter()
                    .collect(),
                None => registry.all_coverage().await,
            };
            if let Some(e) = registry.last_error() {
                anyhow::bail!("Coverage lookup failed: {e}");
            }
            for record in records {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        Commands::Delete {
            uri,
            identity,
            window,
        } => {
            let removed = registry
                .delete(&uri, identity.as_deref(), &window.range()?)
                .await
                .with_context(|| failure(&registry, "Delete failed"))?;
            println!("Deleted {removed} rows");
        }
        Commands::Aliases { group } => {
            let aliases = registry.aliases();
            if group.is_empty() {
                for entry in aliases.entries() {
                    println!(
                        "{}\t{}\t{}",
                        entry.canonical_key, entry.label, entry.owning_uri
                    );
                }
            } else {
                for (uri, labels) in aliases.group_by_resource(&group) {
                    println!("{uri}\t{}", labels.join(", "));
                }
            }
        }
    }

    Ok(())
}

fn failure(registry: &Registry, what: &str) -> String {
    match registry.last_error() {
        Some(e) => format!("{what}: {e}"),
        None => what.to_string(),
    }
}

async fn run_update(
    registry: &Registry,
    uri: &str,
    identities: Vec<String>,
    range: TimeRange,
    force: bool,
) -> anyhow::Result<()> {
    let targets: Vec<Option<&str>> = if identities.is_empty() {
        vec![None]
    } else {
        identities.iter().map(|i| Some(i.as_str())).collect()
    };

    let extra = sync_core::Record::new();
    let patches = futures::future::join_all(
        targets
            .iter()
            .map(|identity| registry.update_patch(uri, *identity, &range, &extra, force)),
    )
    .await;

    let mut failed = 0;
    for (identity, patch) in targets.iter().zip(patches) {
        let label = identity.unwrap_or("*");
        match patch {
            Some(patch) => {
                match &patch.outcome {
                    PatchOutcome::Ok => println!(
                        "{uri}\t{label}\tok\t{} merged, {} skipped",
                        patch.merged_rows, patch.skipped_rows
                    ),
                    PatchOutcome::NoOp => println!("{uri}\t{label}\tup to date"),
                    other => println!("{uri}\t{label}\tfailed\t{other:?}"),
                }
                if !patch.is_success() {
                    failed += 1;
                }
            }
            None => {
                println!("{uri}\t{label}\tfailed");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} updates failed", targets.len());
    }
    info!("Updated '{uri}' for {} targets", targets.len());
    Ok(())
}
