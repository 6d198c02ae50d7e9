//! rudder CLI
//!
//! Connects to the release service the same way a release operation would
//! and runs one query against it, or sanitizes a manifest locally.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rudder::{sanitize, Meta, ProviderConfig};
use rudder_common::telemetry::{init_telemetry, TelemetryConfig};

/// rudder - release service connection bootstrap
#[derive(Parser, Debug)]
#[command(name = "rudder", version, about, long_about = None)]
struct Cli {
    /// Provider configuration file (YAML or JSON)
    #[arg(short = 'c', long = "config", env = "RUDDER_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Verbose logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the release service version and store backend
    Version,

    /// List the latest revision of every release
    Releases {
        /// Only releases in this namespace
        #[arg(short, long)]
        namespace: Option<String>,

        /// Maximum number of releases (0 for all)
        #[arg(long, default_value = "0")]
        limit: u32,
    },

    /// Show the revisions of a release, newest first
    History {
        /// Release name
        name: String,

        /// Maximum number of revisions (0 for all)
        #[arg(long, default_value = "0")]
        max: u32,
    },

    /// Convert a manifest to diff-safe JSON
    ///
    /// Secret values are replaced by one-way markers. Every `--sensitive`
    /// literal is masked wherever it appears.
    Sanitize {
        /// Manifest file
        file: PathBuf,

        /// Literal to mask; repeatable
        #[arg(long = "sensitive")]
        sensitive: Vec<String>,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ProviderConfig> {
    match path {
        Some(path) => ProviderConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display())),
        None => {
            let mut config = ProviderConfig::default();
            config.resolve_env_defaults();
            Ok(config)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    init_telemetry(TelemetryConfig {
        debug: cli.debug || config.debug,
        json: cli.json_logs,
    })?;

    if let Commands::Sanitize { file, sensitive } = &cli.command {
        let manifest = tokio::fs::read_to_string(file)
            .await
            .with_context(|| format!("failed to read {}", file.display()))?;
        println!("{}", sanitize(&manifest, sensitive.as_slice())?);
        return Ok(());
    }

    let meta = Meta::from_config(&config)?;
    let client = meta.client().await?;

    match cli.command {
        Commands::Version => {
            let version = client.version().await?;
            println!("server: {}", version.version);
            println!("storage: {}", version.storage_driver);
        }
        Commands::Releases { namespace, limit } => {
            for r in client.list_releases(namespace.as_deref(), limit).await? {
                println!("{}\t{}\t{}\t{}", r.name, r.version, r.status_name(), r.namespace);
            }
        }
        Commands::History { name, max } => {
            for r in client.history(&name, max).await? {
                let description = r.info.as_ref().map(|i| i.description.as_str()).unwrap_or("");
                println!("{}\t{}\t{}", r.version, r.status_name(), description);
            }
        }
        Commands::Sanitize { .. } => {}
    }

    Ok(())
}
