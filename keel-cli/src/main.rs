use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "keel")]
#[command(about = "Root-filesystem image builder for VMs and containers", long_about = None)]
struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build images from spec files
    Build {
        /// Spec files to build; each image is named after its file
        #[arg(required = true)]
        specs: Vec<PathBuf>,

        /// Tag to assign (repeatable; defaults to "latest")
        #[arg(short, long = "tag")]
        tags: Vec<String>,

        /// Rebuild base images even when a stored image satisfies them
        #[arg(long)]
        rebuild: bool,
    },

    /// List builds
    Images {
        /// Filter by build ID or name[:tag]
        filters: Vec<String>,

        /// Filter by build type: image, mount or boot (repeatable)
        #[arg(long = "type")]
        types: Vec<String>,

        /// Show only untagged builds
        #[arg(long)]
        untagged: bool,
    },

    /// Drop builds, children before parents
    Drop {
        /// Build IDs or name[:tag] selectors
        filters: Vec<String>,

        /// Required to drop builds when no selectors are given
        #[arg(long)]
        all: bool,

        /// Drop only untagged builds
        #[arg(long)]
        untagged: bool,

        /// Restrict to build types: image, mount or boot (repeatable)
        #[arg(long = "type")]
        types: Vec<String>,
    },

    /// Mount an image as a long-lived instance
    Mount {
        /// Image to mount, as a build ID or name[:tag]
        image: String,

        /// Name and tag for the mounted instance
        #[arg(short, long)]
        name: Option<String>,

        /// Create a boot mount for a VM instead of a plain mount
        #[arg(long)]
        boot: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Build { specs, tags, rebuild } => commands::build::run(specs, tags, rebuild).await,
        Commands::Images { filters, types, untagged } => {
            commands::images::run(filters, types, untagged)
        }
        Commands::Drop { filters, all, untagged, types } => {
            commands::drop::run(filters, all, untagged, types)
        }
        Commands::Mount { image, name, boot } => commands::mount::run(image, name, boot),
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}
