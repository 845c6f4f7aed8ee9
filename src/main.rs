use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use kbase_catalog::Config;
use kbase_catalog::commands::{
    cmd_catalog, cmd_init_config, cmd_list, cmd_process, cmd_rebuild_index, cmd_test, cmd_watch,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kbase-catalog")]
#[command(about = "Catalog image archives with a vision-language model")]
#[command(version)]
struct Cli {
    /// Configuration file (default: ./config.yaml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Archive root whose subdirectories are catalogs
    #[arg(short, long, global = true, default_value = "archive")]
    archive_dir: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile every catalog in the archive
    Process,

    /// Reconcile a single catalog
    Catalog {
        /// Catalog directory name under the archive root
        name: String,
    },

    /// Regenerate the root index without analyzing images
    RebuildIndex,

    /// Show indexed catalogs
    #[command(visible_alias = "ls")]
    List,

    /// Analyze one image and print the result without saving it
    Test {
        /// Path to the image
        image: PathBuf,
    },

    /// Index changes as they happen until interrupted
    Watch,

    /// Write a default configuration file
    InitConfig {
        /// Destination (default: config.yaml)
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // init-config must work before any configuration exists.
    if let Commands::InitConfig { path, force } = &cli.command {
        return finish(cmd_init_config(path.as_deref(), *force));
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    tracing::debug!(?config, "configuration loaded");

    let archive_dir = cli.archive_dir.as_path();
    let result = match cli.command {
        Commands::Process => cmd_process(&config, archive_dir).await,
        Commands::Catalog { name } => cmd_catalog(&config, archive_dir, &name).await,
        Commands::RebuildIndex => cmd_rebuild_index(&config, archive_dir),
        Commands::List => cmd_list(&config, archive_dir),
        Commands::Test { image } => cmd_test(&config, &image).await,
        Commands::Watch => cmd_watch(&config, archive_dir).await,
        Commands::InitConfig { .. } => Ok(()),
    };

    finish(result)
}

fn finish(result: kbase_catalog::Result<()>) -> ExitCode {
    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}
