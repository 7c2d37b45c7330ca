use std::path::PathBuf;

use clap::{Parser, Subcommand};
use health_insights::cli::commands;
use health_insights::config::default_config_path;
use health_insights::Config;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "health-insights")]
#[command(author, version, about = "Daily health aggregates and period roll-ups", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to the user config directory)
    #[arg(short, long, global = true, env = "HEALTH_INSIGHTS_CONFIG")]
    config: Option<PathBuf>,

    /// Aggregate database, overrides storage.db_path
    #[arg(long, global = true, env = "HEALTH_INSIGHTS_DB")]
    db: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge a change-event batch into the stored aggregates
    Aggregate {
        /// Batch JSON file, or - for stdin
        input: String,
    },
    /// Roll up stored aggregates over a date range
    Insights {
        /// User id
        #[arg(short, long)]
        user: String,
        /// Metric context (type#qualifier), e.g. heart_rate#NA
        #[arg(short, long)]
        context: String,
        /// First day (YYYY-MM-DD)
        #[arg(long)]
        from: String,
        /// Last day (YYYY-MM-DD)
        #[arg(long)]
        to: String,
        /// Insight type (W, M, 6M, Y)
        #[arg(short = 't', long = "type", default_value = "W")]
        insight_type: String,
    },
    /// Answer a raw roll-up request, direct or body-wrapped
    Handle {
        /// Request JSON file, or - for stdin
        input: String,
    },
    /// Show one stored aggregate
    Show {
        /// User id
        #[arg(short, long)]
        user: String,
        /// Metric code (type#qualifier#date)
        #[arg(long)]
        code: String,
    },
}

fn load_config(cli: &Cli) -> health_insights::Result<Config> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };
    let mut config = Config::load(&path)?;
    if let Some(db) = &cli.db {
        config.storage.db_path = db.clone();
    }
    Ok(config)
}

fn init_logging(cli: &Cli, config: &Config) {
    let level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        config.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

#[tokio::main]
async fn main() -> health_insights::Result<()> {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    init_logging(&cli, &config);

    let result = match cli.command {
        Commands::Aggregate { input } => commands::aggregate(&config, &input).await,
        Commands::Insights {
            user,
            context,
            from,
            to,
            insight_type,
        } => commands::insights(&config, user, context, &from, &to, &insight_type).await,
        Commands::Handle { input } => commands::handle(&config, &input).await,
        Commands::Show { user, code } => commands::show(&config, &user, &code).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
