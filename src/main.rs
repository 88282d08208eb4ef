use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crossposter::config::LoggingConfig;
use crossposter::cycle::open_watermark_store;
use crossposter::daemon::{is_daemon_running, stop_daemon};
use crossposter::{Config, CrosspostCycle, CycleOutcome, Daemon};

#[derive(Parser)]
#[command(name = "crossposter")]
#[command(about = "Mirror new Mastodon posts onto Bluesky")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration file
    Init {
        /// Mastodon instance URL, e.g. https://mastodon.social
        #[arg(long)]
        instance: String,

        /// Mastodon username
        #[arg(long)]
        username: String,

        /// Bluesky handle
        #[arg(long)]
        identifier: String,
    },

    /// Run a single crossposting cycle
    Run {
        /// Log posts instead of publishing them
        #[arg(long)]
        dry_run: bool,
    },

    /// Show what the next cycle would post, without posting
    Preview,

    /// Run as daemon
    Daemon {
        #[command(subcommand)]
        daemon_command: DaemonCommands,
    },

    /// Show the persisted watermark
    Watermark,
}

#[derive(Subcommand)]
enum DaemonCommands {
    /// Start the daemon
    Start {
        /// Run in foreground (don't daemonize)
        #[arg(long)]
        foreground: bool,
    },

    /// Stop running daemon
    Stop,

    /// Show daemon status
    Status,
}

fn main() -> Result<()> {
    // Secrets may live in a .env file next to the binary's working directory
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = match &cli.command {
        Commands::Init { .. } => Config::default(),
        _ => load_config(cli.config.as_deref())?,
    };

    // Detaching has to happen before the runtime spawns its worker threads
    if let Commands::Daemon {
        daemon_command: DaemonCommands::Start { foreground },
    } = &cli.command
    {
        if is_daemon_running(&config)? {
            println!("⚠️  Daemon is already running!");
            println!("   Use 'crossposter daemon stop' to stop it first");
            return Ok(());
        }
        if !foreground {
            detach(&config)?;
        }
    }

    init_logging(cli.verbose, &config.logging);
    info!("Starting crossposter v{}", env!("CARGO_PKG_VERSION"));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(async move {
        match cli.command {
            Commands::Init {
                instance,
                username,
                identifier,
            } => cmd_init(cli.config, instance, username, identifier),
            Commands::Run { dry_run } => cmd_run(dry_run, config).await,
            Commands::Preview => cmd_preview(config).await,
            Commands::Daemon { daemon_command } => cmd_daemon(daemon_command, config).await,
            Commands::Watermark => cmd_watermark(&config),
        }
    })
}

/// Initialize logging from config; RUST_LOG takes precedence
fn init_logging(verbose: bool, logging: &LoggingConfig) {
    let default_level = if verbose { "debug" } else { logging.level.as_str() };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let ansi = logging.color && std::io::stdout().is_terminal();

    let registry = tracing_subscriber::registry().with(filter);
    match logging.format.as_str() {
        "pretty" => registry.with(fmt::layer().pretty().with_ansi(ansi)).init(),
        "full" => registry.with(fmt::layer().with_ansi(ansi)).init(),
        _ => registry.with(fmt::layer().compact().with_ansi(ansi)).init(),
    }
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

#[cfg(unix)]
fn detach(config: &Config) -> Result<()> {
    println!("🚀 Starting crossposter daemon in background");
    println!("   PID file: {}", config.daemon.pid_file);
    println!("   Log file: {}", config.daemon.log_file);
    println!("   Poll interval: {}", config.daemon.interval);
    crossposter::daemon::daemonize(config)
}

#[cfg(not(unix))]
fn detach(_config: &Config) -> Result<()> {
    Err(anyhow!(
        "Background daemon mode not supported on this platform. Use --foreground"
    ))
}

/// Write a configuration file for the given accounts
fn cmd_init(
    config_path: Option<PathBuf>,
    instance: String,
    username: String,
    identifier: String,
) -> Result<()> {
    let config_path = match config_path {
        Some(path) => path,
        None => Config::default_config_path()?,
    };

    let mut config = Config::default();
    config.source.instance = instance;
    config.source.username = username;
    config.destination.identifier = identifier;

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }
    config.save(&config_path)?;

    println!("✅ Crossposter initialized successfully!");
    println!("   Config: {:?}", config_path);
    println!("   Source feed: {}", config.source.outbox_url());
    println!(
        "   Next: export {} and run 'crossposter run --dry-run'",
        config.destination.password_env
    );

    Ok(())
}

/// Run a single crossposting cycle
async fn cmd_run(dry_run: bool, mut config: Config) -> Result<()> {
    if dry_run {
        config.sync.dry_run = true;
        println!("🔍 Dry run mode - nothing will be posted");
    }

    let cycle = CrosspostCycle::from_config(&config)?;
    let report = cycle.run().await;

    match &report.outcome {
        CycleOutcome::Completed => {
            println!("\n🎉 Cycle complete!");
            println!("   📊 Eligible posts: {}", report.eligible_posts);
            println!("   ✅ Published: {}", report.published);
            println!("   ❌ Failed: {}", report.failed);
            println!("   🔖 Watermark: {}", report.watermark);
            println!("   ⏱️  Duration: {:.2}s", report.duration.as_secs_f64());
            if report.eligible_posts > 0 && !report.persisted {
                println!("   ⚠️  Watermark could not be saved; see log for details");
            }
            Ok(())
        }
        CycleOutcome::FetchFailed(e) => Err(anyhow!("Failed to fetch source feed: {}", e)),
        CycleOutcome::TimedOut => Err(anyhow!(
            "Cycle abandoned after {}s timeout",
            config.sync.timeout
        )),
        CycleOutcome::Skipped => Err(anyhow!("Another cycle is already running")),
    }
}

/// Print formatted posts the next cycle would consider
async fn cmd_preview(mut config: Config) -> Result<()> {
    config.sync.dry_run = true;
    let cycle = CrosspostCycle::from_config(&config)?;
    let entries = cycle.preview().await?;

    println!("Eligible posts ({}), watermark {}:", entries.len(), cycle.watermark());
    for entry in entries {
        let marker = if entry.is_new { "🆕" } else { "  " };
        println!("{} [{}] {}", marker, entry.post.sort_key, entry.post.post.url);
        for line in entry.text.lines() {
            println!("     {}", line);
        }
        println!();
    }

    Ok(())
}

/// Handle daemon commands
async fn cmd_daemon(daemon_command: DaemonCommands, config: Config) -> Result<()> {
    match daemon_command {
        DaemonCommands::Start { foreground } => {
            if foreground {
                println!("🖥️  Running in foreground mode (Ctrl+C to stop)");
            }
            let mut daemon = Daemon::new(config)?;
            daemon.run().await?;
        }

        DaemonCommands::Stop => {
            println!("🛑 Stopping crossposter daemon...");

            if !is_daemon_running(&config)? {
                println!("⚠️  No daemon appears to be running");
                return Ok(());
            }

            if stop_daemon(&config)? {
                println!("✅ Daemon stop signal sent");
            }
        }

        DaemonCommands::Status => {
            println!("📊 Crossposter Daemon Status");

            if is_daemon_running(&config)? {
                println!("   🟢 Status: Running");
                println!("   🔄 Poll interval: {}", config.daemon.interval);
                if !config.daemon.log_file.is_empty() {
                    println!("   📄 Log file: {}", config.daemon.log_file);
                }
            } else {
                println!("   🔴 Status: Not running");
                println!("   💡 Use 'crossposter daemon start' to start the daemon");
            }

            let store = open_watermark_store(&config)?;
            println!("   🔖 Watermark: {} ({})", store.load(), store.location());
        }
    }

    Ok(())
}

/// Show the persisted watermark
fn cmd_watermark(config: &Config) -> Result<()> {
    let store = open_watermark_store(config)?;
    let value = store.load();

    match chrono::DateTime::from_timestamp_millis(value) {
        Some(at) if value > 0 => println!("{} ({})", value, at.to_rfc3339()),
        _ => println!("{} (unset)", value),
    }
    println!("   stored at {}", store.location());

    Ok(())
}
