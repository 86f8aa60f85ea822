use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use repovault::credentials::EnvCredentials;
use repovault::daemon::is_daemon_running;
use repovault::health::HealthCheck;
use repovault::orchestrator::{CycleOutcome, Orchestrator};
use repovault::{Config, Daemon};

#[derive(Parser)]
#[command(name = "repovault")]
#[command(about = "Multi-account git backup daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the backup daemon
    Start {
        /// Run in foreground (don't daemonize)
        #[arg(long)]
        foreground: bool,
    },

    /// Stop a running daemon
    Stop,

    /// Show daemon and repository status
    Status,

    /// Run a backup cycle now, for one repository or all
    Sync {
        /// Repository name (all tracked repositories when omitted)
        name: Option<String>,
    },

    /// List tracked repositories
    List {
        /// Filter by account id
        #[arg(long)]
        account: Option<String>,
    },

    /// Track and provision a folder now, without waiting for the watcher
    Add { path: std::path::PathBuf },

    /// Re-enable automatic backups for a repository
    Enable { name: String },

    /// Pause automatic backups for a repository
    Disable { name: String },

    /// Stop tracking a repository (local folder and remote are kept)
    Remove { name: String },

    /// Write a default configuration file
    InitConfig,

    /// System health check and diagnostics
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config)?;
    init_logging(cli.verbose, &config)?;

    match cli.command {
        Commands::Start { foreground } => cmd_start(foreground, &config).await,
        Commands::Stop => cmd_stop(&config).await,
        Commands::Status => cmd_status(&config).await,
        Commands::Sync { name } => cmd_sync(name, &config).await,
        Commands::List { account } => cmd_list(account, &config),
        Commands::Add { path } => cmd_add(path, &config).await,
        Commands::Enable { name } => cmd_set_enabled(&name, true, &config),
        Commands::Disable { name } => cmd_set_enabled(&name, false, &config),
        Commands::Remove { name } => cmd_remove(&name, &config),
        Commands::InitConfig => cmd_init_config(),
        Commands::Doctor => cmd_doctor(&config),
    }
}

/// Initialize logging from the verbose flag and configured level/format
fn init_logging(verbose: bool, config: &Config) -> Result<()> {
    let default_level = if verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "pretty" {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<std::path::PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(&path),
        None => Config::load_or_default(),
    }
}

/// Build a one-shot orchestrator against the shared state file
fn orchestrator_for(config: &Config) -> Result<Orchestrator> {
    Orchestrator::new(config.clone(), Arc::new(EnvCredentials))
}

async fn cmd_start(foreground: bool, config: &Config) -> Result<()> {
    println!("🚀 Starting repovault daemon...");

    if is_daemon_running(config)? {
        println!("⚠️  Daemon is already running!");
        println!("   Use 'repovault stop' to stop it first");
        return Ok(());
    }

    let mut daemon = Daemon::new(config.clone())?;

    if foreground {
        println!("🖥️  Running in foreground mode (Ctrl+C to stop)");
        daemon.run().await?;
    } else {
        #[cfg(unix)]
        {
            daemon.daemonize()?;
            daemon.run().await?;
        }

        #[cfg(not(unix))]
        {
            println!("❌ Background daemon mode not supported on this platform");
            println!("   Use --foreground to run in foreground mode");
        }
    }

    Ok(())
}

async fn cmd_stop(config: &Config) -> Result<()> {
    println!("🛑 Stopping repovault daemon...");

    if !is_daemon_running(config)? {
        println!("⚠️  No daemon appears to be running");
        return Ok(());
    }

    let daemon = Daemon::new(config.clone())?;
    daemon.stop().await?;

    println!("✅ Daemon stop signal sent");
    Ok(())
}

async fn cmd_status(config: &Config) -> Result<()> {
    println!("📊 repovault Status");

    if is_daemon_running(config)? {
        println!("   🟢 Daemon: Running");
        println!("   🔄 Cycle interval: {}", config.daemon.cycle_interval);
        if !config.daemon.log_file.is_empty() {
            println!("   📄 Log file: {}", config.daemon.log_file);
        }
    } else {
        println!("   🔴 Daemon: Not running");
        println!("   💡 Use 'repovault start' to start it");
    }

    let orchestrator = orchestrator_for(config)?;
    let status = orchestrator.status();

    println!("   📦 Tracked repositories: per account");
    for (account, count) in &status.per_account_counts {
        println!("      {}: {}", account, count);
    }
    println!("   ✅ Total backups: {}", status.total_backups);
    println!("   ❌ Total failures: {}", status.total_failures);

    Ok(())
}

async fn cmd_sync(name: Option<String>, config: &Config) -> Result<()> {
    info!("Running manual backup cycle");

    let orchestrator = orchestrator_for(config)?;
    orchestrator.set_running(true);

    let result = orchestrator.trigger_sync(name.as_deref()).await;

    println!("🎉 Backup cycle complete");
    println!("   ✅ Pushed: {}", result.pushed());
    println!("   💤 No changes: {}", result.no_op());
    println!("   ❌ Failed: {}", result.failed());
    println!("   ⏱️  Duration: {:.2}s", result.duration.as_secs_f64());

    for (path, outcome) in &result.outcomes {
        if let CycleOutcome::Failed(error) = outcome {
            println!("   ❌ {}: {}", path.display(), error);
        }
    }

    Ok(())
}

async fn cmd_add(path: std::path::PathBuf, config: &Config) -> Result<()> {
    let path = path
        .canonicalize()
        .with_context(|| format!("Cannot resolve {}", path.display()))?;
    let binding = config
        .binding_for_path(&path)
        .with_context(|| format!("No configured root contains {}", path.display()))?;

    let orchestrator = orchestrator_for(config)?;
    orchestrator.set_running(true);

    orchestrator
        .on_folder_detected(repovault::watcher::FolderEvent {
            path: path.clone(),
            account_id: binding.account_id.clone(),
            observed_at: chrono::Utc::now(),
        })
        .await;

    match orchestrator
        .list_tracked(None)
        .iter()
        .find(|r| r.local_path == path)
    {
        Some(repo) => {
            println!(
                "✅ Tracking {} as '{}' ({})",
                path.display(),
                repo.repo_name,
                repo.account_id
            );
        }
        None => {
            println!("⚠️  {} was not accepted as a project", path.display());
        }
    }

    Ok(())
}

fn cmd_list(account: Option<String>, config: &Config) -> Result<()> {
    let orchestrator = orchestrator_for(config)?;
    let tracked = orchestrator.list_tracked(account.as_deref());

    println!("Tracked repositories ({}):", tracked.len());
    for repo in tracked {
        let marker = if repo.enabled { "📁" } else { "⏸️ " };
        println!(
            "  {} {} [{}] {} ({} backups)",
            marker,
            repo.repo_name,
            repo.account_id,
            repo.lifecycle.as_str(),
            repo.backup_count
        );
        if let Some(error) = &repo.last_error {
            println!("     ❌ {}", error);
        }
    }

    Ok(())
}

fn cmd_set_enabled(name: &str, enabled: bool, config: &Config) -> Result<()> {
    let orchestrator = orchestrator_for(config)?;

    if orchestrator.set_enabled(name, enabled) {
        if enabled {
            println!("✅ Backups enabled for {}", name);
        } else {
            println!("⏸️  Backups paused for {}", name);
        }
    } else {
        println!("⚠️  No tracked repository named {}", name);
    }

    Ok(())
}

fn cmd_remove(name: &str, config: &Config) -> Result<()> {
    let orchestrator = orchestrator_for(config)?;

    if orchestrator.remove(name) {
        println!("✅ Stopped tracking {}", name);
        println!("   Local folder and remote repository were left in place");
    } else {
        println!("⚠️  No tracked repository named {}", name);
    }

    Ok(())
}

fn cmd_init_config() -> Result<()> {
    let config_path = Config::default_config_path()?;

    if config_path.exists() {
        println!("⚠️  Configuration already exists at {:?}", config_path);
        return Ok(());
    }

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Config::default().save(&config_path)?;

    println!("✅ Default configuration written to {:?}", config_path);
    println!("   Add account bindings under 'accounts:' before starting the daemon");
    Ok(())
}

fn cmd_doctor(config: &Config) -> Result<()> {
    let health = HealthCheck::run(config, &EnvCredentials);
    print_health_report(&health);
    Ok(())
}

/// Print health check report to stdout
fn print_health_report(health: &HealthCheck) {
    use repovault::health::CheckResult;

    fn print_check(name: &str, result: &CheckResult) {
        println!("{}:", name);
        let icon = if result.passed {
            if result.is_warning {
                "⚠️ "
            } else {
                "✅"
            }
        } else {
            "❌"
        };
        println!("  {} {}", icon, result.message);
        if let Some(details) = &result.details {
            for line in details.lines() {
                println!("     {}", line);
            }
        }
    }

    println!("🔍 repovault System Diagnostics");
    println!();

    for (name, result) in health.all_checks() {
        print_check(&name, result);
        println!();
    }

    if health.all_passed() {
        println!("✅ All checks passed");
    } else {
        println!("❌ Some checks failed");
    }
}
