//! Babyphone CLI
//!
//! Command-line interface for the Babyphone Telegram bot

mod logging;

use anyhow::{Context, Result};
use babyphone_config::{Config, TelegramConfig};
use babyphone_core::BabyphoneRuntime;
use babyphone_telegram::TelegramAdapter;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tracing::info;

const REDACTED: &str = "***REDACTED***";

#[derive(Parser)]
#[command(name = "babyphone")]
#[command(about = "Telegram remote control for a babyphone device", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (overrides core.log_level)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot in the foreground
    Start {
        /// PIN expected by `/start <pin>`
        #[arg(short, long)]
        pin: Option<u64>,

        /// Bind this chat id at startup, skipping the PIN handshake
        #[arg(long, allow_negative_numbers = true)]
        chat_id: Option<i64>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Manage log files
    Logs {
        #[command(subcommand)]
        action: LogCommands,
    },

    /// Check connectivity
    Test {
        #[command(subcommand)]
        action: TestCommands,
    },

    /// Show version
    Version,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write the example configuration
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Show current configuration with secrets redacted
    Show,
    /// Validate configuration
    Validate,
    /// Print the configuration file path
    Path,
}

#[derive(Subcommand)]
enum LogCommands {
    /// Print the log directory
    Path,
    /// Show log files and sizes
    List,
    /// Remove old log files
    Clean {
        /// Keep only N days of logs
        #[arg(short, long, default_value = "7")]
        days: u64,
    },
}

#[derive(Subcommand)]
enum TestCommands {
    /// Check the bot token with getMe
    Telegram,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { pin, chat_id } => {
            let mut config = read_config(cli.config.as_deref())?;
            apply_start_overrides(&mut config, pin, chat_id);
            config.validate()?;

            let data_dir = config.data_dir();
            fs::create_dir_all(&data_dir)
                .with_context(|| format!("Failed to create {}", data_dir.display()))?;
            let log_level = effective_log_level(cli.log_level.as_deref(), &config);
            let _logging_guard = logging::init_logging(&data_dir.join("logs"), &log_level)?;

            info!("Starting Babyphone runtime in foreground...");
            let runtime = BabyphoneRuntime::new(config);
            runtime.run().await?;
        }

        Commands::Config { action } => match action {
            ConfigCommands::Init { force } => {
                create_default_config(cli.config.as_deref(), force)?;
            }
            ConfigCommands::Show => match load_config(cli.config.as_deref()) {
                Ok(config) => {
                    println!("Current configuration:");
                    print_redacted_config(&config)?;
                }
                Err(e) => eprintln!("Error loading config: {}", e),
            },
            ConfigCommands::Validate => match load_config(cli.config.as_deref()) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => {
                    eprintln!("Configuration is invalid: {}", e);
                    std::process::exit(1);
                }
            },
            ConfigCommands::Path => {
                println!("{}", config_path(cli.config.as_deref())?.display());
            }
        },

        Commands::Logs { action } => {
            let config = read_config(cli.config.as_deref()).unwrap_or_default();
            let manager = logging::LogManager::new(config.data_dir().join("logs"));
            match action {
                LogCommands::Path => {
                    println!("{}", manager.log_dir().display());
                }
                LogCommands::List => {
                    let files = manager.log_files()?;
                    if files.is_empty() {
                        println!("No log files in {}", manager.log_dir().display());
                        return Ok(());
                    }
                    println!(
                        "Log files ({} total):\n",
                        logging::LogManager::format_size(manager.total_size()?)
                    );
                    for file in files {
                        let metadata = fs::metadata(&file)?;
                        let modified: chrono::DateTime<chrono::Local> = metadata.modified()?.into();
                        println!(
                            "  {} ({}, modified {})",
                            file.file_name()
                                .map(|n| n.to_string_lossy().to_string())
                                .unwrap_or_default(),
                            logging::LogManager::format_size(metadata.len()),
                            modified.format("%Y-%m-%d %H:%M:%S")
                        );
                    }
                }
                LogCommands::Clean { days } => {
                    let cutoff = SystemTime::now() - Duration::from_secs(days * 24 * 60 * 60);
                    let removed = manager.remove_older_than(cutoff)?;
                    println!("Cleaned {} old log file(s)", removed);
                }
            }
        }

        Commands::Test { action } => match action {
            TestCommands::Telegram => {
                println!("Testing Telegram bot connection...\n");
                let config = read_config(cli.config.as_deref())?;
                test_telegram_bot(&config).await?;
            }
        },

        Commands::Version => {
            println!("babyphone {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

fn config_path(config_path: Option<&str>) -> Result<PathBuf> {
    match config_path {
        Some(path) => Ok(PathBuf::from(path)),
        None => Config::default_path().context("No config directory available on this system"),
    }
}

fn read_config(config_path_arg: Option<&str>) -> Result<Config> {
    Config::read(config_path(config_path_arg)?)
}

fn load_config(config_path_arg: Option<&str>) -> Result<Config> {
    Config::load(config_path(config_path_arg)?)
}

fn apply_start_overrides(config: &mut Config, pin: Option<u64>, chat_id: Option<i64>) {
    if pin.is_some() {
        config.auth.pin = pin;
    }
    if chat_id.is_some() {
        config.auth.chat_id = chat_id;
    }
}

fn effective_log_level(cli_level: Option<&str>, config: &Config) -> String {
    cli_level
        .map(str::to_string)
        .or_else(|| config.core.log_level.clone())
        .unwrap_or_else(|| "info".to_string())
}

fn redacted_config_value(config: &Config) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(config)?;

    if let Some(token) = value
        .get_mut("telegram")
        .and_then(|t| t.get_mut("bot_token"))
    {
        if token.as_str().is_some_and(|t| !t.is_empty()) {
            *token = json!(REDACTED);
        }
    }

    if let Some(pin) = value.get_mut("auth").and_then(|a| a.get_mut("pin")) {
        if !pin.is_null() {
            *pin = json!(REDACTED);
        }
    }

    Ok(value)
}

fn print_redacted_config(config: &Config) -> Result<()> {
    let value = redacted_config_value(config)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn test_telegram_bot(config: &Config) -> Result<()> {
    let token = config.telegram.resolve_token()?;
    let bot_id = TelegramConfig::account_tag(&token);
    println!("Testing bot (bot_id: {})...", bot_id);

    let adapter = TelegramAdapter::new(&token, &config.telegram, config.data_dir())?;
    match adapter.get_me().await {
        Ok(username) => println!("  ✓ SUCCESS: @{}", username),
        Err(e) => {
            println!("  ✗ FAILED: {}", e);
            std::process::exit(1);
        }
    }
    Ok(())
}

fn create_default_config(config_path_arg: Option<&str>, force: bool) -> Result<()> {
    let path = config_path(config_path_arg)?;
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists, pass --force to overwrite",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, include_str!("../../../config/config.example.toml"))?;

    println!("Configuration created at: {}", path.display());
    println!("\nEdit the file to set the bot token and PIN, then run:");
    println!("  babyphone config validate");
    println!("  babyphone test telegram");
    println!("  babyphone start");

    Ok(())
}
