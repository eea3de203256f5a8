//! `config` subcommand: show, reset, edit, or print the path of the
//! on-disk config file. Grounded on the teacher's `cli::handle_cli` —
//! same four-flag shape, adapted to this crate's `Config` API (no
//! `to_toml`/`from_env`, so `--show` prints the effective struct fields
//! directly instead of round-tripping through TOML).

use std::io::Write;
use std::process::Command;

use clap::{Parser, Subcommand};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "gatekeeper")]
#[command(version)]
#[command(about = "Multi-tenant reverse proxy for pooled upstream API keys", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,
        /// Reset config file to the starter template
        #[arg(long)]
        reset: bool,
        /// Open config file in $EDITOR
        #[arg(long)]
        edit: bool,
        /// Show config file path
        #[arg(long)]
        path: bool,
    },
}

/// Handle CLI commands. Returns true if a command was handled (the
/// caller should exit rather than start the server).
pub fn handle_cli() -> bool {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Config { show, reset, edit, path }) => {
            if path {
                handle_config_path();
            } else if show {
                handle_config_show();
            } else if reset {
                handle_config_reset();
            } else if edit {
                handle_config_edit();
            } else {
                println!("Usage: gatekeeper config [--show|--reset|--edit|--path]");
            }
            true
        }
        None => false,
    }
}

fn handle_config_path() {
    match Config::config_path() {
        Some(path) => println!("{}", path.display()),
        None => {
            eprintln!("could not determine config path (no home directory)");
            std::process::exit(1);
        }
    }
}

fn handle_config_show() {
    let config = Config::load();
    println!("bind_addr = {}", config.bind_addr);
    println!("log_dir = {}", config.log_dir.display());
    println!();
    println!("[auth]");
    println!("credentials = {} configured", config.auth.credentials.len());
    println!("admin_credential = {}", config.auth.admin_credential.is_some());
    println!();
    println!("[upstream]");
    println!("base_url = {}", config.upstream.base_url);
    println!("key_storage_mode = {:?}", config.upstream.key_storage_mode);
    println!();
    println!("[context]");
    println!("storage_mode = {:?}", config.context.storage_mode);
    println!("default_ttl_days = {}", config.context.default_ttl_days);
    println!("default_max_tokens = {}", config.context.default_max_tokens);
    println!();
    println!("[cache]");
    println!("enable_native_caching = {}", config.cache.enable_native_caching);
    println!();
    println!("[scheduler]");
    println!("quota_timezone = {}", config.scheduler.quota_timezone);
    println!("usage_report_interval_minutes = {}", config.scheduler.usage_report_interval_minutes);
    println!();
    println!("[safety]");
    println!("disable_safety_filtering = {}", config.safety.disable_safety_filtering);
    println!();
    println!("[logging]");
    println!("rotation = {:?}", config.logging.rotation);
    println!("debug = {}", config.logging.debug);

    println!();
    match Config::config_path() {
        Some(path) if path.exists() => println!("# source: {}", path.display()),
        _ => println!("# source: defaults (no config file)"),
    }
}

fn handle_config_reset() {
    let Some(path) = Config::config_path() else {
        eprintln!("could not determine config path (no home directory)");
        std::process::exit(1);
    };

    if path.exists() {
        eprint!("config file exists at {}. Overwrite? [y/N] ", path.display());
        let _ = std::io::stderr().flush();
        let mut input = String::new();
        if std::io::stdin().read_line(&mut input).is_err() || !input.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return;
        }
        let _ = std::fs::remove_file(&path);
    }

    Config::default().ensure_config_exists();
    println!("Config reset to defaults: {}", path.display());
}

fn handle_config_edit() {
    let Some(path) = Config::config_path() else {
        eprintln!("could not determine config path (no home directory)");
        std::process::exit(1);
    };

    if !path.exists() {
        Config::default().ensure_config_exists();
        println!("Created new config file: {}", path.display());
    }

    let editor = std::env::var("EDITOR")
        .or_else(|_| std::env::var("VISUAL"))
        .unwrap_or_else(|_| if cfg!(windows) { "notepad".to_string() } else { "nano".to_string() });

    match Command::new(&editor).arg(&path).status() {
        Ok(status) if status.success() => {}
        Ok(status) => {
            eprintln!("editor exited with status: {status}");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("failed to launch editor '{editor}': {e}");
            std::process::exit(1);
        }
    }
}
