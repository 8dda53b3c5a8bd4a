//! `tavern-cli` – Tavern administrative shell.
//!
//! This binary wires the memory core together and hands it to an operator:
//!
//! 1. Initialises structured logging (and OTLP export when configured).
//! 2. Loads `~/.tavern/config.toml`, writing a default one on first run.
//! 3. Opens the tenant registry under the configured data directory and
//!    builds the consolidation pipeline on top of an LLM-backed oracle.
//! 4. Drops the operator into an interactive REPL (`/help` lists commands).
//! 5. Intercepts **Ctrl-C** to stop accepting commands and exit safely.

mod config;
mod models;
mod repl;

use colored::Colorize;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

use tavern_memory::TenantRegistry;
use tavern_runtime::ConsolidationPipeline;
use tavern_runtime::llm_driver::LlmDriver;
use tavern_runtime::llm_oracle::LlmOracle;
use tavern_runtime::telemetry::init_tracing;

fn main() {
    // Held until exit so pending spans are flushed.
    let _telemetry = init_tracing("tavern");

    print_banner();

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – finishing up …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    // ── Configuration ─────────────────────────────────────────────────────
    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    // ── Model server discovery ────────────────────────────────────────────
    print!("\n  Probing model server at {} … ", cfg.llm_base_url.dimmed());
    std::io::stdout().flush().ok();
    match models::fetch_models(&cfg.llm_base_url, &cfg.api_key) {
        Ok(served) if models::is_served(&served, &cfg.active_model) => {
            println!("{} (model {} available)", "online".green(), cfg.active_model.bold());
        }
        Ok(served) => {
            println!("{}", "online".green());
            println!(
                "  {} '{}' is not served ({} model(s) found); consolidation will archive without extracting facts.",
                "Warning:".yellow(),
                cfg.active_model,
                served.len()
            );
        }
        Err(_) => {
            println!("{}", "offline".yellow());
            println!(
                "  {}",
                "Messages are still recorded; consolidation will archive them without extracting facts."
                    .dimmed()
            );
        }
    }

    // ── Memory core ───────────────────────────────────────────────────────
    let registry = match TenantRegistry::new(&cfg.data_dir) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            error!(error = %e, "cannot open data directory");
            println!("{}: {}", "Fatal".red().bold(), e);
            std::process::exit(1);
        }
    };

    let mut driver = LlmDriver::new(cfg.llm_base_url.clone(), cfg.active_model.clone());
    if !cfg.api_key.is_empty() {
        driver = driver.with_api_key(cfg.api_key.expose());
    }
    let oracle = Arc::new(LlmOracle::with_driver(driver));
    let pipeline = Arc::new(ConsolidationPipeline::new(
        Arc::clone(&registry),
        oracle.clone(),
        oracle,
        cfg.consolidation(),
    ));

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            println!("{}: {}", "Fatal: cannot start async runtime".red().bold(), e);
            std::process::exit(1);
        }
    };
    info!(data_dir = %cfg.data_dir.display(), model = %cfg.active_model, "tavern ready");

    println!(
        "  Data directory: {}",
        cfg.data_dir.display().to_string().bold()
    );
    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    // ── Interactive REPL ──────────────────────────────────────────────────
    let session = repl::Session::new(runtime, registry, pipeline, cfg);
    repl::run(&session, shutdown);
    session.shutdown();
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"  ______                          "#.bold().cyan());
    println!("{}", r#" /_  __/___ __   _____  _________ "#.bold().cyan());
    println!("{}", r#"  / / / __ `/ | / / _ \/ ___/ __ \"#.bold().cyan());
    println!("{}", r#" / / / /_/ /| |/ /  __/ /  / / / /"#.bold().cyan());
    println!("{}", r#"/_/  \__,_/ |___/\___/_/  /_/ /_/ "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "Tavern".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Multi-tenant conversational memory");
    println!();
}
