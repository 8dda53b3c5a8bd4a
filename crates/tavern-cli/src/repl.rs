//! REPL – the Tavern administrative shell.
//!
//! Supported slash-commands:
//!   /activate <tenant> <name…>                       – resolve (create) a tenant
//!   /say <tenant> <author_id> <author_name> <text…>  – append a message
//!   /consolidate <tenant>                            – run consolidation now
//!   /facts <tenant> [user]                           – list long-term facts
//!   /status <tenant>                                 – counters and run state
//!   /archives <tenant>                               – list archive artifacts
//!   /models                                          – list served models
//!   /help                                            – show this list
//!   /quit | /exit                                    – exit the shell

use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tavern_memory::TenantRegistry;
use tavern_memory::validation::{validate_display_name, validate_message};
use tavern_runtime::{ConsolidationPipeline, TriggerOutcome};
use tavern_types::{ConsolidationReport, Fact, RunState, ShortTermRecord, TenantId};
use tokio::runtime::Runtime;
use tracing::{info, warn};

use crate::config::Config;
use crate::models;

// ─────────────────────────────────────────────────────────────────────────────
// Command parsing
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Activate {
        tenant: TenantId,
        name: String,
    },
    Say {
        tenant: TenantId,
        author_id: String,
        author_name: String,
        text: String,
    },
    Consolidate(TenantId),
    Facts {
        tenant: TenantId,
        user: Option<String>,
    },
    Status(TenantId),
    Archives(TenantId),
    Models,
    Help,
    Quit,
}

/// Split off the first whitespace-delimited word.
fn next_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], s[i..].trim_start()),
        None => (s, ""),
    }
}

fn tenant_arg(raw: &str, usage: &str) -> Result<TenantId, String> {
    if raw.is_empty() {
        return Err(format!("usage: {usage}"));
    }
    TenantId::new(raw).map_err(|e| e.to_string())
}

pub fn parse(line: &str) -> Result<Command, String> {
    let (cmd, rest) = next_word(line);
    match cmd {
        "/activate" => {
            const USAGE: &str = "/activate <tenant> <name…>";
            let (tenant, name) = next_word(rest);
            let tenant = tenant_arg(tenant, USAGE)?;
            if name.is_empty() {
                return Err(format!("usage: {USAGE}"));
            }
            Ok(Command::Activate {
                tenant,
                name: name.trim_end().to_string(),
            })
        }
        "/say" => {
            const USAGE: &str = "/say <tenant> <author_id> <author_name> <text…>";
            let (tenant, rest) = next_word(rest);
            let (author_id, rest) = next_word(rest);
            let (author_name, text) = next_word(rest);
            let tenant = tenant_arg(tenant, USAGE)?;
            if author_id.is_empty() || author_name.is_empty() {
                return Err(format!("usage: {USAGE}"));
            }
            Ok(Command::Say {
                tenant,
                author_id: author_id.to_string(),
                author_name: author_name.to_string(),
                text: text.trim_end().to_string(),
            })
        }
        "/consolidate" => Ok(Command::Consolidate(tenant_arg(rest.trim(), "/consolidate <tenant>")?)),
        "/facts" => {
            let (tenant, user) = next_word(rest);
            let user = user.trim();
            Ok(Command::Facts {
                tenant: tenant_arg(tenant, "/facts <tenant> [user]")?,
                user: (!user.is_empty()).then(|| user.to_string()),
            })
        }
        "/status" => Ok(Command::Status(tenant_arg(rest.trim(), "/status <tenant>")?)),
        "/archives" => Ok(Command::Archives(tenant_arg(rest.trim(), "/archives <tenant>")?)),
        "/models" => Ok(Command::Models),
        "/help" => Ok(Command::Help),
        "/quit" | "/exit" => Ok(Command::Quit),
        other => Err(format!("Unknown command: '{other}'")),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// Everything a command needs: the runtime, the registry and the pipeline.
pub struct Session {
    runtime: Runtime,
    registry: Arc<TenantRegistry>,
    pipeline: Arc<ConsolidationPipeline>,
    config: Config,
}

impl Session {
    pub fn new(
        runtime: Runtime,
        registry: Arc<TenantRegistry>,
        pipeline: Arc<ConsolidationPipeline>,
        config: Config,
    ) -> Self {
        Self {
            runtime,
            registry,
            pipeline,
            config,
        }
    }

    /// Give background consolidation runs a moment to finish.
    pub fn shutdown(self) {
        self.runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    }
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(session: &Session, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "tavern>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse(line) {
            Ok(Command::Quit) => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Ok(command) => dispatch(session, command),
            Err(e) => println!(
                "{} Type {} for available commands.",
                e.red(),
                "/help".bold()
            ),
        }
    }
}

fn dispatch(session: &Session, command: Command) {
    match command {
        Command::Activate { tenant, name } => cmd_activate(session, &tenant, &name),
        Command::Say {
            tenant,
            author_id,
            author_name,
            text,
        } => cmd_say(session, &tenant, author_id, author_name, text),
        Command::Consolidate(tenant) => cmd_consolidate(session, &tenant),
        Command::Facts { tenant, user } => cmd_facts(session, &tenant, user.as_deref()),
        Command::Status(tenant) => cmd_status(session, &tenant),
        Command::Archives(tenant) => cmd_archives(session, &tenant),
        Command::Models => cmd_models(&session.config),
        Command::Help => cmd_help(),
        Command::Quit => {}
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "Tavern Commands".bold().underline());
    println!("  {}  – create or reopen a tenant", "/activate <tenant> <name…>".bold().cyan());
    println!("  {}  – append a message", "/say <tenant> <author_id> <author_name> <text…>".bold().cyan());
    println!("  {}  – consolidate now", "/consolidate <tenant>".bold().cyan());
    println!("  {}  – list long-term facts", "/facts <tenant> [user]".bold().cyan());
    println!("  {}  – counters and run state", "/status <tenant>".bold().cyan());
    println!("  {}  – list archive artifacts", "/archives <tenant>".bold().cyan());
    println!("  {}  – list served models", "/models".bold().cyan());
    println!("  {}  – exit the shell", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_activate(session: &Session, tenant: &TenantId, name: &str) {
    if let Err(e) = validate_display_name(name) {
        println!("{}: {}", "Invalid name".red(), e);
        return;
    }
    match session.registry.resolve(tenant, name) {
        Ok(store) => println!(
            "{} tenant {} at {}",
            "✓ Activated".green(),
            tenant.to_string().bold(),
            store.dir().display().to_string().dimmed()
        ),
        Err(e) => println!("{}: {}", "Activation failed".red(), e),
    }
}

fn cmd_say(session: &Session, tenant: &TenantId, author_id: String, author_name: String, text: String) {
    let Some(store) = session.registry.get(tenant) else {
        println!("{} '{}'. Run {} first.", "Tenant not active:".red(), tenant, "/activate".bold());
        return;
    };
    if let Err(e) = validate_display_name(&author_name).and_then(|()| validate_message(&text)) {
        println!("{}: {}", "Rejected".red(), e);
        return;
    }

    let record = ShortTermRecord {
        message_id: uuid::Uuid::new_v4().to_string(),
        author_id,
        author_display_name: author_name,
        directed_at_assistant: text.to_lowercase().contains("@tavern"),
        text,
        timestamp: Utc::now(),
    };
    if let Err(e) = store.short_term().append(&record) {
        println!("{}: {}", "Append failed".red(), e);
        return;
    }

    // Spawning requires the runtime context.
    let _guard = session.runtime.enter();
    match session.pipeline.on_message_appended(tenant) {
        Ok(TriggerOutcome::Scheduled(_)) => {
            info!(tenant = %tenant, "automatic consolidation scheduled");
            println!("{}", "  ↻ ceiling reached – consolidation scheduled".yellow());
        }
        Ok(TriggerOutcome::Coalesced | TriggerOutcome::BelowThreshold) => {}
        Err(e) => warn!(tenant = %tenant, error = %e, "threshold check failed"),
    }
}

fn cmd_consolidate(session: &Session, tenant: &TenantId) {
    let outcome = {
        let _guard = session.runtime.enter();
        session.pipeline.request_consolidation(tenant)
    };
    match outcome {
        Ok(TriggerOutcome::Scheduled(handle)) => {
            println!("{} for tenant {} …", "Consolidation requested".green(), tenant.to_string().bold());
            match session.runtime.block_on(handle) {
                Ok(Ok(report)) => print_report(&report),
                Ok(Err(e)) => println!("{}: {}", "Consolidation failed".red(), e),
                Err(e) => println!("{}: {}", "Consolidation task aborted".red(), e),
            }
        }
        Ok(TriggerOutcome::Coalesced) => println!(
            "{} a run is already active for {}; it will re-check when done.",
            "Consolidation requested:".green(),
            tenant.to_string().bold()
        ),
        Ok(TriggerOutcome::BelowThreshold) => {}
        Err(e) => println!("{}: {}", "Error".red(), e),
    }
}

fn cmd_facts(session: &Session, tenant: &TenantId, user: Option<&str>) {
    let Some(store) = session.registry.get(tenant) else {
        println!("{} '{}'", "Tenant not active:".red(), tenant);
        return;
    };
    let facts = match user {
        Some(user) => store.facts().facts_for_user(user, true),
        None => store.facts().all_active(),
    };
    match facts {
        Ok(facts) if facts.is_empty() => println!("  {}", "no facts".dimmed()),
        Ok(facts) => {
            println!("{}", "Long-term facts".bold().underline());
            for fact in &facts {
                print_fact(fact);
            }
        }
        Err(e) => println!("{}: {}", "Error".red(), e),
    }
}

fn cmd_status(session: &Session, tenant: &TenantId) {
    let Some(store) = session.registry.get(tenant) else {
        println!("{} '{}'", "Tenant not active:".red(), tenant);
        return;
    };
    let stats = match store.stats() {
        Ok(s) => s,
        Err(e) => {
            println!("{}: {}", "Error".red(), e);
            return;
        }
    };
    let state = match store.gate().state() {
        RunState::Idle => "idle".green().to_string(),
        RunState::Running => "running".yellow().to_string(),
        RunState::Failed { reason } => format!("{} ({})", "failed".red(), reason),
    };
    println!("{} {}", "Tenant".bold().underline(), tenant.to_string().bold());
    println!("  Name              : {}", store.display_name());
    println!(
        "  Short-term        : {} / {}",
        stats.short_term_records,
        session.pipeline.config().ceiling
    );
    println!("  Facts (active)    : {}", stats.active_facts);
    println!("  Facts (superseded): {}", stats.superseded_facts);
    println!("  Archives          : {}", stats.archives);
    println!("  Consolidation     : {}", state);
}

fn cmd_archives(session: &Session, tenant: &TenantId) {
    let Some(store) = session.registry.get(tenant) else {
        println!("{} '{}'", "Tenant not active:".red(), tenant);
        return;
    };
    let archive = store.archive();
    match archive.list() {
        Ok(ids) if ids.is_empty() => println!("  {}", "no archives".dimmed()),
        Ok(ids) => {
            println!("{}", "Archives".bold().underline());
            for id in &ids {
                match archive.load(id) {
                    Ok(batch) => println!(
                        "  {}  {} message(s)  {}",
                        id.to_string().bold(),
                        batch.record_count,
                        batch.archived_at.to_rfc3339().dimmed()
                    ),
                    Err(e) => println!("  {}  {}", id.to_string().bold(), e.to_string().red()),
                }
            }
        }
        Err(e) => println!("{}: {}", "Error".red(), e),
    }
}

fn cmd_models(cfg: &Config) {
    println!("{}", "Models".bold().underline());
    println!("  Active model : {}", cfg.active_model.yellow());
    print!("  Probing {} … ", cfg.llm_base_url.dimmed());
    io::stdout().flush().ok();
    match models::fetch_models(&cfg.llm_base_url, &cfg.api_key) {
        Ok(served) if served.is_empty() => println!("{}", "no models served".yellow()),
        Ok(served) => {
            println!("{}", "online".green());
            for m in &served {
                let marker = if models::is_served(std::slice::from_ref(m), &cfg.active_model) {
                    "▶"
                } else {
                    " "
                };
                println!("    {} {}", marker.green(), m.id.bold());
            }
        }
        Err(e) => {
            println!("{}", "offline".red());
            println!("  {}", e.dimmed());
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Output helpers
// ─────────────────────────────────────────────────────────────────────────────

fn print_report(report: &ConsolidationReport) {
    println!("{}", "Consolidation report".bold().underline());
    println!("  Passes            : {}", report.passes);
    println!("  Records archived  : {}", report.records_archived);
    println!("  Facts created     : {}", report.facts_created);
    println!("  Facts corroborated: {}", report.facts_corroborated);
    println!("  Facts superseded  : {}", report.facts_superseded);
    if report.candidates_skipped > 0 {
        println!("  Candidates skipped: {}", report.candidates_skipped.to_string().yellow());
    }
    for id in &report.archive_ids {
        println!("  Archive           : {}", id.to_string().dimmed());
    }
}

fn print_fact(fact: &Fact) {
    let status = if fact.is_active() {
        "active".green()
    } else {
        "superseded".dimmed()
    };
    let category = fact.category.as_deref().unwrap_or("-");
    println!(
        "  [{}] {}  {} refs:{} cat:{}  {}",
        status,
        fact.content.bold(),
        fact.source_display_name.cyan(),
        fact.reference_count,
        category,
        fact.id.to_string().dimmed()
    );
}
