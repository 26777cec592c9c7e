//! # Cascade — Tenant-Scoped Automation Engine
//!
//! Events in, rules matched, actions guaranteed to run.
//!
//! Usage:
//!   cascade run                          # Start the engine loops
//!   cascade submit --tenant acme \
//!     --event-type Invoice.Overdue --payload '{"days_overdue": 35}'
//!   cascade rules list --tenant acme
//!   cascade preview --rule rule.json \
//!     --event-type Invoice.Overdue --payload '{"days_overdue": 35}'

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cascade_core::CascadeConfig;
use cascade_engine::actions::register_builtin;
use cascade_engine::dispatcher::run_dispatcher_loop;
use cascade_engine::scheduler::run_scheduler_loop;
use cascade_engine::worker::run_worker_loop;
use cascade_engine::{
    ActionCatalog, ActionDispatcher, Db, EngineWorker, Event, EventStore, ExecutionLog, JobQueue,
    NewEvent, Rule, RuleRegistry, Scheduler, ThrottleController,
};

#[derive(Parser)]
#[command(
    name = "cascade",
    version,
    about = "⚙️ Cascade — Tenant-Scoped Automation Engine"
)]
struct Cli {
    /// Path to config file (default: ~/.cascade/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the engine: event workers, dispatchers, and the scheduler
    Run,

    /// Submit a domain event
    Submit {
        #[arg(short, long)]
        tenant: String,
        /// Event type, e.g. Invoice.Overdue
        #[arg(short, long)]
        event_type: String,
        /// JSON payload
        #[arg(short, long, default_value = "{}")]
        payload: String,
        /// Producer dedupe key (same key = same event)
        #[arg(long)]
        dedupe_key: Option<String>,
        #[arg(long)]
        correlation_id: Option<String>,
    },

    /// Manage automation rules
    Rules {
        #[command(subcommand)]
        command: RuleCommands,
    },

    /// Dry-run a rule definition against a hypothetical event
    Preview {
        /// Path to a rule definition (JSON)
        #[arg(short, long)]
        rule: PathBuf,
        #[arg(short, long)]
        event_type: String,
        #[arg(short, long, default_value = "{}")]
        payload: String,
    },

    /// List recent jobs for a tenant
    Jobs {
        #[arg(short, long)]
        tenant: String,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Requeue a dead-lettered job
    RetryDead {
        job_id: String,
    },

    /// Show recent execution log entries for a tenant
    Log {
        #[arg(short, long)]
        tenant: String,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Queue depth and unprocessed-event counts
    Stats,

    /// List registered action types
    Actions,
}

#[derive(Subcommand)]
enum RuleCommands {
    /// Create or replace a rule from a JSON file
    Save {
        /// Path to the rule definition
        file: PathBuf,
    },
    /// List a tenant's rules
    List {
        #[arg(short, long)]
        tenant: String,
    },
    /// Enable a rule
    Enable { rule_id: String },
    /// Disable a rule (takes effect on the next event)
    Disable { rule_id: String },
    /// Delete a rule
    Delete { rule_id: String },
}

/// Everything the subcommands need, wired onto one database handle.
struct Engine {
    config: CascadeConfig,
    store: EventStore,
    registry: RuleRegistry,
    throttle: ThrottleController,
    queue: JobQueue,
    catalog: Arc<ActionCatalog>,
    log: ExecutionLog,
}

impl Engine {
    fn open(config: CascadeConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;
        let db = Db::open(&config.db_path())?;

        let catalog = Arc::new(ActionCatalog::new());
        register_builtin(&catalog, config.dispatch.action_timeout_secs);

        Ok(Self {
            store: EventStore::new(db.clone()).with_max_attempts(config.engine.event_max_attempts),
            registry: RuleRegistry::new(db.clone()),
            throttle: ThrottleController::new(db.clone()),
            queue: JobQueue::new(
                db.clone(),
                config.dispatch.backoff_base_secs,
                config.dispatch.backoff_cap_secs,
            ),
            catalog,
            log: ExecutionLog::new(db),
            config,
        })
    }

    fn worker(&self, id: usize) -> EngineWorker {
        EngineWorker::new(
            &format!("worker-{id}"),
            self.store.clone(),
            self.registry.clone(),
            self.throttle.clone(),
            self.queue.clone(),
            self.catalog.clone(),
            self.log.clone(),
            self.config.engine.claim_batch_size,
            self.config.engine.lease_secs,
            self.config.dispatch.max_attempts,
        )
    }

    fn dispatcher(&self, id: usize) -> ActionDispatcher {
        ActionDispatcher::new(
            &format!("dispatch-{id}"),
            self.queue.clone(),
            self.catalog.clone(),
            self.log.clone(),
            self.config.dispatch.claim_batch_size,
            self.config.dispatch.lease_secs,
            self.config.dispatch.action_timeout_secs,
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "cascade=debug,cascade_engine=debug"
    } else {
        "cascade=info,cascade_engine=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => CascadeConfig::load_from(path)?,
        None => CascadeConfig::load()?,
    };
    let engine = Engine::open(config)?;

    match cli.command {
        Commands::Run => run(engine).await,
        Commands::Submit {
            tenant,
            event_type,
            payload,
            dedupe_key,
            correlation_id,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("payload is not valid JSON")?;
            let mut event = NewEvent::domain(&tenant, &event_type, payload);
            if let Some(key) = &dedupe_key {
                event = event.with_dedupe_key(key);
            }
            if let Some(cid) = &correlation_id {
                event = event.with_correlation_id(cid);
            }
            let id = engine.store.submit(event)?;
            println!("📨 Event accepted: {id}");
            Ok(())
        }
        Commands::Rules { command } => rules(engine, command),
        Commands::Preview {
            rule,
            event_type,
            payload,
        } => preview(engine, &rule, &event_type, &payload),
        Commands::Jobs { tenant, limit } => {
            for job in engine.queue.list(&tenant, limit)? {
                println!(
                    "{}  {:9}  {}  attempts {}/{}  {}",
                    job.id,
                    job.status.as_str(),
                    job.action_type,
                    job.attempts,
                    job.max_attempts,
                    job.last_error.as_deref().unwrap_or("-"),
                );
            }
            Ok(())
        }
        Commands::RetryDead { job_id } => {
            if engine.queue.retry_dead(&job_id)? {
                println!("♻️ Job {job_id} requeued");
            } else {
                println!("⚠️ Job {job_id} is not dead-lettered (or does not exist)");
            }
            Ok(())
        }
        Commands::Log { tenant, limit } => {
            for entry in engine.log.recent(&tenant, limit)? {
                println!(
                    "{}  {:9}  rule={}  event={}  {}",
                    entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.outcome.as_str(),
                    entry.rule_id.as_deref().unwrap_or("-"),
                    entry.event_id.as_deref().unwrap_or("-"),
                    entry
                        .error
                        .as_deref()
                        .or(entry.detail.as_deref())
                        .unwrap_or(""),
                );
            }
            Ok(())
        }
        Commands::Stats => {
            let stats = engine.queue.stats()?;
            println!("📊 Events unprocessed: {}", engine.store.unprocessed_count()?);
            println!(
                "📊 Jobs: {} queued, {} running, {} succeeded, {} dead",
                stats.queued, stats.running, stats.succeeded, stats.dead
            );
            Ok(())
        }
        Commands::Actions => {
            for entry in engine.catalog.list() {
                let state = if entry.is_active { "active" } else { "inactive" };
                println!("{:24}  {:8}  {}", entry.action_type, state, entry.description);
            }
            Ok(())
        }
    }
}

/// Start all loops and run until Ctrl-C.
async fn run(engine: Engine) -> Result<()> {
    println!("⚙️ Cascade v{}", env!("CARGO_PKG_VERSION"));
    println!("   Database: {}", engine.config.db_path().display());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut handles = Vec::new();

    for i in 0..engine.config.engine.workers.max(1) {
        handles.push(tokio::spawn(run_worker_loop(
            Arc::new(engine.worker(i)),
            engine.config.engine.poll_secs,
            shutdown_rx.clone(),
        )));
    }
    for i in 0..engine.config.dispatch.workers.max(1) {
        handles.push(tokio::spawn(run_dispatcher_loop(
            Arc::new(engine.dispatcher(i)),
            engine.config.dispatch.poll_secs,
            shutdown_rx.clone(),
        )));
    }
    handles.push(tokio::spawn(run_scheduler_loop(
        Arc::new(Scheduler::new(engine.registry.clone(), engine.store.clone())),
        engine.config.scheduler.tick_secs,
        shutdown_rx.clone(),
    )));

    tokio::signal::ctrl_c().await?;
    println!("\n🛑 Shutting down...");
    shutdown_tx.send(true).ok();
    for handle in handles {
        handle.await.ok();
    }
    Ok(())
}

fn rules(engine: Engine, command: RuleCommands) -> Result<()> {
    match command {
        RuleCommands::Save { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let rule: Rule = serde_json::from_str(&content).context("rule is not valid JSON")?;
            engine.registry.save(&rule, &engine.catalog)?;
            println!("✅ Rule saved: {} ({})", rule.name, rule.id);
            Ok(())
        }
        RuleCommands::List { tenant } => {
            for rule in engine.registry.list(&tenant)? {
                let state = if rule.enabled { "enabled" } else { "disabled" };
                println!("{}  {:8}  {}", rule.id, state, rule.name);
            }
            Ok(())
        }
        RuleCommands::Enable { rule_id } => toggle(&engine, &rule_id, true),
        RuleCommands::Disable { rule_id } => toggle(&engine, &rule_id, false),
        RuleCommands::Delete { rule_id } => {
            if engine.registry.delete(&rule_id)? {
                println!("🗑️ Rule {rule_id} deleted");
            } else {
                println!("⚠️ No rule {rule_id}");
            }
            Ok(())
        }
    }
}

fn toggle(engine: &Engine, rule_id: &str, enabled: bool) -> Result<()> {
    if engine.registry.set_enabled(rule_id, enabled)? {
        println!("✅ Rule {rule_id} {}", if enabled { "enabled" } else { "disabled" });
    } else {
        println!("⚠️ No rule {rule_id}");
    }
    Ok(())
}

/// Evaluate a rule against a hypothetical event without storing anything.
fn preview(engine: Engine, rule_file: &PathBuf, event_type: &str, payload: &str) -> Result<()> {
    let content = std::fs::read_to_string(rule_file)
        .with_context(|| format!("reading {}", rule_file.display()))?;
    let rule: Rule = serde_json::from_str(&content).context("rule is not valid JSON")?;
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("payload is not valid JSON")?;
    let event = Event::synthetic(&rule.tenant_id, event_type, payload);

    let result = engine.worker(0).preview(&rule, &event)?;
    println!("🔍 Preview: {} vs {}", rule.name, event_type);
    println!("   matches trigger:  {}", result.matches_trigger);
    match (result.condition_passed, &result.condition_error) {
        (Some(passed), _) => println!("   condition passed: {passed}"),
        (None, Some(err)) => println!("   condition error:  {err}"),
        (None, None) => println!("   condition passed: (no conditions)"),
    }
    println!("   throttle admits:  {}", result.throttle_would_admit);
    println!("   would fire:       {}", result.would_fire);
    for action in &result.actions {
        match &action.config_error {
            Some(err) => println!("   ❌ {}: {err}", action.action_type),
            None => println!(
                "   ▶ {}: {}",
                action.action_type,
                serde_json::to_string(&action.resolved_params)?
            ),
        }
    }
    Ok(())
}
