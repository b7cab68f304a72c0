use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use kiln::charter::Charter;
use kiln::config::Config;
use kiln::freeze::FreezeRegistry;
use kiln::oracle::CommandOracle;
use kiln::orchestration::{
    build_plan, render_plan, AttemptExecutor, ExecutorSettings, OpenAiCompatible, Orchestrator,
    SchedulerEvent,
};
use kiln::report::{write_fingerprint_file, write_public_interfaces, RunReport};
use kiln::store::{ResumeOptions, RunStore};
use kiln::workspace::Workspace;
use kiln::{klog, klog_warn, Result};

/// kiln - contract-first code generation from a Charter
#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    KILN_DEBUG=1        Enable debug logging (alternative to --debug, or \"trace\")\n    KILN_MAX_RETRIES    Override max_retries\n    OPENAI_API_BASE     Backend base URL\n    OPENAI_API_KEY      Backend API key\n    MODEL_NAME          Backend model")]
pub struct Cli {
    /// Enable debug logging (writes to <state_dir>/kiln.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Configuration file (defaults to ./kiln.toml when present)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Print the task plan for a Charter
    Plan {
        #[arg(long)]
        charter: PathBuf,
    },

    /// Generate, validate and freeze every module of a Charter
    Run {
        #[arg(long)]
        charter: PathBuf,

        /// Discard saved task progress (freeze records are kept)
        #[arg(long)]
        fresh: bool,

        /// Start a module over even if it completed (repeatable)
        #[arg(long, value_name = "MODULE")]
        regenerate: Vec<String>,

        /// Maximum attempts per task
        #[arg(long)]
        max_retries: Option<u32>,

        /// Concurrent attempts
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Show saved task progress and freeze records
    Status,

    /// Rewrite the public interfaces document from the freeze registry
    Apis,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    kiln::log::init_in(&config.state_path(), cli.debug);
    klog!("kiln {:?}", cli.command);

    match cli.command {
        Command::Plan { charter } => run_plan(&config, &charter),
        Command::Run {
            charter,
            fresh,
            regenerate,
            max_retries,
            workers,
        } => {
            let mut config = config;
            if let Some(n) = max_retries {
                config.max_retries = n;
            }
            if let Some(n) = workers {
                config.workers = n;
            }
            config.validate()?;
            run_charter(&config, &charter, ResumeOptions { fresh, regenerate })
        }
        Command::Status => run_status(&config),
        Command::Apis => run_apis(&config),
    }
}

fn run_plan(config: &Config, charter: &Path) -> Result<()> {
    let charter = Charter::load(charter)?;
    let dag = build_plan(&charter)?;
    let store = RunStore::open(&config.state_path())?;
    store.save_plan(&dag)?;

    println!(
        "Charter {}: {} modules, {} tasks ({} compatibility)",
        charter.name,
        charter.modules.len(),
        dag.task_count(),
        charter.compatibility
    );
    println!();
    print!("{}", render_plan(&dag));
    Ok(())
}

fn run_charter(config: &Config, charter_path: &Path, options: ResumeOptions) -> Result<()> {
    let charter = Charter::load(charter_path)?;
    let mut dag = build_plan(&charter)?;

    let state = config.state_path();
    let store = RunStore::open(&state)?;
    let restored = store.prepare(&mut dag, &options)?;
    if !restored.is_empty() {
        println!("Resuming: {} task(s) restored from {}", restored.len(), state.display());
    }

    let registry = Arc::new(FreezeRegistry::open(&state)?);
    let generator = Arc::new(
        OpenAiCompatible::new(config.backend.clone())?.with_reply_dir(state.join("replies")),
    );
    let mut oracle = CommandOracle::new(
        &config.workspace_root,
        charter.language,
        config.oracle.clone(),
        config.oracle_timeout(),
    );
    if let Some(name) = config.state_dir.file_name().and_then(|n| n.to_str()) {
        oracle = oracle.excluding(name);
    }
    let executor = AttemptExecutor::new(
        generator,
        Arc::new(oracle),
        Arc::clone(&registry),
        Workspace::new(&config.workspace_root),
        charter.compatibility.policy(),
        charter.language,
    )
    .with_settings(ExecutorSettings::from_config(config));

    println!(
        "Running {} ({} tasks, {} workers, model {})",
        charter.name,
        dag.task_count(),
        config.workers,
        config.backend.model
    );

    let (event_tx, event_rx) = mpsc::channel(64);
    let orchestrator = Orchestrator::new(Arc::new(executor), config.workers)
        .with_store(store)
        .with_events(event_tx);

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let cancel = orchestrator.cancel_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupted: letting running attempts finish...");
                cancel.cancel();
            }
        });
        let printer = tokio::spawn(print_events(event_rx));

        let result = orchestrator.run(dag, config.max_retries).await;
        drop(orchestrator);
        let _ = printer.await;
        result
    })?;

    write_outputs(config, &report)?;
    println!();
    print!("{}", report);
    if !report.is_complete() {
        println!();
        match kiln::log::log_path() {
            Some(log) => println!(
                "Not every module was frozen. Re-run to resume, or see {}",
                log.display()
            ),
            None => println!("Not every module was frozen. Re-run to resume."),
        }
    }
    Ok(())
}

async fn print_events(mut events: mpsc::Receiver<SchedulerEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SchedulerEvent::TaskStarted { task, attempt } => {
                println!("  -> {} (attempt {})", task, attempt);
            }
            SchedulerEvent::TaskRetrying { task, next_attempt } => {
                println!("  !! {} failed, retrying (attempt {})", task, next_attempt);
            }
            SchedulerEvent::TaskSucceeded { task } => println!("  ok {}", task),
            SchedulerEvent::TaskFrozen { task, version } => {
                println!("  ** {} frozen at v{}", task, version);
            }
            SchedulerEvent::TaskAbandoned { task, reason } => {
                println!("  xx {} abandoned: {}", task, reason);
            }
            SchedulerEvent::TaskBlocked { task, reason } => {
                println!("  -- {} blocked: {}", task, reason);
            }
            SchedulerEvent::AttemptFinished { .. } | SchedulerEvent::RunFinished { .. } => {}
        }
    }
}

fn write_outputs(config: &Config, report: &RunReport) -> Result<()> {
    let doc = config.public_api_doc_path();
    write_public_interfaces(&doc, &report.frozen)?;
    write_fingerprint_file(&config.fingerprint_path(), &report.frozen)?;
    klog!("public interfaces written to {}", doc.display());
    Ok(())
}

fn run_status(config: &Config) -> Result<()> {
    let state = config.state_path();
    let store = RunStore::open(&state)?;
    let registry = FreezeRegistry::open(&state)?;

    match store.load_snapshot()? {
        Some(snapshot) => {
            println!(
                "Saved progress ({}):",
                snapshot.saved_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
            for task in &snapshot.tasks {
                println!(
                    "  {:<28} {} ({} attempt(s))",
                    task.id.to_string(),
                    task.status,
                    task.attempt_count()
                );
            }
        }
        None => println!("No saved progress in {}", state.display()),
    }

    let rt = tokio::runtime::Runtime::new()?;
    let records = rt.block_on(registry.records());
    println!();
    if records.is_empty() {
        println!("No interfaces frozen.");
    } else {
        println!("Frozen interfaces:");
        for record in &records {
            println!(
                "  {:<20} v{:<4} {}",
                record.module,
                record.version,
                record.fingerprint.short()
            );
        }
    }
    Ok(())
}

fn run_apis(config: &Config) -> Result<()> {
    let state = config.state_path();
    let registry = FreezeRegistry::open(&state)?;
    let rt = tokio::runtime::Runtime::new()?;
    let records = rt.block_on(registry.records());
    if records.is_empty() {
        klog_warn!("no freeze records in {}", state.display());
    }

    let doc = config.public_api_doc_path();
    write_public_interfaces(&doc, &records)?;
    write_fingerprint_file(&config.fingerprint_path(), &records)?;
    println!("Wrote {} ({} module(s))", doc.display(), records.len());
    Ok(())
}
