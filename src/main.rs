//! Feature-queue orchestrator CLI.
//!
//! Drives an external code-generation agent through the persisted queue in
//! `<project>/.autonomous/` until every feature is verified complete or
//! permanently failed. The `tool` subcommand is the agent's back-channel
//! into the same store.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;

use foreman::core::contiguity::validate_contiguity;
use foreman::core::types::{Feature, FeatureSpec, FeatureStatus, SessionStatus};
use foreman::exit_codes;
use foreman::io::config::load_config;
use foreman::io::executor::ProcessExecutor;
use foreman::io::paths::ProjectPaths;
use foreman::io::store::Store;
use foreman::io::tools::{ToolError, handle_tool, render_stats};
use foreman::logging;
use foreman::looping::{LoopOptions, LoopStop, run_loop};
use foreman::recovery::run_recovery;
use foreman::validate::validate_store;

#[derive(Parser)]
#[command(
    name = "foreman",
    version,
    about = "Feature-queue orchestrator for autonomous coding agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drive agent sessions until the queue completes or a stop condition hits.
    Run {
        /// Target project directory (holds `.autonomous/`).
        project: PathBuf,
        /// Stop after this many sessions (default unlimited).
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Dev-server port handed to the agent (overrides config).
        #[arg(long)]
        port: Option<u16>,
        /// Model override appended to the agent command.
        #[arg(long)]
        model: Option<String>,
        /// Disable the circuit breaker for this process.
        #[arg(long)]
        force: bool,
        /// Tell the agent to run browser checks headless.
        #[arg(long)]
        headless: bool,
    },
    /// Check the category-contiguity invariant and exit.
    Validate { project: PathBuf },
    /// Print queue progress counts.
    Status {
        project: PathBuf,
        /// Break counts down per category.
        #[arg(long)]
        by_category: bool,
    },
    /// Load a feature list (JSON array) into the store.
    Ingest { project: PathBuf, file: PathBuf },
    /// Agent-facing tool dispatch; reads its target from the session
    /// environment set by `foreman run`.
    Tool {
        name: String,
        /// JSON input object; read from stdin when omitted.
        #[arg(long)]
        input: Option<String>,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            project,
            max_iterations,
            port,
            model,
            force,
            headless,
        } => cmd_run(&project, max_iterations, port, model, force, headless),
        Command::Validate { project } => cmd_validate(&project),
        Command::Status {
            project,
            by_category,
        } => cmd_status(&project, by_category),
        Command::Ingest { project, file } => cmd_ingest(&project, &file),
        Command::Tool { name, input } => cmd_tool(&name, input),
    }
}

fn cmd_run(
    project: &Path,
    max_iterations: Option<u32>,
    port: Option<u16>,
    model: Option<String>,
    force: bool,
    headless: bool,
) -> Result<i32> {
    let paths = ProjectPaths::new(project);
    let mut store = Store::open_existing(&paths.db_path)?;
    let mut config = load_config(&paths.config_path)?;
    if let Some(port) = port {
        config.port = port;
    }

    if store.feature_count()? == 0 {
        bail!("store has no features (run `foreman ingest` first)");
    }
    validate_store(&store)?;
    run_recovery(&mut store, config.stale_hours)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        if let Err(err) = ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        }) {
            eprintln!("warning: failed to set interrupt handler: {err}");
        }
    }

    let executor = ProcessExecutor::new(
        config.agent.command.clone(),
        Some(Arc::clone(&shutdown)),
    );
    let options = LoopOptions {
        max_iterations,
        force,
        model,
        headless,
    };
    let started = Instant::now();

    let outcome = run_loop(
        &mut store,
        &executor,
        &paths,
        &config,
        &options,
        &shutdown,
        |session| {
            let status = match session.status {
                SessionStatus::Completed => "ok",
                SessionStatus::Failed => "failed",
                SessionStatus::Running => "running",
            };
            println!(
                "session {:>3}  {status:<6}  {}/{} features  batch {}  first: {}",
                session.session_id,
                session.completed_total,
                session.feature_total,
                session.attempted.len(),
                session.first_feature
            );
        },
    )?;

    let stats = store.kanban_stats()?;
    println!();
    println!(
        "{} sessions, {} verified completions, ${:.2} total cost, {:.0?} elapsed",
        outcome.sessions,
        outcome.verified,
        outcome.total_cost,
        started.elapsed()
    );
    println!(
        "progress: {}/{} features completed, {} failed",
        stats.total.completed,
        stats.total.total(),
        stats.total.failed
    );
    println!("session logs: {}", paths.state_dir.display());

    match outcome.stop {
        LoopStop::Complete => {
            if stats.total.failed > 0 {
                println!(
                    "Queue drained: {} completed, {} permanently failed.",
                    stats.total.completed, stats.total.failed
                );
            } else {
                println!("All features are complete.");
            }
        }
        LoopStop::BreakerTripped {
            consecutive_failures,
        } => {
            eprintln!(
                "circuit breaker tripped after {consecutive_failures} consecutive failed sessions; \
                 fix the agent setup and run again, or pass --force to bypass"
            );
        }
        LoopStop::MaxIterationsReached { max_iterations } => {
            println!("Iteration cap ({max_iterations}) reached.");
        }
        LoopStop::Interrupted => {
            eprintln!("interrupted");
        }
    }
    if !matches!(outcome.stop, LoopStop::Complete) && store.has_incomplete()? {
        println!(
            "Incomplete — run `foreman run {}` again to continue.",
            project.display()
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_validate(project: &Path) -> Result<i32> {
    let paths = ProjectPaths::new(project);
    let store = Store::open_existing(&paths.db_path)?;
    validate_store(&store)?;
    let stats = store.kanban_stats()?;
    println!(
        "ok: {} features across {} categories, contiguous",
        stats.total.total(),
        stats.by_category.len()
    );
    Ok(exit_codes::OK)
}

fn cmd_status(project: &Path, by_category: bool) -> Result<i32> {
    let paths = ProjectPaths::new(project);
    let store = Store::open_existing(&paths.db_path)?;
    let stats = store.kanban_stats()?;
    println!("{}", render_stats(&stats, by_category));
    Ok(exit_codes::OK)
}

fn cmd_ingest(project: &Path, file: &Path) -> Result<i32> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("read feature list {}", file.display()))?;
    let mut specs: Vec<FeatureSpec> = serde_json::from_str(&raw)
        .with_context(|| format!("parse feature list {}", file.display()))?;
    specs.sort_by_key(|spec| spec.id);

    // Refuse interleaved categories up front rather than poisoning the store.
    let preview: Vec<Feature> = specs.iter().map(preview_feature).collect();
    let errors = validate_contiguity(&preview);
    if !errors.is_empty() {
        bail!(
            "feature list violates category contiguity:\n- {}",
            errors.join("\n- ")
        );
    }

    let paths = ProjectPaths::new(project);
    let mut store = Store::open(&paths.db_path)?;
    let count = store.ingest(&specs)?;
    let categories = store.kanban_stats()?.by_category.len();
    println!(
        "ingested {count} features across {categories} categories into {}",
        paths.db_path.display()
    );
    Ok(exit_codes::OK)
}

fn preview_feature(spec: &FeatureSpec) -> Feature {
    Feature {
        id: spec.id,
        name: spec.name.clone(),
        description: spec.description.clone(),
        category: spec.category.clone(),
        steps: spec.steps.clone(),
        status: FeatureStatus::Pending,
        retries: 0,
        created_at: String::new(),
        updated_at: String::new(),
    }
}

fn cmd_tool(name: &str, input: Option<String>) -> Result<i32> {
    let project_dir = std::env::var("FOREMAN_PROJECT_DIR")
        .context("FOREMAN_PROJECT_DIR is not set (tool commands run inside an agent session)")?;
    let session_id = std::env::var("FOREMAN_SESSION_ID")
        .ok()
        .and_then(|raw| raw.parse::<i64>().ok());
    let paths = ProjectPaths::new(Path::new(&project_dir));
    let config = load_config(&paths.config_path)?;
    let mut store = Store::open_existing(&paths.db_path)?;

    let raw = match input {
        Some(raw) => raw,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read tool input from stdin")?;
            buf
        }
    };
    let raw = raw.trim();
    let input: Value = if raw.is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_str(raw).context("parse tool input as JSON")?
    };

    match handle_tool(&mut store, session_id, config.max_retries, name, &input) {
        Ok(result) => {
            println!("{result}");
            Ok(exit_codes::OK)
        }
        Err(ToolError::Store(err)) => Err(err.context("tool store access")),
        Err(err @ ToolError::UnknownTool(_)) => {
            eprintln!("error: {err}");
            eprintln!("available tools: {}", foreman::io::tools::TOOL_NAMES.join(", "));
            Ok(exit_codes::INVALID)
        }
        Err(err) => {
            eprintln!("error: {err}");
            Ok(exit_codes::INVALID)
        }
    }
}
