//! `sipag`: a thin `clap` dispatcher over `sipag_core::control::Controller`.
//!
//! Exit codes follow §6: `0` success, `1` generic failure, `2` usage error
//! (clap handles this itself), `3` worker not found, `4` duplicate id, `5`
//! invalid state transition.
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

use sipag_core::config::Config;
use sipag_core::control::Controller;
use sipag_core::forge::GhForgeClient;
use sipag_core::process::RealSpawner;
use sipag_core::scheduler::CliWorktreeTool;
use sipag_core::store::FileStateStore;
use sipag_core::worker::model::WorkerRecord;
use sipag_core::OrchestratorError;

const VERSION: &str = "0.1.0";

type Ctl = Controller<FileStateStore, GhForgeClient, CliWorktreeTool, RealSpawner>;

#[derive(Parser)]
#[command(
    name = "sipag",
    about = "parallel development orchestrator",
    version = VERSION,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Spawn a new worker.
    Spawn {
        /// Worker identifier (unique while non-terminal).
        id: String,
        /// Target repository, as `owner/repo`.
        #[arg(long)]
        repo: String,
        /// Base ref the worktree branches from.
        #[arg(long, default_value = "main")]
        base: String,
        /// Task description.
        task: String,
    },

    /// List workers.
    List {
        /// Include workers in a terminal state (MERGED, STOPPED).
        #[arg(long)]
        all: bool,
    },

    /// Show detailed status for one worker.
    Status {
        id: String,
    },

    /// Send a message to a worker's stdin.
    Send {
        id: String,
        message: String,
    },

    /// Read the tail of a worker's output log.
    Read {
        id: String,
        #[arg(long)]
        lines: Option<usize>,
    },

    /// Gracefully stop a worker.
    Stop {
        id: String,
    },

    /// Manually trigger a merge (valid from PR_OPEN or REVIEWING).
    Merge {
        id: String,
    },

    /// Remove a terminal worker, or sweep all workers past the configured
    /// max age when no id is given.
    Cleanup {
        id: Option<String>,
    },

    /// Run scheduler ticks in the foreground until interrupted.
    Run,

    /// Print version.
    Version,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if matches!(cli.command, Commands::Version) {
        println!("sipag {VERSION}");
        return ExitCode::SUCCESS;
    }

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(1);
        }
    };

    let controller = match build_controller(config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(1);
        }
    };

    match run(&controller, cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn build_controller(config: Config) -> Result<Ctl> {
    let worktrees = CliWorktreeTool::new(config.worktree_bin.clone(), config.worktrees_root.clone());
    Controller::new(
        FileStateStore::new(config.state_root.clone()),
        GhForgeClient::default(),
        worktrees,
        RealSpawner,
        config,
    )
}

fn exit_code_for(e: &anyhow::Error) -> u8 {
    e.downcast_ref::<OrchestratorError>()
        .map(|oe| oe.exit_code() as u8)
        .unwrap_or(1)
}

fn run(ctl: &Ctl, command: Commands) -> Result<()> {
    match command {
        Commands::Version => unreachable!("handled in main before controller construction"),
        Commands::Spawn { id, repo, base, task } => cmd_spawn(ctl, &id, &repo, &base, &task),
        Commands::List { all } => cmd_list(ctl, all),
        Commands::Status { id } => cmd_status(ctl, &id),
        Commands::Send { id, message } => ctl.send(&id, &message),
        Commands::Read { id, lines } => cmd_read(ctl, &id, lines),
        Commands::Stop { id } => ctl.stop_worker(&id),
        Commands::Merge { id } => cmd_merge(ctl, &id),
        Commands::Cleanup { id } => cmd_cleanup(ctl, id.as_deref()),
        Commands::Run => cmd_run(ctl),
    }
}

fn cmd_spawn(ctl: &Ctl, id: &str, repo: &str, base: &str, task: &str) -> Result<()> {
    let record = ctl.spawn(id, repo, base, task)?;
    println!("Spawned worker '{}' in {} (branch {})", record.id, record.repo, record.branch);
    Ok(())
}

fn cmd_list(ctl: &Ctl, all: bool) -> Result<()> {
    let mut workers = ctl.list(all)?;
    workers.sort_by(|a, b| a.id.cmp(&b.id));
    if workers.is_empty() {
        println!("No workers.");
        return Ok(());
    }
    for w in &workers {
        println!("{:<20} {:<14} {}", w.id, w.state, pr_summary(w));
    }
    Ok(())
}

fn pr_summary(w: &WorkerRecord) -> String {
    match &w.pr_url {
        Some(url) => url.clone(),
        None => "-".to_string(),
    }
}

fn cmd_status(ctl: &Ctl, id: &str) -> Result<()> {
    let w = ctl.status(id)?;
    println!("id:             {}", w.id);
    println!("repo:           {}", w.repo);
    println!("branch:         {}", w.branch);
    println!("task:           {}", w.task);
    println!("state:          {}", w.state);
    println!("pid:            {}", w.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()));
    println!("pr:             {}", w.pr_url.clone().unwrap_or_else(|| "-".to_string()));
    println!("review_status:  {:?}", w.review_status);
    println!(
        "agents_run:     {}",
        w.agents_run.iter().map(|g| g.as_str()).collect::<Vec<_>>().join(", ")
    );
    println!("last_activity:  {}", w.last_activity.to_rfc3339());
    println!("needs_attach:   {}", w.needs_attach);
    println!("error:          {}", w.error.clone().unwrap_or_else(|| "-".to_string()));
    Ok(())
}

fn cmd_read(ctl: &Ctl, id: &str, lines: Option<usize>) -> Result<()> {
    for line in ctl.read(id, lines)? {
        println!("{line}");
    }
    Ok(())
}

fn cmd_merge(ctl: &Ctl, id: &str) -> Result<()> {
    ctl.merge(id)?;
    println!("Merge triggered for '{id}'.");
    Ok(())
}

fn cmd_cleanup(ctl: &Ctl, id: Option<&str>) -> Result<()> {
    let removed = ctl.cleanup(id)?;
    println!("Removed {removed} worker(s).");
    Ok(())
}

fn cmd_run(ctl: &Ctl) -> Result<()> {
    ctl.start();
    println!("sipag scheduler running (ctrl-c to stop)...");
    loop {
        std::thread::sleep(std::time::Duration::from_secs(3600));
    }
}
