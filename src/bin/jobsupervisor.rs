//! jobsupervisor — a thin CLI demonstrating the `job_supervisor` library.
//!
//! Not the crate's main interface; embedding hosts are expected to depend on
//! the library and call [`job_supervisor::JobManager`] directly. This binary
//! exists for manual poking and for the crate's own integration coverage.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use job_supervisor::{JobFilter, JobManager, JobStatus};

#[derive(Debug, Parser)]
#[command(name = "jobsupervisor")]
#[command(about = "Launch and track background jobs", long_about = None)]
struct Cli {
    /// Override the base directory (default: resolved via config::resolve_base).
    #[arg(long, global = true)]
    root: Option<String>,

    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Print records as JSON instead of tab-separated text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Launch a command as a tracked background job.
    Run {
        /// Identifier to track this job under.
        job_id: String,

        /// Working directory for the command (default: current directory).
        #[arg(long)]
        cwd: Option<String>,

        /// Shell command line to run.
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Stop a running job.
    Stop { job_id: String },

    /// Print a job's current status.
    Status { job_id: String },

    /// List all tracked jobs, optionally filtered by status.
    List {
        #[arg(long)]
        status: Option<String>,
    },

    /// Print a job's captured stdout and stderr.
    Logs { job_id: String },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    job_supervisor::logging::init(default_level);

    if let Err(e) = run(cli) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let base_dir = job_supervisor::resolve_base(cli.root.as_deref());
    let manager = JobManager::open(&base_dir).with_context(|| format!("opening store at {}", base_dir.display()))?;
    let json = cli.json;

    match cli.command {
        Command::Run { job_id, cwd, command } => {
            let cwd = cwd.map(PathBuf::from).unwrap_or(std::env::current_dir()?);
            let command_line = command.join(" ");
            let record = manager.run(&job_id, &command_line, &cwd)?;
            print_record(&record, json)?;
        }

        Command::Stop { job_id } => {
            let record = manager.stop(&job_id)?;
            print_record(&record, json)?;
        }

        Command::Status { job_id } => {
            let record = manager.get_status(&job_id)?;
            print_record(&record, json)?;
        }

        Command::List { status } => {
            let mut filter = JobFilter::new();
            if let Some(s) = status {
                let parsed: JobStatus = s.parse().with_context(|| format!("parsing --status {s}"))?;
                filter = filter.with_status(parsed);
            }
            let records = manager.list_status(&filter)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                for record in &records {
                    print_record(record, false)?;
                }
            }
        }

        Command::Logs { job_id } => {
            let (stdout, stderr) = manager.job_logs(&job_id)?;
            if json {
                println!("{}", serde_json::json!({ "stdout": stdout, "stderr": stderr }));
            } else {
                println!("--- stdout ---\n{stdout}");
                println!("--- stderr ---\n{stderr}");
            }
        }
    }

    manager.shutdown();
    Ok(())
}

fn print_record(record: &job_supervisor::JobRecord, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(record)?);
    } else {
        println!(
            "{}\t{}\tpid={}\t{}\t{}",
            record.job_id, record.status, record.last_pid, record.last_update, record.command
        );
    }
    Ok(())
}
