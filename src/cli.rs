// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, Subcommand, ValueEnum};

/// Command-line arguments for `dagflow`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "dagflow",
    version,
    about = "Execute DAGs of steps with durable status, retries, and distributed dispatch.",
    long_about = None
)]
pub struct CliArgs {
    /// Root directory for durable state (runs, locks, queue).
    ///
    /// Default: `DAGFLOW_HOME` if set, else `.dagflow` in the working
    /// directory.
    #[arg(long, value_name = "PATH")]
    pub data_dir: Option<String>,

    /// Directory containing DAG definition files (`<name>.toml`).
    ///
    /// Default: `DAGFLOW_DAGS` if set, else `dags`.
    #[arg(long, value_name = "PATH")]
    pub dags_dir: Option<String>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `DAGFLOW_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Trigger a run of a DAG (runs in this process, or queues at the
    /// active-run ceiling).
    Start {
        /// DAG name (looked up in the DAGs directory) or a path to a
        /// definition file.
        dag: String,

        /// Parameter overrides, whitespace-separated KEY=VALUE pairs.
        #[arg(long, value_name = "PARAMS")]
        params: Option<String>,

        /// Explicit run ID for idempotent starts.
        #[arg(long, value_name = "ID")]
        run_id: Option<String>,

        /// Only enqueue; let a worker fleet pick the run up.
        #[arg(long)]
        queue: bool,
    },

    /// Request cooperative cancellation of a running run.
    Stop { dag: String, run_id: String },

    /// Re-run a finished run from its last non-successful point.
    Retry { dag: String, run_id: String },

    /// Run again as a brand-new run, optionally overriding parameters or
    /// the target DAG.
    Reschedule {
        dag: String,
        run_id: String,

        #[arg(long, value_name = "ID")]
        new_run_id: Option<String>,

        #[arg(long, value_name = "PARAMS")]
        params: Option<String>,

        #[arg(long, value_name = "DAG")]
        new_dag: Option<String>,
    },

    /// Remove a queued run before it is dispatched.
    Dequeue { dag: String, run_id: String },

    /// Reject new runs of a DAG at admission time.
    Suspend { dag: String },

    /// Clear the suspend flag.
    Resume { dag: String },

    /// Patch one step's terminal status on a finished run.
    Mark {
        dag: String,
        run_id: String,
        step: String,
        #[arg(value_enum)]
        status: MarkArg,
    },

    /// Show the latest run status (or a specific run's).
    Status {
        dag: String,
        #[arg(long, value_name = "ID")]
        run_id: Option<String>,
    },

    /// Show the most recent runs of a DAG.
    History {
        dag: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Print the captured output of one step of one run.
    Logs {
        dag: String,
        run_id: String,
        step: String,
    },

    /// List queued runs in dispatch order.
    Queue,

    /// Run the coordinator plus a local worker fleet draining the queue.
    Serve {
        /// Number of workers.
        #[arg(long, default_value_t = 1)]
        workers: usize,

        /// Concurrent assignments per worker.
        #[arg(long, default_value_t = 4)]
        capacity: usize,
    },
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Terminal status accepted by `mark`.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum MarkArg {
    Success,
    Error,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
