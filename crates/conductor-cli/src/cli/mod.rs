//! CLI command definitions for the `conductor` binary.
//!
//! Uses clap derive macros for argument parsing. Commands operate on the
//! data directory (`--data-dir`, `CONDUCTOR_DATA_DIR`, or `~/.conductor`).

pub mod pattern;
pub mod workflow;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use conductor_types::workflow::Priority;

/// Run and inspect DAG workflows.
#[derive(Parser)]
#[command(name = "conductor", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Directory holding the database, config, and patterns.
    #[arg(long, global = true, env = conductor_infra::config::DATA_DIR_ENV)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check a workflow file and print its execution order.
    Validate {
        /// Path to the workflow YAML file.
        file: PathBuf,
    },

    /// Run a workflow file or a named pattern and wait for it to finish.
    Run(RunArgs),

    /// Show a workflow and its nodes.
    Status {
        /// Workflow ID.
        id: String,
    },

    /// List recent workflows.
    #[command(alias = "ls")]
    List {
        /// Maximum number of workflows to show.
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },

    /// List the patterns in the data directory.
    Patterns,
}

#[derive(Args)]
pub struct RunArgs {
    /// Path to the workflow YAML file.
    #[arg(required_unless_present = "pattern", conflicts_with = "pattern")]
    pub file: Option<PathBuf>,

    /// Run the named pattern instead of a file.
    #[arg(long)]
    pub pattern: Option<String>,

    /// Workflow input as key=<json> (repeatable). Non-JSON values are taken as strings.
    #[arg(long = "input", short = 'i', value_parser = parse_input)]
    pub inputs: Vec<(String, serde_json::Value)>,

    /// Scheduling priority: low, normal, high, critical.
    #[arg(long)]
    pub priority: Option<Priority>,

    /// Workflow timeout in seconds.
    #[arg(long)]
    pub timeout: Option<u64>,
}

/// Parse `key=value`, reading the value as JSON and falling back to a string.
pub fn parse_input(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty input name in '{raw}'"));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}
