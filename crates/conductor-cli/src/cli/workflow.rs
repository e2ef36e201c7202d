//! Workflow command handlers: validate, run, status, list.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::Map;
use uuid::Uuid;

use conductor_core::repository::WorkflowStore;
use conductor_core::workflow::definition::{build_graph, load_workflow_file, validate_definition};
use conductor_types::workflow::{
    NodeRecord, NodeStatus, Priority, WorkflowRecord, WorkflowSnapshot, WorkflowStatus,
};

use super::RunArgs;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

/// Parse, validate, and build the graph of a workflow file.
pub fn validate(file: &Path, json: bool) -> Result<()> {
    let def = load_workflow_file(file)
        .with_context(|| format!("Failed to load {}", file.display()))?;
    validate_definition(&def)?;
    let graph = build_graph(&def)?;

    let order = graph.topological_order();
    let levels = graph.levels();

    if json {
        let out = serde_json::json!({
            "valid": true,
            "name": def.name,
            "mode": def.mode,
            "nodes": graph.len(),
            "order": order,
            "levels": levels,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {} ({} mode, {} nodes)",
        style("✓").green().bold(),
        style(&def.name).bold(),
        def.mode,
        graph.len()
    );
    println!();
    println!("  {}", style("Execution order").dim());
    println!("    {}", order.join(" → "));
    println!();
    println!("  {}", style("Levels").dim());
    for (depth, level) in levels.iter().enumerate() {
        println!("    {depth}: {}", level.join(", "));
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

/// Submit a workflow, wait for it, and report its outcome.
///
/// Ctrl-C requests cancellation and still waits for the workflow to settle.
pub async fn run(state: &AppState, args: RunArgs, json: bool, quiet: bool) -> Result<()> {
    let supervisor = state.supervisor();
    let inputs: Map<String, serde_json::Value> = args.inputs.into_iter().collect();
    let timeout = args.timeout.map(Duration::from_secs);

    let id = match (args.file, args.pattern) {
        (Some(file), _) => {
            let mut def = load_workflow_file(&file)
                .with_context(|| format!("Failed to load {}", file.display()))?;
            def.inputs.extend(inputs);
            if let Some(priority) = args.priority {
                def.priority = priority;
            }
            if let Some(secs) = args.timeout {
                def.timeout_secs = Some(secs);
            }
            supervisor.submit_definition(&def).await?
        }
        (None, Some(pattern)) => {
            supervisor
                .submit_pattern(
                    &pattern,
                    inputs,
                    args.priority.unwrap_or(Priority::Normal),
                    timeout,
                )
                .await?
        }
        (None, None) => bail!("Either a workflow file or --pattern is required"),
    };

    if !quiet && !json {
        println!();
        println!("  {} workflow {}", style("▶").cyan(), style(id).bold());
    }

    let snapshot = tokio::select! {
        snapshot = supervisor.wait(id) => snapshot?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(workflow_id = %id, "interrupt received, cancelling workflow");
            supervisor.cancel(id).await;
            supervisor.wait(id).await?
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else if !quiet {
        print_snapshot(&snapshot);
    }

    if snapshot.status != WorkflowStatus::Completed {
        bail!(
            "Workflow {} {}: {}",
            id,
            snapshot.status,
            snapshot.error.as_deref().unwrap_or("no error recorded")
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// status / list
// ---------------------------------------------------------------------------

/// Show a journaled workflow and its nodes.
pub async fn status(state: &AppState, id: &str, json: bool) -> Result<()> {
    let id: Uuid = id
        .parse()
        .with_context(|| format!("'{id}' is not a workflow ID"))?;
    let store = state.store();

    let record = store
        .load_workflow(&id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load workflow: {e}"))?
        .ok_or_else(|| anyhow::anyhow!("No workflow found with ID {id}"))?;
    let nodes = store
        .load_nodes(&id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load nodes: {e}"))?;
    let snapshot = WorkflowSnapshot::from_parts(record, nodes, Vec::new());

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print_snapshot(&snapshot);
    }
    Ok(())
}

/// List the most recent workflows.
pub async fn list(state: &AppState, limit: u32, json: bool) -> Result<()> {
    let records = state
        .store()
        .list_workflows(limit)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list workflows: {e}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!();
        println!("  No workflows yet. Start one with 'conductor run <file>'.");
        println!();
        return Ok(());
    }

    println!("{}", workflow_table(&records));
    Ok(())
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn print_snapshot(snapshot: &WorkflowSnapshot) {
    println!();
    println!(
        "  {} {}  {}",
        style(&snapshot.name).bold(),
        style(snapshot.id).dim(),
        workflow_status_label(snapshot.status)
    );
    println!(
        "  {} mode, {} priority, {}/{} nodes completed ({:.0}%)",
        snapshot.mode,
        snapshot.priority,
        snapshot.completed,
        snapshot.total,
        snapshot.progress * 100.0
    );
    if let Some(error) = &snapshot.error {
        println!("  {} {}", style("error:").red().bold(), error);
    }
    for diagnostic in &snapshot.diagnostics {
        println!("  {} {}", style("warning:").yellow(), diagnostic);
    }
    println!();
    if !snapshot.nodes.is_empty() {
        println!("{}", node_table(&snapshot.nodes));
        println!();
    }
}

fn node_table(nodes: &[NodeRecord]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Node").fg(Color::Cyan),
            Cell::new("Kind"),
            Cell::new("Status"),
            Cell::new("Retries"),
            Cell::new("Duration"),
            Cell::new("Result / Error"),
        ]);

    for node in nodes {
        let duration = match (node.started_at, node.completed_at) {
            (Some(start), Some(end)) => format!("{}ms", (end - start).num_milliseconds()),
            _ => "-".to_string(),
        };
        let detail = match (&node.error, &node.result) {
            (Some(error), _) => error.clone(),
            (None, Some(result)) => truncate(&result.to_string(), 60),
            (None, None) => "-".to_string(),
        };
        table.add_row(vec![
            Cell::new(&node.node_id),
            Cell::new(node.kind.to_string()),
            format_node_status(node.status),
            Cell::new(node.retry_count),
            Cell::new(duration),
            Cell::new(detail),
        ]);
    }
    table
}

fn workflow_table(records: &[WorkflowRecord]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Workflow ID").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("Status"),
            Cell::new("Mode"),
            Cell::new("Priority"),
            Cell::new("Created"),
        ]);

    for record in records {
        table.add_row(vec![
            Cell::new(record.id),
            Cell::new(&record.name),
            format_workflow_status(record.status),
            Cell::new(record.mode),
            Cell::new(record.priority),
            Cell::new(record.created_at.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }
    table
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn workflow_status_label(status: WorkflowStatus) -> console::StyledObject<String> {
    let label = status.to_string();
    match status {
        WorkflowStatus::Pending => style(label).yellow(),
        WorkflowStatus::Running => style(label).blue(),
        WorkflowStatus::Completed => style(label).green(),
        WorkflowStatus::Failed => style(label).red(),
        WorkflowStatus::Cancelled => style(label).color256(136),
    }
}

fn format_workflow_status(status: WorkflowStatus) -> Cell {
    match status {
        WorkflowStatus::Pending => Cell::new("pending").fg(Color::Yellow),
        WorkflowStatus::Running => Cell::new("running").fg(Color::Blue),
        WorkflowStatus::Completed => Cell::new("completed").fg(Color::Green),
        WorkflowStatus::Failed => Cell::new("failed").fg(Color::Red),
        WorkflowStatus::Cancelled => Cell::new("cancelled").fg(Color::DarkYellow),
    }
}

fn format_node_status(status: NodeStatus) -> Cell {
    match status {
        NodeStatus::Pending => Cell::new("pending").fg(Color::Yellow),
        NodeStatus::Running => Cell::new("running").fg(Color::Blue),
        NodeStatus::Completed => Cell::new("completed").fg(Color::Green),
        NodeStatus::Failed => Cell::new("failed").fg(Color::Red),
        NodeStatus::Cancelled => Cell::new("cancelled").fg(Color::DarkYellow),
    }
}
