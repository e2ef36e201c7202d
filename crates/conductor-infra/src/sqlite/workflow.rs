//! SQLite workflow store implementation.
//!
//! Implements `WorkflowStore` from `conductor-core` using sqlx with split
//! read/write pools. Enumerations are stored as their serde names, JSON
//! payloads (variables, results) as text, timestamps as RFC 3339 with
//! nanosecond precision. Every save is an upsert.

use chrono::{DateTime, SecondsFormat, Utc};
use conductor_core::repository::workflow::WorkflowStore;
use conductor_types::error::RepositoryError;
use conductor_types::workflow::{NodeRecord, WorkflowRecord};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowStore`.
pub struct SqliteWorkflowStore {
    pool: DatabasePool,
}

impl SqliteWorkflowStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct WorkflowRow {
    id: String,
    name: String,
    status: String,
    mode: String,
    priority: String,
    timeout_secs: Option<i64>,
    variables: String,
    result: Option<String>,
    error: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl WorkflowRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            status: row.try_get("status")?,
            mode: row.try_get("mode")?,
            priority: row.try_get("priority")?,
            timeout_secs: row.try_get("timeout_secs")?,
            variables: row.try_get("variables")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_record(self) -> Result<WorkflowRecord, RepositoryError> {
        Ok(WorkflowRecord {
            id: parse_uuid(&self.id)?,
            name: self.name,
            status: parse_enum(&self.status, "workflow status")?,
            mode: parse_enum(&self.mode, "execution mode")?,
            priority: parse_enum(&self.priority, "priority")?,
            timeout_secs: self.timeout_secs.map(|t| t as u64),
            variables: parse_json(&self.variables, "variables")?,
            result: parse_optional_json(self.result.as_deref(), "result")?,
            error: self.error,
            created_at: parse_datetime(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct NodeRow {
    node_id: String,
    kind: String,
    status: String,
    retry_count: i64,
    result: Option<String>,
    error: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl NodeRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            node_id: row.try_get("node_id")?,
            kind: row.try_get("kind")?,
            status: row.try_get("status")?,
            retry_count: row.try_get("retry_count")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_record(self) -> Result<NodeRecord, RepositoryError> {
        Ok(NodeRecord {
            node_id: self.node_id,
            kind: parse_enum(&self.kind, "node kind")?,
            status: parse_enum(&self.status, "node status")?,
            retry_count: self.retry_count as u32,
            result: parse_optional_json(self.result.as_deref(), "node result")?,
            error: self.error,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width so lexical order matches chronological order.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Serde name of a unit enum variant (e.g. `NodeStatus::Running` -> `"running"`).
fn enum_str<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    match serde_json::to_value(value) {
        Ok(Value::String(s)) => Ok(s),
        Ok(other) => Err(RepositoryError::Query(format!("expected string enum, got {other}"))),
        Err(e) => Err(RepositoryError::Query(e.to_string())),
    }
}

fn parse_enum<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_value(Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid {what}: {s}")))
}

fn parse_json(s: &str, what: &str) -> Result<Value, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

fn parse_optional_json(s: Option<&str>, what: &str) -> Result<Option<Value>, RepositoryError> {
    s.map(|s| parse_json(s, what)).transpose()
}

fn to_json(value: &Value) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            RepositoryError::Connection
        }
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
            RepositoryError::Conflict(db.message().to_string())
        }
        other => RepositoryError::Query(other.to_string()),
    }
}

const WORKFLOW_COLUMNS: &str = "id, name, status, mode, priority, timeout_secs, variables, result, error, created_at, started_at, completed_at";

// ---------------------------------------------------------------------------
// WorkflowStore impl
// ---------------------------------------------------------------------------

impl WorkflowStore for SqliteWorkflowStore {
    async fn save_workflow(&self, workflow: &WorkflowRecord) -> Result<(), RepositoryError> {
        let result = workflow.result.as_ref().map(to_json).transpose()?;

        sqlx::query(
            r#"INSERT INTO workflows
               (id, name, status, mode, priority, timeout_secs, variables, result, error,
                created_at, started_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 status = excluded.status,
                 mode = excluded.mode,
                 priority = excluded.priority,
                 timeout_secs = excluded.timeout_secs,
                 variables = excluded.variables,
                 result = excluded.result,
                 error = excluded.error,
                 started_at = excluded.started_at,
                 completed_at = excluded.completed_at"#,
        )
        .bind(workflow.id.to_string())
        .bind(&workflow.name)
        .bind(enum_str(&workflow.status)?)
        .bind(enum_str(&workflow.mode)?)
        .bind(enum_str(&workflow.priority)?)
        .bind(workflow.timeout_secs.map(|t| t as i64))
        .bind(to_json(&workflow.variables)?)
        .bind(&result)
        .bind(&workflow.error)
        .bind(format_datetime(&workflow.created_at))
        .bind(workflow.started_at.as_ref().map(format_datetime))
        .bind(workflow.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn save_node(&self, workflow_id: &Uuid, node: &NodeRecord) -> Result<(), RepositoryError> {
        let result = node.result.as_ref().map(to_json).transpose()?;

        sqlx::query(
            r#"INSERT INTO workflow_nodes
               (workflow_id, node_id, kind, status, retry_count, result, error, started_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(workflow_id, node_id) DO UPDATE SET
                 kind = excluded.kind,
                 status = excluded.status,
                 retry_count = excluded.retry_count,
                 result = excluded.result,
                 error = excluded.error,
                 started_at = excluded.started_at,
                 completed_at = excluded.completed_at"#,
        )
        .bind(workflow_id.to_string())
        .bind(&node.node_id)
        .bind(enum_str(&node.kind)?)
        .bind(enum_str(&node.status)?)
        .bind(i64::from(node.retry_count))
        .bind(&result)
        .bind(&node.error)
        .bind(node.started_at.as_ref().map(format_datetime))
        .bind(node.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn load_workflow(&self, id: &Uuid) -> Result<Option<WorkflowRecord>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = WorkflowRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_record()?))
            }
            None => Ok(None),
        }
    }

    /// Nodes come back in the order they were first saved (topological
    /// order for workflows submitted through the supervisor).
    async fn load_nodes(&self, workflow_id: &Uuid) -> Result<Vec<NodeRecord>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT node_id, kind, status, retry_count, result, error, started_at, completed_at
               FROM workflow_nodes WHERE workflow_id = ? ORDER BY rowid ASC"#,
        )
        .bind(workflow_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut nodes = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = NodeRow::from_row(row).map_err(query_error)?;
            nodes.push(r.into_record()?);
        }
        Ok(nodes)
    }

    async fn list_workflows(&self, limit: u32) -> Result<Vec<WorkflowRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows ORDER BY created_at DESC, id DESC LIMIT ?"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = WorkflowRow::from_row(row).map_err(query_error)?;
            records.push(r.into_record()?);
        }
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
