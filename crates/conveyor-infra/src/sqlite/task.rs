//! SQLite task repository implementation.
//!
//! Implements `TaskRepository` from `conveyor-core`. Each task is stored as a
//! whole JSON document keyed by `(workflow_name, task_id)`; summary columns
//! beside it are rewritten on every upsert so listings never decode the
//! document. Sequence allocation is a single `UPSERT ... RETURNING` on the
//! writer connection.

use chrono::{DateTime, SecondsFormat, Utc};
use conveyor_core::repository::task::TaskRepository;
use conveyor_types::error::RepositoryError;
use conveyor_types::status::Status;
use conveyor_types::task::{Task, TaskFilter, TaskKey, TaskSummary};
use sqlx::{QueryBuilder, Row, Sqlite};
use uuid::Uuid;

use super::pool::DatabasePool;

const SUMMARY_COLUMNS: &str = "id, workflow_name, task_id, project, status, creator, created_at, started_at, ended_at, is_restart";

/// SQLite-backed implementation of `TaskRepository`.
pub struct SqliteTaskRepository {
    pool: DatabasePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct TaskDocumentRow {
    document: String,
}

impl TaskDocumentRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            document: row.try_get("document")?,
        })
    }

    fn into_task(self) -> Result<Task, RepositoryError> {
        serde_json::from_str(&self.document)
            .map_err(|e| RepositoryError::Query(format!("invalid task document JSON: {e}")))
    }
}

struct TaskSummaryRow {
    id: String,
    workflow_name: String,
    task_id: i64,
    project: String,
    status: String,
    creator: String,
    created_at: String,
    started_at: Option<String>,
    ended_at: Option<String>,
    is_restart: bool,
}

impl TaskSummaryRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_name: row.try_get("workflow_name")?,
            task_id: row.try_get("task_id")?,
            project: row.try_get("project")?,
            status: row.try_get("status")?,
            creator: row.try_get("creator")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
            is_restart: row.try_get("is_restart")?,
        })
    }

    fn into_summary(self) -> Result<TaskSummary, RepositoryError> {
        let status: Status = self.status.parse().map_err(RepositoryError::Query)?;
        Ok(TaskSummary {
            id: parse_uuid(&self.id)?,
            workflow_name: self.workflow_name,
            task_id: self.task_id,
            project: self.project,
            status,
            creator: self.creator,
            created_at: parse_datetime(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            ended_at: self.ended_at.as_deref().map(parse_datetime).transpose()?,
            is_restart: self.is_restart,
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

/// Fixed-width UTC timestamps so text ordering matches time ordering.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &TaskFilter) {
    qb.push(" WHERE 1 = 1");
    if let Some(name) = &filter.workflow_name {
        qb.push(" AND workflow_name = ").push_bind(name.clone());
    }
    if let Some(project) = &filter.project {
        qb.push(" AND project = ").push_bind(project.clone());
    }
    if !filter.creators.is_empty() {
        qb.push(" AND creator IN (");
        let mut list = qb.separated(", ");
        for creator in &filter.creators {
            list.push_bind(creator.clone());
        }
        list.push_unseparated(")");
    }
    if !filter.statuses.is_empty() {
        qb.push(" AND status IN (");
        let mut list = qb.separated(", ");
        for status in &filter.statuses {
            list.push_bind(status.as_str());
        }
        list.push_unseparated(")");
    }
}

fn summaries(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<TaskSummary>, RepositoryError> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let r = TaskSummaryRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
        out.push(r.into_summary()?);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// TaskRepository impl
// ---------------------------------------------------------------------------

impl TaskRepository for SqliteTaskRepository {
    async fn find(&self, key: &TaskKey) -> Result<Option<Task>, RepositoryError> {
        let row = sqlx::query(
            "SELECT document FROM workflow_tasks WHERE workflow_name = ? AND task_id = ?",
        )
        .bind(&key.workflow_name)
        .bind(key.task_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = TaskDocumentRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_task()?))
            }
            None => Ok(None),
        }
    }

    async fn upsert(&self, task: &Task) -> Result<(), RepositoryError> {
        let document = serde_json::to_string(task)
            .map_err(|e| RepositoryError::Query(format!("serialize task: {e}")))?;

        sqlx::query(
            r#"INSERT INTO workflow_tasks
               (id, workflow_name, task_id, project, status, creator, created_at,
                started_at, ended_at, is_restart, document, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(workflow_name, task_id) DO UPDATE SET
                 status = excluded.status,
                 started_at = excluded.started_at,
                 ended_at = excluded.ended_at,
                 is_restart = excluded.is_restart,
                 document = excluded.document,
                 updated_at = excluded.updated_at"#,
        )
        .bind(task.id.to_string())
        .bind(&task.workflow_name)
        .bind(task.task_id)
        .bind(&task.project)
        .bind(task.status.as_str())
        .bind(&task.creator)
        .bind(format_datetime(&task.created_at))
        .bind(task.started_at.as_ref().map(format_datetime))
        .bind(task.ended_at.as_ref().map(format_datetime))
        .bind(task.is_restart)
        .bind(&document)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        tracing::debug!(task = %task.key(), status = %task.status, "task snapshot written");
        Ok(())
    }

    async fn list_by_filter(
        &self,
        filter: &TaskFilter,
    ) -> Result<(Vec<TaskSummary>, u64), RepositoryError> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM workflow_tasks");
        push_filter(&mut count, filter);
        let total = count
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut select = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {SUMMARY_COLUMNS} FROM workflow_tasks"
        ));
        push_filter(&mut select, filter);
        select
            .push(" ORDER BY created_at DESC, task_id DESC LIMIT ")
            .push_bind(i64::from(filter.limit))
            .push(" OFFSET ")
            .push_bind(i64::from(filter.offset));

        let rows = select
            .build()
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok((summaries(&rows)?, total.max(0) as u64))
    }

    async fn list_unfinished(&self) -> Result<Vec<TaskSummary>, RepositoryError> {
        let mut select = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {SUMMARY_COLUMNS} FROM workflow_tasks WHERE status NOT IN ("
        ));
        let mut list = select.separated(", ");
        for status in Status::ALL.iter().filter(|s| s.is_terminal()) {
            list.push_bind(status.as_str());
        }
        list.push_unseparated(") ORDER BY created_at ASC, task_id ASC");

        let rows = select
            .build()
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        summaries(&rows)
    }

    async fn next_sequence(&self, workflow_name: &str) -> Result<i64, RepositoryError> {
        let seq: i64 = sqlx::query_scalar(
            r#"INSERT INTO task_sequences (name, seq) VALUES (?, 1)
               ON CONFLICT(name) DO UPDATE SET seq = seq + 1
               RETURNING seq"#,
        )
        .bind(workflow_name)
        .fetch_one(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(seq)
    }
}
