use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use tracing::debug;

use taskweave_core::error::{Result, TaskweaveError};
use taskweave_core::instance::{
    NodeInstance, NodePatch, Subdivision, TaskInstance, WorkflowInstance,
};
use taskweave_core::template::WorkflowTemplate;
use taskweave_core::traits::{GraphStore, NewChild};
use taskweave_core::types::*;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS templates (
    id TEXT PRIMARY KEY,
    lineage TEXT NOT NULL,
    version INTEGER NOT NULL,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    nodes TEXT NOT NULL,
    edges TEXT NOT NULL,
    derived_from TEXT,
    superseded_by TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (lineage, version)
);

CREATE TABLE IF NOT EXISTS instances (
    id TEXT PRIMARY KEY,
    template_id TEXT NOT NULL REFERENCES templates(id),
    status TEXT NOT NULL,
    context TEXT NOT NULL,
    parent_subdivision TEXT,
    error TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_instances_template ON instances(template_id);

CREATE TABLE IF NOT EXISTS node_instances (
    id TEXT PRIMARY KEY,
    instance_id TEXT NOT NULL REFERENCES instances(id),
    node_key TEXT NOT NULL,
    status TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    input TEXT,
    output TEXT,
    error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT,
    UNIQUE (instance_id, node_key)
);

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    node_instance_id TEXT NOT NULL UNIQUE REFERENCES node_instances(id),
    instance_id TEXT NOT NULL,
    node_key TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    kind TEXT NOT NULL,
    status TEXT NOT NULL,
    input TEXT NOT NULL,
    result TEXT,
    reference_result TEXT,
    attempt INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_instance ON tasks(instance_id);

CREATE TABLE IF NOT EXISTS subdivisions (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL REFERENCES tasks(id),
    parent_instance_id TEXT NOT NULL,
    parent_node_key TEXT NOT NULL,
    template_id TEXT,
    child_instance_id TEXT,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    execute_immediately INTEGER NOT NULL,
    auto_submit INTEGER NOT NULL,
    status TEXT NOT NULL,
    result TEXT,
    error TEXT,
    created_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_subdivisions_task ON subdivisions(task_id);
CREATE INDEX IF NOT EXISTS idx_subdivisions_parent ON subdivisions(parent_instance_id);
";

const TEMPLATE_COLS: &str = "id, lineage, version, name, description, nodes, edges, \
     derived_from, superseded_by, created_at";
const INSTANCE_COLS: &str = "id, template_id, status, context, parent_subdivision, error, \
     created_at, started_at, finished_at";
const NODE_COLS: &str = "id, instance_id, node_key, status, retry_count, input, output, error, \
     created_at, updated_at, completed_at";
const TASK_COLS: &str = "id, node_instance_id, instance_id, node_key, title, description, kind, \
     status, input, result, reference_result, attempt, created_at, updated_at";
const SUBDIVISION_COLS: &str = "id, task_id, parent_instance_id, parent_node_key, template_id, \
     child_instance_id, name, description, execute_immediately, auto_submit, status, result, \
     error, created_at, completed_at";

/// SQLite-backed graph store.
///
/// One connection behind a mutex: every trait call runs to completion while
/// holding it, so each call is atomic with respect to the others.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TaskweaveError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db)?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db)?;
        conn.execute_batch(SCHEMA).map_err(db)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db)?;
        conn.execute_batch(SCHEMA).map_err(db)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| TaskweaveError::Database(e.to_string()))
    }
}

fn db(e: rusqlite::Error) -> TaskweaveError {
    TaskweaveError::Database(e.to_string())
}

fn conv<E: std::error::Error + Send + Sync + 'static>(e: E) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

/// Quoted SQL list of status literals, e.g. `'ready','running'`.
fn in_list<'a>(statuses: impl IntoIterator<Item = &'a str>) -> String {
    statuses
        .into_iter()
        .map(|s| format!("'{}'", s))
        .collect::<Vec<_>>()
        .join(",")
}

fn json_text(value: Option<&serde_json::Value>) -> Result<Option<String>> {
    value.map(serde_json::to_string).transpose().map_err(Into::into)
}

fn time(row: &Row<'_>, col: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(col)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(conv)
}

fn opt_time(row: &Row<'_>, col: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(col)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(conv)
    })
    .transpose()
}

fn json(row: &Row<'_>, col: &str) -> rusqlite::Result<serde_json::Value> {
    let raw: String = row.get(col)?;
    serde_json::from_str(&raw).map_err(conv)
}

fn opt_json(row: &Row<'_>, col: &str) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = row.get(col)?;
    raw.map(|s| serde_json::from_str(&s).map_err(conv)).transpose()
}

fn parsed<T: FromStr<Err = TaskweaveError>>(row: &Row<'_>, col: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(col)?;
    raw.parse().map_err(conv)
}

fn template_from_row(row: &Row<'_>) -> rusqlite::Result<WorkflowTemplate> {
    let nodes: String = row.get("nodes")?;
    let edges: String = row.get("edges")?;
    Ok(WorkflowTemplate {
        id: TemplateId(row.get("id")?),
        lineage: TemplateId(row.get("lineage")?),
        version: row.get("version")?,
        name: row.get("name")?,
        description: row.get("description")?,
        nodes: serde_json::from_str(&nodes).map_err(conv)?,
        edges: serde_json::from_str(&edges).map_err(conv)?,
        derived_from: row.get::<_, Option<String>>("derived_from")?.map(TemplateId),
        superseded_by: row.get::<_, Option<String>>("superseded_by")?.map(TemplateId),
        created_at: time(row, "created_at")?,
    })
}

fn instance_from_row(row: &Row<'_>) -> rusqlite::Result<WorkflowInstance> {
    Ok(WorkflowInstance {
        id: InstanceId(row.get("id")?),
        template_id: TemplateId(row.get("template_id")?),
        status: parsed(row, "status")?,
        context: json(row, "context")?,
        parent_subdivision: row
            .get::<_, Option<String>>("parent_subdivision")?
            .map(SubdivisionId),
        error: row.get("error")?,
        created_at: time(row, "created_at")?,
        started_at: opt_time(row, "started_at")?,
        finished_at: opt_time(row, "finished_at")?,
    })
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<NodeInstance> {
    Ok(NodeInstance {
        id: NodeInstanceId(row.get("id")?),
        instance_id: InstanceId(row.get("instance_id")?),
        node_key: row.get("node_key")?,
        status: parsed(row, "status")?,
        retry_count: row.get("retry_count")?,
        input: opt_json(row, "input")?,
        output: opt_json(row, "output")?,
        error: row.get("error")?,
        created_at: time(row, "created_at")?,
        updated_at: time(row, "updated_at")?,
        completed_at: opt_time(row, "completed_at")?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<TaskInstance> {
    Ok(TaskInstance {
        id: TaskId(row.get("id")?),
        node_instance_id: NodeInstanceId(row.get("node_instance_id")?),
        instance_id: InstanceId(row.get("instance_id")?),
        node_key: row.get("node_key")?,
        title: row.get("title")?,
        description: row.get("description")?,
        kind: parsed(row, "kind")?,
        status: parsed(row, "status")?,
        input: json(row, "input")?,
        result: opt_json(row, "result")?,
        reference_result: opt_json(row, "reference_result")?,
        attempt: row.get("attempt")?,
        created_at: time(row, "created_at")?,
        updated_at: time(row, "updated_at")?,
    })
}

fn subdivision_from_row(row: &Row<'_>) -> rusqlite::Result<Subdivision> {
    Ok(Subdivision {
        id: SubdivisionId(row.get("id")?),
        task_id: TaskId(row.get("task_id")?),
        parent_instance_id: InstanceId(row.get("parent_instance_id")?),
        parent_node_key: row.get("parent_node_key")?,
        template_id: row.get::<_, Option<String>>("template_id")?.map(TemplateId),
        child_instance_id: row
            .get::<_, Option<String>>("child_instance_id")?
            .map(InstanceId),
        name: row.get("name")?,
        description: row.get("description")?,
        execute_immediately: row.get("execute_immediately")?,
        auto_submit: row.get("auto_submit")?,
        status: parsed(row, "status")?,
        result: opt_json(row, "result")?,
        error: row.get("error")?,
        created_at: time(row, "created_at")?,
        completed_at: opt_time(row, "completed_at")?,
    })
}

fn write_template(conn: &Connection, t: &WorkflowTemplate) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO templates ({TEMPLATE_COLS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
        ),
        params![
            t.id.as_str(),
            t.lineage.as_str(),
            t.version,
            t.name,
            t.description,
            serde_json::to_string(&t.nodes)?,
            serde_json::to_string(&t.edges)?,
            t.derived_from.as_ref().map(|id| id.as_str()),
            t.superseded_by.as_ref().map(|id| id.as_str()),
            t.created_at.to_rfc3339(),
        ],
    )
    .map_err(db)?;
    Ok(())
}

fn write_instance(
    tx: &Transaction<'_>,
    instance: &WorkflowInstance,
    nodes: &[NodeInstance],
) -> Result<()> {
    tx.execute(
        &format!(
            "INSERT INTO instances ({INSTANCE_COLS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
        ),
        params![
            instance.id.as_str(),
            instance.template_id.as_str(),
            instance.status.as_str(),
            serde_json::to_string(&instance.context)?,
            instance.parent_subdivision.as_ref().map(|id| id.as_str()),
            instance.error,
            instance.created_at.to_rfc3339(),
            instance.started_at.map(|t| t.to_rfc3339()),
            instance.finished_at.map(|t| t.to_rfc3339()),
        ],
    )
    .map_err(db)?;

    let mut stmt = tx
        .prepare(&format!(
            "INSERT INTO node_instances ({NODE_COLS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
        ))
        .map_err(db)?;
    for node in nodes {
        stmt.execute(params![
            node.id.as_str(),
            node.instance_id.as_str(),
            node.node_key,
            node.status.as_str(),
            node.retry_count,
            json_text(node.input.as_ref())?,
            json_text(node.output.as_ref())?,
            node.error,
            node.created_at.to_rfc3339(),
            node.updated_at.to_rfc3339(),
            node.completed_at.map(|t| t.to_rfc3339()),
        ])
        .map_err(db)?;
    }
    Ok(())
}

impl GraphStore for SqliteStore {
    fn insert_template(&self, template: &WorkflowTemplate) -> Result<()> {
        let conn = self.lock()?;
        write_template(&conn, template)?;
        debug!(template_id = %template.id, version = template.version, "Template stored");
        Ok(())
    }

    fn get_template(&self, id: &TemplateId) -> Result<WorkflowTemplate> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {TEMPLATE_COLS} FROM templates WHERE id = ?1"),
            params![id.as_str()],
            template_from_row,
        )
        .optional()
        .map_err(db)?
        .ok_or_else(|| TaskweaveError::not_found("template", id))
    }

    fn list_templates(&self) -> Result<Vec<WorkflowTemplate>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TEMPLATE_COLS} FROM templates ORDER BY lineage, version"
            ))
            .map_err(db)?;
        let rows = stmt.query_map([], template_from_row).map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    fn latest_version(&self, lineage: &TemplateId) -> Result<u32> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM templates WHERE lineage = ?1",
            params![lineage.as_str()],
            |row| row.get(0),
        )
        .map_err(db)
    }

    fn commit_merged_template(
        &self,
        template: &WorkflowTemplate,
        supersede: Option<&TemplateId>,
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db)?;
        write_template(&tx, template)?;
        if let Some(old) = supersede {
            let changed = tx
                .execute(
                    "UPDATE templates SET superseded_by = ?1
                     WHERE id = ?2 AND superseded_by IS NULL",
                    params![template.id.as_str(), old.as_str()],
                )
                .map_err(db)?;
            if changed == 0 {
                // Dropping the transaction rolls back the insert.
                return Err(TaskweaveError::StateConflict(format!(
                    "template {} is missing or already superseded",
                    old
                )));
            }
        }
        tx.commit().map_err(db)?;
        debug!(template_id = %template.id, version = template.version, "Merged template committed");
        Ok(())
    }

    fn create_instance(&self, instance: &WorkflowInstance, nodes: &[NodeInstance]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db)?;
        write_instance(&tx, instance, nodes)?;
        tx.commit().map_err(db)
    }

    fn get_instance(&self, id: &InstanceId) -> Result<WorkflowInstance> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {INSTANCE_COLS} FROM instances WHERE id = ?1"),
            params![id.as_str()],
            instance_from_row,
        )
        .optional()
        .map_err(db)?
        .ok_or_else(|| TaskweaveError::not_found("instance", id))
    }

    fn list_instances(&self, template: Option<&TemplateId>) -> Result<Vec<WorkflowInstance>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {INSTANCE_COLS} FROM instances
                 WHERE ?1 IS NULL OR template_id = ?1 ORDER BY rowid"
            ))
            .map_err(db)?;
        let rows = stmt
            .query_map(params![template.map(|t| t.as_str())], instance_from_row)
            .map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    fn start_instance(&self, id: &InstanceId) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db)?;
        let changed = tx
            .execute(
                "UPDATE instances SET status = 'running', started_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![now(), id.as_str()],
            )
            .map_err(db)?;
        if changed == 0 {
            return Ok(false);
        }
        tx.execute(
            "UPDATE node_instances SET status = 'waiting', updated_at = ?1
             WHERE instance_id = ?2 AND status = 'created'",
            params![now(), id.as_str()],
        )
        .map_err(db)?;
        tx.commit().map_err(db)?;
        Ok(true)
    }

    fn transition_instance(
        &self,
        id: &InstanceId,
        from: &[InstanceStatus],
        to: InstanceStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let finished = to.is_terminal().then(now);
        let changed = conn
            .execute(
                &format!(
                    "UPDATE instances SET status = ?1, error = COALESCE(?2, error),
                     finished_at = COALESCE(?3, finished_at)
                     WHERE id = ?4 AND status IN ({})",
                    in_list(from.iter().map(|s| s.as_str()))
                ),
                params![to.as_str(), error, finished, id.as_str()],
            )
            .map_err(db)?;
        Ok(changed > 0)
    }

    fn cancel_instance(&self, id: &InstanceId) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db)?;
        let ts = now();
        let changed = tx
            .execute(
                "UPDATE instances SET status = 'cancelled', finished_at = ?1
                 WHERE id = ?2 AND status IN ('pending', 'running')",
                params![ts, id.as_str()],
            )
            .map_err(db)?;
        if changed == 0 {
            return Ok(false);
        }
        tx.execute(
            "UPDATE node_instances SET status = 'cancelled', updated_at = ?1
             WHERE instance_id = ?2 AND status NOT IN ('completed', 'failed', 'cancelled')",
            params![ts, id.as_str()],
        )
        .map_err(db)?;
        tx.execute(
            "UPDATE tasks SET status = 'cancelled', updated_at = ?1
             WHERE instance_id = ?2 AND status = 'open'",
            params![ts, id.as_str()],
        )
        .map_err(db)?;
        tx.commit().map_err(db)?;
        Ok(true)
    }

    fn get_node(&self, id: &NodeInstanceId) -> Result<NodeInstance> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {NODE_COLS} FROM node_instances WHERE id = ?1"),
            params![id.as_str()],
            node_from_row,
        )
        .optional()
        .map_err(db)?
        .ok_or_else(|| TaskweaveError::not_found("node", id))
    }

    fn find_node(&self, instance: &InstanceId, node_key: &str) -> Result<NodeInstance> {
        let conn = self.lock()?;
        conn.query_row(
            &format!(
                "SELECT {NODE_COLS} FROM node_instances WHERE instance_id = ?1 AND node_key = ?2"
            ),
            params![instance.as_str(), node_key],
            node_from_row,
        )
        .optional()
        .map_err(db)?
        .ok_or_else(|| TaskweaveError::not_found("node", format!("{}/{}", instance, node_key)))
    }

    fn list_nodes(&self, instance: &InstanceId) -> Result<Vec<NodeInstance>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {NODE_COLS} FROM node_instances WHERE instance_id = ?1 ORDER BY rowid"
            ))
            .map_err(db)?;
        let rows = stmt
            .query_map(params![instance.as_str()], node_from_row)
            .map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    fn transition_node(
        &self,
        id: &NodeInstanceId,
        from: &[NodeStatus],
        to: NodeStatus,
        patch: &NodePatch,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let ts = now();
        let completed = (to == NodeStatus::Completed).then(|| ts.clone());
        let changed = conn
            .execute(
                &format!(
                    "UPDATE node_instances SET status = ?1, updated_at = ?2,
                     input = COALESCE(?3, input), output = COALESCE(?4, output),
                     error = COALESCE(?5, error), retry_count = retry_count + ?6,
                     completed_at = COALESCE(?7, completed_at)
                     WHERE id = ?8 AND status IN ({})",
                    in_list(from.iter().map(|s| s.as_str()))
                ),
                params![
                    to.as_str(),
                    ts,
                    json_text(patch.input.as_ref())?,
                    json_text(patch.output.as_ref())?,
                    patch.error,
                    patch.increment_retry as u32,
                    completed,
                    id.as_str(),
                ],
            )
            .map_err(db)?;
        Ok(changed > 0)
    }

    fn create_task(&self, task: &TaskInstance) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO tasks ({TASK_COLS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    task.id.as_str(),
                    task.node_instance_id.as_str(),
                    task.instance_id.as_str(),
                    task.node_key,
                    task.title,
                    task.description,
                    task.kind.as_str(),
                    task.status.as_str(),
                    serde_json::to_string(&task.input)?,
                    json_text(task.result.as_ref())?,
                    json_text(task.reference_result.as_ref())?,
                    task.attempt,
                    task.created_at.to_rfc3339(),
                    task.updated_at.to_rfc3339(),
                ],
            )
            .map_err(db)?;
        Ok(changed > 0)
    }

    fn get_task(&self, id: &TaskId) -> Result<TaskInstance> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {TASK_COLS} FROM tasks WHERE id = ?1"),
            params![id.as_str()],
            task_from_row,
        )
        .optional()
        .map_err(db)?
        .ok_or_else(|| TaskweaveError::not_found("task", id))
    }

    fn task_for_node(&self, node: &NodeInstanceId) -> Result<Option<TaskInstance>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {TASK_COLS} FROM tasks WHERE node_instance_id = ?1"),
            params![node.as_str()],
            task_from_row,
        )
        .optional()
        .map_err(db)
    }

    fn list_tasks(&self, instance: &InstanceId) -> Result<Vec<TaskInstance>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TASK_COLS} FROM tasks WHERE instance_id = ?1 ORDER BY rowid"
            ))
            .map_err(db)?;
        let rows = stmt
            .query_map(params![instance.as_str()], task_from_row)
            .map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    fn complete_task(&self, id: &TaskId, result: &serde_json::Value) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db)?;
        let ts = now();
        let result_text = serde_json::to_string(result)?;

        let changed = tx
            .execute(
                "UPDATE tasks SET status = 'completed', result = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = 'open'",
                params![result_text, ts, id.as_str()],
            )
            .map_err(db)?;
        if changed == 0 {
            return Ok(false);
        }

        let node_changed = tx
            .execute(
                "UPDATE node_instances SET status = 'completed', output = ?1,
                 updated_at = ?2, completed_at = ?2
                 WHERE id = (SELECT node_instance_id FROM tasks WHERE id = ?3)
                 AND status = 'running'",
                params![result_text, ts, id.as_str()],
            )
            .map_err(db)?;
        if node_changed == 0 {
            return Ok(false);
        }

        tx.commit().map_err(db)?;
        Ok(true)
    }

    fn fail_task(&self, id: &TaskId, error: &str) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db)?;
        let ts = now();

        let changed = tx
            .execute(
                "UPDATE tasks SET status = 'failed', updated_at = ?1
                 WHERE id = ?2 AND status = 'open'",
                params![ts, id.as_str()],
            )
            .map_err(db)?;
        if changed == 0 {
            return Ok(false);
        }

        let node_changed = tx
            .execute(
                "UPDATE node_instances SET status = 'failed', error = ?1, updated_at = ?2
                 WHERE id = (SELECT node_instance_id FROM tasks WHERE id = ?3)
                 AND status = 'running'",
                params![error, ts, id.as_str()],
            )
            .map_err(db)?;
        if node_changed == 0 {
            return Ok(false);
        }

        tx.execute(
            "UPDATE instances SET status = 'failed', error = ?1, finished_at = ?2
             WHERE id = (SELECT instance_id FROM tasks WHERE id = ?3) AND status = 'running'",
            params![error, ts, id.as_str()],
        )
        .map_err(db)?;

        tx.commit().map_err(db)?;
        Ok(true)
    }

    fn reopen_task(&self, id: &TaskId) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db)?;
        let ts = now();

        let changed = tx
            .execute(
                "UPDATE tasks SET status = 'open', attempt = attempt + 1, updated_at = ?1
                 WHERE id = ?2 AND status = 'failed'",
                params![ts, id.as_str()],
            )
            .map_err(db)?;
        if changed == 0 {
            return Ok(false);
        }

        let node_changed = tx
            .execute(
                "UPDATE node_instances SET status = 'running', error = NULL,
                 retry_count = retry_count + 1, updated_at = ?1
                 WHERE id = (SELECT node_instance_id FROM tasks WHERE id = ?2)
                 AND status = 'failed'",
                params![ts, id.as_str()],
            )
            .map_err(db)?;
        if node_changed == 0 {
            return Ok(false);
        }

        let instance_id: String = tx
            .query_row(
                "SELECT instance_id FROM tasks WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .map_err(db)?;
        tx.execute(
            "UPDATE instances SET status = 'running', error = NULL, finished_at = NULL
             WHERE id = ?1 AND status = 'failed'",
            params![instance_id],
        )
        .map_err(db)?;
        tx.execute(
            "UPDATE subdivisions SET status = 'running', error = NULL, completed_at = NULL
             WHERE child_instance_id = ?1 AND status = 'failed'",
            params![instance_id],
        )
        .map_err(db)?;

        tx.commit().map_err(db)?;
        Ok(true)
    }

    fn attach_reference_result(&self, id: &TaskId, result: &serde_json::Value) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE tasks SET reference_result = ?1, updated_at = ?2 WHERE id = ?3",
                params![serde_json::to_string(result)?, now(), id.as_str()],
            )
            .map_err(db)?;
        if changed == 0 {
            return Err(TaskweaveError::not_found("task", id));
        }
        Ok(())
    }

    fn insert_subdivision(
        &self,
        subdivision: &Subdivision,
        template: Option<&WorkflowTemplate>,
        child: Option<NewChild<'_>>,
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db)?;

        if let Some(template) = template {
            write_template(&tx, template)?;
        }
        if let Some(child) = child {
            write_instance(&tx, child.instance, child.nodes)?;
        }

        let s = subdivision;
        tx.execute(
            &format!(
                "INSERT INTO subdivisions ({SUBDIVISION_COLS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params![
                s.id.as_str(),
                s.task_id.as_str(),
                s.parent_instance_id.as_str(),
                s.parent_node_key,
                s.template_id.as_ref().map(|id| id.as_str()),
                s.child_instance_id.as_ref().map(|id| id.as_str()),
                s.name,
                s.description,
                s.execute_immediately,
                s.auto_submit,
                s.status.as_str(),
                json_text(s.result.as_ref())?,
                s.error,
                s.created_at.to_rfc3339(),
                s.completed_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(db)?;

        tx.commit().map_err(db)
    }

    fn get_subdivision(&self, id: &SubdivisionId) -> Result<Subdivision> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {SUBDIVISION_COLS} FROM subdivisions WHERE id = ?1"),
            params![id.as_str()],
            subdivision_from_row,
        )
        .optional()
        .map_err(db)?
        .ok_or_else(|| TaskweaveError::not_found("subdivision", id))
    }

    fn subdivisions_for_task(&self, task: &TaskId, active_only: bool) -> Result<Vec<Subdivision>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SUBDIVISION_COLS} FROM subdivisions
                 WHERE task_id = ?1 AND (?2 = 0 OR child_instance_id IS NOT NULL)
                 ORDER BY rowid"
            ))
            .map_err(db)?;
        let rows = stmt
            .query_map(params![task.as_str(), active_only], subdivision_from_row)
            .map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    fn subdivisions_for_instance(&self, instance: &InstanceId) -> Result<Vec<Subdivision>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SUBDIVISION_COLS} FROM subdivisions
                 WHERE parent_instance_id = ?1 ORDER BY rowid"
            ))
            .map_err(db)?;
        let rows = stmt
            .query_map(params![instance.as_str()], subdivision_from_row)
            .map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    fn transition_subdivision(
        &self,
        id: &SubdivisionId,
        from: &[SubdivisionStatus],
        to: SubdivisionStatus,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let terminal = matches!(
            to,
            SubdivisionStatus::Completed | SubdivisionStatus::Failed | SubdivisionStatus::Cancelled
        );
        let completed = terminal.then(now);
        let changed = conn
            .execute(
                &format!(
                    "UPDATE subdivisions SET status = ?1, result = COALESCE(?2, result),
                     error = COALESCE(?3, error), completed_at = COALESCE(?4, completed_at)
                     WHERE id = ?5 AND status IN ({})",
                    in_list(from.iter().map(|s| s.as_str()))
                ),
                params![to.as_str(), json_text(result)?, error, completed, id.as_str()],
            )
            .map_err(db)?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskweave_core::template::{NodeTemplate, WorkflowDesign};

    fn template() -> WorkflowTemplate {
        WorkflowTemplate::from_design(
            WorkflowDesign::new("pair")
                .node(NodeTemplate::human("a", "A"))
                .node(NodeTemplate::human("b", "B"))
                .edge("a", "b"),
        )
        .unwrap()
    }

    fn seeded() -> (SqliteStore, WorkflowTemplate, WorkflowInstance, Vec<NodeInstance>) {
        let store = SqliteStore::in_memory().unwrap();
        let tpl = template();
        store.insert_template(&tpl).unwrap();
        let instance = WorkflowInstance::new(tpl.id.clone(), json!({"k": 1}));
        let nodes: Vec<NodeInstance> = tpl
            .nodes
            .iter()
            .map(|n| NodeInstance::new(instance.id.clone(), n.key.clone()))
            .collect();
        store.create_instance(&instance, &nodes).unwrap();
        (store, tpl, instance, nodes)
    }

    fn task_for(node: &NodeInstance) -> TaskInstance {
        let now = Utc::now();
        TaskInstance {
            id: TaskId::new(),
            node_instance_id: node.id.clone(),
            instance_id: node.instance_id.clone(),
            node_key: node.node_key.clone(),
            title: node.node_key.to_uppercase(),
            description: String::new(),
            kind: NodeKind::Human,
            status: TaskStatus::Open,
            input: json!({}),
            result: None,
            reference_result: None,
            attempt: 1,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_template_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        let tpl = template();
        store.insert_template(&tpl).unwrap();

        let loaded = store.get_template(&tpl.id).unwrap();
        assert_eq!(loaded.nodes, tpl.nodes);
        assert_eq!(loaded.edges, tpl.edges);
        assert_eq!(store.latest_version(&tpl.lineage).unwrap(), 1);
        assert!(matches!(
            store.get_template(&TemplateId::new()),
            Err(TaskweaveError::NotFound { kind: "template", .. })
        ));
    }

    #[test]
    fn test_start_instance_moves_nodes_to_waiting() {
        let (store, _, instance, _) = seeded();
        assert!(store.start_instance(&instance.id).unwrap());
        assert!(!store.start_instance(&instance.id).unwrap());

        let loaded = store.get_instance(&instance.id).unwrap();
        assert_eq!(loaded.status, InstanceStatus::Running);
        assert!(loaded.started_at.is_some());
        assert!(store
            .list_nodes(&instance.id)
            .unwrap()
            .iter()
            .all(|n| n.status == NodeStatus::Waiting));
    }

    #[test]
    fn test_transition_node_is_compare_and_set() {
        let (store, _, instance, nodes) = seeded();
        store.start_instance(&instance.id).unwrap();
        let id = &nodes[0].id;

        let patch = NodePatch {
            input: Some(json!({"x": 1})),
            ..NodePatch::default()
        };
        assert!(store
            .transition_node(id, &[NodeStatus::Waiting], NodeStatus::Ready, &patch)
            .unwrap());
        assert!(!store
            .transition_node(id, &[NodeStatus::Waiting], NodeStatus::Ready, &patch)
            .unwrap());

        let node = store.get_node(id).unwrap();
        assert_eq!(node.status, NodeStatus::Ready);
        assert_eq!(node.input, Some(json!({"x": 1})));
    }

    #[test]
    fn test_create_task_once_per_node() {
        let (store, _, _, nodes) = seeded();
        assert!(store.create_task(&task_for(&nodes[0])).unwrap());
        assert!(!store.create_task(&task_for(&nodes[0])).unwrap());
        assert_eq!(store.list_tasks(&nodes[0].instance_id).unwrap().len(), 1);
        assert!(store.task_for_node(&nodes[1].id).unwrap().is_none());
    }

    #[test]
    fn test_complete_task_updates_node() {
        let (store, _, instance, nodes) = seeded();
        store.start_instance(&instance.id).unwrap();
        store
            .transition_node(
                &nodes[0].id,
                &[NodeStatus::Waiting],
                NodeStatus::Ready,
                &NodePatch::default(),
            )
            .unwrap();
        let task = task_for(&nodes[0]);
        store.create_task(&task).unwrap();

        // Unclaimed nodes cannot complete.
        assert!(!store.complete_task(&task.id, &json!({"early": true})).unwrap());
        assert_eq!(store.get_task(&task.id).unwrap().status, TaskStatus::Open);
        assert!(!store.fail_task(&task.id, "early").unwrap());

        store
            .transition_node(
                &nodes[0].id,
                &[NodeStatus::Ready],
                NodeStatus::Running,
                &NodePatch::default(),
            )
            .unwrap();
        assert!(store.complete_task(&task.id, &json!({"done": true})).unwrap());
        assert!(!store.complete_task(&task.id, &json!({"again": true})).unwrap());

        let node = store.get_node(&nodes[0].id).unwrap();
        assert_eq!(node.status, NodeStatus::Completed);
        assert_eq!(node.output, Some(json!({"done": true})));
        assert!(node.completed_at.is_some());
        assert_eq!(store.get_task(&task.id).unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn test_complete_task_rolls_back_when_node_blocked() {
        let (store, _, instance, nodes) = seeded();
        store.start_instance(&instance.id).unwrap();
        store
            .transition_node(
                &nodes[0].id,
                &[NodeStatus::Waiting],
                NodeStatus::Blocked,
                &NodePatch::default(),
            )
            .unwrap();
        let task = task_for(&nodes[0]);
        store.create_task(&task).unwrap();

        assert!(!store.complete_task(&task.id, &json!(1)).unwrap());
        assert_eq!(store.get_task(&task.id).unwrap().status, TaskStatus::Open);
    }

    #[test]
    fn test_fail_and_reopen_task() {
        let (store, _, instance, nodes) = seeded();
        store.start_instance(&instance.id).unwrap();
        store
            .transition_node(
                &nodes[0].id,
                &[NodeStatus::Waiting],
                NodeStatus::Running,
                &NodePatch::default(),
            )
            .unwrap();
        let task = task_for(&nodes[0]);
        store.create_task(&task).unwrap();

        assert!(store.fail_task(&task.id, "boom").unwrap());
        let loaded = store.get_instance(&instance.id).unwrap();
        assert_eq!(loaded.status, InstanceStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("boom"));

        assert!(store.reopen_task(&task.id).unwrap());
        let node = store.get_node(&nodes[0].id).unwrap();
        assert_eq!(node.status, NodeStatus::Running);
        assert_eq!(node.retry_count, 1);
        assert!(node.error.is_none());
        assert_eq!(store.get_task(&task.id).unwrap().attempt, 2);
        assert_eq!(
            store.get_instance(&instance.id).unwrap().status,
            InstanceStatus::Running
        );
    }

    #[test]
    fn test_cancel_instance_cascades() {
        let (store, _, instance, nodes) = seeded();
        store.start_instance(&instance.id).unwrap();
        store
            .transition_node(
                &nodes[0].id,
                &[NodeStatus::Waiting],
                NodeStatus::Ready,
                &NodePatch::default(),
            )
            .unwrap();
        let task = task_for(&nodes[0]);
        store.create_task(&task).unwrap();

        assert!(store.cancel_instance(&instance.id).unwrap());
        assert!(!store.cancel_instance(&instance.id).unwrap());
        assert!(store
            .list_nodes(&instance.id)
            .unwrap()
            .iter()
            .all(|n| n.status == NodeStatus::Cancelled));
        assert_eq!(store.get_task(&task.id).unwrap().status, TaskStatus::Cancelled);
    }

    #[test]
    fn test_commit_merged_template_rolls_back() {
        let store = SqliteStore::in_memory().unwrap();
        let tpl = template();
        store.insert_template(&tpl).unwrap();

        let mut merged = tpl.clone();
        merged.id = TemplateId::new();
        merged.version = 2;
        merged.derived_from = Some(tpl.id.clone());

        let err = store
            .commit_merged_template(&merged, Some(&TemplateId::new()))
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(store.get_template(&merged.id).is_err());
        assert_eq!(store.latest_version(&tpl.lineage).unwrap(), 1);

        store.commit_merged_template(&merged, Some(&tpl.id)).unwrap();
        assert_eq!(store.latest_version(&tpl.lineage).unwrap(), 2);
        assert_eq!(
            store.get_template(&tpl.id).unwrap().superseded_by,
            Some(merged.id.clone())
        );
    }

    #[test]
    fn test_subdivision_active_filter() {
        let (store, _, instance, nodes) = seeded();
        let task = task_for(&nodes[0]);
        store.create_task(&task).unwrap();

        let rejected = Subdivision {
            id: SubdivisionId::new(),
            task_id: task.id.clone(),
            parent_instance_id: instance.id.clone(),
            parent_node_key: "a".into(),
            template_id: None,
            child_instance_id: None,
            name: "rejected".into(),
            description: String::new(),
            execute_immediately: true,
            auto_submit: false,
            status: SubdivisionStatus::Failed,
            result: None,
            error: Some("cycle".into()),
            created_at: Utc::now(),
            completed_at: None,
        };
        store.insert_subdivision(&rejected, None, None).unwrap();

        let child_tpl = template();
        let child = WorkflowInstance::new(child_tpl.id.clone(), json!({}));
        let child_nodes = vec![NodeInstance::new(child.id.clone(), "a")];
        let accepted = Subdivision {
            id: SubdivisionId::new(),
            template_id: Some(child_tpl.id.clone()),
            child_instance_id: Some(child.id.clone()),
            name: "accepted".into(),
            status: SubdivisionStatus::Pending,
            error: None,
            ..rejected.clone()
        };
        store
            .insert_subdivision(
                &accepted,
                Some(&child_tpl),
                Some(NewChild {
                    instance: &child,
                    nodes: &child_nodes,
                }),
            )
            .unwrap();

        assert_eq!(store.subdivisions_for_task(&task.id, false).unwrap().len(), 2);
        let active = store.subdivisions_for_task(&task.id, true).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, accepted.id);
        assert_eq!(store.subdivisions_for_instance(&instance.id).unwrap().len(), 2);
        assert_eq!(store.list_nodes(&child.id).unwrap().len(), 1);

        assert!(!store
            .transition_subdivision(
                &accepted.id,
                &[SubdivisionStatus::Running],
                SubdivisionStatus::Completed,
                None,
                None
            )
            .unwrap());
        assert!(store
            .transition_subdivision(
                &accepted.id,
                &[SubdivisionStatus::Pending],
                SubdivisionStatus::Running,
                None,
                None
            )
            .unwrap());
    }
}
