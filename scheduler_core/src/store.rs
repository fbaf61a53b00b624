//! Durable storage for tasks, task results, and templates.
//!
//! Mirrors the original service's `Database` class: a single connection
//! guarded by a lock (there it was a process-wide `threading.RLock`; here
//! it is a `tokio::sync::Mutex` wrapped in an `Arc` and threaded explicitly
//! through the Engine and API rather than kept as a singleton).

use crate::account::ensure_account_allowed;
use crate::cron::CronExpression;
use crate::error::{SchedulerError, SchedulerResult};
use crate::model::{
    clamp_condition_interval, EventType, PreTaskIds, ResultStatus, Task, TaskPayload, TaskResult,
    Template, TriggerReason, TriggerType, CURRENT_SCHEMA_VERSION,
};
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{ConnectOptions, Connection, Row, SqliteConnection};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub struct Store {
    conn: Arc<Mutex<Option<SqliteConnection>>>,
}

impl Clone for Store {
    fn clone(&self) -> Self {
        Self { conn: self.conn.clone() }
    }
}

impl Store {
    pub async fn open(db_path: &str) -> SchedulerResult<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{db_path}"))
            .map_err(|e| SchedulerError::Internal(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);
        let mut conn = options.connect().await?;
        migrate(&mut conn).await?;
        Ok(Self { conn: Arc::new(Mutex::new(Some(conn))) })
    }

    #[cfg(any(test, feature = "test-support"))]
    pub async fn open_in_memory() -> SchedulerResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| SchedulerError::Internal(e.to_string()))?
            .foreign_keys(true);
        let mut conn = options.connect().await?;
        migrate(&mut conn).await?;
        Ok(Self { conn: Arc::new(Mutex::new(Some(conn))) })
    }

    /// Takes ownership of the underlying connection and closes it. A no-op
    /// if already closed (e.g. called twice during shutdown); subsequent
    /// queries against this `Store` fail with `Internal("store is closed")`.
    pub async fn close(&self) {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.take() {
            if let Err(e) = conn.close().await {
                warn!("error closing store connection: {e}");
            }
        }
        info!("store closed");
    }

    // ---- tasks ----

    pub async fn list_tasks(&self) -> SchedulerResult<Vec<Task>> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| SchedulerError::Internal("store is closed".to_owned()))?;
        let rows = sqlx::query("SELECT * FROM tasks ORDER BY id")
            .fetch_all(&mut *conn)
            .await?;
        rows.iter().map(row_to_task).collect()
    }

    pub async fn get_task(&self, id: i64) -> SchedulerResult<Task> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| SchedulerError::Internal("store is closed".to_owned()))?;
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| SchedulerError::not_found(format!("task {id}")))?;
        row_to_task(&row)
    }

    pub async fn list_due_tasks(&self, moment: DateTime<Utc>) -> SchedulerResult<Vec<Task>> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| SchedulerError::Internal("store is closed".to_owned()))?;
        let rows = sqlx::query(
            "SELECT * FROM tasks \
             WHERE trigger_type = 'schedule' AND is_active = 1 AND next_run_at IS NOT NULL \
             AND next_run_at <= ? ORDER BY next_run_at ASC, id ASC",
        )
        .bind(moment.to_rfc3339())
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(row_to_task).collect()
    }

    pub async fn list_event_tasks(&self, event_type: Option<EventType>) -> SchedulerResult<Vec<Task>> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| SchedulerError::Internal("store is closed".to_owned()))?;
        let rows = match event_type {
            Some(et) => {
                sqlx::query(
                    "SELECT * FROM tasks WHERE trigger_type = 'event' AND is_active = 1 \
                     AND event_type = ? ORDER BY id",
                )
                .bind(et.to_string())
                .fetch_all(&mut *conn)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM tasks WHERE trigger_type = 'event' AND is_active = 1 ORDER BY id")
                    .fetch_all(&mut *conn)
                    .await?
            }
        };
        rows.iter().map(row_to_task).collect()
    }

    pub async fn create_task(&self, payload: TaskPayload) -> SchedulerResult<Task> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| SchedulerError::Internal("store is closed".to_owned()))?;
        let now = Utc::now();
        let prepared = prepare_payload(&payload, None)?;

        let next_run_at = match prepared.trigger_type {
            TriggerType::Schedule => {
                let expr = CronExpression::parse(prepared.schedule_expression.as_deref().unwrap())?;
                Some(expr.next_after(now)?)
            }
            TriggerType::Event => None,
        };

        let result = sqlx::query(
            "INSERT INTO tasks (\
                name, account, trigger_type, schedule_expression, condition_script, \
                condition_interval, event_type, is_active, pre_task_ids, script_body, \
                last_run_at, next_run_at, last_condition_check_at, created_at, updated_at\
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, NULL, ?, ?)",
        )
        .bind(&prepared.name)
        .bind(&prepared.account)
        .bind(prepared.trigger_type.to_string())
        .bind(&prepared.schedule_expression)
        .bind(&prepared.condition_script)
        .bind(prepared.condition_interval)
        .bind(prepared.event_type.to_string())
        .bind(prepared.is_active)
        .bind(prepared.pre_task_ids.to_json())
        .bind(&prepared.script_body)
        .bind(next_run_at.map(|t| t.to_rfc3339()))
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&mut *conn)
        .await
        .map_err(unique_violation_to_validation)?;

        let id = result.last_insert_rowid();
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *conn)
            .await?;
        row_to_task(&row)
    }

    pub async fn update_task(&self, id: i64, payload: TaskPayload) -> SchedulerResult<Task> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| SchedulerError::Internal("store is closed".to_owned()))?;
        let existing_row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| SchedulerError::not_found(format!("task {id}")))?;
        let existing = row_to_task(&existing_row)?;

        let prepared = prepare_payload(&payload, Some(&existing))?;
        let now = Utc::now();

        let schedule_changed = prepared.schedule_expression != existing.schedule_expression;
        let next_run_at = match prepared.trigger_type {
            TriggerType::Schedule if schedule_changed || existing.next_run_at.is_none() => {
                let expr = CronExpression::parse(prepared.schedule_expression.as_deref().unwrap())?;
                Some(expr.next_after(now)?)
            }
            TriggerType::Schedule => existing.next_run_at,
            TriggerType::Event => None,
        };

        sqlx::query(
            "UPDATE tasks SET name = ?, account = ?, trigger_type = ?, schedule_expression = ?, \
             condition_script = ?, condition_interval = ?, event_type = ?, is_active = ?, \
             pre_task_ids = ?, script_body = ?, next_run_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&prepared.name)
        .bind(&prepared.account)
        .bind(prepared.trigger_type.to_string())
        .bind(&prepared.schedule_expression)
        .bind(&prepared.condition_script)
        .bind(prepared.condition_interval)
        .bind(prepared.event_type.to_string())
        .bind(prepared.is_active)
        .bind(prepared.pre_task_ids.to_json())
        .bind(&prepared.script_body)
        .bind(next_run_at.map(|t| t.to_rfc3339()))
        .bind(now.to_rfc3339())
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(unique_violation_to_validation)?;

        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *conn)
            .await?;
        row_to_task(&row)
    }

    pub async fn delete_task(&self, id: i64) -> SchedulerResult<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| SchedulerError::Internal("store is closed".to_owned()))?;
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(SchedulerError::not_found(format!("task {id}")));
        }
        Ok(())
    }

    pub async fn update_last_run(&self, task_id: i64) -> SchedulerResult<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| SchedulerError::Internal("store is closed".to_owned()))?;
        sqlx::query("UPDATE tasks SET last_run_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(task_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn update_condition_check(&self, task_id: i64, at: DateTime<Utc>) -> SchedulerResult<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| SchedulerError::Internal("store is closed".to_owned()))?;
        sqlx::query("UPDATE tasks SET last_condition_check_at = ? WHERE id = ?")
            .bind(at.to_rfc3339())
            .bind(task_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Computes the next fire time via the cron evaluator starting from
    /// `base` and persists it. Used both to advance a fired task and to
    /// push a dependency-blocked task forward by one minute (§4.5).
    pub async fn schedule_next_run(
        &self,
        task_id: i64,
        expression: &str,
        base: DateTime<Utc>,
    ) -> SchedulerResult<DateTime<Utc>> {
        let expr = CronExpression::parse(expression)?;
        let next = expr.next_after(base)?;
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| SchedulerError::Internal("store is closed".to_owned()))?;
        sqlx::query("UPDATE tasks SET next_run_at = ? WHERE id = ?")
            .bind(next.to_rfc3339())
            .bind(task_id)
            .execute(&mut *conn)
            .await?;
        Ok(next)
    }

    /// Pushes a dependency-blocked task's `next_run_at` forward by exactly
    /// one minute without recomputing from the cron expression (§4.5).
    pub async fn postpone_due_task(&self, task_id: i64, now: DateTime<Utc>) -> SchedulerResult<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| SchedulerError::Internal("store is closed".to_owned()))?;
        sqlx::query("UPDATE tasks SET next_run_at = ? WHERE id = ?")
            .bind((now + Duration::minutes(1)).to_rfc3339())
            .bind(task_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    // ---- results ----

    pub async fn record_result_start(
        &self,
        task_id: i64,
        trigger_reason: TriggerReason,
    ) -> SchedulerResult<i64> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| SchedulerError::Internal("store is closed".to_owned()))?;
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO task_results (task_id, status, trigger_reason, started_at, finished_at, log) \
             VALUES (?, 'running', ?, ?, NULL, '')",
        )
        .bind(task_id)
        .bind(trigger_reason.to_string())
        .bind(now.to_rfc3339())
        .execute(&mut *conn)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Idempotent: only overwrites a result that is still `running`
    /// (see SPEC_FULL §9 "Double-finalize").
    pub async fn finalize_result(
        &self,
        result_id: i64,
        status: ResultStatus,
        log: &str,
    ) -> SchedulerResult<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| SchedulerError::Internal("store is closed".to_owned()))?;
        sqlx::query(
            "UPDATE task_results SET status = ?, finished_at = ?, log = ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(status.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(log)
        .bind(result_id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn get_latest_result(&self, task_id: i64) -> SchedulerResult<Option<TaskResult>> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| SchedulerError::Internal("store is closed".to_owned()))?;
        let row = sqlx::query(
            "SELECT * FROM task_results WHERE task_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(task_id)
        .fetch_optional(&mut *conn)
        .await?;
        row.as_ref().map(row_to_result).transpose()
    }

    pub async fn has_running_instance(&self, task_id: i64) -> SchedulerResult<bool> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| SchedulerError::Internal("store is closed".to_owned()))?;
        let row = sqlx::query(
            "SELECT COUNT(*) as c FROM task_results WHERE task_id = ? AND status = 'running'",
        )
        .bind(task_id)
        .fetch_one(&mut *conn)
        .await?;
        let count: i64 = row.try_get("c")?;
        Ok(count > 0)
    }

    pub async fn fetch_results(
        &self,
        task_id: i64,
        limit: i64,
        offset: i64,
    ) -> SchedulerResult<Vec<TaskResult>> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| SchedulerError::Internal("store is closed".to_owned()))?;
        let rows = sqlx::query(
            "SELECT * FROM task_results WHERE task_id = ? ORDER BY id DESC LIMIT ? OFFSET ?",
        )
        .bind(task_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(row_to_result).collect()
    }

    pub async fn delete_results(&self, task_id: i64, result_id: Option<i64>) -> SchedulerResult<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| SchedulerError::Internal("store is closed".to_owned()))?;
        match result_id {
            Some(rid) => {
                sqlx::query("DELETE FROM task_results WHERE task_id = ? AND id = ?")
                    .bind(task_id)
                    .bind(rid)
                    .execute(&mut *conn)
                    .await?;
            }
            None => {
                sqlx::query("DELETE FROM task_results WHERE task_id = ?")
                    .bind(task_id)
                    .execute(&mut *conn)
                    .await?;
            }
        }
        Ok(())
    }

    /// True iff every id in `pre_task_ids` has a latest result of `success`
    /// (§4.5). An id with no results at all blocks the task.
    pub async fn dependencies_met(&self, pre_task_ids: &PreTaskIds) -> SchedulerResult<bool> {
        for id in pre_task_ids.as_slice() {
            match self.get_latest_result(*id).await? {
                Some(result) if result.status == ResultStatus::Success => continue,
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    // ---- templates ----

    pub async fn list_templates(&self) -> SchedulerResult<Vec<Template>> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| SchedulerError::Internal("store is closed".to_owned()))?;
        let rows = sqlx::query("SELECT * FROM templates ORDER BY key")
            .fetch_all(&mut *conn)
            .await?;
        rows.iter().map(row_to_template).collect()
    }

    pub async fn get_template(&self, key: &str) -> SchedulerResult<Template> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| SchedulerError::Internal("store is closed".to_owned()))?;
        let row = sqlx::query("SELECT * FROM templates WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| SchedulerError::not_found(format!("template {key}")))?;
        row_to_template(&row)
    }

    pub async fn upsert_template(&self, template: &Template) -> SchedulerResult<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| SchedulerError::Internal("store is closed".to_owned()))?;
        sqlx::query(
            "INSERT INTO templates (key, name, body) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET name = excluded.name, body = excluded.body",
        )
        .bind(&template.key)
        .bind(&template.name)
        .bind(&template.body)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn delete_template(&self, key: &str) -> SchedulerResult<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| SchedulerError::Internal("store is closed".to_owned()))?;
        let result = sqlx::query("DELETE FROM templates WHERE key = ?")
            .bind(key)
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(SchedulerError::not_found(format!("template {key}")));
        }
        Ok(())
    }
}

struct PreparedPayload {
    name: String,
    account: String,
    trigger_type: TriggerType,
    schedule_expression: Option<String>,
    condition_script: Option<String>,
    condition_interval: i64,
    event_type: EventType,
    is_active: bool,
    pre_task_ids: PreTaskIds,
    script_body: String,
}

/// Validates and normalizes a payload against the existing row (for
/// updates) or documented create defaults, per §4.2.
fn prepare_payload(payload: &TaskPayload, existing: Option<&Task>) -> SchedulerResult<PreparedPayload> {
    let name = payload
        .name
        .clone()
        .or_else(|| existing.map(|t| t.name.clone()))
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| SchedulerError::validation("name must not be empty"))?;

    let script_body = payload
        .script_body
        .clone()
        .or_else(|| existing.map(|t| t.script_body.clone()))
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| SchedulerError::validation("script_body must not be empty"))?;

    let account = payload
        .account
        .clone()
        .or_else(|| existing.map(|t| t.account.clone()))
        .filter(|a| !a.trim().is_empty())
        .ok_or_else(|| SchedulerError::validation("account must not be empty"))?;
    ensure_account_allowed(&account)?;

    let trigger_type = payload
        .trigger_type
        .or_else(|| existing.map(|t| t.trigger_type))
        .unwrap_or(TriggerType::Schedule);

    let condition_interval = clamp_condition_interval(
        payload
            .condition_interval
            .or_else(|| existing.map(|t| t.condition_interval))
            .unwrap_or(crate::model::MIN_CONDITION_INTERVAL_SECS),
    );

    let own_id = existing.map(|t| t.id);
    let pre_task_ids = match &payload.pre_task_ids {
        Some(input) => PreTaskIds::normalize(input.clone().into_ids(), own_id),
        None => existing
            .map(|t| t.pre_task_ids.clone())
            .unwrap_or_default(),
    };

    let is_active = payload
        .is_active
        .or_else(|| existing.map(|t| t.is_active))
        .unwrap_or(true);

    match trigger_type {
        TriggerType::Schedule => {
            let schedule_expression = payload
                .schedule_expression
                .clone()
                .or_else(|| existing.and_then(|t| t.schedule_expression.clone()))
                .ok_or_else(|| SchedulerError::validation("schedule_expression is required"))?;
            CronExpression::parse(&schedule_expression)?;
            Ok(PreparedPayload {
                name,
                account,
                trigger_type,
                schedule_expression: Some(schedule_expression),
                condition_script: None,
                condition_interval,
                event_type: EventType::Script,
                is_active,
                pre_task_ids,
                script_body,
            })
        }
        TriggerType::Event => {
            let event_type = payload
                .event_type
                .or_else(|| existing.map(|t| t.event_type))
                .unwrap_or(EventType::Script);
            let condition_script = if event_type == EventType::Script {
                Some(
                    payload
                        .condition_script
                        .clone()
                        .or_else(|| existing.and_then(|t| t.condition_script.clone()))
                        .ok_or_else(|| SchedulerError::validation("condition_script is required"))?,
                )
            } else {
                None
            };
            Ok(PreparedPayload {
                name,
                account,
                trigger_type,
                schedule_expression: None,
                condition_script,
                condition_interval,
                event_type,
                is_active,
                pre_task_ids,
                script_body,
            })
        }
    }
}

fn unique_violation_to_validation(err: sqlx::Error) -> SchedulerError {
    if let sqlx::Error::Database(ref db_err) = err {
        if db_err.code().as_deref() == Some("2067") || db_err.message().contains("UNIQUE") {
            return SchedulerError::validation("task name must be unique");
        }
    }
    SchedulerError::Db(err)
}

fn row_to_task(row: &SqliteRow) -> SchedulerResult<Task> {
    Ok(Task {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        account: row.try_get("account")?,
        trigger_type: parse_required(row.try_get::<String, _>("trigger_type")?)?,
        schedule_expression: row.try_get("schedule_expression")?,
        condition_script: row.try_get("condition_script")?,
        condition_interval: row.try_get("condition_interval")?,
        event_type: parse_required(row.try_get::<String, _>("event_type")?)?,
        is_active: row.try_get("is_active")?,
        pre_task_ids: PreTaskIds::from_json(&row.try_get::<String, _>("pre_task_ids")?),
        script_body: row.try_get("script_body")?,
        last_run_at: parse_optional_time(row.try_get("last_run_at")?)?,
        next_run_at: parse_optional_time(row.try_get("next_run_at")?)?,
        last_condition_check_at: parse_optional_time(row.try_get("last_condition_check_at")?)?,
        created_at: parse_time(row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_time(row.try_get::<String, _>("updated_at")?)?,
    })
}

fn row_to_result(row: &SqliteRow) -> SchedulerResult<TaskResult> {
    Ok(TaskResult {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        status: parse_required(row.try_get::<String, _>("status")?)?,
        trigger_reason: parse_required(row.try_get::<String, _>("trigger_reason")?)?,
        started_at: parse_time(row.try_get::<String, _>("started_at")?)?,
        finished_at: parse_optional_time(row.try_get("finished_at")?)?,
        log: row.try_get("log")?,
    })
}

fn row_to_template(row: &SqliteRow) -> SchedulerResult<Template> {
    Ok(Template {
        key: row.try_get("key")?,
        name: row.try_get("name")?,
        body: row.try_get("body")?,
    })
}

fn parse_required<T: std::str::FromStr>(raw: String) -> SchedulerResult<T> {
    raw.parse()
        .map_err(|_| SchedulerError::Internal(format!("unparseable stored enum value '{raw}'")))
}

fn parse_time(raw: String) -> SchedulerResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SchedulerError::Internal(format!("unparseable stored timestamp: {e}")))
}

fn parse_optional_time(raw: Option<String>) -> SchedulerResult<Option<DateTime<Utc>>> {
    raw.map(parse_time).transpose()
}

/// Applies schema migrations. Version 0 creates the full schema; version 1
/// additively adds `event_type`, tolerating a "duplicate column" error from
/// a prior partial migration. The template table is created unconditionally
/// as an idempotent safeguard for upgrades from pre-template builds.
async fn migrate(conn: &mut SqliteConnection) -> SchedulerResult<()> {
    let version: i64 = sqlx::query("PRAGMA user_version")
        .fetch_one(&mut *conn)
        .await?
        .try_get(0)?;

    if version == 0 {
        create_schema(conn).await?;
    }
    if version < CURRENT_SCHEMA_VERSION {
        let added = sqlx::query("ALTER TABLE tasks ADD COLUMN event_type TEXT NOT NULL DEFAULT 'script'")
            .execute(&mut *conn)
            .await;
        if let Err(e) = added {
            if !is_duplicate_column(&e) {
                return Err(e.into());
            }
            warn!("event_type column already present, skipping migration step");
        }
    }

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS templates (\
            key TEXT PRIMARY KEY, \
            name TEXT NOT NULL, \
            body TEXT NOT NULL\
         )",
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(&format!("PRAGMA user_version = {CURRENT_SCHEMA_VERSION}"))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn is_duplicate_column(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.message().contains("duplicate column"))
}

async fn create_schema(conn: &mut SqliteConnection) -> SchedulerResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS tasks (\
            id INTEGER PRIMARY KEY AUTOINCREMENT, \
            name TEXT NOT NULL UNIQUE, \
            account TEXT NOT NULL, \
            trigger_type TEXT NOT NULL, \
            schedule_expression TEXT, \
            condition_script TEXT, \
            condition_interval INTEGER NOT NULL DEFAULT 10, \
            event_type TEXT NOT NULL DEFAULT 'script', \
            is_active INTEGER NOT NULL DEFAULT 1, \
            pre_task_ids TEXT NOT NULL DEFAULT '[]', \
            script_body TEXT NOT NULL, \
            last_run_at TEXT, \
            next_run_at TEXT, \
            last_condition_check_at TEXT, \
            created_at TEXT NOT NULL, \
            updated_at TEXT NOT NULL\
         )",
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS task_results (\
            id INTEGER PRIMARY KEY AUTOINCREMENT, \
            task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE, \
            status TEXT NOT NULL, \
            trigger_reason TEXT NOT NULL, \
            started_at TEXT NOT NULL, \
            finished_at TEXT, \
            log TEXT NOT NULL DEFAULT ''\
         )",
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_task_results_task ON task_results(task_id)")
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskPayload;

    fn payload(name: &str, expr: &str) -> TaskPayload {
        TaskPayload {
            name: Some(name.to_owned()),
            account: Some(current_test_account()),
            trigger_type: Some(TriggerType::Schedule),
            schedule_expression: Some(expr.to_owned()),
            script_body: Some("echo hi".to_owned()),
            ..Default::default()
        }
    }

    fn current_test_account() -> String {
        crate::account::current_account_name().unwrap_or_else(|_| "root".to_owned())
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = Store::open_in_memory().await.unwrap();
        let created = store.create_task(payload("hourly", "0 * * * *")).await.unwrap();
        let fetched = store.get_task(created.id).await.unwrap();
        assert_eq!(created.id, fetched.id);
        assert_eq!(fetched.name, "hourly");
        assert!(fetched.next_run_at.is_some());
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let store = Store::open_in_memory().await.unwrap();
        store.create_task(payload("dup", "0 * * * *")).await.unwrap();
        let err = store.create_task(payload("dup", "0 * * * *")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));
    }

    #[tokio::test]
    async fn pre_task_ids_self_reference_is_dropped() {
        let store = Store::open_in_memory().await.unwrap();
        let created = store.create_task(payload("self", "0 * * * *")).await.unwrap();
        let mut update = TaskPayload::default();
        update.pre_task_ids = Some(crate::model::PreTaskIdsInput::List(vec![
            created.id,
            created.id,
            99,
        ]));
        let updated = store.update_task(created.id, update).await.unwrap();
        assert_eq!(updated.pre_task_ids.as_slice(), &[99]);
    }

    #[tokio::test]
    async fn finalize_is_idempotent() {
        let store = Store::open_in_memory().await.unwrap();
        let created = store.create_task(payload("finalize", "0 * * * *")).await.unwrap();
        let result_id = store
            .record_result_start(created.id, TriggerReason::Manual)
            .await
            .unwrap();
        store.finalize_result(result_id, ResultStatus::Success, "ok").await.unwrap();
        store.finalize_result(result_id, ResultStatus::Failed, "overwritten?").await.unwrap();
        let latest = store.get_latest_result(created.id).await.unwrap().unwrap();
        assert_eq!(latest.status, ResultStatus::Success);
        assert_eq!(latest.log, "ok");
    }

    #[tokio::test]
    async fn has_running_instance_reflects_state() {
        let store = Store::open_in_memory().await.unwrap();
        let created = store.create_task(payload("running", "0 * * * *")).await.unwrap();
        assert!(!store.has_running_instance(created.id).await.unwrap());
        let result_id = store
            .record_result_start(created.id, TriggerReason::Manual)
            .await
            .unwrap();
        assert!(store.has_running_instance(created.id).await.unwrap());
        store.finalize_result(result_id, ResultStatus::Success, "").await.unwrap();
        assert!(!store.has_running_instance(created.id).await.unwrap());
    }

    #[tokio::test]
    async fn dependency_gate_requires_success() {
        let store = Store::open_in_memory().await.unwrap();
        let a = store.create_task(payload("a", "0 * * * *")).await.unwrap();
        let ids = PreTaskIds(vec![a.id]);
        assert!(!store.dependencies_met(&ids).await.unwrap());
        let rid = store.record_result_start(a.id, TriggerReason::Manual).await.unwrap();
        store.finalize_result(rid, ResultStatus::Failed, "").await.unwrap();
        assert!(!store.dependencies_met(&ids).await.unwrap());
        let rid2 = store.record_result_start(a.id, TriggerReason::Manual).await.unwrap();
        store.finalize_result(rid2, ResultStatus::Success, "").await.unwrap();
        assert!(store.dependencies_met(&ids).await.unwrap());
    }
}
