use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum_macros::{Display, EnumString};

/// How a task is triggered: on a cron schedule, or by an event/condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Schedule,
    Event,
}

/// Meaningful only when `trigger_type == Event`; forced to `Script` for
/// schedule tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Script,
    SystemBoot,
    SystemShutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Running,
    Success,
    Failed,
}

/// Why a particular execution was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    Schedule,
    Condition,
    Manual,
    SystemBoot,
    SystemShutdown,
}

/// A de-duplicated, self-reference-free, order-preserving list of task ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PreTaskIds(pub Vec<i64>);

impl PreTaskIds {
    /// Normalizes an arbitrary id list against `own_id`: drops the task's
    /// own id, then de-duplicates while preserving first-seen order.
    pub fn normalize(ids: impl IntoIterator<Item = i64>, own_id: Option<i64>) -> Self {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for id in ids {
            if Some(id) == own_id {
                continue;
            }
            if seen.insert(id) {
                out.push(id);
            }
        }
        Self(out)
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.0
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "[]".to_owned())
    }

    pub fn from_json(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_default()
    }
}

impl fmt::Display for PreTaskIds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub account: String,
    pub trigger_type: TriggerType,
    pub schedule_expression: Option<String>,
    pub condition_script: Option<String>,
    pub condition_interval: i64,
    pub event_type: EventType,
    pub is_active: bool,
    pub pre_task_ids: PreTaskIds,
    pub script_body: String,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_condition_check_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Client-supplied payload for creating or partially updating a task.
/// `None` fields default to the existing row's value on update, or to the
/// documented defaults on create.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskPayload {
    pub name: Option<String>,
    pub account: Option<String>,
    pub trigger_type: Option<TriggerType>,
    pub schedule_expression: Option<String>,
    pub condition_script: Option<String>,
    pub condition_interval: Option<i64>,
    pub event_type: Option<EventType>,
    pub is_active: Option<bool>,
    pub pre_task_ids: Option<PreTaskIdsInput>,
    pub script_body: Option<String>,
}

/// `pre_task_ids` accepts either a JSON array of integers, or a JSON string
/// that itself decodes to one (per §4.6's translation rules).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PreTaskIdsInput {
    List(Vec<i64>),
    Encoded(String),
}

impl PreTaskIdsInput {
    pub fn into_ids(self) -> Vec<i64> {
        match self {
            PreTaskIdsInput::List(ids) => ids,
            PreTaskIdsInput::Encoded(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub id: i64,
    pub task_id: i64,
    pub status: ResultStatus,
    pub trigger_reason: TriggerReason,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub log: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskWithLatestResult {
    #[serde(flatten)]
    pub task: Task,
    pub latest_result: Option<TaskResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub key: String,
    pub name: String,
    pub body: String,
}

/// A template without its key, used for the bulk export/import wire format
/// where the key is the map entry's key rather than a field (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateBody {
    pub name: String,
    pub body: String,
}

pub const MIN_CONDITION_INTERVAL_SECS: i64 = 10;
pub const CURRENT_SCHEMA_VERSION: i64 = 2;

pub fn clamp_condition_interval(seconds: i64) -> i64 {
    seconds.max(MIN_CONDITION_INTERVAL_SECS)
}
