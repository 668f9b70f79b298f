use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{DecodeError, HandlerError};
use crate::retry_policy::DEFAULT_MAX_DELIVER;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskType {
  Provision,
  Deprovision,
  Update,
  /// Kept so that a newer publisher cannot turn a task into a decode failure.
  Unknown(String),
}

impl TaskType {
  pub fn as_str(&self) -> &str {
    match self {
      TaskType::Provision => "provision",
      TaskType::Deprovision => "deprovision",
      TaskType::Update => "update",
      TaskType::Unknown(other) => other,
    }
  }
}

impl From<String> for TaskType {
  fn from(value: String) -> Self {
    match value.as_str() {
      "provision" => TaskType::Provision,
      "deprovision" => TaskType::Deprovision,
      "update" => TaskType::Update,
      _ => TaskType::Unknown(value),
    }
  }
}

impl From<TaskType> for String {
  fn from(value: TaskType) -> Self {
    value.as_str().to_string()
  }
}

impl fmt::Display for TaskType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

fn first_attempt() -> u32 {
  1
}

fn default_max_retries() -> u32 {
  DEFAULT_MAX_DELIVER
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
  pub task_id: String,
  pub tenant_id: String,
  pub task_type: TaskType,
  pub module_id: String,
  #[serde(default)]
  pub payload: Map<String, Value>,
  /// Overwritten from the broker's delivery count on every fetch.
  #[serde(default = "first_attempt")]
  pub attempt: u32,
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
  pub created_at: DateTime<Utc>,
}

impl Task {
  pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
    Ok(serde_json::from_slice(data)?)
  }

  /// Typed view of `payload` for this task's type.
  pub fn spec(&self) -> Result<TaskSpec, HandlerError> {
    let payload = Value::Object(self.payload.clone());
    let invalid = |e: serde_json::Error| HandlerError::InvalidPayload {
      task_type: self.task_type.to_string(),
      message: e.to_string(),
    };
    match &self.task_type {
      TaskType::Provision => serde_json::from_value(payload).map(TaskSpec::Provision).map_err(invalid),
      TaskType::Deprovision => serde_json::from_value(payload).map(TaskSpec::Deprovision).map_err(invalid),
      TaskType::Update => serde_json::from_value(payload).map(TaskSpec::Update).map_err(invalid),
      TaskType::Unknown(other) => Err(HandlerError::UnknownTaskType(other.clone())),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskSpec {
  Provision(ProvisionSpec),
  Deprovision(DeprovisionSpec),
  Update(UpdateSpec),
}

impl TaskSpec {
  pub fn tenant_code(&self) -> &str {
    match self {
      TaskSpec::Provision(spec) => &spec.tenant_code,
      TaskSpec::Deprovision(spec) => &spec.tenant_code,
      TaskSpec::Update(spec) => &spec.tenant_code,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionSpec {
  pub tenant_code: String,
  pub customer_id: Option<String>,
  pub deployment_type: Option<String>,
  pub subscription_plan_id: Option<String>,
  #[serde(default)]
  pub custom_features: Map<String, Value>,
  pub user_id: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeprovisionSpec {
  pub tenant_code: String,
  pub reason: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateSpec {
  pub tenant_code: String,
  #[serde(default)]
  pub features: Map<String, Value>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
  Success,
  Failed,
  Retrying,
}

impl fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      TaskStatus::Success => "success",
      TaskStatus::Failed => "failed",
      TaskStatus::Retrying => "retrying",
    };
    f.write_str(s)
  }
}

/// Serialized as either a `message` or an `error` key, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultDetail {
  Message(String),
  Error(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
  pub task_id: String,
  pub status: TaskStatus,
  #[serde(flatten)]
  pub detail: ResultDetail,
  /// Milliseconds spent in the handler.
  pub duration: u64,
  pub timestamp: DateTime<Utc>,
}

impl TaskResult {
  pub fn success(task: &Task, duration: u64) -> Self {
    Self {
      task_id: task.task_id.clone(),
      status: TaskStatus::Success,
      detail: ResultDetail::Message(format!("Task {} completed successfully", task.task_type)),
      duration,
      timestamp: Utc::now(),
    }
  }

  pub fn failure(task: &Task, error: &HandlerError, duration: u64, retrying: bool) -> Self {
    Self {
      task_id: task.task_id.clone(),
      status: if retrying { TaskStatus::Retrying } else { TaskStatus::Failed },
      detail: ResultDetail::Error(error.to_string()),
      duration,
      timestamp: Utc::now(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
  pub task: Task,
  pub error: String,
  pub final_attempt: u32,
  pub dlq_timestamp: DateTime<Utc>,
  pub worker_id: String,
}
