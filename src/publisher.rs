use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use provq::bootstrap::{ensure_stream, StreamSpec};
use provq::logging;
use provq::messaging::{publish_message, BrokerContext, SUBJECT_TASKS};
use provq::models::{Task, TaskType};
use provq::retry_policy::DEFAULT_MAX_DELIVER;

/// Publishes a single provisioning task to the work queue.
#[derive(Parser, Debug)]
#[command(name = "provq_publish", version)]
struct Args {
  #[arg(long, env = "NATS_URL", default_value = "nats://localhost:4222")]
  nats_url: String,

  #[arg(long)]
  tenant_id: String,

  #[arg(long, default_value = "all")]
  module_id: String,

  /// provision, deprovision or update
  #[arg(long, default_value = "provision")]
  task_type: String,

  #[arg(long)]
  tenant_code: String,

  /// Extra payload fields as a JSON object.
  #[arg(long, default_value = "{}")]
  payload: String,

  #[arg(long, default_value_t = DEFAULT_MAX_DELIVER)]
  max_retries: u32,

  /// Create the stream first if it does not exist.
  #[arg(long)]
  ensure_stream: bool,
}

fn sanitize_input(input: &str) -> bool {
  Regex::new(r"^[\w.\-]+$").map(|re| re.is_match(input)).unwrap_or(false)
}

fn unknown_type_notice(task_type: &str) -> String {
  format!(
    "Publishing task with unrecognised type '{}'; workers will retry it with backoff up to its retry budget, then dead-letter it",
    task_type
  )
}

fn build_task(args: &Args) -> Result<Task> {
  for (flag, value) in [
    ("--tenant-id", &args.tenant_id),
    ("--module-id", &args.module_id),
    ("--task-type", &args.task_type),
    ("--tenant-code", &args.tenant_code),
  ] {
    if !sanitize_input(value) {
      bail!("{} contains invalid characters: {:?}", flag, value);
    }
  }
  if args.max_retries == 0 {
    bail!("--max-retries must be at least 1");
  }

  let mut payload: Map<String, Value> = match serde_json::from_str(&args.payload).context("--payload is not valid JSON")? {
    Value::Object(map) => map,
    other => bail!("--payload must be a JSON object, got {}", other),
  };
  payload.insert("tenant_code".into(), Value::String(args.tenant_code.clone()));

  Ok(Task {
    task_id: Uuid::new_v4().to_string(),
    tenant_id: args.tenant_id.clone(),
    task_type: TaskType::from(args.task_type.clone()),
    module_id: args.module_id.clone(),
    payload,
    attempt: 1,
    max_retries: args.max_retries,
    created_at: Utc::now(),
  })
}

#[tokio::main]
async fn main() -> Result<()> {
  logging::init();
  let args = Args::parse();
  let task = build_task(&args)?;
  if let TaskType::Unknown(other) = &task.task_type {
    info!("{}", unknown_type_notice(other));
  }

  let ctx = BrokerContext::connect(&args.nats_url, "publisher").await?;
  if args.ensure_stream {
    ensure_stream(&ctx.jetstream, &StreamSpec::provisioning()).await?;
  }

  let data = serde_json::to_vec(&task).context("Failed to serialize task")?;
  let sequence = publish_message(&ctx.jetstream, SUBJECT_TASKS, &data).await?;
  println!("Published task {} to {} (seq {})", task.task_id, SUBJECT_TASKS, sequence);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn args(extra: &[&str]) -> Args {
    let mut argv = vec!["provq_publish", "--tenant-id", "tenant-42", "--tenant-code", "acme"];
    argv.extend_from_slice(extra);
    Args::try_parse_from(argv).unwrap()
  }

  #[test]
  fn builds_first_attempt_with_tenant_code_in_payload() {
    let task = build_task(&args(&["--payload", r#"{"plan":"gold"}"#])).unwrap();
    assert_eq!(task.task_type, TaskType::Provision);
    assert_eq!(task.module_id, "all");
    assert_eq!(task.attempt, 1);
    assert_eq!(task.max_retries, DEFAULT_MAX_DELIVER);
    assert_eq!(task.payload["tenant_code"], "acme");
    assert_eq!(task.payload["plan"], "gold");
    assert!(Uuid::parse_str(&task.task_id).is_ok());
  }

  #[test]
  fn rejects_unsafe_identifiers() {
    assert!(build_task(&args(&["--module-id", "crm; rm -rf"])).is_err());
    assert!(sanitize_input("billing-v2.eu"));
    assert!(!sanitize_input(""));
  }

  #[test]
  fn payload_must_be_an_object() {
    assert!(build_task(&args(&["--payload", "[1,2]"])).is_err());
    assert!(build_task(&args(&["--payload", "{oops"])).is_err());
  }

  #[test]
  fn unknown_type_is_published_for_retry_then_dead_letter() {
    let task = build_task(&args(&["--task-type", "migrate"])).unwrap();
    assert_eq!(task.task_type, TaskType::Unknown("migrate".into()));
    let notice = unknown_type_notice("migrate");
    assert!(notice.contains("retry it with backoff"));
    assert!(notice.ends_with("then dead-letter it"));
  }

  #[test]
  fn zero_retries_is_rejected() {
    assert!(build_task(&args(&["--max-retries", "0"])).is_err());
  }
}
