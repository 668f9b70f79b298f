use chrono::Utc;
use tracing::info;

use crate::errors::ReportingError;
use crate::messaging::{BrokerContext, Publisher, SUBJECT_DLQ};
use crate::models::{DeadLetterRecord, Task};

pub struct DeadLetterRouter<P> {
  publisher: P,
  subject: String,
  worker_id: String,
}

impl DeadLetterRouter<async_nats::jetstream::Context> {
  pub fn from_context(ctx: &BrokerContext) -> Self {
    Self::new(ctx.jetstream.clone(), SUBJECT_DLQ, ctx.worker_id.clone())
  }
}

impl<P: Publisher> DeadLetterRouter<P> {
  pub fn new(publisher: P, subject: impl Into<String>, worker_id: impl Into<String>) -> Self {
    Self {
      publisher,
      subject: subject.into(),
      worker_id: worker_id.into(),
    }
  }

  pub fn record(&self, task: &Task, error: &str) -> DeadLetterRecord {
    DeadLetterRecord {
      task: task.clone(),
      error: error.to_string(),
      final_attempt: task.attempt,
      dlq_timestamp: Utc::now(),
      worker_id: self.worker_id.clone(),
    }
  }

  /// The delivery itself is terminated whatever happens here.
  pub async fn route(&self, task: &Task, error: &str) -> Result<(), ReportingError> {
    let record = self.record(task, error);
    let data = serde_json::to_vec(&record).map_err(|source| ReportingError::Serialize {
      what: "dead-letter record",
      source,
    })?;
    let sequence = self.publisher.publish(&self.subject, data).await?;
    info!("Task {} sent to {} (seq {})", task.task_id, self.subject, sequence);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex;

  use async_trait::async_trait;
  use serde_json::Value;

  use crate::errors::BrokerError;
  use crate::models::TaskType;

  #[derive(Default)]
  struct Recording {
    published: Mutex<Vec<(String, Vec<u8>)>>,
    fail: bool,
  }

  #[async_trait]
  impl Publisher for Recording {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<u64, BrokerError> {
      if self.fail {
        return Err(BrokerError::Publish {
          subject: subject.to_string(),
          message: "no responders".into(),
        });
      }
      let mut published = self.published.lock().unwrap();
      published.push((subject.to_string(), payload));
      Ok(published.len() as u64)
    }
  }

  fn task() -> Task {
    Task {
      task_id: "t-9".into(),
      tenant_id: "tenant".into(),
      task_type: TaskType::Update,
      module_id: "billing".into(),
      payload: Default::default(),
      attempt: 5,
      max_retries: 5,
      created_at: Utc::now(),
    }
  }

  #[tokio::test]
  async fn publishes_full_context_to_dlq_subject() {
    let router = DeadLetterRouter::new(Recording::default(), SUBJECT_DLQ, "worker-a");
    router.route(&task(), "database unreachable").await.unwrap();

    let published = router.publisher.published.lock().unwrap();
    assert_eq!(published.len(), 1);
    let (subject, data) = &published[0];
    assert_eq!(subject, "provisioning.dlq");

    let record: Value = serde_json::from_slice(data).unwrap();
    assert_eq!(record["task"]["task_id"], "t-9");
    assert_eq!(record["error"], "database unreachable");
    assert_eq!(record["final_attempt"], 5);
    assert_eq!(record["worker_id"], "worker-a");
    assert!(record["dlq_timestamp"].is_string());
  }

  #[tokio::test]
  async fn publish_failure_is_reported() {
    let router = DeadLetterRouter::new(
      Recording {
        fail: true,
        ..Default::default()
      },
      SUBJECT_DLQ,
      "worker-a",
    );
    let err = router.route(&task(), "boom").await.unwrap_err();
    assert!(matches!(err, ReportingError::Broker(BrokerError::Publish { .. })));
  }
}
