//! Idempotent setup of the work-queue stream and the durable pull consumer.
//!
//! Every worker runs this at startup, so concurrent workers may race to create
//! the same stream. Losing that race is not an error.

use std::time::Duration;

use async_nats::jetstream::consumer::{pull, AckPolicy, DeliverPolicy, ReplayPolicy};
use async_nats::jetstream::stream::{self, DiscardPolicy, RetentionPolicy, StorageType};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::errors::{AdminError, BootstrapError};
use crate::messaging::{CONSUMER_NAME, STREAM_NAME, SUBJECT_DLQ, SUBJECT_TASKS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSummary {
  pub name: String,
  pub messages: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSummary {
  pub name: String,
  /// Non-positive means the broker never stops redelivering.
  pub max_deliver: i64,
  pub num_pending: u64,
}

#[async_trait]
pub trait StreamAdmin: Send + Sync {
  async fn stream_info(&self, name: &str) -> Result<StreamSummary, AdminError>;
  async fn create_stream(&self, spec: &StreamSpec) -> Result<StreamSummary, AdminError>;
  async fn consumer_info(&self, stream: &str, name: &str) -> Result<ConsumerSummary, AdminError>;
  async fn create_consumer(&self, stream: &str, spec: &ConsumerSpec) -> Result<ConsumerSummary, AdminError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamSpec {
  pub name: String,
  pub description: String,
  pub subjects: Vec<String>,
  pub retention: RetentionPolicy,
  pub max_age: Duration,
  pub storage: StorageType,
  pub replicas: usize,
  pub discard: DiscardPolicy,
}

impl StreamSpec {
  /// Work-queue stream holding both the task subject and the dead-letter subject.
  pub fn provisioning() -> Self {
    Self {
      name: STREAM_NAME.to_string(),
      description: "Provisioning tasks stream".to_string(),
      subjects: vec![SUBJECT_TASKS.to_string(), SUBJECT_DLQ.to_string()],
      retention: RetentionPolicy::WorkQueue,
      max_age: Duration::from_secs(72 * 60 * 60),
      storage: StorageType::File,
      replicas: 1,
      discard: DiscardPolicy::Old,
    }
  }

  pub fn to_config(&self) -> stream::Config {
    stream::Config {
      name: self.name.clone(),
      description: Some(self.description.clone()),
      subjects: self.subjects.clone(),
      retention: self.retention,
      max_age: self.max_age,
      storage: self.storage,
      num_replicas: self.replicas,
      discard: self.discard,
      ..Default::default()
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerSpec {
  pub durable_name: String,
  pub description: String,
  pub filter_subject: String,
  pub ack_wait: Duration,
  pub max_deliver: i64,
}

impl ConsumerSpec {
  pub fn provisioning(worker_id: &str, ack_wait: Duration, max_deliver: i64) -> Self {
    Self {
      durable_name: CONSUMER_NAME.to_string(),
      description: format!("Provisioning worker consumer ({})", worker_id),
      filter_subject: SUBJECT_TASKS.to_string(),
      ack_wait,
      max_deliver,
    }
  }

  /// Explicit acks, and deliver-all so a fresh worker drains the backlog.
  pub fn to_config(&self) -> pull::Config {
    pull::Config {
      durable_name: Some(self.durable_name.clone()),
      description: Some(self.description.clone()),
      filter_subject: self.filter_subject.clone(),
      ack_policy: AckPolicy::Explicit,
      ack_wait: self.ack_wait,
      max_deliver: self.max_deliver,
      deliver_policy: DeliverPolicy::All,
      replay_policy: ReplayPolicy::Instant,
      ..Default::default()
    }
  }
}

/// Returns the stream's message count. An existing stream is left untouched.
pub async fn ensure_stream<A>(admin: &A, spec: &StreamSpec) -> Result<u64, BootstrapError>
where
  A: StreamAdmin + ?Sized,
{
  match admin.stream_info(&spec.name).await {
    Ok(existing) => {
      info!("Stream '{}' already exists with {} messages", existing.name, existing.messages);
      return Ok(existing.messages);
    }
    Err(AdminError::NotFound) => {}
    Err(e) => warn!("Could not read stream '{}' ({}), attempting to create it", spec.name, e),
  }

  let stream_error = |message: String| BootstrapError::Stream {
    stream: spec.name.clone(),
    message,
  };
  match admin.create_stream(spec).await {
    Ok(created) => {
      info!("Stream '{}' created", created.name);
      Ok(created.messages)
    }
    Err(AdminError::AlreadyExists) => {
      let existing = admin.stream_info(&spec.name).await.map_err(|e| stream_error(e.to_string()))?;
      info!("Stream '{}' was created concurrently, {} messages", existing.name, existing.messages);
      Ok(existing.messages)
    }
    Err(e) => Err(stream_error(e.to_string())),
  }
}

/// Returns the consumer as the broker holds it; its `max_deliver` is authoritative.
pub async fn ensure_consumer<A>(admin: &A, stream: &str, spec: &ConsumerSpec) -> Result<ConsumerSummary, BootstrapError>
where
  A: StreamAdmin + ?Sized,
{
  match admin.consumer_info(stream, &spec.durable_name).await {
    Ok(existing) => {
      if existing.max_deliver != spec.max_deliver {
        warn!(
          "Consumer '{}' has max_deliver {} but {} is configured; using the broker's value",
          existing.name, existing.max_deliver, spec.max_deliver
        );
      }
      info!("Consumer '{}' bound with {} pending", existing.name, existing.num_pending);
      return Ok(existing);
    }
    Err(AdminError::NotFound) => {}
    Err(e) => warn!("Could not read consumer '{}' ({}), attempting to create it", spec.durable_name, e),
  }

  let created = admin
    .create_consumer(stream, spec)
    .await
    .map_err(|e| BootstrapError::Consumer {
      stream: stream.to_string(),
      consumer: spec.durable_name.clone(),
      message: e.to_string(),
    })?;
  info!("Consumer '{}' created on '{}'", created.name, stream);
  Ok(created)
}
