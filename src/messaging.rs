use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use async_nats::jetstream::consumer::{self, PullConsumer};
use async_nats::jetstream::response::Response;
use async_nats::jetstream::{self, AckKind};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use tracing::{info, warn};

use crate::bootstrap::{ConsumerSpec, ConsumerSummary, StreamAdmin, StreamSpec, StreamSummary};
use crate::errors::{AdminError, BrokerError, FetchError};

static MAX_RETRIES: usize = 5;
static DELAY: u64 = 100;

pub const STREAM_NAME: &str = "PROVISIONING";
pub const SUBJECT_TASKS: &str = "provisioning.tasks";
pub const SUBJECT_DLQ: &str = "provisioning.dlq";
pub const CONSUMER_NAME: &str = "provisioning-worker";

/// How a delivery leaves the worker. Exactly one is applied per delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
  Ack,
  /// Redeliver, after `delay` when the broker honours one.
  Nak { delay: Option<Duration> },
  /// Remove permanently without success.
  Term,
}

impl Disposition {
  pub fn as_str(&self) -> &'static str {
    match self {
      Disposition::Ack => "ack",
      Disposition::Nak { .. } => "nak",
      Disposition::Term => "term",
    }
  }
}

#[async_trait]
pub trait Delivery: Send + Sync {
  fn payload(&self) -> &[u8];

  /// Broker-side delivery count, 1 on first delivery.
  fn delivery_count(&self) -> Option<u64>;

  /// Consumes the delivery so it cannot be settled twice.
  async fn settle(self, disposition: Disposition) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait TaskSource: Send + Sync {
  type Delivery: Delivery + 'static;

  /// `Ok(None)` when the bounded wait elapsed without a message.
  async fn fetch(&mut self) -> Result<Option<Self::Delivery>, FetchError>;
}

#[async_trait]
pub trait Publisher: Send + Sync {
  /// Returns the stream sequence assigned to the message.
  async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<u64, BrokerError>;
}

/// Shared per-process broker handles and the identity this worker reports under.
#[derive(Clone)]
pub struct BrokerContext {
  pub client: async_nats::Client,
  pub jetstream: jetstream::Context,
  pub worker_id: String,
}

impl BrokerContext {
  pub async fn connect(nats_url: &str, worker_id: impl Into<String>) -> Result<Self> {
    let client = create_nats_client(nats_url).await?;
    let jetstream = jetstream::new(client.clone());
    Ok(Self {
      client,
      jetstream,
      worker_id: worker_id.into(),
    })
  }

  pub async fn pull_consumer(&self, stream: &str, consumer: &str) -> Result<PullConsumer> {
    let stream_handle = self
      .jetstream
      .get_stream(stream)
      .await
      .map_err(|e| anyhow!("Failed to look up stream {}: {}", stream, e))?;
    stream_handle
      .get_consumer(consumer)
      .await
      .map_err(|e| anyhow!("Failed to bind consumer {} on {}: {}", consumer, stream, e))
  }
}

pub async fn create_nats_client(nats_url: &str) -> Result<async_nats::Client> {
  let client = Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || {
    async_nats::connect(nats_url)
  })
    .await
    .with_context(|| format!("Failed to connect to NATS at {}", nats_url))?;
  info!("NATS connection established to {}", nats_url);
  Ok(client)
}

pub async fn publish_message(js: &jetstream::Context, subject: &str, payload: &[u8]) -> Result<u64, BrokerError> {
  let ack = Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || async {
    js.publish(subject.to_string(), payload.to_vec().into()).await?.await
  })
    .await
    .map_err(|e| BrokerError::Publish {
      subject: subject.to_string(),
      message: e.to_string(),
    })?;
  Ok(ack.sequence)
}

#[async_trait]
impl Publisher for jetstream::Context {
  async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<u64, BrokerError> {
    publish_message(self, subject, &payload).await
  }
}

pub struct JetStreamDelivery {
  message: jetstream::Message,
}

#[async_trait]
impl Delivery for JetStreamDelivery {
  fn payload(&self) -> &[u8] {
    &self.message.payload
  }

  fn delivery_count(&self) -> Option<u64> {
    match self.message.info() {
      Ok(info) => u64::try_from(info.delivered).ok(),
      Err(e) => {
        warn!("Failed to read message metadata: {}", e);
        None
      }
    }
  }

  async fn settle(self, disposition: Disposition) -> Result<(), BrokerError> {
    let kind = match disposition {
      Disposition::Ack => AckKind::Ack,
      Disposition::Nak { delay } => AckKind::Nak(delay),
      Disposition::Term => AckKind::Term,
    };
    self.message.ack_with(kind).await.map_err(|e| BrokerError::Settle {
      disposition: disposition.as_str(),
      message: e.to_string(),
    })
  }
}

pub struct JetStreamSource {
  consumer: PullConsumer,
  name: String,
  max_wait: Duration,
}

impl JetStreamSource {
  pub fn new(consumer: PullConsumer, name: impl Into<String>, max_wait: Duration) -> Self {
    Self {
      consumer,
      name: name.into(),
      max_wait,
    }
  }

  fn fetch_error(&self, message: impl ToString) -> FetchError {
    FetchError {
      consumer: self.name.clone(),
      message: message.to_string(),
    }
  }
}

#[async_trait]
impl TaskSource for JetStreamSource {
  type Delivery = JetStreamDelivery;

  async fn fetch(&mut self) -> Result<Option<JetStreamDelivery>, FetchError> {
    let mut batch = self
      .consumer
      .fetch()
      .max_messages(1)
      .expires(self.max_wait)
      .messages()
      .await
      .map_err(|e| self.fetch_error(e))?;
    match batch.next().await {
      None => Ok(None),
      Some(Ok(message)) => Ok(Some(JetStreamDelivery { message })),
      Some(Err(e)) => Err(self.fetch_error(e)),
    }
  }
}

#[async_trait]
impl StreamAdmin for jetstream::Context {
  async fn stream_info(&self, name: &str) -> Result<StreamSummary, AdminError> {
    use jetstream::context::GetStreamErrorKind;

    let mut stream = self.get_stream(name).await.map_err(|e| match e.kind() {
      GetStreamErrorKind::JetStream(js) if js.error_code() == jetstream::ErrorCode::STREAM_NOT_FOUND => {
        AdminError::NotFound
      }
      _ => AdminError::Other(e.to_string()),
    })?;
    let info = stream.info().await.map_err(|e| AdminError::Other(e.to_string()))?;
    Ok(StreamSummary {
      name: info.config.name.clone(),
      messages: info.state.messages,
    })
  }

  async fn create_stream(&self, spec: &StreamSpec) -> Result<StreamSummary, AdminError> {
    use jetstream::context::CreateStreamErrorKind;

    let mut stream = jetstream::Context::create_stream(self, spec.to_config())
      .await
      .map_err(|e| match e.kind() {
        CreateStreamErrorKind::JetStream(js) if js.error_code() == jetstream::ErrorCode::STREAM_NAME_EXIST => {
          AdminError::AlreadyExists
        }
        _ => AdminError::Other(e.to_string()),
      })?;
    let info = stream.info().await.map_err(|e| AdminError::Other(e.to_string()))?;
    Ok(StreamSummary {
      name: info.config.name.clone(),
      messages: info.state.messages,
    })
  }

  async fn consumer_info(&self, stream: &str, name: &str) -> Result<ConsumerSummary, AdminError> {
    let response: Response<consumer::Info> = self
      .request(format!("CONSUMER.INFO.{}.{}", stream, name), &json!({}))
      .await
      .map_err(|e| AdminError::Other(e.to_string()))?;
    consumer_lookup(response)
  }

  async fn create_consumer(&self, stream: &str, spec: &ConsumerSpec) -> Result<ConsumerSummary, AdminError> {
    let stream = self.get_stream(stream).await.map_err(|e| AdminError::Other(e.to_string()))?;
    let mut consumer = stream
      .create_consumer(spec.to_config())
      .await
      .map_err(|e| AdminError::Other(e.to_string()))?;
    let info = consumer.info().await.map_err(|e| AdminError::Other(e.to_string()))?;
    Ok(consumer_summary(info))
  }
}

fn consumer_summary(info: &consumer::Info) -> ConsumerSummary {
  ConsumerSummary {
    name: info.name.clone(),
    max_deliver: info.config.max_deliver,
    num_pending: info.num_pending,
  }
}

fn consumer_lookup(response: Response<consumer::Info>) -> Result<ConsumerSummary, AdminError> {
  match response {
    Response::Ok(info) => Ok(consumer_summary(&info)),
    Response::Err { error } if error.error_code() == jetstream::ErrorCode::CONSUMER_NOT_FOUND => Err(AdminError::NotFound),
    Response::Err { error } => Err(AdminError::Other(error.to_string())),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn disposition_names_match_broker_vocabulary() {
    assert_eq!(Disposition::Ack.as_str(), "ack");
    assert_eq!(Disposition::Nak { delay: None }.as_str(), "nak");
    assert_eq!(Disposition::Term.as_str(), "term");
  }

  fn error_response(code: u64, description: &str) -> Response<consumer::Info> {
    serde_json::from_value(json!({
      "error": {"code": 404, "err_code": code, "description": description}
    }))
    .unwrap()
  }

  #[test]
  fn missing_consumer_is_not_found() {
    assert_eq!(consumer_lookup(error_response(10014, "consumer not found")), Err(AdminError::NotFound));
  }

  #[test]
  fn other_lookup_errors_are_reported() {
    match consumer_lookup(error_response(10059, "stream not found")) {
      Err(AdminError::Other(message)) => assert!(message.contains("10059")),
      other => panic!("unexpected lookup result {other:?}"),
    }
  }
}
