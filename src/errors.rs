use thiserror::Error;

/// A wire message that can never become a valid task.
#[derive(Debug, Error)]
#[error("failed to decode task: {0}")]
pub struct DecodeError(#[from] pub serde_json::Error);

/// Broker connectivity or timeout trouble while polling. Recovered by pausing and fetching again.
#[derive(Debug, Error)]
#[error("fetch from {consumer} failed: {message}")]
pub struct FetchError {
  pub consumer: String,
  pub message: String,
}

#[derive(Debug, Error)]
pub enum HandlerError {
  #[error("unknown task type: {0}")]
  UnknownTaskType(String),

  #[error("invalid {task_type} payload: {message}")]
  InvalidPayload { task_type: String, message: String },

  #[error("{0}")]
  Failed(String),
}

#[derive(Debug, Error)]
pub enum ReportingError {
  #[error("request to {endpoint} failed: {source}")]
  Http {
    endpoint: String,
    #[source]
    source: reqwest::Error,
  },

  #[error("API call to {endpoint} failed with status {status}: {body}")]
  Status { endpoint: String, status: u16, body: String },

  #[error("failed to serialize {what}: {source}")]
  Serialize {
    what: &'static str,
    #[source]
    source: serde_json::Error,
  },

  #[error(transparent)]
  Broker(#[from] BrokerError),
}

#[derive(Debug, Error)]
pub enum BrokerError {
  #[error("publish to {subject} failed: {message}")]
  Publish { subject: String, message: String },

  #[error("failed to settle delivery as {disposition}: {message}")]
  Settle { disposition: &'static str, message: String },
}

#[derive(Debug, Error)]
pub enum BootstrapError {
  #[error("failed to create stream {stream}: {message}")]
  Stream { stream: String, message: String },

  #[error("failed to create consumer {consumer} on {stream}: {message}")]
  Consumer {
    stream: String,
    consumer: String,
    message: String,
  },
}

/// Outcome of a stream/consumer admin call, as seen by the bootstrap logic.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdminError {
  #[error("not found")]
  NotFound,

  #[error("already exists")]
  AlreadyExists,

  #[error("{0}")]
  Other(String),
}
