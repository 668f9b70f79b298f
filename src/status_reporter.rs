//! Best-effort progress reporting to the orchestration service.
//!
//! Nothing here may influence whether a delivery is acked, nak'd or
//! terminated; callers log failures and move on.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::errors::ReportingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReportedStatus {
  Processing,
  Failed,
}

#[async_trait]
pub trait StatusReporter: Send + Sync {
  async fn update_status(
    &self,
    task_id: &str,
    status: ReportedStatus,
    progress: u8,
    current_step: Option<&str>,
    error_message: Option<&str>,
  ) -> Result<(), ReportingError>;

  async fn add_completed_step(&self, task_id: &str, step: &str) -> Result<(), ReportingError>;

  async fn mark_completed(&self, task_id: &str) -> Result<(), ReportingError>;

  async fn mark_failed(&self, task_id: &str, error_message: &str) -> Result<(), ReportingError>;
}

pub async fn best_effort<F>(task_id: &str, what: &str, report: F)
where
  F: Future<Output = Result<(), ReportingError>>,
{
  if let Err(e) = report.await {
    warn!("Failed to {} for task {}: {}", what, task_id, e);
  }
}

/// Used when no orchestrator is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledReporter;

#[async_trait]
impl StatusReporter for DisabledReporter {
  async fn update_status(
    &self,
    task_id: &str,
    status: ReportedStatus,
    progress: u8,
    current_step: Option<&str>,
    _error_message: Option<&str>,
  ) -> Result<(), ReportingError> {
    debug!("Task {} {:?} {}% {}", task_id, status, progress, current_step.unwrap_or(""));
    Ok(())
  }

  async fn add_completed_step(&self, _task_id: &str, _step: &str) -> Result<(), ReportingError> {
    Ok(())
  }

  async fn mark_completed(&self, _task_id: &str) -> Result<(), ReportingError> {
    Ok(())
  }

  async fn mark_failed(&self, _task_id: &str, _error_message: &str) -> Result<(), ReportingError> {
    Ok(())
  }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceTokenRequest<'a> {
  service_id: &'a str,
  service_type: &'a str,
  permissions: &'a [&'a str],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceTokenResponse {
  token: String,
  expires_at: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusUpdate<'a> {
  status: ReportedStatus,
  progress: u8,
  timestamp: DateTime<Utc>,
  #[serde(skip_serializing_if = "Option::is_none")]
  current_step: Option<&'a str>,
  #[serde(skip_serializing_if = "Option::is_none")]
  error_message: Option<&'a str>,
}

#[derive(Serialize)]
struct StepCompleted<'a> {
  step: &'a str,
  timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskCompleted {
  completed_at: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskFailed<'a> {
  error_message: &'a str,
  failed_at: DateTime<Utc>,
}

pub struct OrchestratorClient {
  base_url: String,
  service_id: String,
  http: reqwest::Client,
  token: RwLock<Option<String>>,
}

impl OrchestratorClient {
  pub fn new(base_url: &str, service_id: impl Into<String>) -> Result<Self, ReportingError> {
    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(30))
      .build()
      .map_err(|source| ReportingError::Http {
        endpoint: base_url.to_string(),
        source,
      })?;
    Ok(Self {
      base_url: base_url.trim_end_matches('/').to_string(),
      service_id: service_id.into(),
      http,
      token: RwLock::new(None),
    })
  }

  /// Obtains the bearer token used by every later call.
  pub async fn authenticate(&self, service_type: &str, permissions: &[&str]) -> Result<DateTime<Utc>, ReportingError> {
    let endpoint = "/api/serviceauth/token";
    let request = ServiceTokenRequest {
      service_id: &self.service_id,
      service_type,
      permissions,
    };
    let response = self.send(endpoint, &request, false).await?;
    let body: ServiceTokenResponse = response.json().await.map_err(|source| ReportingError::Http {
      endpoint: endpoint.to_string(),
      source,
    })?;
    *self.token.write().await = Some(body.token);
    info!("Service {} authenticated, token expires at {}", self.service_id, body.expires_at);
    Ok(body.expires_at)
  }

  async fn post<T: Serialize + Sync>(&self, endpoint: &str, payload: &T) -> Result<(), ReportingError> {
    self.send(endpoint, payload, true).await.map(|_| ())
  }

  async fn send<T: Serialize + Sync>(&self, endpoint: &str, payload: &T, authorized: bool) -> Result<reqwest::Response, ReportingError> {
    let url = format!("{}{}", self.base_url, endpoint);
    let mut request = self.http.post(&url).json(payload);
    if authorized {
      if let Some(token) = self.token.read().await.as_deref() {
        request = request.bearer_auth(token);
      }
    }
    let response = request.send().await.map_err(|source| ReportingError::Http {
      endpoint: endpoint.to_string(),
      source,
    })?;
    let status = response.status();
    if status.is_client_error() || status.is_server_error() {
      let body = response.text().await.unwrap_or_default();
      return Err(ReportingError::Status {
        endpoint: endpoint.to_string(),
        status: status.as_u16(),
        body,
      });
    }
    debug!("API call successful: POST {} -> {}", url, status.as_u16());
    Ok(response)
  }
}

#[async_trait]
impl StatusReporter for OrchestratorClient {
  async fn update_status(
    &self,
    task_id: &str,
    status: ReportedStatus,
    progress: u8,
    current_step: Option<&str>,
    error_message: Option<&str>,
  ) -> Result<(), ReportingError> {
    let payload = StatusUpdate {
      status,
      progress,
      timestamp: Utc::now(),
      current_step,
      error_message,
    };
    self.post(&format!("/api/tasks/{}/status", task_id), &payload).await
  }

  async fn add_completed_step(&self, task_id: &str, step: &str) -> Result<(), ReportingError> {
    let payload = StepCompleted {
      step,
      timestamp: Utc::now(),
    };
    self.post(&format!("/api/tasks/{}/steps", task_id), &payload).await
  }

  async fn mark_completed(&self, task_id: &str) -> Result<(), ReportingError> {
    let payload = TaskCompleted { completed_at: Utc::now() };
    self.post(&format!("/api/tasks/{}/complete", task_id), &payload).await
  }

  async fn mark_failed(&self, task_id: &str, error_message: &str) -> Result<(), ReportingError> {
    let payload = TaskFailed {
      error_message,
      failed_at: Utc::now(),
    };
    self.post(&format!("/api/tasks/{}/fail", task_id), &payload).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::net::SocketAddr;
  use std::sync::{Arc, Mutex};

  use serde_json::{json, Value};
  use warp::http::StatusCode;
  use warp::path::FullPath;
  use warp::Filter;

  type Calls = Arc<Mutex<Vec<(String, Option<String>, Value)>>>;

  fn fake_orchestrator(status: StatusCode) -> (SocketAddr, Calls) {
    let calls: Calls = Arc::default();
    let log = calls.clone();
    let route = warp::post()
      .and(warp::path::full())
      .and(warp::header::optional::<String>("authorization"))
      .and(warp::body::json())
      .map(move |path: FullPath, auth: Option<String>, body: Value| {
        log.lock().unwrap().push((path.as_str().to_string(), auth, body));
        let reply = if path.as_str() == "/api/serviceauth/token" {
          json!({"token": "tok-1", "serviceId": "svc-1", "expiresAt": "2026-10-17T00:00:00Z"})
        } else {
          json!({"ok": status.is_success()})
        };
        warp::reply::with_status(warp::reply::json(&reply), status)
      });
    let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    (addr, calls)
  }

  #[tokio::test]
  async fn authenticates_then_sends_bearer_token() {
    let (addr, calls) = fake_orchestrator(StatusCode::OK);
    let client = OrchestratorClient::new(&format!("http://{}/", addr), "svc-1").unwrap();

    client.authenticate("worker", &["tasks:write"]).await.unwrap();
    client
      .update_status("t-1", ReportedStatus::Processing, 30, Some("Creating tenant database"), None)
      .await
      .unwrap();
    client.add_completed_step("t-1", "Validated tenant configuration").await.unwrap();
    client.mark_completed("t-1").await.unwrap();
    client.mark_failed("t-2", "boom").await.unwrap();

    let calls = calls.lock().unwrap();
    let paths: Vec<&str> = calls.iter().map(|(p, _, _)| p.as_str()).collect();
    assert_eq!(
      paths,
      vec![
        "/api/serviceauth/token",
        "/api/tasks/t-1/status",
        "/api/tasks/t-1/steps",
        "/api/tasks/t-1/complete",
        "/api/tasks/t-2/fail",
      ]
    );

    let (_, auth, token_request) = &calls[0];
    assert!(auth.is_none());
    assert_eq!(token_request["serviceId"], "svc-1");
    assert_eq!(token_request["permissions"][0], "tasks:write");

    let (_, auth, status) = &calls[1];
    assert_eq!(auth.as_deref(), Some("Bearer tok-1"));
    assert_eq!(status["status"], "PROCESSING");
    assert_eq!(status["progress"], 30);
    assert_eq!(status["currentStep"], "Creating tenant database");
    assert!(status.get("errorMessage").is_none());

    assert!(calls[3].2["completedAt"].is_string());
    assert_eq!(calls[4].2["errorMessage"], "boom");
    assert!(calls[4].2["failedAt"].is_string());
  }

  #[tokio::test]
  async fn error_status_is_a_reporting_error() {
    let (addr, _calls) = fake_orchestrator(StatusCode::INTERNAL_SERVER_ERROR);
    let client = OrchestratorClient::new(&format!("http://{}", addr), "svc-1").unwrap();

    let err = client.mark_completed("t-1").await.unwrap_err();
    match err {
      ReportingError::Status { endpoint, status, .. } => {
        assert_eq!(endpoint, "/api/tasks/t-1/complete");
        assert_eq!(status, 500);
      }
      other => panic!("unexpected error {other:?}"),
    }
  }

  #[tokio::test]
  async fn unreachable_orchestrator_is_a_reporting_error() {
    let client = OrchestratorClient::new("http://127.0.0.1:9", "svc-1").unwrap();
    let err = client.add_completed_step("t-1", "step").await.unwrap_err();
    assert!(matches!(err, ReportingError::Http { .. }));
  }
}
