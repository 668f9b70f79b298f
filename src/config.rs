use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use uuid::Uuid;

use crate::retry_policy::DEFAULT_MAX_DELIVER;

#[derive(Debug, Clone)]
pub struct Config {
  pub nats_url: String,
  pub worker_id: String,
  /// Progress reporting is disabled when unset.
  pub orchestrator_url: Option<String>,
  pub service_id: String,
  pub retry_backoff_secs: u64,
  pub max_deliver: i64,
  pub ack_wait: Duration,
  pub fetch_wait: Duration,
  pub fetch_error_pause: Duration,
  pub health_port: Option<u16>,
  pub simulated_failure_rate: f64,
}

impl Config {
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| env::var(key).ok())
  }

  pub fn from_lookup<F>(lookup: F) -> Result<Self>
  where
    F: Fn(&str) -> Option<String>,
  {
    let worker_id = lookup("WORKER_ID").unwrap_or_else(|| format!("worker-{}", Uuid::new_v4()));
    let simulated_failure_rate: f64 = parse_or(&lookup, "SIMULATED_FAILURE_RATE", 0.2)?;
    if !(0.0..=1.0).contains(&simulated_failure_rate) {
      bail!("SIMULATED_FAILURE_RATE must be between 0 and 1, got {}", simulated_failure_rate);
    }
    let max_deliver = parse_or(&lookup, "MAX_DELIVER", i64::from(DEFAULT_MAX_DELIVER))?;
    if max_deliver == 0 {
      bail!("MAX_DELIVER must be positive, or -1 for unlimited");
    }

    Ok(Self {
      nats_url: lookup("NATS_URL").unwrap_or_else(|| "nats://localhost:4222".into()),
      service_id: lookup("SERVICE_ID").unwrap_or_else(|| worker_id.clone()),
      worker_id,
      orchestrator_url: lookup("ORCHESTRATOR_URL").filter(|url| !url.trim().is_empty()),
      retry_backoff_secs: parse_or(&lookup, "RETRY_BACKOFF_SECS", 5)?,
      max_deliver,
      ack_wait: Duration::from_secs(parse_or(&lookup, "ACK_WAIT_SECS", 30)?),
      fetch_wait: Duration::from_secs(parse_or(&lookup, "FETCH_WAIT_SECS", 5)?),
      fetch_error_pause: Duration::from_millis(parse_or(&lookup, "FETCH_ERROR_PAUSE_MS", 1000)?),
      health_port: lookup("HEALTH_PORT").map(|port| port.trim().parse::<u16>()).transpose().context("Invalid HEALTH_PORT")?,
      simulated_failure_rate,
    })
  }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
  F: Fn(&str) -> Option<String>,
  T: FromStr,
  T::Err: std::error::Error + Send + Sync + 'static,
{
  match lookup(key) {
    Some(raw) => raw.trim().parse().with_context(|| format!("Invalid {}: {:?}", key, raw)),
    None => Ok(default),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  fn config(vars: &[(&str, &str)]) -> Result<Config> {
    let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    Config::from_lookup(|key| vars.get(key).cloned())
  }

  #[test]
  fn defaults_match_consumer_configuration() {
    let config = config(&[]).unwrap();
    assert_eq!(config.nats_url, "nats://localhost:4222");
    assert!(config.worker_id.starts_with("worker-"));
    assert_eq!(config.service_id, config.worker_id);
    assert_eq!(config.max_deliver, 5);
    assert_eq!(config.ack_wait, Duration::from_secs(30));
    assert_eq!(config.fetch_wait, Duration::from_secs(5));
    assert_eq!(config.fetch_error_pause, Duration::from_secs(1));
    assert_eq!(config.retry_backoff_secs, 5);
    assert!(config.orchestrator_url.is_none());
    assert!(config.health_port.is_none());
  }

  #[test]
  fn reads_overrides() {
    let config = config(&[
      ("WORKER_ID", "w-7"),
      ("ORCHESTRATOR_URL", "http://orchestrator:8080"),
      ("MAX_DELIVER", "8"),
      ("HEALTH_PORT", "9100"),
      ("SIMULATED_FAILURE_RATE", "0"),
    ])
    .unwrap();
    assert_eq!(config.worker_id, "w-7");
    assert_eq!(config.service_id, "w-7");
    assert_eq!(config.orchestrator_url.as_deref(), Some("http://orchestrator:8080"));
    assert_eq!(config.max_deliver, 8);
    assert_eq!(config.health_port, Some(9100));
    assert_eq!(config.simulated_failure_rate, 0.0);
  }

  #[test]
  fn rejects_invalid_values() {
    assert!(config(&[("ACK_WAIT_SECS", "soon")]).is_err());
    assert!(config(&[("HEALTH_PORT", "70000")]).is_err());
    assert!(config(&[("SIMULATED_FAILURE_RATE", "1.5")]).is_err());
    assert!(config(&[("MAX_DELIVER", "0")]).is_err());
  }

  #[test]
  fn blank_orchestrator_url_disables_reporting() {
    assert!(config(&[("ORCHESTRATOR_URL", "  ")]).unwrap().orchestrator_url.is_none());
  }
}
