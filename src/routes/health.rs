use std::convert::Infallible;
use std::sync::Arc;

use serde::Serialize;
use warp::Filter;

use crate::worker_loop::{StatsSnapshot, WorkerStats};

#[derive(Serialize)]
struct HealthResponse {
  status: &'static str,
  worker_id: String,
  stats: StatsSnapshot,
}

fn with_stats(stats: Arc<WorkerStats>) -> impl Filter<Extract = (Arc<WorkerStats>,), Error = Infallible> + Clone {
  warp::any().map(move || stats.clone())
}

pub fn health_route(
  worker_id: String,
  stats: Arc<WorkerStats>
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("health")
    .and(warp::path::end())
    .and(warp::get())
    .and(with_stats(stats))
    .map(move |stats: Arc<WorkerStats>| {
      warp::reply::json(&HealthResponse {
        status: "ok",
        worker_id: worker_id.clone(),
        stats: stats.snapshot(),
      })
    })
}

pub fn metrics_route(stats: Arc<WorkerStats>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("metrics")
    .and(warp::path::end())
    .and(warp::get())
    .and(with_stats(stats))
    .map(|stats: Arc<WorkerStats>| render_metrics(&stats.snapshot()))
}

fn render_metrics(s: &StatsSnapshot) -> String {
  let counters = [
    ("provq_messages_fetched_total", s.fetched),
    ("provq_messages_acked_total", s.acked),
    ("provq_messages_nakd_total", s.nakd),
    ("provq_messages_termed_total", s.termed),
    ("provq_decode_failures_total", s.decode_failures),
    ("provq_handler_failures_total", s.handler_failures),
    ("provq_dead_lettered_total", s.dead_lettered),
    ("provq_dead_letter_failures_total", s.dead_letter_failures),
    ("provq_fetch_errors_total", s.fetch_errors),
    ("provq_settle_failures_total", s.settle_failures),
  ];
  counters
    .iter()
    .map(|(name, value)| format!("{} {}\n", name, value))
    .collect()
}

#[cfg(test)]
mod tests {
  use super::super::routes;
  use super::*;
  use serde_json::Value;

  #[tokio::test]
  async fn health_reports_worker_and_counters() {
    let stats = Arc::new(WorkerStats::default());
    let api = routes("worker-3".into(), stats);

    let res = warp::test::request().method("GET").path("/health").reply(&api).await;
    assert_eq!(res.status(), 200);
    let body: Value = serde_json::from_slice(res.body()).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["worker_id"], "worker-3");
    assert_eq!(body["stats"]["acked"], 0);
  }

  #[tokio::test]
  async fn metrics_are_plain_text_counters() {
    let api = routes("worker-3".into(), Arc::new(WorkerStats::default()));
    let res = warp::test::request().method("GET").path("/metrics").reply(&api).await;
    assert_eq!(res.status(), 200);
    let body = String::from_utf8(res.body().to_vec()).unwrap();
    assert!(body.contains("provq_messages_acked_total 0\n"));
    assert!(body.contains("provq_fetch_errors_total 0\n"));
    assert!(body.contains("provq_settle_failures_total 0\n"));
  }

  #[tokio::test]
  async fn unknown_path_is_rejected() {
    let api = routes("worker-3".into(), Arc::new(WorkerStats::default()));
    let res = warp::test::request().method("GET").path("/tasks").reply(&api).await;
    assert_eq!(res.status(), 404);
  }
}
