use std::sync::Arc;

use warp::Filter;

use crate::worker_loop::WorkerStats;

pub mod health;

pub fn routes(
  worker_id: String,
  stats: Arc<WorkerStats>
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  health::health_route(worker_id, stats.clone())
    .or(health::metrics_route(stats))
}
