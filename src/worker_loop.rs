//! The fetch, dispatch and settle loop.
//!
//! Each fetched delivery goes through [`ConsumerLoop::dispatch`], which returns
//! a single [`Disposition`]. The delivery is then consumed by
//! [`Delivery::settle`], so no code path can ack, nak or term the same delivery
//! twice, and none can leave it unsettled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::dead_letter::DeadLetterRouter;
use crate::errors::HandlerError;
use crate::messaging::{Delivery, Disposition, Publisher, TaskSource};
use crate::models::{Task, TaskResult};
use crate::retry_policy::RetryPolicy;
use crate::status_reporter::{best_effort, ReportedStatus, StatusReporter};
use crate::worker_processing::TaskHandler;

const DEFAULT_FETCH_ERROR_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
pub struct WorkerStats {
  fetched: AtomicU64,
  acked: AtomicU64,
  nakd: AtomicU64,
  termed: AtomicU64,
  decode_failures: AtomicU64,
  handler_failures: AtomicU64,
  dead_lettered: AtomicU64,
  dead_letter_failures: AtomicU64,
  fetch_errors: AtomicU64,
  settle_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
  pub fetched: u64,
  pub acked: u64,
  pub nakd: u64,
  pub termed: u64,
  pub decode_failures: u64,
  pub handler_failures: u64,
  pub dead_lettered: u64,
  pub dead_letter_failures: u64,
  pub fetch_errors: u64,
  pub settle_failures: u64,
}

impl WorkerStats {
  fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  fn record(&self, disposition: Disposition) {
    match disposition {
      Disposition::Ack => Self::bump(&self.acked),
      Disposition::Nak { .. } => Self::bump(&self.nakd),
      Disposition::Term => Self::bump(&self.termed),
    }
  }

  pub fn snapshot(&self) -> StatsSnapshot {
    StatsSnapshot {
      fetched: self.fetched.load(Ordering::Relaxed),
      acked: self.acked.load(Ordering::Relaxed),
      nakd: self.nakd.load(Ordering::Relaxed),
      termed: self.termed.load(Ordering::Relaxed),
      decode_failures: self.decode_failures.load(Ordering::Relaxed),
      handler_failures: self.handler_failures.load(Ordering::Relaxed),
      dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
      dead_letter_failures: self.dead_letter_failures.load(Ordering::Relaxed),
      fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
      settle_failures: self.settle_failures.load(Ordering::Relaxed),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
  Idle,
  FetchFailed,
  Settled(Disposition),
}

pub struct ConsumerLoop<S, P> {
  source: S,
  handler: Arc<dyn TaskHandler>,
  reporter: Arc<dyn StatusReporter>,
  dead_letter: DeadLetterRouter<P>,
  policy: RetryPolicy,
  stats: Arc<WorkerStats>,
  fetch_error_pause: Duration,
}

impl<S, P> ConsumerLoop<S, P>
where
  S: TaskSource,
  P: Publisher,
{
  pub fn new(
    source: S,
    handler: Arc<dyn TaskHandler>,
    reporter: Arc<dyn StatusReporter>,
    dead_letter: DeadLetterRouter<P>,
    policy: RetryPolicy,
  ) -> Self {
    Self {
      source,
      handler,
      reporter,
      dead_letter,
      policy,
      stats: Arc::default(),
      fetch_error_pause: DEFAULT_FETCH_ERROR_PAUSE,
    }
  }

  pub fn with_fetch_error_pause(mut self, pause: Duration) -> Self {
    self.fetch_error_pause = pause;
    self
  }

  pub fn with_stats(mut self, stats: Arc<WorkerStats>) -> Self {
    self.stats = stats;
    self
  }

  pub fn stats(&self) -> Arc<WorkerStats> {
    self.stats.clone()
  }

  /// Runs until `shutdown` reads true. The signal is only checked between
  /// iterations, so a task already in the handler always finishes and is settled.
  pub async fn run(mut self, shutdown: watch::Receiver<bool>) {
    info!("Consumer loop started");
    loop {
      let stopping = *shutdown.borrow();
      if stopping {
        break;
      }
      self.poll_once().await;
    }
    info!("Stopping message processing...");
  }

  pub async fn poll_once(&mut self) -> PollOutcome {
    match self.source.fetch().await {
      Ok(None) => {
        debug!("No messages available, polling again");
        PollOutcome::Idle
      }
      Err(e) => {
        WorkerStats::bump(&self.stats.fetch_errors);
        error!("Error fetching messages: {}", e);
        sleep(self.fetch_error_pause).await;
        PollOutcome::FetchFailed
      }
      Ok(Some(delivery)) => {
        WorkerStats::bump(&self.stats.fetched);
        let disposition = self.dispatch(delivery.payload(), delivery.delivery_count()).await;
        match delivery.settle(disposition).await {
          Ok(()) => self.stats.record(disposition),
          Err(e) => {
            WorkerStats::bump(&self.stats.settle_failures);
            error!("{}; the broker will redeliver after ack-wait", e);
          }
        }
        PollOutcome::Settled(disposition)
      }
    }
  }

  /// Decides the fate of one delivery. Never settles it.
  pub async fn dispatch(&self, payload: &[u8], delivered: Option<u64>) -> Disposition {
    let mut task = match Task::decode(payload) {
      Ok(task) => task,
      Err(e) => {
        WorkerStats::bump(&self.stats.decode_failures);
        error!("{}, terminating message", e);
        return Disposition::Term;
      }
    };

    match delivered {
      Some(count) => task.attempt = u32::try_from(count).unwrap_or(u32::MAX),
      None => warn!("No delivery count for task {}, keeping attempt {}", task.task_id, task.attempt),
    }

    info!(
      "Processing task {} (type: {}, attempt: {}/{})",
      task.task_id,
      task.task_type,
      task.attempt,
      self.policy.budget(&task)
    );

    let start = Instant::now();
    match self.handler.process(&task).await {
      Ok(result) => {
        best_effort(&task.task_id, "mark task completed", self.reporter.mark_completed(&task.task_id)).await;
        info!("Task {} completed successfully (took {}ms)", task.task_id, result.duration);
        log_result(&result);
        Disposition::Ack
      }
      Err(err) => self.handle_failure(&task, err, start.elapsed()).await,
    }
  }

  async fn handle_failure(&self, task: &Task, err: HandlerError, elapsed: Duration) -> Disposition {
    WorkerStats::bump(&self.stats.handler_failures);
    let retrying = self.policy.should_retry(task);
    let error_text = err.to_string();
    error!("Task {} failed: {}", task.task_id, error_text);

    best_effort(
      &task.task_id,
      "update task failure status",
      self.reporter.update_status(&task.task_id, ReportedStatus::Failed, 0, None, Some(&error_text)),
    )
      .await;
    log_result(&TaskResult::failure(task, &err, elapsed.as_millis() as u64, retrying));

    if retrying {
      let delay = self.policy.next_delay(task);
      info!(
        "Task {} will be retried (attempt {}/{}) in {:.1}s",
        task.task_id,
        task.attempt.saturating_add(1),
        self.policy.budget(task),
        delay.as_secs_f64()
      );
      return Disposition::Nak { delay: Some(delay) };
    }

    warn!(
      "Task {} exceeded max retries ({}/{}), sending to DLQ",
      task.task_id,
      task.attempt,
      self.policy.budget(task)
    );
    match self.dead_letter.route(task, &error_text).await {
      Ok(()) => WorkerStats::bump(&self.stats.dead_lettered),
      Err(e) => {
        WorkerStats::bump(&self.stats.dead_letter_failures);
        error!("Failed to dead-letter task {}, it will be dropped: {}", task.task_id, e);
      }
    }
    best_effort(&task.task_id, "mark task failed", self.reporter.mark_failed(&task.task_id, &error_text)).await;
    Disposition::Term
  }
}

fn log_result(result: &TaskResult) {
  info!("Result: task={} status={} duration={}ms", result.task_id, result.status, result.duration);
}
