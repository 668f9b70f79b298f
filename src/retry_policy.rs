use std::time::Duration;

use rand::Rng;

use crate::models::Task;

pub const DEFAULT_MAX_DELIVER: u32 = 5;
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);
const JITTER_FRACTION: f64 = 0.2;

/// `attempt == max_retries` is exhausted, never retried.
pub fn should_retry(attempt: u32, max_retries: u32) -> bool {
  attempt < max_retries
}

/// `base * 2^(attempt-1)`, jittered by up to ±20%, capped at five minutes.
pub fn backoff(attempt: u32, base_seconds: u64) -> Duration {
  let jitter = rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
  backoff_with_jitter(attempt, base_seconds, jitter)
}

fn backoff_with_jitter(attempt: u32, base_seconds: u64, jitter: f64) -> Duration {
  let exponent = attempt.saturating_sub(1).min(63) as i32;
  let seconds = base_seconds as f64 * 2f64.powi(exponent) * (1.0 + jitter);
  let capped = seconds.clamp(0.0, MAX_BACKOFF.as_secs_f64());
  Duration::from_secs_f64(capped)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub base_backoff_secs: u64,
  /// The durable consumer's delivery ceiling as reported by the broker. Zero means unlimited.
  pub max_deliver: u32,
}

impl RetryPolicy {
  pub fn new(base_backoff_secs: u64, max_deliver: i64) -> Self {
    let max_deliver = if max_deliver <= 0 { 0 } else { u32::try_from(max_deliver).unwrap_or(u32::MAX) };
    Self { base_backoff_secs, max_deliver }
  }

  /// The task's own budget, never beyond what the broker will deliver.
  pub fn budget(&self, task: &Task) -> u32 {
    if self.max_deliver == 0 {
      task.max_retries
    } else {
      task.max_retries.min(self.max_deliver)
    }
  }

  pub fn should_retry(&self, task: &Task) -> bool {
    should_retry(task.attempt, self.budget(task))
  }

  pub fn next_delay(&self, task: &Task) -> Duration {
    backoff(task.attempt, self.base_backoff_secs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Utc;

  use crate::models::TaskType;

  fn task(attempt: u32, max_retries: u32) -> Task {
    Task {
      task_id: "t".into(),
      tenant_id: "tenant".into(),
      task_type: TaskType::Provision,
      module_id: "all".into(),
      payload: Default::default(),
      attempt,
      max_retries,
      created_at: Utc::now(),
    }
  }

  #[test]
  fn retries_strictly_below_budget() {
    for max in 1..=8 {
      for attempt in 1..max {
        assert!(should_retry(attempt, max), "attempt {attempt} of {max}");
      }
      assert!(!should_retry(max, max));
      assert!(!should_retry(max + 1, max));
    }
  }

  #[test]
  fn backoff_doubles_without_jitter() {
    assert_eq!(backoff_with_jitter(1, 5, 0.0), Duration::from_secs(5));
    assert_eq!(backoff_with_jitter(2, 5, 0.0), Duration::from_secs(10));
    assert_eq!(backoff_with_jitter(3, 5, 0.0), Duration::from_secs(20));
    assert_eq!(backoff_with_jitter(4, 5, 0.0), Duration::from_secs(40));
  }

  #[test]
  fn attempt_zero_counts_as_first() {
    assert_eq!(backoff_with_jitter(0, 7, 0.0), Duration::from_secs(7));
  }

  #[test]
  fn backoff_is_non_decreasing_and_saturates() {
    let mut previous = Duration::ZERO;
    for attempt in 1..40 {
      let next = backoff_with_jitter(attempt, 3, 0.0);
      assert!(next >= previous);
      previous = next;
    }
    assert_eq!(previous, MAX_BACKOFF);
  }

  #[test]
  fn backoff_never_exceeds_cap() {
    for attempt in [1, 5, 9, 10, 64, 1000, u32::MAX] {
      for base in [0, 1, 30, 299, 300, 10_000, u64::MAX] {
        assert!(backoff(attempt, base) <= MAX_BACKOFF);
        assert!(backoff_with_jitter(attempt, base, JITTER_FRACTION) <= MAX_BACKOFF);
      }
    }
  }

  #[test]
  fn jitter_stays_within_twenty_percent() {
    for _ in 0..200 {
      let delay = backoff(3, 10).as_secs_f64();
      assert!((32.0..=48.0).contains(&delay), "{delay}");
    }
  }

  #[test]
  fn budget_is_capped_by_broker_ceiling() {
    let policy = RetryPolicy::new(5, 5);
    assert_eq!(policy.budget(&task(1, 3)), 3);
    assert_eq!(policy.budget(&task(1, 10)), 5);
    assert!(!policy.should_retry(&task(5, 10)));
    assert!(policy.should_retry(&task(4, 10)));
  }

  #[test]
  fn unlimited_ceiling_defers_to_task() {
    let policy = RetryPolicy::new(5, -1);
    assert_eq!(policy.max_deliver, 0);
    assert_eq!(policy.budget(&task(1, 12)), 12);
  }
}
