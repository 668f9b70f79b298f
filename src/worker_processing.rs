use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::time::sleep;
use tracing::info;

use crate::errors::HandlerError;
use crate::models::{Task, TaskResult, TaskSpec};
use crate::status_reporter::{best_effort, ReportedStatus, StatusReporter};

#[async_trait]
pub trait TaskHandler: Send + Sync {
  async fn process(&self, task: &Task) -> Result<TaskResult, HandlerError>;
}

struct Stage {
  progress: u8,
  current_step: &'static str,
  done: &'static str,
  delay_ms: Range<u64>,
}

const PROVISION_STAGES: &[Stage] = &[
  Stage { progress: 10, current_step: "Validating tenant configuration", done: "Validated tenant configuration", delay_ms: 100..300 },
  Stage { progress: 30, current_step: "Creating tenant database", done: "Created tenant database", delay_ms: 200..500 },
  Stage { progress: 70, current_step: "Configuring application settings", done: "Configured application settings", delay_ms: 100..300 },
  Stage { progress: 100, current_step: "Finalizing tenant setup", done: "Finalized tenant setup", delay_ms: 50..150 },
];

const DEPROVISION_STAGES: &[Stage] = &[
  Stage { progress: 20, current_step: "Archiving tenant data", done: "Archived tenant data", delay_ms: 100..300 },
  Stage { progress: 60, current_step: "Removing tenant resources", done: "Removed tenant resources", delay_ms: 100..300 },
  Stage { progress: 100, current_step: "Cleaning up tenant records", done: "Cleaned up tenant records", delay_ms: 50..150 },
];

const UPDATE_STAGES: &[Stage] = &[
  Stage { progress: 25, current_step: "Applying configuration changes", done: "Applied configuration changes", delay_ms: 100..300 },
  Stage { progress: 75, current_step: "Updating feature flags", done: "Updated feature flags", delay_ms: 100..300 },
  Stage { progress: 100, current_step: "Restarting services", done: "Restarted services", delay_ms: 50..150 },
];

#[derive(Debug, Clone, Copy)]
pub struct Simulation {
  /// Chance that a first provisioning attempt fails just before finalizing.
  pub failure_rate: f64,
  /// Scales every stage delay; 0.0 skips the sleeps.
  pub delay_scale: f64,
}

impl Default for Simulation {
  fn default() -> Self {
    Self {
      failure_rate: 0.2,
      delay_scale: 1.0,
    }
  }
}

/// Stand-in for real tenant provisioning: walks each task type through its
/// stages, reporting progress as it goes.
pub struct Provisioner {
  reporter: Arc<dyn StatusReporter>,
  simulation: Simulation,
}

impl Provisioner {
  pub fn new(reporter: Arc<dyn StatusReporter>, simulation: Simulation) -> Self {
    Self { reporter, simulation }
  }

  async fn pause(&self, delay_ms: &Range<u64>) {
    if self.simulation.delay_scale <= 0.0 {
      return;
    }
    let millis = rand::thread_rng().gen_range(delay_ms.clone()) as f64 * self.simulation.delay_scale;
    sleep(Duration::from_millis(millis as u64)).await;
  }

  fn simulated_failure(&self, task: &Task) -> bool {
    task.attempt == 1 && rand::thread_rng().gen_bool(self.simulation.failure_rate.clamp(0.0, 1.0))
  }

  async fn run_stages(&self, task: &Task, stages: &[Stage], fail_before_last: bool) -> Result<(), HandlerError> {
    let task_id = task.task_id.as_str();
    for (i, stage) in stages.iter().enumerate() {
      if fail_before_last && i + 1 == stages.len() && self.simulated_failure(task) {
        return Err(HandlerError::Failed("simulated provisioning failure (network timeout)".into()));
      }
      best_effort(
        task_id,
        "update progress",
        self.reporter.update_status(task_id, ReportedStatus::Processing, stage.progress, Some(stage.current_step), None),
      )
        .await;
      if i > 0 {
        best_effort(task_id, "add completed step", self.reporter.add_completed_step(task_id, stages[i - 1].done)).await;
      }
      self.pause(&stage.delay_ms).await;
    }
    if let Some(last) = stages.last() {
      best_effort(task_id, "add completed step", self.reporter.add_completed_step(task_id, last.done)).await;
    }
    Ok(())
  }
}

#[async_trait]
impl TaskHandler for Provisioner {
  async fn process(&self, task: &Task) -> Result<TaskResult, HandlerError> {
    let start = Instant::now();
    info!("Processing task {} (attempt {}/{})", task.task_id, task.attempt, task.max_retries);
    best_effort(
      &task.task_id,
      "update task status",
      self.reporter.update_status(&task.task_id, ReportedStatus::Processing, 0, Some("Initializing task"), None),
    )
      .await;

    let spec = task.spec()?;
    match &spec {
      TaskSpec::Provision(p) => {
        info!("Provisioning tenant {} ({}) for module {}", task.tenant_id, p.tenant_code, task.module_id);
        self.run_stages(task, PROVISION_STAGES, true).await?;
        info!("Tenant {} provisioned successfully", task.tenant_id);
      }
      TaskSpec::Deprovision(d) => {
        info!(
          "Deprovisioning tenant {} ({}) for module {}, reason: {}",
          task.tenant_id,
          d.tenant_code,
          task.module_id,
          d.reason.as_deref().unwrap_or("unspecified")
        );
        self.run_stages(task, DEPROVISION_STAGES, false).await?;
        info!("Tenant {} deprovisioned successfully", task.tenant_id);
      }
      TaskSpec::Update(u) => {
        info!("Updating tenant {} configuration ({} feature changes)", spec.tenant_code(), u.features.len());
        self.run_stages(task, UPDATE_STAGES, false).await?;
        info!("Tenant {} updated successfully", task.tenant_id);
      }
    }
    Ok(TaskResult::success(task, start.elapsed().as_millis() as u64))
  }
}
