use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};

use provq::bootstrap::{ensure_consumer, ensure_stream, ConsumerSpec, StreamSpec};
use provq::config::Config;
use provq::dead_letter::DeadLetterRouter;
use provq::logging;
use provq::messaging::{BrokerContext, JetStreamSource, CONSUMER_NAME, STREAM_NAME};
use provq::retry_policy::RetryPolicy;
use provq::routes::routes;
use provq::status_reporter::{DisabledReporter, OrchestratorClient, StatusReporter};
use provq::worker_loop::{ConsumerLoop, WorkerStats};
use provq::worker_processing::{Provisioner, Simulation};

const SERVICE_TYPE: &str = "worker";
const SERVICE_PERMISSIONS: &[&str] = &["tasks:read", "tasks:update"];

async fn build_reporter(config: &Config) -> Result<Arc<dyn StatusReporter>> {
  let Some(url) = config.orchestrator_url.as_deref() else {
    info!("ORCHESTRATOR_URL not set, progress reporting disabled");
    return Ok(Arc::new(DisabledReporter));
  };
  let client = OrchestratorClient::new(url, config.service_id.clone())?;
  if let Err(e) = client.authenticate(SERVICE_TYPE, SERVICE_PERMISSIONS).await {
    warn!("Failed to authenticate with orchestrator at {}: {}", url, e);
  }
  Ok(Arc::new(client))
}

#[tokio::main]
async fn main() -> Result<()> {
  logging::init();
  let config = Config::from_env().context("Invalid worker configuration")?;
  info!("Starting provisioning worker {}", config.worker_id);

  let ctx = BrokerContext::connect(&config.nats_url, config.worker_id.clone()).await?;
  ensure_stream(&ctx.jetstream, &StreamSpec::provisioning()).await?;
  let consumer = ensure_consumer(
    &ctx.jetstream,
    STREAM_NAME,
    &ConsumerSpec::provisioning(&config.worker_id, config.ack_wait, config.max_deliver),
  )
    .await?;

  let policy = RetryPolicy::new(config.retry_backoff_secs, consumer.max_deliver);
  let reporter = build_reporter(&config).await?;
  let handler = Arc::new(Provisioner::new(
    reporter.clone(),
    Simulation {
      failure_rate: config.simulated_failure_rate,
      ..Simulation::default()
    },
  ));

  let source = JetStreamSource::new(
    ctx.pull_consumer(STREAM_NAME, CONSUMER_NAME).await?,
    CONSUMER_NAME,
    config.fetch_wait,
  );
  let stats = Arc::new(WorkerStats::default());
  let consumer_loop = ConsumerLoop::new(source, handler, reporter, DeadLetterRouter::from_context(&ctx), policy)
    .with_fetch_error_pause(config.fetch_error_pause)
    .with_stats(stats.clone());

  if let Some(port) = config.health_port {
    info!("Health endpoint listening on port {}", port);
    tokio::spawn(warp::serve(routes(config.worker_id.clone(), stats)).run(([0, 0, 0, 0], port)));
  }

  let (shutdown_tx, shutdown_rx) = watch::channel(false);
  let worker = tokio::spawn(consumer_loop.run(shutdown_rx));
  info!("Worker {} started, waiting for tasks...", config.worker_id);

  match tokio::signal::ctrl_c().await {
    Ok(()) => info!("Shutdown signal received"),
    Err(e) => error!("Failed to listen for shutdown signal: {}", e),
  }
  let _ = shutdown_tx.send(true);

  worker.await.context("Consumer loop panicked")?;
  if let Err(e) = ctx.client.flush().await {
    warn!("Failed to flush NATS connection: {}", e);
  }
  info!("Worker {} stopped", config.worker_id);
  Ok(())
}
