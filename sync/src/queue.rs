//! # Job queue workers
//!
//! [`JobQueue`] pairs a [`QueueBackend`] with a [`JobHandler`] and runs up
//! to `concurrency` jobs at once. A failed attempt is retried with
//! exponential backoff until `max_attempts` is reached, unless the error is
//! not retryable, in which case the job fails immediately.
//!
//! A claimed job is leased for [`QueueSettings::lease`] and the lease is
//! renewed while the job runs, so workers in other processes leave it alone.
//! Every poll hands jobs with a lapsed lease back to pending.
//!
//! Shutdown stops claiming new jobs and waits for the ones in flight.

use async_trait::async_trait;
use errors::{JobError, QueueError};
use observability::{JobLabels, JobQueueKind, SyncTelemetry};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{Duration, Instant};
use storage::{QueueBackend, QueuedJob, Reserved};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    type Payload: Serialize + DeserializeOwned + Send + Sync + 'static;
    type Output: Send + 'static;

    fn labels(&self, payload: &Self::Payload) -> JobLabels;

    async fn process(&self, payload: &Self::Payload) -> Result<Self::Output, JobError>;

    async fn on_completed(&self, payload: &Self::Payload, output: Self::Output) -> Result<(), JobError>;

    /// Called after every failed attempt. `is_final` is set when no retry
    /// will follow.
    async fn on_failed(&self, payload: &Self::Payload, error: &JobError, is_final: bool) -> Result<(), JobError>;
}

/// Delay before retry `n` is `initial * multiplier^(n-1)`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(60)
        }
    }
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub poll_interval: Duration,
    pub backoff: BackoffPolicy,
    /// Attempts running longer than this fail with [`JobError::TimedOut`].
    pub timeout: Option<Duration>,
    /// How long a claimed job stays reserved without a renewal. Renewed
    /// every third of this while the job runs.
    pub lease: Duration
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            concurrency: 8,
            max_attempts: 3,
            poll_interval: Duration::from_secs(1),
            backoff: BackoffPolicy::default(),
            timeout: None,
            lease: Duration::from_secs(30)
        }
    }
}

pub struct JobQueue<H: JobHandler> {
    backend: Arc<dyn QueueBackend>,
    handler: Arc<H>,
    settings: QueueSettings,
    telemetry: SyncTelemetry
}

impl<H: JobHandler> JobQueue<H> {
    pub fn new(backend: Arc<dyn QueueBackend>, handler: Arc<H>, kind: JobQueueKind, settings: QueueSettings) -> Self {
        Self {
            backend,
            handler,
            settings,
            telemetry: SyncTelemetry::new(kind)
        }
    }

    pub fn name(&self) -> &'static str {
        self.telemetry.kind().queue_name()
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub async fn enqueue(&self, id: Uuid, payload: &H::Payload) -> Result<(), JobError> {
        let value = serde_json::to_value(payload).map_err(|e| QueueError::Payload {
            queue: self.name().to_string(),
            reason: e.to_string()
        })?;
        let job = QueuedJob::new(self.name(), id, value, self.settings.max_attempts);
        self.backend.push(&job).await?;
        self.telemetry.job_enqueued(&self.handler.labels(payload));
        debug!(queue = self.name(), job_id = %id, "Enqueued job");
        Ok(())
    }

    pub async fn pending_count(&self) -> Result<usize, JobError> {
        Ok(self.backend.pending_count(self.name()).await?)
    }

    /// Claims and executes jobs until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let queue = self.name();
        let slots = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut in_flight = JoinSet::new();
        info!(queue, concurrency = self.settings.concurrency, "Worker started");

        loop {
            while in_flight.try_join_next().is_some() {}

            let permit = tokio::select! {
                () = shutdown.cancelled() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break
                }
            };

            match self.claim().await {
                Ok(Some(reserved)) => {
                    let this = Arc::clone(&self);
                    in_flight.spawn(async move {
                        this.execute(reserved).await;
                        drop(permit);
                    });
                    continue;
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    drop(permit);
                    warn!(queue, error = %e, "Failed to claim job");
                }
            }

            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        info!(queue, in_flight = in_flight.len(), "Worker stopping, waiting for in-flight jobs");
        while in_flight.join_next().await.is_some() {}
    }

    async fn claim(&self) -> Result<Option<Reserved>, QueueError> {
        let queue = self.name();
        let recovered = self.backend.recover_stalled(queue).await?;
        if recovered > 0 {
            info!(queue, recovered, "Re-queued jobs whose lease expired");
        }
        self.backend.promote_due(queue).await?;
        self.backend.reserve(queue, self.settings.lease).await
    }

    /// Renews the lease of `reserved` until the lease is gone.
    async fn keep_leased(&self, reserved: &Reserved) {
        let queue = self.name();
        let lease = self.settings.lease;
        let mut ticker = tokio::time::interval((lease / 3).max(Duration::from_millis(10)));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match self.backend.renew(queue, reserved, lease).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(queue, job_id = %reserved.job.id, "Job lease lost, another worker may pick it up");
                    break;
                }
                Err(e) => warn!(queue, job_id = %reserved.job.id, error = %e, "Failed to renew job lease")
            }
        }
    }

    async fn execute(&self, reserved: Reserved) {
        let queue = self.name();
        let job = &reserved.job;

        let payload: H::Payload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                error!(queue, job_id = %job.id, error = %e, "Dropping job with malformed payload");
                if let Err(e) = self.backend.ack(queue, &reserved).await {
                    warn!(queue, job_id = %job.id, error = %e, "Failed to ack job");
                }
                return;
            }
        };

        let labels = self.handler.labels(&payload);
        let span = info_span!("job", queue, job_id = %job.id, attempt = job.attempts_made + 1);
        self.telemetry.job_started(&labels);
        let started = Instant::now();

        let attempt = async {
            match self.settings.timeout {
                Some(limit) => tokio::time::timeout(limit, self.handler.process(&payload))
                    .await
                    .unwrap_or(Err(JobError::TimedOut)),
                None => self.handler.process(&payload).await
            }
        };
        let attempt = attempt.instrument(span.clone());
        tokio::pin!(attempt);
        let result = tokio::select! {
            result = &mut attempt => result,
            () = self.keep_leased(&reserved) => attempt.await
        };
        self.telemetry.job_duration(started.elapsed().as_secs_f64());

        match result {
            Ok(output) => {
                if let Err(e) = self.backend.ack(queue, &reserved).await {
                    warn!(queue, job_id = %job.id, error = %e, "Failed to ack job");
                }
                self.telemetry.job_completed(&labels);
                if let Err(e) = self.handler.on_completed(&payload, output).instrument(span).await {
                    error!(queue, job_id = %job.id, error = %e, "Completion hook failed");
                }
            }
            Err(err) => {
                let is_final = !err.is_retryable() || job.is_final_attempt();
                if is_final {
                    if let Err(e) = self.backend.ack(queue, &reserved).await {
                        warn!(queue, job_id = %job.id, error = %e, "Failed to ack job");
                    }
                } else {
                    let mut next = job.clone();
                    next.attempts_made += 1;
                    let delay = err
                        .retry_after()
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| self.settings.backoff.delay(next.attempts_made));
                    warn!(queue, job_id = %job.id, error = %err, delay_ms = delay.as_millis() as u64, "Job failed, retrying");
                    if let Err(e) = self.backend.schedule_retry(queue, &reserved, &next, delay).await {
                        error!(queue, job_id = %job.id, error = %e, "Failed to schedule retry");
                    }
                }

                self.telemetry.job_failed(&labels, is_final);
                if let Err(e) = self.handler.on_failed(&payload, &err, is_final).instrument(span).await {
                    error!(queue, job_id = %job.id, error = %e, "Failure hook failed");
                }
            }
        }
    }
}
