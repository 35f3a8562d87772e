// Background workers - drain the job queue and periodically sweep for
// submissions that a crash left behind.

use super::job_queue::JobQueue;
use super::moderation_models::JobOutcome;
use super::moderation_service::{ModerationError, ModerationService, RecoveryReport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long to sleep when the queue is empty.
    pub poll_interval: Duration,
    /// How often the recovery sweep runs.
    pub recovery_interval: Duration,
    /// How often a worker renews the lease on the job it is processing.
    /// Must be well under the queue's lease duration.
    pub lease_renewal: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            recovery_interval: Duration::from_secs(60),
            lease_renewal: Duration::from_secs(40),
        }
    }
}

pub struct ModerationWorker {
    name: String,
    service: Arc<ModerationService>,
    queue: Arc<dyn JobQueue>,
    config: WorkerConfig,
}

impl ModerationWorker {
    pub fn new(
        name: impl Into<String>,
        service: Arc<ModerationService>,
        queue: Arc<dyn JobQueue>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            name: name.into(),
            service,
            queue,
            config,
        }
    }

    /// Processes jobs until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("{} started", self.name);
        while !*shutdown.borrow() {
            let idle = match self.run_once().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    tracing::error!("{}: {}", self.name, e);
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        tracing::info!("{} stopped", self.name);
    }

    /// Handles at most one delivery. Returns `None` when the queue was empty.
    ///
    /// The lease is renewed for as long as `process_job` runs, so a slow job
    /// is never handed to a second worker. A delivery is acked only once
    /// `process_job` returns an outcome; on error it stays leased and is
    /// redelivered after the lease expires.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>, ModerationError> {
        let Some(delivery) = self.queue.dequeue().await? else {
            return Ok(None);
        };
        let submission_id = delivery.job.submission_id;

        let processing = self.service.process_job(&delivery.job);
        tokio::pin!(processing);
        let mut renewal = tokio::time::interval(self.config.lease_renewal);
        // The first tick completes immediately; the lease is fresh anyway.
        renewal.tick().await;
        let result = loop {
            tokio::select! {
                result = &mut processing => break result,
                _ = renewal.tick() => {
                    match self.queue.renew_lease(delivery.delivery_id).await {
                        Ok(true) => {}
                        Ok(false) => tracing::warn!(
                            "{}: job for submission {} vanished while processing",
                            self.name,
                            submission_id
                        ),
                        Err(e) => tracing::warn!(
                            "{}: could not renew lease for submission {}: {}",
                            self.name,
                            submission_id,
                            e
                        ),
                    }
                }
            }
        };

        match result {
            Ok(outcome) => {
                tracing::info!(
                    "{}: submission {} (delivery #{}) -> {:?}",
                    self.name,
                    submission_id,
                    delivery.delivery_count,
                    outcome
                );
                self.queue.ack(delivery.delivery_id).await?;
                Ok(Some(outcome))
            }
            Err(e) => {
                tracing::warn!(
                    "{}: submission {} left for redelivery: {}",
                    self.name,
                    submission_id,
                    e
                );
                Err(e)
            }
        }
    }
}

/// Runs a recovery sweep immediately, then every `interval`.
pub async fn run_recovery_loop(
    service: Arc<ModerationService>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        match service.recover().await {
            Ok(report) if report != RecoveryReport::default() => {
                tracing::info!(
                    "Recovery sweep: {} re-queued, {} failed, {} errors",
                    report.requeued,
                    report.failed,
                    report.errors
                );
            }
            Ok(_) => tracing::debug!("Recovery sweep found nothing to do"),
            Err(e) => tracing::warn!("Recovery sweep failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::moderation::testing::{
        RecordingTransport, ScriptedClassifier, ScriptedFetcher,
    };
    use crate::core::moderation::{
        Label, ModerationConfig, ModerationStore, NotificationGate, SubmissionState,
    };
    use crate::infra::moderation::{InMemoryJobQueue, InMemoryModerationStore};

    fn setup() -> (
        Arc<ModerationService>,
        Arc<InMemoryModerationStore>,
        Arc<InMemoryJobQueue>,
    ) {
        let store = Arc::new(InMemoryModerationStore::new());
        let queue = Arc::new(InMemoryJobQueue::new(Duration::from_secs(60)));
        let gate = NotificationGate::new(store.clone(), Arc::new(RecordingTransport::new()));
        let service = Arc::new(ModerationService::new(
            store.clone(),
            queue.clone(),
            Arc::new(ScriptedClassifier::always(Label::Safe, 97)),
            Arc::new(ScriptedFetcher::always(b"img".to_vec())),
            gate,
            ModerationConfig::default(),
        ));
        (service, store, queue)
    }

    #[tokio::test]
    async fn test_run_once_processes_and_acks() {
        let (service, store, queue) = setup();
        let worker = ModerationWorker::new(
            "worker-0",
            service.clone(),
            queue.clone(),
            WorkerConfig::default(),
        );

        assert!(worker.run_once().await.unwrap().is_none());

        let id = service
            .submit_image("user@example.com", "https://cdn.example.com/a.png")
            .await
            .unwrap();
        let outcome = worker.run_once().await.unwrap();

        assert_eq!(outcome, Some(JobOutcome::Completed(Label::Safe)));
        assert!(!queue.is_in_flight(id).await.unwrap());
        assert_eq!(
            store.get_submission(id).await.unwrap().unwrap().state,
            SubmissionState::Completed
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (service, _store, queue) = setup();
        let worker = ModerationWorker::new(
            "worker-0",
            service,
            queue,
            WorkerConfig {
                poll_interval: Duration::from_millis(5),
                ..WorkerConfig::default()
            },
        );
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(worker.run(rx));
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker should stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_slow_job_keeps_its_lease_and_is_not_recovered() {
        let store = Arc::new(InMemoryModerationStore::new());
        let queue = Arc::new(InMemoryJobQueue::new(Duration::from_millis(40)));
        let classifier = Arc::new(
            ScriptedClassifier::always(Label::Toxic, 80).with_delay(Duration::from_millis(250)),
        );
        let gate = NotificationGate::new(store.clone(), Arc::new(RecordingTransport::new()));
        let service = Arc::new(ModerationService::new(
            store.clone(),
            queue.clone(),
            classifier.clone(),
            Arc::new(ScriptedFetcher::always(b"img".to_vec())),
            gate,
            ModerationConfig::default(),
        ));
        let config = WorkerConfig {
            lease_renewal: Duration::from_millis(10),
            ..WorkerConfig::default()
        };
        let busy =
            ModerationWorker::new("worker-a", service.clone(), queue.clone(), config.clone());
        let idle = ModerationWorker::new("worker-b", service.clone(), queue.clone(), config);

        let id = service
            .submit_image("user@example.com", "https://cdn.example.com/a.png")
            .await
            .unwrap();
        let first = tokio::spawn(async move { busy.run_once().await });

        // Well past the original lease while the classifier is still working.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(idle.run_once().await.unwrap().is_none());
        assert!(queue.is_in_flight(id).await.unwrap());
        assert_eq!(service.recover().await.unwrap(), RecoveryReport::default());

        let outcome = first.await.unwrap().unwrap();
        assert_eq!(outcome, Some(JobOutcome::Completed(Label::Toxic)));
        assert_eq!(classifier.calls(), 1);
        let submission = store.get_submission(id).await.unwrap().unwrap();
        assert_eq!(submission.state, SubmissionState::Completed);
        assert_eq!(submission.recovery_attempts, 0);
        assert!(!queue.is_in_flight(id).await.unwrap());
    }
}
