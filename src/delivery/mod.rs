//! Delivery pipeline: a dispatcher claims due messages and hands them to a
//! bounded set of workers. Workers resolve a provider, send, append a
//! delivery-log row and transition the message; exhausted or permanent
//! failures are promoted to the DLQ.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::{QueueConfig, RetryConfig, WorkerConfig};
use crate::models::{
    AttemptRecord, AuditEntry, DeliveryState, DlqEntry, DlqEntryId, DlqPayload, GroupStatus,
    Message, Provider, QuotaStatus,
};
use crate::providers::{EspFactory, ProviderError};
use crate::routing::{HealthChecker, RoutingEngine};
use crate::store::Store;

/// `min(cap, base * 2^retry_count) * uniform(0.5, 1.5)`, clamped to the cap.
pub fn backoff_delay(retry_count: i32, retry_after: Option<Duration>, config: &RetryConfig) -> Duration {
    if let Some(retry_after) = retry_after {
        return retry_after.min(config.max_delay);
    }
    let exp = retry_count.clamp(0, 24) as u32;
    let raw = config
        .base_delay
        .saturating_mul(2u32.saturating_pow(exp))
        .min(config.max_delay);
    let jitter = rand::random_range(0.5..1.5);
    raw.mul_f64(jitter).min(config.max_delay)
}

#[derive(Clone)]
pub struct DeliveryWorkerPool {
    store: Arc<dyn Store>,
    routing: RoutingEngine,
    health: Arc<HealthChecker>,
    esp: Arc<dyn EspFactory>,
    workers: Arc<Semaphore>,
    worker_config: Arc<WorkerConfig>,
    retry_config: Arc<RetryConfig>,
    queue_config: Arc<QueueConfig>,
    shutdown: CancellationToken,
}

impl DeliveryWorkerPool {
    pub fn new(
        store: Arc<dyn Store>,
        health: Arc<HealthChecker>,
        esp: Arc<dyn EspFactory>,
        worker_config: WorkerConfig,
        retry_config: RetryConfig,
        queue_config: QueueConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            routing: RoutingEngine::new(store.clone(), health.clone()),
            store,
            health,
            esp,
            workers: Arc::new(Semaphore::new(worker_config.count)),
            worker_config: Arc::new(worker_config),
            retry_config: Arc::new(retry_config),
            queue_config: Arc::new(queue_config),
            shutdown,
        }
    }

    /// Dispatcher plus janitor. The returned handle resolves once the intake
    /// is closed and in-flight sends have drained.
    pub fn spawn(self) -> JoinHandle<()> {
        self.clone().spawn_janitor();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.worker_config.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        info!("delivery intake closed");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = self.dispatch_batch().await {
                            error!("failed to claim messages: {e}");
                        }
                    }
                }
            }

            // wait for in-flight sends; each holds one permit
            let _ = self
                .workers
                .acquire_many(self.worker_config.count as u32)
                .await;
            info!("delivery workers drained");
        })
    }

    fn spawn_janitor(self) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.queue_config.visibility_timeout / 4);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = interval.tick() => {
                        match self
                            .store
                            .reclaim_stuck(self.queue_config.visibility_timeout, Utc::now())
                            .await
                        {
                            Ok(0) => {}
                            Ok(reclaimed) => warn!(reclaimed, "returned stuck messages to the queue"),
                            Err(e) => error!("janitor failed: {e}"),
                        }
                        if let Ok(depth) = self.store.queue_depth().await {
                            trace!(depth, "queue depth");
                        }
                    }
                }
            }
        });
    }

    async fn dispatch_batch(&self) -> crate::store::StoreResult<()> {
        let claimed = self
            .store
            .claim(self.queue_config.claim_batch, Utc::now())
            .await?;
        for message in claimed {
            let Ok(permit) = self.workers.clone().acquire_owned().await else {
                return Ok(());
            };
            let pool = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let id = message.id;
                if let Err(e) = pool.process(message).await {
                    error!(message_id = %id, "failed to process message: {e}");
                }
            });
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, message), fields(message_id = %message.id, group_id = %message.group_id))]
    async fn process(&self, message: Message) -> crate::store::StoreResult<()> {
        let now = Utc::now();

        let Some(group) = self.store.group(message.group_id).await? else {
            return self.promote(&message, "tenant no longer exists", now).await;
        };
        match group.status {
            GroupStatus::Active => {}
            GroupStatus::Deleted => {
                return self.promote(&message, "tenant deleted", now).await;
            }
            GroupStatus::Suspended => {
                debug!("tenant suspended, rescheduling");
                return self.reschedule(&message, "tenant suspended", None, now).await;
            }
        }

        if self.store.try_consume_quota(group.id).await? == QuotaStatus::Exceeded {
            debug!("monthly limit reached, rescheduling");
            return self
                .reschedule(&message, "monthly limit reached", None, now)
                .await;
        }

        let Some(provider) = self.routing.resolve(&group, &message.envelope, now).await? else {
            debug!("no eligible provider");
            return self
                .reschedule(&message, "no eligible provider", None, now)
                .await;
        };

        let client = match self.esp.build(&provider) {
            Ok(client) => client,
            Err(e) => {
                warn!(provider = %provider.name, "cannot construct adapter: {e}");
                return self.handle_send_error(&message, &provider, e, now).await;
            }
        };

        let outcome = tokio::time::timeout(
            self.worker_config.send_timeout,
            client.send(&message.envelope),
        )
        .await
        .unwrap_or_else(|_| Err(ProviderError::transient("send deadline exceeded")));

        match outcome {
            Ok(result) => {
                self.health.record_success(provider.id);
                self.store
                    .append_delivery_log(
                        message.id,
                        AttemptRecord {
                            provider_id: provider.id,
                            status: DeliveryState::from(result.status),
                            response_code: result.response_code(),
                            response_body: None,
                            provider_message_id: result.provider_message_id.clone(),
                            retry_count: message.retry_count,
                            last_error: None,
                            metadata: result.metadata.clone(),
                        },
                    )
                    .await?;
                self.store.mark_delivered(message.id, Utc::now()).await?;
                info!(
                    provider = %provider.name,
                    provider_message_id = result.provider_message_id.as_deref().unwrap_or(""),
                    "message delivered"
                );
                Ok(())
            }
            Err(error) => self.handle_send_error(&message, &provider, error, now).await,
        }
    }

    async fn handle_send_error(
        &self,
        message: &Message,
        provider: &Provider,
        error: ProviderError,
        now: DateTime<Utc>,
    ) -> crate::store::StoreResult<()> {
        self.health.record_failure(provider.id, now);
        self.store
            .append_delivery_log(
                message.id,
                AttemptRecord {
                    provider_id: provider.id,
                    status: DeliveryState::Failed,
                    response_code: error.response_code,
                    response_body: None,
                    provider_message_id: None,
                    retry_count: message.retry_count,
                    last_error: Some(error.message.clone()),
                    metadata: serde_json::Value::Null,
                },
            )
            .await?;

        if error.kind == crate::providers::ErrorKind::Auth {
            error!(provider = %provider.name, "provider rejected credentials: {error}");
            self.store
                .append_audit(
                    AuditEntry::new(
                        Some(message.group_id),
                        "delivery-worker",
                        "provider.auth_failure",
                        "provider",
                        provider.id.to_string(),
                    )
                    .with_changes(serde_json::json!({"error": error.message})),
                )
                .await
                .ok();
        }

        if error.is_retryable() {
            let retry_after = error.retry_after;
            self.reschedule(message, &error.message, retry_after, now).await
        } else {
            warn!(provider = %provider.name, "permanent failure: {error}");
            self.promote(message, &error.message, now).await
        }
    }

    /// Transient path: back to queued with backoff, or to the DLQ once
    /// attempts are exhausted.
    async fn reschedule(
        &self,
        message: &Message,
        reason: &str,
        retry_after: Option<Duration>,
        now: DateTime<Utc>,
    ) -> crate::store::StoreResult<()> {
        if message.retry_count + 1 >= self.retry_config.max_attempts {
            return self
                .promote(message, &format!("retries exhausted: {reason}"), now)
                .await;
        }
        let delay = backoff_delay(message.retry_count, retry_after, &self.retry_config);
        let next = now + ChronoDuration::from_std(delay).unwrap_or_default();
        debug!(reason, next_attempt_at = %next, "rescheduling message");
        self.store.mark_failed(message.id, next).await
    }

    async fn promote(
        &self,
        message: &Message,
        reason: &str,
        now: DateTime<Utc>,
    ) -> crate::store::StoreResult<()> {
        self.store
            .push_dlq(DlqEntry {
                id: DlqEntryId::random(),
                message_id: message.id,
                group_id: message.group_id,
                failure_reason: reason.to_string(),
                payload: DlqPayload {
                    envelope: message.envelope.clone(),
                    last_error: reason.to_string(),
                    attempts: message.retry_count + 1,
                },
                enqueued_at: now,
            })
            .await?;
        self.store.mark_dead(message.id, now).await?;
        warn!(reason, "message promoted to the DLQ");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{
        Envelope, MessageStatus, NewGroup, NewMessage, NewProvider, NewRoutingRule, ProviderKind,
        RuleConditions,
    };
    use crate::providers::mock::{MockEsp, MockEspFactory};
    use crate::store::{
        DeliveryLogStore, DirectoryStore, DlqStore, MemoryStore, QueueStore,
    };
    use std::collections::BTreeMap;

    fn small_retry() -> RetryConfig {
        RetryConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            max_attempts: 5,
        }
    }

    fn fast_workers() -> WorkerConfig {
        WorkerConfig {
            count: 4,
            send_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
        }
    }

    fn envelope() -> Envelope {
        Envelope {
            sender: "alice@example.com".into(),
            recipients: vec!["bob@dest.com".into()],
            subject: "Hi".into(),
            headers: BTreeMap::new(),
            body: b"Subject: Hi\r\n\r\nhello".to_vec(),
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        esp: Arc<MockEsp>,
        shutdown: CancellationToken,
        group: crate::models::GroupId,
    }

    async fn harness(retry: RetryConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let group = store
            .create_group(NewGroup {
                name: "acme".into(),
                monthly_limit: 1000,
                allow_any_sender: true,
                fallback_providers: vec![],
            })
            .await
            .unwrap();
        let provider = store
            .create_provider(
                group.id,
                NewProvider {
                    name: "sendgrid-mock".into(),
                    kind: ProviderKind::Sendgrid,
                    api_key: Some("key".into()),
                    smtp_config: serde_json::json!({}),
                    enabled: true,
                },
            )
            .await
            .unwrap();
        store
            .create_rule(
                group.id,
                NewRoutingRule {
                    priority: 0,
                    conditions: RuleConditions::default(),
                    provider_id: provider.id,
                    enabled: true,
                },
            )
            .await
            .unwrap();

        let esp = MockEsp::new("sendgrid-mock");
        let factory = MockEspFactory::new();
        factory.register(provider.id, esp.clone());

        let shutdown = CancellationToken::new();
        let pool = DeliveryWorkerPool::new(
            store.clone(),
            Arc::new(HealthChecker::new(crate::config::HealthConfig::default())),
            Arc::new(factory),
            fast_workers(),
            retry,
            QueueConfig {
                claim_batch: 16,
                visibility_timeout: Duration::from_secs(600),
            },
            shutdown.clone(),
        );
        pool.spawn();

        Harness {
            store,
            esp,
            shutdown,
            group: group.id,
        }
    }

    async fn wait_for_status(
        store: &MemoryStore,
        id: crate::models::MessageId,
        status: MessageStatus,
    ) {
        for _ in 0..500 {
            if store.message(id).await.unwrap().unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "message never reached {status:?}, stuck at {:?}",
            store.message(id).await.unwrap().unwrap().status
        );
    }

    #[tokio::test]
    async fn happy_path_delivers_and_logs() {
        let h = harness(small_retry()).await;
        let id = h
            .store
            .enqueue(NewMessage {
                group_id: h.group,
                envelope: envelope(),
            })
            .await
            .unwrap();

        wait_for_status(&h.store, id, MessageStatus::Delivered).await;

        let logs = h.store.logs_for_message(id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, DeliveryState::Sent);
        assert!(logs[0].provider_message_id.is_some());
        assert_eq!(h.esp.sent_count(), 1);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn transient_failures_then_success() {
        let h = harness(small_retry()).await;
        h.esp
            .push_error(ProviderError::transient("503 upstream").with_code(503));
        h.esp
            .push_error(ProviderError::transient("503 upstream").with_code(503));

        let id = h
            .store
            .enqueue(NewMessage {
                group_id: h.group,
                envelope: envelope(),
            })
            .await
            .unwrap();

        wait_for_status(&h.store, id, MessageStatus::Delivered).await;

        let message = h.store.message(id).await.unwrap().unwrap();
        assert_eq!(message.retry_count, 2);
        let logs = h.store.logs_for_message(id).await.unwrap();
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[0].status, DeliveryState::Failed);
        assert_eq!(logs[0].response_code, Some(503));
        assert_eq!(logs[2].status, DeliveryState::Sent);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn permanent_failure_promotes_to_dlq() {
        let h = harness(small_retry()).await;
        h.esp
            .push_error(ProviderError::permanent("400 bad request").with_code(400));

        let id = h
            .store
            .enqueue(NewMessage {
                group_id: h.group,
                envelope: envelope(),
            })
            .await
            .unwrap();

        wait_for_status(&h.store, id, MessageStatus::Dead).await;

        let logs = h.store.logs_for_message(id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, DeliveryState::Failed);

        let entry = h
            .store
            .dlq_entry_for_message(h.group, id)
            .await
            .unwrap()
            .expect("dlq entry");
        assert_eq!(entry.payload.envelope, envelope());
        assert_eq!(entry.payload.attempts, 1);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn retries_exhaust_into_the_dlq() {
        let mut retry = small_retry();
        retry.max_attempts = 3;
        let h = harness(retry).await;
        for _ in 0..3 {
            h.esp
                .push_error(ProviderError::transient("503 upstream").with_code(503));
        }

        let id = h
            .store
            .enqueue(NewMessage {
                group_id: h.group,
                envelope: envelope(),
            })
            .await
            .unwrap();

        wait_for_status(&h.store, id, MessageStatus::Dead).await;

        let message = h.store.message(id).await.unwrap().unwrap();
        assert!(message.retry_count <= 3);
        assert!(h
            .store
            .dlq_entry_for_message(h.group, id)
            .await
            .unwrap()
            .is_some());
        h.shutdown.cancel();
    }

    #[test]
    fn backoff_bounds_and_cap() {
        let config = RetryConfig {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
            max_attempts: 5,
        };
        for retry_count in 0..6 {
            let expected = Duration::from_secs(30)
                .saturating_mul(2u32.pow(retry_count as u32))
                .min(config.max_delay);
            for _ in 0..50 {
                let delay = backoff_delay(retry_count, None, &config);
                assert!(delay >= expected.mul_f64(0.5), "delay {delay:?} below bound");
                assert!(delay <= expected.mul_f64(1.5).min(config.max_delay));
            }
        }
    }

    #[test]
    fn backoff_honors_retry_after() {
        let config = RetryConfig::default();
        let delay = backoff_delay(0, Some(Duration::from_secs(120)), &config);
        assert_eq!(delay, Duration::from_secs(120));
    }
}
