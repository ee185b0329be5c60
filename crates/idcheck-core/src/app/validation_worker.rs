//! ValidationWorker - 検証ステージ
//!
//! # フロー（delivery ごと）
//! 1. payload を RegistrationRequest として decode（失敗 → error 応答）
//! 2. 本人の DNI をレジストリで検索（無し → error 応答）
//! 3. 申告された連絡先を matched / unmatched に分割（unmatched あり → error 応答）
//! 4. すべて通ったら元の bytes とプロパティのまま `save` へ転送。応答はしない
//! 5. 応答・転送の後で ack
//!
//! レジストリ障害は error 応答として返す（呼び出し側をタイムアウトまで待たせない）。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::app::retry::RetryPolicy;
use crate::app::service::{DeliveryHandler, QueueBinding, ServiceHandle, send_reply};
use crate::domain::{
    BusError, ConnectivityError, ContactPartition, ErrorKind, IdentityRecord, MatchedContact,
    Message, OutgoingMessage, RegistrationRequest, RegistryError, ValidationResponse,
};
use crate::ports::{BusChannel, Delivery, IdentityRegistry, MessageBus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWorkerConfig {
    pub exchange: String,
    pub queue: String,
    pub check_key: String,
    pub save_key: String,
    pub prefetch: u16,
    pub policy: RetryPolicy,
    pub reconnect_delay: Duration,
}

impl Default for ValidationWorkerConfig {
    fn default() -> Self {
        Self {
            exchange: "validation".into(),
            queue: "validate_dni".into(),
            check_key: "check".into(),
            save_key: "save".into(),
            prefetch: 5,
            policy: RetryPolicy::broker_default(),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// Terminal decision of the validation step for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Reply with this error; nothing is forwarded.
    Rejected(ValidationResponse),
    /// Every identity resolved; hand the request to the persistence stage.
    Accepted { matched: Vec<MatchedContact> },
}

/// Registry checks for one request, free of any bus concern.
pub struct Validator {
    registry: Arc<dyn IdentityRegistry>,
}

impl Validator {
    pub fn new(registry: Arc<dyn IdentityRegistry>) -> Self {
        Self { registry }
    }

    pub async fn lookup_primary(&self, dni: &str) -> Result<Option<IdentityRecord>, RegistryError> {
        self.registry.find_by_dni(dni).await
    }

    /// Resolve each contact in order.
    pub async fn lookup_contacts(&self, ids: &[String]) -> Result<ContactPartition, RegistryError> {
        let mut partition = ContactPartition::default();
        for id in ids {
            match self.registry.find_by_dni(id).await? {
                Some(record) => partition.matched.push(MatchedContact {
                    dni: id.clone(),
                    name: record.display_name(),
                }),
                None => partition.unmatched.push(id.clone()),
            }
        }
        Ok(partition)
    }

    /// Run the full check. The returned rejection carries no correlation id.
    pub async fn validate(&self, request: &RegistrationRequest) -> Result<Verdict, RegistryError> {
        let Some(primary) = self.lookup_primary(&request.dni).await? else {
            tracing::info!(dni = %request.dni, kind = ?ErrorKind::Validation, "identity not found");
            return Ok(Verdict::Rejected(ValidationResponse::error(
                format!("DNI {} no encontrado en el registro", request.dni),
                "",
            )));
        };
        tracing::debug!(dni = %request.dni, name = %primary.display_name(), "identity found");

        let partition = self.lookup_contacts(request.contact_ids()).await?;
        if !partition.all_matched() {
            tracing::info!(
                dni = %request.dni,
                kind = ?ErrorKind::Validation,
                unmatched = ?partition.unmatched,
                "unknown contacts"
            );
            let message = format!(
                "DNIs de amigos no encontrados: {}",
                partition.unmatched.join(", ")
            );
            return Ok(Verdict::Rejected(
                ValidationResponse::error(message, "").with_partition(partition),
            ));
        }

        Ok(Verdict::Accepted {
            matched: partition.matched,
        })
    }
}

/// Counters exposed for observation and tests.
#[derive(Debug, Default)]
pub struct WorkerStats {
    received: AtomicU64,
    rejected: AtomicU64,
    forwarded: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStatsSnapshot {
    pub received: u64,
    pub rejected: u64,
    pub forwarded: u64,
    pub in_flight: usize,
    pub peak_in_flight: usize,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
        }
    }

    fn enter(&self) -> InFlight<'_> {
        self.received.fetch_add(1, Ordering::Relaxed);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(self)
    }
}

struct InFlight<'a>(&'a WorkerStats);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ValidationHandler {
    validator: Validator,
    exchange: String,
    save_key: String,
    stats: Arc<WorkerStats>,
}

enum Handled {
    Reply(ValidationResponse),
    Forwarded,
}

impl ValidationHandler {
    async fn process(&self, channel: &Arc<dyn BusChannel>, message: &Message) -> Handled {
        let request = match RegistrationRequest::from_json(&message.body) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "malformed request payload");
                return Handled::Reply(ValidationResponse::error(format!("payload inválido: {e}"), ""));
            }
        };
        tracing::info!(dni = %request.dni, name = %request.name, "validating");

        match self.validator.validate(&request).await {
            Ok(Verdict::Rejected(response)) => Handled::Reply(response),
            Ok(Verdict::Accepted { matched }) => match self.forward(channel, message).await {
                Ok(()) => {
                    tracing::info!(dni = %request.dni, contacts = matched.len(), "forwarded to persistence");
                    Handled::Forwarded
                }
                Err(e) => {
                    tracing::error!(kind = ?e.kind(), error = %e, "forward failed");
                    Handled::Reply(ValidationResponse::error(e.to_string(), ""))
                }
            },
            Err(e) => {
                tracing::error!(kind = ?e.kind(), error = %e, "registry lookup failed");
                Handled::Reply(ValidationResponse::error(e.to_string(), ""))
            }
        }
    }

    /// Republish the original body under the save key, properties untouched.
    async fn forward(&self, channel: &Arc<dyn BusChannel>, message: &Message) -> Result<(), BusError> {
        let properties = message.properties.clone().persistent();
        channel
            .publish(
                &self.exchange,
                &self.save_key,
                OutgoingMessage::new(message.body.clone(), properties),
            )
            .await
    }
}

#[async_trait]
impl DeliveryHandler for ValidationHandler {
    async fn handle(&self, channel: Arc<dyn BusChannel>, delivery: Delivery) {
        let in_flight = self.stats.enter();
        let started = Instant::now();
        let correlation_id = delivery.message.correlation_id().unwrap_or_default().to_string();

        match self.process(&channel, &delivery.message).await {
            Handled::Reply(response) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                let mut response = response.with_processing_time(elapsed_ms(started));
                response.correlation_id = correlation_id;
                if let Err(e) = send_reply(&channel, &delivery.message, &response).await {
                    tracing::error!(error = %e, "failed to publish reply");
                }
            }
            Handled::Forwarded => {
                self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
            }
        }

        drop(in_flight);
        if let Err(e) = delivery.ack().await {
            tracing::warn!(error = %e, "ack failed, delivery will be redelivered");
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// The running validation stage.
pub struct ValidationWorker {
    service: ServiceHandle,
    stats: Arc<WorkerStats>,
}

impl ValidationWorker {
    /// Connect to the bus, declare the topology and start consuming.
    pub async fn start(
        bus: Arc<dyn MessageBus>,
        registry: Arc<dyn IdentityRegistry>,
        config: ValidationWorkerConfig,
    ) -> Result<Self, ConnectivityError> {
        let stats = Arc::new(WorkerStats::default());
        let handler = Arc::new(ValidationHandler {
            validator: Validator::new(registry),
            exchange: config.exchange.clone(),
            save_key: config.save_key.clone(),
            stats: Arc::clone(&stats),
        });
        let binding = QueueBinding {
            exchange: config.exchange,
            queue: config.queue,
            routing_key: config.check_key,
            prefetch: config.prefetch,
        };
        let service = ServiceHandle::start(
            "validation-worker",
            bus,
            binding,
            handler,
            config.policy,
            config.reconnect_delay,
        )
        .await?;
        Ok(Self { service, stats })
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn service(&self) -> &ServiceHandle {
        &self.service
    }

    pub async fn shutdown(&self) {
        self.service.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::connection::LinkState;
    use crate::domain::{MessageProperties, ValidationStatus, reference_identities};
    use crate::impls::{InMemoryBroker, InMemoryRegistry};
    use crate::ports::{ConsumeOptions, Consumer, QueueSpec};

    async fn seeded_registry() -> Arc<InMemoryRegistry> {
        let registry = Arc::new(InMemoryRegistry::new());
        for record in reference_identities() {
            registry.insert(record).await.unwrap();
        }
        registry
    }

    /// Delays every lookup so deliveries overlap.
    struct SlowRegistry {
        inner: Arc<InMemoryRegistry>,
        delay: Duration,
    }

    #[async_trait]
    impl IdentityRegistry for SlowRegistry {
        async fn find_by_dni(&self, dni: &str) -> Result<Option<IdentityRecord>, RegistryError> {
            tokio::time::sleep(self.delay).await;
            self.inner.find_by_dni(dni).await
        }

        async fn insert(&self, record: IdentityRecord) -> Result<(), RegistryError> {
            self.inner.insert(record).await
        }
    }

    struct Harness {
        worker: ValidationWorker,
        channel: Arc<dyn BusChannel>,
        reply_queue: String,
        replies: Consumer,
        forwards: Consumer,
    }

    impl Harness {
        async fn start(
            broker: &Arc<InMemoryBroker>,
            registry: Arc<dyn IdentityRegistry>,
            prefetch: u16,
        ) -> Self {
            let worker = ValidationWorker::start(
                Arc::clone(broker) as Arc<dyn MessageBus>,
                registry,
                ValidationWorkerConfig {
                    prefetch,
                    ..ValidationWorkerConfig::default()
                },
            )
            .await
            .unwrap();

            let channel = broker.connect().await.unwrap();
            let reply_queue = channel.declare_queue(QueueSpec::exclusive()).await.unwrap();
            let replies = channel
                .consume(&reply_queue, ConsumeOptions::auto_ack())
                .await
                .unwrap();
            let save_queue = channel.declare_queue(QueueSpec::durable("save_user")).await.unwrap();
            channel.bind_queue(&save_queue, "validation", "save").await.unwrap();
            let forwards = channel
                .consume(&save_queue, ConsumeOptions::auto_ack())
                .await
                .unwrap();

            Self {
                worker,
                channel,
                reply_queue,
                replies,
                forwards,
            }
        }

        async fn send_bytes(&self, body: Vec<u8>, correlation_id: &str) {
            let properties = MessageProperties::default()
                .with_correlation(correlation_id)
                .with_reply_to(&self.reply_queue)
                .persistent();
            self.channel
                .publish("validation", "check", OutgoingMessage::new(body, properties))
                .await
                .unwrap();
        }

        async fn send(&self, request: &RegistrationRequest, correlation_id: &str) {
            self.send_bytes(request.to_json().unwrap(), correlation_id).await;
        }

        async fn next_reply(&mut self) -> (Message, ValidationResponse) {
            let message = self.replies.next().await.unwrap().message;
            let response = ValidationResponse::from_json(&message.body).unwrap();
            (message, response)
        }
    }

    fn request(dni: &str) -> RegistrationRequest {
        RegistrationRequest::new(dni, "Ana", "ana@example.com", "secret", "999111222")
    }

    async fn nothing_within(consumer: &mut Consumer, wait: Duration) -> bool {
        tokio::time::timeout(wait, consumer.next()).await.is_err()
    }

    #[tokio::test]
    async fn validator_partitions_contacts_in_order() {
        let validator = Validator::new(seeded_registry().await);
        let ids = vec!["99999999".to_string(), "12345678".into(), "00000000".into()];

        let partition = validator.lookup_contacts(&ids).await.unwrap();

        assert_eq!(
            partition.matched,
            vec![MatchedContact {
                dni: "12345678".into(),
                name: "María López Díaz".into(),
            }]
        );
        assert_eq!(partition.unmatched, vec!["99999999", "00000000"]);
    }

    #[tokio::test]
    async fn validator_accepts_known_identity_without_contacts() {
        let validator = Validator::new(seeded_registry().await);

        let verdict = validator.validate(&request("20453629")).await.unwrap();

        assert_eq!(verdict, Verdict::Accepted { matched: vec![] });
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_identity_gets_error_reply_and_no_forward() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut h = Harness::start(&broker, seeded_registry().await, 5).await;

        h.send(&request("99999999"), "corr-1").await;
        let (message, response) = h.next_reply().await;

        assert_eq!(message.correlation_id(), Some("corr-1"));
        assert_eq!(response.status, ValidationStatus::Error);
        assert!(response.message.contains("no encontrado"));
        assert_eq!(response.correlation_id, "corr-1");
        assert!(nothing_within(&mut h.forwards, Duration::from_secs(1)).await);
        assert_eq!(h.worker.stats().rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_contact_is_reported_with_both_partitions() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut h = Harness::start(&broker, seeded_registry().await, 5).await;

        let req = request("20453629").with_contacts(["12345678", "99999999"]);
        h.send(&req, "corr-2").await;
        let (_, response) = h.next_reply().await;

        assert_eq!(response.status, ValidationStatus::Error);
        assert_eq!(response.message, "DNIs de amigos no encontrados: 99999999");
        assert_eq!(
            response.valid_friends,
            Some(vec![MatchedContact {
                dni: "12345678".into(),
                name: "María López Díaz".into(),
            }])
        );
        assert_eq!(response.invalid_friends, Some(vec!["99999999".to_string()]));
        assert!(nothing_within(&mut h.forwards, Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn valid_request_is_forwarded_verbatim_without_reply() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut h = Harness::start(&broker, seeded_registry().await, 5).await;

        let req = request("20453629").with_contacts(["12345678"]);
        let body = req.to_json().unwrap();
        h.send_bytes(body.clone(), "corr-3").await;
        let forwarded = h.forwards.next().await.unwrap().message;

        assert_eq!(forwarded.body, body);
        assert_eq!(forwarded.routing_key, "save");
        assert_eq!(forwarded.correlation_id(), Some("corr-3"));
        assert_eq!(forwarded.reply_to(), Some(h.reply_queue.as_str()));
        assert!(forwarded.properties.persistent);
        assert!(nothing_within(&mut h.replies, Duration::from_secs(1)).await);
        assert_eq!(h.worker.stats().forwarded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_payload_gets_error_reply() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut h = Harness::start(&broker, seeded_registry().await, 5).await;

        h.send_bytes(b"{not json".to_vec(), "corr-4").await;
        let (_, response) = h.next_reply().await;

        assert_eq!(response.status, ValidationStatus::Error);
        assert_eq!(response.correlation_id, "corr-4");
    }

    #[tokio::test(start_paused = true)]
    async fn registry_outage_is_answered_not_dropped() {
        let broker = Arc::new(InMemoryBroker::new());
        let registry = seeded_registry().await;
        let mut h = Harness::start(&broker, Arc::clone(&registry) as Arc<dyn IdentityRegistry>, 5).await;
        registry.set_available(false);

        h.send(&request("20453629"), "corr-5").await;
        let (_, response) = h.next_reply().await;

        assert_eq!(response.status, ValidationStatus::Error);
        assert!(response.message.contains("unavailable"));
    }

    #[tokio::test(start_paused = true)]
    async fn prefetch_bounds_concurrent_validations() {
        let broker = Arc::new(InMemoryBroker::new());
        let slow = Arc::new(SlowRegistry {
            inner: seeded_registry().await,
            delay: Duration::from_millis(100),
        });
        let mut h = Harness::start(&broker, slow, 3).await;

        for i in 0..10 {
            h.send(&request("99999999"), &format!("corr-{i}")).await;
        }
        for _ in 0..10 {
            h.next_reply().await;
        }

        let stats = h.worker.stats();
        assert_eq!(stats.received, 10);
        assert_eq!(stats.peak_in_flight, 3);
        assert_eq!(broker.queue_depth("validate_dni"), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn worker_resumes_consuming_after_reconnect() {
        let broker = Arc::new(InMemoryBroker::new());
        let registry = seeded_registry().await;
        let worker = ValidationWorker::start(
            Arc::clone(&broker) as Arc<dyn MessageBus>,
            registry,
            ValidationWorkerConfig::default(),
        )
        .await
        .unwrap();

        broker.sever_all();
        let mut state = worker.service().connection().subscribe();
        tokio::time::timeout(
            Duration::from_secs(30),
            state.wait_for(|s| *s == LinkState::Backoff),
        )
        .await
        .unwrap()
        .unwrap();
        tokio::time::timeout(
            Duration::from_secs(30),
            state.wait_for(|s| *s == LinkState::Connected),
        )
        .await
        .unwrap()
        .unwrap();

        let channel = broker.connect().await.unwrap();
        let reply_queue = channel.declare_queue(QueueSpec::exclusive()).await.unwrap();
        let mut replies = channel
            .consume(&reply_queue, ConsumeOptions::auto_ack())
            .await
            .unwrap();
        let properties = MessageProperties::default()
            .with_correlation("after-reconnect")
            .with_reply_to(&reply_queue);
        channel
            .publish(
                "validation",
                "check",
                OutgoingMessage::new(request("99999999").to_json().unwrap(), properties),
            )
            .await
            .unwrap();

        let reply = replies.next().await.unwrap().message;
        assert_eq!(reply.correlation_id(), Some("after-reconnect"));
        assert!(worker.service().connection().generation() >= 2);
    }
}
