//! PersistenceStage - `save` で転送されたリクエストを保存して応答する
//!
//! 保存そのものは `SaveHandler` に委ねる。このステージは配線だけを持つ:
//! decode → save → success/error 応答（correlation id を引き継ぐ）→ ack

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::app::retry::RetryPolicy;
use crate::app::service::{DeliveryHandler, QueueBinding, ServiceHandle, send_reply};
use crate::domain::{ConnectivityError, RegistrationRequest, ValidationResponse};
use crate::ports::{BusChannel, Clock, Delivery, MessageBus, SaveHandler};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceStageConfig {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub prefetch: u16,
    pub policy: RetryPolicy,
    pub reconnect_delay: Duration,
}

impl Default for PersistenceStageConfig {
    fn default() -> Self {
        Self {
            exchange: "validation".into(),
            queue: "save_user".into(),
            routing_key: "save".into(),
            prefetch: 5,
            policy: RetryPolicy::broker_default(),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

struct SaveStageHandler {
    saver: Arc<dyn SaveHandler>,
    clock: Arc<dyn Clock>,
}

impl SaveStageHandler {
    async fn respond(&self, body: &[u8]) -> ValidationResponse {
        let request = match RegistrationRequest::from_json(body) {
            Ok(request) => request,
            Err(e) => return ValidationResponse::error(format!("payload inválido: {e}"), ""),
        };

        match self.saver.save(&request).await {
            Ok(receipt) => {
                tracing::info!(dni = %request.dni, user_id = receipt.user_id, "user saved");
                let mut response = ValidationResponse::success(
                    format!("Usuario {} guardado correctamente", request.name),
                    "",
                );
                response.user_id = Some(receipt.user_id);
                response.linked_contacts = Some(receipt.linked_contacts);
                response
            }
            Err(message) => {
                tracing::warn!(dni = %request.dni, error = %message, "save rejected");
                ValidationResponse::error(message, "")
            }
        }
    }
}

#[async_trait]
impl DeliveryHandler for SaveStageHandler {
    async fn handle(&self, channel: Arc<dyn BusChannel>, delivery: Delivery) {
        let mut response = self.respond(&delivery.message.body).await;
        response.correlation_id = delivery
            .message
            .correlation_id()
            .unwrap_or_default()
            .to_string();
        response.timestamp = Some(self.clock.now().to_rfc3339());

        if let Err(e) = send_reply(&channel, &delivery.message, &response).await {
            tracing::error!(error = %e, "failed to publish reply");
        }
        if let Err(e) = delivery.ack().await {
            tracing::warn!(error = %e, "ack failed, delivery will be redelivered");
        }
    }
}

/// The running persistence stage.
pub struct PersistenceStage {
    service: ServiceHandle,
}

impl PersistenceStage {
    pub async fn start(
        bus: Arc<dyn MessageBus>,
        saver: Arc<dyn SaveHandler>,
        clock: Arc<dyn Clock>,
        config: PersistenceStageConfig,
    ) -> Result<Self, ConnectivityError> {
        let handler = Arc::new(SaveStageHandler { saver, clock });
        let binding = QueueBinding {
            exchange: config.exchange,
            queue: config.queue,
            routing_key: config.routing_key,
            prefetch: config.prefetch,
        };
        let service = ServiceHandle::start(
            "persistence-stage",
            bus,
            binding,
            handler,
            config.policy,
            config.reconnect_delay,
        )
        .await?;
        Ok(Self { service })
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
    use crate::domain::{MessageProperties, OutgoingMessage, ValidationStatus};
    use crate::impls::{InMemoryBroker, InMemoryUserStore};
    use crate::ports::{ConsumeOptions, Consumer, FixedClock, QueueSpec};
    use chrono::{TimeZone, Utc};

    async fn start(broker: &Arc<InMemoryBroker>) -> (Arc<dyn BusChannel>, String, Consumer) {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        PersistenceStage::start(
            Arc::clone(broker) as Arc<dyn MessageBus>,
            Arc::new(InMemoryUserStore::new()),
            Arc::new(clock),
            PersistenceStageConfig::default(),
        )
        .await
        .unwrap();

        let channel = broker.connect().await.unwrap();
        let reply_queue = channel.declare_queue(QueueSpec::exclusive()).await.unwrap();
        let replies = channel
            .consume(&reply_queue, ConsumeOptions::auto_ack())
            .await
            .unwrap();
        (channel, reply_queue, replies)
    }

    async fn forward(
        channel: &Arc<dyn BusChannel>,
        reply_queue: &str,
        request: &RegistrationRequest,
        correlation_id: &str,
    ) {
        let properties = MessageProperties::default()
            .with_correlation(correlation_id)
            .with_reply_to(reply_queue)
            .persistent();
        channel
            .publish(
                "validation",
                "save",
                OutgoingMessage::new(request.to_json().unwrap(), properties),
            )
            .await
            .unwrap();
    }

    async fn reply(replies: &mut Consumer) -> ValidationResponse {
        let message = replies.next().await.unwrap().message;
        ValidationResponse::from_json(&message.body).unwrap()
    }

    #[tokio::test]
    async fn saved_request_gets_success_with_user_id() {
        let broker = Arc::new(InMemoryBroker::new());
        let (channel, reply_queue, mut replies) = start(&broker).await;

        let req = RegistrationRequest::new("20453629", "Juan", "j@example.com", "pw", "987654321");
        forward(&channel, &reply_queue, &req, "corr-9").await;
        let response = reply(&mut replies).await;

        assert_eq!(response.status, ValidationStatus::Success);
        assert_eq!(response.message, "Usuario Juan guardado correctamente");
        assert_eq!(response.correlation_id, "corr-9");
        assert_eq!(response.user_id, Some(1));
        assert_eq!(response.linked_contacts, Some(vec![]));
        assert_eq!(response.timestamp.as_deref(), Some("2024-05-01T12:00:00+00:00"));
    }

    #[tokio::test]
    async fn duplicate_user_gets_error_reply() {
        let broker = Arc::new(InMemoryBroker::new());
        let (channel, reply_queue, mut replies) = start(&broker).await;
        let req = RegistrationRequest::new("20453629", "Juan", "j@example.com", "pw", "987654321");

        forward(&channel, &reply_queue, &req, "first").await;
        reply(&mut replies).await;
        forward(&channel, &reply_queue, &req, "second").await;
        let response = reply(&mut replies).await;

        assert_eq!(response.status, ValidationStatus::Error);
        assert_eq!(response.message, "Usuario con DNI 20453629 ya existe");
        assert_eq!(response.correlation_id, "second");
        assert!(response.timestamp.is_some());
    }

    #[tokio::test]
    async fn stage_declares_its_durable_queue() {
        let broker = Arc::new(InMemoryBroker::new());
        start(&broker).await;

        assert_eq!(broker.is_durable("save_user"), Some(true));
    }
}
