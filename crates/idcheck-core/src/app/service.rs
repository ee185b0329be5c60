//! QueueService - durable キューを購読するサービスの共通配線
//!
//! 検証ワーカーと永続化ステージは同じ形をしている:
//! exchange 宣言 → durable queue 宣言 → routing key で bind → prefetch 付きで購読 →
//! delivery ごとにタスクを spawn してハンドラへ渡す。
//!
//! ハンドラは自分で ack する。ack 前に接続が切れた delivery はブローカーが再配送する。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::app::connection::{ChannelSetup, ConnectionManager, LinkState};
use crate::app::retry::RetryPolicy;
use crate::domain::{
    BusError, ConnectivityError, Message, MessageProperties, OutgoingMessage, ValidationResponse,
};
use crate::ports::{
    BusChannel, ConsumeOptions, Consumer, DEFAULT_EXCHANGE, Delivery, MessageBus, QueueSpec,
};

/// Where a service consumes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub prefetch: u16,
}

/// Processes one delivery. Responsible for acknowledging it.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn handle(&self, channel: Arc<dyn BusChannel>, delivery: Delivery);
}

struct ConsumerSetup<H> {
    binding: QueueBinding,
    handler: Arc<H>,
}

#[async_trait]
impl<H: DeliveryHandler> ChannelSetup for ConsumerSetup<H> {
    async fn on_connected(&self, channel: &Arc<dyn BusChannel>) -> Result<(), BusError> {
        let b = &self.binding;
        channel.declare_exchange(&b.exchange).await?;
        let queue = channel.declare_queue(QueueSpec::durable(&b.queue)).await?;
        channel.bind_queue(&queue, &b.exchange, &b.routing_key).await?;
        let consumer = channel
            .consume(&queue, ConsumeOptions::manual_ack(b.prefetch))
            .await?;
        tracing::info!(queue = %queue, routing_key = %b.routing_key, prefetch = b.prefetch, "consuming");

        tokio::spawn(consume_loop(
            consumer,
            Arc::clone(channel),
            Arc::clone(&self.handler),
        ));
        Ok(())
    }
}

async fn consume_loop<H: DeliveryHandler>(
    mut consumer: Consumer,
    channel: Arc<dyn BusChannel>,
    handler: Arc<H>,
) {
    while let Some(delivery) = consumer.next().await {
        let channel = Arc::clone(&channel);
        let handler = Arc::clone(&handler);
        tokio::spawn(async move { handler.handle(channel, delivery).await });
    }
    tracing::debug!("consumer ended");
}

/// A running queue-consuming service.
pub struct ServiceHandle {
    manager: Arc<ConnectionManager>,
}

impl ServiceHandle {
    /// Bring the service up: connect under `policy`, then keep reconnecting
    /// every `reconnect_delay` after a loss.
    pub async fn start<H: DeliveryHandler>(
        name: &str,
        bus: Arc<dyn MessageBus>,
        binding: QueueBinding,
        handler: Arc<H>,
        policy: RetryPolicy,
        reconnect_delay: Duration,
    ) -> Result<Self, ConnectivityError> {
        let setup = Arc::new(ConsumerSetup { binding, handler });
        let manager = ConnectionManager::new(name, bus, setup, policy, reconnect_delay);
        manager.ensure_connected().await?;
        Ok(Self { manager })
    }

    pub fn state(&self) -> LinkState {
        self.manager.state()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub async fn shutdown(&self) {
        self.manager.close().await;
    }
}

/// Publish `response` to the reply queue named by `request`, echoing its
/// correlation id. Requests without a reply queue get no reply.
pub async fn send_reply(
    channel: &Arc<dyn BusChannel>,
    request: &Message,
    response: &ValidationResponse,
) -> Result<(), BusError> {
    let Some(reply_to) = request.reply_to() else {
        tracing::warn!(correlation_id = ?request.correlation_id(), "request has no reply queue");
        return Ok(());
    };
    let body = response
        .to_json()
        .map_err(|e| BusError::Encode(e.to_string()))?;
    let properties = MessageProperties {
        correlation_id: request.properties.correlation_id.clone(),
        ..MessageProperties::default()
    };
    channel
        .publish(DEFAULT_EXCHANGE, reply_to, OutgoingMessage::new(body, properties))
        .await
}
