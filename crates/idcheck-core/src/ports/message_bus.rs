//! MessageBus port - 配送基盤（AMQP 互換ブローカー、または InMemory）
//!
//! # 設計原則
//! - 1 接続 = 1 チャネル（`BusChannel`）。接続が切れたら作り直す
//! - exchange + routing key で配送。`""` は default exchange（routing key = queue 名）
//! - exclusive queue は所有する接続と一緒に消える
//! - 未 ack の delivery は接続断で requeue される

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::domain::{BusError, ConnectionId, Message, OutgoingMessage};

/// Name of the default exchange: routes straight to the queue named by the
/// routing key.
pub const DEFAULT_EXCHANGE: &str = "";

/// Queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Empty name asks the broker to generate one.
    pub name: String,
    pub durable: bool,
    /// Owned by the declaring connection and deleted with it.
    pub exclusive: bool,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
        }
    }

    /// Private, non-durable, broker-named queue torn down with the connection.
    pub fn exclusive() -> Self {
        Self {
            name: String::new(),
            durable: false,
            exclusive: true,
        }
    }
}

/// How a consumer receives deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Maximum unacknowledged deliveries held at once. `0` means unbounded.
    pub prefetch: u16,
    /// Deliveries count as acknowledged the moment they are handed out.
    pub auto_ack: bool,
}

impl ConsumeOptions {
    pub fn manual_ack(prefetch: u16) -> Self {
        Self {
            prefetch,
            auto_ack: false,
        }
    }

    pub fn auto_ack() -> Self {
        Self {
            prefetch: 0,
            auto_ack: true,
        }
    }
}

/// Acknowledgement handle of one delivery.
///
/// Dropping it without calling `ack` leaves the message unacknowledged; the
/// broker decides what happens to it (the in-memory broker requeues it).
#[async_trait]
pub trait DeliveryAck: Send {
    async fn ack(self: Box<Self>) -> Result<(), BusError>;
}

/// A message handed to a consumer, plus its acknowledgement handle.
pub struct Delivery {
    pub message: Message,
    acker: Box<dyn DeliveryAck>,
}

impl Delivery {
    pub fn new(message: Message, acker: Box<dyn DeliveryAck>) -> Self {
        Self { message, acker }
    }

    /// Acknowledge and release the consumer credit this delivery holds.
    pub async fn ack(self) -> Result<(), BusError> {
        self.acker.ack().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries for one consumer. Ends when the connection closes.
pub struct Consumer {
    rx: mpsc::Receiver<Delivery>,
}

impl Consumer {
    pub fn new(rx: mpsc::Receiver<Delivery>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

/// An open connection with a single channel on it.
#[async_trait]
pub trait BusChannel: Send + Sync {
    fn connection_id(&self) -> ConnectionId;

    /// Still usable?
    fn is_open(&self) -> bool;

    /// Flips to `true` once the connection is gone (error, close, or sever).
    fn closed(&self) -> watch::Receiver<bool>;

    /// Declare a direct exchange (idempotent).
    async fn declare_exchange(&self, name: &str) -> Result<(), BusError>;

    /// Declare a queue (idempotent) and return its name.
    async fn declare_queue(&self, spec: QueueSpec) -> Result<String, BusError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BusError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<(), BusError>;

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Consumer, BusError>;

    async fn close(&self) -> Result<(), BusError>;
}

/// Entry point: opens connections to a broker.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BusChannel>, BusError>;
}

/// Resolve when `closed` reports the connection is gone.
pub async fn wait_closed(mut closed: watch::Receiver<bool>) {
    // A dropped sender means the connection object itself is gone.
    let _ = closed.wait_for(|is_closed| *is_closed).await;
}
