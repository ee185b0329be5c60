//! RpcClient - メッセージバス越しのリクエスト/リプライ
//!
//! # フロー
//! 1. 接続ごとに exclusive な応答キューを宣言し、auto-ack で購読する
//! 2. `call` は correlation id を採番して Correlator に登録し、
//!    `reply_to` = 応答キュー で `check` に persistent publish する
//! 3. 応答は correlation id で Correlator に渡す。未知の id は捨てる
//! 4. 期限までに応答が無ければ `RpcError::Timeout`
//!
//! 未接続なら `call` の中で 1 回だけ bring-up を試みる。
//! 期限切れエントリは周期的な sweep でも回収する。

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::app::connection::{ChannelSetup, ConnectionManager};
use crate::app::correlator::Correlator;
use crate::app::load_driver::RequestSender;
use crate::app::retry::RetryPolicy;
use crate::domain::{
    BusError, ConnectivityError, MessageProperties, OutgoingMessage, RegistrationRequest, RpcError,
    ValidationResponse,
};
use crate::ports::{BusChannel, ConsumeOptions, Consumer, IdGenerator, MessageBus, QueueSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcClientConfig {
    pub exchange: String,
    pub routing_key: String,
    pub timeout: Duration,
    pub sweep_interval: Duration,
    pub policy: RetryPolicy,
    pub reconnect_delay: Duration,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            exchange: "validation".into(),
            routing_key: "check".into(),
            timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(1),
            policy: RetryPolicy::client_default(),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

type ReplyTable = Correlator<Vec<u8>>;

/// Declares the reply queue on every fresh connection and feeds replies into
/// the correlation table.
struct ReplyListener {
    exchange: String,
    table: Arc<ReplyTable>,
    reply_queue: RwLock<Option<String>>,
}

impl ReplyListener {
    fn reply_queue(&self) -> Option<String> {
        self.reply_queue.read().clone()
    }
}

#[async_trait]
impl ChannelSetup for ReplyListener {
    async fn on_connected(&self, channel: &Arc<dyn BusChannel>) -> Result<(), BusError> {
        channel.declare_exchange(&self.exchange).await?;
        let queue = channel.declare_queue(QueueSpec::exclusive()).await?;
        let consumer = channel.consume(&queue, ConsumeOptions::auto_ack()).await?;
        tracing::debug!(reply_queue = %queue, "reply queue ready");

        *self.reply_queue.write() = Some(queue);
        tokio::spawn(reply_loop(consumer, Arc::clone(&self.table)));
        Ok(())
    }
}

async fn reply_loop(mut consumer: Consumer, table: Arc<ReplyTable>) {
    while let Some(delivery) = consumer.next().await {
        let message = delivery.message;
        let Some(id) = message.correlation_id().map(str::to_string) else {
            tracing::debug!("reply without correlation id dropped");
            continue;
        };
        if !table.complete(&id, message.body) {
            tracing::debug!(correlation_id = %id, "stale reply dropped");
        }
    }
    tracing::debug!("reply consumer ended");
}

/// Client side of the validation RPC.
///
/// Must be created inside a tokio runtime: it spawns the sweeper task.
pub struct RpcClient {
    config: RpcClientConfig,
    manager: Arc<ConnectionManager>,
    listener: Arc<ReplyListener>,
    ids: Arc<dyn IdGenerator>,
}

impl RpcClient {
    pub fn new(bus: Arc<dyn MessageBus>, ids: Arc<dyn IdGenerator>, config: RpcClientConfig) -> Self {
        let table = Correlator::new();
        let listener = Arc::new(ReplyListener {
            exchange: config.exchange.clone(),
            table: Arc::clone(&table),
            reply_queue: RwLock::new(None),
        });
        let manager = ConnectionManager::new(
            "rpc-client",
            bus,
            Arc::clone(&listener) as Arc<dyn ChannelSetup>,
            config.policy.clone(),
            config.reconnect_delay,
        );
        spawn_sweeper(Arc::downgrade(&table), config.sweep_interval);

        Self {
            config,
            manager,
            listener,
            ids,
        }
    }

    /// Bring the connection up under the client retry budget.
    pub async fn connect(&self) -> Result<(), ConnectivityError> {
        self.manager.ensure_connected().await.map(|_| ())
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Calls waiting for a reply.
    pub fn pending(&self) -> usize {
        self.listener.table.len()
    }

    /// Send a registration request and wait for its terminal response.
    pub async fn call(&self, request: &RegistrationRequest) -> Result<ValidationResponse, RpcError> {
        let body = request.to_json()?;
        let reply = self.call_raw(body).await?;
        let response = ValidationResponse::from_json(&reply)?;
        // `validating` means "forwarded"; it must never reach the caller
        if !response.status.is_terminal() {
            return Err(RpcError::Protocol(format!(
                "non-terminal status {:?} in reply {}",
                response.status, response.correlation_id
            )));
        }
        Ok(response)
    }

    /// Publish `body` and wait for the raw reply bytes.
    pub async fn call_raw(&self, body: Vec<u8>) -> Result<Vec<u8>, RpcError> {
        let channel = match self.manager.current() {
            Some(channel) => channel,
            None => {
                tracing::warn!("not connected, attempting bring-up before send");
                self.manager.ensure_connected().await?
            }
        };
        let reply_to = self
            .listener
            .reply_queue()
            .ok_or(RpcError::Bus(BusError::ConnectionClosed))?;

        let correlation_id = self.ids.correlation_id().to_string();
        let deadline = Instant::now() + self.config.timeout;
        let pending = self.listener.table.register(correlation_id.clone(), deadline)?;

        let properties = MessageProperties::default()
            .with_correlation(correlation_id.clone())
            .with_reply_to(reply_to)
            .persistent();
        // on failure `pending` is dropped and its entry goes with it
        channel
            .publish(
                &self.config.exchange,
                &self.config.routing_key,
                OutgoingMessage::new(body, properties),
            )
            .await?;
        tracing::debug!(correlation_id = %correlation_id, "request published");

        pending.wait().await.map_err(|_| {
            tracing::warn!(correlation_id = %correlation_id, "request timed out");
            RpcError::Timeout {
                correlation_id,
                after: self.config.timeout,
            }
        })
    }

    pub async fn close(&self) {
        self.manager.close().await;
    }
}

#[async_trait]
impl RequestSender for RpcClient {
    async fn send(&self, request: RegistrationRequest) -> Result<ValidationResponse, RpcError> {
        self.call(&request).await
    }
}

/// Periodically expire stale entries. Stops once the table is gone.
fn spawn_sweeper(table: Weak<ReplyTable>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(table) = table.upgrade() else {
                break;
            };
            let expired = table.sweep_expired(Instant::now());
            if expired > 0 {
                tracing::debug!(expired, "swept expired calls");
            }
        }
    });
}
