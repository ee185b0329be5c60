//! InMemoryBroker - 開発用・テスト用のメッセージブローカー
//!
//! # 実装詳細
//! - direct exchange と default exchange（`""`）による配送
//! - consumer ごとの prefetch credit（Semaphore）
//! - exclusive queue は所有する接続と一緒に削除
//! - 未 ack の delivery は Drop 時に queue 先頭へ戻す（redelivered = true）
//! - 障害注入: 接続拒否、接続切断
//! - 接続先 (`BrokerEndpoint`) はログとエラーに出す

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, mpsc, watch};
use ulid::Ulid;

use crate::domain::{BusError, ConnectionId, Message, OutgoingMessage};
use crate::ports::{
    BrokerEndpoint, BusChannel, ConsumeOptions, Consumer, DEFAULT_EXCHANGE, Delivery, DeliveryAck,
    IdGenerator, MessageBus, QueueSpec, SystemClock, UlidGenerator, wait_closed,
};

const UNBOUNDED_BUFFER: usize = 256;

struct QueueState {
    messages: VecDeque<Message>,
    durable: bool,
    owner: Option<ConnectionId>,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new(durable: bool, owner: Option<ConnectionId>) -> Self {
        Self {
            messages: VecDeque::new(),
            durable,
            owner,
            notify: Arc::new(Notify::new()),
        }
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    queues: HashMap<String, QueueState>,
    /// (exchange, routing key) -> bound queues
    bindings: HashMap<(String, String), Vec<String>>,
    connections: HashMap<ConnectionId, watch::Sender<bool>>,
    refuse_next: u32,
    unreachable: bool,
    connect_attempts: u64,
}

impl BrokerState {
    /// Close a connection and drop the exclusive queues it owns.
    fn close_connection(&mut self, id: ConnectionId) -> bool {
        let Some(closed_tx) = self.connections.remove(&id) else {
            return false;
        };
        let _ = closed_tx.send(true);

        let owned: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            if let Some(queue) = self.queues.remove(&name) {
                queue.notify.notify_waiters();
            }
            for bound in self.bindings.values_mut() {
                bound.retain(|q| q != &name);
            }
        }
        true
    }

    fn check_access(&self, queue: &str, connection: ConnectionId) -> Result<(), BusError> {
        let q = self
            .queues
            .get(queue)
            .ok_or_else(|| BusError::UnknownQueue(queue.to_string()))?;
        match q.owner {
            Some(owner) if owner != connection => Err(BusError::ExclusiveQueue(queue.to_string())),
            _ => Ok(()),
        }
    }
}

/// InMemoryBroker は開発用のブローカー
///
/// # 使用例
/// ```ignore
/// let broker = Arc::new(InMemoryBroker::new());
/// let channel = broker.connect().await?;
/// channel.declare_exchange("validation").await?;
/// ```
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    ids: Arc<dyn IdGenerator>,
    endpoint: BrokerEndpoint,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::at(BrokerEndpoint::default())
    }

    /// A broker answering as `endpoint`: connections and failures report it.
    pub fn at(endpoint: BrokerEndpoint) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            ids: Arc::new(UlidGenerator::new(SystemClock)),
            endpoint,
        }
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_connections(&self, n: u32) {
        self.state.lock().refuse_next = n;
    }

    /// Refuse every connection attempt until switched back.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Drop one connection as if the network failed.
    pub fn sever(&self, id: ConnectionId) -> bool {
        self.state.lock().close_connection(id)
    }

    /// Drop every open connection.
    pub fn sever_all(&self) -> usize {
        let mut state = self.state.lock();
        let ids: Vec<ConnectionId> = state.connections.keys().copied().collect();
        ids.into_iter()
            .filter(|id| state.close_connection(*id))
            .count()
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn connect_attempts(&self) -> u64 {
        self.state.lock().connect_attempts
    }

    /// Ready (not yet delivered) messages in `queue`, `None` if it does not exist.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.state.lock().queues.get(queue).map(|q| q.messages.len())
    }

    pub fn is_durable(&self, queue: &str) -> Option<bool> {
        self.state.lock().queues.get(queue).map(|q| q.durable)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BusChannel>, BusError> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        if state.unreachable {
            return Err(BusError::ConnectionRefused(format!(
                "{} unreachable",
                self.endpoint.redacted()
            )));
        }
        if state.refuse_next > 0 {
            state.refuse_next -= 1;
            return Err(BusError::ConnectionRefused(format!(
                "{} refused the connection",
                self.endpoint.redacted()
            )));
        }

        let id = self.ids.connection_id();
        let (closed_tx, closed_rx) = watch::channel(false);
        state.connections.insert(id, closed_tx);
        tracing::debug!(connection = %id, endpoint = %self.endpoint.redacted(), "broker connection opened");

        Ok(Arc::new(InMemoryChannel {
            id,
            state: Arc::clone(&self.state),
            closed_rx,
        }))
    }
}

/// One connection (with its single channel) to an `InMemoryBroker`.
struct InMemoryChannel {
    id: ConnectionId,
    state: Arc<Mutex<BrokerState>>,
    closed_rx: watch::Receiver<bool>,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> Result<(), BusError> {
        if *self.closed_rx.borrow() {
            Err(BusError::ConnectionClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BusChannel for InMemoryChannel {
    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    fn is_open(&self) -> bool {
        !*self.closed_rx.borrow()
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    async fn declare_exchange(&self, name: &str) -> Result<(), BusError> {
        self.ensure_open()?;
        self.state.lock().exchanges.insert(name.to_string());
        Ok(())
    }

    async fn declare_queue(&self, spec: QueueSpec) -> Result<String, BusError> {
        self.ensure_open()?;
        let name = if spec.name.is_empty() {
            format!("amq.gen-{}", Ulid::new())
        } else {
            spec.name
        };

        let mut state = self.state.lock();
        if state.queues.contains_key(&name) {
            state.check_access(&name, self.id)?;
            return Ok(name);
        }
        let owner = spec.exclusive.then_some(self.id);
        state
            .queues
            .insert(name.clone(), QueueState::new(spec.durable, owner));
        Ok(name)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BusError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        if !state.exchanges.contains(exchange) {
            return Err(BusError::UnknownExchange(exchange.to_string()));
        }
        state.check_access(queue, self.id)?;

        let bound = state
            .bindings
            .entry((exchange.to_string(), routing_key.to_string()))
            .or_default();
        if !bound.iter().any(|q| q == queue) {
            bound.push(queue.to_string());
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<(), BusError> {
        self.ensure_open()?;
        let mut state = self.state.lock();

        let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
            if state.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            if !state.exchanges.contains(exchange) {
                return Err(BusError::UnknownExchange(exchange.to_string()));
            }
            state
                .bindings
                .get(&(exchange.to_string(), routing_key.to_string()))
                .cloned()
                .unwrap_or_default()
        };

        if targets.is_empty() {
            tracing::debug!(exchange, routing_key, "unroutable message dropped");
            return Ok(());
        }

        for target in targets {
            if let Some(queue) = state.queues.get_mut(&target) {
                queue.messages.push_back(Message {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    body: message.body.clone(),
                    properties: message.properties.clone(),
                    redelivered: false,
                });
                queue.notify.notify_waiters();
            }
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Consumer, BusError> {
        self.ensure_open()?;
        self.state.lock().check_access(queue, self.id)?;

        let bounded = options.prefetch > 0 && !options.auto_ack;
        let buffer = if bounded {
            usize::from(options.prefetch)
        } else {
            UNBOUNDED_BUFFER
        };
        let (tx, rx) = mpsc::channel(buffer);
        let credit = bounded.then(|| Arc::new(Semaphore::new(usize::from(options.prefetch))));

        tokio::spawn(dispatch_loop(DispatchContext {
            state: Arc::clone(&self.state),
            queue: queue.to_string(),
            connection: self.id,
            auto_ack: options.auto_ack,
            credit,
            closed: self.closed_rx.clone(),
            tx,
        }));

        Ok(Consumer::new(rx))
    }

    async fn close(&self) -> Result<(), BusError> {
        self.state.lock().close_connection(self.id);
        Ok(())
    }
}

struct DispatchContext {
    state: Arc<Mutex<BrokerState>>,
    queue: String,
    connection: ConnectionId,
    auto_ack: bool,
    credit: Option<Arc<Semaphore>>,
    closed: watch::Receiver<bool>,
    tx: mpsc::Sender<Delivery>,
}

/// Moves messages from one queue to one consumer until the connection or
/// the queue goes away, or the consumer is dropped.
async fn dispatch_loop(ctx: DispatchContext) {
    loop {
        // credit を先に取る: 未 ack が prefetch 件あればここで待つ
        let permit = match &ctx.credit {
            Some(credit) => tokio::select! {
                biased;
                _ = wait_closed(ctx.closed.clone()) => break,
                permit = Arc::clone(credit).acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                },
            },
            None => None,
        };

        // 切断済みの接続には新しい delivery を渡さない
        let message = tokio::select! {
            biased;
            _ = wait_closed(ctx.closed.clone()) => break,
            message = next_message(&ctx.state, &ctx.queue) => match message {
                Some(message) => message,
                None => break,
            },
        };

        let acker = InMemoryAck {
            state: Arc::clone(&ctx.state),
            queue: ctx.queue.clone(),
            connection: ctx.connection,
            pending: (!ctx.auto_ack).then(|| message.clone()),
            _permit: permit,
        };

        // A failed send drops the delivery, which requeues it.
        if ctx.tx.send(Delivery::new(message, Box::new(acker))).await.is_err() {
            break;
        }
    }
    tracing::debug!(queue = %ctx.queue, connection = %ctx.connection, "consumer stopped");
}

/// Pop the next message, waiting for a publish if the queue is empty.
/// Returns `None` once the queue has been deleted.
async fn next_message(state: &Mutex<BrokerState>, queue: &str) -> Option<Message> {
    loop {
        let notify = {
            let mut state = state.lock();
            let q = state.queues.get_mut(queue)?;
            if let Some(message) = q.messages.pop_front() {
                return Some(message);
            }
            Arc::clone(&q.notify)
        };

        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        // 登録後に再確認（lost wakeup を防ぐ）
        {
            let mut state = state.lock();
            let q = state.queues.get_mut(queue)?;
            if let Some(message) = q.messages.pop_front() {
                return Some(message);
            }
        }
        notified.await;
    }
}

/// Acknowledgement handle for one in-memory delivery.
struct InMemoryAck {
    state: Arc<Mutex<BrokerState>>,
    queue: String,
    connection: ConnectionId,
    /// Copy kept for requeue; `None` once acknowledged (or auto-acked).
    pending: Option<Message>,
    _permit: Option<OwnedSemaphorePermit>,
}

#[async_trait]
impl DeliveryAck for InMemoryAck {
    async fn ack(mut self: Box<Self>) -> Result<(), BusError> {
        if self.pending.is_none() {
            return Ok(());
        }
        let connection_alive = self.state.lock().connections.contains_key(&self.connection);
        if !connection_alive {
            // Drop が requeue する
            return Err(BusError::ConnectionClosed);
        }
        self.pending = None;
        Ok(())
    }
}

impl Drop for InMemoryAck {
    fn drop(&mut self) {
        let Some(mut message) = self.pending.take() else {
            return;
        };
        let mut state = self.state.lock();
        if let Some(queue) = state.queues.get_mut(&self.queue) {
            message.redelivered = true;
            queue.messages.push_front(message);
            queue.notify.notify_waiters();
        }
    }
}
