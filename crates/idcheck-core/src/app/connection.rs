//! ConnectionManager - ブローカー接続の確立・監視・再接続
//!
//! # 状態遷移
//! ```text
//! Idle -> Connecting -> Connected -> (loss) -> Backoff -> Connecting -> ...
//!                 \-> Idle (budget exhausted)
//! any -> Closed (close())
//! ```
//!
//! # 設計原則
//! - 接続の bring-up は `bring_up` ロックで直列化する（同時に 2 本張らない）
//! - 接続ごとに世代番号を振る。切断通知は現世代のものだけが再接続を起こす
//! - 再接続ループは同時に 1 本だけ
//! - 接続直後に `ChannelSetup` を走らせ、exchange/queue/consumer を張り直す

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::app::retry::RetryPolicy;
use crate::domain::{BusError, ConnectivityError};
use crate::ports::{BusChannel, MessageBus, wait_closed};

/// Connection lifecycle as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Connected,
    Backoff,
    Closed,
}

/// Per-connection topology setup, run on every fresh connection before it is
/// handed out.
#[async_trait]
pub trait ChannelSetup: Send + Sync {
    async fn on_connected(&self, channel: &Arc<dyn BusChannel>) -> Result<(), BusError>;
}

struct Inner {
    channel: Option<Arc<dyn BusChannel>>,
    generation: u64,
    reconnecting: bool,
    closed: bool,
}

pub struct ConnectionManager {
    name: String,
    bus: Arc<dyn MessageBus>,
    setup: Arc<dyn ChannelSetup>,
    policy: RetryPolicy,
    reconnect_delay: Duration,
    inner: Mutex<Inner>,
    bring_up: tokio::sync::Mutex<()>,
    state_tx: watch::Sender<LinkState>,
}

impl ConnectionManager {
    pub fn new(
        name: impl Into<String>,
        bus: Arc<dyn MessageBus>,
        setup: Arc<dyn ChannelSetup>,
        policy: RetryPolicy,
        reconnect_delay: Duration,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(LinkState::Idle);
        Arc::new(Self {
            name: name.into(),
            bus,
            setup,
            policy,
            reconnect_delay,
            inner: Mutex::new(Inner {
                channel: None,
                generation: 0,
                reconnecting: false,
                closed: false,
            }),
            bring_up: tokio::sync::Mutex::new(()),
            state_tx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    /// Number of connections established so far.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// The live channel, if any.
    pub fn current(&self) -> Option<Arc<dyn BusChannel>> {
        self.inner
            .lock()
            .channel
            .as_ref()
            .filter(|ch| ch.is_open())
            .cloned()
    }

    /// Return the live channel, or bring one up under the retry policy.
    pub async fn ensure_connected(self: &Arc<Self>) -> Result<Arc<dyn BusChannel>, ConnectivityError> {
        if let Some(channel) = self.current() {
            return Ok(channel);
        }
        self.check_open()?;

        let _guard = self.bring_up.lock().await;
        // someone else may have finished while we waited
        if let Some(channel) = self.current() {
            return Ok(channel);
        }
        self.check_open()?;

        self.set_state(LinkState::Connecting);
        let this: &Self = self;
        let result = self
            .policy
            .run(&self.name, move || async move {
                let channel = this.bus.connect().await?;
                if let Err(e) = this.setup.on_connected(&channel).await {
                    let _ = channel.close().await;
                    return Err(e);
                }
                Ok::<_, BusError>(channel)
            })
            .await;

        match result {
            Ok(channel) => self.install(channel).await,
            Err(e) => {
                let inner = self.inner.lock();
                if !inner.closed {
                    self.set_state(LinkState::Idle);
                }
                Err(e)
            }
        }
    }

    /// Stop reconnecting and close the live channel.
    pub async fn close(&self) {
        let channel = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            self.set_state(LinkState::Closed);
            inner.channel.take()
        };
        if let Some(channel) = channel {
            let _ = channel.close().await;
        }
        tracing::info!(manager = %self.name, "connection manager closed");
    }

    /// Publish a freshly set-up channel. A manager closed while the bring-up
    /// was running discards it instead.
    async fn install(
        self: &Arc<Self>,
        channel: Arc<dyn BusChannel>,
    ) -> Result<Arc<dyn BusChannel>, ConnectivityError> {
        let generation = {
            let mut inner = self.inner.lock();
            if inner.closed {
                None
            } else {
                inner.generation += 1;
                inner.channel = Some(Arc::clone(&channel));
                inner.reconnecting = false;
                self.set_state(LinkState::Connected);
                Some(inner.generation)
            }
        };
        let Some(generation) = generation else {
            tracing::info!(manager = %self.name, "closed during bring-up, dropping new connection");
            let _ = channel.close().await;
            return Err(ConnectivityError::Closed(self.name.clone()));
        };
        tracing::info!(
            manager = %self.name,
            connection = %channel.connection_id(),
            generation,
            "connected"
        );

        let closed = channel.closed();
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            wait_closed(closed).await;
            manager.handle_loss(generation);
        });

        Ok(channel)
    }

    /// React to the loss of connection `generation`. Stale or repeated
    /// notifications are ignored.
    fn handle_loss(self: &Arc<Self>, generation: u64) {
        {
            let mut inner = self.inner.lock();
            if inner.closed || inner.generation != generation || inner.reconnecting {
                return;
            }
            inner.channel = None;
            inner.reconnecting = true;
        }
        self.set_state(LinkState::Backoff);
        tracing::warn!(
            manager = %self.name,
            generation,
            "connection lost, reconnecting in {:?}",
            self.reconnect_delay
        );

        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.reconnect_loop().await });
    }

    async fn reconnect_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.reconnect_delay).await;
            match self.ensure_connected().await {
                // install() already cleared the reconnecting flag
                Ok(_) => return,
                Err(ConnectivityError::Closed(_)) => {
                    self.inner.lock().reconnecting = false;
                    return;
                }
                Err(e) => {
                    self.set_state(LinkState::Backoff);
                    tracing::warn!(manager = %self.name, error = %e, "reconnect failed");
                }
            }
        }
    }

    fn check_open(&self) -> Result<(), ConnectivityError> {
        if self.inner.lock().closed {
            return Err(ConnectivityError::Closed(self.name.clone()));
        }
        Ok(())
    }

    fn set_state(&self, state: LinkState) {
        self.state_tx.send_replace(state);
    }
}
