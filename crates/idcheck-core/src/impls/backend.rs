//! InMemoryBackend - 設定の接続先で in-memory 実装一式を組み立てる
//!
//! CLI はここからバス・レジストリ・SaveHandler を受け取る。
//! 本番用アダプタを足すときは同じ形の組み立てを別に用意する。

use std::sync::Arc;

use crate::config::AppConfig;
use crate::impls::{InMemoryBroker, InMemoryRegistry, InMemoryRegistryConnector, InMemoryUserStore};
use crate::ports::{
    BrokerEndpoint, MessageBus, RegistryConnector, RegistryEndpoint, SaveHandler,
};

pub struct InMemoryBackend {
    pub broker: Arc<InMemoryBroker>,
    pub registry: Arc<InMemoryRegistry>,
    pub connector: Arc<InMemoryRegistryConnector>,
    pub users: Arc<InMemoryUserStore>,
}

impl InMemoryBackend {
    pub fn new(broker: BrokerEndpoint, registry: RegistryEndpoint) -> Self {
        let store = Arc::new(InMemoryRegistry::new());
        Self {
            broker: Arc::new(InMemoryBroker::at(broker)),
            connector: Arc::new(InMemoryRegistryConnector::at(Arc::clone(&store), registry)),
            registry: store,
            users: Arc::new(InMemoryUserStore::new()),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let backend = Self::new(config.broker.endpoint(), config.registry.endpoint());
        tracing::info!(
            broker = %backend.broker.endpoint().redacted(),
            registry = %backend.connector.endpoint().redacted(),
            "in-memory backend ready"
        );
        backend
    }

    pub fn bus(&self) -> Arc<dyn MessageBus> {
        Arc::clone(&self.broker) as Arc<dyn MessageBus>
    }

    pub fn registry_connector(&self) -> Arc<dyn RegistryConnector> {
        Arc::clone(&self.connector) as Arc<dyn RegistryConnector>
    }

    pub fn save_handler(&self) -> Arc<dyn SaveHandler> {
        Arc::clone(&self.users) as Arc<dyn SaveHandler>
    }
}
