//! InMemoryRegistry - 開発用の身元レジストリ
//!
//! # 実装詳細
//! - HashMap<dni, IdentityRecord> を tokio Mutex で保護
//! - 一意キー違反は DuplicateKey
//! - 障害注入: `set_available(false)` で全操作が Unavailable になる

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::sync::Mutex;

use crate::domain::{IdentityRecord, RegistryError};
use crate::ports::{IdentityRegistry, RegistryConnector, RegistryEndpoint};

pub struct InMemoryRegistry {
    records: Mutex<HashMap<String, IdentityRecord>>,
    available: AtomicBool,
    lookups: AtomicU64,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            lookups: AtomicU64::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Number of `find_by_dni` calls served.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    fn ensure_available(&self) -> Result<(), RegistryError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RegistryError::Unavailable("registry offline".into()))
        }
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityRegistry for InMemoryRegistry {
    async fn find_by_dni(&self, dni: &str) -> Result<Option<IdentityRecord>, RegistryError> {
        self.ensure_available()?;
        self.lookups.fetch_add(1, Ordering::Relaxed);
        Ok(self.records.lock().await.get(dni).cloned())
    }

    async fn insert(&self, record: IdentityRecord) -> Result<(), RegistryError> {
        self.ensure_available()?;
        let mut records = self.records.lock().await;
        if records.contains_key(&record.dni) {
            return Err(RegistryError::DuplicateKey(record.dni));
        }
        records.insert(record.dni.clone(), record);
        Ok(())
    }
}

/// Hands out the same shared registry, optionally failing the first attempts.
pub struct InMemoryRegistryConnector {
    registry: Arc<InMemoryRegistry>,
    endpoint: RegistryEndpoint,
    refuse_next: AtomicU32,
}

impl InMemoryRegistryConnector {
    pub fn new(registry: Arc<InMemoryRegistry>) -> Self {
        Self::at(registry, RegistryEndpoint::default())
    }

    /// Serve `registry` as if it lived at `endpoint`.
    pub fn at(registry: Arc<InMemoryRegistry>, endpoint: RegistryEndpoint) -> Self {
        Self {
            registry,
            endpoint,
            refuse_next: AtomicU32::new(0),
        }
    }

    pub fn endpoint(&self) -> &RegistryEndpoint {
        &self.endpoint
    }

    pub fn refuse_connections(&self, n: u32) {
        self.refuse_next.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl RegistryConnector for InMemoryRegistryConnector {
    async fn connect(&self) -> Result<Arc<dyn IdentityRegistry>, RegistryError> {
        let refused = self
            .refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(RegistryError::Unavailable(format!(
                "{} refused the connection",
                self.endpoint.redacted()
            )));
        }
        self.registry
            .ensure_available()
            .map_err(|e| RegistryError::Unavailable(format!("{}: {e}", self.endpoint.redacted())))?;
        tracing::debug!(endpoint = %self.endpoint.redacted(), "registry connected");
        Ok(Arc::clone(&self.registry) as Arc<dyn IdentityRegistry>)
    }
}
