//! IdentityRegistry port - 身元レジストリ（SQL テーブル、または InMemory）
//!
//! レジストリのスキーマ管理は外部の責務。ここでは lookup と seed に必要な形だけを定義する。

use async_trait::async_trait;
use std::sync::Arc;

use crate::domain::{IdentityRecord, RegistryError};

/// Read-mostly store of identity records keyed by identity number.
///
/// # 設計原則
/// - `find_by_dni` は完全一致。0 行なら `Ok(None)`
/// - `insert` は一意キー違反を `RegistryError::DuplicateKey` で返す
#[async_trait]
pub trait IdentityRegistry: Send + Sync {
    async fn find_by_dni(&self, dni: &str) -> Result<Option<IdentityRecord>, RegistryError>;

    async fn insert(&self, record: IdentityRecord) -> Result<(), RegistryError>;
}

/// Opens registry connections; bring-up may fail and be retried.
#[async_trait]
pub trait RegistryConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn IdentityRegistry>, RegistryError>;
}
