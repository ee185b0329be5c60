//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports の実装を含めます。
//!
//! # 含まれる実装
//! - **InMemoryBroker**: AMQP 互換の配送基盤
//! - **InMemoryRegistry**: 身元レジストリ（+ connector）
//! - **InMemoryUserStore**: 永続化ステージの SaveHandler
//! - **InMemoryBackend**: 設定の接続先で上記を組み立てる

pub mod backend;
pub mod inmem_broker;
pub mod inmem_registry;
pub mod inmem_user_store;

pub use self::backend::InMemoryBackend;
pub use self::inmem_broker::InMemoryBroker;
pub use self::inmem_registry::{InMemoryRegistry, InMemoryRegistryConnector};
pub use self::inmem_user_store::InMemoryUserStore;
