//! idcheck-core
//!
//! Request/reply over a message bus, and the multi-stage identity validation
//! saga built on it.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, envelope, request, outcome, identity, errors）
//! - **ports**: 抽象化レイヤー（MessageBus, IdentityRegistry, SaveHandler, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（接続管理, RPC クライアント, 検証ワーカー, 負荷ドライバ など）
//! - **impls**: 実装（InMemoryBroker, InMemoryRegistry など開発用）
//! - **config**: 設定（TOML + 環境変数）

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
