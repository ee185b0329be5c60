//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **RetryPolicy**: 段階的バックオフつきの bring-up
//! - **ConnectionManager**: 接続の確立・監視・再接続
//! - **Correlator**: correlation id -> 待機中の呼び出し
//! - **RpcClient**: リクエスト/リプライ
//! - **ValidationWorker**: 検証ステージ
//! - **PersistenceStage**: 永続化ステージの配線
//! - **Bootstrap**: レジストリ投入と起動のやり直し
//! - **LoadDriver**: 並行数上限つきの負荷ドライバ
//! - **RequestGenerator**: ランダムな登録リクエスト

pub mod bootstrap;
pub mod connection;
pub mod correlator;
pub mod generator;
pub mod load_driver;
pub mod persistence_stage;
pub mod retry;
pub mod rpc_client;
pub mod service;
pub mod validation_worker;

// 主要な型を再エクスポート
pub use self::bootstrap::{ValidationBootstrap, connect_registry, retry_forever, seed_registry};
pub use self::connection::{ChannelSetup, ConnectionManager, LinkState};
pub use self::correlator::{CallExpired, Correlator, PendingCall};
pub use self::generator::RequestGenerator;
pub use self::load_driver::{LoadDriver, LoadDriverConfig, LoadProgress, LoadReport, RequestSender};
pub use self::persistence_stage::{PersistenceStage, PersistenceStageConfig};
pub use self::retry::RetryPolicy;
pub use self::rpc_client::{RpcClient, RpcClientConfig};
pub use self::service::{DeliveryHandler, QueueBinding, ServiceHandle};
pub use self::validation_worker::{
    ValidationWorker, ValidationWorkerConfig, Validator, Verdict, WorkerStatsSnapshot,
};
