//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（ブローカー、レジストリ、永続化ステージ）への
//! インターフェースを提供し、実装の詳細を隠蔽します。

pub mod clock;
pub mod endpoint;
pub mod id_generator;
pub mod message_bus;
pub mod registry;
pub mod save_handler;

// 主要な trait を再エクスポート
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::endpoint::{BrokerEndpoint, RegistryEndpoint};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::message_bus::{
    BusChannel, ConsumeOptions, Consumer, DEFAULT_EXCHANGE, Delivery, DeliveryAck, MessageBus,
    QueueSpec, wait_closed,
};
pub use self::registry::{IdentityRegistry, RegistryConnector};
pub use self::save_handler::{SaveHandler, SaveReceipt};
