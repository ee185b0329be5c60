//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use crate::domain::ids::{ConnectionId, CorrelationId};
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator は分散システムで使える ID を生成
///
/// Correlation ids must be unique across every client process talking to the
/// same broker, which is why they are ULIDs and not counters.
pub trait IdGenerator: Send + Sync {
    fn correlation_id(&self) -> CorrelationId;

    fn connection_id(&self) -> ConnectionId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// Clock を使って現在時刻ベースの ULID を生成します。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn correlation_id(&self) -> CorrelationId {
        CorrelationId::from(self.next_ulid())
    }

    fn connection_id(&self) -> ConnectionId {
        ConnectionId::from(self.next_ulid())
    }
}
