//! SaveHandler port - 永続化ステージ（外部コラボレーター）の契約
//!
//! 検証済みの登録リクエストを受け取り、保存結果を返す。
//! 実装（SQL トランザクションなど）はこのクレートの外に置く。

use async_trait::async_trait;

use crate::domain::RegistrationRequest;

/// What the persistence stage reports for a stored request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveReceipt {
    pub user_id: u64,
    /// Contacts actually linked to the new user, in request order.
    pub linked_contacts: Vec<String>,
}

#[async_trait]
pub trait SaveHandler: Send + Sync {
    /// Persist `request`. The error string is sent to the caller verbatim.
    async fn save(&self, request: &RegistrationRequest) -> Result<SaveReceipt, String>;
}
