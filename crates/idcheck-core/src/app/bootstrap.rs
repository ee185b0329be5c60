//! Bootstrap - 検証ステージの起動手順
//!
//! 1. レジストリへ接続（段階的バックオフ）
//! 2. 参照用の身元データを投入（既存キーは無視、何度走らせても同じ結果）
//! 3. ブローカーへ接続してトポロジを宣言し、購読を始める
//!
//! どこかで予算を使い切ったら、一定間隔で手順全体をやり直す。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::app::retry::RetryPolicy;
use crate::app::validation_worker::{ValidationWorker, ValidationWorkerConfig};
use crate::domain::{ConnectivityError, RegistryError, reference_identities};
use crate::ports::{IdentityRegistry, MessageBus, RegistryConnector};

/// Connect to the registry under `policy`.
pub async fn connect_registry(
    connector: &dyn RegistryConnector,
    policy: &RetryPolicy,
) -> Result<Arc<dyn IdentityRegistry>, ConnectivityError> {
    policy.run("registry", move || connector.connect()).await
}

/// Insert the reference identities, skipping those already present.
/// Returns how many were newly inserted.
pub async fn seed_registry(registry: &dyn IdentityRegistry) -> Result<usize, RegistryError> {
    let mut inserted = 0;
    for record in reference_identities() {
        match registry.insert(record).await {
            Ok(()) => inserted += 1,
            Err(RegistryError::DuplicateKey(_)) => {}
            Err(e) => return Err(e),
        }
    }
    tracing::info!(inserted, "registry seeded");
    Ok(inserted)
}

/// Everything the validation stage needs to come up.
pub struct ValidationBootstrap {
    pub bus: Arc<dyn MessageBus>,
    pub registry: Arc<dyn RegistryConnector>,
    pub registry_policy: RetryPolicy,
    pub worker: ValidationWorkerConfig,
}

impl ValidationBootstrap {
    /// One pass of the bring-up sequence.
    pub async fn bring_up(&self) -> Result<ValidationWorker, ConnectivityError> {
        let registry = connect_registry(self.registry.as_ref(), &self.registry_policy).await?;
        seed_registry(registry.as_ref())
            .await
            .map_err(|e| ConnectivityError::Exhausted {
                target: "registry seed".into(),
                attempts: 1,
                last_error: e.to_string(),
            })?;
        ValidationWorker::start(Arc::clone(&self.bus), registry, self.worker.clone()).await
    }

    /// Repeat [`bring_up`](Self::bring_up) every `delay` until it succeeds or
    /// `shutdown` flips to `true`.
    pub async fn run(
        &self,
        delay: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Option<ValidationWorker> {
        retry_forever("validation-stage", delay, shutdown, move || self.bring_up()).await
    }
}

/// Run `bring_up` until it succeeds, waiting `delay` between full attempts.
/// Returns `None` if `shutdown` fires first.
pub async fn retry_forever<T, F, Fut>(
    label: &str,
    delay: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut bring_up: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ConnectivityError>>,
{
    let mut round: u64 = 0;
    loop {
        if *shutdown.borrow() {
            return None;
        }
        round += 1;
        match bring_up().await {
            Ok(value) => {
                tracing::info!(label, round, "bring-up complete");
                return Some(value);
            }
            Err(e) => {
                tracing::error!(label, round, error = %e, "bring-up failed, starting over in {delay:?}");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown.changed() => {
                // sender gone counts as shutdown
                if changed.is_err() || *shutdown.borrow() {
                    return None;
                }
            }
        }
    }
}
