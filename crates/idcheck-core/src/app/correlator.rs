//! Correlator - 未解決リクエストの表
//!
//! correlation id -> (完了通知, 期限) を保持する。
//!
//! # 設計原則
//! - エントリを取り除いた者だけが結果を決める（first removal wins）
//!   - 応答到着: `complete`
//!   - 期限切れ: `PendingCall::wait` のタイムアウト、または `sweep_expired`
//!   - 送信失敗・呼び出し側の放棄: `cancel` / `PendingCall` の drop
//! - 期限を過ぎた後に届いた応答は `complete` が `false` を返して捨てられる
//! - 表の操作はすべて同じロックの下で行う（await を跨がない）

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::domain::DuplicateCorrelation;

struct Entry<V> {
    tx: oneshot::Sender<V>,
    deadline: Instant,
}

/// The waiter gave up: its deadline passed or its entry was swept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("call expired before a reply arrived")]
pub struct CallExpired;

pub struct Correlator<V> {
    pending: Mutex<HashMap<String, Entry<V>>>,
}

impl<V: Send + 'static> Correlator<V> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Record an outstanding call. Fails if `id` is already pending.
    pub fn register(
        self: &Arc<Self>,
        id: impl Into<String>,
        deadline: Instant,
    ) -> Result<PendingCall<V>, DuplicateCorrelation> {
        let id = id.into();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&id) {
                return Err(DuplicateCorrelation(id));
            }
            pending.insert(id.clone(), Entry { tx, deadline });
        }
        Ok(PendingCall {
            id,
            deadline,
            rx,
            table: Arc::clone(self),
        })
    }

    /// Hand `value` to the waiter of `id`.
    ///
    /// Returns `false` when nothing is pending under `id` (unknown, already
    /// completed, timed out, or cancelled).
    pub fn complete(&self, id: &str, value: V) -> bool {
        let Some(entry) = self.pending.lock().remove(id) else {
            return false;
        };
        // a receiver dropped in between cannot observe the value anyway
        let _ = entry.tx.send(value);
        true
    }

    /// Drop the entry for `id` without resolving it.
    pub fn cancel(&self, id: &str) -> bool {
        self.pending.lock().remove(id).is_some()
    }

    /// Remove every entry whose deadline is at or before `now`.
    /// Their waiters observe `CallExpired`.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, entry| entry.deadline > now);
        before - pending.len()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending.lock().contains_key(id)
    }
}

/// Caller side of one outstanding call.
///
/// Dropping it removes the entry, so a reply arriving afterwards is
/// discarded.
pub struct PendingCall<V: Send + 'static> {
    id: String,
    deadline: Instant,
    rx: oneshot::Receiver<V>,
    table: Arc<Correlator<V>>,
}

impl<V: Send + 'static> PendingCall<V> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the reply until the deadline.
    pub async fn wait(mut self) -> Result<V, CallExpired> {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(value)) => Ok(value),
            // sender dropped: the entry was swept
            Ok(Err(_)) => Err(CallExpired),
            Err(_) => {
                if self.table.cancel(&self.id) {
                    return Err(CallExpired);
                }
                // lost the race to `complete`: the value is already in the channel
                self.rx.try_recv().map_err(|_| CallExpired)
            }
        }
    }
}

impl<V: Send + 'static> Drop for PendingCall<V> {
    fn drop(&mut self) {
        self.table.cancel(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn in_secs(s: u64) -> Instant {
        Instant::now() + Duration::from_secs(s)
    }

    #[tokio::test(start_paused = true)]
    async fn reply_before_deadline_resolves_waiter() {
        let table = Correlator::<String>::new();
        let call = table.register("a", in_secs(60)).unwrap();

        assert!(table.complete("a", "ok".into()));
        assert_eq!(call.wait().await, Ok("ok".to_string()));
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_is_discarded_after_timeout() {
        let table = Correlator::<String>::new();
        let call = table.register("a", in_secs(1)).unwrap();

        assert_eq!(call.wait().await, Err(CallExpired));
        assert!(!table.complete("a", "late".into()));
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reply_already_taken_wins_over_deadline() {
        let table = Correlator::<u32>::new();
        let call = table.register("a", in_secs(1)).unwrap();
        assert!(table.complete("a", 7));

        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(call.wait().await, Ok(7));
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected_while_pending() {
        let table = Correlator::<u32>::new();
        let _first = table.register("a", in_secs(60)).unwrap();

        let err = table.register("a", in_secs(60)).err().unwrap();
        assert_eq!(err, DuplicateCorrelation("a".into()));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn id_can_be_reused_once_resolved() {
        let table = Correlator::<u32>::new();
        let first = table.register("a", in_secs(60)).unwrap();
        table.complete("a", 1);
        assert_eq!(first.wait().await, Ok(1));

        assert!(table.register("a", in_secs(60)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_expires_only_past_deadlines() {
        let table = Correlator::<u32>::new();
        let short = table.register("short", in_secs(1)).unwrap();
        let _long = table.register("long", in_secs(60)).unwrap();

        let removed = table.sweep_expired(Instant::now() + Duration::from_secs(2));

        assert_eq!(removed, 1);
        assert!(table.contains("long"));
        assert_eq!(short.wait().await, Err(CallExpired));
    }

    #[tokio::test]
    async fn dropping_the_waiter_removes_the_entry() {
        let table = Correlator::<u32>::new();
        let call = table.register("a", in_secs(60)).unwrap();
        drop(call);

        assert!(table.is_empty());
        assert!(!table.complete("a", 1));
    }

    #[tokio::test]
    async fn cancel_resolves_nothing() {
        let table = Correlator::<u32>::new();
        let call = table.register("a", in_secs(60)).unwrap();

        assert!(table.cancel("a"));
        assert!(!table.cancel("a"));
        assert_eq!(call.wait().await, Err(CallExpired));
    }

    #[tokio::test(start_paused = true)]
    async fn many_concurrent_calls_each_get_their_own_reply() {
        let table = Correlator::<usize>::new();
        let calls: Vec<_> = (0..100)
            .map(|i| table.register(format!("c{i}"), in_secs(60)).unwrap())
            .collect();

        // replies arrive in reverse order
        for i in (0..100).rev() {
            assert!(table.complete(&format!("c{i}"), i));
        }
        for (i, call) in calls.into_iter().enumerate() {
            assert_eq!(call.wait().await, Ok(i));
        }
    }
}
