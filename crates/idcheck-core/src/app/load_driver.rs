//! LoadDriver - 並行数の上限つきで N 件のリクエストを投げる負荷ドライバ
//!
//! # 流れ
//! - 同時に未完了のリクエストが上限 C 以上なら、一定間隔でポーリングして待つ
//! - 空きができたら 1 件発行する。ちょうど N 件発行して全件の決着を待つ
//! - 成功 = `status == success` の応答。それ以外の応答・エラー・タイムアウトは失敗

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::domain::{RegistrationRequest, RpcError, ValidationResponse};

/// Anything that can carry one request to a terminal response.
#[async_trait]
pub trait RequestSender: Send + Sync {
    async fn send(&self, request: RegistrationRequest) -> Result<ValidationResponse, RpcError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadDriverConfig {
    /// Maximum outstanding requests.
    pub ceiling: usize,
    /// How often a blocked issuer re-checks the gate.
    pub poll_interval: Duration,
}

impl Default for LoadDriverConfig {
    fn default() -> Self {
        Self {
            ceiling: 50,
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Running counts, published after every settled request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadProgress {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl LoadProgress {
    pub fn settled(&self) -> usize {
        self.succeeded + self.failed
    }

    pub fn percent(&self) -> usize {
        if self.total == 0 {
            100
        } else {
            self.settled() * 100 / self.total
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadReport {
    pub issued: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed: Duration,
    pub min_latency: Option<Duration>,
    pub mean_latency: Option<Duration>,
    pub max_latency: Option<Duration>,
    /// Highest number of requests outstanding at once.
    pub peak_outstanding: usize,
}

impl LoadReport {
    /// Successes per second.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.succeeded as f64 / secs
        }
    }

    /// Wall time divided by successes, or by attempts when nothing succeeded.
    pub fn time_per_request(&self) -> Duration {
        let divisor = if self.succeeded > 0 {
            self.succeeded
        } else {
            self.issued.max(1)
        };
        self.elapsed / u32::try_from(divisor).unwrap_or(u32::MAX)
    }
}

#[derive(Default)]
struct Tally {
    succeeded: usize,
    failed: usize,
    latencies: Vec<Duration>,
}

pub struct LoadDriver {
    sender: Arc<dyn RequestSender>,
    config: LoadDriverConfig,
    progress_tx: watch::Sender<LoadProgress>,
}

impl LoadDriver {
    pub fn new(sender: Arc<dyn RequestSender>, config: LoadDriverConfig) -> Self {
        let (progress_tx, _) = watch::channel(LoadProgress::default());
        Self {
            sender,
            config,
            progress_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LoadProgress> {
        self.progress_tx.subscribe()
    }

    /// Issue exactly `total` requests built by `make_request` and wait for all
    /// of them to settle.
    pub async fn run<F>(&self, total: usize, mut make_request: F) -> LoadReport
    where
        F: FnMut(usize) -> RegistrationRequest,
    {
        let ceiling = self.config.ceiling.max(1);
        let outstanding = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let tally = Arc::new(Mutex::new(Tally::default()));
        self.progress_tx.send_replace(LoadProgress {
            total,
            ..LoadProgress::default()
        });
        tracing::info!(total, ceiling, "load run started");

        let started = Instant::now();
        let mut tasks = JoinSet::new();
        let mut issued = 0;

        for i in 0..total {
            while outstanding.load(Ordering::SeqCst) >= ceiling {
                tokio::time::sleep(self.config.poll_interval).await;
            }
            let slot = Slot::take(&outstanding);
            peak.fetch_max(slot.held, Ordering::SeqCst);
            issued += 1;

            let request = make_request(i);
            let sender = Arc::clone(&self.sender);
            let tally = Arc::clone(&tally);
            let progress_tx = self.progress_tx.clone();
            tasks.spawn(async move {
                let sent_at = Instant::now();
                let ok = matches!(sender.send(request).await, Ok(ref r) if r.is_success());
                let latency = sent_at.elapsed();

                let snapshot = {
                    let mut t = tally.lock();
                    if ok {
                        t.succeeded += 1;
                    } else {
                        t.failed += 1;
                    }
                    t.latencies.push(latency);
                    LoadProgress {
                        total,
                        succeeded: t.succeeded,
                        failed: t.failed,
                    }
                };
                drop(slot);
                progress_tx.send_replace(snapshot);
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                // a panicked sender still counts as a settled failure
                tracing::error!(error = %e, "load task failed");
                tally.lock().failed += 1;
            }
        }

        let elapsed = started.elapsed();
        let t = tally.lock();
        let report = LoadReport {
            issued,
            succeeded: t.succeeded,
            failed: t.failed,
            elapsed,
            min_latency: t.latencies.iter().min().copied(),
            max_latency: t.latencies.iter().max().copied(),
            mean_latency: mean(&t.latencies),
            peak_outstanding: peak.load(Ordering::SeqCst),
        };
        tracing::info!(
            issued = report.issued,
            succeeded = report.succeeded,
            failed = report.failed,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "load run finished"
        );
        report
    }
}

/// One admitted request's place under the ceiling. Released on drop,
/// including when the sender panics.
struct Slot {
    outstanding: Arc<AtomicUsize>,
    held: usize,
}

impl Slot {
    fn take(outstanding: &Arc<AtomicUsize>) -> Self {
        let held = outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        Self {
            outstanding: Arc::clone(outstanding),
            held,
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

fn mean(samples: &[Duration]) -> Option<Duration> {
    if samples.is_empty() {
        return None;
    }
    let sum: Duration = samples.iter().sum();
    Some(sum / u32::try_from(samples.len()).unwrap_or(u32::MAX))
}
