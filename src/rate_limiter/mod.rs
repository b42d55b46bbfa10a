//! Per-provider rolling-window request counter with warning/exceed events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::debug;

const WINDOW_MS: i64 = 60_000;
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Static per-provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderLimit {
    pub provider: String,
    pub requests_per_minute: u32,
    #[serde(default)]
    pub warning_threshold: Option<u32>,
}

impl ProviderLimit {
    fn warning_threshold(&self) -> u32 {
        self.warning_threshold
            .unwrap_or_else(|| ((self.requests_per_minute as f64) * 0.92) as u32)
    }
}

/// Events emitted by the rate limiter.
#[derive(Debug, Clone)]
pub enum RateLimiterEvent {
    Warning {
        provider: String,
        current_rpm: u32,
        limit: u32,
        headroom: u32,
    },
    Exceeded {
        provider: String,
        current_rpm: u32,
        limit: u32,
    },
}

/// Per-provider rolling window: one `(second_bucket, count)` entry per
/// second with at least one tracked request.
#[derive(Debug, Default)]
struct RateWindow {
    buckets: Vec<(i64, u32)>,
    warned: bool,
}

impl RateWindow {
    fn track(&mut self, second_bucket: i64, count: u32) {
        if let Some(last) = self.buckets.last_mut() {
            if last.0 == second_bucket {
                last.1 += count;
                return;
            }
        }
        self.buckets.push((second_bucket, count));
    }

    fn prune(&mut self, now_ms: i64) {
        let cutoff = now_ms - WINDOW_MS;
        self.buckets.retain(|(bucket, _)| bucket * 1000 > cutoff);
    }

    fn sum(&self, now_ms: i64) -> u32 {
        let cutoff = now_ms - WINDOW_MS;
        self.buckets.iter().filter(|(bucket, _)| bucket * 1000 > cutoff).map(|(_, c)| c).sum()
    }
}

struct Inner {
    limits: HashMap<String, ProviderLimit>,
    windows: HashMap<String, RateWindow>,
}

/// Rolling-window request limiter, one window per provider.
pub struct RateLimiter {
    inner: Arc<Mutex<Inner>>,
    events_tx: broadcast::Sender<RateLimiterEvent>,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    pub fn new(limits: Vec<ProviderLimit>) -> Arc<Self> {
        let limiter = Arc::new(Self {
            inner: Arc::new(Mutex::new(Inner {
                limits: limits.into_iter().map(|l| (l.provider.clone(), l)).collect(),
                windows: HashMap::new(),
            })),
            events_tx: broadcast::channel(1024).0,
            sweep_handle: Mutex::new(None),
        });

        let sweep_inner = limiter.inner.clone();
        let sweep_tx = limiter.events_tx.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                sweep(&sweep_inner, &sweep_tx).await;
            }
        });
        // We can't await inside `new`; stash the handle via try_lock (no
        // contention possible this early).
        if let Ok(mut guard) = limiter.sweep_handle.try_lock() {
            *guard = Some(handle);
        }

        limiter
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RateLimiterEvent> {
        self.events_tx.subscribe()
    }

    /// Record `count` requests for `provider` at the current instant.
    /// Negative counts are not representable (`count` is unsigned); callers
    /// passing a signed value from elsewhere should clamp to 0 first.
    pub async fn track(&self, provider: &str, count: i64) {
        let count = count.max(0) as u32;
        let now_ms = now_ms();
        let second_bucket = now_ms / 1000;

        let mut inner = self.inner.lock().await;
        inner
            .windows
            .entry(provider.to_string())
            .or_default()
            .track(second_bucket, count);

        self.check_thresholds(&mut inner, provider, now_ms);
    }

    fn check_thresholds(&self, inner: &mut Inner, provider: &str, now_ms: i64) {
        let Some(limit) = inner.limits.get(provider).cloned() else {
            return;
        };
        let window = inner.windows.entry(provider.to_string()).or_default();
        window.prune(now_ms);
        let current_rpm = window.sum(now_ms);

        if current_rpm >= limit.requests_per_minute {
            window.warned = true;
            let _ = self.events_tx.send(RateLimiterEvent::Exceeded {
                provider: provider.to_string(),
                current_rpm,
                limit: limit.requests_per_minute,
            });
        } else if current_rpm >= limit.warning_threshold() {
            if !window.warned {
                window.warned = true;
                let headroom = limit.requests_per_minute.saturating_sub(current_rpm);
                let _ = self.events_tx.send(RateLimiterEvent::Warning {
                    provider: provider.to_string(),
                    current_rpm,
                    limit: limit.requests_per_minute,
                    headroom,
                });
            }
        } else {
            window.warned = false;
        }
    }

    pub async fn current_rpm(&self, provider: &str) -> u32 {
        let now_ms = now_ms();
        let mut inner = self.inner.lock().await;
        let window = inner.windows.entry(provider.to_string()).or_default();
        window.prune(now_ms);
        window.sum(now_ms)
    }

    /// `max(0, limit - current_rpm)`, or `u32::MAX` (treated as +infinity)
    /// for an unconfigured provider.
    pub async fn headroom(&self, provider: &str) -> u32 {
        let inner = self.inner.lock().await;
        let Some(limit) = inner.limits.get(provider).cloned() else {
            return u32::MAX;
        };
        drop(inner);
        let current = self.current_rpm(provider).await;
        limit.requests_per_minute.saturating_sub(current)
    }

    pub async fn reset(&self, provider: &str) {
        let mut inner = self.inner.lock().await;
        inner.windows.remove(provider);
    }

    pub async fn reset_all(&self) {
        let mut inner = self.inner.lock().await;
        let providers: Vec<String> = inner.limits.keys().cloned().collect();
        for p in providers {
            inner.windows.remove(&p);
        }
    }

    /// Cancel the periodic sweep timer. Idempotent.
    pub async fn dispose(&self) {
        if let Some(handle) = self.sweep_handle.lock().await.take() {
            handle.abort();
        }
    }
}

async fn sweep(inner: &Arc<Mutex<Inner>>, events_tx: &broadcast::Sender<RateLimiterEvent>) {
    let now_ms = now_ms();
    let mut inner = inner.lock().await;
    let providers: Vec<String> = inner.windows.keys().cloned().collect();
    for provider in providers {
        let Some(limit) = inner.limits.get(&provider).cloned() else {
            continue;
        };
        let window = inner.windows.get_mut(&provider).unwrap();
        window.prune(now_ms);
        let current_rpm = window.sum(now_ms);
        debug!(provider, current_rpm, "rate_limiter sweep");

        if current_rpm < limit.warning_threshold() {
            window.warned = false;
        } else if current_rpm >= limit.requests_per_minute {
            let _ = events_tx.send(RateLimiterEvent::Exceeded {
                provider: provider.clone(),
                current_rpm,
                limit: limit.requests_per_minute,
            });
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
