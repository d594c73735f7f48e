//! Outbound request admission control.
//!
//! Enforces per-second/minute/hour ceilings with priority-ordered queuing and
//! adaptive throttling:
//! - a single background loop dequeues highest-priority-first (FIFO within a
//!   priority) and dispatches when all three rolling windows have room
//! - a full queue rejects new work synchronously; accepted work always
//!   resolves or rejects with the operation's own error
//! - fast successful calls loosen the effective per-second ceiling, failures
//!   and slow calls tighten it, at most once per cool-down interval
//!
//! The idle/throttled wait is a deliberate bounded polling sleep; everything
//! else is event-driven.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::error::EngineError;

const IDLE_POLL: Duration = Duration::from_millis(50);
const MAX_THROTTLE_SLEEP: Duration = Duration::from_secs(1);

/// Request priority. Higher dispatches first; FIFO within a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// A queued operation. Lives only inside the limiter's queue; created on
/// `execute()`, destroyed on dispatch or rejection.
struct QueuedRequest {
    priority: Priority,
    seq: u64,
    name: String,
    enqueued_at: Instant,
    job: Job,
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // max-heap: highest priority first, then earliest arrival
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// One rolling window with a hard reset on rollover.
struct Window {
    started: Instant,
    duration: Duration,
    count: u32,
}

impl Window {
    fn new(duration: Duration) -> Self {
        Self {
            started: Instant::now(),
            duration,
            count: 0,
        }
    }

    fn roll(&mut self, now: Instant) {
        if now.duration_since(self.started) >= self.duration {
            self.started = now;
            self.count = 0;
        }
    }

    fn until_reset(&self, now: Instant) -> Duration {
        self.duration
            .saturating_sub(now.duration_since(self.started))
    }
}

struct Windows {
    second: Window,
    minute: Window,
    hour: Window,
}

struct Adaptive {
    multiplier: f64,
    last_adjustment: Instant,
}

struct Inner {
    config: RateLimitConfig,
    queue: Mutex<BinaryHeap<QueuedRequest>>,
    seq: AtomicU64,
    windows: Mutex<Windows>,
    adaptive: Mutex<Adaptive>,
    notify: Notify,
    shutdown: AtomicBool,
    executed: AtomicU64,
    rejected: AtomicU64,
}

/// Priority-queued, adaptively throttled request dispatcher.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl RateLimiter {
    /// Create a limiter and start its processing loop.
    pub fn new(config: RateLimitConfig) -> Self {
        let inner = Arc::new(Inner {
            queue: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            windows: Mutex::new(Windows {
                second: Window::new(Duration::from_secs(1)),
                minute: Window::new(Duration::from_secs(60)),
                hour: Window::new(Duration::from_secs(3600)),
            }),
            adaptive: Mutex::new(Adaptive {
                multiplier: 1.0,
                last_adjustment: Instant::now(),
            }),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            executed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            config,
        });

        let loop_inner = inner.clone();
        tokio::spawn(async move {
            process_loop(loop_inner).await;
        });

        Self { inner }
    }

    /// Queue an operation for rate-limited execution.
    ///
    /// Rejects synchronously with `QueueFull` when the queue is at capacity.
    /// Otherwise the returned future resolves with the operation's own
    /// result once the limiter dispatches it.
    pub async fn execute<T, F, Fut>(
        &self,
        name: &str,
        priority: Priority,
        op: F,
    ) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
    {
        {
            let queue = self.inner.queue.lock().expect("queue lock poisoned");
            if queue.len() >= self.inner.config.queue_capacity {
                self.inner.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(EngineError::QueueFull {
                    pending: queue.len(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        let outcome_inner = self.inner.clone();
        let job: Job = Box::new(move || {
            Box::pin(async move {
                let started = Instant::now();
                let result = op().await;
                record_outcome(&outcome_inner, started.elapsed(), result.is_ok());
                let _ = tx.send(result);
            })
        });

        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        {
            let mut queue = self.inner.queue.lock().expect("queue lock poisoned");
            queue.push(QueuedRequest {
                priority,
                seq,
                name: name.to_string(),
                enqueued_at: Instant::now(),
                job,
            });
        }
        self.inner.notify.notify_one();

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Network(
                "rate limiter dropped the request".to_string(),
            )),
        }
    }

    /// Current queue depth.
    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Requests dispatched so far.
    pub fn executed_count(&self) -> u64 {
        self.inner.executed.load(Ordering::Relaxed)
    }

    /// Requests rejected at the queue door so far.
    pub fn rejected_count(&self) -> u64 {
        self.inner.rejected.load(Ordering::Relaxed)
    }

    /// Current adaptive multiplier.
    pub fn current_multiplier(&self) -> f64 {
        self.inner
            .adaptive
            .lock()
            .map(|a| a.multiplier)
            .unwrap_or(1.0)
    }

    /// Stop the processing loop. Queued requests are dropped and their
    /// callers receive an error.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        if let Ok(mut queue) = self.inner.queue.lock() {
            queue.clear();
        }
    }
}

fn effective_per_second(inner: &Inner) -> u32 {
    let multiplier = inner
        .adaptive
        .lock()
        .map(|a| a.multiplier)
        .unwrap_or(1.0);
    ((inner.config.requests_per_second as f64 * multiplier).floor() as u32).max(1)
}

fn record_outcome(inner: &Inner, elapsed: Duration, success: bool) {
    let Ok(mut adaptive) = inner.adaptive.lock() else {
        return;
    };
    let now = Instant::now();
    let cooldown = Duration::from_millis(inner.config.adjustment_cooldown_ms);
    if now.duration_since(adaptive.last_adjustment) < cooldown {
        return;
    }

    let fast = elapsed < Duration::from_millis(inner.config.fast_call_threshold_ms);
    let slow = elapsed > Duration::from_millis(inner.config.slow_call_threshold_ms);

    if success && fast {
        adaptive.multiplier =
            (adaptive.multiplier * inner.config.adaptive_increase).min(inner.config.adaptive_ceiling);
        adaptive.last_adjustment = now;
    } else if !success || slow {
        adaptive.multiplier =
            (adaptive.multiplier * inner.config.adaptive_decrease).max(inner.config.adaptive_floor);
        adaptive.last_adjustment = now;
    }
}

async fn process_loop(inner: Arc<Inner>) {
    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }

        // Dispatch decision: both locks held briefly, never across an await.
        let action = {
            let mut queue = inner.queue.lock().expect("queue lock poisoned");
            if queue.is_empty() {
                None
            } else {
                let now = Instant::now();
                let mut windows = inner.windows.lock().expect("windows lock poisoned");
                windows.second.roll(now);
                windows.minute.roll(now);
                windows.hour.roll(now);

                let per_second = effective_per_second(&inner);
                let throttle = if windows.second.count >= per_second {
                    Some(windows.second.until_reset(now))
                } else if windows.minute.count >= inner.config.requests_per_minute {
                    Some(windows.minute.until_reset(now))
                } else if windows.hour.count >= inner.config.requests_per_hour {
                    Some(windows.hour.until_reset(now))
                } else {
                    None
                };

                match throttle {
                    Some(wait) => Some(Err(wait)),
                    None => {
                        windows.second.count += 1;
                        windows.minute.count += 1;
                        windows.hour.count += 1;
                        Some(Ok(queue.pop().expect("queue checked non-empty")))
                    }
                }
            }
        };

        match action {
            None => {
                // idle: bounded poll, woken early on enqueue
                tokio::select! {
                    _ = inner.notify.notified() => {}
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                }
            }
            Some(Err(wait)) => {
                tokio::time::sleep(wait.min(MAX_THROTTLE_SLEEP)).await;
            }
            Some(Ok(request)) => {
                inner.executed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Dispatching '{}' after {:?} queued",
                    request.name,
                    request.enqueued_at.elapsed()
                );
                tokio::spawn((request.job)());
            }
        }
    }
}
