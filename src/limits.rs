//! Upload admission control.
//!
//! Every upload request is gated through [`UploadAdmission::admit`] before any
//! bytes are persisted. Checks run in a fixed order and the first failing one
//! wins:
//!
//! 1. lazy ledger maintenance (prune events older than an hour)
//! 2. global in-flight ceiling
//! 3. per-client hourly quota
//! 4. per-client one-minute quota
//! 5. per-client five-minute burst quota
//! 6. per-client minimum spacing between uploads
//!
//! An admitted upload holds an [`UploadGuard`] which frees its concurrency
//! slot when dropped, so cancelled requests never leak a slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Key used when the origin of a request cannot be determined.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Events older than this are dropped during maintenance. It is also the
/// longest window any check looks at.
pub const EVENT_RETENTION: Duration = Duration::from_secs(60 * 60);

const MINUTE_WINDOW: Duration = Duration::from_secs(60);
const BURST_WINDOW: Duration = Duration::from_secs(5 * 60);

const CONCURRENCY_RETRY_SECS: u64 = 60;
const HOURLY_RETRY_SECS: u64 = 60 * 60;
const MINUTE_RETRY_SECS: u64 = 60;
const BURST_RETRY_SECS: u64 = 5 * 60;

/// Thresholds for [`UploadAdmission`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionConfig {
    /// Maximum uploads in flight across all clients.
    pub concurrency_ceiling: usize,
    /// Maximum uploads per client in the last hour.
    pub hourly_ceiling: usize,
    /// Maximum uploads per client in the last minute.
    pub minute_ceiling: usize,
    /// Maximum uploads per client in the last five minutes.
    pub five_minute_ceiling: usize,
    /// Minimum gap between two uploads from the same client.
    pub min_spacing: Duration,
    /// How often the ledger is swept for stale events.
    pub cleanup_interval: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            concurrency_ceiling: 2,
            hourly_ceiling: 15,
            minute_ceiling: 3,
            five_minute_ceiling: 8,
            min_spacing: Duration::from_millis(5000),
            cleanup_interval: Duration::from_millis(60 * 60 * 1000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    TooManyConcurrent,
    HourlyLimit,
    MinuteLimit,
    BurstLimit,
    TooFast,
}

impl RejectReason {
    /// Wire code relayed to clients in the `errorCode` field.
    pub const fn code(self) -> &'static str {
        match self {
            Self::TooManyConcurrent => "TOO_MANY_CONCURRENT",
            Self::HourlyLimit => "HOURLY_LIMIT",
            Self::MinuteLimit => "MINUTE_LIMIT",
            Self::BurstLimit => "BURST_LIMIT",
            Self::TooFast => "TOO_FAST",
        }
    }

    pub const fn message(self) -> &'static str {
        match self {
            Self::TooManyConcurrent => "The server is processing too many uploads, please wait",
            Self::HourlyLimit => "Hourly upload limit reached, please try again later",
            Self::MinuteLimit => "Too many uploads in the last minute, please wait",
            Self::BurstLimit => "Too many uploads in a short period, please slow down",
            Self::TooFast => "Uploads are too close together, please wait a few seconds",
        }
    }
}

/// A refused admission. Returned as a value: rejections are an expected,
/// frequent outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{} (retry after {retry_after_secs}s)", .reason.message())]
pub struct Rejection {
    pub reason: RejectReason,
    pub retry_after_secs: u64,
}

impl Rejection {
    const fn new(reason: RejectReason, retry_after_secs: u64) -> Self {
        Self {
            reason,
            retry_after_secs,
        }
    }
}

struct Ledger {
    events: HashMap<String, Vec<Instant>>,
    last_cleanup: Instant,
}

impl Ledger {
    /// Drops events outside the retention window and clients left with none.
    /// Returns the number of clients removed.
    fn prune(&mut self, now: Instant) -> usize {
        let before = self.events.len();
        self.events.retain(|_, events| {
            events.retain(|&at| now.saturating_duration_since(at) < EVENT_RETENTION);
            !events.is_empty()
        });
        self.last_cleanup = now;
        before - self.events.len()
    }
}

struct Shared {
    config: AdmissionConfig,
    ledger: Mutex<Ledger>,
    in_flight: AtomicUsize,
}

impl Shared {
    fn release(&self) {
        // Saturates at zero.
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    fn sweep(&self, now: Instant) -> usize {
        self.ledger.lock().prune(now)
    }
}

/// Per-client upload admission controller. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct UploadAdmission {
    shared: Arc<Shared>,
}

impl UploadAdmission {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                ledger: Mutex::new(Ledger {
                    events: HashMap::new(),
                    last_cleanup: Instant::now(),
                }),
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.shared.config
    }

    /// Admits or rejects an upload from `key` at `now`.
    ///
    /// On success the upload is recorded against `key` and a concurrency slot
    /// is taken; the slot is freed when the returned guard is dropped. A
    /// rejection leaves no trace.
    pub fn admit(&self, key: &str, now: Instant) -> Result<UploadGuard, Rejection> {
        let config = &self.shared.config;
        let mut ledger = self.shared.ledger.lock();

        if now.saturating_duration_since(ledger.last_cleanup) > config.cleanup_interval {
            let removed = ledger.prune(now);
            debug!("Pruned {} idle upload clients", removed);
        }

        if self.shared.in_flight.load(Ordering::Acquire) >= config.concurrency_ceiling {
            return Err(Rejection::new(
                RejectReason::TooManyConcurrent,
                CONCURRENCY_RETRY_SECS,
            ));
        }

        if let Some(history) = ledger.events.get(key) {
            check_history(config, history, now)?;
        }

        ledger.events.entry(key.to_string()).or_default().push(now);
        let in_flight = self.shared.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("Admitted upload from {} ({} in flight)", key, in_flight);

        Ok(UploadGuard {
            shared: Arc::clone(&self.shared),
        })
    }

    /// [`admit`](Self::admit) against the current time.
    pub fn try_start(&self, key: &str) -> Result<UploadGuard, Rejection> {
        self.admit(key, Instant::now())
    }

    /// Runs ledger maintenance immediately. Returns the number of clients
    /// removed.
    pub fn prune(&self, now: Instant) -> usize {
        self.shared.sweep(now)
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    pub fn tracked_clients(&self) -> usize {
        self.shared.ledger.lock().events.len()
    }

    /// Uploads recorded for `key` within the retention window ending at `now`.
    pub fn recent_uploads(&self, key: &str, now: Instant) -> usize {
        self.shared
            .ledger
            .lock()
            .events
            .get(key)
            .map_or(0, |history| count_within(history, now, EVENT_RETENTION))
    }

    /// Prunes the ledger every `every` on the tokio runtime, independent of
    /// traffic. The task exits once every handle to this limiter is gone.
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let every = every.max(Duration::from_secs(1));
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        info!("Starting upload ledger sweeper every {:?}", every);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let removed = shared.sweep(tokio::time::Instant::now().into_std());
                if removed > 0 {
                    debug!("Sweeper pruned {} idle upload clients", removed);
                }
            }
        })
    }
}

/// Proof of admission. Dropping it releases the concurrency slot exactly once,
/// including when the request future is cancelled.
#[must_use = "dropping the guard releases the upload slot immediately"]
pub struct UploadGuard {
    shared: Arc<Shared>,
}

impl UploadGuard {
    /// Releases the slot now rather than at end of scope.
    pub fn release(self) {}
}

impl Drop for UploadGuard {
    fn drop(&mut self) {
        self.shared.release();
    }
}

fn count_within(history: &[Instant], now: Instant, window: Duration) -> usize {
    history
        .iter()
        .filter(|&&at| now.saturating_duration_since(at) < window)
        .count()
}

fn check_history(
    config: &AdmissionConfig,
    history: &[Instant],
    now: Instant,
) -> Result<(), Rejection> {
    if count_within(history, now, EVENT_RETENTION) >= config.hourly_ceiling {
        return Err(Rejection::new(RejectReason::HourlyLimit, HOURLY_RETRY_SECS));
    }

    if count_within(history, now, MINUTE_WINDOW) >= config.minute_ceiling {
        return Err(Rejection::new(RejectReason::MinuteLimit, MINUTE_RETRY_SECS));
    }

    if count_within(history, now, BURST_WINDOW) >= config.five_minute_ceiling {
        return Err(Rejection::new(RejectReason::BurstLimit, BURST_RETRY_SECS));
    }

    if let Some(&last) = history.iter().max() {
        let since = now.saturating_duration_since(last);
        if since < config.min_spacing {
            return Err(Rejection::new(
                RejectReason::TooFast,
                ceil_secs(config.min_spacing - since),
            ));
        }
    }

    Ok(())
}

fn ceil_secs(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos().div_ceil(1_000_000_000)).unwrap_or(u64::MAX)
}
