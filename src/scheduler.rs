//! # Paced Scheduler
//!
//! Fires a [`TickHandler`] at a fixed rate measured start to start, with a
//! drop-oldest policy: while the previous tick's work is still running, new
//! boundaries are skipped and counted instead of queued. At most one tick's
//! work is ever in flight.
//!
//! `stop()` cancels the pacing loop, aborts in-flight work and waits for the
//! loop task, so no tick fires after it returns.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{WatchError, WatchResult};

/// Work run once per tick.
#[async_trait]
pub trait TickHandler: Send + Sync + 'static {
    /// `tick` starts at 1 and increases by one per fired tick.
    async fn on_tick(&self, tick: u64);
}

#[derive(Debug, Default)]
struct Counters {
    fired: AtomicU64,
    skipped: AtomicU64,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Fixed-rate tick source.
pub struct PacedScheduler {
    period: Duration,
    handler: Arc<dyn TickHandler>,
    counters: Arc<Counters>,
    running: Mutex<Option<Running>>,
}

impl PacedScheduler {
    pub fn new(frame_rate_hz: u32, handler: Arc<dyn TickHandler>) -> Self {
        Self::with_period(
            Duration::from_secs_f64(1.0 / frame_rate_hz.max(1) as f64),
            handler,
        )
    }

    pub fn with_period(period: Duration, handler: Arc<dyn TickHandler>) -> Self {
        Self {
            period,
            handler,
            counters: Arc::new(Counters::default()),
            running: Mutex::new(None),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Spawn the pacing loop. The first tick fires immediately.
    pub fn start(&self) -> WatchResult<()> {
        let mut running = self.lock();
        if running.is_some() {
            return Err(WatchError::already_running("scheduler running"));
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(pacing_loop(
            self.period,
            self.handler.clone(),
            self.counters.clone(),
            cancel.clone(),
        ));
        *running = Some(Running { cancel, handle });
        info!(period_ms = self.period.as_millis() as u64, "scheduler started");
        Ok(())
    }

    /// Stop ticking. Returns once the loop and any in-flight tick are gone.
    pub async fn stop(&self) {
        let Some(running) = self.lock().take() else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            if !e.is_cancelled() {
                warn!("scheduler loop ended abnormally: {}", e);
            }
        }
        info!(
            fired = self.fired(),
            skipped = self.skipped(),
            "scheduler stopped"
        );
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    /// Ticks whose work was started.
    pub fn fired(&self) -> u64 {
        self.counters.fired.load(Ordering::Relaxed)
    }

    /// Boundaries dropped because the previous tick was still busy.
    pub fn skipped(&self) -> u64 {
        self.counters.skipped.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for PacedScheduler {
    fn drop(&mut self) {
        if let Some(running) = self.lock().take() {
            running.cancel.cancel();
            running.handle.abort();
        }
    }
}

async fn pacing_loop(
    period: Duration,
    handler: Arc<dyn TickHandler>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut in_flight: Option<JoinHandle<()>> = None;
    let mut tick = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if in_flight.as_ref().is_some_and(|h| !h.is_finished()) {
                    counters.skipped.fetch_add(1, Ordering::Relaxed);
                    debug!(tick, "previous tick still busy, boundary skipped");
                    continue;
                }
                tick += 1;
                counters.fired.fetch_add(1, Ordering::Relaxed);
                let handler = handler.clone();
                in_flight = Some(tokio::spawn(async move { handler.on_tick(tick).await }));
            }
        }
    }

    if let Some(work) = in_flight {
        work.abort();
        let _ = work.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Spy {
        calls: AtomicU64,
        active: AtomicUsize,
        max_active: AtomicUsize,
        busy_for: Duration,
    }

    #[async_trait]
    impl TickHandler for Spy {
        async fn on_tick(&self, _tick: u64) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            if !self.busy_for.is_zero() {
                tokio::time::sleep(self.busy_for).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_matches_frequency() {
        let spy = Arc::new(Spy::default());
        let scheduler = PacedScheduler::new(5, spy.clone());
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        scheduler.stop().await;

        let fired = spy.calls.load(Ordering::SeqCst);
        assert!((9..=11).contains(&fired), "fired {}", fired);
        assert_eq!(scheduler.skipped(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_oldest_skips_busy_boundaries() {
        let spy = Arc::new(Spy {
            busy_for: Duration::from_millis(1100),
            ..Default::default()
        });
        let scheduler = PacedScheduler::new(5, spy.clone());
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        scheduler.stop().await;

        assert_eq!(spy.max_active.load(Ordering::SeqCst), 1);
        assert!(scheduler.skipped() > 0);
        assert!(scheduler.fired() <= 4, "fired {}", scheduler.fired());
        let boundaries = scheduler.fired() + scheduler.skipped();
        assert!((14..=16).contains(&boundaries), "boundaries {}", boundaries);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_tick_after_stop() {
        let spy = Arc::new(Spy::default());
        let scheduler = PacedScheduler::new(10, spy.clone());
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(450)).await;
        scheduler.stop().await;
        let frozen = spy.calls.load(Ordering::SeqCst);
        assert!(frozen > 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(spy.calls.load(Ordering::SeqCst), frozen);
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_aborts_in_flight_work() {
        let spy = Arc::new(Spy {
            busy_for: Duration::from_secs(3600),
            ..Default::default()
        });
        let scheduler = PacedScheduler::new(2, spy.clone());
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(spy.active.load(Ordering::SeqCst), 1);

        scheduler.stop().await;
        // The aborted tick never reaches its decrement.
        assert_eq!(spy.calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.fired(), 1);
    }

    #[tokio::test]
    async fn test_double_start_rejected_and_stop_idempotent() {
        let scheduler = PacedScheduler::new(1, Arc::new(Spy::default()));
        scheduler.start().unwrap();
        assert!(matches!(
            scheduler.start(),
            Err(WatchError::AlreadyRunning { .. })
        ));
        scheduler.stop().await;
        scheduler.stop().await;
        assert!(!scheduler.is_running());
    }
}
