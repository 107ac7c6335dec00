//! Broadcast Throttler: rate-limits snapshot fan-out while guaranteeing
//! eventual delivery of the final state in a burst. See `SPEC_FULL.md` §4 /
//! spec.md §4.7 and Testable Property 8.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// `R` updates/sec rate cap (period `T = 1000/R ms`) plus a debounce `D` that
/// guarantees the *last* requested broadcast in a burst is always delivered,
/// even if it arrives inside the rate-cap window.
pub struct BroadcastThrottler<F>
where
    F: Fn() + Send + Sync + 'static,
{
    period: Duration,
    debounce: Duration,
    emit: Arc<F>,
    state: Arc<Mutex<ThrottleState>>,
    notify: Arc<Notify>,
    debounce_task: Mutex<Option<JoinHandle<()>>>,
}

struct ThrottleState {
    last_emit: Option<Instant>,
    pending: bool,
    tick_task: Option<JoinHandle<()>>,
}

impl<F> BroadcastThrottler<F>
where
    F: Fn() + Send + Sync + 'static,
{
    pub fn new(rate_per_sec: u32, debounce: Duration, emit: F) -> Arc<Self> {
        let period = Duration::from_millis(1000 / rate_per_sec.max(1) as u64);
        Arc::new(Self {
            period,
            debounce,
            emit: Arc::new(emit),
            state: Arc::new(Mutex::new(ThrottleState { last_emit: None, pending: false, tick_task: None })),
            notify: Arc::new(Notify::new()),
            debounce_task: Mutex::new(None),
        })
    }

    /// Request a broadcast. Emits immediately if the last emission was ≥ T
    /// ago; otherwise coalesces with any already-pending request and arms a
    /// tick at `last_emit + T`. Independently (re)arms a debounce timer so
    /// the very last request in a burst is delivered by `now + D` regardless
    /// of the rate cap.
    pub fn request_broadcast(self: &Arc<Self>) {
        let now = Instant::now();
        let mut fire_now = false;
        {
            let mut state = self.state.lock().unwrap();
            match state.last_emit {
                None => fire_now = true,
                Some(last) if now.duration_since(last) >= self.period => fire_now = true,
                _ => {
                    state.pending = true;
                    if state.tick_task.is_none() {
                        let delay = self.period.saturating_sub(
                            now.duration_since(state.last_emit.unwrap()),
                        );
                        let this = Arc::clone(self);
                        state.tick_task = Some(tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            this.fire_if_pending();
                        }));
                    }
                }
            }
        }

        if fire_now {
            self.fire();
        }

        self.arm_debounce();
    }

    /// Bypasses both the rate cap and the debounce timer.
    pub fn force_broadcast(self: &Arc<Self>) {
        self.fire();
    }

    fn fire(self: &Arc<Self>) {
        (self.emit)();
        let mut state = self.state.lock().unwrap();
        state.last_emit = Some(Instant::now());
        state.pending = false;
        state.tick_task = None;
    }

    fn fire_if_pending(self: &Arc<Self>) {
        let should_fire = {
            let state = self.state.lock().unwrap();
            state.pending
        };
        if should_fire {
            self.fire();
        }
    }

    fn arm_debounce(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let debounce = self.debounce;
        let mut task_slot = self.debounce_task.lock().unwrap();
        if let Some(old) = task_slot.take() {
            old.abort();
        }
        *task_slot = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            this.fire_if_pending();
            this.notify.notify_waiters();
        }));
    }

    #[cfg(test)]
    pub async fn wait_for_debounce(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn first_request_fires_immediately() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let throttler = BroadcastThrottler::new(10, Duration::from_millis(50), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        throttler.request_broadcast();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn burst_eventually_delivers_final_state() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let throttler = BroadcastThrottler::new(1000, Duration::from_millis(30), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        for _ in 0..5 {
            throttler.request_broadcast();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(count.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn force_broadcast_bypasses_rate_cap() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let throttler = BroadcastThrottler::new(1, Duration::from_secs(5), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        throttler.force_broadcast();
        throttler.force_broadcast();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
