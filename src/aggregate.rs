//! Detection-result aggregation and observer delivery.
//!
//! Maintains a time-bounded rolling window of detector scores and reports
//! (instantaneous, average) pairs to the registered observer from a
//! dedicated delivery thread. Delivery is fire-and-forget through a
//! single-slot last-value-wins mailbox: a slow observer only ever misses
//! intermediate results, it never blocks the detect thread and never grows
//! a queue.
//!
//! Gap policy (fixed): explicitly reported dropped/missing frames are
//! excluded from the average's denominator and surfaced via `gap_count()`.
//! The average is therefore always within the min/max of the samples in the
//! current window.

use crate::lock_or_recover;
use crate::watermark::DetectionSample;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Callback receiving (instantaneous, average) probability pairs.
pub type ResultObserver = Box<dyn Fn(f32, f32) + Send + 'static>;

/// Snapshot of the aggregator after one push.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregateResult {
    /// The latest sample's probability.
    pub instantaneous: f32,
    /// Mean probability over the rolling window.
    pub average: f32,
    /// Samples currently in the window.
    pub window_len: usize,
    /// Gaps reported since start or the last reset.
    pub gap_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
    Idle,
    Accumulating,
}

struct AggState {
    state: AggregatorState,
    entries: VecDeque<DetectionSample>,
    gaps: u64,
    latest: Option<AggregateResult>,
}

struct Inner {
    window: Duration,
    state: Mutex<AggState>,
    mailbox: Mutex<Option<AggregateResult>>,
    wakeup: Condvar,
    observer: Mutex<Option<ResultObserver>>,
    shutdown: AtomicBool,
}

/// Rolling-average aggregator with decoupled observer delivery.
pub struct ResultAggregator {
    inner: Arc<Inner>,
    delivery: Option<JoinHandle<()>>,
}

impl ResultAggregator {
    /// `window` bounds the rolling average's horizon; `min_interval` bounds
    /// how often the observer is invoked.
    pub fn new(window: Duration, min_interval: Duration) -> Self {
        let inner = Arc::new(Inner {
            window,
            state: Mutex::new(AggState {
                state: AggregatorState::Idle,
                entries: VecDeque::new(),
                gaps: 0,
                latest: None,
            }),
            mailbox: Mutex::new(None),
            wakeup: Condvar::new(),
            observer: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        });
        let worker_inner = inner.clone();
        let delivery = thread::Builder::new()
            .name("result-delivery".to_string())
            .spawn(move || delivery_loop(worker_inner, min_interval))
            .ok();
        Self { inner, delivery }
    }

    /// Register (or replace) the observer. May be called at any time.
    pub fn set_observer(&self, observer: Option<ResultObserver>) {
        *lock_or_recover(&self.inner.observer, "aggregator observer") = observer;
    }

    /// Transition `Idle -> Accumulating`. No-op when already accumulating.
    pub fn begin(&self) {
        let mut state = lock_or_recover(&self.inner.state, "aggregator state");
        state.state = AggregatorState::Accumulating;
    }

    /// Clear the window and return to `Idle`.
    pub fn reset(&self) {
        let mut state = lock_or_recover(&self.inner.state, "aggregator state");
        state.state = AggregatorState::Idle;
        state.entries.clear();
        state.gaps = 0;
        state.latest = None;
        drop(state);
        lock_or_recover(&self.inner.mailbox, "aggregator mailbox").take();
    }

    pub fn state(&self) -> AggregatorState {
        lock_or_recover(&self.inner.state, "aggregator state").state
    }

    /// Fold one detection sample into the window and schedule delivery.
    pub fn push(&self, sample: DetectionSample) {
        let result = {
            let mut state = lock_or_recover(&self.inner.state, "aggregator state");
            if state.state != AggregatorState::Accumulating {
                tracing::debug!("detection sample pushed while idle; ignoring");
                return;
            }
            // Evict by the newest sample's own timestamp so behavior is
            // deterministic under test-controlled clocks.
            if let Some(cutoff) = sample.at.checked_sub(self.inner.window) {
                while state
                    .entries
                    .front()
                    .map(|entry| entry.at < cutoff)
                    .unwrap_or(false)
                {
                    state.entries.pop_front();
                }
            }
            state.entries.push_back(sample);
            let sum: f32 = state.entries.iter().map(|entry| entry.probability).sum();
            let result = AggregateResult {
                instantaneous: sample.probability,
                average: sum / state.entries.len() as f32,
                window_len: state.entries.len(),
                gap_count: state.gaps,
            };
            state.latest = Some(result);
            result
        };
        let mut slot = lock_or_recover(&self.inner.mailbox, "aggregator mailbox");
        *slot = Some(result);
        self.inner.wakeup.notify_one();
    }

    /// Account one or more dropped/missing frames. Excluded from the
    /// average, never silently skipped.
    pub fn push_gap(&self, missing: u64) {
        let mut state = lock_or_recover(&self.inner.state, "aggregator state");
        if state.state != AggregatorState::Accumulating {
            return;
        }
        state.gaps += missing;
        let gaps = state.gaps;
        if let Some(latest) = state.latest.as_mut() {
            latest.gap_count = gaps;
        }
    }

    /// Latest computed result, if any sample arrived since start/reset.
    pub fn snapshot(&self) -> Option<AggregateResult> {
        lock_or_recover(&self.inner.state, "aggregator state").latest
    }

    pub fn gap_count(&self) -> u64 {
        lock_or_recover(&self.inner.state, "aggregator state").gaps
    }
}

impl Drop for ResultAggregator {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.wakeup.notify_all();
        if let Some(delivery) = self.delivery.take() {
            let _ = delivery.join();
        }
    }
}

fn delivery_loop(inner: Arc<Inner>, min_interval: Duration) {
    let mut last_delivery: Option<Instant> = None;
    loop {
        let result = {
            let mut slot = lock_or_recover(&inner.mailbox, "aggregator mailbox");
            loop {
                if inner.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(result) = slot.take() {
                    break result;
                }
                let (guard, _) = inner
                    .wakeup
                    .wait_timeout(slot, Duration::from_millis(200))
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                slot = guard;
            }
        };

        // Rate-bound deliveries; newer results overwrite the mailbox while
        // we wait, so the observer always sees the freshest value.
        if let Some(last) = last_delivery {
            let elapsed = last.elapsed();
            if elapsed < min_interval {
                let mut remaining = min_interval - elapsed;
                while !remaining.is_zero() {
                    if inner.shutdown.load(Ordering::SeqCst) {
                        return;
                    }
                    let step = remaining.min(Duration::from_millis(50));
                    thread::sleep(step);
                    remaining = remaining.saturating_sub(step);
                }
            }
        }

        let observer = lock_or_recover(&inner.observer, "aggregator observer");
        if let Some(observer) = observer.as_ref() {
            observer(result.instantaneous, result.average);
        }
        last_delivery = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    fn sample(probability: f32, seq: u64, at: Instant) -> DetectionSample {
        DetectionSample {
            probability,
            seq,
            at,
        }
    }

    fn aggregator() -> ResultAggregator {
        ResultAggregator::new(Duration::from_secs(10), Duration::ZERO)
    }

    #[test]
    fn push_while_idle_is_ignored() {
        let agg = aggregator();
        agg.push(sample(0.9, 0, Instant::now()));
        assert_eq!(agg.snapshot(), None);
        assert_eq!(agg.state(), AggregatorState::Idle);
    }

    #[test]
    fn average_stays_within_window_bounds() {
        let agg = aggregator();
        agg.begin();
        let now = Instant::now();
        for (i, p) in [0.2f32, 0.9, 0.4, 0.7].into_iter().enumerate() {
            agg.push(sample(p, i as u64, now));
        }
        let result = agg.snapshot().expect("result");
        assert!((0.0..=1.0).contains(&result.average));
        assert!(result.average >= 0.2 && result.average <= 0.9);
        assert!((result.average - 0.55).abs() < 1e-6);
        assert_eq!(result.instantaneous, 0.7);
        assert_eq!(result.window_len, 4);
    }

    #[test]
    fn old_samples_fall_out_of_the_window() {
        let agg = ResultAggregator::new(Duration::from_secs(5), Duration::ZERO);
        agg.begin();
        let now = Instant::now();
        let old = now.checked_sub(Duration::from_secs(20)).expect("old instant");
        agg.push(sample(0.0, 0, old));
        agg.push(sample(0.8, 1, now));
        let result = agg.snapshot().expect("result");
        // The stale zero sample was evicted; only the fresh one remains.
        assert_eq!(result.window_len, 1);
        assert!((result.average - 0.8).abs() < 1e-6);
    }

    #[test]
    fn gaps_are_counted_but_excluded_from_the_average() {
        let agg = aggregator();
        agg.begin();
        let now = Instant::now();
        agg.push(sample(0.8, 0, now));
        agg.push_gap(3);
        agg.push(sample(0.6, 4, now));
        let result = agg.snapshot().expect("result");
        assert!((result.average - 0.7).abs() < 1e-6);
        assert_eq!(result.gap_count, 3);
        assert_eq!(agg.gap_count(), 3);
    }

    #[test]
    fn reset_clears_and_returns_to_idle() {
        let agg = aggregator();
        agg.begin();
        agg.push(sample(0.5, 0, Instant::now()));
        agg.push_gap(1);
        agg.reset();
        assert_eq!(agg.state(), AggregatorState::Idle);
        assert_eq!(agg.snapshot(), None);
        assert_eq!(agg.gap_count(), 0);
    }

    #[test]
    fn observer_receives_latest_pair() {
        let agg = aggregator();
        let (tx, rx) = bounded::<(f32, f32)>(8);
        agg.set_observer(Some(Box::new(move |instantaneous, average| {
            let _ = tx.try_send((instantaneous, average));
        })));
        agg.begin();
        let now = Instant::now();
        agg.push(sample(1.0, 0, now));
        let (instantaneous, average) = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("observer should fire");
        assert_eq!(instantaneous, 1.0);
        assert!((average - 1.0).abs() < 1e-6);
    }

    #[test]
    fn observer_is_never_invoked_without_samples() {
        let agg = aggregator();
        let (tx, rx) = bounded::<(f32, f32)>(1);
        agg.set_observer(Some(Box::new(move |instantaneous, average| {
            let _ = tx.try_send((instantaneous, average));
        })));
        agg.begin();
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    }
}
