use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures_util::Stream;
use sharevault_protocol::{ProgressUpdate, TransferStatus};
use tokio::sync::mpsc;

/// Percent change that bypasses the time throttle.
const MIN_PERCENT_DELTA: f64 = 2.0;

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Calculates transfer speed using a sliding window of samples.
pub struct SpeedCalculator {
    samples: VecDeque<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl SpeedCalculator {
    /// Creates a new calculator.
    ///
    /// - `window_size`: time window for speed calculation (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            samples: VecDeque::new(),
            max_samples: max_samples.unwrap_or(100).max(2),
            window_size: window_size.unwrap_or(Duration::from_secs(5)),
        }
    }

    /// Records `bytes` transferred at the current instant.
    pub fn add_sample(&mut self, bytes: u64) {
        self.add_sample_at(bytes, Instant::now());
    }

    fn add_sample_at(&mut self, bytes: u64, now: Instant) {
        self.samples.push_back(SpeedSample {
            bytes,
            timestamp: now,
        });

        // Prune samples outside the window.
        while let Some(first) = self.samples.front() {
            if now.duration_since(first.timestamp) > self.window_size {
                self.samples.pop_front();
            } else {
                break;
            }
        }

        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    /// Average speed in bytes/second within the window.
    ///
    /// The oldest sample only marks the start of the window; its bytes were
    /// transferred before it. Returns 0.0 with fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        if self.samples.len() < 2 {
            return 0.0;
        }

        let elapsed = last.timestamp.duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }

        let total_bytes: u64 = self.samples.iter().skip(1).map(|s| s.bytes).sum();
        total_bytes as f64 / elapsed.as_secs_f64()
    }

    /// Estimates time remaining to transfer `remaining_bytes`.
    ///
    /// Returns `None` if speed is zero.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(remaining_bytes as f64 / speed).ok()
    }

    /// Clears all recorded samples.
    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

// ---------------------------------------------------------------------------
// Progress fan-out
// ---------------------------------------------------------------------------

/// Per-task progress broadcaster.
///
/// Non-terminal updates are throttled; the terminal update is always
/// delivered, exactly once, to every subscriber, after which all
/// subscriptions end.
pub(crate) struct ProgressHub {
    interval: Duration,
    speed: SpeedCalculator,
    subscribers: Vec<mpsc::UnboundedSender<ProgressUpdate>>,
    last_sent: Option<(Instant, f64, TransferStatus)>,
    terminal: Option<ProgressUpdate>,
}

impl ProgressHub {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            speed: SpeedCalculator::default(),
            subscribers: Vec::new(),
            last_sent: None,
            terminal: None,
        }
    }

    /// Opens a subscription that starts with `current`.
    ///
    /// Once the task is terminal the stream holds only the terminal update.
    pub(crate) fn subscribe(&mut self, current: ProgressUpdate) -> ProgressStream {
        let (tx, rx) = mpsc::unbounded_channel();
        match &self.terminal {
            Some(terminal) => {
                let _ = tx.send(terminal.clone());
            }
            None => {
                let _ = tx.send(self.decorate(current));
                self.subscribers.push(tx);
            }
        }
        ProgressStream::new(rx)
    }

    /// Starts the speed window. Called when the task enters `in_progress`.
    pub(crate) fn start(&mut self) {
        self.speed.reset();
        self.speed.add_sample(0);
    }

    pub(crate) fn record_bytes(&mut self, bytes: u64) {
        self.speed.add_sample(bytes);
    }

    /// Broadcasts `update` unless throttled. Terminal updates are routed to
    /// [`finish`](Self::finish).
    pub(crate) fn publish(&mut self, update: ProgressUpdate) {
        if self.terminal.is_some() {
            return;
        }
        if update.is_terminal() {
            self.finish(update);
            return;
        }

        let now = Instant::now();
        if !self.should_emit(&update, now) {
            return;
        }
        let update = self.decorate(update);
        self.last_sent = Some((now, update.percent, update.status));
        self.subscribers.retain(|tx| tx.send(update.clone()).is_ok());
    }

    /// Delivers the terminal update and closes every subscription.
    pub(crate) fn finish(&mut self, update: ProgressUpdate) {
        if self.terminal.is_some() {
            return;
        }
        let mut update = self.decorate(update);
        update.eta = (update.status == TransferStatus::Completed).then_some(Duration::ZERO);
        for tx in self.subscribers.drain(..) {
            let _ = tx.send(update.clone());
        }
        self.terminal = Some(update);
    }

    fn should_emit(&self, update: &ProgressUpdate, now: Instant) -> bool {
        let Some((at, percent, status)) = self.last_sent else {
            return true;
        };
        status != update.status
            || now.duration_since(at) >= self.interval
            || update.percent - percent >= MIN_PERCENT_DELTA
            || (update.percent >= 100.0 && percent < 100.0)
    }

    fn decorate(&self, mut update: ProgressUpdate) -> ProgressUpdate {
        update.bytes_per_second = self.speed.bytes_per_second();
        update.eta = self
            .speed
            .eta(update.total_size.saturating_sub(update.bytes_transferred));
        update
    }
}

/// Lazy, finite stream of progress updates for one task.
///
/// Yields the snapshot current at subscription time, then throttled
/// updates, then exactly one terminal update, then ends. It cannot be
/// restarted; subscribe again for a fresh stream.
pub struct ProgressStream {
    rx: mpsc::UnboundedReceiver<ProgressUpdate>,
    finished: bool,
}

impl ProgressStream {
    fn new(rx: mpsc::UnboundedReceiver<ProgressUpdate>) -> Self {
        Self {
            rx,
            finished: false,
        }
    }
}

impl Stream for ProgressStream {
    type Item = ProgressUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(update)) => {
                if update.is_terminal() {
                    self.finished = true;
                }
                Poll::Ready(Some(update))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use sharevault_protocol::TaskId;

    fn update(status: TransferStatus, transferred: u64) -> ProgressUpdate {
        ProgressUpdate {
            task_id: TaskId(1),
            status,
            bytes_transferred: transferred,
            total_size: 1000,
            percent: transferred as f64 / 10.0,
            bytes_per_second: 0.0,
            eta: None,
            error: String::new(),
        }
    }

    #[test]
    fn speed_calculator_no_samples() {
        let calc = SpeedCalculator::new(None, None);
        assert_eq!(calc.bytes_per_second(), 0.0);
        assert!(calc.eta(1000).is_none());
    }

    #[test]
    fn speed_calculator_single_sample() {
        let mut calc = SpeedCalculator::new(None, None);
        calc.add_sample(100);
        assert_eq!(calc.bytes_per_second(), 0.0);
    }

    #[test]
    fn speed_calculator_known_rate() {
        let mut calc = SpeedCalculator::new(Some(Duration::from_secs(10)), None);
        let t0 = Instant::now();
        calc.add_sample_at(0, t0);
        calc.add_sample_at(500, t0 + Duration::from_millis(500));
        calc.add_sample_at(500, t0 + Duration::from_secs(1));

        assert!((calc.bytes_per_second() - 1000.0).abs() < 1e-6);
        let eta = calc.eta(2000).unwrap();
        assert!((eta.as_secs_f64() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn speed_calculator_window_prunes_old_samples() {
        let mut calc = SpeedCalculator::new(Some(Duration::from_secs(1)), None);
        let t0 = Instant::now();
        calc.add_sample_at(1_000_000, t0);
        calc.add_sample_at(100, t0 + Duration::from_secs(5));
        calc.add_sample_at(100, t0 + Duration::from_millis(5500));
        assert!((calc.bytes_per_second() - 200.0).abs() < 1e-6);
    }

    #[test]
    fn speed_calculator_max_samples() {
        let mut calc = SpeedCalculator::new(Some(Duration::from_secs(60)), Some(5));
        for i in 0..20 {
            calc.add_sample(i * 10);
        }
        assert!(calc.samples.len() <= 5);
    }

    #[test]
    fn speed_calculator_reset() {
        let mut calc = SpeedCalculator::new(None, None);
        calc.add_sample(100);
        calc.add_sample(200);
        calc.reset();
        assert_eq!(calc.bytes_per_second(), 0.0);
    }

    #[tokio::test]
    async fn subscription_starts_with_current_snapshot() {
        let mut hub = ProgressHub::new(Duration::from_secs(60));
        let mut stream = hub.subscribe(update(TransferStatus::Pending, 0));
        let first = stream.next().await.unwrap();
        assert_eq!(first.status, TransferStatus::Pending);
    }

    #[tokio::test]
    async fn throttle_drops_small_updates_but_never_terminal() {
        let mut hub = ProgressHub::new(Duration::from_secs(60));
        let mut stream = hub.subscribe(update(TransferStatus::InProgress, 0));

        hub.publish(update(TransferStatus::InProgress, 0));
        // Below both the time and the percent threshold.
        hub.publish(update(TransferStatus::InProgress, 5));
        hub.publish(update(TransferStatus::InProgress, 10));
        // 3% since the last emitted update.
        hub.publish(update(TransferStatus::InProgress, 30));
        hub.publish(update(TransferStatus::Completed, 1000));
        hub.publish(update(TransferStatus::InProgress, 999));

        let seen: Vec<_> = stream.by_ref().collect().await;
        let transferred: Vec<u64> = seen.iter().map(|u| u.bytes_transferred).collect();
        assert_eq!(transferred, vec![0, 0, 30, 1000]);
        assert_eq!(seen.last().unwrap().status, TransferStatus::Completed);
        assert_eq!(seen.last().unwrap().eta, Some(Duration::ZERO));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn status_change_bypasses_throttle() {
        let mut hub = ProgressHub::new(Duration::from_secs(60));
        let mut stream = hub.subscribe(update(TransferStatus::Pending, 0));
        hub.publish(update(TransferStatus::Pending, 0));
        hub.publish(update(TransferStatus::InProgress, 0));
        hub.finish(update(TransferStatus::Cancelled, 0));

        let statuses: Vec<_> = stream.by_ref().map(|u| u.status).collect().await;
        assert_eq!(
            statuses,
            vec![
                TransferStatus::Pending,
                TransferStatus::Pending,
                TransferStatus::InProgress,
                TransferStatus::Cancelled
            ]
        );
    }

    #[tokio::test]
    async fn late_subscriber_gets_only_terminal() {
        let mut hub = ProgressHub::new(Duration::from_millis(1));
        hub.finish(update(TransferStatus::Failed, 10));

        let mut stream = hub.subscribe(update(TransferStatus::InProgress, 10));
        let only = stream.next().await.unwrap();
        assert_eq!(only.status, TransferStatus::Failed);
        assert!(only.eta.is_none());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn terminal_delivered_once_to_every_subscriber() {
        let mut hub = ProgressHub::new(Duration::from_millis(1));
        let a = hub.subscribe(update(TransferStatus::InProgress, 0));
        let b = hub.subscribe(update(TransferStatus::InProgress, 0));
        hub.finish(update(TransferStatus::Completed, 1000));
        hub.finish(update(TransferStatus::Failed, 1000));

        for stream in [a, b] {
            let seen: Vec<_> = stream.collect().await;
            let terminal: Vec<_> = seen.iter().filter(|u| u.is_terminal()).collect();
            assert_eq!(terminal.len(), 1);
            assert_eq!(terminal[0].status, TransferStatus::Completed);
        }
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let mut hub = ProgressHub::new(Duration::ZERO);
        let stream = hub.subscribe(update(TransferStatus::InProgress, 0));
        drop(stream);
        hub.publish(update(TransferStatus::InProgress, 100));
        assert!(hub.subscribers.is_empty());
    }
}
