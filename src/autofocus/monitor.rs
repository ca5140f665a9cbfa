//! Live brightness monitoring.
//!
//! [`BrightnessMonitor`] polls a [`BrightnessSource`] at a fixed cadence and
//! keeps the last good value. It never returns a read error to its owner: a
//! missing frame or an inactive acquisition is logged and the previous value
//! stays visible, so a flaky camera cannot take down the control loop.
//!
//! The monitor does not spawn anything. Its owner drives it, either by awaiting
//! [`BrightnessMonitor::tick`] or by waiting on [`BrightnessMonitor::due`] in a
//! `tokio::select!` next to a command channel and then calling
//! [`BrightnessMonitor::poll_once`].

use std::future::pending;
use std::sync::Arc;
use tokio::time::{interval, Duration, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::hardware::{BrightnessSource, MetricKind, SampleError};

/// Periodic, best-effort brightness reader.
pub struct BrightnessMonitor {
    source: Arc<dyn BrightnessSource>,
    poll_interval: Duration,
    channel: u32,
    metric: MetricKind,
    latest: Option<f64>,
    last_failure: Option<SampleError>,
    ticker: Option<Interval>,
}

impl BrightnessMonitor {
    /// Create a stopped monitor polling every `poll_interval` once started.
    pub fn new(source: Arc<dyn BrightnessSource>, poll_interval: Duration) -> Self {
        Self {
            source,
            poll_interval,
            channel: 1,
            metric: MetricKind::Mean,
            latest: None,
            last_failure: None,
            ticker: None,
        }
    }

    /// Start polling `channel` with `metric`.
    ///
    /// Calling this while already running only switches channel and metric.
    /// Returns `true` if polling was not running before.
    pub fn start(&mut self, channel: u32, metric: MetricKind) -> bool {
        self.channel = channel;
        self.metric = metric;

        if self.ticker.is_some() {
            debug!(channel, %metric, "Monitor already running, updated selection");
            return false;
        }

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);
        info!(channel, %metric, interval = ?self.poll_interval, "Brightness monitor started");
        true
    }

    /// Stop polling. No effect when already stopped.
    pub fn stop(&mut self) {
        if self.ticker.take().is_some() {
            info!("Brightness monitor stopped");
        }
    }

    /// Whether polling is active
    pub fn is_running(&self) -> bool {
        self.ticker.is_some()
    }

    /// Most recent successful reading
    pub fn latest(&self) -> Option<f64> {
        self.latest
    }

    /// Error from the most recent poll, cleared by the next success
    pub fn last_failure(&self) -> Option<&SampleError> {
        self.last_failure.as_ref()
    }

    /// Channel currently polled
    pub fn channel(&self) -> u32 {
        self.channel
    }

    /// Metric currently polled
    pub fn metric(&self) -> MetricKind {
        self.metric
    }

    /// Configured cadence
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Wait until the next poll is due.
    ///
    /// Never resolves while the monitor is stopped. Cancel-safe, so it can sit
    /// in a `select!` arm unconditionally; the read itself belongs outside the
    /// `select!` so it is never dropped half-way.
    pub async fn due(&mut self) {
        match self.ticker.as_mut() {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => pending::<()>().await,
        }
    }

    /// Wait for the next poll slot, then poll once.
    pub async fn tick(&mut self) -> Option<f64> {
        self.due().await;
        self.poll_once().await
    }

    /// Read the source once and update `latest`.
    ///
    /// Returns the new value, or `None` if the monitor is stopped or the read
    /// failed (in which case `latest` keeps its previous value).
    pub async fn poll_once(&mut self) -> Option<f64> {
        if !self.is_running() {
            return None;
        }

        match self
            .source
            .sample(self.channel, self.metric)
            .await
            .and_then(SampleError::check_finite)
        {
            Ok(value) => {
                self.latest = Some(value);
                self.last_failure = None;
                Some(value)
            }
            Err(err) => {
                warn!(
                    channel = self.channel,
                    metric = %self.metric,
                    error = %err,
                    "Brightness poll failed, keeping previous reading"
                );
                self.last_failure = Some(err);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{FocusProfile, MockBrightnessSource, MockStage};
    use tracing_test::traced_test;

    fn source_at(z: f64) -> Arc<MockBrightnessSource> {
        let stage = Arc::new(MockStage::with_position(z));
        Arc::new(MockBrightnessSource::new(
            stage,
            FocusProfile::Linear {
                focus_z: 0.0,
                peak: 50.0,
                slope: 2.0,
            },
        ))
    }

    #[tokio::test]
    async fn stopped_monitor_does_not_poll() {
        let source = source_at(0.0);
        let mut monitor = BrightnessMonitor::new(source.clone(), Duration::from_millis(10));

        assert_eq!(monitor.poll_once().await, None);
        assert_eq!(monitor.latest(), None);
        assert_eq!(source.call_count(), 0);
    }

    #[tokio::test]
    async fn start_is_idempotent_and_updates_selection() {
        let mut monitor = BrightnessMonitor::new(source_at(1.0), Duration::from_millis(10));

        assert!(monitor.start(1, MetricKind::Mean));
        assert!(!monitor.start(2, MetricKind::Max));
        assert!(monitor.is_running());
        assert_eq!(monitor.channel(), 2);
        assert_eq!(monitor.metric(), MetricKind::Max);
    }

    #[tokio::test]
    async fn stop_twice_is_harmless() {
        let mut monitor = BrightnessMonitor::new(source_at(1.0), Duration::from_millis(10));
        monitor.start(1, MetricKind::Mean);

        monitor.stop();
        monitor.stop();
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn tick_records_latest_value() {
        let mut monitor = BrightnessMonitor::new(source_at(5.0), Duration::from_millis(5));
        monitor.start(1, MetricKind::Mean);

        assert_eq!(monitor.tick().await, Some(40.0));
        assert_eq!(monitor.latest(), Some(40.0));
    }

    struct NanAfterFirst(std::sync::atomic::AtomicUsize);

    #[async_trait::async_trait]
    impl BrightnessSource for NanAfterFirst {
        async fn sample(&self, _channel: u32, _metric: MetricKind) -> Result<f64, SampleError> {
            let call = self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(if call == 0 { 25.0 } else { f64::NAN })
        }
    }

    #[tokio::test]
    async fn nan_reading_keeps_previous_value() {
        let source = Arc::new(NanAfterFirst(Default::default()));
        let mut monitor = BrightnessMonitor::new(source, Duration::from_millis(5));
        monitor.start(1, MetricKind::Mean);

        assert_eq!(monitor.poll_once().await, Some(25.0));
        assert_eq!(monitor.poll_once().await, None);
        assert_eq!(monitor.latest(), Some(25.0));
        assert_eq!(monitor.last_failure(), Some(&SampleError::NonFinite));
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_poll_keeps_previous_value() {
        let source = source_at(0.0);
        let mut monitor = BrightnessMonitor::new(source.clone(), Duration::from_millis(5));
        monitor.start(1, MetricKind::Mean);

        assert_eq!(monitor.poll_once().await, Some(50.0));

        source.set_active(false);
        assert_eq!(monitor.poll_once().await, None);
        assert_eq!(monitor.latest(), Some(50.0));
        assert_eq!(
            monitor.last_failure(),
            Some(&SampleError::AcquisitionInactive)
        );
        assert!(logs_contain("Brightness poll failed"));

        source.set_active(true);
        monitor.poll_once().await;
        assert!(monitor.last_failure().is_none());
    }
}
