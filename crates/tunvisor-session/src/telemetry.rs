//! Throughput Telemetry
//!
//! While a session is running, a background task samples cumulative byte
//! counters of tunnel-like interfaces, turns them into a rate and
//! publishes a short text such as `↑ 12 KB/s  ↓ 3 MB/s`.
//!
//! # Sampling rules
//! - The first sample only records a baseline; the cached text is returned.
//! - A non-positive elapsed time is treated as one second.
//! - Samples closer than `min_interval` return the cached text unchanged.
//! - A counter that went backwards (reset) contributes zero.

use crate::config::TelemetrySettings;
use crate::status::StatusDispatcher;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::Networks;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Text shown before any rate is known
pub const PLACEHOLDER: &str = "—";

/// Cumulative byte counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Instantaneous rate in bytes per second
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rate {
    pub in_bps: f64,
    pub out_bps: f64,
}

impl Rate {
    /// `↑ {out}  ↓ {in}`
    pub fn to_text(&self) -> String {
        format!(
            "↑ {}  ↓ {}",
            format_bytes_per_sec(self.out_bps as u64),
            format_bytes_per_sec(self.in_bps as u64)
        )
    }
}

/// Binary units with integer division
pub fn format_bytes_per_sec(bps: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    match bps {
        b if b >= GB => format!("{} GB/s", b / GB),
        b if b >= MB => format!("{} MB/s", b / MB),
        b if b >= KB => format!("{} KB/s", b / KB),
        b => format!("{b} B/s"),
    }
}

/// Turns counter samples into a smoothed rate and its text
#[derive(Debug, Clone)]
pub struct RateMeter {
    alpha: f64,
    min_interval: Duration,
    baseline: Option<(Counters, Instant)>,
    rate: Option<Rate>,
    text: String,
}

impl RateMeter {
    /// `alpha` is clamped to [0, 1]; 0 disables smoothing
    pub fn new(alpha: f64, min_interval: Duration) -> Self {
        let alpha = if alpha.is_nan() { 0.0 } else { alpha.clamp(0.0, 1.0) };
        Self {
            alpha,
            min_interval,
            baseline: None,
            rate: None,
            text: PLACEHOLDER.to_string(),
        }
    }

    pub fn from_settings(settings: &TelemetrySettings) -> Self {
        Self::new(settings.ema_alpha, settings.min_interval())
    }

    /// Feed cumulative counters taken at `now` and return the current text
    pub fn sample(&mut self, totals: Counters, now: Instant) -> &str {
        let Some((last, at)) = self.baseline else {
            self.baseline = Some((totals, now));
            return &self.text;
        };

        let elapsed = match now.checked_duration_since(at) {
            Some(d) if !d.is_zero() => d,
            _ => Duration::from_secs(1),
        };
        if elapsed < self.min_interval {
            return &self.text;
        }

        let seconds = elapsed.as_secs_f64();
        let mut rate = Rate {
            in_bps: totals.rx_bytes.saturating_sub(last.rx_bytes) as f64 / seconds,
            out_bps: totals.tx_bytes.saturating_sub(last.tx_bytes) as f64 / seconds,
        };
        if self.alpha > 0.0 {
            if let Some(prev) = self.rate {
                rate.in_bps = prev.in_bps + self.alpha * (rate.in_bps - prev.in_bps);
                rate.out_bps = prev.out_bps + self.alpha * (rate.out_bps - prev.out_bps);
            }
        }

        self.baseline = Some((totals, now));
        self.rate = Some(rate);
        self.text = rate.to_text();
        &self.text
    }

    pub fn last_rate(&self) -> Option<Rate> {
        self.rate
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Shared telemetry snapshot, written by the sampler only
#[derive(Debug, Clone)]
pub struct SessionTelemetry {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub last_sample: Option<Instant>,
    pub rate: Option<Rate>,
    pub text: String,
}

impl Default for SessionTelemetry {
    fn default() -> Self {
        Self {
            rx_bytes: 0,
            tx_bytes: 0,
            last_sample: None,
            rate: None,
            text: PLACEHOLDER.to_string(),
        }
    }
}

/// Source of cumulative byte counters
pub trait CounterSource: Send {
    fn totals(&mut self) -> Counters;
}

/// Counters of tunnel-like interfaces as reported by the OS.
///
/// Falls back to all non-loopback interfaces if nothing matches.
pub struct InterfaceCounters {
    networks: Networks,
    keywords: Vec<String>,
    interface: Option<String>,
}

impl InterfaceCounters {
    pub fn new(settings: &TelemetrySettings, interface: Option<String>) -> Self {
        Self {
            networks: Networks::new_with_refreshed_list(),
            keywords: settings.keywords.iter().map(|k| k.to_lowercase()).collect(),
            interface,
        }
    }

    fn is_tunnel(&self, name: &str) -> bool {
        if self.interface.as_deref() == Some(name) {
            return true;
        }
        let name = name.to_lowercase();
        self.keywords.iter().any(|k| name.contains(k.as_str()))
    }
}

fn is_loopback(name: &str) -> bool {
    name == "lo" || name.to_lowercase().contains("loopback")
}

impl CounterSource for InterfaceCounters {
    fn totals(&mut self) -> Counters {
        self.networks.refresh(true);

        let mut tunnel = Counters::default();
        let mut other = Counters::default();
        let mut matched = false;
        for (name, data) in self.networks.list() {
            let bucket = if self.is_tunnel(name) {
                matched = true;
                &mut tunnel
            } else if !is_loopback(name) {
                &mut other
            } else {
                continue;
            };
            bucket.rx_bytes = bucket.rx_bytes.saturating_add(data.total_received());
            bucket.tx_bytes = bucket.tx_bytes.saturating_add(data.total_transmitted());
        }

        if matched { tunnel } else { other }
    }
}

/// Background sampling loop
pub struct TelemetrySampler;

impl TelemetrySampler {
    /// Sample every `interval` until `token` is cancelled.
    ///
    /// The dispatcher only hears about text that differs from the last one sent.
    pub fn spawn(
        mut source: Box<dyn CounterSource>,
        mut meter: RateMeter,
        interval: Duration,
        shared: Arc<RwLock<SessionTelemetry>>,
        dispatcher: StatusDispatcher,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_sent = meter.text().to_string();

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Telemetry sampler cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        let totals = source.totals();
                        let now = Instant::now();
                        let text = meter.sample(totals, now).to_string();

                        {
                            let mut snapshot = shared.write().await;
                            snapshot.rx_bytes = totals.rx_bytes;
                            snapshot.tx_bytes = totals.tx_bytes;
                            snapshot.last_sample = Some(now);
                            snapshot.rate = meter.last_rate();
                            snapshot.text = text.clone();
                        }

                        if text != last_sent {
                            dispatcher.telemetry(text.clone());
                            last_sent = text;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{SessionState, StatusSink};
    use std::sync::Mutex;

    fn counters(rx_bytes: u64, tx_bytes: u64) -> Counters {
        Counters { rx_bytes, tx_bytes }
    }

    #[test]
    fn test_format_bytes_per_sec() {
        assert_eq!(format_bytes_per_sec(0), "0 B/s");
        assert_eq!(format_bytes_per_sec(1023), "1023 B/s");
        assert_eq!(format_bytes_per_sec(1024), "1 KB/s");
        assert_eq!(format_bytes_per_sec(5 * 1024 * 1024 + 1), "5 MB/s");
        assert_eq!(format_bytes_per_sec(3 * 1024 * 1024 * 1024), "3 GB/s");
    }

    #[test]
    fn test_first_sample_returns_cached_text() {
        let mut meter = RateMeter::new(0.0, Duration::from_millis(500));
        assert_eq!(meter.sample(counters(1000, 500), Instant::now()), PLACEHOLDER);
        assert_eq!(meter.last_rate(), None);
    }

    #[test]
    fn test_rate_from_delta() {
        let mut meter = RateMeter::new(0.0, Duration::from_millis(500));
        let t0 = Instant::now();
        meter.sample(counters(1000, 500), t0);
        let text = meter.sample(counters(1500, 500), t0 + Duration::from_secs(1)).to_string();

        let rate = meter.last_rate().unwrap();
        assert_eq!(rate.in_bps, 500.0);
        assert_eq!(rate.out_bps, 0.0);
        assert_eq!(text, "↑ 0 B/s  ↓ 500 B/s");
    }

    #[test]
    fn test_counter_reset_clamps_to_zero() {
        let mut meter = RateMeter::new(0.0, Duration::from_millis(500));
        let t0 = Instant::now();
        meter.sample(counters(5000, 5000), t0);
        meter.sample(counters(100, 6024), t0 + Duration::from_secs(1));

        let rate = meter.last_rate().unwrap();
        assert_eq!(rate.in_bps, 0.0);
        assert_eq!(rate.out_bps, 1024.0);
    }

    #[test]
    fn test_too_frequent_sample_keeps_cached_value() {
        let mut meter = RateMeter::new(0.0, Duration::from_millis(500));
        let t0 = Instant::now();
        meter.sample(counters(0, 0), t0);
        meter.sample(counters(2048, 0), t0 + Duration::from_secs(1));
        let before = meter.text().to_string();

        let text = meter.sample(counters(999_999, 0), t0 + Duration::from_millis(1100));
        assert_eq!(text, before);
    }

    #[test]
    fn test_non_positive_elapsed_floors_to_one_second() {
        let mut meter = RateMeter::new(0.0, Duration::from_millis(500));
        let t0 = Instant::now() + Duration::from_secs(10);
        meter.sample(counters(0, 0), t0);
        // Earlier than the baseline
        meter.sample(counters(300, 0), t0 - Duration::from_secs(5));
        assert_eq!(meter.last_rate().unwrap().in_bps, 300.0);
    }

    #[test]
    fn test_ema_smoothing() {
        let mut meter = RateMeter::new(0.5, Duration::from_millis(500));
        let t0 = Instant::now();
        meter.sample(counters(0, 0), t0);
        meter.sample(counters(1000, 0), t0 + Duration::from_secs(1));
        meter.sample(counters(1000, 0), t0 + Duration::from_secs(2));

        // 1000 then 0, smoothed halfway
        assert_eq!(meter.last_rate().unwrap().in_bps, 500.0);
    }

    #[test]
    fn test_alpha_is_clamped() {
        let mut meter = RateMeter::new(7.0, Duration::ZERO);
        let t0 = Instant::now();
        meter.sample(counters(0, 0), t0);
        meter.sample(counters(1000, 0), t0 + Duration::from_secs(1));
        meter.sample(counters(3000, 0), t0 + Duration::from_secs(2));

        // alpha = 1 follows the raw rate exactly
        assert_eq!(meter.last_rate().unwrap().in_bps, 2000.0);
    }

    struct Ramp {
        step: u64,
        rx: u64,
    }

    impl CounterSource for Ramp {
        fn totals(&mut self) -> Counters {
            self.rx += self.step;
            counters(self.rx, 0)
        }
    }

    #[derive(Default)]
    struct Texts(Mutex<Vec<String>>);

    impl StatusSink for Texts {
        fn on_state_changed(&self, _state: SessionState) {}
        fn on_telemetry(&self, rate_text: &str) {
            self.0.lock().unwrap().push(rate_text.to_string());
        }
    }

    #[tokio::test]
    async fn test_sampler_publishes_and_stops() {
        let sink = Arc::new(Texts::default());
        let dispatcher = StatusDispatcher::spawn(sink.clone());
        let shared = Arc::new(RwLock::new(SessionTelemetry::default()));
        let token = CancellationToken::new();

        let handle = TelemetrySampler::spawn(
            Box::new(Ramp { step: 4096, rx: 0 }),
            RateMeter::new(0.0, Duration::ZERO),
            Duration::from_millis(20),
            shared.clone(),
            dispatcher,
            token.clone(),
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        let snapshot = shared.read().await.clone();
        assert!(snapshot.rx_bytes > 0);
        assert!(snapshot.last_sample.is_some());
        assert!(snapshot.text.starts_with("↑ 0 B/s"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let texts = sink.0.lock().unwrap();
        assert!(!texts.is_empty());
        assert!(texts.iter().all(|t| t != PLACEHOLDER));
    }
}
