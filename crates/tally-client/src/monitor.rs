use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::transport::TransportKind;

/// Below this WebSocket success rate the fallback chain leads with SSE.
const POOR_SUCCESS_RATE: f64 = 0.5;
/// Attempts needed before a per-transport rate is trusted.
const MIN_SAMPLES: usize = 3;
/// Gap between disconnects at which the connection counts as fully stable.
const STABLE_GAP: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Most records kept per log.
    pub window: usize,
    /// Records older than this are forgotten.
    pub max_age: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window: 50,
            max_age: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub at: Instant,
    pub kind: TransportKind,
    pub success: bool,
}

#[derive(Debug, Clone)]
pub struct DisconnectRecord {
    pub at: Instant,
    pub kind: TransportKind,
    pub reason: String,
    pub connected_for: Duration,
}

/// Point-in-time summary for callers.
#[derive(Debug, Clone, PartialEq)]
pub struct StabilitySnapshot {
    pub attempts: usize,
    pub disconnects: usize,
    pub success_rate: f64,
    pub mean_time_between_disconnects: Option<Duration>,
    pub stability_score: f64,
}

#[derive(Default)]
struct Logs {
    attempts: VecDeque<AttemptRecord>,
    disconnects: VecDeque<DisconnectRecord>,
}

/// Passive log of connection attempts and disconnects over a bounded
/// window. Recording never blocks on anything but its own short lock.
pub struct StabilityMonitor {
    config: MonitorConfig,
    logs: Mutex<Logs>,
}

fn prune<T>(log: &mut VecDeque<T>, at: impl Fn(&T) -> Instant, config: &MonitorConfig, now: Instant) {
    while log.len() > config.window {
        log.pop_front();
    }
    while log
        .front()
        .is_some_and(|record| now.duration_since(at(record)) > config.max_age)
    {
        log.pop_front();
    }
}

impl StabilityMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            logs: Mutex::new(Logs::default()),
        }
    }

    fn logs(&self) -> std::sync::MutexGuard<'_, Logs> {
        let now = Instant::now();
        let mut logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        prune(&mut logs.attempts, |r| r.at, &self.config, now);
        prune(&mut logs.disconnects, |r| r.at, &self.config, now);
        logs
    }

    pub fn record_attempt(&self, kind: TransportKind, success: bool) {
        let mut logs = self.logs();
        logs.attempts.push_back(AttemptRecord {
            at: Instant::now(),
            kind,
            success,
        });
        prune(&mut logs.attempts, |r| r.at, &self.config, Instant::now());
    }

    pub fn record_disconnect(&self, kind: TransportKind, reason: &str, connected_for: Duration) {
        let mut logs = self.logs();
        logs.disconnects.push_back(DisconnectRecord {
            at: Instant::now(),
            kind,
            reason: reason.to_string(),
            connected_for,
        });
        prune(&mut logs.disconnects, |r| r.at, &self.config, Instant::now());
    }

    /// Share of attempts that connected. 1.0 with no history.
    pub fn success_rate(&self) -> f64 {
        rate(self.logs().attempts.iter())
    }

    /// Success rate of one transport, if there are enough samples to judge.
    pub fn kind_success_rate(&self, kind: TransportKind) -> Option<f64> {
        let logs = self.logs();
        let samples: Vec<&AttemptRecord> = logs.attempts.iter().filter(|r| r.kind == kind).collect();
        (samples.len() >= MIN_SAMPLES).then(|| rate(samples.into_iter()))
    }

    pub fn mean_time_between_disconnects(&self) -> Option<Duration> {
        let logs = self.logs();
        let times: Vec<Instant> = logs.disconnects.iter().map(|r| r.at).collect();
        if times.len() < 2 {
            return None;
        }
        let span = times[times.len() - 1].duration_since(times[0]);
        Some(span / (times.len() as u32 - 1))
    }

    /// 0..=1, blending attempt success with how often connections drop.
    pub fn stability_score(&self) -> f64 {
        let success = self.success_rate();
        let disconnects = self.logs().disconnects.len();
        let steadiness = match (disconnects, self.mean_time_between_disconnects()) {
            (0, _) => 1.0,
            (_, Some(gap)) => (gap.as_secs_f64() / STABLE_GAP.as_secs_f64()).min(1.0),
            (_, None) => 0.75,
        };
        (0.6 * success + 0.4 * steadiness).clamp(0.0, 1.0)
    }

    /// Heartbeat cadence for the current stability: `base` when stable,
    /// down to half of it when not.
    pub fn recommended_heartbeat(&self, base: Duration) -> Duration {
        base.mul_f64(0.5 + 0.5 * self.stability_score())
    }

    /// The configured chain, with SSE moved ahead of a WebSocket that keeps failing.
    pub fn preferred_order(&self, configured: &[TransportKind]) -> Vec<TransportKind> {
        let mut order = configured.to_vec();
        let websocket_poor = self
            .kind_success_rate(TransportKind::WebSocket)
            .is_some_and(|rate| rate < POOR_SUCCESS_RATE);
        let ws = order.iter().position(|k| *k == TransportKind::WebSocket);
        let sse = order.iter().position(|k| *k == TransportKind::Sse);
        if let (true, Some(ws), Some(sse)) = (websocket_poor, ws, sse) {
            if sse > ws {
                order.swap(ws, sse);
            }
        }
        order
    }

    pub fn disconnects(&self) -> Vec<DisconnectRecord> {
        self.logs().disconnects.iter().cloned().collect()
    }

    pub fn snapshot(&self) -> StabilitySnapshot {
        let (attempts, disconnects) = {
            let logs = self.logs();
            (logs.attempts.len(), logs.disconnects.len())
        };
        StabilitySnapshot {
            attempts,
            disconnects,
            success_rate: self.success_rate(),
            mean_time_between_disconnects: self.mean_time_between_disconnects(),
            stability_score: self.stability_score(),
        }
    }
}

fn rate<'a>(records: impl Iterator<Item = &'a AttemptRecord>) -> f64 {
    let (total, ok) = records.fold((0usize, 0usize), |(total, ok), r| (total + 1, ok + r.success as usize));
    if total == 0 { 1.0 } else { ok as f64 / total as f64 }
}
