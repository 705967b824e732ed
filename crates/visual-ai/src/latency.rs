//! Per-provider rolling latency window.
//!
//! Observability only: routing and verdicts never read it.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

use crate::types::ProviderId;

/// Samples kept per provider.
pub const LATENCY_WINDOW: usize = 100;

/// Shared, append-only record of recent request latencies.
///
/// Appends are atomic under an internal lock; readers get a copy that may
/// already be stale by the time they look at it.
#[derive(Debug)]
pub struct LatencyRecorder {
    capacity: usize,
    windows: Mutex<HashMap<ProviderId, VecDeque<Duration>>>,
}

/// A point-in-time view of one provider's window.
#[derive(Debug, Clone, Serialize)]
pub struct LatencySummary {
    pub provider: ProviderId,
    pub observations: usize,
    pub avg_ms: f64,
}

impl Default for LatencyRecorder {
    fn default() -> Self {
        Self::new(LATENCY_WINDOW)
    }
}

impl LatencyRecorder {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ProviderId, VecDeque<Duration>>> {
        // Poisoning cannot leave a window half-written.
        self.windows.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a sample, dropping the oldest once the window is full.
    pub fn record(&self, provider: ProviderId, elapsed: Duration) {
        let mut windows = self.lock();
        let window = windows.entry(provider).or_default();
        window.push_back(elapsed);
        while window.len() > self.capacity {
            window.pop_front();
        }
    }

    pub fn samples(&self, provider: ProviderId) -> Vec<Duration> {
        self.lock()
            .get(&provider)
            .map(|w| w.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Mean of the current window, or `None` with no samples yet.
    pub fn average(&self, provider: ProviderId) -> Option<Duration> {
        let windows = self.lock();
        let window = windows.get(&provider).filter(|w| !w.is_empty())?;
        let total: Duration = window.iter().sum();
        Some(total / window.len() as u32)
    }

    pub fn summary(&self, provider: ProviderId) -> LatencySummary {
        let samples = self.samples(provider);
        let avg_ms = if samples.is_empty() {
            0.0
        } else {
            samples.iter().map(|d| d.as_secs_f64() * 1000.0).sum::<f64>() / samples.len() as f64
        };
        LatencySummary {
            provider,
            observations: samples.len(),
            avg_ms,
        }
    }

    /// Summaries for every provider with at least one sample, by id.
    pub fn snapshot(&self) -> Vec<LatencySummary> {
        let mut ids: Vec<ProviderId> = self.lock().keys().copied().collect();
        ids.sort();
        ids.into_iter().map(|id| self.summary(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_empty_window() {
        let rec = LatencyRecorder::default();
        assert!(rec.average(ProviderId::Dinov2).is_none());
        assert_eq!(rec.summary(ProviderId::Dinov2).observations, 0);
    }

    #[test]
    fn test_window_truncates_to_capacity() {
        let rec = LatencyRecorder::default();
        for ms in 0..150u64 {
            rec.record(ProviderId::Vjepa2, Duration::from_millis(ms));
        }
        let samples = rec.samples(ProviderId::Vjepa2);
        assert_eq!(samples.len(), LATENCY_WINDOW);
        assert_eq!(samples[0], Duration::from_millis(50));
        assert_eq!(samples[99], Duration::from_millis(149));
    }

    #[test]
    fn test_average() {
        let rec = LatencyRecorder::new(4);
        rec.record(ProviderId::Siglip, Duration::from_millis(10));
        rec.record(ProviderId::Siglip, Duration::from_millis(30));
        assert_eq!(rec.average(ProviderId::Siglip), Some(Duration::from_millis(20)));
        assert!((rec.summary(ProviderId::Siglip).avg_ms - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_snapshot_lists_recorded_providers() {
        let rec = LatencyRecorder::default();
        rec.record(ProviderId::Siglip, Duration::from_millis(4));
        rec.record(ProviderId::Dinov2, Duration::from_millis(2));
        let ids: Vec<_> = rec.snapshot().iter().map(|s| s.provider).collect();
        assert_eq!(ids, vec![ProviderId::Dinov2, ProviderId::Siglip]);
    }

    #[test]
    fn test_concurrent_appends_are_not_lost() {
        let rec = Arc::new(LatencyRecorder::new(10_000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let rec = Arc::clone(&rec);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        rec.record(ProviderId::Dinov2, Duration::from_micros(5));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(rec.samples(ProviderId::Dinov2).len(), 2000);
    }
}
