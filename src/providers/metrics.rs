//! Per-provider request metrics and derived scores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ProviderStatus;

/// Smoothing factor of the rolling averages.
pub const EMA_ALPHA: f64 = 0.2;

/// Live request statistics, persisted with the provider record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderMetrics {
    pub total_requests: u64,
    pub success_requests: u64,
    pub failed_requests: u64,
    pub last_request_at: Option<DateTime<Utc>>,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    pub last_latency_ms: u64,
    pub avg_latency_ms: f64,
    /// Tokens per second, smoothed.
    pub avg_throughput: f64,
    pub total_tokens: u64,
    latency_samples: u64,
    throughput_samples: u64,
}

fn ema(avg: f64, sample: f64, seeded: bool) -> f64 {
    if seeded {
        (1.0 - EMA_ALPHA) * avg + EMA_ALPHA * sample
    } else {
        sample
    }
}

impl ProviderMetrics {
    pub fn record_success(&mut self, latency_ms: u64, tokens: u64) {
        self.total_requests += 1;
        self.success_requests += 1;
        self.observe_latency(latency_ms);
        if tokens > 0 {
            self.total_tokens += tokens;
            let secs = (latency_ms.max(1)) as f64 / 1000.0;
            let throughput = tokens as f64 / secs;
            self.avg_throughput = ema(self.avg_throughput, throughput, self.throughput_samples > 0);
            self.throughput_samples += 1;
        }
    }

    pub fn record_failure(&mut self, latency_ms: u64) {
        self.total_requests += 1;
        self.failed_requests += 1;
        self.observe_latency(latency_ms);
    }

    fn observe_latency(&mut self, latency_ms: u64) {
        self.last_request_at = Some(Utc::now());
        self.last_latency_ms = latency_ms;
        if self.latency_samples == 0 {
            self.min_latency_ms = latency_ms;
            self.max_latency_ms = latency_ms;
        } else {
            self.min_latency_ms = self.min_latency_ms.min(latency_ms);
            self.max_latency_ms = self.max_latency_ms.max(latency_ms);
        }
        self.avg_latency_ms = ema(self.avg_latency_ms, latency_ms as f64, self.latency_samples > 0);
        self.latency_samples += 1;
    }

    /// Fraction of successful requests; zero before any request.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.success_requests as f64 / self.total_requests as f64
        }
    }

    pub fn availability_score(&self, status: ProviderStatus) -> f64 {
        status.health_score() * self.success_rate()
    }

    pub fn latency_score(&self) -> f64 {
        (100.0 / (1.0 + self.avg_latency_ms / 1000.0)).min(100.0)
    }

    pub fn throughput_score(&self) -> f64 {
        self.avg_throughput.min(100.0)
    }

    pub fn performance_score(&self) -> f64 {
        0.7 * self.latency_score() + 0.3 * self.throughput_score()
    }

    pub fn overall_score(&self, status: ProviderStatus) -> f64 {
        0.6 * self.availability_score(status) + 0.4 * self.performance_score()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_seeds_average() {
        let mut m = ProviderMetrics::default();
        m.record_success(1000, 50);
        assert_eq!(m.avg_latency_ms, 1000.0);
        assert_eq!(m.avg_throughput, 50.0);
        assert_eq!(m.min_latency_ms, 1000);
        assert_eq!(m.max_latency_ms, 1000);
        assert!(m.last_request_at.is_some());
    }

    #[test]
    fn test_ema_update() {
        let mut m = ProviderMetrics::default();
        m.record_success(1000, 0);
        m.record_success(2000, 0);
        assert!((m.avg_latency_ms - 1200.0).abs() < 1e-9);
        assert_eq!(m.min_latency_ms, 1000);
        assert_eq!(m.max_latency_ms, 2000);
        assert_eq!(m.last_latency_ms, 2000);
        assert_eq!(m.avg_throughput, 0.0);
    }

    #[test]
    fn test_derived_scores() {
        let mut m = ProviderMetrics::default();
        m.record_success(1000, 100);
        m.record_failure(1000);
        assert_eq!(m.total_requests, 2);
        assert_eq!(m.failed_requests, 1);
        assert_eq!(m.success_rate(), 0.5);
        assert_eq!(m.availability_score(ProviderStatus::Healthy), 50.0);
        assert_eq!(m.availability_score(ProviderStatus::Failed), 0.0);
        assert_eq!(m.availability_score(ProviderStatus::Disabled), 12.5);
        assert_eq!(m.latency_score(), 50.0);
        assert_eq!(m.throughput_score(), 100.0);
        assert!((m.performance_score() - 65.0).abs() < 1e-9);
        assert!((m.overall_score(ProviderStatus::Healthy) - 56.0).abs() < 1e-9);
    }

    #[test]
    fn test_metrics_survive_json() {
        let mut m = ProviderMetrics::default();
        m.record_success(250, 10);
        let raw = serde_json::to_string(&m).unwrap();
        let back: ProviderMetrics = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, m);
        let empty: ProviderMetrics = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, ProviderMetrics::default());
    }
}
