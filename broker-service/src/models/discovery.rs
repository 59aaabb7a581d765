//! Discovery attempt history and rolling statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::services::error::ErrorClass;

/// Terminal outcome of a discovery round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryStatus {
    Success,
    /// Graph replaced, but with warnings (e.g. grants now referencing
    /// removed fields).
    Partial,
    Error,
}

/// One entry of the bounded per-application discovery history.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DiscoveryRecord {
    pub timestamp: DateTime<Utc>,
    pub outcome: DiscoveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_version: Option<u64>,
}

/// Rolling statistics computed over the retained history window.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DiscoveryStats {
    pub client_id: String,
    pub attempts: usize,
    pub successes: usize,
    pub success_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub average_latency_ms: u64,
}

impl DiscoveryStats {
    pub fn from_history(client_id: &str, history: &[DiscoveryRecord]) -> Self {
        let attempts = history.len();
        let successes = history
            .iter()
            .filter(|r| matches!(r.outcome, DiscoveryStatus::Success | DiscoveryStatus::Partial))
            .count();
        let success_rate = if attempts == 0 {
            0.0
        } else {
            successes as f64 / attempts as f64
        };
        let last_success_at = history
            .iter()
            .filter(|r| matches!(r.outcome, DiscoveryStatus::Success | DiscoveryStatus::Partial))
            .map(|r| r.timestamp)
            .max();
        let last_error = history
            .iter()
            .rev()
            .find(|r| r.outcome == DiscoveryStatus::Error)
            .and_then(|r| r.message.clone());
        let average_latency_ms = if attempts == 0 {
            0
        } else {
            history.iter().map(|r| r.latency_ms).sum::<u64>() / attempts as u64
        };

        Self {
            client_id: client_id.to_string(),
            attempts,
            successes,
            success_rate,
            last_success_at,
            last_error,
            average_latency_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(outcome: DiscoveryStatus, latency_ms: u64) -> DiscoveryRecord {
        DiscoveryRecord {
            timestamp: Utc::now(),
            outcome,
            error_class: None,
            message: match outcome {
                DiscoveryStatus::Error => Some("boom".into()),
                _ => None,
            },
            latency_ms,
            graph_version: None,
        }
    }

    #[test]
    fn test_stats_over_empty_history() {
        let stats = DiscoveryStats::from_history("app_x", &[]);
        assert_eq!(stats.attempts, 0);
        assert_eq!(stats.success_rate, 0.0);
        assert!(stats.last_success_at.is_none());
    }

    #[test]
    fn test_stats_success_rate_counts_partial() {
        let history = vec![
            rec(DiscoveryStatus::Success, 10),
            rec(DiscoveryStatus::Partial, 20),
            rec(DiscoveryStatus::Error, 30),
            rec(DiscoveryStatus::Error, 40),
        ];
        let stats = DiscoveryStats::from_history("app_x", &history);
        assert_eq!(stats.attempts, 4);
        assert_eq!(stats.successes, 2);
        assert!((stats.success_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.average_latency_ms, 25);
        assert_eq!(stats.last_error.as_deref(), Some("boom"));
    }
}
