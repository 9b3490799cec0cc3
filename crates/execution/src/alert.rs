//! Alerting side channel for circuit-breaker transitions and worker silence.

use async_trait::async_trait;
use constellation_core::BreakerStatus;
use tracing::{info, warn};

use crate::health::WorkerHealthChange;
use crate::ledger::BreakerChange;

/// Receives breaker transitions and worker liveness changes, including
/// recoveries.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Report one breaker transition.
    async fn breaker_changed(&self, change: &BreakerChange);

    /// Report a worker going silent or coming back.
    async fn worker_health_changed(&self, change: &WorkerHealthChange);
}

/// Reports transitions through the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn breaker_changed(&self, change: &BreakerChange) {
        if change.to == BreakerStatus::Normal {
            info!(
                "Tier {} breaker recovered ({} -> normal)",
                change.tier, change.from
            );
        } else {
            warn!(
                "Tier {} breaker tripped: {} -> {} (drawdown {:.1}% from initial, {:.1}% from peak)",
                change.tier,
                change.from,
                change.to,
                change.drawdown_from_initial * 100.0,
                change.drawdown_from_peak * 100.0,
            );
        }
    }

    async fn worker_health_changed(&self, change: &WorkerHealthChange) {
        if change.silent {
            warn!(
                "Worker {} is silent: no result since notice at {}",
                change.worker,
                change.awaiting_since.map(|t| t.to_rfc3339()).unwrap_or_default()
            );
        } else {
            info!("Worker {} is reporting again", change.worker);
        }
    }
}
