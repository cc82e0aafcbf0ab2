//! Per-tenant message counters, flushed to the repository periodically.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    domain::{TenantId, TenantStatistics},
    ports::Repository,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub persisted: usize,
    pub failed: usize,
}

/// Counters live behind their own lock, independent of the subscription cache.
#[derive(Default)]
pub struct StatsAggregator {
    counters: Mutex<HashMap<TenantId, u64>>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn increment(&self, tenant: &TenantId) {
        let mut counters = self.counters.lock().await;
        *counters.entry(tenant.clone()).or_insert(0) += 1;
    }

    pub async fn count(&self, tenant: &TenantId) -> u64 {
        self.counters.lock().await.get(tenant).copied().unwrap_or(0)
    }

    /// Persist every non-zero counter.
    ///
    /// Counts are snapshotted under the lock, persisted without it, and only
    /// the persisted amount is subtracted afterwards: increments that land
    /// during the persist and counts whose persist failed carry over to the
    /// next flush.
    pub async fn flush(&self, repo: &dyn Repository) -> FlushReport {
        let snapshot: Vec<TenantStatistics> = {
            let counters = self.counters.lock().await;
            counters
                .iter()
                .filter(|(_, n)| **n > 0)
                .map(|(tenant, n)| TenantStatistics {
                    tenant: tenant.clone(),
                    messages: *n,
                })
                .collect()
        };

        let mut report = FlushReport::default();
        let mut persisted = Vec::with_capacity(snapshot.len());
        for stats in snapshot {
            match repo.persist_statistics(&stats).await {
                Ok(()) => persisted.push(stats),
                Err(e) => {
                    report.failed += 1;
                    warn!(tenant = %stats.tenant, messages = stats.messages, error = %e,
                        "unable to store statistics, keeping for next flush");
                }
            }
        }

        if !persisted.is_empty() {
            let mut counters = self.counters.lock().await;
            for stats in &persisted {
                if let Some(n) = counters.get_mut(&stats.tenant) {
                    *n = n.saturating_sub(stats.messages);
                }
            }
        }
        report.persisted = persisted.len();

        debug!(persisted = report.persisted, failed = report.failed, "statistics flushed");
        report
    }
}
