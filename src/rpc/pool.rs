//! Per-shard endpoint statistics and selection.
//!
//! Each shard owns one pool; transports hold it behind an `Arc`. Counters are
//! heuristic and updated without coordination beyond a short mutex.

use std::sync::Mutex;
use std::time::Duration;

use super::RpcError;
use crate::types::ShardId;

const LOG_TARGET: &str = "shardex::rpc::pool";

/// A selected endpoint. Hand it back through [`EndpointPool::submit_statistic`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub index: usize,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EndpointStats {
    pub url: String,
    /// Moving average in milliseconds.
    pub response_time_ms: u64,
    pub failed_requests: u64,
    pub in_flight: u64,
    pub total_queries: u64,
}

impl EndpointStats {
    fn new(url: String) -> Self {
        Self {
            url,
            ..Default::default()
        }
    }
}

#[derive(Debug)]
pub struct EndpointPool {
    shard: ShardId,
    stats: Mutex<Vec<EndpointStats>>,
}

impl EndpointPool {
    pub fn new<I, S>(shard: ShardId, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let stats = urls
            .into_iter()
            .map(|url| EndpointStats::new(url.into()))
            .collect();
        Self {
            shard,
            stats: Mutex::new(stats),
        }
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn len(&self) -> usize {
        self.with_stats(|stats| stats.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pick the endpoint with the lowest score.
    ///
    /// Candidates are compared pairwise against the current best:
    /// `rt + 2*in_flight + 10*(failed - failed_best)` must be strictly below
    /// `rt_best + 2*in_flight_best`, so ties keep list order.
    pub fn select(&self) -> Result<Endpoint, RpcError> {
        self.with_stats(|stats| {
            if stats.is_empty() {
                return Err(RpcError::NoEndpoints(self.shard));
            }

            let mut best = 0;
            for (index, candidate) in stats.iter().enumerate().skip(1) {
                let current = &stats[best];
                let candidate_score = i128::from(candidate.response_time_ms)
                    + 2 * i128::from(candidate.in_flight)
                    + 10 * (i128::from(candidate.failed_requests)
                        - i128::from(current.failed_requests));
                let current_score =
                    i128::from(current.response_time_ms) + 2 * i128::from(current.in_flight);
                if candidate_score < current_score {
                    best = index;
                }
            }

            let chosen = &mut stats[best];
            chosen.in_flight = chosen.in_flight.saturating_add(1);
            chosen.total_queries = chosen.total_queries.saturating_add(1);

            tracing::trace!(
                target: LOG_TARGET,
                shard = self.shard,
                url = %chosen.url,
                in_flight = chosen.in_flight,
                "Selected endpoint"
            );

            Ok(Endpoint {
                index: best,
                url: chosen.url.clone(),
            })
        })
    }

    /// Record the outcome of a call made on `endpoint`.
    pub fn submit_statistic(&self, endpoint: &Endpoint, elapsed: Duration, failed: bool) {
        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.with_stats(|stats| {
            let Some(entry) = stats.get_mut(endpoint.index) else {
                return;
            };
            entry.in_flight = entry.in_flight.saturating_sub(1);
            entry.response_time_ms = entry.response_time_ms / 2 + elapsed_ms / 2
                + (entry.response_time_ms % 2 + elapsed_ms % 2) / 2;
            if failed {
                entry.failed_requests = if entry.failed_requests == u64::MAX {
                    0
                } else {
                    entry.failed_requests + 1
                };
                tracing::debug!(
                    target: LOG_TARGET,
                    shard = self.shard,
                    url = %entry.url,
                    failed_requests = entry.failed_requests,
                    "Endpoint call failed"
                );
            }
        });
    }

    /// Sum of failed-request counters across the pool.
    pub fn total_failed(&self) -> u64 {
        self.with_stats(|stats| {
            stats
                .iter()
                .fold(0u64, |acc, s| acc.wrapping_add(s.failed_requests))
        })
    }

    /// Clear in-flight counters. Called between loop iterations, when no
    /// request of the owning loop is pending.
    pub fn reset_in_flight(&self) {
        self.with_stats(|stats| {
            for entry in stats.iter_mut() {
                entry.in_flight = 0;
            }
        });
    }

    pub fn snapshot(&self) -> Vec<EndpointStats> {
        self.with_stats(|stats| stats.clone())
    }

    /// Overwrite an endpoint's moving average. Lets callers seed latencies.
    pub fn set_response_time(&self, index: usize, response_time_ms: u64) {
        self.with_stats(|stats| {
            if let Some(entry) = stats.get_mut(index) {
                entry.response_time_ms = response_time_ms;
            }
        });
    }

    fn with_stats<R>(&self, f: impl FnOnce(&mut Vec<EndpointStats>) -> R) -> R {
        // A poisoned lock only means another caller panicked mid-update; the
        // counters stay usable.
        let mut guard = match self.stats.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}
