//! Per-endpoint circuit breaker.
//!
//! Closed counts consecutive retryable failures. Reaching the threshold opens
//! the circuit; while Open every call fails fast until the cool-down elapses.
//! The first caller after the cool-down becomes the single HalfOpen probe and
//! its outcome decides between Closed and Open again.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitSnapshot {
    pub status: CircuitStatus,
    pub failure_count: u32,
    pub opened_at: Option<Instant>,
}

#[derive(Debug)]
struct CircuitState {
    status: CircuitStatus,
    failure_count: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    endpoint: String,
    threshold: u32,
    cooldown: Duration,
    state: Arc<Mutex<CircuitState>>,
}

fn lock(state: &Mutex<CircuitState>) -> MutexGuard<'_, CircuitState> {
    state.lock().unwrap_or_else(|p| p.into_inner())
}

impl CircuitBreaker {
    pub fn new(endpoint: impl Into<String>, threshold: u32, cooldown: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            threshold: threshold.max(1),
            cooldown,
            state: Arc::new(Mutex::new(CircuitState {
                status: CircuitStatus::Closed,
                failure_count: 0,
                opened_at: None,
                probe_in_flight: false,
            })),
        }
    }

    /// Ask for permission to make one network attempt.
    ///
    /// `Err` carries the remaining cool-down when it is known; a concurrent
    /// caller rejected during a HalfOpen probe gets `Err(None)`.
    pub fn try_acquire(&self) -> Result<BreakerPermit, Option<Duration>> {
        let mut st = lock(&self.state);
        let probe = match st.status {
            CircuitStatus::Closed => false,
            CircuitStatus::Open => {
                let opened = st.opened_at.unwrap_or_else(Instant::now);
                let elapsed = opened.elapsed();
                if elapsed < self.cooldown {
                    return Err(Some(self.cooldown - elapsed));
                }
                st.status = CircuitStatus::HalfOpen;
                st.probe_in_flight = true;
                tracing::info!(endpoint = %self.endpoint, "circuit half-open, sending probe");
                true
            }
            CircuitStatus::HalfOpen => {
                if st.probe_in_flight {
                    return Err(None);
                }
                st.probe_in_flight = true;
                true
            }
        };
        Ok(BreakerPermit {
            breaker: self.clone(),
            probe,
            settled: false,
        })
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let st = lock(&self.state);
        CircuitSnapshot {
            status: st.status,
            failure_count: st.failure_count,
            opened_at: st.opened_at,
        }
    }

    fn open(&self, st: &mut CircuitState) {
        st.status = CircuitStatus::Open;
        st.opened_at = Some(Instant::now());
        st.probe_in_flight = false;
        counter!("circuit_opened_total", "endpoint" => self.endpoint.clone()).increment(1);
        tracing::warn!(
            endpoint = %self.endpoint,
            failures = st.failure_count,
            cooldown_ms = self.cooldown.as_millis() as u64,
            "circuit opened"
        );
    }
}

/// One admitted attempt. Settle it with `success`, `failure` or `release`;
/// dropping it unsettled frees a HalfOpen probe slot without a verdict.
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl BreakerPermit {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        let mut st = lock(&self.breaker.state);
        if st.status != CircuitStatus::Closed {
            tracing::info!(endpoint = %self.breaker.endpoint, "circuit closed");
        }
        st.status = CircuitStatus::Closed;
        st.failure_count = 0;
        st.opened_at = None;
        st.probe_in_flight = false;
    }

    /// A retryable failure: counts toward the threshold, re-opens after a probe.
    pub fn failure(mut self) {
        self.settled = true;
        let mut st = lock(&self.breaker.state);
        st.failure_count = st.failure_count.saturating_add(1);
        let status = st.status;
        match status {
            CircuitStatus::HalfOpen if self.probe => self.breaker.open(&mut st),
            CircuitStatus::Closed if st.failure_count >= self.breaker.threshold => {
                self.breaker.open(&mut st)
            }
            _ => {}
        }
    }

    /// Outcome that says nothing about endpoint health (429, fatal 4xx).
    pub fn release(mut self) {
        self.settled = true;
        if self.probe {
            lock(&self.breaker.state).probe_in_flight = false;
        }
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            lock(&self.breaker.state).probe_in_flight = false;
        }
    }
}
