//! Per-upstream circuit breaker.
//!
//! Each upstream has a CLOSED / OPEN / HALF_OPEN state machine driven by
//! consecutive transport failures. Callers take an [`Attempt`] lease before
//! dispatching and close it with a verdict; protocol-level errors are
//! reported as success because the breaker tracks availability, not tool
//! correctness. In HALF_OPEN exactly one probe may be in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use metrics::{counter, gauge};

use relay_config::CircuitBreakerConfig;

const METRIC_CIRCUIT_STATE: &str = "mcp_router_upstream_circuit_state";
const METRIC_CIRCUIT_OPENS: &str = "mcp_router_upstream_circuit_opens_total";
const METRIC_UPSTREAM_FAILURES: &str = "mcp_router_upstream_failures_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Why `begin_attempt` refused to admit a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDenied {
    /// The circuit is open; retry after roughly this long.
    Open { retry_in: Duration },
    /// A half-open probe is already in flight.
    HalfOpenBusy,
}

#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub open_remaining: Option<Duration>,
    pub half_open_in_flight: bool,
}

impl Default for BreakerSnapshot {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            open_remaining: None,
            half_open_in_flight: false,
        }
    }
}

#[derive(Debug)]
struct Entry {
    state: BreakerState,
    consecutive_failures: u32,
    open_until: Option<Instant>,
    half_open_in_flight: bool,
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            open_until: None,
            half_open_in_flight: false,
        }
    }
}

#[derive(Default)]
pub struct CircuitBreaker {
    entries: Mutex<HashMap<String, Entry>>,
}

impl CircuitBreaker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Admit or refuse one upstream operation.
    ///
    /// The returned lease must be closed with [`Attempt::end`]; dropping it
    /// without a verdict counts as a failure so a half-open slot is never
    /// wedged by a cancelled caller.
    pub fn begin_attempt(
        self: &Arc<Self>,
        upstream: &str,
        cfg: &CircuitBreakerConfig,
    ) -> Result<Attempt, BreakerDenied> {
        if !cfg.enabled {
            return Ok(Attempt::noop(self.clone(), upstream));
        }

        let mut entries = self.entries.lock().expect("breaker lock poisoned");
        let entry = entries.entry(upstream.to_string()).or_default();
        let now = Instant::now();

        match entry.state {
            BreakerState::Closed => Ok(Attempt::new(self.clone(), upstream, false, cfg)),
            BreakerState::Open => {
                let open_until = entry.open_until.unwrap_or(now);
                if now < open_until {
                    return Err(BreakerDenied::Open {
                        retry_in: open_until - now,
                    });
                }
                // Cooldown elapsed: this attempt becomes the half-open probe.
                entry.state = BreakerState::HalfOpen;
                entry.open_until = None;
                entry.half_open_in_flight = true;
                set_state_gauges(upstream, BreakerState::HalfOpen);
                tracing::debug!(server = %upstream, "circuit breaker open -> half-open");
                Ok(Attempt::new(self.clone(), upstream, true, cfg))
            }
            BreakerState::HalfOpen => {
                if entry.half_open_in_flight {
                    return Err(BreakerDenied::HalfOpenBusy);
                }
                entry.half_open_in_flight = true;
                Ok(Attempt::new(self.clone(), upstream, true, cfg))
            }
        }
    }

    /// Whether an attempt would currently be admitted (selector filtering).
    pub fn can_attempt(&self, upstream: &str, cfg: &CircuitBreakerConfig) -> bool {
        if !cfg.enabled {
            return true;
        }
        let entries = self.entries.lock().expect("breaker lock poisoned");
        match entries.get(upstream) {
            None => true,
            Some(entry) => match entry.state {
                BreakerState::Closed => true,
                BreakerState::Open => entry
                    .open_until
                    .map(|until| Instant::now() >= until)
                    .unwrap_or(true),
                BreakerState::HalfOpen => !entry.half_open_in_flight,
            },
        }
    }

    pub fn snapshot(&self, upstream: &str) -> BreakerSnapshot {
        let entries = self.entries.lock().expect("breaker lock poisoned");
        match entries.get(upstream) {
            None => BreakerSnapshot::default(),
            Some(entry) => BreakerSnapshot {
                state: entry.state,
                consecutive_failures: entry.consecutive_failures,
                open_remaining: entry
                    .open_until
                    .map(|until| until.saturating_duration_since(Instant::now())),
                half_open_in_flight: entry.half_open_in_flight,
            },
        }
    }

    fn finish(&self, upstream: &str, ok: bool, half_open_probe: bool, cfg: AttemptConfig) {
        if !ok {
            counter!(METRIC_UPSTREAM_FAILURES, "server" => upstream.to_string()).increment(1);
        }

        let mut entries = self.entries.lock().expect("breaker lock poisoned");
        let entry = entries.entry(upstream.to_string()).or_default();

        if half_open_probe {
            entry.half_open_in_flight = false;
            if entry.state != BreakerState::HalfOpen {
                return;
            }
            if ok {
                entry.state = BreakerState::Closed;
                entry.consecutive_failures = 0;
                entry.open_until = None;
                set_state_gauges(upstream, BreakerState::Closed);
                tracing::info!(server = %upstream, "circuit breaker half-open -> closed");
            } else {
                self.trip(upstream, entry, cfg.open_ms, "half-open probe failed");
            }
            return;
        }

        // An attempt admitted in CLOSED; the state may have moved meanwhile.
        if entry.state != BreakerState::Closed {
            return;
        }
        if ok {
            entry.consecutive_failures = 0;
        } else {
            entry.consecutive_failures += 1;
            if entry.consecutive_failures >= cfg.failure_threshold {
                self.trip(upstream, entry, cfg.open_ms, "failure threshold reached");
            }
        }
    }

    fn trip(&self, upstream: &str, entry: &mut Entry, open_ms: u64, reason: &str) {
        entry.state = BreakerState::Open;
        entry.open_until = Some(Instant::now() + Duration::from_millis(open_ms));
        entry.consecutive_failures = 0;
        counter!(METRIC_CIRCUIT_OPENS, "server" => upstream.to_string()).increment(1);
        set_state_gauges(upstream, BreakerState::Open);
        tracing::warn!(server = %upstream, open_ms, reason, "circuit breaker opened");
    }
}

fn set_state_gauges(upstream: &str, state: BreakerState) {
    for candidate in [
        BreakerState::Closed,
        BreakerState::Open,
        BreakerState::HalfOpen,
    ] {
        let value = if candidate == state { 1.0 } else { 0.0 };
        gauge!(
            METRIC_CIRCUIT_STATE,
            "server" => upstream.to_string(),
            "state" => candidate.label()
        )
        .set(value);
    }
}

#[derive(Debug, Clone, Copy)]
struct AttemptConfig {
    failure_threshold: u32,
    open_ms: u64,
}

/// A lease for one upstream operation. Close it with [`Attempt::end`].
pub struct Attempt {
    breaker: Arc<CircuitBreaker>,
    upstream: String,
    half_open_probe: bool,
    cfg: Option<AttemptConfig>,
    finished: bool,
}

impl Attempt {
    fn new(
        breaker: Arc<CircuitBreaker>,
        upstream: &str,
        half_open_probe: bool,
        cfg: &CircuitBreakerConfig,
    ) -> Self {
        Self {
            breaker,
            upstream: upstream.to_string(),
            half_open_probe,
            cfg: Some(AttemptConfig {
                failure_threshold: cfg.failure_threshold,
                open_ms: cfg.open_ms,
            }),
            finished: false,
        }
    }

    fn noop(breaker: Arc<CircuitBreaker>, upstream: &str) -> Self {
        Self {
            breaker,
            upstream: upstream.to_string(),
            half_open_probe: false,
            cfg: None,
            finished: true,
        }
    }

    /// Close the lease with the caller's availability verdict.
    pub fn end(mut self, ok: bool) {
        self.record(ok);
    }

    fn record(&mut self, ok: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(cfg) = self.cfg {
            self.breaker
                .finish(&self.upstream, ok, self.half_open_probe, cfg);
        }
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        // An abandoned lease (cancellation, panic) counts as a failure.
        self.record(false);
    }
}
