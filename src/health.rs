//! Health Monitor (spec §4.D): per-interface liveness state machine with
//! thresholds, exponential backoff, hold-down, and neighbor-cache gating.
//!
//! The rate limit on probing is intentionally global, not per-interface
//! (spec §9): at most one probe fires per `tick()` call regardless of how
//! many interfaces are tracked, and `tick()` itself is only meant to be
//! invoked by the Supervisor at most once per `health_check_interval`.
//! Reimplementers are warned in the spec not to "fix" this into
//! per-interface concurrency without changing the documented contract.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::kernel::{NeighborState, NetlinkOps, ProbeOps};
use crate::model::{InterfaceTuple, Status};

/// One interface's liveness record (spec §3's `H[iface]`).
#[derive(Debug, Clone)]
pub struct HealthRecord {
    pub status: Status,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub backoff_count: u32,
    pub last_failure_at: Option<Instant>,
    pub hold_down_until: Option<Instant>,
}

impl Default for HealthRecord {
    fn default() -> Self {
        HealthRecord {
            status: Status::Up,
            consecutive_failures: 0,
            consecutive_successes: 0,
            backoff_count: 0,
            last_failure_at: None,
            hold_down_until: None,
        }
    }
}

/// Outcome of one probe attempt fed into the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
}

impl HealthRecord {
    /// Applies one transition-table row (spec §4.D) and reports whether
    /// this was a health-edge (entered or left `Up`), which forces a
    /// reconcile even absent a route event.
    fn apply(&mut self, outcome: Outcome, now: Instant, cfg: &Config) -> bool {
        let was_up = self.status == Status::Up;

        match (self.status, outcome) {
            (Status::Up, Outcome::Success) => {
                self.consecutive_failures = 0;
                self.consecutive_successes += 1;
            }
            (Status::Up, Outcome::Failure) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= cfg.failure_threshold {
                    self.status = Status::Down;
                    self.last_failure_at = Some(now);
                    self.backoff_count += 1;
                }
            }
            (Status::Down, Outcome::Failure) | (Status::Backoff, Outcome::Failure) => {
                let due = self
                    .last_failure_at
                    .map(|t| now.duration_since(t) >= backoff_duration(cfg, self.backoff_count))
                    .unwrap_or(false);
                if due {
                    self.status = Status::Backoff;
                }
            }
            (Status::Down, Outcome::Success) | (Status::Backoff, Outcome::Success) => {
                self.consecutive_successes += 1;
                if self.consecutive_successes >= cfg.recovery_threshold {
                    if cfg.hysteresis_enabled {
                        self.status = Status::HoldDown;
                        self.hold_down_until = Some(now + cfg.hold_down);
                        self.backoff_count = 0;
                    } else {
                        self.reset_to_up();
                    }
                }
            }
            (Status::HoldDown, Outcome::Failure) => {
                self.status = Status::Down;
                self.last_failure_at = Some(now);
                self.backoff_count += 1;
            }
            (Status::HoldDown, Outcome::Success) => {}
        }

        was_up != (self.status == Status::Up)
    }

    /// `HoldDown` → `Up` once the dwell time elapses, driven by a tick with
    /// no accompanying probe outcome.
    fn maybe_promote_from_hold_down(&mut self, now: Instant) -> bool {
        if self.status == Status::HoldDown && self.hold_down_until.is_some_and(|until| now >= until) {
            self.reset_to_up();
            true
        } else {
            false
        }
    }

    fn reset_to_up(&mut self) {
        self.status = Status::Up;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.backoff_count = 0;
        self.hold_down_until = None;
    }

    /// Whether a probe should currently be skipped under backoff (spec's
    /// flap-protection scenario #4).
    fn probe_due(&self, now: Instant, cfg: &Config) -> bool {
        match self.status {
            Status::Down | Status::Backoff => self
                .last_failure_at
                .map(|t| now.duration_since(t) >= backoff_duration(cfg, self.backoff_count))
                .unwrap_or(true),
            _ => true,
        }
    }
}

fn backoff_duration(cfg: &Config, backoff_count: u32) -> Duration {
    let scaled = cfg.backoff_base.saturating_mul(1u32.checked_shl(backoff_count).unwrap_or(u32::MAX));
    scaled.min(cfg.backoff_max)
}

/// Owns every interface's [`HealthRecord`] and advances exactly one of
/// them per `tick()` call, round-robin, per spec §4.D's global rate limit.
pub struct HealthMonitor {
    records: HashMap<String, HealthRecord>,
    round_robin_cursor: usize,
}

impl HealthMonitor {
    pub fn new() -> Self {
        HealthMonitor { records: HashMap::new(), round_robin_cursor: 0 }
    }

    pub fn status_of(&self, iface: &str) -> Status {
        self.records.get(iface).map(|r| r.status).unwrap_or_default()
    }

    pub fn record_of(&self, iface: &str) -> Option<&HealthRecord> {
        self.records.get(iface)
    }

    /// Creates records for interfaces newly present in `S` (spec §3:
    /// "`H[iface]` is created on first sight") and drops records for
    /// interfaces that disappeared.
    pub fn sync_interfaces(&mut self, tuples: &[InterfaceTuple]) {
        for t in tuples {
            self.records.entry(t.iface.clone()).or_default();
        }
        let present: std::collections::HashSet<&str> = tuples.iter().map(|t| t.iface.as_str()).collect();
        self.records.retain(|iface, _| present.contains(iface.as_str()));
    }

    /// Advances the health state machine for at most one interface,
    /// chosen round-robin, probing it if `health_check_enabled` and
    /// driving the remaining `HoldDown` interfaces' promotion check.
    /// Returns `true` if any interface crossed a health-edge (spec §4.D).
    pub async fn tick(
        &mut self,
        tuples: &[InterfaceTuple],
        ops: &(impl NetlinkOps + ProbeOps + ?Sized),
        cfg: &Config,
        now: Instant,
    ) -> bool {
        self.sync_interfaces(tuples);

        let mut edge = false;
        for record in self.records.values_mut() {
            edge |= record.maybe_promote_from_hold_down(now);
        }

        if tuples.is_empty() || !cfg.health_check_enabled {
            return edge;
        }

        let idx = self.round_robin_cursor % tuples.len();
        self.round_robin_cursor = self.round_robin_cursor.wrapping_add(1);
        let target = &tuples[idx];

        let record = self.records.entry(target.iface.clone()).or_default();
        if !record.probe_due(now, cfg) {
            return edge;
        }

        let outcome = probe_one(target, ops, cfg).await;
        edge |= self.records.get_mut(&target.iface).unwrap().apply(outcome, now, cfg);
        edge
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

async fn probe_one(t: &InterfaceTuple, ops: &(impl NetlinkOps + ProbeOps + ?Sized), cfg: &Config) -> Outcome {
    if cfg.neighbor_reachability {
        let if_index = ops.link_list().await.ok().and_then(|links| {
            links.into_iter().find(|l| l.name == t.iface).map(|l| l.index)
        });
        if let Some(if_index) = if_index {
            match ops.neighbor_state(if_index, t.gw).await {
                Ok(NeighborState::Failed | NeighborState::Incomplete) => return Outcome::Failure,
                Ok(NeighborState::Stale) => {
                    let _ = ops.neighbor_flush(if_index, t.gw).await;
                }
                Ok(
                    NeighborState::Reachable
                    | NeighborState::Delay
                    | NeighborState::Probe
                    | NeighborState::Unknown,
                ) => {}
                Err(_) => {}
            }
        }
    }

    match ops.dial_tcp(t.src_ip, cfg.probe_target, cfg.probe_port, cfg.health_check_timeout).await {
        Ok(()) => Outcome::Success,
        Err(_) => Outcome::Failure,
    }
}
