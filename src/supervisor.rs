//! Supervisor (spec §4.F): wires the Route Observer, State Sampler, Health
//! Monitor, and Reconciler, debounces ticks, drives the periodic health
//! schedule, and guarantees cleanup on shutdown.
//!
//! The signal-channel shape follows the teacher's `main.rs::signal_channel`
//! (a background task forwarding `tokio::signal::unix` into an mpsc
//! channel the main loop `select!`s on), simplified to the two signals this
//! daemon actually needs.

use std::collections::HashMap;
use std::time::Instant;

use futures::{Stream, StreamExt};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::health::HealthMonitor;
use crate::kernel::constants;
use crate::kernel::KernelAdapter;
use crate::model::{CanonicalState, Status};
use crate::observer::Tick;
use crate::reconciler::{compute_desired, status_lookup, Reconciler};
use crate::sampler;

/// Owns the kernel adapter and all mutable loop state. Generic over
/// [`KernelAdapter`] (the blanket `NetlinkOps + NfTablesOps + ProbeOps`
/// bundle from `kernel::mod`) so tests can pass a single mock struct that
/// implements all three, and production can pass a small delegating
/// wrapper over `RealNetlinkOps`/`RealNfTablesOps`/`RealProbeOps`.
pub struct Supervisor<K> {
    kernel: K,
    cfg: Config,
    health: HealthMonitor,
    last_applied: Option<CanonicalState>,
    last_applied_health: HashMap<String, Status>,
    /// When set, a route event arrived and is waiting out the debounce
    /// window before its reconcile runs. Further events while this is set
    /// coalesce into the same pending reconcile rather than pushing the
    /// deadline out, so a burst of events is bounded by the first event's
    /// `debounce_time`, not the last one's (spec §5's latency bound).
    pending_reconcile_at: Option<Instant>,
}

impl<K: KernelAdapter> Supervisor<K> {
    pub fn new(kernel: K, cfg: Config) -> Self {
        Supervisor {
            kernel,
            cfg,
            health: HealthMonitor::new(),
            last_applied: None,
            last_applied_health: HashMap::new(),
            pending_reconcile_at: None,
        }
    }

    /// Runs the main loop until SIGINT/SIGTERM, then performs cleanup and
    /// returns the process exit code.
    pub async fn run(mut self, observer: impl Stream<Item = Tick> + Unpin) -> i32 {
        let mut observer = observer;
        let mut shutdown = match shutdown_signal() {
            Ok(rx) => rx,
            Err(code) => return code,
        };
        let mut health_timer = tokio::time::interval(self.cfg.health_check_interval);
        health_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let debounce_sleep = async {
                match self.pending_reconcile_at {
                    Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("shutting down, cleaning up kernel state");
                    self.cleanup().await;
                    return 0;
                }
                maybe_tick = observer.next() => {
                    if maybe_tick.is_none() {
                        // Observer stall (spec §7): not an error, the health
                        // timer below still drives reconciles on liveness edges.
                        continue;
                    }
                    self.on_route_event();
                }
                _ = health_timer.tick() => {
                    self.on_health_tick().await;
                }
                _ = debounce_sleep => {
                    self.pending_reconcile_at = None;
                    self.resample_and_maybe_reconcile().await;
                }
            }
        }
    }

    /// Schedules a reconcile `debounce_time` from now, unless one is
    /// already pending (spec §4.F suspension point "debounce sleep").
    fn on_route_event(&mut self) {
        if self.pending_reconcile_at.is_none() {
            self.pending_reconcile_at = Some(Instant::now() + self.cfg.debounce_time);
        }
    }

    async fn on_health_tick(&mut self) {
        let tuples = match sampler::sample(&self.kernel).await {
            Ok(s) => s.tuples().to_vec(),
            Err(error) => {
                tracing::error!(?error, "state sampler failed during health tick");
                return;
            }
        };
        let edge = self.health.tick(&tuples, &self.kernel, &self.cfg, Instant::now()).await;
        if edge {
            self.resample_and_maybe_reconcile().await;
        }
    }

    async fn resample_and_maybe_reconcile(&mut self) {
        let s = match sampler::sample(&self.kernel).await {
            Ok(s) => s,
            Err(error) => {
                tracing::error!(?error, "state sampler failed, skipping reconcile");
                return;
            }
        };
        self.health.sync_interfaces(s.tuples());

        let snapshot: HashMap<String, Status> =
            s.iter().map(|t| (t.iface.clone(), self.health.status_of(&t.iface))).collect();

        if self.last_applied.as_ref() == Some(&s) && self.last_applied_health == snapshot {
            return;
        }

        let desired = compute_desired(&s, status_lookup(&snapshot), &self.cfg);
        match Reconciler::apply(&desired, &s, &self.kernel, &self.kernel).await {
            Ok(()) => {
                self.last_applied = Some(s);
                self.last_applied_health = snapshot;
            }
            Err(error) => {
                tracing::error!(?error, "reconcile failed, next tick retries from scratch");
            }
        }
    }

    async fn cleanup(&self) {
        for priority in constants::RETURN_BASE..constants::RETURN_LIMIT {
            let _ = self.kernel.flush_table(priority).await;
            let _ = self.kernel.rule_del_at_priority(priority).await;
        }
        // lb_pref..=lb_pref+CLEANUP_TABLE_SPAN covers the active rule plus
        // every draining/affinity rule priority ever issued for it.
        for offset in 0..=constants::CLEANUP_TABLE_SPAN {
            let _ = self.kernel.rule_del_at_priority(self.cfg.lb_pref + offset).await;
            let _ = self.kernel.flush_table(self.cfg.lb_table + offset).await;
        }
        let _ = self.kernel.cleanup();
        let _ = self.kernel.flush_route_cache().await;
    }
}

fn shutdown_signal() -> Result<mpsc::Receiver<()>, i32> {
    let (tx, rx) = mpsc::channel(1);
    let mut sigint = signal(SignalKind::interrupt()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGINT handler");
        exitcode::IOERR
    })?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGTERM handler");
        exitcode::IOERR
    })?;

    tokio::spawn(async move {
        tokio::select! {
            Some(_) = sigint.recv() => {
                tracing::debug!("received SIGINT");
            }
            Some(_) = sigterm.recv() => {
                tracing::debug!("received SIGTERM");
            }
        }
        let _ = tx.send(()).await;
    });

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::mocks::{MockNetlinkOps, MockNfTablesOps, MockProbeOps, NetlinkState};
    use crate::kernel::{AddrInfo, DefaultRoute, NftRule};
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::time::Duration;

    /// Combines the three mocks behind one type implementing
    /// `NetlinkOps + NfTablesOps + ProbeOps`, the same way production
    /// combines the three `Real*Ops` structs into one `KernelAdapter`.
    #[derive(Clone)]
    struct MockKernel {
        net: MockNetlinkOps,
        nft: Arc<MockNfTablesOps>,
        probe: MockProbeOps,
    }

    #[async_trait]
    impl crate::kernel::NetlinkOps for MockKernel {
        async fn route_add(&self, r: &crate::kernel::RouteSpec) -> Result<(), crate::kernel::Error> { self.net.route_add(r).await }
        async fn route_del(&self, r: &crate::kernel::RouteSpec) -> Result<(), crate::kernel::Error> { self.net.route_del(r).await }
        async fn route_replace_multipath(&self, r: &crate::kernel::MultipathRouteSpec) -> Result<(), crate::kernel::Error> { self.net.route_replace_multipath(r).await }
        async fn flush_table(&self, t: u32) -> Result<(), crate::kernel::Error> { self.net.flush_table(t).await }
        async fn rule_add(&self, r: &crate::kernel::RuleSpec) -> Result<(), crate::kernel::Error> { self.net.rule_add(r).await }
        async fn rule_del_at_priority(&self, p: u32) -> Result<(), crate::kernel::Error> { self.net.rule_del_at_priority(p).await }
        async fn rule_list_v4(&self) -> Result<Vec<crate::kernel::RuleSpec>, crate::kernel::Error> { self.net.rule_list_v4().await }
        async fn link_list(&self) -> Result<Vec<crate::kernel::LinkInfo>, crate::kernel::Error> { self.net.link_list().await }
        async fn addr_list_v4(&self) -> Result<Vec<crate::kernel::AddrInfo>, crate::kernel::Error> { self.net.addr_list_v4().await }
        async fn list_default_routes(&self) -> Result<Vec<crate::kernel::DefaultRoute>, crate::kernel::Error> { self.net.list_default_routes().await }
        async fn primary_ipv4_of(&self, i: u32) -> Result<Option<Ipv4Addr>, crate::kernel::Error> { self.net.primary_ipv4_of(i).await }
        async fn neighbor_state(&self, i: u32, gw: Ipv4Addr) -> Result<crate::kernel::NeighborState, crate::kernel::Error> { self.net.neighbor_state(i, gw).await }
        async fn neighbor_flush(&self, i: u32, gw: Ipv4Addr) -> Result<(), crate::kernel::Error> { self.net.neighbor_flush(i, gw).await }
        async fn flush_route_cache(&self) -> Result<(), crate::kernel::Error> { self.net.flush_route_cache().await }
    }

    impl crate::kernel::NfTablesOps for MockKernel {
        fn reset_table(&self, rule: &NftRule) -> Result<(), crate::kernel::Error> { self.nft.reset_table(rule) }
        fn cleanup(&self) -> Result<(), crate::kernel::Error> { self.nft.cleanup() }
    }

    #[async_trait]
    impl crate::kernel::ProbeOps for MockKernel {
        async fn dial_tcp(&self, s: Ipv4Addr, d: Ipv4Addr, p: u16, t: Duration) -> Result<(), crate::kernel::Error> {
            self.probe.dial_tcp(s, d, p, t).await
        }
    }

    fn kernel_with_two_links() -> MockKernel {
        let net = MockNetlinkOps::with_state(NetlinkState {
            default_routes: vec![
                DefaultRoute { iface: "eth0".into(), if_index: 2, gw: "10.0.0.1".parse().unwrap() },
                DefaultRoute { iface: "wlan0".into(), if_index: 3, gw: "192.168.1.1".parse().unwrap() },
            ],
            addrs: vec![
                AddrInfo { if_index: 2, addr: "10.0.0.2".parse().unwrap() },
                AddrInfo { if_index: 3, addr: "192.168.1.50".parse().unwrap() },
            ],
            ..Default::default()
        });
        MockKernel { net, nft: Arc::new(MockNfTablesOps::new()), probe: MockProbeOps::new() }
    }

    #[tokio::test]
    async fn clean_shutdown_flushes_the_documented_ranges() {
        let kernel = kernel_with_two_links();
        kernel.nft.reset_table(&NftRule::default()).unwrap();
        let cfg = Config::default();

        // Active rule at lb_pref, plus one draining/affinity rule at every
        // offset in lb_pref+1..=lb_pref+CLEANUP_TABLE_SPAN.
        for offset in 0..=crate::kernel::constants::CLEANUP_TABLE_SPAN {
            kernel.net.rule_add(&crate::kernel::RuleSpec {
                selector: crate::kernel::RuleSelector::FwMark { mark: crate::kernel::constants::ACTIVE_MARK, mask: None },
                table_id: cfg.lb_table + offset,
                priority: cfg.lb_pref + offset,
            }).await.unwrap();
        }

        let sup = Supervisor::new(kernel.clone(), cfg.clone());
        sup.cleanup().await;

        let rules = kernel.net.state.lock().unwrap().rules.clone();
        assert!(
            rules.iter().all(|r| {
                !(cfg.lb_pref..=cfg.lb_pref + crate::kernel::constants::CLEANUP_TABLE_SPAN).contains(&r.priority)
            }),
            "no rules must remain at pref 90..100 after shutdown"
        );
        assert!(!kernel.nft.state.lock().unwrap().table_present, "nftables table must be removed after shutdown");
    }

    #[tokio::test]
    async fn reconcile_runs_once_for_unchanged_state() {
        let kernel = kernel_with_two_links();
        let mut sup = Supervisor::new(kernel.clone(), Config::default());

        sup.resample_and_maybe_reconcile().await;
        let routes_after_first = kernel.net.state.lock().unwrap().routes.len();
        sup.resample_and_maybe_reconcile().await;
        let routes_after_second = kernel.net.state.lock().unwrap().routes.len();

        assert_eq!(routes_after_first, routes_after_second);
    }

    #[tokio::test(start_paused = true)]
    async fn route_event_coalesces_into_a_single_pending_deadline() {
        let kernel = kernel_with_two_links();
        let cfg = Config { debounce_time: Duration::from_secs(2), ..Config::default() };
        let mut sup = Supervisor::new(kernel, cfg);

        sup.on_route_event();
        let first_deadline = sup.pending_reconcile_at.unwrap();

        tokio::time::advance(Duration::from_millis(500)).await;
        sup.on_route_event();
        let second_deadline = sup.pending_reconcile_at.unwrap();

        assert_eq!(first_deadline, second_deadline, "a second event before the deadline must not push it out");
    }
}
