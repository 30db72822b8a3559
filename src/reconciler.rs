//! Reconciler (spec §4.E): pure computation of desired kernel state from
//! `(S, H)`, plus an applier that drives the Kernel Adapter.
//!
//! The Kernel Adapter's operations are idempotent (spec §4.A), so there is
//! no diff against previously-applied state: every reconcile reissues the
//! complete desired state. `compute_desired` is pure and synchronous so it
//! can be exercised directly against the concrete scenarios of spec §8
//! without touching a kernel adapter at all; `Reconciler::apply` is the
//! only part that is async and talks to [`NetlinkOps`]/[`NfTablesOps`].

use std::collections::HashMap;

use crate::config::Config;
use crate::kernel::constants;
use crate::kernel::{
    MultipathRouteSpec, NetlinkOps, NfTablesOps, Nexthop, NftRule, RouteSpec, RuleSelector,
    RuleSpec,
};
use crate::model::{CanonicalState, InterfaceTuple, Status};

/// Per-interface return table/rule, plus the active/draining multipath
/// overlay — the full desired kernel state `K` of spec §3, computed as
/// plain data so it can be asserted on without a kernel adapter.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DesiredState {
    pub return_routes: Vec<(RouteSpec, RouteSpec)>,
    pub return_rules: Vec<RuleSpec>,
    /// One entry in simple mode (`LB_TABLE`), or one per shard in affinity
    /// mode (`LB_TABLE+2..LB_TABLE+2+|Active|`).
    pub active: Vec<MultipathRouteSpec>,
    pub active_rules: Vec<RuleSpec>,
    pub draining: Option<MultipathRouteSpec>,
    pub draining_rule: Option<RuleSpec>,
    pub nft: Option<NftRule>,
}

/// Computes `K` from canonical state and a read-only health snapshot.
/// `status_of` is typically `HealthMonitor::status_of`, but taking a
/// closure keeps this function free of any dependency on the monitor's
/// internals.
pub fn compute_desired(s: &CanonicalState, status_of: impl Fn(&str) -> Status, cfg: &Config) -> DesiredState {
    let mut desired = DesiredState::default();

    for (i, t) in s.iter().enumerate() {
        let priority = constants::RETURN_BASE + i as u32;
        let table_id = priority;
        desired.return_routes.push(build_return_routes(t, table_id));
        desired.return_rules.push(RuleSpec {
            selector: RuleSelector::Src(t.src_ip),
            table_id,
            priority,
        });
    }

    let active: Vec<&InterfaceTuple> = s.iter().filter(|t| status_of(&t.iface) == Status::Up).collect();
    let draining: Vec<&InterfaceTuple> = s.iter().filter(|t| status_of(&t.iface) != Status::Up).collect();

    if active.is_empty() {
        // Spec §4.E: "If Active is empty, skip the multipath rebuild
        // entirely and return — existing rules drain naturally."
        return desired;
    }

    if cfg.affinity_enabled && active.len() > 1 {
        build_affinity(&active, cfg, &mut desired);
    } else {
        build_simple_active(&active, cfg, &mut desired);
    }

    if cfg.draining_enabled && !draining.is_empty() {
        build_draining(&draining, cfg, &mut desired);
    }

    let masquerade_ifaces: Vec<String> = active
        .iter()
        .chain(draining.iter())
        .map(|t| t.iface.clone())
        .collect();
    desired.nft = Some(NftRule {
        affinity_shards: (cfg.affinity_enabled && active.len() > 1).then_some(active.len() as u32),
        masquerade_ifaces,
        consistent_nat: cfg.consistent_nat,
    });

    desired
}

fn build_return_routes(t: &InterfaceTuple, table_id: u32) -> (RouteSpec, RouteSpec) {
    let gateway_route = RouteSpec {
        destination: t.gw,
        prefix_len: 32,
        gateway: None,
        if_index: 0,
        table_id,
        src: Some(t.src_ip),
    };
    let default_route = RouteSpec {
        destination: std::net::Ipv4Addr::UNSPECIFIED,
        prefix_len: 0,
        gateway: Some(t.gw),
        if_index: 0,
        table_id,
        src: None,
    };
    (gateway_route, default_route)
}

fn build_simple_active(active: &[&InterfaceTuple], cfg: &Config, desired: &mut DesiredState) {
    let nexthops = active
        .iter()
        .map(|t| Nexthop { gateway: t.gw, if_index: 0, weight: constants::interface_weight(&t.iface) })
        .collect();
    desired.active.push(MultipathRouteSpec { table_id: cfg.lb_table, nexthops });
    desired.active_rules.push(RuleSpec {
        selector: RuleSelector::FwMark { mark: constants::ACTIVE_MARK, mask: None },
        table_id: cfg.lb_table,
        priority: cfg.lb_pref,
    });
}

/// Session-affinity variant (spec §4.E): one single-nexthop table per
/// active interface instead of one shared multipath table, each selected
/// by a rule matching the affinity-sharded mark.
fn build_affinity(active: &[&InterfaceTuple], cfg: &Config, desired: &mut DesiredState) {
    let max_shards = (constants::AFFINITY_TABLE_OFFSET_END - constants::AFFINITY_TABLE_OFFSET_START + 1) as usize;
    let active = if active.len() > max_shards {
        tracing::warn!(
            total = active.len(),
            kept = max_shards,
            "more active interfaces than affinity table slots, dropping the rest"
        );
        &active[..max_shards]
    } else {
        active
    };
    for (i, t) in active.iter().enumerate() {
        let table_id = cfg.lb_table + constants::AFFINITY_TABLE_OFFSET_START + i as u32;
        desired.active.push(MultipathRouteSpec {
            table_id,
            nexthops: vec![Nexthop { gateway: t.gw, if_index: 0, weight: 1 }],
        });
        desired.active_rules.push(RuleSpec {
            selector: RuleSelector::FwMark {
                mark: constants::ACTIVE_MARK | i as u32,
                mask: Some(constants::AFFINITY_MASK),
            },
            table_id,
            // Starts at lb_pref+2, matching AFFINITY_TABLE_OFFSET_START, so
            // shard 0 never collides with the draining rule at lb_pref+1.
            priority: cfg.lb_pref + constants::AFFINITY_TABLE_OFFSET_START + i as u32,
        });
    }
}

fn build_draining(draining: &[&InterfaceTuple], cfg: &Config, desired: &mut DesiredState) {
    let nexthops = draining
        .iter()
        .map(|t| Nexthop { gateway: t.gw, if_index: 0, weight: 1 })
        .collect();
    let table_id = cfg.lb_table + constants::DRAINING_TABLE_OFFSET;
    desired.draining = Some(MultipathRouteSpec { table_id, nexthops });
    desired.draining_rule = Some(RuleSpec {
        selector: RuleSelector::FwMark { mark: constants::DRAINING_MARK, mask: None },
        table_id,
        priority: cfg.lb_pref + constants::DRAINING_PREF_OFFSET,
    });
}

/// Carries `desired` into the kernel, in the exact order spec §4.E
/// mandates: return tables → active table/rule → draining table/rule →
/// nftables reset → route cache flush. Not atomic; the controller is the
/// sole writer so a transiently-empty `AT` is acceptable.
pub struct Reconciler;

impl Reconciler {
    /// Takes the netlink and nftables adapters separately, rather than one
    /// bound requiring both traits on a single type: production code wires
    /// `RealNetlinkOps` and `RealNfTablesOps` independently (they talk to
    /// different netlink families), and tests exercise them with separate
    /// mocks.
    pub async fn apply(
        desired: &DesiredState,
        s: &CanonicalState,
        netlink: &(impl NetlinkOps + ?Sized),
        nft_ops: &(impl NfTablesOps + ?Sized),
    ) -> Result<(), crate::kernel::Error> {
        for (i, ((gw_route, default_route), rule)) in
            desired.return_routes.iter().zip(desired.return_rules.iter()).enumerate()
        {
            let table_id = constants::RETURN_BASE + i as u32;
            netlink.flush_table(table_id).await?;
            netlink.rule_del_at_priority(table_id).await?;
            netlink.route_add(gw_route).await?;
            netlink.route_add(default_route).await?;
            netlink.rule_add(rule).await?;
        }
        // Interfaces that left S since the last reconcile: flush their
        // return tables even though no tuple remains to rebuild them.
        prune_stale_return_tables(s, netlink).await?;

        for active in &desired.active {
            netlink.route_replace_multipath(active).await?;
        }
        for rule in &desired.active_rules {
            netlink.rule_del_at_priority(rule.priority).await?;
            netlink.rule_add(rule).await?;
        }

        if let Some(draining) = &desired.draining {
            netlink.route_replace_multipath(draining).await?;
        }
        if let Some(rule) = &desired.draining_rule {
            netlink.rule_del_at_priority(rule.priority).await?;
            netlink.rule_add(rule).await?;
        }

        // `desired.nft == None` means Active was empty (spec §4.E): leave
        // the nftables table as-is rather than tearing it down, so traffic
        // still egressing through a Draining interface keeps its
        // masquerade rule. Only the Supervisor's shutdown path calls
        // `cleanup()`.
        if let Some(nft) = &desired.nft {
            nft_ops.reset_table(nft)?;
        }

        netlink.flush_route_cache().await?;
        Ok(())
    }
}

async fn prune_stale_return_tables(
    s: &CanonicalState,
    ops: &(impl NetlinkOps + ?Sized),
) -> Result<(), crate::kernel::Error> {
    let live = s.len() as u32;
    for table_id in (constants::RETURN_BASE + live)..constants::RETURN_LIMIT {
        ops.flush_table(table_id).await?;
        ops.rule_del_at_priority(table_id).await?;
    }
    Ok(())
}

/// Associates a `HashMap<String, Status>` snapshot with `status_of`'s
/// closure signature, used by the Supervisor to pass the Health Monitor's
/// current view into [`compute_desired`] without borrowing the monitor
/// itself across an await point.
pub fn status_lookup(snapshot: &HashMap<String, Status>) -> impl Fn(&str) -> Status + '_ {
    move |iface: &str| snapshot.get(iface).copied().unwrap_or_default()
}
