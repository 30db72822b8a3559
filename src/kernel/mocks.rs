//! Stateful mocks for the three Kernel Adapter traits.
//!
//! Tracks actual state (routes, rules, table contents) rather than just
//! recording call sequences, so reconciler tests can assert on what the
//! "kernel" looks like after a reconcile, not merely which calls fired.
//! Follows the teacher's `Arc<Mutex<_>>` + `fail_on` convention.

#![cfg(test)]

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::nftables_ops::{NfTablesOps, NftRule};
use super::probe::ProbeOps;
use super::netlink_ops::{
    AddrInfo, DefaultRoute, LinkInfo, MultipathRouteSpec, NeighborState, NetlinkOps, RouteSpec,
    RuleSpec,
};
use super::Error;

// ============================================================================
// MockNetlinkOps
// ============================================================================

#[derive(Debug, Default)]
pub struct NetlinkState {
    pub routes: Vec<RouteSpec>,
    pub multipath: HashMap<u32, MultipathRouteSpec>,
    pub rules: Vec<RuleSpec>,
    pub links: Vec<LinkInfo>,
    pub addrs: Vec<AddrInfo>,
    pub default_routes: Vec<DefaultRoute>,
    pub neighbors: HashMap<(u32, Ipv4Addr), NeighborState>,
    pub flushed_neighbors: Vec<(u32, Ipv4Addr)>,
    pub cache_flush_count: u32,
    pub fail_on: HashMap<String, String>,
}

impl NetlinkState {
    fn check_fail(&self, op: &str) -> Result<(), Error> {
        match self.fail_on.get(op) {
            Some(msg) => Err(Error::General(msg.clone())),
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct MockNetlinkOps {
    pub state: Arc<Mutex<NetlinkState>>,
}

impl MockNetlinkOps {
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(NetlinkState::default())) }
    }

    pub fn with_state(state: NetlinkState) -> Self {
        Self { state: Arc::new(Mutex::new(state)) }
    }
}

#[async_trait]
impl NetlinkOps for MockNetlinkOps {
    async fn route_add(&self, route: &RouteSpec) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("route_add")?;
        s.routes.retain(|r| {
            !(r.destination == route.destination && r.prefix_len == route.prefix_len && r.table_id == route.table_id)
        });
        s.routes.push(route.clone());
        Ok(())
    }

    async fn route_del(&self, route: &RouteSpec) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("route_del")?;
        s.routes.retain(|r| {
            !(r.destination == route.destination && r.prefix_len == route.prefix_len && r.table_id == route.table_id)
        });
        Ok(())
    }

    async fn route_replace_multipath(&self, route: &MultipathRouteSpec) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("route_replace_multipath")?;
        if route.nexthops.is_empty() {
            s.multipath.remove(&route.table_id);
        } else {
            s.multipath.insert(route.table_id, route.clone());
        }
        Ok(())
    }

    async fn flush_table(&self, table_id: u32) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("flush_table")?;
        s.routes.retain(|r| r.table_id != table_id);
        s.multipath.remove(&table_id);
        Ok(())
    }

    async fn rule_add(&self, rule: &RuleSpec) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("rule_add")?;
        s.rules.push(rule.clone());
        Ok(())
    }

    async fn rule_del_at_priority(&self, priority: u32) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("rule_del_at_priority")?;
        s.rules.retain(|r| r.priority != priority);
        Ok(())
    }

    async fn rule_list_v4(&self) -> Result<Vec<RuleSpec>, Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("rule_list_v4")?;
        Ok(s.rules.clone())
    }

    async fn link_list(&self) -> Result<Vec<LinkInfo>, Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("link_list")?;
        Ok(s.links.clone())
    }

    async fn addr_list_v4(&self) -> Result<Vec<AddrInfo>, Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("addr_list_v4")?;
        Ok(s.addrs.clone())
    }

    async fn list_default_routes(&self) -> Result<Vec<DefaultRoute>, Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("list_default_routes")?;
        Ok(s.default_routes.clone())
    }

    async fn primary_ipv4_of(&self, if_index: u32) -> Result<Option<Ipv4Addr>, Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("primary_ipv4_of")?;
        Ok(s.addrs.iter().find(|a| a.if_index == if_index).map(|a| a.addr))
    }

    async fn neighbor_state(&self, if_index: u32, gw: Ipv4Addr) -> Result<NeighborState, Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("neighbor_state")?;
        Ok(s.neighbors.get(&(if_index, gw)).copied().unwrap_or(NeighborState::Unknown))
    }

    async fn neighbor_flush(&self, if_index: u32, gw: Ipv4Addr) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("neighbor_flush")?;
        s.flushed_neighbors.push((if_index, gw));
        s.neighbors.remove(&(if_index, gw));
        Ok(())
    }

    async fn flush_route_cache(&self) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("flush_route_cache")?;
        s.cache_flush_count += 1;
        Ok(())
    }
}

// ============================================================================
// MockNfTablesOps
// ============================================================================

#[derive(Debug, Default, Clone)]
pub struct NfTablesState {
    pub table_present: bool,
    pub last_rule: Option<NftRule>,
    pub fail_on: HashMap<String, String>,
}

impl NfTablesState {
    fn check_fail(&self, op: &str) -> Result<(), Error> {
        match self.fail_on.get(op) {
            Some(msg) => Err(Error::NfTables(msg.clone())),
            None => Ok(()),
        }
    }
}

pub struct MockNfTablesOps {
    pub state: Arc<Mutex<NfTablesState>>,
}

impl MockNfTablesOps {
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(NfTablesState::default())) }
    }

    pub fn with_state(state: NfTablesState) -> Self {
        Self { state: Arc::new(Mutex::new(state)) }
    }
}

impl NfTablesOps for MockNfTablesOps {
    fn reset_table(&self, rule: &NftRule) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("reset_table")?;
        s.table_present = true;
        s.last_rule = Some(rule.clone());
        Ok(())
    }

    fn cleanup(&self) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("cleanup")?;
        s.table_present = false;
        s.last_rule = None;
        Ok(())
    }
}

// ============================================================================
// MockProbeOps
// ============================================================================

#[derive(Debug, Default)]
pub struct ProbeState {
    /// Scripted outcome per `(src_ip, dst, dst_port)`. Entries absent from
    /// the map default to success.
    pub results: HashMap<(Ipv4Addr, Ipv4Addr, u16), bool>,
    pub dial_count: u32,
}

#[derive(Clone)]
pub struct MockProbeOps {
    pub state: Arc<Mutex<ProbeState>>,
}

impl MockProbeOps {
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(ProbeState::default())) }
    }

    pub fn with_state(state: ProbeState) -> Self {
        Self { state: Arc::new(Mutex::new(state)) }
    }
}

#[async_trait]
impl ProbeOps for MockProbeOps {
    async fn dial_tcp(
        &self,
        src_ip: Ipv4Addr,
        dst: Ipv4Addr,
        dst_port: u16,
        _timeout: Duration,
    ) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.dial_count += 1;
        match s.results.get(&(src_ip, dst, dst_port)) {
            Some(true) | None => Ok(()),
            Some(false) => Err(Error::ProbeTimeout),
        }
    }
}
