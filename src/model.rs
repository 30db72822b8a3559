//! Data model shared across the sampler, health monitor, and reconciler.
//!
//! Mirrors the teacher's `netlink_ops::RouteSpec`/`RuleSpec` split: domain
//! types decoupled from the netlink wire format so the reconciler and its
//! tests never touch `rtnetlink` directly.

use std::net::Ipv4Addr;

/// One observed default route: `(iface, gw, src_ip)`.
///
/// Produced only from default routes present in the main table that have
/// both `via` and `dev` (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InterfaceTuple {
    pub iface: String,
    pub gw: Ipv4Addr,
    pub src_ip: Ipv4Addr,
}

impl InterfaceTuple {
    /// The sort/equality key used for canonicalization: `"iface,gw,src_ip"`.
    fn sort_key(&self) -> String {
        format!("{},{},{}", self.iface, self.gw, self.src_ip)
    }
}

/// Canonical state `S`: tuples sorted lexicographically by
/// `"iface,gw,src_ip"`. Equality of two `CanonicalState`s is the criterion
/// for "no change" (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CanonicalState(Vec<InterfaceTuple>);

impl CanonicalState {
    /// Builds a canonical state from an unordered set of tuples.
    pub fn from_tuples(mut tuples: Vec<InterfaceTuple>) -> Self {
        tuples.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        CanonicalState(tuples)
    }

    pub fn tuples(&self) -> &[InterfaceTuple] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InterfaceTuple> {
        self.0.iter()
    }
}

/// Liveness status of one interface's health state machine (spec §3/§4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Up,
    Down,
    Backoff,
    HoldDown,
}

impl Default for Status {
    fn default() -> Self {
        Status::Up
    }
}
