//! Kernel Adapter (spec §4.A): a thin, testable facade over routing-table,
//! rule, neighbor, link, and nftables operations.
//!
//! Split into three traits, following the teacher's `NetlinkOps`/
//! `NfTablesOps` decomposition: [`NetlinkOps`] for route/rule/link/address/
//! neighbor operations, [`NfTablesOps`] for the firewall table, and
//! [`ProbeOps`] for the TCP reachability probe. Every operation is
//! best-effort idempotent: "delete if present", "create if missing".
//! Unexpected errors surface to the caller; the Reconciler logs and
//! continues rather than treating them as fatal.

use thiserror::Error;

pub mod constants;
pub mod netlink_ops;
pub mod nftables_ops;
pub mod probe;

#[cfg(test)]
pub mod mocks;

pub use netlink_ops::{
    AddrInfo, DefaultRoute, LinkInfo, MultipathRouteSpec, NeighborState, Nexthop, NetlinkOps,
    RouteSpec, RuleSelector, RuleSpec,
};
pub use nftables_ops::{NfTablesOps, NftRule};
pub use probe::ProbeOps;

#[cfg(target_os = "linux")]
pub use netlink_ops::RealNetlinkOps;
#[cfg(target_os = "linux")]
pub use nftables_ops::RealNfTablesOps;
pub use probe::RealProbeOps;

#[derive(Debug, Error)]
pub enum Error {
    #[error("general error: {0}")]
    General(String),

    #[cfg(target_os = "linux")]
    #[error("rtnetlink error: {0}")]
    Rtnetlink(#[from] rtnetlink::Error),

    #[error("nftables error: {0}")]
    NfTables(String),

    #[error("probe timed out")]
    ProbeTimeout,

    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

/// Convenience bundle of the three kernel-facing traits, so call sites that
/// need the full adapter (the Reconciler, the Supervisor's cleanup path)
/// can take one generic parameter set instead of three.
pub trait KernelAdapter: NetlinkOps + NfTablesOps + ProbeOps {}
impl<T: NetlinkOps + NfTablesOps + ProbeOps> KernelAdapter for T {}
