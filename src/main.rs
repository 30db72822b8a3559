//! Multipath egress load balancer reconciliation daemon.
//!
//! Entry point: parses the ambient CLI, reads configuration, wires up the
//! Kernel Adapter against a live `rtnetlink` connection, cleans up any
//! state left behind by a prior crash, then hands off to the [`Supervisor`]
//! until it is signaled to stop.

#[cfg(target_os = "linux")]
use std::net::Ipv4Addr;
#[cfg(target_os = "linux")]
use std::time::Duration;

#[cfg(target_os = "linux")]
use async_trait::async_trait;

mod cli;
mod config;
mod error;
mod health;
mod kernel;
mod logging;
mod model;
mod observer;
mod reconciler;
mod sampler;
mod supervisor;

#[cfg(target_os = "linux")]
use kernel::{
    AddrInfo, DefaultRoute, Error as KernelError, LinkInfo, MultipathRouteSpec, NeighborState,
    NetlinkOps, NfTablesOps, NftRule, ProbeOps, RouteSpec, RuleSpec,
};
#[cfg(target_os = "linux")]
use supervisor::Supervisor;

// Avoid musl's default allocator due to degraded performance under the
// small, latency-sensitive allocation pattern of a routing daemon.
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Binds the three real Kernel Adapter implementations together behind one
/// type, so [`Supervisor`] only needs one generic parameter. Mirrors the
/// teacher's pattern of a single `Routing` façade wrapping its per-concern
/// ops structs.
#[cfg(target_os = "linux")]
struct RealKernel {
    netlink: kernel::RealNetlinkOps,
    nft: kernel::RealNfTablesOps,
    probe: kernel::RealProbeOps,
}

#[cfg(target_os = "linux")]
#[async_trait]
impl NetlinkOps for RealKernel {
    async fn route_add(&self, r: &RouteSpec) -> Result<(), KernelError> { self.netlink.route_add(r).await }
    async fn route_del(&self, r: &RouteSpec) -> Result<(), KernelError> { self.netlink.route_del(r).await }
    async fn route_replace_multipath(&self, r: &MultipathRouteSpec) -> Result<(), KernelError> {
        self.netlink.route_replace_multipath(r).await
    }
    async fn flush_table(&self, t: u32) -> Result<(), KernelError> { self.netlink.flush_table(t).await }
    async fn rule_add(&self, r: &RuleSpec) -> Result<(), KernelError> { self.netlink.rule_add(r).await }
    async fn rule_del_at_priority(&self, p: u32) -> Result<(), KernelError> { self.netlink.rule_del_at_priority(p).await }
    async fn rule_list_v4(&self) -> Result<Vec<RuleSpec>, KernelError> { self.netlink.rule_list_v4().await }
    async fn link_list(&self) -> Result<Vec<LinkInfo>, KernelError> { self.netlink.link_list().await }
    async fn addr_list_v4(&self) -> Result<Vec<AddrInfo>, KernelError> { self.netlink.addr_list_v4().await }
    async fn list_default_routes(&self) -> Result<Vec<DefaultRoute>, KernelError> { self.netlink.list_default_routes().await }
    async fn primary_ipv4_of(&self, i: u32) -> Result<Option<Ipv4Addr>, KernelError> { self.netlink.primary_ipv4_of(i).await }
    async fn neighbor_state(&self, i: u32, gw: Ipv4Addr) -> Result<NeighborState, KernelError> {
        self.netlink.neighbor_state(i, gw).await
    }
    async fn neighbor_flush(&self, i: u32, gw: Ipv4Addr) -> Result<(), KernelError> { self.netlink.neighbor_flush(i, gw).await }
    async fn flush_route_cache(&self) -> Result<(), KernelError> { self.netlink.flush_route_cache().await }
}

#[cfg(target_os = "linux")]
impl NfTablesOps for RealKernel {
    fn reset_table(&self, rule: &NftRule) -> Result<(), KernelError> { self.nft.reset_table(rule) }
    fn cleanup(&self) -> Result<(), KernelError> { self.nft.cleanup() }
}

#[cfg(target_os = "linux")]
#[async_trait]
impl ProbeOps for RealKernel {
    async fn dial_tcp(&self, src: Ipv4Addr, dst: Ipv4Addr, port: u16, timeout: Duration) -> Result<(), KernelError> {
        self.probe.dial_tcp(src, dst, port, timeout).await
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    logging::init();

    match try_main().await {
        Ok(code) => std::process::ExitCode::from(code as u8),
        Err(err) => {
            tracing::error!(error = ?err, "startup failed");
            std::process::ExitCode::from(exitcode::SOFTWARE as u8)
        }
    }
}

/// Fallible startup path: reading configuration and opening the rtnetlink
/// connection can fail before there is a [`Supervisor`] to hand control
/// to. Everything after that point is the Supervisor's own responsibility
/// (spec §7: no failure past startup is fatal).
async fn try_main() -> Result<i32, error::Error> {
    let args = cli::parse();
    let cfg = config::read(&args.config_path).await?;

    #[cfg(target_os = "linux")]
    {
        let (connection, handle, _) = rtnetlink::new_connection().map_err(kernel::Error::from)?;
        tokio::spawn(connection);

        let kernel = RealKernel {
            netlink: kernel::RealNetlinkOps::new(handle),
            nft: kernel::RealNfTablesOps::new(),
            probe: kernel::RealProbeOps::new(),
        };

        // Best-effort cleanup of state left behind by a prior crash, before
        // the first reconcile programs fresh state (spec §7: configuration
        // inconsistency and stale state are reported, not treated as fatal).
        let _ = kernel.nft.cleanup();

        let observer = observer::subscribe().map_err(error::Error::IO)?;
        let supervisor = Supervisor::new(kernel, cfg);
        Ok(supervisor.run(Box::pin(observer)).await)
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = cfg;
        Err(error::Error::General("this daemon requires Linux (rtnetlink/nftables)".into()))
    }
}
