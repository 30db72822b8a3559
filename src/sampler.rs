//! State Sampler (spec §4.C): derives canonical state `S` from the kernel's
//! default routes and bound source addresses.

use crate::kernel::{Error, NetlinkOps};
use crate::model::{CanonicalState, InterfaceTuple};

/// Scans the main routing table for default routes, resolves each
/// `(iface, gw)` to the interface's first bound IPv4 address, discards
/// tuples missing any of the three fields, and returns the canonically
/// sorted result. Synchronous in spirit, allocation-bounded by the number
/// of default routes (expected ≤ ~8, per spec §4.C).
pub async fn sample(ops: &(impl NetlinkOps + ?Sized)) -> Result<CanonicalState, Error> {
    let defaults = ops.list_default_routes().await?;
    let mut tuples = Vec::with_capacity(defaults.len());

    for route in defaults {
        let Some(src_ip) = ops.primary_ipv4_of(route.if_index).await? else {
            continue;
        };
        tuples.push(InterfaceTuple { iface: route.iface, gw: route.gw, src_ip });
    }

    Ok(CanonicalState::from_tuples(tuples))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::mocks::{MockNetlinkOps, NetlinkState};
    use crate::kernel::{AddrInfo, DefaultRoute};

    #[tokio::test]
    async fn resolves_default_routes_into_canonical_tuples() {
        let ops = MockNetlinkOps::with_state(NetlinkState {
            default_routes: vec![
                DefaultRoute { iface: "wlan0".into(), if_index: 3, gw: "192.168.1.1".parse().unwrap() },
                DefaultRoute { iface: "eth0".into(), if_index: 2, gw: "10.0.0.1".parse().unwrap() },
            ],
            addrs: vec![
                AddrInfo { if_index: 2, addr: "10.0.0.2".parse().unwrap() },
                AddrInfo { if_index: 3, addr: "192.168.1.50".parse().unwrap() },
            ],
            ..Default::default()
        });

        let s = sample(&ops).await.unwrap();
        assert_eq!(s.len(), 2);
        assert_eq!(s.tuples()[0].iface, "eth0");
        assert_eq!(s.tuples()[1].iface, "wlan0");
    }

    #[tokio::test]
    async fn drops_tuples_with_no_bound_address() {
        let ops = MockNetlinkOps::with_state(NetlinkState {
            default_routes: vec![DefaultRoute {
                iface: "usb0".into(),
                if_index: 5,
                gw: "192.168.42.1".parse().unwrap(),
            }],
            addrs: vec![],
            ..Default::default()
        });

        let s = sample(&ops).await.unwrap();
        assert!(s.is_empty());
    }
}
