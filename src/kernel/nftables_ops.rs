//! nftables table management for connection marking and masquerade.
//!
//! Generalizes the teacher's `nftables_ops.rs`: the teacher marks traffic
//! for one UID and masquerades one interface; this table marks *new*
//! connections with the active (or affinity-sharded) fwmark and masquerades
//! every interface currently carrying traffic, healthy or draining (spec
//! §4.E). The production implementation keeps the teacher's nftnl+mnl
//! batch-and-send pattern; `reset_table` always deletes-then-recreates
//! rather than diffing, matching the "reissue everything" reconcile model.

use super::Error;

/// What the `loadbalancing` table should contain after one reconcile.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NftRule {
    /// `Some(n)` switches the mangle chain to affinity mode: new
    /// connections are sharded into `n` buckets by a 5-tuple hash, then
    /// OR'd with [`super::constants::ACTIVE_MARK`]. `None` is simple mode:
    /// every new connection gets [`super::constants::ACTIVE_MARK`]
    /// directly.
    pub affinity_shards: Option<u32>,
    /// Interfaces appearing in `Active ∪ Draining` (spec §4.E); one
    /// masquerade rule per interface when `consistent_nat` is on.
    pub masquerade_ifaces: Vec<String>,
    /// When false, a single unconditional masquerade rule replaces the
    /// per-interface ones.
    pub consistent_nat: bool,
}

pub trait NfTablesOps: Send + Sync {
    /// Deletes the `loadbalancing` table if present, then recreates it
    /// from scratch per `rule`. Never partially applied: either the whole
    /// batch lands or none of it does.
    fn reset_table(&self, rule: &NftRule) -> Result<(), Error>;

    /// Deletes the `loadbalancing` table. Absorbs "table does not exist"
    /// (used both mid-reconcile when `Active` is empty, and by the
    /// Supervisor's shutdown cleanup).
    fn cleanup(&self) -> Result<(), Error>;
}

#[cfg(target_os = "linux")]
pub struct RealNfTablesOps;

#[cfg(target_os = "linux")]
impl RealNfTablesOps {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(target_os = "linux")]
impl Default for RealNfTablesOps {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::ffi::CString;

    use nftnl::expr::{self, Immediate, Register};
    use nftnl::nft_expr;
    use nftnl::{Batch, Chain, ChainType, Hook, MsgType, ProtoFamily, Rule, Table};

    use super::super::constants;
    use super::{Error, NfTablesOps, NftRule, RealNfTablesOps};

    const TABLE_NAME: &std::ffi::CStr = c"loadbalancing";
    const MANGLE_CHAIN_NAME: &std::ffi::CStr = c"mangle";
    const NAT_CHAIN_NAME: &std::ffi::CStr = c"postrouting";

    fn send_batch(batch: &nftnl::FinalizedBatch) -> Result<(), Error> {
        let socket = mnl::Socket::new(mnl::Bus::Netfilter)
            .map_err(|e| Error::NfTables(format!("failed to open netlink socket: {e}")))?;
        let portid = socket.portid();

        socket
            .send_all(batch)
            .map_err(|e| Error::NfTables(format!("failed to send batch: {e}")))?;

        let mut buffer = vec![0; nftnl::nft_nlmsg_maxsize() as usize];
        let mut expected_seqs = batch.sequence_numbers();

        while !expected_seqs.is_empty() {
            let messages = socket
                .recv(&mut buffer[..])
                .map_err(|e| Error::NfTables(format!("failed to receive netlink response: {e}")))?;
            for message in messages {
                let message = message.map_err(|e| Error::NfTables(format!("netlink message error: {e}")))?;
                let expected_seq = expected_seqs
                    .next()
                    .ok_or_else(|| Error::NfTables("unexpected ACK from netfilter".into()))?;
                mnl::cb_run(message, expected_seq, portid)
                    .map_err(|e| Error::NfTables(format!("netlink ACK error: {e}")))?;
            }
        }
        Ok(())
    }

    fn delete_table(ignore_enoent: bool) -> Result<(), Error> {
        let table = Table::new(TABLE_NAME, ProtoFamily::Ipv4);
        let mut batch = Batch::new();
        batch.add(&table, MsgType::Del);
        let finalized = batch.finalize();

        match send_batch(&finalized) {
            Ok(()) => Ok(()),
            Err(ref e) if ignore_enoent => {
                let msg = format!("{e}");
                if msg.contains("No such file or directory") || msg.contains("ENOENT") {
                    tracing::debug!("loadbalancing table does not exist, nothing to delete");
                    Ok(())
                } else {
                    Err(Error::NfTables(msg))
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Adds the mangle chain's marking rules for one connection-tracking
    /// protocol: `proto dport != 53 ct state new ct mark set ACTIVE_MARK`.
    fn add_simple_mark_rule(batch: &mut Batch, chain: &Chain, build_proto_match: impl FnOnce(&mut Rule)) {
        let mut rule = Rule::new(chain);
        build_proto_match(&mut rule);
        rule.add_expr(&nft_expr!(ct state));
        rule.add_expr(&nft_expr!(bitwise mask expr::CtState::NEW.bits(), xor 0u32));
        rule.add_expr(&nft_expr!(cmp != 0u32));
        rule.add_expr(&Immediate::new(constants::ACTIVE_MARK, Register::Reg1));
        rule.add_expr(&nft_expr!(ct mark set));
        batch.add(&rule, MsgType::Add);
    }

    impl NfTablesOps for RealNfTablesOps {
        fn reset_table(&self, rule: &NftRule) -> Result<(), Error> {
            let _ = delete_table(true);

            let mut batch = Batch::new();
            let table = Table::new(TABLE_NAME, ProtoFamily::Ipv4);
            batch.add(&table, MsgType::Add);

            let mut mangle_chain = Chain::new(MANGLE_CHAIN_NAME, &table);
            mangle_chain.set_hook(Hook::Route, constants::NFT_MANGLE_HOOK_PRIORITY);
            mangle_chain.set_type(ChainType::Route);
            batch.add(&mangle_chain, MsgType::Add);

            match rule.affinity_shards {
                None => {
                    // Simple mode: TCP/UDP (excluding DNS) and ICMP echo-request,
                    // new conntrack state, get ACTIVE_MARK directly.
                    add_simple_mark_rule(&mut batch, &mangle_chain, |r| {
                        r.add_expr(&nft_expr!(meta l4proto));
                        r.add_expr(&nft_expr!(cmp == libc::IPPROTO_TCP as u8));
                        r.add_expr(&nft_expr!(payload tcp dport));
                        r.add_expr(&nft_expr!(cmp != 53u16));
                    });
                    add_simple_mark_rule(&mut batch, &mangle_chain, |r| {
                        r.add_expr(&nft_expr!(meta l4proto));
                        r.add_expr(&nft_expr!(cmp == libc::IPPROTO_UDP as u8));
                        r.add_expr(&nft_expr!(payload udp dport));
                        r.add_expr(&nft_expr!(cmp != 53u16));
                    });
                    add_simple_mark_rule(&mut batch, &mangle_chain, |r| {
                        r.add_expr(&nft_expr!(meta l4proto));
                        r.add_expr(&nft_expr!(cmp == libc::IPPROTO_ICMP as u8));
                        r.add_expr(&nft_expr!(payload icmp type));
                        r.add_expr(&nft_expr!(cmp == 8u8)); // echo-request
                    });
                }
                Some(shards) => {
                    // Affinity mode: hash the 5-tuple (symmetric for
                    // TCP/UDP, (saddr,daddr) for ICMP) into `shards`
                    // buckets, then OR the active mark onto the low bits.
                    let mut rule = Rule::new(&mangle_chain);
                    rule.add_expr(&nft_expr!(ct state));
                    rule.add_expr(&nft_expr!(bitwise mask expr::CtState::NEW.bits(), xor 0u32));
                    rule.add_expr(&nft_expr!(cmp != 0u32));
                    rule.add_expr(&expr::SymHash {
                        register: Register::Reg1,
                        modulus: shards,
                        offset: 0,
                    });
                    rule.add_expr(&nft_expr!(ct mark set));
                    rule.add_expr(&Immediate::new(constants::ACTIVE_MARK, Register::Reg1));
                    rule.add_expr(&nft_expr!(bitwise mask u32::MAX, xor 0u32));
                    rule.add_expr(&nft_expr!(ct mark set or));
                    batch.add(&rule, MsgType::Add);
                }
            }

            let mut nat_chain = Chain::new(NAT_CHAIN_NAME, &table);
            nat_chain.set_hook(Hook::PostRouting, constants::NFT_POSTROUTING_HOOK_PRIORITY);
            nat_chain.set_type(ChainType::Nat);
            batch.add(&nat_chain, MsgType::Add);

            if rule.consistent_nat {
                for iface in &rule.masquerade_ifaces {
                    let iface_cstr = CString::new(iface.as_str())
                        .map_err(|e| Error::NfTables(format!("invalid interface name {iface:?}: {e}")))?;
                    let mut masq_rule = Rule::new(&nat_chain);
                    masq_rule.add_expr(&nft_expr!(meta oifname));
                    masq_rule.add_expr(&nft_expr!(cmp == expr::InterfaceName::Exact(iface_cstr)));
                    masq_rule.add_expr(&expr::Masquerade::default());
                    batch.add(&masq_rule, MsgType::Add);
                }
            } else {
                let mut masq_rule = Rule::new(&nat_chain);
                masq_rule.add_expr(&expr::Masquerade::default());
                batch.add(&masq_rule, MsgType::Add);
            }

            let finalized = batch.finalize();
            send_batch(&finalized)?;

            tracing::debug!(
                affinity = ?rule.affinity_shards,
                ifaces = ?rule.masquerade_ifaces,
                "loadbalancing nftables table rebuilt"
            );
            Ok(())
        }

        fn cleanup(&self) -> Result<(), Error> {
            delete_table(true)
        }
    }
}
