//! Kernel contract constants (spec §6, §9).
//!
//! Hard-coded ranges referenced from both the reconcile path and the
//! supervisor's cleanup path, the way the teacher keeps `TABLE_ID`,
//! `FW_MARK`, and `RULE_PRIORITY` as crate constants used from both setup
//! and teardown. These numbers are part of the external contract: the
//! external uninstaller flushes `100..110` and `200..210` and depends on
//! them never moving without a matching change there.

/// Base of the per-interface return table range / rule priority range.
pub const RETURN_BASE: u32 = 100;
/// Per-interface return tables and rule priorities occupy `100..RETURN_LIMIT`.
pub const RETURN_LIMIT: u32 = 110;

/// Table id for the active overlay (`LB_TABLE`), and base rule priority
/// (`LB_PREF`). Both are config-overridable; these are only the defaults
/// baked into [`crate::config::Config::default`].
pub const DEFAULT_LB_TABLE: u32 = 200;
pub const DEFAULT_LB_PREF: u32 = 90;

/// Draining overlay is `lb_table + 1`.
pub const DRAINING_TABLE_OFFSET: u32 = 1;
/// Draining rule priority is `lb_pref + 1`.
pub const DRAINING_PREF_OFFSET: u32 = 1;

/// Affinity shards occupy `lb_table+2 ..= lb_table+10`.
pub const AFFINITY_TABLE_OFFSET_START: u32 = 2;
pub const AFFINITY_TABLE_OFFSET_END: u32 = 10;

/// Cleanup range for the whole overlay table block, `lb_table..lb_table+10`.
pub const CLEANUP_TABLE_SPAN: u32 = 10;

/// fwmark applied to new connections selecting the active table.
pub const ACTIVE_MARK: u32 = 0x2000_0000;
/// fwmark applied to connections draining through the unhealthy table.
pub const DRAINING_MARK: u32 = 0x1000_0000;
/// Mask used to recover the affinity shard index from a marked packet.
pub const AFFINITY_MASK: u32 = 0x0000_FFFF;

pub const NFT_MANGLE_HOOK_PRIORITY: i32 = -150;
pub const NFT_POSTROUTING_HOOK_PRIORITY: i32 = 100;

/// Interface-name weight heuristic for multipath nexthops (spec §4.E).
pub fn interface_weight(iface: &str) -> u32 {
    let starts_with_any = |prefixes: &[&str]| prefixes.iter().any(|p| iface.starts_with(p));
    if starts_with_any(&["eno", "ens", "enp", "eth"]) {
        5
    } else if starts_with_any(&["wlan", "wlp", "wlx", "wl"]) {
        3
    } else if starts_with_any(&["enx"]) {
        2
    } else {
        1
    }
}
