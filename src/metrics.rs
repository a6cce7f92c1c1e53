//! Per-runtime worker gauges, published through the process-wide
//! [`metrics`] recorder installed by the host.

use metrics::gauge;

use storage_trellis::Namespace;

/// The last round that was fully synced and finalized.
pub const LAST_FINALIZED_ROUND: &str = "trellis_worker_finalized_round";
/// The last round that was synced but not yet finalized.
pub const LAST_SYNCED_ROUND: &str = "trellis_worker_synced_round";
/// The last round that is in flight for syncing.
pub const LAST_PENDING_ROUND: &str = "trellis_worker_pending_round";

pub(crate) fn runtime_label(namespace: &Namespace) -> String {
    hex::encode(namespace)
}

pub(crate) fn set_finalized_round(runtime: &str, round: u64) {
    gauge!(LAST_FINALIZED_ROUND, "runtime" => runtime.to_string()).set(round as f64);
}

pub(crate) fn set_synced_round(runtime: &str, round: u64) {
    gauge!(LAST_SYNCED_ROUND, "runtime" => runtime.to_string()).set(round as f64);
}

pub(crate) fn set_pending_round(runtime: &str, round: u64) {
    gauge!(LAST_PENDING_ROUND, "runtime" => runtime.to_string()).set(round as f64);
}
