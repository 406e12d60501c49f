//! Metric names reported by the agent.

/// Number of routes currently believed programmed.
pub const SYNCED_ROUTES: &str = "switchd.route.synced_routes";

/// Live entries in the next hop group pool.
pub const NEXT_HOP_GROUPS: &str = "switchd.route.next_hop_groups";

/// Pending rows across all consumers after the latest wake.
pub const PENDING_TASKS: &str = "switchd.orch.pending_tasks";
