//! The route bulker: coalesces per-row create/set/remove mutations and
//! flushes them as bulk hardware calls.

use indexmap::{IndexMap, IndexSet};
use tracing::warn;

use switchd_hal::{BulkOpMode, HalStatus, RouteAttribute, RouteEntry, SwitchHal};

type EntryMap = IndexMap<RouteEntry, Vec<RouteAttribute>, ahash::RandomState>;
type EntrySet = IndexSet<RouteEntry, ahash::RandomState>;

/// Accumulates route mutations between flushes.
///
/// A prefix is never pending in both `creating` and `removing`: removing a
/// pending create cancels it outright, and a create over a pending remove
/// supersedes the remove. Attribute sets against a pending create fold into
/// the create's attribute list; all other sets accumulate in order,
/// duplicates included.
#[derive(Default)]
pub struct RouteBulker {
    creating: EntryMap,
    setting: EntryMap,
    removing: EntrySet,
}

impl RouteBulker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_route(&mut self, entry: RouteEntry, attrs: Vec<RouteAttribute>) {
        self.removing.shift_remove(&entry);
        self.creating.entry(entry).or_insert(attrs);
    }

    pub fn set_route_attribute(&mut self, entry: RouteEntry, attr: RouteAttribute) {
        if let Some(pending) = self.creating.get_mut(&entry) {
            pending.push(attr);
        } else {
            self.setting.entry(entry).or_default().push(attr);
        }
    }

    pub fn remove_route(&mut self, entry: RouteEntry) {
        self.setting.shift_remove(&entry);
        if self.creating.shift_remove(&entry).is_none() {
            self.removing.insert(entry);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.creating.is_empty() && self.setting.is_empty() && self.removing.is_empty()
    }

    pub fn clear(&mut self) {
        self.creating.clear();
        self.setting.clear();
        self.removing.clear();
    }

    /// Issues the accumulated mutations: removes first (a replaced prefix
    /// frees its slot before the replacement allocates), then creates, then
    /// sets. Per-row failures are logged and all pending state is cleared
    /// either way; failed rows come back through the datastore resync
    /// protocol.
    pub fn flush(&mut self, hal: &dyn SwitchHal) {
        if !self.removing.is_empty() {
            let entries: Vec<RouteEntry> = self.removing.drain(..).collect();
            let statuses = hal.bulk_remove_routes(&entries, BulkOpMode::IgnoreError);
            log_failures("remove", &entries, &statuses);
        }

        if !self.creating.is_empty() {
            let (entries, attrs): (Vec<RouteEntry>, Vec<Vec<RouteAttribute>>) =
                self.creating.drain(..).unzip();
            let statuses = hal.bulk_create_routes(&entries, &attrs, BulkOpMode::IgnoreError);
            log_failures("create", &entries, &statuses);
        }

        if !self.setting.is_empty() {
            // Expand each prefix's attribute vector into one row per
            // attribute so bulk-set receives parallel arrays.
            let mut entries = Vec::new();
            let mut attrs = Vec::new();
            for (entry, pending) in self.setting.drain(..) {
                for attr in pending {
                    entries.push(entry);
                    attrs.push(attr);
                }
            }
            let statuses = hal.bulk_set_route_attribute(&entries, &attrs, BulkOpMode::IgnoreError);
            log_failures("set", &entries, &statuses);
        }
    }
}

fn log_failures(op: &str, entries: &[RouteEntry], statuses: &[HalStatus]) {
    for (entry, status) in entries.iter().zip(statuses) {
        if !status.is_success() {
            warn!(destination = %entry.destination, %status, "bulk route {op} failed");
        }
    }
}
