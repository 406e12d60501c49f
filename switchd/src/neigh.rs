//! Neighbor reconciliation: resolves datastore neighbor entries into
//! hardware next hops, and tracks how many routes and group memberships
//! reference each one.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use switchd_db::{KeyOpFieldValues, TableOp, APPDB_KEY_SEPARATOR};
use switchd_hal::{ObjectId, SwitchHal};
use switchd_net::MacAddr;

use crate::orch::{Consumer, Orch, TaskStatus};

/// A resolved neighbor: its hardware next hop and the number of live routes
/// or group memberships referencing it.
#[derive(Debug, Clone, Copy)]
pub struct NeighborEntry {
    next_hop_id: ObjectId,
    mac: MacAddr,
    ref_count: usize,
}

impl NeighborEntry {
    pub fn next_hop_id(&self) -> ObjectId {
        self.next_hop_id
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count
    }
}

/// The resolved-neighbor registry shared between the neighbor orchestrator,
/// the route reconciler, and the next hop group pool.
#[derive(Debug, Default)]
pub struct NeighborTable {
    entries: HashMap<IpAddr, NeighborEntry>,
}

impl NeighborTable {
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.entries.contains_key(&ip)
    }

    pub fn get(&self, ip: IpAddr) -> Option<NeighborEntry> {
        self.entries.get(&ip).copied()
    }

    /// The hardware next hop for a resolved neighbor.
    pub fn next_hop_id(&self, ip: IpAddr) -> Option<ObjectId> {
        self.entries.get(&ip).map(|e| e.next_hop_id)
    }

    pub fn insert(&mut self, ip: IpAddr, next_hop_id: ObjectId, mac: MacAddr) {
        self.entries.insert(
            ip,
            NeighborEntry {
                next_hop_id,
                mac,
                ref_count: 0,
            },
        );
    }

    pub fn remove(&mut self, ip: IpAddr) -> Option<NeighborEntry> {
        self.entries.remove(&ip)
    }

    pub fn increase_ref(&mut self, ip: IpAddr) {
        self.entries
            .get_mut(&ip)
            .unwrap_or_else(|| panic!("increasing ref count of unresolved next hop {ip}"))
            .ref_count += 1;
    }

    pub fn decrease_ref(&mut self, ip: IpAddr) {
        let entry = self
            .entries
            .get_mut(&ip)
            .unwrap_or_else(|| panic!("decreasing ref count of unresolved next hop {ip}"));
        assert!(entry.ref_count > 0, "next hop {ip} ref count underflow");
        entry.ref_count -= 1;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub type SharedNeighbors = Arc<Mutex<NeighborTable>>;

/// A fresh, empty shared neighbor table.
pub fn shared_neighbors() -> SharedNeighbors {
    Arc::new(Mutex::new(NeighborTable::default()))
}

/// Reconciles `NEIGH_TABLE` rows (`<ifname>:<ip>` keys with a `neigh` MAC
/// field) into hardware next hop objects.
pub struct NeighOrch {
    hal: Arc<dyn SwitchHal>,
    neighbors: SharedNeighbors,
}

impl NeighOrch {
    pub fn new(hal: Arc<dyn SwitchHal>, neighbors: SharedNeighbors) -> Self {
        NeighOrch { hal, neighbors }
    }

    pub fn neighbors(&self) -> &SharedNeighbors {
        &self.neighbors
    }

    fn handle_row(&mut self, row: &KeyOpFieldValues) -> TaskStatus {
        let Some((_ifname, ip_part)) = row.key.split_once(APPDB_KEY_SEPARATOR) else {
            warn!(key = %row.key, "malformed neighbor key");
            return TaskStatus::Invalid;
        };
        let ip: IpAddr = match ip_part.parse() {
            Ok(ip) => ip,
            Err(_) => {
                warn!(key = %row.key, "malformed neighbor address");
                return TaskStatus::Invalid;
            }
        };

        match row.op {
            TableOp::Set => {
                let mac: MacAddr = match row.field("neigh").unwrap_or("").parse() {
                    Ok(mac) => mac,
                    Err(error) => {
                        warn!(%ip, %error, "neighbor entry without a usable MAC");
                        return TaskStatus::Invalid;
                    }
                };
                {
                    let mut neighbors = self.neighbors.lock();
                    if let Some(entry) = neighbors.entries.get_mut(&ip) {
                        // MAC move; the next hop object stays.
                        entry.mac = mac;
                        return TaskStatus::Success;
                    }
                }
                match self.hal.create_next_hop(ip) {
                    Ok(next_hop_id) => {
                        self.neighbors.lock().insert(ip, next_hop_id, mac);
                        info!(%ip, %mac, %next_hop_id, "added neighbor next hop");
                        TaskStatus::Success
                    }
                    Err(error) => {
                        warn!(%ip, %error, "failed to create next hop");
                        TaskStatus::NeedRetry
                    }
                }
            }
            TableOp::Del => {
                let entry = self.neighbors.lock().get(ip);
                match entry {
                    None => TaskStatus::Success,
                    Some(entry) if entry.ref_count() > 0 => {
                        debug!(%ip, refs = entry.ref_count(), "neighbor still referenced");
                        TaskStatus::NeedRetry
                    }
                    Some(entry) => match self.hal.remove_next_hop(entry.next_hop_id()) {
                        Ok(()) => {
                            self.neighbors.lock().remove(ip);
                            info!(%ip, "removed neighbor next hop");
                            TaskStatus::Success
                        }
                        Err(error) => {
                            warn!(%ip, %error, "failed to remove next hop");
                            TaskStatus::NeedRetry
                        }
                    },
                }
            }
        }
    }
}

impl Orch for NeighOrch {
    fn name(&self) -> &'static str {
        "neigh"
    }

    fn process(&mut self, consumer: &mut Consumer) {
        let keys: Vec<String> = consumer.pending().keys().cloned().collect();
        for key in keys {
            let Some(row) = consumer.pending().get(&key).cloned() else {
                continue;
            };
            match self.handle_row(&row) {
                TaskStatus::NeedRetry => {}
                TaskStatus::Success | TaskStatus::Invalid | TaskStatus::Ignore => {
                    consumer.pending_mut().shift_remove(&key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use switchd_db::{Datastore, FieldValues, APP_NEIGH_TABLE};
    use switchd_hal::VirtualSwitchHal;

    use super::*;

    fn neigh_row(key: &str, mac: &str) -> KeyOpFieldValues {
        KeyOpFieldValues::set(
            key,
            FieldValues::from_iter([("neigh".to_owned(), mac.to_owned())]),
        )
    }

    struct Fixture {
        hal: Arc<VirtualSwitchHal>,
        orch: NeighOrch,
        consumer: Consumer,
        _store: Datastore,
    }

    fn setup() -> Fixture {
        let store = Datastore::new();
        let hal = Arc::new(VirtualSwitchHal::new());
        let orch = NeighOrch::new(hal.clone(), shared_neighbors());
        let consumer = Consumer::new(store.subscribe(APP_NEIGH_TABLE), 0);
        Fixture {
            hal,
            orch,
            consumer,
            _store: store,
        }
    }

    #[test]
    fn set_resolves_a_next_hop() {
        let mut f = setup();
        f.consumer
            .ingest(neigh_row("Ethernet0:1.1.1.1", "00:11:22:33:44:55"));
        f.orch.process(&mut f.consumer);

        assert!(f.consumer.pending().is_empty());
        assert_eq!(f.hal.next_hop_count(), 1);
        let neighbors = f.orch.neighbors().lock();
        let entry = neighbors.get("1.1.1.1".parse().unwrap()).unwrap();
        assert_eq!(entry.mac().to_string(), "00:11:22:33:44:55");
        assert_eq!(entry.ref_count(), 0);
    }

    #[test]
    fn mac_move_keeps_the_next_hop_object() {
        let mut f = setup();
        f.consumer
            .ingest(neigh_row("Ethernet0:1.1.1.1", "00:11:22:33:44:55"));
        f.orch.process(&mut f.consumer);
        let before = f
            .orch
            .neighbors()
            .lock()
            .next_hop_id("1.1.1.1".parse().unwrap());

        f.consumer
            .ingest(neigh_row("Ethernet0:1.1.1.1", "66:77:88:99:aa:bb"));
        f.orch.process(&mut f.consumer);

        let neighbors = f.orch.neighbors().lock();
        let entry = neighbors.get("1.1.1.1".parse().unwrap()).unwrap();
        assert_eq!(Some(entry.next_hop_id()), before);
        assert_eq!(entry.mac().to_string(), "66:77:88:99:aa:bb");
        assert_eq!(f.hal.next_hop_count(), 1);
    }

    #[test]
    fn referenced_neighbor_removal_is_retried() {
        let mut f = setup();
        f.consumer
            .ingest(neigh_row("Ethernet0:1.1.1.1", "00:11:22:33:44:55"));
        f.orch.process(&mut f.consumer);

        let ip: IpAddr = "1.1.1.1".parse().unwrap();
        f.orch.neighbors().lock().increase_ref(ip);

        f.consumer.ingest(KeyOpFieldValues::del("Ethernet0:1.1.1.1"));
        f.orch.process(&mut f.consumer);
        assert_eq!(f.consumer.pending().len(), 1);
        assert_eq!(f.hal.next_hop_count(), 1);

        f.orch.neighbors().lock().decrease_ref(ip);
        f.orch.process(&mut f.consumer);
        assert!(f.consumer.pending().is_empty());
        assert_eq!(f.hal.next_hop_count(), 0);
        assert!(f.orch.neighbors().lock().is_empty());
    }

    #[test]
    fn malformed_rows_are_dropped() {
        let mut f = setup();
        f.consumer.ingest(neigh_row("no-separator", "00:11:22:33:44:55"));
        f.consumer
            .ingest(neigh_row("Ethernet0:not-an-ip", "00:11:22:33:44:55"));
        f.consumer.ingest(neigh_row("Ethernet0:2.2.2.2", "bogus"));
        f.orch.process(&mut f.consumer);

        assert!(f.consumer.pending().is_empty());
        assert_eq!(f.hal.next_hop_count(), 0);
    }

    #[test]
    fn del_of_unknown_neighbor_succeeds() {
        let mut f = setup();
        f.consumer.ingest(KeyOpFieldValues::del("Ethernet0:9.9.9.9"));
        f.orch.process(&mut f.consumer);
        assert!(f.consumer.pending().is_empty());
    }
}
