//! The next hop group pool: a reference-counted cache of ECMP groups keyed
//! by the set of member next hop addresses.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use metrics::gauge;
use thiserror::Error;
use tracing::{debug, info, warn};

use switchd_hal::{HalError, ObjectId, SwitchAttrId, SwitchHal};
use switchd_net::NextHopSet;

use crate::neigh::SharedNeighbors;
use crate::recorded;

/// Fallback group capacity when the switch cannot report one.
pub const DEFAULT_NUMBER_OF_ECMP_GROUPS: u32 = 128;
/// Assumed maximum members per group, used to normalize reported capacity.
pub const DEFAULT_MAX_ECMP_GROUP_SIZE: u32 = 32;
/// Platforms whose reported capacity assumes single-member groups.
pub const MLNX_PLATFORM_SUBSTRING: &str = "mellanox";

#[derive(Debug, Error)]
pub enum GroupError {
    #[error("next hop {0} is not resolved")]
    UnresolvedNextHop(IpAddr),

    #[error("next hop group capacity reached ({0} groups)")]
    CapacityReached(usize),

    #[error(transparent)]
    Hal(#[from] HalError),
}

/// Queries the chip's ECMP group capacity, falling back to a default when
/// the switch cannot answer.
pub fn discover_group_capacity(hal: &dyn SwitchHal, platform: &str) -> u32 {
    match hal.get_switch_attribute(SwitchAttrId::NumberOfEcmpGroups) {
        Ok(value) => {
            let mut capacity = value as u32;
            // Some chips report capacity under the assumption of
            // single-member groups; normalize to the maximum group size.
            if platform.contains(MLNX_PLATFORM_SUBSTRING) {
                capacity /= DEFAULT_MAX_ECMP_GROUP_SIZE;
            }
            capacity
        }
        Err(error) => {
            warn!(
                %error,
                default = DEFAULT_NUMBER_OF_ECMP_GROUPS,
                "failed to query ECMP group capacity, using default"
            );
            DEFAULT_NUMBER_OF_ECMP_GROUPS
        }
    }
}

struct GroupEntry {
    id: ObjectId,
    member_ids: Vec<ObjectId>,
    ref_count: usize,
}

struct PendingRemoval {
    group: ObjectId,
    members: Vec<ObjectId>,
}

/// The shared pool of hardware ECMP groups.
///
/// Lookup is by set equality of the member addresses, so member order never
/// matters. An entry exists only while its reference count is at least one;
/// releasing the last reference retires the entry and schedules the hardware
/// objects for removal at the next [`NextHopGroupPool::flush_removals`].
pub struct NextHopGroupPool {
    hal: Arc<dyn SwitchHal>,
    neighbors: SharedNeighbors,
    groups: HashMap<NextHopSet, GroupEntry>,
    pending_removals: Vec<PendingRemoval>,
    max_groups: usize,
}

impl NextHopGroupPool {
    pub fn new(hal: Arc<dyn SwitchHal>, neighbors: SharedNeighbors, max_groups: usize) -> Self {
        NextHopGroupPool {
            hal,
            neighbors,
            groups: HashMap::new(),
            pending_removals: Vec::new(),
            max_groups,
        }
    }

    pub fn has(&self, ips: &NextHopSet) -> bool {
        self.groups.contains_key(ips)
    }

    pub fn id(&self, ips: &NextHopSet) -> Option<ObjectId> {
        self.groups.get(ips).map(|e| e.id)
    }

    pub fn ref_count(&self, ips: &NextHopSet) -> Option<usize> {
        self.groups.get(ips).map(|e| e.ref_count)
    }

    pub fn refcount_is_zero(&self, ips: &NextHopSet) -> bool {
        self.groups.get(ips).map_or(true, |e| e.ref_count == 0)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn max_groups(&self) -> usize {
        self.max_groups
    }

    pub fn has_pending_removals(&self) -> bool {
        !self.pending_removals.is_empty()
    }

    /// Returns the group for this member set, creating it when absent. The
    /// returned id carries one reference owned by the caller.
    ///
    /// Creation is all-or-nothing: if any member is unresolved or the pool
    /// is full, nothing is allocated.
    pub fn get_or_create(&mut self, ips: &NextHopSet) -> Result<ObjectId, GroupError> {
        if let Some(entry) = self.groups.get_mut(ips) {
            entry.ref_count += 1;
            return Ok(entry.id);
        }

        let mut next_hop_ids = Vec::with_capacity(ips.len());
        {
            let neighbors = self.neighbors.lock();
            for ip in ips.iter() {
                match neighbors.next_hop_id(ip) {
                    Some(id) => next_hop_ids.push(id),
                    None => return Err(GroupError::UnresolvedNextHop(ip)),
                }
            }
        }

        // Retired groups still occupy hardware slots until flushed.
        if self.groups.len() + self.pending_removals.len() >= self.max_groups {
            return Err(GroupError::CapacityReached(self.max_groups));
        }

        let group = self.hal.create_next_hop_group()?;
        let mut member_ids = Vec::with_capacity(next_hop_ids.len());
        for next_hop in next_hop_ids {
            match self.hal.create_next_hop_group_member(group, next_hop) {
                Ok(member) => member_ids.push(member),
                Err(error) => {
                    // Unwind the half-built group.
                    for member in member_ids {
                        let _ = self.hal.remove_next_hop_group_member(member);
                    }
                    let _ = self.hal.remove_next_hop_group(group);
                    return Err(error.into());
                }
            }
        }

        {
            let mut neighbors = self.neighbors.lock();
            for ip in ips.iter() {
                neighbors.increase_ref(ip);
            }
        }

        info!(%group, next_hops = %ips, "created next hop group");
        self.groups.insert(
            ips.clone(),
            GroupEntry {
                id: group,
                member_ids,
                ref_count: 1,
            },
        );
        gauge!(recorded::NEXT_HOP_GROUPS).set(self.groups.len() as f64);
        Ok(group)
    }

    /// Takes an additional reference on an existing group.
    pub fn acquire(&mut self, ips: &NextHopSet) {
        self.groups
            .get_mut(ips)
            .unwrap_or_else(|| panic!("acquiring unknown next hop group {ips}"))
            .ref_count += 1;
    }

    /// Drops one reference. When the count reaches zero the entry is
    /// retired: member neighbor references are dropped and the hardware
    /// objects are queued for removal. Returns whether the group was
    /// retired.
    pub fn release(&mut self, ips: &NextHopSet) -> bool {
        let entry = self
            .groups
            .get_mut(ips)
            .unwrap_or_else(|| panic!("releasing unknown next hop group {ips}"));
        assert!(entry.ref_count > 0, "next hop group {ips} ref count underflow");
        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            return false;
        }

        let entry = self.groups.remove(ips).expect("entry was just present");
        {
            let mut neighbors = self.neighbors.lock();
            for ip in ips.iter() {
                neighbors.decrease_ref(ip);
            }
        }
        debug!(group = %entry.id, next_hops = %ips, "retiring next hop group");
        self.pending_removals.push(PendingRemoval {
            group: entry.id,
            members: entry.member_ids,
        });
        gauge!(recorded::NEXT_HOP_GROUPS).set(self.groups.len() as f64);
        true
    }

    /// Removes retired groups from the hardware. Called after the route
    /// bulker has flushed, so no route still points at them. Attempts every
    /// removal and returns the first failure.
    pub fn flush_removals(&mut self) -> Result<(), HalError> {
        let mut result = Ok(());
        for removal in std::mem::take(&mut self.pending_removals) {
            for member in removal.members {
                if let Err(error) = self.hal.remove_next_hop_group_member(member) {
                    if result.is_ok() {
                        result = Err(error);
                    }
                }
            }
            if let Err(error) = self.hal.remove_next_hop_group(removal.group) {
                if result.is_ok() {
                    result = Err(error);
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use switchd_hal::VirtualSwitchHal;
    use switchd_net::MacAddr;

    use super::*;
    use crate::neigh::shared_neighbors;

    struct Fixture {
        hal: Arc<VirtualSwitchHal>,
        neighbors: SharedNeighbors,
        pool: NextHopGroupPool,
    }

    fn setup(max_groups: usize) -> Fixture {
        let hal = Arc::new(VirtualSwitchHal::new());
        let neighbors = shared_neighbors();
        let pool = NextHopGroupPool::new(hal.clone(), neighbors.clone(), max_groups);
        Fixture {
            hal,
            neighbors,
            pool,
        }
    }

    fn resolve(f: &Fixture, ip: &str) {
        let ip: IpAddr = ip.parse().unwrap();
        let id = f.hal.create_next_hop(ip).unwrap();
        f.neighbors.lock().insert(ip, id, MacAddr::default());
    }

    fn set(ips: &str) -> NextHopSet {
        ips.parse().unwrap()
    }

    #[test]
    fn get_or_create_is_all_or_nothing() {
        let mut f = setup(8);
        resolve(&f, "1.1.1.1");

        let err = f.pool.get_or_create(&set("1.1.1.1,2.2.2.2")).unwrap_err();
        assert!(matches!(err, GroupError::UnresolvedNextHop(_)));
        assert_eq!(f.hal.group_count(), 0);
        assert_eq!(f.hal.member_count(), 0);
        // No member neighbor reference was taken either.
        assert_eq!(
            f.neighbors.lock().get("1.1.1.1".parse().unwrap()).unwrap().ref_count(),
            0
        );
    }

    #[test]
    fn lookup_is_order_independent() {
        let mut f = setup(8);
        resolve(&f, "1.1.1.1");
        resolve(&f, "2.2.2.2");

        let id = f.pool.get_or_create(&set("1.1.1.1,2.2.2.2")).unwrap();
        let again = f.pool.get_or_create(&set("2.2.2.2,1.1.1.1")).unwrap();
        assert_eq!(id, again);
        assert_eq!(f.pool.len(), 1);
        assert_eq!(f.pool.ref_count(&set("1.1.1.1,2.2.2.2")), Some(2));
        assert_eq!(f.hal.group_count(), 1);
        assert_eq!(f.hal.member_count(), 2);
    }

    #[test]
    fn members_take_neighbor_references() {
        let mut f = setup(8);
        resolve(&f, "1.1.1.1");
        resolve(&f, "2.2.2.2");
        let ips = set("1.1.1.1,2.2.2.2");

        f.pool.get_or_create(&ips).unwrap();
        assert_eq!(
            f.neighbors.lock().get("1.1.1.1".parse().unwrap()).unwrap().ref_count(),
            1
        );

        assert!(f.pool.release(&ips));
        assert_eq!(
            f.neighbors.lock().get("1.1.1.1".parse().unwrap()).unwrap().ref_count(),
            0
        );
    }

    #[test]
    fn release_retires_at_zero_and_flush_removes_hardware() {
        let mut f = setup(8);
        resolve(&f, "1.1.1.1");
        resolve(&f, "2.2.2.2");
        let ips = set("1.1.1.1,2.2.2.2");

        f.pool.get_or_create(&ips).unwrap();
        f.pool.acquire(&ips);
        assert!(!f.pool.release(&ips));
        assert!(f.pool.has(&ips));

        assert!(f.pool.release(&ips));
        assert!(!f.pool.has(&ips));
        assert!(f.pool.refcount_is_zero(&ips));
        assert!(f.pool.has_pending_removals());
        // Hardware objects linger until the flush point.
        assert_eq!(f.hal.group_count(), 1);

        f.pool.flush_removals().unwrap();
        assert_eq!(f.hal.group_count(), 0);
        assert_eq!(f.hal.member_count(), 0);
    }

    #[test]
    fn capacity_counts_retired_but_unflushed_groups() {
        let mut f = setup(1);
        resolve(&f, "1.1.1.1");
        resolve(&f, "2.2.2.2");
        resolve(&f, "3.3.3.3");

        let first = set("1.1.1.1,2.2.2.2");
        f.pool.get_or_create(&first).unwrap();
        assert!(matches!(
            f.pool.get_or_create(&set("1.1.1.1,3.3.3.3")),
            Err(GroupError::CapacityReached(1))
        ));

        f.pool.release(&first);
        // Still occupied until flushed.
        assert!(matches!(
            f.pool.get_or_create(&set("1.1.1.1,3.3.3.3")),
            Err(GroupError::CapacityReached(1))
        ));

        f.pool.flush_removals().unwrap();
        f.pool.get_or_create(&set("1.1.1.1,3.3.3.3")).unwrap();
    }

    #[test]
    fn capacity_discovery_falls_back_and_normalizes() {
        let hal = VirtualSwitchHal::with_ecmp_capacity(1024);
        assert_eq!(discover_group_capacity(&hal, ""), 1024);
        assert_eq!(
            discover_group_capacity(&hal, "x86_64-mlnx_msn2700-mellanox"),
            1024 / DEFAULT_MAX_ECMP_GROUP_SIZE
        );

        let hal = VirtualSwitchHal::without_ecmp_capacity();
        assert_eq!(
            discover_group_capacity(&hal, ""),
            DEFAULT_NUMBER_OF_ECMP_GROUPS
        );
    }
}
