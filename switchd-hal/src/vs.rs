use std::collections::HashMap;
use std::net::IpAddr;

use parking_lot::Mutex;
use tracing::trace;

use crate::{
    BulkOpMode, HalError, HalResult, HalStatus, ObjectId, PacketAction, RouteAttribute,
    RouteEntry, SwitchAttr, SwitchAttrId, SwitchHal,
};

/// ECMP group capacity reported by the virtual switch.
pub const VS_ECMP_GROUP_CAPACITY: u64 = 128;

/// A route as programmed into the virtual switch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VsRoute {
    pub next_hop_id: ObjectId,
    pub packet_action: PacketAction,
}

impl VsRoute {
    fn apply(&mut self, attr: RouteAttribute) {
        match attr {
            RouteAttribute::NextHopId(id) => self.next_hop_id = id,
            RouteAttribute::PacketAction(action) => self.packet_action = action,
        }
    }
}

/// Every hardware call the virtual switch has observed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HalOp {
    Flush,
    CreateRoute(RouteEntry),
    RemoveRoute(RouteEntry),
    BulkRemoveRoutes(Vec<RouteEntry>),
    BulkCreateRoutes(Vec<RouteEntry>),
    BulkSetRouteAttributes(Vec<(RouteEntry, RouteAttribute)>),
    CreateNextHop(IpAddr),
    RemoveNextHop(ObjectId),
    CreateNextHopGroup(ObjectId),
    RemoveNextHopGroup(ObjectId),
    CreateNextHopGroupMember {
        group: ObjectId,
        next_hop: ObjectId,
        member: ObjectId,
    },
    RemoveNextHopGroupMember(ObjectId),
}

#[derive(Default)]
struct VsState {
    next_oid: u64,
    routes: HashMap<RouteEntry, VsRoute>,
    next_hops: HashMap<ObjectId, IpAddr>,
    groups: HashMap<ObjectId, ()>,
    members: HashMap<ObjectId, (ObjectId, ObjectId)>,
    ops: Vec<HalOp>,
    ecmp_capacity: Option<u64>,
    fail_flush: bool,
}

impl VsState {
    fn allocate(&mut self) -> ObjectId {
        self.next_oid += 1;
        ObjectId::from_raw(self.next_oid)
    }

    fn next_hop_referenced(&self, id: ObjectId) -> bool {
        self.members.values().any(|(_, nh)| *nh == id)
            || self.routes.values().any(|r| r.next_hop_id == id)
    }
}

/// An in-memory switch: programs "hardware" state into hash maps and records
/// an ordered operation log. Backs the `vs` platform and the test suites.
pub struct VirtualSwitchHal {
    state: Mutex<VsState>,
}

impl Default for VirtualSwitchHal {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualSwitchHal {
    pub fn new() -> Self {
        Self::with_ecmp_capacity(VS_ECMP_GROUP_CAPACITY)
    }

    pub fn with_ecmp_capacity(capacity: u64) -> Self {
        VirtualSwitchHal {
            state: Mutex::new(VsState {
                ecmp_capacity: Some(capacity),
                ..Default::default()
            }),
        }
    }

    /// A switch whose capacity query fails, to exercise the fallback path.
    pub fn without_ecmp_capacity() -> Self {
        VirtualSwitchHal {
            state: Mutex::new(VsState::default()),
        }
    }

    /// Makes subsequent pipeline flushes fail, to exercise the fatal path.
    pub fn set_flush_failure(&self, fail: bool) {
        self.state.lock().fail_flush = fail;
    }

    pub fn route(&self, entry: &RouteEntry) -> Option<VsRoute> {
        self.state.lock().routes.get(entry).copied()
    }

    pub fn route_count(&self) -> usize {
        self.state.lock().routes.len()
    }

    pub fn next_hop_count(&self) -> usize {
        self.state.lock().next_hops.len()
    }

    pub fn group_count(&self) -> usize {
        self.state.lock().groups.len()
    }

    pub fn member_count(&self) -> usize {
        self.state.lock().members.len()
    }

    /// A copy of the ordered operation log.
    pub fn ops(&self) -> Vec<HalOp> {
        self.state.lock().ops.clone()
    }

    /// Drains the operation log, so a test can scope assertions to the calls
    /// made after a checkpoint.
    pub fn take_ops(&self) -> Vec<HalOp> {
        std::mem::take(&mut self.state.lock().ops)
    }
}

impl SwitchHal for VirtualSwitchHal {
    fn get_switch_attribute(&self, attr: SwitchAttrId) -> HalResult<u64> {
        let state = self.state.lock();
        match attr {
            SwitchAttrId::NumberOfEcmpGroups => state
                .ecmp_capacity
                .ok_or(HalError::UnsupportedAttribute(attr)),
        }
    }

    fn set_switch_attribute(&self, attr: SwitchAttr) -> HalResult<()> {
        let mut state = self.state.lock();
        match attr {
            SwitchAttr::FlushPipeline => {
                state.ops.push(HalOp::Flush);
                if state.fail_flush {
                    return Err(HalError::OperationFailed("pipeline flush"));
                }
                Ok(())
            }
        }
    }

    fn create_route(&self, entry: RouteEntry, attrs: &[RouteAttribute]) -> HalResult<()> {
        let mut state = self.state.lock();
        state.ops.push(HalOp::CreateRoute(entry));
        if state.routes.contains_key(&entry) {
            return Err(HalError::RouteAlreadyExists(entry.destination));
        }
        let mut route = VsRoute::default();
        for attr in attrs {
            route.apply(*attr);
        }
        state.routes.insert(entry, route);
        trace!(destination = %entry.destination, "created route");
        Ok(())
    }

    fn remove_route(&self, entry: RouteEntry) -> HalResult<()> {
        let mut state = self.state.lock();
        state.ops.push(HalOp::RemoveRoute(entry));
        state
            .routes
            .remove(&entry)
            .map(|_| ())
            .ok_or(HalError::RouteNotFound(entry.destination))
    }

    fn bulk_create_routes(
        &self,
        entries: &[RouteEntry],
        attrs: &[Vec<RouteAttribute>],
        mode: BulkOpMode,
    ) -> Vec<HalStatus> {
        debug_assert_eq!(entries.len(), attrs.len());
        let mut state = self.state.lock();
        state.ops.push(HalOp::BulkCreateRoutes(entries.to_vec()));
        let mut statuses = Vec::with_capacity(entries.len());
        let mut failed = false;
        for (entry, attrs) in entries.iter().zip(attrs) {
            if failed && mode == BulkOpMode::StopOnError {
                statuses.push(HalStatus::NotExecuted);
                continue;
            }
            if state.routes.contains_key(entry) {
                statuses.push(HalStatus::ItemAlreadyExists);
                failed = true;
                continue;
            }
            let mut route = VsRoute::default();
            for attr in attrs {
                route.apply(*attr);
            }
            state.routes.insert(*entry, route);
            statuses.push(HalStatus::Success);
        }
        statuses
    }

    fn bulk_set_route_attribute(
        &self,
        entries: &[RouteEntry],
        attrs: &[RouteAttribute],
        mode: BulkOpMode,
    ) -> Vec<HalStatus> {
        debug_assert_eq!(entries.len(), attrs.len());
        let mut state = self.state.lock();
        state.ops.push(HalOp::BulkSetRouteAttributes(
            entries.iter().copied().zip(attrs.iter().copied()).collect(),
        ));
        let mut statuses = Vec::with_capacity(entries.len());
        let mut failed = false;
        for (entry, attr) in entries.iter().zip(attrs) {
            if failed && mode == BulkOpMode::StopOnError {
                statuses.push(HalStatus::NotExecuted);
                continue;
            }
            match state.routes.get_mut(entry) {
                Some(route) => {
                    route.apply(*attr);
                    statuses.push(HalStatus::Success);
                }
                None => {
                    statuses.push(HalStatus::ItemNotFound);
                    failed = true;
                }
            }
        }
        statuses
    }

    fn bulk_remove_routes(&self, entries: &[RouteEntry], mode: BulkOpMode) -> Vec<HalStatus> {
        let mut state = self.state.lock();
        state.ops.push(HalOp::BulkRemoveRoutes(entries.to_vec()));
        let mut statuses = Vec::with_capacity(entries.len());
        let mut failed = false;
        for entry in entries {
            if failed && mode == BulkOpMode::StopOnError {
                statuses.push(HalStatus::NotExecuted);
                continue;
            }
            match state.routes.remove(entry) {
                Some(_) => statuses.push(HalStatus::Success),
                None => {
                    statuses.push(HalStatus::ItemNotFound);
                    failed = true;
                }
            }
        }
        statuses
    }

    fn create_next_hop(&self, ip: IpAddr) -> HalResult<ObjectId> {
        let mut state = self.state.lock();
        let id = state.allocate();
        state.next_hops.insert(id, ip);
        state.ops.push(HalOp::CreateNextHop(ip));
        Ok(id)
    }

    fn remove_next_hop(&self, id: ObjectId) -> HalResult<()> {
        let mut state = self.state.lock();
        state.ops.push(HalOp::RemoveNextHop(id));
        if !state.next_hops.contains_key(&id) {
            return Err(HalError::ObjectNotFound(id));
        }
        if state.next_hop_referenced(id) {
            return Err(HalError::ObjectInUse(id));
        }
        state.next_hops.remove(&id);
        Ok(())
    }

    fn create_next_hop_group(&self) -> HalResult<ObjectId> {
        let mut state = self.state.lock();
        if let Some(capacity) = state.ecmp_capacity {
            if state.groups.len() as u64 >= capacity {
                return Err(HalError::OperationFailed("ECMP group table full"));
            }
        }
        let id = state.allocate();
        state.groups.insert(id, ());
        state.ops.push(HalOp::CreateNextHopGroup(id));
        Ok(id)
    }

    fn remove_next_hop_group(&self, id: ObjectId) -> HalResult<()> {
        let mut state = self.state.lock();
        state.ops.push(HalOp::RemoveNextHopGroup(id));
        if !state.groups.contains_key(&id) {
            return Err(HalError::ObjectNotFound(id));
        }
        if state.members.values().any(|(group, _)| *group == id) {
            return Err(HalError::ObjectInUse(id));
        }
        if state.routes.values().any(|r| r.next_hop_id == id) {
            return Err(HalError::ObjectInUse(id));
        }
        state.groups.remove(&id);
        Ok(())
    }

    fn create_next_hop_group_member(
        &self,
        group: ObjectId,
        next_hop: ObjectId,
    ) -> HalResult<ObjectId> {
        let mut state = self.state.lock();
        if !state.groups.contains_key(&group) {
            return Err(HalError::ObjectNotFound(group));
        }
        if !state.next_hops.contains_key(&next_hop) {
            return Err(HalError::ObjectNotFound(next_hop));
        }
        let member = state.allocate();
        state.members.insert(member, (group, next_hop));
        state.ops.push(HalOp::CreateNextHopGroupMember {
            group,
            next_hop,
            member,
        });
        Ok(member)
    }

    fn remove_next_hop_group_member(&self, member: ObjectId) -> HalResult<()> {
        let mut state = self.state.lock();
        state.ops.push(HalOp::RemoveNextHopGroupMember(member));
        state
            .members
            .remove(&member)
            .map(|_| ())
            .ok_or(HalError::ObjectNotFound(member))
    }
}
