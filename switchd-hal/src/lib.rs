//! The hardware-abstraction surface the orchestration agent programs routes
//! through: typed object ids, route entries and attributes, bulk operations
//! with per-row statuses, and the [`SwitchHal`] trait itself.
//!
//! [`VirtualSwitchHal`] is an in-memory implementation that records every
//! call; it backs the `vs` platform and the test suites.

mod vs;

pub use vs::{HalOp, VirtualSwitchHal, VsRoute};

use std::fmt;
use std::net::IpAddr;

use thiserror::Error;

use switchd_net::IpPrefix;

/// An opaque id for a hardware object (next hop, group, group member, switch,
/// virtual router).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(u64);

impl ObjectId {
    /// The null object id, used to detach a route from its next hop.
    pub const NULL: ObjectId = ObjectId(0);

    pub const fn from_raw(raw: u64) -> Self {
        ObjectId(raw)
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }

    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        ObjectId::NULL
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "oid:{:#x}", self.0)
    }
}

/// The key of a hardware route: which switch, which virtual router, which
/// destination prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteEntry {
    pub switch_id: ObjectId,
    pub vr_id: ObjectId,
    pub destination: IpPrefix,
}

/// What a route does with matching packets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PacketAction {
    #[default]
    Forward,
    Drop,
}

/// A single route attribute for create/set calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAttribute {
    NextHopId(ObjectId),
    PacketAction(PacketAction),
}

/// Switch-level attributes that can be queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SwitchAttrId {
    /// The number of ECMP groups the chip supports.
    NumberOfEcmpGroups,
}

/// Switch-level attributes that can be set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SwitchAttr {
    /// Flush all accumulated mutations down to the chip.
    FlushPipeline,
}

/// Error policy for bulk calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum BulkOpMode {
    /// Attempt every row; failures are reported per row.
    IgnoreError,
    /// Stop at the first failure; later rows report `NotExecuted`.
    StopOnError,
}

/// Per-row outcome of a bulk call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum HalStatus {
    Success,
    ItemAlreadyExists,
    ItemNotFound,
    TableFull,
    NotExecuted,
}

impl HalStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, HalStatus::Success)
    }
}

/// Errors from non-bulk hardware calls.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HalError {
    #[error("hardware object {0} does not exist")]
    ObjectNotFound(ObjectId),

    #[error("hardware object {0} is still in use")]
    ObjectInUse(ObjectId),

    #[error("route {0} already exists")]
    RouteAlreadyExists(IpPrefix),

    #[error("route {0} does not exist")]
    RouteNotFound(IpPrefix),

    #[error("switch attribute {0} is not supported")]
    UnsupportedAttribute(SwitchAttrId),

    #[error("hardware operation failed: {0}")]
    OperationFailed(&'static str),
}

pub type HalResult<T> = Result<T, HalError>;

/// The primitives the orchestration core requires from the hardware layer.
///
/// All methods take `&self`; implementations use interior mutability. Only
/// the single reconciliation thread issues calls, but the trait stays
/// `Send + Sync` so the handle can be shared with auxiliary subsystems.
pub trait SwitchHal: Send + Sync {
    fn get_switch_attribute(&self, attr: SwitchAttrId) -> HalResult<u64>;

    fn set_switch_attribute(&self, attr: SwitchAttr) -> HalResult<()>;

    /// Non-bulk route create, used at startup for the default drop routes.
    fn create_route(&self, entry: RouteEntry, attrs: &[RouteAttribute]) -> HalResult<()>;

    /// Non-bulk route remove.
    fn remove_route(&self, entry: RouteEntry) -> HalResult<()>;

    /// Creates `entries[i]` with the attribute list `attrs[i]`. Returns one
    /// status per entry.
    fn bulk_create_routes(
        &self,
        entries: &[RouteEntry],
        attrs: &[Vec<RouteAttribute>],
        mode: BulkOpMode,
    ) -> Vec<HalStatus>;

    /// Sets `attrs[i]` on `entries[i]` (parallel arrays, one attribute per
    /// row). Returns one status per row.
    fn bulk_set_route_attribute(
        &self,
        entries: &[RouteEntry],
        attrs: &[RouteAttribute],
        mode: BulkOpMode,
    ) -> Vec<HalStatus>;

    /// Removes every entry. Returns one status per entry.
    fn bulk_remove_routes(&self, entries: &[RouteEntry], mode: BulkOpMode) -> Vec<HalStatus>;

    fn create_next_hop(&self, ip: IpAddr) -> HalResult<ObjectId>;

    fn remove_next_hop(&self, id: ObjectId) -> HalResult<()>;

    fn create_next_hop_group(&self) -> HalResult<ObjectId>;

    fn remove_next_hop_group(&self, id: ObjectId) -> HalResult<()>;

    fn create_next_hop_group_member(
        &self,
        group: ObjectId,
        next_hop: ObjectId,
    ) -> HalResult<ObjectId>;

    fn remove_next_hop_group_member(&self, member: ObjectId) -> HalResult<()>;
}
