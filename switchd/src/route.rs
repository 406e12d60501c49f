//! The route reconciler: keeps the datastore's desired prefix → next-hop
//! state in sync with the hardware route table, manages the shared next hop
//! group pool, and notifies observers of longest-prefix-match changes.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use metrics::gauge;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::{debug, info, warn};

use switchd_db::{KeyOpFieldValues, TableOp};
use switchd_hal::{HalError, ObjectId, PacketAction, RouteAttribute, RouteEntry, SwitchHal};
use switchd_net::{IpPrefix, NextHopSet};

use crate::bulker::RouteBulker;
use crate::neigh::SharedNeighbors;
use crate::nhg::{discover_group_capacity, NextHopGroupPool};
use crate::orch::{Consumer, Orch, TaskStatus};
use crate::recorded;

/// Datastore key announcing the start (SET) or end (DEL) of a route resync.
pub const RESYNC_KEY: &str = "resync";

/// Routes pointing at these interfaces are never programmed.
const IGNORED_INTERFACES: [&str; 3] = ["eth0", "lo", "docker0"];

/// A longest-prefix-match change delivered to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextHopUpdate {
    pub prefix: IpPrefix,
    pub next_hops: NextHopSet,
}

/// Receives the best-match route for one observed destination address.
pub trait NextHopObserver: Send + Sync {
    fn next_hops_changed(&self, update: &NextHopUpdate);
}

struct ObserverEntry {
    /// The synced prefixes containing the observed destination, ordered so
    /// the last entry is the longest-prefix match.
    route_table: BTreeMap<IpPrefix, NextHopSet>,
    observers: Vec<Arc<dyn NextHopObserver>>,
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("failed to install default route {prefix} with packet action drop")]
    DefaultRouteInstall {
        prefix: IpPrefix,
        #[source]
        source: HalError,
    },
}

/// Reconciles `ROUTE_TABLE` rows into hardware routes.
pub struct RouteOrch {
    hal: Arc<dyn SwitchHal>,
    neighbors: SharedNeighbors,
    pool: NextHopGroupPool,
    bulker: RouteBulker,
    synced: BTreeMap<IpPrefix, NextHopSet>,
    resync: bool,
    observers: BTreeMap<IpAddr, ObserverEntry>,
    switch_id: ObjectId,
    vr_id: ObjectId,
    rng: SmallRng,
}

impl RouteOrch {
    /// Builds the reconciler and installs both default routes with packet
    /// action drop, directly rather than through the bulker. This runs
    /// before the event loop starts; failure is fatal.
    pub fn new(
        hal: Arc<dyn SwitchHal>,
        neighbors: SharedNeighbors,
        switch_id: ObjectId,
        vr_id: ObjectId,
        platform: &str,
    ) -> Result<Self, RouteError> {
        let max_groups = discover_group_capacity(hal.as_ref(), platform);
        info!(max_groups, "maximum number of ECMP groups supported");

        let pool = NextHopGroupPool::new(hal.clone(), neighbors.clone(), max_groups as usize);
        let mut orch = RouteOrch {
            hal,
            neighbors,
            pool,
            bulker: RouteBulker::new(),
            synced: BTreeMap::new(),
            resync: false,
            observers: BTreeMap::new(),
            switch_id,
            vr_id,
            rng: SmallRng::from_os_rng(),
        };

        for prefix in [IpPrefix::default_v4(), IpPrefix::default_v6()] {
            orch.hal
                .create_route(
                    orch.route_entry(prefix),
                    &[RouteAttribute::PacketAction(PacketAction::Drop)],
                )
                .map_err(|source| RouteError::DefaultRouteInstall { prefix, source })?;
            orch.synced.insert(prefix, NextHopSet::new());
            info!(%prefix, "created default route with packet action drop");
        }
        Ok(orch)
    }

    /// Replaces the temp-route RNG with a seeded one, for deterministic
    /// member selection.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    pub fn synced_routes(&self) -> &BTreeMap<IpPrefix, NextHopSet> {
        &self.synced
    }

    pub fn resync_active(&self) -> bool {
        self.resync
    }

    pub fn pool(&self) -> &NextHopGroupPool {
        &self.pool
    }

    pub fn has_next_hop_group(&self, ips: &NextHopSet) -> bool {
        self.pool.has(ips)
    }

    pub fn next_hop_group_id(&self, ips: &NextHopSet) -> Option<ObjectId> {
        self.pool.id(ips)
    }

    /// Registers an observer for the best-match route of `destination` and
    /// immediately delivers the current best match.
    pub fn attach(&mut self, observer: Arc<dyn NextHopObserver>, destination: IpAddr) {
        info!(%destination, "attaching next hop observer");
        let synced = &self.synced;
        let entry = self.observers.entry(destination).or_insert_with(|| {
            let route_table = synced
                .iter()
                .filter(|(prefix, _)| prefix.contains(destination))
                .map(|(prefix, hops)| (*prefix, hops.clone()))
                .collect();
            ObserverEntry {
                route_table,
                observers: Vec::new(),
            }
        });
        entry.observers.push(observer.clone());

        if let Some((prefix, next_hops)) = entry.route_table.last_key_value() {
            observer.next_hops_changed(&NextHopUpdate {
                prefix: *prefix,
                next_hops: next_hops.clone(),
            });
        }
    }

    /// Removes an observer from `destination`'s observer list. The entry is
    /// dropped entirely once its last observer detaches.
    pub fn detach(&mut self, observer: &Arc<dyn NextHopObserver>, destination: IpAddr) {
        let Some(entry) = self.observers.get_mut(&destination) else {
            warn!(%destination, "cannot detach observer: no entry for destination");
            return;
        };
        entry.observers.retain(|o| !Arc::ptr_eq(o, observer));
        if entry.observers.is_empty() {
            self.observers.remove(&destination);
        }
    }

    fn route_entry(&self, prefix: IpPrefix) -> RouteEntry {
        RouteEntry {
            switch_id: self.switch_id,
            vr_id: self.vr_id,
            destination: prefix,
        }
    }

    /// Marks every synced prefix as a pending DEL in the consumer's map.
    /// Prefixes re-sent by the supplier replace their DEL through the
    /// pending map's last-write-wins rule and survive the resync untouched.
    fn begin_resync(&mut self, consumer: &mut Consumer) {
        info!(routes = self.synced.len(), "route resync started");
        for prefix in self.synced.keys() {
            let key = prefix.to_string();
            consumer
                .pending_mut()
                .insert(key.clone(), KeyOpFieldValues::del(key));
        }
        self.resync = true;
    }

    fn handle_route_row(&mut self, row: &KeyOpFieldValues) -> TaskStatus {
        let prefix: IpPrefix = match row.key.parse() {
            Ok(prefix) => prefix,
            Err(error) => {
                warn!(key = %row.key, %error, "malformed route key");
                return TaskStatus::Invalid;
            }
        };

        match row.op {
            TableOp::Set => {
                let next_hops: NextHopSet = match row.field("nexthop").unwrap_or("").parse() {
                    Ok(next_hops) => next_hops,
                    Err(error) => {
                        warn!(%prefix, %error, "malformed nexthop field");
                        return TaskStatus::Invalid;
                    }
                };
                let ifname = row.field("ifname").unwrap_or("");

                if IGNORED_INTERFACES.contains(&ifname) {
                    // Routes moved onto management or loopback interfaces
                    // are torn down rather than programmed.
                    if self.synced.contains_key(&prefix) {
                        return self.remove_route(prefix);
                    }
                    return TaskStatus::Ignore;
                }

                if next_hops.is_empty() {
                    return TaskStatus::Ignore;
                }

                if self.synced.get(&prefix) == Some(&next_hops) {
                    // Duplicate of what is already programmed.
                    return TaskStatus::Success;
                }
                self.add_route(prefix, next_hops)
            }
            TableOp::Del => {
                if self.synced.contains_key(&prefix) {
                    self.remove_route(prefix)
                } else {
                    TaskStatus::Success
                }
            }
        }
    }

    fn add_route(&mut self, prefix: IpPrefix, next_hops: NextHopSet) -> TaskStatus {
        let entry = self.route_entry(prefix);
        let previous = self.synced.get(&prefix).cloned();

        let next_hop_id = if let Some(ip) = next_hops.single() {
            let resolved = {
                let mut neighbors = self.neighbors.lock();
                match neighbors.next_hop_id(ip) {
                    Some(id) => {
                        neighbors.increase_ref(ip);
                        Some(id)
                    }
                    None => None,
                }
            };
            match resolved {
                Some(id) => id,
                None => {
                    debug!(%prefix, next_hop = %ip, "next hop not resolved yet");
                    return TaskStatus::NeedRetry;
                }
            }
        } else {
            match self.pool.get_or_create(&next_hops) {
                Ok(id) => id,
                Err(error) => {
                    debug!(%prefix, %next_hops, %error, "cannot build next hop group yet");
                    // A synced single next hop that is already a member of
                    // the wanted group serves as the temporary route.
                    let covered = previous
                        .as_ref()
                        .and_then(|hops| hops.single())
                        .is_some_and(|ip| next_hops.contains(ip));
                    if !covered {
                        self.add_temp_route(prefix, &next_hops);
                    }
                    return TaskStatus::NeedRetry;
                }
            }
        };

        match &previous {
            None => {
                self.bulker
                    .create_route(entry, vec![RouteAttribute::NextHopId(next_hop_id)]);
                info!(%prefix, %next_hops, "creating route");
            }
            Some(old) => {
                if old.is_empty() {
                    // The entry sat in drop state; re-arm forwarding before
                    // pointing it at the next hop.
                    self.bulker.set_route_attribute(
                        entry,
                        RouteAttribute::PacketAction(PacketAction::Forward),
                    );
                }
                self.bulker
                    .set_route_attribute(entry, RouteAttribute::NextHopId(next_hop_id));
                info!(%prefix, %next_hops, "updating route");
            }
        }

        if let Some(old) = previous {
            self.release_next_hops(&old);
        }
        self.synced.insert(prefix, next_hops.clone());
        self.notify_observers(prefix, &next_hops, true);
        TaskStatus::Success
    }

    /// Installs a single-member stand-in while the full group cannot be
    /// built, picking uniformly among the members that are resolved.
    fn add_temp_route(&mut self, prefix: IpPrefix, next_hops: &NextHopSet) {
        let resolved: Vec<IpAddr> = {
            let neighbors = self.neighbors.lock();
            next_hops.iter().filter(|ip| neighbors.contains(*ip)).collect()
        };
        if resolved.is_empty() {
            return;
        }
        let pick = resolved[self.rng.random_range(0..resolved.len())];
        debug!(%prefix, next_hop = %pick, "installing temporary route");
        self.add_route(prefix, NextHopSet::singleton(pick));
    }

    fn remove_route(&mut self, prefix: IpPrefix) -> TaskStatus {
        let entry = self.route_entry(prefix);
        if prefix.is_default() {
            // Default routes are never removed from hardware; they fall
            // back to dropping.
            self.bulker
                .set_route_attribute(entry, RouteAttribute::PacketAction(PacketAction::Drop));
            self.bulker
                .set_route_attribute(entry, RouteAttribute::NextHopId(ObjectId::NULL));
        } else {
            self.bulker.remove_route(entry);
        }

        if let Some(old) = self.synced.get(&prefix).cloned() {
            info!(%prefix, next_hops = %old, "removing route");
            self.release_next_hops(&old);
        }

        if prefix.is_default() {
            self.synced.insert(prefix, NextHopSet::new());
            self.notify_observers(prefix, &NextHopSet::new(), true);
        } else {
            self.synced.remove(&prefix);
            self.notify_observers(prefix, &NextHopSet::new(), false);
        }
        TaskStatus::Success
    }

    fn release_next_hops(&mut self, old: &NextHopSet) {
        if let Some(ip) = old.single() {
            self.neighbors.lock().decrease_ref(ip);
        } else if old.len() > 1 {
            self.pool.release(old);
        }
    }

    fn notify_observers(&mut self, prefix: IpPrefix, next_hops: &NextHopSet, add: bool) {
        for (destination, entry) in self.observers.iter_mut() {
            if !prefix.contains(*destination) {
                continue;
            }

            if add {
                let best = entry.route_table.last_key_value().map(|(p, _)| *p);
                let mut update_required = false;
                match entry.route_table.get_mut(&prefix) {
                    None => {
                        // A new route matters only if it becomes the best
                        // match.
                        if best.map_or(true, |b| b < prefix) {
                            update_required = true;
                        }
                        entry.route_table.insert(prefix, next_hops.clone());
                    }
                    Some(existing) => {
                        if existing != next_hops {
                            *existing = next_hops.clone();
                            if best == Some(prefix) {
                                update_required = true;
                            }
                        }
                    }
                }
                if update_required {
                    let update = NextHopUpdate {
                        prefix,
                        next_hops: next_hops.clone(),
                    };
                    for observer in entry.observers.clone() {
                        observer.next_hops_changed(&update);
                    }
                }
            } else {
                let was_best = entry.route_table.last_key_value().map(|(p, _)| *p) == Some(prefix);
                if entry.route_table.remove(&prefix).is_some() && was_best {
                    // The best match went away; announce the runner-up,
                    // which always exists because defaults are preserved.
                    let (best, hops) = entry
                        .route_table
                        .last_key_value()
                        .expect("default route is always present for an observed destination");
                    let update = NextHopUpdate {
                        prefix: *best,
                        next_hops: hops.clone(),
                    };
                    for observer in entry.observers.clone() {
                        observer.next_hops_changed(&update);
                    }
                }
            }
        }
    }
}

impl Orch for RouteOrch {
    fn name(&self) -> &'static str {
        "route"
    }

    fn process(&mut self, consumer: &mut Consumer) {
        let keys: Vec<String> = consumer.pending().keys().cloned().collect();
        for key in keys {
            let Some(row) = consumer.pending().get(&key).cloned() else {
                continue;
            };

            if row.key == RESYNC_KEY {
                match row.op {
                    TableOp::Set => self.begin_resync(consumer),
                    TableOp::Del => {
                        info!("route resync complete");
                        self.resync = false;
                    }
                }
                consumer.pending_mut().shift_remove(&key);
                continue;
            }

            if self.resync {
                // Queued until the resync window closes.
                continue;
            }

            match self.handle_route_row(&row) {
                TaskStatus::NeedRetry => {}
                TaskStatus::Success | TaskStatus::Invalid | TaskStatus::Ignore => {
                    consumer.pending_mut().shift_remove(&key);
                }
            }
        }

        gauge!(recorded::SYNCED_ROUTES).set(self.synced.len() as f64);
        self.bulker.flush(self.hal.as_ref());
        if let Err(error) = self.pool.flush_removals() {
            warn!(%error, "failed to remove retired next hop groups");
        }
    }
}
