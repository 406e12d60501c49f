//! End-to-end: rows written into the datastore flow through the event loop
//! into the virtual switch.

use std::sync::Arc;

use switchd::daemon::{DaemonError, OrchDaemon};
use switchd::neigh::{shared_neighbors, NeighOrch};
use switchd::orch::Consumer;
use switchd::route::RouteOrch;
use switchd_db::{Datastore, FieldValues, APP_NEIGH_TABLE, APP_ROUTE_TABLE};
use switchd_hal::{ObjectId, RouteEntry, SwitchHal, VirtualSwitchHal};

const SWITCH: ObjectId = ObjectId::from_raw(1);
const VR: ObjectId = ObjectId::from_raw(2);

struct Harness {
    datastore: Datastore,
    hal: Arc<VirtualSwitchHal>,
    daemon: OrchDaemon,
}

fn harness() -> Harness {
    let datastore = Datastore::new();
    let hal = Arc::new(VirtualSwitchHal::new());
    let neighbors = shared_neighbors();

    let neigh_orch = NeighOrch::new(hal.clone() as Arc<dyn SwitchHal>, neighbors.clone());
    let route_orch = RouteOrch::new(
        hal.clone() as Arc<dyn SwitchHal>,
        neighbors,
        SWITCH,
        VR,
        "vs",
    )
    .unwrap();

    let mut daemon = OrchDaemon::new(hal.clone() as Arc<dyn SwitchHal>);
    daemon.register(
        Box::new(neigh_orch),
        vec![Consumer::new(datastore.subscribe(APP_NEIGH_TABLE), 20)],
    );
    daemon.register(
        Box::new(route_orch),
        vec![Consumer::new(datastore.subscribe(APP_ROUTE_TABLE), 5)],
    );

    Harness {
        datastore,
        hal,
        daemon,
    }
}

fn fields(pairs: &[(&str, &str)]) -> FieldValues {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn route_entry(prefix: &str) -> RouteEntry {
    RouteEntry {
        switch_id: SWITCH,
        vr_id: VR,
        destination: prefix.parse().unwrap(),
    }
}

#[tokio::test(start_paused = true)]
async fn routes_flow_from_datastore_to_hardware() {
    let mut h = harness();

    h.datastore.table(APP_NEIGH_TABLE).set(
        "Ethernet0:1.1.1.1",
        fields(&[("neigh", "00:11:22:33:44:55")]),
    );
    h.datastore
        .table(APP_ROUTE_TABLE)
        .set("10.0.0.0/24", fields(&[("nexthop", "1.1.1.1")]));

    // One wake per readable source.
    h.daemon.run_once().await.unwrap();
    h.daemon.run_once().await.unwrap();

    let route = h.hal.route(&route_entry("10.0.0.0/24")).unwrap();
    assert!(!route.next_hop_id.is_null());
    assert_eq!(h.hal.next_hop_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn unresolved_route_is_retried_on_the_poll_timeout() {
    let mut h = harness();

    h.datastore
        .table(APP_ROUTE_TABLE)
        .set("10.0.0.0/24", fields(&[("nexthop", "1.1.1.1")]));
    h.daemon.run_once().await.unwrap();
    assert!(h.hal.route(&route_entry("10.0.0.0/24")).is_none());

    h.datastore.table(APP_NEIGH_TABLE).set(
        "Ethernet0:1.1.1.1",
        fields(&[("neigh", "00:11:22:33:44:55")]),
    );
    h.daemon.run_once().await.unwrap();
    // Still pending: the route row is only reattempted on the next tick.
    assert!(h.hal.route(&route_entry("10.0.0.0/24")).is_none());

    // Nothing readable now, so this wake is a poll timeout that sweeps the
    // retry backlog.
    h.daemon.run_once().await.unwrap();
    assert!(h.hal.route(&route_entry("10.0.0.0/24")).is_some());
}

#[tokio::test(start_paused = true)]
async fn ecmp_group_is_built_once_all_members_resolve() {
    let mut h = harness();

    for (key, mac) in [
        ("Ethernet0:1.1.1.1", "00:11:22:33:44:01"),
        ("Ethernet4:2.2.2.2", "00:11:22:33:44:02"),
    ] {
        h.datastore
            .table(APP_NEIGH_TABLE)
            .set(key, fields(&[("neigh", mac)]));
    }
    h.datastore
        .table(APP_ROUTE_TABLE)
        .set("10.0.0.0/24", fields(&[("nexthop", "1.1.1.1,2.2.2.2")]));

    for _ in 0..3 {
        h.daemon.run_once().await.unwrap();
    }

    assert_eq!(h.hal.group_count(), 1);
    assert_eq!(h.hal.member_count(), 2);
    let route = h.hal.route(&route_entry("10.0.0.0/24")).unwrap();
    assert!(!route.next_hop_id.is_null());
}

#[tokio::test(start_paused = true)]
async fn pipeline_flush_failure_stops_the_loop() {
    let mut h = harness();

    h.daemon.run_once().await.unwrap();
    h.hal.set_flush_failure(true);
    assert!(matches!(
        h.daemon.run_once().await,
        Err(DaemonError::FlushFailed(_))
    ));
}
