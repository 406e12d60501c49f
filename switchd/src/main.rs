use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use switchd::config::Options;
use switchd::daemon::OrchDaemon;
use switchd::neigh::{shared_neighbors, NeighOrch};
use switchd::orch::Consumer;
use switchd::route::RouteOrch;
use switchd_db::{Datastore, APP_NEIGH_TABLE, APP_ROUTE_TABLE};
use switchd_hal::{ObjectId, SwitchHal, VirtualSwitchHal};

const NEIGH_TABLE_PRI: i32 = 20;
const ROUTE_TABLE_PRI: i32 = 5;

fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // The whole agent runs on one cooperative thread.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build the runtime")?;
    runtime.block_on(run(options))
}

async fn run(options: Options) -> anyhow::Result<()> {
    let platform = options.platform();
    info!(%platform, "starting switchd");

    let datastore = Datastore::new();
    let hal: Arc<dyn SwitchHal> = Arc::new(VirtualSwitchHal::new());
    let switch_id = ObjectId::from_raw(options.switch_id);
    let vr_id = ObjectId::from_raw(options.virtual_router_id);

    // Strict construction order: the neighbor table exists before the route
    // reconciler, which installs its default drop routes before the loop
    // starts.
    let neighbors = shared_neighbors();
    let neigh_orch = NeighOrch::new(hal.clone(), neighbors.clone());
    let route_orch = RouteOrch::new(hal.clone(), neighbors, switch_id, vr_id, &platform)
        .context("failed to install default routes")?;

    let mut daemon = OrchDaemon::new(hal).with_poll_timeout(options.poll_timeout());
    daemon.register(
        Box::new(neigh_orch),
        vec![Consumer::new(datastore.subscribe(APP_NEIGH_TABLE), NEIGH_TABLE_PRI)],
    );
    daemon.register(
        Box::new(route_orch),
        vec![Consumer::new(datastore.subscribe(APP_ROUTE_TABLE), ROUTE_TABLE_PRI)],
    );

    info!("switchd running");
    daemon.run().await.context("orchestration loop failed")
}
