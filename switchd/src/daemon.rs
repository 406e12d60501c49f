//! The event loop: multiplexes table subscriptions with a bounded poll
//! timeout, dispatches readable consumers to their orchestrators, drains
//! retry backlogs on timeout, and flushes the hardware pipeline after every
//! wake.

use std::future::poll_fn;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use metrics::gauge;
use thiserror::Error;
use tokio::time::timeout;
use tracing::trace;

use switchd_hal::{HalError, SwitchAttr, SwitchHal};

use crate::orch::{Consumer, Orch};
use crate::recorded;

/// Poll timeout for the main select loop.
pub const SELECT_TIMEOUT: Duration = Duration::from_secs(1);

/// The loop only terminates on unrecoverable hardware failure.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("failed to flush the hardware pipeline")]
    FlushFailed(#[source] HalError),
}

/// One entry of the executor table: a consumer tagged with the index of the
/// orchestrator that owns it.
struct Executor {
    orch: usize,
    consumer: Consumer,
}

/// The orchestration daemon. Owns every orchestrator and every consumer;
/// everything runs on the single thread that calls [`OrchDaemon::run`].
pub struct OrchDaemon {
    hal: Arc<dyn SwitchHal>,
    orchs: Vec<Box<dyn Orch>>,
    executors: Vec<Executor>,
    poll_timeout: Duration,
}

impl OrchDaemon {
    pub fn new(hal: Arc<dyn SwitchHal>) -> Self {
        OrchDaemon {
            hal,
            orchs: Vec::new(),
            executors: Vec::new(),
            poll_timeout: SELECT_TIMEOUT,
        }
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Registers an orchestrator with the consumers it owns.
    ///
    /// Orchestrators are ticked in registration order, so dependency
    /// providers register before their dependents. Within one orchestrator,
    /// consumers run by descending priority, ties broken by table name.
    pub fn register(&mut self, orch: Box<dyn Orch>, consumers: Vec<Consumer>) {
        let index = self.orchs.len();
        self.orchs.push(orch);
        for consumer in consumers {
            self.executors.push(Executor {
                orch: index,
                consumer,
            });
        }
        self.executors.sort_by(|a, b| {
            a.orch
                .cmp(&b.orch)
                .then(b.consumer.priority().cmp(&a.consumer.priority()))
                .then_with(|| a.consumer.table().cmp(b.consumer.table()))
        });
    }

    /// Runs the loop forever. Returns only on unrecoverable failure.
    pub async fn run(&mut self) -> Result<(), DaemonError> {
        loop {
            self.run_once().await?;
        }
    }

    /// One wake of the loop: wait (bounded) for a readable source, dispatch
    /// it — or tick every orchestrator on timeout — then flush the pipeline.
    pub async fn run_once(&mut self) -> Result<(), DaemonError> {
        let executors = &mut self.executors;
        let woke = timeout(
            self.poll_timeout,
            poll_fn(|cx| {
                for (index, executor) in executors.iter_mut().enumerate() {
                    if executor.consumer.poll_readable(cx).is_ready() {
                        return Poll::Ready(index);
                    }
                }
                Poll::Pending
            }),
        )
        .await;

        match woke {
            Ok(index) => {
                let executor = &mut self.executors[index];
                executor.consumer.drain();
                trace!(
                    orch = self.orchs[executor.orch].name(),
                    table = executor.consumer.table(),
                    "dispatching consumer"
                );
                self.orchs[executor.orch].process(&mut executor.consumer);
            }
            Err(_) => {
                // No new input within the poll timeout: sweep every
                // orchestrator so retry-pending rows get reattempted.
                for executor in &mut self.executors {
                    self.orchs[executor.orch].process(&mut executor.consumer);
                }
            }
        }

        let backlog: usize = self
            .executors
            .iter()
            .map(|e| e.consumer.pending().len())
            .sum();
        gauge!(recorded::PENDING_TASKS).set(backlog as f64);

        // Push any accumulated bulk mutations down to the chip before the
        // next blocking wait.
        self.hal
            .set_switch_attribute(SwitchAttr::FlushPipeline)
            .map_err(DaemonError::FlushFailed)
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use switchd_db::{Datastore, FieldValues};
    use switchd_hal::VirtualSwitchHal;

    use super::*;

    struct RecordingOrch {
        log: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl Orch for RecordingOrch {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn process(&mut self, consumer: &mut Consumer) {
            let keys: Vec<String> = consumer.pending().keys().cloned().collect();
            for key in keys {
                self.log
                    .lock()
                    .push((consumer.table().to_owned(), key.clone()));
                consumer.pending_mut().shift_remove(&key);
            }
        }
    }

    fn daemon_with_tables(
        store: &Datastore,
        tables: &[(&str, i32)],
    ) -> (OrchDaemon, Arc<Mutex<Vec<(String, String)>>>) {
        let hal = Arc::new(VirtualSwitchHal::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut daemon =
            OrchDaemon::new(hal).with_poll_timeout(Duration::from_millis(10));
        let consumers = tables
            .iter()
            .map(|(table, priority)| Consumer::new(store.subscribe(*table), *priority))
            .collect();
        daemon.register(Box::new(RecordingOrch { log: log.clone() }), consumers);
        (daemon, log)
    }

    #[tokio::test(start_paused = true)]
    async fn readable_source_is_dispatched() {
        let store = Datastore::new();
        let (mut daemon, log) = daemon_with_tables(&store, &[("T", 0)]);

        store.table("T").set("key1", FieldValues::new());
        daemon.run_once().await.unwrap();

        assert_eq!(*log.lock(), vec![("T".to_owned(), "key1".to_owned())]);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_ticks_higher_priority_tables_first() {
        let store = Datastore::new();
        let (mut daemon, log) =
            daemon_with_tables(&store, &[("LOW", 0), ("HIGH", 10), ("ALSO_HIGH", 10)]);

        // Seed rows without a readable wake by draining the channels first.
        store.table("LOW").set("l1", FieldValues::new());
        store.table("HIGH").set("h1", FieldValues::new());
        store.table("ALSO_HIGH").set("a1", FieldValues::new());
        for executor in &mut daemon.executors {
            executor.consumer.drain();
        }

        daemon.run_once().await.unwrap();

        let order: Vec<String> = log.lock().iter().map(|(t, _)| t.clone()).collect();
        assert_eq!(order, vec!["ALSO_HIGH", "HIGH", "LOW"]);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_failure_is_fatal() {
        let store = Datastore::new();
        let hal = Arc::new(VirtualSwitchHal::new());
        let mut daemon = OrchDaemon::new(hal.clone() as Arc<dyn SwitchHal>)
            .with_poll_timeout(Duration::from_millis(10));
        daemon.register(
            Box::new(RecordingOrch {
                log: Arc::new(Mutex::new(Vec::new())),
            }),
            vec![Consumer::new(store.subscribe("T"), 0)],
        );

        daemon.run_once().await.unwrap();
        hal.set_flush_failure(true);
        assert!(matches!(
            daemon.run_once().await,
            Err(DaemonError::FlushFailed(_))
        ));
    }
}
