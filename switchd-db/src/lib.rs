//! The datastore surface consumed by the orchestration agent: named tables of
//! field-value rows, plus per-table change-notification subscriptions.
//!
//! The [`Datastore`] is an in-process stand-in for the shared key-value store
//! that external daemons (routing, neighbor sync, interface managers) write
//! into. It is cheap to clone and internally locked, so auxiliary producer
//! threads may write rows while the single reconciliation thread consumes
//! notifications.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};

use indexmap::IndexMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

/// Application-DB table fed by the routing daemon.
pub const APP_ROUTE_TABLE: &str = "ROUTE_TABLE";
/// Application-DB table fed by the neighbor sync daemon.
pub const APP_NEIGH_TABLE: &str = "NEIGH_TABLE";
pub const APP_INTF_TABLE: &str = "INTF_TABLE";
pub const APP_PORT_TABLE: &str = "PORT_TABLE";
pub const APP_VLAN_TABLE: &str = "VLAN_TABLE";
pub const APP_VLAN_MEMBER_TABLE: &str = "VLAN_MEMBER_TABLE";
pub const APP_LAG_TABLE: &str = "LAG_TABLE";
pub const APP_LAG_MEMBER_TABLE: &str = "LAG_MEMBER_TABLE";

/// Key separator used by config-DB tables.
pub const CONFIGDB_KEY_SEPARATOR: char = '|';
/// Key separator used by application-DB tables.
pub const APPDB_KEY_SEPARATOR: char = ':';
/// Separator for list-valued fields such as `nexthop`.
pub const LIST_ITEM_SEPARATOR: char = ',';

/// A row's field map: field names to string values, unique per name, in
/// insertion order.
pub type FieldValues = IndexMap<String, String>;

/// A table mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableOp {
    Set,
    Del,
}

/// Error for an operation string that is neither `SET` nor `DEL`.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown table operation {0:?}")]
pub struct UnknownOp(pub String);

impl FromStr for TableOp {
    type Err = UnknownOp;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SET" => Ok(TableOp::Set),
            "DEL" => Ok(TableOp::Del),
            other => Err(UnknownOp(other.to_owned())),
        }
    }
}

impl fmt::Display for TableOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableOp::Set => write!(f, "SET"),
            TableOp::Del => write!(f, "DEL"),
        }
    }
}

/// One change notification: the row key, the operation, and (for SET) the
/// row's fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyOpFieldValues {
    pub key: String,
    pub op: TableOp,
    pub fields: FieldValues,
}

impl KeyOpFieldValues {
    pub fn set(key: impl Into<String>, fields: FieldValues) -> Self {
        KeyOpFieldValues {
            key: key.into(),
            op: TableOp::Set,
            fields,
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        KeyOpFieldValues {
            key: key.into(),
            op: TableOp::Del,
            fields: FieldValues::new(),
        }
    }

    /// Looks up a field value by name.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

#[derive(Default)]
struct TableState {
    rows: IndexMap<String, FieldValues>,
    subscribers: Vec<mpsc::UnboundedSender<KeyOpFieldValues>>,
}

impl TableState {
    fn publish(&mut self, notification: KeyOpFieldValues) {
        self.subscribers
            .retain(|tx| tx.send(notification.clone()).is_ok());
    }
}

#[derive(Default)]
struct Inner {
    tables: HashMap<String, TableState>,
}

/// A handle to the shared datastore. Clones refer to the same store.
#[derive(Clone, Default)]
pub struct Datastore {
    inner: Arc<Mutex<Inner>>,
}

impl Datastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A writer handle for one named table.
    pub fn table(&self, name: impl Into<String>) -> Table {
        Table {
            store: self.clone(),
            name: name.into(),
        }
    }

    /// Subscribes to change notifications for one named table. Rows written
    /// before the subscription are not replayed.
    pub fn subscribe(&self, table: impl Into<String>) -> TableSubscription {
        let table = table.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .tables
            .entry(table.clone())
            .or_default()
            .subscribers
            .push(tx);
        TableSubscription { table, rx }
    }
}

/// A writer handle for a single table.
#[derive(Clone)]
pub struct Table {
    store: Datastore,
    name: String,
}

impl Table {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Upserts a row and notifies subscribers.
    pub fn set(&self, key: impl Into<String>, fields: FieldValues) {
        let key = key.into();
        trace!(table = %self.name, %key, "set");
        let mut inner = self.store.inner.lock();
        let table = inner.tables.entry(self.name.clone()).or_default();
        table.rows.insert(key.clone(), fields.clone());
        table.publish(KeyOpFieldValues {
            key,
            op: TableOp::Set,
            fields,
        });
    }

    /// Deletes a row (if present) and notifies subscribers either way; a DEL
    /// for a key the consumer never saw is the consumer's to ignore.
    pub fn del(&self, key: impl Into<String>) {
        let key = key.into();
        trace!(table = %self.name, %key, "del");
        let mut inner = self.store.inner.lock();
        let table = inner.tables.entry(self.name.clone()).or_default();
        table.rows.shift_remove(&key);
        table.publish(KeyOpFieldValues::del(key));
    }

    pub fn get(&self, key: &str) -> Option<FieldValues> {
        self.store
            .inner
            .lock()
            .tables
            .get(&self.name)
            .and_then(|t| t.rows.get(key).cloned())
    }

    pub fn keys(&self) -> Vec<String> {
        self.store
            .inner
            .lock()
            .tables
            .get(&self.name)
            .map(|t| t.rows.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// The receiving end of a table's change-notification stream.
pub struct TableSubscription {
    table: String,
    rx: mpsc::UnboundedReceiver<KeyOpFieldValues>,
}

impl TableSubscription {
    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Non-blocking pop of the next pending notification.
    pub fn try_recv(&mut self) -> Option<KeyOpFieldValues> {
        self.rx.try_recv().ok()
    }

    /// Polls for the next notification; `Ready(None)` once the datastore is
    /// gone.
    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<KeyOpFieldValues>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> FieldValues {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn set_notifies_subscribers() {
        let store = Datastore::new();
        let mut sub = store.subscribe(APP_ROUTE_TABLE);
        let table = store.table(APP_ROUTE_TABLE);

        table.set("10.0.0.0/24", fields(&[("nexthop", "1.1.1.1")]));

        let row = sub.try_recv().unwrap();
        assert_eq!(row.key, "10.0.0.0/24");
        assert_eq!(row.op, TableOp::Set);
        assert_eq!(row.field("nexthop"), Some("1.1.1.1"));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn del_notifies_even_for_absent_rows() {
        let store = Datastore::new();
        let mut sub = store.subscribe(APP_ROUTE_TABLE);
        store.table(APP_ROUTE_TABLE).del("10.0.0.0/24");

        let row = sub.try_recv().unwrap();
        assert_eq!(row.op, TableOp::Del);
        assert!(row.fields.is_empty());
    }

    #[test]
    fn rows_persist_for_direct_reads() {
        let store = Datastore::new();
        let table = store.table(APP_NEIGH_TABLE);
        table.set("Ethernet0:1.1.1.1", fields(&[("neigh", "00:11:22:33:44:55")]));

        let clone = store.table(APP_NEIGH_TABLE);
        assert_eq!(
            clone.get("Ethernet0:1.1.1.1"),
            Some(fields(&[("neigh", "00:11:22:33:44:55")]))
        );
        assert_eq!(clone.keys(), vec!["Ethernet0:1.1.1.1".to_string()]);

        table.del("Ethernet0:1.1.1.1");
        assert_eq!(clone.get("Ethernet0:1.1.1.1"), None);
    }

    #[test]
    fn subscriptions_are_per_table() {
        let store = Datastore::new();
        let mut routes = store.subscribe(APP_ROUTE_TABLE);
        let mut neighbors = store.subscribe(APP_NEIGH_TABLE);

        store.table(APP_ROUTE_TABLE).set("0.0.0.0/0", FieldValues::new());

        assert!(routes.try_recv().is_some());
        assert!(neighbors.try_recv().is_none());
    }

    #[test]
    fn table_op_round_trips_through_strings() {
        assert_eq!("SET".parse::<TableOp>().unwrap(), TableOp::Set);
        assert_eq!("DEL".parse::<TableOp>().unwrap(), TableOp::Del);
        assert_eq!(TableOp::Set.to_string(), "SET");
        assert!("FLUSH".parse::<TableOp>().is_err());
    }

    #[test]
    fn writes_from_another_thread_are_observed() {
        let store = Datastore::new();
        let mut sub = store.subscribe(APP_ROUTE_TABLE);
        let writer = store.clone();

        std::thread::spawn(move || {
            writer
                .table(APP_ROUTE_TABLE)
                .set("10.0.0.0/24", FieldValues::new());
        })
        .join()
        .unwrap();

        assert_eq!(sub.try_recv().unwrap().key, "10.0.0.0/24");
    }
}
