//! Concurrent flow table
//!
//! Maps flow identities to live connections. Backed by a sharded map, so
//! per-key operations lock one shard and scans lock shards one at a time.
//! Every handle is a cheap clone sharing the same table.

use crate::{
    packet::FlowIdentity,
    types::{Connection, ConnectionSnapshot},
};
use dashmap::{mapref::entry::Entry, DashMap};
use log::{debug, info};
use std::{sync::Arc, time::Duration};

/// Decision returned by a [`FlowTable::for_each`] visitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Keep,
    Remove,
}

/// Result of an atomic [`FlowTable::upsert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// No entry existed and one was created
    Inserted,
    /// The existing entry was updated in place
    Updated,
    /// The existing entry was updated and then deleted
    Removed,
    /// No entry existed and none was created
    Skipped,
}

/// Shared flow table
#[derive(Clone, Default)]
pub struct FlowTable {
    inner: Arc<DashMap<FlowIdentity, Connection>>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the entry for `id`
    pub fn insert(&self, id: FlowIdentity, conn: Connection) {
        self.inner.insert(id, conn);
    }

    /// Copy of the entry for `id`
    pub fn get(&self, id: FlowIdentity) -> Option<Connection> {
        self.inner.get(&id).map(|entry| entry.value().clone())
    }

    /// Delete the entry for `id`
    ///
    /// Removing an absent id is a benign inconsistency; it is logged and
    /// reported as `false`.
    pub fn remove(&self, id: FlowIdentity) -> bool {
        if self.inner.remove(&id).is_some() {
            true
        } else {
            debug!("hash {} is not in flow table", id);
            false
        }
    }

    /// Mutate the entry for `id` in place
    ///
    /// Returns false, without calling `f`, when no entry exists.
    pub fn update<F>(&self, id: FlowIdentity, f: F) -> bool
    where
        F: FnOnce(&mut Connection),
    {
        match self.inner.get_mut(&id) {
            Some(mut entry) => {
                f(entry.value_mut());
                true
            }
            None => false,
        }
    }

    /// Atomic read-modify-write of one key
    ///
    /// `on_vacant` may return a new connection to insert. `on_occupied`
    /// mutates the existing connection and returns true to delete it.
    /// The key's shard stays locked for the whole call, so concurrent
    /// ingestion of the same flow never loses an update.
    pub fn upsert<V, O>(&self, id: FlowIdentity, on_vacant: V, on_occupied: O) -> Upsert
    where
        V: FnOnce() -> Option<Connection>,
        O: FnOnce(&mut Connection) -> bool,
    {
        match self.inner.entry(id) {
            Entry::Vacant(vacant) => match on_vacant() {
                Some(conn) => {
                    vacant.insert(conn);
                    Upsert::Inserted
                }
                None => Upsert::Skipped,
            },
            Entry::Occupied(mut occupied) => {
                if on_occupied(occupied.get_mut()) {
                    occupied.remove();
                    Upsert::Removed
                } else {
                    Upsert::Updated
                }
            }
        }
    }

    /// Visit every entry, deleting those the visitor marks for removal
    ///
    /// Entries inserted concurrently may or may not be visited.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(FlowIdentity, &Connection) -> Visit,
    {
        self.inner.retain(|id, conn| visitor(*id, conn) == Visit::Keep);
    }

    /// Number of live entries, counted by a full scan
    pub fn count(&self) -> usize {
        self.inner.iter().count()
    }

    /// Copies of every live connection, in no particular order
    pub fn list_connections(&self) -> Vec<ConnectionSnapshot> {
        self.inner
            .iter()
            .map(|entry| ConnectionSnapshot::new(*entry.key(), entry.value()))
            .collect()
    }

    /// Delete every entry idle for longer than `threshold` at `now_ns`
    ///
    /// Returns the number of deleted entries.
    pub fn prune(&self, now_ns: u64, threshold: Duration) -> usize {
        let threshold_ns = u64::try_from(threshold.as_nanos()).unwrap_or(u64::MAX);
        let mut pruned = 0;

        self.for_each(|id, conn| {
            let idle = conn.idle_ns(now_ns);
            if idle > threshold_ns {
                info!(
                    "Pruning stale entry from flow table: {} after {}ms",
                    id,
                    idle / 1_000_000
                );
                pruned += 1;
                Visit::Remove
            } else {
                Visit::Keep
            }
        });

        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PacketRecord, Protocol};
    use flow_common::constants::IPPROTO_UDP;
    use std::{net::Ipv4Addr, thread};

    fn udp_packet(src_port: u16, ts_ns: u64) -> PacketRecord {
        PacketRecord {
            src_addr: Ipv4Addr::new(10, 1, 0, 1).to_ipv6_mapped(),
            dst_addr: Ipv4Addr::new(10, 1, 0, 2).to_ipv6_mapped(),
            src_port,
            dst_port: 53,
            protocol: IPPROTO_UDP,
            syn: false,
            ack: false,
            fin: false,
            ts_ns,
            outbound: true,
            len: 64,
        }
    }

    fn entry(src_port: u16, ts_ns: u64) -> (FlowIdentity, Connection) {
        let packet = udp_packet(src_port, ts_ns);
        (packet.identity(), Connection::open(&packet, Protocol::Udp))
    }

    #[test]
    fn test_insert_get_overwrite() {
        let table = FlowTable::new();
        let (id, conn) = entry(1000, 5);
        table.insert(id, conn.clone());
        assert_eq!(table.get(id), Some(conn.clone()));

        let mut newer = conn;
        newer.packets_out = 9;
        table.insert(id, newer);
        assert_eq!(table.get(id).unwrap().packets_out, 9);
        assert_eq!(table.count(), 1);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let table = FlowTable::new();
        let (id, conn) = entry(1000, 5);
        assert!(!table.remove(id));

        table.insert(id, conn);
        assert!(table.remove(id));
        assert!(!table.remove(id));
        assert_eq!(table.count(), 0);
    }

    #[test]
    fn test_update_existing_only() {
        let table = FlowTable::new();
        let (id, conn) = entry(1000, 5);
        assert!(!table.update(id, |c| c.bytes_in = 1));
        assert_eq!(table.count(), 0);

        table.insert(id, conn);
        assert!(table.update(id, |c| c.bytes_in = 42));
        assert_eq!(table.get(id).unwrap().bytes_in, 42);
    }

    #[test]
    fn test_upsert_paths() {
        let table = FlowTable::new();
        let (id, conn) = entry(1000, 5);

        assert_eq!(table.upsert(id, || None, |_| false), Upsert::Skipped);
        assert_eq!(table.count(), 0);

        assert_eq!(
            table.upsert(id, || Some(conn.clone()), |_| false),
            Upsert::Inserted
        );
        assert_eq!(
            table.upsert(id, || None, |c| {
                c.packets_in += 1;
                false
            }),
            Upsert::Updated
        );
        assert_eq!(table.get(id).unwrap().packets_in, 1);

        assert_eq!(table.upsert(id, || None, |_| true), Upsert::Removed);
        assert_eq!(table.get(id), None);
    }

    #[test]
    fn test_for_each_visitor_removal() {
        let table = FlowTable::new();
        for port in 1000..1010 {
            let (id, conn) = entry(port, 1);
            table.insert(id, conn);
        }

        table.for_each(|_, conn| {
            if conn.a.port % 2 == 0 {
                Visit::Remove
            } else {
                Visit::Keep
            }
        });

        assert_eq!(table.count(), 5);
        assert!(table
            .list_connections()
            .iter()
            .all(|snapshot| snapshot.a_port % 2 == 1));
    }

    #[test]
    fn test_prune_threshold_boundary() {
        let table = FlowTable::new();
        let threshold = Duration::from_secs(60);
        let now = 1_000_000_000_000u64;
        let epsilon = 1_000_000u64;

        let (stale_id, stale) = entry(1000, now - 60_000_000_000 - epsilon);
        let (fresh_id, fresh) = entry(1001, now - 60_000_000_000 + epsilon);
        table.insert(stale_id, stale);
        table.insert(fresh_id, fresh);

        assert_eq!(table.prune(now, threshold), 1);
        assert!(table.get(stale_id).is_none());
        assert!(table.get(fresh_id).is_some());
    }

    #[test]
    fn test_list_connections_returns_copies() {
        let table = FlowTable::new();
        let (id, conn) = entry(1000, 7);
        table.insert(id, conn);

        let snapshot = table.list_connections();
        table.upsert(id, || None, |c| {
            c.packets_out += 10;
            false
        });

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].packets_out, 1);
        assert_eq!(snapshot[0].hash, id);
        assert_eq!(table.get(id).unwrap().packets_out, 11);
    }

    #[test]
    fn test_concurrent_upserts_do_not_lose_updates() {
        let table = FlowTable::new();
        let (id, conn) = entry(1000, 1);
        table.insert(id, conn);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let table = table.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        table.upsert(id, || None, |c| {
                            c.packets_in += 1;
                            false
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(table.get(id).unwrap().packets_in, 4000);
        assert_eq!(table.count(), 1);
    }
}
