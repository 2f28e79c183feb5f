//! Peer Table
//!
//! Runtime handles for the other DGI instances in the group. The connection
//! manager proper (framing, reconnect, discovery) is an external collaborator;
//! this table is the seam the coordination modules talk to: look up the peer
//! set and send without blocking.

use crate::messages::{Envelope, PeerMessage};
use crate::types::{PeerId, Result};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::info;

/// Capability to deliver messages to one remote node.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: PeerId,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl PeerHandle {
    pub fn new(id: PeerId, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// Queue a message for delivery. Never blocks; a closed peer is an error
    /// the caller logs and moves past.
    pub fn send(&self, from: PeerId, msg: PeerMessage) -> Result<()> {
        self.tx
            .send(Envelope { from, msg })
            .map_err(|_| crate::types::Error::PeerSend(self.id.to_string()))
    }
}

/// All peers this node can currently reach, keyed by id.
pub struct PeerTable {
    local: PeerId,
    peers: DashMap<PeerId, PeerHandle>,
}

impl PeerTable {
    pub fn new(local: PeerId) -> Self {
        Self { local, peers: DashMap::new() }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local
    }

    pub fn insert(&self, handle: PeerHandle) {
        info!(peer = %handle.id(), "peer added");
        self.peers.insert(handle.id().clone(), handle);
    }

    pub fn remove(&self, id: &PeerId) {
        if self.peers.remove(id).is_some() {
            info!(peer = %id, "peer evicted");
        }
    }

    pub fn get(&self, id: &PeerId) -> Option<PeerHandle> {
        self.peers.get(id).map(|p| p.value().clone())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// All remote handles in id order.
    pub fn all(&self) -> Vec<PeerHandle> {
        let mut peers: Vec<PeerHandle> = self.peers.iter().map(|p| p.value().clone()).collect();
        peers.sort_by(|a, b| a.id().cmp(b.id()));
        peers
    }

    /// Remote handles in a rotation that starts immediately after the local id
    /// in the sorted peer list. Spreads periodic traffic bursts so the fleet
    /// does not all query the same peer first.
    pub fn rotation_after_self(&self) -> Vec<PeerHandle> {
        let sorted = self.all();
        let split = sorted.partition_point(|p| *p.id() <= self.local);
        let mut rotated = Vec::with_capacity(sorted.len());
        rotated.extend_from_slice(&sorted[split..]);
        rotated.extend_from_slice(&sorted[..split]);
        rotated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(local: &str, ids: &[&str]) -> (PeerTable, Vec<mpsc::UnboundedReceiver<Envelope>>) {
        let table = PeerTable::new(PeerId::from(local));
        let mut rxs = Vec::new();
        for id in ids {
            let (tx, rx) = mpsc::unbounded_channel();
            table.insert(PeerHandle::new(PeerId::from(*id), tx));
            rxs.push(rx);
        }
        (table, rxs)
    }

    #[test]
    fn rotation_starts_after_local_id() {
        let (table, _rxs) = table_with("b", &["a", "c", "d"]);
        let order: Vec<String> =
            table.rotation_after_self().iter().map(|p| p.id().to_string()).collect();
        assert_eq!(order, vec!["c", "d", "a"]);
    }

    #[test]
    fn rotation_with_local_last_is_plain_order() {
        let (table, _rxs) = table_with("z", &["a", "b"]);
        let order: Vec<String> =
            table.rotation_after_self().iter().map(|p| p.id().to_string()).collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn send_reaches_receiver() {
        let (table, mut rxs) = table_with("a", &["b"]);
        let peer = table.get(&PeerId::from("b")).unwrap();
        peer.send(PeerId::from("a"), PeerMessage::Exchange { query: 1 }).unwrap();
        let env = rxs[0].try_recv().unwrap();
        assert_eq!(env.from, PeerId::from("a"));
    }

    #[test]
    fn send_to_dropped_peer_errors() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let peer = PeerHandle::new(PeerId::from("gone"), tx);
        assert!(peer.send(PeerId::from("a"), PeerMessage::Exchange { query: 0 }).is_err());
    }
}
