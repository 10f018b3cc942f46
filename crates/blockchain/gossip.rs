use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use taskmesh_common::AuthorityId;
use tracing::{trace, warn};

/// Wire-level message kind; unknown kinds are dropped on receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Status,
    BlockRequest,
    BlockAnnounce,
    Transactions,
    Verification,
    Unknown,
}

impl MessageKind {
    pub fn from_u8(kind: u8) -> Self {
        match kind {
            0 => MessageKind::Status,
            1 => MessageKind::BlockRequest,
            2 => MessageKind::BlockAnnounce,
            3 => MessageKind::Transactions,
            4 => MessageKind::Verification,
            _ => MessageKind::Unknown,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            MessageKind::Status => 0,
            MessageKind::BlockRequest => 1,
            MessageKind::BlockAnnounce => 2,
            MessageKind::Transactions => 3,
            MessageKind::Verification => 4,
            MessageKind::Unknown => 99,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipMessage {
    pub kind: MessageKind,
    pub data: Bytes,
}

/// Outbound side of the gossip wire; the libp2p host lives behind this seam.
pub trait Gossiper: Send + Sync {
    fn broadcast(&self, message: GossipMessage);

    /// Vote traffic is deduplicated by `(round, authority, stage)` before it
    /// reaches the wire.
    fn broadcast_vote(
        &self,
        round: u64,
        authority: AuthorityId,
        stage: u8,
        message: GossipMessage,
    );
}

/// Fans messages out to per-peer queues. Queues are bounded; on overflow the
/// oldest undelivered message is dropped and counted.
pub struct BroadcastGossiper {
    peers: Mutex<HashMap<String, VecDeque<GossipMessage>>>,
    seen_votes: Mutex<HashSet<(u64, AuthorityId, u8)>>,
    queue_capacity: usize,
    dropped: AtomicU64,
}

impl BroadcastGossiper {
    pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

    pub fn new(queue_capacity: usize) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            seen_votes: Mutex::new(HashSet::new()),
            queue_capacity,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn add_peer(&self, peer: impl Into<String>) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.entry(peer.into()).or_default();
        }
    }

    pub fn remove_peer(&self, peer: &str) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.remove(peer);
        }
    }

    /// Takes everything queued for `peer`; the transport drains this from
    /// its write loop.
    pub fn drain_peer(&self, peer: &str) -> Vec<GossipMessage> {
        self.peers
            .lock()
            .ok()
            .and_then(|mut peers| peers.get_mut(peer).map(std::mem::take))
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Forgets vote dedup state of rounds older than `round`.
    pub fn prune_votes_before(&self, round: u64) {
        if let Ok(mut seen) = self.seen_votes.lock() {
            seen.retain(|(vote_round, _, _)| *vote_round >= round);
        }
    }
}

impl Default for BroadcastGossiper {
    fn default() -> Self {
        Self::new(Self::DEFAULT_QUEUE_CAPACITY)
    }
}

impl Gossiper for BroadcastGossiper {
    fn broadcast(&self, message: GossipMessage) {
        if message.kind == MessageKind::Unknown {
            warn!("refusing to broadcast an unknown-kind message");
            return;
        }
        let Ok(mut peers) = self.peers.lock() else {
            return;
        };
        for (peer, queue) in peers.iter_mut() {
            if queue.len() >= self.queue_capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(peer, "gossip queue overflow, dropped oldest");
            }
            queue.push_back(message.clone());
        }
    }

    fn broadcast_vote(
        &self,
        round: u64,
        authority: AuthorityId,
        stage: u8,
        message: GossipMessage,
    ) {
        let fresh = self
            .seen_votes
            .lock()
            .map(|mut seen| seen.insert((round, authority, stage)))
            .unwrap_or(false);
        if fresh {
            self.broadcast(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(byte: u8) -> GossipMessage {
        GossipMessage {
            kind: MessageKind::Transactions,
            data: Bytes::copy_from_slice(&[byte]),
        }
    }

    #[test]
    fn unknown_kinds_map_to_99() {
        assert_eq!(MessageKind::from_u8(7), MessageKind::Unknown);
        assert_eq!(MessageKind::Unknown.as_u8(), 99);
        assert_eq!(MessageKind::from_u8(2), MessageKind::BlockAnnounce);
    }

    #[test]
    fn broadcast_reaches_every_peer() {
        let gossiper = BroadcastGossiper::default();
        gossiper.add_peer("a");
        gossiper.add_peer("b");
        gossiper.broadcast(message(1));
        assert_eq!(gossiper.drain_peer("a").len(), 1);
        assert_eq!(gossiper.drain_peer("b").len(), 1);
        assert_eq!(gossiper.drain_peer("a").len(), 0);
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let gossiper = BroadcastGossiper::new(2);
        gossiper.add_peer("a");
        gossiper.broadcast(message(1));
        gossiper.broadcast(message(2));
        gossiper.broadcast(message(3));
        let queued = gossiper.drain_peer("a");
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].data.as_ref(), &[2]);
        assert_eq!(gossiper.dropped_messages(), 1);
    }

    #[test]
    fn votes_are_deduplicated() {
        let gossiper = BroadcastGossiper::default();
        gossiper.add_peer("a");
        let id = AuthorityId([1; 32]);
        gossiper.broadcast_vote(4, id, 0, message(1));
        gossiper.broadcast_vote(4, id, 0, message(1));
        gossiper.broadcast_vote(4, id, 1, message(2));
        assert_eq!(gossiper.drain_peer("a").len(), 2);

        gossiper.prune_votes_before(5);
        gossiper.broadcast_vote(4, id, 0, message(1));
        assert_eq!(gossiper.drain_peer("a").len(), 1);
    }
}
