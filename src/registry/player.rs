//! Player registry (§4, component 6): per-flow chunk sinks. The player
//! itself — the thing that renders chunks — is an external collaborator;
//! only its contract (`ChunkSink`) is specified here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::flow::FlowKey;

pub type PlayerId = u64;

/// Contract for the external chunk sink (§1: out of scope, specified
/// only as a contract).
pub trait ChunkSink: Send + Sync {
    fn accept(&self, frame_number: u64, bytes: &[u8]);

    /// Called when the flow is withdrawn or the route to its origin is
    /// permanently lost.
    fn cancelled(&self) {}
}

impl<T: ChunkSink + ?Sized> ChunkSink for Arc<T> {
    fn accept(&self, frame_number: u64, bytes: &[u8]) {
        (**self).accept(frame_number, bytes)
    }

    fn cancelled(&self) {
        (**self).cancelled()
    }
}

struct Slot {
    flow_key: FlowKey,
    sink: Box<dyn ChunkSink>,
}

#[derive(Default)]
pub struct PlayerRegistry {
    next_id: AtomicU64,
    players: RwLock<HashMap<PlayerId, Slot>>,
}

impl PlayerRegistry {
    pub fn new() -> PlayerRegistry {
        PlayerRegistry::default()
    }

    pub fn new_player(&self, flow_key: FlowKey, sink: Box<dyn ChunkSink>) -> PlayerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.players.write().insert(id, Slot { flow_key, sink });
        id
    }

    pub fn remove_player(&self, id: PlayerId) -> Option<()> {
        self.players.write().remove(&id).map(|_| ())
    }

    /// Delivers a chunk to every player registered against `flow_key`.
    pub fn deliver(&self, flow_key: &FlowKey, frame_number: u64, bytes: &[u8]) {
        for slot in self.players.read().values() {
            if &slot.flow_key == flow_key {
                slot.sink.accept(frame_number, bytes);
            }
        }
    }

    /// Cancels (and drops) every player registered against `flow_key`,
    /// used on withdraw or permanent route loss (§4.6 `FLOW_WITHDRAW`).
    pub fn cancel_flow(&self, flow_key: &FlowKey) {
        let mut players = self.players.write();
        let dead: Vec<PlayerId> = players
            .iter()
            .filter(|(_, slot)| &slot.flow_key == flow_key)
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            if let Some(slot) = players.remove(&id) {
                slot.sink.cancelled();
            }
        }
    }

    pub fn has_player_for(&self, flow_key: &FlowKey) -> bool {
        self.players.read().values().any(|slot| &slot.flow_key == flow_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::NodeId;
    use std::sync::Mutex;

    struct Recording(Mutex<Vec<(u64, Vec<u8>)>>);

    impl ChunkSink for Recording {
        fn accept(&self, frame_number: u64, bytes: &[u8]) {
            self.0.lock().unwrap().push((frame_number, bytes.to_vec()));
        }
    }

    #[test]
    fn delivers_only_to_matching_flow() {
        let reg = PlayerRegistry::new();
        let key_a = FlowKey {
            flow_id: "a".into(),
            origin: NodeId::from_bytes([1; 16]),
        };
        let key_b = FlowKey {
            flow_id: "b".into(),
            origin: NodeId::from_bytes([1; 16]),
        };
        let sink = Box::new(Recording(Mutex::new(Vec::new())));
        reg.new_player(key_a.clone(), sink);

        reg.deliver(&key_a, 1, b"hello");
        reg.deliver(&key_b, 2, b"ignored");
        assert!(reg.has_player_for(&key_a));
        assert!(!reg.has_player_for(&key_b));
    }
}
