//! Flow table (§3, §4.2): per-flow destination sets and states, keyed by
//! `(flow_id, origin)`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::id::NodeId;

/// `(flow_id, origin)` — uniquely identifies one logical stream.
#[derive(Clone, PartialEq, Eq, Hash, Debug, serde::Serialize, serde::Deserialize)]
pub struct FlowKey {
    pub flow_id: String,
    pub origin: NodeId,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.flow_id, self.origin)
    }
}

/// Ordered ACTIVE < STREAMING < HOLD < INVALID (§3); declaration order
/// gives us this for free via `#[derive(PartialOrd, Ord)]`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum FlowState {
    Active,
    Streaming,
    Hold,
    Invalid,
}

#[derive(Debug)]
pub enum FlowError {
    Unknown,
    Invalid,
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FlowError::Unknown => write!(f, "unknown flow"),
            FlowError::Invalid => write!(f, "flow was withdrawn"),
        }
    }
}

impl std::error::Error for FlowError {}

struct EntryState {
    state: FlowState,
    destinations: HashSet<NodeId>,
}

struct Entry {
    cell: Mutex<EntryState>,
    condvar: Condvar,
}

struct Inner {
    entries: HashMap<FlowKey, Arc<Entry>>,
    by_flow_id: HashMap<String, HashSet<NodeId>>,
    by_origin: HashMap<NodeId, HashSet<String>>,
}

impl Inner {
    fn insert_indexes(&mut self, key: &FlowKey) {
        self.by_flow_id
            .entry(key.flow_id.clone())
            .or_insert_with(HashSet::new)
            .insert(key.origin);
        self.by_origin
            .entry(key.origin)
            .or_insert_with(HashSet::new)
            .insert(key.flow_id.clone());
    }

    fn remove_indexes(&mut self, key: &FlowKey) {
        if let Some(origins) = self.by_flow_id.get_mut(&key.flow_id) {
            origins.remove(&key.origin);
            if origins.is_empty() {
                self.by_flow_id.remove(&key.flow_id);
            }
        }
        if let Some(flow_ids) = self.by_origin.get_mut(&key.origin) {
            flow_ids.remove(&key.flow_id);
            if flow_ids.is_empty() {
                self.by_origin.remove(&key.origin);
            }
        }
    }
}

pub struct FlowTable {
    inner: RwLock<Inner>,
}

impl Default for FlowTable {
    fn default() -> FlowTable {
        FlowTable::new()
    }
}

impl FlowTable {
    pub fn new() -> FlowTable {
        FlowTable {
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                by_flow_id: HashMap::new(),
                by_origin: HashMap::new(),
            }),
        }
    }

    /// Creates an entry in HOLD if one doesn't already exist. Returns
    /// `true` iff the key was previously unknown (§4.3 `announcement`).
    pub fn register_supplier(&self, key: FlowKey) -> bool {
        let mut inner = self.inner.write();
        if inner.entries.contains_key(&key) {
            return false;
        }
        inner.insert_indexes(&key);
        inner.entries.insert(
            key,
            Arc::new(Entry {
                cell: Mutex::new(EntryState {
                    state: FlowState::Hold,
                    destinations: HashSet::new(),
                }),
                condvar: Condvar::new(),
            }),
        );
        true
    }

    /// Inserts any previously-unknown keys in HOLD. Returns the subset
    /// actually inserted — empty means no gossip propagation is needed.
    pub fn merge_collection(&self, keys: HashSet<FlowKey>) -> HashSet<FlowKey> {
        let mut inserted = HashSet::new();
        for key in keys {
            if self.register_supplier(key.clone()) {
                inserted.insert(key);
            }
        }
        inserted
    }

    fn get(&self, key: &FlowKey) -> Option<Arc<Entry>> {
        self.inner.read().entries.get(key).cloned()
    }

    /// Adds `destination`, upgrading state as described in §4.2. Returns
    /// the origin to forward upstream when this node is not the origin
    /// (and the key is known); `None` otherwise.
    pub fn request(&self, key: &FlowKey, destination: NodeId, self_id: NodeId) -> Option<NodeId> {
        let entry = self.get(key)?;
        {
            let mut st = entry.cell.lock();
            if st.state == FlowState::Invalid {
                return None;
            }
            st.destinations.insert(destination);
            let target = if destination == self_id {
                FlowState::Active
            } else {
                FlowState::Streaming
            };
            if target < st.state {
                st.state = target;
            }
            entry.condvar.notify_all();
        }
        if self_id != key.origin {
            Some(key.origin)
        } else {
            None
        }
    }

    /// Removes `destination`; downgrades to HOLD if the set becomes
    /// empty. Returns the origin to forward a cancel upstream when the
    /// removed destination was the local node.
    pub fn renunciation(&self, key: &FlowKey, destination: NodeId, self_id: NodeId) -> Option<NodeId> {
        let entry = self.get(key)?;
        {
            let mut st = entry.cell.lock();
            st.destinations.remove(&destination);
            if st.destinations.is_empty() && st.state != FlowState::Invalid {
                st.state = FlowState::Hold;
            }
            entry.condvar.notify_all();
        }
        if destination == self_id {
            Some(key.origin)
        } else {
            None
        }
    }

    /// Transitions to INVALID (waking waiters with an error) and deletes
    /// the entry. Returns the flow_id.
    pub fn remove(&self, key: &FlowKey) -> Option<String> {
        let mut inner = self.inner.write();
        let entry = inner.entries.remove(key)?;
        inner.remove_indexes(key);
        {
            let mut st = entry.cell.lock();
            st.state = FlowState::Invalid;
            st.destinations.clear();
            entry.condvar.notify_all();
        }
        Some(key.flow_id.clone())
    }

    /// Blocks while state is HOLD; wakes on any transition; errors if
    /// the flow becomes INVALID or was never known.
    pub fn await_active(&self, key: &FlowKey) -> Result<(), FlowError> {
        let entry = self.get(key).ok_or(FlowError::Unknown)?;
        let mut st = entry.cell.lock();
        while st.state == FlowState::Hold {
            entry.condvar.wait(&mut st);
        }
        if st.state == FlowState::Invalid {
            Err(FlowError::Invalid)
        } else {
            Ok(())
        }
    }

    pub fn state(&self, key: &FlowKey) -> Option<FlowState> {
        let entry = self.get(key)?;
        Some(entry.cell.lock().state)
    }

    pub fn destinations(&self, key: &FlowKey) -> Option<HashSet<NodeId>> {
        let entry = self.get(key)?;
        Some(entry.cell.lock().destinations.clone())
    }

    /// Lists all known flow ids mapped to their cheapest (most active)
    /// known state, for `get_available_flows` (§6).
    pub fn available_flows(&self) -> HashMap<String, FlowState> {
        let inner = self.inner.read();
        let mut out: HashMap<String, FlowState> = HashMap::new();
        for (key, entry) in inner.entries.iter() {
            let state = entry.cell.lock().state;
            out.entry(key.flow_id.clone())
                .and_modify(|s| {
                    if state < *s {
                        *s = state;
                    }
                })
                .or_insert(state);
        }
        out
    }

    pub fn origins_for(&self, flow_id: &str) -> HashSet<NodeId> {
        self.inner
            .read()
            .by_flow_id
            .get(flow_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn keys_for_origin(&self, origin: NodeId) -> HashSet<FlowKey> {
        self.inner
            .read()
            .by_origin
            .get(&origin)
            .map(|flow_ids| {
                flow_ids
                    .iter()
                    .map(|flow_id| FlowKey {
                        flow_id: flow_id.clone(),
                        origin,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn all_keys(&self) -> HashSet<FlowKey> {
        self.inner.read().entries.keys().cloned().collect()
    }

    /// For every flow whose origin is in `heavy ∪ critical`, strips
    /// destinations (downgrading to HOLD) and, if the origin is in
    /// `critical`, drops the entry entirely. For every other flow,
    /// strips any destination that is itself in `critical` (a neighbour
    /// whose route just disappeared can no longer be forwarded to).
    /// Returns the subset of origin-affected flows where the local node
    /// was itself a consumer — these need to be re-requested upstream.
    pub fn clean(
        &self,
        self_id: NodeId,
        heavy: &HashSet<NodeId>,
        critical: &HashSet<NodeId>,
    ) -> HashSet<FlowKey> {
        let mut losses = HashSet::new();
        let mut inner = self.inner.write();
        let mut to_delete = Vec::new();

        for (key, entry) in inner.entries.iter() {
            if heavy.contains(&key.origin) || critical.contains(&key.origin) {
                let mut st = entry.cell.lock();
                let was_consumer = st.destinations.contains(&self_id);
                st.destinations.clear();
                if st.state != FlowState::Invalid {
                    st.state = FlowState::Hold;
                }
                entry.condvar.notify_all();
                drop(st);
                if was_consumer {
                    losses.insert(key.clone());
                }
                if critical.contains(&key.origin) {
                    to_delete.push(key.clone());
                }
            } else {
                let mut st = entry.cell.lock();
                if st.destinations.iter().any(|d| critical.contains(d)) {
                    st.destinations.retain(|d| !critical.contains(d));
                    if st.destinations.is_empty() && st.state != FlowState::Invalid {
                        st.state = FlowState::Hold;
                    }
                    entry.condvar.notify_all();
                }
            }
        }

        for key in to_delete {
            if let Some(entry) = inner.entries.remove(&key) {
                let mut st = entry.cell.lock();
                st.state = FlowState::Invalid;
                entry.condvar.notify_all();
            }
            inner.remove_indexes(&key);
        }

        losses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(b: u8) -> NodeId {
        NodeId::from_bytes([b; 16])
    }

    fn key() -> FlowKey {
        FlowKey {
            flow_id: "movie.Mjpeg".into(),
            origin: id(1),
        }
    }

    #[test]
    fn request_then_renunciation_restores_prior_state() {
        let ft = FlowTable::new();
        ft.register_supplier(key());
        let before = ft.state(&key()).unwrap();
        let before_dsts = ft.destinations(&key()).unwrap();

        ft.request(&key(), id(2), id(1));
        ft.renunciation(&key(), id(2), id(1));

        assert_eq!(ft.state(&key()).unwrap(), before);
        assert_eq!(ft.destinations(&key()).unwrap(), before_dsts);
    }

    #[test]
    fn active_when_self_requests() {
        let ft = FlowTable::new();
        ft.register_supplier(key());
        let fwd = ft.request(&key(), id(9), id(9));
        assert_eq!(fwd, Some(id(1)));
        assert_eq!(ft.state(&key()).unwrap(), FlowState::Active);
    }

    #[test]
    fn origin_request_does_not_forward() {
        let ft = FlowTable::new();
        ft.register_supplier(key());
        let fwd = ft.request(&key(), id(2), id(1));
        assert_eq!(fwd, None);
        assert_eq!(ft.state(&key()).unwrap(), FlowState::Streaming);
    }

    #[test]
    fn merge_collection_is_idempotent() {
        let ft = FlowTable::new();
        let mut set = HashSet::new();
        set.insert(key());
        let first = ft.merge_collection(set.clone());
        assert_eq!(first.len(), 1);
        let second = ft.merge_collection(set);
        assert!(second.is_empty());
    }

    #[test]
    fn clean_strips_critical_origin_entirely() {
        let ft = FlowTable::new();
        ft.register_supplier(key());
        ft.request(&key(), id(9), id(9));

        let mut critical = HashSet::new();
        critical.insert(id(1));
        let losses = ft.clean(id(9), &HashSet::new(), &critical);
        assert!(losses.contains(&key()));
        assert!(ft.state(&key()).is_none());
    }

    #[test]
    fn clean_downgrades_heavy_origin_to_hold() {
        let ft = FlowTable::new();
        ft.register_supplier(key());
        ft.request(&key(), id(9), id(9));

        let mut heavy = HashSet::new();
        heavy.insert(id(1));
        let losses = ft.clean(id(9), &heavy, &HashSet::new());
        assert!(losses.contains(&key()));
        assert_eq!(ft.state(&key()).unwrap(), FlowState::Hold);
        assert!(ft.destinations(&key()).unwrap().is_empty());
    }
}
