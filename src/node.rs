//! Thin coordinator (§4.3) binding the routing and flow tables together.
//! Every decision surface here is pure with respect to its inputs plus
//! current table state; side effects are confined to the two tables.

use std::collections::{HashMap, HashSet};

use crate::flow::{FlowKey, FlowTable};
use crate::id::NodeId;
use crate::routing::{Cost, RoutingTable};

/// Output of `receive_distance_vector`: which flows lost a consumer that
/// must be re-requested, and which flow origins need re-announcing
/// toward the changed neighbour.
pub struct RoutingOutcome {
    pub losses: HashSet<FlowKey>,
    pub regossip: HashSet<NodeId>,
}

pub struct Node {
    pub self_id: NodeId,
    pub routing: RoutingTable,
    pub flows: FlowTable,
}

impl Node {
    pub fn new(self_id: NodeId) -> Node {
        Node {
            self_id,
            routing: RoutingTable::new(),
            flows: FlowTable::new(),
        }
    }

    /// Registers a freshly connected neighbour with the routing table
    /// before any `DISTANCE_VECTOR` frame has arrived from it — a direct
    /// neighbour is always reachable at `link_cost`, which `update`
    /// asserts unconditionally (§3: the routing table's self-column
    /// rule), so an empty vector is enough to seed it.
    pub fn new_neighbour(&self, neighbour: NodeId, link_cost: Cost) -> Option<RoutingOutcome> {
        self.receive_distance_vector(neighbour, link_cost, &HashMap::new())
    }

    /// Applies a distance-vector update from `neighbour` and interprets
    /// the classification as flow-table recovery work (§4.3).
    ///
    /// `None` means the update had no observable effect and the caller
    /// should suppress re-gossip.
    pub fn receive_distance_vector(
        &self,
        neighbour: NodeId,
        link_cost: Cost,
        vector: &HashMap<NodeId, Cost>,
    ) -> Option<RoutingOutcome> {
        let c = self.routing.update(neighbour, link_cost, vector);

        if !c.heavy.is_empty() || !c.lost.is_empty() {
            let losses = self.flows.clean(self.self_id, &c.heavy, &c.lost);
            Some(RoutingOutcome {
                losses,
                regossip: c.heavy,
            })
        } else if !c.new.is_empty() || !c.light.is_empty() {
            Some(RoutingOutcome {
                losses: HashSet::new(),
                regossip: HashSet::new(),
            })
        } else {
            None
        }
    }

    /// A neighbour's control link is gone: treat every destination it was
    /// the sole gateway for as lost.
    pub fn remove_neighbour(&self, neighbour: NodeId) -> Option<RoutingOutcome> {
        let c = self.routing.remove(neighbour);
        if !c.lost.is_empty() || !c.heavy.is_empty() {
            let losses = self.flows.clean(self.self_id, &c.heavy, &c.lost);
            Some(RoutingOutcome {
                losses,
                regossip: c.heavy,
            })
        } else {
            None
        }
    }

    /// Picks the cheapest announced origin for `flow_id` if `origin` is
    /// `None` (tie broken lexicographically, §8 S6), installs the local
    /// node as a destination, and returns the next hop (if forwarding is
    /// required), the resolved key, and the wire request to send.
    pub fn flow_request(
        &self,
        flow_id: &str,
        origin: Option<NodeId>,
    ) -> Option<(Option<NodeId>, FlowKey)> {
        let origin = match origin {
            Some(o) => o,
            None => {
                let candidates = self.flows.origins_for(flow_id);
                self.routing.cheapest(&candidates)?
            }
        };
        let key = FlowKey {
            flow_id: flow_id.to_string(),
            origin,
        };
        let next = self.flows.request(&key, self.self_id, self.self_id);
        let hop = next.and_then(|_| self.routing.next_hop(origin).ok());
        Some((hop, key))
    }

    /// Re-installs the local node as a destination of `key` (used after
    /// a loss is observed) if the flow still exists.
    pub fn flow_recovery(&self, key: &FlowKey) -> Option<Option<NodeId>> {
        let next = self.flows.request(key, self.self_id, self.self_id)?;
        let _ = next;
        Some(self.routing.next_hop(key.origin).ok())
    }

    /// Applies an incoming `FLOW_REQUEST`; returns the next hop if this
    /// node must forward further upstream.
    pub fn handle_flow_request(&self, key: &FlowKey, destination: NodeId) -> Option<NodeId> {
        let origin = self.flows.request(key, destination, self.self_id)?;
        self.routing.next_hop(origin).ok()
    }

    /// Applies an incoming `FLOW_CANCEL`; symmetric to
    /// `handle_flow_request`.
    pub fn handle_flow_cancel(&self, key: &FlowKey, destination: NodeId) -> Option<NodeId> {
        let origin = self.flows.renunciation(key, destination, self.self_id)?;
        self.routing.next_hop(origin).ok()
    }

    /// `true` iff `key` was previously unknown — the caller should flood
    /// the announcement to other neighbours.
    pub fn announcement(&self, key: FlowKey) -> bool {
        self.flows.register_supplier(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(b: u8) -> NodeId {
        NodeId::from_bytes([b; 16])
    }

    #[test]
    fn receive_distance_vector_drives_flow_recovery_on_loss() {
        let node = Node::new(id(9));
        let mut v = HashMap::new();
        v.insert(id(1), 1);
        node.receive_distance_vector(id(2), 0, &v);

        let key = FlowKey {
            flow_id: "x".into(),
            origin: id(1),
        };
        node.announcement(key.clone());
        node.flows.request(&key, id(9), id(9));

        let outcome = node.remove_neighbour(id(2)).expect("should classify a change");
        assert!(outcome.losses.contains(&key));
    }

    #[test]
    fn flow_request_picks_cheapest_duplicate_origin() {
        let node = Node::new(id(9));
        let mut v1 = HashMap::new();
        v1.insert(id(1), 5);
        node.receive_distance_vector(id(1), 0, &v1);
        let mut v2 = HashMap::new();
        v2.insert(id(2), 1);
        node.receive_distance_vector(id(2), 0, &v2);

        node.announcement(FlowKey {
            flow_id: "movie".into(),
            origin: id(1),
        });
        node.announcement(FlowKey {
            flow_id: "movie".into(),
            origin: id(2),
        });

        let (_, key) = node.flow_request("movie", None).unwrap();
        assert_eq!(key.origin, id(2));
    }
}
