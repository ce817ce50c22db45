//! Distance-vector routing table (§3, §4.1).
//!
//! Two-level map `destination -> neighbour -> cost`, plus a derived global
//! vector `destination -> (best_neighbour, best_cost)` kept coherent under
//! a single lock so readers never observe a half-recomputed vector.

use std::collections::{HashMap, HashSet};
use std::fmt;

use parking_lot::RwLock;

use crate::id::NodeId;

pub type Cost = u32;

#[derive(Debug)]
pub struct NoRoute;

impl fmt::Display for NoRoute {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "no route to destination")
    }
}

impl std::error::Error for NoRoute {}

/// Best next hop and cost towards a destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Best {
    pub neighbour: NodeId,
    pub cost: Cost,
}

/// Classification of the change to the global vector produced by one
/// `update`/`remove` call, split four ways (§4.1).
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Classification {
    pub new: HashSet<NodeId>,
    pub light: HashSet<NodeId>,
    pub heavy: HashSet<NodeId>,
    pub lost: HashSet<NodeId>,
}

impl Classification {
    fn is_empty(&self) -> bool {
        self.new.is_empty() && self.light.is_empty() && self.heavy.is_empty() && self.lost.is_empty()
    }
}

struct Inner {
    // destination -> neighbour -> cost
    table: HashMap<NodeId, HashMap<NodeId, Cost>>,
    global: HashMap<NodeId, Best>,
}

pub struct RoutingTable {
    inner: RwLock<Inner>,
}

impl Default for RoutingTable {
    fn default() -> RoutingTable {
        RoutingTable::new()
    }
}

impl RoutingTable {
    pub fn new() -> RoutingTable {
        RoutingTable {
            inner: RwLock::new(Inner {
                table: HashMap::new(),
                global: HashMap::new(),
            }),
        }
    }

    /// Replaces the column for `neighbour` with `vector` (each cost offset
    /// by `link_cost`). Destinations absent from `vector` lose that
    /// column; destinations with no remaining column are deleted.
    ///
    /// `neighbour` is always treated as reachable through itself at cost
    /// 0 regardless of what `vector` says — this is how a node learns a
    /// route to a newly connected neighbour without that neighbour ever
    /// having to announce itself explicitly (`new_neighbour` calls this
    /// with an empty vector for exactly that reason).
    pub fn update(
        &self,
        neighbour: NodeId,
        link_cost: Cost,
        vector: &HashMap<NodeId, Cost>,
    ) -> Classification {
        let mut inner = self.inner.write();

        let mut vector = vector.clone();
        vector.insert(neighbour, 0);

        // Destinations previously reachable through `neighbour` that are
        // not present in the new vector: drop that column.
        let previously_via_neighbour: HashSet<NodeId> = inner
            .table
            .iter()
            .filter(|(_, cols)| cols.contains_key(&neighbour))
            .map(|(dst, _)| *dst)
            .collect();
        for dst in &previously_via_neighbour {
            if !vector.contains_key(dst) {
                if let Some(cols) = inner.table.get_mut(dst) {
                    cols.remove(&neighbour);
                    if cols.is_empty() {
                        inner.table.remove(dst);
                    }
                }
            }
        }

        for (dst, cost) in &vector {
            let cols = inner.table.entry(*dst).or_insert_with(HashMap::new);
            cols.insert(neighbour, cost + link_cost);
        }

        self.recompute(&mut inner)
    }

    /// Deletes the column for `neighbour` entirely.
    pub fn remove(&self, neighbour: NodeId) -> Classification {
        let mut inner = self.inner.write();
        let mut touched = Vec::new();
        for (dst, cols) in inner.table.iter_mut() {
            if cols.remove(&neighbour).is_some() {
                touched.push(*dst);
            }
        }
        for dst in &touched {
            if inner.table.get(dst).map_or(false, |c| c.is_empty()) {
                inner.table.remove(dst);
            }
        }
        self.recompute(&mut inner)
    }

    fn recompute(&self, inner: &mut Inner) -> Classification {
        let mut new_global = HashMap::with_capacity(inner.table.len());
        for (dst, cols) in inner.table.iter() {
            if let Some(best) = best_of(cols) {
                new_global.insert(*dst, best);
            }
        }

        let mut c = Classification::default();
        let all_dsts: HashSet<NodeId> = inner
            .global
            .keys()
            .chain(new_global.keys())
            .copied()
            .collect();
        for dst in all_dsts {
            match (inner.global.get(&dst), new_global.get(&dst)) {
                (None, Some(_)) => {
                    c.new.insert(dst);
                }
                (Some(_), None) => {
                    c.lost.insert(dst);
                }
                (Some(old), Some(new)) => {
                    if new.cost > old.cost {
                        c.heavy.insert(dst);
                    } else if new.cost < old.cost || new.neighbour != old.neighbour {
                        c.light.insert(dst);
                    }
                }
                (None, None) => unreachable!(),
            }
        }

        inner.global = new_global;
        c
    }

    /// The global vector projected for `for_neighbour`, omitting entries
    /// whose best gateway *is* that neighbour (poison reverse).
    pub fn gen_distance_vector(&self, for_neighbour: NodeId) -> HashMap<NodeId, Cost> {
        let inner = self.inner.read();
        inner
            .global
            .iter()
            .filter(|(_, best)| best.neighbour != for_neighbour)
            .map(|(dst, best)| (*dst, best.cost))
            .collect()
    }

    pub fn next_hop(&self, destination: NodeId) -> Result<NodeId, NoRoute> {
        let inner = self.inner.read();
        inner.global.get(&destination).map(|b| b.neighbour).ok_or(NoRoute)
    }

    pub fn next_hop_cost(&self, destination: NodeId) -> Result<Cost, NoRoute> {
        let inner = self.inner.read();
        inner.global.get(&destination).map(|b| b.cost).ok_or(NoRoute)
    }

    /// Partitions `destinations` into a gateway-grouped mapping and the
    /// subset with no known route.
    pub fn next_hops(
        &self,
        destinations: &HashSet<NodeId>,
    ) -> (HashMap<NodeId, Vec<NodeId>>, HashSet<NodeId>) {
        let inner = self.inner.read();
        let mut grouped: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        let mut unresolved = HashSet::new();
        for dst in destinations {
            match inner.global.get(dst) {
                Some(best) => grouped.entry(best.neighbour).or_insert_with(Vec::new).push(*dst),
                None => {
                    unresolved.insert(*dst);
                }
            }
        }
        (grouped, unresolved)
    }

    /// The lowest-cost reachable destination among `candidates`, tied
    /// broken lexicographically (used by duplicate-origin resolution,
    /// §8 S6).
    pub fn cheapest(&self, candidates: &HashSet<NodeId>) -> Option<NodeId> {
        let inner = self.inner.read();
        candidates
            .iter()
            .filter_map(|c| inner.global.get(c).map(|b| (*c, b.cost)))
            .min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)))
            .map(|(id, _)| id)
    }
}

/// Deterministic minimum of one destination's neighbour->cost columns,
/// ties broken lexicographically on the neighbour identifier.
fn best_of(cols: &HashMap<NodeId, Cost>) -> Option<Best> {
    cols.iter()
        .min_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)))
        .map(|(neighbour, cost)| Best {
            neighbour: *neighbour,
            cost: *cost,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<NodeId> {
        (0..n).map(|i| NodeId::from_bytes([i as u8; 16])).collect()
    }

    #[test]
    fn update_installs_new_destinations() {
        let rt = RoutingTable::new();
        let ids = ids(3);
        let mut v = HashMap::new();
        v.insert(ids[2], 1);
        let c = rt.update(ids[1], 1, &v);
        assert!(c.new.contains(&ids[2]));
        assert_eq!(rt.next_hop(ids[2]).unwrap(), ids[1]);
        assert_eq!(rt.next_hop_cost(ids[2]).unwrap(), 2);
    }

    #[test]
    fn tie_break_is_lexicographic() {
        let rt = RoutingTable::new();
        let ids = ids(3);
        let mut v1 = HashMap::new();
        v1.insert(ids[2], 5);
        rt.update(ids[0], 0, &v1);
        let mut v2 = HashMap::new();
        v2.insert(ids[2], 5);
        rt.update(ids[1], 0, &v2);
        // ids[0] < ids[1] lexicographically (0x00.. < 0x01..)
        assert_eq!(rt.next_hop(ids[2]).unwrap(), ids[0]);
    }

    #[test]
    fn remove_drops_empty_rows() {
        let rt = RoutingTable::new();
        let ids = ids(2);
        let mut v = HashMap::new();
        v.insert(ids[1], 1);
        rt.update(ids[1], 0, &v);
        let c = rt.remove(ids[1]);
        assert!(c.lost.contains(&ids[1]));
        assert!(rt.next_hop(ids[1]).is_err());
    }

    #[test]
    fn poison_reverse_by_suppression() {
        let rt = RoutingTable::new();
        let ids = ids(3);
        let mut v = HashMap::new();
        v.insert(ids[2], 1);
        rt.update(ids[1], 1, &v);
        let gen = rt.gen_distance_vector(ids[1]);
        assert!(!gen.contains_key(&ids[2]));
    }

    #[test]
    fn classify_heavy_and_light() {
        let rt = RoutingTable::new();
        let ids = ids(3);
        let mut v = HashMap::new();
        v.insert(ids[2], 1);
        rt.update(ids[1], 0, &v);

        let mut worse = HashMap::new();
        worse.insert(ids[2], 10);
        let c = rt.update(ids[1], 0, &worse);
        assert!(c.heavy.contains(&ids[2]));

        let mut better = HashMap::new();
        better.insert(ids[2], 1);
        let c = rt.update(ids[1], 0, &better);
        assert!(c.light.contains(&ids[2]));
    }
}
