//! Mesh topology: last-writer-wins adjacency claims per announcing node.
//!
//! Edges are derived on demand from each node's latest announced neighbour set, so a
//! node's removal drops every edge only it asserted. A removed node leaves a tombstone
//! timestamp behind, so a replay of its earlier announcements cannot bring it back.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use parking_lot::RwLock;

use crate::identity::PeerId;

#[derive(Debug, Clone)]
struct NodeAnnouncement {
    nickname: Option<String>,
    neighbors: HashSet<PeerId>,
    timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyEdge {
    pub a: PeerId,
    pub b: PeerId,
    /// Side whose announcement asserts the edge; for confirmed edges, the lower id.
    pub confirmed_by: PeerId,
    pub is_confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyNode {
    pub peer_id: PeerId,
    pub nickname: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologySnapshot {
    pub nodes: Vec<TopologyNode>,
    pub edges: Vec<TopologyEdge>,
}

#[derive(Default)]
pub struct MeshTopology {
    nodes: RwLock<HashMap<PeerId, NodeAnnouncement>>,
    removed: RwLock<HashMap<PeerId, u64>>,
}

impl MeshTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an announcement. Older than the stored timestamp, or not newer than the
    /// node's removal: ignored, whatever it carries. Otherwise the neighbour set is replaced
    /// outright (`None` means no neighbours). Returns true if applied.
    pub fn update_from_announcement(
        &self,
        origin: PeerId,
        nickname: Option<&str>,
        neighbors: Option<&[PeerId]>,
        timestamp: u64,
    ) -> bool {
        let mut nodes = self.nodes.write();
        if let Some(existing) = nodes.get(&origin) {
            if timestamp < existing.timestamp {
                return false;
            }
        }
        {
            let mut removed = self.removed.write();
            match removed.get(&origin) {
                Some(&at) if timestamp <= at => return false,
                Some(_) => {
                    removed.remove(&origin);
                }
                None => {}
            }
        }
        let previous_nick = nodes.get(&origin).and_then(|n| n.nickname.clone());
        nodes.insert(
            origin,
            NodeAnnouncement {
                nickname: nickname.map(str::to_string).or(previous_nick),
                neighbors: neighbors
                    .unwrap_or_default()
                    .iter()
                    .copied()
                    .filter(|p| *p != origin)
                    .collect(),
                timestamp,
            },
        );
        true
    }

    /// Forget `peer`, remembering `removed_at` (or its last announcement, if later) as the
    /// point its announcements must be newer than.
    pub fn remove_peer(&self, peer: PeerId, removed_at: u64) -> bool {
        let node = self.nodes.write().remove(&peer);
        let at = node.as_ref().map_or(removed_at, |n| n.timestamp.max(removed_at));
        let mut removed = self.removed.write();
        let tombstone = removed.entry(peer).or_insert(at);
        *tombstone = (*tombstone).max(at);
        node.is_some()
    }

    pub fn neighbors_of(&self, peer: PeerId) -> Option<Vec<PeerId>> {
        self.nodes
            .read()
            .get(&peer)
            .map(|n| n.neighbors.iter().copied().collect())
    }

    pub fn timestamp_of(&self, peer: PeerId) -> Option<u64> {
        self.nodes.read().get(&peer).map(|n| n.timestamp)
    }

    /// Drop nodes whose latest announcement is older than `cutoff`.
    pub fn prune_older_than(&self, cutoff: u64) -> usize {
        let mut nodes = self.nodes.write();
        let before = nodes.len();
        nodes.retain(|_, n| n.timestamp >= cutoff);
        self.removed.write().retain(|_, at| *at >= cutoff);
        before - nodes.len()
    }

    pub fn edges(&self) -> Vec<TopologyEdge> {
        let nodes = self.nodes.read();
        let mut seen: BTreeSet<(PeerId, PeerId)> = BTreeSet::new();
        let mut edges = Vec::new();
        for (origin, node) in nodes.iter() {
            for neighbor in &node.neighbors {
                let key = ordered(*origin, *neighbor);
                if !seen.insert(key) {
                    continue;
                }
                let mutual = nodes
                    .get(neighbor)
                    .is_some_and(|n| n.neighbors.contains(origin));
                edges.push(TopologyEdge {
                    a: key.0,
                    b: key.1,
                    confirmed_by: if mutual { key.0 } else { *origin },
                    is_confirmed: mutual,
                });
            }
        }
        edges.sort_by(|x, y| (x.a, x.b).cmp(&(y.a, y.b)));
        edges
    }

    /// Nodes are the union of `known_nicknames` (from the peer directory) and every
    /// announcement origin.
    pub fn snapshot(&self, known_nicknames: &HashMap<PeerId, String>) -> TopologySnapshot {
        let mut names: HashMap<PeerId, Option<String>> = known_nicknames
            .iter()
            .map(|(id, nick)| (*id, Some(nick.clone())))
            .collect();
        for (id, node) in self.nodes.read().iter() {
            let entry = names.entry(*id).or_insert(None);
            if entry.is_none() {
                *entry = node.nickname.clone();
            }
        }
        let mut nodes: Vec<TopologyNode> = names
            .into_iter()
            .map(|(peer_id, nickname)| TopologyNode { peer_id, nickname })
            .collect();
        nodes.sort_by_key(|n| n.peer_id);
        TopologySnapshot {
            nodes,
            edges: self.edges(),
        }
    }

    /// Shortest path over confirmed edges, at most `max_hops` links long. The route lists
    /// the intermediate hops only; `Some(vec![])` means `to` is a direct neighbour.
    pub fn compute_route(&self, from: PeerId, to: PeerId, max_hops: usize) -> Option<Vec<PeerId>> {
        if from == to {
            return Some(Vec::new());
        }
        let nodes = self.nodes.read();
        let confirmed = |x: &PeerId, y: &PeerId| {
            nodes.get(x).is_some_and(|n| n.neighbors.contains(y))
                && nodes.get(y).is_some_and(|n| n.neighbors.contains(x))
        };

        let mut previous: HashMap<PeerId, PeerId> = HashMap::new();
        let mut queue = VecDeque::from([(from, 0usize)]);
        let mut visited = HashSet::from([from]);
        while let Some((current, depth)) = queue.pop_front() {
            if depth > max_hops {
                break;
            }
            let Some(node) = nodes.get(&current) else {
                continue;
            };
            let mut next: Vec<PeerId> = node
                .neighbors
                .iter()
                .copied()
                .filter(|n| confirmed(&current, n))
                .collect();
            next.sort();
            for neighbor in next {
                if !visited.insert(neighbor) {
                    continue;
                }
                previous.insert(neighbor, current);
                if neighbor == to {
                    let mut path = Vec::new();
                    let mut step = previous.get(&to).copied();
                    while let Some(hop) = step {
                        if hop == from {
                            break;
                        }
                        path.push(hop);
                        step = previous.get(&hop).copied();
                    }
                    path.reverse();
                    return (path.len() < max_hops).then_some(path);
                }
                queue.push_back((neighbor, depth + 1));
            }
        }
        None
    }
}

fn ordered(x: PeerId, y: PeerId) -> (PeerId, PeerId) {
    if x <= y {
        (x, y)
    } else {
        (y, x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> PeerId {
        PeerId::new([n; 8])
    }

    #[test]
    fn older_announcement_is_ignored_even_when_empty() {
        let t = MeshTopology::new();
        assert!(t.update_from_announcement(id(1), Some("a"), Some(&[id(2)]), 100));
        assert!(!t.update_from_announcement(id(1), None, None, 99));
        assert!(!t.update_from_announcement(id(1), None, Some(&[]), 50));
        assert_eq!(t.neighbors_of(id(1)), Some(vec![id(2)]));
        assert_eq!(t.timestamp_of(id(1)), Some(100));
    }

    #[test]
    fn newer_announcement_replaces_with_empty() {
        let t = MeshTopology::new();
        t.update_from_announcement(id(1), None, Some(&[id(2), id(3)]), 100);
        assert!(t.update_from_announcement(id(1), None, None, 101));
        assert_eq!(t.neighbors_of(id(1)), Some(vec![]));
    }

    #[test]
    fn equal_timestamp_replaces() {
        let t = MeshTopology::new();
        t.update_from_announcement(id(1), None, Some(&[id(2)]), 100);
        assert!(t.update_from_announcement(id(1), None, Some(&[id(3)]), 100));
        assert_eq!(t.neighbors_of(id(1)), Some(vec![id(3)]));
    }

    #[test]
    fn edge_confirmed_only_when_mutual() {
        let t = MeshTopology::new();
        t.update_from_announcement(id(2), None, Some(&[id(1)]), 1);
        let edges = t.edges();
        assert_eq!(edges.len(), 1);
        assert!(!edges[0].is_confirmed);
        assert_eq!(edges[0].confirmed_by, id(2));

        t.update_from_announcement(id(1), None, Some(&[id(2)]), 1);
        let edges = t.edges();
        assert_eq!(edges.len(), 1);
        assert!(edges[0].is_confirmed);
        assert_eq!((edges[0].a, edges[0].b), (id(1), id(2)));
    }

    #[test]
    fn removal_cascades_to_asserted_edges() {
        let t = MeshTopology::new();
        t.update_from_announcement(id(1), None, Some(&[id(2)]), 1);
        t.update_from_announcement(id(2), None, Some(&[id(1)]), 1);
        t.update_from_announcement(id(3), None, Some(&[id(1)]), 1);
        assert!(t.remove_peer(id(1), 2));
        let edges = t.edges();
        assert_eq!(edges.len(), 2);
        assert!(edges.iter().all(|e| !e.is_confirmed));
    }

    #[test]
    fn removed_node_stays_removed_against_replays() {
        let t = MeshTopology::new();
        t.update_from_announcement(id(1), Some("a"), Some(&[id(2)]), 100);
        assert!(t.remove_peer(id(1), 150));

        assert!(!t.update_from_announcement(id(1), Some("a"), Some(&[id(2)]), 100));
        assert!(!t.update_from_announcement(id(1), None, None, 150));
        assert_eq!(t.neighbors_of(id(1)), None);

        assert!(t.update_from_announcement(id(1), Some("a"), None, 151));
        assert_eq!(t.timestamp_of(id(1)), Some(151));
        // Removing a node never seen still leaves a tombstone.
        assert!(!t.remove_peer(id(9), 10));
        assert!(!t.update_from_announcement(id(9), None, None, 9));
    }

    #[test]
    fn snapshot_unions_directory_and_origins() {
        let t = MeshTopology::new();
        t.update_from_announcement(id(1), Some("one"), Some(&[id(2)]), 1);
        let known = HashMap::from([(id(4), "four".to_string())]);
        let snap = t.snapshot(&known);
        let ids: Vec<PeerId> = snap.nodes.iter().map(|n| n.peer_id).collect();
        assert_eq!(ids, vec![id(1), id(4)]);
        assert_eq!(snap.nodes[0].nickname.as_deref(), Some("one"));
        assert_eq!(snap.edges.len(), 1);
    }

    #[test]
    fn route_over_confirmed_edges() {
        let t = MeshTopology::new();
        // 1 - 2 - 3 - 4, with 1 -> 4 asserted only by 1.
        t.update_from_announcement(id(1), None, Some(&[id(2), id(4)]), 1);
        t.update_from_announcement(id(2), None, Some(&[id(1), id(3)]), 1);
        t.update_from_announcement(id(3), None, Some(&[id(2), id(4)]), 1);
        t.update_from_announcement(id(4), None, Some(&[id(3)]), 1);
        assert_eq!(t.compute_route(id(1), id(4), 5), Some(vec![id(2), id(3)]));
        assert_eq!(t.compute_route(id(1), id(2), 5), Some(vec![]));
        assert_eq!(t.compute_route(id(1), id(4), 2), None);
        assert_eq!(t.compute_route(id(1), id(9), 5), None);
    }

    #[test]
    fn prune_drops_stale_nodes() {
        let t = MeshTopology::new();
        t.update_from_announcement(id(1), None, None, 10);
        t.update_from_announcement(id(2), None, None, 20);
        assert_eq!(t.prune_older_than(15), 1);
        assert_eq!(t.timestamp_of(id(1)), None);
    }
}
