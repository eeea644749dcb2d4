//! The LSP database: latest accepted link-state packet per originator, an
//! expiration heap driving a single retirement timer, and the Dijkstra
//! routing table rebuilt on every accepted change.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use prism_types::message::{MsgType, PrismMessage};
use prism_types::state::StateStore;

struct DbInner {
    database: HashMap<Vec<u8>, PrismMessage>,
    /// `(expiration micros, originator)` min-heap.
    expirations: BinaryHeap<Reverse<(u64, Vec<u8>)>>,
    routing_table: HashMap<String, String>,
    previous_nodes: HashSet<String>,
    previous_edges: HashSet<(String, String)>,
    previously_reachable: HashSet<String>,
}

/// The shared LSP database of one routing instance.
pub struct LsDatabase {
    /// Our own pseudonym (the Dijkstra source).
    pub pseudonym: Vec<u8>,
    hops_max: u64,
    state_store: StateStore,
    inner: Mutex<DbInner>,
    heap_changed: Notify,
    /// Fired when a reachability change should cut the NARK cooldown short.
    pub nark_trigger: Notify,
    nark_allow_cancel: bool,
}

impl LsDatabase {
    /// An empty database for `pseudonym`, reloading any persisted entries.
    pub fn new(
        pseudonym: Vec<u8>,
        hops_max: u64,
        state_store: StateStore,
        nark_allow_cancel: bool,
    ) -> Arc<Self> {
        let db = Arc::new(Self {
            pseudonym,
            hops_max,
            state_store,
            inner: Mutex::new(DbInner {
                database: HashMap::new(),
                expirations: BinaryHeap::new(),
                routing_table: HashMap::new(),
                previous_nodes: HashSet::new(),
                previous_edges: HashSet::new(),
                previously_reachable: HashSet::new(),
            }),
            heap_changed: Notify::new(),
            nark_trigger: Notify::new(),
            nark_allow_cancel,
        });
        db.load_saved();
        db
    }

    fn load_saved(&self) {
        let Some(state) = self.state_store.load_state("lsp") else {
            return;
        };
        let Some(entries) = state.get("database").and_then(|d| d.as_array()) else {
            return;
        };
        let mut inner = self.inner.lock();
        for entry in entries {
            let Some(b64) = entry.as_str() else { continue };
            match PrismMessage::from_b64(b64) {
                Ok(lsp) => {
                    if let Some(originator) = lsp.originator.clone() {
                        inner.database.insert(originator, lsp);
                    }
                }
                Err(err) => tracing::warn!("failed to decode saved LSP entry: {err}"),
            }
        }
        tracing::debug!("loaded {} saved LSP entries", inner.database.len());
    }

    fn save(&self, inner: &DbInner) {
        let entries: Vec<String> = inner.database.values().map(PrismMessage::to_b64).collect();
        self.state_store
            .save_state("lsp", &json!({ "database": entries }));
    }

    /// Accept `lsp` if it is (a) unknown, (b) strictly newer, or (c) equal
    /// timestamp and neighbors but a strictly smaller hop count where the
    /// stored copy had maxed out. Returns whether it was accepted and any
    /// ARK embedded in a newly accepted LSP.
    pub fn update_if(&self, lsp: PrismMessage) -> (bool, Vec<PrismMessage>) {
        debug_assert_eq!(lsp.msg_type, MsgType::Lsp);
        let Some(originator) = lsp.originator.clone() else {
            return (false, Vec::new());
        };
        let mut inner = self.inner.lock();
        let accept = match inner.database.get(&originator) {
            None => true,
            Some(existing) => {
                let existing_ts = existing.micro_timestamp.unwrap_or(0);
                let new_ts = lsp.micro_timestamp.unwrap_or(0);
                let same_neighbors = neighbor_set(existing) == neighbor_set(&lsp);
                existing_ts < new_ts
                    || (existing_ts == new_ts
                        && same_neighbors
                        && existing.hop_count.unwrap_or(0) as u64 == self.hops_max
                        && (lsp.hop_count.unwrap_or(0) as u64) < self.hops_max)
            }
        };
        if !accept {
            return (false, Vec::new());
        }

        let new_arks = lsp
            .sub_msg
            .as_deref()
            .filter(|sub| sub.msg_type == MsgType::AnnounceRoleKey)
            .map(|sub| vec![sub.clone()])
            .unwrap_or_default();

        let expiry_micros =
            lsp.micro_timestamp.unwrap_or(0) + lsp.ttl.unwrap_or(0) * 1_000_000;
        inner.database.insert(originator.clone(), lsp);
        inner
            .expirations
            .push(Reverse((expiry_micros, originator)));
        self.save(&inner);
        drop(inner);
        self.heap_changed.notify_one();
        (true, new_arks)
    }

    /// The stored LSP for an originator.
    pub fn lookup(&self, originator: &[u8]) -> Option<PrismMessage> {
        self.inner.lock().database.get(originator).cloned()
    }

    /// Remove an originator's LSP (neighbor death or expiry).
    pub fn remove(&self, originator: &[u8]) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.database.remove(originator).is_some();
        if removed {
            self.save(&inner);
        }
        removed
    }

    /// Next hop towards a destination (hex pseudonyms).
    pub fn next_hop(&self, destination: &str) -> Option<String> {
        self.inner.lock().routing_table.get(destination).cloned()
    }

    /// All destinations with a routing entry.
    pub fn reachable_destinations(&self) -> HashSet<String> {
        self.inner.lock().routing_table.keys().cloned().collect()
    }

    /// Size of the routing table.
    pub fn routing_table_len(&self) -> usize {
        self.inner.lock().routing_table.len()
    }

    /// Rebuild the routing table: an undirected graph whose edge weight is
    /// the max of the two directional costs, shortest paths from our own
    /// pseudonym, `table[dst] = path[1]`. Emits structural diff logs and
    /// returns `(table, reachability_changed)`.
    pub fn update_routing_table(&self) -> (HashMap<String, String>, bool) {
        let mut inner = self.inner.lock();

        let mut directional: HashMap<(String, String), u64> = HashMap::new();
        for (source, lsp) in &inner.database {
            for neighbor in lsp.neighbors.as_deref().unwrap_or_default() {
                directional.insert(
                    (hex::encode(source), hex::encode(&neighbor.pseudonym)),
                    neighbor.cost,
                );
            }
        }
        let mut graph: HashMap<String, Vec<(String, u64)>> = HashMap::new();
        let mut edges: HashSet<(String, String)> = HashSet::new();
        for ((src, dst), cost) in &directional {
            if let Some(back) = directional.get(&(dst.clone(), src.clone())) {
                let weight = (*cost).max(*back);
                let edge = canonical_edge(src, dst);
                if edges.insert(edge) {
                    graph.entry(src.clone()).or_default().push((dst.clone(), weight));
                    graph.entry(dst.clone()).or_default().push((src.clone(), weight));
                }
            }
        }

        let current_nodes: HashSet<String> = graph.keys().cloned().collect();
        for node in current_nodes.difference(&inner.previous_nodes) {
            tracing::info!("new node in LS routing graph: {}", &node[..6.min(node.len())]);
        }
        for node in inner.previous_nodes.difference(&current_nodes) {
            tracing::info!("dead node in LS routing graph: {}", &node[..6.min(node.len())]);
        }
        for edge in edges.difference(&inner.previous_edges) {
            tracing::debug!("new edge in LS routing graph: {:?}", edge);
        }
        for edge in inner.previous_edges.difference(&edges) {
            tracing::debug!("dead edge in LS routing graph: {:?}", edge);
        }
        inner.previous_nodes = current_nodes;
        inner.previous_edges = edges;

        let source = hex::encode(&self.pseudonym);
        inner.routing_table = if graph.contains_key(&source) {
            dijkstra_next_hops(&graph, &source)
        } else {
            tracing::warn!("own LSP not in database yet; routing table stays empty");
            HashMap::new()
        };

        let currently_reachable: HashSet<String> =
            inner.routing_table.keys().cloned().collect();
        let newly = currently_reachable
            .difference(&inner.previously_reachable)
            .count();
        let lost = inner
            .previously_reachable
            .difference(&currently_reachable)
            .count();
        let has_changed = newly > 0 || lost > 0;
        if newly > 0 {
            tracing::info!("{newly} newly reachable nodes in LS routing graph");
        }
        if lost > 0 {
            tracing::info!("{lost} no longer reachable nodes in LS routing graph");
        }
        inner.previously_reachable = currently_reachable;

        let table = inner.routing_table.clone();
        drop(inner);
        if has_changed && self.nark_allow_cancel {
            self.nark_trigger.notify_one();
        }
        (table, has_changed)
    }

    /// The earliest live deadline, discarding heap entries that no longer
    /// describe the stored LSP (it was refreshed or removed).
    fn next_deadline(&self) -> Option<(u64, Vec<u8>)> {
        let mut inner = self.inner.lock();
        loop {
            let head = inner
                .expirations
                .peek()
                .map(|Reverse((micros, originator))| (*micros, originator.clone()));
            let Some((micros, originator)) = head else {
                return None;
            };
            let current = inner.database.get(&originator).map(|lsp| {
                lsp.micro_timestamp.unwrap_or(0) + lsp.ttl.unwrap_or(0) * 1_000_000
            });
            if current == Some(micros) {
                return Some((micros, originator));
            }
            inner.expirations.pop();
        }
    }

    /// Retire expired entries as their deadlines pass; recompute routing
    /// after each removal. One timer serves the whole heap.
    pub async fn expiry_task(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let now_micros = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_micros() as u64;
            match self.next_deadline() {
                Some((deadline, originator)) if deadline <= now_micros => {
                    tracing::warn!(
                        "LSP for originator {} expired - removing",
                        hex::encode(&originator[..6.min(originator.len())])
                    );
                    self.inner.lock().expirations.pop();
                    self.remove(&originator);
                    self.update_routing_table();
                }
                Some((deadline, _)) => {
                    let wait = Duration::from_micros(deadline - now_micros);
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.heap_changed.notified() => {}
                        _ = cancel.cancelled() => return,
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.heap_changed.notified() => {}
                        _ = cancel.cancelled() => return,
                    }
                }
            }
        }
    }
}

fn neighbor_set(lsp: &PrismMessage) -> HashSet<Vec<u8>> {
    lsp.neighbors
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|n| n.pseudonym.clone())
        .collect()
}

fn canonical_edge(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_owned(), b.to_owned())
    } else {
        (b.to_owned(), a.to_owned())
    }
}

/// Single-source shortest paths; returns `destination → first hop`.
fn dijkstra_next_hops(
    graph: &HashMap<String, Vec<(String, u64)>>,
    source: &str,
) -> HashMap<String, String> {
    let mut dist: HashMap<String, u64> = HashMap::new();
    let mut first_hop: HashMap<String, String> = HashMap::new();
    let mut heap: BinaryHeap<Reverse<(u64, String)>> = BinaryHeap::new();

    dist.insert(source.to_owned(), 0);
    heap.push(Reverse((0, source.to_owned())));

    while let Some(Reverse((cost, node))) = heap.pop() {
        if dist.get(&node).is_some_and(|best| *best < cost) {
            continue;
        }
        let Some(edges) = graph.get(&node) else { continue };
        for (next, weight) in edges {
            let candidate = cost + weight;
            if dist.get(next).is_none_or(|best| candidate < *best) {
                dist.insert(next.clone(), candidate);
                let hop = if node == source {
                    next.clone()
                } else {
                    first_hop
                        .get(&node)
                        .cloned()
                        .unwrap_or_else(|| next.clone())
                };
                first_hop.insert(next.clone(), hop);
                heap.push(Reverse((candidate, next.clone())));
            }
        }
    }

    first_hop.remove(source);
    first_hop
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_types::message::NeighborInfo;

    fn lsp(originator: &[u8], neighbors: &[&[u8]], micros: u64, hops: i64) -> PrismMessage {
        PrismMessage {
            originator: Some(originator.to_vec()),
            sender: Some(originator.to_vec()),
            micro_timestamp: Some(micros),
            ttl: Some(600),
            hop_count: Some(hops),
            neighbors: Some(
                neighbors
                    .iter()
                    .map(|n| NeighborInfo {
                        pseudonym: n.to_vec(),
                        cost: 1,
                    })
                    .collect(),
            ),
            ..PrismMessage::new(MsgType::Lsp)
        }
    }

    fn now_micros() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_micros() as u64
    }

    fn db(own: &[u8]) -> Arc<LsDatabase> {
        LsDatabase::new(own.to_vec(), 16, StateStore::ephemeral(), false)
    }

    #[test]
    fn stale_timestamps_are_rejected() {
        let db = db(b"self");
        let t = now_micros();
        assert!(db.update_if(lsp(b"other", &[b"self"], t, 1)).0);
        assert!(!db.update_if(lsp(b"other", &[b"self"], t - 1, 1)).0);
        assert!(db.update_if(lsp(b"other", &[b"self"], t + 1, 1)).0);
    }

    #[test]
    fn equal_timestamp_needs_maxed_hop_count_to_replace() {
        let db = db(b"self");
        let t = now_micros();
        assert!(db.update_if(lsp(b"other", &[b"self"], t, 16)).0);
        // Same timestamp, same neighbors, smaller hop count: accepted.
        assert!(db.update_if(lsp(b"other", &[b"self"], t, 3)).0);
        // Stored copy no longer has a maxed hop count.
        assert!(!db.update_if(lsp(b"other", &[b"self"], t, 2)).0);
    }

    #[test]
    fn routing_table_finds_shortest_next_hops() {
        // self -- a -- b, and an expensive direct self -- b edge.
        let db = db(b"self");
        let t = now_micros();
        let expensive = |from: &[u8], to_cheap: &[u8], to_dear: &[u8]| PrismMessage {
            neighbors: Some(vec![
                NeighborInfo {
                    pseudonym: to_cheap.to_vec(),
                    cost: 1,
                },
                NeighborInfo {
                    pseudonym: to_dear.to_vec(),
                    cost: 10,
                },
            ]),
            ..lsp(from, &[], t, 1)
        };
        db.update_if(expensive(b"self", b"a", b"b"));
        db.update_if(lsp(b"a", &[b"self", b"b"], t, 1));
        db.update_if(expensive(b"b", b"a", b"self"));

        let (table, changed) = db.update_routing_table();
        assert!(changed);
        assert_eq!(table.get(&hex::encode(b"a")), Some(&hex::encode(b"a")));
        // Going via a (cost 2) beats the direct edge (cost 10).
        assert_eq!(table.get(&hex::encode(b"b")), Some(&hex::encode(b"a")));
    }

    #[test]
    fn embedded_arks_surface_on_acceptance() {
        let db = db(b"self");
        let ark = PrismMessage {
            pseudonym: Some(b"other".to_vec()),
            ..PrismMessage::new(MsgType::AnnounceRoleKey)
        };
        let mut packet = lsp(b"other", &[b"self"], now_micros(), 1);
        packet.sub_msg = Some(Box::new(ark));
        let (accepted, arks) = db.update_if(packet);
        assert!(accepted);
        assert_eq!(arks.len(), 1);
    }
}
