// The registry of remote workers and which treelets they hold.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Instant;

use rand::Rng;

use treelet_shared::{TreeletId, WorkerId, KEEP_ALIVE_INTERVAL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
}

/// A remote worker. Created on coordinator announcement, never destroyed
/// during a job.
pub struct Peer {
    pub id: WorkerId,
    /// The peer advertises two addresses; the handshake probes both paths
    pub addresses: [SocketAddr; 2],
    /// The peer's session seed, learned from its ConnectionResponse
    pub seed: u32,
    pub state: PeerState,
    pub treelets: HashSet<TreeletId>,
    pub next_keep_alive: Instant,
    pub address_connected: [bool; 2],
    pub tries: u32,
}

impl Peer {
    pub fn new(id: WorkerId, addresses: [SocketAddr; 2]) -> Self {
        Self {
            id,
            addresses,
            seed: 0,
            state: PeerState::Connecting,
            treelets: HashSet::new(),
            next_keep_alive: Instant::now() + KEEP_ALIVE_INTERVAL,
            address_connected: [false; 2],
            tries: 0,
        }
    }

    /// Mark one handshake path confirmed; Connected once both are
    pub fn mark_address_connected(&mut self, address_no: usize) {
        self.address_connected[address_no] = true;
        if self.address_connected.iter().all(|connected| *connected) {
            self.state = PeerState::Connected;
            self.next_keep_alive = Instant::now() + KEEP_ALIVE_INTERVAL;
        }
    }
}

/// Peer map plus the two indices the dispatch paths need: address → worker
/// for inbound bookkeeping, treelet → holders for outbound routing.
#[derive(Default)]
pub struct Peers {
    peers: HashMap<WorkerId, Peer>,
    address_to_worker: HashMap<SocketAddr, WorkerId>,
    treelet_to_worker: HashMap<TreeletId, Vec<WorkerId>>,
}

impl Peers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly announced peer; re-announcements are ignored
    pub fn add(&mut self, id: WorkerId, addresses: [SocketAddr; 2]) -> bool {
        if self.peers.contains_key(&id) {
            return false;
        }
        for address in addresses {
            self.address_to_worker.insert(address, id);
        }
        self.peers.insert(id, Peer::new(id, addresses));
        true
    }

    pub fn contains(&self, id: WorkerId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn get(&self, id: WorkerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: WorkerId) -> Option<&mut Peer> {
        self.peers.get_mut(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.values_mut()
    }

    pub fn worker_for_address(&self, address: SocketAddr) -> Option<WorkerId> {
        self.address_to_worker.get(&address).copied()
    }

    /// Record that `id` holds `treelet`
    pub fn add_treelet_holder(&mut self, treelet: TreeletId, id: WorkerId) {
        self.treelet_to_worker.entry(treelet).or_default().push(id);
    }

    pub fn anyone_holds(&self, treelet: TreeletId) -> bool {
        self.treelet_to_worker
            .get(&treelet)
            .is_some_and(|holders| !holders.is_empty())
    }

    /// Pick a holder of `treelet` uniformly at random
    pub fn choose_holder<R: Rng>(&self, treelet: TreeletId, rng: &mut R) -> Option<&Peer> {
        let holders = self.treelet_to_worker.get(&treelet)?;
        if holders.is_empty() {
            return None;
        }
        let id = holders[rng.gen_range(0..holders.len())];
        self.peers.get(&id)
    }

    pub fn connecting_count(&self) -> usize {
        self.peers
            .values()
            .filter(|peer| peer.state == PeerState::Connecting)
            .count()
    }

    pub fn connected_count(&self) -> usize {
        self.peers.len() - self.connecting_count()
    }
}

#[cfg(test)]
mod peers_tests {
    use super::{PeerState, Peers};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::net::SocketAddr;

    fn addrs(base: u16) -> [SocketAddr; 2] {
        [
            format!("10.0.0.1:{base}").parse().unwrap(),
            format!("10.0.0.2:{base}").parse().unwrap(),
        ]
    }

    #[test]
    fn add_indexes_both_addresses() {
        let mut peers = Peers::new();
        assert!(peers.add(4, addrs(7000)));
        assert!(!peers.add(4, addrs(7001)));

        let [a, b] = addrs(7000);
        assert_eq!(peers.worker_for_address(a), Some(4));
        assert_eq!(peers.worker_for_address(b), Some(4));
    }

    #[test]
    fn connected_only_after_both_paths() {
        let mut peers = Peers::new();
        peers.add(4, addrs(7000));

        let peer = peers.get_mut(4).unwrap();
        peer.mark_address_connected(0);
        assert_eq!(peer.state, PeerState::Connecting);
        peer.mark_address_connected(1);
        assert_eq!(peer.state, PeerState::Connected);
    }

    #[test]
    fn holder_choice_is_among_candidates() {
        let mut peers = Peers::new();
        peers.add(1, addrs(7000));
        peers.add(2, addrs(7100));
        peers.add_treelet_holder(9, 1);
        peers.add_treelet_holder(9, 2);

        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..32 {
            let holder = peers.choose_holder(9, &mut rng).unwrap();
            assert!(holder.id == 1 || holder.id == 2);
        }
        assert!(peers.choose_holder(10, &mut rng).is_none());
    }

    #[test]
    fn connection_counts_split_by_state() {
        let mut peers = Peers::new();
        peers.add(1, addrs(7000));
        peers.add(2, addrs(7100));
        peers.get_mut(1).unwrap().mark_address_connected(0);
        peers.get_mut(1).unwrap().mark_address_connected(1);

        assert_eq!(peers.connected_count(), 1);
        assert_eq!(peers.connecting_count(), 1);
    }
}
