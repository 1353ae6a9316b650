// Two workers, announced to each other by a scripted coordinator, must
// converge to Connected over both paths within a few peer ticks.

mod common;

use common::Harness;

use treelet_shared::{ConnectTo, Message, OpCode};
use treelet_worker::config::WorkerConfig;
use treelet_worker::peers::PeerState;

fn announce(to: &mut Harness, worker_id: u32, of: &Harness) {
    let connect = ConnectTo {
        worker_id,
        addresses: vec![
            of.worker.endpoint_addr(0).to_string(),
            of.worker.endpoint_addr(1).to_string(),
        ],
    };
    to.send_control(Message::new(
        0,
        OpCode::ConnectTo,
        serde_json::to_vec(&connect).unwrap(),
    ));
}

/// One peer tick for both workers: handshake datagrams out, shuttle,
/// responses out, shuttle again, process.
fn tick(a: &mut Harness, b: &mut Harness) {
    a.worker.handle_peers().unwrap();
    b.worker.handle_peers().unwrap();
    for _ in 0..2 {
        a.flush_udp();
        b.flush_udp();
        a.drain_udp();
        b.drain_udp();
        a.worker.handle_messages().unwrap();
        b.worker.handle_messages().unwrap();
    }
}

#[test]
fn test_two_workers_converge_within_four_ticks() {
    let mut a = Harness::spawn(WorkerConfig::default());
    let mut b = Harness::spawn(WorkerConfig::default());

    a.worker.set_seed(7);
    b.worker.set_seed(11);
    a.assign_id(1);
    b.assign_id(2);

    announce(&mut a, 2, &b);
    announce(&mut b, 1, &a);

    let mut ticks = 0;
    while ticks < 4 {
        tick(&mut a, &mut b);
        ticks += 1;
        let a_done = a.worker.peers().get(2).unwrap().state == PeerState::Connected;
        let b_done = b.worker.peers().get(1).unwrap().state == PeerState::Connected;
        if a_done && b_done {
            break;
        }
    }

    let a_peer = a.worker.peers().get(2).unwrap();
    let b_peer = b.worker.peers().get(1).unwrap();
    assert_eq!(a_peer.state, PeerState::Connected, "a never connected");
    assert_eq!(b_peer.state, PeerState::Connected, "b never connected");
    assert!(ticks <= 4, "took {ticks} ticks");

    // Each side learned the other's session seed along the way.
    assert_eq!(a_peer.seed, 11);
    assert_eq!(b_peer.seed, 7);
    assert!(a_peer.address_connected.iter().all(|c| *c));
    assert!(b_peer.address_connected.iter().all(|c| *c));
}

#[test]
fn test_handshake_from_unknown_peer_is_deferred() {
    let mut a = Harness::spawn(WorkerConfig::default());
    let mut b = Harness::spawn(WorkerConfig::default());

    a.worker.set_seed(7);
    b.worker.set_seed(11);
    a.assign_id(1);
    b.assign_id(2);

    // Clear the coordinator-handshake datagrams queued by the Hey exchange
    // so service-queue assertions below see only peer traffic.
    a.flush_udp();
    b.flush_udp();

    // Only A learns about B; B has never heard of A.
    announce(&mut a, 2, &b);

    a.worker.handle_peers().unwrap();
    a.flush_udp();
    b.drain_udp();
    b.worker.handle_messages().unwrap();

    // B holds the request instead of answering or dropping it.
    assert!(b.worker.queued_message_count() > 0, "request was dropped");
    assert_eq!(b.worker.service_packet_count(), 0, "b answered a stranger");

    // Once the coordinator announces A, the deferred request is answered.
    announce(&mut b, 1, &a);
    b.worker.handle_messages().unwrap();
    assert!(b.worker.service_packet_count() > 0, "deferred request unanswered");
}

#[test]
fn test_stale_seed_response_does_not_connect() {
    let mut a = Harness::spawn(WorkerConfig::default());
    a.worker.set_seed(7);
    a.assign_id(1);

    let stranger = common::RawPeer::bind();
    announce_raw(&mut a, 2, &stranger);

    // A response echoing the wrong seed (a previous run's) is ignored.
    let stale = treelet_shared::ConnectionResponse {
        worker_id: 2,
        my_seed: 999,
        your_seed: 8888,
        address_no: 0,
        treelets: vec![1],
    };
    stranger.send(
        a.worker.endpoint_addr(0),
        &Message::new(2, OpCode::ConnectionResponse, stale.encode()),
    );
    a.drain_udp();
    a.worker.handle_messages().unwrap();

    let peer = a.worker.peers().get(2).unwrap();
    assert_eq!(peer.state, PeerState::Connecting);
    assert!(!peer.address_connected[0]);
    // The seed itself is still recorded for the next request round.
    assert_eq!(peer.seed, 999);
}

fn announce_raw(to: &mut Harness, worker_id: u32, peer: &common::RawPeer) {
    let connect = ConnectTo {
        worker_id,
        addresses: vec![peer.addr().to_string(), peer.addr().to_string()],
    };
    to.send_control(Message::new(
        0,
        OpCode::ConnectTo,
        serde_json::to_vec(&connect).unwrap(),
    ));
}
