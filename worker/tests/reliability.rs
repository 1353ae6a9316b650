// MTU packing, retransmission, and duplicate suppression, driven over
// real loopback sockets against a scripted remote endpoint.

mod common;

use std::time::Duration;

use common::{test_ray, Harness, RawPeer};

use treelet_shared::{
    pack_acks, AckEntry, ConnectTo, Message, OpCode, RayState, WireWriter, PACKET_TIMEOUT,
    RAY_PACKET_HEADER_BYTES, UDP_MTU_BYTES,
};
use treelet_worker::config::WorkerConfig;

/// Announce a raw socket as worker `id` holding `treelet`, already past
/// the handshake.
fn install_peer(harness: &mut Harness, id: u32, peer: &RawPeer, treelet: u32) {
    let connect = ConnectTo {
        worker_id: id,
        addresses: vec![peer.addr().to_string(), peer.addr().to_string()],
    };
    harness.send_control(Message::new(
        0,
        OpCode::ConnectTo,
        serde_json::to_vec(&connect).unwrap(),
    ));

    let peers = harness.worker.peers_mut();
    let entry = peers.get_mut(id).unwrap();
    entry.mark_address_connected(0);
    entry.mark_address_connected(1);
    peers.add_treelet_holder(treelet, id);
}

// ============================================================================
// Packed ray forwarding
// ============================================================================

#[test]
fn test_out_queue_packs_to_mtu() {
    let mut harness = Harness::spawn(WorkerConfig::default());
    harness.assign_id(1);
    harness.flush_udp();

    let remote = RawPeer::bind();
    install_peer(&mut harness, 2, &remote, 5);

    let ray_bytes = test_ray(0, 5).serialize().len();
    let per_packet = (UDP_MTU_BYTES - RAY_PACKET_HEADER_BYTES) / (ray_bytes + 4);
    let expected_packets = 100usize.div_ceil(per_packet);

    for id in 0..100 {
        harness.worker.queues_mut().push_out(5, test_ray(id, 5));
    }
    assert_eq!(harness.worker.queues().out_size(), 100);

    harness.worker.handle_out_queue().unwrap();

    let packets = harness.worker.ray_packets();
    assert_eq!(packets.len(), expected_packets);
    assert_eq!(
        packets.iter().map(|p| p.ray_count).sum::<usize>(),
        100,
        "every ray is in exactly one packet"
    );
    for (index, packet) in packets.iter().enumerate() {
        assert!(packet.wire_len() <= UDP_MTU_BYTES);
        assert_eq!(packet.seq_no(), index as u64, "sequence numbers ascend");
        assert_eq!(packet.target_treelet, 5);
        assert_eq!(packet.destination_id, 2);
    }
    // The flush emptied the out queue.
    assert_eq!(harness.worker.queues().out_size(), 0);
}

// ============================================================================
// Retransmission
// ============================================================================

#[test]
fn test_unacked_packet_is_retransmitted_then_resolved() {
    let config = WorkerConfig {
        send_reliably: true,
        ..WorkerConfig::default()
    };
    let mut harness = Harness::spawn(config);
    harness.assign_id(1);
    harness.flush_udp();

    let remote = RawPeer::bind();
    install_peer(&mut harness, 2, &remote, 5);

    harness.worker.queues_mut().push_out(5, test_ray(7, 5));
    harness.worker.handle_out_queue().unwrap();
    assert_eq!(harness.worker.ray_packet_count(), 1);

    // First attempt goes on the wire and into the retransmission ledger.
    harness.flush_udp();
    assert_eq!(harness.worker.outstanding_packet_count(), 1);

    let first = remote.recv().expect("first attempt delivered");
    assert_eq!(first.len(), 1);
    assert!(first[0].reliable);
    assert_eq!(first[0].attempt, 1);
    let seq_no = first[0].seq_no;

    // The remote never acks; after the timeout the packet comes back with
    // a bumped attempt and the retransmission flag.
    std::thread::sleep(PACKET_TIMEOUT + Duration::from_millis(20));
    harness.worker.handle_ray_acknowledgements().unwrap();
    assert_eq!(harness.worker.ray_packet_count(), 1);
    assert_eq!(harness.worker.outstanding_packet_count(), 0);
    {
        let packet = harness.worker.ray_packets().front().unwrap();
        assert_eq!(packet.seq_no(), seq_no, "retransmission reuses the seq");
        assert_eq!(packet.attempt(), 2);
        assert!(packet.retransmission);
    }

    harness.flush_udp();
    let second = remote.recv().expect("second attempt delivered");
    assert_eq!(second[0].seq_no, seq_no);
    assert_eq!(second[0].attempt, 2);

    // Now the remote acks; the next ledger walk drops the entry.
    let ack_payload = pack_acks(&[AckEntry {
        seq_no,
        tracked: false,
        attempt: 2,
    }])
    .remove(0);
    remote.send(
        harness.worker.endpoint_addr(0),
        &Message::new(2, OpCode::Ack, ack_payload),
    );
    harness.drain_udp();

    std::thread::sleep(PACKET_TIMEOUT + Duration::from_millis(20));
    harness.worker.handle_ray_acknowledgements().unwrap();
    assert_eq!(harness.worker.outstanding_packet_count(), 0);
    assert_eq!(harness.worker.ray_packet_count(), 0);
}

// ============================================================================
// Duplicate suppression
// ============================================================================

#[test]
fn test_duplicate_reliable_packet_is_acked_but_delivered_once() {
    let mut harness = Harness::spawn(WorkerConfig::default());
    harness.assign_id(1);
    harness.flush_udp();

    let remote = RawPeer::bind();

    // Build a reliable SendRays datagram carrying two rays.
    let mut payload = WireWriter::new();
    for id in 0..2u64 {
        payload.put_block(&test_ray(id, 3).serialize());
    }
    let message = Message::reliable(2, OpCode::SendRays, payload.into_bytes(), 17, false);

    let target = harness.worker.endpoint_addr(0);
    remote.send(target, &message);
    remote.send(target, &message);
    harness.drain_udp();
    harness.worker.handle_messages().unwrap();

    // Only one copy of the rays reached the ray queue.
    assert_eq!(harness.worker.queues().ray_len(), 2);

    // Both deliveries are acked.
    harness.worker.handle_ray_acknowledgements().unwrap();
    harness.flush_udp();
    let acks = remote.recv().expect("ack datagram");
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].opcode, OpCode::Ack);
    let entries = treelet_shared::parse_acks(&acks[0].payload).unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|entry| entry.seq_no == 17));
}

// ============================================================================
// Received rays
// ============================================================================

#[test]
fn test_received_rays_reset_tick_and_count_a_hop() {
    let mut harness = Harness::spawn(WorkerConfig::default());
    harness.assign_id(1);

    let remote = RawPeer::bind();
    let mut ray = test_ray(4, 3);
    ray.hop = 2;
    ray.tick = 9;

    let mut payload = WireWriter::new();
    payload.put_block(&ray.serialize());
    remote.send(
        harness.worker.endpoint_addr(0),
        &Message::new(2, OpCode::SendRays, payload.into_bytes()),
    );
    harness.drain_udp();
    harness.worker.handle_messages().unwrap();

    assert_eq!(harness.worker.queues().ray_len(), 1);
    let received: Vec<RayState> = {
        let queues = harness.worker.queues_mut();
        std::iter::from_fn(|| queues.pop_ray()).collect()
    };
    assert_eq!(received[0].hop, 3);
    assert_eq!(received[0].tick, 0);
}
