// Steady-state action callbacks. Each runs to completion before any other
// action; none of them blocks.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::Instant;

use log::info;

use treelet_shared::{
    luminance, pack_acks, parse_acks, parse_datagram, AckEntry, ConnectionRequest, FinishedRay,
    Message, OpCode, RayState, WireWriter, KEEP_ALIVE_INTERVAL, MAX_RAY_BATCH, PACKET_TIMEOUT,
    RAY_PACKET_HEADER_BYTES, UDP_MTU_BYTES,
};

use crate::config::FinishedRayAction;
use crate::error::WorkerError;
use crate::net::{RayPacket, ServicePacket};
use crate::peers::PeerState;
use crate::poller::{ActionResult, TimerId};
use crate::stats::{DiagnosticsReport, QueueDepths};
use crate::tracelog::{PacketAction, RayAction};
use crate::worker::Worker;

impl Worker {
    /// One read off the coordinator stream; frames go to the message queue
    pub fn handle_coordinator_receive(&mut self) -> Result<ActionResult, WorkerError> {
        let mut buf = [0u8; 4096];
        match self.coordinator.stream.read(&mut buf) {
            Ok(0) => return Err(WorkerError::CoordinatorClosed),
            Ok(len) => {
                self.coordinator.parser.parse(&buf[..len])?;
                while let Some(message) = self.coordinator.parser.pop() {
                    self.message_queue.push_back(message);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => return Err(WorkerError::Coordinator(err)),
        }
        Ok(ActionResult::Continue)
    }

    /// One write of the pending coordinator bytes
    pub fn handle_coordinator_send(&mut self) -> Result<ActionResult, WorkerError> {
        match self.coordinator.stream.write(&self.coordinator.out) {
            Ok(0) => return Err(WorkerError::CoordinatorClosed),
            Ok(written) => {
                self.coordinator.out.drain(..written);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => return Err(WorkerError::Coordinator(err)),
        }
        Ok(ActionResult::Continue)
    }

    /// One datagram off endpoint `iface`. Reliable packets are booked for
    /// acking and de-duplicated; Ack bodies are consumed here; everything
    /// else joins the message queue for `handle_messages`.
    pub fn handle_udp_receive(&mut self, iface: usize) -> Result<ActionResult, WorkerError> {
        let my_id = self.my_id();

        let Some((source, data)) = ({
            let received = self.endpoints[iface].try_recv().map_err(WorkerError::Udp)?;
            received.map(|(addr, bytes)| (addr, bytes.to_vec()))
        }) else {
            return Ok(ActionResult::Continue);
        };

        for message in parse_datagram(&data)? {
            if message.reliable {
                if message.tracked {
                    self.tracelog.log_packet(
                        my_id,
                        message.sender_id,
                        message.seq_no,
                        message.attempt,
                        data.len(),
                        0,
                        PacketAction::Received,
                    );
                }

                let fresh = self.reliability.note_received(
                    source,
                    AckEntry {
                        seq_no: message.seq_no,
                        tracked: message.tracked,
                        attempt: message.attempt,
                    },
                );
                if !fresh {
                    // Duplicate: the ack is owed again, the payload is not.
                    continue;
                }
            }

            if message.opcode == OpCode::Ack {
                for entry in parse_acks(&message.payload)? {
                    self.reliability.note_acked(source, entry.seq_no);
                    if entry.tracked {
                        self.tracelog.log_packet(
                            my_id,
                            message.sender_id,
                            entry.seq_no,
                            entry.attempt,
                            0,
                            0,
                            PacketAction::Acked,
                        );
                    }
                }
                continue;
            }

            self.message_queue.push_back(message);
        }

        Ok(ActionResult::Continue)
    }

    /// One datagram onto endpoint `iface`. Service packets always go
    /// first; ray packets are confined to endpoint 0 so handshake traffic
    /// never queues behind a pacing-limited ray flow.
    pub fn handle_udp_send(&mut self, iface: usize) -> Result<ActionResult, WorkerError> {
        let my_id = self.my_id();

        if let Some(position) = self
            .service_packets
            .iter()
            .position(|packet| packet.iface == iface)
        {
            let packet = self
                .service_packets
                .remove(position)
                .expect("position came from the same queue");
            self.endpoints[iface]
                .send(packet.destination, &packet.data)
                .map_err(WorkerError::Udp)?;
            if packet.is_ack && packet.tracked {
                self.tracelog.log_packet(
                    my_id,
                    packet.destination_id,
                    packet.ack_id,
                    0,
                    packet.data.len(),
                    0,
                    PacketAction::AckSent,
                );
            }
            return Ok(ActionResult::Continue);
        }

        if iface != 0 || self.ray_packets.is_empty() {
            return Ok(ActionResult::Continue);
        }

        let mut packet = self
            .ray_packets
            .pop_front()
            .expect("checked non-empty above");
        let frame = packet.message.encode();
        self.endpoints[0]
            .send(packet.destination, &frame)
            .map_err(WorkerError::Udp)?;

        if packet.retransmission {
            self.stats.rays_resent += packet.ray_count as u64;
        } else {
            self.stats.rays_sent += packet.ray_count as u64;
        }

        let max_depth = self.max_depth();
        for ray in &mut packet.tracked_rays {
            self.tracelog
                .log_ray(my_id, max_depth, ray, RayAction::Sent, packet.destination_id);
            ray.tick += 1;
        }
        // Retained only to log the post-send tick; drop them with the send.
        packet.tracked_rays.clear();

        if packet.tracked() {
            self.tracelog.log_packet(
                my_id,
                packet.destination_id,
                packet.seq_no(),
                packet.attempt(),
                frame.len(),
                packet.ray_count,
                PacketAction::Sent,
            );
        }

        if packet.reliable() {
            self.reliability
                .push_outstanding(Instant::now() + PACKET_TIMEOUT, packet);
        }

        Ok(ActionResult::Continue)
    }

    /// Flush owed acks into MTU-sized Ack messages, then walk the
    /// retransmission ledger and re-queue expired unacked packets.
    pub fn handle_ray_acknowledgements(&mut self) -> Result<ActionResult, WorkerError> {
        self.timer_reset(TimerId::RayAcks);
        let my_id = self.my_id();

        for (source, entries) in self.reliability.take_pending_acks() {
            let destination_id = self.peers.worker_for_address(source).unwrap_or(0);
            for payload in pack_acks(&entries) {
                let ack_id = self.reliability.next_ack_id();
                let tracked = self.tracelog.sample_packet(&mut self.rng);
                let data = Message::new(my_id, OpCode::Ack, payload).encode();
                self.service_packets.push_back(ServicePacket::ack(
                    source,
                    destination_id,
                    data,
                    ack_id,
                    tracked,
                ));
            }
        }

        for packet in self.reliability.collect_due(Instant::now()) {
            self.ray_packets.push_back(packet);
        }

        Ok(ActionResult::Continue)
    }

    /// Trace and shade up to `MAX_RAY_BATCH` rays, then route the results
    /// by the treelet each needs next.
    pub fn handle_ray_queue(&mut self) -> Result<ActionResult, WorkerError> {
        let my_id = self.my_id();
        let Worker {
            scene,
            queues,
            stats,
            tracelog,
            held_treelets,
            peers,
            ..
        } = self;
        let Some(scene) = scene.as_ref() else {
            return Ok(ActionResult::Continue);
        };
        let max_depth = scene.max_depth;

        let mut processed: VecDeque<RayState> = VecDeque::new();

        for _ in 0..MAX_RAY_BATCH {
            let Some(ray) = queues.pop_ray() else {
                break;
            };
            stats.rays_processed += 1;
            let path_id = ray.path_id();
            tracelog.log_ray(my_id, max_depth, &ray, RayAction::Traced, my_id);

            if !ray.to_visit_empty() {
                let mut traced = scene.tracer.trace(ray);
                let hit = traced.hit.is_some();
                let empty_visit = traced.to_visit_empty();

                if traced.is_shadow_ray {
                    if hit || empty_visit {
                        // Occluded shadow rays contribute nothing; an
                        // unobstructed one keeps the light it carries.
                        if hit {
                            traced.ld = [0.0; 3];
                        }
                        tracelog.log_ray(my_id, max_depth, &traced, RayAction::Finished, my_id);
                        queues.push_finished(traced);
                    } else {
                        processed.push_back(traced);
                    }
                } else if !empty_visit || hit {
                    processed.push_back(traced);
                } else {
                    traced.ld = [0.0; 3];
                    tracelog.log_ray(my_id, max_depth, &traced, RayAction::Finished, my_id);
                    queues.push_finished(traced);
                    queues.record_finished_path(path_id);
                    stats.finished_paths += 1;
                }
            } else if ray.hit.is_some() {
                let snapshot = ray.track.then(|| ray.clone());
                let output = scene.shader.shade(ray);

                let spawned = output.rays.len();
                for secondary in output.rays {
                    tracelog.log_ray(my_id, max_depth, &secondary, RayAction::Generated, my_id);
                    processed.push_back(secondary);
                }
                if output.path_completed {
                    queues.record_finished_path(path_id);
                    stats.finished_paths += 1;
                }
                if spawned == 0 {
                    if let Some(finished) = snapshot {
                        tracelog.log_ray(my_id, max_depth, &finished, RayAction::Finished, my_id);
                    }
                }
            } else {
                return Err(WorkerError::InvalidRayState);
            }
        }

        while let Some(ray) = processed.pop_front() {
            let Some(next_treelet) = ray.current_treelet() else {
                return Err(WorkerError::InvalidRayState);
            };
            if held_treelets.contains(&next_treelet) {
                queues.push_ray(ray);
            } else if peers.anyone_holds(next_treelet) {
                queues.push_out(next_treelet, ray);
            } else {
                tracelog.log_ray(my_id, max_depth, &ray, RayAction::Pending, my_id);
                queues.push_pending(next_treelet, ray);
            }
        }

        Ok(ActionResult::Continue)
    }

    /// Serialize each out queue into MTU-bounded packets addressed to a
    /// uniformly chosen holder of the treelet, and queue them for send.
    pub fn handle_out_queue(&mut self) -> Result<ActionResult, WorkerError> {
        self.timer_reset(TimerId::OutQueue);
        let my_id = self.my_id();
        let max_depth = self.max_depth();
        let reliable = self.config.send_reliably;

        for treelet in self.queues.out_treelets() {
            let Some((destination, destination_id)) = self
                .peers
                .choose_holder(treelet, &mut self.rng)
                .map(|peer| (peer.addresses[0], peer.id))
            else {
                continue;
            };

            // A ray popped for a packet it no longer fits in is held over
            // into the next packet for the same destination.
            let mut held_over: Option<(Vec<u8>, Option<RayState>)> = None;

            while self.queues.out_len(treelet) > 0 || held_over.is_some() {
                let mut payload = WireWriter::new();
                let mut packet_len = RAY_PACKET_HEADER_BYTES;
                let mut ray_count = 0usize;
                let mut tracked_rays = Vec::new();

                if let Some((bytes, tracked_ray)) = held_over.take() {
                    packet_len += bytes.len() + 4;
                    payload.put_block(&bytes);
                    ray_count += 1;
                    tracked_rays.extend(tracked_ray);
                }

                while packet_len < UDP_MTU_BYTES {
                    let Some(ray) = self.queues.pop_out(treelet) else {
                        break;
                    };
                    self.tracelog
                        .log_ray(my_id, max_depth, &ray, RayAction::Queued, my_id);

                    let bytes = ray.serialize();
                    let framed_len = bytes.len() + 4;
                    if packet_len + framed_len > UDP_MTU_BYTES {
                        let tracked = ray.track;
                        held_over = Some((bytes, tracked.then_some(ray)));
                        break;
                    }

                    payload.put_block(&bytes);
                    packet_len += framed_len;
                    ray_count += 1;
                    if ray.track {
                        tracked_rays.push(ray);
                    }
                }

                let seq_no = self.reliability.next_seq_no(destination);
                let tracked = self.tracelog.sample_packet(&mut self.rng);
                let message = if reliable {
                    Message::reliable(my_id, OpCode::SendRays, payload.into_bytes(), seq_no, tracked)
                } else {
                    let mut message = Message::new(my_id, OpCode::SendRays, payload.into_bytes());
                    message.seq_no = seq_no;
                    message.tracked = tracked;
                    message
                };

                let packet = RayPacket {
                    destination,
                    destination_id,
                    target_treelet: treelet,
                    ray_count,
                    message,
                    retransmission: false,
                    tracked_rays,
                };
                if packet.tracked() {
                    self.tracelog.log_packet(
                        my_id,
                        destination_id,
                        seq_no,
                        packet.attempt(),
                        packet.wire_len(),
                        ray_count,
                        PacketAction::Queued,
                    );
                }
                self.ray_packets.push_back(packet);
            }
        }

        Ok(ActionResult::Continue)
    }

    /// Drain terminated rays per the configured policy
    pub fn handle_finished_queue(&mut self) -> Result<ActionResult, WorkerError> {
        let my_id = self.my_id();

        match self.config.finished_ray_action {
            FinishedRayAction::Discard => {
                self.queues.clear_finished();
            }
            FinishedRayAction::SendBack => {
                let mut writer = WireWriter::new();
                while let Some(ray) = self.queues.pop_finished() {
                    let mut contribution = ray.contribution();
                    let y = luminance(contribution);
                    if contribution.iter().any(|component| component.is_nan())
                        || y < -1e-5
                        || y.is_infinite()
                    {
                        contribution = [0.0; 3];
                    }

                    FinishedRay {
                        sample_id: ray.sample.id,
                        p_film: ray.sample.p_film,
                        weight: ray.sample.weight,
                        contribution,
                    }
                    .encode_into(&mut writer);
                }
                self.send_to_coordinator(Message::new(
                    my_id,
                    OpCode::FinishedRays,
                    writer.into_bytes(),
                ));
            }
            FinishedRayAction::Upload => {}
        }

        Ok(ActionResult::Continue)
    }

    /// Handshake retries for Connecting peers, keep-alives for Connected
    /// ones. Handshake datagrams jump the service queue.
    pub fn handle_peers(&mut self) -> Result<ActionResult, WorkerError> {
        self.timer_reset(TimerId::Peers);
        let my_id = self.my_id();
        let my_seed = self.my_seed;
        let now = Instant::now();

        let mut handshakes = Vec::new();
        let mut keep_alives = Vec::new();

        for peer in self.peers.iter_mut() {
            match peer.state {
                PeerState::Connecting => {
                    for address_no in 0..2usize {
                        let request = ConnectionRequest {
                            worker_id: my_id,
                            my_seed,
                            your_seed: peer.seed,
                            address_no: address_no as u8,
                        };
                        let data =
                            Message::new(my_id, OpCode::ConnectionRequest, request.encode())
                                .encode();
                        handshakes.push(ServicePacket::new(
                            peer.addresses[address_no],
                            peer.id,
                            data,
                            address_no,
                        ));
                    }
                    peer.tries += 1;
                }
                PeerState::Connected => {
                    if peer.id > 0 && peer.next_keep_alive < now {
                        peer.next_keep_alive += KEEP_ALIVE_INTERVAL;
                        let mut payload = WireWriter::with_capacity(4);
                        payload.put_u32(my_id);
                        let data =
                            Message::new(my_id, OpCode::Ping, payload.into_bytes()).encode();
                        keep_alives.push(ServicePacket::new(peer.addresses[0], peer.id, data, 0));
                    }
                }
            }
        }

        for packet in handshakes {
            self.service_packets.push_front(packet);
        }
        for packet in keep_alives {
            self.service_packets.push_back(packet);
        }

        Ok(ActionResult::Continue)
    }

    /// Process queued messages; ones that cannot be handled yet (a
    /// handshake from a peer the coordinator has not announced) are
    /// returned to the queue.
    pub fn handle_messages(&mut self) -> Result<ActionResult, WorkerError> {
        let mut unprocessed = VecDeque::new();
        while let Some(message) = self.message_queue.pop_front() {
            if !self.process_message(&message)? {
                unprocessed.push_back(message);
            }
        }
        self.message_queue = unprocessed;
        Ok(ActionResult::Continue)
    }

    /// Ask the coordinator for a holder of every treelet that acquired
    /// pending rays since the last pass.
    pub fn handle_needed_treelets(&mut self) -> Result<ActionResult, WorkerError> {
        let my_id = self.my_id();
        let needed: Vec<_> = self.queues.needed_treelets.iter().copied().collect();

        for treelet in needed {
            if self.queues.requested_treelets.contains(&treelet) {
                continue;
            }
            let mut payload = WireWriter::with_capacity(4);
            payload.put_u32(treelet);
            self.send_to_coordinator(Message::new(my_id, OpCode::GetWorker, payload.into_bytes()));
            self.queues.requested_treelets.insert(treelet);
        }

        self.queues.needed_treelets.clear();
        Ok(ActionResult::Continue)
    }

    /// Push accumulated finished path ids upstream
    pub fn handle_finished_paths(&mut self) -> Result<ActionResult, WorkerError> {
        self.timer_reset(TimerId::FinishedPaths);
        let my_id = self.my_id();

        let mut payload = WireWriter::with_capacity(self.queues.finished_path_ids.len() * 8);
        for path_id in self.queues.finished_path_ids.drain(..) {
            payload.put_u64(path_id);
        }
        self.send_to_coordinator(Message::new(
            my_id,
            OpCode::FinishedPaths,
            payload.into_bytes(),
        ));

        Ok(ActionResult::Continue)
    }

    /// Push the periodic stats report and reset the interval counters
    pub fn handle_worker_stats(&mut self) -> Result<ActionResult, WorkerError> {
        self.timer_reset(TimerId::WorkerStats);
        let my_id = self.my_id();

        let report = self.stats.report(QueueDepths {
            ray: self.queues.ray_len(),
            out: self.queues.out_size(),
            pending: self.queues.pending_size(),
            finished: self.queues.finished_len(),
            peers_connecting: self.peers.connecting_count(),
            peers_connected: self.peers.connected_count(),
            outstanding_udp: self.reliability.outstanding_len(),
            queued_udp: self.ray_packets.len(),
        });
        let payload = serde_json::to_vec(&report)?;
        self.send_to_coordinator(Message::new(my_id, OpCode::WorkerStats, payload));
        self.stats.reset();

        Ok(ActionResult::Continue)
    }

    /// Local per-second diagnostics line for endpoint 0
    pub fn handle_diagnostics(&mut self) -> Result<ActionResult, WorkerError> {
        self.timer_reset(TimerId::Diagnostics);

        let report = DiagnosticsReport {
            timestamp_us: self.stats.start_time.elapsed().as_micros() as u64,
            bytes_sent: self.endpoints[0].bytes_sent - self.diagnostics.bytes_sent,
            bytes_received: self.endpoints[0].bytes_received - self.diagnostics.bytes_received,
            queued_ray_packets: self.ray_packets.len(),
        };
        self.diagnostics.bytes_sent = self.endpoints[0].bytes_sent;
        self.diagnostics.bytes_received = self.endpoints[0].bytes_received;

        info!(target: "diag", "{}", serde_json::to_string(&report)?);
        Ok(ActionResult::Continue)
    }
}
