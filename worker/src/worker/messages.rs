// Dispatch of parsed messages: coordinator job control, the two-path
// handshake, and inbound ray batches.

use log::{info, warn};

use treelet_shared::{
    ConnectTo, ConnectionRequest, ConnectionResponse, GenerateRays, GetObjects, HeyReply, Message,
    MultipleConnect, ObjectKey, OpCode, RayState, SampleInfo, StartBenchmark, WireReader,
    WorkerId,
};

use crate::error::WorkerError;
use crate::net::ServicePacket;
use crate::peers::PeerState;
use crate::scene::sample_id_for;
use crate::tracelog::RayAction;
use crate::worker::Worker;

impl Worker {
    /// Handle one message. Returns Ok(false) when the message cannot be
    /// processed yet and must be re-queued (a handshake from a peer the
    /// coordinator has not announced).
    pub fn process_message(&mut self, message: &Message) -> Result<bool, WorkerError> {
        match message.opcode {
            OpCode::Hey => {
                let reply: HeyReply = serde_json::from_slice(&message.payload)?;
                info!("assigned worker-id={} job-id={}", reply.worker_id, reply.job_id);
                self.worker_id = Some(reply.worker_id);
                self.job_id = Some(reply.job_id);

                // The coordinator is peer 0; handshake against it over
                // both paths right away.
                self.peers.add(0, [self.coordinator_addr; 2]);
                self.enqueue_connection_requests(0);
                Ok(true)
            }

            OpCode::Ping | OpCode::Pong => Ok(true),

            OpCode::GetObjects => {
                let request: GetObjects = serde_json::from_slice(&message.payload)?;
                self.get_objects(&request)?;
                Ok(true)
            }

            OpCode::GenerateRays => {
                let request: GenerateRays = serde_json::from_slice(&message.payload)?;
                self.generate_rays(&request)?;
                Ok(true)
            }

            OpCode::ConnectTo => {
                let connect: ConnectTo = serde_json::from_slice(&message.payload)?;
                self.add_peer(&connect)?;
                Ok(true)
            }

            OpCode::MultipleConnect => {
                let batch: MultipleConnect = serde_json::from_slice(&message.payload)?;
                for connect in &batch.workers {
                    self.add_peer(connect)?;
                }
                Ok(true)
            }

            OpCode::ConnectionRequest => {
                let request = ConnectionRequest::decode(&message.payload)?;
                self.handle_connection_request(&request)
            }

            OpCode::ConnectionResponse => {
                let response = ConnectionResponse::decode(&message.payload)?;
                self.handle_connection_response(&response)?;
                Ok(true)
            }

            OpCode::SendRays => {
                self.receive_rays(message)?;
                Ok(true)
            }

            OpCode::Bye => {
                info!("coordinator said goodbye");
                self.terminated = true;
                Ok(true)
            }

            OpCode::StartBenchmark => {
                let request = StartBenchmark::decode(&message.payload)?;
                self.init_benchmark(&request)?;
                Ok(true)
            }

            opcode => Err(WorkerError::UnexpectedOpcode {
                opcode: opcode.to_u16(),
            }),
        }
    }

    /// Register a coordinator-announced peer. One advertised address is
    /// tolerated by doubling it; zero is a protocol error.
    fn add_peer(&mut self, connect: &ConnectTo) -> Result<(), WorkerError> {
        if connect.worker_id == self.my_id() || self.peers.contains(connect.worker_id) {
            return Ok(());
        }

        let mut parsed = Vec::with_capacity(2);
        for address in connect.addresses.iter().take(2) {
            parsed.push(address.parse().map_err(|_| {
                WorkerError::InvalidPeerAddress {
                    address: address.clone(),
                }
            })?);
        }
        let addresses = match parsed.len() {
            0 => {
                return Err(WorkerError::InvalidPeerAddress {
                    address: String::new(),
                })
            }
            1 => [parsed[0], parsed[0]],
            _ => [parsed[0], parsed[1]],
        };

        self.peers.add(connect.worker_id, addresses);
        Ok(())
    }

    /// Queue one ConnectionRequest per path to the given peer, ahead of
    /// all other service traffic.
    pub(crate) fn enqueue_connection_requests(&mut self, peer_id: WorkerId) {
        let my_id = self.my_id();
        let my_seed = self.my_seed;
        let Some(peer) = self.peers.get(peer_id) else {
            return;
        };

        for address_no in 0..2usize {
            let request = ConnectionRequest {
                worker_id: my_id,
                my_seed,
                your_seed: peer.seed,
                address_no: address_no as u8,
            };
            let data = Message::new(my_id, OpCode::ConnectionRequest, request.encode()).encode();
            self.service_packets.push_front(ServicePacket::new(
                peer.addresses[address_no],
                peer.id,
                data,
                address_no,
            ));
        }
    }

    fn handle_connection_request(
        &mut self,
        request: &ConnectionRequest,
    ) -> Result<bool, WorkerError> {
        if request.address_no > 1 {
            warn!(
                "connection request from {} with bad address number {}",
                request.worker_id, request.address_no
            );
            return Ok(true);
        }
        if !self.peers.contains(request.worker_id) {
            // The coordinator has not announced this peer yet; try again
            // on a later pass.
            return Ok(false);
        }

        let my_id = self.my_id();
        let my_seed = self.my_seed;
        let address_no = request.address_no as usize;
        let mut treelets: Vec<_> = self.held_treelets.iter().copied().collect();
        treelets.sort_unstable();

        let peer = self
            .peers
            .get(request.worker_id)
            .expect("checked contains above");
        let response = ConnectionResponse {
            worker_id: my_id,
            my_seed,
            your_seed: peer.seed,
            address_no: request.address_no,
            treelets,
        };
        let data = Message::new(my_id, OpCode::ConnectionResponse, response.encode()).encode();
        let packet =
            ServicePacket::new(peer.addresses[address_no], peer.id, data, address_no);
        self.service_packets.push_front(packet);
        Ok(true)
    }

    fn handle_connection_response(
        &mut self,
        response: &ConnectionResponse,
    ) -> Result<(), WorkerError> {
        if response.address_no > 1 {
            warn!(
                "connection response from {} with bad address number {}",
                response.worker_id, response.address_no
            );
            return Ok(());
        }

        let my_seed = self.my_seed;
        let Some(peer) = self.peers.get_mut(response.worker_id) else {
            return Ok(());
        };
        peer.seed = response.my_seed;

        if peer.state == PeerState::Connected {
            return Ok(());
        }
        if response.your_seed != my_seed {
            // A stale response from a previous run; the seeds will line up
            // once the peer has heard our requests.
            self.stats.stale_responses += 1;
            return Ok(());
        }

        peer.mark_address_connected(response.address_no as usize);
        if peer.state != PeerState::Connected {
            return Ok(());
        }

        info!("connected to worker {}", response.worker_id);

        for &treelet in &response.treelets {
            if let Some(peer) = self.peers.get_mut(response.worker_id) {
                peer.treelets.insert(treelet);
            }
            self.peers.add_treelet_holder(treelet, response.worker_id);
            self.queues.needed_treelets.remove(&treelet);
            self.queues.requested_treelets.remove(&treelet);
            self.queues.drain_pending_into_out(treelet);
        }
        Ok(())
    }

    /// Unpack a SendRays payload into the local ray queue
    fn receive_rays(&mut self, message: &Message) -> Result<(), WorkerError> {
        let my_id = self.my_id();
        let max_depth = self.max_depth();

        let mut reader = WireReader::new(&message.payload);
        while !reader.is_empty() {
            let mut ray = RayState::deserialize(reader.block()?)?;
            ray.hop += 1;
            ray.tick = 0;
            self.stats.rays_received += 1;
            self.tracelog
                .log_ray(my_id, max_depth, &ray, RayAction::Received, message.sender_id);
            self.queues.push_ray(ray);
        }
        Ok(())
    }

    /// Fold announced treelets into the held set, fetch every listed
    /// object from storage, and build the scene on first use.
    fn get_objects(&mut self, request: &GetObjects) -> Result<(), WorkerError> {
        for key in &request.objects {
            match key {
                // Triangle meshes are packed inside treelets
                ObjectKey::TriangleMesh(_) => continue,
                ObjectKey::Treelet(id) => {
                    self.held_treelets.insert(*id);
                }
                _ => {}
            }
            self.store.get(&key.to_key())?;
        }

        if self.scene.is_none() {
            self.scene = Some(self.scene_builder.build(&request.objects, self.store.as_ref())?);
        }
        Ok(())
    }

    /// Generate camera rays for the assigned crop window and route them
    /// like any other processed ray.
    fn generate_rays(&mut self, request: &GenerateRays) -> Result<(), WorkerError> {
        let my_id = self.my_id();
        let Worker {
            scene,
            queues,
            stats,
            tracelog,
            held_treelets,
            peers,
            rng,
            config,
            ..
        } = self;
        let Some(scene) = scene.as_ref() else {
            return Err(WorkerError::SceneNotLoaded);
        };

        let bounds = scene.camera.sample_bounds();
        let samples_per_pixel = if config.samples_per_pixel > 0 {
            config.samples_per_pixel
        } else {
            scene.camera.samples_per_pixel()
        };
        let max_depth = scene.max_depth;

        for sample_num in 0..samples_per_pixel {
            for pixel in request.crop_window.pixels() {
                if pixel.0 < bounds.min.0
                    || pixel.0 >= bounds.max.0
                    || pixel.1 < bounds.min.1
                    || pixel.1 >= bounds.max.1
                {
                    continue;
                }

                let camera_sample = scene.camera.generate_sample(pixel, sample_num);
                let mut ray = RayState {
                    sample: SampleInfo {
                        id: sample_id_for(pixel, &bounds, samples_per_pixel, sample_num),
                        num: sample_num,
                        pixel,
                        p_film: camera_sample.p_film,
                        weight: camera_sample.weight,
                    },
                    ray: camera_sample.ray,
                    remaining_bounces: max_depth,
                    to_visit: Vec::new(),
                    hit: None,
                    is_shadow_ray: false,
                    beta: [1.0; 3],
                    ld: [0.0; 3],
                    hop: 0,
                    tick: 0,
                    track: tracelog.sample_ray(rng),
                };
                ray.start_trace();

                stats.rays_generated += 1;
                tracelog.log_ray(my_id, max_depth, &ray, RayAction::Generated, my_id);

                let Some(next_treelet) = ray.current_treelet() else {
                    continue;
                };
                if held_treelets.contains(&next_treelet) {
                    queues.push_ray(ray);
                } else if peers.anyone_holds(next_treelet) {
                    queues.push_out(next_treelet, ray);
                } else {
                    queues.push_pending(next_treelet, ray);
                }
            }
        }
        Ok(())
    }
}
