// Shared harness for the integration tests: an in-process worker wired to
// a scripted coordinator over a real TCP socket, plus stub scene
// collaborators with scripted trace/shade behavior.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::time::Duration;

use treelet_worker::config::WorkerConfig;
use treelet_worker::scene::{
    CameraModel, CameraSample, NullCamera, Scene, Shader, ShadeOutput, Tracer,
};
use treelet_worker::storage::MemoryStore;
use treelet_worker::Worker;

use treelet_shared::{
    CropWindow, HeyReply, Message, MessageParser, OpCode, RayData, RayState, SampleInfo,
    TreeletRef, WorkerId, DEFAULT_MAX_DEPTH,
};

/// One worker plus the coordinator's end of its control channel
pub struct Harness {
    pub worker: Worker,
    pub control: TcpStream,
    parser: MessageParser,
}

impl Harness {
    pub fn spawn(config: WorkerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind coordinator listener");
        let coordinator_addr = listener.local_addr().expect("listener address");

        let worker = Worker::new(
            coordinator_addr,
            "127.0.0.1",
            config,
            Box::new(MemoryStore::new()),
            Box::new(treelet_worker::scene::NullSceneBuilder),
        )
        .expect("spawn worker");

        let (control, _) = listener.accept().expect("accept worker connection");
        control
            .set_read_timeout(Some(Duration::from_millis(100)))
            .expect("set control read timeout");

        Self {
            worker,
            control,
            parser: MessageParser::new(),
        }
    }

    /// Deliver a control message and run the worker's message handler
    pub fn send_control(&mut self, message: Message) {
        self.control
            .write_all(&message.encode())
            .expect("write control frame");

        let before = self.worker.queued_message_count();
        for _ in 0..100 {
            self.worker
                .handle_coordinator_receive()
                .expect("coordinator receive");
            if self.worker.queued_message_count() > before {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.worker.handle_messages().expect("handle messages");
    }

    /// Flush the worker's upstream buffer and collect the frames
    pub fn recv_control(&mut self) -> Vec<Message> {
        for _ in 0..100 {
            self.worker
                .handle_coordinator_send()
                .expect("coordinator send");
            if self.worker.coordinator_backlog() == 0 {
                break;
            }
        }

        let mut buf = [0u8; 8192];
        loop {
            match self.control.read(&mut buf) {
                Ok(0) => break,
                Ok(len) => self.parser.parse(&buf[..len]).expect("parse upstream"),
                Err(_) => break,
            }
        }

        let mut messages = Vec::new();
        while let Some(message) = self.parser.pop() {
            messages.push(message);
        }
        messages
    }

    /// Run the Hey exchange, assigning this worker an id
    pub fn assign_id(&mut self, worker_id: WorkerId) {
        let reply = HeyReply {
            worker_id,
            job_id: "job-0".to_string(),
        };
        self.send_control(Message::new(
            0,
            OpCode::Hey,
            serde_json::to_vec(&reply).expect("encode hey"),
        ));
        assert_eq!(self.worker.worker_id(), Some(worker_id));
    }

    /// Push every queued datagram onto the wire
    pub fn flush_udp(&mut self) {
        for _ in 0..10_000 {
            if self.worker.service_packet_count() == 0 && self.worker.ray_packet_count() == 0 {
                break;
            }
            self.worker.handle_udp_send(0).expect("udp send 0");
            self.worker.handle_udp_send(1).expect("udp send 1");
        }
    }

    /// Drain anything that has arrived on both endpoints
    pub fn drain_udp(&mut self) {
        std::thread::sleep(Duration::from_millis(10));
        for _ in 0..10_000 {
            let before = self.worker.queued_message_count();
            self.worker.handle_udp_receive(0).expect("udp recv 0");
            self.worker.handle_udp_receive(1).expect("udp recv 1");
            if self.worker.queued_message_count() == before {
                break;
            }
        }
    }
}

/// A scripted remote endpoint standing in for another worker's UDP socket
pub struct RawPeer {
    pub socket: UdpSocket,
}

impl RawPeer {
    pub fn bind() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").expect("bind raw peer");
        socket
            .set_read_timeout(Some(Duration::from_millis(200)))
            .expect("raw peer timeout");
        Self { socket }
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().expect("raw peer address")
    }

    pub fn send(&self, target: SocketAddr, message: &Message) {
        self.socket
            .send_to(&message.encode(), target)
            .expect("raw peer send");
    }

    pub fn recv(&self) -> Option<Vec<Message>> {
        let mut buf = [0u8; 4096];
        match self.socket.recv_from(&mut buf) {
            Ok((len, _)) => Some(treelet_shared::parse_datagram(&buf[..len]).expect("datagram")),
            Err(_) => None,
        }
    }
}

pub fn test_ray(id: u64, treelet: u32) -> RayState {
    RayState {
        sample: SampleInfo {
            id,
            num: 0,
            pixel: (id as i32, 0),
            p_film: (id as f32 + 0.5, 0.5),
            weight: 1.0,
        },
        ray: RayData::new([0.0; 3], [0.0, 0.0, 1.0]),
        remaining_bounces: DEFAULT_MAX_DEPTH,
        to_visit: vec![TreeletRef { treelet, node: 0 }],
        hit: None,
        is_shadow_ray: false,
        beta: [1.0; 3],
        ld: [0.0; 3],
        hop: 0,
        tick: 0,
        track: false,
    }
}

/// Tracer that reports a hit without consuming the traversal stack (the
/// shadow-ray occlusion shape) for shadow rays, and pops to a miss for
/// everything else.
pub struct OccludingTracer;

impl Tracer for OccludingTracer {
    fn trace(&self, mut ray: RayState) -> RayState {
        if ray.is_shadow_ray {
            ray.hit = Some(treelet_shared::HitPoint {
                treelet: ray.to_visit.last().map_or(0, |top| top.treelet),
                node: 0,
                primitive: 0,
            });
        } else {
            ray.to_visit.pop();
        }
        ray
    }
}

/// Tracer that leaves the ray untouched, so routing sees the original
/// destination treelet.
pub struct PassthroughTracer;

impl Tracer for PassthroughTracer {
    fn trace(&self, ray: RayState) -> RayState {
        ray
    }
}

pub struct NoopShader;

impl Shader for NoopShader {
    fn shade(&self, _ray: RayState) -> ShadeOutput {
        ShadeOutput {
            rays: Vec::new(),
            path_completed: true,
        }
    }
}

pub fn scene_with(tracer: Box<dyn Tracer>) -> Scene {
    Scene {
        camera: Box::new(NullCamera {
            bounds: CropWindow {
                min: (0, 0),
                max: (16, 16),
            },
        }),
        tracer,
        shader: Box::new(NoopShader),
        max_depth: DEFAULT_MAX_DEPTH,
    }
}

/// Camera whose samples are deterministic and cheap
pub struct FixedCamera {
    pub bounds: CropWindow,
    pub spp: u32,
}

impl CameraModel for FixedCamera {
    fn sample_bounds(&self) -> CropWindow {
        self.bounds
    }

    fn samples_per_pixel(&self) -> u32 {
        self.spp
    }

    fn generate_sample(&self, pixel: (i32, i32), _sample_num: u32) -> CameraSample {
        CameraSample {
            ray: RayData::new([pixel.0 as f32, pixel.1 as f32, -1.0], [0.0, 0.0, 1.0]),
            p_film: (pixel.0 as f32 + 0.5, pixel.1 as f32 + 0.5),
            weight: 1.0,
        }
    }
}
