// The worker itself: owns the sockets, the queues, the peer registry, and
// the action table, and runs the level-triggered event loop over them.

mod benchmark;
mod handlers;
mod messages;

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use treelet_shared::{
    Message, MessageParser, OpCode, Timer, TreeletId, WorkerId, DEFAULT_MAX_DEPTH,
};

use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::net::{PacedEndpoint, RayPacket, Reliability, ServicePacket};
use crate::peers::Peers;
use crate::poller::{
    Action, ActionKind, ActionResult, ActionSource, Direction, Readiness, TimerId, KEY_COORDINATOR,
    KEY_UDP0, KEY_UDP1,
};
use crate::rays::RayQueues;
use crate::scene::{Scene, SceneBuilder};
use crate::stats::{DiagnosticsBaseline, WorkerStats};
use crate::storage::ObjectStore;
use crate::tracelog::TraceLog;

pub use benchmark::BenchmarkRuntime;

const LOG_STREAM_ENVAR: &str = "AWS_LAMBDA_LOG_STREAM_NAME";

const PEER_INTERVAL: Duration = Duration::from_millis(100);
const OUT_QUEUE_INTERVAL: Duration = Duration::from_millis(10);
const RAY_ACKS_INTERVAL: Duration = Duration::from_millis(10);
const WORKER_STATS_INTERVAL: Duration = Duration::from_secs(1);
const DIAGNOSTICS_INTERVAL: Duration = Duration::from_secs(1);
const FINISHED_PATHS_INTERVAL: Duration = Duration::from_secs(1);

/// The TCP link to the coordinator: a stream, the push-parser reassembling
/// its frames, and the pending write buffer.
pub(crate) struct CoordinatorChannel {
    pub stream: TcpStream,
    pub parser: MessageParser,
    pub out: Vec<u8>,
}

pub struct Worker {
    pub(crate) config: WorkerConfig,
    pub(crate) coordinator_addr: SocketAddr,
    pub(crate) endpoints: [PacedEndpoint; 2],
    pub(crate) coordinator: CoordinatorChannel,
    pub(crate) readiness: Readiness,
    pub(crate) store: Box<dyn ObjectStore>,
    pub(crate) scene_builder: Box<dyn SceneBuilder>,
    pub(crate) scene: Option<Scene>,
    pub(crate) worker_id: Option<WorkerId>,
    pub(crate) job_id: Option<String>,
    pub(crate) my_seed: u32,
    pub(crate) peers: Peers,
    pub(crate) held_treelets: HashSet<TreeletId>,
    pub(crate) queues: RayQueues,
    pub(crate) reliability: Reliability,
    pub(crate) service_packets: VecDeque<ServicePacket>,
    pub(crate) ray_packets: VecDeque<RayPacket>,
    pub(crate) message_queue: VecDeque<Message>,
    pub(crate) timers: HashMap<TimerId, Timer>,
    pub(crate) actions: Vec<Action>,
    pub(crate) action_ids: HashMap<ActionKind, u64>,
    next_action_id: u64,
    pub(crate) stats: WorkerStats,
    pub(crate) diagnostics: DiagnosticsBaseline,
    pub(crate) benchmark: Option<BenchmarkRuntime>,
    pub(crate) tracelog: TraceLog,
    pub(crate) rng: StdRng,
    pub(crate) terminated: bool,
}

impl Worker {
    /// Bind both endpoints, connect to the coordinator, and register the
    /// steady-state action table. The first frame out is Hey with the
    /// environment's log-stream identifier.
    pub fn new(
        coordinator_addr: SocketAddr,
        bind_ip: &str,
        config: WorkerConfig,
        store: Box<dyn ObjectStore>,
        scene_builder: Box<dyn SceneBuilder>,
    ) -> Result<Self, WorkerError> {
        let endpoints = [
            PacedEndpoint::bind(bind_ip, config.max_udp_rate_mbps).map_err(WorkerError::Udp)?,
            PacedEndpoint::bind(bind_ip, config.max_udp_rate_mbps).map_err(WorkerError::Udp)?,
        ];

        let stream = TcpStream::connect(coordinator_addr).map_err(WorkerError::Coordinator)?;
        stream.set_nodelay(true).map_err(WorkerError::Coordinator)?;
        stream
            .set_nonblocking(true)
            .map_err(WorkerError::Coordinator)?;

        let readiness = Readiness::new().map_err(WorkerError::Poll)?;
        readiness
            .register(endpoints[0].socket(), KEY_UDP0)
            .map_err(WorkerError::Poll)?;
        readiness
            .register(endpoints[1].socket(), KEY_UDP1)
            .map_err(WorkerError::Poll)?;
        readiness
            .register(&stream, KEY_COORDINATOR)
            .map_err(WorkerError::Poll)?;

        let mut rng = StdRng::from_entropy();
        let mut my_seed = 0u32;
        while my_seed == 0 {
            my_seed = rng.gen();
        }

        let mut timers = HashMap::new();
        timers.insert(TimerId::Peers, Timer::new(PEER_INTERVAL));
        timers.insert(TimerId::OutQueue, Timer::new(OUT_QUEUE_INTERVAL));
        timers.insert(TimerId::RayAcks, Timer::new(RAY_ACKS_INTERVAL));
        timers.insert(TimerId::WorkerStats, Timer::new(WORKER_STATS_INTERVAL));
        timers.insert(TimerId::Diagnostics, Timer::new(DIAGNOSTICS_INTERVAL));
        timers.insert(TimerId::FinishedPaths, Timer::new(FINISHED_PATHS_INTERVAL));

        let tracelog = TraceLog::new(config.ray_log_rate, config.packet_log_rate);
        info!(target: "diag", "start");

        let mut worker = Self {
            config,
            coordinator_addr,
            endpoints,
            coordinator: CoordinatorChannel {
                stream,
                parser: MessageParser::new(),
                out: Vec::new(),
            },
            readiness,
            store,
            scene_builder,
            scene: None,
            worker_id: None,
            job_id: None,
            my_seed,
            peers: Peers::new(),
            held_treelets: HashSet::new(),
            queues: RayQueues::new(),
            reliability: Reliability::new(),
            service_packets: VecDeque::new(),
            ray_packets: VecDeque::new(),
            message_queue: VecDeque::new(),
            timers,
            actions: Vec::new(),
            action_ids: HashMap::new(),
            next_action_id: 0,
            stats: WorkerStats::new(),
            diagnostics: DiagnosticsBaseline::default(),
            benchmark: None,
            tracelog,
            rng,
            terminated: false,
        };

        worker.register_steady_state_actions();

        let log_stream = std::env::var(LOG_STREAM_ENVAR).unwrap_or_default();
        worker.send_to_coordinator(Message::new(0, OpCode::Hey, log_stream.into_bytes()));

        Ok(worker)
    }

    fn register_steady_state_actions(&mut self) {
        use ActionKind as K;
        use ActionSource as S;

        self.register_action(
            S::Coordinator {
                direction: Direction::In,
            },
            K::CoordinatorReceive,
        );
        self.register_action(
            S::Coordinator {
                direction: Direction::Out,
            },
            K::CoordinatorSend,
        );
        for iface in 0..2 {
            self.register_action(
                S::Udp {
                    iface,
                    direction: Direction::In,
                },
                K::UdpReceive(iface),
            );
        }
        self.register_action(S::Timer(TimerId::RayAcks), K::RayAcks);
        for iface in 0..2 {
            self.register_action(
                S::Udp {
                    iface,
                    direction: Direction::Out,
                },
                K::UdpSend(iface),
            );
        }
        self.register_action(S::Always, K::RayQueue);
        self.register_action(S::Timer(TimerId::OutQueue), K::OutQueue);
        self.register_action(S::Always, K::FinishedQueue);
        self.register_action(S::Timer(TimerId::Peers), K::Peers);
        self.register_action(S::Always, K::Messages);
        self.register_action(S::Always, K::NeededTreelets);
        self.register_action(S::Timer(TimerId::FinishedPaths), K::FinishedPaths);
        self.register_action(S::Timer(TimerId::WorkerStats), K::WorkerStats);
        self.register_action(S::Timer(TimerId::Diagnostics), K::Diagnostics);
    }

    pub(crate) fn register_action(&mut self, source: ActionSource, kind: ActionKind) -> u64 {
        let id = self.next_action_id;
        self.next_action_id += 1;
        self.actions.push(Action {
            id,
            source,
            kind,
            active: true,
        });
        self.action_ids.insert(kind, id);
        id
    }

    /// Deactivate the actions registered under the given kinds
    pub(crate) fn deactivate_actions(&mut self, kinds: &[ActionKind]) {
        let ids: HashSet<u64> = kinds
            .iter()
            .filter_map(|kind| self.action_ids.get(kind).copied())
            .collect();
        for action in &mut self.actions {
            if ids.contains(&action.id) {
                action.active = false;
            }
        }
    }

    pub(crate) fn my_id(&self) -> WorkerId {
        self.worker_id.unwrap_or(0)
    }

    pub(crate) fn max_depth(&self) -> u32 {
        self.scene
            .as_ref()
            .map_or(DEFAULT_MAX_DEPTH, |scene| scene.max_depth)
    }

    pub(crate) fn send_to_coordinator(&mut self, message: Message) {
        self.coordinator.out.extend_from_slice(&message.encode());
    }

    pub(crate) fn timer_reset(&mut self, id: TimerId) {
        if let Some(timer) = self.timers.get_mut(&id) {
            timer.reset();
        }
    }

    /// Whether an action's callback should run once its source is ready
    fn guard(&mut self, kind: ActionKind) -> bool {
        match kind {
            ActionKind::CoordinatorReceive => true,
            ActionKind::CoordinatorSend => !self.coordinator.out.is_empty(),
            ActionKind::UdpReceive(_) => true,
            ActionKind::UdpSend(iface) => {
                let has_traffic = if iface == 0 {
                    !self.service_packets.is_empty() || !self.ray_packets.is_empty()
                } else {
                    !self.service_packets.is_empty()
                };
                has_traffic && self.endpoints[iface].within_pace()
            }
            ActionKind::RayAcks => {
                self.reliability.has_pending_acks() || self.reliability.front_due(Instant::now())
            }
            ActionKind::RayQueue => self.scene.is_some() && self.queues.ray_len() > 0,
            ActionKind::OutQueue => self.queues.out_size() > 0,
            ActionKind::FinishedQueue => match self.config.finished_ray_action {
                crate::config::FinishedRayAction::Discard => {
                    self.queues.finished_len() > self.config.discard_threshold
                }
                crate::config::FinishedRayAction::SendBack => self.queues.finished_len() > 0,
                crate::config::FinishedRayAction::Upload => false,
            },
            ActionKind::Peers => !self.peers.is_empty(),
            ActionKind::Messages => !self.message_queue.is_empty(),
            ActionKind::NeededTreelets => !self.queues.needed_treelets.is_empty(),
            ActionKind::FinishedPaths => !self.queues.finished_path_ids.is_empty(),
            ActionKind::WorkerStats => self.worker_id.is_some(),
            ActionKind::Diagnostics => true,
            ActionKind::BenchmarkReceive(_) => true,
            ActionKind::BenchmarkSend(iface) => self.endpoints[iface].within_pace(),
            ActionKind::BenchmarkCheckpoint | ActionKind::BenchmarkDone => true,
        }
    }

    fn dispatch(&mut self, kind: ActionKind) -> Result<ActionResult, WorkerError> {
        match kind {
            ActionKind::CoordinatorReceive => self.handle_coordinator_receive(),
            ActionKind::CoordinatorSend => self.handle_coordinator_send(),
            ActionKind::UdpReceive(iface) => self.handle_udp_receive(iface),
            ActionKind::UdpSend(iface) => self.handle_udp_send(iface),
            ActionKind::RayAcks => self.handle_ray_acknowledgements(),
            ActionKind::RayQueue => self.handle_ray_queue(),
            ActionKind::OutQueue => self.handle_out_queue(),
            ActionKind::FinishedQueue => self.handle_finished_queue(),
            ActionKind::Peers => self.handle_peers(),
            ActionKind::Messages => self.handle_messages(),
            ActionKind::NeededTreelets => self.handle_needed_treelets(),
            ActionKind::FinishedPaths => self.handle_finished_paths(),
            ActionKind::WorkerStats => self.handle_worker_stats(),
            ActionKind::Diagnostics => self.handle_diagnostics(),
            ActionKind::BenchmarkReceive(iface) => self.handle_benchmark_receive(iface),
            ActionKind::BenchmarkSend(iface) => self.handle_benchmark_send(iface),
            ActionKind::BenchmarkCheckpoint => self.handle_benchmark_checkpoint(),
            ActionKind::BenchmarkDone => self.handle_benchmark_done(),
        }
    }

    /// Poll timeout for this iteration: the earliest pacing refill or
    /// guarded timer deadline; zero when an Always action is runnable;
    /// infinite otherwise.
    fn poll_timeout(&mut self) -> Option<Duration> {
        let mut timeout: Option<Duration> = None;
        let fold = |candidate: Duration, timeout: &mut Option<Duration>| {
            *timeout = Some(timeout.map_or(candidate, |current| current.min(candidate)));
        };

        for iface in 0..2 {
            if !self.endpoints[iface].within_pace() {
                let micros = self.endpoints[iface].micros_ahead_of_pace().max(1) as u64;
                fold(Duration::from_micros(micros), &mut timeout);
            }
        }

        for index in 0..self.actions.len() {
            let action = &self.actions[index];
            if !action.active {
                continue;
            }
            let (source, kind) = (action.source, action.kind);
            match source {
                ActionSource::Always => {
                    if self.guard(kind) {
                        return Some(Duration::ZERO);
                    }
                }
                ActionSource::Timer(timer_id) => {
                    if self.guard(kind) {
                        if let Some(timer) = self.timers.get(&timer_id) {
                            fold(timer.remaining(), &mut timeout);
                        }
                    }
                }
                _ => {}
            }
        }

        timeout
    }

    /// Re-arm socket interest to match what currently wants to run
    fn arm_interest(&mut self) -> Result<(), WorkerError> {
        let mut want_read = [false; 3];
        let mut want_write = [false; 3];

        for index in 0..self.actions.len() {
            let action = &self.actions[index];
            if !action.active {
                continue;
            }
            let (source, kind) = (action.source, action.kind);
            let (key, direction) = match source {
                ActionSource::Udp { iface, direction } => (iface, direction),
                ActionSource::Coordinator { direction } => (KEY_COORDINATOR, direction),
                _ => continue,
            };
            match direction {
                Direction::In => want_read[key] = true,
                // Sockets report writable almost always; only arm for it
                // when the guard says there is something to write.
                Direction::Out => want_write[key] |= self.guard(kind),
            }
        }

        for iface in 0..2 {
            self.readiness
                .interest(
                    self.endpoints[iface].socket(),
                    iface,
                    want_read[iface],
                    want_write[iface],
                )
                .map_err(WorkerError::Poll)?;
        }
        self.readiness
            .interest(
                &self.coordinator.stream,
                KEY_COORDINATOR,
                want_read[KEY_COORDINATOR],
                want_write[KEY_COORDINATOR],
            )
            .map_err(WorkerError::Poll)?;
        Ok(())
    }

    /// Run ready actions in registration order. Within one callback no
    /// other action runs; this is the only synchronization the worker has
    /// or needs.
    fn dispatch_ready(&mut self) -> Result<ActionResult, WorkerError> {
        for index in 0..self.actions.len() {
            let action = &self.actions[index];
            if !action.active {
                continue;
            }
            let (source, kind) = (action.source, action.kind);

            let ready = match source {
                ActionSource::Udp { iface, direction } => self.readiness.ready(iface, direction),
                ActionSource::Coordinator { direction } => {
                    self.readiness.ready(KEY_COORDINATOR, direction)
                }
                ActionSource::Timer(timer_id) => self
                    .timers
                    .get(&timer_id)
                    .is_some_and(|timer| timer.ringing()),
                ActionSource::Always => true,
            };
            if !ready || !self.guard(kind) {
                continue;
            }

            match self.dispatch(kind)? {
                ActionResult::Continue => {}
                ActionResult::CancelAll => {
                    self.actions[index].active = false;
                    return Ok(ActionResult::CancelAll);
                }
            }
        }
        Ok(ActionResult::Continue)
    }

    /// The event loop. Returns when the coordinator says Bye or an action
    /// cancels the loop (benchmark completion); fatal errors propagate.
    pub fn run(&mut self) -> Result<(), WorkerError> {
        while !self.terminated {
            let timeout = self.poll_timeout();
            self.arm_interest()?;
            self.readiness.wait(timeout).map_err(WorkerError::Poll)?;
            if self.dispatch_ready()? == ActionResult::CancelAll {
                info!("event loop cancelled");
                break;
            }
        }
        Ok(())
    }

    // Introspection used by the binary and the integration tests.

    pub fn worker_id(&self) -> Option<WorkerId> {
        self.worker_id
    }

    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref()
    }

    pub fn seed(&self) -> u32 {
        self.my_seed
    }

    /// Override the session seed (tests exercise seed-mismatch paths)
    pub fn set_seed(&mut self, seed: u32) {
        self.my_seed = seed;
    }

    pub fn endpoint_addr(&self, iface: usize) -> SocketAddr {
        self.endpoints[iface]
            .local_addr()
            .expect("endpoint has a bound address")
    }

    pub fn queues(&self) -> &RayQueues {
        &self.queues
    }

    pub fn queues_mut(&mut self) -> &mut RayQueues {
        &mut self.queues
    }

    pub fn peers(&self) -> &Peers {
        &self.peers
    }

    pub fn peers_mut(&mut self) -> &mut Peers {
        &mut self.peers
    }

    pub fn ray_packets(&self) -> &VecDeque<RayPacket> {
        &self.ray_packets
    }

    /// Bytes queued for the coordinator but not yet written
    pub fn coordinator_backlog(&self) -> usize {
        self.coordinator.out.len()
    }

    pub fn held_treelets_mut(&mut self) -> &mut HashSet<TreeletId> {
        &mut self.held_treelets
    }

    pub fn set_scene(&mut self, scene: Scene) {
        self.scene = Some(scene);
    }

    pub fn service_packet_count(&self) -> usize {
        self.service_packets.len()
    }

    pub fn ray_packet_count(&self) -> usize {
        self.ray_packets.len()
    }

    pub fn outstanding_packet_count(&self) -> usize {
        self.reliability.outstanding_len()
    }

    pub fn queued_message_count(&self) -> usize {
        self.message_queue.len()
    }

    pub fn terminated(&self) -> bool {
        self.terminated
    }
}
