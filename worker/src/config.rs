use treelet_shared::DEFAULT_DISCARD_THRESHOLD;

/// What to do with rays that have terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinishedRayAction {
    /// Drop them in bulk once enough accumulate (timing runs)
    #[default]
    Discard,
    /// Serialize contributions back to the coordinator
    SendBack,
    /// Reserved
    Upload,
}

impl FinishedRayAction {
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(FinishedRayAction::Discard),
            1 => Some(FinishedRayAction::SendBack),
            2 => Some(FinishedRayAction::Upload),
            _ => None,
        }
    }
}

/// Job-wide knobs, fixed at startup
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Send ray packets with sequencing, acks, and retransmission
    pub send_reliably: bool,
    /// Per-endpoint pacing rate in Mb/s
    pub max_udp_rate_mbps: u64,
    /// Overrides the sampler's samples-per-pixel when non-zero
    pub samples_per_pixel: u32,
    pub finished_ray_action: FinishedRayAction,
    /// Fraction of generated rays sampled into the ray trace log
    pub ray_log_rate: f64,
    /// Fraction of packets sampled into the packet trace log
    pub packet_log_rate: f64,
    /// Under Discard, finished rays are cleared only past this depth
    pub discard_threshold: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            send_reliably: false,
            max_udp_rate_mbps: 80,
            samples_per_pixel: 0,
            finished_ray_action: FinishedRayAction::Discard,
            ray_log_rate: 0.0,
            packet_log_rate: 0.0,
            discard_threshold: DEFAULT_DISCARD_THRESHOLD,
        }
    }
}
