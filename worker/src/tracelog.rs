// Sampled CSV trace streams for rays and packets. Each stream goes out
// under its own log target so the sinks can be split downstream, the same
// way the coordinator's log pipeline expects them.

use std::time::{SystemTime, UNIX_EPOCH};

use log::info;
use rand::Rng;

use treelet_shared::{Attempt, RayState, SeqNo, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RayAction {
    Generated,
    Traced,
    Queued,
    Pending,
    Sent,
    Received,
    Finished,
}

impl RayAction {
    fn name(self) -> &'static str {
        match self {
            RayAction::Generated => "Generated",
            RayAction::Traced => "Traced",
            RayAction::Queued => "Queued",
            RayAction::Pending => "Pending",
            RayAction::Sent => "Sent",
            RayAction::Received => "Received",
            RayAction::Finished => "Finished",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketAction {
    Queued,
    Sent,
    Received,
    /// One row per tracked sequence number found in an inbound Ack body
    Acked,
    AckSent,
}

impl PacketAction {
    fn name(self) -> &'static str {
        match self {
            PacketAction::Queued => "Queued",
            PacketAction::Sent => "Sent",
            PacketAction::Received => "Received",
            PacketAction::Acked => "Acked",
            PacketAction::AckSent => "AckSent",
        }
    }

    /// Whether the local worker is the source column of the CSV row
    fn outbound(self) -> bool {
        !matches!(self, PacketAction::Received)
    }
}

fn timestamp_us() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros())
        .unwrap_or(0)
}

/// Bernoulli-sampled trace logging at the job's configured rates
pub struct TraceLog {
    ray_rate: f64,
    packet_rate: f64,
}

impl TraceLog {
    pub fn new(ray_rate: f64, packet_rate: f64) -> Self {
        let log = Self {
            ray_rate,
            packet_rate,
        };
        if log.rays_enabled() {
            info!(
                target: "ray",
                "x,y,sample,bounce,hop,tick,shadowRay,workerID,otherPartyID,treeletID,timestamp,size,action"
            );
        }
        if log.packets_enabled() {
            info!(
                target: "packet",
                "sourceID,destinationID,seqNo,attempt,size,rayCount,timestamp,action"
            );
        }
        log
    }

    pub fn rays_enabled(&self) -> bool {
        self.ray_rate > 0.0
    }

    pub fn packets_enabled(&self) -> bool {
        self.packet_rate > 0.0
    }

    /// Decide at generation time whether a ray is tracked for life
    pub fn sample_ray<R: Rng>(&self, rng: &mut R) -> bool {
        self.rays_enabled() && rng.gen_bool(self.ray_rate)
    }

    /// Decide at queue time whether a packet is tracked
    pub fn sample_packet<R: Rng>(&self, rng: &mut R) -> bool {
        self.packets_enabled() && rng.gen_bool(self.packet_rate)
    }

    pub fn log_ray(
        &self,
        worker_id: WorkerId,
        max_depth: u32,
        ray: &RayState,
        action: RayAction,
        other_party: WorkerId,
    ) {
        if !self.rays_enabled() || !ray.track {
            return;
        }

        let other = match action {
            RayAction::Sent | RayAction::Received => other_party,
            _ => worker_id,
        };

        info!(
            target: "ray",
            "{},{},{},{},{},{},{},{},{},{},{},{},{}",
            ray.sample.pixel.0,
            ray.sample.pixel.1,
            ray.sample.num,
            max_depth.saturating_sub(ray.remaining_bounces),
            ray.hop,
            ray.tick,
            ray.is_shadow_ray,
            worker_id,
            other,
            ray.current_treelet().unwrap_or(0),
            timestamp_us(),
            ray.serialized_len(),
            action.name()
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_packet(
        &self,
        worker_id: WorkerId,
        other_party: WorkerId,
        seq_no: SeqNo,
        attempt: Attempt,
        size: usize,
        ray_count: usize,
        action: PacketAction,
    ) {
        if !self.packets_enabled() {
            return;
        }

        let (source, destination) = if action.outbound() {
            (worker_id, other_party)
        } else {
            (other_party, worker_id)
        };

        info!(
            target: "packet",
            "{},{},{},{},{},{},{},{}",
            source,
            destination,
            seq_no,
            attempt,
            size,
            ray_count,
            timestamp_us(),
            action.name()
        );
    }
}
