// Payload bodies for the coordinator control plane and the peer handshake.
//
// Control-plane bodies ride over the TCP channel as JSON; the handshake and
// benchmark bodies travel inside UDP datagrams and use the fixed big-endian
// layouts below.

use serde::{Deserialize, Serialize};

use crate::types::{TreeletId, WorkerId};
use crate::wire::{WireError, WireReader, WireWriter};

/// Coordinator's reply to the worker's Hey
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeyReply {
    pub worker_id: WorkerId,
    pub job_id: String,
}

/// A scene object the worker should fetch from storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKey {
    Treelet(TreeletId),
    TriangleMesh(u64),
    Camera,
    Sampler,
    Lights,
    Scene,
}

impl ObjectKey {
    /// Storage key for this object
    pub fn to_key(&self) -> String {
        match self {
            ObjectKey::Treelet(id) => format!("T{id}"),
            ObjectKey::TriangleMesh(id) => format!("MESH{id}"),
            ObjectKey::Camera => "CAMERA".to_string(),
            ObjectKey::Sampler => "SAMPLER".to_string(),
            ObjectKey::Lights => "LIGHTS".to_string(),
            ObjectKey::Scene => "SCENE".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetObjects {
    pub objects: Vec<ObjectKey>,
}

/// Inclusive-exclusive pixel bounds assigned for ray generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropWindow {
    pub min: (i32, i32),
    pub max: (i32, i32),
}

impl CropWindow {
    pub fn pixels(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        let (x0, y0) = self.min;
        let (x1, y1) = self.max;
        (y0..y1).flat_map(move |y| (x0..x1).map(move |x| (x, y)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateRays {
    pub crop_window: CropWindow,
}

/// Peer announcement: the two advertised addresses are strings so the
/// coordinator stays agnostic of address families.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectTo {
    pub worker_id: WorkerId,
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipleConnect {
    pub workers: Vec<ConnectTo>,
}

/// Queue depths and counters pushed to the coordinator every stats tick
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatsReport {
    pub timestamp_us: u64,
    pub ray_queue: usize,
    pub out_queue: usize,
    pub pending_queue: usize,
    pub finished_queue: usize,
    pub peers_connecting: usize,
    pub peers_connected: usize,
    pub outstanding_udp: usize,
    pub queued_udp: usize,
    pub rays_generated: u64,
    pub rays_processed: u64,
    pub rays_sent: u64,
    pub rays_resent: u64,
    pub rays_received: u64,
    pub finished_paths: u64,
    pub stale_responses: u64,
}

/// First half of the two-path handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub worker_id: WorkerId,
    pub my_seed: u32,
    pub your_seed: u32,
    pub address_no: u8,
}

impl ConnectionRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = WireWriter::with_capacity(13);
        writer.put_u32(self.worker_id);
        writer.put_u32(self.my_seed);
        writer.put_u32(self.your_seed);
        writer.put_u8(self.address_no);
        writer.into_bytes()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut reader = WireReader::new(payload);
        Ok(Self {
            worker_id: reader.u32()?,
            my_seed: reader.u32()?,
            your_seed: reader.u32()?,
            address_no: reader.u8()?,
        })
    }
}

/// Second half of the handshake; also advertises the responder's treelets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionResponse {
    pub worker_id: WorkerId,
    pub my_seed: u32,
    pub your_seed: u32,
    pub address_no: u8,
    pub treelets: Vec<TreeletId>,
}

impl ConnectionResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = WireWriter::with_capacity(13 + 2 + self.treelets.len() * 4);
        writer.put_u32(self.worker_id);
        writer.put_u32(self.my_seed);
        writer.put_u32(self.your_seed);
        writer.put_u8(self.address_no);
        writer.put_u16(self.treelets.len() as u16);
        for treelet in &self.treelets {
            writer.put_u32(*treelet);
        }
        writer.into_bytes()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut reader = WireReader::new(payload);
        let worker_id = reader.u32()?;
        let my_seed = reader.u32()?;
        let your_seed = reader.u32()?;
        let address_no = reader.u8()?;
        let count = reader.u16()? as usize;
        let mut treelets = Vec::with_capacity(count);
        for _ in 0..count {
            treelets.push(reader.u32()?);
        }
        Ok(Self {
            worker_id,
            my_seed,
            your_seed,
            address_no,
            treelets,
        })
    }
}

/// Benchmark activation: destination worker, duration in seconds, receiver
/// rate override in Mb/s (zero keeps the default), and the sending endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartBenchmark {
    pub destination: WorkerId,
    pub duration_secs: u32,
    pub rate_mbps: u32,
    pub address_no: u32,
}

impl StartBenchmark {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = WireWriter::with_capacity(16);
        writer.put_u32(self.destination);
        writer.put_u32(self.duration_secs);
        writer.put_u32(self.rate_mbps);
        writer.put_u32(self.address_no);
        writer.into_bytes()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut reader = WireReader::new(payload);
        Ok(Self {
            destination: reader.u32()?,
            duration_secs: reader.u32()?,
            rate_mbps: reader.u32()?,
            address_no: reader.u32()?,
        })
    }
}

#[cfg(test)]
mod control_tests {
    use super::{ConnectionRequest, ConnectionResponse, CropWindow, StartBenchmark};

    #[test]
    fn connection_request_round_trip() {
        let request = ConnectionRequest {
            worker_id: 12,
            my_seed: 0xdead,
            your_seed: 0xbeef,
            address_no: 1,
        };
        assert_eq!(
            ConnectionRequest::decode(&request.encode()).unwrap(),
            request
        );
    }

    #[test]
    fn connection_response_carries_treelets() {
        let response = ConnectionResponse {
            worker_id: 3,
            my_seed: 7,
            your_seed: 11,
            address_no: 0,
            treelets: vec![1, 5, 9],
        };
        assert_eq!(
            ConnectionResponse::decode(&response.encode()).unwrap(),
            response
        );
    }

    #[test]
    fn start_benchmark_layout_is_sixteen_bytes() {
        let body = StartBenchmark {
            destination: 2,
            duration_secs: 30,
            rate_mbps: 200,
            address_no: 1,
        };
        let bytes = body.encode();
        assert_eq!(bytes.len(), 16);
        assert_eq!(StartBenchmark::decode(&bytes).unwrap(), body);
    }

    #[test]
    fn crop_window_iterates_row_major() {
        let window = CropWindow {
            min: (0, 0),
            max: (2, 2),
        };
        let pixels: Vec<_> = window.pixels().collect();
        assert_eq!(pixels, vec![(0, 0), (1, 0), (0, 1), (1, 1)]);
    }
}
