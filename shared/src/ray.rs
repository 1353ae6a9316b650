// Ray state: the atomic unit of work that hops between workers, and the
// finished-ray record returned to the coordinator for film accumulation.

use crate::types::{PathId, SampleId, TreeletId};
use crate::wire::{WireError, WireReader, WireWriter};

/// Which film sample this path belongs to
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleInfo {
    pub id: SampleId,
    pub num: u32,
    pub pixel: (i32, i32),
    pub p_film: (f32, f32),
    pub weight: f32,
}

/// One entry of the BVH traversal continuation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeletRef {
    pub treelet: TreeletId,
    pub node: u32,
}

impl TreeletRef {
    pub fn root() -> Self {
        Self {
            treelet: 0,
            node: 0,
        }
    }
}

/// Where the ray hit, if it has; the treelet id doubles as the routing key
/// for shading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HitPoint {
    pub treelet: TreeletId,
    pub node: u32,
    pub primitive: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayDifferentials {
    pub rx_origin: [f32; 3],
    pub ry_origin: [f32; 3],
    pub rx_direction: [f32; 3],
    pub ry_direction: [f32; 3],
}

/// The geometric ray being traced
#[derive(Debug, Clone, PartialEq)]
pub struct RayData {
    pub origin: [f32; 3],
    pub direction: [f32; 3],
    pub t_max: f32,
    pub differentials: Option<RayDifferentials>,
}

impl RayData {
    pub fn new(origin: [f32; 3], direction: [f32; 3]) -> Self {
        Self {
            origin,
            direction,
            t_max: f32::INFINITY,
            differentials: None,
        }
    }
}

/// A light-transport path in progress. Owned by exactly one queue (or one
/// in-flight packet) at any moment; moving a RayState between queues is the
/// only way it travels.
#[derive(Debug, Clone, PartialEq)]
pub struct RayState {
    pub sample: SampleInfo,
    pub ray: RayData,
    pub remaining_bounces: u32,
    pub to_visit: Vec<TreeletRef>,
    pub hit: Option<HitPoint>,
    pub is_shadow_ray: bool,
    /// Accumulated path throughput
    pub beta: [f32; 3],
    /// Direct-light contribution carried by shadow rays
    pub ld: [f32; 3],
    /// Cross-worker forwards so far
    pub hop: u16,
    /// Retransmissions of the packet currently carrying this ray
    pub tick: u16,
    /// Sampled into the ray trace log
    pub track: bool,
}

impl RayState {
    pub fn path_id(&self) -> PathId {
        self.sample.id
    }

    pub fn to_visit_empty(&self) -> bool {
        self.to_visit.is_empty()
    }

    /// The treelet the next intersection test (or shading) needs
    pub fn current_treelet(&self) -> Option<TreeletId> {
        if let Some(top) = self.to_visit.last() {
            return Some(top.treelet);
        }
        self.hit.map(|hit| hit.treelet)
    }

    /// Reset the traversal continuation to the scene root
    pub fn start_trace(&mut self) {
        self.hit = None;
        self.to_visit.clear();
        self.to_visit.push(TreeletRef::root());
    }

    /// The film contribution this path has earned: beta * Ld
    pub fn contribution(&self) -> [f32; 3] {
        [
            self.beta[0] * self.ld[0],
            self.beta[1] * self.ld[1],
            self.beta[2] * self.ld[2],
        ]
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut writer = WireWriter::with_capacity(self.serialized_len());

        writer.put_u64(self.sample.id);
        writer.put_u32(self.sample.num);
        writer.put_i32(self.sample.pixel.0);
        writer.put_i32(self.sample.pixel.1);
        writer.put_f32(self.sample.p_film.0);
        writer.put_f32(self.sample.p_film.1);
        writer.put_f32(self.sample.weight);

        for component in self.ray.origin.iter().chain(self.ray.direction.iter()) {
            writer.put_f32(*component);
        }
        writer.put_f32(self.ray.t_max);

        writer.put_bool(self.ray.differentials.is_some());
        if let Some(diff) = &self.ray.differentials {
            for component in diff
                .rx_origin
                .iter()
                .chain(diff.ry_origin.iter())
                .chain(diff.rx_direction.iter())
                .chain(diff.ry_direction.iter())
            {
                writer.put_f32(*component);
            }
        }

        writer.put_u32(self.remaining_bounces);

        writer.put_u16(self.to_visit.len() as u16);
        for entry in &self.to_visit {
            writer.put_u32(entry.treelet);
            writer.put_u32(entry.node);
        }

        writer.put_bool(self.hit.is_some());
        if let Some(hit) = &self.hit {
            writer.put_u32(hit.treelet);
            writer.put_u32(hit.node);
            writer.put_u32(hit.primitive);
        }

        writer.put_bool(self.is_shadow_ray);
        for component in self.beta.iter().chain(self.ld.iter()) {
            writer.put_f32(*component);
        }
        writer.put_u16(self.hop);
        writer.put_u16(self.tick);
        writer.put_bool(self.track);

        writer.into_bytes()
    }

    /// Length of `serialize()` without producing the bytes; used for MTU
    /// packing decisions.
    pub fn serialized_len(&self) -> usize {
        let mut len = 8 + 4 + 4 + 4 + 4 + 4 + 4; // sample
        len += 6 * 4 + 4; // origin, direction, t_max
        len += 1 + if self.ray.differentials.is_some() {
            12 * 4
        } else {
            0
        };
        len += 4; // remaining_bounces
        len += 2 + self.to_visit.len() * 8;
        len += 1 + if self.hit.is_some() { 12 } else { 0 };
        len += 1 + 6 * 4 + 2 + 2 + 1; // shadow flag, beta, ld, hop, tick, track
        len
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, WireError> {
        let mut reader = WireReader::new(bytes);

        let sample = SampleInfo {
            id: reader.u64()?,
            num: reader.u32()?,
            pixel: (reader.i32()?, reader.i32()?),
            p_film: (reader.f32()?, reader.f32()?),
            weight: reader.f32()?,
        };

        let origin = [reader.f32()?, reader.f32()?, reader.f32()?];
        let direction = [reader.f32()?, reader.f32()?, reader.f32()?];
        let t_max = reader.f32()?;

        let differentials = if reader.bool()? {
            let mut fields = [[0f32; 3]; 4];
            for field in fields.iter_mut() {
                for component in field.iter_mut() {
                    *component = reader.f32()?;
                }
            }
            Some(RayDifferentials {
                rx_origin: fields[0],
                ry_origin: fields[1],
                rx_direction: fields[2],
                ry_direction: fields[3],
            })
        } else {
            None
        };

        let remaining_bounces = reader.u32()?;

        let to_visit_len = reader.u16()? as usize;
        let mut to_visit = Vec::with_capacity(to_visit_len);
        for _ in 0..to_visit_len {
            to_visit.push(TreeletRef {
                treelet: reader.u32()?,
                node: reader.u32()?,
            });
        }

        let hit = if reader.bool()? {
            Some(HitPoint {
                treelet: reader.u32()?,
                node: reader.u32()?,
                primitive: reader.u32()?,
            })
        } else {
            None
        };

        let is_shadow_ray = reader.bool()?;
        let beta = [reader.f32()?, reader.f32()?, reader.f32()?];
        let ld = [reader.f32()?, reader.f32()?, reader.f32()?];
        let hop = reader.u16()?;
        let tick = reader.u16()?;
        let track = reader.bool()?;

        Ok(Self {
            sample,
            ray: RayData {
                origin,
                direction,
                t_max,
                differentials,
            },
            remaining_bounces,
            to_visit,
            hit,
            is_shadow_ray,
            beta,
            ld,
            hop,
            tick,
            track,
        })
    }
}

/// The record pushed upstream for a terminated path
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FinishedRay {
    pub sample_id: SampleId,
    pub p_film: (f32, f32),
    pub weight: f32,
    pub contribution: [f32; 3],
}

impl FinishedRay {
    pub const WIRE_BYTES: usize = 8 + 4 + 4 + 4 + 12;

    pub fn encode_into(&self, writer: &mut WireWriter) {
        writer.put_u64(self.sample_id);
        writer.put_f32(self.p_film.0);
        writer.put_f32(self.p_film.1);
        writer.put_f32(self.weight);
        for component in &self.contribution {
            writer.put_f32(*component);
        }
    }

    pub fn decode(reader: &mut WireReader) -> Result<Self, WireError> {
        Ok(Self {
            sample_id: reader.u64()?,
            p_film: (reader.f32()?, reader.f32()?),
            weight: reader.f32()?,
            contribution: [reader.f32()?, reader.f32()?, reader.f32()?],
        })
    }
}

/// Relative luminance of an RGB contribution
pub fn luminance(rgb: [f32; 3]) -> f32 {
    0.2126 * rgb[0] + 0.7152 * rgb[1] + 0.0722 * rgb[2]
}
