//! # Treelet Shared
//! Wire protocol and data records shared between the treelet workers and the
//! coordinator: message framing, opcodes, ray-state serialization, control
//! payloads, and the interval timer the event loop schedules around.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

mod constants;
mod control;
mod message;
mod opcode;
mod ray;
mod timer;
mod types;
mod wire;

pub use constants::{
    ACK_ENTRY_BYTES, BASE_HEADER_BYTES, BENCHMARK_PING_BYTES, DEFAULT_DISCARD_THRESHOLD,
    DEFAULT_MAX_DEPTH, KEEP_ALIVE_INTERVAL, MAX_RAY_BATCH, PACKET_TIMEOUT, RAY_PACKET_HEADER_BYTES,
    RELIABLE_HEADER_BYTES, UDP_MTU_BYTES,
};
pub use control::{
    ConnectTo, ConnectionRequest, ConnectionResponse, CropWindow, GenerateRays, GetObjects,
    HeyReply, MultipleConnect, ObjectKey, StartBenchmark, WorkerStatsReport,
};
pub use message::{
    pack_acks, parse_acks, parse_datagram, AckEntry, CodecError, Message, MessageParser,
    FLAG_RELIABLE,
};
pub use opcode::OpCode;
pub use ray::{
    luminance, FinishedRay, HitPoint, RayData, RayDifferentials, RayState, SampleInfo, TreeletRef,
};
pub use timer::Timer;
pub use types::{Attempt, PathId, SampleId, SeqNo, TreeletId, WorkerId};
pub use wire::{WireError, WireReader, WireWriter};
