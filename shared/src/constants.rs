// Wire and scheduling constants the cluster agrees on

use std::time::Duration;

/// Largest UDP datagram a worker will emit. Chosen below the typical cloud
/// path MTU so ray packets never fragment.
pub const UDP_MTU_BYTES: usize = 1350;

/// Envelope bytes of an unreliable message:
/// senderId(4) + opcode(2) + flags(1) + payloadLen(4).
pub const BASE_HEADER_BYTES: usize = 11;

/// Envelope bytes of a reliable message: the base header plus
/// seqNo(8) + tracked(1) + attempt(2).
pub const RELIABLE_HEADER_BYTES: usize = BASE_HEADER_BYTES + 11;

/// Bytes reserved for the envelope when packing rays into a datagram.
/// Ray packets may be sent reliably, so the reliable header is assumed.
pub const RAY_PACKET_HEADER_BYTES: usize = RELIABLE_HEADER_BYTES;

/// One acknowledgement entry on the wire: seqNo(8) + tracked(1) + attempt(2).
pub const ACK_ENTRY_BYTES: usize = 11;

/// How often a Connected peer is pinged. Must stay below any peer
/// idle-timeout in the deployment.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(2);

/// Retransmit deadline for reliable ray packets. Chosen to exceed the P99
/// RTT between workers; the ack timer fires every ~10ms, well inside this.
pub const PACKET_TIMEOUT: Duration = Duration::from_millis(500);

/// Upper bound on rays traced per ray-queue invocation, so a full queue
/// cannot starve the network handlers.
pub const MAX_RAY_BATCH: usize = 20_000;

/// Under the Discard policy, finished rays are dropped only once this many
/// have accumulated, to avoid per-ray overhead. Tunable from the CLI.
pub const DEFAULT_DISCARD_THRESHOLD: usize = 5_000;

/// Default bounce budget for freshly generated camera rays.
pub const DEFAULT_MAX_DEPTH: u32 = 5;

/// Payload size of the benchmark-mode Ping flood.
pub const BENCHMARK_PING_BYTES: usize = 1_300;
