use std::io;

use thiserror::Error;

use treelet_shared::{CodecError, WireError};

use crate::scene::SceneError;
use crate::storage::StorageError;

/// Fatal conditions that terminate the worker. Recoverable transport
/// conditions (loss, duplication, reordering) never surface here; they are
/// absorbed by the reliability layer.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("udp socket error: {0}")]
    Udp(#[source] io::Error),

    #[error("poll error: {0}")]
    Poll(#[source] io::Error),

    #[error("coordinator connection error: {0}")]
    Coordinator(#[source] io::Error),

    #[error("coordinator closed the control channel")]
    CoordinatorClosed,

    #[error("wire codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("malformed payload: {0}")]
    Payload(#[from] WireError),

    #[error("malformed control payload: {0}")]
    Control(#[from] serde_json::Error),

    #[error("scene error: {0}")]
    Scene(#[from] SceneError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("ray in ray queue with empty traversal stack and no hit")]
    InvalidRayState,

    #[error("received {opcode:#06x}, which only travels upstream")]
    UnexpectedOpcode { opcode: u16 },

    #[error("peer announcement carried unusable address {address:?}")]
    InvalidPeerAddress { address: String },

    #[error("ray work arrived before the scene was loaded")]
    SceneNotLoaded,

    #[error("benchmark destination {id} is not a known peer")]
    UnknownBenchmarkPeer { id: u32 },
}
