use std::net::SocketAddr;

use treelet_shared::{Attempt, Message, RayState, SeqNo, TreeletId, WorkerId};

/// A non-ray datagram: handshake, keep-alive, or ack. Service packets are
/// never reliable and always outrank ray packets on their endpoint.
pub struct ServicePacket {
    pub destination: SocketAddr,
    pub destination_id: WorkerId,
    pub data: Vec<u8>,
    pub iface: usize,
    pub is_ack: bool,
    pub ack_id: SeqNo,
    pub tracked: bool,
}

impl ServicePacket {
    pub fn new(
        destination: SocketAddr,
        destination_id: WorkerId,
        data: Vec<u8>,
        iface: usize,
    ) -> Self {
        Self {
            destination,
            destination_id,
            data,
            iface,
            is_ack: false,
            ack_id: 0,
            tracked: false,
        }
    }

    pub fn ack(
        destination: SocketAddr,
        destination_id: WorkerId,
        data: Vec<u8>,
        ack_id: SeqNo,
        tracked: bool,
    ) -> Self {
        Self {
            destination,
            destination_id,
            data,
            iface: 0,
            is_ack: true,
            ack_id,
            tracked,
        }
    }
}

/// An MTU-bounded batch of serialized rays bound for one treelet on one
/// peer. The framed message is retained so a reliable packet can be put
/// back on the wire unchanged (apart from its attempt counter) after an
/// ack timeout.
pub struct RayPacket {
    pub destination: SocketAddr,
    pub destination_id: WorkerId,
    pub target_treelet: TreeletId,
    pub ray_count: usize,
    pub message: Message,
    pub retransmission: bool,
    /// Rays sampled into the trace log ride along so their post-send tick
    /// can be incremented and logged; they are dropped after the send.
    pub tracked_rays: Vec<RayState>,
}

impl RayPacket {
    pub fn seq_no(&self) -> SeqNo {
        self.message.seq_no
    }

    pub fn attempt(&self) -> Attempt {
        self.message.attempt
    }

    pub fn reliable(&self) -> bool {
        self.message.reliable
    }

    pub fn tracked(&self) -> bool {
        self.message.tracked
    }

    pub fn wire_len(&self) -> usize {
        self.message.wire_len()
    }
}
