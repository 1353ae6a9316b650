// Stable wire identifiers for every message the cluster exchanges

use thiserror::Error;

/// Errors raised while decoding an opcode off the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OpCodeError {
    /// The peer sent an opcode this build does not know about
    #[error("unknown opcode {value:#06x}")]
    Unknown { value: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum OpCode {
    // Mutual introduction on the coordinator channel
    Hey = 0x0001,
    // Keep-alive (and benchmark traffic); no reply required from workers
    Ping = 0x0002,
    Pong = 0x0003,
    // Coordinator tells the worker which scene objects to fetch
    GetObjects = 0x0004,
    // Coordinator assigns a crop window to generate camera rays for
    GenerateRays = 0x0005,
    // Coordinator announces a peer (or several) to connect to
    ConnectTo = 0x0006,
    MultipleConnect = 0x0007,
    // Two-path symmetric handshake
    ConnectionRequest = 0x0008,
    ConnectionResponse = 0x0009,
    // A packed batch of serialized rays bound for one treelet
    SendRays = 0x000a,
    // Batched acknowledgements for reliable ray packets
    Ack = 0x000b,
    // Completed path ids, pushed to the coordinator
    FinishedPaths = 0x000c,
    // Finished-ray contributions, pushed to the coordinator
    FinishedRays = 0x000d,
    // Ask the coordinator for a worker that holds a treelet
    GetWorker = 0x000e,
    // Periodic worker statistics
    WorkerStats = 0x000f,
    // Switch the worker into traffic-generator mode
    StartBenchmark = 0x0010,
    // Orderly shutdown
    Bye = 0x0011,
}

impl OpCode {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(value: u16) -> Result<Self, OpCodeError> {
        match value {
            0x0001 => Ok(OpCode::Hey),
            0x0002 => Ok(OpCode::Ping),
            0x0003 => Ok(OpCode::Pong),
            0x0004 => Ok(OpCode::GetObjects),
            0x0005 => Ok(OpCode::GenerateRays),
            0x0006 => Ok(OpCode::ConnectTo),
            0x0007 => Ok(OpCode::MultipleConnect),
            0x0008 => Ok(OpCode::ConnectionRequest),
            0x0009 => Ok(OpCode::ConnectionResponse),
            0x000a => Ok(OpCode::SendRays),
            0x000b => Ok(OpCode::Ack),
            0x000c => Ok(OpCode::FinishedPaths),
            0x000d => Ok(OpCode::FinishedRays),
            0x000e => Ok(OpCode::GetWorker),
            0x000f => Ok(OpCode::WorkerStats),
            0x0010 => Ok(OpCode::StartBenchmark),
            0x0011 => Ok(OpCode::Bye),
            value => Err(OpCodeError::Unknown { value }),
        }
    }
}

#[cfg(test)]
mod opcode_tests {
    use super::OpCode;

    #[test]
    fn round_trips_every_opcode() {
        for value in 0x0001..=0x0011u16 {
            let opcode = OpCode::from_u16(value).expect("known opcode");
            assert_eq!(opcode.to_u16(), value);
        }
    }

    #[test]
    fn rejects_unknown_values() {
        assert!(OpCode::from_u16(0).is_err());
        assert!(OpCode::from_u16(0x0012).is_err());
        assert!(OpCode::from_u16(u16::MAX).is_err());
    }
}
