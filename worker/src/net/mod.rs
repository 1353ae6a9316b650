pub mod endpoint;
pub mod pacer;
pub mod packet;
pub mod reliability;

pub use endpoint::PacedEndpoint;
pub use pacer::Pacer;
pub use packet::{RayPacket, ServicePacket};
pub use reliability::Reliability;
