pub mod job;
pub mod message;
pub mod ports;
pub mod protocol;
pub mod subjects;

pub use job::*;
pub use message::*;
pub use ports::*;
pub use protocol::*;
pub use subjects::*;
pub use vessel_errors::{VesselError, VesselResult};
