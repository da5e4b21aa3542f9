// src/drivers/mod.rs
pub mod buffer;
pub mod dirac;
pub mod error;
pub mod framing;
pub mod link;
pub mod record;
pub mod simulator;
pub use buffer::{gradient, ChannelBuffer, ChannelBuffers, SweepSnapshot};
pub use dirac::{dirac_voltage, DiracPoint, DiracTracker};
pub use error::{AcquisitionError, MalformedRecord};
pub use framing::LineAssembler;
pub use link::{
    list_ports, CancelToken, Connector, DeviceLink, LineRead, PortSummary, ScriptLog,
    ScriptedConnector, ScriptedLink, SerialConnector, SerialLink,
};
pub use record::{classify_line, DeviceLine, RecordSchema, SweepRecord, DONE_SENTINEL, N_CHANNELS};
pub use simulator::{SimulatedConnector, SimulatedLink};
