//! MPEG Transport Stream support: packet/PSI types shared by the
//! analyser and the server, the low-level packet parser, and the TS
//! input reader for the serving side.

/// TS input for the server (PID demux, PES reassembly, PCR)
pub mod reader;

/// TS packet, adaptation field and PAT/PMT parsing
pub mod parser;

/// Packet and PSI table types plus on-wire constants
pub mod types;

pub use parser::TsPacketParser;
pub use reader::TsPesSource;
pub use types::*;
