//! # Container format support
//!
//! The server's two input formats (Program Stream and Transport
//! Stream) both reduce to the same thing here: an ordered sequence of
//! PES packets ([`pes::PesSource`]), over which the elementary-stream
//! reader frames start-code items for picture classification.

/// PES packets, the PES-source seam, and the elementary-stream reader
pub mod pes;

/// Program Stream reading (pack headers, PES within packs)
pub mod ps;

/// Transport Stream reading and shared TS types
pub mod ts;

pub use pes::{EsItem, EsPosition, EsReader, PesKind, PesPacket, PesSource};
pub use ps::PsPesSource;
pub use ts::TsPesSource;
