#![doc(html_root_url = "https://docs.rs/tskit/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]

//! # tskit - MPEG Transport/Program Stream toolkit
//!
//! `tskit` is a toolkit for dissecting and serving MPEG-2 Transport
//! Stream (TS) and Program Stream (PS) video. It has two faces:
//!
//! - **Serving** (`tsserve`): a trick-play streaming server. A PS or TS
//!   file is played out as TS over TCP while the client steers with
//!   single-byte commands: pause, N× fast forward, N× reverse, ±10 s
//!   and ±3 min jumps, and file selection, all without breaking the
//!   outgoing stream. Reverse play is driven by a reverse index built
//!   as a side effect of forward play.
//! - **Analysis** (`pcapreport`): recovers TS streams from captured UDP
//!   traffic in PCAP/PCAP-NG files and analyses each stream's PCR
//!   clock: skew, jitter and drift per section, with CSV output.
//!
//! ## Serving example
//!
//! ```rust,no_run
//! use tskit::serve::{serve, ServeConfig};
//!
//! #[tokio::main]
//! async fn main() -> tskit::Result<()> {
//!     let mut config = ServeConfig::default();
//!     config.files[0] = Some("movie.mpg".into());
//!     config.port = 8888;
//!     serve(config).await
//! }
//! ```
//!
//! ## Analysis example
//!
//! ```rust,no_run
//! use std::fs::File;
//! use std::io::BufReader;
//! use tskit::analysis::{PcrAnalyser, StreamTable};
//! use tskit::net::Dissector;
//! use tskit::pcap::CaptureReader;
//!
//! fn main() -> tskit::Result<()> {
//!     let file = BufReader::new(File::open("capture.pcap")?);
//!     let mut reader = CaptureReader::open(file)?;
//!     let mut dissector = Dissector::new();
//!     let mut streams = StreamTable::new();
//!     while let Some(pkt) = reader.next_packet()? {
//!         if let Ok(Some(dg)) = dissector.dissect(&pkt.data) {
//!             let rtp = dg.rtp;
//!             let stream = streams.get_or_create(&dg, |_| PcrAnalyser::default());
//!             let _ = stream
//!                 .analyser
//!                 .add_payload(stream.stream_no, pkt.timestamp, &dg.payload, rtp);
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! - `pcap`: classic pcap and pcap-ng reading
//! - `net`: Ethernet/VLAN, IPv4 (with fragment reassembly), UDP, RTP
//! - `analysis`: stream table, TS validity scoring, PCR skew/jitter/drift
//! - `format`: PS and TS input, PES packets, the elementary-stream reader
//! - `codec`: picture classification (H.262 / H.264 framers)
//! - `index`: the reverse index behind reverse play
//! - `filter`: picture selection for the fast-forward modes
//! - `serve`: the trick-play server (writer, command channel, state
//!   machine, TCP lifecycle)
//! - `error`: the central error type
//! - `utils`: endian readers, bit reader, MPEG CRC32

/// Captured-stream analysis (stream table, PCR clock analysis)
pub mod analysis;

/// Picture classification for H.262 and H.264
pub mod codec;

/// Error types and utilities
pub mod error;

/// Picture selection for fast forward
pub mod filter;

/// Container format support (PS, TS, PES)
pub mod format;

/// The reverse index behind reverse play
pub mod index;

/// Packet dissection (Ethernet, IPv4, UDP, RTP)
pub mod net;

/// PCAP and PCAP-NG capture reading
pub mod pcap;

/// The trick-play streaming server
pub mod serve;

/// Common utilities and helper functions
pub mod utils;

pub use error::{Result, TsKitError};
