//! # Captured-stream analysis
//!
//! The pcapreport side of the crate: a content-addressed stream table
//! over dissected UDP datagrams, per-stream TS validity scoring, and the
//! PCR skew/jitter/drift analyser with optional CSV output.
//!
//! All clocks here are 90 kHz. PCRs arrive from the transport layer in
//! 27 MHz units and are reduced on entry.

/// Sliding-window jitter measurement
pub mod jitter;

/// Per-stream PCR clock analysis
pub mod pcr;

/// Stream table keyed by (VLAN path, destination IP, destination port)
pub mod streams;

pub use jitter::{JitterWindow, DEFAULT_JITTER_RANGE, MAX_JITTER_SAMPLES};
pub use pcr::{PcrAnalyser, StreamSection, DEFAULT_DISCONTINUITY_THRESHOLD};
pub use streams::{Stream, StreamTable};
