//! # Error Types
//!
//! Central error type for the tskit library. Every layer, from PCAP reading
//! and packet dissection to TS/PS parsing, the reverse index and the
//! serving core, reports through [`TsKitError`].
//!
//! Most per-packet failures are non-fatal by policy: callers log them and
//! skip the offending packet. [`TsKitError::CommandInterrupt`] is not a
//! failure at all; it is the sentinel long-running emitters unwind with
//! when a new command byte arrives.

use thiserror::Error;

/// Primary error type for the tskit library
#[derive(Error, Debug)]
pub enum TsKitError {
    /// I/O errors that occur during file or network operations
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Capture data shorter than the structure being read
    #[error("packet too short: {0}")]
    PacketTooShort(String),

    /// Unrecognised capture file magic number
    #[error("bad magic number 0x{0:08x}")]
    BadMagic(u32),

    /// Block or record length outside sane bounds
    #[error("bad length {got} for {what}")]
    BadLength {
        /// What was being read when the length failed validation
        what: &'static str,
        /// The offending length value
        got: u64,
    },

    /// Enhanced Packet Block naming an interface that was never described
    #[error("packet references unknown interface id {0}")]
    BadInterfaceId(u32),

    /// More stacked VLAN tags than the dissector supports
    #[error("more than {0} stacked VLAN tags")]
    TooManyVlans(usize),

    /// Terminal EtherType was not IPv4
    #[error("not an IPv4 packet (ethertype 0x{0:04x})")]
    NotIpv4(u16),

    /// IP protocol was not UDP
    #[error("not a UDP datagram (protocol {0})")]
    NotUdp(u8),

    /// Reassembled IP datagram would exceed the 64 KiB cap
    #[error("IP fragment reassembly overran 64KiB (ident {0})")]
    FragmentOverrun(u16),

    /// IP fragments arrived out of order
    #[error("IP fragment out of order (ident {ident}, offset {offset})")]
    FragmentReorder {
        /// Datagram identifier being reassembled
        ident: u16,
        /// Fragment offset that broke the in-order requirement
        offset: u16,
    },

    /// Payload length not a multiple of 188
    #[error("payload of {0} bytes is not 188-aligned")]
    MisalignedTs(usize),

    /// Expected 0x47 sync byte missing
    #[error("no 0x47 sync byte at offset {0}")]
    NoSyncByte(usize),

    /// A second PCR-bearing PID appeared in a stream assumed to have one
    #[error("stream has multiple PCR PIDs (first {first:#06x}, now {second:#06x})")]
    MultiplePcrPids {
        /// PID the stream's PCR tracking locked onto
        first: u16,
        /// The alien PID that also carried a PCR
        second: u16,
    },

    /// Re-traversal of the reverse index disagreed with what was recorded
    #[error("reverse index mismatch at entry {0}")]
    ReverseIndexMismatch(usize),

    /// Re-reading a picture for reverse play failed
    #[error("picture read failed: {0}")]
    PictureRead(String),

    /// Seeking the input for reverse play failed
    #[error("seek failed: {0}")]
    SeekFailed(String),

    /// The writer's output side has gone away
    #[error("writer closed")]
    WriterClosed,

    /// The client hung up; by policy not treated as a failure
    #[error("client disconnected")]
    ClientDisconnected,

    /// Sentinel: a new command byte arrived and the emitter unwound.
    /// Not an error; filtered out before anything is reported.
    #[error("interrupted by new command")]
    CommandInterrupt,

    /// Errors that occur during parsing of the various formats
    #[error("parser error: {0}")]
    Parser(String),

    /// Errors for invalid or malformed input data
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl TsKitError {
    /// True for the command-interrupt sentinel, which emitters use to
    /// unwind without reporting a failure.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, TsKitError::CommandInterrupt)
    }

    /// True when the policy for this error is log-and-skip rather than
    /// abandoning the stream.
    pub fn is_per_packet(&self) -> bool {
        matches!(
            self,
            TsKitError::PacketTooShort(_)
                | TsKitError::TooManyVlans(_)
                | TsKitError::NotIpv4(_)
                | TsKitError::NotUdp(_)
                | TsKitError::FragmentOverrun(_)
                | TsKitError::FragmentReorder { .. }
                | TsKitError::MisalignedTs(_)
                | TsKitError::NoSyncByte(_)
        )
    }
}

/// A specialized Result type for tskit operations.
pub type Result<T> = std::result::Result<T, TsKitError>;
