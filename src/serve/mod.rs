//! # The trick-play server
//!
//! `tsserve`'s core: a TCP accept loop where every client gets a worker
//! task owning its own file readers, reverse indexes and TS writer. The
//! client both receives TS and sends single-byte commands in-line:
//!
//! `n` normal, `p` pause, `f`/`F` fast forward, `r`/`R` reverse,
//! `>`/`<` skip ±10 s, `]`/`[` skip ±3 min, `0`..`9` file select,
//! `q` quit.

/// The command slot and control-channel reader
pub mod command;

/// The trick-play state machine
pub mod orchestrator;

/// The TCP accept loop
pub mod server;

/// PES→TS packetisation, the ring buffer and its drainer
pub mod writer;

pub use command::{read_commands, CommandState};
pub use orchestrator::Worker;
pub use server::serve;
pub use writer::{spawn_drainer, TsWriter, WriterConfig};

use crate::codec::VideoType;
use std::path::PathBuf;
use std::time::Duration;

/// Dolby (AC-3) announcement convention for the synthesised PMT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DolbyMode {
    /// DVB: private-data stream type with an AC-3 descriptor (0x6A)
    Dvb,
    /// ATSC: stream type 0x81 with descriptor 0x81
    Atsc,
}

/// Everything the server and its workers are configured by.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    /// TCP port to listen on
    pub port: u16,
    /// File slots 0..=9 selected by the digit commands
    pub files: Vec<Option<PathBuf>>,
    /// Null TS packets written before the first data
    pub pad_packets: u32,
    /// Output packets between PAT/PMT re-emissions during normal play
    pub program_repeat: u32,
    /// Fast-forward keep frequency
    pub ffreq: u32,
    /// Reverse keep frequency
    pub rfreq: u32,
    /// PES padding packets per real packet (load testing)
    pub pes_padding: u32,
    /// Drop the last `d` of every `k + d` packets (loss testing)
    pub drop: Option<(u32, u32)>,
    /// Emit sequence headers with reversed/filtered H.262 pictures
    pub with_seq_headers: bool,
    /// Serve video only
    pub noaudio: bool,
    /// Mirror input TS packets verbatim instead of re-packetising
    pub tsdirect: bool,
    /// Pin the video encoding instead of sniffing it
    pub forced_video_type: Option<VideoType>,
    /// AC-3 announcement convention, when the audio is Dolby
    pub dolby: Option<DolbyMode>,
    /// Sleep between output bursts; `None` drains as fast as the
    /// socket accepts
    pub pace: Option<Duration>,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            port: 88,
            files: vec![None; 10],
            pad_packets: 0,
            program_repeat: 100,
            ffreq: 8,
            rfreq: 8,
            pes_padding: 0,
            drop: None,
            with_seq_headers: true,
            noaudio: false,
            tsdirect: false,
            forced_video_type: None,
            dolby: None,
            pace: None,
        }
    }
}

impl ServeConfig {
    /// The first populated file slot, which every client starts on.
    pub fn first_file(&self) -> Option<usize> {
        self.files.iter().position(|f| f.is_some())
    }
}
