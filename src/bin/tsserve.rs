//! `tsserve`: serve a PS or TS file as a transport stream over TCP,
//! with trick-play steered by in-line command bytes from the client.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tskit::codec::VideoType;
use tskit::serve::{serve, DolbyMode, ServeConfig};

#[derive(Parser, Debug)]
#[command(
    name = "tsserve",
    about = "Trick-play transport stream server",
    long_about = "Serves PS/TS files as MPEG transport stream over TCP. The client\n\
                  sends single-byte commands in-line: n p f F r R > < ] [ 0-9 q."
)]
struct Args {
    /// Port to listen on
    #[arg(long, default_value_t = 88)]
    port: u16,

    /// File for selection 0 (also the file served on connect)
    #[arg(short = '0', value_name = "FILE")]
    file0: Option<PathBuf>,
    /// File for selection 1
    #[arg(short = '1', value_name = "FILE")]
    file1: Option<PathBuf>,
    /// File for selection 2
    #[arg(short = '2', value_name = "FILE")]
    file2: Option<PathBuf>,
    /// File for selection 3
    #[arg(short = '3', value_name = "FILE")]
    file3: Option<PathBuf>,
    /// File for selection 4
    #[arg(short = '4', value_name = "FILE")]
    file4: Option<PathBuf>,
    /// File for selection 5
    #[arg(short = '5', value_name = "FILE")]
    file5: Option<PathBuf>,
    /// File for selection 6
    #[arg(short = '6', value_name = "FILE")]
    file6: Option<PathBuf>,
    /// File for selection 7
    #[arg(short = '7', value_name = "FILE")]
    file7: Option<PathBuf>,
    /// File for selection 8
    #[arg(short = '8', value_name = "FILE")]
    file8: Option<PathBuf>,
    /// File for selection 9
    #[arg(short = '9', value_name = "FILE")]
    file9: Option<PathBuf>,

    /// Leading null TS packets before the first data
    #[arg(long, default_value_t = 0, value_name = "N")]
    pad: u32,

    /// Output packets between PAT/PMT repetitions
    #[arg(long, default_value_t = 100, value_name = "N")]
    prepeat: u32,

    /// Fast-forward keep frequency
    #[arg(long, default_value_t = 8, value_name = "N")]
    ffreq: u32,

    /// Reverse keep frequency
    #[arg(long, default_value_t = 8, value_name = "N")]
    rfreq: u32,

    /// PES padding packets per real packet (load testing)
    #[arg(long, default_value_t = 0, value_name = "N")]
    pes_padding: u32,

    /// Keep K then drop D of every K+D TS packets (loss testing)
    #[arg(long, num_args = 2, value_names = ["K", "D"])]
    drop: Option<Vec<u32>>,

    /// Do not emit sequence headers with reversed/filtered pictures
    #[arg(long)]
    noseqhdr: bool,

    /// Serve video only
    #[arg(long)]
    noaudio: bool,

    /// Mirror input TS packets verbatim instead of re-packetising
    #[arg(long)]
    tsdirect: bool,

    /// Force H.262 video instead of sniffing
    #[arg(long, conflicts_with = "avc")]
    h262: bool,

    /// Force H.264/AVC video instead of sniffing
    #[arg(long)]
    avc: bool,

    /// AC-3 announcement convention for the PMT
    #[arg(long, value_parser = parse_dolby, value_name = "dvb|atsc")]
    dolby: Option<DolbyMode>,

    /// Milliseconds to sleep between output bursts (default: none)
    #[arg(long, value_name = "MS")]
    pace: Option<u64>,

    /// Where diagnostics go
    #[arg(long, default_value = "stdout", value_parser = ["stdout", "stderr"])]
    err: String,

    /// More logging
    #[arg(long, short)]
    verbose: bool,

    /// Errors only
    #[arg(long, short)]
    quiet: bool,
}

fn parse_dolby(s: &str) -> Result<DolbyMode, String> {
    match s {
        "dvb" => Ok(DolbyMode::Dvb),
        "atsc" => Ok(DolbyMode::Atsc),
        other => Err(format!("expected dvb or atsc, got {}", other)),
    }
}

fn init_logging(args: &Args) {
    let level = if args.quiet {
        log::LevelFilter::Error
    } else if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    let target = if args.err == "stderr" {
        env_logger::Target::Stderr
    } else {
        env_logger::Target::Stdout
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .target(target)
        .init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args);

    let files = vec![
        args.file0.clone(),
        args.file1.clone(),
        args.file2.clone(),
        args.file3.clone(),
        args.file4.clone(),
        args.file5.clone(),
        args.file6.clone(),
        args.file7.clone(),
        args.file8.clone(),
        args.file9.clone(),
    ];
    if files.iter().all(|f| f.is_none()) {
        eprintln!("tsserve: at least one input file (-0 .. -9) is required");
        std::process::exit(1);
    }

    let config = ServeConfig {
        port: args.port,
        files,
        pad_packets: args.pad,
        program_repeat: args.prepeat,
        ffreq: args.ffreq,
        rfreq: args.rfreq,
        pes_padding: args.pes_padding,
        drop: args.drop.as_ref().map(|v| (v[0], v[1])),
        with_seq_headers: !args.noseqhdr,
        noaudio: args.noaudio,
        tsdirect: args.tsdirect,
        forced_video_type: if args.h262 {
            Some(VideoType::H262)
        } else if args.avc {
            Some(VideoType::H264)
        } else {
            None
        },
        dolby: args.dolby,
        pace: args.pace.map(Duration::from_millis),
    };

    if let Err(e) = serve(config).await {
        log::error!("fatal: {}", e);
        std::process::exit(1);
    }
}
