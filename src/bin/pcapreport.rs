//! `pcapreport`: recover TS streams from captured UDP traffic and
//! analyse each stream's PCR clock.

use chrono::DateTime;
use clap::Parser;
use std::fs::File;
use std::io::BufReader;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tskit::analysis::{PcrAnalyser, StreamTable};
use tskit::net::Dissector;
use tskit::pcap::{CaptureReader, LINK_TYPE_ETHERNET};

#[derive(Parser, Debug)]
#[command(
    name = "pcapreport",
    about = "Report on TS streams captured in a PCAP/PCAP-NG file"
)]
struct Args {
    /// Capture file (classic pcap or pcap-ng)
    file: PathBuf,

    /// Write one CSV of PCR rows per stream
    #[arg(long)]
    csv: bool,

    /// Trust this destination as TS regardless of alignment scoring
    #[arg(long, value_name = "IP:PORT", value_parser = parse_filter)]
    filter: Option<(Ipv4Addr, u16)>,

    /// Section-split threshold in seconds
    #[arg(long, default_value_t = 6, value_name = "SECS")]
    threshold: u64,

    /// RTP payload type to pass through as raw data
    #[arg(long, value_name = "PT")]
    rtp: Option<u8>,

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

fn parse_filter(s: &str) -> Result<(Ipv4Addr, u16), String> {
    let (ip, port) = s
        .split_once(':')
        .ok_or_else(|| format!("expected IP:PORT, got {}", s))?;
    Ok((
        ip.parse().map_err(|e| format!("bad IP {}: {}", ip, e))?,
        port.parse().map_err(|e| format!("bad port {}: {}", port, e))?,
    ))
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

/// 90 kHz ticks since the epoch, as a wall-clock string.
fn capture_time(ticks: u64) -> String {
    let secs = (ticks / 90_000) as i64;
    let millis = (ticks % 90_000) / 90;
    match DateTime::from_timestamp(secs, 0) {
        Some(t) => format!("{}.{:03}", t.format("%Y-%m-%d %H:%M:%S"), millis),
        None => format!("{}+{}ms", secs, millis),
    }
}

fn run(args: &Args) -> tskit::Result<()> {
    let file = BufReader::new(File::open(&args.file)?);
    let mut reader = CaptureReader::open(file)?;
    let mut dissector = Dissector::new();
    dissector.rtp_raw_payload_type = args.rtp;
    let mut streams = StreamTable::new();

    let threshold = args.threshold * 90_000;
    let trusted = args.filter;
    let csv = args.csv;

    let mut packet_no = 0u64;
    while let Some(pkt) = reader.next_packet()? {
        packet_no += 1;
        if pkt.link_type != LINK_TYPE_ETHERNET {
            log::debug!("packet {}: link type {}, skipping", packet_no, pkt.link_type);
            continue;
        }
        let dg = match dissector.dissect(&pkt.data) {
            Ok(Some(dg)) => dg,
            Ok(None) => continue,
            Err(e) if e.is_per_packet() => {
                log::debug!("packet {}: {}", packet_no, e);
                continue;
            }
            Err(e) => return Err(e),
        };

        let rtp = dg.rtp;
        let timestamp = pkt.timestamp;
        let stream = streams.get_or_create(&dg, |dg| {
            let trust = trusted == Some((dg.dst_ip, dg.dst_port));
            let mut analyser = PcrAnalyser::new(threshold, trust);
            if csv {
                let name = format!("pcr_{}_{}.csv", dg.dst_ip, dg.dst_port);
                match File::create(&name) {
                    Ok(f) => {
                        if let Err(e) = analyser.set_csv_sink(Box::new(f)) {
                            log::warn!("cannot start CSV {}: {}", name, e);
                        }
                    }
                    Err(e) => log::warn!("cannot create CSV {}: {}", name, e),
                }
            }
            analyser
        });
        stream.packets += 1;
        stream.bytes += dg.payload.len() as u64;
        let stream_no = stream.stream_no;
        if let Err(e) = stream
            .analyser
            .add_payload(stream_no, timestamp, &dg.payload, rtp)
        {
            log::info!(
                "stream {} packet {} ({}): {}",
                stream_no,
                packet_no,
                capture_time(timestamp),
                e
            );
        }
    }

    report(&streams);
    Ok(())
}

fn report(streams: &StreamTable) {
    println!("Found {} stream(s)", streams.len());
    for stream in streams.streams() {
        let a = &stream.analyser;
        println!();
        println!(
            "Stream {}: {}  (vlans {:?})",
            stream.stream_no,
            stream.name(),
            stream.vlans.iter().map(|v| v.vid).collect::<Vec<_>>()
        );
        println!(
            "  {} packets, {} bytes; payloads good {} / dodgy {} / bad {}",
            stream.packets, stream.bytes, a.seen_good, a.seen_dodgy, a.seen_bad
        );
        for (i, section) in a.sections().iter().enumerate() {
            let pcr_span = section.pcr_duration() as f64 / 90_000.0;
            println!(
                "  section {}: packets {}..{}, {:.1}s of PCR, capture {} .. {}",
                i,
                section.first_packet,
                section.last_packet,
                pcr_span,
                capture_time(section.first_capture),
                capture_time(section.last_capture),
            );
            println!(
                "    skew {}..{} (90kHz), max jitter {}, drift {}",
                section.min_skew,
                section.max_skew,
                section.max_jitter,
                section.drift_desc(),
            );
            if section.rtp_skew_min != 0 || section.rtp_skew_max != 0 {
                println!(
                    "    rtp skew {}..{} (90kHz)",
                    section.rtp_skew_min, section.rtp_skew_max
                );
            }
        }
    }
}

fn main() {
    let args = Args::parse();
    init_logging(&args);
    if let Err(e) = run(&args) {
        log::error!("fatal: {}", e);
        std::process::exit(1);
    }
}
