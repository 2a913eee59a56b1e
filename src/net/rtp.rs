//! Best-effort RTP recognition over UDP payloads.
//!
//! The analyser treats RTP as optional wrapping: if the payload parses
//! as RTP version 2 with a payload type we expect (33/MP2T, or one the
//! caller configured as "raw"), the header is stripped and its timing
//! fields are surfaced. Anything else is handed on untouched.

use crate::utils::{get_u16_be, get_u32_be};

/// RTP payload type for MPEG-2 transport stream (RFC 3551).
pub const PAYLOAD_TYPE_MP2T: u8 = 33;

/// Timing fields recovered from a recognised RTP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpInfo {
    /// Payload type identifier
    pub payload_type: u8,
    /// 16-bit sequence number
    pub sequence: u16,
    /// Media timestamp (90 kHz for MP2T)
    pub timestamp: u32,
    /// Synchronisation source
    pub ssrc: u32,
    /// Marker bit
    pub marker: bool,
}

/// Attempts to strip an RTP header from a UDP payload.
///
/// Returns `None` when the payload is not RTP by our rules: wrong
/// version, unexpected payload type, truncated header, or an MP2T
/// payload that does not start with the 0x47 sync byte.
pub fn strip_rtp(data: &[u8], raw_payload_type: Option<u8>) -> Option<(RtpInfo, &[u8])> {
    if data.len() < 12 {
        return None;
    }
    let version = data[0] >> 6;
    if version != 2 {
        return None;
    }

    let padding = (data[0] & 0x20) != 0;
    let extension = (data[0] & 0x10) != 0;
    let csrc_count = (data[0] & 0x0F) as usize;
    let marker = (data[1] & 0x80) != 0;
    let payload_type = data[1] & 0x7F;

    let is_raw = raw_payload_type == Some(payload_type);
    if payload_type != PAYLOAD_TYPE_MP2T && !is_raw {
        return None;
    }

    let mut offset = 12 + csrc_count * 4;
    if data.len() < offset {
        return None;
    }

    if extension {
        if data.len() < offset + 4 {
            return None;
        }
        let ext_words = get_u16_be(&data[offset + 2..]) as usize;
        offset += 4 + ext_words * 4;
        if data.len() < offset {
            return None;
        }
    }

    let mut end = data.len();
    if padding {
        let pad = data[end - 1] as usize;
        if pad == 0 || pad > end - offset {
            return None;
        }
        end -= pad;
    }

    let payload = &data[offset..end];
    if payload_type == PAYLOAD_TYPE_MP2T && !is_raw {
        // MP2T payloads lead with a TS sync byte or it is not RTP
        if payload.first() != Some(&0x47) {
            return None;
        }
    }

    Some((
        RtpInfo {
            payload_type,
            sequence: get_u16_be(&data[2..]),
            timestamp: get_u32_be(&data[4..]),
            ssrc: get_u32_be(&data[8..]),
            marker,
        },
        payload,
    ))
}
