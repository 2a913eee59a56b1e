//! H.264 picture framing over Annex-B NAL units.
//!
//! Non-VCL NALs (AUD, SPS, PPS, SEI) attach to the picture that follows
//! them; a VCL NAL completes the picture. Classification needs nothing
//! deeper than the NAL header byte: type 5 is an IDR, other slice types
//! are reference or non-reference by `nal_ref_idc`. Sequence-header
//! units do not exist for H.264: parameter sets ride inside the
//! picture unit and every IDR is its own recovery point.

use super::{Picture, PictureKind};
use crate::error::Result;
use crate::format::pes::EsReader;
use bytes::{Bytes, BytesMut};

const NAL_SLICE: u8 = 1;
const NAL_SLICE_IDR: u8 = 5;

fn nal_type(start_code: u8) -> u8 {
    start_code & 0x1F
}

fn nal_ref_idc(start_code: u8) -> u8 {
    (start_code >> 5) & 0x03
}

fn is_vcl(start_code: u8) -> bool {
    (NAL_SLICE..=NAL_SLICE_IDR).contains(&nal_type(start_code))
}

/// Frames the next H.264 picture.
pub(crate) async fn next_picture(es: &mut EsReader, index: u64) -> Result<Option<Picture>> {
    let first = match es.next_item().await? {
        Some(item) => item,
        None => return Ok(None),
    };

    let start = first.start;
    let mut data = BytesMut::from(&first.data[..]);
    let mut kind = classify(first.start_code);

    while kind.is_none() {
        let item = match es.next_item().await? {
            Some(item) => item,
            None => break,
        };
        kind = classify(item.start_code);
        data.extend_from_slice(&item.data);
    }

    // A run of non-VCL NALs at EOF still frames (as a non-reference
    // unit) so the caller sees the bytes drained
    let kind = kind.unwrap_or(PictureKind::NonRef);
    let data: Bytes = data.freeze();
    Ok(Some(Picture {
        kind,
        start,
        byte_len: data.len() as u32,
        afd: None,
        data,
        index,
    }))
}

fn classify(start_code: u8) -> Option<PictureKind> {
    if !is_vcl(start_code) {
        return None;
    }
    if nal_type(start_code) == NAL_SLICE_IDR {
        Some(PictureKind::Idr)
    } else if nal_ref_idc(start_code) > 0 {
        Some(PictureKind::NonIdrRef)
    } else {
        Some(PictureKind::NonRef)
    }
}
