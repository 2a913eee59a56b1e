//! H.262 (MPEG-2 video) picture framing.
//!
//! A *picture unit* is the picture start code item plus every slice,
//! extension and user-data item up to the next picture, GOP or sequence
//! header. A GOP header is folded into the picture that follows it. A
//! sequence header forms its own unit (with its trailing extensions and
//! user data) so reverse play can re-emit it before pictures.
//!
//! The only user data interpreted is the AFD record (`DTG1`), whose
//! active-format byte is captured per picture and re-synthesised when
//! reversed pictures are rebuilt.

use super::{Picture, PictureKind};
use crate::error::{Result, TsKitError};
use crate::format::pes::{EsItem, EsReader};
use crate::utils::BitReader;
use bytes::{Bytes, BytesMut};

const CODE_PICTURE: u8 = 0x00;
const CODE_USER_DATA: u8 = 0xB2;
const CODE_SEQUENCE_HEADER: u8 = 0xB3;
const CODE_EXTENSION: u8 = 0xB5;
const CODE_SEQUENCE_END: u8 = 0xB7;
const CODE_GROUP: u8 = 0xB8;

/// Frames the next H.262 unit.
pub(crate) async fn next_picture(es: &mut EsReader, index: u64) -> Result<Option<Picture>> {
    let first = match es.next_item().await? {
        Some(item) => item,
        None => return Ok(None),
    };

    if first.start_code == CODE_SEQUENCE_HEADER {
        return Ok(Some(sequence_header_unit(es, first, index).await?));
    }

    let start = first.start;
    let mut data = BytesMut::from(&first.data[..]);
    let mut kind = None;
    let mut afd = None;

    if first.start_code == CODE_PICTURE {
        kind = Some(coding_type(&first)?);
    }

    loop {
        let item = match es.next_item().await? {
            Some(item) => item,
            None => break,
        };
        match item.start_code {
            CODE_PICTURE if kind.is_some() => {
                es.push_back_item(item);
                break;
            }
            CODE_PICTURE => {
                // A GOP header opened this unit; the picture proper
                // starts here
                kind = Some(coding_type(&item)?);
                data.extend_from_slice(&item.data);
            }
            CODE_SEQUENCE_HEADER | CODE_GROUP => {
                es.push_back_item(item);
                break;
            }
            CODE_SEQUENCE_END => {
                data.extend_from_slice(&item.data);
                break;
            }
            CODE_USER_DATA => {
                if afd.is_none() {
                    afd = extract_afd(&item);
                }
                data.extend_from_slice(&item.data);
            }
            _ => {
                data.extend_from_slice(&item.data);
            }
        }
    }

    let kind = kind.unwrap_or(PictureKind::B);
    let data: Bytes = data.freeze();
    Ok(Some(Picture {
        kind,
        start,
        byte_len: data.len() as u32,
        afd,
        data,
        index,
    }))
}

async fn sequence_header_unit(
    es: &mut EsReader,
    first: EsItem,
    index: u64,
) -> Result<Picture> {
    let start = first.start;
    let mut data = BytesMut::from(&first.data[..]);
    loop {
        let item = match es.next_item().await? {
            Some(item) => item,
            None => break,
        };
        match item.start_code {
            CODE_EXTENSION | CODE_USER_DATA => data.extend_from_slice(&item.data),
            _ => {
                es.push_back_item(item);
                break;
            }
        }
    }
    let data: Bytes = data.freeze();
    Ok(Picture {
        kind: PictureKind::SequenceHeader,
        start,
        byte_len: data.len() as u32,
        afd: None,
        data,
        index,
    })
}

/// Reads picture_coding_type from a picture header item.
fn coding_type(item: &EsItem) -> Result<PictureKind> {
    let payload = item.payload();
    if payload.len() < 2 {
        return Err(TsKitError::Parser("picture header too short".into()));
    }
    // temporal_reference(10) then picture_coding_type(3)
    let mut reader = BitReader::new(payload);
    reader.skip_bits(10)?;
    match reader.read_bits(3)? {
        1 => Ok(PictureKind::I),
        2 => Ok(PictureKind::P),
        3 => Ok(PictureKind::B),
        other => Err(TsKitError::Parser(format!(
            "reserved picture_coding_type {}",
            other
        ))),
    }
}

/// Pulls the AFD byte out of a DTG1 user-data item, when present and
/// flagged active.
fn extract_afd(item: &EsItem) -> Option<u8> {
    let payload = item.payload();
    if payload.len() >= 6 && &payload[..4] == b"DTG1" && payload[4] & 0x40 != 0 {
        Some(payload[5])
    } else {
        None
    }
}

/// Rebuilds a reversed picture's bytes, making sure an AFD user-data
/// record carrying `afd` follows the picture header (and any extension
/// items attached to it). Pictures whose stored bytes already carry a
/// DTG1 record are returned untouched.
pub fn patch_afd(data: &[u8], afd: u8) -> Bytes {
    let items = scan_item_offsets(data);

    // Leave streams that kept their own AFD alone
    for &(offset, code) in &items {
        if code == CODE_USER_DATA
            && data.len() >= offset + 10
            && &data[offset + 4..offset + 8] == b"DTG1"
        {
            return Bytes::copy_from_slice(data);
        }
    }

    // Insert after the picture header and its trailing extensions
    let mut insert_at = data.len();
    let mut past_picture = false;
    for &(offset, code) in &items {
        if code == CODE_PICTURE {
            past_picture = true;
            insert_at = items
                .iter()
                .find(|(o, _)| *o > offset)
                .map(|(o, _)| *o)
                .unwrap_or(data.len());
            continue;
        }
        if past_picture {
            if code == CODE_EXTENSION {
                insert_at = items
                    .iter()
                    .find(|(o, _)| *o > offset)
                    .map(|(o, _)| *o)
                    .unwrap_or(data.len());
            } else {
                break;
            }
        }
    }

    let mut out = BytesMut::with_capacity(data.len() + 10);
    out.extend_from_slice(&data[..insert_at]);
    out.extend_from_slice(&[0x00, 0x00, 0x01, CODE_USER_DATA]);
    out.extend_from_slice(b"DTG1");
    out.extend_from_slice(&[0x41, afd]);
    out.extend_from_slice(&data[insert_at..]);
    out.freeze()
}

/// Offsets and codes of the `00 00 01 xx` items inside `data`.
fn scan_item_offsets(data: &[u8]) -> Vec<(usize, u8)> {
    let mut items = Vec::new();
    let mut i = 0;
    while i + 3 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            items.push((i, data[i + 3]));
            i += 4;
        } else {
            i += 1;
        }
    }
    items
}
