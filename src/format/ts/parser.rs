use super::types::*;
use crate::error::{Result, TsKitError};

/// Parser for MPEG Transport Stream packets.
///
/// Handles the fixed header, the adaptation field (PCR carrier), and the
/// PAT/PMT sections the demultiplexer needs to find its streams.
#[derive(Debug, Default)]
pub struct TsPacketParser {}

impl TsPacketParser {
    /// Creates a new TS packet parser.
    pub fn new() -> Self {
        Self {}
    }

    /// Parses the 4-byte TS packet header.
    pub fn parse_header(&self, data: &[u8]) -> Result<TsHeader> {
        if data.len() < TS_HEADER_SIZE {
            return Err(TsKitError::PacketTooShort("TS packet header".into()));
        }

        if data[0] != 0x47 {
            return Err(TsKitError::NoSyncByte(0));
        }

        Ok(TsHeader {
            sync_byte: data[0],
            transport_error: (data[1] & 0x80) != 0,
            payload_unit_start: (data[1] & 0x40) != 0,
            transport_priority: (data[1] & 0x20) != 0,
            pid: (((data[1] & 0x1F) as u16) << 8) | data[2] as u16,
            scrambling_control: (data[3] >> 6) & 0x03,
            adaptation_field_exists: (data[3] & 0x20) != 0,
            contains_payload: (data[3] & 0x10) != 0,
            continuity_counter: data[3] & 0x0F,
        })
    }

    /// Parses the adaptation field starting at `offset`, when the header
    /// flagged one. Surfaces the PCR in 27 MHz units.
    pub fn parse_adaptation_field(
        &self,
        data: &[u8],
        offset: usize,
    ) -> Result<Option<AdaptationField>> {
        if (data[3] & 0x20) == 0 {
            return Ok(None);
        }

        let length = data[offset] as usize;
        if length == 0 {
            return Ok(Some(AdaptationField {
                length: 0,
                ..Default::default()
            }));
        }

        if data.len() < offset + length + 1 {
            return Err(TsKitError::PacketTooShort("adaptation field".into()));
        }

        let flags = data[offset + 1];
        let mut field = AdaptationField {
            length,
            discontinuity: (flags & 0x80) != 0,
            random_access: (flags & 0x40) != 0,
            pcr: None,
        };

        if (flags & 0x10) != 0 {
            if length < 7 {
                return Err(TsKitError::PacketTooShort("PCR field".into()));
            }
            let pos = offset + 2;
            let pcr_base = ((data[pos] as u64) << 25)
                | ((data[pos + 1] as u64) << 17)
                | ((data[pos + 2] as u64) << 9)
                | ((data[pos + 3] as u64) << 1)
                | ((data[pos + 4] & 0x80) as u64 >> 7);
            let pcr_ext = (((data[pos + 4] & 0x01) as u64) << 8) | (data[pos + 5] as u64);
            field.pcr = Some(pcr_base * 300 + pcr_ext);
        }

        Ok(Some(field))
    }

    /// Parses a PAT section (pointer field already skipped).
    pub fn parse_pat(&self, data: &[u8]) -> Result<Pat> {
        let mut pat = Pat::new();

        if data.len() < 8 {
            return Err(TsKitError::PacketTooShort("PAT section".into()));
        }
        if data[0] != TABLE_ID_PAT {
            return Err(TsKitError::Parser(format!(
                "invalid PAT table ID 0x{:02x}",
                data[0]
            )));
        }

        let section_length = ((data[1] as usize & 0x0F) << 8) | data[2] as usize;
        let total_length = 3 + section_length;
        if data.len() < total_length {
            return Err(TsKitError::PacketTooShort("PAT data".into()));
        }

        // Program loop runs from after the section header to the CRC
        let mut pos = 8;
        while pos + 4 <= total_length - 4 {
            let program_number = ((data[pos] as u16) << 8) | data[pos + 1] as u16;
            let pid = ((data[pos + 2] as u16 & 0x1F) << 8) | data[pos + 3] as u16;
            pat.entries.push(PatEntry {
                program_number,
                network_pid: if program_number == 0 { pid } else { 0 },
                program_map_pid: if program_number != 0 { pid } else { 0 },
            });
            pos += 4;
        }

        Ok(pat)
    }

    /// Parses a PMT section (pointer field already skipped).
    pub fn parse_pmt(&self, data: &[u8]) -> Result<Pmt> {
        let mut pmt = Pmt::new();

        if data.len() < 12 {
            return Err(TsKitError::PacketTooShort("PMT section".into()));
        }
        if data[0] != TABLE_ID_PMT {
            return Err(TsKitError::Parser(format!(
                "invalid PMT table ID 0x{:02x}",
                data[0]
            )));
        }

        let section_length = ((data[1] as usize & 0x0F) << 8) | data[2] as usize;
        let total_length = 3 + section_length;
        if data.len() < total_length {
            return Err(TsKitError::PacketTooShort("PMT data".into()));
        }

        let mut pos = 8;
        pmt.pcr_pid = ((data[pos] as u16 & 0x1F) << 8) | data[pos + 1] as u16;
        pos += 2;

        let program_info_length = ((data[pos] as usize & 0x0F) << 8) | data[pos + 1] as usize;
        pos += 2;
        if program_info_length > 0 {
            if pos + program_info_length > total_length - 4 {
                return Err(TsKitError::Parser(
                    "program info extends beyond section".into(),
                ));
            }
            pmt.program_descriptors = self.parse_descriptors(&data[pos..pos + program_info_length])?;
            pos += program_info_length;
        }

        while pos + 5 <= total_length - 4 {
            let stream_type = data[pos];
            let elementary_pid = ((data[pos + 1] as u16 & 0x1F) << 8) | data[pos + 2] as u16;
            let es_info_length = ((data[pos + 3] as usize & 0x0F) << 8) | data[pos + 4] as usize;
            pos += 5;

            if pos + es_info_length > total_length - 4 {
                return Err(TsKitError::Parser("ES info extends beyond section".into()));
            }
            let descriptors = self.parse_descriptors(&data[pos..pos + es_info_length])?;
            pos += es_info_length;

            pmt.elementary_stream_infos.push(ElementaryStreamInfo {
                stream_type,
                elementary_pid,
                descriptors,
            });
        }

        Ok(pmt)
    }

    fn parse_descriptors(&self, data: &[u8]) -> Result<Vec<Descriptor>> {
        let mut descriptors = Vec::new();
        let mut pos = 0;

        while pos + 2 <= data.len() {
            let tag = data[pos];
            let length = data[pos + 1] as usize;
            pos += 2;

            if pos + length > data.len() {
                return Err(TsKitError::PacketTooShort("descriptor".into()));
            }
            descriptors.push(Descriptor {
                tag,
                data: data[pos..pos + length].to_vec(),
            });
            pos += length;
        }

        Ok(descriptors)
    }
}
