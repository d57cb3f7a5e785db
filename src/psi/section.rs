// psi/section.rs
//! Generic PSI section reader/writer with CRC-32 (MPEG-2) validation.

use crc::{Crc, CRC_32_MPEG_2};

/// Returned by [`SectionReader::new`].
pub struct SectionReader<'a> {
    pub table_id:      u8,
    pub version:       u8,
    pub current_next:  bool,
    pub section_number:u8,
    pub last_section:  u8,
    /// program_number for PMT, transport_stream_id for PAT
    pub table_id_ext:  u16,
    pub body:          &'a [u8],   // bytes between fixed header & CRC
}

pub const CRC_MPEG: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

impl<'a> SectionReader<'a> {
    /// Validates pointer, length and CRC-32.
    pub fn new(payload: &'a [u8]) -> anyhow::Result<Self> {
        if payload.is_empty() { anyhow::bail!("payload empty") }
        let pointer = payload[0] as usize;
        let start   = 1 + pointer;
        if payload.len() < start + 8 { anyhow::bail!("short section") }

        let table_id = payload[start];
        let sec_len  = ((payload[start+1] & 0x0F) as usize) << 8 | payload[start+2] as usize;
        if sec_len < 9 { anyhow::bail!("invalid section_length") }
        let end      = start + 3 + sec_len;
        if end > payload.len() { anyhow::bail!("truncated section") }

        let crc_calc = CRC_MPEG.checksum(&payload[start..end-4]);
        let crc_pkt  = u32::from_be_bytes(payload[end-4..end].try_into()?);
        if crc_calc != crc_pkt {
            anyhow::bail!("CRC-32 mismatch");
        }

        Ok(Self {
            table_id,
            version:       (payload[start+5] & 0x3E) >> 1,
            current_next:  payload[start+5] & 0x01 != 0,
            section_number:payload[start+6],
            last_section:  payload[start+7],
            table_id_ext:  u16::from_be_bytes(payload[start+3..start+5].try_into()?),
            body:          &payload[start+8 .. end-4],
        })
    }
}

/// Builds one long-form section (single section, current) and appends the CRC.
pub struct SectionWriter {
    pub table_id:     u8,
    pub table_id_ext: u16,
    pub version:      u8,
}

impl SectionWriter {
    /// Serialized section, starting at table_id and ending with the CRC.
    pub fn finish(&self, body: &[u8]) -> Vec<u8> {
        // 5 bytes of extended header + body + CRC
        let sec_len = 5 + body.len() + 4;
        let mut out = Vec::with_capacity(3 + sec_len);
        out.push(self.table_id);
        // section_syntax_indicator, '0', reserved
        out.push(0xB0 | ((sec_len >> 8) as u8 & 0x0F));
        out.push(sec_len as u8);
        out.extend_from_slice(&self.table_id_ext.to_be_bytes());
        out.push(0xC0 | ((self.version & 0x1F) << 1) | 0x01);
        out.push(0x00); // section_number
        out.push(0x00); // last_section_number
        out.extend_from_slice(body);
        let crc = CRC_MPEG.checksum(&out);
        out.extend_from_slice(&crc.to_be_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_output_reads_back() {
        let section = SectionWriter { table_id: 0x02, table_id_ext: 7, version: 3 }.finish(&[1, 2, 3, 4]);
        let mut payload = vec![0x00];
        payload.extend_from_slice(&section);
        payload.resize(184, 0xFF);

        let sec = SectionReader::new(&payload).expect("valid section");
        assert_eq!(sec.table_id, 0x02);
        assert_eq!(sec.table_id_ext, 7);
        assert_eq!(sec.version, 3);
        assert!(sec.current_next);
        assert_eq!(sec.body, &[1, 2, 3, 4]);
    }

    #[test]
    fn corrupted_crc_is_rejected() {
        let mut section = SectionWriter { table_id: 0x00, table_id_ext: 1, version: 0 }.finish(&[0, 1, 0xE1, 0x00]);
        let last = section.len() - 1;
        section[last] ^= 0x01;
        let mut payload = vec![0x00];
        payload.extend_from_slice(&section);
        assert!(SectionReader::new(&payload).is_err());
    }
}
