use crate::psi::section::{SectionReader, SectionWriter};

/// ─────────── PMT ───────────
#[derive(Clone, Debug)]
pub struct PmtSection {
    pub version:        u8,
    pub program_number: u16,
    pub pcr_pid:        u16,
    pub streams:        Vec<StreamInfo>,
}
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    pub stream_type:   u8,
    pub elementary_pid:u16,
}

pub fn parse_pmt(payload:&[u8]) -> anyhow::Result<PmtSection> {
    let sec = SectionReader::new(payload)?;
    if sec.table_id != 0x02 { anyhow::bail!("not PMT"); }
    let b = sec.body;
    if b.len() < 4 { anyhow::bail!("short PMT body"); }

    // fixed part of the body
    let pcr_pid       = (((b[0] & 0x1F) as u16) << 8) | (b[1] as u16);
    let prog_info_len = (((b[2] & 0x0F) as usize) << 8) | (b[3] as usize);
    let mut idx       = 4 + prog_info_len;          // skip program descriptors

    // ES loop
    let mut streams = Vec::new();
    while idx + 5 <= b.len() {
        let stype = b[idx];
        let pid   = (((b[idx+1] & 0x1F) as u16) << 8) | (b[idx+2] as u16);
        let eslen = (((b[idx+3] & 0x0F) as usize) << 8) | (b[idx+4] as usize);
        streams.push(StreamInfo{ stream_type:stype, elementary_pid:pid });
        idx += 5 + eslen;                          // skip ES descriptors
    }

    Ok(PmtSection{ version:sec.version,
                   program_number:sec.table_id_ext,
                   pcr_pid,
                   streams })
}

/// PMT section bytes (no pointer field), without descriptors
pub fn build_pmt(program_number: u16, version: u8, pcr_pid: u16, streams: &[StreamInfo]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + streams.len() * 5);
    body.push(0xE0 | ((pcr_pid >> 8) as u8 & 0x1F));
    body.push(pcr_pid as u8);
    body.extend_from_slice(&[0xF0, 0x00]); // program_info_length = 0
    for s in streams {
        body.push(s.stream_type);
        body.push(0xE0 | ((s.elementary_pid >> 8) as u8 & 0x1F));
        body.push(s.elementary_pid as u8);
        body.extend_from_slice(&[0xF0, 0x00]); // ES_info_length = 0
    }
    SectionWriter { table_id: 0x02, table_id_ext: program_number, version }.finish(&body)
}
