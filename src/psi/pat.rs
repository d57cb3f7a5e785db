use crate::psi::section::{SectionReader, SectionWriter};

/// ─────────── PAT ───────────
#[derive(Clone, Debug)]
pub struct PatSection {
    pub transport_stream_id: u16,
    pub version:      u8,
    pub current_next: bool,
    pub programs:     Vec<PatEntry>,
}
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatEntry {
    pub program_number: u16,
    pub pmt_pid:        u16,
}

pub fn parse_pat(payload:&[u8]) -> anyhow::Result<PatSection> {
    let sec = SectionReader::new(payload)?;
    if sec.table_id != 0x00 { anyhow::bail!("not PAT"); }

    let mut idx = 0;
    let mut programs = Vec::new();
    while idx + 4 <= sec.body.len() {
        let pn  = u16::from_be_bytes(sec.body[idx..idx+2].try_into()?);
        let pid = (((sec.body[idx+2] & 0x1F) as u16) << 8) | (sec.body[idx+3] as u16);
        idx += 4;
        if pn != 0 { programs.push(PatEntry{ program_number:pn, pmt_pid:pid }); } // 0 = NIT
    }
    Ok(PatSection{ transport_stream_id:sec.table_id_ext, version:sec.version, current_next:sec.current_next, programs })
}

/// PAT section bytes (no pointer field)
pub fn build_pat(transport_stream_id: u16, version: u8, programs: &[PatEntry]) -> Vec<u8> {
    let mut body = Vec::with_capacity(programs.len() * 4);
    for entry in programs {
        body.extend_from_slice(&entry.program_number.to_be_bytes());
        body.push(0xE0 | ((entry.pmt_pid >> 8) as u8 & 0x1F));
        body.push(entry.pmt_pid as u8);
    }
    SectionWriter { table_id: 0x00, table_id_ext: transport_stream_id, version }.finish(&body)
}
