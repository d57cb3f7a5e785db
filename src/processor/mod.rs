//! Transport stream demultiplexing
//!
//! Follows the first program in the PAT, registers its elementary streams
//! from the PMT and reassembles PES packets per PID.

use std::collections::HashMap;
use std::io::{ErrorKind, Read};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::constants::*;
use crate::psi::{parse_pat, parse_pmt, PatEntry};

/// One reassembled PES packet
#[derive(Debug, Clone)]
pub struct PesUnit {
    pub stream_index: usize,
    pub pid: u16,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    pub random_access: bool,
    /// Elementary stream bytes after the PES header
    pub payload: Bytes,
}

/// Elementary stream registered from the PMT
#[derive(Debug)]
pub struct EsTrack {
    pub pid: u16,
    pub stream_type: u8,
    pes: Option<PesBuffer>,
}

#[derive(Debug)]
struct PesBuffer {
    data: BytesMut,
    random_access: bool,
}

#[derive(Default)]
pub struct TsDemuxer {
    program: Option<PatEntry>,
    pmt_version: Option<u8>,
    pcr_pid: Option<u16>,
    tracks: Vec<EsTrack>,
    pid_index: HashMap<u16, usize>,
    pub sync_errors: u64,
}

impl TsDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Streams in registration order; the position is the stream index.
    pub fn tracks(&self) -> &[EsTrack] {
        &self.tracks
    }

    pub fn program_number(&self) -> Option<u16> {
        self.program.as_ref().map(|p| p.program_number)
    }

    pub fn pcr_pid(&self) -> Option<u16> {
        self.pcr_pid
    }

    /// Process a single TS packet, appending any completed PES to `out`.
    pub fn push(&mut self, chunk: &[u8], out: &mut Vec<PesUnit>) {
        // Check packet length and sync byte
        if chunk.len() < TS_PACKET_SIZE || chunk[0] != TS_SYNC_BYTE {
            self.sync_errors += 1;
            return;
        }

        let pid = (((chunk[1] & 0x1F) as u16) << 8) | (chunk[2] as u16);
        let payload_unit_start = chunk[1] & 0x40 != 0;
        let adaption_field_ctrl = (chunk[3] & 0x30) >> 4;
        let mut payload_offset = 4usize;
        let mut random_access = false;

        // Skip packets with no payload or adaptation field only
        if adaption_field_ctrl == 2 || adaption_field_ctrl == 0 {
            return;
        }

        // Handle adaptation field
        if adaption_field_ctrl == 3 {
            let adap_len = chunk[4] as usize;
            if adap_len > 0 {
                random_access = chunk[5] & 0x40 != 0;
            }
            payload_offset += 1 + adap_len;
            if payload_offset >= TS_PACKET_SIZE {
                return;
            }
        }
        let payload = &chunk[payload_offset..TS_PACKET_SIZE];

        if pid == 0x0000 {
            if payload_unit_start {
                self.on_pat(payload);
            }
            return;
        }
        if self.program.as_ref().is_some_and(|p| p.pmt_pid == pid) {
            if payload_unit_start {
                self.on_pmt(payload);
            }
            return;
        }

        let Some(&index) = self.pid_index.get(&pid) else {
            return;
        };
        let track = &mut self.tracks[index];
        if payload_unit_start {
            if let Some(done) = track.pes.take() {
                out.extend(finish_pes(index, pid, done));
            }
            track.pes = Some(PesBuffer {
                data: BytesMut::from(payload),
                random_access,
            });
        } else if let Some(pes) = track.pes.as_mut() {
            pes.data.extend_from_slice(payload);
        } else {
            // joined mid-PES; wait for the next start
            return;
        }

        // Bounded PES can be emitted as soon as it is complete
        let complete = track.pes.as_ref().is_some_and(|pes| {
            let d = &pes.data;
            d.len() >= 6 && {
                let len = u16::from_be_bytes([d[4], d[5]]) as usize;
                len > 0 && d.len() >= 6 + len
            }
        });
        if complete {
            if let Some(done) = track.pes.take() {
                out.extend(finish_pes(index, pid, done));
            }
        }
    }

    /// Emit every partially assembled PES; used at end of input.
    pub fn flush(&mut self, out: &mut Vec<PesUnit>) {
        for (index, track) in self.tracks.iter_mut().enumerate() {
            if let Some(done) = track.pes.take() {
                out.extend(finish_pes(index, track.pid, done));
            }
        }
    }

    fn on_pat(&mut self, payload: &[u8]) {
        let pat = match parse_pat(payload) {
            Ok(pat) => pat,
            Err(e) => {
                trace!("PAT rejected: {e}");
                return;
            }
        };
        let Some(first) = pat.programs.first() else {
            return;
        };
        if self.program.as_ref() != Some(first) {
            debug!(
                program = first.program_number,
                pmt_pid = first.pmt_pid,
                "following program"
            );
            self.program = Some(first.clone());
            self.pmt_version = None;
        }
    }

    fn on_pmt(&mut self, payload: &[u8]) {
        let pmt = match parse_pmt(payload) {
            Ok(pmt) => pmt,
            Err(e) => {
                trace!("PMT rejected: {e}");
                return;
            }
        };
        if self.program_number() != Some(pmt.program_number) {
            return;
        }
        if self.pmt_version == Some(pmt.version) {
            return;
        }
        self.pmt_version = Some(pmt.version);
        self.pcr_pid = Some(pmt.pcr_pid);

        // Streams are only ever appended so indexes stay stable
        for s in pmt.streams {
            if self.pid_index.contains_key(&s.elementary_pid) {
                continue;
            }
            let index = self.tracks.len();
            debug!(
                index,
                pid = s.elementary_pid,
                stream_type = s.stream_type,
                "elementary stream registered"
            );
            self.pid_index.insert(s.elementary_pid, index);
            self.tracks.push(EsTrack {
                pid: s.elementary_pid,
                stream_type: s.stream_type,
                pes: None,
            });
        }
    }
}

fn finish_pes(stream_index: usize, pid: u16, pes: PesBuffer) -> Option<PesUnit> {
    let data = pes.data.freeze();
    let (pts, dts, header_len) = parse_pes_header(&data)?;
    let mut end = data.len();
    let declared = u16::from_be_bytes([data[4], data[5]]) as usize;
    if declared > 0 {
        end = end.min(6 + declared);
    }
    if header_len > end {
        return None;
    }
    Some(PesUnit {
        stream_index,
        pid,
        pts,
        dts,
        random_access: pes.random_access,
        payload: data.slice(header_len..end),
    })
}

/// Returns (pts, dts, offset of the ES payload)
pub fn parse_pes_header(data: &[u8]) -> Option<(Option<u64>, Option<u64>, usize)> {
    if data.len() < 6 || !data.starts_with(&PES_START_CODE) {
        return None;
    }
    let stream_id = data[3];
    // program_stream_map, padding, private_stream_2, ECM, EMM, directory, DSMCC, H.222 type E
    if matches!(stream_id, 0xBC | 0xBE | 0xBF | 0xF0 | 0xF1 | 0xF2 | 0xF8 | 0xFF) {
        return Some((None, None, 6));
    }
    if data.len() < 9 {
        return None;
    }

    let pts_dts_flags = (data[7] & 0xC0) >> 6;
    let header_len = 9 + data[8] as usize;
    let pts = if pts_dts_flags & 0b10 != 0 && data.len() >= 14 {
        Some(decode_timestamp(&data[9..14]))
    } else {
        None
    };
    let dts = if pts_dts_flags == 0b11 && data.len() >= 19 {
        Some(decode_timestamp(&data[14..19]))
    } else {
        pts
    };
    Some((pts, dts, header_len))
}

/// 33-bit PTS/DTS stored in 5 bytes with marker bits
pub fn decode_timestamp(p: &[u8]) -> u64 {
    ((p[0] as u64 & 0x0E) << 29)
        | ((p[1] as u64) << 22)
        | (((p[2] as u64 & 0xFE) >> 1) << 15)
        | ((p[3] as u64) << 7)
        | ((p[4] as u64) >> 1)
}

/// Pulls 188-byte packets out of a byte stream, resynchronising on the
/// sync byte. Counts every byte it reads.
#[derive(Default)]
pub struct TsReader {
    buf: Vec<u8>,
    consumed: u64,
    limit: Option<u64>,
}

impl TsReader {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(TS_PACKET_SIZE),
            consumed: 0,
            limit: None,
        }
    }

    /// Stop reading once `consumed()` reaches `limit`; may overshoot by
    /// less than one packet.
    pub fn set_limit(&mut self, limit: Option<u64>) {
        self.limit = limit;
    }

    pub fn limit_reached(&self) -> bool {
        self.limit.is_some_and(|limit| self.consumed >= limit)
    }

    /// Bytes read from the input since creation or the last reset
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.consumed = 0;
        self.limit = None;
    }

    /// Next aligned packet, or `None` at end of input or once the limit is
    /// reached.
    pub fn next_packet<R: Read + ?Sized>(
        &mut self,
        input: &mut R,
    ) -> std::io::Result<Option<[u8; TS_PACKET_SIZE]>> {
        loop {
            if self.buf.len() < TS_PACKET_SIZE && self.limit_reached() {
                return Ok(None);
            }
            if !self.fill(input)? {
                return Ok(None);
            }
            if self.buf[0] == TS_SYNC_BYTE {
                let mut packet = [0u8; TS_PACKET_SIZE];
                packet.copy_from_slice(&self.buf);
                self.buf.clear();
                return Ok(Some(packet));
            }
            match self.buf[1..].iter().position(|&b| b == TS_SYNC_BYTE) {
                Some(pos) => {
                    self.buf.drain(..pos + 1);
                }
                None => self.buf.clear(),
            }
        }
    }

    /// Top the buffer up to one packet; false on end of input.
    fn fill<R: Read + ?Sized>(&mut self, input: &mut R) -> std::io::Result<bool> {
        let mut chunk = [0u8; TS_PACKET_SIZE];
        while self.buf.len() < TS_PACKET_SIZE {
            let want = TS_PACKET_SIZE - self.buf.len();
            match input.read(&mut chunk[..want]) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    self.consumed += n as u64;
                    self.buf.extend_from_slice(&chunk[..n]);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}
