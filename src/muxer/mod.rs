//! MPEG-TS packetizer for the remux output
//!
//! One program, PMT on [`OUTPUT_PMT_PID`], elementary streams on
//! consecutive PIDs from [`OUTPUT_FIRST_ES_PID`]. PCR rides on the first
//! stream. Every write hands the sink whole 188-byte packets.

use std::io::Write;

use tracing::debug;

use crate::constants::*;
use crate::psi::{build_pat, build_pmt, PatEntry, StreamInfo};
use crate::types::{MediaKind, Packet, StreamDescriptor};

struct OutStream {
    pid: u16,
    stream_type: u8,
    stream_id: u8,
    cc: u8,
}

pub struct TsMuxer {
    streams: Vec<OutStream>,
    pat_cc: u8,
    pmt_cc: u8,
    pes_since_psi: u32,
    psi_due: bool,
}

impl TsMuxer {
    pub fn new(streams: &[StreamDescriptor]) -> Self {
        let mut audio = 0u8;
        let mut video = 0u8;
        let streams = streams
            .iter()
            .enumerate()
            .map(|(i, desc)| {
                let stream_type = stream_type_for(desc);
                let stream_id = match (desc.kind, stream_type) {
                    (MediaKind::Video, _) => {
                        video = video.wrapping_add(1);
                        0xE0 | ((video - 1) & 0x0F)
                    }
                    (MediaKind::Audio, 0x03 | 0x04 | 0x0F | 0x11) => {
                        audio = audio.wrapping_add(1);
                        0xC0 | ((audio - 1) & 0x1F)
                    }
                    // AC-3, subtitles and data go out as private_stream_1
                    _ => 0xBD,
                };
                OutStream {
                    pid: OUTPUT_FIRST_ES_PID + i as u16,
                    stream_type,
                    stream_id,
                    cc: 0,
                }
            })
            .collect();
        Self {
            streams,
            pat_cc: 0,
            pmt_cc: 0,
            pes_since_psi: 0,
            psi_due: true,
        }
    }

    /// Force PAT/PMT in front of the next PES.
    pub fn request_psi(&mut self) {
        self.psi_due = true;
    }

    pub fn write_psi(&mut self, out: &mut dyn Write) -> std::io::Result<()> {
        let pat = build_pat(
            OUTPUT_TRANSPORT_STREAM_ID,
            0,
            &[PatEntry {
                program_number: OUTPUT_PROGRAM_NUMBER,
                pmt_pid: OUTPUT_PMT_PID,
            }],
        );
        let es: Vec<StreamInfo> = self
            .streams
            .iter()
            .map(|s| StreamInfo {
                stream_type: s.stream_type,
                elementary_pid: s.pid,
            })
            .collect();
        let pcr_pid = self.streams.first().map_or(0x1FFF, |s| s.pid);
        let pmt = build_pmt(OUTPUT_PROGRAM_NUMBER, 0, pcr_pid, &es);

        let mut buf = Vec::with_capacity(2 * TS_PACKET_SIZE);
        buf.extend_from_slice(&section_packet(0x0000, &mut self.pat_cc, &pat));
        buf.extend_from_slice(&section_packet(OUTPUT_PMT_PID, &mut self.pmt_cc, &pmt));
        out.write_all(&buf)?;

        self.pes_since_psi = 0;
        self.psi_due = false;
        Ok(())
    }

    /// Packetize one PES for `packet.stream_index` (an output index).
    pub fn write_packet(&mut self, out: &mut dyn Write, packet: &Packet) -> std::io::Result<()> {
        if packet.stream_index >= self.streams.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("no output stream {}", packet.stream_index),
            ));
        }
        if self.psi_due || self.pes_since_psi >= PSI_REPEAT_PACKETS {
            self.write_psi(out)?;
        }

        let pts = packet.pts.map(|v| v as u64 & PTS_MASK);
        let dts = packet.dts.map(|v| v as u64 & PTS_MASK);
        let pes = build_pes(self.streams[packet.stream_index].stream_id, pts, dts, &packet.data);

        let pcr = if packet.stream_index == 0 {
            dts.or(pts).map(|t| t.wrapping_sub(PCR_DTS_OFFSET) & PTS_MASK)
        } else {
            None
        };
        let random_access = packet.keyframe;

        let stream = &mut self.streams[packet.stream_index];
        let mut buf = Vec::with_capacity((pes.len() / TS_PAYLOAD_SIZE + 2) * TS_PACKET_SIZE);
        let mut rest = &pes[..];
        let mut first = true;
        while !rest.is_empty() {
            let mut pkt = [0xFFu8; TS_PACKET_SIZE];
            pkt[0] = TS_SYNC_BYTE;
            pkt[1] = (if first { 0x40 } else { 0 }) | ((stream.pid >> 8) as u8 & 0x1F);
            pkt[2] = stream.pid as u8;

            // Adaptation field body: flags + optional PCR
            let mut af: Vec<u8> = Vec::new();
            if first && (pcr.is_some() || random_access) {
                let mut flags = 0u8;
                if random_access {
                    flags |= 0x40;
                }
                if pcr.is_some() {
                    flags |= 0x10;
                }
                af.push(flags);
                if let Some(pcr) = pcr {
                    af.extend_from_slice(&encode_pcr(pcr));
                }
            }

            let af_total = if af.is_empty() { 0 } else { 1 + af.len() };
            let room = TS_PAYLOAD_SIZE - af_total;
            let take = rest.len().min(room);
            let af_total = if take < room {
                // stuff the last packet so the payload ends at the packet boundary
                TS_PAYLOAD_SIZE - take
            } else {
                af_total
            };

            let mut pos = 4;
            if af_total > 0 {
                pkt[3] = 0x30 | (stream.cc & 0x0F);
                pkt[4] = (af_total - 1) as u8;
                pos = 5;
                if af_total > 1 {
                    if af.is_empty() {
                        af.push(0x00);
                    }
                    pkt[pos..pos + af.len()].copy_from_slice(&af);
                    // remaining adaptation bytes stay 0xFF stuffing
                    pos = 4 + af_total;
                }
            } else {
                pkt[3] = 0x10 | (stream.cc & 0x0F);
            }
            pkt[pos..pos + take].copy_from_slice(&rest[..take]);
            buf.extend_from_slice(&pkt);

            stream.cc = stream.cc.wrapping_add(1) & 0x0F;
            rest = &rest[take..];
            first = false;
        }

        out.write_all(&buf)?;
        self.pes_since_psi += 1;
        Ok(())
    }
}

fn stream_type_for(desc: &StreamDescriptor) -> u8 {
    if desc.codec_tag != 0 && desc.codec_tag <= 0xFF {
        return desc.codec_tag as u8;
    }
    match desc.codec.as_str() {
        "mpeg1video" => 0x01,
        "mpeg2video" => 0x02,
        "h264" => 0x1B,
        "hevc" => 0x24,
        "mp2" => 0x03,
        "aac" => 0x0F,
        "aac_latm" => 0x11,
        "ac3" => 0x81,
        _ => 0x06,
    }
}

fn build_pes(stream_id: u8, pts: Option<u64>, dts: Option<u64>, data: &[u8]) -> Vec<u8> {
    let mut header = Vec::with_capacity(19);
    header.extend_from_slice(&PES_START_CODE);
    header.push(stream_id);
    header.extend_from_slice(&[0, 0]); // length, patched below
    header.push(0x80); // '10', no scrambling, no flags
    match (pts, dts) {
        (Some(pts), Some(dts)) if dts != pts => {
            header.push(0xC0);
            header.push(10);
            header.extend_from_slice(&encode_timestamp(0x3, pts));
            header.extend_from_slice(&encode_timestamp(0x1, dts));
        }
        (Some(pts), _) => {
            header.push(0x80);
            header.push(5);
            header.extend_from_slice(&encode_timestamp(0x2, pts));
        }
        (None, _) => {
            header.push(0x00);
            header.push(0);
        }
    }

    let pes_len = header.len() - 6 + data.len();
    // 0 = unbounded, only legal for video
    let declared = if pes_len > 0xFFFF { 0 } else { pes_len as u16 };
    header[4..6].copy_from_slice(&declared.to_be_bytes());

    let mut pes = header;
    pes.extend_from_slice(data);
    pes
}

fn encode_timestamp(prefix: u8, ts: u64) -> [u8; 5] {
    [
        (prefix << 4) | ((((ts >> 30) & 0x07) as u8) << 1) | 0x01,
        (ts >> 22) as u8,
        ((((ts >> 15) & 0x7F) as u8) << 1) | 0x01,
        (ts >> 7) as u8,
        (((ts & 0x7F) as u8) << 1) | 0x01,
    ]
}

fn encode_pcr(base: u64) -> [u8; 6] {
    [
        (base >> 25) as u8,
        (base >> 17) as u8,
        (base >> 9) as u8,
        (base >> 1) as u8,
        (((base & 0x01) as u8) << 7) | 0x7E,
        0x00,
    ]
}

/// Pointer field + section, padded with 0xFF to one packet
fn section_packet(pid: u16, cc: &mut u8, section: &[u8]) -> [u8; TS_PACKET_SIZE] {
    let mut pkt = [0xFFu8; TS_PACKET_SIZE];
    pkt[0] = TS_SYNC_BYTE;
    pkt[1] = 0x40 | ((pid >> 8) as u8 & 0x1F);
    pkt[2] = pid as u8;
    pkt[3] = 0x10 | (*cc & 0x0F);
    pkt[4] = 0x00;
    let len = section.len().min(TS_PAYLOAD_SIZE - 1);
    if len < section.len() {
        debug!(pid, len = section.len(), "section truncated to one packet");
    }
    pkt[5..5 + len].copy_from_slice(&section[..len]);
    *cc = cc.wrapping_add(1) & 0x0F;
    pkt
}
