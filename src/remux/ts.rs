use std::collections::VecDeque;
use std::io::Write;

use tracing::{debug, trace};

use crate::constants::*;
use crate::error::EngineError;
use crate::muxer::TsMuxer;
use crate::parsers::{classify, identify};
use crate::processor::{PesUnit, TsDemuxer, TsReader};
use crate::remux::{ReadSeek, RemuxEngine};
use crate::types::{rescale, MediaKind, Packet, ProbeLimits, Rational, StreamDescriptor};

/// MPEG-TS in, MPEG-TS out
#[derive(Default)]
pub struct TsRemuxEngine {
    reader: TsReader,
    demux: TsDemuxer,
    streams: Vec<StreamDescriptor>,
    units: Vec<PesUnit>,
    pending: VecDeque<Packet>,
    eof: bool,
    muxer: Option<TsMuxer>,
}

impl TsRemuxEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Streams registered so far
    pub fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    fn sync_streams(&mut self) {
        for track in &self.demux.tracks()[self.streams.len()..] {
            let (kind, codec) = classify(track.stream_type);
            self.streams.push(StreamDescriptor {
                index: self.streams.len(),
                id: track.pid as u32,
                kind,
                codec: codec.to_string(),
                codec_tag: track.stream_type as u32,
                time_base: Rational::MPEG_90K,
                width: 0,
                height: 0,
                channels: 0,
                sample_rate: 0,
                frames: 0,
            });
        }
    }

    /// Turn completed PES units into queued packets, collecting their dts
    /// into `dts_seen`.
    fn queue_units(&mut self, dts_seen: &mut Vec<u64>) {
        for unit in self.units.drain(..) {
            let Some(desc) = self.streams.get_mut(unit.stream_index) else {
                continue;
            };
            desc.frames += 1;
            if identify(desc, &unit.payload) {
                debug!(
                    index = desc.index,
                    pid = desc.id,
                    codec = %desc.codec,
                    width = desc.width,
                    height = desc.height,
                    channels = desc.channels,
                    "stream identified"
                );
            }
            if let Some(dts) = unit.dts {
                dts_seen.push(dts);
            }
            self.pending.push_back(Packet {
                stream_index: unit.stream_index,
                pts: unit.pts.map(|v| v as i64),
                dts: unit.dts.map(|v| v as i64),
                duration: None,
                data: unit.payload,
                keyframe: unit.random_access,
            });
        }
    }

    /// Feed one packet from the input; false at end of input or at the
    /// reader's limit.
    fn pump(&mut self, input: &mut dyn ReadSeek, dts_seen: &mut Vec<u64>) -> Result<bool, EngineError> {
        match self.reader.next_packet(input)? {
            Some(packet) => {
                self.demux.push(&packet, &mut self.units);
                self.sync_streams();
                self.queue_units(dts_seen);
                Ok(true)
            }
            None if self.reader.limit_reached() => Ok(false),
            None => {
                self.eof = true;
                self.demux.flush(&mut self.units);
                self.queue_units(dts_seen);
                Ok(false)
            }
        }
    }

    fn all_identified(&self) -> bool {
        let mut media = self
            .streams
            .iter()
            .filter(|s| matches!(s.kind, MediaKind::Video | MediaKind::Audio))
            .peekable();
        media.peek().is_some() && media.all(StreamDescriptor::is_identified)
    }
}

impl RemuxEngine for TsRemuxEngine {
    fn probe(
        &mut self,
        input: &mut dyn ReadSeek,
        limits: ProbeLimits,
    ) -> Result<Vec<StreamDescriptor>, EngineError> {
        let analyze = rescale(
            limits.analyze_duration_us as i64,
            Rational::new(1, 1_000_000),
            Rational::MPEG_90K,
        ) as u64;
        let mut first_dts: Option<u64> = None;
        let mut dts_seen = Vec::new();

        self.reader.set_limit(Some(limits.probe_size));
        while !self.eof && !self.reader.limit_reached() {
            if !self.pump(input, &mut dts_seen)? {
                break;
            }
            if self.all_identified() {
                break;
            }
            let mut span = 0;
            for dts in dts_seen.drain(..) {
                let first = *first_dts.get_or_insert(dts);
                span = span.max(dts.wrapping_sub(first) & PTS_MASK);
            }
            if span >= analyze {
                trace!(span, analyze, "analyze budget reached");
                break;
            }
        }

        self.reader.set_limit(None);
        debug!(
            consumed = self.reader.consumed(),
            streams = self.streams.len(),
            queued = self.pending.len(),
            eof = self.eof,
            "probe pass finished"
        );
        Ok(self.streams.clone())
    }

    fn reset_input(&mut self) {
        self.reader.reset();
        self.demux = TsDemuxer::new();
        self.streams.clear();
        self.units.clear();
        self.pending.clear();
        self.eof = false;
    }

    fn read_packet(&mut self, input: &mut dyn ReadSeek) -> Result<Option<Packet>, EngineError> {
        let mut dts_seen = Vec::new();
        loop {
            if let Some(packet) = self.pending.pop_front() {
                return Ok(Some(packet));
            }
            if self.eof || !self.pump(input, &mut dts_seen)? {
                return Ok(self.pending.pop_front());
            }
            dts_seen.clear();
        }
    }

    fn open_output(&mut self, streams: &[StreamDescriptor]) -> Result<Vec<Rational>, EngineError> {
        if streams.is_empty() {
            return Err(EngineError::NoOutputStreams);
        }
        self.muxer = Some(TsMuxer::new(streams));
        Ok(vec![Rational::MPEG_90K; streams.len()])
    }

    fn write_header(&mut self, out: &mut dyn Write) -> Result<(), EngineError> {
        let muxer = self.muxer.as_mut().ok_or(EngineError::NotOpen)?;
        muxer.write_psi(out)?;
        Ok(())
    }

    fn write_packet(&mut self, out: &mut dyn Write, packet: &Packet) -> Result<(), EngineError> {
        let muxer = self.muxer.as_mut().ok_or(EngineError::NotOpen)?;
        muxer.write_packet(out, packet)?;
        Ok(())
    }

    fn write_trailer(&mut self, _out: &mut dyn Write) -> Result<(), EngineError> {
        // TS has no trailer
        self.muxer.as_ref().map(|_| ()).ok_or(EngineError::NotOpen)
    }

    fn output_switched(&mut self) {
        if let Some(muxer) = self.muxer.as_mut() {
            muxer.request_psi();
        }
    }

    fn close(&mut self) {
        self.muxer = None;
        self.pending.clear();
        self.units.clear();
    }
}
