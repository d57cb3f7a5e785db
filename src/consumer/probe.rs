//! Probing: grow the byte window and the analyze budget until the engine
//! has identified a video stream and an audio stream.

use std::cmp::Reverse;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tracing::{debug, error, info};

use crate::buffer::RingBuffer;
use crate::config::ConsumerConfig;
use crate::constants::TS_PACKET_SIZE;
use crate::error::ConsumerError;
use crate::remux::{ReadSeek, RemuxEngine};
use crate::types::{MediaKind, ProbeLimits, StreamDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeConfig {
    pub min_probe_size: u64,
    pub max_probe_size: u64,
    pub min_analyze_duration_us: u64,
    pub max_analyze_duration_us: u64,
}

impl From<&ConsumerConfig> for ProbeConfig {
    fn from(c: &ConsumerConfig) -> Self {
        Self {
            min_probe_size: c.min_probe_size,
            max_probe_size: c.max_probe_size,
            min_analyze_duration_us: c.min_analyze_duration_us,
            max_analyze_duration_us: c.max_analyze_duration_us,
        }
    }
}

#[derive(Debug)]
pub enum ProbeOutcome {
    /// All streams the engine reported, and the input indexes to remux in
    /// output order
    Selected {
        streams: Vec<StreamDescriptor>,
        selection: Vec<usize>,
    },
    /// Input ended or a stop was requested first
    EndOfStream,
}

/// Probe `input` until streams can be selected. The ring buffer is marked
/// for the duration so every failed attempt can start over from the same
/// byte.
pub fn probe_streams(
    engine: &mut dyn RemuxEngine,
    input: &mut dyn ReadSeek,
    ring: &RingBuffer,
    config: &ProbeConfig,
    stop: &AtomicBool,
) -> Result<ProbeOutcome, ConsumerError> {
    let started = Instant::now();
    let mut limits = ProbeLimits {
        probe_size: config.min_probe_size.min(config.max_probe_size),
        analyze_duration_us: config.min_analyze_duration_us.min(config.max_analyze_duration_us),
    };
    ring.set_mark();

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let streams = match engine.probe(input, limits) {
            Ok(streams) => streams,
            Err(e) => {
                ring.clear_mark();
                return Err(e.into());
            }
        };
        if stop.load(Ordering::Acquire) {
            ring.clear_mark();
            return Ok(ProbeOutcome::EndOfStream);
        }

        let cause = match select_streams(&streams) {
            Ok(selection) => {
                ring.clear_mark();
                info!(
                    attempt,
                    probe_size = limits.probe_size,
                    analyze_duration_us = limits.analyze_duration_us,
                    streams = streams.len(),
                    selected = ?selection,
                    "probing complete"
                );
                return Ok(ProbeOutcome::Selected { streams, selection });
            }
            Err(cause) => cause,
        };

        if ring.is_closed() && ring.read_available() == 0 {
            ring.clear_mark();
            info!(attempt, "input ended while probing");
            return Ok(ProbeOutcome::EndOfStream);
        }
        if limits.probe_size >= config.max_probe_size
            && limits.analyze_duration_us >= config.max_analyze_duration_us
        {
            ring.clear_mark();
            error!(
                probe_size = limits.probe_size,
                analyze_duration_us = limits.analyze_duration_us,
                "probing exhausted: {cause}"
            );
            return Err(ConsumerError::ProbeExhausted {
                probe_size: limits.probe_size,
                analyze_duration_us: limits.analyze_duration_us,
                cause,
            });
        }

        ring.rewind_to_mark()?;
        engine.reset_input();

        let buffered = ring.read_available() as u64 + TS_PACKET_SIZE as u64;
        let elapsed = started.elapsed().as_micros() as u64;
        limits.probe_size = grow(limits.probe_size)
            .max(buffered)
            .min(config.max_probe_size);
        limits.analyze_duration_us = grow(limits.analyze_duration_us)
            .max(elapsed)
            .min(config.max_analyze_duration_us);
        debug!(
            attempt,
            probe_size = limits.probe_size,
            analyze_duration_us = limits.analyze_duration_us,
            "retrying probe: {cause}"
        );
    }
}

fn grow(value: u64) -> u64 {
    value.saturating_add(value / 2)
}

/// Pick the streams to remux: the first identified video stream, the best
/// identified audio stream (most channels, then most frames; the earlier
/// stream wins a tie), then every other identified audio, video or
/// subtitle stream in input order.
pub fn select_streams(streams: &[StreamDescriptor]) -> Result<Vec<usize>, String> {
    let usable = |s: &&StreamDescriptor| s.is_identified();
    let video = streams
        .iter()
        .filter(usable)
        .find(|s| s.kind == MediaKind::Video)
        .ok_or_else(|| format!("no video stream identified among {} streams", streams.len()))?;
    let audio = streams
        .iter()
        .filter(usable)
        .filter(|s| s.kind == MediaKind::Audio)
        .min_by_key(|s| (Reverse(s.channels), Reverse(s.frames)))
        .ok_or_else(|| format!("no audio stream identified among {} streams", streams.len()))?;

    let mut selection = vec![video.index, audio.index];
    for s in streams.iter().filter(usable) {
        if matches!(s.kind, MediaKind::Video | MediaKind::Audio | MediaKind::Subtitle)
            && !selection.contains(&s.index)
        {
            selection.push(s.index);
        }
    }
    Ok(selection)
}
