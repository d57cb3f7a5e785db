//! Remux consumer: ring buffer -> engine -> staging -> destination.
//!
//! [`RemuxConsumer::run`] owns the engine and the destination on its own
//! thread. Everything other threads may touch lives in [`ConsumerShared`]
//! and is reached through a [`ConsumerHandle`].

mod probe;
mod staging;
mod stream_map;

pub use probe::{probe_streams, select_streams, ProbeConfig, ProbeOutcome};
pub use staging::StagingOutput;
pub use stream_map::{Routed, StreamMap};

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::buffer::RingBuffer;
use crate::config::{ConsumerConfig, UploadConfig};
use crate::destination::{Destination, DestinationSpec};
use crate::error::{ConsumerError, SwitchError};
use crate::remux::RemuxEngine;
use crate::types::StreamDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerState {
    Idle,
    Probing,
    Streaming,
    Switching,
    Draining,
    Stopped,
    Failed,
}

impl ConsumerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConsumerState::Stopped | ConsumerState::Failed)
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerState::Idle => "idle",
            ConsumerState::Probing => "probing",
            ConsumerState::Streaming => "streaming",
            ConsumerState::Switching => "switching",
            ConsumerState::Draining => "draining",
            ConsumerState::Stopped => "stopped",
            ConsumerState::Failed => "failed",
        };
        f.write_str(name)
    }
}

pub struct SwitchRequest {
    pub target: DestinationSpec,
    pub requested_at: Instant,
    pub reply: Sender<Result<(), SwitchError>>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ConsumerSnapshot {
    pub state: ConsumerState,
    pub destination: String,
    pub bytes_streamed: u64,
    pub total_bytes: u64,
    pub packets_written: u64,
    pub duplicates_dropped: u64,
    pub unmapped_dropped: u64,
    pub failure: Option<String>,
}

pub struct ConsumerShared {
    state: Mutex<ConsumerState>,
    failure: Mutex<Option<String>>,
    destination: Mutex<String>,
    stop: AtomicBool,
    alive: AtomicBool,
    /// Bytes accepted by the current destination since it became current
    pub(crate) bytes_streamed: AtomicU64,
    pub(crate) total_bytes: AtomicU64,
    pub(crate) packets_written: AtomicU64,
    pub(crate) duplicates_dropped: AtomicU64,
    pub(crate) unmapped_dropped: AtomicU64,
    /// Held by a requester for the whole request, so requests queue up
    switch_tx: Mutex<Sender<SwitchRequest>>,
    poll: Duration,
}

impl ConsumerShared {
    pub(crate) fn state(&self) -> ConsumerState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ConsumerState) {
        let mut current = self.state.lock();
        if *current != state {
            trace!(from = %*current, to = %state, "consumer state");
            *current = state;
        }
    }

    pub(crate) fn set_destination(&self, label: &str) {
        *self.destination.lock() = label.to_string();
    }

    pub(crate) fn set_failure(&self, reason: &str) {
        *self.failure.lock() = Some(reason.to_string());
    }

    pub(crate) fn clear_failure(&self) {
        *self.failure.lock() = None;
    }
}

/// Control surface of a running consumer; cheap to clone.
#[derive(Clone)]
pub struct ConsumerHandle {
    shared: Arc<ConsumerShared>,
}

impl ConsumerHandle {
    /// Ask the consumer to move to `target` at its next packet boundary
    /// and wait for the outcome. Returns early with
    /// [`SwitchError::ConsumerStopped`] once the consumer is gone.
    pub fn switch_to(&self, target: DestinationSpec) -> Result<(), SwitchError> {
        let shared = &self.shared;
        let tx = loop {
            if !shared.alive.load(Ordering::Acquire) {
                return Err(SwitchError::ConsumerStopped);
            }
            if let Some(tx) = shared.switch_tx.try_lock_for(shared.poll) {
                break tx;
            }
        };
        if !shared.alive.load(Ordering::Acquire) {
            return Err(SwitchError::ConsumerStopped);
        }

        let (reply, outcome) = mpsc::channel();
        debug!(%target, "switch requested");
        tx.send(SwitchRequest {
            target,
            requested_at: Instant::now(),
            reply,
        })
        .map_err(|_| SwitchError::ConsumerStopped)?;

        loop {
            match outcome.recv_timeout(shared.poll) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Timeout) => {
                    if !shared.alive.load(Ordering::Acquire) {
                        return Err(SwitchError::ConsumerStopped);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(SwitchError::ConsumerStopped),
            }
        }
    }

    /// Ask the consumer to drain and stop. Does not wait; a consumer blocked
    /// on an empty ring buffer also needs the buffer closed.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    pub fn state(&self) -> ConsumerState {
        self.shared.state()
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> ConsumerSnapshot {
        let s = &self.shared;
        ConsumerSnapshot {
            state: s.state(),
            destination: s.destination.lock().clone(),
            bytes_streamed: s.bytes_streamed.load(Ordering::Relaxed),
            total_bytes: s.total_bytes.load(Ordering::Relaxed),
            packets_written: s.packets_written.load(Ordering::Relaxed),
            duplicates_dropped: s.duplicates_dropped.load(Ordering::Relaxed),
            unmapped_dropped: s.unmapped_dropped.load(Ordering::Relaxed),
            failure: s.failure.lock().clone(),
        }
    }
}

/// Seekable read view of the ring buffer handed to the engine. A read of
/// 0 bytes means the buffer was closed and drained.
pub struct RingReader {
    ring: Arc<RingBuffer>,
}

impl RingReader {
    pub fn new(ring: Arc<RingBuffer>) -> Self {
        Self { ring }
    }
}

impl Read for RingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.ring.read(buf))
    }
}

impl Seek for RingReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.ring
            .seek(pos)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }
}

pub struct RemuxConsumer {
    config: ConsumerConfig,
    upload: UploadConfig,
    shared: Arc<ConsumerShared>,
    switches: Option<Receiver<SwitchRequest>>,
}

impl RemuxConsumer {
    pub fn new(config: ConsumerConfig, upload: UploadConfig) -> (Self, ConsumerHandle) {
        let (switch_tx, switches) = mpsc::channel();
        let shared = Arc::new(ConsumerShared {
            state: Mutex::new(ConsumerState::Idle),
            failure: Mutex::new(None),
            destination: Mutex::new(String::new()),
            stop: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            bytes_streamed: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            packets_written: AtomicU64::new(0),
            duplicates_dropped: AtomicU64::new(0),
            unmapped_dropped: AtomicU64::new(0),
            switch_tx: Mutex::new(switch_tx),
            poll: config.switch_poll(),
        });
        let handle = ConsumerHandle {
            shared: Arc::clone(&shared),
        };
        let consumer = Self {
            config,
            upload,
            shared,
            switches: Some(switches),
        };
        (consumer, handle)
    }

    /// Probe, stream until the ring buffer ends or a stop is requested,
    /// then drain. Runs on the calling thread.
    pub fn run(
        mut self,
        ring: Arc<RingBuffer>,
        mut engine: Box<dyn RemuxEngine>,
        destination: Destination,
    ) -> Result<(), ConsumerError> {
        let result = self.remux(&ring, engine.as_mut(), destination);
        engine.close();
        match &result {
            Ok(()) => {
                self.shared.set_state(ConsumerState::Stopped);
                info!("consumer stopped");
            }
            Err(e) => {
                error!("consumer failed: {e}");
                self.shared.set_failure(&e.to_string());
                self.shared.set_state(ConsumerState::Failed);
            }
        }
        result
    }

    fn remux(
        &mut self,
        ring: &Arc<RingBuffer>,
        engine: &mut dyn RemuxEngine,
        mut destination: Destination,
    ) -> Result<(), ConsumerError> {
        self.shared.set_destination(destination.label());
        self.shared.set_state(ConsumerState::Probing);
        let mut input = RingReader::new(Arc::clone(ring));

        let probed = probe_streams(
            engine,
            &mut input,
            ring,
            &ProbeConfig::from(&self.config),
            &self.shared.stop,
        );
        let (streams, selection) = match probed {
            Ok(ProbeOutcome::Selected { streams, selection }) => (streams, selection),
            Ok(ProbeOutcome::EndOfStream) => {
                destination.finish();
                return Ok(());
            }
            Err(e) => {
                destination.finish();
                return Err(e);
            }
        };

        let selected: Vec<StreamDescriptor> = selection.iter().map(|&i| streams[i].clone()).collect();
        let time_bases = match engine.open_output(&selected) {
            Ok(time_bases) => time_bases,
            Err(e) => {
                destination.finish();
                return Err(e.into());
            }
        };
        let mut map = StreamMap::new(&streams, &selection, time_bases);

        let switches = match self.switches.take() {
            Some(switches) => switches,
            None => mpsc::channel().1,
        };
        let mut output = StagingOutput::new(
            destination,
            self.config.rw_buffer_size,
            self.config.min_transfer_size,
            self.upload.clone(),
            switches,
            Arc::clone(&self.shared),
        );

        let streamed = match engine.write_header(&mut output) {
            Ok(()) => {
                self.shared.set_state(ConsumerState::Streaming);
                info!(outputs = map.output_count(), "streaming");
                self.stream(engine, &mut input, &mut output, &mut map)
            }
            Err(e) => Err(e.into()),
        };

        self.shared.set_state(ConsumerState::Draining);
        if let Err(e) = engine.write_trailer(&mut output) {
            warn!("trailer not written: {e}");
        }
        let destination = output.finish();
        debug!(
            destination = destination.label(),
            bytes = destination.bytes_written(),
            checksum = destination.checksum(),
            "drained"
        );
        streamed
    }

    fn stream(
        &self,
        engine: &mut dyn RemuxEngine,
        input: &mut RingReader,
        output: &mut StagingOutput,
        map: &mut StreamMap,
    ) -> Result<(), ConsumerError> {
        let shared = &self.shared;
        while !shared.stop.load(Ordering::Acquire) {
            let Some(packet) = engine.read_packet(input)? else {
                debug!("end of input");
                break;
            };
            match map.route(packet) {
                Routed::Forward(packet) => {
                    if let Err(e) = engine.write_packet(output, &packet) {
                        warn!(stream = packet.stream_index, dts = ?packet.dts, "packet not written: {e}");
                    } else {
                        shared.packets_written.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Routed::Unmapped => {
                    shared.unmapped_dropped.fetch_add(1, Ordering::Relaxed);
                }
                Routed::Duplicate(dts) => {
                    shared.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(dts, "same dts as the previous packet, dropped");
                }
            }
            if output.packet_boundary() {
                engine.output_switched();
            }
        }
        Ok(())
    }
}

impl Drop for RemuxConsumer {
    fn drop(&mut self) {
        self.shared.alive.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_reader_seeks_inside_the_mark() {
        let ring = Arc::new(RingBuffer::new(64));
        let mut reader = RingReader::new(Arc::clone(&ring));
        ring.set_mark();
        ring.write(b"abcdef").expect("write");
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).expect("read"), 4);
        assert_eq!(reader.seek(SeekFrom::Current(-3)).expect("seek"), 1);
        assert_eq!(reader.read(&mut buf).expect("read"), 4);
        assert_eq!(&buf, b"bcde");
        assert!(reader.seek(SeekFrom::Start(7)).is_err());
    }

    #[test]
    fn switch_fails_fast_when_consumer_is_gone() {
        let (consumer, handle) = RemuxConsumer::new(ConsumerConfig::default(), UploadConfig::default());
        assert!(handle.is_alive());
        drop(consumer);
        assert!(matches!(
            handle.switch_to(DestinationSpec::Discard),
            Err(SwitchError::ConsumerStopped)
        ));
        assert_eq!(handle.state(), ConsumerState::Idle);
    }

    #[test]
    fn state_names() {
        assert_eq!(ConsumerState::Streaming.to_string(), "streaming");
        assert_eq!(
            serde_json::to_string(&ConsumerState::Failed).expect("json"),
            "\"failed\""
        );
        assert!(ConsumerState::Stopped.is_terminal());
        assert!(!ConsumerState::Draining.is_terminal());
    }
}
