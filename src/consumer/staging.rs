use std::io::{self, Write};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;

use bytes::BytesMut;
use tracing::{info, trace, warn};

use crate::config::UploadConfig;
use crate::consumer::{ConsumerShared, ConsumerState, SwitchRequest};
use crate::destination::Destination;

/// Collects muxer output and hands it to the destination in transfers of
/// at least `min_transfer` bytes. A pending switch is only committed at a
/// packet boundary, after the staged bytes went to the old destination, so
/// neither a transfer nor a muxed packet is ever split between two
/// destinations.
pub struct StagingOutput {
    buf: BytesMut,
    min_transfer: usize,
    destination: Destination,
    upload: UploadConfig,
    switches: Receiver<SwitchRequest>,
    shared: Arc<ConsumerShared>,
    switched: bool,
}

impl StagingOutput {
    pub fn new(
        destination: Destination,
        rw_buffer_size: usize,
        min_transfer: usize,
        upload: UploadConfig,
        switches: Receiver<SwitchRequest>,
        shared: Arc<ConsumerShared>,
    ) -> Self {
        shared.set_destination(destination.label());
        Self {
            buf: BytesMut::with_capacity(rw_buffer_size.max(min_transfer)),
            min_transfer: min_transfer.max(1),
            destination,
            upload,
            switches,
            shared,
            switched: false,
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn staged(&self) -> usize {
        self.buf.len()
    }

    /// True once after each committed switch
    fn take_switched(&mut self) -> bool {
        std::mem::take(&mut self.switched)
    }

    /// Send whatever is staged to the current destination.
    pub fn flush_staged(&mut self) {
        if !self.buf.is_empty() {
            let chunk = self.buf.split().freeze();
            let len = chunk.len() as u64;
            self.shared.total_bytes.fetch_add(len, Ordering::Relaxed);
            if self.destination.write_chunk(&chunk) {
                self.shared.bytes_streamed.fetch_add(len, Ordering::Relaxed);
            }
            trace!(len, "transfer flushed");
            if let Some(reason) = self.destination.failure() {
                self.shared.set_failure(reason);
            }
        }
    }

    /// Called between two muxed packets. Services at most one switch
    /// request; returns true when the destination changed.
    pub fn packet_boundary(&mut self) -> bool {
        self.poll_switch();
        self.take_switched()
    }

    fn poll_switch(&mut self) {
        let request = match self.switches.try_recv() {
            Ok(request) => request,
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return,
        };
        self.flush_staged();

        let resume = self.shared.state();
        self.shared.set_state(ConsumerState::Switching);
        let waited = request.requested_at.elapsed();
        let result = self.destination.commit_switch(&request.target, &self.upload);
        match &result {
            Ok(()) => {
                self.shared.bytes_streamed.store(0, Ordering::Relaxed);
                self.shared.set_destination(self.destination.label());
                self.shared.clear_failure();
                self.switched = true;
                info!(
                    destination = %self.destination.label(),
                    waited_ms = waited.as_millis() as u64,
                    "switched destination"
                );
            }
            Err(e) => warn!(requested = %request.target, "switch failed: {e}"),
        }
        self.shared.set_state(resume);
        // requester may have given up already
        let _ = request.reply.send(result);
    }

    /// Final flush, then close the destination. A switch that is still
    /// waiting gets its answer first.
    pub fn finish(mut self) -> Destination {
        self.flush_staged();
        self.poll_switch();
        self.destination.finish();
        self.destination
    }
}

impl Write for StagingOutput {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= self.min_transfer {
            self.flush_staged();
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_staged();
        Ok(())
    }
}
