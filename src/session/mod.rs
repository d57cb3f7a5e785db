//! One capture: producer thread -> ring buffer -> consumer thread.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{error, info, warn};

use crate::buffer::RingBuffer;
use crate::config::RelayConfig;
use crate::consumer::{ConsumerHandle, ConsumerState, RemuxConsumer};
use crate::destination::{Destination, DestinationSpec};
use crate::error::{SessionError, SwitchError};
use crate::producer::RtpProducer;
use crate::remux::RemuxEngine;
use crate::report::{Reporter, SessionReport};

pub struct CaptureSession {
    producer: RtpProducer,
    ring: Arc<RingBuffer>,
    consumer: ConsumerHandle,
    threads: Vec<JoinHandle<()>>,
}

impl CaptureSession {
    /// Bind the producer to `local`, open `destination` and start both
    /// threads. `remote` restricts which source may feed the session.
    pub fn start(
        config: &RelayConfig,
        remote: Option<IpAddr>,
        local: SocketAddr,
        destination: &DestinationSpec,
        engine: Box<dyn RemuxEngine>,
    ) -> Result<Self, SessionError> {
        let producer = RtpProducer::new(config.producer.clone());
        producer.bind(remote, local)?;
        let destination = Destination::open(destination, &config.upload)?;
        let ring = Arc::new(RingBuffer::new(config.consumer.ring_buffer_size));
        let (consumer, handle) = RemuxConsumer::new(config.consumer.clone(), config.upload.clone());

        let mut session = Self {
            producer: producer.clone(),
            ring: Arc::clone(&ring),
            consumer: handle,
            threads: Vec::with_capacity(2),
        };

        let sink = Arc::clone(&ring);
        let rtp = producer.clone();
        let spawned = thread::Builder::new()
            .name("rtp-producer".into())
            .spawn(move || {
                if let Err(e) = rtp.run(Arc::clone(&sink)) {
                    error!("producer ended: {e}");
                }
                // nothing more will arrive
                sink.close();
            });
        match spawned {
            Ok(thread) => session.threads.push(thread),
            Err(source) => {
                return Err(SessionError::Spawn {
                    name: "rtp-producer",
                    source,
                });
            }
        }

        let source = Arc::clone(&ring);
        let spawned = thread::Builder::new()
            .name("remux-consumer".into())
            .spawn(move || {
                let _ = consumer.run(Arc::clone(&source), engine, destination);
                // the producer has nobody left to feed
                producer.stop();
                source.close();
            });
        match spawned {
            Ok(thread) => session.threads.push(thread),
            Err(source) => {
                session.stop();
                return Err(SessionError::Spawn {
                    name: "remux-consumer",
                    source,
                });
            }
        }

        info!(
            local = %local,
            port = session.producer.local_port(),
            "capture session started"
        );
        Ok(session)
    }

    pub fn local_port(&self) -> Option<u16> {
        self.producer.local_port()
    }

    /// Handle for switching from another thread (a rotation scheduler)
    pub fn consumer(&self) -> ConsumerHandle {
        self.consumer.clone()
    }

    pub fn switch_to(&self, destination: DestinationSpec) -> Result<(), SwitchError> {
        self.consumer.switch_to(destination)
    }

    pub fn consumer_state(&self) -> ConsumerState {
        self.consumer.state()
    }

    /// The consumer has stopped or failed on its own
    pub fn is_finished(&self) -> bool {
        self.consumer.state().is_terminal()
    }

    pub fn status(&self) -> SessionReport {
        Reporter::create_report(self.producer.snapshot(), &self.ring, self.consumer.snapshot())
    }

    /// Stop everything and wait for the threads. Idempotent.
    pub fn stop(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.producer.stop();
        self.ring.close();
        self.consumer.stop();
        for thread in self.threads.drain(..) {
            let name = thread.thread().name().unwrap_or("capture").to_string();
            if thread.join().is_err() {
                warn!(thread = %name, "thread panicked");
            }
        }
        info!(state = %self.consumer.state(), "capture session stopped");
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}
