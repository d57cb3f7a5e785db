//! RTP producer: UDP datagrams in, transport-stream bytes out to the ring buffer.
//!
//! The receive loop runs on the caller's thread ([`RtpProducer::run`]); a
//! watchdog thread samples the received-datagram counter every interval
//! and rebuilds the socket on the same port when nothing arrived. The
//! socket handle lives behind a lock and is handed out as an `Arc`, so a
//! receive in progress keeps using the old socket until it returns.

mod priority;

use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::buffer::RingBuffer;
use crate::config::ProducerConfig;
use crate::constants::{MAX_DATAGRAM_SIZE, RTP_HEADER_SIZE};
use crate::error::{BufferError, ProducerError};
use crate::network::create_udp_socket;
use crate::rtp::{PacketLossCounter, RtpHeader, payload_of};

/// Counters published by the producer; readable from any thread.
#[derive(Default)]
pub struct ProducerStats {
    packets_received: AtomicU64,
    packets_lost: AtomicU64,
    bytes_forwarded: AtomicU64,
    malformed: AtomicU64,
    foreign: AtomicU64,
    socket_rebuilds: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ProducerSnapshot {
    pub local_port: Option<u16>,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub bytes_forwarded: u64,
    pub malformed: u64,
    pub foreign: u64,
    pub socket_rebuilds: u64,
}

impl ProducerStats {
    fn snapshot(&self, local_port: Option<u16>) -> ProducerSnapshot {
        ProducerSnapshot {
            local_port,
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_lost: self.packets_lost.load(Ordering::Relaxed),
            bytes_forwarded: self.bytes_forwarded.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            foreign: self.foreign.load(Ordering::Relaxed),
            socket_rebuilds: self.socket_rebuilds.load(Ordering::Relaxed),
        }
    }
}

/// Address the socket is (re)bound to; the port is the one actually bound
#[derive(Debug, Clone, Copy)]
struct Binding {
    local: SocketAddr,
    remote: Option<IpAddr>,
}

struct Shared {
    config: ProducerConfig,
    binding: Mutex<Option<Binding>>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    socket_ready: Condvar,
    stop: AtomicBool,
    running: AtomicBool,
    watchdog_lock: Mutex<()>,
    watchdog_wake: Condvar,
    stats: ProducerStats,
}

/// Cheap to clone; clones share one socket and one set of counters.
#[derive(Clone)]
pub struct RtpProducer {
    shared: Arc<Shared>,
}

impl RtpProducer {
    pub fn new(config: ProducerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                binding: Mutex::new(None),
                socket: Mutex::new(None),
                socket_ready: Condvar::new(),
                stop: AtomicBool::new(false),
                running: AtomicBool::new(false),
                watchdog_lock: Mutex::new(()),
                watchdog_wake: Condvar::new(),
                stats: ProducerStats::default(),
            }),
        }
    }

    /// Create the socket on `local`, optionally accepting datagrams only from
    /// `remote`. Rejected while the receive loop is running.
    pub fn bind(&self, remote: Option<IpAddr>, local: SocketAddr) -> Result<(), ProducerError> {
        if self.shared.running.load(Ordering::SeqCst) {
            return Err(ProducerError::AlreadyRunning);
        }
        let cfg = &self.shared.config;
        let socket = create_udp_socket(local, cfg.udp_receive_buffer, cfg.read_timeout())?;
        let bound = socket.local_addr()?;
        // Rebuilds go back to the requested address (multicast group included)
        let local = SocketAddr::new(local.ip(), bound.port());

        *self.shared.binding.lock() = Some(Binding { local, remote });
        *self.shared.socket.lock() = Some(Arc::new(socket));
        self.shared.socket_ready.notify_all();
        info!(%local, ?remote, "producer bound");
        Ok(())
    }

    /// Port the producer is bound to, if any.
    pub fn local_port(&self) -> Option<u16> {
        self.shared.binding.lock().map(|b| b.local.port())
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> ProducerSnapshot {
        self.shared.stats.snapshot(self.local_port())
    }

    pub fn packets_lost(&self) -> u64 {
        self.shared.stats.packets_lost.load(Ordering::Relaxed)
    }

    /// Idempotent. Wakes the watchdog and drops the socket; the receive loop
    /// notices within one read timeout and returns `Ok`.
    pub fn stop(&self) {
        if self.shared.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("producer stop requested");
        {
            let _guard = self.shared.watchdog_lock.lock();
            self.shared.watchdog_wake.notify_all();
        }
        self.shared.socket.lock().take();
        self.shared.socket_ready.notify_all();
    }

    /// Receive loop. Blocks until [`stop`](Self::stop) is called or `sink`
    /// is closed; both are a clean shutdown.
    pub fn run(&self, sink: Arc<RingBuffer>) -> Result<(), ProducerError> {
        if self.shared.binding.lock().is_none() {
            return Err(ProducerError::NotBound);
        }
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ProducerError::AlreadyRunning);
        }

        let watchdog = {
            let shared = Arc::clone(&self.shared);
            thread::Builder::new()
                .name("packets-monitor".into())
                .spawn(move || shared.watchdog())
        };
        let watchdog = match watchdog {
            Ok(handle) => handle,
            Err(err) => {
                self.shared.running.store(false, Ordering::SeqCst);
                return Err(ProducerError::Io(err));
            }
        };

        // Channel scans do not need the boost
        if self.shared.config.raise_priority {
            priority::raise_current_thread();
        }

        self.shared.receive_loop(&sink);

        {
            let _guard = self.shared.watchdog_lock.lock();
            self.shared.stop.store(true, Ordering::SeqCst);
            self.shared.watchdog_wake.notify_all();
        }
        if watchdog.join().is_err() {
            warn!("packets monitor thread panicked");
        }
        self.shared.socket.lock().take();
        self.shared.running.store(false, Ordering::SeqCst);
        info!(
            lost = self.packets_lost(),
            "producer thread has stopped"
        );
        Ok(())
    }
}

impl Shared {
    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Current socket, waiting (bounded, re-polled) while the watchdog
    /// replaces it. `None` once stopping.
    fn current_socket(&self) -> Option<Arc<UdpSocket>> {
        let mut slot = self.socket.lock();
        loop {
            if self.stopping() {
                return None;
            }
            if let Some(socket) = slot.as_ref() {
                return Some(Arc::clone(socket));
            }
            trace!("waiting for a replacement socket");
            self.socket_ready
                .wait_for(&mut slot, self.config.socket_wait());
        }
    }

    fn receive_loop(&self, sink: &RingBuffer) {
        let remote = self.binding.lock().and_then(|b| b.remote);
        let mut loss = PacketLossCounter::new();
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];

        while let Some(socket) = self.current_socket() {
            let (len, from) = match socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    continue;
                }
                Err(err) => {
                    if self.stopping() {
                        break;
                    }
                    warn!(error = %err, "datagram receive failed, dropping socket");
                    let mut slot = self.socket.lock();
                    if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, &socket)) {
                        slot.take();
                    }
                    continue;
                }
            };
            self.stats.packets_received.fetch_add(1, Ordering::Relaxed);

            if remote.is_some_and(|ip| ip != from.ip()) {
                self.stats.foreign.fetch_add(1, Ordering::Relaxed);
                trace!(%from, "datagram from unexpected source dropped");
                continue;
            }
            // Header-only (or shorter) datagrams carry nothing worth copying
            if len <= RTP_HEADER_SIZE {
                continue;
            }
            let datagram = &buf[..len];
            match RtpHeader::parse(datagram) {
                Some(header) if header.is_valid() => {
                    let missing = loss.observe(header.sequence);
                    if missing > 0 {
                        self.stats.packets_lost.fetch_add(missing, Ordering::Relaxed);
                        debug!(missing, sequence = header.sequence, "rtp sequence gap");
                    }
                }
                _ => {
                    self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }

            let payload = payload_of(datagram);
            match sink.write(payload) {
                Ok(()) => {
                    self.stats
                        .bytes_forwarded
                        .fetch_add(payload.len() as u64, Ordering::Relaxed);
                }
                Err(BufferError::Closed) => {
                    debug!("ring buffer closed, producer stopping");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "ring buffer write failed");
                    break;
                }
            }
        }
        info!("producer thread has disconnected");
    }

    fn watchdog(&self) {
        let interval = self.config.watchdog_interval();
        let mut last = self.stats.packets_received.load(Ordering::Relaxed);
        let mut first_seen = last > 0;

        loop {
            {
                let mut guard = self.watchdog_lock.lock();
                if self.stopping() {
                    break;
                }
                self.watchdog_wake.wait_for(&mut guard, interval);
            }
            if self.stopping() {
                break;
            }

            let now = self.stats.packets_received.load(Ordering::Relaxed);
            if now == last {
                info!(?interval, "no datagrams received, rebuilding socket");
                self.rebuild_socket();
            } else if !first_seen {
                first_seen = true;
                info!(count = now - last, "received first datagrams");
            }
            last = now;
        }
        debug!("packets monitor thread has stopped");
    }

    fn rebuild_socket(&self) {
        let Some(binding) = *self.binding.lock() else {
            return;
        };
        // Close first so the replacement is not competing with a stalled socket
        self.socket.lock().take();

        match create_udp_socket(
            binding.local,
            self.config.udp_receive_buffer,
            self.config.read_timeout(),
        ) {
            Ok(socket) => {
                let mut slot = self.socket.lock();
                if self.stopping() {
                    return;
                }
                *slot = Some(Arc::new(socket));
                self.stats.socket_rebuilds.fetch_add(1, Ordering::Relaxed);
                self.socket_ready.notify_all();
                debug!(local = %binding.local, "socket rebuilt");
            }
            Err(err) => {
                error!(local = %binding.local, error = %err, "failed to rebuild socket");
            }
        }
    }
}
