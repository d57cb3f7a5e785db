#![allow(dead_code)]

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use socket2::SockRef;
use tsrelay::config::{ConsumerConfig, ProducerConfig, RelayConfig, UploadConfig};
use tsrelay::error::EngineError;
use tsrelay::muxer::TsMuxer;
use tsrelay::remux::{ReadSeek, RemuxEngine};
use tsrelay::types::{MediaKind, Packet, ProbeLimits, Rational, StreamDescriptor};

/// Poll `done` until it holds; panics after five seconds.
pub fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Deterministic filler that makes misplaced bytes show up in comparisons.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

pub fn rtp_datagram(seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0x80, 33];
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(&(seq as u32 * 3_600).to_be_bytes());
    out.extend_from_slice(&0x1234_5678u32.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Small transfers and a short switch poll so tests move quickly.
pub fn consumer_config() -> ConsumerConfig {
    ConsumerConfig {
        min_probe_size: 2_000,
        max_probe_size: 200_000,
        min_analyze_duration_us: 100_000,
        max_analyze_duration_us: 5_000_000,
        rw_buffer_size: 940,
        min_transfer_size: 940,
        ring_buffer_size: 1 << 20,
        switch_poll_ms: 20,
    }
}

pub fn relay_config() -> RelayConfig {
    RelayConfig {
        producer: ProducerConfig {
            udp_receive_buffer: 1 << 20,
            watchdog_interval_ms: 10_000,
            socket_wait_ms: 50,
            read_timeout_ms: 20,
            raise_priority: false,
        },
        consumer: consumer_config(),
        upload: upload_config(),
        ..RelayConfig::default()
    }
}

pub fn upload_config() -> UploadConfig {
    UploadConfig {
        port: 7818,
        connect_timeout_ms: 1_000,
        io_timeout_ms: 2_000,
        fallback_to_file: false,
    }
}

pub fn video_descriptor(index: usize) -> StreamDescriptor {
    StreamDescriptor {
        index,
        id: 0x100 + index as u32,
        kind: MediaKind::Video,
        codec: "mpeg2video".into(),
        codec_tag: 0x02,
        time_base: Rational::MPEG_90K,
        width: 720,
        height: 480,
        channels: 0,
        sample_rate: 0,
        frames: 1,
    }
}

pub fn audio_descriptor(index: usize, codec: &str, codec_tag: u32, channels: u32) -> StreamDescriptor {
    StreamDescriptor {
        index,
        id: 0x100 + index as u32,
        kind: MediaKind::Audio,
        codec: codec.into(),
        codec_tag,
        time_base: Rational::MPEG_90K,
        width: 0,
        height: 0,
        channels,
        sample_rate: 48_000,
        frames: 1,
    }
}

// MPEG-2 sequence header, 720x576
const SEQUENCE_HEADER: [u8; 12] = [0x00, 0x00, 0x01, 0xB3, 0x2D, 0x02, 0x40, 0x33, 0xFF, 0xFF, 0xE0, 0x18];
// ADTS, 48 kHz stereo
const ADTS_STEREO: [u8; 9] = [0xFF, 0xF1, 0x4C, 0x80, 0x2E, 0x7F, 0xFC, 0x21, 0x00];
// AC-3 sync frame, 48 kHz 3/2 + LFE
const AC3_SURROUND: [u8; 9] = [0x0B, 0x77, 0x00, 0x00, 0x14, 0x40, 0xE1, 0x00, 0x00];

pub const FRAMES: u64 = 30;

fn unit(stream_index: usize, dts: u64, head: &[u8], body: usize, keyframe: bool) -> Packet {
    let mut data = head.to_vec();
    data.resize(head.len() + body, 0xAA);
    Packet {
        stream_index,
        pts: Some(dts as i64),
        dts: Some(dts as i64),
        duration: None,
        data: Bytes::from(data),
        keyframe,
    }
}

/// A broadcast-like program: MPEG-2 video, stereo AAC, 5.1 AC-3.
pub fn broadcast() -> Vec<u8> {
    broadcast_frames(FRAMES)
}

pub fn broadcast_frames(frames: u64) -> Vec<u8> {
    let layout = [
        video_descriptor(0),
        audio_descriptor(1, "aac", 0x0F, 2),
        audio_descriptor(2, "ac3", 0x81, 6),
    ];
    let mut muxer = TsMuxer::new(&layout);
    let mut out = Vec::new();
    for i in 0..frames {
        let base = 90_000;
        muxer
            .write_packet(&mut out, &unit(0, base + i * 3_600, &SEQUENCE_HEADER, 400, i % 12 == 0))
            .expect("video");
        muxer
            .write_packet(&mut out, &unit(1, base + i * 1_920, &ADTS_STEREO, 120, false))
            .expect("aac");
        muxer
            .write_packet(&mut out, &unit(2, base + i * 2_880, &AC3_SURROUND, 200, false))
            .expect("ac3");
    }
    out
}

/// Engine that passes the input through unchanged in chunks of at most
/// `chunk` bytes, so the destinations must reproduce the input exactly.
pub struct ChunkEngine {
    chunk: usize,
    open: bool,
}

impl ChunkEngine {
    pub fn new(chunk: usize) -> Self {
        Self { chunk, open: false }
    }
}

impl RemuxEngine for ChunkEngine {
    fn probe(&mut self, _input: &mut dyn ReadSeek, _limits: ProbeLimits) -> Result<Vec<StreamDescriptor>, EngineError> {
        Ok(vec![video_descriptor(0), audio_descriptor(1, "ac3", 0x81, 2)])
    }

    fn reset_input(&mut self) {}

    fn read_packet(&mut self, input: &mut dyn ReadSeek) -> Result<Option<Packet>, EngineError> {
        let mut data = vec![0u8; self.chunk];
        let n = input.read(&mut data)?;
        if n == 0 {
            return Ok(None);
        }
        data.truncate(n);
        Ok(Some(Packet {
            stream_index: 0,
            pts: None,
            dts: None,
            duration: None,
            data: Bytes::from(data),
            keyframe: false,
        }))
    }

    fn open_output(&mut self, streams: &[StreamDescriptor]) -> Result<Vec<Rational>, EngineError> {
        self.open = true;
        Ok(vec![Rational::MPEG_90K; streams.len()])
    }

    fn write_header(&mut self, _out: &mut dyn Write) -> Result<(), EngineError> {
        Ok(())
    }

    fn write_packet(&mut self, out: &mut dyn Write, packet: &Packet) -> Result<(), EngineError> {
        if !self.open {
            return Err(EngineError::NotOpen);
        }
        out.write_all(&packet.data)?;
        Ok(())
    }

    fn write_trailer(&mut self, _out: &mut dyn Write) -> Result<(), EngineError> {
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    Open { filename: String, upload_id: u32 },
    Switch { filename: String, upload_id: u32, accepted: bool },
    Write { offset: u64, data: Vec<u8> },
    Close,
    RefusedOpen { filename: String },
    /// The server reset the connection
    Reset,
}

/// How the fake upload server treats its clients.
#[derive(Debug, Clone, Copy)]
pub struct ServerBehavior {
    pub accept_switch: bool,
    /// Reset the first connection after this many WRITE commands
    pub reset_after_writes: Option<usize>,
    /// Answer NO to WRITEOPEN on every connection but the first
    pub refuse_reopen: bool,
}

impl Default for ServerBehavior {
    fn default() -> Self {
        Self {
            accept_switch: true,
            reset_after_writes: None,
            refuse_reopen: false,
        }
    }
}

/// Loopback stand-in for the media server's upload service. Every command
/// is logged before it is answered.
pub struct FakeUploadServer {
    address: String,
    events: Arc<Mutex<Vec<UploadEvent>>>,
}

impl FakeUploadServer {
    pub fn start(accept_switch: bool) -> Self {
        Self::with_behavior(ServerBehavior {
            accept_switch,
            ..ServerBehavior::default()
        })
    }

    pub fn with_behavior(behavior: ServerBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind upload server");
        let address = listener.local_addr().expect("addr").to_string();
        let events = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&events);
        thread::spawn(move || {
            for (index, stream) in listener.incoming().enumerate() {
                let Ok(stream) = stream else { break };
                let log = Arc::clone(&log);
                thread::spawn(move || serve(stream, log, behavior, index == 0));
            }
        });
        Self { address, events }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn events(&self) -> Vec<UploadEvent> {
        self.events.lock().clone()
    }

    /// Wait until the server has reset a connection, and give the reset
    /// time to reach the client.
    pub fn wait_for_reset(&self) {
        wait_until("connection reset", || self.events().contains(&UploadEvent::Reset));
        thread::sleep(Duration::from_millis(100));
    }

    /// Contents of every file opened or switched to, in order. Opening a
    /// file again continues it.
    pub fn files(&self) -> Vec<(String, Vec<u8>)> {
        let mut files: Vec<(String, Vec<u8>)> = Vec::new();
        let mut current = 0;
        for event in self.events() {
            match event {
                UploadEvent::Open { filename, .. }
                | UploadEvent::Switch {
                    filename,
                    accepted: true,
                    ..
                } => {
                    current = match files.iter().position(|(name, _)| *name == filename) {
                        Some(index) => index,
                        None => {
                            files.push((filename, Vec::new()));
                            files.len() - 1
                        }
                    };
                }
                UploadEvent::Write { offset, data } => {
                    let (_, file) = files.get_mut(current).expect("write before open");
                    let start = offset as usize;
                    if file.len() < start + data.len() {
                        file.resize(start + data.len(), 0);
                    }
                    file[start..start + data.len()].copy_from_slice(&data);
                }
                _ => {}
            }
        }
        files
    }
}

fn serve(stream: std::net::TcpStream, log: Arc<Mutex<Vec<UploadEvent>>>, behavior: ServerBehavior, first: bool) {
    let Ok(mut writer) = stream.try_clone() else { return };
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let mut writes = 0;
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let words: Vec<&str> = line.split_whitespace().collect();
        let reply = match words.as_slice() {
            ["WRITEOPEN", filename, _] if !first && behavior.refuse_reopen => {
                log.lock().push(UploadEvent::RefusedOpen {
                    filename: filename.to_string(),
                });
                Some("NO")
            }
            ["WRITEOPEN", filename, id] => {
                log.lock().push(UploadEvent::Open {
                    filename: filename.to_string(),
                    upload_id: id.parse().unwrap_or(0),
                });
                Some("OK")
            }
            ["SWITCH", filename, id] => {
                log.lock().push(UploadEvent::Switch {
                    filename: filename.to_string(),
                    upload_id: id.parse().unwrap_or(0),
                    accepted: behavior.accept_switch,
                });
                Some(if behavior.accept_switch { "OK" } else { "NO" })
            }
            ["WRITE", offset, len] => {
                let mut data = vec![0u8; len.parse().unwrap_or(0)];
                if reader.read_exact(&mut data).is_err() {
                    return;
                }
                log.lock().push(UploadEvent::Write {
                    offset: offset.parse().unwrap_or(0),
                    data,
                });
                writes += 1;
                if first && behavior.reset_after_writes == Some(writes) {
                    // zero linger turns the close into a reset
                    let _ = SockRef::from(&writer).set_linger(Some(Duration::ZERO));
                    log.lock().push(UploadEvent::Reset);
                    return;
                }
                None
            }
            ["CLOSE"] => {
                log.lock().push(UploadEvent::Close);
                Some("OK")
            }
            ["QUIT"] => return,
            _ => Some("ERROR"),
        };
        if let Some(reply) = reply {
            if writer.write_all(format!("{reply}\r\n").as_bytes()).is_err() {
                return;
            }
        }
    }
}
