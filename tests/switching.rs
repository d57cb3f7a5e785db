mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::*;
use tsrelay::buffer::RingBuffer;
use tsrelay::config::UploadConfig;
use tsrelay::constants::{OUTPUT_PMT_PID, TS_PACKET_SIZE};
use tsrelay::consumer::{ConsumerHandle, ConsumerState, RemuxConsumer};
use tsrelay::destination::{Destination, DestinationSpec};
use tsrelay::error::SwitchError;
use tsrelay::processor::TsDemuxer;
use tsrelay::remux::TsRemuxEngine;

const INPUT_LEN: usize = 1_000_000;

struct Run {
    ring: Arc<RingBuffer>,
    handle: ConsumerHandle,
    worker: thread::JoinHandle<Result<(), tsrelay::error::ConsumerError>>,
}

fn start(first: &DestinationSpec, upload: UploadConfig) -> Run {
    let config = consumer_config();
    let ring = Arc::new(RingBuffer::new(config.ring_buffer_size));
    let destination = Destination::open(first, &upload).expect("open destination");
    let (consumer, handle) = RemuxConsumer::new(config, upload);
    let source = Arc::clone(&ring);
    let worker = thread::spawn(move || consumer.run(source, Box::new(ChunkEngine::new(500)), destination));
    Run { ring, handle, worker }
}

/// Feed `input` while a switch to `target` is requested from another
/// thread, then drain. Returns the switch outcome.
fn switch_mid_stream(run: Run, input: &[u8], target: DestinationSpec) -> Result<(), SwitchError> {
    let Run { ring, handle, worker } = run;

    ring.write(&input[..50_000]).expect("write");
    wait_until("first transfers", || handle.snapshot().total_bytes >= 40_000);
    assert_eq!(handle.state(), ConsumerState::Streaming);

    let requester = {
        let handle = handle.clone();
        thread::spawn(move || handle.switch_to(target))
    };
    let mut pos = 50_000;
    while !requester.is_finished() {
        assert!(pos < INPUT_LEN, "switch never landed");
        ring.write(&input[pos..pos + 1_000]).expect("write");
        pos += 1_000;
        thread::sleep(Duration::from_millis(1));
    }
    let outcome = requester.join().expect("requester");

    ring.write(&input[pos..]).expect("write");
    ring.close();
    worker.join().expect("consumer thread").expect("consumer");
    assert_eq!(handle.state(), ConsumerState::Stopped);
    assert_eq!(handle.snapshot().total_bytes, input.len() as u64);
    outcome
}

#[test]
fn local_switch_splits_the_stream_without_gaps() {
    let dir = tempfile::tempdir().expect("tempdir");
    let first = dir.path().join("capture.ts");
    let second = dir.path().join("capture.1.ts");
    let input = pattern(INPUT_LEN);

    let run = start(
        &DestinationSpec::LocalFile {
            path: first.clone(),
            wrap_at: None,
        },
        upload_config(),
    );
    switch_mid_stream(
        run,
        &input,
        DestinationSpec::LocalFile {
            path: second.clone(),
            wrap_at: None,
        },
    )
    .expect("switch");

    let old = std::fs::read(&first).expect("first file");
    let new = std::fs::read(&second).expect("second file");
    assert!(!old.is_empty());
    assert!(!new.is_empty());
    assert_eq!([old, new].concat(), input);
}

#[test]
fn remote_switch_on_the_same_server_reuses_the_connection() {
    let server = FakeUploadServer::start(true);
    let input = pattern(INPUT_LEN);

    let run = start(
        &DestinationSpec::RemoteUpload {
            server: server.address().to_string(),
            filename: "show.ts".into(),
            upload_id: 11,
            wrap_at: None,
        },
        upload_config(),
    );
    switch_mid_stream(
        run,
        &input,
        DestinationSpec::RemoteUpload {
            server: server.address().to_string(),
            filename: "show.1.ts".into(),
            upload_id: 12,
            wrap_at: None,
        },
    )
    .expect("switch");

    let events = server.events();
    let opens = events.iter().filter(|e| matches!(e, UploadEvent::Open { .. })).count();
    assert_eq!(opens, 1);
    assert!(events.contains(&UploadEvent::Switch {
        filename: "show.1.ts".into(),
        upload_id: 12,
        accepted: true,
    }));
    assert_eq!(events.last(), Some(&UploadEvent::Close));

    let files = server.files();
    assert_eq!(files.len(), 2);
    assert_eq!(files[0].0, "show.ts");
    assert_eq!(files[1].0, "show.1.ts");
    assert!(!files[0].1.is_empty());
    assert!(!files[1].1.is_empty());
    assert_eq!([files[0].1.clone(), files[1].1.clone()].concat(), input);
}

#[test]
fn refused_switch_keeps_writing_the_current_upload() {
    let server = FakeUploadServer::start(false);
    let input = pattern(INPUT_LEN);

    let run = start(
        &DestinationSpec::RemoteUpload {
            server: server.address().to_string(),
            filename: "show.ts".into(),
            upload_id: 11,
            wrap_at: None,
        },
        upload_config(),
    );
    let outcome = switch_mid_stream(
        run,
        &input,
        DestinationSpec::RemoteUpload {
            server: server.address().to_string(),
            filename: "show.1.ts".into(),
            upload_id: 12,
            wrap_at: None,
        },
    );
    assert!(matches!(outcome, Err(SwitchError::Rejected(_))), "{outcome:?}");

    let files = server.files();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].0, "show.ts");
    assert_eq!(files[0].1, input);
}

#[test]
fn switch_after_the_consumer_ended_fails_fast() {
    let dir = tempfile::tempdir().expect("tempdir");
    let run = start(
        &DestinationSpec::LocalFile {
            path: dir.path().join("short.ts"),
            wrap_at: None,
        },
        upload_config(),
    );
    run.ring.write(&pattern(10_000)).expect("write");
    run.ring.close();
    run.worker.join().expect("consumer thread").expect("consumer");

    assert!(!run.handle.is_alive());
    assert!(matches!(
        run.handle.switch_to(DestinationSpec::Discard),
        Err(SwitchError::ConsumerStopped)
    ));
    let written = std::fs::read(dir.path().join("short.ts")).expect("file");
    assert_eq!(written, pattern(10_000));
}

fn pid(packet: &[u8]) -> u16 {
    u16::from(packet[1] & 0x1F) << 8 | u16::from(packet[2])
}

fn units_in(recording: &[u8]) -> (usize, usize) {
    let mut demux = TsDemuxer::new();
    let mut units = Vec::new();
    for packet in recording.chunks(TS_PACKET_SIZE) {
        demux.push(packet, &mut units);
    }
    demux.flush(&mut units);
    (demux.tracks().len(), units.len())
}

#[test]
fn switched_recording_starts_with_program_tables() {
    const LONG_FRAMES: u64 = 600;
    let dir = tempfile::tempdir().expect("tempdir");
    let first = dir.path().join("show.ts");
    let second = dir.path().join("show.1.ts");
    let input = broadcast_frames(LONG_FRAMES);

    let config = consumer_config();
    let ring = Arc::new(RingBuffer::new(config.ring_buffer_size));
    let destination = Destination::open(
        &DestinationSpec::LocalFile {
            path: first.clone(),
            wrap_at: None,
        },
        &upload_config(),
    )
    .expect("open destination");
    let (consumer, handle) = RemuxConsumer::new(config, upload_config());
    let source = Arc::clone(&ring);
    let worker = thread::spawn(move || consumer.run(source, Box::new(TsRemuxEngine::new()), destination));

    ring.write(&input[..60_000]).expect("write");
    wait_until("first transfers", || handle.snapshot().total_bytes >= 20_000);
    let requester = {
        let handle = handle.clone();
        let target = DestinationSpec::LocalFile {
            path: second.clone(),
            wrap_at: None,
        };
        thread::spawn(move || handle.switch_to(target))
    };
    let mut pos = 60_000;
    while !requester.is_finished() {
        assert!(pos < input.len(), "switch never landed");
        let end = (pos + 1_000).min(input.len());
        ring.write(&input[pos..end]).expect("write");
        pos = end;
        thread::sleep(Duration::from_millis(1));
    }
    requester.join().expect("requester").expect("switch");
    ring.write(&input[pos..]).expect("write");
    ring.close();
    worker.join().expect("consumer thread").expect("consumer");

    let old = std::fs::read(&first).expect("first file");
    let new = std::fs::read(&second).expect("second file");
    assert_eq!(old.len() % TS_PACKET_SIZE, 0);
    assert_eq!(new.len() % TS_PACKET_SIZE, 0);
    assert!(new.len() >= 2 * TS_PACKET_SIZE);
    assert_eq!(pid(&new[..TS_PACKET_SIZE]), 0);
    assert_eq!(pid(&new[TS_PACKET_SIZE..]), OUTPUT_PMT_PID);

    let (old_tracks, old_units) = units_in(&old);
    let (new_tracks, new_units) = units_in(&new);
    assert_eq!(old_tracks, 3);
    assert_eq!(new_tracks, 3);
    assert_eq!((old_units + new_units) as u64, 3 * LONG_FRAMES);
}
