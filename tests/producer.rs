mod common;

use std::net::UdpSocket;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::*;
use tsrelay::buffer::RingBuffer;
use tsrelay::config::ProducerConfig;
use tsrelay::producer::RtpProducer;

fn config(watchdog_interval_ms: u64) -> ProducerConfig {
    ProducerConfig {
        udp_receive_buffer: 256 * 1024,
        watchdog_interval_ms,
        socket_wait_ms: 50,
        read_timeout_ms: 20,
        raise_priority: false,
    }
}

fn start(producer: &RtpProducer, ring: &Arc<RingBuffer>) -> thread::JoinHandle<()> {
    let producer = producer.clone();
    let sink = Arc::clone(ring);
    thread::spawn(move || producer.run(sink).expect("producer"))
}

#[test]
fn silence_rebuilds_the_socket_on_the_same_port() {
    let producer = RtpProducer::new(config(200));
    producer.bind(None, "127.0.0.1:0".parse().expect("addr")).expect("bind");
    let port = producer.local_port().expect("port");
    let ring = Arc::new(RingBuffer::new(64 * 1024));
    let worker = start(&producer, &ring);

    let sender = UdpSocket::bind("127.0.0.1:0").expect("sender");
    let target = ("127.0.0.1", port);
    sender.send_to(&rtp_datagram(1, b"abc"), target).expect("send");
    wait_until("first payload", || producer.snapshot().bytes_forwarded == 3);

    wait_until("socket rebuild", || producer.snapshot().socket_rebuilds >= 1);
    assert_eq!(producer.local_port(), Some(port));

    // A datagram can race a rebuild, so keep sending until one lands
    let mut seq = 2u16;
    while producer.snapshot().bytes_forwarded == 3 {
        assert!(seq < 200, "nothing received after the rebuild");
        sender.send_to(&rtp_datagram(seq, b"defg"), target).expect("send");
        seq += 1;
        thread::sleep(Duration::from_millis(30));
    }

    producer.stop();
    worker.join().expect("producer thread");

    let mut received = [0u8; 7];
    assert_eq!(ring.read(&mut received), 7);
    assert_eq!(&received, b"abcdefg");
}

#[test]
fn payloads_reach_the_ring_in_order_and_gaps_are_counted() {
    let producer = RtpProducer::new(config(10_000));
    producer.bind(None, "127.0.0.1:0".parse().expect("addr")).expect("bind");
    let port = producer.local_port().expect("port");
    let ring = Arc::new(RingBuffer::new(64 * 1024));
    let worker = start(&producer, &ring);

    let sender = UdpSocket::bind("127.0.0.1:0").expect("sender");
    let target = ("127.0.0.1", port);
    sender.send_to(&rtp_datagram(10, b"one"), target).expect("send");
    sender.send_to(&rtp_datagram(11, b"two"), target).expect("send");
    // sequence 12 and 13 never arrive
    sender.send_to(&rtp_datagram(14, b"three"), target).expect("send");
    // not RTP version 2
    sender.send_to(&[0x00; 20], target).expect("send");
    wait_until("all datagrams", || producer.snapshot().packets_received == 4);

    let snapshot = producer.snapshot();
    assert_eq!(snapshot.bytes_forwarded, 11);
    assert_eq!(snapshot.packets_lost, 2);
    assert_eq!(snapshot.malformed, 1);

    // closing the sink ends the receive loop as well
    ring.close();
    let mut received = vec![0u8; 11];
    let mut filled = 0;
    while filled < received.len() {
        let n = ring.read(&mut received[filled..]);
        assert!(n > 0);
        filled += n;
    }
    assert_eq!(received, b"onetwothree");

    producer.stop();
    worker.join().expect("producer thread");
}
