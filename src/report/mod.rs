//! Status report for a capture session

use serde::Serialize;

use crate::buffer::RingBuffer;
use crate::consumer::ConsumerSnapshot;
use crate::producer::ProducerSnapshot;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BufferStatus {
    pub capacity: usize,
    pub readable: usize,
    pub closed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub timestamp: String,
    pub producer: ProducerSnapshot,
    pub buffer: BufferStatus,
    pub consumer: ConsumerSnapshot,
}

/// Builds [`SessionReport`]s
pub struct Reporter;

impl Reporter {
    pub fn create_report(
        producer: ProducerSnapshot,
        ring: &RingBuffer,
        consumer: ConsumerSnapshot,
    ) -> SessionReport {
        SessionReport {
            timestamp: chrono::Utc::now().to_rfc3339(),
            producer,
            buffer: BufferStatus {
                capacity: ring.capacity(),
                readable: ring.read_available(),
                closed: ring.is_closed(),
            },
            consumer,
        }
    }

    /// Pretty-printed JSON for the CLI
    pub fn to_json(report: &SessionReport) -> String {
        serde_json::to_string_pretty(report).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::ConsumerState;

    #[test]
    fn report_shape() {
        let ring = RingBuffer::new(1_000);
        ring.write(&[0u8; 10]).expect("write");
        let consumer = ConsumerSnapshot {
            state: ConsumerState::Streaming,
            destination: "discard".into(),
            bytes_streamed: 5,
            total_bytes: 5,
            packets_written: 1,
            duplicates_dropped: 0,
            unmapped_dropped: 0,
            failure: None,
        };
        let report = Reporter::create_report(ProducerSnapshot::default(), &ring, consumer);
        let value: serde_json::Value =
            serde_json::from_str(&Reporter::to_json(&report)).expect("json");

        assert_eq!(value["buffer"]["capacity"], 1_000);
        assert_eq!(value["buffer"]["readable"], 10);
        assert_eq!(value["consumer"]["state"], "streaming");
        assert!(value["producer"]["packets_received"].is_u64());
        assert!(chrono::DateTime::parse_from_rfc3339(value["timestamp"].as_str().expect("ts")).is_ok());
    }
}
