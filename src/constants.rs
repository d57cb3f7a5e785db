//! Constants for RTP ingest, MPEG-TS remuxing and the upload protocol

/// MPEG-TS packet constants
pub const TS_PACKET_SIZE: usize = 188;
pub const TS_SYNC_BYTE: u8 = 0x47;
pub const TS_PAYLOAD_SIZE: usize = TS_PACKET_SIZE - 4;

/// PES packet constants
pub const PES_START_CODE: [u8; 3] = [0x00, 0x00, 0x01];

/// PTS/DTS run on a 90 kHz clock, 33 bits wide
pub const PTS_CLOCK_HZ: u64 = 90_000;
pub const PTS_MASK: u64 = (1u64 << 33) - 1;

/// Fixed RTP header, forwarded payload starts right after it
pub const RTP_HEADER_SIZE: usize = 12;
pub const RTP_VERSION: u8 = 2;
/// A transmitted datagram should never exceed one Ethernet MTU
pub const MAX_DATAGRAM_SIZE: usize = 1500;

/// Producer defaults
pub const DEFAULT_UDP_RECEIVE_BUFFER: usize = 1_328_000;
pub const DEFAULT_WATCHDOG_INTERVAL_MS: u64 = 5_000;
pub const MIN_WATCHDOG_INTERVAL_MS: u64 = 100;
pub const DEFAULT_SOCKET_WAIT_MS: u64 = 1_000;
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 250;
pub const MIN_READ_TIMEOUT_MS: u64 = 10;

/// Probe window / analyze budget bounds
pub const DEFAULT_MIN_PROBE_SIZE: u64 = 800_128;
pub const FLOOR_MIN_PROBE_SIZE: u64 = 600_096;
pub const DEFAULT_MAX_PROBE_SIZE: u64 = 5_617_370;
pub const DEFAULT_MIN_ANALYZE_US: u64 = 800_000;
pub const FLOOR_MIN_ANALYZE_US: u64 = 600_000;
pub const DEFAULT_MAX_ANALYZE_US: u64 = 5_000_000;

/// Staging buffer and transfer sizes. Smaller write units corrupt the stream.
pub const DEFAULT_RW_BUFFER_SIZE: usize = 20_680;
pub const FLOOR_RW_BUFFER_SIZE: usize = 10_340;
pub const DEFAULT_MIN_TRANSFER_SIZE: usize = 20_680;

/// Ring buffer: the whole probe window plus room to catch up
pub const DEFAULT_RING_BUFFER_SIZE: usize = 7_864_320;
pub const RING_BUFFER_SLACK: usize = 1_123_474;

/// Switch requesters re-check consumer liveness this often
pub const DEFAULT_SWITCH_POLL_MS: u64 = 500;

/// Upload protocol
pub const DEFAULT_UPLOAD_PORT: u16 = 7818;
pub const DEFAULT_UPLOAD_CONNECT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_UPLOAD_IO_TIMEOUT_MS: u64 = 10_000;

/// Output TS layout
pub const OUTPUT_TRANSPORT_STREAM_ID: u16 = 1;
pub const OUTPUT_PROGRAM_NUMBER: u16 = 1;
pub const OUTPUT_PMT_PID: u16 = 0x1000;
pub const OUTPUT_FIRST_ES_PID: u16 = 0x0100;
/// PAT/PMT are repeated after this many written PES packets
pub const PSI_REPEAT_PACKETS: u32 = 40;
/// PCR trails the DTS it is derived from by this many 90 kHz ticks
pub const PCR_DTS_OFFSET: u64 = 9_000;
