use bytes::Bytes;
use serde::Serialize;

use crate::constants::PTS_CLOCK_HZ;

/// Video codec information
#[derive(Debug, Clone, Serialize)]
pub struct VideoInfo {
    pub codec: String,
    pub width: u16,
    pub height: u16,
    pub fps: f32,
}

/// Audio codec information
#[derive(Debug, Clone, Serialize)]
pub struct AudioInfo {
    pub codec: String,
    pub profile: Option<String>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
    Subtitle,
    Data,
}

/// Time base as a fraction of a second
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Rational {
    pub num: i64,
    pub den: i64,
}

impl Rational {
    pub const MPEG_90K: Rational = Rational {
        num: 1,
        den: PTS_CLOCK_HZ as i64,
    };

    pub const fn new(num: i64, den: i64) -> Self {
        Self { num, den }
    }
}

/// Rescale `value` from time base `from` to `to`, rounding to nearest with
/// halves away from zero.
pub fn rescale(value: i64, from: Rational, to: Rational) -> i64 {
    if from == to {
        return value;
    }
    let num = value as i128 * from.num as i128 * to.den as i128;
    let den = from.den as i128 * to.num as i128;
    if den == 0 {
        return value;
    }
    let (num, den) = if den < 0 { (-num, -den) } else { (num, den) };
    let half = den / 2;
    let rounded = if num >= 0 {
        (num + half) / den
    } else {
        (num - half) / den
    };
    rounded.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Engine-produced description of one input stream.
///
/// Parameters are zero until the engine has seen enough of the stream to
/// know them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamDescriptor {
    pub index: usize,
    /// Container-level identifier (the PID for MPEG-TS)
    pub id: u32,
    pub kind: MediaKind,
    pub codec: String,
    /// Container codec tag (the PMT stream_type for MPEG-TS)
    pub codec_tag: u32,
    pub time_base: Rational,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub sample_rate: u32,
    /// Units seen while probing
    pub frames: u64,
}

impl StreamDescriptor {
    /// Whether the parameters a remux needs are known.
    pub fn is_identified(&self) -> bool {
        match self.kind {
            MediaKind::Video => self.width > 0 && self.height > 0,
            MediaKind::Audio => self.channels > 0,
            MediaKind::Subtitle => true,
            MediaKind::Data => false,
        }
    }
}

/// One encoded unit
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub stream_index: usize,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: Option<i64>,
    pub data: Bytes,
    pub keyframe: bool,
}

/// Bounds for one probing attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProbeLimits {
    /// Bytes of input the engine may read
    pub probe_size: u64,
    /// Stream-time span the engine may analyze
    pub analyze_duration_us: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescale_rounds_half_away_from_zero() {
        let ms = Rational::new(1, 1_000);
        // 45 ticks of 90 kHz = 0.5 ms
        assert_eq!(rescale(45, Rational::MPEG_90K, ms), 1);
        assert_eq!(rescale(-45, Rational::MPEG_90K, ms), -1);
        assert_eq!(rescale(44, Rational::MPEG_90K, ms), 0);
        assert_eq!(rescale(90_000, Rational::MPEG_90K, ms), 1_000);
        assert_eq!(rescale(3, ms, Rational::MPEG_90K), 270);
        assert_eq!(rescale(7, ms, ms), 7);
    }

    #[test]
    fn identification_rules() {
        let mut desc = StreamDescriptor {
            index: 0,
            id: 0x100,
            kind: MediaKind::Video,
            codec: "h264".into(),
            codec_tag: 0x1B,
            time_base: Rational::MPEG_90K,
            width: 1920,
            height: 0,
            channels: 0,
            sample_rate: 0,
            frames: 0,
        };
        assert!(!desc.is_identified());
        desc.height = 1080;
        assert!(desc.is_identified());

        desc.kind = MediaKind::Audio;
        assert!(!desc.is_identified());
        desc.channels = 2;
        assert!(desc.is_identified());
    }
}
