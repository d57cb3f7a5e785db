//! Codec header sniffers for elementary streams
//!
//! Just enough to identify a stream for remuxing: picture size for video,
//! channel count and sample rate for audio. Nothing is decoded.

mod audio;
mod utils;
mod video;

pub use audio::{parse_aac_adts, parse_aac_latm, parse_ac3, parse_mp2};
pub use video::{parse_avc, parse_hevc, parse_mpeg2_seq_hdr};

use crate::types::{AudioInfo, MediaKind, StreamDescriptor, VideoInfo};

/// Media kind and codec name implied by a PMT stream_type
pub fn classify(stream_type: u8) -> (MediaKind, &'static str) {
    match stream_type {
        0x01 => (MediaKind::Video, "mpeg1video"),
        0x02 => (MediaKind::Video, "mpeg2video"),
        0x1B => (MediaKind::Video, "h264"),
        0x24 => (MediaKind::Video, "hevc"),
        0x03 | 0x04 => (MediaKind::Audio, "mp2"),
        0x0F => (MediaKind::Audio, "aac"),
        0x11 => (MediaKind::Audio, "aac_latm"),
        0x81 => (MediaKind::Audio, "ac3"),
        0x06 => (MediaKind::Subtitle, "dvb_subtitle"),
        _ => (MediaKind::Data, "data"),
    }
}

/// Parse any video codec from elementary stream data
pub fn parse_video_codec(stream_type: u8, data: &[u8]) -> Option<VideoInfo> {
    match stream_type {
        0x01 | 0x02 => parse_mpeg2_seq_hdr(data),
        0x1B => parse_avc(data),
        0x24 => parse_hevc(data),
        _ => None,
    }
}

/// Parse any audio codec from elementary stream data
pub fn parse_audio_codec(stream_type: u8, data: &[u8]) -> Option<AudioInfo> {
    match stream_type {
        0x03 | 0x04 => parse_mp2(data),
        0x0F => parse_aac_adts(data),
        0x11 => parse_aac_latm(data),
        0x81 => parse_ac3(data),
        _ => None,
    }
}

/// Fill in the parameters of `desc` from one ES payload. Returns true when
/// this call made the stream identified.
pub fn identify(desc: &mut StreamDescriptor, es: &[u8]) -> bool {
    if desc.is_identified() {
        return false;
    }
    let stream_type = desc.codec_tag as u8;
    match desc.kind {
        MediaKind::Video => {
            if let Some(video) = parse_video_codec(stream_type, es) {
                desc.codec = video.codec;
                desc.width = video.width as u32;
                desc.height = video.height as u32;
            }
        }
        MediaKind::Audio => {
            if let Some(audio) = parse_audio_codec(stream_type, es) {
                desc.codec = audio.codec;
                desc.channels = audio.channels.unwrap_or(0) as u32;
                desc.sample_rate = audio.sample_rate.unwrap_or(0);
            }
        }
        MediaKind::Subtitle | MediaKind::Data => {}
    }
    desc.is_identified()
}
