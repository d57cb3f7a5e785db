//! Video codec parsers

use bitstream_io::{BigEndian, BitRead, BitReader};

use super::utils::{remove_ep, se, ue};
use crate::types::VideoInfo;

/// Parse MPEG-1/2 sequence header for video parameters
pub fn parse_mpeg2_seq_hdr(data: &[u8]) -> Option<VideoInfo> {
    // Sequence header starts with 0x000001B3
    for i in 0..data.len().saturating_sub(8) {
        if data[i] == 0x00 && data[i + 1] == 0x00 && data[i + 2] == 0x01 && data[i + 3] == 0xB3 {
            let seq_hdr = &data[i + 4..];
            if seq_hdr.len() >= 8 {
                let horizontal_size = ((seq_hdr[0] as u16) << 4) | ((seq_hdr[1] as u16) >> 4);
                let vertical_size = ((seq_hdr[1] as u16 & 0x0F) << 8) | (seq_hdr[2] as u16);
                let frame_rate_code = seq_hdr[3] & 0x0F;

                let fps = match frame_rate_code {
                    1 => 23.976,
                    2 => 24.0,
                    3 => 25.0,
                    4 => 29.97,
                    5 => 30.0,
                    6 => 50.0,
                    7 => 59.94,
                    8 => 60.0,
                    _ => 0.0,
                };

                if horizontal_size == 0 || vertical_size == 0 {
                    continue;
                }
                return Some(VideoInfo {
                    codec: "mpeg2video".to_string(),
                    width: horizontal_size,
                    height: vertical_size,
                    fps,
                });
            }
        }
    }
    None
}

/// Find the first H.264 SPS NAL in an ES payload and parse it
pub fn parse_avc(data: &[u8]) -> Option<VideoInfo> {
    nal_units(data)
        .find(|nal| nal.first().is_some_and(|h| h & 0x1F == 7))
        .and_then(|nal| parse_avc_sps(&nal[1..]))
}

/// Find the first HEVC SPS NAL (type 33) in an ES payload and parse it
pub fn parse_hevc(data: &[u8]) -> Option<VideoInfo> {
    nal_units(data)
        .find(|nal| nal.len() > 2 && (nal[0] >> 1) & 0x3F == 33)
        .and_then(|nal| parse_hevc_sps(&nal[2..]))
}

/// NAL unit bodies (header byte included) between Annex B start codes
fn nal_units(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0x00 && data[i + 1] == 0x00 && data[i + 2] == 0x01 {
            starts.push(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }
    let ends: Vec<usize> = starts
        .iter()
        .skip(1)
        .map(|&s| s - 3)
        .chain(std::iter::once(data.len()))
        .collect();
    starts
        .into_iter()
        .zip(ends)
        .filter(|(s, e)| s < e)
        .map(move |(s, e)| &data[s..e])
}

fn parse_avc_sps(raw: &[u8]) -> Option<VideoInfo> {
    let rbsp = remove_ep(raw);
    let mut br = BitReader::endian(&rbsp[..], BigEndian);

    // Header
    let profile_idc = br.read::<8, u8>().ok()?;
    br.skip(16).ok()?; // constraint flags + level_idc
    ue(&mut br)?; // seq_parameter_set_id

    // High profiles
    let mut chroma_format_idc = 1;
    if matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 144
    ) {
        chroma_format_idc = ue(&mut br)?;
        if chroma_format_idc == 3 {
            br.skip(1).ok()?; // separate_colour_plane_flag
        }
        ue(&mut br)?; // bit_depth_luma_minus8
        ue(&mut br)?; // bit_depth_chroma_minus8
        br.skip(1).ok()?; // qpprime_y_zero_transform_bypass_flag

        if br.read::<1, u8>().ok()? != 0 {
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for idx in 0..lists {
                if br.read::<1, u8>().ok()? != 0 {
                    skip_scaling_list(&mut br, if idx < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    ue(&mut br)?; // log2_max_frame_num_minus4
    let pic_order_cnt_type = ue(&mut br)?;
    if pic_order_cnt_type == 0 {
        ue(&mut br)?; // log2_max_pic_order_cnt_lsb_minus4
    } else if pic_order_cnt_type == 1 {
        br.skip(1).ok()?; // delta_pic_order_always_zero_flag
        se(&mut br)?; // offset_for_non_ref_pic
        se(&mut br)?; // offset_for_top_to_bottom_field
        let n = ue(&mut br)?;
        for _ in 0..n {
            se(&mut br)?;
        }
    }
    ue(&mut br)?; // max_num_ref_frames
    br.skip(1).ok()?; // gaps_in_frame_num_value_allowed_flag

    let pic_width_in_mbs_minus1 = ue(&mut br)?;
    let pic_height_in_map_units_minus1 = ue(&mut br)?;
    let frame_mbs_only_flag = br.read::<1, u8>().ok()? != 0;
    if !frame_mbs_only_flag {
        br.skip(1).ok()?; // mb_adaptive_frame_field_flag
    }
    br.skip(1).ok()?; // direct_8x8_inference_flag

    let cropping_flag = br.read::<1, u8>().ok()? != 0;
    let (crop_l, crop_r, crop_t, crop_b) = if cropping_flag {
        (ue(&mut br)?, ue(&mut br)?, ue(&mut br)?, ue(&mut br)?)
    } else {
        (0, 0, 0, 0)
    };

    // VUI timing gives the frame rate; anything missing just leaves it at 0
    let fps = read_vui_fps(&mut br).unwrap_or(0.0);

    if pic_width_in_mbs_minus1 > 1024
        || pic_height_in_map_units_minus1 > 1024
        || [crop_l, crop_r, crop_t, crop_b].iter().any(|&c| c > 8192)
    {
        return None;
    }

    let crop_unit_x = match chroma_format_idc {
        0 | 3 => 1,
        _ => 2,
    };
    let crop_unit_y = match chroma_format_idc {
        0 | 3 => 2 - frame_mbs_only_flag as u32,
        _ => 2 * (2 - frame_mbs_only_flag as u32),
    };

    let width = ((pic_width_in_mbs_minus1 + 1) * 16).checked_sub((crop_l + crop_r) * crop_unit_x)?;
    let height_map_units =
        (pic_height_in_map_units_minus1 + 1) * if frame_mbs_only_flag { 1 } else { 2 };
    let height = (height_map_units * 16).checked_sub((crop_t + crop_b) * crop_unit_y)?;

    Some(VideoInfo {
        codec: "h264".to_string(),
        width: u16::try_from(width).ok()?,
        height: u16::try_from(height).ok()?,
        fps,
    })
}

fn skip_scaling_list<R: std::io::Read>(br: &mut BitReader<R, BigEndian>, size: usize) -> Option<()> {
    let mut last = 8i32;
    let mut next = 8i32;
    for _ in 0..size {
        if next != 0 {
            let delta = se(br)?;
            next = (last + delta + 256) % 256;
        }
        if next != 0 {
            last = next;
        }
    }
    Some(())
}

fn read_vui_fps<R: std::io::Read>(br: &mut BitReader<R, BigEndian>) -> Option<f32> {
    if br.read::<1, u8>().ok()? == 0 {
        return None; // vui_parameters_present_flag
    }
    if br.read::<1, u8>().ok()? != 0 {
        // aspect_ratio_info_present_flag
        if br.read::<8, u8>().ok()? == 255 {
            br.skip(32).ok()?; // sar_width/height
        }
    }
    if br.read::<1, u8>().ok()? != 0 {
        br.skip(1).ok()?; // overscan_appropriate_flag
    }
    if br.read::<1, u8>().ok()? != 0 {
        // video_signal_type_present_flag
        br.skip(4).ok()?;
        if br.read::<1, u8>().ok()? != 0 {
            br.skip(24).ok()?;
        }
    }
    if br.read::<1, u8>().ok()? != 0 {
        ue(br)?;
        ue(br)?;
    }
    if br.read::<1, u8>().ok()? == 0 {
        return None; // timing_info_present_flag
    }
    let num_units_in_tick = br.read::<32, u32>().ok()?;
    let time_scale = br.read::<32, u32>().ok()?;
    if num_units_in_tick == 0 || time_scale == 0 {
        return None;
    }
    // Field rate, two ticks per frame
    let fps = time_scale as f32 / (num_units_in_tick as f32 * 2.0);
    (1.0..=120.0).contains(&fps).then_some(fps)
}

fn parse_hevc_sps(raw: &[u8]) -> Option<VideoInfo> {
    let rbsp = remove_ep(raw);
    let mut br = BitReader::endian(&rbsp[..], BigEndian);

    br.skip(4).ok()?; // sps_video_parameter_set_id
    let max_sub_layers_minus1 = br.read::<3, u8>().ok()?;
    br.skip(1).ok()?; // sps_temporal_id_nesting_flag

    // profile_tier_level: general profile (88 bits) + general_level_idc
    br.skip(88 + 8).ok()?;
    let mut sub_profile = [false; 8];
    let mut sub_level = [false; 8];
    for i in 0..max_sub_layers_minus1 as usize {
        sub_profile[i] = br.read::<1, u8>().ok()? != 0;
        sub_level[i] = br.read::<1, u8>().ok()? != 0;
    }
    if max_sub_layers_minus1 > 0 {
        for _ in max_sub_layers_minus1..8 {
            br.skip(2).ok()?; // reserved_zero_2bits
        }
    }
    for i in 0..max_sub_layers_minus1 as usize {
        if sub_profile[i] {
            br.skip(88).ok()?;
        }
        if sub_level[i] {
            br.skip(8).ok()?;
        }
    }

    ue(&mut br)?; // sps_seq_parameter_set_id
    let chroma_format_idc = ue(&mut br)?;
    if chroma_format_idc == 3 {
        br.skip(1).ok()?; // separate_colour_plane_flag
    }
    let mut width = ue(&mut br)?;
    let mut height = ue(&mut br)?;
    if br.read::<1, u8>().ok()? != 0 {
        // conformance_window_flag
        let (l, r, t, b) = (ue(&mut br)?, ue(&mut br)?, ue(&mut br)?, ue(&mut br)?);
        if [l, r, t, b].iter().any(|&c| c > 8192) {
            return None;
        }
        let sub_w = if matches!(chroma_format_idc, 1 | 2) { 2 } else { 1 };
        let sub_h = if chroma_format_idc == 1 { 2 } else { 1 };
        width = width.checked_sub((l + r) * sub_w)?;
        height = height.checked_sub((t + b) * sub_h)?;
    }

    Some(VideoInfo {
        codec: "hevc".to_string(),
        width: u16::try_from(width).ok()?,
        height: u16::try_from(height).ok()?,
        fps: 0.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mpeg2_sequence_header() {
        let es = [
            0x00, 0x00, 0x01, 0xB3, 0x2D, 0x01, 0xE0, 0x24, 0xFF, 0xFF, 0xE0, 0x18, 0x00,
        ];
        let info = parse_mpeg2_seq_hdr(&es).expect("sequence header");
        assert_eq!((info.width, info.height), (720, 480));
        assert_eq!(info.fps, 29.97);
    }

    #[test]
    fn avc_baseline_sps() {
        // profile 66, level 30, 1280x720 (80x45 macroblocks), no VUI
        let es = [
            0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1E, 0xF4, 0x02, 0x80, 0x2D, 0xC0,
        ];
        let info = parse_avc(&es).expect("sps");
        assert_eq!(info.codec, "h264");
        assert_eq!((info.width, info.height), (1280, 720));
    }

    #[test]
    fn no_sps_in_slice_data() {
        let es = [0x00, 0x00, 0x01, 0x65, 0x88, 0x84, 0x00];
        assert!(parse_avc(&es).is_none());
        assert!(parse_mpeg2_seq_hdr(&es).is_none());
    }
}
