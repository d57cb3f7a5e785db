//! Common parsing utilities

use bitstream_io::{BigEndian, BitRead, BitReader};

/// Unsigned Exp-Golomb decoder
pub fn ue<R: std::io::Read>(br: &mut BitReader<R, BigEndian>) -> Option<u32> {
    let mut zeros = 0;
    while br.read::<1, u8>().ok()? == 0 {
        zeros += 1;
        if zeros > 31 {
            return None;
        }
    }
    let mut val = 1u32;
    for _ in 0..zeros {
        val = (val << 1) | br.read::<1, u8>().ok()? as u32;
    }
    Some(val - 1)
}

/// Signed Exp-Golomb decoder
pub fn se<R: std::io::Read>(br: &mut BitReader<R, BigEndian>) -> Option<i32> {
    let k = ue(br)? as i64;
    Some(if k & 1 == 0 { -(k / 2) } else { (k + 1) / 2 } as i32)
}

/// Remove emulation prevention bytes (0x000003)
pub fn remove_ep(data: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if i + 2 < data.len() && data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 3 {
            v.extend_from_slice(&data[i..i + 2]);
            i += 3;
        } else {
            v.push(data[i]);
            i += 1;
        }
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exp_golomb_values() {
        // 1 | 010 | 011 | 00100 | 00101
        let bits = [0b1010_0110, 0b0100_0010, 0b1000_0000];
        let mut br = BitReader::endian(&bits[..], BigEndian);
        assert_eq!(ue(&mut br), Some(0));
        assert_eq!(ue(&mut br), Some(1));
        assert_eq!(ue(&mut br), Some(2));
        assert_eq!(se(&mut br), Some(2));
        assert_eq!(se(&mut br), Some(-2));
    }

    #[test]
    fn strips_emulation_prevention() {
        assert_eq!(remove_ep(&[0, 0, 3, 1, 0, 0, 3]), vec![0, 0, 1, 0, 0]);
    }
}
