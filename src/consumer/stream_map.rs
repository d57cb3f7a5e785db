use crate::types::{rescale, Packet, Rational, StreamDescriptor};

/// What to do with one packet read from the engine
#[derive(Debug, PartialEq)]
pub enum Routed {
    Forward(Packet),
    Unmapped,
    /// Same dts as the previous packet of its output stream
    Duplicate(i64),
}

/// Input stream index -> output stream index, built once after probing.
#[derive(Debug)]
pub struct StreamMap {
    outputs: Vec<Option<usize>>,
    input_time_bases: Vec<Rational>,
    output_time_bases: Vec<Rational>,
    last_dts: Vec<Option<i64>>,
}

impl StreamMap {
    /// `selection[i]` is the input index feeding output `i`.
    pub fn new(inputs: &[StreamDescriptor], selection: &[usize], output_time_bases: Vec<Rational>) -> Self {
        let mut outputs = vec![None; inputs.len()];
        for (output, &input) in selection.iter().enumerate() {
            if let Some(slot) = outputs.get_mut(input) {
                *slot = Some(output);
            }
        }
        Self {
            outputs,
            input_time_bases: inputs.iter().map(|s| s.time_base).collect(),
            last_dts: vec![None; selection.len()],
            output_time_bases,
        }
    }

    pub fn output_of(&self, input: usize) -> Option<usize> {
        self.outputs.get(input).copied().flatten()
    }

    pub fn output_count(&self) -> usize {
        self.last_dts.len()
    }

    /// Remap `packet` to its output stream and time base.
    pub fn route(&mut self, mut packet: Packet) -> Routed {
        let Some(output) = self.output_of(packet.stream_index) else {
            return Routed::Unmapped;
        };
        if let Some(dts) = packet.dts {
            if self.last_dts[output] == Some(dts) {
                return Routed::Duplicate(dts);
            }
            self.last_dts[output] = Some(dts);
        }

        let from = self.input_time_bases[packet.stream_index];
        let to = self
            .output_time_bases
            .get(output)
            .copied()
            .unwrap_or(from);
        packet.pts = packet.pts.map(|v| rescale(v, from, to));
        packet.dts = packet.dts.map(|v| rescale(v, from, to));
        packet.duration = packet.duration.map(|v| rescale(v, from, to));
        packet.stream_index = output;
        Routed::Forward(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MediaKind;
    use bytes::Bytes;

    fn input(index: usize) -> StreamDescriptor {
        StreamDescriptor {
            index,
            id: index as u32,
            kind: MediaKind::Video,
            codec: "h264".into(),
            codec_tag: 0x1B,
            time_base: Rational::MPEG_90K,
            width: 0,
            height: 0,
            channels: 0,
            sample_rate: 0,
            frames: 0,
        }
    }

    fn packet(stream_index: usize, dts: Option<i64>) -> Packet {
        Packet {
            stream_index,
            pts: dts,
            dts,
            duration: Some(90),
            data: Bytes::from_static(b"x"),
            keyframe: false,
        }
    }

    #[test]
    fn remaps_and_rescales() {
        let inputs = [input(0), input(1), input(2)];
        let mut map = StreamMap::new(&inputs, &[2, 0], vec![Rational::new(1, 1_000); 2]);
        assert_eq!(map.output_of(1), None);
        assert_eq!(map.output_count(), 2);

        let Routed::Forward(out) = map.route(packet(2, Some(90_045))) else {
            panic!("expected forward");
        };
        assert_eq!(out.stream_index, 0);
        assert_eq!(out.dts, Some(1_001));
        assert_eq!(out.duration, Some(1));
        assert_eq!(map.route(packet(1, Some(5))), Routed::Unmapped);
    }

    #[test]
    fn drops_repeated_dts_per_output() {
        let inputs = [input(0), input(1)];
        let mut map = StreamMap::new(&inputs, &[0, 1], vec![Rational::MPEG_90K; 2]);
        assert!(matches!(map.route(packet(0, Some(100))), Routed::Forward(_)));
        assert_eq!(map.route(packet(0, Some(100))), Routed::Duplicate(100));
        // other output streams keep their own history
        assert!(matches!(map.route(packet(1, Some(100))), Routed::Forward(_)));
        // missing dts always passes
        assert!(matches!(map.route(packet(0, None)), Routed::Forward(_)));
        assert!(matches!(map.route(packet(0, None)), Routed::Forward(_)));
        assert!(matches!(map.route(packet(0, Some(99))), Routed::Forward(_)));
    }
}
