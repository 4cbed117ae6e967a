/// Audio resampling utility for converting between different sample rates
/// Uses run averaging when lowering the rate and linear interpolation when
/// raising it, carrying fractional state across chunk boundaries so a long
/// recording can be converted in arbitrary slices.

/// Take one channel from interleaved multi-channel audio
///
/// # Arguments
/// * `samples` - Interleaved audio samples
/// * `channels` - Channel count (must divide the sample count)
///
/// # Returns
/// Channel 0 only
pub fn first_channel(samples: &[i16], channels: usize) -> Vec<i16> {
    assert!(channels > 0, "Audio must have at least one channel");
    samples.iter().copied().step_by(channels).collect()
}

/// Map a signed 16-bit sample to the centered 8-bit domain the pipeline
/// works in.
pub fn to_centered_u8(v: i16) -> u8 {
    ((v / 256) + 128) as u8
}

/// Map a centered 8-bit sample back to signed 16-bit.
pub fn to_i16(v: u8) -> i16 {
    (v as i16 - 128) * 256
}

/// Stateful sample rate converter
///
/// Chunk boundaries do not have to align with the conversion ratio: input
/// that cannot be consumed yet is buffered and prepended to the next call,
/// and the phase accumulator (`surplus`) persists, so converting a stream
/// in slices produces the same output as converting it whole.
pub struct SampleRateConverter {
    surplus: i32,
    remain: Vec<i16>,
}

impl SampleRateConverter {
    pub fn new() -> Self {
        SampleRateConverter {
            surplus: 0,
            remain: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.surplus = 0;
        self.remain.clear();
    }

    /// Convert one chunk. Returns the converted samples; some input may be
    /// held back for the next call.
    pub fn convert(&mut self, input: &[i16], in_rate: u32, out_rate: u32) -> Vec<i16> {
        let in_rate = in_rate as i32;
        let out_rate = out_rate as i32;

        let mut src: Vec<i16> = Vec::with_capacity(self.remain.len() + input.len());
        src.append(&mut self.remain);
        src.extend_from_slice(input);
        let src_len = src.len();

        let mut out = Vec::new();
        if in_rate > out_rate {
            // lowering: average each run of divide samples, weighting the
            // fractional samples at both ends
            let mut pos = 0usize;
            loop {
                let divide = ((in_rate + self.surplus) / out_rate) as usize;
                if pos + divide + 2 >= src_len {
                    break;
                }
                let n_surplus = (in_rate + self.surplus) % out_rate;

                let mut acc = 0.0f64;
                if self.surplus >= 0 {
                    acc += src[pos] as f64 * (out_rate - self.surplus) as f64 / out_rate as f64;
                    pos += 1;
                }
                for _ in 1..divide {
                    acc += src[pos] as f64;
                    pos += 1;
                }
                if n_surplus > 0 {
                    acc += src[pos] as f64 * n_surplus as f64 / out_rate as f64;
                }
                let new_data = acc * out_rate as f64 / in_rate as f64;

                self.surplus = n_surplus;
                out.push(new_data as i16);
            }
            if pos < src_len {
                self.remain.extend_from_slice(&src[pos..]);
            }
        } else if in_rate < out_rate {
            // raising: linear interpolation between neighbouring samples
            let mut pos = 0usize;
            while pos + 1 < src_len {
                let divide = (out_rate + self.surplus) / in_rate;
                self.surplus = (out_rate + self.surplus) % in_rate;
                for i in 0..divide {
                    let new_data = src[pos] as i32
                        + i * (src[pos + 1] as i32 - src[pos] as i32) / divide;
                    out.push(new_data as i16);
                }
                pos += 1;
            }
            if src_len > 0 {
                self.remain.push(src[src_len - 1]);
            }
        } else {
            out = src;
        }
        out
    }
}

impl Default for SampleRateConverter {
    fn default() -> Self {
        SampleRateConverter::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_channel_of_stereo() {
        let samples = vec![10, -10, 20, -20, 30, -30];
        assert_eq!(first_channel(&samples, 2), vec![10, 20, 30]);
    }

    #[test]
    fn test_same_rate_passes_through() {
        let mut conv = SampleRateConverter::new();
        let input = vec![1, 2, 3, 4];
        assert_eq!(conv.convert(&input, 22050, 22050), input);
    }

    #[test]
    fn test_downsample_halves_length_and_averages() {
        let mut conv = SampleRateConverter::new();
        let input: Vec<i16> = vec![100; 1000];
        let out = conv.convert(&input, 44100, 22050);
        assert!(out.len() >= 495 && out.len() <= 500, "len = {}", out.len());
        for &v in &out {
            assert!((99..=100).contains(&v), "v = {}", v);
        }
    }

    #[test]
    fn test_upsample_doubles_length_and_interpolates() {
        let mut conv = SampleRateConverter::new();
        let input: Vec<i16> = (0..100).map(|i| i * 10).collect();
        let out = conv.convert(&input, 11025, 22050);
        assert!(out.len() >= 196 && out.len() <= 200, "len = {}", out.len());
        // midpoints land halfway between neighbours
        assert_eq!(out[0], 0);
        assert_eq!(out[1], 5);
        assert_eq!(out[2], 10);
    }

    #[test]
    fn test_chunked_matches_whole() {
        let input: Vec<i16> = (0..2000).map(|i| ((i * 37) % 251 - 125) as i16).collect();

        let mut whole = SampleRateConverter::new();
        let expected = whole.convert(&input, 44100, 22050);

        let mut chunked = SampleRateConverter::new();
        let mut got = Vec::new();
        for chunk in input.chunks(123) {
            got.extend(chunked.convert(chunk, 44100, 22050));
        }
        assert!(got.len() >= expected.len());
        assert_eq!(&got[..expected.len()], &expected[..]);
    }

    #[test]
    fn test_bit_depth_mapping_round_trip() {
        assert_eq!(to_centered_u8(0), 128);
        assert_eq!(to_centered_u8(-32768), 0);
        assert_eq!(to_centered_u8(32512), 255);
        assert_eq!(to_i16(128), 0);
        assert_eq!(to_i16(0), -32768);
    }
}
