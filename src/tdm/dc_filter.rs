//! DC offset removal for microphone capture.
//!
//! A single-pole high-pass filter:
//!
//! ```text
//! y[n] = x[n] - x[n-1] + R * y[n-1]
//! ```
//!
//! with `R = 1 - 2^-10 ≈ 0.99902`. For a 96 kHz stream that puts the corner near
//! 15 Hz, below the audible range, and at lower rates it is lower still. The
//! multiply by `R` is done as `y - (y >> 10)` so the filter stays integer-only.

use super::stream_info::{pack_sample, unpack_sample};

const DC_FILTER_SHIFT: u32 = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DcOffsetFilter {
    prev_input: i32,
    prev_output: i32,
}

impl DcOffsetFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_sample(&mut self, input: i32) -> i32 {
        let decay = self.prev_output.wrapping_sub(self.prev_output >> DC_FILTER_SHIFT);
        let output = input.wrapping_sub(self.prev_input).wrapping_add(decay);
        self.prev_input = input;
        self.prev_output = output;
        output
    }

    /// Filter a buffer of little-endian samples in place.
    ///
    /// Interleaved channels are treated as one flat stream sharing the filter
    /// history. Trailing bytes that do not form a whole sample are untouched.
    pub fn process_bytes(&mut self, data: &mut [u8], bytes_per_sample: usize) {
        if bytes_per_sample == 0 {
            return;
        }
        for sample in data.chunks_exact_mut(bytes_per_sample) {
            let output = self.process_sample(unpack_sample(sample));
            pack_sample(output, sample);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn to_samples(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    #[test]
    fn first_sample_passes_through() {
        let mut f = DcOffsetFilter::new();
        assert_eq!(f.process_sample(4096), 4096);
        // 4096 - 4096 + (4096 - (4096 >> 10))
        assert_eq!(f.process_sample(4096), 4092);
    }

    #[test]
    fn constant_input_decays_monotonically_toward_zero() {
        let mut f = DcOffsetFilter::new();
        let mut prev = i32::MAX;
        let mut last = 0;
        for _ in 0..20_000 {
            let y = f.process_sample(4000);
            assert!(y >= 0);
            assert!(y <= prev);
            prev = y;
            last = y;
        }
        // (y >> 10) reaches zero once y < 1024, so the tail settles
        assert!(last < 1024, "residual {last}");
    }

    #[test]
    fn negative_bias_is_removed_too() {
        let mut f = DcOffsetFilter::new();
        let mut y = 0;
        for _ in 0..20_000 {
            y = f.process_sample(-4000);
        }
        assert!(y > -1100 && y <= 0, "residual {y}");
    }

    #[test]
    fn output_is_a_pure_function_of_history() {
        let input: Vec<i32> = (0..500).map(|i| (i * 37 % 200) - 50 + 300).collect();
        let mut a = DcOffsetFilter::new();
        let mut b = DcOffsetFilter::new();
        let out_a: Vec<i32> = input.iter().map(|&x| a.process_sample(x)).collect();
        let out_b: Vec<i32> = input.iter().map(|&x| b.process_sample(x)).collect();
        assert_eq!(out_a, out_b);
        assert_eq!(a, b);

        // A new session starts from zero history
        let mut fresh = DcOffsetFilter::new();
        assert_eq!(fresh.process_sample(input[0]), out_a[0]);
    }

    #[test]
    fn bytes_path_matches_sample_path() {
        let samples: Vec<i16> = (0..64).map(|i| 2000 + (i % 7) * 30).collect();
        let mut bytes = to_bytes(&samples);

        let mut by_bytes = DcOffsetFilter::new();
        by_bytes.process_bytes(&mut bytes, 2);

        let mut by_sample = DcOffsetFilter::new();
        let expected: Vec<i16> = samples
            .iter()
            .map(|&s| by_sample.process_sample(s as i32) as i16)
            .collect();
        assert_eq!(to_samples(&bytes), expected);
    }

    #[test]
    fn history_carries_across_buffers() {
        let samples = vec![1500i16; 32];
        let mut whole = to_bytes(&samples);
        let mut f = DcOffsetFilter::new();
        f.process_bytes(&mut whole, 2);

        let mut split = to_bytes(&samples);
        let mut g = DcOffsetFilter::new();
        let (head, tail) = split.split_at_mut(20);
        g.process_bytes(head, 2);
        g.process_bytes(tail, 2);
        assert_eq!(whole, split);
    }

    #[test]
    fn partial_trailing_sample_is_left_alone() {
        let mut data = vec![0x10, 0x00, 0x20, 0x00, 0xAB];
        let mut f = DcOffsetFilter::new();
        f.process_bytes(&mut data, 2);
        assert_eq!(data[4], 0xAB);
    }

    #[test]
    fn interleaved_channels_share_history() {
        // L = 1000, R = -1000: the flat stream sees alternating samples
        let mut f = DcOffsetFilter::new();
        let mut bytes = to_bytes(&[1000, -1000]);
        f.process_bytes(&mut bytes, 2);
        // Second sample: -1000 - 1000 + (1000 - 0) = -1000
        assert_eq!(to_samples(&bytes), vec![1000, -1000]);
    }
}
