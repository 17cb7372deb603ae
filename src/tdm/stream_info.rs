//! Byte/sample/time conversions for a PCM stream.

/// Shape of the interleaved PCM stream an endpoint produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioStreamInfo {
    bits_per_sample: u8,
    channels: u8,
    sample_rate: u32,
}

impl AudioStreamInfo {
    pub fn new(bits_per_sample: u8, channels: u8, sample_rate: u32) -> Self {
        Self {
            bits_per_sample,
            channels,
            sample_rate,
        }
    }

    pub fn bits_per_sample(&self) -> u8 {
        self.bits_per_sample
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Bytes one sample occupies in the buffer (24-bit samples are packed).
    pub fn bytes_per_sample(&self) -> usize {
        (self.bits_per_sample as usize).div_ceil(8)
    }

    /// Bytes per frame (one sample for every channel).
    pub fn frame_size(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }

    pub fn bytes_to_samples(&self, bytes: usize) -> usize {
        bytes / self.bytes_per_sample().max(1)
    }

    pub fn ms_to_frames(&self, ms: u32) -> usize {
        (self.sample_rate as u64 * ms as u64 / 1000) as usize
    }

    pub fn ms_to_bytes(&self, ms: u32) -> usize {
        self.ms_to_frames(ms) * self.frame_size()
    }

    pub fn bytes_to_ms(&self, bytes: usize) -> u32 {
        let frame_size = self.frame_size();
        if frame_size == 0 || self.sample_rate == 0 {
            return 0;
        }
        ((bytes / frame_size) as u64 * 1000 / self.sample_rate as u64) as u32
    }
}

/// Decode one little-endian sample, sign-extended to 32 bits.
///
/// `bytes.len()` is the sample width in bytes (1 to 4).
pub fn unpack_sample(bytes: &[u8]) -> i32 {
    let width = bytes.len().min(4);
    if width == 0 {
        return 0;
    }
    let mut raw = [0u8; 4];
    raw[..width].copy_from_slice(&bytes[..width]);
    let shift = 32 - 8 * width as u32;
    // Move the top byte into bit 31, then arithmetic shift back down
    (i32::from_le_bytes(raw) << shift) >> shift
}

/// Encode `value` little-endian into `bytes`, keeping only the low
/// `bytes.len()` bytes.
pub fn pack_sample(value: i32, bytes: &mut [u8]) {
    let width = bytes.len().min(4);
    bytes[..width].copy_from_slice(&value.to_le_bytes()[..width]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sixteen_khz_mono_chunk() {
        let info = AudioStreamInfo::new(16, 1, 16000);
        assert_eq!(info.bytes_per_sample(), 2);
        assert_eq!(info.frame_size(), 2);
        // 16 ms at 16 kHz = 256 frames
        assert_eq!(info.ms_to_bytes(16), 512);
        assert_eq!(info.bytes_to_samples(512), 256);
        assert_eq!(info.bytes_to_ms(512), 16);
    }

    #[test]
    fn stereo_twenty_four_bit() {
        let info = AudioStreamInfo::new(24, 2, 48000);
        assert_eq!(info.bytes_per_sample(), 3);
        assert_eq!(info.frame_size(), 6);
        assert_eq!(info.ms_to_bytes(1), 48 * 6);
        assert_eq!(info.bytes_to_samples(30), 10);
    }

    #[test]
    fn unpack_sign_extends() {
        assert_eq!(unpack_sample(&[0xFF]), -1);
        assert_eq!(unpack_sample(&[0x7F]), 127);
        assert_eq!(unpack_sample(&[0x00, 0x80]), -32768);
        assert_eq!(unpack_sample(&[0x34, 0x12]), 0x1234);
        assert_eq!(unpack_sample(&[0xFF, 0xFF, 0xFF]), -1);
        assert_eq!(unpack_sample(&[0x00, 0x00, 0x80]), -8_388_608);
        assert_eq!(unpack_sample(&[0x00, 0x00, 0x00, 0x80]), i32::MIN);
    }

    #[test]
    fn pack_truncates_to_width() {
        let mut buf = [0u8; 2];
        pack_sample(-2, &mut buf);
        assert_eq!(buf, [0xFE, 0xFF]);
        assert_eq!(unpack_sample(&buf), -2);

        // Bits above the sample width are dropped
        pack_sample(0x1_2345, &mut buf);
        assert_eq!(unpack_sample(&buf), 0x2345);

        let mut wide = [0u8; 3];
        pack_sample(-100_000, &mut wide);
        assert_eq!(unpack_sample(&wide), -100_000);
    }
}
