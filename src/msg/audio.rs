//! Pooled audio payload buffers.
//!
//! Two buffer types back all audio traffic:
//!
//! * [`EncodedData`]: an opaque run of encoded bytes. `AudioEncoded`
//!   messages reference windows into shared `EncodedData` cells, so splits
//!   and concatenations never copy.
//! * [`DecodedAudio`]: decoded samples stored as 32-bit subsamples
//!   (MSB-aligned, one subsample per channel per sample), with the stream's
//!   intrinsic rate, depth and channel count. `AudioPcm` messages reference
//!   sample windows into shared `DecodedAudio` cells.
//!
//! Decoded audio is unpacked once, on entry from the codec; every later
//! stage works on whole samples. At the sink boundary the
//! [`PcmProcessor`] consumer receives sample-interleaved big-endian bytes
//! at the stream's intrinsic bit depth, with the ramp already applied.

use crate::{
    jiffies,
    msg::pool::Reset,
    ramp::{self, Ramp},
};

/// Byte order of packed sample data.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Endian {
    Big,
    Little,
}

/// An opaque run of encoded bytes, pooled and shareable.
#[derive(Debug, Default)]
pub struct EncodedData {
    bytes: Vec<u8>,
}

impl EncodedData {
    /// Replaces the buffer contents.
    pub fn set(&mut self, data: &[u8]) {
        self.bytes.clear();
        self.bytes.extend_from_slice(data);
    }

    /// The buffered bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Buffered byte count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Reset for EncodedData {
    fn reset(&mut self) {
        self.bytes.clear();
    }
}

/// Decoded audio samples, pooled and shareable.
///
/// Samples are stored as one `i32` subsample per channel, MSB-aligned so
/// that ramp arithmetic is depth-independent. Numeric parameters are fixed
/// when the cell is filled and constant for the cell's lifetime out of the
/// pool.
#[derive(Debug, Default)]
pub struct DecodedAudio {
    subsamples: Vec<i32>,
    channels: u32,
    sample_rate: u32,
    bit_depth: u32,
}

impl DecodedAudio {
    /// Fills the cell from packed sample data.
    ///
    /// `data` must contain a whole number of samples
    /// (`channels * bit_depth / 8` bytes each).
    ///
    /// # Panics
    ///
    /// Panics on a partial sample, an unsupported bit depth or an
    /// unsupported sample rate; codecs validate their output before it
    /// reaches a pool cell.
    pub fn set(&mut self, data: &[u8], channels: u32, sample_rate: u32, bit_depth: u32, endian: Endian) {
        let bytes_per_subsample = bit_depth as usize / 8;
        let frame_bytes = bytes_per_subsample * channels as usize;
        assert!(frame_bytes > 0, "zero-sized audio frame");
        assert_eq!(data.len() % frame_bytes, 0, "partial sample in decoded audio");
        assert!(jiffies::is_supported(sample_rate));

        self.channels = channels;
        self.sample_rate = sample_rate;
        self.bit_depth = bit_depth;
        self.subsamples.clear();
        self.subsamples.reserve(data.len() / bytes_per_subsample);

        match (bit_depth, endian) {
            (8, _) => {
                for &b in data {
                    self.subsamples.push(i32::from(b as i8) << 24);
                }
            }
            (16, Endian::Big) => {
                for pair in data.chunks_exact(2) {
                    self.subsamples
                        .push(i32::from(i16::from_be_bytes([pair[0], pair[1]])) << 16);
                }
            }
            (16, Endian::Little) => {
                for pair in data.chunks_exact(2) {
                    self.subsamples
                        .push(i32::from(i16::from_le_bytes([pair[0], pair[1]])) << 16);
                }
            }
            (24, Endian::Big) => {
                for b in data.chunks_exact(3) {
                    let value =
                        (i32::from(b[0] as i8) << 16) | (i32::from(b[1]) << 8) | i32::from(b[2]);
                    self.subsamples.push(value << 8);
                }
            }
            (24, Endian::Little) => {
                for b in data.chunks_exact(3) {
                    let value =
                        (i32::from(b[2] as i8) << 16) | (i32::from(b[1]) << 8) | i32::from(b[0]);
                    self.subsamples.push(value << 8);
                }
            }
            (32, Endian::Big) => {
                for b in data.chunks_exact(4) {
                    self.subsamples
                        .push(i32::from_be_bytes([b[0], b[1], b[2], b[3]]));
                }
            }
            (32, Endian::Little) => {
                for b in data.chunks_exact(4) {
                    self.subsamples
                        .push(i32::from_le_bytes([b[0], b[1], b[2], b[3]]));
                }
            }
            (depth, _) => panic!("unsupported bit depth {depth}"),
        }
    }

    /// Number of whole samples stored.
    #[must_use]
    pub fn sample_count(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.subsamples.len() / self.channels as usize
        }
    }

    /// Channel count.
    #[must_use]
    pub fn channels(&self) -> u32 {
        self.channels
    }

    /// Sample rate in Hz.
    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Intrinsic bit depth of the source stream.
    #[must_use]
    pub fn bit_depth(&self) -> u32 {
        self.bit_depth
    }

    /// Jiffies in one sample at this cell's rate.
    #[must_use]
    pub fn jiffies_per_sample(&self) -> u64 {
        jiffies::per_sample(self.sample_rate)
    }

    /// The raw subsamples, interleaved by channel.
    #[must_use]
    pub fn subsamples(&self) -> &[i32] {
        &self.subsamples
    }

    /// Appends a sample window from another cell.
    ///
    /// # Panics
    ///
    /// Panics if the numeric parameters differ; aggregation only combines
    /// audio from a single stream.
    pub fn append(&mut self, other: &DecodedAudio, offset_samples: usize, count: usize) {
        assert_eq!(self.channels, other.channels);
        assert_eq!(self.sample_rate, other.sample_rate);
        assert_eq!(self.bit_depth, other.bit_depth);
        let start = offset_samples * self.channels as usize;
        let end = (offset_samples + count) * self.channels as usize;
        self.subsamples.extend_from_slice(&other.subsamples[start..end]);
    }
}

impl Reset for DecodedAudio {
    fn reset(&mut self) {
        self.subsamples.clear();
        self.channels = 0;
        self.sample_rate = 0;
        self.bit_depth = 0;
    }
}

/// Bit-depth-specialised consumer fed by `Playable` messages.
///
/// Fragment data is sample-interleaved, big-endian, at the bit depth of the
/// specialised callback. A block corresponds to one `Playable`.
pub trait PcmProcessor {
    /// Called once before the fragments of a block.
    fn begin_block(&mut self) {}

    /// 8-bit fragment.
    fn process_fragment8(&mut self, data: &[u8], channels: u32);

    /// 16-bit big-endian fragment.
    fn process_fragment16(&mut self, data: &[u8], channels: u32);

    /// 24-bit big-endian fragment.
    fn process_fragment24(&mut self, data: &[u8], channels: u32);

    /// 32-bit big-endian fragment.
    fn process_fragment32(&mut self, data: &[u8], channels: u32);

    /// Called once after the fragments of a block.
    fn end_block(&mut self) {}
}

/// Fragment staging size. Large enough to amortise the callback, small
/// enough to stay on the stack.
const CHUNK_BYTES: usize = 1024;

/// Streams a ramped sample window to `processor` as one block.
///
/// Samples leave at the cell's intrinsic bit depth, big-endian,
/// interleaved. The ramp multiplier is interpolated per sample and applied
/// to all channels.
pub fn read_pcm(
    audio: &DecodedAudio,
    offset_samples: usize,
    count: usize,
    audio_ramp: Ramp,
    processor: &mut dyn PcmProcessor,
) {
    let channels = audio.channels();
    let depth = audio.bit_depth();
    let bytes_per_subsample = depth as usize / 8;
    let frame_bytes = bytes_per_subsample * channels as usize;
    let frames_per_chunk = (CHUNK_BYTES / frame_bytes).max(1);

    let mut chunk = [0u8; CHUNK_BYTES];
    let mut filled = 0;

    processor.begin_block();
    for i in 0..count {
        let gain = audio_ramp.value_at(i as u64, count as u64);
        let base = (offset_samples + i) * channels as usize;
        for ch in 0..channels as usize {
            let subsample = ramp::apply(audio.subsamples()[base + ch], gain);
            let be = subsample.to_be_bytes();
            chunk[filled..filled + bytes_per_subsample]
                .copy_from_slice(&be[..bytes_per_subsample]);
            filled += bytes_per_subsample;
        }
        if filled >= frames_per_chunk * frame_bytes {
            dispatch_fragment(processor, &chunk[..filled], channels, depth);
            filled = 0;
        }
    }
    if filled > 0 {
        dispatch_fragment(processor, &chunk[..filled], channels, depth);
    }
    processor.end_block();
}

/// Streams `count` samples of silence to `processor` as one block.
pub fn read_silence(
    count: usize,
    channels: u32,
    bit_depth: u32,
    processor: &mut dyn PcmProcessor,
) {
    let frame_bytes = (bit_depth as usize / 8) * channels as usize;
    let frames_per_chunk = (CHUNK_BYTES / frame_bytes).max(1);
    let chunk = [0u8; CHUNK_BYTES];

    processor.begin_block();
    let mut remaining = count;
    while remaining > 0 {
        let frames = remaining.min(frames_per_chunk);
        dispatch_fragment(processor, &chunk[..frames * frame_bytes], channels, bit_depth);
        remaining -= frames;
    }
    processor.end_block();
}

fn dispatch_fragment(processor: &mut dyn PcmProcessor, data: &[u8], channels: u32, depth: u32) {
    match depth {
        8 => processor.process_fragment8(data, channels),
        16 => processor.process_fragment16(data, channels),
        24 => processor.process_fragment24(data, channels),
        32 => processor.process_fragment32(data, channels),
        _ => panic!("unsupported bit depth {depth}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CollectingProcessor {
        bytes: Vec<u8>,
        blocks: usize,
    }

    impl PcmProcessor for CollectingProcessor {
        fn begin_block(&mut self) {
            self.blocks += 1;
        }

        fn process_fragment8(&mut self, data: &[u8], _channels: u32) {
            self.bytes.extend_from_slice(data);
        }

        fn process_fragment16(&mut self, data: &[u8], _channels: u32) {
            self.bytes.extend_from_slice(data);
        }

        fn process_fragment24(&mut self, data: &[u8], _channels: u32) {
            self.bytes.extend_from_slice(data);
        }

        fn process_fragment32(&mut self, data: &[u8], _channels: u32) {
            self.bytes.extend_from_slice(data);
        }
    }

    #[test]
    fn unpack_16_bit_big_endian() {
        let mut audio = DecodedAudio::default();
        audio.set(&[0x12, 0x34, 0xff, 0xfe], 2, 44_100, 16, Endian::Big);
        assert_eq!(audio.sample_count(), 1);
        assert_eq!(audio.subsamples(), &[0x1234 << 16, -2 << 16]);
    }

    #[test]
    fn unpack_24_bit_sign_extends() {
        let mut audio = DecodedAudio::default();
        audio.set(&[0xff, 0xff, 0xff], 1, 48_000, 24, Endian::Big);
        assert_eq!(audio.subsamples(), &[-1 << 8]);
    }

    #[test]
    fn read_round_trips_unramped_audio() {
        let mut audio = DecodedAudio::default();
        let data = [0x12, 0x34, 0x56, 0x78];
        audio.set(&data, 2, 44_100, 16, Endian::Big);

        let mut processor = CollectingProcessor::default();
        read_pcm(&audio, 0, 1, Ramp::default(), &mut processor);
        assert_eq!(processor.bytes, data);
        assert_eq!(processor.blocks, 1);
    }

    #[test]
    fn ramp_at_min_is_bit_exact_silence() {
        let mut audio = DecodedAudio::default();
        audio.set(&[0x7f, 0xff, 0x80, 0x00], 1, 44_100, 16, Endian::Big);

        let duration = audio.sample_count() as u64 * audio.jiffies_per_sample();
        let mut down = Ramp::default();
        // Full ramp already completed: every value at MIN.
        down.set(ramp::MIN, duration, duration, crate::ramp::Direction::Down);

        let mut processor = CollectingProcessor::default();
        read_pcm(&audio, 0, audio.sample_count(), down, &mut processor);
        assert!(processor.bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn silence_materialises_zeros() {
        let mut processor = CollectingProcessor::default();
        read_silence(10, 2, 24, &mut processor);
        assert_eq!(processor.bytes.len(), 10 * 2 * 3);
        assert!(processor.bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn append_requires_matching_parameters() {
        let mut a = DecodedAudio::default();
        a.set(&[0, 1, 0, 2], 1, 44_100, 16, Endian::Big);
        let mut b = DecodedAudio::default();
        b.set(&[0, 3], 1, 44_100, 16, Endian::Big);
        a.append(&b, 0, 1);
        assert_eq!(a.sample_count(), 3);
        assert_eq!(a.subsamples()[2], 3 << 16);
    }
}
