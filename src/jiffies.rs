//! Fixed-point pipeline time unit.
//!
//! All audio lengths, buffer fills and ramp durations in the pipeline are
//! measured in *jiffies*: a fixed-point unit chosen so that one sample at
//! any supported sample rate is a whole number of jiffies. The unit is
//! 1/56,448,000 of a second (the least common multiple of 384,000 and
//! 352,800, which covers the full 44.1 kHz and 48 kHz rate families).
//!
//! Jiffies are carried as plain `u64` values; this module provides the
//! conversions between jiffies, samples, bytes and wall-clock time.

/// Jiffies per second.
///
/// Equal to lcm(384,000, 352,800) so any supported sample rate divides it.
pub const PER_SECOND: u64 = 56_448_000;

/// Jiffies per millisecond.
pub const PER_MS: u64 = PER_SECOND / 1000;

/// Sample rates the pipeline supports, in Hz.
///
/// Both the 44.1 kHz and 48 kHz families are covered, down to the lowest
/// rates used by speech codecs.
pub const SUPPORTED_RATES: [u32; 16] = [
    7350, 8000, 11_025, 12_000, 14_700, 16_000, 22_050, 24_000, 29_400, 32_000, 44_100, 48_000,
    88_200, 96_000, 176_400, 192_000,
];

/// Returns whether `rate` is one of the supported sample rates.
#[must_use]
pub fn is_supported(rate: u32) -> bool {
    SUPPORTED_RATES.contains(&rate)
}

/// Jiffies in one sample at `rate`.
///
/// # Panics
///
/// Panics if `rate` is not a supported sample rate; audio with an
/// unsupported rate must be rejected before any jiffy arithmetic runs on
/// it.
#[must_use]
pub fn per_sample(rate: u32) -> u64 {
    assert!(is_supported(rate), "unsupported sample rate {rate}");
    PER_SECOND / u64::from(rate)
}

/// Converts milliseconds to jiffies.
#[must_use]
pub fn from_ms(ms: u64) -> u64 {
    ms * PER_MS
}

/// Converts a whole number of samples at `rate` to jiffies.
#[must_use]
pub fn from_samples(samples: u64, rate: u32) -> u64 {
    samples * per_sample(rate)
}

/// Converts jiffies to samples at `rate`, rounding down.
#[must_use]
pub fn to_samples(jiffies: u64, rate: u32) -> u64 {
    jiffies / per_sample(rate)
}

/// Converts jiffies to whole milliseconds, rounding down.
#[must_use]
pub fn to_ms(jiffies: u64) -> u64 {
    jiffies / PER_MS
}

/// Converts jiffies to whole seconds, rounding down.
#[must_use]
pub fn to_secs(jiffies: u64) -> u64 {
    jiffies / PER_SECOND
}

/// Byte count of `jiffies` of audio, rounding `jiffies` down to a whole
/// number of samples in place.
///
/// `bytes_per_subsample` is the storage width of one channel of one sample.
#[must_use]
pub fn bytes_from(
    jiffies: &mut u64,
    jiffies_per_sample: u64,
    channels: u32,
    bytes_per_subsample: u32,
) -> usize {
    let samples = *jiffies / jiffies_per_sample;
    *jiffies = samples * jiffies_per_sample;
    usize::try_from(samples).unwrap_or(usize::MAX)
        * channels as usize
        * bytes_per_subsample as usize
}
