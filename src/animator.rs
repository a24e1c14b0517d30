//! The sink-animator boundary.
//!
//! The animator is the downstream driver that turns `Playable` messages
//! into sound. The core consults it once per decoded stream to learn
//! whether the sink can play the stream's format and how much latency it
//! adds; a format it rejects is stopped before any of its audio reaches
//! the sink.

use crate::{
    error::{Error, Result},
    jiffies,
};

/// Format acceptance and latency interface of the sink driver.
pub trait Animator: Send + Sync {
    /// Latency the sink adds for the given format, in jiffies.
    ///
    /// # Errors
    ///
    /// Returns an error when the sink cannot play the format; the
    /// sample-rate validator then stops the stream.
    fn delay_jiffies(&self, sample_rate: u32, bit_depth: u32, channels: u32) -> Result<u64>;
}

/// A fixed-latency animator accepting the standard rate table.
///
/// Useful for offline sinks and tests; a hardware driver replaces it.
#[derive(Clone, Copy, Debug)]
pub struct FixedAnimator {
    latency: u64,
    max_sample_rate: u32,
    max_bit_depth: u32,
    max_channels: u32,
}

impl Default for FixedAnimator {
    fn default() -> Self {
        Self {
            latency: jiffies::from_ms(10),
            max_sample_rate: 192_000,
            max_bit_depth: 32,
            max_channels: 8,
        }
    }
}

impl FixedAnimator {
    /// Creates an animator with the given fixed latency and format maxima.
    #[must_use]
    pub fn new(latency: u64, max_sample_rate: u32, max_bit_depth: u32, max_channels: u32) -> Self {
        Self {
            latency,
            max_sample_rate,
            max_bit_depth,
            max_channels,
        }
    }
}

impl Animator for FixedAnimator {
    fn delay_jiffies(&self, sample_rate: u32, bit_depth: u32, channels: u32) -> Result<u64> {
        if !jiffies::is_supported(sample_rate) || sample_rate > self.max_sample_rate {
            return Err(Error::out_of_range(format!(
                "sample rate {sample_rate} not supported"
            )));
        }
        if !matches!(bit_depth, 8 | 16 | 24 | 32) || bit_depth > self.max_bit_depth {
            return Err(Error::out_of_range(format!(
                "bit depth {bit_depth} not supported"
            )));
        }
        if channels == 0 || channels > self.max_channels {
            return Err(Error::out_of_range(format!(
                "channel count {channels} not supported"
            )));
        }
        Ok(self.latency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_standard_formats() {
        let animator = FixedAnimator::default();
        assert!(animator.delay_jiffies(44_100, 16, 2).is_ok());
        assert!(animator.delay_jiffies(192_000, 24, 8).is_ok());
    }

    #[test]
    fn rejects_unplayable_formats() {
        let animator = FixedAnimator::default();
        assert!(animator.delay_jiffies(44_101, 16, 2).is_err());
        assert!(animator.delay_jiffies(44_100, 20, 2).is_err());
        assert!(animator.delay_jiffies(44_100, 16, 0).is_err());
    }
}
