//! Linear-prediction flywheel ramp synthesis.
//!
//! When the pipeline starves mid-note, cutting to silence is audible as a
//! click even under a fast down-ramp. The flywheel hides it: a short block
//! of recent audio trains a per-channel linear-prediction model which then
//! extrapolates a plausible continuation, and the starvation ramper plays
//! that continuation under its down-ramp instead of real audio.
//!
//! The boundary format on both sides is 32-bit big-endian samples, one
//! planar channel contiguous per channel. Output samples are scaled to
//! 24 significant bits before packing.
//!
//! The model is classic short-term LPC: a fixed FIR conditioning filter
//! ([`ConvolutionModel`]) smooths the training block, autocorrelation plus
//! Levinson-Durbin recursion estimates the predictor, and a fixed-point
//! all-pole filter ([`FeedbackModel`]) runs the extrapolation:
//!
//! ```text
//! y[n] = Σ a[k] · y[n−k]      k = 1..=degree, a[k] in Q23
//! ```

use crate::jiffies;

/// Subsample storage width at the flywheel boundary (32-bit audio).
pub const SUBSAMPLE_BYTES: usize = 4;

/// Most channels the flywheel will model.
pub const MAX_CHANNELS: usize = 8;

/// Prediction order of the per-channel model.
///
/// Order 6 tracks one or two strong partials, which is all a ramp this
/// short needs.
pub const DEGREE: usize = 6;

/// Fixed-point scale shift shared by both filter models.
const SCALE_SHIFT: u32 = 23;

/// Q23 unity.
const Q23_ONE: f64 = (1 << SCALE_SHIFT) as f64;

/// Per-tap damping applied to estimated coefficients. Keeps a marginally
/// stable predictor decaying instead of ringing.
const DAMPING: f64 = 0.995;

/// FIR filter with fixed Q23 coefficients.
///
/// ```text
/// y[n] = Σ c[k] · x[n−k]      k = 0..len, c[k] in Q23
/// ```
pub struct ConvolutionModel {
    coeffs: Vec<i32>,
}

impl ConvolutionModel {
    #[must_use]
    pub fn new(coeffs: Vec<i32>) -> Self {
        Self { coeffs }
    }

    /// The 3-tap smoother used to condition training audio.
    #[must_use]
    pub fn smoother() -> Self {
        // [0.25, 0.5, 0.25] in Q23.
        Self::new(vec![1 << 21, 1 << 22, 1 << 21])
    }

    /// Filters `input` into `output` (same length; leading samples see a
    /// shortened kernel).
    pub fn process(&self, input: &[i32], output: &mut Vec<i32>) {
        output.clear();
        for n in 0..input.len() {
            let mut acc = 0i64;
            for (k, &coeff) in self.coeffs.iter().enumerate() {
                if n >= k {
                    acc += i64::from(coeff) * i64::from(input[n - k]);
                }
            }
            output.push(clamp_i32(acc >> SCALE_SHIFT));
        }
    }
}

/// All-pole extrapolation filter with Q23 coefficients.
///
/// Primed with the tail of the training block, each call to
/// [`next`](Self::next) produces one further sample from the model's own
/// history.
pub struct FeedbackModel {
    coeffs: Vec<i32>,
    /// Most recent output first.
    history: Vec<i32>,
}

impl FeedbackModel {
    #[must_use]
    pub fn new(coeffs: Vec<i32>) -> Self {
        let order = coeffs.len();
        Self {
            coeffs,
            history: vec![0; order],
        }
    }

    /// Seeds the filter history with the last `order` samples of real
    /// audio, most recent last.
    pub fn prime(&mut self, tail: &[i32]) {
        let order = self.coeffs.len();
        self.history.clear();
        self.history.resize(order, 0);
        for (slot, &sample) in self.history.iter_mut().zip(tail.iter().rev()) {
            *slot = sample;
        }
    }

    /// Produces the next extrapolated sample.
    pub fn next(&mut self) -> i32 {
        let mut acc = 0i64;
        for (k, &coeff) in self.coeffs.iter().enumerate() {
            acc += i64::from(coeff) * i64::from(self.history[k]);
        }
        let sample = clamp_i32(acc >> SCALE_SHIFT);
        self.history.rotate_right(1);
        self.history[0] = sample;
        sample
    }
}

/// Per-channel flywheel synthesiser.
///
/// Construct once (scratch buffers are sized up front); call
/// [`ramp`](Self::ramp) with a planar training block to obtain the planar
/// continuation block.
pub struct FlywheelRamper {
    training_jiffies: u64,
    ramp_jiffies: u64,
    smoother: ConvolutionModel,
    smoothed: Vec<i32>,
    channel: Vec<i32>,
    output: Vec<u8>,
}

impl FlywheelRamper {
    /// `training_jiffies` of input audio produce `ramp_jiffies` of
    /// synthesised continuation.
    #[must_use]
    pub fn new(training_jiffies: u64, ramp_jiffies: u64) -> Self {
        Self {
            training_jiffies,
            ramp_jiffies,
            smoother: ConvolutionModel::smoother(),
            smoothed: Vec::new(),
            channel: Vec::new(),
            output: Vec::new(),
        }
    }

    /// Training audio duration this ramper expects.
    #[must_use]
    pub fn training_jiffies(&self) -> u64 {
        self.training_jiffies
    }

    /// Duration of the synthesised continuation.
    #[must_use]
    pub fn ramp_jiffies(&self) -> u64 {
        self.ramp_jiffies
    }

    /// Synthesises the continuation of `input`.
    ///
    /// `input` is planar 32-bit big-endian covering up to
    /// [`training_jiffies`](Self::training_jiffies) per channel; the
    /// return value is planar 32-bit big-endian covering
    /// [`ramp_jiffies`](Self::ramp_jiffies) per channel, scaled to 24
    /// significant bits.
    ///
    /// # Panics
    ///
    /// Panics if `channels` exceeds [`MAX_CHANNELS`] or `input` is not a
    /// whole number of planar channel blocks.
    pub fn ramp(&mut self, input: &[u8], sample_rate: u32, channels: u32) -> &[u8] {
        assert!(channels > 0 && channels as usize <= MAX_CHANNELS);
        let channel_bytes = input.len() / channels as usize;
        assert_eq!(channel_bytes * channels as usize, input.len());
        assert_eq!(channel_bytes % SUBSAMPLE_BYTES, 0);

        let samples_out =
            usize::try_from(self.ramp_jiffies / jiffies::per_sample(sample_rate)).unwrap();
        let out_channel_bytes = samples_out * SUBSAMPLE_BYTES;
        self.output.clear();
        self.output.resize(out_channel_bytes * channels as usize, 0);

        for ch in 0..channels as usize {
            let plane = &input[ch * channel_bytes..(ch + 1) * channel_bytes];
            self.channel.clear();
            for sample in plane.chunks_exact(SUBSAMPLE_BYTES) {
                self.channel
                    .push(i32::from_be_bytes([sample[0], sample[1], sample[2], sample[3]]));
            }

            self.smoother.process(&self.channel, &mut self.smoothed);
            let coeffs = estimate_coefficients(&self.smoothed);
            let mut model = FeedbackModel::new(coeffs);
            model.prime(&self.channel);

            let out = &mut self.output[ch * out_channel_bytes..(ch + 1) * out_channel_bytes];
            for sample_out in out.chunks_exact_mut(SUBSAMPLE_BYTES) {
                // Keep the top 24 bits: the flywheel output format.
                let sample = (model.next() >> 8) << 8;
                sample_out.copy_from_slice(&sample.to_be_bytes());
            }
        }
        &self.output
    }
}

/// Estimates damped Q23 predictor coefficients for one channel via
/// autocorrelation and the Levinson-Durbin recursion.
fn estimate_coefficients(samples: &[i32]) -> Vec<i32> {
    let order = DEGREE.min(samples.len().saturating_sub(1));
    if order == 0 {
        return vec![0; DEGREE];
    }

    // Autocorrelation in double precision; the absolute scale cancels.
    let scaled: Vec<f64> = samples
        .iter()
        .map(|&sample| f64::from(sample) / f64::from(i32::MAX))
        .collect();
    let mut autocorr = vec![0.0f64; order + 1];
    for (lag, slot) in autocorr.iter_mut().enumerate() {
        let mut acc = 0.0;
        for n in lag..scaled.len() {
            acc += scaled[n] * scaled[n - lag];
        }
        *slot = acc;
    }
    if autocorr[0] <= f64::EPSILON {
        // Silence trains a silent model.
        return vec![0; DEGREE];
    }

    // Levinson-Durbin over the normal equations.
    let mut a = vec![0.0f64; order + 1];
    a[0] = 1.0;
    let mut error = autocorr[0];
    for i in 1..=order {
        let mut acc = autocorr[i];
        for j in 1..i {
            acc += a[j] * autocorr[i - j];
        }
        let reflection = -acc / error;
        let previous = a.clone();
        for j in 1..i {
            a[j] = previous[j] + reflection * previous[i - j];
        }
        a[i] = reflection;
        error *= 1.0 - reflection * reflection;
        if error <= 0.0 {
            break;
        }
    }

    let mut coeffs = Vec::with_capacity(DEGREE);
    let mut damp = DAMPING;
    for &value in a.iter().skip(1) {
        let quantised = (-value * damp * Q23_ONE)
            .clamp(-f64::from(i32::MAX), f64::from(i32::MAX));
        coeffs.push(quantised as i32);
        damp *= DAMPING;
    }
    coeffs.resize(DEGREE, 0);
    coeffs
}

fn clamp_i32(value: i64) -> i32 {
    value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}
