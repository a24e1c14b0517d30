//! Linear gain ramps for glitch-free transitions.
//!
//! A ramp is a linear gain envelope applied over a run of audio,
//! characterised by a direction, a start value and an end value. Values are
//! fixed-point in `[MIN, MAX]` where [`MIN`] is silence and [`MAX`] unity
//! gain. Ramps are linear in jiffies over the run they describe; the
//! per-sample multiplier is interpolated at apply time and applied to all
//! channels.
//!
//! Elements never mutate gain directly: they fold ramp segments onto audio
//! messages with [`Ramp::set`], splitting the message first when it outlives
//! the remaining ramp duration.

use std::cmp::min;

/// Maximum ramp value: unity gain.
pub const MAX: u32 = 1 << 31;

/// Minimum ramp value: silence.
///
/// Audio ramped to `MIN` is bit-exact zero.
pub const MIN: u32 = 0;

/// Direction of a gain ramp.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum Direction {
    /// No ramp: unity gain throughout.
    #[default]
    None,
    /// Gain rising towards [`MAX`].
    Up,
    /// Gain falling towards [`MIN`].
    Down,
}

/// A linear ramp segment attached to one audio message.
///
/// The segment covers the whole message; concatenating two messages
/// requires their segments to [`join`](Ramp::join).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Ramp {
    start: u32,
    end: u32,
    direction: Direction,
}

impl Ramp {
    /// Ramp value at the start of the segment.
    #[must_use]
    pub fn start(&self) -> u32 {
        self.start
    }

    /// Ramp value at the end of the segment.
    #[must_use]
    pub fn end(&self) -> u32 {
        self.end
    }

    /// Segment direction.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Whether this segment ramps at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.direction != Direction::None
    }

    /// Folds a ramp segment onto this message's ramp.
    ///
    /// The overall ramp runs linearly from `current` to the boundary value
    /// ([`MIN`] when ramping down, [`MAX`] when up) over
    /// `remaining_jiffies`; this message covers the first `msg_jiffies` of
    /// that. Returns the value at the end of the message, which becomes the
    /// caller's new `current`.
    ///
    /// When a ramp is already present the lower envelope of the two is
    /// kept, so a fold can only ever reduce gain.
    ///
    /// # Panics
    ///
    /// Panics if `msg_jiffies` exceeds `remaining_jiffies` (callers split
    /// the message first) or if `remaining_jiffies` is zero.
    pub fn set(
        &mut self,
        current: u32,
        msg_jiffies: u64,
        remaining_jiffies: u64,
        direction: Direction,
    ) -> u32 {
        assert!(remaining_jiffies > 0, "ramp over zero jiffies");
        assert!(
            msg_jiffies <= remaining_jiffies,
            "message outlives ramp: {msg_jiffies} > {remaining_jiffies}"
        );

        let end = match direction {
            Direction::Down => current - mul_div(current, msg_jiffies, remaining_jiffies),
            Direction::Up => current + mul_div(MAX - current, msg_jiffies, remaining_jiffies),
            Direction::None => current,
        };
        let segment = Self {
            start: current,
            end,
            direction,
        };
        *self = if self.is_enabled() {
            // Lower envelope: the endpoint values can only move towards
            // silence when two ramps overlap.
            Self {
                start: min(self.start, segment.start),
                end: min(self.end, segment.end),
                direction,
            }
        } else {
            segment
        };
        end
    }

    /// Interpolated ramp value at position `num` of `den`.
    ///
    /// A disabled ramp reads as unity gain everywhere.
    #[must_use]
    pub fn value_at(&self, num: u64, den: u64) -> u32 {
        if !self.is_enabled() {
            return MAX;
        }
        if den == 0 {
            return self.start;
        }
        let delta = i64::from(self.end) - i64::from(self.start);
        let offset = (i128::from(delta) * i128::from(num) / i128::from(den)) as i64;
        u32::try_from(i64::from(self.start) + offset).unwrap_or(MIN)
    }

    /// Splits the segment at `at_jiffies` of `total_jiffies`, returning the
    /// head and tail segments with matching values at the boundary.
    #[must_use]
    pub fn split(&self, at_jiffies: u64, total_jiffies: u64) -> (Self, Self) {
        if !self.is_enabled() {
            return (*self, *self);
        }
        let mid = self.value_at(at_jiffies, total_jiffies);
        (
            Self {
                start: self.start,
                end: mid,
                direction: self.direction,
            },
            Self {
                start: mid,
                end: self.end,
                direction: self.direction,
            },
        )
    }

    /// Joins two adjacent segments into one.
    ///
    /// Succeeds when both are disabled, or when the directions match and
    /// this segment's end value equals the other's start value.
    #[must_use]
    pub fn join(&self, other: &Self) -> Option<Self> {
        if !self.is_enabled() && !other.is_enabled() {
            return Some(*self);
        }
        if self.direction == other.direction && self.end == other.start {
            return Some(Self {
                start: self.start,
                end: other.end,
                direction: self.direction,
            });
        }
        None
    }
}

/// Applies a ramp value to one subsample.
///
/// [`MAX`] passes the sample through unchanged; [`MIN`] produces exact
/// silence.
#[must_use]
pub fn apply(sample: i32, value: u32) -> i32 {
    ((i64::from(sample) * i64::from(value)) >> 31) as i32
}

fn mul_div(value: u32, num: u64, den: u64) -> u32 {
    (u128::from(value) * u128::from(num) / u128::from(den)) as u32
}
