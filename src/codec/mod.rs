//! Codec interface and registration.
//!
//! A codec recognises a stream from a window of leading bytes and then
//! drives decoding cooperatively through the controller's
//! [`CodecStream`](crate::pipeline::codec_controller::CodecStream):
//! pulling encoded bytes with `read` and emitting a decoded-stream
//! boundary followed by PCM runs.
//!
//! Streaming control flow is explicit: `read` and `process` return
//! [`CodecSignal`] values instead of raising errors, and the controller's
//! outer loop reacts by selecting a new codec or ending the stream.

pub mod symphonia;

use crate::pipeline::codec_controller::CodecStream;

/// Control-flow outcomes that abort a codec run.
///
/// These are not errors: each one is a normal pipeline event observed
/// mid-decode.
#[expect(clippy::enum_variant_names)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CodecSignal {
    /// A new stream boundary arrived; recognition restarts.
    StreamStart,
    /// A flush passed through; decoding restarts after the discard point.
    StreamFlush,
    /// The stream ended (end of data, or pipeline quit).
    StreamEnded,
    /// The stream data is corrupt; the controller moves on.
    StreamCorrupt,
}

/// Result type for codec operations.
pub type CodecResult<T> = std::result::Result<T, CodecSignal>;

/// Parameters a codec reports when it has parsed a stream's headers.
#[derive(Clone, Debug, Default)]
pub struct DecodedStreamParams {
    pub bit_rate: u32,
    pub bit_depth: u32,
    pub sample_rate: u32,
    pub channels: u32,
    pub codec_name: String,
    /// Total stream length in jiffies, zero when unknown.
    pub track_length: u64,
    /// First decoded sample relative to the track start.
    pub sample_start: u64,
    pub lossless: bool,
}

/// A registered decoder.
///
/// Codecs run only on the codec-controller thread; reentrancy concerns
/// stop there.
pub trait Codec: Send {
    /// Short identifier for logs ("flac", "wav", ...).
    fn id(&self) -> &'static str;

    /// Inspects the recognition window and claims the stream or declines.
    ///
    /// Must not consume from the stream; the window is all it gets.
    fn recognise(&mut self, window: &[u8]) -> bool;

    /// Decodes the stream to completion, emitting a decoded-stream
    /// boundary and PCM through `stream`.
    ///
    /// Returns `Ok(())` at a clean end of stream. Signals observed through
    /// `stream` reads must be propagated up unchanged.
    fn process(&mut self, stream: &CodecStream) -> CodecResult<()>;

    /// Called when a stream finishes or is abandoned, before the next
    /// recognition round.
    fn stream_completed(&mut self) {}
}
