//! The closed message family traversing the pipeline.
//!
//! Every datum that moves between pipeline elements is one of the variants
//! of [`Msg`]. Message envelopes are uniquely owned pool cells that travel
//! the chain by move; the audio payloads inside them are shared,
//! reference-counted pool cells so splits and history retention never copy
//! sample data. All cells return to their own pool on last release.
//!
//! Elements dispatch on the closed variant set with `match`; a variant an
//! element does not expect at its stage of the pipeline is an
//! implementation bug and panics via [`unexpected`].
//!
//! # Ordering
//!
//! Within a single link, FIFO is absolute. State-changing messages (Mode,
//! Track, `EncodedStream`, `DecodedStream`, Drain, Halt, Flush, Quit) are
//! never reordered relative to each other.

pub mod audio;
pub mod pool;

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Condvar, Mutex,
    },
};

use crate::{
    jiffies,
    ramp::{Direction, Ramp},
    registry::HandlerHandle,
};
use audio::{DecodedAudio, Endian, EncodedData, PcmProcessor};
use pool::{Pool, PoolStats, Pooled, Reset, Shared};

/// Sentinel for "no stream".
pub const STREAM_ID_INVALID: u32 = 0;

/// Sentinel for "no flush expected".
pub const FLUSH_ID_INVALID: u32 = 0;

/// Sentinel for "no halt target".
pub const HALT_ID_INVALID: u32 = 0;

/// Sentinel for "no track".
pub const TRACK_ID_NONE: u32 = 0;

/// Capabilities of a source mode, carried by [`MsgMode`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ModeInfo {
    /// Whether the source supports pausing.
    pub supports_pause: bool,
    /// Whether the source supports next/previous track navigation.
    pub supports_next_prev: bool,
    /// Whether the source wants reservoir fill levels reported to a clock
    /// puller for rate adaptation.
    pub supports_latency: bool,
}

/// Track metadata and identity.
///
/// Cheap to clone; the id is unique for the lifetime of the pipeline.
#[derive(Clone, Debug)]
pub struct Track {
    id: u32,
    uri: Arc<str>,
    metadata: Arc<str>,
}

impl Track {
    /// Creates a track. Ids come from the pipeline's id provider.
    #[must_use]
    pub fn new(id: u32, uri: &str, metadata: &str) -> Self {
        Self {
            id,
            uri: Arc::from(uri),
            metadata: Arc::from(metadata),
        }
    }

    /// The null track, emitted when a provider has nothing to play.
    #[must_use]
    pub fn null() -> Self {
        Self::new(TRACK_ID_NONE, "", "")
    }

    /// Unique track id; [`TRACK_ID_NONE`] for the null track.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Track URI.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Opaque track metadata.
    #[must_use]
    pub fn metadata(&self) -> &str {
        &self.metadata
    }
}

/// Parameters of a decoded stream, carried by [`MsgDecodedStream`].
#[derive(Clone, Debug, Default)]
pub struct StreamInfo {
    pub stream_id: u32,
    pub bit_rate: u32,
    pub bit_depth: u32,
    pub sample_rate: u32,
    pub channels: u32,
    pub codec_name: String,
    /// Total stream length in jiffies, zero when unknown.
    pub track_length: u64,
    /// First sample of the stream relative to the track start.
    pub sample_start: u64,
    pub lossless: bool,
    pub seekable: bool,
    pub live: bool,
    /// The element that plays the stream-handler role for this stream.
    pub handler: Option<HandlerHandle>,
}

/// Marks the start of a new source context.
#[derive(Debug, Default)]
pub struct MsgMode {
    mode: String,
    info: ModeInfo,
}

impl MsgMode {
    /// Opaque mode name.
    #[must_use]
    pub fn mode(&self) -> &str {
        &self.mode
    }

    /// Mode capabilities.
    #[must_use]
    pub fn info(&self) -> ModeInfo {
        self.info
    }
}

impl Reset for MsgMode {
    fn reset(&mut self) {
        self.mode.clear();
        self.info = ModeInfo::default();
    }
}

/// Announces the track that subsequent streams belong to.
#[derive(Debug)]
pub struct MsgTrack {
    track: Track,
    start_of_stream: bool,
}

impl MsgTrack {
    /// The track being announced.
    #[must_use]
    pub fn track(&self) -> &Track {
        &self.track
    }

    /// Whether this track begins a new stream of data.
    #[must_use]
    pub fn start_of_stream(&self) -> bool {
        self.start_of_stream
    }
}

impl Default for MsgTrack {
    fn default() -> Self {
        Self {
            track: Track::null(),
            start_of_stream: true,
        }
    }
}

impl Reset for MsgTrack {
    fn reset(&mut self) {
        self.track = Track::null();
        self.start_of_stream = true;
    }
}

/// Requests that all downstream audio drain, then invokes a hook.
#[derive(Default)]
pub struct MsgDrain {
    hook: Option<Box<dyn FnOnce() + Send>>,
}

impl MsgDrain {
    /// Invokes the completion hook. Called by the terminal consumer once
    /// all audio queued ahead of this message has left the pipeline.
    pub fn complete(&mut self) {
        if let Some(hook) = self.hook.take() {
            hook();
        }
    }
}

impl std::fmt::Debug for MsgDrain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgDrain")
            .field("pending", &self.hook.is_some())
            .finish()
    }
}

impl Reset for MsgDrain {
    fn reset(&mut self) {
        self.hook = None;
    }
}

/// Requests a minimum additional latency downstream.
#[derive(Debug, Default)]
pub struct MsgDelay {
    jiffies: u64,
}

impl MsgDelay {
    /// Requested minimum latency in jiffies.
    #[must_use]
    pub fn jiffies(&self) -> u64 {
        self.jiffies
    }
}

impl Reset for MsgDelay {
    fn reset(&mut self) {
        self.jiffies = 0;
    }
}

/// Start of an encoded stream.
#[derive(Debug, Default)]
pub struct MsgEncodedStream {
    pub uri: String,
    pub metatext: String,
    pub total_bytes: u64,
    pub stream_id: u32,
    pub seekable: bool,
    pub live: bool,
    /// The upstream element to control this stream through.
    pub handler: Option<HandlerHandle>,
}

impl Reset for MsgEncodedStream {
    fn reset(&mut self) {
        self.uri.clear();
        self.metatext.clear();
        self.total_bytes = 0;
        self.stream_id = STREAM_ID_INVALID;
        self.seekable = false;
        self.live = false;
        self.handler = None;
    }
}

/// One window into shared encoded bytes.
#[derive(Clone, Debug)]
struct EncodedSegment {
    data: Shared<EncodedData>,
    offset: usize,
    len: usize,
}

/// A run of opaque encoded bytes.
///
/// Splitting and concatenating adjusts segment windows over shared buffers;
/// bytes are only copied when a reader asks for a contiguous view.
#[derive(Debug, Default)]
pub struct MsgAudioEncoded {
    segments: Vec<EncodedSegment>,
    total: usize,
}

impl MsgAudioEncoded {
    /// Total byte count across all segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.total
    }

    /// Whether the message carries no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Copies up to `out.len()` bytes starting at `offset` into `out`,
    /// returning the count copied.
    pub fn copy_to(&self, mut offset: usize, out: &mut [u8]) -> usize {
        let mut written = 0;
        for segment in &self.segments {
            if written == out.len() {
                break;
            }
            if offset >= segment.len {
                offset -= segment.len;
                continue;
            }
            let available = segment.len - offset;
            let take = available.min(out.len() - written);
            let src = &segment.data.as_slice()[segment.offset + offset..segment.offset + offset + take];
            out[written..written + take].copy_from_slice(src);
            written += take;
            offset = 0;
        }
        written
    }

    /// Discards the first `bytes` bytes in place.
    pub fn discard_front(&mut self, mut bytes: usize) {
        assert!(bytes <= self.total);
        self.total -= bytes;
        while bytes > 0 {
            let segment = &mut self.segments[0];
            if bytes >= segment.len {
                bytes -= segment.len;
                self.segments.remove(0);
            } else {
                segment.offset += bytes;
                segment.len -= bytes;
                bytes = 0;
            }
        }
    }
}

impl Reset for MsgAudioEncoded {
    fn reset(&mut self) {
        self.segments.clear();
        self.total = 0;
    }
}

impl Pooled<MsgAudioEncoded> {
    /// Concatenates `other` onto the end of this message without copying.
    pub fn add(&mut self, mut other: Pooled<MsgAudioEncoded>) {
        let total = other.total;
        let mut segments = std::mem::take(&mut other.segments);
        self.segments.append(&mut segments);
        self.total += total;
    }

    /// Splits off everything after the first `at_bytes` bytes into a new
    /// message sharing the same buffers.
    ///
    /// # Panics
    ///
    /// Panics if `at_bytes` is not strictly inside the message.
    pub fn split(&mut self, at_bytes: usize) -> Pooled<MsgAudioEncoded> {
        assert!(at_bytes > 0 && at_bytes < self.total, "split outside message");
        let mut tail = self.sibling();
        let mut remaining = at_bytes;
        let mut keep = 0;
        for (i, segment) in self.segments.iter_mut().enumerate() {
            if remaining >= segment.len {
                remaining -= segment.len;
                keep = i + 1;
                continue;
            }
            if remaining > 0 {
                // Split mid-segment: the tail gets a second window over the
                // same shared buffer.
                let mut tail_segment = segment.clone();
                tail_segment.offset += remaining;
                tail_segment.len -= remaining;
                segment.len = remaining;
                tail.segments.push(tail_segment);
                keep = i + 1;
            } else {
                keep = i;
            }
            break;
        }
        for segment in self.segments.drain(keep..) {
            tail.segments.push(segment);
        }
        tail.total = tail.segments.iter().map(|s| s.len).sum();
        self.total = at_bytes;
        tail
    }

    /// A new message referencing the same bytes, for replay buffering.
    #[must_use]
    pub fn clone_window(&self) -> Pooled<MsgAudioEncoded> {
        let mut copy = self.sibling();
        copy.segments.extend(self.segments.iter().cloned());
        copy.total = self.total;
        copy
    }
}

/// Opaque metadata text.
#[derive(Debug, Default)]
pub struct MsgMetaText {
    text: String,
}

impl MsgMetaText {
    /// The metadata text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }
}

impl Reset for MsgMetaText {
    fn reset(&mut self) {
        self.text.clear();
    }
}

/// Marks that the preceding audio ends abruptly.
#[derive(Debug, Default)]
pub struct MsgStreamInterrupted;

impl Reset for MsgStreamInterrupted {
    fn reset(&mut self) {}
}

/// Start of a decoded stream; parameters are constant until the next one.
#[derive(Debug, Default)]
pub struct MsgDecodedStream {
    info: StreamInfo,
}

impl MsgDecodedStream {
    /// Stream parameters.
    #[must_use]
    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    /// Replaces the stream-handler reference, used by elements that
    /// interpose themselves in the control path.
    pub fn set_handler(&mut self, handler: Option<HandlerHandle>) {
        self.info.handler = handler;
    }
}

impl Reset for MsgDecodedStream {
    fn reset(&mut self) {
        self.info = StreamInfo::default();
    }
}

/// Latest bitrate estimate, informational.
#[derive(Debug, Default)]
pub struct MsgBitRate {
    bits_per_second: u32,
}

impl MsgBitRate {
    #[must_use]
    pub fn bits_per_second(&self) -> u32 {
        self.bits_per_second
    }
}

impl Reset for MsgBitRate {
    fn reset(&mut self) {
        self.bits_per_second = 0;
    }
}

/// A run of decoded PCM samples with ramp state.
#[derive(Debug, Default)]
pub struct MsgAudioPcm {
    audio: Option<Shared<DecodedAudio>>,
    offset_samples: usize,
    sample_count: usize,
    ramp: Ramp,
    /// Offset of this run from the start of its track, in jiffies.
    track_offset: u64,
}

impl MsgAudioPcm {
    /// Duration in jiffies.
    #[must_use]
    pub fn jiffies(&self) -> u64 {
        self.audio.as_ref().map_or(0, |audio| {
            self.sample_count as u64 * audio.jiffies_per_sample()
        })
    }

    /// Number of whole samples.
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// The ramp segment attached to this run.
    #[must_use]
    pub fn ramp(&self) -> Ramp {
        self.ramp
    }

    /// Offset from the start of the track, in jiffies.
    #[must_use]
    pub fn track_offset(&self) -> u64 {
        self.track_offset
    }

    /// The shared decoded-audio cell backing this run.
    ///
    /// # Panics
    ///
    /// Panics when called on a cleared cell; messages in flight always
    /// carry audio.
    #[must_use]
    pub fn audio(&self) -> &DecodedAudio {
        self.audio.as_ref().expect("audio present in flight")
    }

    /// Streams the ramped samples to `processor`.
    pub fn read(&self, processor: &mut dyn PcmProcessor) {
        audio::read_pcm(
            self.audio(),
            self.offset_samples,
            self.sample_count,
            self.ramp,
            processor,
        );
    }
}

impl Reset for MsgAudioPcm {
    fn reset(&mut self) {
        self.audio = None;
        self.offset_samples = 0;
        self.sample_count = 0;
        self.ramp = Ramp::default();
        self.track_offset = 0;
    }
}

impl Pooled<MsgAudioPcm> {
    /// Splits off everything after the first `at_jiffies` jiffies into a
    /// new message sharing the same audio cell. `at_jiffies` rounds down
    /// to a whole sample.
    ///
    /// # Panics
    ///
    /// Panics if the rounded split point is not strictly inside the
    /// message.
    pub fn split(&mut self, at_jiffies: u64) -> Pooled<MsgAudioPcm> {
        let jiffies_per_sample = self.audio().jiffies_per_sample();
        let at_samples = usize::try_from(at_jiffies / jiffies_per_sample).unwrap();
        assert!(
            at_samples > 0 && at_samples < self.sample_count,
            "split outside message"
        );

        let (head_ramp, tail_ramp) = self
            .ramp
            .split(at_samples as u64, self.sample_count as u64);

        let mut tail = self.sibling();
        tail.audio = self.audio.clone();
        tail.offset_samples = self.offset_samples + at_samples;
        tail.sample_count = self.sample_count - at_samples;
        tail.ramp = tail_ramp;
        tail.track_offset = self.track_offset + at_samples as u64 * jiffies_per_sample;

        self.sample_count = at_samples;
        self.ramp = head_ramp;
        tail
    }

    /// Folds a ramp onto this message.
    ///
    /// The ramp runs from `current` to its boundary value over
    /// `remaining` jiffies. If the message is longer than `remaining`, it
    /// is split and the tail (with no ramp) is returned. The first element
    /// of the result is the ramp value at the end of this message.
    pub fn set_ramp(
        &mut self,
        current: u32,
        remaining: u64,
        direction: Direction,
    ) -> (u32, Option<Pooled<MsgAudioPcm>>) {
        let jiffies = self.jiffies();
        if jiffies > remaining {
            // A remainder below one sample cannot be split off; the ramp
            // then completes one sample late.
            let at = remaining.max(self.audio().jiffies_per_sample());
            let tail = (at < jiffies).then(|| self.split(at));
            let head_jiffies = self.jiffies();
            let new_current =
                self.ramp
                    .set(current, head_jiffies, remaining.max(head_jiffies), direction);
            (new_current, tail)
        } else {
            let new_current = self.ramp.set(current, jiffies, remaining, direction);
            (new_current, None)
        }
    }

    /// A new message referencing the same samples, for history retention.
    #[must_use]
    pub fn shallow_clone(&self) -> Pooled<MsgAudioPcm> {
        let mut copy = self.sibling();
        copy.audio = self.audio.clone();
        copy.offset_samples = self.offset_samples;
        copy.sample_count = self.sample_count;
        copy.ramp = self.ramp;
        copy.track_offset = self.track_offset;
        copy
    }

    /// Appends `other`'s samples to this message when the backing cell is
    /// exclusively held and neither message is ramped. Returns whether the
    /// aggregation happened.
    ///
    /// # Panics
    ///
    /// Panics if either message carries a ramp: aggregation runs upstream
    /// of every ramping element.
    pub fn try_aggregate(&mut self, other: &Pooled<MsgAudioPcm>) -> bool {
        assert!(!self.ramp.is_enabled() && !other.ramp.is_enabled());
        let other_audio = other.audio.as_ref().expect("audio present in flight");

        let appendable = {
            let audio = self.audio.as_ref().expect("audio present in flight");
            self.offset_samples + self.sample_count == audio.sample_count()
        };
        if !appendable {
            return false;
        }

        let (offset, count) = (other.offset_samples, other.sample_count);
        let Some(audio) = self.audio.as_mut().and_then(Shared::get_mut) else {
            return false;
        };
        audio.append(other_audio, offset, count);
        self.sample_count += count;
        true
    }
}

/// Ramp-capable zero audio, materialised as PCM only at the sink.
#[derive(Debug, Default)]
pub struct MsgSilence {
    jiffies: u64,
    sample_rate: u32,
    bit_depth: u32,
    channels: u32,
    ramp: Ramp,
}

impl MsgSilence {
    /// Duration in jiffies; always a whole number of samples.
    #[must_use]
    pub fn jiffies(&self) -> u64 {
        self.jiffies
    }

    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub fn bit_depth(&self) -> u32 {
        self.bit_depth
    }

    #[must_use]
    pub fn channels(&self) -> u32 {
        self.channels
    }

    /// The ramp segment attached to this run.
    #[must_use]
    pub fn ramp(&self) -> Ramp {
        self.ramp
    }

    /// Number of whole samples.
    #[must_use]
    pub fn sample_count(&self) -> usize {
        usize::try_from(self.jiffies / jiffies::per_sample(self.sample_rate)).unwrap_or(0)
    }

    /// Streams zeros to `processor`.
    pub fn read(&self, processor: &mut dyn PcmProcessor) {
        audio::read_silence(self.sample_count(), self.channels, self.bit_depth, processor);
    }
}

impl Reset for MsgSilence {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

impl Pooled<MsgSilence> {
    /// Splits off everything after the first `at_jiffies` jiffies,
    /// rounding down to a whole sample.
    pub fn split(&mut self, at_jiffies: u64) -> Pooled<MsgSilence> {
        let jiffies_per_sample = jiffies::per_sample(self.sample_rate);
        let head_jiffies = (at_jiffies / jiffies_per_sample) * jiffies_per_sample;
        assert!(
            head_jiffies > 0 && head_jiffies < self.jiffies,
            "split outside message"
        );
        let (head_ramp, tail_ramp) = self.ramp.split(head_jiffies, self.jiffies);

        let mut tail = self.sibling();
        tail.jiffies = self.jiffies - head_jiffies;
        tail.sample_rate = self.sample_rate;
        tail.bit_depth = self.bit_depth;
        tail.channels = self.channels;
        tail.ramp = tail_ramp;

        self.jiffies = head_jiffies;
        self.ramp = head_ramp;
        tail
    }

    /// Folds a ramp onto this message, splitting like
    /// [`Pooled::<MsgAudioPcm>::set_ramp`].
    pub fn set_ramp(
        &mut self,
        current: u32,
        remaining: u64,
        direction: Direction,
    ) -> (u32, Option<Pooled<MsgSilence>>) {
        if self.jiffies > remaining {
            let at = remaining.max(jiffies::per_sample(self.sample_rate));
            let tail = (at < self.jiffies).then(|| self.split(at));
            let head_jiffies = self.jiffies;
            let new_current =
                self.ramp
                    .set(current, head_jiffies, remaining.max(head_jiffies), direction);
            (new_current, tail)
        } else {
            let jiffies = self.jiffies;
            let new_current = self.ramp.set(current, jiffies, remaining, direction);
            (new_current, None)
        }
    }
}

/// What a [`MsgPlayable`] plays.
#[derive(Debug, Default)]
enum PlayableContent {
    #[default]
    Empty,
    Pcm {
        audio: Shared<DecodedAudio>,
        offset_samples: usize,
    },
    Silence,
}

/// Terminal message form passed to the sink.
///
/// Carries everything needed to feed a bit-depth-specialised consumer;
/// the ramp is applied during [`read`](Self::read).
#[derive(Debug, Default)]
pub struct MsgPlayable {
    content: PlayableContent,
    sample_count: usize,
    sample_rate: u32,
    bit_depth: u32,
    channels: u32,
    ramp: Ramp,
}

impl MsgPlayable {
    /// Byte count the sink will receive.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sample_count * self.channels as usize * self.bit_depth as usize / 8
    }

    /// Whether the playable carries no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }

    /// Duration in jiffies.
    #[must_use]
    pub fn jiffies(&self) -> u64 {
        self.sample_count as u64 * jiffies::per_sample(self.sample_rate)
    }

    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub fn bit_depth(&self) -> u32 {
        self.bit_depth
    }

    #[must_use]
    pub fn channels(&self) -> u32 {
        self.channels
    }

    /// Streams the block to a bit-depth-specialised consumer.
    pub fn read(&self, processor: &mut dyn PcmProcessor) {
        match &self.content {
            PlayableContent::Empty => {}
            PlayableContent::Pcm {
                audio,
                offset_samples,
            } => audio::read_pcm(audio, *offset_samples, self.sample_count, self.ramp, processor),
            PlayableContent::Silence => {
                audio::read_silence(self.sample_count, self.channels, self.bit_depth, processor);
            }
        }
    }
}

impl Reset for MsgPlayable {
    fn reset(&mut self) {
        self.content = PlayableContent::Empty;
        self.sample_count = 0;
        self.sample_rate = 0;
        self.bit_depth = 0;
        self.channels = 0;
        self.ramp = Ramp::default();
    }
}

/// Boundary marker: no audio for a while. Carries a matchable id.
#[derive(Debug, Default)]
pub struct MsgHalt {
    id: u32,
}

impl MsgHalt {
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Reset for MsgHalt {
    fn reset(&mut self) {
        self.id = HALT_ID_INVALID;
    }
}

/// Discard marker matched by id to a prior `try_stop`/`try_seek`.
#[derive(Debug, Default)]
pub struct MsgFlush {
    id: u32,
}

impl MsgFlush {
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Reset for MsgFlush {
    fn reset(&mut self) {
        self.id = FLUSH_ID_INVALID;
    }
}

/// Informational boundary: the stream paused awaiting an external signal.
#[derive(Debug, Default)]
pub struct MsgWait;

impl Reset for MsgWait {
    fn reset(&mut self) {}
}

/// Terminal sentinel: elements shut down on arrival.
#[derive(Debug, Default)]
pub struct MsgQuit;

impl Reset for MsgQuit {
    fn reset(&mut self) {}
}

/// One message in flight.
#[derive(Debug)]
pub enum Msg {
    Mode(Pooled<MsgMode>),
    Track(Pooled<MsgTrack>),
    Drain(Pooled<MsgDrain>),
    Delay(Pooled<MsgDelay>),
    EncodedStream(Pooled<MsgEncodedStream>),
    AudioEncoded(Pooled<MsgAudioEncoded>),
    MetaText(Pooled<MsgMetaText>),
    StreamInterrupted(Pooled<MsgStreamInterrupted>),
    DecodedStream(Pooled<MsgDecodedStream>),
    BitRate(Pooled<MsgBitRate>),
    AudioPcm(Pooled<MsgAudioPcm>),
    Silence(Pooled<MsgSilence>),
    Playable(Pooled<MsgPlayable>),
    Halt(Pooled<MsgHalt>),
    Flush(Pooled<MsgFlush>),
    Wait(Pooled<MsgWait>),
    Quit(Pooled<MsgQuit>),
}

impl Msg {
    /// Variant name, for logs and panics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Mode(_) => "Mode",
            Msg::Track(_) => "Track",
            Msg::Drain(_) => "Drain",
            Msg::Delay(_) => "Delay",
            Msg::EncodedStream(_) => "EncodedStream",
            Msg::AudioEncoded(_) => "AudioEncoded",
            Msg::MetaText(_) => "MetaText",
            Msg::StreamInterrupted(_) => "StreamInterrupted",
            Msg::DecodedStream(_) => "DecodedStream",
            Msg::BitRate(_) => "BitRate",
            Msg::AudioPcm(_) => "AudioPcm",
            Msg::Silence(_) => "Silence",
            Msg::Playable(_) => "Playable",
            Msg::Halt(_) => "Halt",
            Msg::Flush(_) => "Flush",
            Msg::Wait(_) => "Wait",
            Msg::Quit(_) => "Quit",
        }
    }

    /// Duration in jiffies; zero for non-audio messages.
    #[must_use]
    pub fn jiffies(&self) -> u64 {
        match self {
            Msg::AudioPcm(msg) => msg.jiffies(),
            Msg::Silence(msg) => msg.jiffies(),
            Msg::Playable(msg) => msg.jiffies(),
            _ => 0,
        }
    }

    /// Whether this is decoded audio (PCM or silence).
    #[must_use]
    pub fn is_audio(&self) -> bool {
        matches!(self, Msg::AudioPcm(_) | Msg::Silence(_))
    }
}

/// Panics for a message an element does not consume.
///
/// Receiving one indicates an implementation bug in the chain assembly,
/// not a runtime condition.
pub fn unexpected(element: &str, msg: &Msg) -> ! {
    panic!("{element}: unexpected {} at this pipeline stage", msg.kind());
}

/// Blocking FIFO of messages with head re-insertion.
#[derive(Default)]
pub struct MsgQueue {
    inner: Mutex<VecDeque<Msg>>,
    available: Condvar,
}

impl MsgQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message.
    pub fn enqueue(&self, msg: Msg) {
        self.inner.lock().unwrap().push_back(msg);
        self.available.notify_one();
    }

    /// Re-inserts a message at the head, ahead of everything queued.
    pub fn enqueue_at_head(&self, msg: Msg) {
        self.inner.lock().unwrap().push_front(msg);
        self.available.notify_one();
    }

    /// Removes and returns the head, blocking while empty.
    pub fn dequeue(&self) -> Msg {
        let mut queue = self.inner.lock().unwrap();
        loop {
            if let Some(msg) = queue.pop_front() {
                return msg;
            }
            queue = self.available.wait(queue).unwrap();
        }
    }

    /// Removes and returns the head if one is queued.
    pub fn try_dequeue(&self) -> Option<Msg> {
        self.inner.lock().unwrap().pop_front()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

/// Sizing for every pool the factory owns.
///
/// Capacities bound the whole pipeline's memory; a pool that blocks in
/// steady state is under-sized for the configured reservoirs.
#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    pub mode: usize,
    pub track: usize,
    pub drain: usize,
    pub delay: usize,
    pub encoded_stream: usize,
    pub audio_encoded: usize,
    pub encoded_data: usize,
    pub meta_text: usize,
    pub stream_interrupted: usize,
    pub decoded_stream: usize,
    pub bit_rate: usize,
    pub audio_pcm: usize,
    pub decoded_audio: usize,
    pub silence: usize,
    pub playable: usize,
    pub halt: usize,
    pub flush: usize,
    pub wait: usize,
    pub quit: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            mode: 8,
            track: 24,
            drain: 8,
            delay: 8,
            encoded_stream: 24,
            audio_encoded: 512,
            encoded_data: 512,
            meta_text: 24,
            stream_interrupted: 8,
            decoded_stream: 24,
            bit_rate: 8,
            audio_pcm: 512,
            decoded_audio: 256,
            silence: 32,
            playable: 128,
            halt: 24,
            flush: 24,
            wait: 8,
            quit: 2,
        }
    }
}

/// Creates every pipeline message; owned by the pipeline, cloned into each
/// producing element.
///
/// All creation methods block when the variant's pool is exhausted.
#[derive(Clone)]
pub struct MsgFactory {
    mode: Pool<MsgMode>,
    track: Pool<MsgTrack>,
    drain: Pool<MsgDrain>,
    delay: Pool<MsgDelay>,
    encoded_stream: Pool<MsgEncodedStream>,
    audio_encoded: Pool<MsgAudioEncoded>,
    encoded_data: Pool<EncodedData>,
    meta_text: Pool<MsgMetaText>,
    stream_interrupted: Pool<MsgStreamInterrupted>,
    decoded_stream: Pool<MsgDecodedStream>,
    bit_rate: Pool<MsgBitRate>,
    audio_pcm: Pool<MsgAudioPcm>,
    decoded_audio: Pool<DecodedAudio>,
    silence: Pool<MsgSilence>,
    playable: Pool<MsgPlayable>,
    halt: Pool<MsgHalt>,
    flush: Pool<MsgFlush>,
    wait: Pool<MsgWait>,
    quit: Pool<MsgQuit>,
    next_halt_id: Arc<AtomicU32>,
}

impl MsgFactory {
    /// Creates the factory and all pools.
    #[must_use]
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            mode: Pool::new("MsgMode", config.mode, MsgMode::default),
            track: Pool::new("MsgTrack", config.track, MsgTrack::default),
            drain: Pool::new("MsgDrain", config.drain, MsgDrain::default),
            delay: Pool::new("MsgDelay", config.delay, MsgDelay::default),
            encoded_stream: Pool::new(
                "MsgEncodedStream",
                config.encoded_stream,
                MsgEncodedStream::default,
            ),
            audio_encoded: Pool::new(
                "MsgAudioEncoded",
                config.audio_encoded,
                MsgAudioEncoded::default,
            ),
            encoded_data: Pool::new("EncodedData", config.encoded_data, EncodedData::default),
            meta_text: Pool::new("MsgMetaText", config.meta_text, MsgMetaText::default),
            stream_interrupted: Pool::new(
                "MsgStreamInterrupted",
                config.stream_interrupted,
                MsgStreamInterrupted::default,
            ),
            decoded_stream: Pool::new(
                "MsgDecodedStream",
                config.decoded_stream,
                MsgDecodedStream::default,
            ),
            bit_rate: Pool::new("MsgBitRate", config.bit_rate, MsgBitRate::default),
            audio_pcm: Pool::new("MsgAudioPcm", config.audio_pcm, MsgAudioPcm::default),
            decoded_audio: Pool::new(
                "DecodedAudio",
                config.decoded_audio,
                DecodedAudio::default,
            ),
            silence: Pool::new("MsgSilence", config.silence, MsgSilence::default),
            playable: Pool::new("MsgPlayable", config.playable, MsgPlayable::default),
            halt: Pool::new("MsgHalt", config.halt, MsgHalt::default),
            flush: Pool::new("MsgFlush", config.flush, MsgFlush::default),
            wait: Pool::new("MsgWait", config.wait, MsgWait::default),
            quit: Pool::new("MsgQuit", config.quit, MsgQuit::default),
            next_halt_id: Arc::new(AtomicU32::new(1)),
        }
    }

    /// New mode boundary.
    pub fn mode(&self, name: &str, info: ModeInfo) -> Msg {
        let mut msg = self.mode.allocate();
        msg.mode.push_str(name);
        msg.info = info;
        Msg::Mode(msg)
    }

    /// New track announcement.
    pub fn track(&self, track: Track, start_of_stream: bool) -> Msg {
        let mut msg = self.track.allocate();
        msg.track = track;
        msg.start_of_stream = start_of_stream;
        Msg::Track(msg)
    }

    /// New drain request with a completion hook.
    pub fn drain(&self, hook: Box<dyn FnOnce() + Send>) -> Msg {
        let mut msg = self.drain.allocate();
        msg.hook = Some(hook);
        Msg::Drain(msg)
    }

    /// New latency request.
    pub fn delay(&self, delay_jiffies: u64) -> Msg {
        let mut msg = self.delay.allocate();
        msg.jiffies = delay_jiffies;
        Msg::Delay(msg)
    }

    /// New encoded-stream boundary.
    #[expect(clippy::too_many_arguments)]
    pub fn encoded_stream(
        &self,
        uri: &str,
        metatext: &str,
        total_bytes: u64,
        stream_id: u32,
        seekable: bool,
        live: bool,
        handler: Option<HandlerHandle>,
    ) -> Msg {
        let mut msg = self.encoded_stream.allocate();
        msg.uri.push_str(uri);
        msg.metatext.push_str(metatext);
        msg.total_bytes = total_bytes;
        msg.stream_id = stream_id;
        msg.seekable = seekable;
        msg.live = live;
        msg.handler = handler;
        Msg::EncodedStream(msg)
    }

    /// New run of encoded bytes (one copy, into a pooled buffer).
    pub fn audio_encoded(&self, data: &[u8]) -> Msg {
        let mut cell = self.encoded_data.allocate_shared();
        cell.get_mut()
            .expect("freshly allocated cell is unique")
            .set(data);
        let len = data.len();
        let mut msg = self.audio_encoded.allocate();
        msg.segments.push(EncodedSegment {
            data: cell,
            offset: 0,
            len,
        });
        msg.total = len;
        Msg::AudioEncoded(msg)
    }

    /// New metadata text.
    pub fn meta_text(&self, text: &str) -> Msg {
        let mut msg = self.meta_text.allocate();
        msg.text.push_str(text);
        Msg::MetaText(msg)
    }

    /// New abrupt-end marker.
    pub fn stream_interrupted(&self) -> Msg {
        Msg::StreamInterrupted(self.stream_interrupted.allocate())
    }

    /// New decoded-stream boundary.
    pub fn decoded_stream(&self, info: StreamInfo) -> Msg {
        let mut msg = self.decoded_stream.allocate();
        msg.info = info;
        Msg::DecodedStream(msg)
    }

    /// New bitrate estimate.
    pub fn bit_rate(&self, bits_per_second: u32) -> Msg {
        let mut msg = self.bit_rate.allocate();
        msg.bits_per_second = bits_per_second;
        Msg::BitRate(msg)
    }

    /// New run of decoded samples, unpacked into a pooled audio cell.
    pub fn audio_pcm(
        &self,
        data: &[u8],
        channels: u32,
        sample_rate: u32,
        bit_depth: u32,
        endian: Endian,
        track_offset: u64,
    ) -> Msg {
        let mut cell = self.decoded_audio.allocate_shared();
        cell.get_mut()
            .expect("freshly allocated cell is unique")
            .set(data, channels, sample_rate, bit_depth, endian);
        let sample_count = cell.sample_count();
        let mut msg = self.audio_pcm.allocate();
        msg.audio = Some(cell);
        msg.offset_samples = 0;
        msg.sample_count = sample_count;
        msg.track_offset = track_offset;
        Msg::AudioPcm(msg)
    }

    /// New run of ramp-capable silence; `silence_jiffies` rounds down to a
    /// whole sample.
    pub fn silence(
        &self,
        silence_jiffies: u64,
        sample_rate: u32,
        bit_depth: u32,
        channels: u32,
    ) -> Msg {
        let jiffies_per_sample = jiffies::per_sample(sample_rate);
        let mut msg = self.silence.allocate();
        msg.jiffies = (silence_jiffies / jiffies_per_sample) * jiffies_per_sample;
        msg.sample_rate = sample_rate;
        msg.bit_depth = bit_depth;
        msg.channels = channels;
        Msg::Silence(msg)
    }

    /// Converts decoded audio into its terminal playable form.
    pub fn playable_from_pcm(&self, pcm: &Pooled<MsgAudioPcm>) -> Msg {
        let audio = pcm.audio.as_ref().expect("audio present in flight");
        let mut msg = self.playable.allocate();
        msg.sample_count = pcm.sample_count;
        msg.sample_rate = audio.sample_rate();
        msg.bit_depth = audio.bit_depth();
        msg.channels = audio.channels();
        msg.ramp = pcm.ramp;
        msg.content = PlayableContent::Pcm {
            audio: audio.clone(),
            offset_samples: pcm.offset_samples,
        };
        Msg::Playable(msg)
    }

    /// Converts silence into its terminal playable form.
    pub fn playable_from_silence(&self, silence: &MsgSilence) -> Msg {
        let mut msg = self.playable.allocate();
        msg.sample_count = silence.sample_count();
        msg.sample_rate = silence.sample_rate;
        msg.bit_depth = silence.bit_depth;
        msg.channels = silence.channels;
        msg.ramp = silence.ramp;
        msg.content = PlayableContent::Silence;
        Msg::Playable(msg)
    }

    /// New halt boundary with a freshly issued id.
    pub fn halt(&self) -> Msg {
        self.halt_with_id(self.next_halt_id())
    }

    /// New halt boundary carrying `id`.
    pub fn halt_with_id(&self, id: u32) -> Msg {
        let mut msg = self.halt.allocate();
        msg.id = id;
        Msg::Halt(msg)
    }

    /// Issues the next halt id without creating a message.
    pub fn next_halt_id(&self) -> u32 {
        self.next_halt_id.fetch_add(1, Ordering::Relaxed)
    }

    /// New flush marker carrying `id`.
    pub fn flush(&self, id: u32) -> Msg {
        let mut msg = self.flush.allocate();
        msg.id = id;
        Msg::Flush(msg)
    }

    /// New wait boundary.
    pub fn wait(&self) -> Msg {
        Msg::Wait(self.wait.allocate())
    }

    /// New terminal sentinel.
    pub fn quit(&self) -> Msg {
        Msg::Quit(self.quit.allocate())
    }

    /// Sizing of the encoded-data cell pool, for reservoir tuning.
    #[must_use]
    pub fn encoded_data_stats(&self) -> PoolStats {
        self.encoded_data.stats()
    }

    /// Telemetry for every pool, in creation order.
    #[must_use]
    pub fn pool_stats(&self) -> Vec<PoolStats> {
        vec![
            self.mode.stats(),
            self.track.stats(),
            self.drain.stats(),
            self.delay.stats(),
            self.encoded_stream.stats(),
            self.audio_encoded.stats(),
            self.encoded_data.stats(),
            self.meta_text.stats(),
            self.stream_interrupted.stats(),
            self.decoded_stream.stats(),
            self.bit_rate.stats(),
            self.audio_pcm.stats(),
            self.decoded_audio.stats(),
            self.silence.stats(),
            self.playable.stats(),
            self.halt.stats(),
            self.flush.stats(),
            self.wait.stats(),
            self.quit.stats(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> MsgFactory {
        MsgFactory::new(&PoolConfig::default())
    }

    fn pcm(factory: &MsgFactory, samples: usize) -> Pooled<MsgAudioPcm> {
        let data: Vec<u8> = (0..samples * 4).map(|i| i as u8).collect();
        match factory.audio_pcm(&data, 2, 44_100, 16, Endian::Big, 0) {
            Msg::AudioPcm(msg) => msg,
            other => unexpected("test", &other),
        }
    }

    #[test]
    fn encoded_split_and_add_preserve_bytes() {
        let factory = factory();
        let data: Vec<u8> = (0..100).collect();
        let Msg::AudioEncoded(mut head) = factory.audio_encoded(&data) else {
            panic!("wrong variant");
        };

        let tail = head.split(33);
        assert_eq!(head.len(), 33);
        assert_eq!(tail.len(), 67);

        head.add(tail);
        assert_eq!(head.len(), 100);
        let mut out = vec![0u8; 100];
        assert_eq!(head.copy_to(0, &mut out), 100);
        assert_eq!(out, data);
    }

    #[test]
    fn encoded_discard_front_spans_segments() {
        let factory = factory();
        let Msg::AudioEncoded(mut msg) = factory.audio_encoded(&[1u8; 10]) else {
            panic!("wrong variant");
        };
        let Msg::AudioEncoded(second) = factory.audio_encoded(&[2u8; 10]) else {
            panic!("wrong variant");
        };
        msg.add(second);
        msg.discard_front(15);
        assert_eq!(msg.len(), 5);
        let mut out = [0u8; 5];
        msg.copy_to(0, &mut out);
        assert_eq!(out, [2u8; 5]);
    }

    #[test]
    fn pcm_split_durations_sum_to_original() {
        let factory = factory();
        let mut head = pcm(&factory, 100);
        let total = head.jiffies();
        let jps = head.audio().jiffies_per_sample();

        // Ask for a split mid-sample: rounds down to a whole sample.
        let tail = head.split(10 * jps + jps / 2);
        assert_eq!(head.sample_count(), 10);
        assert_eq!(tail.sample_count(), 90);
        assert_eq!(head.jiffies() + tail.jiffies(), total);
        assert_eq!(tail.track_offset(), 10 * jps);
    }

    #[test]
    fn pcm_set_ramp_splits_tail_without_ramp() {
        let factory = factory();
        let mut msg = pcm(&factory, 100);
        let jps = msg.audio().jiffies_per_sample();

        let (current, tail) = msg.set_ramp(crate::ramp::MAX, 40 * jps, Direction::Down);
        assert_eq!(current, crate::ramp::MIN);
        let tail = tail.expect("tail split off");
        assert_eq!(msg.sample_count(), 40);
        assert_eq!(tail.sample_count(), 60);
        assert!(!tail.ramp().is_enabled());
        assert_eq!(msg.ramp().direction(), Direction::Down);
    }

    #[test]
    fn pcm_aggregation_appends_samples() {
        let factory = factory();
        let mut head = pcm(&factory, 10);
        let other = pcm(&factory, 5);
        assert!(head.try_aggregate(&other));
        assert_eq!(head.sample_count(), 15);

        // A shared backing cell refuses aggregation.
        let mut shared = pcm(&factory, 10);
        let _held = shared.shallow_clone();
        let more = pcm(&factory, 5);
        assert!(!shared.try_aggregate(&more));
    }

    #[test]
    fn silence_rounds_to_sample_boundary() {
        let factory = factory();
        let jps = jiffies::per_sample(48_000);
        let Msg::Silence(msg) = factory.silence(10 * jps + 3, 48_000, 24, 2) else {
            panic!("wrong variant");
        };
        assert_eq!(msg.jiffies(), 10 * jps);
        assert_eq!(msg.sample_count(), 10);
    }

    #[test]
    fn halt_ids_are_unique_and_monotonic() {
        let factory = factory();
        let Msg::Halt(a) = factory.halt() else {
            panic!("wrong variant");
        };
        let Msg::Halt(b) = factory.halt() else {
            panic!("wrong variant");
        };
        assert!(a.id() != HALT_ID_INVALID);
        assert!(b.id() > a.id());
    }

    #[test]
    fn queue_preserves_fifo_with_head_insertion() {
        let factory = factory();
        let queue = MsgQueue::new();
        queue.enqueue(factory.wait());
        queue.enqueue(factory.quit());
        queue.enqueue_at_head(factory.stream_interrupted());

        assert!(matches!(queue.dequeue(), Msg::StreamInterrupted(_)));
        assert!(matches!(queue.dequeue(), Msg::Wait(_)));
        assert!(matches!(queue.dequeue(), Msg::Quit(_)));
        assert!(queue.is_empty());
    }

    #[test]
    fn playable_reads_ramped_audio() {
        let factory = factory();
        let mut msg = pcm(&factory, 50);
        let duration = msg.jiffies();
        msg.set_ramp(crate::ramp::MIN, duration, Direction::None);

        let playable = factory.playable_from_pcm(&msg);
        let Msg::Playable(playable) = playable else {
            panic!("wrong variant");
        };
        assert_eq!(playable.len(), 50 * 2 * 2);
        assert_eq!(playable.jiffies(), duration);
    }

    #[test]
    fn factory_pools_account_in_flight_messages() {
        let factory = factory();
        let before: usize = factory.pool_stats().iter().map(|s| s.used).sum();
        let msg = factory.meta_text("hello");
        let during: usize = factory.pool_stats().iter().map(|s| s.used).sum();
        assert_eq!(during, before + 1);
        drop(msg);
        let after: usize = factory.pool_stats().iter().map(|s| s.used).sum();
        assert_eq!(after, before);
    }
}
