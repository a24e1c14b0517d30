//! Codec selection and the cooperative decode loop.
//!
//! The controller runs its own thread: it pulls encoded messages from the
//! rewinder until it holds a recognition window, offers the window to each
//! registered codec in order, and hands the stream to the first codec that
//! claims it. The codec then drives decoding through [`CodecStream`]:
//! `read` pulls encoded bytes (suspending until available) and the
//! `output_*` methods emit decoded messages downstream.
//!
//! Streaming control flow is explicit: boundary messages observed during a
//! pull surface as [`CodecSignal`] values from `read`, abort the current
//! codec run, and are handled by the outer loop (select a new codec, end
//! the stream, or shut down).
//!
//! A codec that fails before producing any output is treated as a wrong
//! recognition: the rewinder replays the stream from its boundary and the
//! next codec in order gets a try.

use std::{
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
};

use crate::{
    codec::{Codec, CodecResult, CodecSignal, DecodedStreamParams},
    jiffies,
    msg::{
        audio::Endian, pool::Pooled, unexpected, Msg, MsgAudioEncoded, MsgFactory, StreamInfo,
        FLUSH_ID_INVALID, STREAM_ID_INVALID,
    },
    pipeline::{rewinder::Rewinder, ElementDownstream, ElementUpstream},
    registry::{HandlerHandle, HandlerRegistry, StreamHandler, StreamPlay},
};

#[derive(Clone, Copy, Default)]
struct CurrentStream {
    stream_id: u32,
    total_bytes: u64,
    seekable: bool,
    live: bool,
}

#[derive(Clone, Copy, Default)]
struct ControlState {
    handler: Option<HandlerHandle>,
    stream_id: u32,
}

struct StreamIo {
    factory: MsgFactory,
    upstream: Arc<Rewinder>,
    downstream: Arc<dyn ElementDownstream>,
    control: Arc<Mutex<ControlState>>,
    controller_handle: Option<HandlerHandle>,
    pending: Option<Pooled<MsgAudioEncoded>>,
    stream: CurrentStream,
    stream_ended: bool,
    quit: bool,
    /// Rewinder history is being retained for the current stream.
    buffering_active: bool,
    /// Whether a replayed stream boundary should be absorbed quietly.
    retrying: bool,
    /// Messages emitted downstream for the current stream.
    outputs: u64,
    /// Flush id of the most recent flush passed through.
    last_flush_id: u32,
    /// Track offset of the next decoded sample, in jiffies.
    track_offset: u64,
}

impl StreamIo {
    fn append_pending(&mut self, audio: Pooled<MsgAudioEncoded>) {
        match &mut self.pending {
            Some(pending) => pending.add(audio),
            None => self.pending = Some(audio),
        }
    }

    fn pending_len(&self) -> usize {
        self.pending.as_ref().map_or(0, |pending| pending.len())
    }

    /// Pulls and processes one message; returns the signal it raises.
    fn pull_one(&mut self) -> Option<CodecSignal> {
        let msg = self.upstream.pull();
        match msg {
            Msg::AudioEncoded(audio) => {
                if self.stream.stream_id == STREAM_ID_INVALID {
                    // Audio with no active stream: a rejected or abandoned
                    // stream's leftovers.
                    drop(audio);
                } else {
                    self.append_pending(audio);
                }
                None
            }
            Msg::EncodedStream(stream) => {
                if self.retrying && stream.stream_id == self.stream.stream_id {
                    // The rewinder is replaying the boundary we already
                    // forwarded; absorb it and keep accumulating.
                    self.retrying = false;
                    self.pending = None;
                    return None;
                }
                self.pending = None;
                self.stream = CurrentStream {
                    stream_id: stream.stream_id,
                    total_bytes: stream.total_bytes,
                    seekable: stream.seekable,
                    live: stream.live,
                };
                self.stream_ended = false;
                self.buffering_active = true;
                self.retrying = false;
                self.outputs = 0;
                self.track_offset = 0;
                *self.control.lock().unwrap() = ControlState {
                    handler: stream.handler,
                    stream_id: stream.stream_id,
                };
                self.downstream.push(Msg::EncodedStream(stream));
                Some(CodecSignal::StreamStart)
            }
            Msg::Halt(halt) => {
                self.stream_ended = true;
                self.downstream.push(Msg::Halt(halt));
                None
            }
            Msg::StreamInterrupted(msg) => {
                self.stream_ended = true;
                self.downstream.push(Msg::StreamInterrupted(msg));
                None
            }
            Msg::Flush(flush) => {
                self.last_flush_id = flush.id();
                self.downstream.push(Msg::Flush(flush));
                Some(CodecSignal::StreamFlush)
            }
            Msg::Quit(quit) => {
                self.quit = true;
                self.downstream.push(Msg::Quit(quit));
                Some(CodecSignal::StreamEnded)
            }
            msg @ (Msg::Mode(_)
            | Msg::Track(_)
            | Msg::Drain(_)
            | Msg::Delay(_)
            | Msg::MetaText(_)
            | Msg::Wait(_)) => {
                self.downstream.push(msg);
                None
            }
            msg => unexpected("CodecController", &msg),
        }
    }

    fn finish_stream(&mut self) {
        if self.buffering_active {
            self.upstream.stop();
            self.buffering_active = false;
        }
        self.pending = None;
        self.stream = CurrentStream::default();
    }
}

/// The cooperative interface a codec decodes through.
///
/// Cloneable; clones share the same stream state (used to adapt external
/// decoder libraries that want an owned reader).
#[derive(Clone)]
pub struct CodecStream {
    io: Arc<Mutex<StreamIo>>,
}

impl CodecStream {
    /// Pulls up to `buf.len()` encoded bytes, suspending until available.
    ///
    /// Returns the byte count filled; fewer than requested (possibly zero)
    /// only at end of stream. Boundary messages abort the read with a
    /// signal.
    pub fn read(&self, buf: &mut [u8]) -> CodecResult<usize> {
        let mut io = self.io.lock().unwrap();
        let mut filled = 0;
        loop {
            if io.pending.is_some() {
                let pending = io.pending.as_mut().expect("checked above");
                let n = pending.copy_to(0, &mut buf[filled..]);
                pending.discard_front(n);
                let drained = pending.is_empty();
                filled += n;
                if drained {
                    io.pending = None;
                }
            }
            if filled == buf.len() || io.stream_ended {
                return Ok(filled);
            }
            if let Some(signal) = io.pull_one() {
                return Err(signal);
            }
        }
    }

    /// Id of the stream being decoded.
    #[must_use]
    pub fn stream_id(&self) -> u32 {
        self.io.lock().unwrap().stream.stream_id
    }

    /// Total encoded length when the protocol knows it, zero otherwise.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.io.lock().unwrap().stream.total_bytes
    }

    /// Whether the source supports byte seeks.
    #[must_use]
    pub fn seekable(&self) -> bool {
        self.io.lock().unwrap().stream.seekable
    }

    /// Whether the source is live.
    #[must_use]
    pub fn live(&self) -> bool {
        self.io.lock().unwrap().stream.live
    }

    /// Emits the decoded-stream boundary for the current stream.
    ///
    /// Must precede any PCM output. The first output also releases the
    /// rewinder history: the codec has committed to the stream.
    pub fn output_decoded_stream(&self, params: DecodedStreamParams) {
        let mut io = self.io.lock().unwrap();
        let info = StreamInfo {
            stream_id: io.stream.stream_id,
            bit_rate: params.bit_rate,
            bit_depth: params.bit_depth,
            sample_rate: params.sample_rate,
            channels: params.channels,
            codec_name: params.codec_name.clone(),
            track_length: params.track_length,
            sample_start: params.sample_start,
            lossless: params.lossless,
            seekable: io.stream.seekable,
            live: io.stream.live,
            handler: io.controller_handle,
        };
        // A decodable stream may still carry a rate outside the jiffy
        // table; it is announced (so the validator can reject it) but
        // kept out of all jiffy arithmetic.
        io.track_offset = if jiffies::is_supported(params.sample_rate) {
            params.sample_start * jiffies::per_sample(params.sample_rate)
        } else {
            0
        };
        if io.buffering_active {
            io.upstream.stop();
            io.buffering_active = false;
        }
        io.outputs += 1;
        let msg = io.factory.decoded_stream(info);
        io.downstream.push(msg);
    }

    /// Emits a run of decoded samples.
    pub fn output_audio(
        &self,
        data: &[u8],
        channels: u32,
        sample_rate: u32,
        bit_depth: u32,
        endian: Endian,
    ) {
        let mut io = self.io.lock().unwrap();
        let msg = io.factory.audio_pcm(
            data,
            channels,
            sample_rate,
            bit_depth,
            endian,
            io.track_offset,
        );
        io.track_offset += msg.jiffies();
        io.outputs += 1;
        io.downstream.push(msg);
    }

    /// Emits a bitrate estimate.
    pub fn output_bit_rate(&self, bits_per_second: u32) {
        let mut io = self.io.lock().unwrap();
        io.outputs += 1;
        let msg = io.factory.bit_rate(bits_per_second);
        io.downstream.push(msg);
    }

    fn quit(&self) -> bool {
        self.io.lock().unwrap().quit
    }

    /// Pulls until a stream boundary starts; false when quitting instead.
    fn wait_stream_start(&self) -> bool {
        let mut io = self.io.lock().unwrap();
        loop {
            if io.quit {
                return false;
            }
            match io.pull_one() {
                Some(CodecSignal::StreamStart) => return true,
                Some(CodecSignal::StreamEnded) if io.quit => return false,
                _ => {}
            }
        }
    }

    /// Accumulates pending bytes up to `bytes`; returns the window size
    /// actually available (smaller only at end of stream).
    fn fill_window(&self, bytes: usize) -> CodecResult<usize> {
        let mut io = self.io.lock().unwrap();
        loop {
            let have = io.pending_len();
            if have >= bytes || io.stream_ended {
                return Ok(have.min(bytes));
            }
            if let Some(signal) = io.pull_one() {
                return Err(signal);
            }
        }
    }

    /// Copies the recognition window into `buf`, returning the filled
    /// prefix.
    fn copy_window<'a>(&self, buf: &'a mut [u8]) -> &'a [u8] {
        let io = self.io.lock().unwrap();
        let n = io
            .pending
            .as_ref()
            .map_or(0, |pending| pending.copy_to(0, buf));
        &buf[..n]
    }

    fn clear_pending(&self) {
        self.io.lock().unwrap().pending = None;
    }

    fn finish_stream(&self) {
        self.io.lock().unwrap().finish_stream();
    }

    fn can_retry(&self) -> bool {
        let io = self.io.lock().unwrap();
        io.buffering_active && io.outputs == 0
    }

    fn rewind_for_retry(&self) {
        let mut io = self.io.lock().unwrap();
        io.pending = None;
        io.retrying = true;
        io.upstream.rewind();
    }

    fn last_flush_id(&self) -> u32 {
        self.io.lock().unwrap().last_flush_id
    }
}

/// The codec-controller element.
pub struct CodecController {
    factory: MsgFactory,
    rewinder: Arc<Rewinder>,
    downstream: Arc<dyn ElementDownstream>,
    registry: Arc<HandlerRegistry>,
    recognise_bytes: usize,
    codecs: Mutex<Vec<Box<dyn Codec>>>,
    control: Arc<Mutex<ControlState>>,
    handle: Mutex<Option<HandlerHandle>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CodecController {
    /// Creates the controller and registers it as a stream handler.
    pub fn new(
        factory: MsgFactory,
        rewinder: Arc<Rewinder>,
        downstream: Arc<dyn ElementDownstream>,
        registry: Arc<HandlerRegistry>,
        recognise_bytes: usize,
    ) -> Arc<Self> {
        let controller = Arc::new(Self {
            factory,
            rewinder,
            downstream,
            registry: Arc::clone(&registry),
            recognise_bytes,
            codecs: Mutex::new(Vec::new()),
            control: Arc::new(Mutex::new(ControlState::default())),
            handle: Mutex::new(None),
            thread: Mutex::new(None),
        });
        let handler: Arc<dyn StreamHandler> = Arc::clone(&controller) as Arc<dyn StreamHandler>;
        *controller.handle.lock().unwrap() = Some(registry.register(&handler));
        controller
    }

    /// Registers a codec; recognition order is registration order.
    pub fn add_codec(&self, codec: Box<dyn Codec>) {
        self.codecs.lock().unwrap().push(codec);
    }

    /// Starts the decoder thread.
    pub fn start(&self) {
        let mut codecs = std::mem::take(&mut *self.codecs.lock().unwrap());
        let stream = CodecStream {
            io: Arc::new(Mutex::new(StreamIo {
                factory: self.factory.clone(),
                upstream: Arc::clone(&self.rewinder),
                downstream: Arc::clone(&self.downstream),
                control: Arc::clone(&self.control),
                controller_handle: *self.handle.lock().unwrap(),
                pending: None,
                stream: CurrentStream::default(),
                stream_ended: false,
                quit: false,
                buffering_active: false,
                retrying: false,
                outputs: 0,
                last_flush_id: FLUSH_ID_INVALID,
                track_offset: 0,
            })),
        };
        let recognise_bytes = self.recognise_bytes;
        let registry = Arc::clone(&self.registry);
        let control = Arc::clone(&self.control);

        let thread = thread::Builder::new()
            .name("codec-controller".to_string())
            .spawn(move || {
                Self::run(&stream, &mut codecs, recognise_bytes, &registry, &control);
            })
            .expect("spawn codec thread");
        *self.thread.lock().unwrap() = Some(thread);
    }

    /// Waits for the decoder thread to exit (after a Quit has drained).
    pub fn join(&self) {
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }

    fn run(
        stream: &CodecStream,
        codecs: &mut [Box<dyn Codec>],
        recognise_bytes: usize,
        registry: &HandlerRegistry,
        control: &Mutex<ControlState>,
    ) {
        let mut window_buf = vec![0u8; recognise_bytes];
        'streams: loop {
            if stream.quit() {
                break;
            }
            if !stream.wait_stream_start() {
                break;
            }

            let mut tried = vec![false; codecs.len()];
            loop {
                let window_len = match stream.fill_window(recognise_bytes) {
                    Ok(0) => {
                        stream.finish_stream();
                        continue 'streams;
                    }
                    Ok(len) => len,
                    Err(CodecSignal::StreamStart) => {
                        tried.fill(false);
                        continue;
                    }
                    Err(CodecSignal::StreamFlush) => {
                        stream.clear_pending();
                        continue;
                    }
                    Err(CodecSignal::StreamEnded | CodecSignal::StreamCorrupt) => {
                        if stream.quit() {
                            break 'streams;
                        }
                        stream.finish_stream();
                        continue 'streams;
                    }
                };
                let window = stream.copy_window(&mut window_buf[..window_len]);

                let mut selected = None;
                for (index, codec) in codecs.iter_mut().enumerate() {
                    if !tried[index] && codec.recognise(window) {
                        selected = Some(index);
                        break;
                    }
                }
                let Some(index) = selected else {
                    warn!("no codec recognised stream; stopping it");
                    Self::reject_stream(stream, registry, control);
                    continue 'streams;
                };
                tried[index] = true;

                let codec = &mut codecs[index];
                debug!("codec {} claimed stream {}", codec.id(), stream.stream_id());
                let result = codec.process(stream);
                codec.stream_completed();

                match result {
                    Ok(()) => {
                        stream.finish_stream();
                        continue 'streams;
                    }
                    Err(CodecSignal::StreamStart) => {
                        // A new stream boundary aborted the run; recognise
                        // it from scratch.
                        tried.fill(false);
                    }
                    Err(CodecSignal::StreamFlush) => {
                        stream.clear_pending();
                        tried.fill(false);
                    }
                    Err(CodecSignal::StreamEnded) => {
                        if stream.quit() {
                            break 'streams;
                        }
                        stream.finish_stream();
                        continue 'streams;
                    }
                    Err(CodecSignal::StreamCorrupt) => {
                        if stream.can_retry() {
                            debug!("codec {} declined mid-stream; replaying", codecs[index].id());
                            stream.rewind_for_retry();
                        } else {
                            warn!("stream corrupt after output; abandoning");
                            stream.finish_stream();
                            continue 'streams;
                        }
                    }
                }
            }
        }
        debug!("codec controller exiting");
    }

    fn reject_stream(stream: &CodecStream, registry: &HandlerRegistry, control: &Mutex<ControlState>) {
        let state = *control.lock().unwrap();
        let flush_id = state
            .handler
            .and_then(|handle| registry.resolve(handle))
            .map_or(FLUSH_ID_INVALID, |handler| {
                handler.try_stop(state.stream_id)
            });
        stream.finish_stream();
        if flush_id == FLUSH_ID_INVALID {
            return;
        }
        // Drain until the flush marking the discard point has passed
        // through (it is forwarded downstream where the stopper consumes
        // it).
        loop {
            let signal = {
                let mut io = stream.io.lock().unwrap();
                if io.quit {
                    return;
                }
                io.pull_one()
            };
            match signal {
                Some(CodecSignal::StreamFlush) if stream.last_flush_id() == flush_id => return,
                Some(CodecSignal::StreamStart | CodecSignal::StreamEnded) => return,
                _ => {}
            }
        }
    }
}

impl StreamHandler for CodecController {
    fn ok_to_play(&self, stream_id: u32) -> StreamPlay {
        let state = *self.control.lock().unwrap();
        match state.handler.and_then(|handle| self.registry.resolve(handle)) {
            Some(handler) => handler.ok_to_play(stream_id),
            None => {
                warn!("codec controller: no handler for ok_to_play({stream_id})");
                StreamPlay::No
            }
        }
    }

    fn try_seek(&self, stream_id: u32, offset: u64) -> u32 {
        let state = *self.control.lock().unwrap();
        state
            .handler
            .and_then(|handle| self.registry.resolve(handle))
            .map_or(FLUSH_ID_INVALID, |handler| {
                handler.try_seek(stream_id, offset)
            })
    }

    fn try_stop(&self, stream_id: u32) -> u32 {
        let state = *self.control.lock().unwrap();
        state
            .handler
            .and_then(|handle| self.registry.resolve(handle))
            .map_or(FLUSH_ID_INVALID, |handler| handler.try_stop(stream_id))
    }

    fn notify_starving(&self, mode: &str, stream_id: u32, starving: bool) {
        let state = *self.control.lock().unwrap();
        if let Some(handler) = state.handler.and_then(|handle| self.registry.resolve(handle)) {
            handler.notify_starving(mode, stream_id, starving);
        }
    }
}
