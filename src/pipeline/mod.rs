//! Pipeline assembly and control surface.
//!
//! Elements are created leaves-first in dependency order and chained into
//! a single directed flow (encoded → decoded → sink). This module owns the
//! chain, the id providers, the observer fan-out and the public control
//! surface (play / pause / stop / seek / next / prev / quit).
//!
//! The sink drives the pipeline by calling [`Pipeline::pull`] from its own
//! thread; decoded audio leaves as `Playable` messages with ramps already
//! folded in. Everything the product needs to know arrives through
//! [`PipelineObserver`] callbacks on the observer thread.

pub mod aggregator;
pub mod codec_controller;
pub mod decoded_reservoir;
pub mod encoded_reservoir;
pub mod filler;
pub mod pruner;
pub mod ramp_validator;
pub mod reservoir;
pub mod rewinder;
pub mod sample_rate_validator;
pub mod starvation_ramper;
pub mod stopper;

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Condvar, Mutex,
    },
    time::Duration,
};

use crate::{
    animator::Animator,
    codec::Codec,
    jiffies,
    msg::{Msg, MsgFactory, PoolConfig, StreamInfo, Track, TRACK_ID_NONE},
    observer::{ObserverThread, PipelineObserver, PipelineState},
    protocol::{Protocol, ProtocolManager, Supply},
    registry::{HandlerRegistry, StreamPlay},
};

use aggregator::DecodedAudioAggregator;
use codec_controller::CodecController;
use decoded_reservoir::{ClockPuller, DecodedReservoir};
use encoded_reservoir::EncodedReservoir;
use filler::{Filler, UriProvider};
use pruner::Pruner;
use ramp_validator::RampValidator;
use sample_rate_validator::SampleRateValidator;
use starvation_ramper::{StarvationObserver, StarvationRamper};
use stopper::{Stopper, StopperObserver, StreamPlayObserver};

/// An element that is pulled from by its downstream neighbour.
pub trait ElementUpstream: Send + Sync {
    /// Returns the next message, blocking until one is available.
    fn pull(&self) -> Msg;
}

/// An element that is pushed into by its upstream neighbour.
pub trait ElementDownstream: Send + Sync {
    /// Accepts a message, blocking while the element is over capacity.
    fn push(&self, msg: Msg);
}

/// Issues track and stream ids.
///
/// Ids are monotonically assigned small integers; zero is the invalid
/// sentinel everywhere, so issuing starts at one.
#[derive(Debug)]
pub struct IdProvider {
    next_track: AtomicU32,
    next_stream: AtomicU32,
}

impl Default for IdProvider {
    fn default() -> Self {
        Self {
            next_track: AtomicU32::new(1),
            next_stream: AtomicU32::new(1),
        }
    }
}

impl IdProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues the next track id.
    pub fn next_track_id(&self) -> u32 {
        self.next_track.fetch_add(1, Ordering::Relaxed)
    }

    /// Issues the next stream id.
    pub fn next_stream_id(&self) -> u32 {
        self.next_stream.fetch_add(1, Ordering::Relaxed)
    }
}

/// Issues flush ids for `try_stop`/`try_seek` responses.
#[derive(Debug)]
pub struct FlushIdProvider {
    next: AtomicU32,
}

impl Default for FlushIdProvider {
    fn default() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }
}

impl FlushIdProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues the next flush id.
    pub fn next_flush_id(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Everything the pipeline's construction is parameterised on.
///
/// The defaults give the production sizing; tests shrink the durations.
/// No environment variables are consulted.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Per-variant pool capacities.
    pub pools: PoolConfig,
    /// Encoded reservoir byte ceiling.
    pub encoded_reservoir_max_bytes: usize,
    /// Encoded reservoir concurrent-stream ceiling.
    pub encoded_reservoir_max_streams: usize,
    /// Decoded reservoir audio ceiling, in jiffies.
    pub decoded_reservoir_max_jiffies: u64,
    /// Decoded reservoir stream ceiling.
    pub decoded_reservoir_max_streams: usize,
    /// Decoded reservoir track ceiling.
    pub decoded_reservoir_max_tracks: usize,
    /// Consumed audio between clock-puller fill reports, in jiffies.
    pub clock_pull_sample_period: u64,
    /// Stopper pause/stop ramp duration, in jiffies.
    pub stopper_ramp_jiffies: u64,
    /// Starvation-ramper buffer ceiling, in jiffies.
    pub starvation_max_jiffies: u64,
    /// Starvation-ramper buffered-stream ceiling.
    pub starvation_max_streams: usize,
    /// Recent audio retained as flywheel training input, in jiffies.
    pub flywheel_training_jiffies: u64,
    /// Synthesised flywheel ramp-down duration, in jiffies.
    pub flywheel_rampdown_jiffies: u64,
    /// Post-starvation ramp-up duration, in jiffies.
    pub starvation_rampup_jiffies: u64,
    /// Decoded-audio aggregation byte ceiling.
    pub aggregator_max_bytes: usize,
    /// Decoded-audio aggregation jiffy ceiling.
    pub aggregator_max_jiffies: u64,
    /// Codec recognition window, in bytes.
    pub codec_recognise_bytes: usize,
    /// Wire the diagnostic ramp validator into the chain.
    pub ramp_validator: bool,
    /// Bounded wait for a prefetched stream's play-status answer.
    pub prefetch_timeout: Duration,
    /// Bounded wait for the stopped transition during shutdown.
    pub stop_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pools: PoolConfig::default(),
            encoded_reservoir_max_bytes: 1 << 20,
            encoded_reservoir_max_streams: 10,
            decoded_reservoir_max_jiffies: jiffies::from_ms(1000),
            decoded_reservoir_max_streams: 10,
            decoded_reservoir_max_tracks: 10,
            clock_pull_sample_period: jiffies::from_ms(100),
            stopper_ramp_jiffies: jiffies::from_ms(500),
            starvation_max_jiffies: jiffies::from_ms(100),
            starvation_max_streams: 10,
            flywheel_training_jiffies: jiffies::from_ms(20),
            flywheel_rampdown_jiffies: jiffies::from_ms(20),
            starvation_rampup_jiffies: jiffies::from_ms(100),
            aggregator_max_bytes: 16_384,
            aggregator_max_jiffies: jiffies::from_ms(5),
            codec_recognise_bytes: 6144,
            ramp_validator: false,
            prefetch_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// What the reporter queues for the observer thread.
enum Notification {
    State(PipelineState),
    Track(Track, String, u32),
    MetaText(String),
    Time(u64, u64),
    StreamInfo(StreamInfo),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ControlReport {
    Playing,
    Paused,
    Stopped,
}

struct ReporterState {
    control: ControlReport,
    buffering: bool,
    waiting: bool,
    last: Option<PipelineState>,
}

/// Serialises all observer traffic through the observer thread and folds
/// the stopper and starvation states into one ordered state stream.
struct Reporter {
    observer_thread: Arc<ObserverThread>,
    observers: Mutex<Vec<Arc<dyn PipelineObserver>>>,
    queue: Mutex<VecDeque<Notification>>,
    event: Mutex<Option<crate::observer::EventId>>,
    state: Mutex<ReporterState>,
    control_changed: Condvar,
}

impl Reporter {
    fn new(observer_thread: Arc<ObserverThread>) -> Arc<Self> {
        let reporter = Arc::new(Self {
            observer_thread: Arc::clone(&observer_thread),
            observers: Mutex::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
            event: Mutex::new(None),
            state: Mutex::new(ReporterState {
                control: ControlReport::Stopped,
                buffering: false,
                waiting: false,
                last: None,
            }),
            control_changed: Condvar::new(),
        });
        let dispatcher = Arc::clone(&reporter);
        let event = observer_thread.register(Box::new(move || dispatcher.dispatch()));
        *reporter.event.lock().unwrap() = Some(event);
        reporter
    }

    fn add_observer(&self, observer: Arc<dyn PipelineObserver>) {
        self.observers.lock().unwrap().push(observer);
    }

    fn post(&self, notification: Notification) {
        self.queue.lock().unwrap().push_back(notification);
        if let Some(event) = *self.event.lock().unwrap() {
            self.observer_thread.schedule(event);
        }
    }

    fn dispatch(&self) {
        loop {
            let Some(notification) = self.queue.lock().unwrap().pop_front() else {
                return;
            };
            let observers = self.observers.lock().unwrap().clone();
            for observer in &observers {
                match &notification {
                    Notification::State(state) => observer.notify_state(*state),
                    Notification::Track(track, mode, id) => {
                        observer.notify_track(track, mode, *id);
                    }
                    Notification::MetaText(text) => observer.notify_metatext(text),
                    Notification::Time(secs, duration) => observer.notify_time(*secs, *duration),
                    Notification::StreamInfo(info) => observer.notify_stream_info(info),
                }
            }
        }
    }

    /// Recomputes the combined state and posts it on change.
    fn update_state(&self) {
        let mut state = self.state.lock().unwrap();
        let combined = if state.waiting {
            PipelineState::Waiting
        } else {
            match (state.control, state.buffering) {
                (ControlReport::Playing, true) => PipelineState::Buffering,
                (ControlReport::Playing, false) => PipelineState::Playing,
                (ControlReport::Paused, _) => PipelineState::Paused,
                (ControlReport::Stopped, _) => PipelineState::Stopped,
            }
        };
        if state.last != Some(combined) {
            state.last = Some(combined);
            drop(state);
            self.post(Notification::State(combined));
        }
    }

    fn set_control(&self, control: ControlReport) {
        {
            let mut state = self.state.lock().unwrap();
            state.control = control;
            state.waiting = false;
        }
        self.control_changed.notify_all();
        self.update_state();
    }

    /// Whether the stopper has already reported stopped.
    fn is_stopped(&self) -> bool {
        self.state.lock().unwrap().control == ControlReport::Stopped
    }

    /// Waits, bounded, for the stopped transition.
    fn wait_stopped(&self, timeout: Duration) -> bool {
        let state = self.state.lock().unwrap();
        let (_state, result) = self
            .control_changed
            .wait_timeout_while(state, timeout, |state| {
                state.control != ControlReport::Stopped
            })
            .unwrap();
        !result.timed_out()
    }

    fn set_waiting(&self) {
        self.state.lock().unwrap().waiting = true;
        self.update_state();
    }

    fn clear_waiting(&self) {
        self.state.lock().unwrap().waiting = false;
        self.update_state();
    }
}

impl StopperObserver for Reporter {
    fn pipeline_playing(&self) {
        self.set_control(ControlReport::Playing);
    }

    fn pipeline_paused(&self) {
        self.set_control(ControlReport::Paused);
    }

    fn pipeline_stopped(&self) {
        self.set_control(ControlReport::Stopped);
    }
}

impl StarvationObserver for Reporter {
    fn notify_starvation_buffering(&self, buffering: bool) {
        self.state.lock().unwrap().buffering = buffering;
        self.update_state();
    }
}

/// Waits, bounded, for a prefetched track's play-status answer.
struct PrefetchObserver {
    expected: Mutex<Option<u32>>,
    answered: Condvar,
}

impl PrefetchObserver {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            expected: Mutex::new(None),
            answered: Condvar::new(),
        })
    }

    fn set_track(&self, track_id: u32) {
        *self.expected.lock().unwrap() = Some(track_id);
    }

    /// Returns whether the answer arrived before the timeout.
    fn wait(&self, timeout: Duration) -> bool {
        let expected = self.expected.lock().unwrap();
        let (mut expected, result) = self
            .answered
            .wait_timeout_while(expected, timeout, |expected| expected.is_some())
            .unwrap();
        if result.timed_out() {
            *expected = None;
            false
        } else {
            true
        }
    }

    fn check_track(&self, track_id: u32) {
        let mut expected = self.expected.lock().unwrap();
        if *expected == Some(track_id) {
            *expected = None;
            drop(expected);
            self.answered.notify_all();
        }
    }
}

impl StreamPlayObserver for PrefetchObserver {
    fn notify_track_failed(&self, track_id: u32) {
        self.check_track(track_id);
    }

    fn notify_stream_play_status(&self, track_id: u32, _stream_id: u32, _status: StreamPlay) {
        self.check_track(track_id);
    }
}

struct PullState {
    mode: String,
    track_duration: u64,
    last_reported_second: Option<u64>,
    stream_id: u32,
    stream_bit_rate: u32,
}

/// The assembled pipeline.
///
/// Construct, register codecs/protocols/providers/observers, `start()`,
/// then drive from the sink thread with [`pull`](Self::pull) until a Quit
/// message arrives.
pub struct Pipeline {
    factory: MsgFactory,
    config: PipelineConfig,
    filler: Arc<Filler>,
    codec_controller: Arc<CodecController>,
    encoded_reservoir: Arc<EncodedReservoir>,
    decoded_reservoir: Arc<DecodedReservoir>,
    stopper: Arc<Stopper>,
    starvation_ramper: Arc<StarvationRamper>,
    sink_head: Arc<dyn ElementUpstream>,
    observer_thread: Arc<ObserverThread>,
    reporter: Arc<Reporter>,
    prefetch: Arc<PrefetchObserver>,
    current_mode: Mutex<Option<String>>,
    pull_state: Mutex<PullState>,
}

impl Pipeline {
    /// Builds the element chain without a clock puller.
    #[must_use]
    pub fn new(config: PipelineConfig, animator: Arc<dyn Animator>) -> Arc<Self> {
        Self::with_clock_puller(config, animator, None)
    }

    /// Builds the element chain, in dependency order, leaves first.
    #[must_use]
    pub fn with_clock_puller(
        config: PipelineConfig,
        animator: Arc<dyn Animator>,
        clock_puller: Option<Arc<dyn ClockPuller>>,
    ) -> Arc<Self> {
        let factory = MsgFactory::new(&config.pools);
        let registry = Arc::new(HandlerRegistry::new());
        let ids = Arc::new(IdProvider::new());
        let flush_ids = Arc::new(FlushIdProvider::new());
        let observer_thread = ObserverThread::new();
        let reporter = Reporter::new(Arc::clone(&observer_thread));
        let prefetch = PrefetchObserver::new();

        // Encoded side.
        let encoded_reservoir = EncodedReservoir::new(
            factory.clone(),
            Arc::clone(&registry),
            Arc::clone(&flush_ids),
            config.encoded_reservoir_max_bytes,
            config.encoded_reservoir_max_streams,
        );
        let rewinder = rewinder::Rewinder::new(
            factory.clone(),
            Arc::clone(&encoded_reservoir) as Arc<dyn ElementUpstream>,
            Arc::clone(&registry),
        );

        // Decoded side, downstream first so the codec has somewhere to
        // push.
        let decoded_reservoir = DecodedReservoir::new(
            config.decoded_reservoir_max_jiffies,
            config.decoded_reservoir_max_streams,
            config.decoded_reservoir_max_tracks,
            config.clock_pull_sample_period,
            clock_puller,
        );
        let aggregator = DecodedAudioAggregator::new(
            Arc::clone(&decoded_reservoir) as Arc<dyn ElementDownstream>,
            factory.clone(),
            Arc::clone(&registry),
            config.aggregator_max_bytes,
            config.aggregator_max_jiffies,
        );
        let sample_rate_validator = SampleRateValidator::new(
            Arc::clone(&aggregator) as Arc<dyn ElementDownstream>,
            animator,
            Arc::clone(&registry),
        );
        let codec_controller = CodecController::new(
            factory.clone(),
            Arc::clone(&rewinder),
            Arc::clone(&sample_rate_validator) as Arc<dyn ElementDownstream>,
            Arc::clone(&registry),
            config.codec_recognise_bytes,
        );

        // Sink side.
        let stopper = Stopper::new(
            factory.clone(),
            Arc::clone(&decoded_reservoir) as Arc<dyn ElementUpstream>,
            Arc::clone(&registry),
            Arc::clone(&reporter) as Arc<dyn StopperObserver>,
            config.stopper_ramp_jiffies,
        );
        stopper
            .set_stream_play_observer(Arc::clone(&prefetch) as Arc<dyn StreamPlayObserver>);

        let ramper_upstream: Arc<dyn ElementUpstream> = if config.ramp_validator {
            RampValidator::new_pull("stopper", Arc::clone(&stopper) as Arc<dyn ElementUpstream>)
        } else {
            Arc::clone(&stopper) as Arc<dyn ElementUpstream>
        };
        let starvation_ramper = StarvationRamper::new(
            factory.clone(),
            ramper_upstream,
            Arc::clone(&registry),
            Arc::clone(&reporter) as Arc<dyn StarvationObserver>,
            Arc::clone(&observer_thread),
            config.starvation_max_jiffies,
            config.starvation_max_streams,
            config.flywheel_training_jiffies,
            config.flywheel_rampdown_jiffies,
            config.starvation_rampup_jiffies,
        );
        let pruner = Pruner::new(Arc::clone(&starvation_ramper) as Arc<dyn ElementUpstream>);
        let sink_head: Arc<dyn ElementUpstream> = if config.ramp_validator {
            RampValidator::new_pull("pipeline", pruner as Arc<dyn ElementUpstream>)
        } else {
            pruner as Arc<dyn ElementUpstream>
        };

        // The head of the chain: protocols feed the encoded reservoir.
        let protocol_manager = ProtocolManager::new(Supply {
            factory: factory.clone(),
            downstream: Arc::clone(&encoded_reservoir) as Arc<dyn ElementDownstream>,
            ids: Arc::clone(&ids),
            flush_ids: Arc::clone(&flush_ids),
            registry: Arc::clone(&registry),
        });
        let filler = Filler::new(
            factory.clone(),
            Arc::clone(&encoded_reservoir) as Arc<dyn ElementDownstream>,
            Arc::clone(&protocol_manager),
        );

        Arc::new(Self {
            factory,
            config,
            filler,
            codec_controller,
            encoded_reservoir,
            decoded_reservoir,
            stopper,
            starvation_ramper,
            sink_head,
            observer_thread,
            reporter,
            prefetch,
            current_mode: Mutex::new(None),
            pull_state: Mutex::new(PullState {
                mode: String::new(),
                track_duration: 0,
                last_reported_second: None,
                stream_id: crate::msg::STREAM_ID_INVALID,
                stream_bit_rate: 0,
            }),
        })
    }

    /// Registers a codec; recognition order is registration order.
    pub fn add_codec(&self, codec: Box<dyn Codec>) {
        self.codec_controller.add_codec(codec);
    }

    /// Registers a protocol module.
    pub fn add_protocol<P>(&self, protocol: Arc<P>)
    where
        P: Protocol + 'static,
    {
        self.filler.streamer().add(protocol);
    }

    /// Registers a URI provider for its mode.
    pub fn add_uri_provider(&self, provider: Box<dyn UriProvider>) {
        self.filler.add(provider);
    }

    /// Registers a pipeline observer.
    pub fn add_observer(&self, observer: Arc<dyn PipelineObserver>) {
        self.reporter.add_observer(observer);
    }

    /// Starts the pipeline threads.
    pub fn start(&self) {
        self.codec_controller.start();
        self.starvation_ramper.start();
        self.filler.start();
    }

    /// Begins playing `mode` from `track_id` ([`TRACK_ID_NONE`] for the
    /// provider's start).
    pub fn begin(&self, mode: &str, track_id: u32) {
        *self.current_mode.lock().unwrap() = Some(mode.to_string());
        self.filler.play(mode, track_id);
    }

    /// Resumes (or confirms) playback.
    pub fn play(&self) {
        self.stopper.play();
    }

    /// Pauses with a ramp.
    pub fn pause(&self) {
        self.stopper.begin_pause();
    }

    /// Stops with a ramp; the filler's halt completes the transition.
    pub fn stop(&self) {
        let halt_id = self.filler.stop();
        self.stopper.begin_stop(halt_id);
    }

    /// Advances to the next track of the current mode.
    pub fn next(&self) -> bool {
        let Some(mode) = self.current_mode.lock().unwrap().clone() else {
            return false;
        };
        let _ = self.filler.stop();
        self.filler.next(&mode);
        true
    }

    /// Steps back to the previous track of the current mode.
    pub fn prev(&self) -> bool {
        let Some(mode) = self.current_mode.lock().unwrap().clone() else {
            return false;
        };
        let _ = self.filler.stop();
        self.filler.prev(&mode);
        true
    }

    /// Attempts a byte seek in the identified stream.
    ///
    /// Routed through the codec controller's handler chain, so a target
    /// still buffered in the encoded reservoir is served without touching
    /// the protocol.
    pub fn try_seek(&self, stream_id: u32, byte_offset: u64) -> u32 {
        use crate::registry::StreamHandler;
        self.codec_controller.try_seek(stream_id, byte_offset)
    }

    /// Seeks to an absolute position in seconds within the stream now
    /// playing, translating via the stream's bitrate estimate.
    ///
    /// Returns whether a seek was issued.
    pub fn seek(&self, stream_id: u32, seconds: u64) -> bool {
        let (current_id, bit_rate) = {
            let state = self.pull_state.lock().unwrap();
            (state.stream_id, state.stream_bit_rate)
        };
        if current_id != stream_id || bit_rate == 0 {
            return false;
        }
        let byte_offset = seconds * u64::from(bit_rate) / 8;
        self.try_seek(stream_id, byte_offset) != crate::msg::FLUSH_ID_INVALID
    }

    /// Stops the current stream and leaves `track_id` prefetched, waiting
    /// up to the configured timeout for its play-status answer.
    pub fn stop_prefetch(&self, mode: &str, track_id: u32) {
        let _ = self.filler.stop();
        let expected = if track_id == TRACK_ID_NONE {
            self.filler.null_track_id()
        } else {
            track_id
        };
        self.prefetch.set_track(expected);
        *self.current_mode.lock().unwrap() = Some(mode.to_string());
        self.filler.play(mode, track_id);
        // Force pulling in case the pipeline is parked, so the prefetched
        // stream can reach the stopper.
        self.stopper.play();
        if !self.prefetch.wait(self.config.prefetch_timeout) {
            // A protocol may block without delivering; stay responsive.
            warn!("timeout waiting for prefetch of track {track_id} in mode {mode}");
        }
    }

    /// Pulls the next sink-bound message.
    ///
    /// Decoded audio is converted to its terminal `Playable` form here;
    /// observers are fed from the same stream of messages.
    pub fn pull(&self) -> Msg {
        let msg = self.sink_head.pull();
        match msg {
            Msg::Mode(mode) => {
                self.pull_state.lock().unwrap().mode = mode.mode().to_string();
                Msg::Mode(mode)
            }
            Msg::Track(track) => {
                let mode = self.pull_state.lock().unwrap().mode.clone();
                self.reporter.post(Notification::Track(
                    track.track().clone(),
                    mode,
                    track.track().id(),
                ));
                Msg::Track(track)
            }
            Msg::MetaText(text) => {
                self.reporter
                    .post(Notification::MetaText(text.text().to_string()));
                Msg::MetaText(text)
            }
            Msg::DecodedStream(stream) => {
                {
                    let mut state = self.pull_state.lock().unwrap();
                    state.track_duration = jiffies::to_secs(stream.info().track_length);
                    state.last_reported_second = None;
                    state.stream_id = stream.info().stream_id;
                    state.stream_bit_rate = stream.info().bit_rate;
                }
                self.reporter
                    .post(Notification::StreamInfo(stream.info().clone()));
                self.reporter.clear_waiting();
                Msg::DecodedStream(stream)
            }
            Msg::Wait(wait) => {
                self.reporter.set_waiting();
                Msg::Wait(wait)
            }
            Msg::AudioPcm(audio) => {
                self.report_time(audio.track_offset() + audio.jiffies());
                self.factory.playable_from_pcm(&audio)
            }
            Msg::Silence(silence) => self.factory.playable_from_silence(&silence),
            Msg::Drain(mut drain) => {
                // Everything queued ahead of this marker has left the
                // pipeline; honour the hook.
                drain.complete();
                Msg::Drain(drain)
            }
            msg => msg,
        }
    }

    fn report_time(&self, played_jiffies: u64) {
        let mut state = self.pull_state.lock().unwrap();
        let second = jiffies::to_secs(played_jiffies);
        if state.last_reported_second != Some(second) {
            state.last_reported_second = Some(second);
            let duration = state.track_duration;
            drop(state);
            self.reporter.post(Notification::Time(second, duration));
        }
    }

    /// Telemetry for every message pool.
    #[must_use]
    pub fn pool_stats(&self) -> Vec<crate::msg::pool::PoolStats> {
        self.factory.pool_stats()
    }

    /// Buffered fill levels (encoded bytes, decoded jiffies, sink-side
    /// jiffies).
    #[must_use]
    pub fn fill_levels(&self) -> (usize, u64, u64) {
        (
            self.encoded_reservoir.buffered_bytes(),
            self.decoded_reservoir.buffered_jiffies(),
            self.starvation_ramper.buffered_jiffies(),
        )
    }

    /// Shuts the pipeline down.
    ///
    /// A ramped stop runs first so the sink never hears a cut; the wait
    /// for it is bounded so a wedged stream cannot hang shutdown. The
    /// caller must keep pulling until the Quit message emerges, then call
    /// [`join`](Self::join).
    pub fn quit(&self) {
        let halt_id = self.filler.stop();
        if !self.reporter.is_stopped() {
            self.stopper.begin_stop(halt_id);
            if !self.reporter.wait_stopped(self.config.stop_timeout) {
                warn!("pipeline did not stop cleanly; quitting anyway");
            }
        }
        self.stopper.quit();
        self.filler.quit();
    }

    /// Joins the pipeline threads after a Quit has drained through.
    pub fn join(&self) {
        self.codec_controller.join();
        self.starvation_ramper.join();
        self.observer_thread.quit();
    }
}
