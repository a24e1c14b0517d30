//! The authoritative play/pause/stop state machine.
//!
//! The stopper sits between the decoded reservoir and the starvation
//! ramper. Play, pause and stop are enacted as linear ramps: a pause ramps
//! down over the configured duration, emits a halt and parks; a stop does
//! the same but records the halt id it is waiting for and flushes the
//! stream once the ramp ends. Reversing mid-ramp keeps the current gain
//! and ramps the other way over the time already spent.
//!
//! Playing a new stream is gated on `ok_to_play`: live streams ask at
//! their `EncodedStream` boundary, others wait for the `DecodedStream` so
//! metadata can reach observers before the pipeline risks stalling on a
//! `Later` answer.

use std::sync::{Arc, Condvar, Mutex};

use crate::{
    msg::{unexpected, Msg, MsgFactory, MsgQueue, HALT_ID_INVALID, STREAM_ID_INVALID},
    pipeline::ElementUpstream,
    ramp::{self, Direction},
    registry::{HandlerHandle, HandlerRegistry, StreamHandler, StreamPlay},
};

/// Internal pipeline-state reporting interface.
///
/// Calls arrive with the stopper lock held and must not block or re-enter
/// the pipeline; the pipeline's implementation only schedules an
/// observer-thread event.
pub trait StopperObserver: Send + Sync {
    fn pipeline_playing(&self);
    fn pipeline_paused(&self);
    fn pipeline_stopped(&self);
}

/// Prefetch bookkeeping interface: reports the play-status answer (or
/// failure to get one) for every stream.
pub trait StreamPlayObserver: Send + Sync {
    fn notify_track_failed(&self, track_id: u32);
    fn notify_stream_play_status(&self, track_id: u32, stream_id: u32, status: StreamPlay);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Running,
    RampingDown,
    RampingUp,
    Paused,
    Stopped,
    Flushing,
}

struct Inner {
    state: State,
    remaining_ramp: u64,
    current_ramp: u32,
    target_halt_id: u32,
    track_id: u32,
    stream_id: u32,
    stream_handler: Option<HandlerHandle>,
    checked_stream_playable: bool,
    halt_pending: bool,
    flush_stream: bool,
    buffering: bool,
    quit: bool,
    /// One-shot wakeup for a parked pull (the semaphore of the original
    /// design).
    wake_pending: bool,
}

impl Inner {
    fn new_stream(&mut self) {
        self.remaining_ramp = 0;
        self.current_ramp = ramp::MAX;
        self.state = State::Running;
        self.stream_handler = None;
        self.checked_stream_playable = false;
        self.halt_pending = false;
        self.flush_stream = false;
    }
}

/// The stopper element.
pub struct Stopper {
    factory: MsgFactory,
    upstream: Arc<dyn ElementUpstream>,
    registry: Arc<HandlerRegistry>,
    observer: Arc<dyn StopperObserver>,
    play_observer: Mutex<Option<Arc<dyn StreamPlayObserver>>>,
    ramp_duration: u64,
    inner: Mutex<Inner>,
    wakeup: Condvar,
    /// Split remainders waiting to be pulled ahead of upstream.
    queue: MsgQueue,
    handle: Mutex<Option<HandlerHandle>>,
}

impl Stopper {
    pub fn new(
        factory: MsgFactory,
        upstream: Arc<dyn ElementUpstream>,
        registry: Arc<HandlerRegistry>,
        observer: Arc<dyn StopperObserver>,
        ramp_duration: u64,
    ) -> Arc<Self> {
        let stopper = Arc::new(Self {
            factory,
            upstream,
            registry: Arc::clone(&registry),
            observer,
            play_observer: Mutex::new(None),
            ramp_duration,
            inner: Mutex::new(Inner {
                // A fresh pipeline pulls freely; the filler decides when
                // data starts flowing.
                state: State::Running,
                remaining_ramp: 0,
                current_ramp: ramp::MAX,
                target_halt_id: HALT_ID_INVALID,
                track_id: 0,
                stream_id: STREAM_ID_INVALID,
                stream_handler: None,
                // The first track must not trigger an ok-to-play check.
                checked_stream_playable: true,
                halt_pending: false,
                flush_stream: false,
                buffering: false,
                quit: false,
                wake_pending: false,
            }),
            wakeup: Condvar::new(),
            queue: MsgQueue::new(),
            handle: Mutex::new(None),
        });
        let handler: Arc<dyn StreamHandler> = Arc::clone(&stopper) as Arc<dyn StreamHandler>;
        *stopper.handle.lock().unwrap() = Some(registry.register(&handler));
        stopper
    }

    /// Wires the prefetch observer.
    pub fn set_stream_play_observer(&self, observer: Arc<dyn StreamPlayObserver>) {
        *self.play_observer.lock().unwrap() = Some(observer);
    }

    /// Starts (or resumes) playback.
    pub fn play(&self) {
        let mut inner = self.inner.lock().unwrap();
        debug!("Stopper::play, state={:?}", inner.state);
        match inner.state {
            State::Running | State::RampingUp | State::Flushing => {}
            State::RampingDown => {
                // Reverse in place: ramp up from the current value over the
                // time already spent ramping down.
                inner.state = State::RampingUp;
                inner.remaining_ramp = self.ramp_duration - inner.remaining_ramp;
            }
            State::Paused => {
                inner.state = State::RampingUp;
                inner.remaining_ramp = self.ramp_duration;
                inner.wake_pending = true;
                self.wakeup.notify_one();
            }
            State::Stopped => {
                inner.state = State::Running;
                inner.wake_pending = true;
                self.wakeup.notify_one();
            }
        }
        inner.target_halt_id = HALT_ID_INVALID;
        if !inner.quit {
            self.observer.pipeline_playing();
        }
    }

    /// Begins a ramped pause.
    pub fn begin_pause(&self) {
        let mut inner = self.inner.lock().unwrap();
        debug!("Stopper::begin_pause, state={:?}", inner.state);
        if inner.quit {
            return;
        }
        if inner.buffering {
            // No audio is flowing; there is nothing to ramp.
            self.handle_paused(&mut inner);
            return;
        }
        match inner.state {
            State::Running => {
                inner.remaining_ramp = self.ramp_duration;
                inner.current_ramp = ramp::MAX;
                inner.state = State::RampingDown;
            }
            State::RampingDown | State::Paused | State::Stopped => {}
            State::RampingUp => {
                inner.remaining_ramp = self.ramp_duration - inner.remaining_ramp;
                inner.state = State::RampingDown;
            }
            State::Flushing => self.handle_stopped(&mut inner),
        }
    }

    /// Begins a ramped stop; [`MsgHalt`](crate::msg::MsgHalt) with
    /// `halt_id` completes it.
    pub fn begin_stop(&self, halt_id: u32) {
        let mut inner = self.inner.lock().unwrap();
        debug!("Stopper::begin_stop({halt_id}), state={:?}", inner.state);
        if inner.quit {
            return;
        }
        inner.target_halt_id = halt_id;
        if inner.buffering {
            self.handle_stopped(&mut inner);
            return;
        }
        match inner.state {
            State::Running => {
                inner.remaining_ramp = self.ramp_duration;
                inner.current_ramp = ramp::MAX;
                inner.state = State::RampingDown;
            }
            State::RampingDown | State::Stopped => {}
            State::RampingUp => {
                inner.remaining_ramp = self.ramp_duration - inner.remaining_ramp;
                inner.state = State::RampingDown;
            }
            State::Paused => {
                // Restart pulling, discarding data until the target halt
                // or a new stream arrives.
                inner.flush_stream = true;
                inner.wake_pending = true;
                self.wakeup.notify_one();
            }
            State::Flushing => self.handle_stopped(&mut inner),
        }
    }

    /// Stops immediately, without ramping.
    pub fn stop_now(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.handle_stopped(&mut inner);
    }

    /// Unblocks everything for shutdown; a Quit message follows through
    /// the chain.
    pub fn quit(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.quit = true;
            if inner.state == State::Stopped || inner.state == State::Paused {
                inner.flush_stream = true;
            }
        }
        self.play();
    }

    fn handle_paused(&self, inner: &mut Inner) {
        self.set_state(inner, State::Paused);
        inner.wake_pending = false;
        self.observer.pipeline_paused();
    }

    fn handle_stopped(&self, inner: &mut Inner) {
        self.set_state(inner, State::Stopped);
        inner.wake_pending = false;
        self.observer.pipeline_stopped();
    }

    fn set_state(&self, inner: &mut Inner, state: State) {
        trace!(
            "Stopper state {:?} -> {state:?} (remaining={}, ramp={:#010x})",
            inner.state,
            inner.remaining_ramp,
            inner.current_ramp
        );
        inner.state = state;
    }

    fn resolve(&self, handle: Option<HandlerHandle>) -> Option<Arc<dyn StreamHandler>> {
        let handler = handle.and_then(|handle| self.registry.resolve(handle));
        if handler.is_none() && handle.is_some() {
            warn!("stopper: stream handler is stale");
        }
        handler
    }

    /// Asks the current stream's handler whether it may play and applies
    /// the answer. The stopper lock is not held across the callout.
    fn check_ok_to_play(&self) {
        let (handle, stream_id, track_id) = {
            let inner = self.inner.lock().unwrap();
            (inner.stream_handler, inner.stream_id, inner.track_id)
        };
        let Some(handler) = self.resolve(handle) else {
            let mut inner = self.inner.lock().unwrap();
            inner.checked_stream_playable = true;
            return;
        };
        let can_play = handler.ok_to_play(stream_id);
        debug!("ok_to_play({stream_id}) -> {can_play:?}, track {track_id}");

        let stop_stream = {
            let mut inner = self.inner.lock().unwrap();
            inner.checked_stream_playable = true;
            if inner.quit {
                self.set_state(&mut inner, State::Flushing);
                inner.flush_stream = true;
                false
            } else {
                match can_play {
                    StreamPlay::Yes => {
                        self.observer.pipeline_playing();
                        false
                    }
                    StreamPlay::No => {
                        self.set_state(&mut inner, State::Flushing);
                        inner.flush_stream = true;
                        inner.halt_pending = true;
                        true
                    }
                    StreamPlay::Later => {
                        self.handle_stopped(&mut inner);
                        inner.halt_pending = true;
                        false
                    }
                }
            }
        };
        if stop_stream {
            let _ = handler.try_stop(stream_id);
        }
        if let Some(observer) = self.play_observer.lock().unwrap().clone() {
            observer.notify_stream_play_status(track_id, stream_id, can_play);
        }
    }

    fn ramp_completed(&self, inner: &mut Inner) -> Option<(HandlerHandle, u32)> {
        if inner.state == State::RampingDown {
            inner.halt_pending = true;
            if inner.target_halt_id == HALT_ID_INVALID {
                self.handle_paused(inner);
                None
            } else {
                // The stream is stopped for real; discard until the
                // matching halt arrives.
                self.set_state(inner, State::Flushing);
                inner.flush_stream = true;
                inner.stream_handler.map(|handle| (handle, inner.stream_id))
            }
        } else {
            self.set_state(inner, State::Running);
            None
        }
    }

    fn process_flushable(inner: &Inner, msg: Msg) -> Option<Msg> {
        if inner.flush_stream {
            trace!("stopper discarding {}", msg.kind());
            None
        } else {
            Some(msg)
        }
    }

    fn process(&self, msg: Msg) -> Option<Msg> {
        match msg {
            Msg::Mode(_) | Msg::Delay(_) | Msg::Wait(_) | Msg::Drain(_)
            | Msg::StreamInterrupted(_) => Some(msg),
            Msg::Track(track) => {
                // Every stream must be answered: a track boundary with an
                // unchecked stream means the codec never recognised it.
                let (needs_check, failed_track) = {
                    let inner = self.inner.lock().unwrap();
                    if track.start_of_stream() && !inner.checked_stream_playable {
                        if inner.stream_handler.is_some() {
                            (true, None)
                        } else {
                            (false, Some(inner.track_id))
                        }
                    } else {
                        (false, None)
                    }
                };
                if needs_check {
                    self.check_ok_to_play();
                }
                if let Some(track_id) = failed_track {
                    if let Some(observer) = self.play_observer.lock().unwrap().clone() {
                        observer.notify_track_failed(track_id);
                    }
                }
                let mut inner = self.inner.lock().unwrap();
                if track.start_of_stream() {
                    inner.new_stream();
                }
                inner.track_id = track.track().id();
                drop(inner);
                Some(Msg::Track(track))
            }
            Msg::EncodedStream(stream) => {
                let needs_check = {
                    let inner = self.inner.lock().unwrap();
                    !inner.checked_stream_playable && inner.stream_handler.is_some()
                };
                if needs_check {
                    self.check_ok_to_play();
                }
                let live = stream.live;
                {
                    let mut inner = self.inner.lock().unwrap();
                    inner.new_stream();
                    inner.stream_id = stream.stream_id;
                    inner.stream_handler = stream.handler;
                }
                if live {
                    // Nothing else arrives for a live stream until it is
                    // allowed to play.
                    self.check_ok_to_play();
                }
                None
            }
            Msg::MetaText(_) | Msg::BitRate(_) => {
                let inner = self.inner.lock().unwrap();
                Self::process_flushable(&inner, msg)
            }
            Msg::Halt(halt) => {
                let mut inner = self.inner.lock().unwrap();
                if inner.target_halt_id == halt.id() {
                    inner.target_halt_id = HALT_ID_INVALID;
                    self.handle_stopped(&mut inner);
                }
                Some(Msg::Halt(halt))
            }
            Msg::Flush(_) => None,
            Msg::DecodedStream(mut stream) => {
                let needs_check = {
                    let inner = self.inner.lock().unwrap();
                    !stream.info().live && !inner.checked_stream_playable
                };
                if needs_check {
                    self.check_ok_to_play();
                }
                let inner = self.inner.lock().unwrap();
                if inner.flush_stream {
                    return None;
                }
                drop(inner);
                // Downstream control calls (starvation reporting) route
                // through this element from here on.
                stream.set_handler(*self.handle.lock().unwrap());
                Some(Msg::DecodedStream(stream))
            }
            Msg::AudioPcm(mut audio) => {
                let mut inner = self.inner.lock().unwrap();
                if inner.state == State::RampingDown || inner.state == State::RampingUp {
                    let direction = if inner.state == State::RampingDown {
                        Direction::Down
                    } else {
                        Direction::Up
                    };
                    if inner.remaining_ramp > 0 {
                        let (current, split) =
                            audio.set_ramp(inner.current_ramp, inner.remaining_ramp, direction);
                        inner.current_ramp = current;
                        inner.remaining_ramp =
                            inner.remaining_ramp.saturating_sub(audio.jiffies());
                        if let Some(split) = split {
                            self.queue.enqueue_at_head(Msg::AudioPcm(split));
                        }
                    }
                    if inner.remaining_ramp == 0 {
                        if let Some((handle, stream_id)) = self.ramp_completed(&mut inner) {
                            drop(inner);
                            if let Some(handler) = self.resolve(Some(handle)) {
                                let _ = handler.try_stop(stream_id);
                            }
                        }
                    }
                    return Some(Msg::AudioPcm(audio));
                }
                Self::process_flushable(&inner, Msg::AudioPcm(audio))
            }
            Msg::Silence(silence) => {
                let mut inner = self.inner.lock().unwrap();
                if inner.state == State::RampingDown || inner.state == State::RampingUp {
                    inner.remaining_ramp = 0;
                    if let Some((handle, stream_id)) = self.ramp_completed(&mut inner) {
                        drop(inner);
                        if let Some(handler) = self.resolve(Some(handle)) {
                            let _ = handler.try_stop(stream_id);
                        }
                        let inner = self.inner.lock().unwrap();
                        return Self::process_flushable(&inner, Msg::Silence(silence));
                    }
                }
                Self::process_flushable(&inner, Msg::Silence(silence))
            }
            Msg::Quit(quit) => {
                let (handle, stream_id) = {
                    let inner = self.inner.lock().unwrap();
                    (inner.stream_handler, inner.stream_id)
                };
                if let Some(handler) = self.resolve(handle) {
                    let _ = handler.try_stop(stream_id);
                }
                Some(Msg::Quit(quit))
            }
            msg => unexpected("Stopper", &msg),
        }
    }
}

impl ElementUpstream for Stopper {
    fn pull(&self) -> Msg {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.halt_pending {
                    inner.halt_pending = false;
                    inner.buffering = false;
                    drop(inner);
                    return self.factory.halt();
                }
                // A parked stop-in-progress (flushing towards a target
                // halt) must keep pulling so the halt can arrive.
                while (inner.state == State::Paused || inner.state == State::Stopped)
                    && !inner.wake_pending
                    && !(inner.flush_stream && inner.target_halt_id != HALT_ID_INVALID)
                {
                    trace!("stopper parked, state={:?}", inner.state);
                    inner = self.wakeup.wait(inner).unwrap();
                    if inner.halt_pending {
                        break;
                    }
                }
                inner.wake_pending = false;
                if inner.halt_pending {
                    continue;
                }
            }

            let msg = self
                .queue
                .try_dequeue()
                .unwrap_or_else(|| self.upstream.pull());
            if let Some(msg) = self.process(msg) {
                self.inner.lock().unwrap().buffering = false;
                return msg;
            }
        }
    }
}

impl StreamHandler for Stopper {
    fn ok_to_play(&self, _stream_id: u32) -> StreamPlay {
        unreachable!("nothing downstream of the stopper asks ok_to_play");
    }

    fn try_seek(&self, _stream_id: u32, _offset: u64) -> u32 {
        unreachable!("nothing downstream of the stopper seeks");
    }

    fn try_stop(&self, _stream_id: u32) -> u32 {
        unreachable!("nothing downstream of the stopper stops streams");
    }

    fn notify_starving(&self, mode: &str, stream_id: u32, starving: bool) {
        let forward = {
            let mut inner = self.inner.lock().unwrap();
            if starving {
                if inner.state == State::RampingDown {
                    // The pause/stop ramp cannot finish without audio:
                    // jump to its end state.
                    if inner.target_halt_id == HALT_ID_INVALID {
                        self.handle_paused(&mut inner);
                    } else {
                        self.handle_stopped(&mut inner);
                    }
                } else {
                    inner.buffering = true;
                }
            }
            inner.stream_handler
        };
        if let Some(handler) = self.resolve(forward) {
            handler.notify_starving(mode, stream_id, starving);
        }
    }
}
