//! Last-resort underrun hiding before the sink.
//!
//! Normally a passthrough reservoir: a dedicated puller thread keeps up to
//! `max_jiffies` of audio buffered ahead of the sink. When the sink pulls
//! with the buffer empty while audio was flowing, the ramper synthesises a
//! flywheel continuation from the retained recent audio, plays it under a
//! down-ramp, emits a halt, and notifies the stream handler that the
//! pipeline is starving. When real audio returns it ramps back up from
//! silence and clears the starving state (both transitions are signalled
//! unconditionally).
//!
//! The buffering flag is published through the observer-callback thread,
//! change-only, so sink-thread timing never depends on an observer.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender},
        Arc, Condvar, Mutex,
    },
    thread::{self, JoinHandle},
};

use crate::{
    flywheel::{FlywheelRamper, SUBSAMPLE_BYTES},
    jiffies,
    msg::{
        audio::{Endian, PcmProcessor},
        Msg, MsgFactory, STREAM_ID_INVALID,
    },
    observer::{EventId, ObserverThread},
    pipeline::{reservoir::CountingQueue, ElementUpstream},
    ramp::{self, Direction},
    registry::{HandlerHandle, HandlerRegistry},
};

/// Receives the pipeline-level buffering flag, on the observer thread.
pub trait StarvationObserver: Send + Sync {
    fn notify_starvation_buffering(&self, buffering: bool);
}

/// Collects recent audio messages into the flywheel's planar 32-bit
/// big-endian training block.
struct FlywheelInput {
    planes: Vec<Vec<u8>>,
}

impl FlywheelInput {
    fn new() -> Self {
        Self { planes: Vec::new() }
    }

    fn prepare(&mut self, recent: &mut VecDeque<Msg>, channels: u32) -> Vec<u8> {
        self.planes.clear();
        self.planes.resize(channels as usize, Vec::new());
        while let Some(msg) = recent.pop_front() {
            match msg {
                Msg::AudioPcm(audio) => audio.read(self),
                Msg::Silence(silence) => silence.read(self),
                _ => unreachable!("recent-audio history only holds audio"),
            }
        }
        let mut block = Vec::new();
        for plane in &self.planes {
            block.extend_from_slice(plane);
        }
        block
    }

    fn distribute(&mut self, data: &[u8], channels: u32, subsample_bytes: usize) {
        let frame_bytes = subsample_bytes * channels as usize;
        for frame in data.chunks_exact(frame_bytes) {
            for (ch, plane) in self.planes.iter_mut().enumerate() {
                let subsample = &frame[ch * subsample_bytes..(ch + 1) * subsample_bytes];
                plane.extend_from_slice(subsample);
                // Pad to 32 bits, MSB-aligned.
                plane.resize(plane.len() + (SUBSAMPLE_BYTES - subsample_bytes), 0);
            }
        }
    }
}

impl PcmProcessor for FlywheelInput {
    fn process_fragment8(&mut self, data: &[u8], channels: u32) {
        self.distribute(data, channels, 1);
    }

    fn process_fragment16(&mut self, data: &[u8], channels: u32) {
        self.distribute(data, channels, 2);
    }

    fn process_fragment24(&mut self, data: &[u8], channels: u32) {
        self.distribute(data, channels, 3);
    }

    fn process_fragment32(&mut self, data: &[u8], channels: u32) {
        self.distribute(data, channels, 4);
    }
}

struct RampWork {
    samples: Vec<u8>,
    sample_rate: u32,
    channels: u32,
    current_ramp: u32,
}

struct GeneratorState {
    queue: VecDeque<Msg>,
    active: bool,
}

/// Runs flywheel synthesis on its own thread and hands the generated,
/// down-ramped audio back through a bounded handoff queue.
struct RampGenerator {
    state: Mutex<GeneratorState>,
    available: Condvar,
    work: Mutex<Option<Sender<RampWork>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RampGenerator {
    fn new(factory: MsgFactory, training_jiffies: u64, ramp_jiffies: u64) -> Arc<Self> {
        let (work, work_rx) = mpsc::channel::<RampWork>();
        let generator = Arc::new(Self {
            state: Mutex::new(GeneratorState {
                queue: VecDeque::new(),
                active: false,
            }),
            available: Condvar::new(),
            work: Mutex::new(Some(work)),
            thread: Mutex::new(None),
        });

        let thread_generator = Arc::clone(&generator);
        let thread = thread::Builder::new()
            .name("flywheel-ramper".to_string())
            .spawn(move || {
                thread_generator.run(&factory, &work_rx, training_jiffies, ramp_jiffies);
            })
            .expect("spawn flywheel thread");
        *generator.thread.lock().unwrap() = Some(thread);
        generator
    }

    fn run(
        &self,
        factory: &MsgFactory,
        work_rx: &Receiver<RampWork>,
        training_jiffies: u64,
        ramp_jiffies: u64,
    ) {
        let mut ramper = FlywheelRamper::new(training_jiffies, ramp_jiffies);
        let mut interleaved = Vec::new();
        while let Ok(work) = work_rx.recv() {
            let planar = ramper.ramp(&work.samples, work.sample_rate, work.channels);

            // The flywheel boundary is planar; messages are interleaved.
            let channel_bytes = planar.len() / work.channels as usize;
            let samples = channel_bytes / SUBSAMPLE_BYTES;
            interleaved.clear();
            for sample in 0..samples {
                for ch in 0..work.channels as usize {
                    let offset = ch * channel_bytes + sample * SUBSAMPLE_BYTES;
                    interleaved.extend_from_slice(&planar[offset..offset + SUBSAMPLE_BYTES]);
                }
            }

            let msg = factory.audio_pcm(
                &interleaved,
                work.channels,
                work.sample_rate,
                32,
                Endian::Big,
                0,
            );
            let Msg::AudioPcm(mut audio) = msg else {
                unreachable!("factory returned the requested variant");
            };
            let remaining = audio.jiffies();
            if remaining > 0 {
                let (_, split) = audio.set_ramp(work.current_ramp, remaining, Direction::Down);
                debug_assert!(split.is_none());
            }

            let mut state = self.state.lock().unwrap();
            state.queue.push_back(Msg::AudioPcm(audio));
            state.active = false;
            drop(state);
            self.available.notify_one();
        }
    }

    fn start(&self, work: RampWork) {
        self.state.lock().unwrap().active = true;
        // Send can only fail after shutdown, when no one pulls anyway.
        if let Some(sender) = self.work.lock().unwrap().as_ref() {
            let _ = sender.send(work);
        }
    }

    /// Closes the work channel and joins the synthesis thread.
    fn shutdown(&self) {
        self.work.lock().unwrap().take();
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }

    /// Returns generated audio, blocking while a ramp is being produced.
    /// `None` once the generator is idle and drained.
    fn try_get_audio(&self) -> Option<Msg> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(msg) = state.queue.pop_front() {
                return Some(msg);
            }
            if !state.active {
                return None;
            }
            state = self.available.wait(state).unwrap();
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Starting,
    Running,
    Halted,
    RampingDown,
    RampingUp,
}

struct Inner {
    state: State,
    recent: VecDeque<Msg>,
    recent_jiffies: u64,
    mode: String,
    stream_id: u32,
    handler: Option<HandlerHandle>,
    sample_rate: u32,
    bit_depth: u32,
    channels: u32,
    current_ramp: u32,
    remaining_ramp: u64,
    starving: bool,
    exit: bool,
}

impl Inner {
    fn new_stream(&mut self) {
        self.state = State::Starting;
        self.recent.clear();
        self.recent_jiffies = 0;
        self.stream_id = STREAM_ID_INVALID;
        self.current_ramp = ramp::MAX;
    }
}

/// The starvation-ramper element.
pub struct StarvationRamper {
    factory: MsgFactory,
    upstream: Arc<dyn ElementUpstream>,
    registry: Arc<HandlerRegistry>,
    queue: CountingQueue,
    max_jiffies: u64,
    max_streams: usize,
    training_jiffies: u64,
    rampup_jiffies: u64,
    inner: Mutex<Inner>,
    space: Condvar,
    generator: Arc<RampGenerator>,
    flywheel_input: Mutex<FlywheelInput>,
    event_buffering: AtomicBool,
    event_id: EventId,
    observer_thread: Arc<ObserverThread>,
    puller: Mutex<Option<JoinHandle<()>>>,
}

impl StarvationRamper {
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        factory: MsgFactory,
        upstream: Arc<dyn ElementUpstream>,
        registry: Arc<HandlerRegistry>,
        observer: Arc<dyn StarvationObserver>,
        observer_thread: Arc<ObserverThread>,
        max_jiffies: u64,
        max_streams: usize,
        training_jiffies: u64,
        rampdown_jiffies: u64,
        rampup_jiffies: u64,
    ) -> Arc<Self> {
        let generator = RampGenerator::new(factory.clone(), training_jiffies, rampdown_jiffies);

        // Change-only event relay: the flag may flip many times between
        // observer-thread turns; the observer sees each *change* once.
        let event_flag = Arc::new(AtomicBool::new(false));
        let last_reported = Mutex::new(false);
        let callback_flag = Arc::clone(&event_flag);
        let event_id = observer_thread.register(Box::new(move || {
            let buffering = callback_flag.load(Ordering::SeqCst);
            let mut last = last_reported.lock().unwrap();
            if *last != buffering {
                *last = buffering;
                observer.notify_starvation_buffering(buffering);
            }
        }));

        let ramper = Arc::new(Self {
            factory,
            upstream,
            registry,
            queue: CountingQueue::new(),
            max_jiffies,
            max_streams,
            training_jiffies,
            rampup_jiffies,
            inner: Mutex::new(Inner {
                state: State::Halted,
                recent: VecDeque::new(),
                recent_jiffies: 0,
                mode: String::new(),
                stream_id: STREAM_ID_INVALID,
                handler: None,
                sample_rate: 0,
                bit_depth: 0,
                channels: 0,
                current_ramp: ramp::MIN,
                remaining_ramp: 0,
                starving: false,
                exit: false,
            }),
            space: Condvar::new(),
            generator,
            flywheel_input: Mutex::new(FlywheelInput::new()),
            event_buffering: AtomicBool::new(false),
            event_id,
            observer_thread,
            puller: Mutex::new(None),
        });
        ramper.set_buffering(true);
        ramper
    }

    /// Starts the puller thread feeding the internal buffer.
    pub fn start(self: &Arc<Self>) {
        let ramper = Arc::clone(self);
        let thread = thread::Builder::new()
            .name("starvation-ramper".to_string())
            .spawn(move || ramper.puller_thread())
            .expect("spawn starvation puller");
        *self.puller.lock().unwrap() = Some(thread);
    }

    /// Waits for the puller thread to exit (after Quit drains through) and
    /// shuts down the flywheel thread.
    pub fn join(&self) {
        if let Some(thread) = self.puller.lock().unwrap().take() {
            let _ = thread.join();
        }
        self.generator.shutdown();
    }

    /// Buffered audio ahead of the sink, for telemetry.
    #[must_use]
    pub fn buffered_jiffies(&self) -> u64 {
        self.queue.jiffies()
    }

    fn is_full(&self) -> bool {
        self.queue.jiffies() >= self.max_jiffies
            || self.queue.decoded_streams() >= self.max_streams
    }

    fn puller_thread(&self) {
        loop {
            let msg = self.upstream.pull();
            self.process_in(&msg);
            let exit = {
                let inner = self.inner.lock().unwrap();
                inner.exit
            };
            self.queue.enqueue(msg);
            if exit {
                break;
            }
            let mut inner = self.inner.lock().unwrap();
            while self.is_full() && !inner.exit {
                inner = self.space.wait(inner).unwrap();
            }
        }
        debug!("starvation ramper puller exiting");
    }

    fn process_in(&self, msg: &Msg) {
        let mut inner = self.inner.lock().unwrap();
        match msg {
            Msg::Mode(_) | Msg::Track(_) => inner.new_stream(),
            Msg::Halt(_) => inner.state = State::Halted,
            Msg::DecodedStream(stream) => {
                inner.new_stream();
                let info = stream.info();
                inner.stream_id = info.stream_id;
                inner.handler = info.handler;
                inner.sample_rate = info.sample_rate;
                inner.bit_depth = info.bit_depth;
                inner.channels = info.channels;
            }
            Msg::AudioPcm(_) | Msg::Silence(_) => {
                if inner.state == State::Starting || inner.state == State::Halted {
                    inner.state = State::Running;
                }
            }
            Msg::Quit(_) => {
                inner.exit = true;
                inner.recent.clear();
                inner.recent_jiffies = 0;
            }
            _ => {}
        }
    }

    fn set_buffering(&self, buffering: bool) {
        let previous = self.event_buffering.swap(buffering, Ordering::SeqCst);
        if previous != buffering {
            self.observer_thread.schedule(self.event_id);
        }
    }

    fn notify_starving(&self, handle: Option<HandlerHandle>, mode: &str, stream_id: u32, starving: bool) {
        if let Some(handler) = handle.and_then(|handle| self.registry.resolve(handle)) {
            handler.notify_starving(mode, stream_id, starving);
        }
    }

    /// Feeds the flywheel and switches to the synthesised down-ramp.
    fn start_flywheel_ramp(&self, inner: &mut Inner) {
        if inner.recent_jiffies > self.training_jiffies {
            // Trim the history window to exactly the training duration.
            let excess = inner.recent_jiffies - self.training_jiffies;
            if let Some(Msg::AudioPcm(mut head)) = inner.recent.pop_front() {
                inner.recent_jiffies -= head.jiffies();
                let jiffies_per_sample = jiffies::per_sample(inner.sample_rate);
                if excess >= jiffies_per_sample && excess < head.jiffies() {
                    let tail = head.split(excess);
                    inner.recent_jiffies += tail.jiffies();
                    inner.recent.push_front(Msg::AudioPcm(tail));
                }
            }
        } else if inner.recent_jiffies < self.training_jiffies {
            // Too little history: pad with leading silence.
            let missing = self.training_jiffies - inner.recent_jiffies;
            let Msg::Silence(silence) = self.factory.silence(
                missing,
                inner.sample_rate,
                inner.bit_depth,
                inner.channels,
            ) else {
                unreachable!("factory returned the requested variant");
            };
            inner.recent_jiffies += silence.jiffies();
            inner.recent.push_front(Msg::Silence(silence));
        }

        let samples = self
            .flywheel_input
            .lock()
            .unwrap()
            .prepare(&mut inner.recent, inner.channels);
        inner.recent_jiffies = 0;
        self.generator.start(RampWork {
            samples,
            sample_rate: inner.sample_rate,
            channels: inner.channels,
            current_ramp: inner.current_ramp,
        });
        inner.state = State::RampingDown;
    }

    /// History retention and ramp-up application for outgoing audio.
    fn process_audio_out(&self, audio: &mut Msg) {
        let starving_notice = {
            let mut inner = self.inner.lock().unwrap();
            let notice = if inner.starving {
                inner.starving = false;
                Some((inner.handler, inner.mode.clone(), inner.stream_id))
            } else {
                None
            };

            if let Msg::AudioPcm(pcm) = &*audio {
                inner.recent.push_back(Msg::AudioPcm(pcm.shallow_clone()));
                inner.recent_jiffies += pcm.jiffies();
                // Keep at least a training window, dropping whole messages
                // from the head once it is exceeded.
                if inner.recent_jiffies >= self.training_jiffies {
                    if let Some(head) = inner.recent.pop_front() {
                        inner.recent_jiffies -= head.jiffies();
                        if inner.recent_jiffies < self.training_jiffies {
                            inner.recent_jiffies += head.jiffies();
                            inner.recent.push_front(head);
                        }
                    }
                }
            }

            if let (State::RampingUp, Msg::AudioPcm(pcm)) = (inner.state, &mut *audio) {
                if inner.remaining_ramp > 0 {
                    let (current, split) =
                        pcm.set_ramp(inner.current_ramp, inner.remaining_ramp, Direction::Up);
                    inner.current_ramp = current;
                    inner.remaining_ramp = inner.remaining_ramp.saturating_sub(pcm.jiffies());
                    if let Some(split) = split {
                        self.queue.enqueue_at_head(Msg::AudioPcm(split));
                    }
                }
                if inner.remaining_ramp == 0 {
                    inner.state = State::Running;
                }
            }
            notice
        };

        if let Some((handle, mode, stream_id)) = starving_notice {
            self.notify_starving(handle, &mode, stream_id, false);
        }
    }

    fn process_out(&self, mut msg: Msg) -> Msg {
        match &mut msg {
            Msg::Mode(mode) => {
                self.inner.lock().unwrap().mode = mode.mode().to_string();
            }
            Msg::Halt(_) => {
                // Halted on both entry and exit of this message, so a ramp
                // never starts between buffering the halt and playing it.
                self.inner.lock().unwrap().state = State::Halted;
            }
            Msg::AudioPcm(_) => {
                self.process_audio_out(&mut msg);
                self.set_buffering(false);
            }
            Msg::Silence(_) => {
                self.process_audio_out(&mut msg);
            }
            _ => {}
        }
        msg
    }
}

impl ElementUpstream for StarvationRamper {
    fn pull(&self) -> Msg {
        let starving_notice = {
            let mut inner = self.inner.lock().unwrap();
            if self.queue.is_empty() {
                self.set_buffering(true);
                let live_ramp = inner.state == State::Running
                    || (inner.state == State::RampingUp && inner.current_ramp != ramp::MIN);
                if live_ramp && !inner.exit {
                    info!("pipeline starving; starting flywheel ramp");
                    self.start_flywheel_ramp(&mut inner);
                    inner.starving = true;
                    Some((inner.handler, inner.mode.clone(), inner.stream_id))
                } else {
                    None
                }
            } else {
                None
            }
        };
        if let Some((handle, mode, stream_id)) = starving_notice {
            self.notify_starving(handle, &mode, stream_id, true);
        }

        if let Some(msg) = self.generator.try_get_audio() {
            return msg;
        }
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == State::RampingDown {
                // The synthesised ramp has fully played out.
                inner.state = State::RampingUp;
                inner.current_ramp = ramp::MIN;
                inner.remaining_ramp = self.rampup_jiffies;
                drop(inner);
                return self.factory.halt();
            }
        }

        let msg = self.queue.dequeue();
        {
            let _inner = self.inner.lock().unwrap();
            self.space.notify_one();
        }
        self.process_out(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        msg::{MsgQueue, PoolConfig, StreamInfo},
        registry::{StreamHandler, StreamPlay},
    };
    use std::time::Duration;

    struct QueueUpstream(MsgQueue);

    impl ElementUpstream for QueueUpstream {
        fn pull(&self) -> Msg {
            self.0.dequeue()
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        starving: Mutex<Vec<bool>>,
    }

    impl StreamHandler for RecordingHandler {
        fn ok_to_play(&self, _stream_id: u32) -> StreamPlay {
            StreamPlay::Yes
        }

        fn try_seek(&self, _stream_id: u32, _offset: u64) -> u32 {
            crate::msg::FLUSH_ID_INVALID
        }

        fn try_stop(&self, _stream_id: u32) -> u32 {
            crate::msg::FLUSH_ID_INVALID
        }

        fn notify_starving(&self, _mode: &str, _stream_id: u32, starving: bool) {
            self.starving.lock().unwrap().push(starving);
        }
    }

    struct NullObserver;

    impl StarvationObserver for NullObserver {
        fn notify_starvation_buffering(&self, _buffering: bool) {}
    }

    struct Rig {
        factory: MsgFactory,
        upstream: Arc<QueueUpstream>,
        handler: Arc<RecordingHandler>,
        observer_thread: Arc<ObserverThread>,
        ramper: Arc<StarvationRamper>,
    }

    fn rig() -> Rig {
        let factory = MsgFactory::new(&PoolConfig::default());
        let upstream = Arc::new(QueueUpstream(MsgQueue::new()));
        let registry = Arc::new(HandlerRegistry::new());
        let handler = Arc::new(RecordingHandler::default());
        let handle = registry.register(&(Arc::clone(&handler) as Arc<dyn StreamHandler>));
        let observer_thread = ObserverThread::new();
        let ramper = StarvationRamper::new(
            factory.clone(),
            Arc::clone(&upstream) as Arc<dyn ElementUpstream>,
            registry,
            Arc::new(NullObserver),
            Arc::clone(&observer_thread),
            jiffies::from_ms(500),
            8,
            jiffies::from_ms(20),
            jiffies::from_ms(20),
            jiffies::from_ms(50),
        );

        upstream.0.enqueue(factory.decoded_stream(StreamInfo {
            stream_id: 1,
            bit_depth: 16,
            sample_rate: 44_100,
            channels: 2,
            handler: Some(handle),
            ..StreamInfo::default()
        }));
        Rig {
            factory,
            upstream,
            handler,
            observer_thread,
            ramper,
        }
    }

    impl Rig {
        fn enqueue_audio_ms(&self, ms: usize) {
            let samples = 44_100 * ms / 1000;
            self.upstream.0.enqueue(self.factory.audio_pcm(
                &vec![4u8; samples * 4],
                2,
                44_100,
                16,
                crate::msg::audio::Endian::Big,
                0,
            ));
        }

        fn settle(&self) {
            // Give the puller thread time to move everything queued so far
            // into the internal buffer.
            thread::sleep(Duration::from_millis(100));
        }
    }

    #[test]
    fn passthrough_while_audio_is_buffered() {
        let rig = rig();
        for _ in 0..3 {
            rig.enqueue_audio_ms(10);
        }
        rig.ramper.start();
        rig.settle();

        assert!(matches!(rig.ramper.pull(), Msg::DecodedStream(_)));
        for _ in 0..3 {
            let Msg::AudioPcm(audio) = rig.ramper.pull() else {
                panic!("expected audio");
            };
            assert!(!audio.ramp().is_enabled());
        }
        assert!(rig.handler.starving.lock().unwrap().is_empty());
        rig.upstream.0.enqueue(rig.factory.quit());
        let _ = rig.ramper.pull();
        rig.ramper.join();
        rig.observer_thread.quit();
    }

    #[test]
    fn starvation_synthesises_ramp_down_then_halt_then_ramps_up() {
        let rig = rig();
        for _ in 0..3 {
            rig.enqueue_audio_ms(10);
        }
        rig.ramper.start();
        rig.settle();

        assert!(matches!(rig.ramper.pull(), Msg::DecodedStream(_)));
        for _ in 0..3 {
            assert!(matches!(rig.ramper.pull(), Msg::AudioPcm(_)));
        }

        // The buffer is dry while running: exactly one flywheel ramp-down
        // followed by a halt.
        let Msg::AudioPcm(flywheel) = rig.ramper.pull() else {
            panic!("expected synthesised audio");
        };
        assert_eq!(flywheel.ramp().direction(), Direction::Down);
        assert_eq!(flywheel.ramp().end(), ramp::MIN);
        assert_eq!(flywheel.jiffies(), jiffies::from_ms(20));
        assert_eq!(flywheel.audio().bit_depth(), 32);

        assert!(matches!(rig.ramper.pull(), Msg::Halt(_)));
        assert_eq!(*rig.handler.starving.lock().unwrap(), vec![true]);

        // Audio returns: it ramps up from silence and the starving state
        // clears.
        rig.enqueue_audio_ms(10);
        rig.settle();
        let Msg::AudioPcm(resumed) = rig.ramper.pull() else {
            panic!("expected audio");
        };
        assert_eq!(resumed.ramp().direction(), Direction::Up);
        assert_eq!(resumed.ramp().start(), ramp::MIN);
        assert_eq!(*rig.handler.starving.lock().unwrap(), vec![true, false]);

        rig.upstream.0.enqueue(rig.factory.quit());
        let _ = rig.ramper.pull();
        rig.ramper.join();
        rig.observer_thread.quit();
    }

    #[test]
    fn no_flywheel_after_a_halt() {
        let rig = rig();
        rig.enqueue_audio_ms(10);
        rig.upstream.0.enqueue(rig.factory.halt_with_id(7));
        rig.ramper.start();
        rig.settle();

        assert!(matches!(rig.ramper.pull(), Msg::DecodedStream(_)));
        assert!(matches!(rig.ramper.pull(), Msg::AudioPcm(_)));
        assert!(matches!(rig.ramper.pull(), Msg::Halt(_)));

        // Starved after a planned halt: silence is expected, no ramp runs.
        rig.enqueue_audio_ms(10);
        rig.settle();
        let Msg::AudioPcm(resumed) = rig.ramper.pull() else {
            panic!("expected audio");
        };
        assert!(!resumed.ramp().is_enabled());
        assert!(rig.handler.starving.lock().unwrap().is_empty());

        rig.upstream.0.enqueue(rig.factory.quit());
        let _ = rig.ramper.pull();
        rig.ramper.join();
        rig.observer_thread.quit();
    }
}
