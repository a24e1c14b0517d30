//! Whole-pipeline scenarios over scripted protocol and codec doubles.
//!
//! A scripted in-memory protocol feeds raw-PCM streams through the full
//! element chain; the test acts as the sink thread, pulling playables and
//! watching observer traffic.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Condvar, Mutex},
    thread,
    time::Duration,
};

use url::Url;

use sluice::{
    animator::FixedAnimator,
    codec::{Codec, CodecResult, CodecSignal, DecodedStreamParams},
    jiffies,
    msg::{audio::Endian, ModeInfo, Msg, StreamInfo, Track, FLUSH_ID_INVALID, TRACK_ID_NONE},
    observer::{PipelineObserver, PipelineState},
    pipeline::{
        codec_controller::CodecStream, filler::ListUriProvider, Pipeline, PipelineConfig,
    },
    protocol::{GetResult, Protocol, StreamResult, Supply},
    registry::{HandlerHandle, StreamHandler, StreamPlay},
};

/// Raw-PCM container for tests: magic, rate, depth, channels, then
/// big-endian interleaved samples.
const MAGIC: &[u8; 4] = b"RAWP";

fn raw_pcm_track(sample_rate: u32, bit_depth: u8, channels: u8, payload: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(10 + payload.len());
    data.extend_from_slice(MAGIC);
    data.extend_from_slice(&sample_rate.to_be_bytes());
    data.push(bit_depth);
    data.push(channels);
    data.extend_from_slice(payload);
    data
}

/// Constant-amplitude 16-bit stereo payload of the given duration.
fn constant_payload(sample_rate: u32, ms: u64, amplitude: i16) -> Vec<u8> {
    let samples = (u64::from(sample_rate) * ms / 1000) as usize;
    let mut payload = Vec::with_capacity(samples * 4);
    for _ in 0..samples {
        payload.extend_from_slice(&amplitude.to_be_bytes());
        payload.extend_from_slice(&amplitude.to_be_bytes());
    }
    payload
}

struct RawPcmCodec {
    carry: Vec<u8>,
}

impl RawPcmCodec {
    fn new() -> Self {
        Self { carry: Vec::new() }
    }

    fn read_header(stream: &CodecStream) -> CodecResult<Option<[u8; 10]>> {
        let mut header = [0u8; 10];
        let mut filled = 0;
        while filled < header.len() {
            let n = stream.read(&mut header[filled..])?;
            if n == 0 {
                return Ok(None);
            }
            filled += n;
        }
        Ok(Some(header))
    }
}

impl Codec for RawPcmCodec {
    fn id(&self) -> &'static str {
        "rawpcm"
    }

    fn recognise(&mut self, window: &[u8]) -> bool {
        window.len() >= MAGIC.len() && &window[..MAGIC.len()] == MAGIC
    }

    fn process(&mut self, stream: &CodecStream) -> CodecResult<()> {
        let Some(header) = Self::read_header(stream)? else {
            return Err(CodecSignal::StreamCorrupt);
        };
        let sample_rate = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        let bit_depth = u32::from(header[8]);
        let channels = u32::from(header[9]);
        stream.output_decoded_stream(DecodedStreamParams {
            bit_rate: sample_rate * bit_depth * channels,
            bit_depth,
            sample_rate,
            channels,
            codec_name: "rawpcm".to_string(),
            track_length: 0,
            sample_start: 0,
            lossless: true,
        });

        if !jiffies::is_supported(sample_rate) {
            // The sink-side validator stops the stream; consume bytes
            // until the flush (or the next boundary) cuts this run off.
            let mut scratch = [0u8; 1024];
            loop {
                match stream.read(&mut scratch) {
                    Ok(0) => return Ok(()),
                    Ok(_) => {}
                    Err(signal) => return Err(signal),
                }
            }
        }

        let frame_bytes = (bit_depth as usize / 8) * channels as usize;
        let mut buf = [0u8; 4096];
        self.carry.clear();
        loop {
            let n = stream.read(&mut buf)?;
            if n == 0 {
                return Ok(());
            }
            self.carry.extend_from_slice(&buf[..n]);
            let whole = self.carry.len() - self.carry.len() % frame_bytes;
            if whole > 0 {
                stream.output_audio(
                    &self.carry[..whole],
                    channels,
                    sample_rate,
                    bit_depth,
                    Endian::Big,
                );
                self.carry.drain(..whole);
            }
        }
    }
}

enum Feed {
    Data(Vec<u8>),
    End,
}

#[derive(Default)]
struct Script {
    feeds: Mutex<VecDeque<Feed>>,
    more: Condvar,
}

impl Script {
    fn push_data(&self, data: Vec<u8>) {
        self.feeds.lock().unwrap().push_back(Feed::Data(data));
        self.more.notify_all();
    }

    fn finish(&self) {
        self.feeds.lock().unwrap().push_back(Feed::End);
        self.more.notify_all();
    }
}

#[derive(Default)]
struct ProtocolState {
    interrupted: bool,
    stream_id: u32,
    active: bool,
    pending_stop: Option<u32>,
}

/// Streams scripted byte feeds for `mem:` URIs.
#[derive(Default)]
struct MemoryProtocol {
    scripts: Mutex<HashMap<String, Arc<Script>>>,
    supply: Mutex<Option<(Supply, HandlerHandle)>>,
    state: Mutex<ProtocolState>,
    starving_log: Mutex<Vec<bool>>,
}

impl MemoryProtocol {
    fn script(&self, uri: &str) -> Arc<Script> {
        Arc::clone(
            self.scripts
                .lock()
                .unwrap()
                .entry(uri.to_string())
                .or_default(),
        )
    }
}

enum Step {
    Feed(Feed),
    Stop(u32),
    Interrupted,
}

impl MemoryProtocol {
    fn next_step(&self, script: &Script) -> Step {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if state.interrupted {
                    return Step::Interrupted;
                }
                if let Some(flush_id) = state.pending_stop.take() {
                    return Step::Stop(flush_id);
                }
            }
            if let Some(feed) = script.feeds.lock().unwrap().pop_front() {
                return Step::Feed(feed);
            }
            // Re-check control flags every few milliseconds while waiting
            // for the script to advance.
            thread::sleep(Duration::from_millis(2));
        }
    }
}

impl Protocol for MemoryProtocol {
    fn initialise(&self, supply: Supply, handle: HandlerHandle) {
        *self.supply.lock().unwrap() = Some((supply, handle));
    }

    fn stream(&self, uri: &Url) -> StreamResult {
        if uri.scheme() != "mem" {
            return StreamResult::NotSupported;
        }
        let (supply, handle) = self.supply.lock().unwrap().clone().unwrap();
        let script = self.script(uri.as_str());

        let stream_id = supply.ids.next_stream_id();
        {
            let mut state = self.state.lock().unwrap();
            if state.interrupted {
                return StreamResult::UnrecoverableError;
            }
            state.active = true;
            state.stream_id = stream_id;
            state.pending_stop = None;
        }
        supply.downstream.push(supply.factory.encoded_stream(
            uri.as_str(),
            "",
            0,
            stream_id,
            false,
            false,
            Some(handle),
        ));

        let result = loop {
            match self.next_step(&script) {
                Step::Interrupted => break StreamResult::UnrecoverableError,
                Step::Stop(flush_id) => {
                    supply.downstream.push(supply.factory.flush(flush_id));
                    break StreamResult::Stopped;
                }
                Step::Feed(Feed::End) => break StreamResult::Success,
                Step::Feed(Feed::Data(data)) => {
                    for chunk in data.chunks(1024) {
                        supply.downstream.push(supply.factory.audio_encoded(chunk));
                    }
                }
            }
        };
        self.state.lock().unwrap().active = false;
        result
    }

    fn get(
        &self,
        _writer: &mut dyn std::io::Write,
        _uri: &Url,
        _offset: u64,
        _bytes: u64,
    ) -> GetResult {
        GetResult::NotSupported
    }

    fn interrupt(&self, interrupt: bool) {
        self.state.lock().unwrap().interrupted = interrupt;
    }
}

impl StreamHandler for MemoryProtocol {
    fn ok_to_play(&self, stream_id: u32) -> StreamPlay {
        // A superseded stream must not play; the most recent one may.
        if self.state.lock().unwrap().stream_id == stream_id {
            StreamPlay::Yes
        } else {
            StreamPlay::No
        }
    }

    fn try_seek(&self, _stream_id: u32, _offset: u64) -> u32 {
        FLUSH_ID_INVALID
    }

    fn try_stop(&self, stream_id: u32) -> u32 {
        let (supply, _) = self.supply.lock().unwrap().clone().unwrap();
        let mut state = self.state.lock().unwrap();
        if !state.active || state.stream_id != stream_id {
            return FLUSH_ID_INVALID;
        }
        let flush_id = supply.flush_ids.next_flush_id();
        state.pending_stop = Some(flush_id);
        flush_id
    }

    fn notify_starving(&self, _mode: &str, _stream_id: u32, starving: bool) {
        self.starving_log.lock().unwrap().push(starving);
    }
}

#[derive(Default)]
struct Recorder {
    states: Mutex<Vec<PipelineState>>,
    tracks: Mutex<Vec<u32>>,
    stream_infos: Mutex<Vec<u32>>,
}

impl PipelineObserver for Recorder {
    fn notify_state(&self, state: PipelineState) {
        self.states.lock().unwrap().push(state);
    }

    fn notify_track(&self, track: &Track, _mode: &str, _pipeline_id: u32) {
        self.tracks.lock().unwrap().push(track.id());
    }

    fn notify_metatext(&self, _text: &str) {}

    fn notify_time(&self, _seconds: u64, _duration_seconds: u64) {}

    fn notify_stream_info(&self, info: &StreamInfo) {
        self.stream_infos.lock().unwrap().push(info.stream_id);
    }
}

struct Rig {
    pipeline: Arc<Pipeline>,
    protocol: Arc<MemoryProtocol>,
    recorder: Arc<Recorder>,
}

fn rig(config: PipelineConfig, animator: FixedAnimator, tracks: Vec<Track>) -> Rig {
    let pipeline = Pipeline::new(config, Arc::new(animator));
    let protocol = Arc::new(MemoryProtocol::default());
    pipeline.add_protocol(Arc::clone(&protocol));
    pipeline.add_codec(Box::new(RawPcmCodec::new()));
    pipeline.add_uri_provider(Box::new(ListUriProvider::new(
        "test",
        ModeInfo {
            supports_pause: true,
            supports_next_prev: true,
            supports_latency: false,
        },
        tracks,
    )));
    let recorder = Arc::new(Recorder::default());
    pipeline.add_observer(Arc::clone(&recorder) as Arc<dyn PipelineObserver>);
    Rig {
        pipeline,
        protocol,
        recorder,
    }
}

fn test_config() -> PipelineConfig {
    PipelineConfig {
        stopper_ramp_jiffies: jiffies::from_ms(20),
        flywheel_training_jiffies: jiffies::from_ms(20),
        flywheel_rampdown_jiffies: jiffies::from_ms(20),
        starvation_rampup_jiffies: jiffies::from_ms(50),
        prefetch_timeout: Duration::from_millis(250),
        stop_timeout: Duration::from_millis(500),
        ..PipelineConfig::default()
    }
}

/// Pulls until the Quit sentinel arrives, discarding everything.
fn drain_to_quit(rig: &Rig) {
    loop {
        if matches!(rig.pipeline.pull(), Msg::Quit(_)) {
            break;
        }
    }
    rig.pipeline.join();
}

fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn happy_path_delivers_bit_exact_audio_and_single_playing_state() {
    let mut config = test_config();
    // Room for the entire stream downstream of the stopper, so the
    // unpaced test sink can never race the puller into a false underrun.
    config.decoded_reservoir_max_jiffies = jiffies::from_ms(2000);
    config.starvation_max_jiffies = jiffies::from_ms(2000);

    let payload = constant_payload(44_100, 500, 0x1234);
    let rig = rig(
        config,
        FixedAnimator::default(),
        vec![Track::new(1, "mem:one", "")],
    );
    rig.protocol
        .script("mem:one")
        .push_data(raw_pcm_track(44_100, 16, 2, &payload));
    rig.protocol.script("mem:one").finish();

    rig.pipeline.start();
    rig.pipeline.begin("test", TRACK_ID_NONE);
    rig.pipeline.play();

    // Let the chain pre-buffer the whole track (and its trailing halt).
    eventually("pipeline to buffer the stream", || {
        let (encoded, decoded, sink) = rig.pipeline.fill_levels();
        encoded == 0 && decoded + sink >= jiffies::from_ms(500)
    });
    thread::sleep(Duration::from_millis(100));

    let mut audio = Vec::new();
    loop {
        match rig.pipeline.pull() {
            Msg::Playable(playable) => {
                let mut collector = CollectingProcessor::default();
                playable.read(&mut collector);
                audio.extend_from_slice(&collector.bytes);
            }
            Msg::Halt(_) => break,
            _ => {}
        }
    }

    // Exactly the pushed samples, byte for byte, no ramps applied.
    assert_eq!(audio, payload);

    rig.pipeline.quit();
    drain_to_quit(&rig);

    eventually("observer to settle", || {
        rig.recorder
            .states
            .lock()
            .unwrap()
            .contains(&PipelineState::Stopped)
    });
    let states = rig.recorder.states.lock().unwrap().clone();
    let playing = states
        .iter()
        .filter(|&&s| s == PipelineState::Playing)
        .count();
    assert_eq!(playing, 1, "observer saw {states:?}");
    assert_eq!(*rig.recorder.tracks.lock().unwrap(), vec![1]);

    // Every message returned to its pool.
    for stats in rig.pipeline.pool_stats() {
        assert_eq!(stats.used, 0, "pool {} still has cells out", stats.name);
    }
}

#[test]
fn pause_ramps_to_silence_before_halting() {
    let mut config = test_config();
    config.decoded_reservoir_max_jiffies = jiffies::from_ms(2000);
    // Keep the sink-side buffer shallow so most audio is still upstream
    // of the stopper when the pause lands.
    config.starvation_max_jiffies = jiffies::from_ms(30);

    let payload = constant_payload(44_100, 500, 0x4000);
    let rig = rig(
        config,
        FixedAnimator::default(),
        vec![Track::new(1, "mem:pause", "")],
    );
    rig.protocol
        .script("mem:pause")
        .push_data(raw_pcm_track(44_100, 16, 2, &payload));
    rig.protocol.script("mem:pause").finish();

    rig.pipeline.start();
    rig.pipeline.begin("test", TRACK_ID_NONE);
    rig.pipeline.play();

    eventually("pipeline to buffer the stream", || {
        let (encoded, decoded, sink) = rig.pipeline.fill_levels();
        encoded == 0 && decoded + sink >= jiffies::from_ms(500)
    });

    // Play roughly 100 ms, then pause. The unpaced sink sleeps briefly
    // per pull so the puller thread stays ahead of it.
    let mut played = 0u64;
    loop {
        if let Msg::Playable(playable) = rig.pipeline.pull() {
            played += playable.jiffies();
            if played >= jiffies::from_ms(100) {
                break;
            }
        }
        thread::sleep(Duration::from_millis(1));
    }
    rig.pipeline.pause();

    // The ramp plays out and ends in exact silence, then a halt follows.
    let mut last_frame = Vec::new();
    loop {
        match rig.pipeline.pull() {
            Msg::Playable(playable) => {
                let mut collector = CollectingProcessor::default();
                playable.read(&mut collector);
                if !collector.bytes.is_empty() {
                    let frame = collector.bytes.len().saturating_sub(4);
                    last_frame = collector.bytes[frame..].to_vec();
                }
                thread::sleep(Duration::from_millis(1));
            }
            Msg::Halt(_) => break,
            _ => {}
        }
    }
    assert!(
        last_frame.iter().all(|&b| b == 0),
        "pause ramp must end at bit-exact silence, got {last_frame:?}"
    );
    eventually("paused state", || {
        rig.recorder
            .states
            .lock()
            .unwrap()
            .contains(&PipelineState::Paused)
    });

    // Resume and confirm audio flows again.
    rig.pipeline.play();
    loop {
        if matches!(rig.pipeline.pull(), Msg::Playable(_)) {
            break;
        }
    }

    rig.pipeline.quit();
    drain_to_quit(&rig);
}

#[test]
fn unsupported_sample_rate_is_stopped_and_next_stream_plays() {
    let mut config = test_config();
    config.decoded_reservoir_max_jiffies = jiffies::from_ms(2000);
    config.starvation_max_jiffies = jiffies::from_ms(2000);

    // The sink tops out at 48 kHz; the first track is 96 kHz.
    let animator = FixedAnimator::new(0, 48_000, 32, 8);
    let rig = rig(
        config,
        animator,
        vec![
            Track::new(1, "mem:fast", ""),
            Track::new(2, "mem:fine", ""),
        ],
    );
    rig.protocol.script("mem:fast").push_data(raw_pcm_track(
        96_000,
        16,
        2,
        &constant_payload(96_000, 200, 0x2222),
    ));
    rig.protocol.script("mem:fast").finish();
    let payload = constant_payload(44_100, 100, 0x1111);
    rig.protocol
        .script("mem:fine")
        .push_data(raw_pcm_track(44_100, 16, 2, &payload));
    rig.protocol.script("mem:fine").finish();

    rig.pipeline.start();
    rig.pipeline.begin("test", TRACK_ID_NONE);
    rig.pipeline.play();

    // Only the supported stream's audio comes out.
    let mut audio = Vec::new();
    loop {
        match rig.pipeline.pull() {
            Msg::Playable(playable) => {
                assert_eq!(playable.sample_rate(), 44_100);
                let mut collector = CollectingProcessor::default();
                playable.read(&mut collector);
                audio.extend_from_slice(&collector.bytes);
            }
            Msg::Halt(_) if !audio.is_empty() => break,
            _ => {}
        }
    }
    assert_eq!(audio, payload);

    rig.pipeline.quit();
    drain_to_quit(&rig);

    // The rejected stream never reached observers as audible.
    assert_eq!(*rig.recorder.tracks.lock().unwrap(), vec![2]);
}

#[test]
fn off_table_sample_rate_is_rejected_without_panic() {
    let mut config = test_config();
    config.decoded_reservoir_max_jiffies = jiffies::from_ms(2000);
    config.starvation_max_jiffies = jiffies::from_ms(2000);

    // 64 kHz decodes fine but is not a rate the pipeline clock divides;
    // the stream must be announced, rejected and skipped, never panicked
    // on.
    let rig = rig(
        config,
        FixedAnimator::default(),
        vec![
            Track::new(1, "mem:odd", ""),
            Track::new(2, "mem:fine", ""),
        ],
    );
    rig.protocol.script("mem:odd").push_data(raw_pcm_track(
        64_000,
        16,
        2,
        &constant_payload(48_000, 200, 0x2222),
    ));
    rig.protocol.script("mem:odd").finish();
    let payload = constant_payload(44_100, 100, 0x1111);
    rig.protocol
        .script("mem:fine")
        .push_data(raw_pcm_track(44_100, 16, 2, &payload));
    rig.protocol.script("mem:fine").finish();

    rig.pipeline.start();
    rig.pipeline.begin("test", TRACK_ID_NONE);
    rig.pipeline.play();

    let mut audio = Vec::new();
    loop {
        match rig.pipeline.pull() {
            Msg::Playable(playable) => {
                assert_eq!(playable.sample_rate(), 44_100);
                let mut collector = CollectingProcessor::default();
                playable.read(&mut collector);
                audio.extend_from_slice(&collector.bytes);
            }
            Msg::Halt(_) if !audio.is_empty() => break,
            _ => {}
        }
    }
    assert_eq!(audio, payload);

    rig.pipeline.quit();
    drain_to_quit(&rig);
    assert_eq!(*rig.recorder.tracks.lock().unwrap(), vec![2]);
}

#[test]
fn starvation_is_hidden_by_flywheel_ramp_and_recovers() {
    let mut config = test_config();
    config.starvation_max_jiffies = jiffies::from_ms(50);

    let rig = rig(
        config,
        FixedAnimator::default(),
        vec![Track::new(1, "mem:gap", "")],
    );
    let script = rig.protocol.script("mem:gap");
    script.push_data(raw_pcm_track(
        44_100,
        16,
        2,
        &constant_payload(44_100, 200, 0x3000),
    ));
    // No End yet: the protocol waits, simulating a stalled network.

    rig.pipeline.start();
    rig.pipeline.begin("test", TRACK_ID_NONE);
    rig.pipeline.play();

    // Drain until the flywheel output appears: synthesised audio is
    // 32-bit where the stream is 16-bit.
    loop {
        if let Msg::Playable(playable) = rig.pipeline.pull() {
            if playable.bit_depth() == 32 {
                assert_eq!(playable.jiffies(), jiffies::from_ms(20));
                break;
            }
        }
    }
    // The synthesised ramp is followed by a halt and a starving notice.
    loop {
        if matches!(rig.pipeline.pull(), Msg::Halt(_)) {
            break;
        }
    }
    eventually("starving notification", || {
        rig.protocol.starving_log.lock().unwrap().first() == Some(&true)
    });
    eventually("buffering state", || {
        rig.recorder
            .states
            .lock()
            .unwrap()
            .contains(&PipelineState::Buffering)
    });

    // The network recovers: audio resumes, ramping up from silence.
    script.push_data(constant_payload(44_100, 200, 0x3000));
    let first = loop {
        if let Msg::Playable(playable) = rig.pipeline.pull() {
            if playable.bit_depth() == 16 {
                break playable;
            }
        }
    };
    let mut collector = CollectingProcessor::default();
    first.read(&mut collector);
    let head = i16::from_be_bytes([collector.bytes[0], collector.bytes[1]]);
    assert!(
        head.unsigned_abs() < 0x3000,
        "post-starvation audio must ramp up from silence, started at {head:#06x}"
    );
    eventually("starving cleared", || {
        rig.protocol.starving_log.lock().unwrap().last() == Some(&false)
    });

    script.finish();
    rig.pipeline.quit();
    drain_to_quit(&rig);
}

#[test]
fn track_without_audio_is_pruned_from_observer_traffic() {
    let mut config = test_config();
    config.decoded_reservoir_max_jiffies = jiffies::from_ms(2000);
    config.starvation_max_jiffies = jiffies::from_ms(2000);

    let rig = rig(
        config,
        FixedAnimator::default(),
        vec![
            Track::new(1, "mem:junk", ""),
            Track::new(2, "mem:good", ""),
        ],
    );
    // Track 1 is not recognisable by any codec.
    rig.protocol
        .script("mem:junk")
        .push_data(b"JUNKJUNKJUNKJUNK".repeat(512));
    rig.protocol.script("mem:junk").finish();
    let payload = constant_payload(44_100, 100, 0x0777);
    rig.protocol
        .script("mem:good")
        .push_data(raw_pcm_track(44_100, 16, 2, &payload));
    rig.protocol.script("mem:good").finish();

    rig.pipeline.start();
    rig.pipeline.begin("test", TRACK_ID_NONE);
    rig.pipeline.play();

    let mut audio_bytes = 0usize;
    loop {
        match rig.pipeline.pull() {
            Msg::Playable(playable) => audio_bytes += playable.len(),
            Msg::Halt(_) if audio_bytes > 0 => break,
            _ => {}
        }
    }
    assert_eq!(audio_bytes, payload.len());

    rig.pipeline.quit();
    drain_to_quit(&rig);

    // The undecodable track never surfaced.
    assert_eq!(*rig.recorder.tracks.lock().unwrap(), vec![2]);
    let playing = rig
        .recorder
        .states
        .lock()
        .unwrap()
        .iter()
        .filter(|&&s| s == PipelineState::Playing)
        .count();
    assert_eq!(playing, 1);
}

#[derive(Default)]
struct CollectingProcessor {
    bytes: Vec<u8>,
}

impl sluice::msg::audio::PcmProcessor for CollectingProcessor {
    fn process_fragment8(&mut self, data: &[u8], _channels: u32) {
        self.bytes.extend_from_slice(data);
    }

    fn process_fragment16(&mut self, data: &[u8], _channels: u32) {
        self.bytes.extend_from_slice(data);
    }

    fn process_fragment24(&mut self, data: &[u8], _channels: u32) {
        self.bytes.extend_from_slice(data);
    }

    fn process_fragment32(&mut self, data: &[u8], _channels: u32) {
        self.bytes.extend_from_slice(data);
    }
}
