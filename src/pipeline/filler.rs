//! The track feeder at the head of the pipeline.
//!
//! The filler owns a thread that walks the active mode's URI provider and
//! asks the protocol manager to stream each track. It needs no pacing of
//! its own: protocol pushes block when the encoded reservoir is at
//! capacity. When a provider runs out of tracks the filler emits the null
//! track and a halt so the pipeline parks cleanly.

use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex},
    thread::{self, JoinHandle},
};

use crate::{
    msg::{ModeInfo, MsgFactory, Track, TRACK_ID_NONE},
    pipeline::ElementDownstream,
    protocol::{ProtocolManager, StreamResult},
};

/// One step through a URI provider.
pub enum Fetch {
    /// The next track to stream.
    Track(Track),
    /// The provider has nothing (more) to play.
    Finished,
}

/// Supplies tracks to the filler, one mode per provider.
pub trait UriProvider: Send {
    /// Mode name this provider serves.
    fn mode(&self) -> &str;

    /// Capabilities announced in the mode boundary.
    fn mode_info(&self) -> ModeInfo;

    /// Positions at `track_id` ([`TRACK_ID_NONE`] for the start) and
    /// returns that track.
    fn begin(&mut self, track_id: u32) -> Fetch;

    /// Advances to the following track.
    fn next(&mut self) -> Fetch;

    /// Steps back to the preceding track.
    fn prev(&mut self) -> Fetch;

    /// Id reported when nothing is playing.
    fn null_track_id(&self) -> u32 {
        TRACK_ID_NONE
    }
}

/// A fixed playlist provider over pre-built tracks.
pub struct ListUriProvider {
    mode: String,
    info: ModeInfo,
    tracks: Vec<Track>,
    position: usize,
}

impl ListUriProvider {
    #[must_use]
    pub fn new(mode: &str, info: ModeInfo, tracks: Vec<Track>) -> Self {
        Self {
            mode: mode.to_string(),
            info,
            tracks,
            position: 0,
        }
    }
}

impl UriProvider for ListUriProvider {
    fn mode(&self) -> &str {
        &self.mode
    }

    fn mode_info(&self) -> ModeInfo {
        self.info
    }

    fn begin(&mut self, track_id: u32) -> Fetch {
        self.position = if track_id == TRACK_ID_NONE {
            0
        } else {
            match self.tracks.iter().position(|t| t.id() == track_id) {
                Some(position) => position,
                None => return Fetch::Finished,
            }
        };
        match self.tracks.get(self.position) {
            Some(track) => Fetch::Track(track.clone()),
            None => Fetch::Finished,
        }
    }

    fn next(&mut self) -> Fetch {
        self.position += 1;
        match self.tracks.get(self.position) {
            Some(track) => Fetch::Track(track.clone()),
            None => Fetch::Finished,
        }
    }

    fn prev(&mut self) -> Fetch {
        if self.position == 0 {
            return Fetch::Finished;
        }
        self.position -= 1;
        match self.tracks.get(self.position) {
            Some(track) => Fetch::Track(track.clone()),
            None => Fetch::Finished,
        }
    }
}

enum Command {
    Play {
        mode: String,
        track_id: u32,
    },
    Next {
        mode: String,
    },
    Prev {
        mode: String,
    },
    Stop {
        halt_id: u32,
    },
    Quit,
}

#[derive(Default)]
struct CommandQueue {
    commands: VecDeque<Command>,
}

/// The filler element.
pub struct Filler {
    factory: MsgFactory,
    downstream: Arc<dyn ElementDownstream>,
    streamer: Arc<ProtocolManager>,
    providers: Mutex<Vec<Box<dyn UriProvider>>>,
    queue: Mutex<CommandQueue>,
    wake: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Filler {
    pub fn new(
        factory: MsgFactory,
        downstream: Arc<dyn ElementDownstream>,
        streamer: Arc<ProtocolManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            factory,
            downstream,
            streamer,
            providers: Mutex::new(Vec::new()),
            queue: Mutex::new(CommandQueue::default()),
            wake: Condvar::new(),
            thread: Mutex::new(None),
        })
    }

    /// Registers a URI provider for its mode.
    pub fn add(&self, provider: Box<dyn UriProvider>) {
        self.providers.lock().unwrap().push(provider);
    }

    /// The protocol manager this filler streams through.
    #[must_use]
    pub fn streamer(&self) -> Arc<ProtocolManager> {
        Arc::clone(&self.streamer)
    }

    /// Starts the filler thread.
    pub fn start(self: &Arc<Self>) {
        let filler = Arc::clone(self);
        let thread = thread::Builder::new()
            .name("filler".to_string())
            .spawn(move || filler.run())
            .expect("spawn filler thread");
        *self.thread.lock().unwrap() = Some(thread);
    }

    /// Begins playing `mode` from `track_id` ([`TRACK_ID_NONE`] for the
    /// provider's start).
    pub fn play(&self, mode: &str, track_id: u32) {
        self.submit(Command::Play {
            mode: mode.to_string(),
            track_id,
        });
    }

    /// Advances to the next track of `mode`.
    pub fn next(&self, mode: &str) {
        self.submit(Command::Next {
            mode: mode.to_string(),
        });
    }

    /// Steps back to the previous track of `mode`.
    pub fn prev(&self, mode: &str) {
        self.submit(Command::Prev {
            mode: mode.to_string(),
        });
    }

    /// Stops streaming. Returns the id of the halt that will follow the
    /// last of the stream's data downstream.
    pub fn stop(&self) -> u32 {
        let halt_id = self.factory.next_halt_id();
        self.streamer.interrupt(true);
        self.submit(Command::Stop { halt_id });
        halt_id
    }

    /// Shuts the filler down; a Quit message follows downstream.
    pub fn quit(&self) {
        self.streamer.interrupt(true);
        self.submit(Command::Quit);
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }

    /// Id reported when nothing is playing.
    #[must_use]
    pub fn null_track_id(&self) -> u32 {
        TRACK_ID_NONE
    }

    fn submit(&self, command: Command) {
        self.queue.lock().unwrap().commands.push_back(command);
        self.wake.notify_one();
    }

    fn wait_command(&self) -> Command {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(command) = queue.commands.pop_front() {
                return command;
            }
            queue = self.wake.wait(queue).unwrap();
        }
    }

    fn command_pending(&self) -> bool {
        !self.queue.lock().unwrap().commands.is_empty()
    }

    fn fetch<F>(&self, mode: &str, step: F) -> Option<Fetch>
    where
        F: for<'a> FnOnce(&'a mut dyn UriProvider) -> Fetch,
    {
        let mut providers = self.providers.lock().unwrap();
        match providers.iter_mut().find(|p| p.mode() == mode) {
            Some(provider) => Some(step(provider.as_mut())),
            None => {
                warn!("no uri provider for mode {mode}");
                None
            }
        }
    }

    fn mode_info(&self, mode: &str) -> Option<ModeInfo> {
        let providers = self.providers.lock().unwrap();
        providers
            .iter()
            .find(|p| p.mode() == mode)
            .map(|p| p.mode_info())
    }

    fn run(&self) {
        loop {
            match self.wait_command() {
                Command::Quit => {
                    self.downstream.push(self.factory.quit());
                    break;
                }
                Command::Stop { halt_id } => {
                    self.downstream.push(self.factory.halt_with_id(halt_id));
                }
                Command::Play { mode, track_id } => {
                    let Some(info) = self.mode_info(&mode) else {
                        continue;
                    };
                    self.streamer.interrupt(false);
                    self.downstream.push(self.factory.mode(&mode, info));
                    let fetch = self.fetch(&mode, |p| p.begin(track_id));
                    if let Some(fetch) = fetch {
                        self.stream_tracks(&mode, fetch);
                    }
                }
                Command::Next { mode } => {
                    self.streamer.interrupt(false);
                    if let Some(fetch) = self.fetch(&mode, |p| p.next()) {
                        self.stream_tracks(&mode, fetch);
                    }
                }
                Command::Prev { mode } => {
                    self.streamer.interrupt(false);
                    if let Some(fetch) = self.fetch(&mode, |p| p.prev()) {
                        self.stream_tracks(&mode, fetch);
                    }
                }
            }
        }
        debug!("filler exiting");
    }

    fn stream_tracks(&self, mode: &str, first: Fetch) {
        let mut fetch = first;
        loop {
            if self.command_pending() {
                return;
            }
            match fetch {
                Fetch::Finished => {
                    // Nothing (more) to play: park the pipeline cleanly.
                    self.downstream.push(self.factory.track(Track::null(), true));
                    self.downstream.push(self.factory.halt());
                    return;
                }
                Fetch::Track(track) => {
                    info!("filler streaming track {} ({})", track.id(), track.uri());
                    self.downstream.push(self.factory.track(track.clone(), true));
                    match self.streamer.do_stream(&track) {
                        // A stream-level stop (e.g. an unsupported format
                        // being cut short) just ends this track; a user
                        // stop additionally queues a command, which the
                        // check at the top of this loop honours.
                        StreamResult::Success | StreamResult::Stopped => {}
                        StreamResult::NotSupported
                        | StreamResult::RecoverableError
                        | StreamResult::UnrecoverableError => {
                            warn!("track {} failed to stream; advancing", track.id());
                        }
                    }
                }
            }
            match self.fetch(mode, |p| p.next()) {
                Some(next) => fetch = next,
                None => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        msg::{Msg, MsgQueue, PoolConfig},
        pipeline::{FlushIdProvider, IdProvider},
        protocol::{GetResult, Protocol, Supply},
        registry::{HandlerHandle, HandlerRegistry, StreamHandler, StreamPlay},
    };
    use url::Url;

    struct Sink(MsgQueue);

    impl ElementDownstream for Sink {
        fn push(&self, msg: Msg) {
            self.0.enqueue(msg);
        }
    }

    /// Streams one marker byte per URI without touching the filesystem.
    struct MarkerProtocol {
        supply: Mutex<Option<(Supply, HandlerHandle)>>,
    }

    impl Protocol for MarkerProtocol {
        fn initialise(&self, supply: Supply, handle: HandlerHandle) {
            *self.supply.lock().unwrap() = Some((supply, handle));
        }

        fn stream(&self, uri: &Url) -> StreamResult {
            if uri.scheme() != "test" {
                return StreamResult::NotSupported;
            }
            let (supply, handle) = self.supply.lock().unwrap().clone().unwrap();
            let stream_id = supply.ids.next_stream_id();
            supply.downstream.push(supply.factory.encoded_stream(
                uri.as_str(),
                "",
                1,
                stream_id,
                false,
                false,
                Some(handle),
            ));
            supply.downstream.push(supply.factory.audio_encoded(&[1]));
            StreamResult::Success
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

        fn interrupt(&self, _interrupt: bool) {}
    }

    impl StreamHandler for MarkerProtocol {
        fn ok_to_play(&self, _stream_id: u32) -> StreamPlay {
            StreamPlay::Yes
        }

        fn try_seek(&self, _stream_id: u32, _offset: u64) -> u32 {
            crate::msg::FLUSH_ID_INVALID
        }

        fn try_stop(&self, _stream_id: u32) -> u32 {
            crate::msg::FLUSH_ID_INVALID
        }

        fn notify_starving(&self, _mode: &str, _stream_id: u32, _starving: bool) {}
    }

    fn rig(tracks: Vec<Track>) -> (Arc<Sink>, Arc<Filler>) {
        let factory = MsgFactory::new(&PoolConfig::default());
        let sink = Arc::new(Sink(MsgQueue::new()));
        let manager = ProtocolManager::new(Supply {
            factory: factory.clone(),
            downstream: Arc::clone(&sink) as Arc<dyn ElementDownstream>,
            ids: Arc::new(IdProvider::new()),
            flush_ids: Arc::new(FlushIdProvider::new()),
            registry: Arc::new(HandlerRegistry::new()),
        });
        manager.add(Arc::new(MarkerProtocol {
            supply: Mutex::new(None),
        }));

        let filler = Filler::new(
            factory,
            Arc::clone(&sink) as Arc<dyn ElementDownstream>,
            manager,
        );
        filler.add(Box::new(ListUriProvider::new(
            "playlist",
            ModeInfo::default(),
            tracks,
        )));
        filler.start();
        (sink, filler)
    }

    #[test]
    fn plays_every_track_then_parks_with_null_track_and_halt() {
        let tracks = vec![
            Track::new(1, "test://a", ""),
            Track::new(2, "test://b", ""),
        ];
        let (sink, filler) = rig(tracks);
        filler.play("playlist", TRACK_ID_NONE);

        assert!(matches!(sink.0.dequeue(), Msg::Mode(_)));
        for expected in [1u32, 2] {
            let Msg::Track(track) = sink.0.dequeue() else {
                panic!("expected a track");
            };
            assert_eq!(track.track().id(), expected);
            assert!(matches!(sink.0.dequeue(), Msg::EncodedStream(_)));
            assert!(matches!(sink.0.dequeue(), Msg::AudioEncoded(_)));
        }

        let Msg::Track(null_track) = sink.0.dequeue() else {
            panic!("expected the null track");
        };
        assert_eq!(null_track.track().id(), TRACK_ID_NONE);
        assert!(matches!(sink.0.dequeue(), Msg::Halt(_)));

        filler.quit();
        assert!(matches!(sink.0.dequeue(), Msg::Quit(_)));
    }

    #[test]
    fn stop_emits_a_matching_halt() {
        let (sink, filler) = rig(vec![]);
        let halt_id = filler.stop();
        let Msg::Halt(halt) = sink.0.dequeue() else {
            panic!("expected a halt");
        };
        assert_eq!(halt.id(), halt_id);
        filler.quit();
    }

    #[test]
    fn begin_at_a_specific_track() {
        let tracks = vec![
            Track::new(1, "test://a", ""),
            Track::new(2, "test://b", ""),
        ];
        let (sink, filler) = rig(tracks);
        filler.play("playlist", 2);

        assert!(matches!(sink.0.dequeue(), Msg::Mode(_)));
        let Msg::Track(track) = sink.0.dequeue() else {
            panic!("expected a track");
        };
        assert_eq!(track.track().id(), 2);
        filler.quit();
    }
}
