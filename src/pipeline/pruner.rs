//! Suppresses events for tracks that never produced audio.
//!
//! Observers downstream of the pipeline report a track as playing when its
//! boundary messages arrive. A track whose stream failed to decode would
//! produce a spurious "playing" report, so the pruner buffers the boundary
//! run (Mode/Track/DecodedStream/metadata) of each new stream until its
//! first audio arrives. If the next track starts before any audio was
//! seen, the buffered run is discarded. Halts always pass: they mark real
//! silence at the sink regardless of what was pruned around them.

use std::{collections::VecDeque, sync::Mutex};

use std::sync::Arc;

use crate::{
    msg::{unexpected, Msg},
    pipeline::ElementUpstream,
};

struct State {
    /// Mode boundary held back until its context produces audio. Survives
    /// track-level discards; replaced by the next Mode.
    pending_mode: Option<Msg>,
    pending: VecDeque<Msg>,
    /// Deliverable messages released ahead of the one being returned.
    ready: VecDeque<Msg>,
    waiting_for_audio: bool,
}

impl State {
    /// Discards the pending run, keeping the halts it contains.
    fn discard_pending(&mut self) {
        for msg in self.pending.drain(..) {
            if matches!(msg, Msg::Halt(_)) {
                self.ready.push_back(msg);
            } else {
                trace!("pruner discarding {}", msg.kind());
            }
        }
    }

    /// Releases the pending mode and run in order.
    fn release_pending(&mut self) {
        if let Some(mode) = self.pending_mode.take() {
            self.ready.push_back(mode);
        }
        while let Some(msg) = self.pending.pop_front() {
            self.ready.push_back(msg);
        }
    }
}

/// The pruner element.
pub struct Pruner {
    upstream: Arc<dyn ElementUpstream>,
    state: Mutex<State>,
}

impl Pruner {
    pub fn new(upstream: Arc<dyn ElementUpstream>) -> Arc<Self> {
        Arc::new(Self {
            upstream,
            state: Mutex::new(State {
                pending_mode: None,
                pending: VecDeque::new(),
                ready: VecDeque::new(),
                waiting_for_audio: false,
            }),
        })
    }

    fn process(&self, msg: Msg, state: &mut State) {
        match msg {
            Msg::Mode(_) => {
                state.discard_pending();
                if state.pending_mode.take().is_some() {
                    trace!("pruner discarding unreported Mode");
                }
                state.pending_mode = Some(msg);
                state.waiting_for_audio = true;
            }
            Msg::Track(_) => {
                // A new track supersedes any inaudible run before it; the
                // pending mode stays, it belongs to this track too.
                state.discard_pending();
                state.pending.push_back(msg);
                state.waiting_for_audio = true;
            }
            Msg::DecodedStream(_) | Msg::MetaText(_) | Msg::BitRate(_) => {
                if state.waiting_for_audio {
                    state.pending.push_back(msg);
                } else {
                    state.ready.push_back(msg);
                }
            }
            Msg::Halt(_) => {
                // Halts mark real silence at the sink and must not wait on
                // audio that may never come; passing one ahead of a
                // buffered run is the one documented reorder here.
                state.ready.push_back(msg);
            }
            Msg::AudioPcm(_) | Msg::Silence(_) | Msg::Playable(_) => {
                state.waiting_for_audio = false;
                state.release_pending();
                state.ready.push_back(msg);
            }
            Msg::Quit(_) => {
                // Shutdown does not wait for audio: whatever is pending is
                // reported as-is.
                state.waiting_for_audio = false;
                state.release_pending();
                state.ready.push_back(msg);
            }
            Msg::Drain(_) | Msg::Delay(_) | Msg::StreamInterrupted(_) | Msg::Wait(_) => {
                state.ready.push_back(msg);
            }
            msg => unexpected("Pruner", &msg),
        }
    }
}

impl ElementUpstream for Pruner {
    fn pull(&self) -> Msg {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(msg) = state.ready.pop_front() {
                    return msg;
                }
            }
            let msg = self.upstream.pull();
            let mut state = self.state.lock().unwrap();
            self.process(msg, &mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{audio::Endian, MsgFactory, MsgQueue, PoolConfig, StreamInfo, Track};

    struct QueueUpstream(MsgQueue);

    impl ElementUpstream for QueueUpstream {
        fn pull(&self) -> Msg {
            self.0.dequeue()
        }
    }

    fn rig() -> (MsgFactory, Arc<QueueUpstream>, Arc<Pruner>) {
        let factory = MsgFactory::new(&PoolConfig::default());
        let upstream = Arc::new(QueueUpstream(MsgQueue::new()));
        let pruner = Pruner::new(Arc::clone(&upstream) as Arc<dyn ElementUpstream>);
        (factory, upstream, pruner)
    }

    fn enqueue_track(factory: &MsgFactory, upstream: &QueueUpstream, id: u32) {
        upstream
            .0
            .enqueue(factory.track(Track::new(id, "file:///x", ""), true));
        upstream.0.enqueue(factory.decoded_stream(StreamInfo {
            stream_id: id,
            bit_depth: 16,
            sample_rate: 44_100,
            channels: 2,
            ..StreamInfo::default()
        }));
    }

    fn enqueue_audio(factory: &MsgFactory, upstream: &QueueUpstream) {
        upstream
            .0
            .enqueue(factory.audio_pcm(&[0u8; 8], 2, 44_100, 16, Endian::Big, 0));
    }

    #[test]
    fn audible_track_is_released_in_order() {
        let (factory, upstream, pruner) = rig();
        enqueue_track(&factory, &upstream, 1);
        enqueue_audio(&factory, &upstream);

        assert!(matches!(pruner.pull(), Msg::Track(_)));
        assert!(matches!(pruner.pull(), Msg::DecodedStream(_)));
        assert!(matches!(pruner.pull(), Msg::AudioPcm(_)));
    }

    #[test]
    fn inaudible_track_is_discarded() {
        let (factory, upstream, pruner) = rig();
        // Track 1 never produces audio before track 2 begins.
        enqueue_track(&factory, &upstream, 1);
        enqueue_track(&factory, &upstream, 2);
        enqueue_audio(&factory, &upstream);

        let Msg::Track(track) = pruner.pull() else {
            panic!("expected a track");
        };
        assert_eq!(track.track().id(), 2);
        assert!(matches!(pruner.pull(), Msg::DecodedStream(_)));
        assert!(matches!(pruner.pull(), Msg::AudioPcm(_)));
    }

    #[test]
    fn halt_survives_the_discard() {
        let (factory, upstream, pruner) = rig();
        enqueue_track(&factory, &upstream, 1);
        upstream.0.enqueue(factory.halt_with_id(5));
        enqueue_track(&factory, &upstream, 2);
        enqueue_audio(&factory, &upstream);

        let Msg::Halt(halt) = pruner.pull() else {
            panic!("halt must pass even for a pruned track");
        };
        assert_eq!(halt.id(), 5);
        let Msg::Track(track) = pruner.pull() else {
            panic!("expected a track");
        };
        assert_eq!(track.track().id(), 2);
    }

    #[test]
    fn silence_unblocks_the_buffered_run() {
        let (factory, upstream, pruner) = rig();
        enqueue_track(&factory, &upstream, 1);
        upstream
            .0
            .enqueue(factory.silence(crate::jiffies::from_ms(10), 44_100, 16, 2));

        assert!(matches!(pruner.pull(), Msg::Track(_)));
        assert!(matches!(pruner.pull(), Msg::DecodedStream(_)));
        assert!(matches!(pruner.pull(), Msg::Silence(_)));
    }

    #[test]
    fn mode_survives_a_pruned_first_track() {
        let (factory, upstream, pruner) = rig();
        upstream
            .0
            .enqueue(factory.mode("radio", crate::msg::ModeInfo::default()));
        enqueue_track(&factory, &upstream, 1);
        enqueue_track(&factory, &upstream, 2);
        enqueue_audio(&factory, &upstream);

        assert!(matches!(pruner.pull(), Msg::Mode(_)));
        let Msg::Track(track) = pruner.pull() else {
            panic!("expected a track");
        };
        assert_eq!(track.track().id(), 2);
    }

    #[test]
    fn quit_does_not_wait_for_audio() {
        let (factory, upstream, pruner) = rig();
        enqueue_track(&factory, &upstream, 1);
        upstream.0.enqueue(factory.quit());

        assert!(matches!(pruner.pull(), Msg::Track(_)));
        assert!(matches!(pruner.pull(), Msg::DecodedStream(_)));
        assert!(matches!(pruner.pull(), Msg::Quit(_)));
    }
}
