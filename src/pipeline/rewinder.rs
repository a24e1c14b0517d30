//! Replay buffer for codec format recognition.
//!
//! While a stream's format is being recognised, every message from its
//! `EncodedStream` boundary onwards is cloned into a pending queue. If the
//! selected codec turns out to be wrong (it declines mid-recognition), the
//! codec controller calls [`Rewinder::rewind`] and pulls the stream again
//! from the boundary; once a codec has committed to the stream it calls
//! [`Rewinder::stop`] and the history is dropped.
//!
//! Cloning an encoded-audio message shares the underlying byte buffers; no
//! sample data is copied.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use crate::{
    msg::{unexpected, Msg, MsgFactory, FLUSH_ID_INVALID},
    pipeline::ElementUpstream,
    registry::{HandlerHandle, HandlerRegistry, StreamHandler, StreamPlay},
};

struct Inner {
    current: VecDeque<Msg>,
    next: VecDeque<Msg>,
    /// Number of streams whose history is being retained. Zero means
    /// buffering is off and messages pass straight through.
    buffering: u32,
    upstream_handler: Option<HandlerHandle>,
}

/// The rewinder element.
pub struct Rewinder {
    factory: MsgFactory,
    upstream: Arc<dyn ElementUpstream>,
    registry: Arc<HandlerRegistry>,
    inner: Mutex<Inner>,
    handle: Mutex<Option<HandlerHandle>>,
}

impl Rewinder {
    /// Creates the rewinder and registers it as a stream handler.
    pub fn new(
        factory: MsgFactory,
        upstream: Arc<dyn ElementUpstream>,
        registry: Arc<HandlerRegistry>,
    ) -> Arc<Self> {
        let rewinder = Arc::new(Self {
            factory,
            upstream,
            registry: Arc::clone(&registry),
            inner: Mutex::new(Inner {
                current: VecDeque::new(),
                next: VecDeque::new(),
                buffering: 0,
                upstream_handler: None,
            }),
            handle: Mutex::new(None),
        });
        let handler: Arc<dyn StreamHandler> = Arc::clone(&rewinder) as Arc<dyn StreamHandler>;
        *rewinder.handle.lock().unwrap() = Some(registry.register(&handler));
        rewinder
    }

    /// Replays the buffered history: the next pulls re-deliver everything
    /// seen since the current stream's boundary.
    ///
    /// # Panics
    ///
    /// Panics when no stream history is being retained.
    pub fn rewind(&self) {
        let mut inner = self.inner.lock().unwrap();
        assert!(inner.buffering > 0, "rewind without a buffered stream");
        while let Some(msg) = inner.current.pop_front() {
            inner.next.push_back(msg);
        }
        let inner = &mut *inner;
        std::mem::swap(&mut inner.current, &mut inner.next);
    }

    /// Drops the retained history; the active codec has committed to the
    /// stream.
    ///
    /// # Panics
    ///
    /// Panics when no stream history is being retained.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        assert!(inner.buffering > 0, "stop without a buffered stream");
        inner.next.clear();
        inner.buffering -= 1;
    }

    fn try_buffer(inner: &mut Inner, factory: &MsgFactory, msg: &Msg) {
        if inner.buffering == 0 {
            return;
        }
        let copy = match msg {
            Msg::Track(track) => factory.track(track.track().clone(), track.start_of_stream()),
            Msg::EncodedStream(stream) => factory.encoded_stream(
                &stream.uri,
                &stream.metatext,
                stream.total_bytes,
                stream.stream_id,
                stream.seekable,
                stream.live,
                stream.handler,
            ),
            Msg::AudioEncoded(audio) => Msg::AudioEncoded(audio.clone_window()),
            // Nothing else is replayed: boundary markers must not be seen
            // twice downstream.
            _ => return,
        };
        inner.next.push_back(copy);
    }

    fn process(&self, mut msg: Msg) -> Msg {
        let mut inner = self.inner.lock().unwrap();
        if let Msg::EncodedStream(stream) = &mut msg {
            inner.upstream_handler = stream.handler;
            stream.handler = *self.handle.lock().unwrap();
            inner.buffering += 1;
        }
        match &msg {
            Msg::Track(_) | Msg::EncodedStream(_) | Msg::AudioEncoded(_) => {
                Self::try_buffer(&mut inner, &self.factory, &msg);
            }
            Msg::Mode(_)
            | Msg::Drain(_)
            | Msg::Delay(_)
            | Msg::MetaText(_)
            | Msg::StreamInterrupted(_)
            | Msg::Halt(_)
            | Msg::Flush(_)
            | Msg::Wait(_)
            | Msg::Quit(_) => {}
            _ => unexpected("Rewinder", &msg),
        }
        msg
    }
}

impl ElementUpstream for Rewinder {
    fn pull(&self) -> Msg {
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(msg) = inner.current.pop_front() {
                // Replayed messages go back into the pending history in
                // case a further rewind is needed.
                Self::try_buffer(&mut inner, &self.factory, &msg);
                return msg;
            }
        }
        let msg = self.upstream.pull();
        self.process(msg)
    }
}

impl StreamHandler for Rewinder {
    fn ok_to_play(&self, stream_id: u32) -> StreamPlay {
        match self.resolve_upstream() {
            Some(handler) => handler.ok_to_play(stream_id),
            None => StreamPlay::No,
        }
    }

    fn try_seek(&self, stream_id: u32, offset: u64) -> u32 {
        self.resolve_upstream()
            .map_or(FLUSH_ID_INVALID, |handler| {
                handler.try_seek(stream_id, offset)
            })
    }

    fn try_stop(&self, stream_id: u32) -> u32 {
        self.resolve_upstream()
            .map_or(FLUSH_ID_INVALID, |handler| handler.try_stop(stream_id))
    }

    fn notify_starving(&self, mode: &str, stream_id: u32, starving: bool) {
        if let Some(handler) = self.resolve_upstream() {
            handler.notify_starving(mode, stream_id, starving);
        }
    }
}

impl Rewinder {
    fn resolve_upstream(&self) -> Option<Arc<dyn StreamHandler>> {
        let handle = self.inner.lock().unwrap().upstream_handler?;
        match self.registry.resolve(handle) {
            Some(handler) => Some(handler),
            None => {
                warn!("rewinder: stream handler is stale");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{MsgFactory, MsgQueue, PoolConfig};

    struct QueueUpstream(MsgQueue);

    impl ElementUpstream for QueueUpstream {
        fn pull(&self) -> Msg {
            self.0.dequeue()
        }
    }

    fn rig() -> (MsgFactory, Arc<QueueUpstream>, Arc<Rewinder>) {
        let factory = MsgFactory::new(&PoolConfig::default());
        let upstream = Arc::new(QueueUpstream(MsgQueue::new()));
        let rewinder = Rewinder::new(
            factory.clone(),
            Arc::clone(&upstream) as Arc<dyn ElementUpstream>,
            Arc::new(HandlerRegistry::new()),
        );
        (factory, upstream, rewinder)
    }

    fn expect_audio_bytes(msg: &Msg, expected: u8) {
        let Msg::AudioEncoded(audio) = msg else {
            panic!("expected audio, got {}", msg.kind());
        };
        let mut out = [0u8; 1];
        audio.copy_to(0, &mut out);
        assert_eq!(out[0], expected);
    }

    #[test]
    fn rewind_replays_from_stream_boundary() {
        let (factory, upstream, rewinder) = rig();
        upstream
            .0
            .enqueue(factory.encoded_stream("file:///x", "", 0, 1, true, false, None));
        upstream.0.enqueue(factory.audio_encoded(&[10u8; 4]));
        upstream.0.enqueue(factory.audio_encoded(&[20u8; 4]));

        assert!(matches!(rewinder.pull(), Msg::EncodedStream(_)));
        expect_audio_bytes(&rewinder.pull(), 10);
        expect_audio_bytes(&rewinder.pull(), 20);

        rewinder.rewind();
        assert!(matches!(rewinder.pull(), Msg::EncodedStream(_)));
        expect_audio_bytes(&rewinder.pull(), 10);
        expect_audio_bytes(&rewinder.pull(), 20);
    }

    #[test]
    fn stop_drops_history_and_passes_through() {
        let (factory, upstream, rewinder) = rig();
        upstream
            .0
            .enqueue(factory.encoded_stream("file:///x", "", 0, 1, true, false, None));
        upstream.0.enqueue(factory.audio_encoded(&[10u8; 4]));
        upstream.0.enqueue(factory.audio_encoded(&[20u8; 4]));

        assert!(matches!(rewinder.pull(), Msg::EncodedStream(_)));
        expect_audio_bytes(&rewinder.pull(), 10);
        rewinder.stop();

        // History gone: the next pull continues with fresh messages.
        expect_audio_bytes(&rewinder.pull(), 20);
    }

    #[test]
    fn non_buffered_messages_are_not_replayed() {
        let (factory, upstream, rewinder) = rig();
        upstream
            .0
            .enqueue(factory.encoded_stream("file:///x", "", 0, 1, true, false, None));
        upstream.0.enqueue(factory.meta_text("live text"));
        upstream.0.enqueue(factory.audio_encoded(&[10u8; 4]));

        assert!(matches!(rewinder.pull(), Msg::EncodedStream(_)));
        assert!(matches!(rewinder.pull(), Msg::MetaText(_)));
        expect_audio_bytes(&rewinder.pull(), 10);

        rewinder.rewind();
        assert!(matches!(rewinder.pull(), Msg::EncodedStream(_)));
        // The metatext was delivered once and is gone from the replay.
        expect_audio_bytes(&rewinder.pull(), 10);
    }

    #[test]
    fn handler_is_replaced_with_rewinder() {
        let (factory, upstream, rewinder) = rig();
        upstream
            .0
            .enqueue(factory.encoded_stream("file:///x", "", 0, 1, true, false, None));
        let Msg::EncodedStream(stream) = rewinder.pull() else {
            panic!("expected stream");
        };
        assert!(stream.handler.is_some());
    }
}
