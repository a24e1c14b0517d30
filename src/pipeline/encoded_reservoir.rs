//! Elastic buffer between the protocol producer and the codec consumer.
//!
//! The filler thread pushes encoded messages in; the codec-controller
//! thread pulls them out. The producer parks when the reservoir holds the
//! configured maximum of encoded bytes or concurrent streams; the consumer
//! unparks it. The message is enqueued *before* the capacity check so one
//! oversized message can never deadlock the link.
//!
//! The reservoir exposes the stream-handler interface downstream by
//! forwarding to the current stream's handler (taken from the most recent
//! `EncodedStream`), and serves seeks whose target byte offset is still in
//! the buffer locally: buffered data ahead of the target is discarded, a
//! fresh flush id is issued, and the wrapped handler is never consulted.

use std::sync::{Arc, Condvar, Mutex};

use crate::{
    msg::{Msg, MsgFactory, FLUSH_ID_INVALID, STREAM_ID_INVALID},
    pipeline::{reservoir::CountingQueue, ElementDownstream, ElementUpstream, FlushIdProvider},
    registry::{HandlerHandle, HandlerRegistry, StreamHandler, StreamPlay},
};

struct State {
    upstream_handler: Option<HandlerHandle>,
    stream_id: u32,
    /// Stream byte offset of the first buffered encoded byte.
    window_start: u64,
    /// Stream byte offset just past the last buffered encoded byte.
    window_end: u64,
    /// Cleared when a seek is forwarded upstream: the window no longer
    /// describes a contiguous run of the stream. The next `EncodedStream`
    /// restores it.
    window_valid: bool,
}

/// The encoded-side reservoir element.
pub struct EncodedReservoir {
    queue: CountingQueue,
    factory: MsgFactory,
    registry: Arc<HandlerRegistry>,
    flush_ids: Arc<FlushIdProvider>,
    max_bytes: usize,
    max_streams: usize,
    state: Mutex<State>,
    space: Condvar,
    handle: Mutex<Option<HandlerHandle>>,
}

impl EncodedReservoir {
    /// Creates the reservoir and registers it as a stream handler.
    pub fn new(
        factory: MsgFactory,
        registry: Arc<HandlerRegistry>,
        flush_ids: Arc<FlushIdProvider>,
        max_bytes: usize,
        max_streams: usize,
    ) -> Arc<Self> {
        let reservoir = Arc::new(Self {
            queue: CountingQueue::new(),
            factory,
            registry: Arc::clone(&registry),
            flush_ids,
            max_bytes,
            max_streams,
            state: Mutex::new(State {
                upstream_handler: None,
                stream_id: STREAM_ID_INVALID,
                window_start: 0,
                window_end: 0,
                window_valid: false,
            }),
            space: Condvar::new(),
            handle: Mutex::new(None),
        });
        let handler: Arc<dyn StreamHandler> = Arc::clone(&reservoir) as Arc<dyn StreamHandler>;
        *reservoir.handle.lock().unwrap() = Some(registry.register(&handler));
        reservoir
    }

    /// Buffered encoded byte count, for telemetry.
    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.queue.encoded_bytes()
    }

    fn own_handle(&self) -> Option<HandlerHandle> {
        *self.handle.lock().unwrap()
    }

    fn current_handler(&self) -> Option<(Arc<dyn StreamHandler>, u32)> {
        let (handle, stream_id) = {
            let state = self.state.lock().unwrap();
            (state.upstream_handler, state.stream_id)
        };
        let handle = handle?;
        match self.registry.resolve(handle) {
            Some(handler) => Some((handler, stream_id)),
            None => {
                warn!("encoded reservoir: stream handler is stale");
                None
            }
        }
    }

    fn is_full(&self) -> bool {
        self.queue.encoded_bytes() >= self.max_bytes
            || self.queue.encoded_streams() >= self.max_streams
    }
}

impl ElementDownstream for EncodedReservoir {
    fn push(&self, mut msg: Msg) {
        {
            let mut state = self.state.lock().unwrap();
            match &mut msg {
                Msg::EncodedStream(stream) => {
                    state.upstream_handler = stream.handler;
                    state.stream_id = stream.stream_id;
                    state.window_start = 0;
                    state.window_end = 0;
                    state.window_valid = true;
                    stream.handler = self.own_handle();
                }
                Msg::AudioEncoded(audio) => {
                    state.window_end += audio.len() as u64;
                }
                _ => {}
            }
        }

        let quit = matches!(msg, Msg::Quit(_));
        self.queue.enqueue(msg);
        if quit {
            return;
        }

        let mut state = self.state.lock().unwrap();
        while self.is_full() {
            state = self.space.wait(state).unwrap();
        }
    }
}

impl ElementUpstream for EncodedReservoir {
    fn pull(&self) -> Msg {
        let msg = self.queue.dequeue();
        // Notify under the state lock so a producer between its capacity
        // check and its wait cannot miss the wakeup.
        let mut state = self.state.lock().unwrap();
        if let Msg::AudioEncoded(audio) = &msg {
            state.window_start += audio.len() as u64;
        }
        self.space.notify_one();
        drop(state);
        msg
    }
}

impl StreamHandler for EncodedReservoir {
    fn ok_to_play(&self, stream_id: u32) -> StreamPlay {
        match self.current_handler() {
            Some((handler, _)) => handler.ok_to_play(stream_id),
            None => StreamPlay::No,
        }
    }

    fn try_seek(&self, stream_id: u32, offset: u64) -> u32 {
        let serve_locally = {
            let state = self.state.lock().unwrap();
            state.window_valid
                && state.stream_id == stream_id
                && self.queue.encoded_streams() == 0
                && offset >= state.window_start
                && offset < state.window_end
        };

        if serve_locally {
            let flush_id = self.flush_ids.next_flush_id();
            let mut state = self.state.lock().unwrap();
            // Re-check under the lock: the consumer may have advanced the
            // window while the flush id was issued.
            if state.window_valid && offset >= state.window_start && offset < state.window_end {
                let skip = usize::try_from(offset - state.window_start).unwrap();
                self.queue.discard_encoded(skip);
                state.window_start = offset;
                self.queue.enqueue_at_head(self.factory.flush(flush_id));
                self.space.notify_one();
                drop(state);
                debug!("encoded reservoir served seek to {offset} from buffer");
                return flush_id;
            }
            drop(state);
        }

        // Outside the buffered window: the wrapped handler (ultimately the
        // protocol) replays the stream from the target offset.
        match self.current_handler() {
            Some((handler, _)) => {
                let flush_id = handler.try_seek(stream_id, offset);
                if flush_id != FLUSH_ID_INVALID {
                    self.state.lock().unwrap().window_valid = false;
                }
                flush_id
            }
            None => FLUSH_ID_INVALID,
        }
    }

    fn try_stop(&self, stream_id: u32) -> u32 {
        match self.current_handler() {
            Some((handler, _)) => handler.try_stop(stream_id),
            None => FLUSH_ID_INVALID,
        }
    }

    fn notify_starving(&self, mode: &str, stream_id: u32, starving: bool) {
        if let Some((handler, _)) = self.current_handler() {
            handler.notify_starving(mode, stream_id, starving);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{MsgFactory, PoolConfig};
    use std::thread;
    use std::time::Duration;

    fn reservoir(max_bytes: usize) -> Arc<EncodedReservoir> {
        let factory = MsgFactory::new(&PoolConfig::default());
        EncodedReservoir::new(
            factory,
            Arc::new(HandlerRegistry::new()),
            Arc::new(FlushIdProvider::new()),
            max_bytes,
            4,
        )
    }

    fn push_stream(reservoir: &EncodedReservoir, stream_id: u32) {
        let factory = MsgFactory::new(&PoolConfig::default());
        reservoir.push(factory.encoded_stream("file:///x", "", 0, stream_id, true, false, None));
    }

    #[test]
    fn messages_flow_through_in_order() {
        let reservoir = reservoir(1 << 20);
        let factory = MsgFactory::new(&PoolConfig::default());
        push_stream(&reservoir, 1);
        reservoir.push(factory.audio_encoded(&[1u8; 10]));

        assert!(matches!(reservoir.pull(), Msg::EncodedStream(_)));
        assert!(matches!(reservoir.pull(), Msg::AudioEncoded(_)));
    }

    #[test]
    fn producer_blocks_at_byte_ceiling() {
        let reservoir = reservoir(100);
        push_stream(&reservoir, 1);

        // The push is accepted (enqueue happens first) but the producer
        // then parks at the ceiling.
        let writer = {
            let reservoir = Arc::clone(&reservoir);
            thread::spawn(move || {
                let factory = MsgFactory::new(&PoolConfig::default());
                reservoir.push(factory.audio_encoded(&[0u8; 100]));
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!writer.is_finished());

        // Consuming makes space and unparks the producer.
        let _ = reservoir.pull();
        let _ = reservoir.pull();
        writer.join().unwrap();
    }

    #[test]
    fn buffered_seek_discards_and_flushes_without_upstream() {
        let reservoir = reservoir(1 << 20);
        let factory = MsgFactory::new(&PoolConfig::default());
        push_stream(&reservoir, 7);
        // Three 1 KiB messages stand in for the buffered stream.
        for fill in [1u8, 2, 3] {
            reservoir.push(factory.audio_encoded(&[fill; 1024]));
        }
        let _ = reservoir.pull(); // consume the EncodedStream boundary

        let flush_id = reservoir.try_seek(7, 512);
        assert_ne!(flush_id, FLUSH_ID_INVALID);

        let Msg::Flush(flush) = reservoir.pull() else {
            panic!("expected flush after buffered seek");
        };
        assert_eq!(flush.id(), flush_id);

        // The next audio pulled covers the seek offset.
        let Msg::AudioEncoded(audio) = reservoir.pull() else {
            panic!("expected audio");
        };
        assert_eq!(audio.len(), 512);
        let mut out = [0u8; 1];
        audio.copy_to(0, &mut out);
        assert_eq!(out[0], 1);
    }

    #[test]
    fn seek_outside_window_reports_invalid_without_handler() {
        let reservoir = reservoir(1 << 20);
        let factory = MsgFactory::new(&PoolConfig::default());
        push_stream(&reservoir, 7);
        reservoir.push(factory.audio_encoded(&[0u8; 100]));
        assert_eq!(reservoir.try_seek(7, 5000), FLUSH_ID_INVALID);
    }
}
