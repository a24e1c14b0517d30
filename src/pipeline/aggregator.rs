//! Coalesces small decoded fragments into full-size audio messages.
//!
//! Codecs emit PCM in whatever granularity their frames dictate; the
//! aggregator combines consecutive fragments up to a byte ceiling or a
//! jiffy ceiling, whichever is reached first. Any non-audio message
//! flushes the accumulator downstream first, so boundaries never overtake
//! audio. While a seek is in flight (an expected flush id is set), audio
//! and metadata are dropped until the awaited flush arrives.

use std::sync::{Arc, Mutex};

use crate::{
    jiffies,
    msg::{pool::Pooled, unexpected, Msg, MsgAudioPcm, MsgFactory, FLUSH_ID_INVALID},
    pipeline::ElementDownstream,
    registry::{HandlerHandle, HandlerRegistry, StreamHandler, StreamPlay},
};

struct State {
    accumulator: Option<Pooled<MsgAudioPcm>>,
    upstream_handler: Option<HandlerHandle>,
    stream_id: u32,
    channels: u32,
    sample_rate: u32,
    bit_depth: u32,
    expected_flush_id: u32,
}

/// The decoded-audio aggregator element.
pub struct DecodedAudioAggregator {
    downstream: Arc<dyn ElementDownstream>,
    factory: MsgFactory,
    registry: Arc<HandlerRegistry>,
    max_bytes: usize,
    max_jiffies: u64,
    state: Mutex<State>,
    handle: Mutex<Option<HandlerHandle>>,
}

impl DecodedAudioAggregator {
    /// Creates the aggregator and registers it as a stream handler.
    pub fn new(
        downstream: Arc<dyn ElementDownstream>,
        factory: MsgFactory,
        registry: Arc<HandlerRegistry>,
        max_bytes: usize,
        max_jiffies: u64,
    ) -> Arc<Self> {
        let aggregator = Arc::new(Self {
            downstream,
            factory,
            registry: Arc::clone(&registry),
            max_bytes,
            max_jiffies,
            state: Mutex::new(State {
                accumulator: None,
                upstream_handler: None,
                stream_id: crate::msg::STREAM_ID_INVALID,
                channels: 0,
                sample_rate: 0,
                bit_depth: 0,
                expected_flush_id: FLUSH_ID_INVALID,
            }),
            handle: Mutex::new(None),
        });
        let handler: Arc<dyn StreamHandler> = Arc::clone(&aggregator) as Arc<dyn StreamHandler>;
        *aggregator.handle.lock().unwrap() = Some(registry.register(&handler));
        aggregator
    }

    fn aggregator_full(&self, bytes: usize, audio_jiffies: u64) -> bool {
        bytes >= self.max_bytes || audio_jiffies >= self.max_jiffies
    }

    fn msg_bytes(state: &State, msg_jiffies: u64) -> usize {
        let mut msg_jiffies = msg_jiffies;
        jiffies::bytes_from(
            &mut msg_jiffies,
            jiffies::per_sample(state.sample_rate),
            state.channels,
            state.bit_depth / 8,
        )
    }

    /// Flushes the accumulator downstream ahead of a boundary message.
    fn output_aggregated_audio(&self) {
        let pending = self.state.lock().unwrap().accumulator.take();
        if let Some(pending) = pending {
            self.downstream.push(Msg::AudioPcm(pending));
        }
    }

    fn try_aggregate(&self, msg: Pooled<MsgAudioPcm>) -> Option<Pooled<MsgAudioPcm>> {
        // Only the byte capacity decides whether to buffer: there is no
        // point chopping on the jiffy limit when the byte room exists to
        // push everything out together.
        let mut state = self.state.lock().unwrap();
        let msg_bytes = Self::msg_bytes(&state, msg.jiffies());

        let Some(mut accumulated) = state.accumulator.take() else {
            if self.aggregator_full(msg_bytes, msg.jiffies()) {
                return Some(msg);
            }
            state.accumulator = Some(msg);
            return None;
        };

        let accumulated_bytes = Self::msg_bytes(&state, accumulated.jiffies());
        if accumulated_bytes + msg_bytes <= self.max_bytes && accumulated.try_aggregate(&msg) {
            let combined_bytes = Self::msg_bytes(&state, accumulated.jiffies());
            if self.aggregator_full(combined_bytes, accumulated.jiffies()) {
                return Some(accumulated);
            }
            state.accumulator = Some(accumulated);
            return None;
        }

        // No room (or the backing cell is shared): emit what we have and
        // start accumulating from the new fragment.
        state.accumulator = Some(msg);
        Some(accumulated)
    }

    fn process(&self, msg: Msg) -> Option<Msg> {
        match msg {
            Msg::Mode(_)
            | Msg::Track(_)
            | Msg::Drain(_)
            | Msg::Delay(_)
            | Msg::StreamInterrupted(_)
            | Msg::Halt(_)
            | Msg::Wait(_)
            | Msg::Quit(_) => {
                self.output_aggregated_audio();
                Some(msg)
            }
            Msg::EncodedStream(mut stream) => {
                self.output_aggregated_audio();
                let mut state = self.state.lock().unwrap();
                state.stream_id = stream.stream_id;
                state.upstream_handler = stream.handler;
                stream.handler = *self.handle.lock().unwrap();
                Some(Msg::EncodedStream(stream))
            }
            Msg::MetaText(_) => {
                let state = self.state.lock().unwrap();
                if state.expected_flush_id != FLUSH_ID_INVALID {
                    return None;
                }
                drop(state);
                Some(msg)
            }
            Msg::Flush(flush) => {
                let mut state = self.state.lock().unwrap();
                state.accumulator = None;
                if state.expected_flush_id == flush.id() {
                    state.expected_flush_id = FLUSH_ID_INVALID;
                }
                Some(Msg::Flush(flush))
            }
            Msg::DecodedStream(stream) => {
                let mut state = self.state.lock().unwrap();
                // Buffered audio here means an upstream discard this
                // element was not told about; drop it rather than emit
                // stale samples into the new stream.
                if state.accumulator.take().is_some() {
                    debug!("aggregator dropped stale audio at stream boundary");
                }
                let info = stream.info();
                state.channels = info.channels;
                state.sample_rate = info.sample_rate;
                state.bit_depth = info.bit_depth;
                Some(Msg::DecodedStream(stream))
            }
            Msg::BitRate(_) => Some(msg),
            Msg::AudioPcm(audio) => {
                {
                    let state = self.state.lock().unwrap();
                    if state.expected_flush_id != FLUSH_ID_INVALID {
                        return None;
                    }
                }
                self.try_aggregate(audio).map(Msg::AudioPcm)
            }
            msg => unexpected("DecodedAudioAggregator", &msg),
        }
    }
}

impl ElementDownstream for DecodedAudioAggregator {
    fn push(&self, msg: Msg) {
        if let Some(msg) = self.process(msg) {
            self.downstream.push(msg);
        }
    }
}

impl StreamHandler for DecodedAudioAggregator {
    fn ok_to_play(&self, stream_id: u32) -> StreamPlay {
        let handle = self.state.lock().unwrap().upstream_handler;
        // The lock is dropped before calling out: the handler may be
        // pushing into this element on another thread.
        match handle.and_then(|handle| self.registry.resolve(handle)) {
            Some(handler) => handler.ok_to_play(stream_id),
            None => StreamPlay::No,
        }
    }

    fn try_seek(&self, _stream_id: u32, _offset: u64) -> u32 {
        // Seek requests run from the seeker straight to the codec
        // controller, bypassing this element.
        unreachable!("seek requests do not route through the aggregator");
    }

    fn try_stop(&self, stream_id: u32) -> u32 {
        let handle = self.state.lock().unwrap().upstream_handler;
        let flush_id = handle
            .and_then(|handle| self.registry.resolve(handle))
            .map_or(FLUSH_ID_INVALID, |handler| handler.try_stop(stream_id));
        self.state.lock().unwrap().expected_flush_id = flush_id;
        flush_id
    }

    fn notify_starving(&self, mode: &str, stream_id: u32, starving: bool) {
        let handle = self.state.lock().unwrap().upstream_handler;
        if let Some(handler) = handle.and_then(|handle| self.registry.resolve(handle)) {
            handler.notify_starving(mode, stream_id, starving);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{audio::Endian, MsgQueue, PoolConfig, StreamInfo};

    struct Sink(MsgQueue);

    impl ElementDownstream for Sink {
        fn push(&self, msg: Msg) {
            self.0.enqueue(msg);
        }
    }

    fn rig(max_bytes: usize, max_ms: u64) -> (MsgFactory, Arc<Sink>, Arc<DecodedAudioAggregator>) {
        let factory = MsgFactory::new(&PoolConfig::default());
        let sink = Arc::new(Sink(MsgQueue::new()));
        let aggregator = DecodedAudioAggregator::new(
            Arc::clone(&sink) as Arc<dyn ElementDownstream>,
            factory.clone(),
            Arc::new(HandlerRegistry::new()),
            max_bytes,
            jiffies::from_ms(max_ms),
        );
        (factory, sink, aggregator)
    }

    fn stream_msg(factory: &MsgFactory) -> Msg {
        factory.decoded_stream(StreamInfo {
            stream_id: 1,
            bit_depth: 16,
            sample_rate: 44_100,
            channels: 2,
            codec_name: "test".to_string(),
            ..StreamInfo::default()
        })
    }

    fn pcm_ms(factory: &MsgFactory, ms: usize) -> Msg {
        let samples = 44_100 * ms / 1000;
        factory.audio_pcm(&vec![1u8; samples * 4], 2, 44_100, 16, Endian::Big, 0)
    }

    #[test]
    fn fragments_coalesce_until_jiffy_ceiling() {
        let (factory, sink, aggregator) = rig(1 << 20, 20);
        aggregator.push(stream_msg(&factory));
        let _ = sink.0.dequeue();

        // Two 10 ms fragments reach the 20 ms ceiling exactly.
        for _ in 0..2 {
            aggregator.push(pcm_ms(&factory, 10));
        }
        let Msg::AudioPcm(audio) = sink.0.dequeue() else {
            panic!("expected aggregated audio");
        };
        assert_eq!(jiffies::to_ms(audio.jiffies()), 20);
        assert!(sink.0.is_empty());
    }

    #[test]
    fn boundary_message_flushes_partial_audio() {
        let (factory, sink, aggregator) = rig(1 << 20, 100);
        aggregator.push(stream_msg(&factory));
        let _ = sink.0.dequeue();

        aggregator.push(pcm_ms(&factory, 5));
        assert!(sink.0.is_empty());
        aggregator.push(factory.halt_with_id(9));

        assert!(matches!(sink.0.dequeue(), Msg::AudioPcm(_)));
        assert!(matches!(sink.0.dequeue(), Msg::Halt(_)));
    }

    #[test]
    fn aggregated_samples_equal_original_sequence() {
        let (factory, sink, aggregator) = rig(1 << 20, 1000);
        aggregator.push(stream_msg(&factory));
        let _ = sink.0.dequeue();

        let mut expected_samples = 0;
        for n in 1..=10usize {
            let samples = n * 3;
            expected_samples += samples;
            aggregator.push(factory.audio_pcm(
                &vec![7u8; samples * 4],
                2,
                44_100,
                16,
                Endian::Big,
                0,
            ));
        }
        aggregator.push(factory.halt_with_id(1));

        let Msg::AudioPcm(audio) = sink.0.dequeue() else {
            panic!("expected aggregated audio");
        };
        assert_eq!(audio.sample_count(), expected_samples);
    }

    #[test]
    fn oversize_fragment_passes_straight_through() {
        let (factory, sink, aggregator) = rig(1 << 20, 10);
        aggregator.push(stream_msg(&factory));
        let _ = sink.0.dequeue();

        aggregator.push(pcm_ms(&factory, 20));
        let Msg::AudioPcm(audio) = sink.0.dequeue() else {
            panic!("expected audio");
        };
        assert_eq!(jiffies::to_ms(audio.jiffies()), 20);
    }

    #[test]
    fn seek_in_flight_drops_audio_until_flush() {
        let (factory, sink, aggregator) = rig(1 << 20, 1000);
        aggregator.push(stream_msg(&factory));
        let _ = sink.0.dequeue();

        aggregator.state.lock().unwrap().expected_flush_id = 5;
        aggregator.push(pcm_ms(&factory, 5));
        aggregator.push(factory.meta_text("dropped"));
        assert!(sink.0.is_empty());

        aggregator.push(factory.flush(5));
        assert!(matches!(sink.0.dequeue(), Msg::Flush(_)));

        aggregator.push(pcm_ms(&factory, 5));
        aggregator.push(factory.halt_with_id(2));
        assert!(matches!(sink.0.dequeue(), Msg::AudioPcm(_)));
    }
}
