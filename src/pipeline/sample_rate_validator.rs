//! Rejects streams the sink cannot play.
//!
//! For every `DecodedStream` the validator asks the animator whether the
//! sink accepts the stream's format. A rejected stream is stopped through
//! its own handler, and everything decoded for it is dropped until the
//! flush matching the stop arrives; the flush itself is consumed.

use std::sync::{Arc, Mutex};

use crate::{
    animator::Animator,
    msg::{unexpected, Msg, FLUSH_ID_INVALID},
    pipeline::ElementDownstream,
    registry::HandlerRegistry,
};

struct State {
    target_flush_id: u32,
    flushing: bool,
}

/// The sample-rate validator element.
pub struct SampleRateValidator {
    downstream: Arc<dyn ElementDownstream>,
    animator: Arc<dyn Animator>,
    registry: Arc<HandlerRegistry>,
    state: Mutex<State>,
}

impl SampleRateValidator {
    pub fn new(
        downstream: Arc<dyn ElementDownstream>,
        animator: Arc<dyn Animator>,
        registry: Arc<HandlerRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            downstream,
            animator,
            registry,
            state: Mutex::new(State {
                target_flush_id: FLUSH_ID_INVALID,
                flushing: false,
            }),
        })
    }

    fn process(&self, msg: Msg) -> Option<Msg> {
        match msg {
            Msg::Mode(_) | Msg::Track(_) => {
                self.state.lock().unwrap().flushing = false;
                Some(msg)
            }
            Msg::DecodedStream(stream) => {
                let info = stream.info();
                let accepted = self
                    .animator
                    .delay_jiffies(info.sample_rate, info.bit_depth, info.channels);
                match accepted {
                    Ok(_) => {
                        self.state.lock().unwrap().flushing = false;
                        Some(Msg::DecodedStream(stream))
                    }
                    Err(e) => {
                        warn!(
                            "sink rejected stream {} ({} Hz/{} bit/{} ch): {e}",
                            info.stream_id, info.sample_rate, info.bit_depth, info.channels
                        );
                        let handler = info
                            .handler
                            .and_then(|handle| self.registry.resolve(handle));
                        let stream_id = info.stream_id;
                        let mut target = FLUSH_ID_INVALID;
                        if let Some(handler) = handler {
                            // The id manager expects every stream to be
                            // answered; acknowledge before stopping.
                            let _ = handler.ok_to_play(stream_id);
                            target = handler.try_stop(stream_id);
                        }
                        let mut state = self.state.lock().unwrap();
                        state.flushing = true;
                        state.target_flush_id = target;
                        None
                    }
                }
            }
            Msg::Flush(flush) => {
                let mut state = self.state.lock().unwrap();
                if state.target_flush_id != FLUSH_ID_INVALID
                    && state.target_flush_id == flush.id()
                {
                    state.target_flush_id = FLUSH_ID_INVALID;
                    return None;
                }
                Some(Msg::Flush(flush))
            }
            Msg::MetaText(_) | Msg::AudioPcm(_) | Msg::Silence(_) | Msg::BitRate(_) => {
                self.process_flushable(msg)
            }
            Msg::Drain(_)
            | Msg::Delay(_)
            | Msg::EncodedStream(_)
            | Msg::StreamInterrupted(_)
            | Msg::Halt(_)
            | Msg::Wait(_)
            | Msg::Quit(_) => Some(msg),
            msg => unexpected("SampleRateValidator", &msg),
        }
    }

    fn process_flushable(&self, msg: Msg) -> Option<Msg> {
        if self.state.lock().unwrap().flushing {
            trace!("dropping {} from rejected stream", msg.kind());
            None
        } else {
            Some(msg)
        }
    }
}

impl ElementDownstream for SampleRateValidator {
    fn push(&self, msg: Msg) {
        if let Some(msg) = self.process(msg) {
            self.downstream.push(msg);
        }
    }
}
