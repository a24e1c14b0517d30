//! Diagnostic element asserting ramp well-formedness.
//!
//! Not part of the production chain: wire one around the whole pipeline or
//! an individual element when chasing a ramp bug. It checks that emitted
//! ramps stay inside `[MIN, MAX]`, progress continuously (each segment
//! starts where the previous ended) and never reverse direction without an
//! intervening halt.

use std::sync::{Arc, Mutex};

use crate::{
    msg::Msg,
    pipeline::{ElementDownstream, ElementUpstream},
    ramp::{self, Ramp},
};

struct State {
    ramping: bool,
    ramped_down: bool,
    waiting_for_audio: bool,
    last_ramp: u32,
}

impl State {
    fn reset(&mut self) {
        self.ramping = false;
        self.ramped_down = false;
        self.waiting_for_audio = true;
        self.last_ramp = ramp::MAX;
    }
}

enum Link {
    Pull(Arc<dyn ElementUpstream>),
    Push(Arc<dyn ElementDownstream>),
}

/// The ramp validator element; insertable on either a pull or a push link.
pub struct RampValidator {
    link: Link,
    name: &'static str,
    state: Mutex<State>,
}

impl RampValidator {
    /// Validates messages pulled from `upstream`.
    pub fn new_pull(name: &'static str, upstream: Arc<dyn ElementUpstream>) -> Arc<Self> {
        Arc::new(Self {
            link: Link::Pull(upstream),
            name,
            state: Mutex::new(State {
                ramping: false,
                ramped_down: false,
                waiting_for_audio: true,
                last_ramp: ramp::MAX,
            }),
        })
    }

    /// Validates messages pushed to `downstream`.
    pub fn new_push(name: &'static str, downstream: Arc<dyn ElementDownstream>) -> Arc<Self> {
        Arc::new(Self {
            link: Link::Push(downstream),
            name,
            state: Mutex::new(State {
                ramping: false,
                ramped_down: false,
                waiting_for_audio: true,
                last_ramp: ramp::MAX,
            }),
        })
    }

    fn check(&self, msg: &Msg) {
        let audio_ramp = match msg {
            Msg::AudioPcm(audio) => Some(audio.ramp()),
            Msg::Silence(silence) => Some(silence.ramp()),
            Msg::Halt(_) | Msg::Mode(_) | Msg::Track(_) | Msg::DecodedStream(_) => {
                self.state.lock().unwrap().reset();
                None
            }
            _ => None,
        };
        if let Some(audio_ramp) = audio_ramp {
            self.check_audio(audio_ramp);
        }
    }

    fn check_audio(&self, audio_ramp: Ramp) {
        let mut state = self.state.lock().unwrap();
        let name = self.name;
        if audio_ramp.is_enabled() {
            assert!(
                audio_ramp.start() <= ramp::MAX && audio_ramp.end() <= ramp::MAX,
                "{name}: ramp outside bounds"
            );
            if state.ramping && !state.waiting_for_audio {
                assert_eq!(
                    audio_ramp.start(),
                    state.last_ramp,
                    "{name}: discontinuous ramp"
                );
                let was_down = state.ramped_down;
                let is_down = audio_ramp.end() <= audio_ramp.start();
                // Reversal at MIN or MAX is a new ramp, not a glitch.
                if was_down != is_down
                    && state.last_ramp != ramp::MIN
                    && state.last_ramp != ramp::MAX
                {
                    panic!("{name}: ramp reversed direction without a halt");
                }
            }
            state.ramping = true;
            state.waiting_for_audio = false;
            state.ramped_down = audio_ramp.end() <= audio_ramp.start();
            state.last_ramp = audio_ramp.end();
        } else {
            assert!(
                !state.ramping || state.last_ramp == ramp::MAX || state.waiting_for_audio,
                "{name}: ramp abandoned below unity"
            );
            state.ramping = false;
            state.last_ramp = ramp::MAX;
            state.waiting_for_audio = false;
        }
    }
}

impl ElementUpstream for RampValidator {
    fn pull(&self) -> Msg {
        let Link::Pull(upstream) = &self.link else {
            unreachable!("pull on a push-constructed validator");
        };
        let msg = upstream.pull();
        self.check(&msg);
        msg
    }
}

impl ElementDownstream for RampValidator {
    fn push(&self, msg: Msg) {
        let Link::Push(downstream) = &self.link else {
            unreachable!("push on a pull-constructed validator");
        };
        self.check(&msg);
        downstream.push(msg);
    }
}
