//! Elastic buffer on the decoded side of the codec.
//!
//! Same producer/consumer shape as the encoded reservoir, but measured in
//! audio jiffies rather than bytes. The reservoir also hosts the **clock
//! puller** hook: when the current mode asks for latency reporting, the
//! reservoir reports its fill level after every `sample_period` jiffies of
//! consumed audio. This is the only path by which downstream clock-rate
//! estimation feeds back into rate adaptation.

use std::sync::{Arc, Condvar, Mutex};

use crate::{
    msg::Msg,
    pipeline::{reservoir::CountingQueue, ElementDownstream, ElementUpstream},
};

/// Downstream clock-rate estimation interface.
///
/// Driven entirely by the decoded reservoir; implementations receive fill
/// levels and derive a clock-drift estimate from their trend.
pub trait ClockPuller: Send + Sync {
    /// Reporting begins; `expected_fill` is the steady-state fill level.
    fn start(&self, expected_fill: u64);

    /// Reporting stops (pipeline halted or draining).
    fn stop(&self);

    /// Stream parameters changed; discard accumulated history.
    fn reset(&self);

    /// Fill level after another sample period of consumed audio.
    fn notify_size(&self, fill_jiffies: u64);
}

struct State {
    puller_started: bool,
    jiffies_until_report: u64,
}

/// The decoded-side reservoir element.
pub struct DecodedReservoir {
    queue: CountingQueue,
    max_jiffies: u64,
    max_streams: usize,
    max_tracks: usize,
    clock_puller: Option<Arc<dyn ClockPuller>>,
    sample_period: u64,
    state: Mutex<State>,
    space: Condvar,
}

impl DecodedReservoir {
    pub fn new(
        max_jiffies: u64,
        max_streams: usize,
        max_tracks: usize,
        sample_period: u64,
        clock_puller: Option<Arc<dyn ClockPuller>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue: CountingQueue::new(),
            max_jiffies,
            max_streams,
            max_tracks,
            clock_puller,
            sample_period,
            state: Mutex::new(State {
                puller_started: false,
                jiffies_until_report: sample_period,
            }),
            space: Condvar::new(),
        })
    }

    /// Buffered audio duration, reported to the starvation side and to
    /// telemetry.
    #[must_use]
    pub fn buffered_jiffies(&self) -> u64 {
        self.queue.jiffies()
    }

    fn is_full(&self) -> bool {
        self.queue.jiffies() >= self.max_jiffies
            || self.queue.decoded_streams() >= self.max_streams
            || self.queue.tracks() >= self.max_tracks
    }

    fn puller_start(&self) {
        if let Some(puller) = &self.clock_puller {
            let mut state = self.state.lock().unwrap();
            if !state.puller_started {
                state.puller_started = true;
                state.jiffies_until_report = self.sample_period;
                drop(state);
                puller.start(self.max_jiffies);
            }
        }
    }

    fn puller_stop(&self) {
        if let Some(puller) = &self.clock_puller {
            let mut state = self.state.lock().unwrap();
            if state.puller_started {
                state.puller_started = false;
                drop(state);
                puller.stop();
            }
        }
    }

    fn puller_reset(&self) {
        if let Some(puller) = &self.clock_puller {
            if self.state.lock().unwrap().puller_started {
                puller.reset();
            }
        }
    }

    fn account_consumed(&self, consumed: u64) {
        if consumed == 0 || self.clock_puller.is_none() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if !state.puller_started {
            return;
        }
        if state.jiffies_until_report > consumed {
            state.jiffies_until_report -= consumed;
            return;
        }
        state.jiffies_until_report = self.sample_period;
        drop(state);
        if let Some(puller) = &self.clock_puller {
            puller.notify_size(self.queue.jiffies());
        }
    }
}

impl ElementDownstream for DecodedReservoir {
    fn push(&self, msg: Msg) {
        match &msg {
            Msg::Mode(mode) => {
                if mode.info().supports_latency {
                    self.puller_start();
                } else {
                    self.puller_stop();
                }
            }
            Msg::Halt(_) | Msg::Drain(_) => self.puller_stop(),
            Msg::DecodedStream(_) => self.puller_reset(),
            _ => {}
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

impl ElementUpstream for DecodedReservoir {
    fn pull(&self) -> Msg {
        let msg = self.queue.dequeue();
        {
            // Notify under the state lock so a producer between its
            // capacity check and its wait cannot miss the wakeup.
            let _state = self.state.lock().unwrap();
            self.space.notify_one();
        }
        self.account_consumed(msg.jiffies());
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        jiffies,
        msg::{audio::Endian, ModeInfo, MsgFactory, PoolConfig},
    };
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingPuller {
        starts: AtomicUsize,
        stops: AtomicUsize,
        sizes: AtomicUsize,
        last_size: AtomicU64,
    }

    impl ClockPuller for RecordingPuller {
        fn start(&self, _expected_fill: u64) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn reset(&self) {}

        fn notify_size(&self, fill_jiffies: u64) {
            self.sizes.fetch_add(1, Ordering::SeqCst);
            self.last_size.store(fill_jiffies, Ordering::SeqCst);
        }
    }

    fn pcm_ms(factory: &MsgFactory, ms: usize) -> Msg {
        let samples = 44_100 * ms / 1000;
        factory.audio_pcm(&vec![0u8; samples * 4], 2, 44_100, 16, Endian::Big, 0)
    }

    #[test]
    fn reports_fill_every_sample_period_of_consumed_audio() {
        let factory = MsgFactory::new(&PoolConfig::default());
        let puller = Arc::new(RecordingPuller::default());
        let reservoir = DecodedReservoir::new(
            jiffies::from_ms(1000),
            8,
            8,
            jiffies::from_ms(20),
            Some(Arc::clone(&puller) as Arc<dyn ClockPuller>),
        );

        reservoir.push(factory.mode(
            "test",
            ModeInfo {
                supports_latency: true,
                ..ModeInfo::default()
            },
        ));
        let _ = reservoir.pull();
        assert_eq!(puller.starts.load(Ordering::SeqCst), 1);

        // 50 ms buffered; consuming 10 ms fragments reports after each
        // 20 ms of consumption.
        for _ in 0..5 {
            reservoir.push(pcm_ms(&factory, 10));
        }
        for _ in 0..5 {
            let _ = reservoir.pull();
        }
        assert_eq!(puller.sizes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn halt_stops_reporting_until_next_latency_mode() {
        let factory = MsgFactory::new(&PoolConfig::default());
        let puller = Arc::new(RecordingPuller::default());
        let reservoir = DecodedReservoir::new(
            jiffies::from_ms(1000),
            8,
            8,
            jiffies::from_ms(20),
            Some(Arc::clone(&puller) as Arc<dyn ClockPuller>),
        );

        reservoir.push(factory.mode(
            "test",
            ModeInfo {
                supports_latency: true,
                ..ModeInfo::default()
            },
        ));
        reservoir.push(factory.halt_with_id(1));
        let _ = reservoir.pull();
        let _ = reservoir.pull();
        assert_eq!(puller.stops.load(Ordering::SeqCst), 1);

        // Audio consumed while stopped reports nothing.
        reservoir.push(pcm_ms(&factory, 30));
        let _ = reservoir.pull();
        assert_eq!(puller.sizes.load(Ordering::SeqCst), 0);
    }
}
