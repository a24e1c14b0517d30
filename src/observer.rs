//! Pipeline observation and the observer-callback thread.
//!
//! Elements never call observers directly from an audio thread: doing so
//! would let a slow observer stall the audio path (priority inversion).
//! Instead, elements register callbacks with the [`ObserverThread`] and
//! schedule them by id; the thread runs callbacks one at a time, in
//! schedule order, on its own stack. Callbacks therefore serialise and
//! never re-enter the pipeline.
//!
//! [`PipelineObserver`] is the outward-facing interface: products register
//! one (or more) to follow state, track, metadata, time and stream-info
//! changes. Observers always see ordered `Playing`/`Buffering`/`Paused`/
//! `Stopped` transitions, never raw error objects.

use std::{
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
};

use crate::msg::{StreamInfo, Track};

/// Externally visible pipeline state.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PipelineState {
    Playing,
    Paused,
    Buffering,
    Waiting,
    Stopped,
}

/// Interface products implement to follow the pipeline.
///
/// All notifications arrive on the observer-callback thread.
pub trait PipelineObserver: Send + Sync {
    /// Pipeline state changed.
    fn notify_state(&self, state: PipelineState);

    /// A new track reached the audible part of the pipeline.
    fn notify_track(&self, track: &Track, mode: &str, pipeline_id: u32);

    /// Metadata text for the current stream.
    fn notify_metatext(&self, text: &str);

    /// Playback position, once per second of audio.
    fn notify_time(&self, seconds: u64, duration_seconds: u64);

    /// Parameters of the stream now playing.
    fn notify_stream_info(&self, info: &StreamInfo);
}

/// Identifies a registered callback.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EventId(usize);

type Callback = Arc<dyn Fn() + Send + Sync>;

enum Command {
    Run(usize),
    Quit,
}

/// The single-threaded, cooperative callback dispatcher.
///
/// Callbacks registered here may be scheduled from any thread; they run
/// serially on the dispatcher thread. Scheduling is cheap enough for audio
/// threads (one channel send).
pub struct ObserverThread {
    tx: Sender<Command>,
    callbacks: Arc<Mutex<Vec<Callback>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ObserverThread {
    /// Creates the dispatcher and starts its thread.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel();
        let callbacks: Arc<Mutex<Vec<Callback>>> = Arc::new(Mutex::new(Vec::new()));

        let thread_callbacks = Arc::clone(&callbacks);
        let thread = thread::Builder::new()
            .name("pipeline-observer".to_string())
            .spawn(move || Self::run(&rx, &thread_callbacks))
            .expect("spawn observer thread");

        Arc::new(Self {
            tx,
            callbacks,
            thread: Mutex::new(Some(thread)),
        })
    }

    fn run(rx: &Receiver<Command>, callbacks: &Mutex<Vec<Callback>>) {
        while let Ok(command) = rx.recv() {
            match command {
                Command::Run(id) => {
                    // Take a reference out, then run it with the
                    // registration list unlocked.
                    let callback = callbacks.lock().unwrap().get(id).cloned();
                    if let Some(callback) = callback {
                        callback();
                    }
                }
                Command::Quit => break,
            }
        }
    }

    /// Registers a callback, returning the id used to schedule it.
    ///
    /// Registrations are append-only and live for the pipeline's lifetime.
    pub fn register(&self, callback: Box<dyn Fn() + Send + Sync>) -> EventId {
        let mut callbacks = self.callbacks.lock().unwrap();
        callbacks.push(Arc::from(callback));
        EventId(callbacks.len() - 1)
    }

    /// Schedules a registered callback to run on the dispatcher thread.
    pub fn schedule(&self, id: EventId) {
        // A send can only fail after quit; late events are dropped then.
        let _ = self.tx.send(Command::Run(id.0));
    }

    /// Stops the dispatcher after draining already-scheduled events.
    pub fn quit(&self) {
        let _ = self.tx.send(Command::Quit);
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn scheduled_callbacks_run_in_order() {
        let observer = ObserverThread::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let log_a = Arc::clone(&log);
        let a = observer.register(Box::new(move || log_a.lock().unwrap().push('a')));
        let log_b = Arc::clone(&log);
        let b = observer.register(Box::new(move || log_b.lock().unwrap().push('b')));

        observer.schedule(a);
        observer.schedule(b);
        observer.schedule(a);
        observer.quit();

        assert_eq!(*log.lock().unwrap(), vec!['a', 'b', 'a']);
    }

    #[test]
    fn callbacks_serialise_across_scheduling_threads() {
        let observer = ObserverThread::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&counter);
        let id = observer.register(Box::new(move || {
            let value = c.load(Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(1));
            c.store(value + 1, Ordering::SeqCst);
        }));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let observer = Arc::clone(&observer);
                thread::spawn(move || {
                    for _ in 0..5 {
                        observer.schedule(id);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        observer.quit();

        // Non-atomic increment would lose updates if callbacks overlapped.
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }
}
