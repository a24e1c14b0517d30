//! Shared buffered-queue core for reservoir elements.
//!
//! A reservoir decouples one producer thread from one consumer thread with
//! a FIFO of messages and running totals of what is queued: audio jiffies,
//! encoded bytes and boundary-message counts. The reservoir itself never
//! blocks; capacity policy lives in the owning element, which typically
//! enqueues first and then parks the producer while over capacity, so a
//! single message larger than the ceiling can never deadlock the link.

use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex},
};

use crate::msg::Msg;

#[derive(Default)]
struct Counts {
    jiffies: u64,
    encoded_bytes: usize,
    encoded_streams: usize,
    decoded_streams: usize,
    tracks: usize,
}

impl Counts {
    fn add(&mut self, msg: &Msg) {
        match msg {
            Msg::AudioPcm(_) | Msg::Silence(_) => self.jiffies += msg.jiffies(),
            Msg::AudioEncoded(audio) => self.encoded_bytes += audio.len(),
            Msg::EncodedStream(_) => self.encoded_streams += 1,
            Msg::DecodedStream(_) => self.decoded_streams += 1,
            Msg::Track(_) => self.tracks += 1,
            _ => {}
        }
    }

    fn remove(&mut self, msg: &Msg) {
        match msg {
            Msg::AudioPcm(_) | Msg::Silence(_) => self.jiffies -= msg.jiffies(),
            Msg::AudioEncoded(audio) => self.encoded_bytes -= audio.len(),
            Msg::EncodedStream(_) => self.encoded_streams -= 1,
            Msg::DecodedStream(_) => self.decoded_streams -= 1,
            Msg::Track(_) => self.tracks -= 1,
            _ => {}
        }
    }
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<Msg>,
    counts: Counts,
}

/// FIFO of messages with running buffered totals.
///
/// One producer, one consumer; `dequeue` blocks while empty.
#[derive(Default)]
pub struct CountingQueue {
    inner: Mutex<Inner>,
    available: Condvar,
}

impl CountingQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message, updating totals.
    pub fn enqueue(&self, msg: Msg) {
        let mut inner = self.inner.lock().unwrap();
        inner.counts.add(&msg);
        inner.queue.push_back(msg);
        drop(inner);
        self.available.notify_one();
    }

    /// Re-inserts a message at the head (e.g. the tail of a split).
    pub fn enqueue_at_head(&self, msg: Msg) {
        let mut inner = self.inner.lock().unwrap();
        inner.counts.add(&msg);
        inner.queue.push_front(msg);
        drop(inner);
        self.available.notify_one();
    }

    /// Removes and returns the head, blocking while empty.
    pub fn dequeue(&self) -> Msg {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(msg) = inner.queue.pop_front() {
                inner.counts.remove(&msg);
                return msg;
            }
            inner = self.available.wait(inner).unwrap();
        }
    }

    /// Removes and returns the head if one is queued.
    pub fn try_dequeue(&self) -> Option<Msg> {
        let mut inner = self.inner.lock().unwrap();
        let msg = inner.queue.pop_front()?;
        inner.counts.remove(&msg);
        Some(msg)
    }

    /// Buffered audio duration.
    #[must_use]
    pub fn jiffies(&self) -> u64 {
        self.inner.lock().unwrap().counts.jiffies
    }

    /// Buffered encoded byte count.
    #[must_use]
    pub fn encoded_bytes(&self) -> usize {
        self.inner.lock().unwrap().counts.encoded_bytes
    }

    /// Buffered `EncodedStream` boundary count.
    #[must_use]
    pub fn encoded_streams(&self) -> usize {
        self.inner.lock().unwrap().counts.encoded_streams
    }

    /// Buffered `DecodedStream` boundary count.
    #[must_use]
    pub fn decoded_streams(&self) -> usize {
        self.inner.lock().unwrap().counts.decoded_streams
    }

    /// Buffered `Track` boundary count.
    #[must_use]
    pub fn tracks(&self) -> usize {
        self.inner.lock().unwrap().counts.tracks
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().queue.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    /// Drops leading encoded audio up to `skip_bytes` bytes, splitting the
    /// message that covers the target. Non-audio messages ahead of the
    /// target are preserved in order. Used by the encoded reservoir to
    /// serve a seek from buffered data.
    ///
    /// # Panics
    ///
    /// Panics if fewer than `skip_bytes` bytes are buffered; the caller
    /// checks the buffered window first.
    pub fn discard_encoded(&self, mut skip_bytes: usize) {
        let mut inner = self.inner.lock().unwrap();
        assert!(skip_bytes <= inner.counts.encoded_bytes);
        let mut index = 0;
        while skip_bytes > 0 {
            let len = match &inner.queue[index] {
                Msg::AudioEncoded(audio) => audio.len(),
                _ => {
                    index += 1;
                    continue;
                }
            };
            if len <= skip_bytes {
                skip_bytes -= len;
                let msg = inner.queue.remove(index).expect("indexed message");
                inner.counts.remove(&msg);
            } else {
                if let Msg::AudioEncoded(audio) = &mut inner.queue[index] {
                    audio.discard_front(skip_bytes);
                }
                inner.counts.encoded_bytes -= skip_bytes;
                skip_bytes = 0;
            }
        }
    }
}
