//! Stream-handler registry and control-path interfaces.
//!
//! `EncodedStream` and `DecodedStream` messages carry a back-reference to
//! the upstream element that plays the stream-handler role for that stream.
//! Holding that reference as an owning pointer would create a cycle (the
//! element also holds the messages), so messages carry a copyable
//! generation-tagged [`HandlerHandle`] into a per-pipeline
//! [`HandlerRegistry`] instead. A handle that outlives its element resolves
//! to `None` rather than a dangling call.

use std::sync::{Arc, Mutex, Weak};

use crate::msg::FLUSH_ID_INVALID;

/// Outcome of asking whether a stream may play.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamPlay {
    /// Play it now.
    Yes,
    /// Never play it; the caller stops the stream.
    No,
    /// Keep it ready; an external request will start it.
    Later,
}

/// Upstream-facing control interface for a stream already in flight.
///
/// Implemented by protocol modules and by every pipeline element that
/// interposes itself in the control path (reservoirs, rewinder, codec
/// controller, aggregator).
pub trait StreamHandler: Send + Sync {
    /// Asks whether the identified stream should play.
    fn ok_to_play(&self, stream_id: u32) -> StreamPlay;

    /// Attempts to seek to a byte offset within the stream.
    ///
    /// Returns the flush id that will mark the discard point downstream,
    /// or [`FLUSH_ID_INVALID`] when seeking is not possible.
    fn try_seek(&self, stream_id: u32, offset: u64) -> u32;

    /// Attempts to stop the stream.
    ///
    /// Returns the flush id that will mark the discard point downstream,
    /// or [`FLUSH_ID_INVALID`] when there is nothing to stop.
    fn try_stop(&self, stream_id: u32) -> u32;

    /// Reports a change in downstream starvation state.
    fn notify_starving(&self, mode: &str, stream_id: u32, starving: bool);
}

/// A no-op handler for streams that accept no control.
#[derive(Debug, Default)]
pub struct NullStreamHandler;

impl StreamHandler for NullStreamHandler {
    fn ok_to_play(&self, _stream_id: u32) -> StreamPlay {
        StreamPlay::Yes
    }

    fn try_seek(&self, _stream_id: u32, _offset: u64) -> u32 {
        FLUSH_ID_INVALID
    }

    fn try_stop(&self, _stream_id: u32) -> u32 {
        FLUSH_ID_INVALID
    }

    fn notify_starving(&self, _mode: &str, _stream_id: u32, _starving: bool) {}
}

/// Copyable reference to a registered stream handler.
///
/// The generation tag makes a stale handle (one whose element has been
/// unregistered) detectable.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct HandlerHandle {
    index: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    handler: Option<Weak<dyn StreamHandler>>,
}

/// Per-pipeline registry mapping handles to live stream handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    slots: Mutex<Vec<Slot>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, returning its handle.
    ///
    /// The registry holds only a weak reference; dropping the element is
    /// enough to invalidate its handles even without unregistering.
    pub fn register(&self, handler: &Arc<dyn StreamHandler>) -> HandlerHandle {
        let weak = Arc::downgrade(handler);
        let mut slots = self.slots.lock().unwrap();
        // Reuse a vacated slot if one exists, bumping its generation.
        for (index, slot) in slots.iter_mut().enumerate() {
            if slot.handler.is_none() {
                slot.generation += 1;
                slot.handler = Some(weak);
                return HandlerHandle {
                    index: u32::try_from(index).unwrap(),
                    generation: slot.generation,
                };
            }
        }
        slots.push(Slot {
            generation: 0,
            handler: Some(weak),
        });
        HandlerHandle {
            index: u32::try_from(slots.len() - 1).unwrap(),
            generation: 0,
        }
    }

    /// Removes a handler; its handles become stale immediately.
    pub fn unregister(&self, handle: HandlerHandle) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(handle.index as usize) {
            if slot.generation == handle.generation {
                slot.handler = None;
            }
        }
    }

    /// Resolves a handle to a live handler.
    ///
    /// Returns `None` for a stale handle; callers treat that as "stream
    /// already torn down" and log rather than fail.
    #[must_use]
    pub fn resolve(&self, handle: HandlerHandle) -> Option<Arc<dyn StreamHandler>> {
        let slots = self.slots.lock().unwrap();
        let slot = slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.handler.as_ref()?.upgrade()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_returns_registered_handler() {
        let registry = HandlerRegistry::new();
        let handler: Arc<dyn StreamHandler> = Arc::new(NullStreamHandler);
        let handle = registry.register(&handler);
        assert!(registry.resolve(handle).is_some());
    }

    #[test]
    fn unregister_makes_handle_stale() {
        let registry = HandlerRegistry::new();
        let handler: Arc<dyn StreamHandler> = Arc::new(NullStreamHandler);
        let handle = registry.register(&handler);
        registry.unregister(handle);
        assert!(registry.resolve(handle).is_none());
    }

    #[test]
    fn slot_reuse_bumps_generation() {
        let registry = HandlerRegistry::new();
        let first: Arc<dyn StreamHandler> = Arc::new(NullStreamHandler);
        let stale = registry.register(&first);
        registry.unregister(stale);

        let second: Arc<dyn StreamHandler> = Arc::new(NullStreamHandler);
        let fresh = registry.register(&second);

        // Same slot, different generation: the old handle stays dead.
        assert!(registry.resolve(stale).is_none());
        assert!(registry.resolve(fresh).is_some());
    }

    #[test]
    fn dropped_element_resolves_to_none() {
        let registry = HandlerRegistry::new();
        let handler: Arc<dyn StreamHandler> = Arc::new(NullStreamHandler);
        let handle = registry.register(&handler);
        drop(handler);
        assert!(registry.resolve(handle).is_none());
    }
}
