//! Protocol modules: the start of the pipeline.
//!
//! A protocol streams one URI's encoded bytes into the pipeline. It runs
//! on the filler thread and needs no moderation of its own: pushes into
//! the encoded reservoir block when the pipeline is at capacity.
//!
//! The [`ProtocolManager`] owns the registered protocols and offers each
//! URI to them in registration order; a protocol that does not support the
//! URI's scheme declines with [`StreamResult::NotSupported`] and the next
//! is tried.

pub mod file;

use std::sync::{Arc, Mutex};

use url::Url;

use crate::{
    msg::{MsgFactory, Track},
    pipeline::{ElementDownstream, FlushIdProvider, IdProvider},
    registry::{HandlerHandle, HandlerRegistry, StreamHandler},
};

/// Outcome of streaming a URI.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamResult {
    /// The entire stream was pushed into the pipeline.
    Success,
    /// The URI is not supported by this protocol; another may be tried.
    NotSupported,
    /// Streaming was interrupted by a downstream stop request.
    Stopped,
    /// Internal-use retry signal; never reported to the filler.
    RecoverableError,
    /// The stream failed; no other protocol should be tried.
    UnrecoverableError,
}

/// Outcome of a bounded out-of-band read.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GetResult {
    Success,
    NotSupported,
    UnrecoverableError,
}

/// Everything a protocol needs to feed the pipeline.
///
/// Handed to each protocol at registration; cheap to clone.
#[derive(Clone)]
pub struct Supply {
    pub factory: MsgFactory,
    pub downstream: Arc<dyn ElementDownstream>,
    pub ids: Arc<IdProvider>,
    pub flush_ids: Arc<FlushIdProvider>,
    pub registry: Arc<HandlerRegistry>,
}

/// A registered protocol module.
///
/// Every protocol is also a [`StreamHandler`]: the `EncodedStream` it
/// pushes carries the protocol's own handle, so downstream seek and stop
/// requests land back here.
///
/// `stream` runs on the filler thread and blocks for as long as it takes
/// to stream the entire resource (or to decide the URI is unsupported).
/// [`interrupt`](Self::interrupt) may be called from any thread and must
/// unblock an in-progress `stream` within bounded time, making it return
/// [`StreamResult::UnrecoverableError`].
pub trait Protocol: StreamHandler {
    /// Wires the pipeline-facing supply and this protocol's own handler
    /// handle. Called once, before any `stream`.
    fn initialise(&self, supply: Supply, handle: HandlerHandle);

    /// Streams the URI's encoded bytes into the pipeline.
    fn stream(&self, uri: &Url) -> StreamResult;

    /// Reads `bytes` bytes at `offset` out-of-band (no pipeline messages).
    fn get(&self, writer: &mut dyn std::io::Write, uri: &Url, offset: u64, bytes: u64)
        -> GetResult;

    /// Interrupts (or un-interrupts) any in-progress streaming call.
    fn interrupt(&self, interrupt: bool);
}

/// Iterates registered protocols to stream each track.
pub struct ProtocolManager {
    protocols: Mutex<Vec<Arc<dyn Protocol>>>,
    supply: Supply,
}

impl ProtocolManager {
    #[must_use]
    pub fn new(supply: Supply) -> Arc<Self> {
        Arc::new(Self {
            protocols: Mutex::new(Vec::new()),
            supply,
        })
    }

    /// Registers a protocol; trial order is registration order.
    pub fn add<P>(&self, protocol: Arc<P>)
    where
        P: Protocol + 'static,
    {
        let handler: Arc<dyn StreamHandler> = Arc::clone(&protocol) as Arc<dyn StreamHandler>;
        let handle = self.supply.registry.register(&handler);
        protocol.initialise(self.supply.clone(), handle);
        self.protocols.lock().unwrap().push(protocol);
    }

    /// Streams a track through the first protocol that supports its URI.
    pub fn do_stream(&self, track: &Track) -> StreamResult {
        let uri = match Url::parse(track.uri()) {
            Ok(uri) => uri,
            Err(e) => {
                warn!("track {} has unparseable uri: {e}", track.id());
                return StreamResult::UnrecoverableError;
            }
        };
        let protocols = self.protocols.lock().unwrap().clone();
        for protocol in protocols {
            match protocol.stream(&uri) {
                StreamResult::NotSupported => {}
                result => {
                    debug!("stream {} -> {result:?}", track.uri());
                    return result;
                }
            }
        }
        debug!("no protocol supports {}", track.uri());
        StreamResult::NotSupported
    }

    /// Reads a byte range out-of-band through the first protocol that
    /// supports the URI.
    pub fn get(
        &self,
        writer: &mut dyn std::io::Write,
        uri: &Url,
        offset: u64,
        bytes: u64,
    ) -> GetResult {
        let protocols = self.protocols.lock().unwrap().clone();
        for protocol in protocols {
            match protocol.get(writer, uri, offset, bytes) {
                GetResult::NotSupported => {}
                result => return result,
            }
        }
        GetResult::NotSupported
    }

    /// Interrupts any in-progress streaming call on every protocol.
    pub fn interrupt(&self, interrupt: bool) {
        for protocol in self.protocols.lock().unwrap().iter() {
            protocol.interrupt(interrupt);
        }
    }
}
