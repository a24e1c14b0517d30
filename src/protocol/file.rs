//! Local-file protocol.
//!
//! The simplest concrete protocol: streams `file://` URIs chunk by chunk.
//! Seekable and never live. Doubles as the reference implementation of the
//! protocol contract: stop and seek requests take effect between chunks
//! and are acknowledged with a flush carrying the returned id;
//! `interrupt` aborts the streaming loop at the next chunk boundary.

use std::{
    fs::File,
    io::{Read, Seek, SeekFrom, Write},
    sync::Mutex,
};

use url::Url;

use crate::{
    msg::FLUSH_ID_INVALID,
    protocol::{GetResult, Protocol, StreamResult, Supply},
    registry::{HandlerHandle, StreamHandler, StreamPlay},
};

/// Bytes pushed per `AudioEncoded` message.
const CHUNK_BYTES: usize = 8192;

#[derive(Default)]
struct State {
    active: bool,
    interrupted: bool,
    stream_id: u32,
    /// Flush id to acknowledge once the stream stops.
    pending_stop: Option<u32>,
    /// Byte offset and flush id of a pending seek.
    pending_seek: Option<(u64, u32)>,
}

/// The `file://` protocol module.
#[derive(Default)]
pub struct FileProtocol {
    supply: Mutex<Option<(Supply, HandlerHandle)>>,
    state: Mutex<State>,
}

impl FileProtocol {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn supply(&self) -> (Supply, HandlerHandle) {
        self.supply
            .lock()
            .unwrap()
            .clone()
            .expect("protocol initialised before streaming")
    }
}

impl Protocol for FileProtocol {
    fn initialise(&self, supply: Supply, handle: HandlerHandle) {
        *self.supply.lock().unwrap() = Some((supply, handle));
    }

    fn stream(&self, uri: &Url) -> StreamResult {
        if uri.scheme() != "file" {
            return StreamResult::NotSupported;
        }
        let Ok(path) = uri.to_file_path() else {
            return StreamResult::NotSupported;
        };

        let (supply, handle) = self.supply();
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) => {
                error!("cannot open {}: {e}", path.display());
                return StreamResult::UnrecoverableError;
            }
        };
        let total_bytes = file.metadata().map(|m| m.len()).unwrap_or(0);

        let stream_id = supply.ids.next_stream_id();
        {
            let mut state = self.state.lock().unwrap();
            if state.interrupted {
                return StreamResult::UnrecoverableError;
            }
            state.active = true;
            state.stream_id = stream_id;
            state.pending_stop = None;
            state.pending_seek = None;
        }
        supply.downstream.push(supply.factory.encoded_stream(
            uri.as_str(),
            "",
            total_bytes,
            stream_id,
            true,
            false,
            Some(handle),
        ));

        let mut chunk = vec![0u8; CHUNK_BYTES];
        let result = loop {
            enum Action {
                Continue,
                Stop(u32),
                Seek(u64, u32),
                Interrupted,
            }
            let action = {
                let mut state = self.state.lock().unwrap();
                if state.interrupted {
                    Action::Interrupted
                } else if let Some(flush_id) = state.pending_stop.take() {
                    Action::Stop(flush_id)
                } else if let Some((offset, flush_id)) = state.pending_seek.take() {
                    Action::Seek(offset, flush_id)
                } else {
                    Action::Continue
                }
            };
            match action {
                Action::Interrupted => break StreamResult::UnrecoverableError,
                Action::Stop(flush_id) => {
                    supply.downstream.push(supply.factory.flush(flush_id));
                    break StreamResult::Stopped;
                }
                Action::Seek(offset, flush_id) => {
                    if let Err(e) = file.seek(SeekFrom::Start(offset)) {
                        error!("seek in {} failed: {e}", path.display());
                        break StreamResult::UnrecoverableError;
                    }
                    supply.downstream.push(supply.factory.flush(flush_id));
                    continue;
                }
                Action::Continue => {}
            }

            match file.read(&mut chunk) {
                Ok(0) => break StreamResult::Success,
                Ok(n) => supply
                    .downstream
                    .push(supply.factory.audio_encoded(&chunk[..n])),
                Err(e) => {
                    error!("read from {} failed: {e}", path.display());
                    break StreamResult::UnrecoverableError;
                }
            }
        };

        // The stream id stays: a finished stream's buffered data is still
        // playable until a newer stream supersedes it.
        self.state.lock().unwrap().active = false;
        result
    }

    fn get(&self, writer: &mut dyn Write, uri: &Url, offset: u64, bytes: u64) -> GetResult {
        if uri.scheme() != "file" {
            return GetResult::NotSupported;
        }
        let Ok(path) = uri.to_file_path() else {
            return GetResult::NotSupported;
        };
        let read = File::open(&path).and_then(|mut file| {
            file.seek(SeekFrom::Start(offset))?;
            let mut remaining = file.take(bytes);
            std::io::copy(&mut remaining, writer)
        });
        match read {
            Ok(_) => GetResult::Success,
            Err(e) => {
                error!("get from {} failed: {e}", path.display());
                GetResult::UnrecoverableError
            }
        }
    }

    fn interrupt(&self, interrupt: bool) {
        self.state.lock().unwrap().interrupted = interrupt;
    }
}

impl StreamHandler for FileProtocol {
    fn ok_to_play(&self, stream_id: u32) -> StreamPlay {
        // Only the most recent stream may play; anything older has been
        // superseded and must not surface as audible.
        if self.state.lock().unwrap().stream_id == stream_id {
            StreamPlay::Yes
        } else {
            StreamPlay::No
        }
    }

    fn try_seek(&self, stream_id: u32, offset: u64) -> u32 {
        let (supply, _) = self.supply();
        let mut state = self.state.lock().unwrap();
        if !state.active || state.stream_id != stream_id {
            return FLUSH_ID_INVALID;
        }
        let flush_id = supply.flush_ids.next_flush_id();
        state.pending_seek = Some((offset, flush_id));
        flush_id
    }

    fn try_stop(&self, stream_id: u32) -> u32 {
        let (supply, _) = self.supply();
        let mut state = self.state.lock().unwrap();
        if !state.active || state.stream_id != stream_id {
            return FLUSH_ID_INVALID;
        }
        let flush_id = supply.flush_ids.next_flush_id();
        state.pending_stop = Some(flush_id);
        flush_id
    }

    fn notify_starving(&self, _mode: &str, _stream_id: u32, starving: bool) {
        trace!("file protocol ignores starvation (starving={starving})");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        msg::{Msg, MsgFactory, MsgQueue, PoolConfig},
        pipeline::{ElementDownstream, FlushIdProvider, IdProvider},
        registry::HandlerRegistry,
    };
    use std::sync::Arc;

    struct Sink(MsgQueue);

    impl ElementDownstream for Sink {
        fn push(&self, msg: Msg) {
            self.0.enqueue(msg);
        }
    }

    fn temp_file(name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("sluice-{}-{name}", std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn rig() -> (Arc<Sink>, Arc<FileProtocol>) {
        let sink = Arc::new(Sink(MsgQueue::new()));
        let registry = Arc::new(HandlerRegistry::new());
        let protocol = Arc::new(FileProtocol::new());
        let handler: Arc<dyn StreamHandler> =
            Arc::clone(&protocol) as Arc<dyn StreamHandler>;
        let handle = registry.register(&handler);
        protocol.initialise(
            Supply {
                factory: MsgFactory::new(&PoolConfig::default()),
                downstream: Arc::clone(&sink) as Arc<dyn ElementDownstream>,
                ids: Arc::new(IdProvider::new()),
                flush_ids: Arc::new(FlushIdProvider::new()),
                registry,
            },
            handle,
        );
        (sink, protocol)
    }

    #[test]
    fn streams_whole_file_as_encoded_audio() {
        let (sink, protocol) = rig();
        let contents: Vec<u8> = (0..20_000u32).map(|i| i as u8).collect();
        let path = temp_file("whole", &contents);
        let uri = Url::from_file_path(&path).unwrap();

        assert_eq!(protocol.stream(&uri), StreamResult::Success);

        let Msg::EncodedStream(stream) = sink.0.dequeue() else {
            panic!("expected stream boundary");
        };
        assert_eq!(stream.total_bytes, contents.len() as u64);
        assert!(stream.seekable);
        assert!(!stream.live);

        let mut received = Vec::new();
        while let Some(Msg::AudioEncoded(audio)) = sink.0.try_dequeue() {
            let mut buf = vec![0u8; audio.len()];
            audio.copy_to(0, &mut buf);
            received.extend_from_slice(&buf);
        }
        assert_eq!(received, contents);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn non_file_scheme_is_not_supported() {
        let (_sink, protocol) = rig();
        let uri = Url::parse("http://example.com/a.flac").unwrap();
        assert_eq!(protocol.stream(&uri), StreamResult::NotSupported);
    }

    #[test]
    fn interrupt_aborts_streaming() {
        let (_sink, protocol) = rig();
        let path = temp_file("interrupt", &[0u8; 100]);
        let uri = Url::from_file_path(&path).unwrap();

        protocol.interrupt(true);
        assert_eq!(protocol.stream(&uri), StreamResult::UnrecoverableError);

        protocol.interrupt(false);
        assert_eq!(protocol.stream(&uri), StreamResult::Success);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn get_reads_a_byte_range() {
        let (_sink, protocol) = rig();
        let contents: Vec<u8> = (0..100u8).collect();
        let path = temp_file("get", &contents);
        let uri = Url::from_file_path(&path).unwrap();

        let mut out = Vec::new();
        assert_eq!(protocol.get(&mut out, &uri, 10, 5), GetResult::Success);
        assert_eq!(out, &contents[10..15]);
        std::fs::remove_file(path).ok();
    }
}
