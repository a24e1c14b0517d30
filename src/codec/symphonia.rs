//! Symphonia-backed codec (WAV, FLAC, MP3).
//!
//! One codec instance adapts Symphonia's pull-based demuxer/decoder pair
//! to the pipeline's cooperative codec interface. Recognition sniffs the
//! window for container magic; decoding registers only the recognised
//! format's reader and decoder, so a mis-probe cannot select the wrong
//! backend.
//!
//! Pipeline control-flow signals observed during a read surface inside
//! Symphonia as I/O errors; the decode loop translates them back into
//! [`CodecSignal`] values for the controller.

use std::{
    io,
    sync::{Arc, Mutex},
};

use symphonia::{
    core::{
        audio::SampleBuffer,
        codecs::{CodecRegistry, DecoderOptions},
        errors::Error as SymphoniaError,
        formats::{FormatOptions, FormatReader},
        io::{MediaSource, MediaSourceStream, MediaSourceStreamOptions},
        meta::MetadataOptions,
        probe::{Hint, Probe},
    },
    default::{
        codecs::{FlacDecoder, MpaDecoder, PcmDecoder},
        formats::{FlacReader, MpaReader, WavReader},
    },
};

use crate::{
    codec::{Codec, CodecResult, CodecSignal, DecodedStreamParams},
    jiffies,
    msg::audio::Endian,
    pipeline::codec_controller::CodecStream,
};

/// Maximum consecutive undecodable packets before the stream is treated
/// as corrupt.
const MAX_RETRIES: usize = 3;

/// Symphonia asserts a 64 KiB minimum for its ring buffer.
const STREAM_BUFFER_LEN: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Format {
    Wav,
    Flac,
    Mp3,
}

impl Format {
    fn sniff(window: &[u8]) -> Option<Self> {
        if window.len() >= 12 && &window[0..4] == b"RIFF" && &window[8..12] == b"WAVE" {
            return Some(Self::Wav);
        }
        if window.len() >= 4 && &window[0..4] == b"fLaC" {
            return Some(Self::Flac);
        }
        if window.len() >= 3 && &window[0..3] == b"ID3" {
            return Some(Self::Mp3);
        }
        // Bare MPEG audio: frame sync plus a valid layer field.
        if window.len() >= 2 && window[0] == 0xff && (window[1] & 0xe0) == 0xe0 {
            return Some(Self::Mp3);
        }
        None
    }

    fn name(self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Flac => "flac",
            Self::Mp3 => "mp3",
        }
    }

    fn lossless(self) -> bool {
        !matches!(self, Self::Mp3)
    }
}

/// Adapts the cooperative codec stream to Symphonia's `MediaSource`.
///
/// Control-flow signals abort the read with `io::ErrorKind::Interrupted`
/// and are stashed for the decode loop to translate back.
struct SourceAdapter {
    stream: CodecStream,
    signal: Arc<Mutex<Option<CodecSignal>>>,
    position: u64,
    byte_len: Option<u64>,
}

impl io::Read for SourceAdapter {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.read(buf) {
            Ok(n) => {
                self.position += n as u64;
                Ok(n)
            }
            Err(signal) => {
                *self.signal.lock().unwrap() = Some(signal);
                Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "pipeline control signal",
                ))
            }
        }
    }
}

impl io::Seek for SourceAdapter {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        match pos {
            io::SeekFrom::Current(0) => Ok(self.position),
            // Pipeline seeks are flush-and-replay through the encoded
            // reservoir, never through the decoder.
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "codec streams are not seekable",
            )),
        }
    }
}

impl MediaSource for SourceAdapter {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        self.byte_len
    }
}

/// The Symphonia codec module.
pub struct SymphoniaCodec {
    recognised: Option<Format>,
}

impl Default for SymphoniaCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl SymphoniaCodec {
    #[must_use]
    pub fn new() -> Self {
        Self { recognised: None }
    }

    fn registries(format: Format) -> (CodecRegistry, Probe) {
        let mut codecs = CodecRegistry::default();
        let mut probe = Probe::default();
        match format {
            Format::Wav => {
                codecs.register_all::<PcmDecoder>();
                probe.register_all::<WavReader>();
            }
            Format::Flac => {
                codecs.register_all::<FlacDecoder>();
                probe.register_all::<FlacReader>();
            }
            Format::Mp3 => {
                codecs.register_all::<MpaDecoder>();
                probe.register_all::<MpaReader>();
            }
        }
        (codecs, probe)
    }

    /// Maps an error out of the decode loop, preferring a stashed pipeline
    /// signal over Symphonia's own classification.
    fn signal_for(
        signal: &Mutex<Option<CodecSignal>>,
        error: &SymphoniaError,
    ) -> Option<CodecSignal> {
        if let Some(signal) = signal.lock().unwrap().take() {
            return Some(signal);
        }
        match error {
            SymphoniaError::IoError(e) if e.kind() == io::ErrorKind::UnexpectedEof => None,
            _ => Some(CodecSignal::StreamCorrupt),
        }
    }

    /// Discards the rest of an undecodable stream, surfacing the signal
    /// that ends it.
    fn drain(stream: &CodecStream) -> CodecResult<()> {
        let mut scratch = [0u8; 4096];
        loop {
            match stream.read(&mut scratch) {
                Ok(0) => return Ok(()),
                Ok(_) => {}
                Err(signal) => return Err(signal),
            }
        }
    }
}

impl Codec for SymphoniaCodec {
    fn id(&self) -> &'static str {
        "symphonia"
    }

    fn recognise(&mut self, window: &[u8]) -> bool {
        self.recognised = Format::sniff(window);
        self.recognised.is_some()
    }

    fn process(&mut self, stream: &CodecStream) -> CodecResult<()> {
        let format = self.recognised.take().expect("recognise before process");
        let signal = Arc::new(Mutex::new(None));

        let total_bytes = stream.total_bytes();
        let adapter = SourceAdapter {
            stream: stream.clone(),
            signal: Arc::clone(&signal),
            position: 0,
            byte_len: (total_bytes > 0).then_some(total_bytes),
        };
        let source = MediaSourceStream::new(
            Box::new(adapter),
            MediaSourceStreamOptions {
                buffer_len: STREAM_BUFFER_LEN,
            },
        );

        let (codecs, probe) = Self::registries(format);
        let mut hint = Hint::new();
        hint.with_extension(format.name());

        let probed = probe.format(
            &hint,
            source,
            &FormatOptions {
                enable_gapless: true,
                ..FormatOptions::default()
            },
            &MetadataOptions::default(),
        );
        let mut demuxer: Box<dyn FormatReader> = match probed {
            Ok(probed) => probed.format,
            Err(e) => {
                warn!("{} stream did not parse: {e}", format.name());
                return match Self::signal_for(&signal, &e) {
                    Some(signal) => Err(signal),
                    None => Err(CodecSignal::StreamCorrupt),
                };
            }
        };

        let track = match demuxer.default_track() {
            Some(track) => track,
            None => {
                warn!("{} stream has no audio track", format.name());
                return Err(CodecSignal::StreamCorrupt);
            }
        };
        let codec_params = track.codec_params.clone();
        let mut decoder = match codecs.make(&codec_params, &DecoderOptions::default()) {
            Ok(decoder) => decoder,
            Err(e) => {
                warn!("{} decoder failed to initialise: {e}", format.name());
                return Err(CodecSignal::StreamCorrupt);
            }
        };

        let sample_rate = codec_params.sample_rate.unwrap_or(44_100);
        let channels = codec_params
            .channels
            .map_or(2, |channels| channels.count() as u32);
        let supported = jiffies::is_supported(sample_rate);
        let track_length = if supported {
            codec_params
                .n_frames
                .map_or(0, |frames| frames * jiffies::per_sample(sample_rate))
        } else {
            0
        };
        let bit_rate = if total_bytes > 0 && track_length > 0 {
            (total_bytes * 8 * jiffies::PER_SECOND / track_length) as u32
        } else {
            0
        };

        stream.output_decoded_stream(DecodedStreamParams {
            bit_rate,
            // Samples leave the decoder as full-scale 32-bit.
            bit_depth: 32,
            sample_rate,
            channels,
            codec_name: format.name().to_string(),
            track_length,
            sample_start: 0,
            lossless: format.lossless(),
        });

        if !supported {
            // The sink-side validator stops the stream; consume what the
            // protocol still pushes until the flush cuts us off.
            warn!("unsupported sample rate {sample_rate}; draining stream");
            return Self::drain(stream);
        }

        let mut buffer: Option<SampleBuffer<i32>> = None;
        let mut bytes = Vec::new();
        let mut discarded = 0usize;
        loop {
            let packet = match demuxer.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::ResetRequired) => {
                    trace!("re-creating {} decoder", format.name());
                    let track = match demuxer.default_track() {
                        Some(track) => track,
                        None => return Err(CodecSignal::StreamCorrupt),
                    };
                    decoder = match codecs.make(&track.codec_params, &DecoderOptions::default()) {
                        Ok(decoder) => decoder,
                        Err(_) => return Err(CodecSignal::StreamCorrupt),
                    };
                    buffer = None;
                    continue;
                }
                Err(e) => {
                    return match Self::signal_for(&signal, &e) {
                        // A clean end of stream.
                        None => Ok(()),
                        Some(signal) => Err(signal),
                    };
                }
            };

            let decoded = match decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(e)) => {
                    error!("discarding malformed packet: {e}");
                    discarded += 1;
                    if discarded > MAX_RETRIES {
                        return Err(CodecSignal::StreamCorrupt);
                    }
                    continue;
                }
                Err(SymphoniaError::IoError(e)) => {
                    if let Some(signal) = signal.lock().unwrap().take() {
                        return Err(signal);
                    }
                    if e.kind() == io::ErrorKind::UnexpectedEof {
                        return Ok(());
                    }
                    error!("discarding unreadable packet: {e}");
                    discarded += 1;
                    if discarded > MAX_RETRIES {
                        return Err(CodecSignal::StreamCorrupt);
                    }
                    continue;
                }
                Err(SymphoniaError::ResetRequired) => {
                    decoder.reset();
                    buffer = None;
                    continue;
                }
                Err(e) => {
                    warn!("unrecoverable decode error: {e}");
                    return match Self::signal_for(&signal, &e) {
                        Some(signal) => Err(signal),
                        None => Ok(()),
                    };
                }
            };
            discarded = 0;

            let samples = match buffer.as_mut() {
                Some(buffer) => {
                    buffer.copy_interleaved_ref(decoded);
                    buffer.samples()
                }
                None => {
                    let filled = buffer.insert(SampleBuffer::new(
                        decoded.capacity() as u64,
                        *decoded.spec(),
                    ));
                    filled.copy_interleaved_ref(decoded);
                    filled.samples()
                }
            };
            if samples.is_empty() {
                continue;
            }

            bytes.clear();
            bytes.reserve(samples.len() * 4);
            for &sample in samples {
                bytes.extend_from_slice(&sample.to_be_bytes());
            }
            stream.output_audio(&bytes, channels, sample_rate, 32, Endian::Big);
        }
    }

    fn stream_completed(&mut self) {
        self.recognised = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_container_magic() {
        let mut wav = Vec::from(*b"RIFF");
        wav.extend_from_slice(&[0; 4]);
        wav.extend_from_slice(b"WAVE");
        assert_eq!(Format::sniff(&wav), Some(Format::Wav));

        assert_eq!(Format::sniff(b"fLaC...."), Some(Format::Flac));
        assert_eq!(Format::sniff(b"ID3\x04...."), Some(Format::Mp3));
        assert_eq!(Format::sniff(&[0xff, 0xfb, 0x90, 0x00]), Some(Format::Mp3));
        assert_eq!(Format::sniff(b"OggS"), None);
    }

    #[test]
    fn recognise_is_required_before_process() {
        let mut codec = SymphoniaCodec::new();
        assert!(!codec.recognise(b"not audio at all"));
        assert!(codec.recognise(b"fLaC\0\0\0\x22"));
        assert_eq!(codec.recognised, Some(Format::Flac));
    }
}
