//! Demo player entry point.
//!
//! Plays local audio files through the full pipeline and writes the sink
//! output as WAV, exercising every stage: file protocol, codec
//! recognition, reservoirs, the stopper, starvation handling and the
//! pruner.
//!
//! # Runtime Behavior
//!
//! The player:
//! 1. Parses command line arguments and configures logging
//! 2. Builds the pipeline with the symphonia codec set and the file
//!    protocol
//! 3. Streams each file in order, gaplessly, into the output WAV
//! 4. Shuts the pipeline down once the playlist is exhausted
//!
//! A new output file (`out-1.wav`, `out-2.wav`, ...) is started whenever
//! the stream format changes mid-playlist.

use std::{fs::File, io::BufWriter, path::PathBuf, process, sync::Arc};

use clap::{command, Parser, ValueHint};
use log::{error, info, LevelFilter};

use sluice::{
    animator::FixedAnimator,
    codec::symphonia::SymphoniaCodec,
    error::{Error, Result},
    msg::{audio::PcmProcessor, Msg, ModeInfo, Track, TRACK_ID_NONE},
    observer::{PipelineObserver, PipelineState},
    pipeline::{filler::ListUriProvider, Pipeline, PipelineConfig},
    protocol::file::FileProtocol,
};

/// Build profile indicator for logging.
///
/// Shows "debug" when built without optimizations.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";

/// Build profile indicator for logging.
///
/// Shows "release" when built with optimizations.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// The mode name the playlist provider registers under.
const MODE: &str = "files";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Audio files to play, in order
    #[arg(required = true, value_name = "FILE", value_hint = ValueHint::FilePath)]
    files: Vec<PathBuf>,

    /// Base name of the output WAV file
    #[arg(short, long, value_name = "FILE", default_value_t = String::from("out.wav"), env = "SLUICE_OUTPUT")]
    output: String,

    /// Quiet; no logging
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    verbose: bool,
}

/// Logs pipeline events as they arrive on the observer thread.
struct LogObserver;

impl PipelineObserver for LogObserver {
    fn notify_state(&self, state: PipelineState) {
        info!("pipeline state: {state:?}");
    }

    fn notify_track(&self, track: &Track, mode: &str, _pipeline_id: u32) {
        if track.id() == TRACK_ID_NONE {
            info!("[{mode}] end of playlist");
        } else {
            info!("[{mode}] track {}: {}", track.id(), track.uri());
        }
    }

    fn notify_metatext(&self, text: &str) {
        info!("metatext: {text}");
    }

    fn notify_time(&self, seconds: u64, duration_seconds: u64) {
        if duration_seconds > 0 {
            info!("position {seconds}/{duration_seconds} s");
        }
    }

    fn notify_stream_info(&self, info: &sluice::msg::StreamInfo) {
        info!(
            "stream {}: {} {} Hz / {} bit / {} ch",
            info.stream_id, info.codec_name, info.sample_rate, info.bit_depth, info.channels
        );
    }
}

/// Writes sink output to sequentially numbered WAV files.
struct WavSink {
    base: String,
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    spec: Option<hound::WavSpec>,
    index: u32,
}

impl WavSink {
    fn new(base: &str) -> Self {
        Self {
            base: base.to_string(),
            writer: None,
            spec: None,
            index: 0,
        }
    }

    fn path_for(&self, index: u32) -> String {
        if index == 0 {
            self.base.clone()
        } else {
            match self.base.rsplit_once('.') {
                Some((stem, extension)) => format!("{stem}-{index}.{extension}"),
                None => format!("{}-{index}", self.base),
            }
        }
    }

    fn ensure_writer(&mut self, sample_rate: u32, bit_depth: u32, channels: u32) -> Result<()> {
        let spec = hound::WavSpec {
            channels: u16::try_from(channels).map_err(Error::invalid_argument)?,
            sample_rate,
            bits_per_sample: u16::try_from(bit_depth).map_err(Error::invalid_argument)?,
            sample_format: hound::SampleFormat::Int,
        };
        if self.spec == Some(spec) {
            return Ok(());
        }
        if let Some(writer) = self.writer.take() {
            writer.finalize()?;
            self.index += 1;
        }
        let path = self.path_for(self.index);
        info!("writing {path}");
        self.writer = Some(hound::WavWriter::create(&path, spec)?);
        self.spec = Some(spec);
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.finalize()?;
        }
        Ok(())
    }
}

impl PcmProcessor for WavSink {
    fn process_fragment8(&mut self, data: &[u8], _channels: u32) {
        if let Some(writer) = self.writer.as_mut() {
            for &byte in data {
                let _ = writer.write_sample(i32::from(byte as i8));
            }
        }
    }

    fn process_fragment16(&mut self, data: &[u8], _channels: u32) {
        if let Some(writer) = self.writer.as_mut() {
            for pair in data.chunks_exact(2) {
                let _ = writer.write_sample(i32::from(i16::from_be_bytes([pair[0], pair[1]])));
            }
        }
    }

    fn process_fragment24(&mut self, data: &[u8], _channels: u32) {
        if let Some(writer) = self.writer.as_mut() {
            for b in data.chunks_exact(3) {
                let sample =
                    (i32::from(b[0] as i8) << 16) | (i32::from(b[1]) << 8) | i32::from(b[2]);
                let _ = writer.write_sample(sample);
            }
        }
    }

    fn process_fragment32(&mut self, data: &[u8], _channels: u32) {
        if let Some(writer) = self.writer.as_mut() {
            for b in data.chunks_exact(4) {
                let _ = writer.write_sample(i32::from_be_bytes([b[0], b[1], b[2], b[3]]));
            }
        }
    }
}

/// Initializes the logging system with the requested level.
fn init_logger(args: &Args) {
    let mut logger = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(LevelFilter::Info.as_str()),
    );
    if args.quiet {
        logger.filter_level(LevelFilter::Off);
    } else if args.verbose {
        logger.filter_level(LevelFilter::Trace);
    }
    logger.init();
}

fn run(args: &Args) -> Result<()> {
    let mut tracks = Vec::new();
    for (index, file) in args.files.iter().enumerate() {
        let path = file
            .canonicalize()
            .map_err(|e| Error::not_found(format!("{}: {e}", file.display())))?;
        let uri = url::Url::from_file_path(&path)
            .map_err(|()| Error::invalid_argument(format!("{}: not a file path", path.display())))?;
        tracks.push(Track::new(
            u32::try_from(index + 1).map_err(Error::out_of_range)?,
            uri.as_str(),
            "",
        ));
    }

    let pipeline = Pipeline::new(PipelineConfig::default(), Arc::new(FixedAnimator::default()));
    pipeline.add_protocol(Arc::new(FileProtocol::new()));
    pipeline.add_codec(Box::new(SymphoniaCodec::new()));
    pipeline.add_uri_provider(Box::new(ListUriProvider::new(
        MODE,
        ModeInfo {
            supports_pause: true,
            supports_next_prev: true,
            supports_latency: false,
        },
        tracks,
    )));
    pipeline.add_observer(Arc::new(LogObserver));

    pipeline.start();
    pipeline.begin(MODE, TRACK_ID_NONE);
    pipeline.play();

    let mut sink = WavSink::new(&args.output);
    let mut quitting = false;
    loop {
        match pipeline.pull() {
            Msg::Playable(playable) => {
                if playable.is_empty() {
                    continue;
                }
                sink.ensure_writer(
                    playable.sample_rate(),
                    playable.bit_depth(),
                    playable.channels(),
                )?;
                playable.read(&mut sink);
            }
            Msg::Halt(_) if !quitting => {
                // This player runs the playlist once: the first halt marks
                // the end of audible output.
                quitting = true;
                pipeline.quit();
            }
            Msg::Quit(_) => break,
            msg => {
                log::trace!("sink ignoring {}", msg.kind());
            }
        }
    }
    pipeline.join();
    sink.finalize()?;
    Ok(())
}

fn main() {
    let args = Args::parse();
    init_logger(&args);
    info!(
        "{} {} ({BUILD_PROFILE})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
    );

    if let Err(e) = run(&args) {
        error!("{e}");
        process::exit(1);
    }
}
