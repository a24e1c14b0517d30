//! Staged streaming audio pipeline with glitch-free ramping.
//!
//! **sluice** is a library (and demo player binary) implementing a staged,
//! message-passing audio pipeline: encoded audio flows in from protocol
//! modules, is decoded by registered codecs, and leaves as a continuous
//! stream of decoded samples ready for a hardware or software sink.
//!
//! # Core Features
//!
//! * **Bounded message pools**: all pipeline traffic is drawn from
//!   pre-allocated, reference-counted pools with blocking backpressure
//! * **Ramped transitions**: play, pause and stop are enacted as linear
//!   gain ramps so the listener never hears a click
//! * **Starvation hiding**: an underrun triggers a synthesised
//!   linear-prediction "flywheel" ramp-down instead of a glitch
//! * **Elastic buffering**: encoded and decoded reservoirs decouple the
//!   network producer, the codec and the sink with flow control
//!
//! # Architecture
//!
//! The pipeline is a linear chain of elements (upstream → downstream):
//!
//! 1. [`pipeline::filler`]: resolves track URIs and drives the protocol
//!    manager
//! 2. [`pipeline::encoded_reservoir`]: elastic buffer on the encoded side,
//!    with buffered seek
//! 3. [`pipeline::rewinder`]: replay buffer for codec format recognition
//! 4. [`pipeline::codec_controller`]: codec selection and cooperative decode
//! 5. [`pipeline::sample_rate_validator`]: drops streams the sink cannot play
//! 6. [`pipeline::aggregator`]: coalesces small decoded fragments
//! 7. [`pipeline::decoded_reservoir`]: elastic buffer on the decoded side,
//!    with clock-puller fill reporting
//! 8. [`pipeline::stopper`]: the play/pause/stop state machine
//! 9. [`pipeline::ramp_validator`]: optional ramp diagnostics
//! 10. [`pipeline::starvation_ramper`]: last-resort underrun hiding
//! 11. [`pipeline::pruner`]: suppresses events for tracks that never
//!     produced audio
//!
//! Communication is exclusively via the closed message family in [`msg`],
//! allocated from bounded pools and released back on last reference.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sluice::{
//!     animator::FixedAnimator,
//!     codec::symphonia::SymphoniaCodec,
//!     pipeline::{Pipeline, PipelineConfig},
//!     protocol::file::FileProtocol,
//! };
//!
//! let pipeline = Pipeline::new(PipelineConfig::default(), Arc::new(FixedAnimator::default()));
//! pipeline.add_protocol(Arc::new(FileProtocol::new()));
//! pipeline.add_codec(Box::new(SymphoniaCodec::new()));
//! pipeline.start();
//! // ... add a UriProvider, begin a mode, then pull from the sink side.
//! ```
//!
//! # Concurrency
//!
//! Each buffered element has exactly one producer and one consumer thread;
//! queue operations block on capacity and emptiness. Observer callbacks are
//! serialised on a dedicated thread (see [`observer`]) and never run on an
//! audio thread.
//!
//! # Error Handling
//!
//! Errors are handled through the types in the [`error`] module. Codec
//! control flow (stream start/flush/ended/corrupt) uses explicit result
//! enums in [`codec`], not errors.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![doc(test(attr(ignore)))]

#[macro_use]
extern crate log;

pub mod animator;
pub mod codec;
pub mod error;
pub mod flywheel;
pub mod jiffies;
pub mod msg;
pub mod observer;
pub mod pipeline;
pub mod protocol;
pub mod ramp;
pub mod registry;
