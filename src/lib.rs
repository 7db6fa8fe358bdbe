//! Companion: the concurrent core of a voice companion.
//!
//! This crate moves a request from "transcribed text" to "rendered speech +
//! animation":
//! Transcription → Request → Reply → Display / Speech / Animation
//!
//! # Architecture
//!
//! Stages run on dedicated threads connected by bounded channels:
//! - **Request**: single-flight dispatch to the reply generator
//! - **Distributor**: renders display text, queues speech and animation,
//!   triggers throttled vision look-ups
//! - **Speech generation**: a few concurrent syntheses, delivered in order
//! - **Speech playback**: strictly serial, owns the "speaking" flag
//! - **Animation**: skips repeats, rests after interrupts
//! - **Health**: periodic observe-only checks
//!
//! The [`LifecycleCoordinator`] owns the shutdown and interrupt signals and
//! supervises every worker. [`Companion`] wires it all together.

pub mod collaborators;
pub mod companion;
pub mod config;
pub mod error;
pub mod pipeline;

#[cfg(test)]
mod test_utils;

pub use collaborators::{
    AudioHandle, AudioPlayer, Renderer, ReplyGenerator, SpeechSynthesizer, VisionLookup,
};
pub use companion::{Collaborators, Companion};
pub use config::CompanionConfig;
pub use error::{CompanionError, Result};
pub use pipeline::coordinator::{HealthReport, LifecycleCoordinator, StopReport};
pub use pipeline::messages::{StructuredReply, Transcription};
