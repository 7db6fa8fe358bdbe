//! Contracts for the external black boxes the pipeline drives.
//!
//! Every collaborator may block. The pipeline only ever calls reply
//! generation and speech synthesis from a [`BoundedExecutor`] thread, never
//! from a stage loop directly.
//!
//! [`BoundedExecutor`]: crate::pipeline::executor::BoundedExecutor

pub mod local;

use crate::error::Result;
use crate::pipeline::messages::{ProcessingRequest, SpeechParams, StructuredReply};
use crate::pipeline::segments::SegmentKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Produces a structured reply for a request (LLM call, prompt building, parsing).
pub trait ReplyGenerator: Send + Sync {
    /// `Ok(None)` means "no reply for this turn".
    fn generate(&self, request: &ProcessingRequest) -> Result<Option<StructuredReply>>;
}

/// Turns text into a temporary audio resource.
pub trait SpeechSynthesizer: Send + Sync {
    fn synthesize(&self, text: &str, params: &SpeechParams) -> Result<Option<AudioHandle>>;
}

/// Plays audio to the speakers.
///
/// Stops are keyed by interrupt epoch rather than by timing: `stop(n)`
/// cancels every clip played under an epoch below `n`, including one whose
/// `play` call has not started yet.
pub trait AudioPlayer: Send + Sync {
    /// Play the whole clip, produced under interrupt `epoch`.
    ///
    /// Returns `false` if playback failed or was stopped.
    fn play(&self, audio: &AudioHandle, epoch: u64) -> bool;

    /// Cut off playback of clips older than `epoch`. Called on interrupt
    /// from another thread with the new epoch.
    fn stop(&self, _epoch: u64) {}
}

/// Failure modes of a render call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    /// The UI has not been mounted yet (or was torn down).
    #[error("renderer not ready")]
    NotReady,
    #[error("render failed: {0}")]
    Failed(String),
}

/// Terminal/graphics surface.
pub trait Renderer: Send + Sync {
    fn render_segment(
        &self,
        kind: SegmentKind,
        content: &str,
    ) -> std::result::Result<(), RenderError>;

    fn render_animation(&self, name: &str) -> std::result::Result<(), RenderError>;

    /// Clear transient status UI ("thinking...", partial transcript, ...).
    fn reset_status(&self) -> std::result::Result<(), RenderError> {
        Ok(())
    }
}

/// Camera look-up. Rate limiting is the caller's job.
pub trait VisionLookup: Send + Sync {
    fn look_now(&self) -> Result<String>;
}

/// A temporary audio file owned by whoever holds the handle.
///
/// The file is deleted when the handle is released or dropped, whichever
/// comes first, so every exit path cleans up.
#[derive(Debug)]
pub struct AudioHandle {
    path: PathBuf,
    duration: Option<Duration>,
    released: bool,
}

impl AudioHandle {
    /// Take ownership of a temporary file.
    pub fn temporary(path: impl Into<PathBuf>, duration: Option<Duration>) -> Self {
        Self {
            path: path.into(),
            duration,
            released: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Clip length, when the synthesizer knows it.
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// Delete the file now.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the file exists but cannot be removed.
    pub fn release(mut self) -> std::io::Result<()> {
        self.released = true;
        remove_if_present(&self.path)
    }
}

impl Drop for AudioHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match remove_if_present(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "temporary audio removed"),
            Err(e) => warn!(path = %self.path.display(), "failed to remove temporary audio: {e}"),
        }
    }
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
