//! Message types passed between pipeline stages.
//!
//! Everything here is moved through channels by value: once a stage has
//! `put` a message it no longer touches it.

use crate::collaborators::AudioHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Metadata key carrying a description of what the camera currently sees.
pub const META_VISUAL_CONTEXT: &str = "visual_context";
/// Metadata key carrying attached content (clipboard, file excerpt, ...).
pub const META_ATTACHMENT: &str = "attachment";
/// Metadata key forcing a specific animation for the reply.
pub const META_ANIMATION: &str = "animation";

/// Where a transcription came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptionSource {
    /// Speech-to-text from the microphone.
    #[default]
    Spoken,
    /// Text typed by the user, bypassing STT.
    Typed,
    /// A vision description re-injected by the distributor.
    Vision,
}

/// A transcription pushed into the raw-input channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcription {
    /// The transcribed text.
    pub text: String,
    /// Recogniser confidence in `[0, 1]`; typed input is always `1.0`.
    pub confidence: f32,
    /// Wall-clock time the transcription was produced.
    pub timestamp: DateTime<Utc>,
    /// Free-form metadata from the transcription source.
    pub metadata: BTreeMap<String, String>,
    /// Origin of the text.
    pub source: TranscriptionSource,
}

impl Transcription {
    /// A speech transcription with the given confidence.
    pub fn spoken(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
            source: TranscriptionSource::Spoken,
        }
    }

    /// Typed input injected directly, bypassing STT.
    pub fn typed(text: impl Into<String>) -> Self {
        Self {
            source: TranscriptionSource::Typed,
            ..Self::spoken(text, 1.0)
        }
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A request for the reply generator, built once from a transcription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRequest {
    /// Request identifier, used to correlate log lines.
    pub id: Uuid,
    pub text: String,
    pub visual_context: Option<String>,
    pub attached_content: Option<String>,
    /// Animation to use regardless of what the reply asks for.
    pub forced_animation: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProcessingRequest {
    /// Build a request from an inbound transcription.
    ///
    /// Returns `None` when the text is blank after trimming.
    pub fn from_transcription(transcription: Transcription) -> Option<Self> {
        let text = transcription.text.trim();
        if text.is_empty() {
            return None;
        }
        let mut metadata = transcription.metadata;
        let mut take = |key: &str| {
            metadata
                .remove(key)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        };
        Some(Self {
            id: Uuid::new_v4(),
            text: text.to_owned(),
            visual_context: take(META_VISUAL_CONTEXT),
            attached_content: take(META_ATTACHMENT),
            forced_animation: take(META_ANIMATION),
            timestamp: transcription.timestamp,
        })
    }
}

/// Voice parameters for speech synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechParams {
    /// Voice name (None = synthesizer default).
    pub voice: Option<String>,
    /// Speaking rate multiplier.
    pub rate: f32,
    /// Pitch multiplier.
    pub pitch: f32,
}

impl Default for SpeechParams {
    fn default() -> Self {
        Self {
            voice: None,
            rate: 1.0,
            pitch: 1.0,
        }
    }
}

/// Side effects the reply asks the distributor to trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SideEffectFlags {
    /// Take a look through the camera and feed the description back in.
    pub look_at_camera: bool,
}

/// A structured reply from the reply generator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StructuredReply {
    pub speech_text: String,
    pub display_text: String,
    pub animation_name: Option<String>,
    pub speech_params: SpeechParams,
    pub side_effects: SideEffectFlags,
    /// Interrupt epoch the originating request was dispatched under.
    ///
    /// Stamped by the request worker; generators leave it at the default.
    #[serde(skip)]
    pub epoch: u64,
}

/// One sentence of speech waiting for synthesis.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechJob {
    pub text: String,
    pub params: SpeechParams,
    /// Interrupt epoch the job was created under.
    pub epoch: u64,
}

/// Synthesized audio waiting for playback.
///
/// Owns the temporary audio resource; dropping the chunk deletes it.
#[derive(Debug)]
pub struct AudioRenderChunk {
    pub audio: AudioHandle,
    pub source_text: String,
    pub generation_duration: Duration,
    /// Interrupt epoch the originating job was created under.
    pub epoch: u64,
}

/// A request to show an animation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnimationRequest {
    pub name: String,
    /// Interrupt epoch the request was made under.
    pub epoch: u64,
}

impl AnimationRequest {
    pub fn new(name: impl Into<String>, epoch: u64) -> Self {
        Self {
            name: name.into(),
            epoch,
        }
    }
}
