//! Local stand-in collaborators used by the headless host.
//!
//! None of these talk to a model or a device: replies echo the input,
//! synthesis writes a silent WAV of plausible length, playback waits for the
//! clip's duration, rendering goes to stdout.

use super::{
    AudioHandle, AudioPlayer, RenderError, Renderer, ReplyGenerator, SpeechSynthesizer,
    VisionLookup,
};
use crate::error::{CompanionError, Result};
use crate::pipeline::messages::{ProcessingRequest, SideEffectFlags, SpeechParams, StructuredReply};
use crate::pipeline::segments::{SegmentKind, strip_actions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Phrases that make the echo generator ask for a camera look.
const LOOK_PHRASES: &[&str] = &["look at", "what do you see", "can you see"];

/// Replies by echoing the request.
#[derive(Debug, Default)]
pub struct EchoReplyGenerator {
    /// Artificial latency before replying.
    pub delay: Duration,
}

impl ReplyGenerator for EchoReplyGenerator {
    fn generate(&self, request: &ProcessingRequest) -> Result<Option<StructuredReply>> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let lower = request.text.to_lowercase();
        let wants_look =
            request.visual_context.is_none() && LOOK_PHRASES.iter().any(|p| lower.contains(p));

        let mut display = match &request.visual_context {
            Some(seen) => format!("[tilts head] I can see {seen}."),
            None => format!("[nods] You said: {}", request.text),
        };
        if let Some(attached) = &request.attached_content {
            display.push_str("\n```\n");
            display.push_str(attached.trim_end());
            display.push_str("\n```");
        }

        let animation = if wants_look {
            "looking"
        } else if request.text.ends_with('?') {
            "curious"
        } else {
            "talking"
        };

        Ok(Some(StructuredReply {
            speech_text: strip_actions(&display),
            display_text: display,
            animation_name: Some(animation.to_owned()),
            speech_params: SpeechParams::default(),
            side_effects: SideEffectFlags {
                look_at_camera: wants_look,
            },
            ..StructuredReply::default()
        }))
    }
}

/// Writes a silent 16-bit mono WAV per sentence into `dir`.
#[derive(Debug)]
pub struct WavSynthesizer {
    dir: PathBuf,
    sample_rate: u32,
    /// Clip length per word at rate 1.0.
    per_word: Duration,
    counter: AtomicU64,
}

impl WavSynthesizer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sample_rate: 16_000,
            per_word: Duration::from_millis(60),
            counter: AtomicU64::new(0),
        }
    }

    /// Override the clip length per word (tests use a few milliseconds).
    pub fn with_per_word(mut self, per_word: Duration) -> Self {
        self.per_word = per_word;
        self
    }
}

impl SpeechSynthesizer for WavSynthesizer {
    fn synthesize(&self, text: &str, params: &SpeechParams) -> Result<Option<AudioHandle>> {
        let words = text.split_whitespace().count();
        if words == 0 {
            return Ok(None);
        }
        std::fs::create_dir_all(&self.dir)?;

        let mut duration = self.per_word * u32::try_from(words).unwrap_or(u32::MAX);
        if params.rate > 0.0 && (params.rate - 1.0).abs() > f32::EPSILON {
            duration = duration.div_f32(params.rate);
        }
        let duration = duration.min(Duration::from_secs(10));
        let samples = duration.as_nanos() * u128::from(self.sample_rate) / 1_000_000_000;

        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        let path = self
            .dir
            .join(format!("speech-{}-{id}.wav", std::process::id()));
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        // Hand the path to a handle before writing so a failed write still cleans up.
        let handle = AudioHandle::temporary(&path, Some(duration));
        let mut writer = hound::WavWriter::create(&path, spec)
            .map_err(|e| CompanionError::Collaborator(format!("wav create: {e}")))?;
        for _ in 0..samples {
            writer
                .write_sample(0_i16)
                .map_err(|e| CompanionError::Collaborator(format!("wav write: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| CompanionError::Collaborator(format!("wav finalize: {e}")))?;
        Ok(Some(handle))
    }
}

/// "Plays" a clip by waiting for its duration; `stop` cuts it short.
#[derive(Debug, Default)]
pub struct TimedPlayer {
    /// Clips from epochs below this are cancelled.
    stopped_before: AtomicU64,
}

impl TimedPlayer {
    fn clip_duration(audio: &AudioHandle) -> Option<Duration> {
        if let Some(d) = audio.duration() {
            return Some(d);
        }
        let reader = hound::WavReader::open(audio.path()).ok()?;
        let spec = reader.spec();
        let frames = reader.duration();
        Some(Duration::from_secs_f64(
            f64::from(frames) / f64::from(spec.sample_rate.max(1)),
        ))
    }
}

impl AudioPlayer for TimedPlayer {
    fn play(&self, audio: &AudioHandle, epoch: u64) -> bool {
        let Some(duration) = Self::clip_duration(audio) else {
            return false;
        };
        let end = Instant::now() + duration;
        loop {
            if epoch < self.stopped_before.load(Ordering::SeqCst) {
                return false;
            }
            let left = end.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10).min(left));
        }
    }

    fn stop(&self, epoch: u64) {
        self.stopped_before.fetch_max(epoch, Ordering::SeqCst);
    }
}

/// Renders to stdout.
#[derive(Debug, Default)]
pub struct ConsoleRenderer;

impl Renderer for ConsoleRenderer {
    fn render_segment(
        &self,
        kind: SegmentKind,
        content: &str,
    ) -> std::result::Result<(), RenderError> {
        let mut out = std::io::stdout().lock();
        let written = match kind {
            SegmentKind::Action => writeln!(out, "  *{content}*"),
            SegmentKind::Text => writeln!(out, "{content}"),
            SegmentKind::Code => content
                .lines()
                .try_for_each(|line| writeln!(out, "    {line}")),
        };
        written.map_err(|e| RenderError::Failed(e.to_string()))
    }

    fn render_animation(&self, name: &str) -> std::result::Result<(), RenderError> {
        writeln!(std::io::stdout().lock(), "  (animation: {name})")
            .map_err(|e| RenderError::Failed(e.to_string()))
    }
}

/// Always sees the same thing.
#[derive(Debug, Clone)]
pub struct StaticVision(pub String);

impl VisionLookup for StaticVision {
    fn look_now(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}
