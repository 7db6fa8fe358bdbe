//! Shared helpers for integration tests.
//!
//! Mock collaborators that record what the pipeline asked of them.

use companion::collaborators::{
    AudioHandle, AudioPlayer, RenderError, Renderer, ReplyGenerator, SpeechSynthesizer,
};
use companion::pipeline::messages::{ProcessingRequest, SpeechParams, StructuredReply};
use companion::pipeline::segments::SegmentKind;
use companion::{Collaborators, Companion, CompanionConfig};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Config with short timings so tests finish quickly.
pub(crate) fn fast_config() -> CompanionConfig {
    let mut config = CompanionConfig::default();
    config.workers.poll_interval_ms = 20;
    config.workers.dispatch_wait_timeout_ms = 500;
    config.distributor.tail_delay_ms = 0;
    config.health.interval_ms = 50;
    config.shutdown.timeout_ms = 1_000;
    config.shutdown.forced_timeout_ms = 300;
    config
}

/// Poll `cond` until it holds or `timeout` passes.
pub(crate) fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

// ─── Reply generator ─────────────────────────────────────────────────────────

/// Replies `"Reply to <text>."` after `delay`.
#[derive(Default)]
pub(crate) struct MockGenerator {
    pub delay: Duration,
    pub requests: Mutex<Vec<ProcessingRequest>>,
}

impl MockGenerator {
    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub(crate) fn texts(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.text.clone())
            .collect()
    }
}

impl ReplyGenerator for MockGenerator {
    fn generate(&self, request: &ProcessingRequest) -> companion::Result<Option<StructuredReply>> {
        self.requests.lock().unwrap().push(request.clone());
        std::thread::sleep(self.delay);
        Ok(Some(StructuredReply {
            display_text: format!("[smiles] Reply to {}.", request.text),
            speech_text: format!("Reply to {}.", request.text),
            animation_name: Some("talking".to_owned()),
            ..StructuredReply::default()
        }))
    }
}

// ─── Speech ──────────────────────────────────────────────────────────────────

/// Writes a small file per sentence; the clip "lasts" `clip` long.
pub(crate) struct FileSynth {
    dir: PathBuf,
    clip: Duration,
    counter: AtomicU64,
}

impl FileSynth {
    pub(crate) fn new(dir: &Path, clip: Duration) -> Self {
        Self {
            dir: dir.to_path_buf(),
            clip,
            counter: AtomicU64::new(0),
        }
    }

    /// Audio files still on disk.
    pub(crate) fn live_files(&self) -> usize {
        std::fs::read_dir(&self.dir)
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

impl SpeechSynthesizer for FileSynth {
    fn synthesize(
        &self,
        text: &str,
        _params: &SpeechParams,
    ) -> companion::Result<Option<AudioHandle>> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.join(format!("clip-{id}.raw"));
        std::fs::write(&path, text.as_bytes())?;
        Ok(Some(AudioHandle::temporary(path, Some(self.clip))))
    }
}

/// Blocks for the clip duration; records what it played.
#[derive(Default)]
pub(crate) struct MockPlayer {
    pub played: Mutex<Vec<String>>,
    stopped_before: AtomicU64,
    /// Ignore `stop()` and block for the full clip.
    pub stubborn: bool,
}

impl MockPlayer {
    pub(crate) fn stubborn() -> Self {
        Self {
            stubborn: true,
            ..Self::default()
        }
    }

    pub(crate) fn played(&self) -> Vec<String> {
        self.played.lock().unwrap().clone()
    }
}

impl AudioPlayer for MockPlayer {
    fn play(&self, audio: &AudioHandle, epoch: u64) -> bool {
        let text = std::fs::read_to_string(audio.path()).unwrap_or_default();
        let end = Instant::now() + audio.duration().unwrap_or_default();
        while Instant::now() < end {
            if !self.stubborn && epoch < self.stopped_before.load(Ordering::SeqCst) {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        self.played.lock().unwrap().push(text);
        true
    }

    fn stop(&self, epoch: u64) {
        self.stopped_before.fetch_max(epoch, Ordering::SeqCst);
    }
}

// ─── Renderer ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct MockRenderer {
    pub segments: Mutex<Vec<(SegmentKind, String)>>,
    pub animations: Mutex<Vec<String>>,
}

impl MockRenderer {
    pub(crate) fn texts(&self) -> Vec<String> {
        self.segments
            .lock()
            .unwrap()
            .iter()
            .filter(|(kind, _)| *kind == SegmentKind::Text)
            .map(|(_, content)| content.clone())
            .collect()
    }

    pub(crate) fn animations(&self) -> Vec<String> {
        self.animations.lock().unwrap().clone()
    }
}

impl Renderer for MockRenderer {
    fn render_segment(&self, kind: SegmentKind, content: &str) -> Result<(), RenderError> {
        self.segments.lock().unwrap().push((kind, content.to_owned()));
        Ok(())
    }

    fn render_animation(&self, name: &str) -> Result<(), RenderError> {
        self.animations.lock().unwrap().push(name.to_owned());
        Ok(())
    }
}

// ─── Assembly ────────────────────────────────────────────────────────────────

pub(crate) struct Rig {
    pub companion: Companion,
    pub generator: Arc<MockGenerator>,
    pub synth: Arc<FileSynth>,
    pub player: Arc<MockPlayer>,
    pub renderer: Arc<MockRenderer>,
    pub _dir: tempfile::TempDir,
}

/// Build and start a companion around fresh mocks.
pub(crate) fn start_rig(
    config: &CompanionConfig,
    generator: MockGenerator,
    player: MockPlayer,
    clip: Duration,
) -> Rig {
    let dir = tempfile::tempdir().expect("create temp dir");
    let generator = Arc::new(generator);
    let synth = Arc::new(FileSynth::new(dir.path(), clip));
    let player = Arc::new(player);
    let renderer = Arc::new(MockRenderer::default());
    let mut companion = Companion::new(
        config,
        Collaborators {
            generator: generator.clone(),
            synthesizer: synth.clone(),
            player: player.clone(),
            renderer: renderer.clone(),
            vision: None,
        },
    )
    .expect("build companion");
    companion.start().expect("start companion");
    Rig {
        companion,
        generator,
        synth,
        player,
        renderer,
        _dir: dir,
    }
}
