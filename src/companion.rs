//! Assembly of the full pipeline behind one handle.
//!
//! [`Companion`] builds the channels, wires the six workers to the
//! collaborators and exposes the external surface: feeding transcriptions,
//! interrupting the current turn, toggling voice, reading health and
//! shutting down.

use crate::collaborators::{AudioPlayer, Renderer, ReplyGenerator, SpeechSynthesizer, VisionLookup};
use crate::config::CompanionConfig;
use crate::error::Result;
use crate::pipeline::animation::AnimationWorker;
use crate::pipeline::channel::BoundedChannel;
use crate::pipeline::coordinator::{
    ChannelRole, HealthReport, LifecycleCoordinator, StopReport, WorkerClass, WorkerRecord,
};
use crate::pipeline::distributor::{GuardedRenderer, ResponseDistributor, VisionTrigger};
use crate::pipeline::health::HealthMonitor;
use crate::pipeline::messages::{
    AnimationRequest, AudioRenderChunk, SpeechJob, StructuredReply, Transcription,
};
use crate::pipeline::request::RequestWorker;
use crate::pipeline::signals::PipelineSignals;
use crate::pipeline::speech::{SpeechGenerationWorker, SpeechPlaybackWorker};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The external black boxes the pipeline drives.
#[derive(Clone)]
pub struct Collaborators {
    pub generator: Arc<dyn ReplyGenerator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub player: Arc<dyn AudioPlayer>,
    pub renderer: Arc<dyn Renderer>,
    /// Camera look-up; `None` disables `look_at_camera` side effects.
    pub vision: Option<Arc<dyn VisionLookup>>,
}

/// A running (or ready to run) companion pipeline.
pub struct Companion {
    coordinator: LifecycleCoordinator,
    transcriptions: Arc<BoundedChannel<Transcription>>,
    started: bool,
    stop_report: Option<StopReport>,
}

impl std::fmt::Debug for Companion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Companion")
            .field("started", &self.started)
            .field("stopped", &self.stop_report.is_some())
            .finish()
    }
}

impl Companion {
    /// Build channels and workers. Nothing runs until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or an executor cannot start.
    pub fn new(config: &CompanionConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let ch = &config.channels;

        let transcriptions: Arc<BoundedChannel<Transcription>> = Arc::new(
            BoundedChannel::ring("transcriptions", ch.transcription_capacity),
        );
        let replies: Arc<BoundedChannel<StructuredReply>> =
            Arc::new(BoundedChannel::from_config("replies", ch.reply_capacity, ch));
        let speech: Arc<BoundedChannel<SpeechJob>> =
            Arc::new(BoundedChannel::from_config("speech", ch.speech_capacity, ch));
        let audio: Arc<BoundedChannel<AudioRenderChunk>> =
            Arc::new(BoundedChannel::from_config("audio", ch.audio_capacity, ch));
        let animation: Arc<BoundedChannel<AnimationRequest>> =
            Arc::new(BoundedChannel::ring("animation", ch.animation_capacity));

        let mut coordinator = LifecycleCoordinator::from_config(config);
        coordinator.register_channel(ChannelRole::Input, transcriptions.clone());
        coordinator.register_channel(ChannelRole::MidPipeline, replies.clone());
        coordinator.register_channel(ChannelRole::MidPipeline, speech.clone());
        coordinator.register_channel(ChannelRole::MidPipeline, audio.clone());
        coordinator.register_channel(ChannelRole::MidPipeline, animation.clone());

        let player = Arc::clone(&collaborators.player);
        coordinator.on_interrupt(move |epoch| player.stop(epoch));

        let renderer = Arc::new(GuardedRenderer::new(collaborators.renderer));

        let request = RequestWorker::new(
            collaborators.generator,
            Arc::clone(&transcriptions),
            Arc::clone(&replies),
            &config.workers,
        )?;
        coordinator.register_worker("request", WorkerClass::Critical, move |ctx| {
            request.run(ctx)
        })?;

        let mut distributor = ResponseDistributor::new(
            replies,
            Arc::clone(&speech),
            Arc::clone(&animation),
            Arc::clone(&renderer),
            config.animation.resting.as_str(),
            &config.distributor,
        );
        match collaborators.vision {
            Some(lookup) if config.vision.enabled => {
                distributor = distributor.with_vision(VisionTrigger::new(
                    lookup,
                    Arc::clone(&transcriptions),
                    Duration::from_millis(config.vision.min_interval_ms),
                ));
            }
            Some(_) => debug!("vision look-up configured but disabled"),
            None => {}
        }
        coordinator.register_worker("distributor", WorkerClass::Critical, move |ctx| {
            distributor.run(ctx)
        })?;

        let generation = SpeechGenerationWorker::new(
            collaborators.synthesizer,
            speech,
            Arc::clone(&audio),
            &config.speech,
        )?;
        coordinator.register_worker("speech-generation", WorkerClass::Critical, move |ctx| {
            generation.run(ctx)
        })?;

        let playback = SpeechPlaybackWorker::new(collaborators.player, audio);
        coordinator.register_worker("speech-playback", WorkerClass::Critical, move |ctx| {
            playback.run(ctx)
        })?;

        let animator = AnimationWorker::new(animation, renderer, &config.animation);
        coordinator.register_worker("animation", WorkerClass::Critical, move |ctx| {
            animator.run(ctx)
        })?;

        let monitor = HealthMonitor::new(coordinator.health_probe(), config.health.interval());
        coordinator.register_worker("health", WorkerClass::Background, move |ctx| {
            monitor.run(ctx)
        })?;

        Ok(Self {
            coordinator,
            transcriptions,
            started: false,
            stop_report: None,
        })
    }

    /// Start every worker thread.
    ///
    /// # Errors
    ///
    /// Returns an error if a worker thread could not be spawned.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        self.coordinator.start_all()
    }

    pub fn signals(&self) -> &PipelineSignals {
        self.coordinator.signals()
    }

    /// Feed a transcription into the raw-input channel.
    ///
    /// Returns `false` once shutdown has begun.
    pub fn submit_transcription(&self, transcription: Transcription) -> bool {
        if self.signals().is_shutting_down() {
            return false;
        }
        self.transcriptions.put(transcription)
    }

    /// Typed input, bypassing speech recognition.
    pub fn inject_text(&self, text: impl Into<String>) -> bool {
        self.submit_transcription(Transcription::typed(text))
    }

    /// Abandon the current turn. Returns how many queued items were discarded.
    pub fn trigger_interrupt(&self) -> usize {
        self.coordinator.trigger_interrupt()
    }

    pub fn set_voice_enabled(&self, enabled: bool) {
        info!(enabled, "voice output toggled");
        self.signals().set_voice_enabled(enabled);
    }

    pub fn voice_enabled(&self) -> bool {
        self.signals().voice_enabled()
    }

    pub fn is_speaking(&self) -> bool {
        self.signals().is_speaking()
    }

    pub fn health_check(&self) -> HealthReport {
        self.coordinator.health_check()
    }

    pub fn worker_records(&self) -> Vec<WorkerRecord> {
        self.coordinator.worker_records()
    }

    /// Shut the pipeline down. Later calls return the first report.
    pub fn request_shutdown(&mut self, timeout: Duration, force: bool) -> StopReport {
        if let Some(report) = &self.stop_report {
            return report.clone();
        }
        let report = self.coordinator.stop_all(timeout, force);
        if !report.all_stopped() {
            warn!(abandoned = ?report.abandoned, "shutdown left workers running");
        }
        self.stop_report = Some(report.clone());
        report
    }

    /// Shut down with the configured timeout.
    pub fn shutdown(&mut self) -> StopReport {
        let timeout = self.coordinator.shutdown_config().timeout();
        self.request_shutdown(timeout, false)
    }
}

impl Drop for Companion {
    fn drop(&mut self) {
        if self.started && self.stop_report.is_none() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::collaborators::local::{
        EchoReplyGenerator, StaticVision, TimedPlayer, WavSynthesizer,
    };
    use crate::pipeline::coordinator::WorkerState;
    use crate::test_utils::{RecordingRenderer, RenderCall, wait_until};

    fn fast_config() -> CompanionConfig {
        let mut config = CompanionConfig::default();
        config.workers.poll_interval_ms = 20;
        config.distributor.tail_delay_ms = 0;
        config.health.interval_ms = 50;
        config
    }

    fn collaborators(dir: &std::path::Path, renderer: Arc<RecordingRenderer>) -> Collaborators {
        Collaborators {
            generator: Arc::new(EchoReplyGenerator::default()),
            synthesizer: Arc::new(WavSynthesizer::new(dir).with_per_word(Duration::from_millis(2))),
            player: Arc::new(TimedPlayer::default()),
            renderer,
            vision: Some(Arc::new(StaticVision("a plant".to_owned()))),
        }
    }

    #[test]
    fn typed_text_is_rendered_and_rests_afterwards() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = Arc::new(RecordingRenderer::default());
        let mut companion =
            Companion::new(&fast_config(), collaborators(dir.path(), renderer.clone())).unwrap();
        companion.start().unwrap();

        assert!(companion.inject_text("hello there"));
        assert!(wait_until(Duration::from_secs(5), || {
            renderer.animations().last().map(String::as_str) == Some("idle")
        }));
        let calls = renderer.calls();
        assert!(calls.contains(&RenderCall::Segment(
            crate::pipeline::segments::SegmentKind::Text,
            "You said: hello there".to_owned()
        )));
        assert!(calls.contains(&RenderCall::Animation("talking".to_owned())));

        let report = companion.shutdown();
        assert!(report.all_stopped());
        assert!(
            companion
                .worker_records()
                .iter()
                .all(|r| r.state == WorkerState::Stopped)
        );
        assert!(!companion.inject_text("too late"));
    }

    #[test]
    fn look_request_feeds_vision_back_in() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = Arc::new(RecordingRenderer::default());
        let mut companion =
            Companion::new(&fast_config(), collaborators(dir.path(), renderer.clone())).unwrap();
        companion.start().unwrap();

        companion.inject_text("what do you see?");
        assert!(wait_until(Duration::from_secs(5), || {
            renderer.calls().iter().any(|c| {
                matches!(c, RenderCall::Segment(_, text) if text.contains("I can see a plant"))
            })
        }));
        companion.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent_and_health_reflects_it() {
        let dir = tempfile::tempdir().unwrap();
        let mut companion = Companion::new(
            &fast_config(),
            collaborators(dir.path(), Arc::new(RecordingRenderer::default())),
        )
        .unwrap();
        companion.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || companion.health_check().healthy));

        let first = companion.request_shutdown(Duration::from_secs(2), false);
        let second = companion.request_shutdown(Duration::from_secs(2), true);
        assert_eq!(first, second);
        assert_eq!(first.stopped.len(), 6);
        assert!(companion.health_check().shutting_down);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fast_config();
        config.channels.reply_capacity = 0;
        assert!(Companion::new(
            &config,
            collaborators(dir.path(), Arc::new(RecordingRenderer::default()))
        )
        .is_err());
    }
}
