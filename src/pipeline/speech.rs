//! Speech pipeline: sentence jobs → synthesized clips → serial playback.
//!
//! Generation runs a few syntheses concurrently on a [`BoundedExecutor`] but
//! hands clips to playback strictly in job order. A job the synthesis pool
//! cannot take yet is held and retried ahead of the queue; speech backlog is
//! delayed, never dropped, by this stage. Only an interrupt discards it.
//!
//! Playback plays one clip at a time and owns [`PipelineSignals::is_speaking`].
//! Every clip's temporary file is released whether it played, failed or was
//! discarded.
//!
//! [`PipelineSignals::is_speaking`]: crate::pipeline::signals::PipelineSignals::is_speaking

use crate::collaborators::{AudioHandle, AudioPlayer, SpeechSynthesizer};
use crate::config::SpeechConfig;
use crate::error::Result;
use crate::pipeline::channel::{BoundedChannel, Recv};
use crate::pipeline::executor::{BoundedExecutor, SubmitError, TaskError, TaskHandle, TaskPoll};
use crate::pipeline::messages::{AudioRenderChunk, SpeechJob};
use crate::pipeline::signals::WorkerContext;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

type SynthesisResult = Result<Option<AudioHandle>>;

struct InFlightSynthesis {
    text: String,
    epoch: u64,
    started: Instant,
    handle: TaskHandle<SynthesisResult>,
}

// ── Generation ──────────────────────────────────────────────────────────────

pub struct SpeechGenerationWorker {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    executor: BoundedExecutor,
    jobs: Arc<BoundedChannel<SpeechJob>>,
    audio: Arc<BoundedChannel<AudioRenderChunk>>,
    max_in_flight: usize,
    in_flight: VecDeque<InFlightSynthesis>,
    /// Job refused by a saturated pool, retried before the next queued one.
    deferred: Option<SpeechJob>,
    seen_epoch: u64,
}

impl SpeechGenerationWorker {
    /// # Errors
    ///
    /// Returns an error if the synthesis executor cannot start its threads.
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        jobs: Arc<BoundedChannel<SpeechJob>>,
        audio: Arc<BoundedChannel<AudioRenderChunk>>,
        config: &SpeechConfig,
    ) -> Result<Self> {
        let max_in_flight = config.max_in_flight.max(1);
        Ok(Self {
            synthesizer,
            executor: BoundedExecutor::new("companion-tts", max_in_flight)?,
            jobs,
            audio,
            max_in_flight,
            in_flight: VecDeque::with_capacity(max_in_flight),
            deferred: None,
            seen_epoch: 0,
        })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Worker loop. Returns once shutdown is requested.
    ///
    /// # Errors
    ///
    /// Never fails today; per-job problems are logged and skipped.
    pub fn run(mut self, ctx: &WorkerContext) -> Result<()> {
        self.seen_epoch = ctx.interrupt_epoch();
        while !ctx.is_shutting_down() {
            self.discard_after_interrupt(ctx);
            self.collect_ready(ctx);

            if self.in_flight.len() >= self.max_in_flight {
                self.wait_for_oldest(ctx);
                continue;
            }
            if let Some(job) = self.deferred.take() {
                self.start(ctx, job);
                continue;
            }
            match self.jobs.get(ctx.poll_interval()) {
                Recv::Item(job) => self.start(ctx, job),
                Recv::Sentinel | Recv::Empty => {}
            }
        }
        if !self.in_flight.is_empty() {
            debug!(
                pending = self.in_flight.len(),
                "dropping in-flight syntheses on shutdown"
            );
            self.in_flight.clear();
        }
        self.executor.shutdown();
        Ok(())
    }

    fn discard_after_interrupt(&mut self, ctx: &WorkerContext) {
        let epoch = ctx.interrupt_epoch();
        if epoch == self.seen_epoch {
            return;
        }
        self.seen_epoch = epoch;
        self.deferred = None;
        if !self.in_flight.is_empty() {
            // Dropping the handles drops the eventual audio, which deletes its file.
            info!(
                discarded = self.in_flight.len(),
                "interrupt: discarding in-flight syntheses"
            );
            self.in_flight.clear();
        }
    }

    fn start(&mut self, ctx: &WorkerContext, job: SpeechJob) {
        if ctx.interrupted_since(job.epoch) {
            debug!("dropping speech job from before interrupt");
            return;
        }
        let synthesizer = Arc::clone(&self.synthesizer);
        let text = job.text.clone();
        let params = job.params.clone();

        match self
            .executor
            .submit(move || synthesizer.synthesize(&text, &params))
        {
            Ok(handle) => self.in_flight.push_back(InFlightSynthesis {
                text: job.text,
                epoch: job.epoch,
                started: Instant::now(),
                handle,
            }),
            Err(SubmitError::Saturated) => {
                // Pool threads are still busy with discarded work; retry shortly.
                debug!(text = %job.text, "speech executor saturated; holding job");
                self.deferred = Some(job);
                std::thread::sleep(ctx.poll_interval().min(Duration::from_millis(20)));
            }
            Err(SubmitError::ShutDown) => {
                warn!("speech executor is shut down; dropping job");
            }
        }
    }

    /// Deliver finished syntheses from the front of the queue, in order.
    fn collect_ready(&mut self, ctx: &WorkerContext) {
        while let Some(front) = self.in_flight.front() {
            let TaskPoll::Ready(result) = front.handle.try_take() else {
                break;
            };
            if let Some(done) = self.in_flight.pop_front() {
                self.deliver(ctx, done, result);
            }
        }
    }

    fn wait_for_oldest(&mut self, ctx: &WorkerContext) {
        let Some(front) = self.in_flight.front() else {
            return;
        };
        if let TaskPoll::Ready(result) = front.handle.wait_timeout(ctx.poll_interval())
            && let Some(done) = self.in_flight.pop_front()
        {
            self.deliver(ctx, done, result);
        }
    }

    fn deliver(
        &self,
        ctx: &WorkerContext,
        done: InFlightSynthesis,
        result: std::result::Result<SynthesisResult, TaskError>,
    ) {
        match result {
            Ok(Ok(Some(audio))) => {
                if ctx.is_shutting_down() || ctx.interrupted_since(done.epoch) {
                    debug!("discarding synthesized audio after interrupt");
                    return;
                }
                let chunk = AudioRenderChunk {
                    audio,
                    source_text: done.text,
                    generation_duration: done.started.elapsed(),
                    epoch: done.epoch,
                };
                debug!(
                    generation_ms = chunk.generation_duration.as_millis() as u64,
                    "speech chunk ready"
                );
                let stale = || ctx.is_shutting_down() || ctx.interrupted_since(done.epoch);
                if self.audio.put_unless_stale(chunk, &stale) {
                    return;
                }
                if stale() {
                    debug!("discarding synthesized audio after interrupt");
                } else {
                    warn!("audio queue refused chunk");
                }
            }
            Ok(Ok(None)) => debug!(text = %done.text, "synthesizer produced no audio"),
            Ok(Err(e)) => warn!("speech synthesis failed: {e}"),
            Err(e) => error!("speech synthesis task failed: {e}"),
        }
    }
}

// ── Playback ────────────────────────────────────────────────────────────────

/// How one chunk left the playback worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Played,
    Failed,
    Interrupted,
}

pub struct SpeechPlaybackWorker {
    player: Arc<dyn AudioPlayer>,
    audio: Arc<BoundedChannel<AudioRenderChunk>>,
}

impl SpeechPlaybackWorker {
    pub fn new(
        player: Arc<dyn AudioPlayer>,
        audio: Arc<BoundedChannel<AudioRenderChunk>>,
    ) -> Self {
        Self { player, audio }
    }

    /// Worker loop. Returns once shutdown is requested.
    ///
    /// # Errors
    ///
    /// Never fails today; playback problems are logged and skipped.
    pub fn run(self, ctx: &WorkerContext) -> Result<()> {
        while !ctx.is_shutting_down() {
            if let Recv::Item(chunk) = self.audio.get(ctx.poll_interval()) {
                self.play_chunk(ctx, chunk);
            }
        }
        ctx.signals().set_speaking(false);
        Ok(())
    }

    /// Play one chunk to completion (or failure/interrupt), then release it.
    pub fn play_chunk(&self, ctx: &WorkerContext, chunk: AudioRenderChunk) -> PlaybackOutcome {
        let AudioRenderChunk {
            audio,
            source_text,
            epoch,
            ..
        } = chunk;

        let stale = || ctx.is_shutting_down() || ctx.interrupted_since(epoch);
        let signals = ctx.signals();
        let outcome = if stale() {
            PlaybackOutcome::Interrupted
        } else {
            signals.set_speaking(true);
            // An interrupt between the check above and raising the flag has
            // already cleared it; put it back down and skip the clip.
            if stale() {
                signals.set_speaking(false);
                info!("playback interrupted before start; chunk discarded");
                release(audio);
                return PlaybackOutcome::Interrupted;
            }
            let played = self.player.play(&audio, epoch);
            let interrupted = stale();
            // Stay "speaking" across back-to-back clips of the same reply.
            if interrupted || !played || self.audio.is_empty() {
                signals.set_speaking(false);
            }
            match (interrupted, played) {
                (true, _) => PlaybackOutcome::Interrupted,
                (false, true) => PlaybackOutcome::Played,
                (false, false) => PlaybackOutcome::Failed,
            }
        };

        match outcome {
            PlaybackOutcome::Played => debug!(text = %source_text, "chunk played"),
            PlaybackOutcome::Failed => warn!(text = %source_text, "audio playback failed"),
            PlaybackOutcome::Interrupted => info!("playback interrupted; chunk discarded"),
        }
        release(audio);
        outcome
    }
}

fn release(audio: AudioHandle) {
    if let Err(e) = audio.release() {
        warn!("failed to remove temporary audio: {e}");
    }
}
