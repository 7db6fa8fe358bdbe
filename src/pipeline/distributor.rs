//! Response distributor: fans one [`StructuredReply`] out to the renderer,
//! the speech pipeline, the animation worker and (optionally) the camera.
//!
//! Each fan-out step fails on its own; a renderer error never stops speech
//! from being queued and vice versa.

use crate::collaborators::{RenderError, Renderer, VisionLookup};
use crate::config::DistributorConfig;
use crate::error::Result;
use crate::pipeline::channel::{BoundedChannel, Recv};
use crate::pipeline::messages::{
    AnimationRequest, META_VISUAL_CONTEXT, SpeechJob, StructuredReply, Transcription,
    TranscriptionSource,
};
use crate::pipeline::segments::{SegmentKind, batch_segments, split_display, split_sentences};
use crate::pipeline::signals::{PipelineSignals, WorkerContext};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// ── Renderer guard ──────────────────────────────────────────────────────────

/// Wraps the renderer so "UI not mounted" becomes a logged no-op.
///
/// The first [`RenderError::NotReady`] is remembered and every later call is
/// skipped without touching the renderer.
pub struct GuardedRenderer {
    inner: Arc<dyn Renderer>,
    unready: AtomicBool,
}

impl std::fmt::Debug for GuardedRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedRenderer")
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl GuardedRenderer {
    pub fn new(inner: Arc<dyn Renderer>) -> Self {
        Self {
            inner,
            unready: AtomicBool::new(false),
        }
    }

    pub fn is_ready(&self) -> bool {
        !self.unready.load(Ordering::SeqCst)
    }

    /// Returns `true` if the segment was rendered.
    pub fn render_segment(&self, kind: SegmentKind, content: &str) -> bool {
        self.guard("render segment", || self.inner.render_segment(kind, content))
    }

    pub fn render_animation(&self, name: &str) -> bool {
        self.guard("render animation", || self.inner.render_animation(name))
    }

    pub fn reset_status(&self) -> bool {
        self.guard("reset status", || self.inner.reset_status())
    }

    fn guard(
        &self,
        what: &str,
        call: impl FnOnce() -> std::result::Result<(), RenderError>,
    ) -> bool {
        if !self.is_ready() {
            return false;
        }
        match call() {
            Ok(()) => true,
            Err(RenderError::NotReady) => {
                if !self.unready.swap(true, Ordering::SeqCst) {
                    warn!("renderer not ready during {what}; skipping further render calls");
                }
                false
            }
            Err(e) => {
                warn!("{what} failed: {e}");
                false
            }
        }
    }
}

// ── Vision trigger ──────────────────────────────────────────────────────────

/// Throttled camera look-up that feeds its description back in as input.
///
/// At most one look runs at a time and two looks are at least
/// `min_interval` apart, so a reply that keeps asking to look cannot loop.
pub struct VisionTrigger {
    lookup: Arc<dyn VisionLookup>,
    input: Arc<BoundedChannel<Transcription>>,
    min_interval: Duration,
    last_started: Option<Instant>,
    in_flight: Arc<AtomicBool>,
}

impl std::fmt::Debug for VisionTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisionTrigger")
            .field("min_interval", &self.min_interval)
            .field("in_flight", &self.in_flight.load(Ordering::SeqCst))
            .finish()
    }
}

/// Clears the in-flight flag when the helper thread exits, panics included.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl VisionTrigger {
    pub fn new(
        lookup: Arc<dyn VisionLookup>,
        input: Arc<BoundedChannel<Transcription>>,
        min_interval: Duration,
    ) -> Self {
        Self {
            lookup,
            input,
            min_interval,
            last_started: None,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start a look-up on a short-lived thread unless throttled.
    ///
    /// Returns `true` if a look was started.
    pub fn trigger(&mut self, signals: &PipelineSignals) -> bool {
        if self.in_flight.load(Ordering::SeqCst) {
            debug!("vision look already in flight");
            return false;
        }
        if let Some(last) = self.last_started
            && last.elapsed() < self.min_interval
        {
            debug!(
                since_ms = last.elapsed().as_millis() as u64,
                "vision look throttled"
            );
            return false;
        }

        self.in_flight.store(true, Ordering::SeqCst);
        let guard = InFlightGuard(Arc::clone(&self.in_flight));
        let lookup = Arc::clone(&self.lookup);
        let input = Arc::clone(&self.input);
        let signals = signals.clone();
        let epoch = signals.interrupt_epoch();

        let spawned = std::thread::Builder::new()
            .name("companion-vision".to_owned())
            .spawn(move || {
                let _guard = guard;
                look_and_reinject(lookup.as_ref(), &input, &signals, epoch);
            });
        match spawned {
            Ok(_) => {
                self.last_started = Some(Instant::now());
                true
            }
            Err(e) => {
                // The closure (and its guard) was dropped, so the flag is already clear.
                warn!("failed to spawn vision helper: {e}");
                false
            }
        }
    }
}

fn look_and_reinject(
    lookup: &dyn VisionLookup,
    input: &BoundedChannel<Transcription>,
    signals: &PipelineSignals,
    epoch: u64,
) {
    let description = match lookup.look_now() {
        Ok(d) => d.trim().to_owned(),
        Err(e) => {
            warn!("vision look-up failed: {e}");
            return;
        }
    };
    if description.is_empty() {
        debug!("vision look-up returned nothing");
        return;
    }
    let stale = || signals.is_shutting_down() || signals.interrupted_since(epoch);
    if stale() {
        info!("discarding vision result after interrupt");
        return;
    }
    let transcription = Transcription {
        source: TranscriptionSource::Vision,
        ..Transcription::typed(description.clone())
    }
    .with_metadata(META_VISUAL_CONTEXT, description);
    if input.put_unless_stale(transcription, &stale) {
        info!("vision description re-injected");
    } else if stale() {
        info!("discarding vision result after interrupt");
    } else {
        warn!("input channel refused vision description");
    }
}

// ── Distributor ─────────────────────────────────────────────────────────────

/// What one call to [`ResponseDistributor::distribute`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Distribution {
    pub segments_rendered: usize,
    pub speech_jobs: usize,
    pub animation_queued: bool,
    pub vision_started: bool,
}

#[derive(Debug, Clone, Copy)]
struct PendingTail {
    due: Instant,
    epoch: u64,
}

pub struct ResponseDistributor {
    replies: Arc<BoundedChannel<StructuredReply>>,
    speech: Arc<BoundedChannel<SpeechJob>>,
    animation: Arc<BoundedChannel<AnimationRequest>>,
    renderer: Arc<GuardedRenderer>,
    vision: Option<VisionTrigger>,
    resting: String,
    tail_delay: Duration,
    pending_tail: Option<PendingTail>,
}

impl ResponseDistributor {
    pub fn new(
        replies: Arc<BoundedChannel<StructuredReply>>,
        speech: Arc<BoundedChannel<SpeechJob>>,
        animation: Arc<BoundedChannel<AnimationRequest>>,
        renderer: Arc<GuardedRenderer>,
        resting: impl Into<String>,
        config: &DistributorConfig,
    ) -> Self {
        Self {
            replies,
            speech,
            animation,
            renderer,
            vision: None,
            resting: resting.into(),
            tail_delay: Duration::from_millis(config.tail_delay_ms),
            pending_tail: None,
        }
    }

    /// Honour `look_at_camera` side effects through `vision`.
    pub fn with_vision(mut self, vision: VisionTrigger) -> Self {
        self.vision = Some(vision);
        self
    }

    /// Worker loop. Returns once shutdown is requested.
    ///
    /// # Errors
    ///
    /// Never fails today; per-reply problems are logged and skipped.
    pub fn run(mut self, ctx: &WorkerContext) -> Result<()> {
        while !ctx.is_shutting_down() {
            self.run_due_tail(ctx);
            match self.replies.get(ctx.poll_interval()) {
                Recv::Item(reply) => {
                    let summary = self.distribute(ctx, reply);
                    debug!(?summary, "reply distributed");
                }
                Recv::Sentinel | Recv::Empty => {}
            }
        }
        Ok(())
    }

    /// Render, queue speech and animation, trigger vision, schedule the tail.
    ///
    /// Everything is tagged with the reply's epoch. A reply from before the
    /// latest interrupt is dropped whole; an interrupt that lands part-way
    /// through stops the remaining steps and nothing stale reaches a channel.
    pub fn distribute(&mut self, ctx: &WorkerContext, reply: StructuredReply) -> Distribution {
        let epoch = reply.epoch;
        let stale = || ctx.is_shutting_down() || ctx.interrupted_since(epoch);
        let mut summary = Distribution::default();
        if stale() {
            info!(epoch, "discarding reply from before interrupt");
            return summary;
        }

        for segment in batch_segments(split_display(&reply.display_text)) {
            if stale() {
                break;
            }
            if self.renderer.render_segment(segment.kind, &segment.content) {
                summary.segments_rendered += 1;
            }
        }

        if let Some(name) = reply
            .animation_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
        {
            summary.animation_queued = self
                .animation
                .put_unless_stale(AnimationRequest::new(name, epoch), &stale);
        }

        if ctx.signals().voice_enabled() {
            for sentence in split_sentences(&reply.speech_text) {
                let job = SpeechJob {
                    text: sentence,
                    params: reply.speech_params.clone(),
                    epoch,
                };
                if self.speech.put_unless_stale(job, &stale) {
                    summary.speech_jobs += 1;
                } else if stale() {
                    break;
                } else {
                    warn!("speech queue refused a sentence");
                }
            }
        } else if !reply.speech_text.trim().is_empty() {
            debug!("voice output disabled; not queueing speech");
        }

        if stale() {
            info!(epoch, ?summary, "interrupt during distribution; remaining steps skipped");
            return summary;
        }

        if reply.side_effects.look_at_camera {
            summary.vision_started = match self.vision.as_mut() {
                Some(vision) => vision.trigger(ctx.signals()),
                None => {
                    debug!("reply asked to look but vision is disabled");
                    false
                }
            };
        }

        self.pending_tail = Some(PendingTail {
            due: Instant::now() + self.tail_delay,
            epoch,
        });
        summary
    }

    /// Reset status UI and rest the avatar once the reply has finished.
    ///
    /// Waits for the tail delay and for queued speech to drain. Dropped if an
    /// interrupt happened since the reply was distributed.
    fn run_due_tail(&mut self, ctx: &WorkerContext) {
        let Some(tail) = self.pending_tail else {
            return;
        };
        if ctx.interrupted_since(tail.epoch) {
            self.pending_tail = None;
            return;
        }
        if Instant::now() < tail.due || ctx.signals().is_speaking() || !self.speech.is_empty() {
            return;
        }
        self.pending_tail = None;
        self.renderer.reset_status();
        let resting = AnimationRequest::new(self.resting.as_str(), tail.epoch);
        if !self
            .animation
            .put_unless_stale(resting, || ctx.interrupted_since(tail.epoch))
        {
            debug!("resting request dropped after interrupt");
        }
    }
}
