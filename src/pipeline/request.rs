//! Request worker: transcription → [`ProcessingRequest`] → reply generator.
//!
//! At most one reply generation is outstanding at any time. A transcription
//! that arrives while one is in flight waits (bounded) for it to finish and
//! is dropped if it does not; requests never pile up behind a slow model.

use crate::collaborators::ReplyGenerator;
use crate::config::WorkerConfig;
use crate::error::Result;
use crate::pipeline::channel::{BoundedChannel, Recv};
use crate::pipeline::executor::{BoundedExecutor, TaskError, TaskHandle, TaskPoll};
use crate::pipeline::messages::{ProcessingRequest, StructuredReply, Transcription};
use crate::pipeline::signals::WorkerContext;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type GenerationResult = Result<Option<StructuredReply>>;

/// Where the worker is in its single-flight cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Idle,
    Dispatched,
}

/// The one outstanding reply generation.
#[derive(Debug)]
pub struct PendingReply {
    pub request_id: Uuid,
    forced_animation: Option<String>,
    epoch: u64,
    dispatched_at: Instant,
    handle: TaskHandle<GenerationResult>,
}

/// Result of trying to hand a request to the generator.
#[derive(Debug)]
pub enum DispatchOutcome {
    Dispatched(PendingReply),
    /// Not dispatched (shutdown, executor gone or saturated); the request is handed back.
    Aborted(ProcessingRequest),
}

pub struct RequestWorker {
    generator: Arc<dyn ReplyGenerator>,
    executor: BoundedExecutor,
    input: Arc<BoundedChannel<Transcription>>,
    replies: Arc<BoundedChannel<StructuredReply>>,
    wait_timeout: Duration,
    min_confidence: f32,
    pending: Option<PendingReply>,
}

impl RequestWorker {
    /// # Errors
    ///
    /// Returns an error if the reply executor cannot start its threads.
    pub fn new(
        generator: Arc<dyn ReplyGenerator>,
        input: Arc<BoundedChannel<Transcription>>,
        replies: Arc<BoundedChannel<StructuredReply>>,
        config: &WorkerConfig,
    ) -> Result<Self> {
        Ok(Self {
            generator,
            executor: BoundedExecutor::new("companion-reply", config.executor_size)?,
            input,
            replies,
            wait_timeout: config.dispatch_wait_timeout(),
            min_confidence: config.min_confidence,
            pending: None,
        })
    }

    pub fn phase(&self) -> RequestPhase {
        if self.pending.is_some() {
            RequestPhase::Dispatched
        } else {
            RequestPhase::Idle
        }
    }

    /// Worker loop. Returns once shutdown is requested.
    ///
    /// # Errors
    ///
    /// Never fails today; item-level problems are logged and skipped.
    pub fn run(mut self, ctx: &WorkerContext) -> Result<()> {
        while !ctx.is_shutting_down() {
            self.poll_pending(ctx);
            match self.input.get(ctx.poll_interval()) {
                Recv::Item(transcription) => self.handle_transcription(ctx, transcription),
                Recv::Sentinel | Recv::Empty => {}
            }
        }
        if let Some(pending) = self.pending.take() {
            info!(
                request_id = %pending.request_id,
                "shutdown with reply outstanding; result will be discarded"
            );
        }
        self.executor.shutdown();
        Ok(())
    }

    /// Submit a request to the generator without waiting for it.
    pub fn dispatch(&self, ctx: &WorkerContext, request: ProcessingRequest) -> DispatchOutcome {
        if ctx.is_shutting_down() || self.executor.is_shut_down() {
            return DispatchOutcome::Aborted(request);
        }

        let request_id = request.id;
        let forced_animation = request.forced_animation.clone();
        let request = Arc::new(request);
        let task_request = Arc::clone(&request);
        let generator = Arc::clone(&self.generator);

        match self.executor.submit(move || generator.generate(&task_request)) {
            Ok(handle) => {
                debug!(%request_id, "request dispatched");
                DispatchOutcome::Dispatched(PendingReply {
                    request_id,
                    forced_animation,
                    epoch: ctx.interrupt_epoch(),
                    dispatched_at: Instant::now(),
                    handle,
                })
            }
            Err(e) => {
                warn!(%request_id, "could not dispatch request: {e}");
                // The rejected task was dropped inside `submit`, so we hold the only reference.
                let request = Arc::try_unwrap(request).unwrap_or_else(|shared| (*shared).clone());
                DispatchOutcome::Aborted(request)
            }
        }
    }

    fn handle_transcription(&mut self, ctx: &WorkerContext, transcription: Transcription) {
        if transcription.confidence < self.min_confidence {
            debug!(
                confidence = transcription.confidence,
                "ignoring low-confidence transcription"
            );
            return;
        }
        let Some(request) = ProcessingRequest::from_transcription(transcription) else {
            return;
        };

        if self.pending.is_some() && !self.wait_for_pending(ctx) {
            warn!(
                request_id = %request.id,
                "previous reply still outstanding; dropping new request"
            );
            return;
        }

        match self.dispatch(ctx, request) {
            DispatchOutcome::Dispatched(pending) => self.pending = Some(pending),
            DispatchOutcome::Aborted(request) => {
                info!(request_id = %request.id, "request aborted without dispatch");
            }
        }
    }

    /// Wait up to the dispatch wait timeout for the outstanding reply.
    ///
    /// Returns `true` once the slot is free.
    fn wait_for_pending(&mut self, ctx: &WorkerContext) -> bool {
        let deadline = Instant::now() + self.wait_timeout;
        loop {
            let Some(pending) = self.pending.take() else {
                return true;
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            match pending.handle.wait_timeout(remaining.min(ctx.poll_interval())) {
                TaskPoll::Ready(result) => {
                    self.complete(ctx, pending, result);
                    return true;
                }
                TaskPoll::Pending => {
                    self.pending = Some(pending);
                    if ctx.is_shutting_down() || Instant::now() >= deadline {
                        return false;
                    }
                }
            }
        }
    }

    fn poll_pending(&mut self, ctx: &WorkerContext) {
        if let Some(pending) = self.pending.take() {
            match pending.handle.try_take() {
                TaskPoll::Ready(result) => self.complete(ctx, pending, result),
                TaskPoll::Pending => self.pending = Some(pending),
            }
        }
    }

    fn complete(
        &self,
        ctx: &WorkerContext,
        pending: PendingReply,
        result: std::result::Result<GenerationResult, TaskError>,
    ) {
        let request_id = pending.request_id;
        let elapsed_ms = pending.dispatched_at.elapsed().as_millis() as u64;
        match result {
            Ok(Ok(Some(mut reply))) => {
                if ctx.is_shutting_down() || ctx.interrupted_since(pending.epoch) {
                    info!(%request_id, elapsed_ms, "reply discarded after interrupt");
                    return;
                }
                if let Some(forced) = pending.forced_animation {
                    reply.animation_name = Some(forced);
                }
                reply.epoch = pending.epoch;
                let stale = || ctx.is_shutting_down() || ctx.interrupted_since(pending.epoch);
                if self.replies.put_unless_stale(reply, &stale) {
                    info!(%request_id, elapsed_ms, "reply completed");
                } else if stale() {
                    info!(%request_id, elapsed_ms, "reply discarded after interrupt");
                } else {
                    warn!(%request_id, "reply queue full; reply dropped");
                }
            }
            Ok(Ok(None)) => info!(%request_id, elapsed_ms, "generator produced no reply"),
            Ok(Err(e)) => warn!(%request_id, elapsed_ms, "reply generation failed: {e}"),
            Err(e) => error!(%request_id, "reply task failed: {e}"),
        }
    }
}
