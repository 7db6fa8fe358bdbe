//! Animation dispatch: renders animation requests, skipping repeats and
//! anything requested before the latest interrupt.

use crate::config::AnimationConfig;
use crate::error::Result;
use crate::pipeline::channel::{BoundedChannel, Recv};
use crate::pipeline::distributor::GuardedRenderer;
use crate::pipeline::messages::AnimationRequest;
use crate::pipeline::signals::WorkerContext;
use std::sync::Arc;
use tracing::debug;

pub struct AnimationWorker {
    requests: Arc<BoundedChannel<AnimationRequest>>,
    renderer: Arc<GuardedRenderer>,
    resting: String,
    /// Name of the animation last actually rendered.
    current: Option<String>,
    seen_epoch: u64,
}

impl AnimationWorker {
    pub fn new(
        requests: Arc<BoundedChannel<AnimationRequest>>,
        renderer: Arc<GuardedRenderer>,
        config: &AnimationConfig,
    ) -> Self {
        Self {
            requests,
            renderer,
            resting: config.resting.clone(),
            current: None,
            seen_epoch: 0,
        }
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Worker loop. Returns once shutdown is requested.
    ///
    /// # Errors
    ///
    /// Never fails today; render problems are logged by the renderer guard.
    pub fn run(mut self, ctx: &WorkerContext) -> Result<()> {
        self.seen_epoch = ctx.interrupt_epoch();
        while !ctx.is_shutting_down() {
            self.rest_after_interrupt(ctx);
            if let Recv::Item(request) = self.requests.get(ctx.poll_interval()) {
                // An interrupt may have landed while we were waiting.
                self.rest_after_interrupt(ctx);
                self.handle(request);
            }
        }
        Ok(())
    }

    /// Render `request` unless it is stale or already showing.
    ///
    /// Returns `true` if the renderer was called.
    pub fn handle(&mut self, request: AnimationRequest) -> bool {
        if request.epoch < self.seen_epoch {
            debug!(animation = %request.name, epoch = request.epoch, "stale animation dropped");
            return false;
        }
        if self.current.as_deref() == Some(request.name.as_str()) {
            debug!(animation = %request.name, "animation unchanged; skipping");
            return false;
        }
        if self.renderer.render_animation(&request.name) {
            self.current = Some(request.name);
            true
        } else {
            false
        }
    }

    /// The interrupt emptied the queue; put the avatar back to rest.
    fn rest_after_interrupt(&mut self, ctx: &WorkerContext) {
        let epoch = ctx.interrupt_epoch();
        if epoch == self.seen_epoch {
            return;
        }
        self.seen_epoch = epoch;
        debug!("interrupt: resting animation");
        self.handle(AnimationRequest::new(self.resting.as_str(), epoch));
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::pipeline::signals::PipelineSignals;
    use crate::test_utils::{RecordingRenderer, wait_until};
    use std::time::Duration;

    fn worker(renderer: &Arc<RecordingRenderer>) -> AnimationWorker {
        AnimationWorker::new(
            Arc::new(BoundedChannel::ring("animation", 4)),
            Arc::new(GuardedRenderer::new(renderer.clone())),
            &AnimationConfig::default(),
        )
    }

    #[test]
    fn repeated_animation_renders_once() {
        let renderer = Arc::new(RecordingRenderer::default());
        let mut worker = worker(&renderer);

        assert!(worker.handle(AnimationRequest::new("wave", 0)));
        assert!(!worker.handle(AnimationRequest::new("wave", 0)));
        assert_eq!(renderer.animations(), vec!["wave"]);

        assert!(worker.handle(AnimationRequest::new("idle", 0)));
        assert!(worker.handle(AnimationRequest::new("wave", 0)));
        assert_eq!(renderer.animations(), vec!["wave", "idle", "wave"]);
    }

    #[test]
    fn failed_render_does_not_count_as_current() {
        let renderer = Arc::new(RecordingRenderer::not_ready());
        let mut worker = worker(&renderer);
        assert!(!worker.handle(AnimationRequest::new("wave", 0)));
        assert_eq!(worker.current(), None);
    }

    #[test]
    fn request_from_before_interrupt_is_never_rendered() {
        let renderer = Arc::new(RecordingRenderer::default());
        let worker = worker(&renderer);
        let requests = Arc::clone(&worker.requests);
        let signals = PipelineSignals::default();
        let ctx = WorkerContext::new("animation", signals.clone(), Duration::from_millis(10));
        let handle = std::thread::spawn(move || worker.run(&ctx).unwrap());

        requests.put(AnimationRequest::new("wave", 0));
        assert!(wait_until(Duration::from_secs(2), || {
            renderer.animations() == vec!["wave"]
        }));
        signals.raise_interrupt();
        signals.clear_interrupt();
        assert!(wait_until(Duration::from_secs(2), || {
            renderer.animations() == vec!["wave", "idle"]
        }));

        // Queued by a producer that checked before the interrupt landed.
        requests.put(AnimationRequest::new("talking", 0));
        requests.put(AnimationRequest::new("nod", 1));
        assert!(wait_until(Duration::from_secs(2), || {
            renderer.animations() == vec!["wave", "idle", "nod"]
        }));
        assert!(!renderer.animations().contains(&"talking".to_owned()));

        signals.request_shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn interrupt_returns_to_resting_animation() {
        let renderer = Arc::new(RecordingRenderer::default());
        let worker = worker(&renderer);
        let requests = Arc::clone(&worker.requests);
        let signals = PipelineSignals::default();
        let ctx = WorkerContext::new("animation", signals.clone(), Duration::from_millis(10));
        let handle = std::thread::spawn(move || worker.run(&ctx).unwrap());

        requests.put(AnimationRequest::new("talking", 0));
        assert!(wait_until(Duration::from_secs(2), || {
            renderer.animations() == vec!["talking"]
        }));

        signals.raise_interrupt();
        signals.clear_interrupt();
        assert!(wait_until(Duration::from_secs(2), || {
            renderer.animations() == vec!["talking", "idle"]
        }));

        signals.request_shutdown();
        handle.join().unwrap();
    }
}
