//! Shared test utilities used across multiple test modules.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use crate::collaborators::{RenderError, Renderer};
use crate::pipeline::segments::SegmentKind;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// One call observed by [`RecordingRenderer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderCall {
    Segment(SegmentKind, String),
    Animation(String),
    ResetStatus,
}

/// Renderer that records every call; can pretend the UI is not mounted.
#[derive(Debug, Default)]
pub struct RecordingRenderer {
    calls: Mutex<Vec<RenderCall>>,
    not_ready: AtomicBool,
    attempts: AtomicUsize,
}

impl RecordingRenderer {
    pub fn not_ready() -> Self {
        let renderer = Self::default();
        renderer.not_ready.store(true, Ordering::SeqCst);
        renderer
    }

    pub fn calls(&self) -> Vec<RenderCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn animations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                RenderCall::Animation(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    /// Calls made, including ones rejected as not ready.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn record(&self, call: RenderCall) -> Result<(), RenderError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.not_ready.load(Ordering::SeqCst) {
            return Err(RenderError::NotReady);
        }
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

impl Renderer for RecordingRenderer {
    fn render_segment(&self, kind: SegmentKind, content: &str) -> Result<(), RenderError> {
        self.record(RenderCall::Segment(kind, content.to_owned()))
    }

    fn render_animation(&self, name: &str) -> Result<(), RenderError> {
        self.record(RenderCall::Animation(name.to_owned()))
    }

    fn reset_status(&self) -> Result<(), RenderError> {
        self.record(RenderCall::ResetStatus)
    }
}

/// Poll `cond` every few milliseconds until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
