//! Cross-cutting pipeline signals and the per-worker context.
//!
//! The coordinator owns one [`PipelineSignals`] and hands clones to every
//! worker at construction time. Nothing here is a process global.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct SignalState {
    shutdown: CancellationToken,
    interrupt: AtomicBool,
    interrupt_epoch: AtomicU64,
    speaking: AtomicBool,
    voice_enabled: AtomicBool,
}

/// Shared flags: shutdown (terminal), interrupt (transient), speaking, voice output.
#[derive(Debug, Clone)]
pub struct PipelineSignals {
    inner: Arc<SignalState>,
}

impl Default for PipelineSignals {
    fn default() -> Self {
        Self::new(true)
    }
}

impl PipelineSignals {
    pub fn new(voice_enabled: bool) -> Self {
        Self {
            inner: Arc::new(SignalState {
                shutdown: CancellationToken::new(),
                interrupt: AtomicBool::new(false),
                interrupt_epoch: AtomicU64::new(0),
                speaking: AtomicBool::new(false),
                voice_enabled: AtomicBool::new(voice_enabled),
            }),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Token cancelled once shutdown is requested; never reset.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub(crate) fn request_shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupt.load(Ordering::SeqCst)
    }

    /// Number of interrupts triggered so far.
    pub fn interrupt_epoch(&self) -> u64 {
        self.inner.interrupt_epoch.load(Ordering::SeqCst)
    }

    /// Whether an interrupt happened after work tagged with `epoch` started.
    pub fn interrupted_since(&self, epoch: u64) -> bool {
        self.is_interrupted() || self.interrupt_epoch() != epoch
    }

    /// Raise the interrupt flag and start a new epoch. Returns the new epoch.
    pub(crate) fn raise_interrupt(&self) -> u64 {
        self.inner.interrupt.store(true, Ordering::SeqCst);
        self.inner.interrupt_epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn clear_interrupt(&self) {
        self.inner.interrupt.store(false, Ordering::SeqCst);
    }

    pub fn is_speaking(&self) -> bool {
        self.inner.speaking.load(Ordering::SeqCst)
    }

    pub(crate) fn set_speaking(&self, speaking: bool) {
        self.inner.speaking.store(speaking, Ordering::SeqCst);
    }

    pub fn voice_enabled(&self) -> bool {
        self.inner.voice_enabled.load(Ordering::SeqCst)
    }

    pub fn set_voice_enabled(&self, enabled: bool) {
        self.inner.voice_enabled.store(enabled, Ordering::SeqCst);
    }
}

/// Handle a worker's run loop receives from the coordinator.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    name: String,
    signals: PipelineSignals,
    poll_interval: Duration,
}

impl WorkerContext {
    pub fn new(name: impl Into<String>, signals: PipelineSignals, poll_interval: Duration) -> Self {
        Self {
            name: name.into(),
            signals,
            poll_interval,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signals(&self) -> &PipelineSignals {
        &self.signals
    }

    /// Upper bound for any single blocking call inside the loop.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn is_shutting_down(&self) -> bool {
        self.signals.is_shutting_down()
    }

    pub fn is_interrupted(&self) -> bool {
        self.signals.is_interrupted()
    }

    pub fn interrupt_epoch(&self) -> u64 {
        self.signals.interrupt_epoch()
    }

    /// Whether an interrupt happened after work tagged with `epoch` started.
    pub fn interrupted_since(&self, epoch: u64) -> bool {
        self.signals.interrupted_since(epoch)
    }

    /// Deadline for a blocking call, capped at one poll interval.
    pub fn deadline(&self, wanted: Duration) -> Instant {
        Instant::now() + wanted.min(self.poll_interval)
    }

    /// Sleep for `total`, waking every poll interval to check for shutdown.
    ///
    /// Returns `false` if shutdown was requested before the time elapsed.
    pub fn sleep(&self, total: Duration) -> bool {
        let end = Instant::now() + total;
        loop {
            if self.is_shutting_down() {
                return false;
            }
            let now = Instant::now();
            if now >= end {
                return true;
            }
            std::thread::sleep((end - now).min(self.poll_interval));
        }
    }
}
