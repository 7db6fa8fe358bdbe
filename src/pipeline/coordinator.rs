//! Lifecycle coordinator: owns the channels and signals, runs the workers.
//!
//! The coordinator is the only component allowed to clear every channel or
//! flip the shutdown/interrupt signals. Workers get a [`WorkerContext`] and
//! are expected to cooperate: bounded `get` timeouts, signal checks every
//! poll cycle. Nothing is ever killed.

use crate::config::{CompanionConfig, ShutdownConfig};
use crate::error::{CompanionError, Result};
use crate::pipeline::channel::{ChannelStats, ManagedChannel};
use crate::pipeline::executor::panic_message;
use crate::pipeline::signals::{PipelineSignals, WorkerContext};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Granularity of the join-with-timeout loop.
const JOIN_POLL: Duration = Duration::from_millis(5);

/// Lifecycle state of a registered worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Error,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// How long shutdown waits for a worker on the first pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerClass {
    /// Pipeline stage; joined with the full shutdown timeout.
    Critical,
    /// Non-critical helper (health monitor); joined with a short timeout.
    Background,
}

/// Coordinator-side record of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerRecord {
    pub name: String,
    pub class: WorkerClass,
    pub state: WorkerState,
    pub last_error: Option<String>,
}

/// Whether the shutdown protocol injects a sentinel into a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    /// Raw input fed from outside the pipeline; cleared but never woken.
    Input,
    /// Between two stages; receives one sentinel on shutdown.
    MidPipeline,
}

/// Outcome of [`LifecycleCoordinator::stop_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StopReport {
    /// Workers whose threads were joined.
    pub stopped: Vec<String>,
    /// Workers still running after the forced pass; left to the OS.
    pub abandoned: Vec<String>,
    /// Whether a forced pass ran.
    pub forced: bool,
    /// Items discarded from channels.
    pub items_cleared: usize,
    pub elapsed_ms: u64,
}

impl StopReport {
    pub fn all_stopped(&self) -> bool {
        self.abandoned.is_empty()
    }
}

/// Snapshot returned by [`LifecycleCoordinator::health_check`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub shutting_down: bool,
    pub workers: Vec<WorkerRecord>,
    pub queue_pressure_warnings: Vec<String>,
    pub channels: Vec<ChannelStats>,
    pub checked_at: DateTime<Utc>,
}

type RunFn = Box<dyn FnOnce(&WorkerContext) -> Result<()> + Send + 'static>;
type InterruptHook = Box<dyn Fn(u64) + Send + Sync + 'static>;

struct WorkerSlot {
    name: String,
    class: WorkerClass,
    run: Option<RunFn>,
    handle: Option<JoinHandle<()>>,
}

struct Shared {
    signals: PipelineSignals,
    records: Mutex<Vec<WorkerRecord>>,
    channels: Mutex<Vec<(ChannelRole, Arc<dyn ManagedChannel>)>>,
    started: AtomicBool,
    pressure_grace: Duration,
}

impl Shared {
    fn records(&self) -> MutexGuard<'_, Vec<WorkerRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn channels(&self) -> Vec<(ChannelRole, Arc<dyn ManagedChannel>)> {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_state(&self, name: &str, state: WorkerState, last_error: Option<String>) {
        let mut records = self.records();
        if let Some(record) = records.iter_mut().find(|r| r.name == name) {
            record.state = state;
            if last_error.is_some() {
                record.last_error = last_error;
            }
        }
    }

    fn check(&self) -> HealthReport {
        let shutting_down = self.signals.is_shutting_down();
        let expect_running = self.started.load(Ordering::SeqCst) && !shutting_down;
        let workers = self.records().clone();

        let mut healthy = true;
        if expect_running {
            for record in &workers {
                if record.state != WorkerState::Running {
                    healthy = false;
                }
            }
        }

        let mut queue_pressure_warnings = Vec::new();
        let mut channels = Vec::new();
        for (_, channel) in self.channels() {
            if let Some(since) = channel.backpressure_since() {
                let held = since.elapsed();
                if held >= self.pressure_grace {
                    queue_pressure_warnings.push(format!(
                        "{} under backpressure for {}ms",
                        channel.name(),
                        held.as_millis()
                    ));
                }
            }
            channels.push(channel.stats());
        }
        if !queue_pressure_warnings.is_empty() {
            healthy = false;
        }

        HealthReport {
            healthy,
            shutting_down,
            workers,
            queue_pressure_warnings,
            channels,
            checked_at: Utc::now(),
        }
    }
}

/// Cloneable read-only view used by the health monitor worker.
#[derive(Clone)]
pub struct HealthProbe {
    shared: Arc<Shared>,
}

impl HealthProbe {
    pub fn check(&self) -> HealthReport {
        self.shared.check()
    }
}

impl std::fmt::Debug for HealthProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthProbe").finish_non_exhaustive()
    }
}

/// Starts, supervises, interrupts and stops the pipeline workers.
pub struct LifecycleCoordinator {
    shared: Arc<Shared>,
    workers: Vec<WorkerSlot>,
    interrupt_hooks: Vec<InterruptHook>,
    poll_interval: Duration,
    shutdown: ShutdownConfig,
}

impl LifecycleCoordinator {
    /// Create a coordinator around existing signals.
    ///
    /// `pressure_grace` is how long a channel may sit above its high
    /// watermark before health reports it.
    pub fn new(
        signals: PipelineSignals,
        poll_interval: Duration,
        pressure_grace: Duration,
        shutdown: ShutdownConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                signals,
                records: Mutex::new(Vec::new()),
                channels: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                pressure_grace,
            }),
            workers: Vec::new(),
            interrupt_hooks: Vec::new(),
            poll_interval,
            shutdown,
        }
    }

    pub fn from_config(config: &CompanionConfig) -> Self {
        Self::new(
            PipelineSignals::new(config.speech.enabled),
            config.workers.poll_interval(),
            config.health.interval(),
            config.shutdown.clone(),
        )
    }

    pub fn signals(&self) -> &PipelineSignals {
        &self.shared.signals
    }

    pub fn shutdown_config(&self) -> &ShutdownConfig {
        &self.shutdown
    }

    pub fn health_probe(&self) -> HealthProbe {
        HealthProbe {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Put a channel under coordinator control (interrupt, shutdown, health).
    pub fn register_channel(&self, role: ChannelRole, channel: Arc<dyn ManagedChannel>) {
        self.shared
            .channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((role, channel));
    }

    /// Run `hook` with the new epoch during every interrupt, after channels
    /// are cleared.
    pub fn on_interrupt(&mut self, hook: impl Fn(u64) + Send + Sync + 'static) {
        self.interrupt_hooks.push(Box::new(hook));
    }

    /// Register a worker loop.
    ///
    /// It runs on its own thread once [`start_all`](Self::start_all) is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is already taken or workers were already started.
    pub fn register_worker<F>(&mut self, name: &str, class: WorkerClass, run: F) -> Result<()>
    where
        F: FnOnce(&WorkerContext) -> Result<()> + Send + 'static,
    {
        if self.shared.started.load(Ordering::SeqCst) {
            return Err(CompanionError::Worker(format!(
                "cannot register {name}: workers already started"
            )));
        }
        if self.workers.iter().any(|w| w.name == name) {
            return Err(CompanionError::Worker(format!(
                "worker {name} is already registered"
            )));
        }
        self.workers.push(WorkerSlot {
            name: name.to_owned(),
            class,
            run: Some(Box::new(run)),
            handle: None,
        });
        self.shared.records().push(WorkerRecord {
            name: name.to_owned(),
            class,
            state: WorkerState::Stopped,
            last_error: None,
        });
        Ok(())
    }

    /// Snapshot of every worker record.
    pub fn worker_records(&self) -> Vec<WorkerRecord> {
        self.shared.records().clone()
    }

    /// Spawn one thread per registered worker.
    ///
    /// # Errors
    ///
    /// Returns an error if a thread cannot be spawned; that worker is
    /// recorded as [`WorkerState::Error`] and the others keep running.
    pub fn start_all(&mut self) -> Result<()> {
        self.shared.started.store(true, Ordering::SeqCst);
        let mut first_error = None;

        for slot in &mut self.workers {
            let Some(run) = slot.run.take() else {
                continue;
            };
            self.shared.set_state(&slot.name, WorkerState::Starting, None);

            let shared = Arc::clone(&self.shared);
            let ctx = WorkerContext::new(
                slot.name.clone(),
                self.shared.signals.clone(),
                self.poll_interval,
            );
            let spawned = std::thread::Builder::new()
                .name(format!("companion-{}", slot.name))
                .spawn(move || run_supervised(&shared, &ctx, run));

            match spawned {
                Ok(handle) => slot.handle = Some(handle),
                Err(e) => {
                    let message = format!("failed to spawn worker thread: {e}");
                    error!(worker = %slot.name, "{message}");
                    self.shared
                        .set_state(&slot.name, WorkerState::Error, Some(message.clone()));
                    first_error.get_or_insert(CompanionError::Worker(message));
                }
            }
        }
        info!(workers = self.workers.len(), "pipeline workers started");
        first_error.map_or(Ok(()), Err)
    }

    /// Interrupt the current turn: clear every channel, stop speaking, run hooks.
    ///
    /// Returns the number of queued items discarded. The interrupt flag is
    /// cleared again before returning; workers notice the interrupt through
    /// the epoch bump.
    pub fn trigger_interrupt(&self) -> usize {
        let signals = &self.shared.signals;
        let epoch = signals.raise_interrupt();
        let cleared: usize = self
            .shared
            .channels()
            .iter()
            .map(|(_, channel)| channel.clear())
            .sum();
        signals.set_speaking(false);
        for hook in &self.interrupt_hooks {
            hook(epoch);
        }
        signals.clear_interrupt();
        info!(epoch, cleared, "interrupt propagated");
        cleared
    }

    /// Lower the transient interrupt flag.
    pub fn clear_interrupt(&self) {
        self.shared.signals.clear_interrupt();
    }

    pub fn health_check(&self) -> HealthReport {
        self.shared.check()
    }

    /// Run the shutdown protocol.
    ///
    /// 1. raise the shutdown signal,
    /// 2. wake every mid-pipeline consumer with one sentinel,
    /// 3. clear every channel,
    /// 4. join workers (background ones with a shorter budget),
    /// 5. if any are left and this was not already forced, repeat once forced
    ///    with the configured forced timeout.
    ///
    /// Workers still alive after that are reported as abandoned; their
    /// threads are detached, never killed.
    pub fn stop_all(&mut self, timeout: Duration, force: bool) -> StopReport {
        let started = Instant::now();
        info!(timeout_ms = timeout.as_millis() as u64, force, "stopping pipeline");

        self.shared.signals.request_shutdown();
        let channels = self.shared.channels();
        for (role, channel) in &channels {
            if *role == ChannelRole::MidPipeline {
                channel.inject_sentinel();
            }
        }
        let items_cleared: usize = channels.iter().map(|(_, channel)| channel.clear()).sum();

        let deadline = started + timeout;
        let background_deadline =
            started + timeout.min(self.shutdown.background_join_timeout());

        let mut report = StopReport {
            forced: force,
            items_cleared,
            ..StopReport::default()
        };
        for slot in &mut self.workers {
            let Some(handle) = slot.handle.take() else {
                continue;
            };
            let slot_deadline = match slot.class {
                WorkerClass::Critical => deadline,
                WorkerClass::Background => background_deadline,
            };
            while !handle.is_finished() && Instant::now() < slot_deadline {
                std::thread::sleep(JOIN_POLL);
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    warn!(worker = %slot.name, "worker thread ended with an uncaught panic");
                }
                report.stopped.push(slot.name.clone());
            } else {
                slot.handle = Some(handle);
                report.abandoned.push(slot.name.clone());
            }
        }

        if !report.abandoned.is_empty() && !force {
            warn!(
                stragglers = ?report.abandoned,
                "workers did not stop in time; running forced pass"
            );
            let forced = self.stop_all(self.shutdown.forced_timeout(), true);
            report.stopped.extend(forced.stopped);
            report.abandoned = forced.abandoned;
            report.items_cleared += forced.items_cleared;
            report.forced = true;
        } else if !report.abandoned.is_empty() {
            warn!(abandoned = ?report.abandoned, "abandoning unresponsive workers");
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            stopped = report.stopped.len(),
            abandoned = report.abandoned.len(),
            elapsed_ms = report.elapsed_ms,
            forced = report.forced,
            "pipeline stop pass complete"
        );
        report
    }
}

impl std::fmt::Debug for LifecycleCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleCoordinator")
            .field("workers", &self.workers.len())
            .field("interrupt_hooks", &self.interrupt_hooks.len())
            .finish_non_exhaustive()
    }
}

/// Thread body: records lifecycle transitions around the worker's loop.
fn run_supervised(shared: &Shared, ctx: &WorkerContext, run: RunFn) {
    let name = ctx.name().to_owned();
    shared.set_state(&name, WorkerState::Running, None);
    info!(worker = %name, "worker running");

    match catch_unwind(AssertUnwindSafe(|| run(ctx))) {
        Ok(Ok(())) => {
            shared.set_state(&name, WorkerState::Stopped, None);
            info!(worker = %name, "worker stopped");
        }
        Ok(Err(e)) => {
            error!(worker = %name, "worker failed: {e}");
            shared.set_state(&name, WorkerState::Error, Some(e.to_string()));
        }
        Err(payload) => {
            let message = format!("worker panicked: {}", panic_message(payload.as_ref()));
            error!(worker = %name, "{message}");
            shared.set_state(&name, WorkerState::Error, Some(message));
        }
    }
}
