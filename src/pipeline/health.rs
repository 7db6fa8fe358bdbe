//! Periodic health polling.
//!
//! Observe-only: the monitor logs when overall health changes and when a
//! worker newly fails. It never restarts anything.

use crate::error::Result;
use crate::pipeline::coordinator::{HealthProbe, HealthReport, WorkerState};
use crate::pipeline::signals::WorkerContext;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct HealthMonitor {
    probe: HealthProbe,
    interval: Duration,
    last_healthy: Option<bool>,
    /// Workers already reported as failed, so each failure is logged once.
    reported: BTreeSet<String>,
}

impl HealthMonitor {
    pub fn new(probe: HealthProbe, interval: Duration) -> Self {
        Self {
            probe,
            interval,
            last_healthy: None,
            reported: BTreeSet::new(),
        }
    }

    /// Poll every interval until shutdown.
    ///
    /// # Errors
    ///
    /// Never fails.
    pub fn run(mut self, ctx: &WorkerContext) -> Result<()> {
        info!(interval_ms = self.interval.as_millis() as u64, "health monitor started");
        while ctx.sleep(self.interval) {
            self.poll();
        }
        info!("health monitor stopped");
        Ok(())
    }

    /// Take one health reading and log what changed since the last one.
    pub fn poll(&mut self) -> HealthReport {
        let report = self.probe.check();
        if report.shutting_down {
            return report;
        }

        for record in &report.workers {
            let failed = matches!(record.state, WorkerState::Error | WorkerState::Stopped);
            if failed && self.reported.insert(record.name.clone()) {
                match &record.last_error {
                    Some(e) => {
                        error!(worker = %record.name, state = %record.state, "worker down: {e}");
                    }
                    None => error!(worker = %record.name, state = %record.state, "worker down"),
                }
            } else if !failed {
                self.reported.remove(&record.name);
            }
        }

        match (self.last_healthy, report.healthy) {
            (Some(true) | None, false) => {
                warn!(
                    warnings = ?report.queue_pressure_warnings,
                    "pipeline unhealthy"
                );
            }
            (Some(false), true) => info!("pipeline healthy again"),
            (None, true) => debug!("pipeline healthy"),
            _ => {}
        }
        self.last_healthy = Some(report.healthy);
        report
    }
}
