//! Fleet driver: program a list of targets one after another.
//!
//! The driver owns the transport and the hooks and lends both to one
//! [`Session`] at a time, so there is never concurrent traffic on the bus.
//! Individual target failures are recorded and the run continues unless
//! configured otherwise; cancellation stops the fleet after a best-effort
//! release of all targets.

use std::fmt;
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::bootloader::{BootloaderClient, Timeouts};
use crate::error::{Error, Result};
use crate::hooks::{ContextHooks, TargetId};
use crate::image::HexImage;
use crate::plan::Plan;
use crate::port::Port;
use crate::session::{RetryPolicy, Session, SessionEvent, SessionFailure};
use crate::target::McuDescriptor;

/// Fleet-level configuration.
#[derive(Debug, Clone, Copy)]
pub struct FleetConfig {
    /// Retry ceilings handed to every session.
    pub policy: RetryPolicy,
    /// Protocol timeouts handed to the bootloader client.
    pub timeouts: Timeouts,
    /// Bus-idle gap between consecutive targets.
    pub inter_target_delay: Duration,
    /// Jump address after successful programming, or `None` to leave the
    /// target in the bootloader (the default).
    pub go_address: Option<u32>,
    /// Stop at the first failed target instead of continuing.
    pub abort_on_failure: bool,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
            timeouts: Timeouts::default(),
            inter_target_delay: Duration::from_millis(50),
            go_address: None,
            abort_on_failure: false,
        }
    }
}

/// Final state of one target.
#[derive(Debug)]
pub enum TargetOutcome {
    /// Every dirty sector verified.
    Done,
    /// The session gave up; carries the terminal error and the state
    /// (sector/chunk coordinates) where it was observed.
    Failed(SessionFailure),
}

impl TargetOutcome {
    /// Whether the target finished successfully.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

impl fmt::Display for TargetOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Done => write!(f, "done"),
            Self::Failed(failure) => write!(f, "failed: {failure}"),
        }
    }
}

/// Aggregated result of a fleet run.
#[derive(Debug, Default)]
pub struct FleetReport {
    /// Per-target outcomes in programming order.
    pub outcomes: Vec<(TargetId, TargetOutcome)>,
    /// Whether the run stopped because cancellation was requested.
    pub cancelled: bool,
}

impl FleetReport {
    /// Whether every attempted target finished successfully.
    pub fn all_done(&self) -> bool {
        !self.cancelled && self.outcomes.iter().all(|(_, o)| o.is_done())
    }

    /// Number of failed targets.
    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| !o.is_done()).count()
    }
}

/// Progress notifications for the embedding application.
#[derive(Debug, Clone, Copy)]
pub enum ProgressEvent {
    /// A target session is starting.
    TargetStarted {
        /// The target.
        target: TargetId,
        /// Zero-based position in the run.
        index: usize,
        /// Total number of targets.
        total: usize,
    },
    /// An event from the running session.
    Session {
        /// The target the event belongs to.
        target: TargetId,
        /// The session event.
        event: SessionEvent,
    },
    /// A target session ended.
    TargetFinished {
        /// The target.
        target: TargetId,
        /// Whether it ended in `Done`.
        ok: bool,
    },
}

/// Sequences one [`Session`] per target over a shared transport.
pub struct Fleet<P: Port, H: ContextHooks> {
    client: BootloaderClient<P>,
    hooks: H,
    mcu: &'static McuDescriptor,
    plan: Plan,
    config: FleetConfig,
}

impl<P: Port, H: ContextHooks> Fleet<P, H> {
    /// Build the programming plan and wrap the transport.
    ///
    /// Plan problems surface here, before any bus activity.
    pub fn new(
        port: P,
        hooks: H,
        mcu: &'static McuDescriptor,
        image: &HexImage,
        config: FleetConfig,
    ) -> Result<Self> {
        let plan = Plan::build(image, mcu)?;
        let client = BootloaderClient::new(port)
            .with_timeouts(config.timeouts)
            .with_cmd_retries(config.policy.cmd);
        Ok(Self {
            client,
            hooks,
            mcu,
            plan,
            config,
        })
    }

    /// The derived plan (identical for every target).
    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// How many times the transport was reopened so far.
    pub fn reopens(&self) -> u32 {
        self.client.reopens()
    }

    /// Release the transport.
    pub fn into_port(self) -> P {
        self.client.into_port()
    }

    /// Program every target in order, collecting per-target outcomes.
    ///
    /// Returns `Ok` even when individual targets failed; inspect the report.
    pub fn run(
        &mut self,
        targets: &[TargetId],
        progress: &mut dyn FnMut(ProgressEvent),
    ) -> Result<FleetReport> {
        let mut report = FleetReport::default();

        for (index, &target) in targets.iter().enumerate() {
            if crate::cancel_requested() {
                report.cancelled = true;
                break;
            }
            if index > 0 {
                // Bus-idle boundary between sessions.
                thread::sleep(self.config.inter_target_delay);
            }

            info!("programming {target} ({}/{})", index + 1, targets.len());
            progress(ProgressEvent::TargetStarted {
                target,
                index,
                total: targets.len(),
            });

            let mut session = Session::new(
                &mut self.client,
                &mut self.hooks,
                &self.plan,
                self.mcu,
                self.config.policy,
                target,
                targets,
                self.config.go_address,
            );
            let result = session.run(&mut |event| {
                progress(ProgressEvent::Session { target, event });
            });

            match result {
                Ok(()) => {
                    info!("{target}: done");
                    progress(ProgressEvent::TargetFinished { target, ok: true });
                    report.outcomes.push((target, TargetOutcome::Done));
                }
                Err(failure) => {
                    warn!("{target}: {failure}");
                    progress(ProgressEvent::TargetFinished { target, ok: false });
                    let cancelled = matches!(failure.error, Error::Cancelled);
                    report.outcomes.push((target, TargetOutcome::Failed(failure)));
                    if cancelled {
                        report.cancelled = true;
                        break;
                    }
                    if self.config.abort_on_failure {
                        break;
                    }
                }
            }
        }

        // Targets stay muted across sessions; undo that now, best effort.
        if let Err(e) = self.hooks.release_all(self.client.port_mut()) {
            warn!("release_all failed: {e}");
        }

        Ok(report)
    }
}
