//! Per-target programming session: connect, handshake, program, release.
//!
//! The session is a state machine with explicit attempt counters rather than
//! nested ad-hoc loops. Retry budgets nest as follows, outermost first:
//!
//! - session restarts (re-enter the bootloader after persistent protocol
//!   failures),
//! - sector recovery passes (re-erase a sector whose chunks keep failing
//!   verify),
//! - per-sector erase attempts and per-chunk write attempts,
//! - per-command transport retries (inside [`BootloaderClient`]).
//!
//! Cancellation is polled between commands and between chunks via the crate
//! global checker ([`crate::cancel_requested`]).

use std::collections::BTreeMap;
use std::fmt;

use log::{debug, error, info, warn};

use crate::bootloader::BootloaderClient;
use crate::error::{Error, Result};
use crate::hooks::{ContextHooks, TargetId};
use crate::image::PAD_BYTE;
use crate::plan::Plan;
use crate::port::Port;
use crate::protocol::command::Command;
use crate::target::{McuDescriptor, Sector};

/// Retry ceilings for every level of the session.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Transport retries per bootloader command.
    pub cmd: u32,
    /// Erase attempts per sector pass.
    pub erase: u32,
    /// Write/verify attempts per chunk before sector recovery.
    pub chunk: u32,
    /// Sector recovery passes (re-erase + rewrite) after chunk exhaustion.
    pub sector_recover: u32,
    /// Bootloader re-entries after persistent protocol failures.
    pub session_restarts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            cmd: 3,
            erase: 3,
            chunk: 3,
            sector_recover: 2,
            session_restarts: 2,
        }
    }
}

/// Where a session currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing happened yet.
    Idle,
    /// All targets muted.
    Silenced,
    /// The target was asked to enter its ROM bootloader.
    BootloaderEntered,
    /// The sync byte was acknowledged.
    Handshaked,
    /// GET/GET_ID matched the descriptor.
    Identified,
    /// Erasing a sector.
    Erasing {
        /// Sector index.
        sector: usize,
    },
    /// Writing and verifying a chunk.
    Writing {
        /// Owning sector index.
        sector: usize,
        /// Chunk base address.
        address: u32,
        /// Write attempt within the current sector pass (1-based).
        attempt: u32,
    },
    /// All dirty sectors verified (and GO sent when requested).
    Done,
    /// The session gave up.
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Silenced => write!(f, "bus silenced"),
            Self::BootloaderEntered => write!(f, "bootloader entered"),
            Self::Handshaked => write!(f, "handshaked"),
            Self::Identified => write!(f, "identified"),
            Self::Erasing { sector } => write!(f, "erasing sector {sector}"),
            Self::Writing { sector, address, attempt } => write!(
                f,
                "writing sector {sector} chunk {address:#010x} (attempt {attempt})"
            ),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Attempt counters accumulated over one session.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    /// Erase attempts per sector index.
    pub erases: BTreeMap<usize, u32>,
    /// Write attempts per chunk base address.
    pub chunk_writes: BTreeMap<u32, u32>,
    /// Session restarts that were performed.
    pub restarts: u32,
}

/// Why and where a session failed.
#[derive(Debug)]
pub struct SessionFailure {
    /// Terminal error.
    pub error: Error,
    /// State the session was in when the error became terminal.
    pub state: SessionState,
}

impl fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (while {})", self.error, self.state)
    }
}

/// Progress notifications emitted while a session runs.
#[derive(Debug, Clone, Copy)]
pub enum SessionEvent {
    /// A sector erased and passed its blank check.
    SectorErased {
        /// Sector index.
        sector: usize,
        /// Erase attempt that succeeded (1-based).
        attempt: u32,
    },
    /// Cumulative chunk progress. `done` can move backwards after a sector
    /// recovery pass rewinds a sector.
    ChunkProgrammed {
        /// Chunks verified so far in this session attempt.
        done: usize,
        /// Total chunks in the plan.
        total: usize,
    },
    /// A sector pass failed and the sector is being re-erased.
    SectorRecovery {
        /// Sector index.
        sector: usize,
        /// Recovery pass about to start (1-based).
        pass: u32,
    },
}

/// Which erase flavor the bootloader advertised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EraseKind {
    Standard,
    Extended,
}

/// One programming session for one target.
///
/// Borrows the transport (via the client) and the hooks from the fleet
/// driver for its duration; nothing is shared across targets.
pub struct Session<'a, P: Port, H: ContextHooks> {
    client: &'a mut BootloaderClient<P>,
    hooks: &'a mut H,
    plan: &'a Plan,
    mcu: &'a McuDescriptor,
    policy: RetryPolicy,
    target: TargetId,
    all_targets: &'a [TargetId],
    go_address: Option<u32>,
    state: SessionState,
    stats: SessionStats,
    chunks_done: usize,
}

impl<'a, P: Port, H: ContextHooks> Session<'a, P, H> {
    /// Set up a session; nothing touches the bus until [`Session::run`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: &'a mut BootloaderClient<P>,
        hooks: &'a mut H,
        plan: &'a Plan,
        mcu: &'a McuDescriptor,
        policy: RetryPolicy,
        target: TargetId,
        all_targets: &'a [TargetId],
        go_address: Option<u32>,
    ) -> Self {
        Self {
            client,
            hooks,
            plan,
            mcu,
            policy,
            target,
            all_targets,
            go_address,
            state: SessionState::Idle,
            stats: SessionStats::default(),
            chunks_done: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Attempt counters accumulated so far.
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Drive the target from silence to `Done`.
    pub fn run(&mut self, progress: &mut dyn FnMut(SessionEvent)) -> std::result::Result<(), SessionFailure> {
        match self.run_inner(progress) {
            Ok(()) => {
                self.state = SessionState::Done;
                Ok(())
            }
            Err(error) => {
                let state = self.state;
                self.state = SessionState::Failed;
                Err(SessionFailure { error, state })
            }
        }
    }

    fn run_inner(&mut self, progress: &mut dyn FnMut(SessionEvent)) -> Result<()> {
        self.check_cancel()?;

        // Step 1: silence the whole bus. Failure is fatal for the target.
        self.hooks
            .be_quiet(self.client.port_mut(), self.all_targets)
            .map_err(hook_error)?;
        self.state = SessionState::Silenced;

        let mut restarts = 0;
        loop {
            match self.attempt(progress) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && restarts < self.policy.session_restarts => {
                    restarts += 1;
                    self.stats.restarts = restarts;
                    self.chunks_done = 0;
                    warn!(
                        "{}: {e}; re-entering bootloader (restart {restarts}/{})",
                        self.target, self.policy.session_restarts
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Steps 2-6: one full pass from bootloader entry to verified flash.
    fn attempt(&mut self, progress: &mut dyn FnMut(SessionEvent)) -> Result<()> {
        // Step 2: only this target may respond afterwards.
        self.check_cancel()?;
        self.hooks
            .enter_bootloader(self.client.port_mut(), self.target)
            .map_err(hook_error)?;
        self.state = SessionState::BootloaderEntered;

        // Step 3: baud handshake.
        self.check_cancel()?;
        self.client.sync()?;
        self.state = SessionState::Handshaked;

        // Step 4: identify and pick the erase flavor.
        self.check_cancel()?;
        let info = self.client.get()?;
        self.check_cancel()?;
        let pid = self.client.get_id()?;
        if pid != self.mcu.pid {
            // Includes PIDs we know about: the plan was built for this
            // descriptor, so anything else on the bus is the wrong device.
            return Err(Error::UnsupportedDevice { pid });
        }
        debug!(
            "{}: {} bootloader v{}.{}",
            self.target,
            self.mcu,
            info.version >> 4,
            info.version & 0xF
        );

        let erase_kind = if self.mcu.extended_erase && info.supports(Command::ExtendedErase) {
            EraseKind::Extended
        } else if info.supports(Command::Erase) {
            EraseKind::Standard
        } else {
            // A capability mismatch never heals across bootloader
            // re-entries, so it must not count as transient.
            return Err(Error::MissingCommand { command: "any erase command" });
        };

        let mut required = vec![Command::ReadMemory, Command::WriteMemory];
        if self.go_address.is_some() {
            required.push(Command::Go);
        }
        for cmd in required {
            if !info.supports(cmd) {
                return Err(Error::MissingCommand { command: cmd.name() });
            }
        }
        self.state = SessionState::Identified;

        // Step 5: erase and program every dirty sector in order.
        for sector in self.plan.dirty_sectors() {
            self.program_sector(sector, erase_kind, progress)?;
        }

        // Step 6: optionally start the application.
        if let Some(addr) = self.go_address {
            self.check_cancel()?;
            info!("{}: starting application at {addr:#010x}", self.target);
            self.client.go(addr)?;
        }
        Ok(())
    }

    /// Erase-then-write one sector, with recovery passes on chunk failure.
    fn program_sector(
        &mut self,
        sector: usize,
        erase_kind: EraseKind,
        progress: &mut dyn FnMut(SessionEvent),
    ) -> Result<()> {
        let passes = 1 + self.policy.sector_recover;
        for pass in 1..=passes {
            self.erase_sector(sector, erase_kind, progress)?;

            match self.write_sector(sector, progress) {
                Ok(()) => {
                    debug!("{}: sector {sector} verified", self.target);
                    return Ok(());
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) if pass < passes => {
                    warn!(
                        "{}: sector {sector} pass {pass}/{passes} failed ({e}); re-erasing",
                        self.target
                    );
                    progress(SessionEvent::SectorRecovery { sector, pass });
                }
                Err(e) => {
                    error!("{}: sector {sector} failed permanently: {e}", self.target);
                    return Err(Error::SectorUnrecoverable { sector });
                }
            }
        }
        Err(Error::SectorUnrecoverable { sector })
    }

    /// One erase with blank check, retried up to the erase budget.
    fn erase_sector(
        &mut self,
        sector: usize,
        erase_kind: EraseKind,
        progress: &mut dyn FnMut(SessionEvent),
    ) -> Result<()> {
        let mut last = None;
        for attempt in 1..=self.policy.erase.max(1) {
            self.check_cancel()?;
            self.state = SessionState::Erasing { sector };
            *self.stats.erases.entry(sector).or_insert(0) += 1;

            let result = match erase_kind {
                EraseKind::Extended => self.client.extended_erase(sector as u16),
                EraseKind::Standard => self.client.erase(sector as u8),
            }
            .and_then(|()| self.blank_check(sector));

            match result {
                Ok(()) => {
                    progress(SessionEvent::SectorErased { sector, attempt });
                    return Ok(());
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!(
                        "{}: erase sector {sector} attempt {attempt}/{} failed: {e}",
                        self.target, self.policy.erase
                    );
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or(Error::EraseCheckFailed { sector }))
    }

    /// Read back the first and last page of a sector; both must be blank.
    fn blank_check(&mut self, sector: usize) -> Result<()> {
        let page = self.plan.page_size();
        let layout: &Sector = &self.mcu.sectors[sector];
        let mut buf = vec![0u8; page];

        for addr in [layout.start, layout.end() - page as u32] {
            self.check_cancel()?;
            self.client.read_memory(addr, &mut buf)?;
            if buf.iter().any(|&b| b != PAD_BYTE) {
                return Err(Error::EraseCheckFailed { sector });
            }
        }
        Ok(())
    }

    /// Write and verify every chunk of a sector once.
    fn write_sector(
        &mut self,
        sector: usize,
        progress: &mut dyn FnMut(SessionEvent),
    ) -> Result<()> {
        let chunks: Vec<_> = self.plan.chunks_in_sector(sector).cloned().collect();
        let mut credited = 0usize;
        for chunk in &chunks {
            match self.write_chunk(chunk) {
                Ok(()) => {
                    self.chunks_done += 1;
                    credited += 1;
                    progress(SessionEvent::ChunkProgrammed {
                        done: self.chunks_done,
                        total: self.plan.len(),
                    });
                }
                Err(e) => {
                    // Roll back the credit from this pass; the recovery
                    // pass rewrites the whole sector.
                    self.chunks_done -= credited;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// One chunk: write, read back, compare; retried up to the chunk budget.
    fn write_chunk(&mut self, chunk: &crate::plan::Chunk) -> Result<()> {
        let mut readback = vec![0u8; chunk.bytes.len()];
        let mut last = None;

        for attempt in 1..=self.policy.chunk.max(1) {
            self.check_cancel()?;
            self.state = SessionState::Writing {
                sector: chunk.sector,
                address: chunk.address,
                attempt,
            };
            *self.stats.chunk_writes.entry(chunk.address).or_insert(0) += 1;

            let result = self
                .client
                .write_memory(chunk.address, &chunk.bytes)
                .and_then(|()| {
                    self.client.read_memory(chunk.address, &mut readback)?;
                    match readback.iter().zip(&chunk.bytes).position(|(a, b)| a != b) {
                        None => Ok(()),
                        Some(offset) => Err(Error::VerifyMismatch {
                            address: chunk.address,
                            offset,
                        }),
                    }
                });

            match result {
                Ok(()) => return Ok(()),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!(
                        "{}: chunk {:#010x} attempt {attempt}/{} failed: {e}",
                        self.target, chunk.address, self.policy.chunk
                    );
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or(Error::VerifyMismatch {
            address: chunk.address,
            offset: 0,
        }))
    }

    fn check_cancel(&self) -> Result<()> {
        if crate::cancel_requested() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

fn hook_error(e: Error) -> Error {
    match e {
        Error::Hook(_) | Error::Cancelled => e,
        other => Error::Hook(other.to_string()),
    }
}
