//! Per-unit session protocol.
//!
//! ```text
//! Unknown ──► Probing ──┬──► Resumable ─────┬──► Injecting ──► Completed
//!    │           │      └──► FreshRequired ─┘        │
//!    ▼           ▼                 ▼                 ▼
//!  Failed ◄──────┴─────────────────┴─────────────────┘
//! ```
//!
//! The probe opens the agent's session listing. A listed session is resumed
//! and receives only the main payload. Anything else (no sessions, silence,
//! an error, the process exiting) starts a fresh process that receives the
//! init command, the init payload and then the main payload.

use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::agent::{AgentAdapter, SpawnConfig};
use crate::config::RunConfig;
use crate::error::UnitError;
use crate::injector::{InstructionInjector, plan_steps};
use crate::log::RunObserver;
use crate::payload::{PayloadResolver, PayloadSlot, ResolvedPayloads, StepKind};
use crate::prompt::PromptTag;
use crate::scanner::WorkUnit;
use crate::scheduler::CancelToken;
use crate::terminal::{Channel, CloseMode, TerminalStrategy};
use crate::waiter::{PromptWaiter, WaitError, tail};

/// Captured probe output kept in warnings.
const PROBE_TAIL: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unknown,
    Probing,
    Resumable,
    FreshRequired,
    Injecting,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }

    /// Whether `self -> next` is a legal step. Every non-terminal state may
    /// fail; nothing leaves a terminal state.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        if next == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Unknown, Probing)
                | (Probing, Resumable | FreshRequired)
                | (Resumable | FreshRequired, Injecting)
                | (Injecting, Completed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Unknown => "unknown",
            SessionState::Probing => "probing",
            SessionState::Resumable => "resumable",
            SessionState::FreshRequired => "fresh_required",
            SessionState::Injecting => "injecting",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Which way a unit's session was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPath {
    Resumed,
    Fresh,
}

impl fmt::Display for SessionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionPath::Resumed => f.write_str("resumed"),
            SessionPath::Fresh => f.write_str("fresh"),
        }
    }
}

/// Outcome of one unit. Exactly one per unit per run.
#[derive(Debug, Clone)]
pub struct LaunchResult {
    pub unit: WorkUnit,
    pub final_state: SessionState,
    /// Every state the unit passed through, starting with `Unknown`.
    pub states: Vec<SessionState>,
    pub error: Option<UnitError>,
    pub duration: Duration,
    /// Steps delivered and acknowledged, in order.
    pub delivered: Vec<StepKind>,
    pub path: Option<SessionPath>,
}

impl LaunchResult {
    pub fn is_success(&self) -> bool {
        self.final_state == SessionState::Completed && self.error.is_none()
    }

    /// Result for a unit that did not report back on its own: it was never
    /// dispatched, it panicked, or it outlived the cancellation grace period.
    ///
    /// `states` is the trail observed so far. A trail that already reached
    /// `Completed` is kept as a success.
    pub fn aborted(
        unit: WorkUnit,
        mut states: Vec<SessionState>,
        error: UnitError,
        duration: Duration,
    ) -> Self {
        if states.is_empty() {
            states.push(SessionState::Unknown);
        }
        if states.last() == Some(&SessionState::Completed) {
            return Self {
                unit,
                final_state: SessionState::Completed,
                states,
                error: None,
                duration,
                delivered: Vec::new(),
                path: None,
            };
        }
        if states.last() != Some(&SessionState::Failed) {
            states.push(SessionState::Failed);
        }
        Self {
            unit,
            final_state: SessionState::Failed,
            states,
            error: Some(error),
            duration,
            delivered: Vec::new(),
            path: None,
        }
    }
}

/// Everything a unit needs from the run. Shared read-only by all units.
#[derive(Clone)]
pub struct UnitContext {
    pub config: Arc<RunConfig>,
    pub terminal: Arc<dyn TerminalStrategy>,
    pub agent: Arc<dyn AgentAdapter>,
    pub observer: Arc<dyn RunObserver>,
    pub resolver: PayloadResolver,
    pub cancel: CancelToken,
    /// Cleared once the run has been reported complete.
    reporting: Arc<RwLock<bool>>,
}

impl UnitContext {
    pub fn new(
        config: Arc<RunConfig>,
        terminal: Arc<dyn TerminalStrategy>,
        agent: Arc<dyn AgentAdapter>,
        observer: Arc<dyn RunObserver>,
        cancel: CancelToken,
    ) -> Self {
        let resolver = config.payload_resolver();
        Self {
            config,
            terminal,
            agent,
            observer,
            resolver,
            cancel,
            reporting: Arc::new(RwLock::new(true)),
        }
    }

    /// Hand `f` the observer unless reporting has been stopped.
    pub fn report(&self, f: impl FnOnce(&dyn RunObserver)) {
        let open = self.reporting.read().unwrap_or_else(|e| e.into_inner());
        if *open {
            f(self.observer.as_ref());
        }
    }

    /// Silence units that are still running. Waits for reports in progress.
    pub fn stop_reporting(&self) {
        *self.reporting.write().unwrap_or_else(|e| e.into_inner()) = false;
    }
}

/// Drives one unit from `Unknown` to a terminal state.
pub struct SessionStateMachine<'a> {
    ctx: &'a UnitContext,
    unit: WorkUnit,
    state: SessionState,
    /// Mirror of the state history, readable by the scheduler while the
    /// unit is still running.
    trail: Arc<Mutex<Vec<SessionState>>>,
    waiter: PromptWaiter,
    channel: Option<Box<dyn Channel>>,
    delivered: Vec<StepKind>,
    path: Option<SessionPath>,
    started: Instant,
}

impl<'a> SessionStateMachine<'a> {
    pub fn new(ctx: &'a UnitContext, unit: WorkUnit, trail: Arc<Mutex<Vec<SessionState>>>) -> Self {
        {
            let mut states = trail.lock().unwrap_or_else(|e| e.into_inner());
            states.clear();
            states.push(SessionState::Unknown);
        }
        let waiter = PromptWaiter::new(
            ctx.config.step_timeout,
            ctx.config.poll_interval,
            ctx.cancel.clone(),
        );
        Self {
            ctx,
            unit,
            state: SessionState::Unknown,
            trail,
            waiter,
            channel: None,
            delivered: Vec::new(),
            path: None,
            started: Instant::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the protocol to completion. Never panics on unit errors; they are
    /// recorded in the result.
    pub fn run(mut self) -> LaunchResult {
        let outcome = self.drive();
        let error = match outcome {
            Ok(()) => None,
            Err(error) => {
                warn!(unit = %self.unit.label, state = %self.state, error = %error, "unit failed");
                self.fail();
                Some(error)
            }
        };
        if let Some(mut channel) = self.channel.take() {
            channel.close(CloseMode::Detach);
        }

        let states = self
            .trail
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone());
        LaunchResult {
            unit: self.unit,
            final_state: self.state,
            states,
            error,
            duration: self.started.elapsed(),
            delivered: self.delivered,
            path: self.path,
        }
    }

    fn drive(&mut self) -> Result<(), UnitError> {
        let ctx = self.ctx;
        let payloads = ctx.resolver.resolve(&self.unit.path)?;
        payloads.require_main()?;
        self.check_cancelled()?;

        self.open(&ctx.agent.resume_spawn(&self.unit.path))?;
        self.transition(SessionState::Probing)?;

        let path = self.probe()?;
        match path {
            SessionPath::Resumed => {
                self.transition(SessionState::Resumable)?;
                self.select_session()?;
            }
            SessionPath::Fresh => {
                self.transition(SessionState::FreshRequired)?;
                self.start_fresh(&payloads)?;
            }
        }
        self.path = Some(path);

        let steps = plan_steps(path, &payloads, ctx.agent.init_command());
        let first = steps.first().map_or(StepKind::Main, |s| s.kind);
        let injector = InstructionInjector::new(
            ctx.agent.as_ref(),
            ctx.config.step_timeout,
            ctx.config.max_acknowledgements,
        );
        {
            let channel = self.channel.as_deref_mut().ok_or_else(no_channel)?;
            injector.await_ready(channel, &mut self.waiter, first)?;
        }

        self.transition(SessionState::Injecting)?;
        let Self {
            channel,
            waiter,
            delivered,
            unit,
            ..
        } = self;
        let channel = channel.as_deref_mut().ok_or_else(no_channel)?;
        injector.primed().deliver(channel, waiter, &steps, &mut |kind, bytes| {
            delivered.push(kind);
            ctx.report(|o| o.step_delivered(unit, kind, bytes));
        })?;

        self.transition(SessionState::Completed)
    }

    /// Read the session listing and decide how to continue.
    fn probe(&mut self) -> Result<SessionPath, UnitError> {
        let ctx = self.ctx;
        let patterns = ctx.agent.probe_patterns();
        let label = &self.unit.label;
        let waiter = &mut self.waiter;
        let channel = self.channel.as_deref_mut().ok_or_else(no_channel)?;
        let mut answered = 0usize;

        loop {
            let found = match waiter.wait(channel, &patterns, Some(ctx.config.probe_timeout)) {
                Ok(found) => found,
                Err(WaitError::Cancelled { .. }) => return Err(UnitError::Cancelled),
                Err(WaitError::Timeout { captured }) => {
                    let err = UnitError::ProbeTimeout {
                        captured: tail(&captured, PROBE_TAIL),
                    };
                    warn!(unit = %label, error = %err, "assuming no resumable session");
                    return Ok(SessionPath::Fresh);
                }
                Err(err) => {
                    warn!(unit = %label, error = %err, captured = %tail(err.captured(), PROBE_TAIL), "session listing ended, starting fresh");
                    return Ok(SessionPath::Fresh);
                }
            };

            match found.tag {
                PromptTag::SessionList => {
                    info!(unit = %label, "prior session found");
                    return Ok(SessionPath::Resumed);
                }
                PromptTag::NoSessions => {
                    info!(unit = %label, "no prior session");
                    return Ok(SessionPath::Fresh);
                }
                PromptTag::Error => {
                    warn!(unit = %label, detail = %format!("{}{}", found.matched_text, waiter.rest_of_line()), "agent error while listing sessions, starting fresh");
                    return Ok(SessionPath::Fresh);
                }
                tag if tag.needs_acknowledgement() => {
                    answered += 1;
                    if answered > ctx.config.max_acknowledgements {
                        warn!(unit = %label, answered, "too many prompts while listing sessions, starting fresh");
                        return Ok(SessionPath::Fresh);
                    }
                    debug!(unit = %label, %tag, "acknowledging prompt during probe");
                    if let Err(e) = channel.send(ctx.agent.acknowledgement()) {
                        warn!(unit = %label, error = %e, "session listing closed, starting fresh");
                        return Ok(SessionPath::Fresh);
                    }
                    waiter.reset();
                }
                tag => debug!(unit = %label, %tag, "ignoring prompt during probe"),
            }
        }
    }

    fn select_session(&mut self) -> Result<(), UnitError> {
        let selection = self.ctx.agent.resume_selection();
        let channel = self.channel.as_deref_mut().ok_or_else(no_channel)?;
        channel.send(selection).map_err(|e| UnitError::Channel {
            detail: format!("failed to select session: {e}"),
        })?;
        self.waiter.reset();
        Ok(())
    }

    fn start_fresh(&mut self, payloads: &ResolvedPayloads) -> Result<(), UnitError> {
        if let Some(mut listing) = self.channel.take() {
            listing.close(CloseMode::Terminate);
        }
        self.waiter.reset();

        if payloads.init.is_none() && !payloads.stage_complete() {
            return Err(UnitError::PayloadMissing {
                slot: PayloadSlot::Init,
                searched: payloads.searched.clone(),
            });
        }
        self.check_cancelled()?;
        let ctx = self.ctx;
        self.open(&ctx.agent.fresh_spawn(&self.unit.path))
    }

    fn open(&mut self, spawn: &SpawnConfig) -> Result<(), UnitError> {
        debug!(unit = %self.unit.label, command = %spawn.command_line(), "opening terminal");
        let channel = self
            .ctx
            .terminal
            .open(spawn)
            .map_err(|e| UnitError::Terminal {
                detail: e.to_string(),
            })?;
        self.channel = Some(channel);
        Ok(())
    }

    fn check_cancelled(&self) -> Result<(), UnitError> {
        if self.ctx.cancel.is_cancelled() {
            return Err(UnitError::Cancelled);
        }
        Ok(())
    }

    fn transition(&mut self, to: SessionState) -> Result<(), UnitError> {
        if !self.state.can_transition_to(to) {
            return Err(UnitError::InvalidTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.enter(to);
        Ok(())
    }

    fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.enter(SessionState::Failed);
        }
    }

    fn enter(&mut self, to: SessionState) {
        let from = std::mem::replace(&mut self.state, to);
        self.trail
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(to);
        debug!(unit = %self.unit.label, %from, %to, "transition");
        let unit = &self.unit;
        self.ctx.report(|o| o.state_changed(unit, from, to));
    }
}

fn no_channel() -> UnitError {
    UnitError::Channel {
        detail: "no open terminal".to_string(),
    }
}
