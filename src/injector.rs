//! Instruction delivery.
//!
//! Every input goes through the same cycle:
//!
//! ```text
//! ready gate ──► send ──► acknowledgement
//!   │  ▲
//!   └──┘ confirmation / permission prompt: answer it and wait again
//! ```
//!
//! Nothing is sent on a timer. The only delay-based signal is the silence
//! fallback carried by the agent's pattern sets.

use std::time::Duration;

use tracing::{debug, info};

use crate::agent::AgentAdapter;
use crate::error::UnitError;
use crate::payload::{ResolvedPayloads, StepKind};
use crate::prompt::{PatternSet, PromptTag};
use crate::session::SessionPath;
use crate::terminal::{Channel, ChannelError};
use crate::waiter::{PromptWaiter, WaitError, tail};

/// Captured output kept in error reports.
const REPORT_TAIL: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionStep {
    pub kind: StepKind,
    pub text: String,
}

impl InjectionStep {
    pub fn new(kind: StepKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }
}

/// Inputs for a session.
///
/// A resumed session gets only `main`. A fresh one gets the init command,
/// then `init` unless the stage marker says it already ran, then `main`.
pub fn plan_steps(
    path: SessionPath,
    payloads: &ResolvedPayloads,
    init_command: &str,
) -> Vec<InjectionStep> {
    let mut steps = Vec::with_capacity(3);
    if path == SessionPath::Fresh {
        steps.push(InjectionStep::new(StepKind::InitCommand, init_command));
        match (&payloads.init, payloads.stage_complete()) {
            (Some(init), false) => steps.push(InjectionStep::new(StepKind::Init, &init.content)),
            (_, true) => info!("stage marker present, skipping init payload"),
            (None, false) => {}
        }
    }
    if let Some(main) = &payloads.main {
        steps.push(InjectionStep::new(StepKind::Main, &main.content));
    }
    steps
}

pub struct InstructionInjector<'a> {
    agent: &'a dyn AgentAdapter,
    ready: PatternSet,
    ack: PatternSet,
    step_timeout: Duration,
    max_acknowledgements: usize,
    primed: bool,
}

impl<'a> InstructionInjector<'a> {
    pub fn new(agent: &'a dyn AgentAdapter, step_timeout: Duration, max_acknowledgements: usize) -> Self {
        Self {
            agent,
            ready: agent.ready_patterns(),
            ack: agent.ack_patterns(),
            step_timeout,
            max_acknowledgements,
            primed: false,
        }
    }

    /// The caller already passed the readiness gate for the first step.
    pub fn primed(mut self) -> Self {
        self.primed = true;
        self
    }

    /// Deliver `steps` in order. `on_step` is called after each step is
    /// acknowledged, with the number of bytes sent.
    pub fn deliver(
        &self,
        channel: &mut dyn Channel,
        waiter: &mut PromptWaiter,
        steps: &[InjectionStep],
        on_step: &mut dyn FnMut(StepKind, usize),
    ) -> Result<(), UnitError> {
        let mut ready = self.primed;
        for step in steps {
            if step.text.trim().is_empty() {
                debug!(step = %step.kind, "empty payload, nothing to send");
                on_step(step.kind, 0);
                continue;
            }

            if !ready {
                self.await_ready(channel, waiter, step.kind)?;
            }
            ready = false;
            let input = self.agent.format_input(&step.text);
            channel
                .send(&input)
                .map_err(|e| send_error(e, step.kind))?;
            self.await_ack(channel, waiter, step.kind)?;
            on_step(step.kind, input.len());
        }
        Ok(())
    }

    /// Wait until the input prompt is idle, answering confirmations.
    pub fn await_ready(
        &self,
        channel: &mut dyn Channel,
        waiter: &mut PromptWaiter,
        step: StepKind,
    ) -> Result<(), UnitError> {
        let mut answered = 0usize;
        loop {
            let m = waiter
                .wait(channel, &self.ready, Some(self.step_timeout))
                .map_err(|e| wait_error(e, step))?;
            match m.tag {
                PromptTag::Ready => return Ok(()),
                PromptTag::Error => return Err(agent_error(waiter, &m.captured)),
                tag if tag.needs_acknowledgement() => {
                    answered += 1;
                    if answered > self.max_acknowledgements {
                        return Err(UnitError::InjectionTimeout {
                            step,
                            captured: tail(&m.captured, REPORT_TAIL),
                        });
                    }
                    debug!(%tag, answered, "acknowledging prompt");
                    channel
                        .send(self.agent.acknowledgement())
                        .map_err(|e| send_error(e, step))?;
                    // The rest of the dialog is redrawn or gone after the answer.
                    waiter.reset();
                }
                tag => debug!(%tag, "ignoring prompt while waiting for input line"),
            }
        }
    }

    fn await_ack(
        &self,
        channel: &mut dyn Channel,
        waiter: &mut PromptWaiter,
        step: StepKind,
    ) -> Result<(), UnitError> {
        let m = waiter
            .wait(channel, &self.ack, Some(self.step_timeout))
            .map_err(|e| wait_error(e, step))?;
        match m.tag {
            PromptTag::Error => Err(agent_error(waiter, &m.captured)),
            tag => {
                debug!(%tag, fallback = m.from_fallback(), %step, "input acknowledged");
                Ok(())
            }
        }
    }
}

fn agent_error(waiter: &PromptWaiter, captured: &str) -> UnitError {
    let line = captured.lines().last().unwrap_or("").trim_start();
    UnitError::Agent {
        detail: format!("{line}{}", waiter.rest_of_line()).trim().to_string(),
    }
}

fn wait_error(err: WaitError, step: StepKind) -> UnitError {
    match err {
        WaitError::Timeout { captured } => UnitError::InjectionTimeout {
            step,
            captured: tail(&captured, REPORT_TAIL),
        },
        WaitError::Closed { .. } => UnitError::Channel {
            detail: format!("agent exited before the {step} was acknowledged"),
        },
        WaitError::Cancelled { .. } => UnitError::Cancelled,
        WaitError::Channel(detail) => UnitError::Channel { detail },
    }
}

fn send_error(err: ChannelError, step: StepKind) -> UnitError {
    UnitError::Channel {
        detail: format!("failed to send {step}: {err}"),
    }
}
