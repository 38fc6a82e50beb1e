//! Bounded-concurrency scheduler.
//!
//! The coordinating thread owns the queue and the result slots. Each
//! dispatched unit runs its [`SessionStateMachine`] on its own thread and
//! reports back over a channel; the pool is refilled as soon as a slot frees
//! up, in queue order.
//!
//! Cancellation stops dispatch, fails every queued unit and gives in-flight
//! units `grace_period` to finish before they are force-failed.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::agent::AgentAdapter;
use crate::config::RunConfig;
use crate::error::{ConfigError, RunError, UnitError};
use crate::log::{RunInfo, RunObserver};
use crate::scanner::{self, WorkUnit};
use crate::session::{LaunchResult, SessionState, SessionStateMachine, UnitContext};
use crate::terminal::TerminalStrategy;

/// Run-level cancellation flag, shared by the scheduler and every unit.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Every unit's result, in queue order.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub results: Vec<LaunchResult>,
    pub duration: Duration,
    /// Most units running at once.
    pub peak_in_flight: usize,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn completed(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.total() - self.completed()
    }

    /// Percentage of units that completed. Zero for an empty run.
    pub fn success_rate(&self) -> f64 {
        if self.results.is_empty() {
            return 0.0;
        }
        self.completed() as f64 * 100.0 / self.total() as f64
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed() == 0
    }
}

type Outcome = (usize, Result<LaunchResult, String>);

struct InFlight {
    unit: WorkUnit,
    trail: Arc<Mutex<Vec<SessionState>>>,
    started: Instant,
}

pub struct Scheduler {
    config: Arc<RunConfig>,
    terminal: Arc<dyn TerminalStrategy>,
    agent: Arc<dyn AgentAdapter>,
    observer: Arc<dyn RunObserver>,
}

impl Scheduler {
    pub fn new(
        config: Arc<RunConfig>,
        terminal: Arc<dyn TerminalStrategy>,
        agent: Arc<dyn AgentAdapter>,
        observer: Arc<dyn RunObserver>,
    ) -> Self {
        Self {
            config,
            terminal,
            agent,
            observer,
        }
    }

    /// Scan the configured base directory and run every eligible unit.
    pub fn run_base(&self, cancel: &CancelToken) -> Result<RunSummary, RunError> {
        let units = scanner::scan(&self.config.base_path, &self.config.exclude_set()?)?;
        if units.is_empty() {
            warn!(base = %self.config.base_path.display(), "no eligible directories found");
        }
        Ok(self.run(units, cancel)?)
    }

    /// Process `units` with at most `max_parallel` running at once.
    ///
    /// Fails only on invalid configuration, before anything is dispatched.
    /// Otherwise returns exactly one result per unit.
    pub fn run(&self, units: Vec<WorkUnit>, cancel: &CancelToken) -> Result<RunSummary, ConfigError> {
        self.config.validate()?;
        let started = Instant::now();
        let max_parallel = self.config.max_parallel;

        self.observer.run_started(&RunInfo {
            base: self.config.base_path.clone(),
            units: units.len(),
            max_parallel,
            terminal: self.terminal.name().to_string(),
            stage: self.config.stage.clone(),
        });
        for unit in &units {
            self.observer.unit_queued(unit);
        }

        let ctx = Arc::new(UnitContext::new(
            Arc::clone(&self.config),
            Arc::clone(&self.terminal),
            Arc::clone(&self.agent),
            Arc::clone(&self.observer),
            cancel.clone(),
        ));
        let mut slots: Vec<Option<LaunchResult>> = vec![None; units.len()];
        let mut queue: VecDeque<(usize, WorkUnit)> = units.into_iter().enumerate().collect();
        let mut in_flight: HashMap<usize, InFlight> = HashMap::new();
        let (tx, rx) = mpsc::channel::<Outcome>();
        let mut peak = 0usize;
        let mut cancelled_at: Option<Instant> = None;

        loop {
            if cancelled_at.is_none() && cancel.is_cancelled() {
                cancelled_at = Some(Instant::now());
                self.observer.run_cancelled(queue.len(), in_flight.len());
                for (index, unit) in queue.drain(..) {
                    let result = LaunchResult::aborted(
                        unit,
                        vec![SessionState::Unknown],
                        UnitError::Cancelled,
                        Duration::ZERO,
                    );
                    self.finish(&mut slots, index, result);
                }
            }

            while cancelled_at.is_none() && in_flight.len() < max_parallel {
                let Some((index, unit)) = queue.pop_front() else {
                    break;
                };
                match self.dispatch(&ctx, index, unit.clone(), tx.clone()) {
                    Ok(flight) => {
                        in_flight.insert(index, flight);
                        peak = peak.max(in_flight.len());
                    }
                    Err(error) => {
                        let result = LaunchResult::aborted(
                            unit,
                            vec![SessionState::Unknown],
                            error,
                            Duration::ZERO,
                        );
                        self.finish(&mut slots, index, result);
                    }
                }
            }

            if in_flight.is_empty() && queue.is_empty() {
                break;
            }

            if let Some(at) = cancelled_at
                && at.elapsed() >= self.config.grace_period
            {
                ctx.stop_reporting();
                for (index, flight) in in_flight.drain() {
                    warn!(unit = %flight.unit.label, "still running after grace period");
                    let result = LaunchResult::aborted(
                        flight.unit,
                        snapshot(&flight.trail),
                        UnitError::Cancelled,
                        flight.started.elapsed(),
                    );
                    self.finish(&mut slots, index, result);
                }
                break;
            }

            match rx.recv_timeout(self.config.poll_interval) {
                Ok((index, outcome)) => {
                    let Some(flight) = in_flight.remove(&index) else {
                        continue;
                    };
                    let result = outcome.unwrap_or_else(|detail| {
                        warn!(unit = %flight.unit.label, %detail, "unit panicked");
                        LaunchResult::aborted(
                            flight.unit,
                            snapshot(&flight.trail),
                            UnitError::Panicked { detail },
                            flight.started.elapsed(),
                        )
                    });
                    self.finish(&mut slots, index, result);
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
            }
        }

        ctx.stop_reporting();
        let summary = RunSummary {
            results: slots.into_iter().flatten().collect(),
            duration: started.elapsed(),
            peak_in_flight: peak,
            cancelled: cancelled_at.is_some(),
        };
        info!(
            completed = summary.completed(),
            failed = summary.failed(),
            peak = summary.peak_in_flight,
            "all units finished"
        );
        self.observer.run_completed(&summary);
        Ok(summary)
    }

    fn dispatch(
        &self,
        ctx: &Arc<UnitContext>,
        index: usize,
        unit: WorkUnit,
        tx: mpsc::Sender<Outcome>,
    ) -> Result<InFlight, UnitError> {
        let trail = Arc::new(Mutex::new(vec![SessionState::Unknown]));
        let flight = InFlight {
            unit: unit.clone(),
            trail: Arc::clone(&trail),
            started: Instant::now(),
        };
        let ctx = Arc::clone(ctx);
        debug!(unit = %unit.label, index, "dispatching");

        thread::Builder::new()
            .name(format!("unit-{}", unit.label))
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    SessionStateMachine::new(&ctx, unit, trail).run()
                }))
                .map_err(panic_message);
                // The coordinator may have stopped listening after a forced
                // cancellation.
                let _ = tx.send((index, outcome));
            })
            .map_err(|e| UnitError::Terminal {
                detail: format!("failed to start unit thread: {e}"),
            })?;
        Ok(flight)
    }

    fn finish(&self, slots: &mut [Option<LaunchResult>], index: usize, result: LaunchResult) {
        self.observer.unit_finished(&result);
        slots[index] = Some(result);
    }
}

fn snapshot(trail: &Mutex<Vec<SessionState>>) -> Vec<SessionState> {
    trail.lock().unwrap_or_else(|e| e.into_inner()).clone()
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        return (*text).to_string();
    }
    if let Some(text) = payload.downcast_ref::<String>() {
        return text.clone();
    }
    "unknown panic".to_string()
}
