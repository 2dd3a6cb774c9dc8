//! # Scheduler Loop
//!
//! Drives a program round by round. The scheduler is the only owner and
//! mutator of thread state.
//!
//! ```text
//! loop {
//!   ├─► apply host controls (external events, register, deregister, stop)
//!   ├─► start newly registered b-threads, each up to its first sync
//!   ├─► no threads left        ─► AllThreadsTerminated
//!   ├─► max_rounds reached     ─► RoundLimitReached
//!   ├─► arbitrate(declarations, external queue, strategy)
//!   │     ├─ Selected(event)   ─► deliver: fix the matched set, then resume
//!   │     │                        each matched thread in registration order
//!   │     │                        and wait until it suspends or ends
//!   │     └─ NoEventSelectable ─► wait for external events (if configured)
//!   │                             or DeadlockPolicy: Halt / Error
//!   └─► repeat
//! }
//! ```
//!
//! Faults (error return, panic, segment timeout) remove only the faulting
//! thread under [`FaultPolicy::Isolate`]; [`FaultPolicy::Abort`] ends the run.

use std::{collections::BTreeMap, sync::Arc};

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    bthread::{
        spawn_bthread, BehaviorBody, BehaviorError, BehaviorOptions, ThreadId, ThreadReport,
    },
    config::{DeadlockPolicy, FaultPolicy, ProgramConfig},
    declaration::{Declaration, DeclarationError},
    event::Event,
    event_bus::{EventBus, ProgramEvent},
    kernel::{
        self, Arbitration, EventSelectionStrategy, KernelError, Observation, Participant,
        Selection, SelectionSource,
    },
    report::{DeadlockReport, FaultReport, ThreadDeclaration},
};

/// Host-to-scheduler messages, applied between rounds.
pub(crate) enum Control {
    External(Event),
    Register {
        name: String,
        options: BehaviorOptions,
        body: BehaviorBody,
    },
    Deregister {
        name: String,
    },
    Stop,
}

pub(crate) struct Registration {
    pub(crate) name: String,
    pub(crate) options: BehaviorOptions,
    pub(crate) body: BehaviorBody,
}

/// Externally visible status of a b-thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ThreadStatus {
    Pending,
    Running,
    Suspended,
    Terminated,
    Faulted,
    Deregistered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum TerminationKind {
    AllThreadsTerminated,
    Deadlock,
    RoundLimitReached,
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    AllThreadsTerminated,
    Deadlock(DeadlockReport),
    RoundLimitReached,
    Stopped,
}

impl Termination {
    pub fn kind(&self) -> TerminationKind {
        match self {
            Termination::AllThreadsTerminated => TerminationKind::AllThreadsTerminated,
            Termination::Deadlock(_) => TerminationKind::Deadlock,
            Termination::RoundLimitReached => TerminationKind::RoundLimitReached,
            Termination::Stopped => TerminationKind::Stopped,
        }
    }
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub termination: Termination,
    /// Number of events selected.
    pub rounds: u64,
    /// Selected events in order; empty when `record_trace` is off.
    pub trace: Vec<Event>,
    pub faults: Vec<FaultReport>,
}

impl RunSummary {
    pub fn event_names(&self) -> Vec<&str> {
        self.trace.iter().map(Event::name).collect()
    }

    pub fn deadlock(&self) -> Option<&DeadlockReport> {
        match &self.termination {
            Termination::Deadlock(report) => Some(report),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Deadlock detected: {0}")]
    DeadlockDetected(DeadlockReport),

    #[error("Behavior fault: {0}")]
    BehaviorFault(FaultReport),

    #[error("Invalid declaration: {0}")]
    InvalidDeclaration(#[from] DeclarationError),

    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),

    /// Kernel bookkeeping went wrong; the run cannot continue safely.
    #[error("Scheduler invariant violated: {message}")]
    InvariantViolation { message: String },

    #[error("Program is not running")]
    ProgramEnded,
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

fn invariant(message: String) -> SchedulerError {
    SchedulerError::InvariantViolation { message }
}

enum Phase {
    Pending(oneshot::Sender<()>),
    /// Carries the declaration the thread was resumed from, if any.
    Running(Option<Declaration>),
    Suspended {
        declaration: Declaration,
        resume: oneshot::Sender<Event>,
    },
}

struct ThreadState {
    id: ThreadId,
    name: String,
    priority: i32,
    phase: Phase,
    task: JoinHandle<()>,
}

pub(crate) struct Scheduler {
    run_id: Uuid,
    config: ProgramConfig,
    strategy: Box<dyn EventSelectionStrategy>,
    threads: BTreeMap<ThreadId, ThreadState>,
    next_id: u64,
    reports_tx: mpsc::UnboundedSender<ThreadReport>,
    reports_rx: mpsc::UnboundedReceiver<ThreadReport>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    /// Registrations made by b-threads during the current round.
    deferred: Vec<Control>,
    external: Vec<Event>,
    bus: Arc<EventBus>,
    statuses: Arc<DashMap<String, ThreadStatus>>,
    trace: Vec<Event>,
    faults: Vec<FaultReport>,
    round: u64,
    stop_requested: bool,
}

impl Scheduler {
    /// Must be called inside a tokio runtime: registered b-threads are spawned here.
    pub(crate) fn new(
        config: ProgramConfig,
        strategy: Box<dyn EventSelectionStrategy>,
        registrations: Vec<Registration>,
        control_rx: mpsc::UnboundedReceiver<Control>,
        bus: Arc<EventBus>,
        statuses: Arc<DashMap<String, ThreadStatus>>,
    ) -> Self {
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let mut scheduler = Self {
            run_id: Uuid::new_v4(),
            config,
            strategy,
            threads: BTreeMap::new(),
            next_id: 0,
            reports_tx,
            reports_rx,
            control_rx,
            deferred: Vec::new(),
            external: Vec::new(),
            bus,
            statuses,
            trace: Vec::new(),
            faults: Vec::new(),
            round: 0,
            stop_requested: false,
        };
        for registration in registrations {
            scheduler.add_thread(registration.name, registration.options, registration.body);
        }
        scheduler
    }

    #[tracing::instrument(skip_all, level = "debug")]
    pub(crate) async fn run(mut self) -> SchedulerResult<RunSummary> {
        info!(
            run_id = %self.run_id,
            threads = self.threads.len(),
            strategy = self.strategy.name(),
            "program starting"
        );
        let outcome = self.drive().await;
        self.shutdown();
        let termination = outcome?;

        info!(
            run_id = %self.run_id,
            termination = %termination.kind(),
            rounds = self.round,
            "program ended"
        );
        self.bus.publish(ProgramEvent::ProgramEnded {
            termination: termination.kind(),
            rounds: self.round,
        });
        Ok(RunSummary {
            run_id: self.run_id,
            termination,
            rounds: self.round,
            trace: std::mem::take(&mut self.trace),
            faults: std::mem::take(&mut self.faults),
        })
    }

    async fn drive(&mut self) -> SchedulerResult<Termination> {
        loop {
            self.apply_pending_controls();
            if self.stop_requested {
                return Ok(Termination::Stopped);
            }
            self.start_pending().await?;
            if self.threads.is_empty() {
                return Ok(Termination::AllThreadsTerminated);
            }
            if self.config.max_rounds.is_some_and(|max| self.round >= max) {
                return Ok(Termination::RoundLimitReached);
            }

            let round = self.round + 1;
            let declarations = snapshot(&self.threads);
            debug!(round, threads = declarations.len(), "round started");
            self.bus.publish(ProgramEvent::RoundStarted {
                round,
                declarations,
            });

            let decision = {
                let participants = participants(&self.threads);
                kernel::arbitrate(&participants, &self.external, self.strategy.as_mut())?
            };
            for observation in decision.observations {
                match observation {
                    Observation::SelfBlockedRequest { thread, event } => {
                        warn!(
                            round,
                            %thread,
                            %event,
                            "b-thread requests an event it also blocks; the block wins"
                        );
                        self.bus.publish(ProgramEvent::SelfBlockedRequest {
                            round,
                            thread,
                            event,
                        });
                    }
                }
            }

            match decision.arbitration {
                Arbitration::Selected(selection) => self.deliver(round, selection).await?,
                Arbitration::NoEventSelectable { blocked } => {
                    let report = DeadlockReport {
                        round,
                        at: Utc::now(),
                        declarations: snapshot(&self.threads),
                        blocked,
                    };
                    if self.config.wait_for_external_events {
                        debug!(round, "nothing selectable; waiting for external events");
                        match self.control_rx.recv().await {
                            Some(control) => {
                                self.apply_control(control);
                                continue;
                            }
                            None => debug!("no host handle left; applying deadlock policy"),
                        }
                    }
                    warn!(round, "{}", report);
                    self.bus.publish(ProgramEvent::Deadlock(report.clone()));
                    return match self.config.deadlock_policy {
                        DeadlockPolicy::Halt => Ok(Termination::Deadlock(report)),
                        DeadlockPolicy::Error => Err(SchedulerError::DeadlockDetected(report)),
                    };
                }
            }
        }
    }

    async fn deliver(&mut self, round: u64, selection: Selection) -> SchedulerResult<()> {
        let requested_by = selection.requested_by().map(str::to_string);
        if let SelectionSource::External { queue_index } = selection.source {
            self.external.remove(queue_index);
        }
        let event = selection.event;
        info!(
            round,
            %event,
            requested_by = requested_by.as_deref().unwrap_or("<external>"),
            "event selected"
        );
        self.bus.publish(ProgramEvent::EventSelected {
            round,
            event: event.clone(),
            requested_by,
        });
        if self.config.record_trace {
            self.trace.push(event.clone());
        }

        // The matched set is fixed before anyone runs.
        let matched = kernel::matched_threads(&participants(&self.threads), &event);
        self.round = round;
        for id in matched {
            self.resume(id, round, &event).await?;
        }
        Ok(())
    }

    async fn resume(&mut self, id: ThreadId, round: u64, event: &Event) -> SchedulerResult<()> {
        let Some(state) = self.threads.get_mut(&id) else {
            debug!(thread = %id, "matched b-thread is gone; declaration discarded");
            return Ok(());
        };
        let resume = match std::mem::replace(&mut state.phase, Phase::Running(None)) {
            Phase::Suspended {
                declaration,
                resume,
            } => {
                state.phase = Phase::Running(Some(declaration));
                resume
            }
            other => {
                state.phase = other;
                return Err(invariant(format!(
                    "b-thread {} resumed without a pending declaration",
                    state.name
                )));
            }
        };
        let name = state.name.clone();
        if resume.send(event.clone()).is_err() {
            debug!(thread = %name, "b-thread stopped listening; declaration discarded");
            if let Some(thread) = self.remove_thread(id, ThreadStatus::Terminated) {
                self.bus.publish(ProgramEvent::ThreadTerminated { thread });
            }
            return Ok(());
        }
        self.statuses.insert(name.clone(), ThreadStatus::Running);
        debug!(round, thread = %name, %event, "b-thread resumed");
        self.bus.publish(ProgramEvent::ThreadResumed {
            round,
            thread: name,
            event: event.clone(),
        });
        self.await_segment(id).await
    }

    /// Starts pending threads until none are left, so children registered in
    /// a first segment declare before the next arbitration.
    async fn start_pending(&mut self) -> SchedulerResult<()> {
        loop {
            let pending: Vec<ThreadId> = self
                .threads
                .values()
                .filter(|t| matches!(t.phase, Phase::Pending(_)))
                .map(|t| t.id)
                .collect();
            if pending.is_empty() {
                return Ok(());
            }
            for id in pending {
                self.start(id).await?;
            }
            for control in std::mem::take(&mut self.deferred) {
                self.apply_control(control);
            }
        }
    }

    async fn start(&mut self, id: ThreadId) -> SchedulerResult<()> {
        let Some(state) = self.threads.get_mut(&id) else {
            return Ok(());
        };
        let start = match std::mem::replace(&mut state.phase, Phase::Running(None)) {
            Phase::Pending(start) => start,
            other => {
                state.phase = other;
                return Ok(());
            }
        };
        let name = state.name.clone();
        if start.send(()).is_err() {
            self.remove_thread(id, ThreadStatus::Terminated);
            return Ok(());
        }
        self.statuses.insert(name.clone(), ThreadStatus::Running);
        debug!(thread = %name, "b-thread started");
        self.bus.publish(ProgramEvent::ThreadStarted { thread: name });
        self.await_segment(id).await
    }

    /// Waits for the running thread `id` to suspend, finish or fault.
    async fn await_segment(&mut self, id: ThreadId) -> SchedulerResult<()> {
        let report = match self.config.segment_timeout {
            Some(limit) => match timeout(limit, self.next_report(id)).await {
                Ok(report) => report?,
                Err(_) => ThreadReport::Faulted {
                    id,
                    error: BehaviorError::Timeout { after: limit },
                },
            },
            None => self.next_report(id).await?,
        };
        self.apply_report(report)
    }

    async fn next_report(&mut self, id: ThreadId) -> SchedulerResult<ThreadReport> {
        loop {
            let report = self
                .reports_rx
                .recv()
                .await
                .ok_or_else(|| invariant("report channel closed".to_string()))?;
            let report = match report {
                ThreadReport::Register {
                    name,
                    options,
                    body,
                    ..
                } => {
                    self.deferred.push(Control::Register {
                        name,
                        options,
                        body,
                    });
                    continue;
                }
                report => report,
            };
            let from = report.thread_id();
            if from == id {
                return Ok(report);
            }
            if self.threads.contains_key(&from) {
                return Err(invariant(format!(
                    "b-thread {} reported while {} was running",
                    from, id
                )));
            }
            debug!(thread = %from, "discarding report from removed b-thread");
        }
    }

    fn apply_report(&mut self, report: ThreadReport) -> SchedulerResult<()> {
        match report {
            ThreadReport::Suspended {
                id,
                declaration,
                resume,
            } => {
                let state = self
                    .threads
                    .get_mut(&id)
                    .ok_or_else(|| invariant(format!("unknown b-thread {} suspended", id)))?;
                if declaration.is_passive() {
                    debug!(
                        thread = %state.name,
                        %declaration,
                        "b-thread suspended with nothing to resume it"
                    );
                } else {
                    debug!(thread = %state.name, %declaration, "b-thread suspended");
                }
                self.statuses
                    .insert(state.name.clone(), ThreadStatus::Suspended);
                state.phase = Phase::Suspended {
                    declaration,
                    resume,
                };
                Ok(())
            }
            ThreadReport::Finished { id } => {
                if let Some(thread) = self.remove_thread(id, ThreadStatus::Terminated) {
                    info!(%thread, "b-thread terminated");
                    self.bus.publish(ProgramEvent::ThreadTerminated { thread });
                }
                Ok(())
            }
            ThreadReport::Faulted { id, error } => self.handle_fault(id, error),
            ThreadReport::Register { name, .. } => Err(invariant(format!(
                "registration of {} reached the segment handler",
                name
            ))),
        }
    }

    fn handle_fault(&mut self, id: ThreadId, error: BehaviorError) -> SchedulerResult<()> {
        let resumed_from = self.threads.get(&id).and_then(|t| match &t.phase {
            Phase::Running(Some(declaration)) => Some(ThreadDeclaration {
                thread: t.name.clone(),
                declaration: declaration.clone(),
            }),
            _ => None,
        });
        let Some(thread) = self.remove_thread(id, ThreadStatus::Faulted) else {
            return Ok(());
        };
        let mut declarations: Vec<ThreadDeclaration> = resumed_from.into_iter().collect();
        declarations.extend(snapshot(&self.threads));
        let report = FaultReport {
            thread,
            round: self.round,
            at: Utc::now(),
            error,
            declarations,
        };
        error!(thread = %report.thread, round = report.round, "b-thread faulted: {}", report.error);
        self.bus.publish(ProgramEvent::ThreadFaulted(report.clone()));
        self.faults.push(report.clone());
        match self.config.fault_policy {
            FaultPolicy::Isolate => Ok(()),
            FaultPolicy::Abort => Err(SchedulerError::BehaviorFault(report)),
        }
    }

    fn apply_pending_controls(&mut self) {
        for control in std::mem::take(&mut self.deferred) {
            self.apply_control(control);
        }
        while let Ok(control) = self.control_rx.try_recv() {
            self.apply_control(control);
        }
    }

    fn apply_control(&mut self, control: Control) {
        match control {
            Control::External(event) => {
                debug!(%event, "external event queued");
                self.external.push(event);
            }
            Control::Register {
                name,
                options,
                body,
            } => self.add_thread(name, options, body),
            Control::Deregister { name } => {
                let id = self.threads.values().find(|t| t.name == name).map(|t| t.id);
                match id.and_then(|id| self.remove_thread(id, ThreadStatus::Deregistered)) {
                    Some(thread) => {
                        info!(%thread, "b-thread deregistered");
                        self.bus.publish(ProgramEvent::ThreadDeregistered { thread });
                    }
                    None => warn!(thread = %name, "deregistration of unknown b-thread ignored"),
                }
            }
            Control::Stop => {
                info!("stop requested");
                self.stop_requested = true;
            }
        }
    }

    fn add_thread(&mut self, name: String, options: BehaviorOptions, body: BehaviorBody) {
        if name.trim().is_empty() {
            warn!("b-thread registered without a name; registration rejected");
            self.bus
                .publish(ProgramEvent::RegistrationRejected { thread: name });
            return;
        }
        if self.threads.values().any(|t| t.name == name) {
            warn!(thread = %name, "a live b-thread already has this name; registration rejected");
            self.bus
                .publish(ProgramEvent::RegistrationRejected { thread: name });
            return;
        }
        let id = ThreadId(self.next_id);
        self.next_id += 1;
        let (task, start) = spawn_bthread(id, &name, body, self.reports_tx.clone());
        self.statuses.insert(name.clone(), ThreadStatus::Pending);
        self.threads.insert(
            id,
            ThreadState {
                id,
                name,
                priority: options.priority,
                phase: Phase::Pending(start),
                task,
            },
        );
    }

    /// Drops the thread's continuation (its pending `sync` observes
    /// cancellation) and aborts its task.
    fn remove_thread(&mut self, id: ThreadId, status: ThreadStatus) -> Option<String> {
        let state = self.threads.remove(&id)?;
        state.task.abort();
        self.statuses.insert(state.name.clone(), status);
        Some(state.name)
    }

    fn shutdown(&mut self) {
        let remaining = std::mem::take(&mut self.threads);
        for state in remaining.values() {
            state.task.abort();
        }
        debug!(remaining = remaining.len(), "aborted remaining b-thread tasks");
    }
}

fn participants(threads: &BTreeMap<ThreadId, ThreadState>) -> Vec<Participant<'_>> {
    threads
        .values()
        .filter_map(|t| match &t.phase {
            Phase::Suspended { declaration, .. } => Some(Participant {
                id: t.id,
                name: &t.name,
                priority: t.priority,
                declaration,
            }),
            _ => None,
        })
        .collect()
}

fn snapshot(threads: &BTreeMap<ThreadId, ThreadState>) -> Vec<ThreadDeclaration> {
    participants(threads)
        .into_iter()
        .map(|p| ThreadDeclaration {
            thread: p.name.to_string(),
            declaration: p.declaration.clone(),
        })
        .collect()
}
