//! # Program
//!
//! Owns the registrations and the ambient pieces of a run (config, event bus,
//! status view) until [`Program::run`] hands them to the scheduler.
//!
//! ```no_run
//! # use bpsync::{config::ProgramConfig, event::Event, program::Program};
//! # async fn demo() -> Result<(), bpsync::Error> {
//! let mut program = Program::new(&ProgramConfig::default());
//! program.register_behavior("Hello", |mut ctx| async move {
//!     ctx.request(Event::new("HELLO")).await?;
//!     Ok(())
//! })?;
//! let summary = program.run().await?;
//! assert_eq!(summary.event_names(), vec!["HELLO"]);
//! # Ok(())
//! # }
//! ```

use std::{collections::HashSet, future::Future, sync::Arc, time::Duration};

use dashmap::DashMap;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

use crate::{
    bthread::{boxed_body, BThreadContext, BehaviorOptions, BehaviorResult},
    config::ProgramConfig,
    declaration::{DeclarationError, DeclarationField},
    event::Event,
    event_bus::{EventBus, EventReceiver},
    kernel::EventSelectionStrategy,
    scheduler::{
        Control, Registration, RunSummary, Scheduler, SchedulerError, SchedulerResult,
        ThreadStatus,
    },
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistrationError {
    #[error("Behavior already registered: {name}")]
    DuplicateBehavior { name: String },
    #[error("Behavior name must not be empty")]
    EmptyName,
}

pub type RegistrationResult<T> = Result<T, RegistrationError>;

pub struct Program {
    config: ProgramConfig,
    registrations: Vec<Registration>,
    names: HashSet<String>,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    event_bus: Arc<EventBus>,
    statuses: Arc<DashMap<String, ThreadStatus>>,
    strategy: Option<Box<dyn EventSelectionStrategy>>,
}

impl Program {
    pub fn new(config: &ProgramConfig) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            config: config.clone(),
            registrations: Vec::new(),
            names: HashSet::new(),
            control_tx,
            control_rx,
            event_bus: Arc::new(EventBus::new(config.event_buffer_size)),
            statuses: Arc::new(DashMap::new()),
            strategy: None,
        }
    }

    /// Overrides the strategy built from `config.selection`.
    pub fn with_strategy(mut self, strategy: Box<dyn EventSelectionStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn register_behavior<F, Fut>(&mut self, name: &str, body: F) -> RegistrationResult<()>
    where
        F: FnOnce(BThreadContext) -> Fut + Send + 'static,
        Fut: Future<Output = BehaviorResult> + Send + 'static,
    {
        self.register_behavior_with(name, BehaviorOptions::default(), body)
    }

    /// Registration order is the thread's rank in tie-breaks and delivery.
    pub fn register_behavior_with<F, Fut>(
        &mut self,
        name: &str,
        options: BehaviorOptions,
        body: F,
    ) -> RegistrationResult<()>
    where
        F: FnOnce(BThreadContext) -> Fut + Send + 'static,
        Fut: Future<Output = BehaviorResult> + Send + 'static,
    {
        if name.trim().is_empty() {
            return Err(RegistrationError::EmptyName);
        }
        if !self.names.insert(name.to_string()) {
            return Err(RegistrationError::DuplicateBehavior {
                name: name.to_string(),
            });
        }
        debug!(thread = name, priority = options.priority, "behavior registered");
        self.statuses.insert(name.to_string(), ThreadStatus::Pending);
        self.registrations.push(Registration {
            name: name.to_string(),
            options,
            body: boxed_body(body),
        });
        Ok(())
    }

    pub fn handle(&self) -> ProgramHandle {
        ProgramHandle {
            control_tx: self.control_tx.clone(),
            event_bus: self.event_bus.clone(),
            statuses: self.statuses.clone(),
        }
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.event_bus.subscribe()
    }

    /// Runs until every thread has terminated, a deadlock, the round limit
    /// or a stop request.
    pub async fn run(self) -> SchedulerResult<RunSummary> {
        let strategy = match self.strategy {
            Some(strategy) => strategy,
            None => self
                .config
                .selection
                .policy
                .build(self.config.selection.seed),
        };
        // From here on only handles keep the control channel open.
        drop(self.control_tx);

        Scheduler::new(
            self.config,
            strategy,
            self.registrations,
            self.control_rx,
            self.event_bus,
            self.statuses,
        )
        .run()
        .await
    }
}

/// Cloneable host-side handle to a program, usable before and during a run.
#[derive(Clone)]
pub struct ProgramHandle {
    control_tx: mpsc::UnboundedSender<Control>,
    event_bus: Arc<EventBus>,
    statuses: Arc<DashMap<String, ThreadStatus>>,
}

impl ProgramHandle {
    /// Queues an event from the environment. External events are never
    /// blocked by requests, only by block declarations, and are considered
    /// when no requested event is selectable.
    pub fn push_external(&self, event: Event) -> SchedulerResult<()> {
        if event.name().trim().is_empty() {
            return Err(SchedulerError::InvalidDeclaration(
                DeclarationError::EmptyEventName {
                    field: DeclarationField::Request,
                },
            ));
        }
        self.send(Control::External(event))
    }

    /// Pushes `event` after `delay`; this is how timeouts are modelled.
    pub fn schedule_external(&self, event: Event, delay: Duration) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let name = event.name().to_string();
            if let Err(e) = handle.push_external(event) {
                warn!(event = %name, "scheduled external event dropped: {}", e);
            }
        })
    }

    /// Removes a thread between rounds. Its pending `sync` observes
    /// cancellation.
    pub fn deregister(&self, name: &str) -> SchedulerResult<()> {
        self.send(Control::Deregister {
            name: name.to_string(),
        })
    }

    /// Registers a thread while the program runs; it starts at the beginning
    /// of the next round. A name already live is rejected by the scheduler.
    pub fn register_behavior<F, Fut>(&self, name: &str, body: F) -> SchedulerResult<()>
    where
        F: FnOnce(BThreadContext) -> Fut + Send + 'static,
        Fut: Future<Output = BehaviorResult> + Send + 'static,
    {
        self.register_behavior_with(name, BehaviorOptions::default(), body)
    }

    pub fn register_behavior_with<F, Fut>(
        &self,
        name: &str,
        options: BehaviorOptions,
        body: F,
    ) -> SchedulerResult<()>
    where
        F: FnOnce(BThreadContext) -> Fut + Send + 'static,
        Fut: Future<Output = BehaviorResult> + Send + 'static,
    {
        self.send(Control::Register {
            name: name.to_string(),
            options,
            body: boxed_body(body),
        })
    }

    pub fn stop(&self) -> SchedulerResult<()> {
        self.send(Control::Stop)
    }

    pub fn thread_status(&self, name: &str) -> Option<ThreadStatus> {
        self.statuses.get(name).map(|status| *status)
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.event_bus.subscribe()
    }

    fn send(&self, control: Control) -> SchedulerResult<()> {
        self.control_tx
            .send(control)
            .map_err(|_| SchedulerError::ProgramEnded)
    }
}
