//! # Program Event Bus
//!
//! Broadcast channel of [`ProgramEvent`] observations published by the
//! scheduler: rounds, selections, warnings, faults, deadlocks and termination.
//! Hosts and tests subscribe to it to watch a run without instrumenting the
//! kernel.
//!
//! Publishing never fails the run. With no subscriber the observation is
//! simply dropped. Slow subscribers see [`EventError::Lagged`] and are
//! resubscribed at the tail.

use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tracing::trace;

use crate::{
    event::Event,
    report::{DeadlockReport, FaultReport, ThreadDeclaration},
    scheduler::TerminationKind,
};

#[derive(Debug, Clone, PartialEq)]
pub enum ProgramEvent {
    ThreadStarted {
        thread: String,
    },
    RoundStarted {
        round: u64,
        declarations: Vec<ThreadDeclaration>,
    },
    EventSelected {
        round: u64,
        event: Event,
        /// `None` for events taken from the external queue.
        requested_by: Option<String>,
    },
    ThreadResumed {
        round: u64,
        thread: String,
        event: Event,
    },
    SelfBlockedRequest {
        round: u64,
        thread: String,
        event: Event,
    },
    ThreadTerminated {
        thread: String,
    },
    ThreadFaulted(FaultReport),
    ThreadDeregistered {
        thread: String,
    },
    RegistrationRejected {
        thread: String,
    },
    Deadlock(DeadlockReport),
    ProgramEnded {
        termination: TerminationKind,
        rounds: u64,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EventError {
    #[error("Receiver lagged behind by {count} events")]
    Lagged { count: u64 },
    #[error("Failed to receive event: {message}")]
    ReceiveFailed { message: String },
}

pub type EventResult<T> = Result<T, EventError>;

#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<ProgramEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver::new(self.sender.subscribe())
    }

    pub fn publish(&self, event: ProgramEvent) {
        if self.sender.send(event).is_err() {
            trace!("no subscribers for program event");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<ProgramEvent>,
}

impl EventReceiver {
    fn new(receiver: broadcast::Receiver<ProgramEvent>) -> Self {
        Self { receiver }
    }

    /// Receives the next observation. On lag the receiver jumps to the tail and
    /// the number of skipped observations is returned as an error; call `recv`
    /// again to continue.
    pub async fn recv(&mut self) -> EventResult<ProgramEvent> {
        match self.receiver.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                self.receiver = self.receiver.resubscribe();
                Err(EventError::Lagged { count: n })
            }
            Err(e) => Err(EventError::ReceiveFailed {
                message: e.to_string(),
            }),
        }
    }

    /// Non-blocking variant; `Ok(None)` when nothing is queued.
    pub fn try_recv(&mut self) -> EventResult<Option<ProgramEvent>> {
        match self.receiver.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                self.receiver = self.receiver.resubscribe();
                Err(EventError::Lagged { count: n })
            }
            Err(e) => Err(EventError::ReceiveFailed {
                message: e.to_string(),
            }),
        }
    }

    /// Everything currently queued, in publication order.
    pub fn drain(&mut self) -> EventResult<Vec<ProgramEvent>> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv()? {
            events.push(event);
        }
        Ok(events)
    }

    /// Stream view; lagged gaps are skipped silently.
    pub fn into_stream(self) -> impl Stream<Item = ProgramEvent> {
        BroadcastStream::new(self.receiver).filter_map(|e| e.ok())
    }
}
