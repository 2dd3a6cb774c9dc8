//! # B-threads
//!
//! A b-thread is a registered behavior body running in its own tokio task. It
//! talks to the scheduler only through [`BThreadContext::sync`]:
//!
//! ```text
//!   b-thread task                          scheduler
//!   ─────────────                          ─────────
//!   (gated until started) ◄─── start ───── start_pending()
//!   runs segment
//!   sync(declaration) ──── Suspended ────► stores declaration
//!       ... suspended ...                   arbitrates round
//!   ◄──────────── resume(event) ────────── deliver to matched threads
//!   runs next segment
//!   returns Ok / Err / panics ── Finished / Faulted ──►
//! ```
//!
//! The scheduler resumes one thread at a time and waits for it to suspend again
//! or finish, so only one behavior segment ever runs at once.

use std::{any::Any, future::Future, panic::AssertUnwindSafe, time::Duration};

use futures::{future::BoxFuture, FutureExt};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, trace};

use crate::{
    declaration::{Declaration, DeclarationError},
    event::{Event, EventSet},
};

/// Registration sequence number; ordering by id is registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u64);

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BehaviorOptions {
    /// Used by the `priority` selection policy; higher wins.
    pub priority: i32,
}

/// Errors returned by [`BThreadContext::sync`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Invalid declaration: {0}")]
    InvalidDeclaration(#[from] DeclarationError),
    #[error("B-thread {thread} was cancelled while suspended")]
    Cancelled { thread: String },
    #[error("Scheduler is no longer running (b-thread {thread})")]
    SchedulerGone { thread: String },
}

/// Why a behavior body stopped abnormally.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BehaviorError {
    #[error("Sync failed: {0}")]
    Sync(#[from] SyncError),
    #[error("Behavior failed: {message}")]
    Failed { message: String },
    #[error("Behavior panicked: {message}")]
    Panicked { message: String },
    #[error("Behavior did not suspend within {after:?}")]
    Timeout { after: Duration },
}

impl BehaviorError {
    pub fn failed<S: Into<String>>(message: S) -> Self {
        BehaviorError::Failed {
            message: message.into(),
        }
    }
}

pub type BehaviorResult = Result<(), BehaviorError>;

pub(crate) type BehaviorBody =
    Box<dyn FnOnce(BThreadContext) -> BoxFuture<'static, BehaviorResult> + Send>;

pub(crate) fn boxed_body<F, Fut>(body: F) -> BehaviorBody
where
    F: FnOnce(BThreadContext) -> Fut + Send + 'static,
    Fut: Future<Output = BehaviorResult> + Send + 'static,
{
    Box::new(move |ctx| body(ctx).boxed())
}

/// Message from a b-thread task to the scheduler.
pub(crate) enum ThreadReport {
    Suspended {
        id: ThreadId,
        declaration: Declaration,
        resume: oneshot::Sender<Event>,
    },
    Finished {
        id: ThreadId,
    },
    Faulted {
        id: ThreadId,
        error: BehaviorError,
    },
    /// Registration requested by a running b-thread; applied before the next round.
    Register {
        id: ThreadId,
        name: String,
        options: BehaviorOptions,
        body: BehaviorBody,
    },
}

impl ThreadReport {
    pub(crate) fn thread_id(&self) -> ThreadId {
        match self {
            ThreadReport::Suspended { id, .. }
            | ThreadReport::Finished { id }
            | ThreadReport::Faulted { id, .. }
            | ThreadReport::Register { id, .. } => *id,
        }
    }
}

/// Execution context handed to a behavior body.
pub struct BThreadContext {
    id: ThreadId,
    name: String,
    reports: mpsc::UnboundedSender<ThreadReport>,
}

impl BThreadContext {
    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publishes `declaration` and suspends until the scheduler delivers an
    /// event this thread requested or waits for.
    ///
    /// A malformed declaration is rejected here, before anything is published.
    /// A declaration that neither requests nor waits for anything is accepted
    /// and never resumes.
    pub async fn sync(&mut self, declaration: Declaration) -> Result<Event, SyncError> {
        declaration.validate()?;
        trace!(thread = %self.name, %declaration, "sync");
        let (resume, resumed) = oneshot::channel();
        self.reports
            .send(ThreadReport::Suspended {
                id: self.id,
                declaration,
                resume,
            })
            .map_err(|_| SyncError::SchedulerGone {
                thread: self.name.clone(),
            })?;
        resumed.await.map_err(|_| SyncError::Cancelled {
            thread: self.name.clone(),
        })
    }

    pub async fn request(&mut self, event: Event) -> Result<Event, SyncError> {
        self.sync(Declaration::new().request(event)).await
    }

    pub async fn wait_for(&mut self, set: impl Into<EventSet>) -> Result<Event, SyncError> {
        self.sync(Declaration::new().wait_for(set)).await
    }

    /// Registers another b-thread; it starts at the beginning of the next round.
    pub fn register_behavior<F, Fut>(&self, name: &str, body: F) -> Result<(), SyncError>
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
    ) -> Result<(), SyncError>
    where
        F: FnOnce(BThreadContext) -> Fut + Send + 'static,
        Fut: Future<Output = BehaviorResult> + Send + 'static,
    {
        self.reports
            .send(ThreadReport::Register {
                id: self.id,
                name: name.to_string(),
                options,
                body: boxed_body(body),
            })
            .map_err(|_| SyncError::SchedulerGone {
                thread: self.name.clone(),
            })
    }
}

/// Spawns the task for a b-thread. The body does not run until the returned
/// start sender fires.
pub(crate) fn spawn_bthread(
    id: ThreadId,
    name: &str,
    body: BehaviorBody,
    reports: mpsc::UnboundedSender<ThreadReport>,
) -> (JoinHandle<()>, oneshot::Sender<()>) {
    let (start, started) = oneshot::channel::<()>();
    let ctx = BThreadContext {
        id,
        name: name.to_string(),
        reports: reports.clone(),
    };
    let task = tokio::spawn(async move {
        if started.await.is_err() {
            return;
        }
        let name = ctx.name.clone();
        let outcome = AssertUnwindSafe(async move { body(ctx).await })
            .catch_unwind()
            .await;
        let report = match outcome {
            Ok(Ok(())) => ThreadReport::Finished { id },
            Ok(Err(error)) => ThreadReport::Faulted { id, error },
            Err(panic) => ThreadReport::Faulted {
                id,
                error: BehaviorError::Panicked {
                    message: panic_message(panic.as_ref()),
                },
            },
        };
        if reports.send(report).is_err() {
            debug!(thread = %name, "scheduler gone before final report");
        }
    });
    (task, start)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_body_waits_for_start() {
        let (reports_tx, mut reports_rx) = mpsc::unbounded_channel();
        let body = boxed_body(|_ctx| async { Ok(()) });
        let (_task, start) = spawn_bthread(ThreadId(0), "idle", body, reports_tx);
        tokio::task::yield_now().await;
        assert!(reports_rx.try_recv().is_err());

        start.send(()).unwrap();
        let report = reports_rx.recv().await.unwrap();
        assert!(matches!(report, ThreadReport::Finished { id: ThreadId(0) }));
    }

    #[tokio::test]
    async fn test_sync_publishes_and_returns_delivered_event() {
        let (reports_tx, mut reports_rx) = mpsc::unbounded_channel();
        let (seen_tx, seen_rx) = oneshot::channel();
        let body = boxed_body(|mut ctx| async move {
            let event = ctx.wait_for("GO").await?;
            let _ = seen_tx.send(event);
            Ok(())
        });
        let (_task, start) = spawn_bthread(ThreadId(3), "waiter", body, reports_tx);
        start.send(()).unwrap();

        match reports_rx.recv().await.unwrap() {
            ThreadReport::Suspended {
                id,
                declaration,
                resume,
            } => {
                assert_eq!(id, ThreadId(3));
                assert_eq!(declaration, Declaration::new().wait_for("GO"));
                resume.send(Event::new("GO")).unwrap();
            }
            _ => panic!("expected a suspension"),
        }
        assert_eq!(seen_rx.await.unwrap(), Event::new("GO"));
        assert!(matches!(
            reports_rx.recv().await.unwrap(),
            ThreadReport::Finished { .. }
        ));
    }

    #[tokio::test]
    async fn test_invalid_declaration_never_reaches_scheduler() {
        let (reports_tx, mut reports_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = oneshot::channel();
        let body = boxed_body(|mut ctx| async move {
            let result = ctx.request(Event::new("  ")).await;
            let _ = result_tx.send(result);
            Ok(())
        });
        let (_task, start) = spawn_bthread(ThreadId(1), "bad", body, reports_tx);
        start.send(()).unwrap();

        assert!(matches!(
            result_rx.await.unwrap(),
            Err(SyncError::InvalidDeclaration(
                DeclarationError::EmptyEventName { .. }
            ))
        ));
        assert!(matches!(
            reports_rx.recv().await.unwrap(),
            ThreadReport::Finished { .. }
        ));
    }

    #[tokio::test]
    async fn test_dropped_resume_cancels_sync() {
        let (reports_tx, mut reports_rx) = mpsc::unbounded_channel();
        let body = boxed_body(|mut ctx| async move {
            ctx.wait_for("NEVER").await?;
            Ok(())
        });
        let (_task, start) = spawn_bthread(ThreadId(2), "orphan", body, reports_tx);
        start.send(()).unwrap();

        let suspended = reports_rx.recv().await.unwrap();
        drop(suspended);
        match reports_rx.recv().await.unwrap() {
            ThreadReport::Faulted { error, .. } => assert_eq!(
                error,
                BehaviorError::Sync(SyncError::Cancelled {
                    thread: "orphan".to_string()
                })
            ),
            _ => panic!("expected a fault"),
        }
    }

    #[tokio::test]
    async fn test_registration_goes_through_reports() {
        let (reports_tx, mut reports_rx) = mpsc::unbounded_channel();
        let body = boxed_body(|ctx| async move {
            ctx.register_behavior_with("child", BehaviorOptions { priority: 3 }, |_ctx| async {
                Ok(())
            })?;
            Ok(())
        });
        let (_task, start) = spawn_bthread(ThreadId(5), "parent", body, reports_tx);
        start.send(()).unwrap();

        match reports_rx.recv().await.unwrap() {
            ThreadReport::Register {
                id, name, options, ..
            } => {
                assert_eq!(id, ThreadId(5));
                assert_eq!(name, "child");
                assert_eq!(options.priority, 3);
            }
            _ => panic!("expected a registration"),
        }
        assert!(matches!(
            reports_rx.recv().await.unwrap(),
            ThreadReport::Finished { .. }
        ));
    }

    #[tokio::test]
    async fn test_panic_becomes_fault() {
        let (reports_tx, mut reports_rx) = mpsc::unbounded_channel();
        let body = boxed_body(|ctx| async move {
            if ctx.name() == "panicky" {
                panic!("bound check exploded");
            }
            Ok(())
        });
        let (_task, start) = spawn_bthread(ThreadId(4), "panicky", body, reports_tx);
        start.send(()).unwrap();

        match reports_rx.recv().await.unwrap() {
            ThreadReport::Faulted { error, .. } => assert_eq!(
                error,
                BehaviorError::Panicked {
                    message: "bound check exploded".to_string()
                }
            ),
            _ => panic!("expected a fault"),
        }
    }
}
