//! # bpsync: Behavioral-Programming Rendezvous Kernel
//!
//! A program is a set of independently written behaviors (b-threads). Each
//! b-thread repeatedly suspends at a synchronization point and declares three
//! things:
//!
//! - events it **requests** (proposes to happen),
//! - events it **waits for** (wants to be notified of),
//! - events it **blocks** (forbids).
//!
//! When every live b-thread is suspended, the kernel selects one requested
//! event that nobody blocks, resumes exactly the b-threads that requested or
//! waited for it, and repeats. Safety rules ("never add dry while viscosity is
//! too high") are written as separate b-threads that only block, without
//! touching the code that requests the events.
//!
//! ## Layout
//!
//! - Events and selectors ([`event`]) and sync declarations ([`declaration`])
//! - B-thread tasks and their context ([`bthread`])
//! - Pure arbitration and selection strategies ([`kernel`])
//! - The round loop ([`scheduler`]) driven through a [`program::Program`]
//! - Observation bus ([`event_bus`]), diagnostics ([`report`]) and
//!   configuration ([`config`])
//!
//! ## Round
//!
//! ```text
//! CollectDeclarations → Arbitrate → Deliver → ResumeMatched → repeat
//! ```
//!
//! Only one behavior segment runs at a time: matched b-threads are resumed in
//! registration order, each until it suspends again or finishes.

pub mod bthread;
pub mod config;
pub mod declaration;
pub mod error;
pub mod event;
pub mod event_bus;
pub mod kernel;
pub mod program;
pub mod report;
pub mod scheduler;

// Re-exports
pub use bthread::{
    BThreadContext, BehaviorError, BehaviorOptions, BehaviorResult, SyncError, ThreadId,
};
pub use declaration::Declaration;
pub use error::*;
pub use event::{Event, EventSet, Value};
pub use program::{Program, ProgramHandle};
pub use scheduler::{RunSummary, Termination, ThreadStatus};

#[cfg(test)]
mod tests {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    #[ctor::ctor]
    fn init_tests() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .expect("Failed to set tracing subscriber");
    }
}
