use thiserror::Error;

use crate::bthread::{BehaviorError, SyncError};
use crate::config::ConfigError;
use crate::declaration::DeclarationError;
use crate::event_bus::EventError;
use crate::kernel::KernelError;
use crate::program::RegistrationError;
use crate::scheduler::SchedulerError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),
    // declarations and b-thread bodies
    #[error("Declaration error: {0}")]
    Declaration(#[from] DeclarationError),
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
    #[error("Behavior error: {0}")]
    Behavior(#[from] BehaviorError),
    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),
    // observation bus
    #[error("Event error: {0}")]
    Event(#[from] EventError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

pub type InternalResult<T> = Result<T, Error>;
