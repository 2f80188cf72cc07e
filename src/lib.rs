//! nsbox: a minimal process-isolation launcher
//! Runs a program in fresh Linux namespaces with the terminal's streams and
//! supervises it, once or in a watch loop, until interrupted.

pub mod cancel;
pub mod cli;
pub mod executor;
pub mod namespace;
pub mod report;
pub mod signals;
pub mod supervisor;
pub mod types;

pub use cancel::CancellationToken;
pub use executor::{Launch, Launcher, StreamPolicy};
pub use signals::{InterruptSource, ManualInterrupt, SigintSource};
pub use supervisor::{Supervisor, SupervisorState, SupervisorStats};
pub use types::{
    IsolationKind, IsolationSet, LaunchFailure, LaunchOutcome, LaunchRequest, NsboxError, Result,
    SupervisorConfig, WatchMode,
};
