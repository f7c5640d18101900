#![doc = include_str!("../../../README.md")]

pub mod activity;
pub mod actor;
pub mod config;
pub mod context;
pub mod deployment;
pub mod error;
pub mod experiment;
mod executor;
pub mod handle;
mod kernel;
pub mod logging;
pub mod mailbox;
pub mod resource;
pub mod run_stats;
pub mod simulation;
pub mod sync;
pub mod trace;

pub use activity::{ActivityId, ActivityState};
pub use actor::{ActorBuilder, ActorHandle, ActorId, ActorState};
pub use config::EngineConfig;
pub use context::ActorContext;
pub use deployment::{ActorDeployment, DeploymentConfig, FunctionRegistry};
pub use error::SimError;
pub use handle::{Activity, ActivitySet, Comm, Exec, Io, Mess};
pub use mailbox::{Mailbox, MessageQueue};
pub use resource::{Disk, Host, Link};
pub use run_stats::RunStats;
pub use simulation::Simulation;
pub use sync::{Barrier, ConditionVariable, Mutex, Semaphore};
pub use trace::{JsonLinesSink, Trace, TraceEvent, TraceSink};

pub use dslab_platform as platform;

#[doc(hidden)]
pub use log;
