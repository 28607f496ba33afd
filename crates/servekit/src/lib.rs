//! Launcher and companion tools for an OpenAI-compatible model server.
//!
//! - `env`, `serve`, `launch`: prepare the child environment, build the
//!   `serve` argument vector, start the server binary, propagate its exit code.
//! - `rollout`: drive the running server with a batch of conversations.
//! - `schedule`: greedy LPT estimate of batch makespan over replicas × threads.
//! - `dataset`: reproducible JSONL subsets used as rollout inputs.
//!
//! API Policy
//! - This crate is project-internal. There is no stable public API.

pub mod dataset;
pub mod env;
pub mod launch;
pub mod rollout;
pub mod schedule;
pub mod serve;

/// Library version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use env::EnvSet;
pub use launch::{LaunchError, LaunchPlan};
pub use serve::{ConfigError, ServeConfig};

/// Common exports for the CLI and tests.
pub mod prelude {
    pub use crate::dataset::{read_jsonl, sample, write_jsonl, DatasetError};
    pub use crate::env::EnvSet;
    pub use crate::launch::{LaunchError, LaunchPlan};
    pub use crate::rollout::{
        conversations_from_records, write_records, ChatMessage, RolloutClient, RolloutConfig,
        RolloutError, RolloutRecord,
    };
    pub use crate::schedule::{LptScheduler, Schedule, ScheduleError, Summary};
    pub use crate::serve::{ConfigError, ServeConfig};
}
