//! ralph: a supervised iteration loop that drives coding agents through a
//! `prd.json` story checklist, one fresh agent invocation per iteration.

pub mod agent;
pub mod branch;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod control;
pub mod display;
pub mod events;
pub mod failover;
pub mod interactive;
pub mod invoker;
pub mod job;
pub mod log;
pub mod paths;
pub mod process;
pub mod progress;
pub mod prompt;
pub mod registry;
pub mod scheduler;
pub mod shell_completion;
pub mod task;
