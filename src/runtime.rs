//! Runtime glue that wires configs, jobs, fatal error capture, telemetry, and
//! runner orchestration.

pub mod config;
pub mod fatal;
pub mod job;
pub mod runner;
pub mod telemetry;
