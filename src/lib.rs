//! cascade - local multi-service development supervisor
//!
//! Starts dependent services in order (auth -> backend -> frontend), defers
//! health checks behind per-service grace periods, and promotes each service
//! into steady-state monitoring only after readiness is explicitly confirmed.

pub mod commands;
pub mod config;
pub mod discovery;
pub mod error;
pub mod health;
pub mod ports;
pub mod probes;
pub mod process;
pub mod sequencer;
