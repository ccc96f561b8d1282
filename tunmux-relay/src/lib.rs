//! # tunmux-relay
//!
//! A harness that carries one tunnel over a TCP peer link, bound either to
//! this process's stdio or to a spawned child process.

pub mod config;
pub mod relay;
