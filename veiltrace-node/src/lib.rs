//! Library surface for the `veiltrace-node` binary.
//!
//! Config loading, journal parsing and the replay service live here so tests
//! and other tools can drive a registry the same way the CLI does.

pub mod config;
pub mod journal;
pub mod service;
pub mod sink;
