//! skynetd: the Skynet control plane daemon and operator CLI.
//!
//! `skynetd run` assembles every subsystem in one process:
//! - State store (redb)
//! - Scheduler loops (claim, place, dispatch)
//! - Reaper (stale claim recovery)
//! - Health monitor (gateway and worker registry)
//!
//! The remaining subcommands operate on the same store file and print JSON.

pub mod commands;
pub mod daemon;
pub mod logging;
