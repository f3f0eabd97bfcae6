//! # clicksync: console agent for ClickSync
//!
//! Runs one side of a ClickSync pairing from the terminal. A controller
//! finds a follower on the LAN and sends slide commands typed on stdin; a
//! follower listens for one controller and reports the commands it would
//! execute.
//!
//! Configuration comes from a TOML file (see [`config::ClickSyncConfig`])
//! with command-line overrides.

pub mod agent;
pub mod config;
