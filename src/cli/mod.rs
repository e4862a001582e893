//! Interactive console for a running node

pub mod commands;

pub use commands::{execute, CliResult, Command, CommandError};
