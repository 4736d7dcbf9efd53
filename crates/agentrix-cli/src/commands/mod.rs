//! Subcommand implementations

pub mod audit;
pub mod demo;
pub mod preview;
