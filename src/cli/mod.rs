//! CLI module for the taskstack deployment tool.
//!
//! This module provides the command-line interface for planning, applying
//! and inspecting the stack.

mod commands;
mod output;

pub use commands::{BackendKind, Cli, Commands, LogFormat, OutputFormat, StateCommands};
pub use output::OutputFormatter;
