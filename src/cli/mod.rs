//! Operator command line

pub mod args;
pub mod commands;
pub mod context;

pub use args::{Cli, Commands};
pub use context::CacheContext;
