//! Orchestrates git-tfs against a TFS workspace.
//!
//! git-tfs refuses to work in a directory that is also mapped in a TFS
//! workspace, so every bridge operation temporarily removes the mapping and
//! restores it afterwards. Progress and state are published on an
//! [`events::EventBus`] for whatever front end is attached.

pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod git;
pub mod git_ops;
pub mod gittfs;
pub mod mapping;
pub mod refresh;
pub mod retry;
pub mod session;
pub mod shelveset;
pub mod task;
pub mod tfs;
pub mod watcher;

#[cfg(test)]
mod testing;

pub use error::{BridgeError, Result};
