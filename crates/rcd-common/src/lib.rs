//! Shared plumbing for the remote command dispatcher crates.

pub mod logging;
pub mod tasks;

pub use tasks::{TaskReport, TaskSupervisor};
