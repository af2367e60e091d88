//! Remote command dispatch
//!
//! Turns job requests from the bus into remote PowerShell invocations, one per
//! target host, and publishes receipts, parsed results and errors to the
//! service's publish routes.
//!
//! ## Components
//!
//! - **Event**: the supported command set and what each command reports
//! - **Schema**: declarative parameter tables and the generic validator
//! - **Job**: inbound request decoding and outbound message shapes
//! - **Parser**: `Name : value` extraction from command output
//! - **Runner**: the remote command seam and its PowerShell implementation
//! - **Handler**: the dispatch orchestrator
//! - **Lifecycle**: signal handling and ordered shutdown

pub mod error;
pub mod event;
pub mod handler;
pub mod job;
pub mod lifecycle;
pub mod parser;
pub mod runner;
pub mod schema;

pub use error::{DispatchError, Result};
pub use event::Event;
pub use handler::DispatchHandler;
pub use job::{ErrorNotification, JobRequest, PreferenceReport, ReceiptAck};
pub use lifecycle::{shutdown_signal, ShutdownCoordinator};
pub use parser::{parse, PreferenceRecord};
pub use runner::{CommandOutput, CommandRunner, PwshRunner};
pub use schema::CommandArg;
