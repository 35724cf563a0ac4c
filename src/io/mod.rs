//! I/O layer - child process supervision and pre-handshake output capture
//!
//! - **process**: spawn, track, terminate and reap MCP server processes
//! - **controller**: platform strategy for process groups and signals
//! - **capture**: output a server prints before it speaks the protocol

pub mod capture;
pub mod controller;
pub mod process;

pub use capture::{CapturedOutput, EarlyOutput};
pub use controller::{ProcessController, ProcessGroup, default_controller};
pub use process::{
    CommandSpec, ExitRecord, ProcessError, ProcessHandle, ProcessId, ProcessState,
    ProcessSupervisor, SpawnedProcess, TerminationOutcome,
};
