//! # Two-stage process pipeline
//!
//! The fetch stage writes the selected stream to its stdout, which is handed
//! to the mux stage as stdin through an OS pipe. The mux stage's stdout is
//! read in fixed-size chunks and forwarded to the output sink.
//!
//! Shutdown rules:
//!
//! - fetch exits first: the mux stage sees end of input, drains and exits
//! - mux exits first: the fetch stage is terminated
//! - cancellation or a closed sink: fetch is terminated, then mux, each
//!   with SIGTERM followed by a kill after the grace period
//!
//! A non-zero exit of either stage that the pipeline did not cause is
//! reported once, with both exit statuses and the tail of each stage's
//! stderr.

mod command;
mod orchestrator;
mod report;
mod state;

pub use command::{FetchCommand, MuxCommand, StageCommand, normalize_key};
pub use orchestrator::{EndReason, Pipeline, PipelineOutcome};
pub use report::{FailureReport, PipelineError, StageExit, StageKind};
pub use state::PipelineState;

/// Both stage invocations. Built once, consumed by one [`Pipeline`] run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSpec {
    pub fetch: StageCommand,
    pub mux: StageCommand,
}
