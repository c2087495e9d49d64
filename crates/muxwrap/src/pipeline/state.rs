use std::fmt;

/// Lifecycle of one pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PipelineState {
    #[default]
    NotStarted,
    /// Fetch stage spawned, mux stage not yet.
    FetchRunning,
    BothRunning,
    /// Fetch stage has exited; the mux stage is flushing what is left.
    Draining,
    Terminated,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotStarted => "not started",
            Self::FetchRunning => "fetch running",
            Self::BothRunning => "both running",
            Self::Draining => "draining",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        })
    }
}
