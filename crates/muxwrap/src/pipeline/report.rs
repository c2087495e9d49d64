use std::fmt;
use std::process::ExitStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Fetch,
    Mux,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fetch => "fetch",
            Self::Mux => "mux",
        })
    }
}

/// How one stage ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageExit {
    pub stage: StageKind,
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// The stage was stopped by the pipeline itself.
    pub terminated: bool,
    pub stderr_tail: Vec<String>,
}

impl StageExit {
    pub(crate) fn from_status(stage: StageKind, status: Option<ExitStatus>, terminated: bool) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.and_then(|s| s.signal())
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            stage,
            code: status.and_then(|s| s.code()),
            signal,
            terminated,
            stderr_tail: Vec::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// A non-zero exit the pipeline did not cause.
    pub fn failed(&self) -> bool {
        !self.terminated && !self.success()
    }
}

impl fmt::Display for StageExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "{} stage exited with code {code}", self.stage)?,
            (None, Some(signal)) => write!(f, "{} stage killed by signal {signal}", self.stage)?,
            (None, None) => write!(f, "{} stage exit status unknown", self.stage)?,
        }
        if self.terminated {
            f.write_str(" (terminated)")?;
        }
        Ok(())
    }
}

/// Both stages' exits for a failed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    pub fetch: StageExit,
    pub mux: StageExit,
}

impl FailureReport {
    pub fn failed_stages(&self) -> impl Iterator<Item = &StageExit> {
        [&self.fetch, &self.mux].into_iter().filter(|s| s.failed())
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}; {}", self.fetch, self.mux)?;
        for stage in self.failed_stages() {
            if let Some(last) = stage.stderr_tail.last() {
                write!(f, "; {} stderr: {last}", stage.stage)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to start {stage} stage: {source}")]
    Spawn {
        stage: StageKind,
        #[source]
        source: std::io::Error,
    },

    #[error("pipeline failed after {bytes_written} bytes: {report}")]
    StageFailed {
        report: Box<FailureReport>,
        bytes_written: u64,
    },

    #[error("output error after {bytes_written} bytes: {source}")]
    Output {
        #[source]
        source: std::io::Error,
        bytes_written: u64,
    },
}

impl PipelineError {
    pub fn bytes_written(&self) -> u64 {
        match self {
            Self::Spawn { .. } => 0,
            Self::StageFailed { bytes_written, .. } | Self::Output { bytes_written, .. } => {
                *bytes_written
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exit(stage: StageKind, code: Option<i32>, terminated: bool) -> StageExit {
        StageExit {
            stage,
            code,
            signal: None,
            terminated,
            stderr_tail: vec!["last words".to_string()],
        }
    }

    #[test]
    fn test_failed_ignores_own_termination() {
        assert!(exit(StageKind::Fetch, Some(1), false).failed());
        assert!(!exit(StageKind::Fetch, None, true).failed());
        assert!(!exit(StageKind::Mux, Some(0), false).failed());
    }

    #[test]
    fn test_report_display() {
        let report = FailureReport {
            fetch: exit(StageKind::Fetch, Some(1), false),
            mux: exit(StageKind::Mux, Some(0), false),
        };
        assert_eq!(
            report.to_string(),
            "fetch stage exited with code 1; mux stage exited with code 0; fetch stderr: last words"
        );
        assert_eq!(report.failed_stages().count(), 1);
    }
}
