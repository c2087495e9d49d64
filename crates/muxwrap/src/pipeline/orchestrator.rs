use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::report::{FailureReport, PipelineError, StageExit, StageKind};
use super::{PipelineSpec, PipelineState};
use crate::config::DEFAULT_CHUNK_SIZE;

/// Lines of stderr kept per stage for the failure report.
const STDERR_TAIL: usize = 20;

const STDERR_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Both stages finished and all output was forwarded.
    EndOfStream,
    /// The sink stopped accepting data.
    ConsumerClosed,
    Cancelled,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::EndOfStream => "end of stream",
            Self::ConsumerClosed => "consumer closed",
            Self::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub bytes_written: u64,
    pub end: EndReason,
}

/// Fetch and mux stages joined by an OS pipe, mux output forwarded to a sink.
#[derive(Debug)]
pub struct Pipeline {
    spec: PipelineSpec,
    chunk_size: usize,
    grace_period: Duration,
    state: watch::Sender<PipelineState>,
}

impl Pipeline {
    pub fn new(spec: PipelineSpec) -> Self {
        let (state, _) = watch::channel(PipelineState::NotStarted);
        Self {
            spec,
            chunk_size: DEFAULT_CHUNK_SIZE,
            grace_period: Duration::from_secs(5),
            state,
        }
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn spec(&self) -> &PipelineSpec {
        &self.spec
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    fn set_state(&self, state: PipelineState) {
        debug!(%state, "Pipeline state changed");
        self.state.send_replace(state);
    }

    /// Run both stages to completion, forwarding mux output to `sink`.
    ///
    /// Cancellation and a closed sink end the run successfully. A stage that
    /// exits non-zero on its own, or fails to start, is an error; bytes
    /// already forwarded stay forwarded.
    pub async fn run<W>(
        &self,
        sink: &mut W,
        cancel: CancellationToken,
    ) -> Result<PipelineOutcome, PipelineError>
    where
        W: AsyncWrite + Unpin,
    {
        let (mut fetch, mut mux, mut output) = self.spawn().await?;
        let mut buf = vec![0u8; self.chunk_size];
        let mut bytes_written: u64 = 0;
        let mut output_open = true;

        let end: io::Result<EndReason> = loop {
            if !output_open && fetch.exited && mux.exited {
                break Ok(EndReason::EndOfStream);
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled() => break Ok(EndReason::Cancelled),

                read = output.read(&mut buf), if output_open => match read {
                    Ok(0) => {
                        debug!("Mux output closed");
                        output_open = false;
                    }
                    Ok(n) => {
                        let written = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => None,
                            result = write_chunk(sink, &buf[..n]) => Some(result),
                        };
                        match written {
                            None => break Ok(EndReason::Cancelled),
                            Some(Ok(())) => bytes_written += n as u64,
                            Some(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => {
                                break Ok(EndReason::ConsumerClosed);
                            }
                            Some(Err(e)) => break Err(e),
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to read mux output");
                        output_open = false;
                    }
                },

                status = fetch.child.wait(), if !fetch.exited => {
                    fetch.record(status);
                    if !mux.exited {
                        self.set_state(PipelineState::Draining);
                    }
                }

                status = mux.child.wait(), if !mux.exited => {
                    mux.record(status);
                    if !fetch.exited {
                        debug!("Mux stage exited first, stopping fetch stage");
                        fetch.terminate(self.grace_period).await;
                    }
                }
            }
        };

        let end = match end {
            Ok(end) => end,
            Err(source) => {
                warn!(error = %source, bytes_written, "Writing output failed, stopping pipeline");
                fetch.terminate(self.grace_period).await;
                mux.terminate(self.grace_period).await;
                fetch.finish().await;
                mux.finish().await;
                self.set_state(PipelineState::Failed);
                return Err(PipelineError::Output {
                    source,
                    bytes_written,
                });
            }
        };

        if end != EndReason::EndOfStream {
            info!(reason = %end, bytes_written, "Stopping pipeline");
            fetch.terminate(self.grace_period).await;
            mux.terminate(self.grace_period).await;
        }

        let report = FailureReport {
            fetch: fetch.finish().await,
            mux: mux.finish().await,
        };

        if end == EndReason::EndOfStream && report.failed_stages().next().is_some() {
            self.set_state(PipelineState::Failed);
            return Err(PipelineError::StageFailed {
                report: Box::new(report),
                bytes_written,
            });
        }

        info!(reason = %end, bytes_written, "Pipeline finished");
        self.set_state(PipelineState::Terminated);
        Ok(PipelineOutcome { bytes_written, end })
    }

    async fn spawn(&self) -> Result<(Stage, Stage, ChildStdout), PipelineError> {
        info!(program = %self.spec.fetch.program.display(), "Starting fetch stage");
        debug!(command = ?self.spec.fetch, "Fetch stage command");

        let mut command = self.spec.fetch.to_command();
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = command.spawn().map_err(|source| {
            self.set_state(PipelineState::Failed);
            PipelineError::Spawn {
                stage: StageKind::Fetch,
                source,
            }
        })?;
        let mut fetch = Stage::new(StageKind::Fetch, child);
        self.set_state(PipelineState::FetchRunning);

        let handoff: io::Result<Stdio> = fetch
            .child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("fetch stdout was not captured"))
            .and_then(TryInto::try_into);

        info!(program = %self.spec.mux.program.display(), "Starting mux stage");
        debug!(command = ?self.spec.mux, "Mux stage command");

        let spawned = handoff.and_then(|stdin| {
            let mut command = self.spec.mux.to_command();
            command
                .stdin(stdin)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            let mut child = command.spawn()?;
            let output = child
                .stdout
                .take()
                .ok_or_else(|| io::Error::other("mux stdout was not captured"))?;
            Ok((child, output))
        });

        match spawned {
            Ok((child, output)) => {
                self.set_state(PipelineState::BothRunning);
                Ok((fetch, Stage::new(StageKind::Mux, child), output))
            }
            Err(source) => {
                fetch.terminate(self.grace_period).await;
                fetch.finish().await;
                self.set_state(PipelineState::Failed);
                Err(PipelineError::Spawn {
                    stage: StageKind::Mux,
                    source,
                })
            }
        }
    }
}

async fn write_chunk<W: AsyncWrite + Unpin>(sink: &mut W, chunk: &[u8]) -> io::Result<()> {
    sink.write_all(chunk).await?;
    sink.flush().await
}

/// One running stage and what is known about its exit.
struct Stage {
    kind: StageKind,
    child: Child,
    status: Option<ExitStatus>,
    exited: bool,
    terminated: bool,
    stderr: JoinHandle<Vec<String>>,
}

impl Stage {
    fn new(kind: StageKind, mut child: Child) -> Self {
        let stderr = collect_stderr(kind, child.stderr.take());
        Self {
            kind,
            child,
            status: None,
            exited: false,
            terminated: false,
            stderr,
        }
    }

    fn record(&mut self, status: io::Result<ExitStatus>) {
        self.exited = true;
        match status {
            Ok(status) => {
                debug!(stage = %self.kind, %status, "Stage exited");
                self.status = Some(status);
            }
            Err(e) => warn!(stage = %self.kind, error = %e, "Failed to wait for stage"),
        }
    }

    /// SIGTERM, then kill once the grace period runs out.
    async fn terminate(&mut self, grace: Duration) {
        if self.exited {
            return;
        }
        if let Ok(Some(status)) = self.child.try_wait() {
            self.record(Ok(status));
            return;
        }

        self.terminated = true;
        debug!(stage = %self.kind, "Terminating stage");
        request_stop(&mut self.child);

        let status = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(stage = %self.kind, grace = ?grace, "Stage did not exit in time, killing");
                if let Err(e) = self.child.start_kill() {
                    debug!(stage = %self.kind, error = %e, "Kill failed");
                }
                self.child.wait().await
            }
        };
        self.record(status);
    }

    async fn finish(self) -> StageExit {
        let mut exit = StageExit::from_status(self.kind, self.status, self.terminated);
        exit.stderr_tail = join_tail(self.stderr).await;
        if exit.failed() {
            warn!(stage = %self.kind, "{exit}");
        }
        exit
    }
}

#[cfg(unix)]
fn request_stop(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        debug!(pid, error = %e, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn request_stop(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Kill failed");
    }
}

fn collect_stderr<R>(stage: StageKind, stderr: Option<R>) -> JoinHandle<Vec<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(stderr) = stderr else {
            return Vec::new();
        };
        let mut tail = VecDeque::with_capacity(STDERR_TAIL);
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(%stage, "{line}");
            if tail.len() == STDERR_TAIL {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail.into()
    })
}

async fn join_tail(handle: JoinHandle<Vec<String>>) -> Vec<String> {
    let abort = handle.abort_handle();
    match tokio::time::timeout(STDERR_JOIN_TIMEOUT, handle).await {
        Ok(Ok(tail)) => tail,
        Ok(Err(_)) => Vec::new(),
        Err(_) => {
            // A grandchild may still hold the pipe open.
            abort.abort();
            Vec::new()
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::pipeline::StageCommand;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    fn sh(script: &str) -> StageCommand {
        StageCommand::new("sh").arg("-c").arg(script)
    }

    fn pipeline(fetch: &str, mux: &str) -> Pipeline {
        Pipeline::new(PipelineSpec {
            fetch: sh(fetch),
            mux: sh(mux),
        })
        .with_grace_period(Duration::from_millis(500))
    }

    struct ClosedSink;

    impl AsyncWrite for ClosedSink {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_end_of_stream() {
        let pipeline = pipeline("printf hello", "cat");
        let states = pipeline.subscribe();
        let mut sink = Vec::new();

        let outcome = pipeline
            .run(&mut sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sink, b"hello");
        assert_eq!(outcome.bytes_written, 5);
        assert_eq!(outcome.end, EndReason::EndOfStream);
        assert_eq!(*states.borrow(), PipelineState::Terminated);
    }

    #[tokio::test]
    async fn test_output_is_chunked_in_order() {
        let pipeline = pipeline("seq 1 2000", "cat").with_chunk_size(188);
        let mut sink = Vec::new();
        pipeline
            .run(&mut sink, CancellationToken::new())
            .await
            .unwrap();

        let text = String::from_utf8(sink).unwrap();
        let numbers: Vec<u32> = text.lines().map(|l| l.parse().unwrap()).collect();
        assert_eq!(numbers, (1..=2000).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_fetch_killed_mid_stream() {
        let pipeline = pipeline("printf abc; echo 'segment fetch failed' >&2; kill -9 $$", "cat");
        let mut sink = Vec::new();

        let err = pipeline
            .run(&mut sink, CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(sink, b"abc");
        assert_eq!(pipeline.state(), PipelineState::Failed);
        match err {
            PipelineError::StageFailed {
                report,
                bytes_written,
            } => {
                assert_eq!(bytes_written, 3);
                assert!(report.fetch.failed());
                assert_eq!(report.fetch.signal, Some(9));
                assert_eq!(report.fetch.stderr_tail, ["segment fetch failed"]);
                assert!(report.mux.success());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_mux_exits_first() {
        let pipeline = pipeline("sleep 30", "echo 'bad input' >&2; exit 3");
        let mut sink = Vec::new();

        let started = std::time::Instant::now();
        let err = pipeline
            .run(&mut sink, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));

        match err {
            PipelineError::StageFailed { report, .. } => {
                assert_eq!(report.mux.code, Some(3));
                assert!(report.mux.failed());
                assert!(report.fetch.terminated);
                assert!(!report.fetch.failed());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_is_not_an_error() {
        let pipeline = pipeline("yes", "cat");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let mut sink = tokio::io::sink();
        let outcome = pipeline.run(&mut sink, cancel).await.unwrap();
        assert_eq!(outcome.end, EndReason::Cancelled);
        assert!(outcome.bytes_written > 0);
        assert_eq!(pipeline.state(), PipelineState::Terminated);
    }

    #[tokio::test]
    async fn test_consumer_closed() {
        let pipeline = pipeline("yes", "cat");
        let outcome = pipeline
            .run(&mut ClosedSink, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.end, EndReason::ConsumerClosed);
        assert_eq!(outcome.bytes_written, 0);
    }

    #[tokio::test]
    async fn test_spawn_failures() {
        let missing_fetch = Pipeline::new(PipelineSpec {
            fetch: StageCommand::new("/nonexistent/fetch-tool"),
            mux: sh("cat"),
        });
        assert!(matches!(
            missing_fetch
                .run(&mut Vec::new(), CancellationToken::new())
                .await,
            Err(PipelineError::Spawn {
                stage: StageKind::Fetch,
                ..
            })
        ));
        assert_eq!(missing_fetch.state(), PipelineState::Failed);

        let missing_mux = Pipeline::new(PipelineSpec {
            fetch: sh("sleep 30"),
            mux: StageCommand::new("/nonexistent/mux-tool"),
        })
        .with_grace_period(Duration::from_millis(500));
        assert!(matches!(
            missing_mux.run(&mut Vec::new(), CancellationToken::new()).await,
            Err(PipelineError::Spawn {
                stage: StageKind::Mux,
                ..
            })
        ));
    }
}
