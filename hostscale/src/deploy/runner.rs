//! Subprocess execution for backend tooling

use std::pin::Pin;
use std::process::Stdio;

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::Command;
use tracing::debug;

use crate::errors::OrchestratorError;

/// Lazily produced log lines; dropping it stops the producer
pub type LogStream = Pin<Box<dyn Stream<Item = Result<String, OrchestratorError>> + Send>>;

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Best diagnostic text for a failure
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Runs backend tooling
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion and capture output
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, OrchestratorError>;

    /// Spawn and stream stdout and stderr lines as they arrive
    async fn stream(&self, program: &str, args: &[String]) -> Result<LogStream, OrchestratorError>;
}

/// Runs commands as real child processes
#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<CommandOutput, OrchestratorError> {
        debug!("Running: {} {}", program, args.join(" "));

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn stream(&self, program: &str, args: &[String]) -> Result<LogStream, OrchestratorError> {
        debug!("Streaming: {} {}", program, args.join(" "));

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OrchestratorError::Internal("child stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| OrchestratorError::Internal("child stderr not captured".to_string()))?;

        let merged = stream::select(
            line_stream(BufReader::new(stdout).lines()),
            line_stream(BufReader::new(stderr).lines()),
        );

        // The child rides along in the stream state: dropping the stream
        // drops the child, which kills it.
        let lines = stream::unfold((merged, child), |(mut merged, child)| async move {
            merged.next().await.map(|line| (line, (merged, child)))
        });

        Ok(Box::pin(lines))
    }
}

fn line_stream<R>(lines: Lines<R>) -> LogStream
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    Box::pin(stream::unfold(Some(lines), |state| async move {
        let mut lines = state?;
        match lines.next_line().await {
            Ok(Some(line)) => Some((Ok(line), Some(lines))),
            Ok(None) => None,
            Err(e) => Some((Err(e.into()), None)),
        }
    }))
}
