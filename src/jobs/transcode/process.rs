use std::{io, process::Stdio};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
};
use tracing::{debug, info, warn};

use crate::{jobs::transcode::ProgressSample, services::cancel::CancellationController};

use super::ProgressParser;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// How an encoder invocation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ProcessOutcome {
    Exited(i32),
    /// Ended by a signal, no exit code
    Terminated,
    /// Could not be spawned, or its exit could not be collected
    StartFailure(String),
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

/// Emitted while the encoder runs, in the order its diagnostic lines were written.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    RawLine(String),
    Progress(ProgressSample),
}

/// Runs one encoder process to completion.
#[async_trait]
pub trait Supervise: Send + Sync {
    async fn run(
        &self,
        argv: &[String],
        cancel: &CancellationController,
        on_event: &mut (dyn FnMut(SupervisorEvent) + Send),
    ) -> ProcessOutcome;
}

/// Spawns the encoder directly (no shell), streams its stderr through a
/// [`ProgressParser`] and registers it with the [`CancellationController`] while alive.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessSupervisor;

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self
    }

    /// Interrupt whatever is running under `cancel` and kill it after `escalate_after`.
    pub fn terminate(cancel: &CancellationController, escalate_after: std::time::Duration) -> bool {
        cancel.terminate(escalate_after)
    }
}

#[async_trait]
impl Supervise for ProcessSupervisor {
    async fn run(
        &self,
        argv: &[String],
        cancel: &CancellationController,
        on_event: &mut (dyn FnMut(SupervisorEvent) + Send),
    ) -> ProcessOutcome {
        let Some((program, args)) = argv.split_first() else {
            return ProcessOutcome::StartFailure("empty argument vector".into());
        };

        let mut ff = Command::new(program);
        ff.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(windows)]
        ff.creation_flags(CREATE_NO_WINDOW);

        debug!("spawning {}", argv.join(" "));
        let mut child = match ff.spawn() {
            Ok(child) => child,
            Err(err) => return ProcessOutcome::StartFailure(format!("{}: {}", program, err)),
        };

        let ticket = cancel.set(child.id());

        let Some(stderr) = child.stderr.take() else {
            let _ = child.start_kill();
            let _ = child.wait().await;
            cancel.clear(ticket.generation);
            return ProcessOutcome::StartFailure("could not capture encoder stderr".into());
        };

        // a stop requested between the runner's check and registration above
        if cancel.is_requested() {
            cancel.terminate(cancel.grace());
        }

        let mut lines = DiagnosticLines::new(stderr);
        let mut parser = ProgressParser::new();
        let mut forwarding = true;
        let mut killed = false;

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if !forwarding {
                            continue;
                        }
                        let sample = parser.feed(&line);
                        on_event(SupervisorEvent::RawLine(line));
                        if let Some(sample) = sample {
                            on_event(SupervisorEvent::Progress(sample));
                        }
                        if cancel.is_requested() {
                            debug!("cancellation observed, no longer forwarding encoder output");
                            forwarding = false;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!("error reading encoder output: {}", err);
                        break;
                    }
                },
                _ = ticket.kill.notified() => {
                    warn!("force killing encoder");
                    let _ = child.start_kill();
                    killed = true;
                    // don't wait for EOF, a grandchild may still hold the pipe
                    break;
                }
            }
        }

        let status = loop {
            tokio::select! {
                status = child.wait() => {
                    // the pid may be reused from here on
                    cancel.clear(ticket.generation);
                    break status;
                }
                _ = ticket.kill.notified(), if !killed => {
                    warn!("force killing encoder");
                    let _ = child.start_kill();
                    killed = true;
                }
            }
        };

        match status {
            Ok(status) => {
                info!("encoder exited - status: {:?}", status.code());
                match status.code() {
                    Some(code) => ProcessOutcome::Exited(code),
                    None => ProcessOutcome::Terminated,
                }
            }
            Err(err) => ProcessOutcome::StartFailure(format!("could not wait for encoder: {}", err)),
        }
    }
}

/// Longest line handed out in one piece. Longer runs without a terminator are split.
pub const MAX_LINE: usize = 64 * 1024;

/// Splits a byte stream into lines on `\n`, `\r` or `\r\n`. ffmpeg ends its periodic
/// status line with a bare carriage return. Empty lines are skipped.
pub struct DiagnosticLines<R> {
    reader: BufReader<R>,
    line: Vec<u8>,
}

impl<R: AsyncRead + Unpin> DiagnosticLines<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: Vec::new(),
        }
    }

    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if self.line.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.take_line()));
            }

            let terminator = available.iter().position(|b| *b == b'\n' || *b == b'\r');
            let end = terminator.unwrap_or(available.len());
            let take = end.min(MAX_LINE - self.line.len());
            self.line.extend_from_slice(&available[..take]);

            let complete = terminator.is_some() && take == end;
            self.reader.consume(if complete { take + 1 } else { take });

            if complete {
                if self.line.is_empty() {
                    continue;
                }
                return Ok(Some(self.take_line()));
            }
            if self.line.len() >= MAX_LINE {
                return Ok(Some(self.take_line()));
            }
        }
    }

    fn take_line(&mut self) -> String {
        let line = std::mem::take(&mut self.line);
        String::from_utf8_lossy(&line).into_owned()
    }
}
