//! External process execution with streamed, classified output.
//!
//! Every line the child writes to stdout or stderr is published on the
//! [`EventBus`] as soon as it arrives, tagged by [`classify_line`]. A non-zero
//! exit is reported as [`CommandOutcome::Failed`] rather than an error so the
//! caller decides whether it is fatal; [`CommandRunner::execute`] is the
//! strict variant used by the bridge workflows.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::SplitStream;
use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, Result};
use crate::events::{EventBus, MessageKind};

/// An executable plus the arguments that always precede the per-call ones.
///
/// git-tfs is a .NET program; off Windows it is usually hosted
/// (`mono /opt/git-tfs/git-tfs.exe`), so the tool is a command line rather
/// than a single path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tool {
    pub program: PathBuf,
    pub leading_args: Vec<String>,
}

impl Tool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Parse a configured command line such as `mono "C:\git tfs\git-tfs.exe"`.
    pub fn parse(command_line: &str) -> Option<Self> {
        let mut words = split_command_line(command_line).into_iter();
        let program = words.next()?;
        Some(Self {
            program: PathBuf::from(program),
            leading_args: words.collect(),
        })
    }

    pub fn command<I, S>(&self, args: I) -> BridgeCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        BridgeCommand::new(&self.program)
            .args(self.leading_args.iter().cloned())
            .args(args)
    }
}

/// One process invocation. Pure value: running it has no hidden state beyond
/// the spawned child.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgeCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// `None` runs in the current process directory.
    pub working_directory: Option<PathBuf>,
}

impl BridgeCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_directory: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Arguments rendered as a single command-line string.
    pub fn arguments_text(&self) -> String {
        self.args
            .iter()
            .map(|a| quote_arg(a))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Full command line, used in logs and in [`BridgeError::CommandFailed`].
    pub fn command_text(&self) -> String {
        let program = quote_arg(&self.program.to_string_lossy());
        if self.args.is_empty() {
            program
        } else {
            format!("{} {}", program, self.arguments_text())
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandOutcome {
    Succeeded,
    Failed { exit_code: Option<i32> },
    /// The cancellation token fired and the child was killed.
    Canceled,
}

/// Classify one output line: `fatal`/`error` win over `warning`.
pub fn classify_line(line: &str) -> MessageKind {
    let lower = line.to_lowercase();
    if lower.contains("fatal") || lower.contains("error") {
        MessageKind::Error
    } else if lower.contains("warning") {
        MessageKind::Warning
    } else {
        MessageKind::Info
    }
}

#[derive(Clone)]
pub struct CommandRunner {
    bus: EventBus,
}

impl CommandRunner {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    /// Run `command` to completion, streaming its output to the bus.
    ///
    /// Returns `Err` only when the process cannot be spawned or awaited.
    pub async fn run(
        &self,
        command: &BridgeCommand,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome> {
        if cancel.is_cancelled() {
            return Ok(CommandOutcome::Canceled);
        }

        let args_text = command.arguments_text();
        self.bus.info(format!(
            "Executing '{}' '{}'...",
            command.program.display(),
            args_text
        ));

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GCM_INTERACTIVE", "never")
            .kill_on_drop(true);
        if let Some(dir) = &command.working_directory {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("child stderr was not captured"))?;

        // Output after a read error is dropped; the exit status still decides.
        let mut lines = SplitStream::new(BufReader::new(stdout).split(b'\n'))
            .merge(SplitStream::new(BufReader::new(stderr).split(b'\n')))
            .map_while(|segment| segment.ok());

        let status = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    self.bus.warning(format!("'{}' has been canceled", args_text));
                    return Ok(CommandOutcome::Canceled);
                }
                Some(segment) = lines.next() => self.publish_line(&segment),
                status = child.wait() => break status?,
            }
        };

        // The child is gone; flush whatever is still buffered in the pipes.
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                segment = lines.next() => match segment {
                    Some(segment) => self.publish_line(&segment),
                    None => break,
                },
            }
        }

        if status.success() {
            self.bus
                .success(format!("'{}' has been executed successfully", args_text));
            Ok(CommandOutcome::Succeeded)
        } else {
            tracing::debug!(command = %command.command_text(), code = ?status.code(), "command failed");
            Ok(CommandOutcome::Failed {
                exit_code: status.code(),
            })
        }
    }

    /// Like [`run`](Self::run) but a non-zero exit is an error.
    pub async fn execute(&self, command: &BridgeCommand, cancel: &CancellationToken) -> Result<()> {
        match self.run(command, cancel).await? {
            CommandOutcome::Succeeded => Ok(()),
            CommandOutcome::Failed { exit_code } => Err(BridgeError::CommandFailed {
                command: command.command_text(),
                exit_code,
            }),
            CommandOutcome::Canceled => Err(BridgeError::Canceled),
        }
    }

    fn publish_line(&self, segment: &[u8]) {
        let line = String::from_utf8_lossy(segment);
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            return;
        }
        self.bus.log(classify_line(line), line);
    }
}

fn quote_arg(arg: &str) -> String {
    if arg.is_empty() {
        return "\"\"".to_string();
    }
    if arg.chars().any(|c| c.is_whitespace() || c == '"') {
        format!("\"{}\"", arg.replace('"', "\\\""))
    } else {
        arg.to_string()
    }
}

/// Whitespace-separated words; double quotes group, `\"` is a literal quote.
fn split_command_line(s: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_word = false;
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
                has_word = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                has_word = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_word {
                    words.push(std::mem::take(&mut current));
                    has_word = false;
                }
            }
            c => {
                current.push(c);
                has_word = true;
            }
        }
    }
    if has_word {
        words.push(current);
    }
    words
}
