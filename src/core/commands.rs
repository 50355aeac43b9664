use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::io::{self, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::core::error::{MonitorError, Result};

/// Caller-chosen identifier pairing a request with its result
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationToken(String);

impl CorrelationToken {
    /// A random token
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for CorrelationToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CorrelationToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An external command to run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub argv: Vec<String>,
    pub correlation_token: CorrelationToken,
}

impl CommandRequest {
    pub fn new<I, S>(argv: I, correlation_token: impl Into<CorrelationToken>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            correlation_token: correlation_token.into(),
        }
    }

    /// Request with a random token
    pub fn with_argv<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(argv, CorrelationToken::new())
    }

    /// Split a command line on whitespace, e.g. "pkcs15-tool --list-data-objects"
    pub fn from_command_line(line: &str) -> Self {
        Self::with_argv(line.split_whitespace())
    }

    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }
}

/// Result of one external command, delivered exactly once
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub timestamp: DateTime<Utc>,
    pub correlation_token: CorrelationToken,
    /// Combined stdout and stderr, or a diagnostic when the command could not run
    pub exit_output: String,
    pub succeeded: bool,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

/// Runs external commands on worker threads
///
/// Clones share the registry of in-flight correlation tokens and nothing else.
#[derive(Clone, Default)]
pub struct CommandExecutor {
    in_flight: Arc<Mutex<HashSet<CorrelationToken>>>,
}

/// Removes a token from the in-flight registry when dropped
struct InFlight {
    registry: Arc<Mutex<HashSet<CorrelationToken>>>,
    token: CorrelationToken,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.token);
    }
}

/// A command that has been accepted by the executor
pub struct PendingCommand {
    correlation_token: CorrelationToken,
    thread: Option<JoinHandle<()>>,
}

impl PendingCommand {
    pub fn correlation_token(&self) -> &CorrelationToken {
        &self.correlation_token
    }

    /// Block until the worker has delivered the result
    pub fn wait(self) {
        if let Some(thread) = self.thread {
            if thread.join().is_err() {
                log::error!("Completion callback for {} panicked", self.correlation_token);
            }
        }
    }
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of commands still running
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Run `request` on a worker thread and hand its result to `on_complete`
    ///
    /// Returns immediately. Once accepted, `on_complete` runs exactly once,
    /// after the process has exited and its output has been drained.
    pub fn execute<F>(&self, request: CommandRequest, on_complete: F) -> Result<PendingCommand>
    where
        F: FnOnce(CommandResult) + Send + 'static,
    {
        if request.argv.first().map_or(true, |program| program.is_empty()) {
            return Err(MonitorError::InvalidCommand(
                "command line is empty".to_string(),
            ));
        }

        let token = request.correlation_token.clone();
        if !self.in_flight.lock().insert(token.clone()) {
            return Err(MonitorError::DuplicateToken(token.to_string()));
        }
        let guard = InFlight {
            registry: Arc::clone(&self.in_flight),
            token: token.clone(),
        };

        log::info!("Running command [{token}]: {}", request.argv.join(" "));

        // Shared so the callback survives a failed thread spawn
        let callback = Arc::new(Mutex::new(Some(on_complete)));
        let worker_callback = Arc::clone(&callback);
        let worker_request = request.clone();

        let spawned = thread::Builder::new()
            .name(format!("command-{token}"))
            .spawn(move || {
                let result = run_request(&worker_request);
                drop(guard);
                if let Some(on_complete) = worker_callback.lock().take() {
                    on_complete(result);
                }
            });

        match spawned {
            Ok(thread) => Ok(PendingCommand {
                correlation_token: token,
                thread: Some(thread),
            }),
            Err(e) => {
                log::error!("Failed to start worker for [{token}]: {e}");
                let result = failed_result(
                    &request.correlation_token,
                    format!("Failed to start worker thread: {e}"),
                    Instant::now(),
                );
                if let Some(on_complete) = callback.lock().take() {
                    on_complete(result);
                }
                Ok(PendingCommand {
                    correlation_token: token,
                    thread: None,
                })
            }
        }
    }
}

fn run_request(request: &CommandRequest) -> CommandResult {
    let start_time = Instant::now();
    let timestamp = Utc::now();

    match run_process(&request.argv) {
        Ok((output, status)) => {
            let duration = start_time.elapsed();
            let exit_output = String::from_utf8_lossy(&output).into_owned();
            log::info!(
                "Command [{}] exited with {status} ({}ms)",
                request.correlation_token,
                duration.as_millis()
            );

            CommandResult {
                timestamp,
                correlation_token: request.correlation_token.clone(),
                exit_output,
                succeeded: status.success(),
                exit_code: status.code(),
                duration_ms: duration.as_millis() as u64,
            }
        }
        Err(e) => {
            let error = MonitorError::CommandIoError(format!(
                "Failed to run '{}': {e}",
                request.argv[0]
            ));
            log::error!("Command [{}]: {error}", request.correlation_token);
            failed_result(&request.correlation_token, error.to_string(), start_time)
        }
    }
}

fn failed_result(token: &CorrelationToken, diagnostic: String, start_time: Instant) -> CommandResult {
    CommandResult {
        timestamp: Utc::now(),
        correlation_token: token.clone(),
        exit_output: diagnostic,
        succeeded: false,
        exit_code: None,
        duration_ms: start_time.elapsed().as_millis() as u64,
    }
}

/// Spawn `argv` with stderr merged into stdout and read until EOF
fn run_process(argv: &[String]) -> io::Result<(Vec<u8>, ExitStatus)> {
    let (mut reader, writer) = io::pipe()?;

    let mut child = {
        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(writer.try_clone()?)
            .stderr(writer);
        // Both write ends live in `command`; it must be gone before reading to EOF
        command.spawn()?
    };

    let mut output = Vec::new();
    let read = reader.read_to_end(&mut output);
    let status = child.wait()?;
    read?;

    Ok((output, status))
}
