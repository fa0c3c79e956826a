//! Message-to-command dispatch
//!
//! Turns each delivered message into exactly one shell invocation with the
//! topic and payload exposed through the environment. Invocations run in
//! their own tasks so a slow command never delays the next message, and a
//! failing command never reaches back into the connection.

use crate::transport::InboundMessage;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Environment variable carrying the concrete topic of the triggering
/// message.
pub const ENV_TOPIC: &str = "MQTT_TOPIC";

/// Environment variable carrying the raw payload bytes of the triggering
/// message.
pub const ENV_PAYLOAD: &str = "MQTT_PAYLOAD";

/// Depth of the delivery channel between the transport and the dispatcher.
pub const DISPATCH_QUEUE_DEPTH: usize = 64;

/// How one invocation ended. Used only for logging; never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Process exited with this status code.
    Exited(i32),
    /// Process was terminated by this signal.
    Signaled(i32),
}

impl DispatchOutcome {
    pub fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => DispatchOutcome::Exited(code),
            // On Unix an absent code means signal termination
            None => DispatchOutcome::Signaled(status.signal().unwrap_or(0)),
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, DispatchOutcome::Exited(0))
    }
}

/// Spawn failure. Logged and absorbed; isolated to the one message.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to spawn command: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Consumes the delivery channel and invokes the configured command per
/// message.
pub struct Dispatcher {
    command: Option<String>,
}

impl Dispatcher {
    pub fn new(command: Option<String>) -> Self {
        Self { command }
    }

    /// Run the dispatch loop until the delivery channel closes. Each message
    /// is handed to its own invocation task; nothing here waits for a
    /// command to finish.
    pub fn run(self, mut rx: mpsc::Receiver<InboundMessage>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                self.handle(message);
            }
            debug!("delivery channel closed, dispatch loop stopped");
        })
    }

    /// Dispatch one message: fire-and-forget when a command is configured,
    /// log-only otherwise.
    pub fn handle(&self, message: InboundMessage) {
        match &self.command {
            None => {
                info!(topic = %message.topic, "no command configured, message logged only");
            }
            Some(command) => {
                debug!(topic = %message.topic, command = %command, "dispatching command");
                let command = command.clone();
                tokio::spawn(async move {
                    match invoke(&command, message).await {
                        Ok(outcome) if outcome.success() => {
                            debug!(command = %command, "command completed");
                        }
                        Ok(DispatchOutcome::Exited(code)) => {
                            warn!(command = %command, code, "command exited non-zero");
                        }
                        Ok(DispatchOutcome::Signaled(signal)) => {
                            warn!(command = %command, signal, "command terminated by signal");
                        }
                        Err(e) => {
                            error!(command = %command, error = %e, "command invocation failed");
                        }
                    }
                });
            }
        }
    }
}

/// Invoke the command through the shell with the message layered onto the
/// inherited environment.
///
/// The command string passes through unmodified; its content is the
/// operator's responsibility. The payload is injected byte-for-byte (a
/// payload containing NUL cannot cross the environment and surfaces as a
/// spawn error).
async fn invoke(command: &str, message: InboundMessage) -> Result<DispatchOutcome, DispatchError> {
    let status = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .env(ENV_TOPIC, &message.topic)
        .env(ENV_PAYLOAD, OsStr::from_bytes(&message.payload))
        .status()
        .await?;

    Ok(DispatchOutcome::from_status(status))
}
