//! Remote command execution over a lazily-established session
//!
//! `RemoteCommandClient` keeps at most one session per host. Every
//! `execute` checks the session first: no session or a dead transport means
//! connect, then run. Failures come back as a failed `CommandOutput`, never as
//! an error or a panic, so the poll loop keeps going and the next call
//! reconnects.

mod ssh;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gpustat_core::ServerTarget;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn, Span};

pub use ssh::{SshConnector, SshSession};

/// stderr reported when no session could be established
pub const CONNECT_FAILED: &str = "Unable to connect to server";

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Could not resolve address {0}")]
    Resolve(String),
    #[error("Public key authentication rejected for user {0}")]
    AuthRejected(String),
}

/// Result of one remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// What a live session hands back for a finished command
#[derive(Debug, Clone, Default)]
pub struct ExitOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Opens sessions to one host. Runs on the blocking pool.
pub trait Connector: Send + Sync + 'static {
    type Session: ShellSession;

    fn connect(&self) -> Result<Self::Session, RemoteError>;

    /// `user@host:port`, for logs
    fn describe(&self) -> String;
}

/// A live, authenticated session. All calls block.
pub trait ShellSession: Send + 'static {
    /// Whether the underlying transport still answers
    fn is_alive(&self) -> bool;

    fn exec(&mut self, command: &str) -> Result<ExitOutput, RemoteError>;

    fn close(&mut self);
}

/// Runs commands on one remote host. The collector loop only sees this.
#[async_trait]
pub trait CommandRunner: Send {
    async fn execute(&mut self, command: &str) -> CommandOutput;

    async fn disconnect(&mut self);
}

pub struct RemoteCommandClient<C: Connector = SshConnector> {
    connector: Arc<C>,
    session: Option<C::Session>,
}

impl RemoteCommandClient<SshConnector> {
    pub fn new(target: &ServerTarget, connect_timeout: Duration) -> Self {
        Self::with_connector(SshConnector::new(target, connect_timeout))
    }
}

impl<C: Connector> RemoteCommandClient<C> {
    pub fn with_connector(connector: C) -> Self {
        Self {
            connector: Arc::new(connector),
            session: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Open a fresh session, replacing any existing one.
    /// On failure the client is left unconnected.
    #[instrument(skip(self), fields(remote = %self.connector.describe()))]
    pub async fn connect(&mut self) -> bool {
        let connector = Arc::clone(&self.connector);
        let stale = self.session.take();
        let span = Span::current();

        let task = tokio::task::spawn_blocking(move || {
            span.in_scope(|| {
                if let Some(mut stale) = stale {
                    stale.close();
                }
                open_session(connector.as_ref())
            })
        });

        match task.await {
            Ok(session) => {
                self.session = session;
                self.session.is_some()
            }
            Err(e) => {
                error!("Connect task failed: {}", e);
                false
            }
        }
    }

    /// Run `command`, connecting first when there is no live session
    #[instrument(skip(self), fields(remote = %self.connector.describe()))]
    pub async fn execute(&mut self, command: &str) -> CommandOutput {
        let connector = Arc::clone(&self.connector);
        let session = self.session.take();
        let command = command.to_string();
        let span = Span::current();

        let task = tokio::task::spawn_blocking(move || {
            span.in_scope(|| run_command(connector.as_ref(), session, &command))
        });

        match task.await {
            Ok((session, output)) => {
                self.session = session;
                output
            }
            Err(e) => {
                error!("Command task failed: {}", e);
                CommandOutput::failed(format!("command task failed: {}", e))
            }
        }
    }

    /// Close the session if one is open. Safe to call repeatedly.
    pub async fn disconnect(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let remote = self.connector.describe();

        let closed = tokio::task::spawn_blocking(move || session.close()).await;
        match closed {
            Ok(()) => info!("Disconnected from {}", remote),
            Err(e) => warn!("Disconnect from {} did not complete: {}", remote, e),
        }
    }
}

#[async_trait]
impl<C: Connector> CommandRunner for RemoteCommandClient<C> {
    async fn execute(&mut self, command: &str) -> CommandOutput {
        RemoteCommandClient::execute(self, command).await
    }

    async fn disconnect(&mut self) {
        RemoteCommandClient::disconnect(self).await
    }
}

fn open_session<C: Connector>(connector: &C) -> Option<C::Session> {
    match connector.connect() {
        Ok(session) => Some(session),
        Err(e) => {
            error!("Error connecting to {}: {}", connector.describe(), e);
            None
        }
    }
}

fn run_command<C: Connector>(
    connector: &C,
    session: Option<C::Session>,
    command: &str,
) -> (Option<C::Session>, CommandOutput) {
    let live = match session {
        Some(session) if session.is_alive() => Some(session),
        Some(mut dead) => {
            debug!("Session is no longer active, reconnecting");
            dead.close();
            None
        }
        None => None,
    };

    let mut session = match live.or_else(|| open_session(connector)) {
        Some(session) => session,
        None => return (None, CommandOutput::failed(CONNECT_FAILED)),
    };

    debug!(command, "Executing command");
    match session.exec(command) {
        Ok(out) => {
            if out.exit_code != 0 {
                warn!(exit_code = out.exit_code, stderr = %out.stderr, "Command exited with non-zero status");
            }
            let output = CommandOutput {
                success: out.exit_code == 0,
                stdout: out.stdout,
                stderr: out.stderr,
            };
            (Some(session), output)
        }
        Err(e) => {
            error!("Error executing command: {}", e);
            session.close();
            (None, CommandOutput::failed(e.to_string()))
        }
    }
}
