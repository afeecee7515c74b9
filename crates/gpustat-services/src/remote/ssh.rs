use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use gpustat_core::ServerTarget;
use ssh2::Session;
use tracing::{debug, info};

use super::{Connector, ExitOutput, RemoteError, ShellSession};

const KEEPALIVE_INTERVAL_SECS: u32 = 10;

/// Key-based SSH logins to one host via libssh2
#[derive(Debug, Clone)]
pub struct SshConnector {
    host: String,
    port: u16,
    user: String,
    key_path: PathBuf,
    connect_timeout: Duration,
}

impl SshConnector {
    pub fn new(target: &ServerTarget, connect_timeout: Duration) -> Self {
        Self {
            host: target.host.clone(),
            port: target.port,
            user: target.user.clone(),
            key_path: target.key_path.clone(),
            connect_timeout,
        }
    }
}

impl Connector for SshConnector {
    type Session = SshSession;

    fn connect(&self) -> Result<SshSession, RemoteError> {
        info!("Connecting to {}", self.describe());

        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| RemoteError::Resolve(format!("{}:{}", self.host, self.port)))?;
        let tcp = TcpStream::connect_timeout(&addr, self.connect_timeout)?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        // Bounds handshake and auth; lifted once the session is up.
        session.set_timeout(timeout_ms(self.connect_timeout));
        session.handshake()?;

        // The host key is not checked against known_hosts: first use is trusted.
        session.userauth_pubkey_file(&self.user, None, &self.key_path, None)?;
        if !session.authenticated() {
            return Err(RemoteError::AuthRejected(self.user.clone()));
        }

        session.set_timeout(0);
        session.set_keepalive(true, KEEPALIVE_INTERVAL_SECS);
        debug!("Session established");

        Ok(SshSession { session })
    }

    fn describe(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}

fn timeout_ms(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

pub struct SshSession {
    session: Session,
}

impl ShellSession for SshSession {
    fn is_alive(&self) -> bool {
        self.session.authenticated() && self.session.keepalive_send().is_ok()
    }

    fn exec(&mut self, command: &str) -> Result<ExitOutput, RemoteError> {
        let mut channel = self.session.channel_session()?;
        channel.exec(command)?;

        let mut stdout = Vec::new();
        channel.read_to_end(&mut stdout)?;
        let mut stderr = Vec::new();
        channel.stderr().read_to_end(&mut stderr)?;

        channel.wait_close()?;
        let exit_code = channel.exit_status()?;

        Ok(ExitOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
        })
    }

    fn close(&mut self) {
        if let Err(e) = self.session.disconnect(None, "gpustat closing session", None) {
            debug!("SSH disconnect failed: {}", e);
        }
    }
}
