// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Shell command execution, locally or over SSH.
//!
//! Every call is a single attempt bounded by the executor's timeout; errors
//! go straight back to the caller.

use std::future::Future;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::process::Stdio;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use wirefleet_types::{ServerAccess, SshAuth, VpnServer};

use crate::error::ErrorKind;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

const STREAM_POLL: Duration = Duration::from_millis(10);

/// libssh2 `LIBSSH2_ERROR_TIMEOUT`.
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("ssh authentication not provided for {user}@{host}")]
    AuthNotProvided { user: String, host: String },

    #[error("ssh authentication failed for {user}@{host}: {reason}")]
    AuthFailed {
        user: String,
        host: String,
        reason: String,
    },

    #[error("{host}: timed out after {secs}s")]
    Timeout { host: String, secs: u64 },

    #[error("{host}: DNS resolution failed")]
    Dns { host: String },

    #[error("{host}: connection refused")]
    Refused { host: String },

    #[error("{host}: connection failed: {source}")]
    Connect {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("ssh session error: {0}")]
    Session(#[from] ssh2::Error),

    #[error("command exited with status {status}: {output}")]
    NonZeroExit { status: i32, output: String },

    #[error("command wrote to stderr: {0}")]
    Stderr(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("executor task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ExecError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AuthNotProvided { .. } | Self::AuthFailed { .. } => ErrorKind::Authentication,
            Self::Timeout { .. }
            | Self::Dns { .. }
            | Self::Refused { .. }
            | Self::Connect { .. }
            | Self::Io(_)
            | Self::Join(_) => ErrorKind::Connectivity,
            Self::Session(_) | Self::NonZeroExit { .. } | Self::Stderr(_) => ErrorKind::Protocol,
        }
    }
}

/// Runs shell commands against one host.
pub trait Executor: Send + Sync {
    /// Run `command`, optionally feeding `input` to its stdin, and return
    /// its stdout.
    fn run(
        &self,
        command: &str,
        input: Option<&str>,
    ) -> impl Future<Output = Result<String, ExecError>> + Send;

    fn execute(&self, command: &str) -> impl Future<Output = Result<String, ExecError>> + Send {
        self.run(command, None)
    }
}

fn is_warning(stderr: &str) -> bool {
    stderr.to_ascii_lowercase().contains("warning")
}

// -- Local --

#[derive(Debug, Clone)]
pub struct LocalExecutor {
    timeout: Duration,
}

impl LocalExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

impl Executor for LocalExecutor {
    async fn run(&self, command: &str, input: Option<&str>) -> Result<String, ExecError> {
        debug!(command, "executing local command");

        let work = async {
            let mut child = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;

            if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
                stdin.write_all(input.as_bytes()).await?;
            }

            Ok::<_, io::Error>(child.wait_with_output().await?)
        };

        let output = tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| ExecError::Timeout {
                host: "localhost".into(),
                secs: self.timeout.as_secs(),
            })??;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            let status = output.status.code().unwrap_or(-1);
            let output = if stderr.is_empty() { stdout.trim().to_string() } else { stderr };
            return Err(ExecError::NonZeroExit { status, output });
        }

        if !stderr.is_empty() {
            if !is_warning(&stderr) {
                return Err(ExecError::Stderr(stderr));
            }
            warn!(command, stderr = %stderr, "command reported a warning");
        }

        Ok(stdout)
    }
}

// -- SSH --

#[derive(Debug, Clone)]
pub struct SshExecutor {
    host: String,
    port: u16,
    username: String,
    auth: SshAuth,
    timeout: Duration,
}

impl SshExecutor {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        auth: Option<SshAuth>,
        timeout: Duration,
    ) -> Result<Self, ExecError> {
        let host = host.into();
        let username = username.into();
        let auth = auth.ok_or_else(|| ExecError::AuthNotProvided {
            user: username.clone(),
            host: host.clone(),
        })?;
        Ok(Self { host, port, username, auth, timeout })
    }

    fn timeout_err(&self) -> ExecError {
        ExecError::Timeout {
            host: self.host.clone(),
            secs: self.timeout.as_secs(),
        }
    }

    fn session_err(&self, err: ssh2::Error) -> ExecError {
        match err.code() {
            ssh2::ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => self.timeout_err(),
            _ => ExecError::Session(err),
        }
    }

    fn connect(&self) -> Result<ssh2::Session, ExecError> {
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ExecError::Dns { host: self.host.clone() })?;

        let tcp = TcpStream::connect_timeout(&addr, self.timeout).map_err(|e| match e.kind() {
            io::ErrorKind::ConnectionRefused => ExecError::Refused { host: self.host.clone() },
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => self.timeout_err(),
            _ => ExecError::Connect { host: self.host.clone(), source: e },
        })?;

        let mut session = ssh2::Session::new()?;
        session.set_timeout(u32::try_from(self.timeout.as_millis()).unwrap_or(u32::MAX));
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| self.session_err(e))?;

        let result = match &self.auth {
            SshAuth::Password { password } => {
                session.userauth_password(&self.username, password.expose())
            }
            SshAuth::PrivateKey { key, passphrase } => session.userauth_pubkey_memory(
                &self.username,
                None,
                key.expose(),
                passphrase.as_ref().map(|p| p.expose()),
            ),
        };

        let auth_failed = |reason: String| ExecError::AuthFailed {
            user: self.username.clone(),
            host: self.host.clone(),
            reason,
        };
        result.map_err(|e| auth_failed(e.message().to_string()))?;
        if !session.authenticated() {
            return Err(auth_failed("server rejected credentials".into()));
        }

        Ok(session)
    }

    /// Read stdout and stderr together until the remote side closes both,
    /// so a chatty stderr cannot stall on a full window while stdout is
    /// being drained.
    fn read_streams(
        &self,
        session: &ssh2::Session,
        channel: &ssh2::Channel,
    ) -> Result<(String, String), ExecError> {
        let deadline = Instant::now() + self.timeout;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut buf = [0u8; 8192];

        session.set_blocking(false);
        let result = 'poll: loop {
            let mut progressed = false;
            for (stream_id, sink) in [(0, &mut stdout), (1, &mut stderr)] {
                match channel.stream(stream_id).read(&mut buf) {
                    Ok(0) => {}
                    Ok(n) => {
                        sink.extend_from_slice(&buf[..n]);
                        progressed = true;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => break 'poll Err(ExecError::Io(e)),
                }
            }
            if progressed {
                continue;
            }
            if channel.eof() {
                break Ok(());
            }
            if Instant::now() >= deadline {
                break Err(self.timeout_err());
            }
            std::thread::sleep(STREAM_POLL);
        };
        session.set_blocking(true);
        result?;

        Ok((
            String::from_utf8_lossy(&stdout).into_owned(),
            String::from_utf8_lossy(&stderr).into_owned(),
        ))
    }

    fn run_blocking(&self, command: &str, input: Option<&str>) -> Result<String, ExecError> {
        let session = self.connect()?;
        let mut channel = session.channel_session().map_err(|e| self.session_err(e))?;
        channel.exec(command).map_err(|e| self.session_err(e))?;

        if let Some(input) = input {
            channel.write_all(input.as_bytes())?;
            channel.send_eof().map_err(|e| self.session_err(e))?;
        }

        let (stdout, stderr) = self.read_streams(&session, &channel)?;
        channel.wait_close().map_err(|e| self.session_err(e))?;
        let status = channel.exit_status()?;

        if !stderr.trim().is_empty() {
            debug!(host = %self.host, command, status, stderr = %stderr.trim(), "remote command wrote to stderr");
        }
        remote_outcome(status, stdout, &stderr)
    }
}

/// Remote commands fail on a non-zero exit only; stderr is carried into the
/// error but does not fail a successful command.
fn remote_outcome(status: i32, stdout: String, stderr: &str) -> Result<String, ExecError> {
    if status == 0 {
        return Ok(stdout);
    }
    let stderr = stderr.trim();
    let output = if stderr.is_empty() {
        stdout.trim().to_string()
    } else {
        format!("{stderr} (stdout: {})", stdout.trim())
    };
    Err(ExecError::NonZeroExit { status, output })
}

impl Executor for SshExecutor {
    async fn run(&self, command: &str, input: Option<&str>) -> Result<String, ExecError> {
        debug!(host = %self.host, port = self.port, command, "executing remote command");

        let this = self.clone();
        let command = command.to_string();
        let input = input.map(str::to_string);
        let task = tokio::task::spawn_blocking(move || this.run_blocking(&command, input.as_deref()));

        // The session timeout bounds the blocking call; this bounds the wait
        // for a blocking thread as well.
        tokio::time::timeout(self.timeout * 2, task)
            .await
            .map_err(|_| self.timeout_err())??
    }
}

// -- Per-server selection --

/// Executor picked from a server's access method.
#[derive(Debug, Clone)]
pub enum AnyExecutor {
    Local(LocalExecutor),
    Ssh(SshExecutor),
}

impl AnyExecutor {
    /// Build the executor for a WireGuard server. Returns `None` for
    /// API-managed servers.
    pub fn for_server(server: &VpnServer, timeout: Duration) -> Option<Result<Self, ExecError>> {
        match &server.access {
            ServerAccess::Local => Some(Ok(Self::Local(LocalExecutor::new(timeout)))),
            ServerAccess::Ssh { username, auth } => Some(
                SshExecutor::new(&server.host, server.port, username, auth.clone(), timeout)
                    .map(Self::Ssh),
            ),
            ServerAccess::Api { .. } => None,
        }
    }
}

impl Executor for AnyExecutor {
    async fn run(&self, command: &str, input: Option<&str>) -> Result<String, ExecError> {
        match self {
            Self::Local(exec) => exec.run(command, input).await,
            Self::Ssh(exec) => exec.run(command, input).await,
        }
    }
}
