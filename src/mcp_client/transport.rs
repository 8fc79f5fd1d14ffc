// ABOUTME: Byte channel to an MCP server with newline framing
//
// Two bindings share one framing layer:
// - Socket: tokio UnixStream connected to a configured path
// - Process: spawned child, requests on stdin, responses on stdout,
//   stderr discarded
//
// Messages are one JSON object per line. Received bytes accumulate in a
// buffer; each receive returns the first complete line and keeps the rest.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use super::config::TransportKind;
use super::error::{McpError, McpResult};

/// Largest frame accepted before a newline must appear
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

const READ_CHUNK: usize = 4096;

enum Channel {
    Socket(UnixStream),
    Process {
        child: Child,
        stdin: ChildStdin,
        stdout: ChildStdout,
    },
}

/// An open channel plus its receive buffer
pub struct Transport {
    channel: Channel,
    buffer: Vec<u8>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("kind", &self.kind())
            .field("pid", &self.pid())
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl Transport {
    /// Open the channel described by `kind`
    ///
    /// # Errors
    /// `McpError::Connect` if the socket is unreachable, `McpError::Spawn`
    /// if the command cannot be launched
    pub async fn open(kind: &TransportKind) -> McpResult<Self> {
        match kind {
            TransportKind::Socket { path } => {
                let stream = UnixStream::connect(path)
                    .await
                    .map_err(|source| McpError::Connect {
                        path: path.clone(),
                        source,
                    })?;
                debug!(path = %path.display(), "Connected to MCP socket");
                Ok(Self::new(Channel::Socket(stream)))
            }
            TransportKind::Stdio { command, args, env } => Self::spawn(command, args, env),
        }
    }

    fn spawn(command: &str, args: &[String], env: &HashMap<String, String>) -> McpResult<Self> {
        let spawn_error = |source| McpError::Spawn {
            command: command.to_string(),
            source,
        };

        if command.is_empty() {
            return Err(spawn_error(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "command cannot be empty",
            )));
        }

        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        let missing = || spawn_error(std::io::Error::other("child stdio not captured"));
        let stdin = child.stdin.take().ok_or_else(missing)?;
        let stdout = child.stdout.take().ok_or_else(missing)?;

        info!(pid = child.id().unwrap_or(0), command = %command, "Spawned MCP server process");

        Ok(Self::new(Channel::Process {
            child,
            stdin,
            stdout,
        }))
    }

    const fn new(channel: Channel) -> Self {
        Self {
            channel,
            buffer: Vec::new(),
        }
    }

    /// Binding label
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self.channel {
            Channel::Socket(_) => "socket",
            Channel::Process { .. } => "stdio",
        }
    }

    /// Child process id, for process bindings that are still running
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        match &self.channel {
            Channel::Socket(_) => None,
            Channel::Process { child, .. } => child.id(),
        }
    }

    /// Write one message, newline-terminated. Returns bytes written.
    pub async fn send(&mut self, message: &str) -> McpResult<usize> {
        let mut frame = Vec::with_capacity(message.len() + 1);
        frame.extend_from_slice(message.as_bytes());
        if !message.ends_with('\n') {
            frame.push(b'\n');
        }

        match &mut self.channel {
            Channel::Socket(stream) => {
                stream.write_all(&frame).await?;
                stream.flush().await?;
            }
            Channel::Process { stdin, .. } => {
                stdin.write_all(&frame).await?;
                stdin.flush().await?;
            }
        }

        Ok(frame.len())
    }

    /// Return the next complete line, waiting at most `timeout` for it
    ///
    /// # Errors
    /// `Timeout` when no full line arrives in time, `Eof` when the peer
    /// closed, `MessageTooLarge` when the buffer outgrows the frame limit
    pub async fn receive(&mut self, timeout: Duration) -> McpResult<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            if let Some(line) = self.take_line()? {
                return Ok(line);
            }

            if self.buffer.len() > MAX_MESSAGE_SIZE {
                return Err(McpError::MessageTooLarge(MAX_MESSAGE_SIZE));
            }

            let read = tokio::time::timeout_at(deadline, self.read_some(&mut chunk))
                .await
                .map_err(|_| McpError::Timeout(timeout))??;

            if read == 0 {
                if !self.buffer.is_empty() {
                    debug!(bytes = self.buffer.len(), "Discarding unterminated data at EOF");
                }
                return Err(McpError::Eof);
            }

            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }

    async fn read_some(&mut self, chunk: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.channel {
            Channel::Socket(stream) => stream.read(chunk).await,
            Channel::Process { stdout, .. } => stdout.read(chunk).await,
        }
    }

    /// Pop the first non-empty line from the buffer
    fn take_line(&mut self) -> McpResult<Option<String>> {
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return String::from_utf8(line)
                .map(Some)
                .map_err(|_| McpError::MalformedResponse("invalid UTF-8 in message".to_string()));
        }
        Ok(None)
    }

    /// Bytes received but not yet returned
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// False once a spawned child has exited
    pub fn is_alive(&mut self) -> bool {
        match &mut self.channel {
            Channel::Socket(_) => true,
            Channel::Process { child, .. } => matches!(child.try_wait(), Ok(None)),
        }
    }

    /// Close the channel. A spawned child gets SIGTERM and a non-blocking
    /// reap; anything still running is killed when the handle drops.
    pub fn close(self) {
        match self.channel {
            Channel::Socket(stream) => drop(stream),
            Channel::Process {
                mut child,
                stdin,
                stdout,
            } => {
                drop(stdin);
                drop(stdout);

                if let Some(pid) = child.id() {
                    #[cfg(unix)]
                    {
                        use nix::sys::signal::{Signal, kill};
                        use nix::unistd::Pid;

                        #[allow(clippy::cast_possible_wrap)]
                        let raw_pid = pid as i32;
                        if let Err(e) = kill(Pid::from_raw(raw_pid), Signal::SIGTERM) {
                            warn!(pid = pid, error = %e, "Failed to signal MCP server process");
                        }
                    }

                    match child.try_wait() {
                        Ok(Some(status)) => debug!(pid = pid, ?status, "MCP server process reaped"),
                        Ok(None) => debug!(pid = pid, "MCP server process still exiting"),
                        Err(e) => warn!(pid = pid, error = %e, "Failed to reap MCP server process"),
                    }
                }
            }
        }
    }
}
