//! Local port-forward tunnels backed by a `kubectl port-forward` child
//! process.
//!
//! Startup success can only be inferred from the process's diagnostic
//! output: `kubectl` prints a single `Forwarding from <addr>:<port> ->
//! <port>` line once the local socket is bound. The connect path reads the
//! combined stdout+stderr stream until that handshake line appears, the
//! process dies, or a deadline passes; every failure tears the child down
//! before the error propagates, so a failed `connect` never leaks a
//! process.

use std::process::Stdio;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Bind address used when the caller does not pick one.
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";

/// Cadence of "is there output yet / is the child still alive" checks.
const OUTPUT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long `close()` waits for the killed process to actually exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Immutable description of one tunnel.
///
/// Whether a local port was requested is part of the spec, not inferred
/// later: `local_port: Some(..)` demands a verbatim handshake line, `None`
/// lets the OS pick a port which is then parsed out of the handshake.
#[derive(Debug, Clone)]
pub struct TunnelSpec {
    pub context: String,
    pub namespace: String,
    /// kubectl destination, e.g. `pod/backend-7d4b9c`.
    pub destination: String,
    pub remote_port: u16,
    pub local_port: Option<u16>,
    pub bind_address: String,
    /// Upper bound on the whole handshake wait. Empty reads stay
    /// non-fatal; this deadline is what prevents an indefinite hang when
    /// the process never prints anything.
    pub handshake_timeout: Duration,
}

impl TunnelSpec {
    pub fn new(
        context: impl Into<String>,
        namespace: impl Into<String>,
        destination: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            context: context.into(),
            namespace: namespace.into(),
            destination: destination.into(),
            remote_port,
            local_port: None,
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Request a fixed local port instead of an OS-assigned one.
    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    pub fn with_bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = address.into();
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// The `local:remote` argument kubectl expects; an empty local side
    /// asks the OS to pick.
    fn port_mapping(&self) -> String {
        match self.local_port {
            Some(local) => format!("{local}:{}", self.remote_port),
            None => format!(":{}", self.remote_port),
        }
    }

    fn expected_handshake(&self) -> Result<Handshake, TunnelError> {
        match self.local_port {
            Some(local) => Ok(Handshake::Exact {
                line: format!(
                    "Forwarding from {}:{} -> {}",
                    self.bind_address, local, self.remote_port
                ),
                port: local,
            }),
            None => {
                let pattern = format!(
                    "^Forwarding from {}:([0-9]+) -> {}$",
                    regex::escape(&self.bind_address),
                    self.remote_port
                );
                Ok(Handshake::Assigned {
                    regex: Regex::new(&pattern)?,
                })
            }
        }
    }
}

/// The two shapes a valid handshake line can take.
enum Handshake {
    /// Fixed local port: the line must match verbatim.
    Exact { line: String, port: u16 },
    /// OS-assigned port: the captured digits become the resolved port.
    Assigned { regex: Regex },
}

/// Lifecycle state of a [`PortForwarder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Connecting,
    Ready,
    Closed,
    Failed,
}

/// Errors from tunnel startup. Every variant implies the child process has
/// already been torn down.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Spawning or signalling the child process failed.
    #[error("port-forward process i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// The process exited before emitting a handshake line.
    #[error("port-forward process exited before becoming ready (status {status:?}); output: {output:?}")]
    ProcessExited {
        /// Exit status, when the process could still be reaped.
        status: Option<std::process::ExitStatus>,
        /// Whatever diagnostic lines were captured before it died.
        output: Vec<String>,
    },

    /// The process emitted a line that is not the expected handshake.
    /// A single malformed line is fatal, not transient.
    #[error("unexpected port-forward output: {0:?}")]
    UnexpectedOutput(String),

    /// No handshake line appeared within the deadline while the process
    /// stayed alive.
    #[error("no port-forward handshake within {0:?}")]
    HandshakeTimeout(Duration),

    /// The bind address produced an invalid handshake pattern.
    #[error("invalid handshake pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Handle owning one port-forwarding child process.
///
/// Created by [`PortForwarder::connect`]; the handle is only handed to the
/// caller once the handshake succeeded, so `local_port()` is always
/// resolved on a live handle. Dropping the handle kills the child as a
/// backstop, but callers should [`close`](PortForwarder::close) explicitly
/// to get the bounded-grace teardown.
#[derive(Debug)]
pub struct PortForwarder {
    child: Option<Child>,
    lines: mpsc::UnboundedReceiver<String>,
    local_port: Option<u16>,
    state: TunnelState,
    destination: String,
}

impl PortForwarder {
    /// Spawn `kubectl port-forward` for the spec and wait for the
    /// handshake.
    pub async fn connect(spec: TunnelSpec) -> Result<Self, TunnelError> {
        let mut command = Command::new("kubectl");
        command.args([
            "--context",
            &spec.context,
            "--namespace",
            &spec.namespace,
            "port-forward",
            "--address",
            &spec.bind_address,
            &spec.destination,
            &spec.port_mapping(),
        ]);
        Self::connect_with(spec, command).await
    }

    /// Like [`connect`](Self::connect), but with a caller-supplied command.
    /// Used by tests to substitute a fake forwarder process; the spec still
    /// defines the expected handshake.
    pub async fn connect_with(spec: TunnelSpec, mut command: Command) -> Result<Self, TunnelError> {
        let expected = spec.expected_handshake()?;

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn()?;

        // stdout and stderr merge into one line stream; kubectl reports
        // errors on either.
        let (tx, lines) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, tx);
        }

        let mut forwarder = Self {
            child: Some(child),
            lines,
            local_port: spec.local_port,
            state: TunnelState::Connecting,
            destination: spec.destination.clone(),
        };

        match forwarder.handshake(&expected, spec.handshake_timeout).await {
            Ok(port) => {
                forwarder.local_port = Some(port);
                forwarder.state = TunnelState::Ready;
                info!(
                    destination = %forwarder.destination,
                    local_port = port,
                    "port forwarding established"
                );
                Ok(forwarder)
            }
            Err(err) => {
                // Never leak the child on a failed connect.
                forwarder.state = TunnelState::Failed;
                forwarder.close().await;
                Err(err)
            }
        }
    }

    async fn handshake(
        &mut self,
        expected: &Handshake,
        budget: Duration,
    ) -> Result<u16, TunnelError> {
        let deadline = Instant::now() + budget;
        loop {
            // Checked every iteration so a stream of ignorable lines (e.g.
            // blank output arriving faster than the poll interval) cannot
            // keep the loop alive past the deadline.
            if Instant::now() >= deadline {
                return Err(TunnelError::HandshakeTimeout(budget));
            }
            match timeout(OUTPUT_POLL_INTERVAL, self.lines.recv()).await {
                Ok(Some(raw)) => {
                    let line = raw.trim();
                    // A blank line is not data; keep waiting.
                    if line.is_empty() {
                        continue;
                    }
                    return match expected {
                        Handshake::Exact { line: want, port } => {
                            if line == want {
                                Ok(*port)
                            } else {
                                Err(TunnelError::UnexpectedOutput(line.to_string()))
                            }
                        }
                        Handshake::Assigned { regex } => regex
                            .captures(line)
                            .and_then(|captures| captures.get(1))
                            .and_then(|digits| digits.as_str().parse::<u16>().ok())
                            .ok_or_else(|| TunnelError::UnexpectedOutput(line.to_string())),
                    };
                }
                // Both pipes closed: the process is gone or going.
                Ok(None) => return Err(self.early_exit().await),
                // No output yet; fail fast if the child already died,
                // otherwise keep waiting for the handshake line.
                Err(_) => {
                    if let Some(child) = self.child.as_mut() {
                        if child.try_wait()?.is_some() {
                            return Err(self.early_exit().await);
                        }
                    }
                }
            }
        }
    }

    /// Build the early-exit error: reap the child and drain whatever
    /// output it managed to produce.
    async fn early_exit(&mut self) -> TunnelError {
        // Let the reader tasks flush lines still buffered in the pipes.
        tokio::time::sleep(OUTPUT_POLL_INTERVAL).await;

        let status = match self.child.as_mut() {
            Some(child) => match timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => Some(status),
                _ => None,
            },
            None => None,
        };

        let mut output = Vec::new();
        while let Ok(line) = self.lines.try_recv() {
            if !line.trim().is_empty() {
                output.push(line);
            }
        }
        TunnelError::ProcessExited { status, output }
    }

    /// The resolved local port. Always `Some` once the handle is `Ready`.
    pub fn local_port(&self) -> Option<u16> {
        self.local_port
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// OS pid of the child, while one is still tracked.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Tear down the tunnel. Idempotent: with no process tracked this is a
    /// no-op. A child that ignores the kill past the grace period is
    /// logged, not raised.
    pub async fn close(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        info!(destination = %self.destination, pid = child.id(), "shutting down port forwarding");

        match child.try_wait() {
            Ok(Some(status)) => debug!(%status, "port-forward process had already exited"),
            _ => {
                if let Err(err) = child.start_kill() {
                    warn!(%err, "failed to kill port-forward process");
                }
                match timeout(SHUTDOWN_GRACE, child.wait()).await {
                    Ok(Ok(status)) => debug!(%status, "port forwarding stopped"),
                    Ok(Err(err)) => warn!(%err, "error reaping port-forward process"),
                    Err(_) => warn!(
                        grace = ?SHUTDOWN_GRACE,
                        "port-forward process did not exit within grace period"
                    ),
                }
            }
        }

        while let Ok(line) = self.lines.try_recv() {
            debug!(%line, "port-forward remaining output");
        }
        if self.state != TunnelState::Failed {
            self.state = TunnelState::Closed;
        }
    }
}

impl Drop for PortForwarder {
    fn drop(&mut self) {
        // close() was never called; kill_on_drop reaps the child, this just
        // sends the signal promptly.
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

fn spawn_line_reader<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}
