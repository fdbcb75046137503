//! Device session - owns the transport and tracks what is on the other end.
//!
//! A session connects to whichever controller discovery finds, captures its
//! boot output, probes the firmware generation and then runs command
//! exchanges. It can also walk the board into its bootloader and find it
//! again afterwards, possibly under a different port name.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

use crate::cancel::CancelToken;
use crate::config::{Timings, ToolConfig};
use crate::device::{DeviceInfo, DiscoveredPort, FirmwareVersion};
use crate::protocol::constants::{CMD_GET_INFO, DEFAULT_BAUD_RATE};
use crate::protocol::{ReplyLine, Request, StatusLine};
use crate::state::{SessionState, StateMachine};
use crate::transport::{SerialTransport, Transport};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Invalid command {0:?}: expected VERB OBJECT [args]")]
    InvalidCommand(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Command {request:?} rejected: {line}")]
    Rejected { request: String, line: String },

    #[error("Command {request:?} timed out after {}ms", .timeout.as_millis())]
    Timeout { request: String, timeout: Duration },

    #[error("Cancelled")]
    Cancelled,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("No controller found")]
    NotFound,

    #[error("Failed to open {port}")]
    OpenFailed { port: String },

    #[error("Not connected")]
    NotConnected,

    #[error("Bootloader did not appear within {}s", .waited.as_secs())]
    BootloaderNotFound { waited: Duration },

    #[error("Cancelled")]
    Cancelled,
}

/// Lines printed by the application between opening the port and its first
/// status line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootLog {
    lines: Vec<String>,
}

impl BootLog {
    pub fn new(lines: Vec<String>) -> Self {
        Self { lines }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether the capture ended on a status line.
    pub fn is_complete(&self) -> bool {
        self.lines.iter().any(|l| StatusLine::is_status(l))
    }

    /// Lines up to, not including, the first status line.
    pub fn before_status(&self) -> &[String] {
        let end = self
            .lines
            .iter()
            .position(|l| StatusLine::is_status(l))
            .unwrap_or(self.lines.len());
        &self.lines[..end]
    }

    pub fn status_lines(&self) -> impl Iterator<Item = StatusLine> + '_ {
        self.lines.iter().filter_map(|l| StatusLine::parse(l))
    }

    /// Whether any status line reported an idle brew state.
    pub fn saw_idle(&self) -> bool {
        self.status_lines().any(|s| s.is_idle())
    }
}

/// Result of a successful connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub info: DeviceInfo,
    pub boot_log: BootLog,
}

/// One controller session.
pub struct DeviceSession<T: Transport> {
    transport: T,
    timings: Timings,
    baud_rate: u32,
    cancel: CancelToken,
    machine: StateMachine,
    info: Option<DeviceInfo>,
}

impl DeviceSession<SerialTransport> {
    /// Session over the host's serial ports.
    pub fn serial(config: &ToolConfig, cancel: CancelToken) -> Self {
        let transport =
            SerialTransport::new(cancel.clone()).with_read_poll(config.timings.read_poll());
        Self::new(transport, config.timings.clone(), cancel).with_baud_rate(config.baud_rate)
    }
}

impl<T: Transport> DeviceSession<T> {
    pub fn new(transport: T, timings: Timings, cancel: CancelToken) -> Self {
        Self {
            transport,
            timings,
            baud_rate: DEFAULT_BAUD_RATE,
            cancel,
            machine: StateMachine::new(),
            info: None,
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    /// Snapshot taken at the last connection change.
    pub fn info(&self) -> Option<&DeviceInfo> {
        self.info.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn is_bootloader(&self) -> bool {
        self.state().is_bootloader()
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Discover and open the controller, in whichever mode it is.
    #[instrument(skip(self))]
    pub fn connect(&mut self) -> Result<Connection, ConnectError> {
        if self.cancel.is_cancelled() {
            return Err(ConnectError::Cancelled);
        }
        if self.is_connected() {
            self.disconnect();
        }

        let found = self.transport.discover().ok_or(ConnectError::NotFound)?;
        self.open_discovered(&found)
    }

    /// Discover and open the controller without reading from or writing to it.
    ///
    /// Boot output stays on the wire for the caller, which is what
    /// [`monitor`](Self::monitor) needs. The firmware version is not probed.
    #[instrument(skip(self))]
    pub fn attach(&mut self) -> Result<DeviceInfo, ConnectError> {
        if self.cancel.is_cancelled() {
            return Err(ConnectError::Cancelled);
        }
        if self.is_connected() {
            self.disconnect();
        }

        let found = self.transport.discover().ok_or(ConnectError::NotFound)?;
        if !self.transport.open(&found.port, self.baud_rate) {
            return Err(ConnectError::OpenFailed { port: found.port });
        }

        let version = if found.identity.is_bootloader() {
            FirmwareVersion::Bootloader
        } else {
            FirmwareVersion::Unknown
        };
        let info = DeviceInfo::new(&found, version);
        self.machine.goto_state(SessionState::from(found.identity.mode));
        info!(port = %info.port, mode = %info.mode(), "Attached");
        self.info = Some(info.clone());
        Ok(info)
    }

    /// Poll [`connect`](Self::connect) until it succeeds, the connect window
    /// runs out or the token is cancelled.
    #[instrument(skip(self))]
    pub fn wait_for_device(&mut self) -> Result<Connection, ConnectError> {
        info!(
            window_secs = self.timings.connect_window().as_secs(),
            "Waiting for controller..."
        );
        let deadline = Instant::now() + self.timings.connect_window();
        let mut polls = 0u64;

        loop {
            polls += 1;
            match self.connect() {
                Ok(conn) => {
                    debug!(polls, "Controller connected");
                    return Ok(conn);
                }
                Err(ConnectError::Cancelled) => return Err(ConnectError::Cancelled),
                Err(e) => {
                    if Instant::now() >= deadline {
                        warn!(polls, error = %e, "Gave up waiting for controller");
                        return Err(e);
                    }
                    trace!(error = %e, "Controller not ready");
                }
            }
            if !self.cancel.sleep(self.timings.discovery_poll()) {
                return Err(ConnectError::Cancelled);
            }
        }
    }

    /// Close and connect again. Used after the board was reflashed.
    pub fn reconnect(&mut self) -> Result<Connection, ConnectError> {
        self.disconnect();
        self.connect()
    }

    /// Release the port. Safe to call when already disconnected.
    pub fn disconnect(&mut self) {
        self.transport.close();
        if let Some(info) = self.info.take() {
            info!(port = %info.port, "Disconnected");
        }
        self.machine.goto_state(SessionState::Disconnected);
    }

    fn open_discovered(&mut self, found: &DiscoveredPort) -> Result<Connection, ConnectError> {
        if !self.transport.open(&found.port, self.baud_rate) {
            return Err(ConnectError::OpenFailed {
                port: found.port.clone(),
            });
        }

        if found.identity.is_bootloader() {
            let info = DeviceInfo::new(found, FirmwareVersion::Bootloader);
            self.machine.goto_state(SessionState::Bootloader);
            self.info = Some(info.clone());
            info!(port = %found.port, "Connected to bootloader");
            return Ok(Connection {
                info,
                boot_log: BootLog::default(),
            });
        }

        self.machine.goto_state(SessionState::Application);
        let boot_log = self.capture_boot_sequence();

        let version = if boot_log.is_complete() {
            let reply = self.send_command(CMD_GET_INFO, self.timings.info_timeout());
            FirmwareVersion::from_info_reply(&reply)
        } else {
            warn!(
                lines = boot_log.len(),
                "No status line during boot capture, firmware version unknown"
            );
            FirmwareVersion::Unknown
        };

        if self.cancel.is_cancelled() {
            self.disconnect();
            return Err(ConnectError::Cancelled);
        }

        let info = DeviceInfo::new(found, version);
        info!(
            port = %info.port,
            vid = %format!("{:04X}", info.vendor_id),
            pid = %format!("{:04X}", info.product_id),
            version = %info.firmware_version,
            "Connected"
        );
        self.info = Some(info.clone());
        Ok(Connection { info, boot_log })
    }

    /// Collect lines until the first status line or the capture window ends.
    fn capture_boot_sequence(&mut self) -> BootLog {
        let deadline = Instant::now() + self.timings.boot_capture();
        let mut lines = Vec::new();

        while let Some(line) = self.transport.read_line_until(deadline) {
            let done = StatusLine::is_status(&line);
            lines.push(line);
            if done {
                break;
            }
        }

        debug!(lines = lines.len(), "Boot capture finished");
        BootLog::new(lines)
    }

    /// Send one request and collect its reply.
    ///
    /// Status lines arriving meanwhile are dropped. On success the returned
    /// lines end with the `OK` marker.
    #[instrument(skip_all, fields(request = %line))]
    pub fn send_command(
        &mut self,
        line: &str,
        timeout: Duration,
    ) -> Result<Vec<String>, CommandError> {
        let request =
            Request::parse(line).ok_or_else(|| CommandError::InvalidCommand(line.to_string()))?;
        if !self.is_connected() || !self.transport.is_open() {
            return Err(CommandError::NotConnected);
        }

        self.transport.write_line(request.line());
        let deadline = Instant::now() + timeout;
        let mut lines = Vec::new();

        loop {
            if self.cancel.is_cancelled() {
                return Err(CommandError::Cancelled);
            }
            let received = if Instant::now() < deadline {
                self.transport.read_line_until(deadline)
            } else {
                None
            };
            let Some(reply) = received else {
                if self.cancel.is_cancelled() {
                    return Err(CommandError::Cancelled);
                }
                debug!(timeout_ms = timeout.as_millis() as u64, "No reply");
                return Err(CommandError::Timeout {
                    request: request.line().to_string(),
                    timeout,
                });
            };

            match request.classify(&reply) {
                ReplyLine::Telemetry => trace!(line = %reply, "Skipping status line"),
                ReplyLine::Body => lines.push(reply),
                ReplyLine::Ok => {
                    lines.push(reply);
                    return Ok(lines);
                }
                ReplyLine::Rejected => {
                    return Err(CommandError::Rejected {
                        request: request.line().to_string(),
                        line: reply,
                    });
                }
            }
        }
    }

    /// [`send_command`](Self::send_command) with the configured command timeout.
    pub fn command(&mut self, line: &str) -> Result<Vec<String>, CommandError> {
        let timeout = self.timings.command_timeout();
        self.send_command(line, timeout)
    }

    /// Reboot the application into its bootloader and connect to it.
    ///
    /// Already being in the bootloader is success. On failure the session is
    /// left disconnected.
    #[instrument(skip(self))]
    pub fn enter_bootloader(&mut self) -> Result<DeviceInfo, ConnectError> {
        let info = self.info.clone().ok_or(ConnectError::NotConnected)?;
        if self.is_bootloader() {
            return Ok(info);
        }

        let port = info.port;
        self.disconnect();
        if !self.cancel.sleep(self.timings.release_settle()) {
            return Err(ConnectError::Cancelled);
        }

        info!(port = %port, "Resetting into bootloader");
        if !self.transport.reset_to_bootloader(&port) {
            warn!(port = %port, "Bootloader touch failed, looking for the bootloader anyway");
        }
        if !self.cancel.sleep(self.timings.reset_settle()) {
            return Err(ConnectError::Cancelled);
        }

        let window = self.timings.bootloader_window();
        let deadline = Instant::now() + window;
        loop {
            if let Some(found) = self.transport.discover()
                && found.identity.is_bootloader()
            {
                match self.open_discovered(&found) {
                    Ok(conn) => return Ok(conn.info),
                    // The node is often busy right after re-enumeration.
                    Err(ConnectError::OpenFailed { port }) => {
                        debug!(port = %port, "Bootloader port not ready yet");
                    }
                    Err(e) => return Err(e),
                }
            }
            if Instant::now() >= deadline {
                warn!(waited_ms = window.as_millis() as u64, "Bootloader not found");
                return Err(ConnectError::BootloaderNotFound { waited: window });
            }
            if !self.cancel.sleep(self.timings.discovery_poll()) {
                return Err(ConnectError::Cancelled);
            }
        }
    }

    /// Pass every received line to `on_line` until cancelled.
    pub fn monitor<F>(&mut self, mut on_line: F) -> Result<(), CommandError>
    where
        F: FnMut(&str),
    {
        if !self.is_connected() {
            return Err(CommandError::NotConnected);
        }

        while !self.cancel.is_cancelled() {
            if !self.transport.is_open() {
                warn!("Port closed while monitoring");
                self.disconnect();
                return Err(CommandError::NotConnected);
            }
            let deadline = Instant::now() + self.timings.discovery_poll();
            if let Some(line) = self.transport.read_line_until(deadline) {
                on_line(&line);
            }
        }
        Ok(())
    }
}
