//! serialport-based transport implementation.

use std::io::{ErrorKind, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{debug, info, instrument, trace, warn};

use super::traits::Transport;
use super::usb;
use crate::cancel::CancelToken;
use crate::device::DiscoveredPort;
use crate::protocol::constants::{BOOTLOADER_TOUCH_BAUD_RATE, LINE_TERMINATOR};

const READ_CHUNK: usize = 256;

/// Outcome of one non-blocking read attempt.
enum Fill {
    Data,
    Idle,
    Closed,
}

/// Serial transport over a USB CDC port.
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    port_name: Option<String>,
    /// Received bytes not yet returned as a line.
    pending: Vec<u8>,
    read_poll: Duration,
    cancel: CancelToken,
}

impl SerialTransport {
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            port: None,
            port_name: None,
            pending: Vec::new(),
            read_poll: Duration::from_millis(1),
            cancel,
        }
    }

    /// Sleep between unsuccessful reads.
    pub fn with_read_poll(mut self, read_poll: Duration) -> Self {
        self.read_poll = read_poll;
        self
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|&b| b == LINE_TERMINATOR)?;
        let mut raw: Vec<u8> = self.pending.drain(..=end).collect();
        raw.pop();
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        let line = String::from_utf8_lossy(&raw).into_owned();
        debug!(line = %line, "RX");
        Some(line)
    }

    fn fill(&mut self) -> Fill {
        let Some(port) = self.port.as_mut() else {
            return Fill::Closed;
        };

        let mut buf = [0u8; READ_CHUNK];
        match port.read(&mut buf) {
            Ok(0) => Fill::Idle,
            Ok(n) => {
                self.pending.extend_from_slice(&buf[..n]);
                Fill::Data
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                Fill::Idle
            }
            Err(e) => {
                warn!(error = %e, port = ?self.port_name, "Read failed, closing port");
                self.close();
                Fill::Closed
            }
        }
    }

    /// Poll until a line is complete, the deadline passes, the channel closes
    /// or the token is cancelled.
    fn poll_line(&mut self, deadline: Option<Instant>) -> Option<String> {
        loop {
            if let Some(line) = self.take_line() {
                return Some(line);
            }
            if self.cancel.is_cancelled() {
                return None;
            }
            match self.fill() {
                Fill::Data => continue,
                Fill::Closed => return None,
                Fill::Idle => {}
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return None;
            }
            thread::sleep(self.read_poll);
        }
    }
}

impl Transport for SerialTransport {
    fn discover(&self) -> Option<DiscoveredPort> {
        usb::find_controller()
    }

    #[instrument(skip(self), level = "debug")]
    fn open(&mut self, port: &str, baud: u32) -> bool {
        self.close();

        let opened = serialport::new(port, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::ZERO)
            .open();

        match opened {
            Ok(handle) => {
                // Drop whatever the OS buffered before we arrived.
                if let Err(e) = handle.clear(ClearBuffer::All) {
                    debug!(error = %e, "Could not clear port buffers");
                }
                info!(port = %port, baud, "Serial port opened");
                self.port = Some(handle);
                self.port_name = Some(port.to_string());
                true
            }
            Err(e) => {
                warn!(port = %port, baud, error = %e, "Failed to open serial port");
                false
            }
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn read_line(&mut self) -> String {
        self.poll_line(None).unwrap_or_default()
    }

    fn read_line_until(&mut self, deadline: Instant) -> Option<String> {
        self.poll_line(Some(deadline))
    }

    fn write_line(&mut self, text: &str) {
        let Some(port) = self.port.as_mut() else {
            debug!(line = %text, "Write on closed port dropped");
            return;
        };

        debug!(line = %text, "TX");
        let mut frame = Vec::with_capacity(text.len() + 1);
        frame.extend_from_slice(text.as_bytes());
        frame.push(LINE_TERMINATOR);

        if let Err(e) = port.write_all(&frame).and_then(|_| port.flush()) {
            warn!(error = %e, "Write failed");
        }
    }

    fn close(&mut self) {
        self.pending.clear();
        let Some(mut port) = self.port.take() else {
            return;
        };
        if let Err(e) = port.flush() {
            trace!(error = %e, "Flush on close failed");
        }
        if let Err(e) = port.clear(ClearBuffer::All) {
            trace!(error = %e, "Clear on close failed");
        }
        if let Some(name) = self.port_name.take() {
            debug!(port = %name, "Serial port closed");
        }
    }

    #[instrument(skip(self))]
    fn reset_to_bootloader(&mut self, port: &str) -> bool {
        match serialport::new(port, BOOTLOADER_TOUCH_BAUD_RATE)
            .timeout(Duration::from_millis(100))
            .open()
        {
            Ok(handle) => {
                // Closing the port at 1200 baud is the trigger itself.
                drop(handle);
                info!(port = %port, "1200 baud touch performed");
                true
            }
            Err(e) => {
                warn!(port = %port, error = %e, "Failed to open port for 1200 baud touch");
                false
            }
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport_with(bytes: &[u8]) -> SerialTransport {
        let mut transport = SerialTransport::new(CancelToken::new());
        transport.pending.extend_from_slice(bytes);
        transport
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(5)
    }

    #[test]
    fn test_line_split_across_reads() {
        let mut transport = transport_with(b"GET sett");
        assert_eq!(transport.read_line_until(soon()), None);

        transport.pending.extend_from_slice(b"ings OK\n");
        assert_eq!(
            transport.read_line_until(soon()).as_deref(),
            Some("GET settings OK")
        );
        assert!(transport.pending.is_empty());
    }

    #[test]
    fn test_crlf_stripped() {
        let mut transport = transport_with(b"tempOffset=2\r\n");
        assert_eq!(transport.take_line().as_deref(), Some("tempOffset=2"));
    }

    #[test]
    fn test_two_lines_in_one_chunk() {
        let mut transport = transport_with(b"Booting\nsetpoint:98.00\npart");
        assert_eq!(transport.take_line().as_deref(), Some("Booting"));
        assert_eq!(transport.take_line().as_deref(), Some("setpoint:98.00"));
        assert_eq!(transport.take_line(), None);
        assert_eq!(transport.pending, b"part");
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut transport = transport_with(b"name=caf\xff\n");
        assert_eq!(transport.take_line().as_deref(), Some("name=caf\u{fffd}"));
    }

    #[test]
    fn test_read_line_when_closed() {
        let mut transport = SerialTransport::new(CancelToken::new());
        assert!(!transport.is_open());
        assert_eq!(transport.read_line(), "");
    }
}
