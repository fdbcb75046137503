//! Serial transport abstraction.
//!
//! Defines the `Transport` trait for talking to the controller,
//! allowing different implementations (serialport, mock).
//!
//! Nothing here returns an error: a transport either works or reports
//! `false`/`None`/an empty line, and logs the reason.

use std::time::Instant;

use crate::device::DiscoveredPort;

/// Line-oriented serial channel plus USB discovery.
pub trait Transport: Send {
    /// Find the first attached controller in either mode.
    fn discover(&self) -> Option<DiscoveredPort>;

    /// Open `port` at `baud` in raw 8N1 mode, closing any previous channel.
    fn open(&mut self, port: &str, baud: u32) -> bool;

    /// Whether a channel is currently open.
    fn is_open(&self) -> bool;

    /// Block until a full line arrives and return it without its terminator.
    ///
    /// Returns an empty string only when no channel is open or the wait was
    /// cancelled.
    fn read_line(&mut self) -> String;

    /// Like [`read_line`](Self::read_line) but gives up at `deadline`.
    ///
    /// Bytes of an incomplete line are kept for the next call.
    fn read_line_until(&mut self, deadline: Instant) -> Option<String>;

    /// Send `text` followed by the line terminator. Does not wait for a reply.
    fn write_line(&mut self, text: &str);

    /// Flush and release the channel. Safe to call when already closed.
    fn close(&mut self);

    /// Open `port` at 1200 baud and close it again, which makes the board
    /// reboot into its bootloader.
    ///
    /// `true` only means the touch was performed; whether the board actually
    /// restarted is up to discovery to find out.
    fn reset_to_bootloader(&mut self, port: &str) -> bool;
}
