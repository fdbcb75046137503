//! Transport layer module.

pub mod mock;
pub mod serial;
pub mod traits;
pub mod usb;

pub use mock::{MockHandle, MockTransport};
pub use serial::SerialTransport;
pub use traits::Transport;
