//! Protocol module - line protocol definitions.

pub mod command;
pub mod constants;
pub mod status;

pub use command::{ReplyLine, Request};
pub use constants::*;
pub use status::StatusLine;
