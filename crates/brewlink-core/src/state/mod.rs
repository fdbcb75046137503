//! Connection state tracking.

pub mod machine;

pub use machine::{SessionState, StateMachine};
