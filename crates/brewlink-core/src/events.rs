//! Event system for UI decoupling.
//!
//! The firmware upgrade reports its progress through an [`UpgradeObserver`]
//! so front-ends can render steps however they like.

use std::fmt;
use std::path::PathBuf;

/// Upgrade steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeStep {
    CheckProgrammer,
    CheckImage,
    Backup,
    EnterBootloader,
    Flash,
    Restore,
}

impl UpgradeStep {
    pub const COUNT: usize = 6;

    /// 1-based position for "Step n/6" style output.
    pub fn number(&self) -> usize {
        match self {
            UpgradeStep::CheckProgrammer => 1,
            UpgradeStep::CheckImage => 2,
            UpgradeStep::Backup => 3,
            UpgradeStep::EnterBootloader => 4,
            UpgradeStep::Flash => 5,
            UpgradeStep::Restore => 6,
        }
    }
}

impl fmt::Display for UpgradeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpgradeStep::CheckProgrammer => write!(f, "Checking programmer"),
            UpgradeStep::CheckImage => write!(f, "Checking firmware file"),
            UpgradeStep::Backup => write!(f, "Backing up settings"),
            UpgradeStep::EnterBootloader => write!(f, "Entering bootloader"),
            UpgradeStep::Flash => write!(f, "Uploading firmware"),
            UpgradeStep::Restore => write!(f, "Reconnecting and restoring settings"),
        }
    }
}

/// Events emitted during a firmware upgrade.
#[derive(Debug, Clone, PartialEq)]
pub enum UpgradeEvent {
    /// A step is starting.
    Step(UpgradeStep),
    /// Settings were saved before flashing.
    BackupSaved { path: PathBuf, count: usize },
    /// Settings backup and restore are skipped.
    BackupSkipped,
    /// The programmer is about to run.
    Flashing { port: String, image: PathBuf },
    /// The programmer exited successfully.
    Flashed,
    /// The board is back in application mode.
    Reconnected { port: String, version: String },
    /// Settings were written back.
    Restored { count: usize },
    /// Something went wrong that does not stop the upgrade.
    Warning { message: String },
}

/// Observer trait for receiving upgrade events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait UpgradeObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &UpgradeEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl UpgradeObserver for NullObserver {
    fn on_event(&self, _event: &UpgradeEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl UpgradeObserver for TracingObserver {
    fn on_event(&self, event: &UpgradeEvent) {
        match event {
            UpgradeEvent::Step(step) => {
                tracing::info!(
                    step = %format!("{}/{}", step.number(), UpgradeStep::COUNT),
                    "{}...",
                    step
                );
            }
            UpgradeEvent::BackupSaved { path, count } => {
                tracing::info!(path = %path.display(), count, "Settings backed up");
            }
            UpgradeEvent::BackupSkipped => {
                tracing::warn!("Proceeding without settings backup/restore");
            }
            UpgradeEvent::Flashing { port, image } => {
                tracing::info!(port = %port, image = %image.display(), "Uploading firmware");
            }
            UpgradeEvent::Flashed => {
                tracing::info!("Firmware uploaded");
            }
            UpgradeEvent::Reconnected { port, version } => {
                tracing::info!(port = %port, version = %version, "Controller reconnected");
            }
            UpgradeEvent::Restored { count } => {
                tracing::info!(count, "Settings restored");
            }
            UpgradeEvent::Warning { message } => {
                tracing::warn!("{}", message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_numbers_are_ordered() {
        let steps = [
            UpgradeStep::CheckProgrammer,
            UpgradeStep::CheckImage,
            UpgradeStep::Backup,
            UpgradeStep::EnterBootloader,
            UpgradeStep::Flash,
            UpgradeStep::Restore,
        ];
        let numbers: Vec<usize> = steps.iter().map(UpgradeStep::number).collect();
        assert_eq!(numbers, (1..=UpgradeStep::COUNT).collect::<Vec<_>>());
    }
}
