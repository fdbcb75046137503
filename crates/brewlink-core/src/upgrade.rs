//! Firmware upgrade orchestrator.
//!
//! Backs up the settings, walks the board into its bootloader, hands the port
//! to the external programmer, reconnects to the new firmware and restores
//! the settings. Anything that fails before flash is touched aborts the
//! upgrade; failures after a successful flash only degrade the outcome.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument};

use crate::device::DeviceInfo;
use crate::events::{TracingObserver, UpgradeEvent, UpgradeObserver, UpgradeStep};
use crate::firmware::{FirmwareProgrammer, ImageError, ProgramError, check_image};
use crate::session::{BootLog, ConnectError, DeviceSession};
use crate::settings::{self, SettingsError};
use crate::transport::Transport;

#[derive(Error, Debug)]
pub enum UpgradeError {
    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Programmer(#[from] ProgramError),

    #[error("Not connected to a controller")]
    NotConnected,

    #[error("Upgrade cancelled: controller is in bootloader mode and proceeding without settings backup was declined")]
    ConsentDeclined,

    #[error("Failed to back up settings: {0}")]
    Backup(#[from] SettingsError),

    #[error("Failed to enter bootloader: {0}")]
    Bootloader(ConnectError),

    #[error("Cancelled")]
    Cancelled,
}

/// How an upgrade that reached the programmer ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome {
    /// New firmware running, settings written back.
    FullyRestored { backup: PathBuf },
    /// New firmware flashed, settings not restored.
    FlashedNotRestored {
        reason: String,
        backup: Option<PathBuf>,
    },
    /// The programmer failed. The board is most likely still in its
    /// bootloader.
    FlashFailed {
        reason: String,
        backup: Option<PathBuf>,
    },
}

impl UpgradeOutcome {
    /// Whether new firmware was written.
    pub fn is_flashed(&self) -> bool {
        !matches!(self, UpgradeOutcome::FlashFailed { .. })
    }

    pub fn backup(&self) -> Option<&Path> {
        match self {
            UpgradeOutcome::FullyRestored { backup } => Some(backup),
            UpgradeOutcome::FlashedNotRestored { backup, .. }
            | UpgradeOutcome::FlashFailed { backup, .. } => backup.as_deref(),
        }
    }
}

/// Asked whether to flash a board found in its bootloader, which means no
/// settings can be saved first.
pub trait Consent {
    fn proceed_without_backup(&self, info: &DeviceInfo) -> bool;
}

impl<F> Consent for F
where
    F: Fn(&DeviceInfo) -> bool,
{
    fn proceed_without_backup(&self, info: &DeviceInfo) -> bool {
        self(info)
    }
}

/// What to flash and where backups go.
#[derive(Debug, Clone)]
pub struct UpgradePlan {
    pub image: PathBuf,
    pub backup_dir: PathBuf,
}

/// Firmware upgrade - orchestrates backup, flash and restore.
pub struct FirmwareUpgrade<O: UpgradeObserver> {
    plan: UpgradePlan,
    observer: Arc<O>,
}

impl FirmwareUpgrade<TracingObserver> {
    /// Create an upgrade with the default tracing observer.
    pub fn new(plan: UpgradePlan) -> Self {
        Self::with_observer(plan, Arc::new(TracingObserver))
    }
}

impl<O: UpgradeObserver> FirmwareUpgrade<O> {
    /// Create an upgrade with a custom observer.
    pub fn with_observer(plan: UpgradePlan, observer: Arc<O>) -> Self {
        Self { plan, observer }
    }

    pub fn plan(&self) -> &UpgradePlan {
        &self.plan
    }

    fn emit(&self, event: UpgradeEvent) {
        self.observer.on_event(&event);
    }

    fn warn(&self, message: impl Into<String>) {
        self.emit(UpgradeEvent::Warning {
            message: message.into(),
        });
    }

    /// Run the upgrade on a connected session.
    ///
    /// `boot_log` must belong to the session's current connection. On return
    /// the session is connected to the new firmware if reconnecting worked,
    /// otherwise disconnected.
    #[instrument(skip_all, fields(image = %self.plan.image.display()))]
    pub fn run<T, P, C>(
        &self,
        session: &mut DeviceSession<T>,
        boot_log: &BootLog,
        programmer: &P,
        consent: &C,
    ) -> Result<UpgradeOutcome, UpgradeError>
    where
        T: Transport,
        P: FirmwareProgrammer,
        C: Consent + ?Sized,
    {
        self.emit(UpgradeEvent::Step(UpgradeStep::CheckProgrammer));
        programmer.check()?;

        self.emit(UpgradeEvent::Step(UpgradeStep::CheckImage));
        let image = check_image(&self.plan.image)?;
        info!(image = %image, "Firmware file accepted");

        let info = session.info().cloned().ok_or(UpgradeError::NotConnected)?;

        self.emit(UpgradeEvent::Step(UpgradeStep::Backup));
        let backup = if info.bootloader_mode {
            self.warn("Controller is already in bootloader mode, settings cannot be backed up");
            if !consent.proceed_without_backup(&info) {
                return Err(UpgradeError::ConsentDeclined);
            }
            self.emit(UpgradeEvent::BackupSkipped);
            None
        } else {
            let (path, saved) = settings::backup_settings(session, boot_log, &self.plan.backup_dir)?;
            self.emit(UpgradeEvent::BackupSaved {
                path: path.clone(),
                count: saved.len(),
            });
            Some(path)
        };

        self.emit(UpgradeEvent::Step(UpgradeStep::EnterBootloader));
        let port = match session.enter_bootloader() {
            Ok(info) => info.port,
            Err(ConnectError::Cancelled) => return Err(UpgradeError::Cancelled),
            Err(e) => return Err(UpgradeError::Bootloader(e)),
        };

        // The programmer needs the port to itself.
        session.disconnect();
        let cancel = session.cancel_token().clone();
        if !cancel.sleep(session.timings().flash_settle()) {
            return Err(UpgradeError::Cancelled);
        }

        self.emit(UpgradeEvent::Step(UpgradeStep::Flash));
        self.emit(UpgradeEvent::Flashing {
            port: port.clone(),
            image: image.path.clone(),
        });
        if let Err(e) = programmer.program(&port, &image.path) {
            return Ok(UpgradeOutcome::FlashFailed {
                reason: e.to_string(),
                backup,
            });
        }
        self.emit(UpgradeEvent::Flashed);

        self.emit(UpgradeEvent::Step(UpgradeStep::Restore));
        if !cancel.sleep(session.timings().reboot_settle()) {
            return Err(UpgradeError::Cancelled);
        }

        let connection = match session.connect() {
            Ok(conn) => conn,
            Err(ConnectError::Cancelled) => return Err(UpgradeError::Cancelled),
            Err(e) => {
                return Ok(self.not_restored(format!("Could not reconnect after upload: {e}"), backup));
            }
        };
        if connection.info.bootloader_mode {
            return Ok(self.not_restored("Controller still in bootloader mode after upload", backup));
        }
        self.emit(UpgradeEvent::Reconnected {
            port: connection.info.port.clone(),
            version: connection.info.firmware_version.to_string(),
        });

        let Some(backup) = backup else {
            return Ok(self.not_restored("No settings backup to restore", None));
        };
        match settings::restore_from_backup(session, &backup) {
            Ok(restored) => {
                self.emit(UpgradeEvent::Restored {
                    count: restored.len(),
                });
                Ok(UpgradeOutcome::FullyRestored { backup })
            }
            Err(e) => Ok(self.not_restored(format!("Failed to restore settings: {e}"), Some(backup))),
        }
    }

    fn not_restored(&self, reason: impl Into<String>, backup: Option<PathBuf>) -> UpgradeOutcome {
        let reason = reason.into();
        self.warn(reason.clone());
        UpgradeOutcome::FlashedNotRestored { reason, backup }
    }
}
