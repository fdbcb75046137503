use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use brewlink_core::firmware::{default_firmware_path, default_programmer_path};
use brewlink_core::settings;
use brewlink_core::{
    BossacProgrammer, CancelToken, Connection, DeviceInfo, DeviceSession, FirmwareUpgrade,
    SerialTransport, Settings, SettingsError, ToolConfig, Transport, UpgradeError, UpgradeOutcome,
    UpgradePlan,
};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

mod ui;

/// Exit code after Ctrl+C.
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser, Debug)]
#[command(author, version, about = "Espresso machine controller support tool", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to a TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show port, USB ids, mode and firmware version of the controller
    Info {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the serial port the controller is attached to
    Port,
    /// Reset the controller into its bootloader
    Bootloader {
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Print everything the controller sends until Ctrl+C
    Monitor,
    /// Read the controller settings as JSON
    GetSettings {
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Write settings from a JSON backup to the controller
    RestoreSettings {
        /// Backup file created by get-settings or upload-firmware
        #[arg(short = 'f', long)]
        settings_file: PathBuf,
    },
    /// Back up settings, flash new firmware and restore the settings
    UploadFirmware {
        /// Firmware image
        #[arg(short = 'b', long)]
        binary_file: Option<PathBuf>,

        /// Programmer executable
        #[arg(long)]
        bossac_file: Option<PathBuf>,

        /// Directory for the settings backup
        #[arg(long)]
        backup_dir: Option<PathBuf>,

        /// Continue without a backup if the controller is in bootloader mode
        #[arg(short, long)]
        yes: bool,
    },
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_token.cancel()) {
        warn!("Could not install Ctrl+C handler: {}", e);
    }

    let result = run(args, cancel.clone());
    if cancel.is_cancelled() {
        ui::warning("Interrupted");
        process::exit(EXIT_INTERRUPTED);
    }
    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!("Error: {:#}", e);
            process::exit(1);
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<ToolConfig> {
    match path {
        Some(path) => ToolConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(ToolConfig::default()),
    }
}

fn run(args: Args, cancel: CancelToken) -> Result<i32> {
    let config = load_config(args.config.as_deref())?;
    let mut session = DeviceSession::serial(&config, cancel);

    match args.command {
        Command::Info { json } => show_info(&mut session, json),
        Command::Port => show_port(&session),
        Command::Bootloader { yes } => enter_bootloader(&mut session, yes),
        Command::Monitor => monitor(&mut session),
        Command::GetSettings { output } => get_settings(&mut session, output.as_deref()),
        Command::RestoreSettings { settings_file } => restore_settings(&mut session, &settings_file),
        Command::UploadFirmware {
            binary_file,
            bossac_file,
            backup_dir,
            yes,
        } => {
            let image = binary_file
                .or_else(|| config.firmware_path.clone())
                .unwrap_or_else(default_firmware_path);
            let bossac = bossac_file
                .or_else(|| config.programmer_path.clone())
                .unwrap_or_else(default_programmer_path);
            let plan = UpgradePlan {
                image,
                backup_dir: backup_dir.unwrap_or_else(|| config.backup_dir.clone()),
            };
            upload_firmware(&mut session, plan, &BossacProgrammer::new(bossac), yes)
        }
    }
}

fn connect(session: &mut DeviceSession<SerialTransport>) -> Result<Connection> {
    info!("Looking for controller...");
    let connection = session.wait_for_device().context("No controller connected")?;
    info!(port = %connection.info.port, mode = %connection.info.mode(), "Connected");
    Ok(connection)
}

/// Settings commands need the application firmware.
fn require_application(info: &DeviceInfo) -> Result<()> {
    if info.bootloader_mode {
        bail!(
            "Controller on {} is in bootloader mode. Upload firmware or power-cycle it first",
            info.port
        );
    }
    Ok(())
}

fn show_info(session: &mut DeviceSession<SerialTransport>, json: bool) -> Result<i32> {
    let info = connect(session)?.info;
    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("Port:     {}", info.port);
        println!("USB id:   {:04x}:{:04x}", info.vendor_id, info.product_id);
        println!("Mode:     {}", info.mode());
        println!("Firmware: {}", info.firmware_version);
    }
    Ok(0)
}

fn show_port(session: &DeviceSession<SerialTransport>) -> Result<i32> {
    match session.transport().discover() {
        Some(found) => {
            println!("{} ({})", found.port, found.identity.mode);
            Ok(0)
        }
        None => {
            ui::failure("No controller found");
            Ok(1)
        }
    }
}

fn enter_bootloader(session: &mut DeviceSession<SerialTransport>, yes: bool) -> Result<i32> {
    let info = connect(session)?.info;
    if info.bootloader_mode {
        ui::success(format!("Controller already in bootloader mode on {}", info.port));
        return Ok(0);
    }
    if !yes && !ui::confirm("The controller will stop running its firmware until it is flashed. Continue?") {
        ui::warning("Cancelled");
        return Ok(1);
    }

    let info = session.enter_bootloader()?;
    ui::success(format!("Bootloader ready on {}", info.port));
    Ok(0)
}

fn monitor(session: &mut DeviceSession<SerialTransport>) -> Result<i32> {
    let info = session.attach().context("No controller connected")?;
    ui::success(format!(
        "Monitoring {} in {} mode (Ctrl+C to stop)",
        info.port,
        info.mode()
    ));
    session.monitor(|line| println!("{line}"))?;
    Ok(0)
}

fn get_settings(session: &mut DeviceSession<SerialTransport>, output: Option<&Path>) -> Result<i32> {
    let connection = connect(session)?;
    require_application(&connection.info)?;

    let values = match settings::read_settings(session, &connection.boot_log) {
        Ok(values) => values,
        Err(SettingsError::NeedsPowerCycle) => {
            ui::power_cycle_hint();
            return Ok(0);
        }
        Err(e) => return Err(e.into()),
    };

    match output {
        Some(path) => {
            settings::persist(&values, path)?;
            ui::success(format!("Saved {} settings to {}", values.len(), path.display()));
        }
        None => print!("{}", settings::to_json(&values)?),
    }
    Ok(settings_exit_code(&values))
}

/// Settings are printed or saved either way; too few of them still fail the run.
fn settings_exit_code(values: &Settings) -> i32 {
    match settings::ensure_valid(values) {
        Ok(()) => 0,
        Err(e) => {
            ui::failure(e.to_string());
            1
        }
    }
}

fn restore_settings(session: &mut DeviceSession<SerialTransport>, path: &Path) -> Result<i32> {
    let connection = connect(session)?;
    require_application(&connection.info)?;

    let restored = settings::restore_from_backup(session, path)
        .with_context(|| format!("Failed to restore {}", path.display()))?;
    ui::success(format!("Restored {} settings", restored.len()));
    Ok(0)
}

fn upload_firmware(
    session: &mut DeviceSession<SerialTransport>,
    plan: UpgradePlan,
    programmer: &BossacProgrammer,
    yes: bool,
) -> Result<i32> {
    let connection = connect(session)?;
    let upgrade = FirmwareUpgrade::with_observer(plan, Arc::new(ui::ConsoleObserver));
    let consent = |info: &DeviceInfo| {
        yes || ui::confirm(&format!(
            "Controller on {} is in bootloader mode, settings cannot be saved. Upload anyway?",
            info.port
        ))
    };

    let outcome = match upgrade.run(session, &connection.boot_log, programmer, &consent) {
        Ok(outcome) => outcome,
        Err(UpgradeError::ConsentDeclined) => {
            ui::warning("Firmware upload cancelled");
            return Ok(1);
        }
        Err(e) => return Err(e.into()),
    };

    match outcome {
        UpgradeOutcome::FullyRestored { .. } => {
            ui::success("Firmware upload completed successfully and device settings restored!");
            Ok(0)
        }
        UpgradeOutcome::FlashedNotRestored { reason, backup } => {
            ui::warning(format!("Firmware upload completed but device settings NOT restored: {reason}"));
            if let Some(backup) = backup {
                ui::restore_hint(&backup);
            }
            Ok(0)
        }
        UpgradeOutcome::FlashFailed { reason, backup } => {
            ui::failure(format!("Firmware upload failed: {reason}"));
            if let Some(backup) = backup {
                ui::restore_hint(&backup);
            }
            Ok(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_upload_firmware() {
        let args = Args::try_parse_from([
            "brewlink",
            "upload-firmware",
            "-b",
            "fw.bin",
            "--bossac-file",
            "tools/bossac",
            "--yes",
            "-v",
        ])
        .unwrap();

        assert!(args.verbose);
        match args.command {
            Command::UploadFirmware {
                binary_file,
                bossac_file,
                backup_dir,
                yes,
            } => {
                assert_eq!(binary_file, Some(PathBuf::from("fw.bin")));
                assert_eq!(bossac_file, Some(PathBuf::from("tools/bossac")));
                assert_eq!(backup_dir, None);
                assert!(yes);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_restore_requires_settings_file() {
        assert!(Args::try_parse_from(["brewlink", "restore-settings"]).is_err());

        let args =
            Args::try_parse_from(["brewlink", "restore-settings", "-f", "settings.json"]).unwrap();
        assert!(matches!(
            args.command,
            Command::RestoreSettings { settings_file } if settings_file == Path::new("settings.json")
        ));
    }

    #[test]
    fn test_settings_exit_code() {
        let mut values: Settings = (0..12)
            .map(|i| (format!("key{i}"), i.to_string()))
            .collect();
        assert_eq!(settings_exit_code(&values), 0);

        values.remove("key0");
        assert_eq!(settings_exit_code(&values), 1);
    }

    #[test]
    fn test_require_application_rejects_bootloader() {
        let port = brewlink_core::DiscoveredPort::new(
            "/dev/ttyACM1",
            brewlink_core::DeviceIdentity::bootloader(),
        );
        let info = DeviceInfo::new(&port, brewlink_core::FirmwareVersion::Bootloader);
        assert!(require_application(&info).is_err());
    }
}
