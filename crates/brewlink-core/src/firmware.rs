//! Firmware images and the external flash programmer.
//!
//! The core never writes flash itself. Once the board sits in its bootloader
//! an external `bossac`-compatible tool is run with the bootloader port and
//! the image path.

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::protocol::constants::MIN_IMAGE_SIZE;

// ============================================================================
// Default locations, relative to the executable
// ============================================================================

pub const DEFAULT_FIRMWARE_PATH: &str = "firmware.bin";
pub const DEFAULT_DEV_FIRMWARE_PATH: &str = "bin/firmware/firmware.bin";

#[cfg(windows)]
pub const DEFAULT_PROGRAMMER_PATH: &str = "bossac.exe";
#[cfg(windows)]
pub const DEFAULT_DEV_PROGRAMMER_PATH: &str = "bin/bossac/bossac.exe";

#[cfg(not(windows))]
pub const DEFAULT_PROGRAMMER_PATH: &str = "bossac";
#[cfg(not(windows))]
pub const DEFAULT_DEV_PROGRAMMER_PATH: &str = "bin/bossac/bossac";

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Firmware file not found: {0}")]
    NotFound(PathBuf),

    #[error("Firmware file {path} is only {size} bytes, expected at least {}", MIN_IMAGE_SIZE)]
    TooSmall { path: PathBuf, size: u64 },

    #[error("Cannot read firmware file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Error, Debug)]
pub enum ProgramError {
    #[error("Programmer not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Programmer exited with {}: {stderr}", exit_label(.code))]
    Failed { code: Option<i32>, stderr: String },
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("code {c}"),
        None => "a signal".to_string(),
    }
}

/// A firmware file that passed the size check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    pub path: PathBuf,
    pub size: u64,
}

impl fmt::Display for FirmwareImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.path.display(), self.size)
    }
}

/// Accept any existing file of at least 1 KiB. The contents are not inspected.
pub fn check_image(path: &Path) -> Result<FirmwareImage, ImageError> {
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ImageError::NotFound(path.to_path_buf()));
        }
        Err(source) => {
            return Err(ImageError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    if !meta.is_file() {
        return Err(ImageError::NotFound(path.to_path_buf()));
    }

    let size = meta.len();
    if size < MIN_IMAGE_SIZE {
        return Err(ImageError::TooSmall {
            path: path.to_path_buf(),
            size,
        });
    }
    Ok(FirmwareImage {
        path: path.to_path_buf(),
        size,
    })
}

/// Something that can write an image to a board waiting in its bootloader.
pub trait FirmwareProgrammer {
    /// Verify the programmer is available before anything destructive happens.
    fn check(&self) -> Result<(), ProgramError>;

    /// Flash `image` through `port`. Blocks until the tool exits.
    fn program(&self, port: &str, image: &Path) -> Result<(), ProgramError>;
}

/// Runs a `bossac` executable. Arguments are passed directly, without a shell.
#[derive(Debug, Clone)]
pub struct BossacProgrammer {
    path: PathBuf,
}

impl BossacProgrammer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `--info --port <port> --write --verify --reset --erase -U true <image>`
    pub fn args(port: &str, image: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["--info", "--port", port, "--write", "--verify", "--reset"]
            .iter()
            .map(OsString::from)
            .collect();
        args.extend(["--erase", "-U", "true"].iter().map(OsString::from));
        args.push(image.as_os_str().to_owned());
        args
    }
}

impl FirmwareProgrammer for BossacProgrammer {
    fn check(&self) -> Result<(), ProgramError> {
        if self.path.is_file() {
            Ok(())
        } else {
            Err(ProgramError::NotFound(self.path.clone()))
        }
    }

    #[instrument(skip(self), fields(programmer = %self.path.display()))]
    fn program(&self, port: &str, image: &Path) -> Result<(), ProgramError> {
        let args = Self::args(port, image);
        debug!(?args, "Running programmer");

        let output = Command::new(&self.path)
            .args(&args)
            .output()
            .map_err(|source| ProgramError::Launch {
                program: self.path.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            debug!(line = %line, "programmer");
        }

        if output.status.success() {
            info!("Programmer finished");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(status = %output.status, stderr = %stderr, "Programmer failed");
            Err(ProgramError::Failed {
                code: output.status.code(),
                stderr,
            })
        }
    }
}

type Hook = Box<dyn Fn() + Send + Sync>;

/// Programmer double for orchestrator tests.
#[derive(Default)]
pub struct MockProgrammer {
    calls: Arc<Mutex<Vec<(String, PathBuf)>>>,
    failure: Option<String>,
    missing: bool,
    on_program: Option<Hook>,
}

impl MockProgrammer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every run fails with `stderr`.
    pub fn failing(stderr: impl Into<String>) -> Self {
        Self {
            failure: Some(stderr.into()),
            ..Self::default()
        }
    }

    /// `check` reports the programmer as missing.
    pub fn missing() -> Self {
        Self {
            missing: true,
            ..Self::default()
        }
    }

    /// Run `hook` whenever the programmer runs, e.g. to simulate the board
    /// rebooting into new firmware.
    pub fn with_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_program = Some(Box::new(hook));
        self
    }

    /// `(port, image)` of every run.
    pub fn calls(&self) -> Vec<(String, PathBuf)> {
        self.calls.lock().unwrap().clone()
    }
}

impl FirmwareProgrammer for MockProgrammer {
    fn check(&self) -> Result<(), ProgramError> {
        if self.missing {
            Err(ProgramError::NotFound(PathBuf::from(DEFAULT_PROGRAMMER_PATH)))
        } else {
            Ok(())
        }
    }

    fn program(&self, port: &str, image: &Path) -> Result<(), ProgramError> {
        self.calls
            .lock()
            .unwrap()
            .push((port.to_string(), image.to_path_buf()));
        if let Some(hook) = &self.on_program {
            hook();
        }
        match &self.failure {
            Some(stderr) => Err(ProgramError::Failed {
                code: Some(1),
                stderr: stderr.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Directory holding the running executable.
pub fn executable_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()?
        .parent()
        .map(Path::to_path_buf)
}

/// The development layout path if it exists, then the production one. Falls
/// back to the development path so error messages name a concrete location.
pub fn locate(dir: &Path, dev: &str, prod: &str) -> PathBuf {
    let dev_path = dir.join(dev);
    if dev_path.exists() {
        return dev_path;
    }
    let prod_path = dir.join(prod);
    if prod_path.exists() {
        return prod_path;
    }
    dev_path
}

pub fn default_firmware_path() -> PathBuf {
    let dir = executable_dir().unwrap_or_default();
    locate(&dir, DEFAULT_DEV_FIRMWARE_PATH, DEFAULT_FIRMWARE_PATH)
}

pub fn default_programmer_path() -> PathBuf {
    let dir = executable_dir().unwrap_or_default();
    locate(&dir, DEFAULT_DEV_PROGRAMMER_PATH, DEFAULT_PROGRAMMER_PATH)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(dir: &Path, name: &str, size: usize) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, vec![0xA5u8; size]).unwrap();
        path
    }

    #[test]
    fn test_check_image_size_floor() {
        let dir = tempfile::tempdir().unwrap();

        let small = write_file(dir.path(), "small.bin", 1023);
        assert!(matches!(
            check_image(&small),
            Err(ImageError::TooSmall { size: 1023, .. })
        ));

        let ok = write_file(dir.path(), "ok.bin", 1024);
        assert_eq!(check_image(&ok).unwrap().size, 1024);
    }

    #[test]
    fn test_check_image_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            check_image(&dir.path().join("nope.bin")),
            Err(ImageError::NotFound(_))
        ));
        assert!(matches!(
            check_image(dir.path()),
            Err(ImageError::NotFound(_))
        ));
    }

    #[test]
    fn test_bossac_args() {
        let args = BossacProgrammer::args("/dev/cu.usbmodem1101", Path::new("fw.bin"));
        let args: Vec<&str> = args.iter().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(
            args,
            [
                "--info",
                "--port",
                "/dev/cu.usbmodem1101",
                "--write",
                "--verify",
                "--reset",
                "--erase",
                "-U",
                "true",
                "fw.bin"
            ]
        );
    }

    #[test]
    fn test_bossac_missing_executable() {
        let dir = tempfile::tempdir().unwrap();
        let programmer = BossacProgrammer::new(dir.path().join("bossac"));

        assert!(matches!(programmer.check(), Err(ProgramError::NotFound(_))));
        assert!(matches!(
            programmer.program("COM3", Path::new("fw.bin")),
            Err(ProgramError::Launch { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_bossac_non_zero_exit() {
        let programmer = BossacProgrammer::new("false");
        assert!(matches!(
            programmer.program("/dev/ttyACM1", Path::new("fw.bin")),
            Err(ProgramError::Failed { code: Some(1), .. })
        ));
    }

    #[test]
    fn test_locate_prefers_dev_layout() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            locate(dir.path(), "bin/firmware/firmware.bin", "firmware.bin"),
            dir.path().join("bin/firmware/firmware.bin")
        );

        write_file(dir.path(), "firmware.bin", 1);
        assert_eq!(
            locate(dir.path(), "bin/firmware/firmware.bin", "firmware.bin"),
            dir.path().join("firmware.bin")
        );

        std::fs::create_dir_all(dir.path().join("bin/firmware")).unwrap();
        write_file(dir.path(), "bin/firmware/firmware.bin", 1);
        assert_eq!(
            locate(dir.path(), "bin/firmware/firmware.bin", "firmware.bin"),
            dir.path().join("bin/firmware/firmware.bin")
        );
    }

    #[test]
    fn test_mock_programmer_records_calls() {
        let programmer = MockProgrammer::failing("no device");
        let err = programmer.program("COM4", Path::new("fw.bin")).unwrap_err();
        assert!(err.to_string().contains("no device"));
        assert_eq!(
            programmer.calls(),
            vec![("COM4".to_string(), PathBuf::from("fw.bin"))]
        );
    }
}
