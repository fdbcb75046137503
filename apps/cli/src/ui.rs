//! Console rendering for the CLI: colored status lines, prompts and the
//! upgrade progress observer.

use brewlink_core::{UpgradeEvent, UpgradeObserver, UpgradeStep};
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};

pub fn success(message: impl AsRef<str>) {
    println!("{} {}", style("✓").green(), message.as_ref());
}

pub fn warning(message: impl AsRef<str>) {
    println!("{} {}", style("!").yellow(), style(message.as_ref()).yellow());
}

pub fn failure(message: impl AsRef<str>) {
    println!("{} {}", style("✗").red(), style(message.as_ref()).red());
}

/// Ask a yes/no question, defaulting to no. A prompt that cannot be shown
/// (no terminal) counts as a no.
pub fn confirm(prompt: &str) -> bool {
    Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()
        .unwrap_or(false)
}

/// Old firmware only prints its settings right after power-up.
pub fn power_cycle_hint() {
    warning("The controller did not print its settings on connect.");
    println!("Disconnect the USB cable, restart the machine, reconnect and run the command again.");
}

pub fn restore_hint(backup: &std::path::Path) {
    println!(
        "Restore the saved settings with: {}",
        style(format!(
            "brewlink restore-settings --settings-file {}",
            backup.display()
        ))
        .cyan()
    );
}

/// Prints upgrade progress as numbered steps.
pub struct ConsoleObserver;

impl UpgradeObserver for ConsoleObserver {
    fn on_event(&self, event: &UpgradeEvent) {
        match event {
            UpgradeEvent::Step(step) => {
                println!(
                    "{} {}...",
                    style(format!("Step {}/{}:", step.number(), UpgradeStep::COUNT)).bold(),
                    step
                );
            }
            UpgradeEvent::BackupSaved { path, count } => {
                success(format!("Saved {} settings to {}", count, path.display()));
            }
            UpgradeEvent::BackupSkipped => {
                warning("Settings will not be backed up or restored");
            }
            UpgradeEvent::Flashing { port, image } => {
                println!(
                    "  Writing {} via {}",
                    style(image.display()).cyan(),
                    style(port).cyan()
                );
            }
            UpgradeEvent::Flashed => success("Firmware written"),
            UpgradeEvent::Reconnected { port, version } => {
                success(format!("Controller back on {} running {}", port, version));
            }
            UpgradeEvent::Restored { count } => {
                success(format!("Restored {} settings", count));
            }
            UpgradeEvent::Warning { message } => warning(message),
        }
    }
}
