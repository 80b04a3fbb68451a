//! Durable installer state on the settings partition.
//!
//! Two files survive an install: `installed_os.json`, the ordered record of
//! what was written to the card, and `default_boot_partition`, a single
//! device string naming the next-boot target. The user-editable `noobs.conf`
//! provides display and locale preferences for the installed systems.

use std::{fs, path::Path};

use anyhow::{bail, Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::utils;

pub const INSTALLED_OS_FILE: &str = "/settings/installed_os.json";
pub const DEFAULT_BOOT_FILE: &str = "/settings/default_boot_partition";
pub const SETTINGS_CONF_FILE: &str = "/settings/noobs.conf";

/// One entry of `installed_os.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledOs {
	pub name: String,
	pub description: String,
	pub folder: String,
	pub release_date: String,
	pub partitions: Vec<String>,
	pub bootable: bool,
}

pub fn load_installed_from<P: AsRef<Path>>(path: P) -> Result<Vec<InstalledOs>> {
	let path = path.as_ref();
	let raw = fs::read_to_string(path)
		.context(format!("Unable to read {}", path.display()))?;
	serde_json::from_str(&raw).context(format!("Unable to parse {}", path.display()))
}

pub fn save_installed_to<P: AsRef<Path>>(path: P, entries: &[InstalledOs]) -> Result<()> {
	let body = serde_json::to_string_pretty(entries)?;
	utils::put_file_contents(path, body.as_bytes())
}

pub fn save_installed(entries: &[InstalledOs]) -> Result<()> {
	save_installed_to(INSTALLED_OS_FILE, entries)
		.context("Unable to save installed_os.json")
}

pub fn has_installed_os() -> bool {
	match load_installed_from(INSTALLED_OS_FILE) {
		Ok(list) => !list.is_empty(),
		Err(e) => {
			debug!("No usable installed_os.json: {:#}", e);
			false
		}
	}
}

pub fn read_default_boot_from<P: AsRef<Path>>(path: P) -> Result<String> {
	let contents = utils::get_file_contents(path)?;
	let device = contents.trim().to_string();
	if device.is_empty() {
		bail!("Default boot partition file is empty");
	}
	Ok(device)
}

pub fn read_default_boot() -> Result<String> {
	read_default_boot_from(DEFAULT_BOOT_FILE)
}

/// Replace the default-boot file. Consumers must tolerate the brief absence
/// between the delete and the write.
pub fn write_default_boot_to<P: AsRef<Path>>(path: P, device: &str) -> Result<()> {
	let path = path.as_ref();
	if path.exists() {
		debug!("Removing existing default partition information");
		fs::remove_file(path)?;
	}
	utils::put_file_contents(path, device.as_bytes())
}

pub fn write_default_boot(device: &str) -> Result<()> {
	write_default_boot_to(DEFAULT_BOOT_FILE, device)
		.context("Unable to set the default boot partition")
}

/// Display and locale preferences from `noobs.conf`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisplaySettings {
	pub display_mode: u32,
	pub language: String,
	pub keyboard_layout: String,
}

impl Default for DisplaySettings {
	fn default() -> Self {
		DisplaySettings {
			display_mode: 0,
			language: "en".to_string(),
			keyboard_layout: "gb".to_string(),
		}
	}
}

/// Parse the three known keys out of the INI text. Section headers and
/// unknown keys are ignored.
fn parse_settings(text: &str) -> DisplaySettings {
	let mut settings = DisplaySettings::default();
	for line in text.lines() {
		let line = line.trim();
		if line.is_empty() || line.starts_with('[') || line.starts_with(';') || line.starts_with('#') {
			continue;
		}
		let Some((key, value)) = line.split_once('=') else {
			continue;
		};
		let (key, value) = (key.trim(), value.trim());
		match key {
			"display_mode" => {
				if let Ok(mode) = value.parse::<u32>() {
					settings.display_mode = mode;
				} else {
					warn!("Ignoring unparsable display_mode '{}'", value);
				}
			}
			"language" => settings.language = value.to_string(),
			"keyboard_layout" => settings.keyboard_layout = value.to_string(),
			_ => (),
		}
	}
	settings
}

pub fn read_display_settings_from<P: AsRef<Path>>(path: P) -> DisplaySettings {
	match fs::read_to_string(path.as_ref()) {
		Ok(text) => parse_settings(&text),
		Err(_) => {
			debug!(
				"No settings file at {}, using defaults",
				path.as_ref().display()
			);
			DisplaySettings::default()
		}
	}
}

pub fn read_display_settings() -> DisplaySettings {
	read_display_settings_from(SETTINGS_CONF_FILE)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn entry(n: u32) -> InstalledOs {
		InstalledOs {
			name: format!("OS {}", n),
			description: "A test system".to_string(),
			folder: format!("OS_{}", n),
			release_date: "2016-09-23".to_string(),
			partitions: vec![format!("/dev/mmcblk0p{}", n + 5)],
			bootable: true,
		}
	}

	#[test]
	fn test_installed_os_round_trip() -> Result<()> {
		let dir = tempfile::tempdir()?;
		let path = dir.path().join("installed_os.json");
		let entries = vec![entry(1), entry(2), entry(3)];
		save_installed_to(&path, &entries)?;
		let loaded = load_installed_from(&path)?;
		assert_eq!(loaded, entries);
		Ok(())
	}

	#[test]
	fn test_default_boot_round_trip() -> Result<()> {
		let dir = tempfile::tempdir()?;
		let path = dir.path().join("default_boot_partition");
		write_default_boot_to(&path, "/dev/mmcblk0p6")?;
		assert_eq!(read_default_boot_from(&path)?, "/dev/mmcblk0p6");
		// A second write replaces the first.
		write_default_boot_to(&path, "/dev/mmcblk0p7")?;
		assert_eq!(read_default_boot_from(&path)?, "/dev/mmcblk0p7");
		Ok(())
	}

	#[test]
	fn test_missing_default_boot_is_an_error() {
		let dir = tempfile::tempdir().unwrap();
		assert!(read_default_boot_from(dir.path().join("nope")).is_err());
	}

	#[test]
	fn test_settings_parse() {
		let settings = parse_settings(
			"[General]\ndisplay_mode=2\nlanguage=de\nkeyboard_layout=dvorak\n",
		);
		assert_eq!(settings.display_mode, 2);
		assert_eq!(settings.language, "de");
		assert_eq!(settings.keyboard_layout, "dvorak");
	}

	#[test]
	fn test_settings_defaults() {
		let settings = parse_settings("[General]\nunrelated=1\n");
		assert_eq!(settings, DisplaySettings::default());
		assert_eq!(settings.display_mode, 0);
		assert_eq!(settings.language, "en");
		assert_eq!(settings.keyboard_layout, "gb");
	}

	#[test]
	fn test_settings_bad_display_mode_ignored() {
		let settings = parse_settings("display_mode=preferred\n");
		assert_eq!(settings.display_mode, 0);
	}
}
