//! Boot dispatcher.
//!
//! On every power-on the dispatcher decides between chain-booting the
//! recorded default partition and entering setup mode. Chain-booting works
//! by writing the partition number into the firmware's `reboot_part` module
//! parameter and issuing an autoboot reboot.

use std::{
	io::{self, Write},
	path::Path,
	process::Command,
	sync::OnceLock,
};

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use nix::sys::reboot::{reboot, RebootMode};
use regex::Regex;

use crate::cli::Cmdline;
use crate::presetup;
use crate::server;
use crate::state;
use crate::utils;

const REBOOT_PART_PATHS: &[&str] = &[
	"/sys/module/bcm2708/parameters/reboot_part",
	"/sys/module/bcm2709/parameters/reboot_part",
];

fn boot_device_re() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| Regex::new(r"^/dev/mmcblk0p(\d+)$").expect("hardcoded regex"))
}

/// Extract the partition number out of an SD-card partition device string.
/// Accepts exactly `/dev/mmcblk0pN`.
pub fn partition_number(device: &str) -> Result<u32> {
	let captures = boot_device_re().captures(device).context(format!(
		"'{}' does not look like an SD card partition device",
		device
	))?;
	captures[1]
		.parse::<u32>()
		.context(format!("'{}' does not carry a partition number", device))
}

/// Validate and persist the next-boot target.
pub fn set_default_boot_partition(device: &str) -> Result<()> {
	info!("Setting boot partition to {}", device);
	partition_number(device)?;
	state::write_default_boot(device)
}

pub struct BootManager {
	webserver: bool,
}

impl BootManager {
	pub fn new(cmdline: &Cmdline) -> Self {
		BootManager {
			webserver: !cmdline.no_webserver,
		}
	}

	pub fn run(&self, cmdline: &Cmdline) -> Result<()> {
		utils::mount_settings_partition().context("Unable to mount settings partition")?;

		if let Some(device) = &cmdline.partition {
			info!("Found default partition in the arguments: {}", device);
			if let Err(e) = set_default_boot_partition(device) {
				error!("Unable to set the default boot partition: {:#}", e);
			}
		}

		if self.boot_check(cmdline) {
			match state::read_default_boot() {
				Ok(device) if partition_number(&device).is_ok() => {
					info!(
						"Booting into the OS recorded in {}; change it through setup mode or by editing the file on the settings partition",
						state::DEFAULT_BOOT_FILE
					);
					return self.boot_into_partition(Some(&device));
				}
				Ok(device) => {
					warn!(
						"Recorded default boot partition '{}' is not valid, entering setup mode",
						device
					);
				}
				Err(e) => {
					warn!("No usable default boot partition ({:#}), entering setup mode", e);
				}
			}
		}

		presetup::check_and_prepare_sd_card()
			.context("Unable to check and prepare the SD card")?;
		if let Err(e) = presetup::clear_cmdline() {
			error!(
				"Unable to remove 'runinstaller' from the kernel command line: {:#}",
				e
			);
		}
		presetup::start_networking()?;

		info!("Recovery mode started");
		if self.webserver {
			info!("Creating and starting the webserver ...");
			server::serve(80, self)
		} else {
			info!("'no-webserver' argument found, starting local mode ...");
			self.local_menu()
		}
	}

	/// Decide between booting a partition (true) and entering setup (false).
	fn boot_check(&self, cmdline: &Cmdline) -> bool {
		if cmdline.runinstaller {
			debug!("Runinstaller specified, entering setup mode");
			return false;
		}
		if !state::has_installed_os() {
			info!("No OS installation detected, entering setup mode");
			return false;
		}
		true
	}

	/// Chain-boot a partition. Does not return on success.
	pub fn boot_into_partition(&self, device: Option<&str>) -> Result<()> {
		let device = match device {
			Some(d) => d.to_string(),
			None => {
				debug!("Getting the current default boot partition");
				state::read_default_boot()?
			}
		};
		debug!("Trying to boot into partition device {}", device);
		let number = partition_number(&device)?;

		let reboot_part = REBOOT_PART_PATHS
			.iter()
			.find(|p| Path::new(p).exists())
			.context(
				"Unable to determine where to write the reboot partition (is this a supported board?)",
			)?;
		debug!("Setting reboot partition ({}) in {}", number, reboot_part);
		utils::put_file_contents(reboot_part, format!("{}\n", number).as_bytes())?;

		/* Shut down networking and release the filesystems */
		if let Err(e) = utils::cmd_run_check_status(Command::new("ifdown").arg("-a")) {
			warn!("{:#}", e);
		}
		if let Err(e) = utils::cmd_run_check_status(Command::new("umount").arg("-ar")) {
			warn!("{:#}", e);
		}
		utils::sync_all();

		reboot(RebootMode::RB_AUTOBOOT).context("Reboot syscall failed")?;
		unreachable!("reboot(2) does not return on success");
	}

	/// Minimal interactive fallback for consoles without network access.
	fn local_menu(&self) -> Result<()> {
		let stdin = io::stdin();
		loop {
			println!();
			println!("You have the following options to choose from:");
			println!("  1) Reboot to the default partition");
			println!("  2) Reboot into a specific partition");
			println!("  3) Set the default partition");
			println!("  4) Exit to the recovery shell");
			println!();
			print!("Enter a number: ");
			io::stdout().flush()?;

			let mut line = String::new();
			if stdin.read_line(&mut line)? == 0 {
				return Ok(());
			}
			match line.trim() {
				"1" => {
					if let Err(e) = self.boot_into_partition(None) {
						error!("{:#}", e);
					}
				}
				"2" => {
					let device = Self::prompt_device(&stdin)?;
					if let Err(e) = self.boot_into_partition(Some(&device)) {
						error!("{:#}", e);
					}
				}
				"3" => {
					let device = Self::prompt_device(&stdin)?;
					if let Err(e) = set_default_boot_partition(&device) {
						error!("{:#}", e);
					}
				}
				"4" => return Ok(()),
				_ => (),
			}
		}
	}

	fn prompt_device(stdin: &io::Stdin) -> Result<String> {
		println!("Please give the partition device (/dev/mmcblk0pX)");
		let mut line = String::new();
		stdin.read_line(&mut line)?;
		Ok(line.trim().to_string())
	}
}
