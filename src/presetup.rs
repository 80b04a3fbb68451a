//! One-time SD-card preparation.
//!
//! On the very first setup boot the card only carries the recovery FAT
//! partition. It is shrunk to its content plus some headroom, an extended
//! partition is created across the remaining space, and a small settings
//! partition is carved out of it. This runs at most once per card.

use std::{
	fs::File,
	io::{Seek, SeekFrom, Write},
	os::fd::AsRawFd,
	path::Path,
	process::Command,
	thread,
	time::Duration,
};

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use nix::{ifaddrs::getifaddrs, net::if_::InterfaceFlags};
use walkdir::WalkDir;

use crate::planner::{PARTITION_ALIGNMENT, PARTITION_GAP};
use crate::utils;

/// 32 MiB settings partition, minus the gap before it.
const SETTINGS_PARTITION_SIZE: u64 = 32 * 2048 - PARTITION_GAP;
/// Headroom added on top of the recovery content, in MB.
const RECOVERY_HEADROOM_MB: u64 = 100;

const BLKRRPART: libc::c_ulong = 0x125f;

/// Check whether the card still needs its one-time preparation, and perform
/// it if so.
pub fn check_and_prepare_sd_card() -> Result<()> {
	info!("Waiting for the SD card to be ready");
	while !Path::new(utils::SD_DEVICE).exists() {
		thread::sleep(Duration::from_millis(100));
	}

	info!("Checking if this SD card has already been formatted");
	if Path::new("/dev/mmcblk0p2").exists() || Path::new(utils::SETTINGS_PARTITION).exists() {
		debug!("The SD card has already been formatted");
		return Ok(());
	}
	info!("Preparing the SD card ...");

	debug!("Mounting systems partition");
	utils::mount_systems_partition().context("Unable to mount systems partition")?;

	resize_partitions().context("Unable to resize existing partitions")?;

	debug!("Formatting settings partition");
	utils::cmd_run_check_status(Command::new("/usr/sbin/mkfs.ext4").args([
		"-L",
		"SETTINGS",
		utils::SETTINGS_PARTITION,
	]))
	.context("Error formatting settings partition")?;

	debug!("Unmounting systems partition");
	utils::unmount_systems_partition()?;
	debug!("Finish writing to disk (sync)");
	utils::sync_all();

	/* Quick test that our changes actually hit the card. Drop the page
	 * cache so the re-read does not come out of memory. */
	debug!("Verifying the changes ...");
	utils::put_file_contents("/proc/sys/vm/drop_caches", b"3\n")?;

	debug!("Mounting recovery partition again");
	utils::mount_systems_partition().context("Unable to mount systems partition")?;
	utils::unmount_systems_partition()?;
	info!("Successfully repartitioned the SD card");
	Ok(())
}

/// Content of the recovery partition, in KiB.
fn recovery_content_kb() -> u64 {
	let mut bytes: u64 = 0;
	for entry in WalkDir::new(utils::SYSTEMS_DIR) {
		match entry {
			Ok(e) => {
				if e.file_type().is_file() {
					bytes += e.metadata().map(|m| m.len()).unwrap_or(0);
				}
			}
			Err(e) => debug!("Skipping unreadable entry: {}", e),
		}
	}
	bytes / 1024
}

fn resize_partitions() -> Result<()> {
	let mut new_start = utils::block_sysfs_u64("mmcblk0p1", "start")?;
	let new_size_mb = recovery_content_kb() * 1024 / 1_000_000 + RECOVERY_HEADROOM_MB;

	utils::unmount_systems_partition().context("Error unmounting systems partition")?;

	if !Path::new(utils::SYSTEMS_PARTITION).exists() {
		bail!("No MBR present on the SD card");
	}

	debug!("Removing partitions 2, 3 and 4");
	{
		let mut fd = File::options()
			.read(true)
			.write(true)
			.open(utils::SD_DEVICE)?;
		/* Zero the three partition entries so parted does not complain
		 * about invalid constraints */
		fd.seek(SeekFrom::Start(462))?;
		fd.write_all(&[0u8; 16 * 3])?;
		fd.flush()?;
		/* Tell the kernel to re-read the partition table */
		let result = unsafe { libc::ioctl(fd.as_raw_fd(), BLKRRPART) };
		if result != 0 {
			warn!("BLKRRPART ioctl returned {}", result);
		}
	}
	thread::sleep(Duration::from_millis(500));

	debug!("Resizing FAT partition");
	/* Relocating the start of the FAT partition is write intensive, only
	 * move it when it is not MiB aligned already */
	if new_start < 2048 || new_start % 2048 != 0 {
		new_start = PARTITION_ALIGNMENT;
	}

	let mut parted = Command::new("/usr/sbin/parted");
	parted
		.args(["--script", utils::SD_DEVICE, "resize", "1"])
		.arg(format!("{}s", new_start))
		.arg(format!("{}M", new_size_mb))
		/* parted's big fat warning about its filesystem manipulation code
		 * distracts from any real error that may follow it */
		.env("PARTED_SUPPRESS_FILE_SYSTEM_MANIPULATION_WARNING", "1");
	utils::cmd_run_check_status(&mut parted)
		.context("Error resizing the existing FAT partition")?;
	thread::sleep(Duration::from_millis(500));

	info!("Creating extended partition");
	let start_recovery = utils::block_sysfs_u64("mmcblk0p1", "start")?;
	let size_recovery = utils::block_sysfs_u64("mmcblk0p1", "size")?;
	let start_extended = start_recovery + size_recovery;

	/* Align the start of the settings partition on a 4 MiB boundary */
	let mut start_settings = start_extended + PARTITION_GAP;
	if start_settings % PARTITION_ALIGNMENT != 0 {
		start_settings += PARTITION_ALIGNMENT - (start_settings % PARTITION_ALIGNMENT);
	}

	let table = initial_partition_table(start_recovery, size_recovery, start_settings);
	debug!("Writing partition table:\n{}", table);

	let output = utils::run_with_input(
		Command::new("/sbin/sfdisk").args(["-uS", utils::SD_DEVICE]),
		table.as_bytes(),
	)?;
	if !output.status.success() {
		bail!(
			"Error creating extended partition: {}",
			utils::output_tail(&output)
		);
	}
	debug!("sfdisk done, output: {}", utils::output_tail(&output));
	thread::sleep(Duration::from_millis(500));

	/* For reasons unknown Linux sometimes only finds /dev/mmcblk0p2 while
	 * /dev/mmcblk0p1 goes missing */
	if !Path::new(utils::SYSTEMS_PARTITION).exists() {
		if let Err(e) = utils::cmd_run_check_status(&mut Command::new("/usr/sbin/partprobe"))
		{
			warn!("{:#}", e);
		}
		thread::sleep(Duration::from_millis(500));
	}

	if let Err(e) =
		utils::cmd_run_check_status(Command::new("/sbin/mlabel").arg("p:RECOVERY"))
	{
		warn!("Unable to relabel the recovery partition: {:#}", e);
	}

	debug!("Mounting systems partition");
	utils::mount_systems_partition().context("Unable to mount systems partition")?;
	Ok(())
}

/// The first-boot sfdisk script: recovery FAT, extended container across the
/// remaining space, and the settings partition as the first logical.
fn initial_partition_table(
	start_recovery: u64,
	size_recovery: u64,
	start_settings: u64,
) -> String {
	let mut table = String::new();
	table += &format!("{},{},0E\n", start_recovery, size_recovery);
	table += &format!("{},,E\n", start_recovery + size_recovery);
	table += "0,0\n";
	table += "0,0\n";
	table += &format!("{},{},L\n", start_settings, SETTINGS_PARTITION_SIZE);
	table
}

/// Strip `runinstaller` out of the recovery kernel command line so the next
/// boot is a normal one, then verify the card actually persisted the write.
pub fn clear_cmdline() -> Result<()> {
	utils::mount_systems_partition()?;
	debug!("Editing cmdline.txt");

	let mut path = format!("{}/recovery.cmdline", utils::SYSTEMS_DIR);
	if !Path::new(&path).exists() {
		path = format!("{}/cmdline.txt", utils::SYSTEMS_DIR);
	}

	let line = utils::get_file_contents(&path)?;
	let line = strip_runinstaller(&line);
	utils::put_file_contents(&path, line.as_bytes())?;

	let written = utils::get_file_contents(&path)?;
	if written != line {
		bail!("SD card broken (writes do not persist)");
	}
	Ok(())
}

pub fn strip_runinstaller(cmdline: &str) -> String {
	cmdline.trim().replace("runinstaller", "").trim().to_string()
}

/// Bring up networking and block until a non-loopback address appears.
pub fn start_networking() -> Result<()> {
	info!("Starting network");

	/* dbus first, wpa_supplicant is talked to over it later */
	debug!("Starting dbus");
	if let Err(e) =
		utils::cmd_run_check_status(Command::new("/etc/init.d/S30dbus").arg("start"))
	{
		warn!("{:#}", e);
	}

	debug!("Starting dhcpcd");
	let child = Command::new("/sbin/dhcpcd")
		.args([
			"--noarp",
			"-e",
			"wpa_supplicant_conf=/settings/wpa_supplicant.conf",
			"--denyinterfaces",
			"*_ap",
		])
		.spawn()
		.context("Unable to start dhcpcd")?;
	debug!("dhcpcd running as pid {}", child.id());

	while !is_online() {
		info!("Waiting for network ...");
		thread::sleep(Duration::from_secs(5));
	}
	Ok(())
}

/// Whether any interface besides loopback carries an address.
fn is_online() -> bool {
	let addrs = match getifaddrs() {
		Ok(a) => a,
		Err(_) => return false,
	};
	for ifaddr in addrs {
		if ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK) {
			continue;
		}
		if let Some(address) = ifaddr.address {
			if address.as_sockaddr_in().is_some() || address.as_sockaddr_in6().is_some() {
				return true;
			}
		}
	}
	false
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_strip_runinstaller() {
		assert_eq!(
			strip_runinstaller("console=tty1 runinstaller quiet\n"),
			"console=tty1  quiet"
		);
		assert_eq!(strip_runinstaller("runinstaller"), "");
		assert_eq!(strip_runinstaller("console=tty1\n"), "console=tty1");
	}

	#[test]
	fn test_initial_partition_table_layout() {
		let table = initial_partition_table(8192, 131072, 139266 + 2046);
		let lines: Vec<&str> = table.lines().collect();
		assert_eq!(lines.len(), 5);
		assert_eq!(lines[0], "8192,131072,0E");
		assert_eq!(lines[1], "139264,,E");
		assert_eq!(lines[2], "0,0");
		assert_eq!(lines[3], "0,0");
		assert_eq!(lines[4], format!("141312,{},L", 32 * 2048 - 2));
	}
}
