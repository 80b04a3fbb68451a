//! Running an OS's partition-setup script after its images are written.

use std::{io::Write, process::Command};

use anyhow::{bail, Context, Result};
use log::{debug, info};
use tempfile::NamedTempFile;

use crate::manifest::OsManifest;
use crate::utils;

fn blkid_value(tag: &str, device: &str) -> String {
	let output = Command::new("/sbin/blkid")
		.args(["-s", tag, "-o", "value", device])
		.output();
	match output {
		Ok(out) if out.status.success() => {
			String::from_utf8_lossy(&out.stdout).trim().to_string()
		}
		_ => String::new(),
	}
}

pub fn get_label(device: &str) -> String {
	blkid_value("LABEL", device)
}

pub fn get_uuid(device: &str) -> String {
	blkid_value("UUID", device)
}

/// The identifier handed to the setup script: the filesystem label when one
/// exists, the UUID otherwise.
pub fn partition_id(label: &str, uuid: &str) -> String {
	if !label.is_empty() {
		format!("LABEL={}", label)
	} else {
		format!("UUID={}", uuid)
	}
}

/// Execute the OS's partition-setup script.
///
/// The partition devices and their identifiers are supplied both as
/// command-line parameters and as environment variables:
///
/// ```text
/// partition_setup.sh part1=/dev/mmcblk0p6 id1=LABEL=BOOT part2=/dev/mmcblk0p7
/// id2=UUID=550e8400-e29b-41d4-a716-446655440000
/// ```
///
/// The OS's boot partition is mounted and used as the working directory.
pub fn run_partition_setup(image: &OsManifest) -> Result<()> {
	let mut script = NamedTempFile::with_prefix("partition_setup")
		.context("Unable to create a file for the partition setup script")?;
	script
		.write_all(&image.partition_setup_script)
		.context("Unable to write the partition setup script")?;
	script.flush()?;
	info!(
		"{}: Running partition setup script from {}",
		image.name,
		script.path().display()
	);

	let mut cmd = Command::new("/bin/sh");
	cmd.arg(script.path());
	cmd.env_clear();
	cmd.env("PATH", "/bin:/usr/bin:/sbin:/usr/sbin");
	cmd.current_dir(utils::IMAGE_MOUNT_DIR);

	for (index, partition) in image.partitions.iter().enumerate() {
		let nr = index + 1;
		let part = partition.device.clone();
		let id = partition_id(&get_label(&part), &get_uuid(&part));
		debug!("part{} = {} ({})", nr, part, id);
		cmd.arg(format!("part{}={}", nr, part));
		cmd.arg(format!("id{}={}", nr, id));
		cmd.env(format!("part{}", nr), &part);
		cmd.env(format!("id{}", nr), &id);
	}

	debug!("Executing {:?}", cmd);
	let output = cmd
		.output()
		.context("Failed to run the partition setup script")?;
	if !output.status.success() {
		bail!(
			"{}: Error executing partition setup script: {}",
			image.name,
			utils::output_tail(&output)
		);
	}
	info!("Successfully ran the partition setup script");
	script
		.close()
		.context("Unable to delete the partition setup script")?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_partition_id_prefers_label() {
		assert_eq!(partition_id("BOOT", "abcd-1234"), "LABEL=BOOT");
		assert_eq!(
			partition_id("", "550e8400-e29b-41d4-a716-446655440000"),
			"UUID=550e8400-e29b-41d4-a716-446655440000"
		);
	}
}
