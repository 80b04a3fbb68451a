//! Per-partition image writing.
//!
//! Every partition is populated from its source URL (or local path) through
//! a composed shell pipeline: an optional `wget` prefix for remote sources,
//! a decompressor chosen by the file suffix, and a sink that depends on the
//! filesystem type of the partition.

use std::{fs::File, io::Write, process::Command, time::Instant};

use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use serde::Serialize;
use strum::Display;

use crate::manifest::{OsManifest, PartitionSpec};
use crate::state::DisplaySettings;
use crate::utils;

pub fn is_url(s: &str) -> bool {
	s.starts_with("http:") || s.starts_with("https:")
}

fn decompressor_for(source: &str) -> Result<&'static str> {
	if source.ends_with(".gz") {
		Ok("gzip -dc")
	} else if source.ends_with(".xz") {
		Ok("xz -dc")
	} else if source.ends_with(".bz2") {
		Ok("bzip2 -dc")
	} else if source.ends_with(".lzo") {
		Ok("lzop -dc")
	} else if source.ends_with(".zip") {
		/* Note: the image must be the only file inside the .zip */
		Ok("unzip -p")
	} else {
		Err(anyhow!(
			"Unknown compression format file extension. Expecting .lzo, .gz, .xz, .bz2 or .zip"
		))
	}
}

/// Compose the `source | decompress | sink` pipeline. A pure function of the
/// source suffix, so two identical sources always produce the same command.
pub fn stream_pipeline(source: &str, sink: &str) -> Result<String> {
	let mut cmd = String::new();
	if is_url(source) {
		cmd += &format!("wget --no-verbose --tries=inf -O- {} | ", source);
	}
	cmd += decompressor_for(source)?;
	if !is_url(source) {
		cmd += &format!(" {}", source);
	}
	cmd += &format!(" | {}", sink);
	Ok(cmd)
}

fn run_stream(source: &str, sink: &str) -> Result<()> {
	let pipeline = stream_pipeline(source, sink)?;
	let t = Instant::now();
	utils::run_shell_pipeline(&pipeline)?;
	debug!(
		"Finished writing filesystem in {:.1} seconds",
		t.elapsed().as_secs_f32()
	);
	Ok(())
}

fn dd(source: &str, device: &str) -> Result<()> {
	run_stream(source, &format!("dd of={} conv=fsync obs=4M", device))
}

fn partclone_restore(source: &str, device: &str) -> Result<()> {
	run_stream(source, &format!("partclone.restore -q -s - -o {}", device))
}

fn untar(source: &str) -> Result<()> {
	run_stream(source, &format!("tar x -C {}", utils::IMAGE_MOUNT_DIR))
}

/// Build the mkfs invocation for a filesystem type.
pub fn mkfs_command(device: &str, fs_type: &str, label: &str, options: &str) -> Command {
	let mut cmd = if fs_type.eq_ignore_ascii_case("fat") {
		let mut c = Command::new("/sbin/mkfs.fat");
		if !label.is_empty() {
			c.args(["-n", label]);
		}
		c
	} else if fs_type == "ntfs" {
		let mut c = Command::new("/sbin/mkfs.ntfs");
		c.arg("--fast");
		if !label.is_empty() {
			c.args(["-L", label]);
		}
		c
	} else {
		let mut c = Command::new(format!("/usr/sbin/mkfs.{}", fs_type));
		if !label.is_empty() {
			c.args(["-L", label]);
		}
		c
	};
	for opt in options.split_whitespace() {
		cmd.arg(opt);
	}
	cmd.arg(device);
	cmd
}

fn mkfs(device: &str, fs_type: &str, label: &str, options: &str) -> Result<()> {
	utils::cmd_run_check_status(&mut mkfs_command(device, fs_type, label, options))
		.context("Error creating file system")
}

/// Whether no existing filesystem already answers to the label.
fn label_available(label: &str) -> bool {
	!Command::new("/sbin/findfs")
		.arg(format!("LABEL={}", label))
		.status()
		.map(|s| s.success())
		.unwrap_or(false)
}

/// Labels over 15 bytes are dropped; a clash with an existing filesystem is
/// retried with a numeric suffix. If every suffix clashes too the original
/// label is kept, clash and all.
pub fn adjust_label(label: &mut String, available: impl Fn(&str) -> bool) {
	if label.len() > 15 {
		label.clear();
		return;
	}
	if label.is_empty() || available(label) {
		return;
	}
	for i in 0..10 {
		let candidate = format!("{}{}", label, i);
		if available(&candidate) {
			*label = candidate;
			return;
		}
	}
}

/// Format and populate one partition according to its filesystem type.
pub fn write_partition(os_name: &str, partition: &mut PartitionSpec) -> Result<()> {
	debug!("Checking partition label");
	adjust_label(&mut partition.label, label_available);
	debug!("Using label {}", partition.label);

	if partition.is_raw() {
		info!(
			"{}: Writing raw OS image to {}",
			os_name, partition.device
		);
		dd(&partition.tarball, &partition.device).context("Write failed")?;
	} else if partition.is_partclone() {
		info!(
			"{}: Writing cloned OS image to {}",
			os_name, partition.device
		);
		partclone_restore(&partition.tarball, &partition.device).context("Write failed")?;
	} else if !partition.is_unformatted() {
		info!(
			"{}: Creating filesystem {} on {}",
			os_name, partition.fs_type, partition.device
		);
		mkfs(
			&partition.device,
			&partition.fs_type,
			&partition.label,
			&partition.mkfs_options,
		)?;

		if !partition.empty_fs {
			debug!("{}: Mounting file system", os_name);
			let guard = utils::mount_guard(
				&partition.device,
				utils::IMAGE_MOUNT_DIR,
				&partition.fs_type,
			)
			.context(format!("{}: Error mounting file system", os_name))?;

			info!("{}: Downloading and extracting filesystem", os_name);
			untar(&partition.tarball).context(format!(
				"Populating {} failed; the partition is left formatted but empty",
				partition.device
			))?;
			guard.release();
		}
	}
	Ok(())
}

/// Display modes understood by the firmware, as stored in the settings file.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum VideoMode {
	HdmiPreferred,
	HdmiVga,
	Pal,
	Ntsc,
}

impl VideoMode {
	pub fn from_setting(value: u32) -> Self {
		match value {
			1 => VideoMode::HdmiVga,
			2 => VideoMode::Pal,
			3 => VideoMode::Ntsc,
			_ => VideoMode::HdmiPreferred,
		}
	}

	pub fn config_txt_lines(&self) -> &'static str {
		match self {
			VideoMode::HdmiPreferred => "hdmi_force_hotplug=1\r\n",
			VideoMode::HdmiVga => {
				"hdmi_ignore_edid=0xa5000080\r\nhdmi_force_hotplug=1\r\nhdmi_group=2\r\nhdmi_mode=4\r\n"
			}
			VideoMode::Pal => "hdmi_ignore_hotplug=1\r\nsdtv_mode=2\r\n",
			VideoMode::Ntsc => "hdmi_ignore_hotplug=1\r\nsdtv_mode=0\r\n",
		}
	}
}

/// Machine-readable record of the install, dropped into the root of the
/// OS's first partition.
#[derive(Debug, Serialize)]
pub struct OsConfig {
	pub flavour: String,
	pub release_date: String,
	pub imagefolder: String,
	pub description: String,
	pub videomode: u32,
	pub partitions: Vec<String>,
	pub language: String,
	pub keyboard: String,
}

pub fn write_os_config(image: &OsManifest, settings: &DisplaySettings) -> Result<()> {
	let config = OsConfig {
		flavour: image.flavour.clone(),
		release_date: image.release_date.clone(),
		imagefolder: image.folder.clone(),
		description: image.description.clone(),
		videomode: settings.display_mode,
		partitions: image.partition_devices(),
		language: settings.language.clone(),
		keyboard: settings.keyboard_layout.clone(),
	};
	let path = format!("{}/os_config.json", utils::IMAGE_MOUNT_DIR);
	let body = serde_json::to_string_pretty(&config)?;
	utils::put_file_contents(&path, body.as_bytes())
		.context(format!("Unable to save os_config.json to {}", path))
}

/// Append the display-mode lines to the OS's config.txt. The file is never
/// truncated.
pub fn patch_config_txt(settings: &DisplaySettings) -> Result<()> {
	let mode = VideoMode::from_setting(settings.display_mode);
	debug!("Applying display mode {}", mode);
	let path = format!("{}/config.txt", utils::IMAGE_MOUNT_DIR);
	let mut fd = File::options()
		.append(true)
		.create(true)
		.open(&path)
		.context(format!("Unable to open {}", path))?;
	fd.write_all(b"\r\n# Auto-generated display settings:\r\n")?;
	fd.write_all(mode.config_txt_lines().as_bytes())?;
	fd.flush()?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_stream_pipeline_for_remote_tarball() -> Result<()> {
		let cmd = stream_pipeline("http://h/root.tar.xz", "tar x -C /mnt2")?;
		assert_eq!(
			cmd,
			"wget --no-verbose --tries=inf -O- http://h/root.tar.xz | xz -dc | tar x -C /mnt2"
		);
		Ok(())
	}

	#[test]
	fn test_stream_pipeline_for_local_image() -> Result<()> {
		let cmd = stream_pipeline(
			"/mnt/os/image.img.gz",
			"dd of=/dev/mmcblk0p6 conv=fsync obs=4M",
		)?;
		assert_eq!(
			cmd,
			"gzip -dc /mnt/os/image.img.gz | dd of=/dev/mmcblk0p6 conv=fsync obs=4M"
		);
		Ok(())
	}

	#[test]
	fn test_stream_pipeline_is_deterministic() -> Result<()> {
		let a = stream_pipeline("https://h/a.zip", "tar x -C /mnt2")?;
		let b = stream_pipeline("https://h/a.zip", "tar x -C /mnt2")?;
		assert_eq!(a, b);
		assert!(a.contains("unzip -p"));
		Ok(())
	}

	#[test]
	fn test_unknown_suffix_rejected() {
		let err = stream_pipeline("http://h/image.rar", "tar x -C /mnt2").unwrap_err();
		assert!(err.to_string().contains("Unknown compression format"));
	}

	#[test]
	fn test_adjust_label_too_long() {
		let mut label = "averylongpartitionlabel".to_string();
		adjust_label(&mut label, |_| true);
		assert!(label.is_empty());
	}

	#[test]
	fn test_adjust_label_takes_first_free_suffix() {
		let mut label = "boot".to_string();
		// "boot" and "boot0" exist already, "boot1" is free.
		adjust_label(&mut label, |l| l != "boot" && l != "boot0");
		assert_eq!(label, "boot1");
	}

	#[test]
	fn test_adjust_label_keeps_clash_when_all_suffixes_taken() {
		let mut label = "boot".to_string();
		adjust_label(&mut label, |_| false);
		assert_eq!(label, "boot");
	}

	#[test]
	fn test_video_mode_lines() {
		assert_eq!(
			VideoMode::from_setting(0).config_txt_lines(),
			"hdmi_force_hotplug=1\r\n"
		);
		assert!(VideoMode::from_setting(1)
			.config_txt_lines()
			.contains("hdmi_group=2"));
		assert!(VideoMode::from_setting(2)
			.config_txt_lines()
			.contains("sdtv_mode=2"));
		assert!(VideoMode::from_setting(3)
			.config_txt_lines()
			.contains("sdtv_mode=0"));
		// Out-of-range values fall back to HDMI preferred.
		assert_eq!(VideoMode::from_setting(9), VideoMode::HdmiPreferred);
	}

	#[test]
	fn test_mkfs_command_shapes() {
		let cmd = mkfs_command("/dev/mmcblk0p6", "FAT", "BOOT", "");
		assert_eq!(cmd.get_program(), "/sbin/mkfs.fat");
		let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy()).collect();
		assert_eq!(args, vec!["-n", "BOOT", "/dev/mmcblk0p6"]);

		let cmd = mkfs_command("/dev/mmcblk0p7", "ext4", "root", "-O ^huge_file");
		assert_eq!(cmd.get_program(), "/usr/sbin/mkfs.ext4");
		let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy()).collect();
		assert_eq!(args, vec!["-L", "root", "-O", "^huge_file", "/dev/mmcblk0p7"]);

		let cmd = mkfs_command("/dev/mmcblk0p8", "ntfs", "", "");
		assert_eq!(cmd.get_program(), "/sbin/mkfs.ntfs");
		let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy()).collect();
		assert_eq!(args, vec!["--fast", "/dev/mmcblk0p8"]);
	}
}
