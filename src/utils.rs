use std::{
	ffi::CString,
	fs::{self, File},
	io::Write,
	path::{Path, PathBuf},
	process::{Command, Output, Stdio},
};

use anyhow::{anyhow, bail, Context, Result};
use libc::{close, open, syncfs, O_NONBLOCK, O_RDONLY};
use log::{debug, warn};
use sys_mount::{unmount, Mount, UnmountFlags};

pub const SD_DEVICE: &str = "/dev/mmcblk0";
pub const SYSTEMS_PARTITION: &str = "/dev/mmcblk0p1";
pub const SYSTEMS_DIR: &str = "/mnt";
pub const SETTINGS_PARTITION: &str = "/dev/mmcblk0p5";
pub const SETTINGS_DIR: &str = "/settings";
pub const IMAGE_MOUNT_DIR: &str = "/mnt2";

/// How much process output is kept when reporting a failed external tool.
const ERROR_TAIL_BYTES: usize = 2048;

pub fn partition_device(number: u32) -> String {
	format!("{}p{}", SD_DEVICE, number)
}

pub fn get_file_contents<P: AsRef<Path>>(path: P) -> Result<String> {
	let path = path.as_ref();
	let raw = fs::read(path).context(format!("Unable to read file '{}'", path.display()))?;
	// Files like /proc/device-tree/model carry trailing NULs.
	Ok(String::from_utf8_lossy(&raw)
		.trim_matches('\0')
		.to_string())
}

pub fn put_file_contents<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<()> {
	let path = path.as_ref();
	let mut fd = File::options()
		.write(true)
		.create(true)
		.truncate(true)
		.open(path)
		.context(format!("Unable to open file '{}' for writing", path.display()))?;
	fd.write_all(data)
		.context(format!("Error writing file '{}'", path.display()))?;
	// No fsync here: some targets are sysfs attributes. Durability of the
	// state files comes from the explicit sync points of the install.
	fd.flush()?;
	Ok(())
}

/// Read a numeric sysfs attribute of a block device, e.g.
/// `/sys/class/block/mmcblk0p5/start`.
pub fn block_sysfs_u64(device_name: &str, attribute: &str) -> Result<u64> {
	let path = format!("/sys/class/block/{}/{}", device_name, attribute);
	let contents = get_file_contents(&path)?;
	contents.trim().parse::<u64>().context(format!(
		"Unable to parse '{}' as a sector count from {}",
		contents.trim(),
		path
	))
}

pub fn cmd_run_check_status(cmd: &mut Command) -> Result<()> {
	debug!("Running command {:?} ...", cmd);
	let result = cmd
		.status()
		.context(format!("Failed to run {:?}", cmd.get_program()))?;
	if result.success() {
		Ok(())
	} else if let Some(c) = result.code() {
		Err(anyhow!(
			"The following command failed with exit code {}:\n{:?}",
			c,
			cmd
		))
	} else {
		Err(anyhow!(
			"The following command exited abnormally:\n{:?}",
			cmd
		))
	}
}

/// Keep only a bounded tail of a failed tool's chatter. The bulk data of an
/// install flows between the piped tools, never through us.
pub fn output_tail(output: &Output) -> String {
	let mut text = String::new();
	text.push_str(&String::from_utf8_lossy(&output.stdout));
	text.push_str(&String::from_utf8_lossy(&output.stderr));
	let text = text.trim();
	if text.len() > ERROR_TAIL_BYTES {
		let cut = text.len() - ERROR_TAIL_BYTES;
		format!("[...]{}", &text[cut..])
	} else {
		text.to_string()
	}
}

/// Run a shell pipeline under `sh -o pipefail -c`, waiting without a timeout.
pub fn run_shell_pipeline(pipeline: &str) -> Result<()> {
	debug!("Executing: sh -o pipefail -c \"{}\"", pipeline);
	let output = Command::new("sh")
		.args(["-o", "pipefail", "-c", pipeline])
		.stdout(Stdio::piped())
		.stderr(Stdio::piped())
		.output()
		.context("Failed to spawn sh")?;
	if output.status.success() {
		Ok(())
	} else {
		Err(anyhow!(
			"Pipeline failed with {}: {}",
			output.status,
			output_tail(&output)
		))
	}
}

/// Run a command, feeding `input` to its stdin, capturing the output.
pub fn run_with_input(cmd: &mut Command, input: &[u8]) -> Result<Output> {
	debug!("Running command {:?} with piped stdin ...", cmd);
	let mut child = cmd
		.stdin(Stdio::piped())
		.stdout(Stdio::piped())
		.stderr(Stdio::piped())
		.spawn()
		.context(format!("Failed to spawn {:?}", cmd.get_program()))?;
	child
		.stdin
		.take()
		.context("Unable to open stdin of the child process")?
		.write_all(input)
		.context("Error writing to the child's stdin")?;
	child
		.wait_with_output()
		.context("Error waiting for the child process")
}

pub fn partition_is_mounted(partition: &str, dir: &str) -> bool {
	let mounts = match fs::read_to_string("/proc/mounts") {
		Ok(m) => m,
		Err(_) => return false,
	};
	mounts.lines().any(|line| {
		let mut fields = line.split_whitespace();
		fields.next() == Some(partition) && fields.next() == Some(dir)
	})
}

/// The filesystem name as the mount syscall wants it.
pub fn kernel_fstype(fs_type: &str) -> &str {
	if fs_type.eq_ignore_ascii_case("fat") {
		"vfat"
	} else {
		fs_type
	}
}

pub fn mount_partition(partition: &str, dir: &str, fs_type: &str) -> Result<()> {
	if !Path::new(dir).exists() {
		debug!("Creating directory {}", dir);
		fs::create_dir_all(dir)?;
	}
	if partition_is_mounted(partition, dir) {
		debug!("Partition {} is already mounted on {}", partition, dir);
		return Ok(());
	}
	if !Path::new(partition).exists() {
		bail!("Partition {} does not exist", partition);
	}
	debug!("Mounting {} ({}) on {}", partition, fs_type, dir);
	if fs_type == "ntfs" {
		// The in-kernel driver can not write NTFS, use the FUSE helper.
		return cmd_run_check_status(
			Command::new("/sbin/mount.ntfs-3g").args([partition, dir]),
		);
	}
	Mount::builder()
		.fstype(kernel_fstype(fs_type))
		.mount(partition, dir)
		.context(format!("Failed to mount {} on {}", partition, dir))?;
	Ok(())
}

pub fn unmount_dir(dir: &str) -> Result<()> {
	debug!("Unmounting {}", dir);
	unmount(dir, UnmountFlags::empty()).context(format!("Failed to unmount {}", dir))?;
	Ok(())
}

pub fn mount_systems_partition() -> Result<()> {
	mount_partition(SYSTEMS_PARTITION, SYSTEMS_DIR, "vfat")
}

pub fn unmount_systems_partition() -> Result<()> {
	unmount_dir(SYSTEMS_DIR)
}

pub fn mount_settings_partition() -> Result<()> {
	mount_partition(SETTINGS_PARTITION, SETTINGS_DIR, "ext4")
}

pub fn unmount_settings_partition() -> Result<()> {
	unmount_dir(SETTINGS_DIR)
}

/// A mounted filesystem that is guaranteed to be released on every exit
/// path. A panic or an early `?` during extraction must never leave the
/// image mountpoint busy across a partition-table rewrite.
pub struct MountGuard {
	dir: PathBuf,
	armed: bool,
}

pub fn mount_guard(partition: &str, dir: &str, fs_type: &str) -> Result<MountGuard> {
	mount_partition(partition, dir, fs_type)?;
	Ok(MountGuard {
		dir: PathBuf::from(dir),
		armed: true,
	})
}

impl MountGuard {
	/// Unmount on the success path. Failure to unmount is logged, not fatal.
	pub fn release(mut self) {
		self.armed = false;
		if let Err(e) = unmount_dir(&self.dir.to_string_lossy()) {
			warn!("Error unmounting {}: {:#}", self.dir.display(), e);
		}
	}
}

impl Drop for MountGuard {
	fn drop(&mut self) {
		if self.armed {
			if let Err(e) = unmount_dir(&self.dir.to_string_lossy()) {
				warn!(
					"Error unmounting {} during cleanup: {:#}",
					self.dir.display(),
					e
				);
			}
		}
	}
}

pub fn sync_all() {
	unsafe { libc::sync() };
}

/// Sync the filesystem behind the path.
pub fn sync_filesystem(path: &dyn AsRef<Path>) -> Result<()> {
	let tgt_path = path.as_ref();
	let path = CString::new(tgt_path.as_os_str().as_encoded_bytes())?;
	let path_ptr = path.as_ptr();

	let fd = unsafe { open(path_ptr, O_RDONLY | O_NONBLOCK) };
	if fd < 0 {
		let errno = errno::errno();
		return Err(anyhow!(
			"Failed to open path {}: {}",
			&tgt_path.display(),
			errno
		));
	}
	debug!("open(\"{}\") returned fd {}", &tgt_path.display(), fd);
	let result = unsafe { syncfs(fd) };
	debug!("syncfs({}) returned {}", fd, result);
	let close_result = unsafe { close(fd) };
	if close_result != 0 {
		warn!("Failed to close fd {}: {}", fd, errno::errno());
	}
	if result != 0 {
		let errno = errno::errno();
		return Err(anyhow!(
			"Failed to sync filesystem {}: {}",
			tgt_path.display(),
			errno
		));
	}
	Ok(())
}
