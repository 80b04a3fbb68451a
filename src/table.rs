//! Rendering and applying the MBR partition table.
//!
//! The plan is merged with the two fixed system partitions (slot 1 recovery
//! FAT, slot 5 settings ext4) and one extended container (slot 2, or slot 4
//! when an OS claimed slot 2), rendered as an sfdisk `-uS` script and applied
//! to the running card. The rewrite is the irreversible step of an install:
//! everything between unmount and remount has to happen in one piece.

use std::{collections::BTreeMap, fs, path::Path, process::Command, thread, time::Duration};

use anyhow::{bail, Context, Result};
use log::{debug, info};

use crate::planner::PartitionPlan;
use crate::state::INSTALLED_OS_FILE;
use crate::utils;

/// Start and size of the fixed system partitions, read back from sysfs.
#[derive(Clone, Debug)]
pub struct SystemPartitions {
	pub start_p1: u64,
	pub size_p1: u64,
	pub start_p5: u64,
	pub size_p5: u64,
}

impl SystemPartitions {
	pub fn probe() -> Result<Self> {
		let sys = SystemPartitions {
			start_p1: utils::block_sysfs_u64("mmcblk0p1", "start")?,
			size_p1: utils::block_sysfs_u64("mmcblk0p1", "size")?,
			start_p5: utils::block_sysfs_u64("mmcblk0p5", "start")?,
			size_p5: utils::block_sysfs_u64("mmcblk0p5", "size")?,
		};
		if sys.start_p1 == 0 || sys.size_p1 == 0 || sys.start_p5 == 0 || sys.size_p5 == 0 {
			bail!("Error reading the existing partition table");
		}
		Ok(sys)
	}
}

struct TableEntry {
	start: u64,
	size: u64,
	partition_type: String,
	active: bool,
}

/// Render the sfdisk script: one `<start>,<size>,<type>[ *]` line per slot,
/// `0,0` for the slots with no partition.
pub fn render_sfdisk_script(plan: &PartitionPlan, sys: &SystemPartitions) -> String {
	let mut table: BTreeMap<u32, TableEntry> = BTreeMap::new();
	for (slot, p) in &plan.entries {
		table.insert(
			*slot,
			TableEntry {
				start: p.start_sector,
				size: p.size_sectors,
				partition_type: p.partition_type.clone(),
				active: p.active,
			},
		);
	}
	table.insert(
		1,
		TableEntry {
			start: sys.start_p1,
			size: sys.size_p1,
			partition_type: "0E".to_string(), /* FAT recovery partition */
			active: false,
		},
	);
	table.insert(
		5,
		TableEntry {
			start: sys.start_p5,
			size: sys.size_p5,
			partition_type: "L".to_string(), /* ext4 settings partition */
			active: false,
		},
	);

	/* The extended container starts right after the recovery partition and
	 * runs to the end of the highest planned partition. */
	let start_extended = sys.start_p1 + sys.size_p1;
	let last_end = table
		.values()
		.last()
		.map(|e| e.start + e.size)
		.unwrap_or(start_extended);
	let extended_slot = if table.contains_key(&2) {
		/* Slot 2 was claimed by an OS, store the extended entry
		 * out of order at slot 4 */
		4
	} else {
		2
	};
	table.insert(
		extended_slot,
		TableEntry {
			start: start_extended,
			size: last_end - start_extended,
			partition_type: "E".to_string(),
			active: false,
		},
	);

	let max_slot = *table.keys().next_back().unwrap_or(&1);
	let mut script = String::new();
	for slot in 1..=max_slot {
		match table.get(&slot) {
			Some(entry) => {
				script += &format!(
					"{},{},{}",
					entry.start, entry.size, entry.partition_type
				);
				if entry.active {
					script += " *";
				}
				script += "\n";
			}
			None => script += "0,0\n",
		}
	}
	script
}

/// Apply the rendered script with sfdisk while the kernel holds the device,
/// then re-probe and remount. Must not be interleaved with anything touching
/// `/mnt` or `/settings`.
fn write_partition_table(script: &str) -> Result<()> {
	debug!("Partition table to be written:\n{}", script);

	debug!("Unmounting all partitions");
	if let Err(e) = utils::unmount_systems_partition() {
		debug!("{:#}", e);
	}
	if let Err(e) = utils::unmount_settings_partition() {
		debug!("{:#}", e);
	}

	debug!("Writing partition table using sfdisk");
	let output = utils::run_with_input(
		Command::new("/sbin/sfdisk").args(["-uS", utils::SD_DEVICE]),
		script.as_bytes(),
	)?;
	debug!("sfdisk done, output: {}", utils::output_tail(&output));

	utils::sync_all();
	thread::sleep(Duration::from_millis(500));

	debug!("Doing partprobe");
	if let Err(e) = utils::cmd_run_check_status(&mut Command::new("/usr/sbin/partprobe")) {
		debug!("{:#}", e);
	}
	thread::sleep(Duration::from_millis(500));

	/* Remount */
	utils::mount_systems_partition()?;
	utils::mount_settings_partition()?;

	if !output.status.success() {
		bail!(
			"Error creating partition table: {}",
			utils::output_tail(&output)
		);
	}
	Ok(())
}

/// Destroy residual filesystem signatures on every planned partition.
fn zero_partition_starts(plan: &PartitionPlan) -> Result<()> {
	info!("Zeroing the start of each partition");
	for p in plan.entries.values() {
		if p.size_sectors == 0 {
			continue;
		}
		utils::cmd_run_check_status(Command::new("/bin/dd").args([
			"count=1",
			"bs=512",
			"if=/dev/zero",
			&format!("of={}", p.device),
		]))
		.context(format!("Zeroing the start of {} failed", p.device))?;
	}
	Ok(())
}

/// Rewrite the card's partition table in place. After this returns the
/// previous layout, and any record of previously installed systems, is gone.
pub fn repartition(plan: &PartitionPlan) -> Result<()> {
	let sys = SystemPartitions::probe()?;
	let script = render_sfdisk_script(plan, &sys);

	/* Previous install records are no longer valid */
	if Path::new(INSTALLED_OS_FILE).exists() {
		debug!("Removing {}", INSTALLED_OS_FILE);
		fs::remove_file(INSTALLED_OS_FILE)?;
	}

	info!("Writing partition table");
	write_partition_table(&script).context("Unable to write the partition table")?;
	info!("Partition table successfully written");

	zero_partition_starts(plan)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::planner::PlannedPartition;

	fn sys() -> SystemPartitions {
		SystemPartitions {
			start_p1: 8192,
			size_p1: 131072,
			start_p5: 139266,
			size_p5: 65534,
		}
	}

	fn planned(slot: u32, start: u64, size: u64, ptype: &str, active: bool) -> PlannedPartition {
		PlannedPartition {
			slot,
			os_index: 0,
			part_index: 0,
			device: format!("/dev/mmcblk0p{}", slot),
			start_sector: start,
			size_sectors: size,
			partition_type: ptype.to_string(),
			active,
		}
	}

	#[test]
	fn test_script_with_logical_partitions_only() {
		let mut plan = PartitionPlan::default();
		plan.entries.insert(6, planned(6, 212992, 1228800, "0c", true));
		plan.entries.insert(7, planned(7, 1441792, 4096000, "83", false));
		let script = render_sfdisk_script(&plan, &sys());
		// Extended container at slot 2, spanning to the end of slot 7.
		let expected = "8192,131072,0E\n\
			139264,5398528,E\n\
			0,0\n\
			0,0\n\
			139266,65534,L\n\
			212992,1228800,0c *\n\
			1441792,4096000,83\n";
		assert_eq!(script, expected);
	}

	#[test]
	fn test_script_moves_extended_to_slot_4_when_2_is_claimed() {
		let mut plan = PartitionPlan::default();
		plan.entries.insert(2, planned(2, 8388608, 2048000, "83", false));
		plan.entries.insert(6, planned(6, 212992, 4096000, "83", false));
		let script = render_sfdisk_script(&plan, &sys());
		let lines: Vec<&str> = script.lines().collect();
		assert_eq!(lines.len(), 6);
		assert_eq!(lines[0], "8192,131072,0E");
		// Slot 2 belongs to the OS, the extended entry went to slot 4.
		assert_eq!(lines[1], "8388608,2048000,83");
		assert_eq!(lines[2], "0,0");
		assert!(lines[3].ends_with(",E"));
		assert!(lines[3].starts_with("139264,"));
		assert_eq!(lines[4], "139266,65534,L");
		assert_eq!(lines[5], "212992,4096000,83");
	}
}
