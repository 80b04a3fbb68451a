//! Partition planner.
//!
//! A pure function over a list of [`OsManifest`]s that produces a
//! [`PartitionPlan`]: a totally-ordered assignment of MBR partition numbers,
//! offsets and sizes across the free space of the SD card.
//!
//! The card keeps a fixed frame around the plan: slot 1 is the recovery FAT
//! partition, slot 5 the settings partition, and one of the primary slots 2
//! or 4 becomes the extended container. Operating systems may claim at most
//! one of the primaries 2/4, pin a logical slot >= 6, or take the next free
//! logical slot.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use log::{debug, info};

use crate::manifest::OsManifest;
use crate::utils::partition_device;

/// 4 MiB, in 512-byte sectors.
pub const PARTITION_ALIGNMENT: u64 = 8192;
/// Sectors left between partitions for the next EBR.
pub const PARTITION_GAP: u64 = 2;
/// RISC OS images demand to start at this offset, in MiB.
pub const RISCOS_OFFSET: u64 = 1760;
pub const RISCOS_SECTOR_OFFSET: u64 = RISCOS_OFFSET * 2048;

/// Where an OS partition may go in the MBR.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Slot {
	/// Slots 1 and 5 belong to the recovery and settings partitions.
	System(u32),
	/// Slot 3 is kept free for compatibility.
	Reserved,
	/// One of the primary slots 2 or 4.
	PrimaryClaim(u32),
	/// A pinned logical slot >= 6.
	Pinned(u32),
	/// The next free logical slot.
	Auto,
}

impl Slot {
	fn from_required(required: u32) -> Self {
		match required {
			0 => Slot::Auto,
			1 | 5 => Slot::System(required),
			3 => Slot::Reserved,
			2 | 4 => Slot::PrimaryClaim(required),
			n => Slot::Pinned(n),
		}
	}
}

#[derive(Clone, Debug)]
pub struct DiskGeometry {
	pub total_sectors: u64,
	/// First sector past the settings partition.
	pub start_of_free_space: u64,
}

impl DiskGeometry {
	pub fn available_mb(&self) -> u64 {
		(self.total_sectors - self.start_of_free_space) / 2048
	}
}

/// One resolved partition of the plan.
#[derive(Clone, Debug)]
pub struct PlannedPartition {
	pub slot: u32,
	pub os_index: usize,
	pub part_index: usize,
	pub device: String,
	pub start_sector: u64,
	pub size_sectors: u64,
	pub partition_type: String,
	pub active: bool,
}

impl PlannedPartition {
	pub fn end_sector(&self) -> u64 {
		self.start_sector + self.size_sectors
	}
}

/// Mapping from MBR slot to resolved partition, ordered by slot.
#[derive(Debug, Default)]
pub struct PartitionPlan {
	pub entries: BTreeMap<u32, PlannedPartition>,
}

impl PartitionPlan {
	/// Whether an OS claimed primary slot 2 (the extended container then
	/// moves to slot 4).
	pub fn claims_slot_2(&self) -> bool {
		self.entries.contains_key(&2)
	}
}

/// Working state of one partition while the plan is being computed.
struct Candidate {
	os_index: usize,
	part_index: usize,
	/// None until the unpinned partitions are numbered in the second pass.
	slot: Option<u32>,
	pinned_offset: u64,
	nominal_mb: u64,
	want_maximised: bool,
	raw: bool,
	partition_type: String,
	active: bool,
}

pub fn plan(images: &[OsManifest], geometry: &DiskGeometry) -> Result<PartitionPlan> {
	let available_mb = geometry.available_mb();
	let start_sector = geometry.start_of_free_space;

	let mut total_nominal_mb: u64 = 0;
	let mut total_uncompressed_mb: u64 = 0;
	let mut num_parts: usize = 0;
	let mut num_expand_parts: u64 = 0;

	let mut candidates: Vec<Candidate> = Vec::new();
	let mut slot_map: BTreeMap<u32, usize> = BTreeMap::new();

	for (os_index, image) in images.iter().enumerate() {
		debug!("Checking image {}", image.name);
		if image.partitions.is_empty() {
			bail!("No partitions specified for '{}'", image.name);
		}

		let riscos = image.is_riscos();
		if riscos {
			debug!("Detected a RISC OS image, checking requirements");
			if start_sector > RISCOS_SECTOR_OFFSET - 2048 {
				bail!("RISC OS cannot be installed: the recovery partition is too large");
			}
			// The forced gap up to the fixed offset is charged to the budget.
			total_nominal_mb += (RISCOS_SECTOR_OFFSET - start_sector) / 2048;
		}

		let last_index = image.partitions.len() - 1;
		for (part_index, partition) in image.partitions.iter().enumerate() {
			debug!("Checking partition {}", partition.label);
			num_parts += 1;
			if partition.want_maximised {
				num_expand_parts += 1;
			}

			total_nominal_mb += partition.partition_size_nominal;
			total_uncompressed_mb += partition.uncompressed_tarball_size;
			if partition.fs_type == "ext4" {
				/* overhead for filesystem meta data */
				total_uncompressed_mb += total_nominal_mb / 100;
			}

			let mut required = partition.requires_partition_number;
			let mut pinned_offset = partition.offset;
			if riscos {
				if part_index == 0 {
					required = 6;
					pinned_offset = RISCOS_SECTOR_OFFSET;
				}
				if part_index == last_index {
					required = 7;
				}
			}

			let claimed = match Slot::from_required(required) {
				Slot::System(n) => {
					bail!("Operating system cannot require a system partition ({})", n)
				}
				Slot::Reserved => {
					bail!("Operating system cannot require reserved partition 3")
				}
				Slot::PrimaryClaim(n) => {
					let other = if n == 2 { 4 } else { 2 };
					if slot_map.contains_key(&other) {
						bail!("Operating system cannot claim both primary partitions 2 and 4");
					}
					Some(n)
				}
				Slot::Pinned(n) => Some(n),
				Slot::Auto => None,
			};
			if let Some(n) = claimed {
				if slot_map.contains_key(&n) {
					bail!(
						"More than one operating system requires partition number {}",
						n
					);
				}
				debug!("Partition pinned to slot {}", n);
				slot_map.insert(n, candidates.len());
			}

			/* Maximum overhead per partition for alignment. Partitions whose
			 * size divides the alignment evenly are shrunk later instead.
			 * An expanding partition additionally grows to the next
			 * alignment boundary, so budget one more unit for it; the
			 * sizing walk below must never run past the end of the card. */
			if partition.want_maximised
				|| (partition.partition_size_nominal * 2048) % PARTITION_ALIGNMENT != 0
			{
				total_nominal_mb += PARTITION_ALIGNMENT / 2048;
			}
			if partition.want_maximised {
				total_nominal_mb += PARTITION_ALIGNMENT / 2048;
			}

			candidates.push(Candidate {
				os_index,
				part_index,
				slot: claimed,
				pinned_offset,
				nominal_mb: partition.partition_size_nominal,
				want_maximised: partition.want_maximised,
				raw: partition.is_raw(),
				partition_type: partition.partition_type(),
				active: partition.active,
			});
		}
		debug!("Finished partition checks for {}", image.name);
	}

	/* Second pass: number the unpinned partitions as one contiguous block
	 * above every claimed slot, in the order they appear across the
	 * manifest list. An unpinned partition can never collide with (or
	 * block) an explicit pin this way. */
	debug!("Assigning remaining partition numbers");
	let mut next_slot = slot_map
		.keys()
		.next_back()
		.map(|last| (*last).max(5) + 1)
		.unwrap_or(6);
	for (index, candidate) in candidates.iter_mut().enumerate() {
		if candidate.slot.is_none() {
			debug!("Unpinned partition goes to slot {}", next_slot);
			candidate.slot = Some(next_slot);
			slot_map.insert(next_slot, index);
			next_slot += 1;
		}
	}

	info!(
		"Parsed image size: {} bytes across {} partitions",
		total_uncompressed_mb * 1024 * 1024,
		num_parts
	);

	if total_nominal_mb > available_mb {
		bail!(
			"Not enough disk space. Need {} MB, got {} MB",
			total_nominal_mb,
			available_mb
		);
	}

	let extra_per_expand = if num_expand_parts > 0 {
		/* Spare space is split between partitions that want to expand */
		let extra = (available_mb - total_nominal_mb) / num_expand_parts;
		debug!("Extra space of {} MB per expanding partition", extra);
		extra
	} else {
		0
	};

	/* Allocate space to all logical partitions first, then to the primary
	 * claimer, so logical partitions pack from the start of the extended
	 * container. */
	let mut order: Vec<u32> = slot_map.keys().copied().collect();
	if matches!(order.first(), Some(&2) | Some(&4)) {
		order.rotate_left(1);
	}

	let mut plan = PartitionPlan::default();
	let mut offset = start_sector;
	let last_slot = *order.last().unwrap_or(&0);

	for slot in order {
		let candidate = &candidates[slot_map[&slot]];

		if candidate.pinned_offset != 0 {
			/* The OS wants its partition at a fixed offset */
			if candidate.pinned_offset <= offset {
				bail!("Fixed partition offset too low");
			}
			offset = candidate.pinned_offset;
		} else {
			offset += PARTITION_GAP;
			/* Align at a 4 MiB boundary */
			if offset % PARTITION_ALIGNMENT != 0 {
				offset += PARTITION_ALIGNMENT - (offset % PARTITION_ALIGNMENT);
			}
		}
		debug!("Offset of slot {} is {}", slot, offset);

		let mut size_mb = candidate.nominal_mb;
		if candidate.want_maximised {
			size_mb += extra_per_expand;
		}
		let mut size_sectors = size_mb * 2048;

		if slot == last_slot {
			/* The last partition gets any remaining space that could not be
			 * divided evenly */
			let space_left =
				geometry.total_sectors as i64 - offset as i64 - size_sectors as i64;
			if space_left > 0 && candidate.want_maximised {
				size_sectors += space_left as u64;
			}
		} else {
			if size_sectors % PARTITION_ALIGNMENT == 0 && !candidate.raw {
				/* The size divides 4 MiB evenly. Shave a couple of sectors
				   off the end to make room for the EBR of the next
				   partition, so it aligns without a 4 MiB hole */
				size_sectors -= PARTITION_GAP;
			}
			if candidate.want_maximised
				&& (size_sectors + PARTITION_GAP) % PARTITION_ALIGNMENT != 0
			{
				/* Enlarge the partition to close the gap to the next one */
				size_sectors += PARTITION_ALIGNMENT
					- ((size_sectors + PARTITION_GAP) % PARTITION_ALIGNMENT);
			}
		}

		let start_sector = offset;
		offset += size_sectors;
		if offset > geometry.total_sectors {
			bail!(
				"Partition {} would end at sector {}, past the end of the card ({})",
				slot,
				offset,
				geometry.total_sectors
			);
		}

		plan.entries.insert(
			slot,
			PlannedPartition {
				slot,
				os_index: candidate.os_index,
				part_index: candidate.part_index,
				device: partition_device(slot),
				start_sector,
				size_sectors,
				partition_type: candidate.partition_type.clone(),
				active: candidate.active,
			},
		);
	}

	Ok(plan)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::manifest::{OsManifest, PartitionSpec};

	fn geometry() -> DiskGeometry {
		DiskGeometry {
			total_sectors: 31116288,
			start_of_free_space: 98304,
		}
	}

	fn partition(fs: &str, nominal: u64, maximised: bool) -> PartitionSpec {
		PartitionSpec {
			fs_type: fs.to_string(),
			partition_size_nominal: nominal,
			want_maximised: maximised,
			..Default::default()
		}
	}

	fn os(name: &str, partitions: Vec<PartitionSpec>) -> OsManifest {
		OsManifest {
			name: name.to_string(),
			bootable: true,
			partitions,
			..Default::default()
		}
	}

	#[test]
	fn test_single_os_takes_slot_6_and_fills_the_card() -> Result<()> {
		let images = vec![os("Raspbian", vec![partition("ext4", 3000, true)])];
		let plan = plan(&images, &geometry())?;
		assert_eq!(plan.entries.len(), 1);
		let p = &plan.entries[&6];
		assert_eq!(p.device, "/dev/mmcblk0p6");
		assert_eq!(p.start_sector % PARTITION_ALIGNMENT, 0);
		assert!(p.start_sector >= 98304 + PARTITION_GAP);
		// Maximised last partition consumes everything up to the end.
		assert_eq!(p.end_sector(), 31116288);
		Ok(())
	}

	#[test]
	fn test_primary_claim_keeps_logical_first() -> Result<()> {
		let mut pinned = partition("ext4", 1000, false);
		pinned.requires_partition_number = 2;
		let images = vec![
			os("OS-A", vec![partition("ext4", 500, true)]),
			os("OS-B", vec![pinned]),
		];
		let plan = plan(&images, &geometry())?;
		assert_eq!(
			plan.entries.keys().copied().collect::<Vec<_>>(),
			vec![2, 6]
		);
		assert!(plan.claims_slot_2());
		// Logical slot 6 is allocated before the primary claimer.
		assert!(plan.entries[&6].start_sector < plan.entries[&2].start_sector);
		let total: u64 = plan.entries.values().map(|p| p.size_sectors).sum();
		assert!(total <= 31116288 - 98304);
		Ok(())
	}

	#[test]
	fn test_riscos_pins_slots_6_and_7() -> Result<()> {
		let images = vec![os(
			"RISC OS",
			vec![partition("fat", 63, false), partition("ext4", 1800, true)],
		)];
		let plan = plan(&images, &geometry())?;
		let first = &plan.entries[&6];
		assert_eq!(first.start_sector, RISCOS_SECTOR_OFFSET);
		let second = &plan.entries[&7];
		assert!(second.start_sector > first.end_sector());
		Ok(())
	}

	#[test]
	fn test_riscos_rejected_when_recovery_too_large() {
		let images = vec![os(
			"RISC OS",
			vec![partition("fat", 63, false), partition("ext4", 1800, true)],
		)];
		let tight = DiskGeometry {
			total_sectors: 31116288,
			start_of_free_space: RISCOS_SECTOR_OFFSET - 2047,
		};
		let err = plan(&images, &tight).unwrap_err();
		assert!(err.to_string().contains("RISC OS cannot be installed"));
	}

	#[test]
	fn test_system_slots_rejected() {
		for slot in [1, 5] {
			let mut p = partition("ext4", 100, false);
			p.requires_partition_number = slot;
			let err = plan(&[os("A", vec![p])], &geometry()).unwrap_err();
			assert!(
				err.to_string().contains("cannot require a system partition"),
				"slot {} not rejected: {}",
				slot,
				err
			);
		}
	}

	#[test]
	fn test_reserved_slot_3_rejected() {
		let mut p = partition("ext4", 100, false);
		p.requires_partition_number = 3;
		assert!(plan(&[os("A", vec![p])], &geometry()).is_err());
	}

	#[test]
	fn test_conflicting_pins_rejected() {
		let mut a = partition("ext4", 100, false);
		a.requires_partition_number = 7;
		let mut b = partition("ext4", 100, false);
		b.requires_partition_number = 7;
		let err = plan(&[os("A", vec![a]), os("B", vec![b])], &geometry()).unwrap_err();
		assert!(err
			.to_string()
			.contains("More than one operating system requires partition number 7"));
	}

	#[test]
	fn test_both_primaries_rejected() {
		let mut a = partition("ext4", 100, false);
		a.requires_partition_number = 2;
		let mut b = partition("ext4", 100, false);
		b.requires_partition_number = 4;
		let err = plan(&[os("A", vec![a]), os("B", vec![b])], &geometry()).unwrap_err();
		assert!(err
			.to_string()
			.contains("cannot claim both primary partitions"));
	}

	#[test]
	fn test_capacity_rejected() {
		let images = vec![os("Huge", vec![partition("ext4", 20000, false)])];
		let err = plan(&images, &geometry()).unwrap_err();
		assert!(err.to_string().contains("Not enough disk space"));
	}

	#[test]
	fn test_fixed_offset_too_low_rejected() {
		let mut p = partition("ext4", 100, false);
		p.offset = 4096; // below the start of free space
		let err = plan(&[os("A", vec![p])], &geometry()).unwrap_err();
		assert!(err.to_string().contains("Fixed partition offset too low"));
	}

	#[test]
	fn test_partitions_do_not_overlap_and_align() -> Result<()> {
		let images = vec![
			os(
				"OS-A",
				vec![partition("fat", 63, false), partition("ext4", 600, true)],
			),
			os("OS-B", vec![partition("ext4", 900, true)]),
		];
		let plan = plan(&images, &geometry())?;
		assert_eq!(
			plan.entries.keys().copied().collect::<Vec<_>>(),
			vec![6, 7, 8]
		);
		let parts: Vec<_> = plan.entries.values().collect();
		for pair in parts.windows(2) {
			assert!(pair[0].end_sector() <= pair[1].start_sector);
		}
		for p in &parts {
			assert_eq!(p.start_sector % PARTITION_ALIGNMENT, 0);
		}
		// Distinct devices all the way down.
		let mut devices: Vec<_> = parts.iter().map(|p| p.device.clone()).collect();
		devices.dedup();
		assert_eq!(devices.len(), parts.len());
		Ok(())
	}

	#[test]
	fn test_pin_not_blocked_by_earlier_unpinned_partition() -> Result<()> {
		let mut pinned = partition("ext4", 200, false);
		pinned.requires_partition_number = 6;
		let images = vec![
			os("A", vec![partition("ext4", 200, false)]),
			os("B", vec![pinned]),
		];
		let plan = plan(&images, &geometry())?;
		assert_eq!(
			plan.entries.keys().copied().collect::<Vec<_>>(),
			vec![6, 7]
		);
		// The pin wins slot 6, the unpinned partition moves above it.
		assert_eq!(plan.entries[&6].os_index, 1);
		assert_eq!(plan.entries[&7].os_index, 0);
		Ok(())
	}

	#[test]
	fn test_auto_slots_continue_after_pins() -> Result<()> {
		let mut pinned = partition("ext4", 200, false);
		pinned.requires_partition_number = 8;
		let images = vec![
			os("A", vec![pinned]),
			os("B", vec![partition("ext4", 200, false)]),
		];
		let plan = plan(&images, &geometry())?;
		assert_eq!(
			plan.entries.keys().copied().collect::<Vec<_>>(),
			vec![8, 9]
		);
		Ok(())
	}
}
