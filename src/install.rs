//! Install orchestration.
//!
//! Installation is destructive and one-shot. `prepare` only computes the
//! plan and may be rejected without touching the card; `commit` rewrites the
//! partition table and from then on any failure leaves the card in whatever
//! intermediate state it reached. There is no rollback.

use std::fs;

use anyhow::{bail, Context, Result};
use log::{debug, info};

use crate::image;
use crate::manifest::OsManifest;
use crate::planner::{self, DiskGeometry, PartitionPlan};
use crate::postinstall;
use crate::state::{self, InstalledOs};
use crate::table;
use crate::utils;

pub struct InstallManager {
	geometry: DiskGeometry,
	installed: Vec<InstalledOs>,
}

impl InstallManager {
	pub fn new() -> Result<Self> {
		let start_p5 = utils::block_sysfs_u64("mmcblk0p5", "start")?;
		let size_p5 = utils::block_sysfs_u64("mmcblk0p5", "size")?;
		let total_sectors = utils::block_sysfs_u64("mmcblk0", "size")?;
		let geometry = DiskGeometry {
			total_sectors,
			start_of_free_space: start_p5 + size_p5,
		};
		debug!("Disk geometry: {:?}", geometry);

		debug!("Mounting systems partition");
		utils::mount_systems_partition()?;
		fs::create_dir_all(utils::IMAGE_MOUNT_DIR)?;

		Ok(InstallManager {
			geometry,
			installed: Vec::new(),
		})
	}

	/// Validate the manifests and compute the partition plan. Nothing on the
	/// card is touched; an error here leaves the previous layout intact.
	pub fn prepare(&self, images: &[OsManifest]) -> Result<PartitionPlan> {
		if images.is_empty() {
			bail!("No operating systems to install");
		}
		planner::plan(images, &self.geometry)
	}

	/// Rewrite the partition table and write every image. The first OS of
	/// the list becomes the default boot target.
	pub fn commit(
		&mut self,
		images: &mut [OsManifest],
		plan: &PartitionPlan,
	) -> Result<()> {
		for p in plan.entries.values() {
			images[p.os_index].partitions[p.part_index].device = p.device.clone();
		}

		table::repartition(plan).context("Unable to partition and prepare the SD card")?;
		debug!("Successfully partitioned the SD card");

		for image in images.iter_mut() {
			self.write_os(image)
				.context(format!("Unable to process image {}", image.name))?;
			info!("Successfully processed {}", image.name);
		}

		let first = &images[0];
		let boot_device = &first
			.partitions
			.first()
			.context("The default OS has no partitions")?
			.device;
		debug!("Setting {} as the default OS", first.name);
		crate::boot::set_default_boot_partition(boot_device)?;

		info!("Finish writing (sync)");
		utils::sync_all();
		Ok(())
	}

	pub fn install(&mut self, mut images: Vec<OsManifest>) -> Result<()> {
		let plan = self.prepare(&images)?;
		self.commit(&mut images, &plan)
	}

	/// Write all partitions of one OS, drop its configuration records into
	/// its first partition, run its setup script, and record the install.
	fn write_os(&mut self, image: &mut OsManifest) -> Result<()> {
		debug!("Processing OS: {}", image.name);

		let os_name = image.name.clone();
		for partition in image.partitions.iter_mut() {
			image::write_partition(&os_name, partition)?;
		}
		info!("Finished processing all partitions for {}", image.name);

		let first = image
			.partitions
			.first()
			.context("OS has no partitions")?
			.clone();
		info!("{}: Mounting first partition", image.name);
		let guard = utils::mount_guard(&first.device, utils::IMAGE_MOUNT_DIR, &first.fs_type)
			.context(format!(
				"{}: Error mounting file system on partition {}",
				image.name, first.device
			))?;

		let settings = state::read_display_settings();

		info!("{}: Creating os_config.json", image.name);
		image::write_os_config(image, &settings)?;

		info!("{}: Saving display mode to config.txt", image.name);
		image::patch_config_txt(&settings)?;

		if !image.partition_setup_script.is_empty() {
			postinstall::run_partition_setup(image)?;
		} else {
			debug!("No post-install script available");
		}

		info!("{}: Unmounting first partition", image.name);
		guard.release();

		/* Record the install; the file is rewritten after every OS so a
		 * later failure keeps what already succeeded on disk. */
		debug!("Modifying installed_os.json");
		self.installed.push(InstalledOs {
			name: image.flavour.clone(),
			description: image.description.clone(),
			folder: image.folder.clone(),
			release_date: image.release_date.clone(),
			partitions: image.partition_devices(),
			bootable: image.bootable,
		});
		state::save_installed(&self.installed)?;
		utils::sync_filesystem(&utils::SETTINGS_DIR)?;
		Ok(())
	}
}
