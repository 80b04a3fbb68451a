//! Typed, validated in-memory description of what to install.
//!
//! An [`OsManifest`] is assembled from the JSON document posted to the
//! install endpoint. The top-level entry carries the name, the tarball URLs
//! and pointers to two nested metadata documents (`os_info` and
//! `partitions_info`) plus an optional partition-setup script, all of which
//! are downloaded during resolution.

use anyhow::{bail, Context, Result};
use log::{debug, warn};
use serde::Deserialize;
use serde_json::Value;

use crate::fetch::Fetch;
use crate::utils;

const DEVICE_TREE_MODEL: &str = "/proc/device-tree/model";

/// One partition of an OS, as described by the `partitions_info` document.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PartitionSpec {
	#[serde(rename = "filesystem_type")]
	pub fs_type: String,
	/// MBR type byte, hex. Derived from the filesystem type when absent.
	#[serde(default)]
	pub partition_type: Option<String>,
	#[serde(default)]
	pub label: String,
	#[serde(default)]
	pub mkfs_options: String,
	/// Nominal partition size in MiB.
	#[serde(default)]
	pub partition_size_nominal: u64,
	/// Uncompressed content size in MiB, used for the space pre-check.
	#[serde(default)]
	pub uncompressed_tarball_size: u64,
	/// 0 = any logical slot, otherwise a pinned MBR slot.
	#[serde(default)]
	pub requires_partition_number: u32,
	/// 0 = the planner chooses, otherwise a fixed starting sector.
	#[serde(default, rename = "offset_in_sectors")]
	pub offset: u64,
	#[serde(default)]
	pub want_maximised: bool,
	#[serde(default)]
	pub empty_fs: bool,
	#[serde(default)]
	pub active: bool,

	/// Source of the partition's content; empty for an empty filesystem.
	#[serde(skip)]
	pub tarball: String,
	/// Assigned by the planner, e.g. `/dev/mmcblk0p7`.
	#[serde(skip)]
	pub device: String,
}

impl PartitionSpec {
	/// The MBR type byte as passed to sfdisk, defaulted from the filesystem.
	pub fn partition_type(&self) -> String {
		if let Some(t) = &self.partition_type {
			return t.clone();
		}
		let fs = self.fs_type.to_ascii_lowercase();
		if fs.contains("fat") {
			"0c".to_string() /* FAT32 LBA */
		} else if fs.contains("swap") {
			"82".to_string()
		} else if fs.contains("ntfs") {
			"07".to_string()
		} else {
			"83".to_string() /* Linux native */
		}
	}

	pub fn is_raw(&self) -> bool {
		self.fs_type == "raw"
	}

	pub fn is_partclone(&self) -> bool {
		self.fs_type.starts_with("partclone")
	}

	pub fn is_unformatted(&self) -> bool {
		self.fs_type == "unformatted"
	}
}

/// One installable operating system.
#[derive(Clone, Debug, Default)]
pub struct OsManifest {
	pub name: String,
	pub flavour: String,
	pub description: String,
	pub version: String,
	pub release_date: String,
	pub bootable: bool,
	pub riscos_offset: Option<u64>,
	pub tarballs: Vec<String>,
	pub partitions: Vec<PartitionSpec>,
	pub partition_setup_script: Vec<u8>,
	/// Logical identifier, derived from the name.
	pub folder: String,
}

/// Top-level wire entry of the install request.
#[derive(Debug, Deserialize)]
struct OsListEntry {
	name: Option<String>,
	os_name: Option<String>,
	flavour: Option<String>,
	bootable: Option<bool>,
	riscos_offset: Option<u64>,
	supported_models: Option<Vec<String>>,
	tarballs: Option<Vec<String>>,
	os_info: Option<String>,
	partitions_info: Option<String>,
	partition_setup: Option<String>,
}

/// Nested `os_info` document.
#[derive(Debug, Deserialize)]
struct OsInfoDoc {
	name: Option<String>,
	flavour: Option<String>,
	bootable: Option<bool>,
	version: Option<String>,
	description: Option<String>,
	release_date: Option<String>,
}

/// Nested `partitions_info` document.
#[derive(Debug, Deserialize)]
struct PartitionsDoc {
	partitions: Vec<PartitionSpec>,
}

pub fn derive_folder(name: &str) -> String {
	name.replace(' ', "_")
}

/// Whether the board's model string satisfies the manifest's list of
/// supported-model substrings. An absent list accepts every board.
pub fn model_supported(model: &str, supported_models: Option<&[String]>) -> bool {
	match supported_models {
		None => true,
		Some(patterns) => {
			let model = model.to_ascii_lowercase();
			// The full formal model name (e.g. "Raspberry Pi 2 Model B
			// Rev 1.1") must contain one of the substrings (e.g. "Pi 2").
			patterns
				.iter()
				.any(|p| model.contains(&p.to_ascii_lowercase()))
		}
	}
}

fn is_data_partition_name(name: &str) -> bool {
	name.to_ascii_lowercase().contains("data partition")
}

impl OsManifest {
	pub fn is_riscos(&self) -> bool {
		self.name.to_ascii_lowercase().contains("risc")
	}

	/// The assigned partition devices, in declaration order.
	pub fn partition_devices(&self) -> Vec<String> {
		self.partitions.iter().map(|p| p.device.clone()).collect()
	}

	/// Build a manifest from one JSON entry, downloading the nested
	/// metadata documents and the partition-setup script.
	pub fn resolve(entry: &Value, fetcher: &dyn Fetch) -> Result<OsManifest> {
		let entry: OsListEntry = serde_json::from_value(entry.clone())
			.context("Unable to parse the OS entry")?;

		let name = entry
			.name
			.or(entry.os_name)
			.filter(|n| !n.is_empty())
			.context("OS entry has no name")?;
		debug!("Resolving OS '{}'", name);

		let mut manifest = OsManifest {
			folder: derive_folder(&name),
			bootable: entry
				.bootable
				.unwrap_or_else(|| !is_data_partition_name(&name)),
			flavour: entry.flavour.unwrap_or_else(|| name.clone()),
			name,
			..Default::default()
		};

		if !manifest.bootable && !is_data_partition_name(&manifest.name) {
			bail!("OS '{}' is not bootable", manifest.name);
		}

		if manifest.is_riscos() {
			let offset = entry.riscos_offset.unwrap_or_else(|| {
				warn!("Using default RISC OS offset");
				crate::planner::RISCOS_OFFSET
			});
			if offset != crate::planner::RISCOS_OFFSET {
				warn!("RISC OS offset does not match the expected value");
			}
			manifest.riscos_offset = Some(offset);
		}

		let model = utils::get_file_contents(DEVICE_TREE_MODEL).unwrap_or_default();
		if !model_supported(&model, entry.supported_models.as_deref()) {
			bail!(
				"Model '{}' is not listed as a supported device: {}",
				model.trim(),
				entry.supported_models.unwrap_or_default().join(", ")
			);
		}

		manifest.tarballs = entry
			.tarballs
			.context(format!("OS '{}' carries no tarball list", manifest.name))?;

		let os_info_url = entry
			.os_info
			.context(format!("OS '{}' carries no os_info URL", manifest.name))?;
		manifest.merge_os_info(&os_info_url, fetcher)?;

		let partitions_url = entry.partitions_info.context(format!(
			"OS '{}' carries no partitions_info URL",
			manifest.name
		))?;
		manifest.load_partitions(&partitions_url, fetcher)?;

		match entry.partition_setup {
			Some(url) if !url.is_empty() => {
				debug!("Found partition setup URL {}", url);
				manifest.partition_setup_script = fetcher
					.get(&url)
					.context("Unable to download the partition setup script")?;
			}
			_ => warn!("No partition setup script for '{}'", manifest.name),
		}

		Ok(manifest)
	}

	fn merge_os_info(&mut self, url: &str, fetcher: &dyn Fetch) -> Result<()> {
		let raw = fetcher.get(url)?;
		let info: OsInfoDoc =
			serde_json::from_slice(&raw).context("Unable to parse the os_info document")?;
		if let Some(name) = info.name {
			debug!("os_info overrides the OS name with '{}'", name);
			self.folder = derive_folder(&name);
			self.name = name;
		}
		if let Some(bootable) = info.bootable {
			self.bootable = bootable;
			if !bootable && !is_data_partition_name(&self.name) {
				bail!("os_info marks '{}' as not bootable", self.name);
			}
		}
		if let Some(flavour) = info.flavour {
			self.flavour = flavour;
		}
		if let Some(version) = info.version {
			self.version = version;
		}
		if let Some(description) = info.description {
			self.description = description;
		}
		if let Some(release_date) = info.release_date {
			self.release_date = release_date;
		}
		Ok(())
	}

	fn load_partitions(&mut self, url: &str, fetcher: &dyn Fetch) -> Result<()> {
		let raw = fetcher.get(url)?;
		let doc: PartitionsDoc = serde_json::from_slice(&raw)
			.context("Unable to parse the partitions_info document")?;
		if doc.partitions.is_empty() {
			bail!("No partitions specified for '{}'", self.name);
		}
		if doc.partitions.len() < self.tarballs.len() {
			bail!("More tarballs specified than partitions available");
		}
		if doc.partitions.len() > self.tarballs.len() {
			// A partition without a tarball is an unformatted or empty-FS
			// partition.
			warn!(
				"More partitions than tarballs for '{}', filling the gap with empty entries",
				self.name
			);
			self.tarballs
				.resize(doc.partitions.len(), String::new());
		}
		self.partitions = doc.partitions;
		for (partition, tarball) in self.partitions.iter_mut().zip(&self.tarballs) {
			if partition.fs_type.is_empty() {
				bail!("A partition of '{}' has no filesystem type", self.name);
			}
			partition.tarball = tarball.clone();
		}
		Ok(())
	}
}

/// Accept either a single OS object or a list of them.
pub fn manifest_values(body: &str) -> Result<Vec<Value>> {
	let parsed: Value =
		serde_json::from_str(body).context("Request body is not valid JSON")?;
	match parsed {
		Value::Array(list) => {
			if list.is_empty() {
				bail!("Empty OS list");
			}
			Ok(list)
		}
		object @ Value::Object(_) => Ok(vec![object]),
		_ => bail!("Expected an OS object or a list of OS objects"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;

	struct MapFetcher(HashMap<&'static str, &'static str>);

	impl Fetch for MapFetcher {
		fn get(&self, url: &str) -> Result<Vec<u8>> {
			self.0
				.get(url)
				.map(|body| body.as_bytes().to_vec())
				.context(format!("no fixture for {}", url))
		}
	}

	fn fixture_fetcher() -> MapFetcher {
		let mut map = HashMap::new();
		map.insert(
			"http://h/os.json",
			r#"{"name": "Raspbian Lite", "version": "1.2", "release_date": "2016-09-23", "description": "A minimal Raspbian"}"#,
		);
		map.insert(
			"http://h/partitions.json",
			indoc::indoc! {r#"
			{
				"partitions": [
					{
						"filesystem_type": "FAT",
						"label": "boot",
						"partition_size_nominal": 63,
						"uncompressed_tarball_size": 21
					},
					{
						"filesystem_type": "ext4",
						"label": "root",
						"partition_size_nominal": 3000,
						"uncompressed_tarball_size": 1200,
						"want_maximised": true
					}
				]
			}
			"#},
		);
		map.insert("http://h/setup.sh", "#!/bin/sh\ntrue\n");
		MapFetcher(map)
	}

	fn entry_value() -> Value {
		serde_json::from_str(indoc::indoc! {r#"
		{
			"os_name": "Raspbian Lite",
			"tarballs": ["http://h/boot.tar.xz", "http://h/root.tar.xz"],
			"os_info": "http://h/os.json",
			"partitions_info": "http://h/partitions.json",
			"partition_setup": "http://h/setup.sh"
		}
		"#})
		.unwrap()
	}

	#[test]
	fn test_resolve_full_manifest() -> Result<()> {
		let manifest = OsManifest::resolve(&entry_value(), &fixture_fetcher())?;
		assert_eq!(manifest.name, "Raspbian Lite");
		assert_eq!(manifest.folder, "Raspbian_Lite");
		assert_eq!(manifest.version, "1.2");
		assert_eq!(manifest.release_date, "2016-09-23");
		assert!(manifest.bootable);
		assert_eq!(manifest.partitions.len(), 2);
		assert_eq!(manifest.partitions[0].tarball, "http://h/boot.tar.xz");
		assert_eq!(manifest.partitions[1].tarball, "http://h/root.tar.xz");
		assert_eq!(manifest.partition_setup_script, b"#!/bin/sh\ntrue\n");
		Ok(())
	}

	#[test]
	fn test_partitions_padded_with_empty_tarballs() -> Result<()> {
		let mut entry = entry_value();
		entry["tarballs"] = serde_json::json!(["http://h/boot.tar.xz"]);
		let manifest = OsManifest::resolve(&entry, &fixture_fetcher())?;
		assert_eq!(manifest.partitions.len(), 2);
		assert_eq!(manifest.partitions[1].tarball, "");
		Ok(())
	}

	#[test]
	fn test_more_tarballs_than_partitions_rejected() {
		let mut entry = entry_value();
		entry["tarballs"] = serde_json::json!(["a.tar.xz", "b.tar.xz", "c.tar.xz"]);
		let err = OsManifest::resolve(&entry, &fixture_fetcher()).unwrap_err();
		assert!(err.to_string().contains("More tarballs"));
	}

	#[test]
	fn test_non_bootable_rejected() {
		let mut entry = entry_value();
		entry["bootable"] = serde_json::json!(false);
		assert!(OsManifest::resolve(&entry, &fixture_fetcher()).is_err());
	}

	#[test]
	fn test_data_partition_may_be_non_bootable() -> Result<()> {
		let mut entry = entry_value();
		entry["os_name"] = serde_json::json!("Shared Data Partition");
		entry["bootable"] = serde_json::json!(false);
		// os_info would override the name again, point it at a neutral doc
		let mut fetcher = fixture_fetcher();
		fetcher.0.insert("http://h/os.json", r#"{"release_date": "2016-09-23"}"#);
		let manifest = OsManifest::resolve(&entry, &fetcher)?;
		assert!(!manifest.bootable);
		Ok(())
	}

	#[test]
	fn test_partition_type_defaults() {
		let part = |fs: &str| PartitionSpec {
			fs_type: fs.to_string(),
			..Default::default()
		};
		assert_eq!(part("FAT").partition_type(), "0c");
		assert_eq!(part("fat").partition_type(), "0c");
		assert_eq!(part("swap").partition_type(), "82");
		assert_eq!(part("ntfs").partition_type(), "07");
		assert_eq!(part("ext4").partition_type(), "83");
		assert_eq!(part("raw").partition_type(), "83");
		let explicit = PartitionSpec {
			fs_type: "ext4".to_string(),
			partition_type: Some("0E".to_string()),
			..Default::default()
		};
		assert_eq!(explicit.partition_type(), "0E");
	}

	#[test]
	fn test_model_supported() {
		let patterns = vec!["Pi 2".to_string(), "Pi 3".to_string()];
		assert!(model_supported(
			"Raspberry Pi 2 Model B Rev 1.1",
			Some(&patterns)
		));
		assert!(!model_supported("Raspberry Pi Zero W", Some(&patterns)));
		assert!(model_supported("Raspberry Pi Zero W", None));
	}

	#[test]
	fn test_folder_derivation() {
		assert_eq!(derive_folder("Raspbian Lite"), "Raspbian_Lite");
		assert_eq!(derive_folder("RISC OS"), "RISC_OS");
	}

	#[test]
	fn test_manifest_values_accepts_object_and_list() -> Result<()> {
		let single = manifest_values(r#"{"name": "A"}"#)?;
		assert_eq!(single.len(), 1);
		let list = manifest_values(r#"[{"name": "A"}, {"name": "B"}]"#)?;
		assert_eq!(list.len(), 2);
		assert!(manifest_values("[]").is_err());
		assert!(manifest_values("42").is_err());
		assert!(manifest_values("not json").is_err());
		Ok(())
	}
}
