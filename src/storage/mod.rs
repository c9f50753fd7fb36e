//! Object storage and local disk-space accounting.

pub mod memory;
pub mod object_store;
#[cfg(feature = "s3")]
pub mod s3;
pub mod temp;

pub use object_store::{ObjectStore, ObjectStoreError};
pub use temp::{InMemoryTemporaryStore, LocalDiskTemporaryStore, TempHandle, TempStoreError, TemporaryStore};

use crate::config::StorageConfig;
use std::path::Path;
use sysinfo::Disks;

/// Reports whether the local temporary-storage volume has enough headroom to
/// accept more data — storage is considered full once used space crosses
/// `watermarkPercent`, or once free space drops below `reserveSpaceGb`.
pub trait StorageInfoProvider: Send + Sync {
	fn has_space_to_store(&self) -> bool;
	fn has_space_to_export(&self) -> bool {
		self.has_space_to_store()
	}
}

/// Default [`StorageInfoProvider`], backed by `sysinfo`'s disk listing rather
/// than shelling out to `df`.
pub struct SysinfoStorageInfoProvider {
	path: std::path::PathBuf,
	watermark_percent: u8,
	reserve_space_gb: u32,
}

impl SysinfoStorageInfoProvider {
	#[must_use]
	pub fn new(config: &StorageConfig) -> Self {
		Self {
			path: config.local_temporary_storage_path.clone(),
			watermark_percent: config.watermark_percent,
			reserve_space_gb: config.reserve_space_gb,
		}
	}

	fn disk_usage(&self) -> Option<(u64, u64)> {
		let disks = Disks::new_with_refreshed_list();
		let mount = find_mount_for(&disks, &self.path)?;
		Some((mount.total_space(), mount.available_space()))
	}
}

fn find_mount_for<'a>(disks: &'a Disks, path: &Path) -> Option<&'a sysinfo::Disk> {
	disks
		.list()
		.iter()
		.filter(|disk| path.starts_with(disk.mount_point()))
		.max_by_key(|disk| disk.mount_point().as_os_str().len())
}

impl StorageInfoProvider for SysinfoStorageInfoProvider {
	fn has_space_to_store(&self) -> bool {
		let Some((total, available)) = self.disk_usage() else {
			// No matching mount (e.g. the path does not exist yet in tests) —
			// fail open to "has space" rather than reject admission at startup.
			return true;
		};
		if total == 0 {
			return true;
		}
		let used_percent = 100 - (available * 100 / total);
		let reserve_bytes = u64::from(self.reserve_space_gb) * 1024 * 1024 * 1024;
		used_percent < u64::from(self.watermark_percent) && available > reserve_bytes
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct FakeStorageInfoProvider(bool);

	impl StorageInfoProvider for FakeStorageInfoProvider {
		fn has_space_to_store(&self) -> bool {
			self.0
		}
	}

	#[test]
	fn has_space_to_export_defaults_to_has_space_to_store() {
		let provider = FakeStorageInfoProvider(false);
		assert_eq!(provider.has_space_to_export(), provider.has_space_to_store());
	}
}
