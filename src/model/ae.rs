//! Application Entity (AE) flavors: the four kinds of named endpoint the
//! gateway deals with.

use crate::error::ValidationError;
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::time::SystemTime;

/// A validated AE title: `1..=16` ASCII characters from
/// `[A-Za-z0-9._-]`, trimmed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AeTitle(String);

impl AeTitle {
	pub fn parse(value: impl AsRef<str>) -> Result<Self, ValidationError> {
		let trimmed = value.as_ref().trim();
		let valid = !trimmed.is_empty()
			&& trimmed.len() <= 16
			&& trimmed
				.chars()
				.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
		if valid {
			Ok(Self(trimmed.to_owned()))
		} else {
			Err(ValidationError::InvalidAeTitle(value.as_ref().to_owned()))
		}
	}

	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for AeTitle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl TryFrom<String> for AeTitle {
	type Error = ValidationError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		Self::parse(value)
	}
}

impl From<AeTitle> for String {
	fn from(value: AeTitle) -> Self {
		value.0
	}
}

/// A DICOM tag used as the assembler's grouping key, restricted to the
/// whitelist of tags the assembler is allowed to group by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum GroupingTag {
	StudyInstanceUid,
	SeriesInstanceUid,
}

impl GroupingTag {
	pub const DEFAULT: Self = Self::StudyInstanceUid;

	fn as_tag_str(self) -> &'static str {
		match self {
			Self::StudyInstanceUid => "0020,000D",
			Self::SeriesInstanceUid => "0020,000E",
		}
	}
}

impl Default for GroupingTag {
	fn default() -> Self {
		Self::DEFAULT
	}
}

impl TryFrom<String> for GroupingTag {
	type Error = ValidationError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		match value.trim() {
			"0020,000D" => Ok(Self::StudyInstanceUid),
			"0020,000E" => Ok(Self::SeriesInstanceUid),
			other => Err(ValidationError::InvalidGroupingTag(other.to_owned())),
		}
	}
}

impl From<GroupingTag> for String {
	fn from(value: GroupingTag) -> Self {
		value.as_tag_str().to_owned()
	}
}

/// Mutually-exclusive SOP class admission filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SopClassFilter {
	#[default]
	None,
	Allowed(HashSet<String>),
	Ignored(HashSet<String>),
}

impl SopClassFilter {
	/// Builds a filter from the two raw sets, enforcing the invariant that
	/// at most one may be non-empty.
	pub fn new(allowed: HashSet<String>, ignored: HashSet<String>) -> Result<Self, ValidationError> {
		match (allowed.is_empty(), ignored.is_empty()) {
			(true, true) => Ok(Self::None),
			(false, true) => Ok(Self::Allowed(allowed)),
			(true, false) => Ok(Self::Ignored(ignored)),
			(false, false) => Err(ValidationError::ConflictingSopClassFilters),
		}
	}

	/// Whether an instance of `sop_class_uid` should be stored.
	#[must_use]
	pub fn admits(&self, sop_class_uid: &str) -> bool {
		match self {
			Self::None => true,
			Self::Allowed(set) => set.contains(sop_class_uid),
			Self::Ignored(set) => !set.contains(sop_class_uid),
		}
	}
}

/// Fields shared by every AE flavor.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AeBase {
	pub name: String,
	pub aet: AeTitle,
	pub host_ip: Option<IpAddr>,
	pub port: Option<u16>,
	pub created_by: String,
	pub updated_by: String,
	pub created_at: SystemTime,
	pub updated_at: SystemTime,
}

/// Distinguishes a fresh insert from a field update, mirroring the audit
/// bookkeeping the entities carry in the originating system.
pub enum EditMode {
	Create,
	Update,
}

impl AeBase {
	/// Applies audit bookkeeping for a create-or-update write.
	///
	/// Preserved as specified: on `Update`, `updated_by`/`updated_at` are
	/// refreshed but `created_by` is left untouched even though it was never
	/// set to begin with on an entity built outside `Create` mode. This is
	/// the same asymmetry the originating system has; callers must not
	/// "fix" it by also stamping `created_by` during `Update`.
	pub fn apply_audit(&mut self, mode: EditMode, actor: &str, now: SystemTime) {
		match mode {
			EditMode::Create => {
				self.created_by = actor.to_owned();
				self.created_at = now;
				self.updated_by = actor.to_owned();
				self.updated_at = now;
			}
			EditMode::Update => {
				self.updated_by = actor.to_owned();
				self.updated_at = now;
			}
		}
	}

	/// Mirrors `SetDefaultValues` copying the AE title into `name` when the
	/// name was left empty. Preserved as specified even though it makes name
	/// collisions easy across AE flavors that share an AE title.
	pub fn apply_default_name(&mut self) {
		if self.name.trim().is_empty() {
			self.name = self.aet.as_str().to_owned();
		}
	}
}

/// Local SCP target: an AE the gateway groups and publishes workflow
/// requests for.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MonaiApplicationEntity {
	pub base: AeBase,
	pub grouping: GroupingTag,
	pub workflows: HashSet<String>,
	pub sop_class_filter: SopClassFilter,
	pub plug_in_assemblies: Vec<String>,
	pub timeout: u32,
}

impl MonaiApplicationEntity {
	pub const DEFAULT_TIMEOUT_SECONDS: u32 = 5;
}

/// Peer allowed to push data to a `MonaiApplicationEntity`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SourceApplicationEntity {
	pub base: AeBase,
}

/// Remote DIMSE target the export pipeline can send to.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DestinationApplicationEntity {
	pub base: AeBase,
}

/// DICOMweb endpoint with no network identity of its own.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VirtualApplicationEntity {
	pub name: String,
	pub workflows: HashSet<String>,
	pub plug_in_assemblies: Vec<String>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ae_title_accepts_boundary_lengths() {
		assert!(AeTitle::parse("A").is_ok());
		assert!(AeTitle::parse("A".repeat(16)).is_ok());
		assert!(AeTitle::parse("A".repeat(17)).is_err());
		assert!(AeTitle::parse("").is_err());
		assert!(AeTitle::parse("  ").is_err());
	}

	#[test]
	fn ae_title_trims_whitespace() {
		assert_eq!(AeTitle::parse("  PACS1  ").unwrap().as_str(), "PACS1");
	}

	#[test]
	fn ae_title_rejects_disallowed_characters() {
		assert!(AeTitle::parse("PACS 1").is_err());
		assert!(AeTitle::parse("PACS@1").is_err());
	}

	#[test]
	fn sop_class_filter_rejects_both_non_empty() {
		let allowed = HashSet::from([String::from("1.2.840.10008.5.1.4.1.1.1")]);
		let ignored = HashSet::from([String::from("1.2.840.10008.5.1.4.1.1.2")]);
		assert_eq!(
			SopClassFilter::new(allowed, ignored),
			Err(ValidationError::ConflictingSopClassFilters)
		);
	}

	#[test]
	fn sop_class_filter_allows_everything_by_default() {
		let filter = SopClassFilter::new(HashSet::new(), HashSet::new()).unwrap();
		assert!(filter.admits("1.2.840.10008.5.1.4.1.1.1"));
	}

	#[test]
	fn grouping_tag_rejects_tags_outside_whitelist() {
		assert!(GroupingTag::try_from(String::from("0008,0018")).is_err());
		assert_eq!(GroupingTag::try_from(String::from("0020,000D")).unwrap(), GroupingTag::StudyInstanceUid);
	}

	#[test]
	fn apply_default_name_copies_ae_title_when_empty() {
		let mut base = AeBase {
			name: String::new(),
			aet: AeTitle::parse("PACS1").unwrap(),
			host_ip: None,
			port: None,
			created_by: String::new(),
			updated_by: String::new(),
			created_at: SystemTime::UNIX_EPOCH,
			updated_at: SystemTime::UNIX_EPOCH,
		};
		base.apply_default_name();
		assert_eq!(base.name, "PACS1");
	}
}
