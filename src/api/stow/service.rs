//! STOW-RS result dataset: `ReferencedSOPSequence` /
//! `FailedSOPSequence`, carrying a `WarningReason`/`FailureReason` per item
//! alongside the referenced SOP instance/class UID pair, per
//! <https://dicom.nema.org/medical/dicom/current/output/html/part18.html#sect_6.6.1.2>.

use crate::types::UI;
use dicom::core::value::{DataSetSequence, Value};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;

/// <https://dicom.nema.org/medical/dicom/current/output/html/part03.html#table_10-11>
#[derive(Debug)]
pub struct ReferencedInstance {
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	/// Set when the instance was filtered rather than stored unmodified
	/// (`IngestOutcome::Filtered`), mirroring `DimseStatus::SuccessWithWarning`.
	pub warning_reason: Option<u16>,
}

#[derive(Debug)]
pub struct FailedInstance {
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	pub failure_reason: u16,
}

#[derive(Debug, Default)]
pub struct StoreResponse {
	pub failed_sequence: Vec<FailedInstance>,
	pub referenced_sequence: Vec<ReferencedInstance>,
}

impl StoreResponse {
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.failed_sequence.is_empty() && self.referenced_sequence.is_empty()
	}
}

impl From<StoreResponse> for InMemDicomObject {
	fn from(response: StoreResponse) -> Self {
		let mut object = Self::new_empty();

		let mut referenced_sequence =
			InMemElement::new(tags::REFERENCED_SOP_SEQUENCE, VR::SQ, Value::Sequence(DataSetSequence::empty()));
		let referenced_items = referenced_sequence.items_mut().expect("Sequence exists");
		let mut failed_sequence =
			InMemElement::new(tags::FAILED_SOP_SEQUENCE, VR::SQ, Value::Sequence(DataSetSequence::empty()));
		let failed_items = failed_sequence.items_mut().expect("Sequence exists");

		for referenced in response.referenced_sequence {
			let mut item = Self::from_element_iter([
				DataElement::new(tags::REFERENCED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, referenced.sop_instance_uid)),
				DataElement::new(tags::REFERENCED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, referenced.sop_class_uid)),
			]);
			if let Some(warning_reason) = referenced.warning_reason {
				item.put(DataElement::new(tags::WARNING_REASON, VR::US, dicom_value!(U16, [warning_reason])));
			}
			referenced_items.push(item);
		}

		for failed in response.failed_sequence {
			let item = Self::from_element_iter([
				DataElement::new(tags::REFERENCED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, failed.sop_instance_uid)),
				DataElement::new(tags::REFERENCED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, failed.sop_class_uid)),
				DataElement::new(tags::FAILURE_REASON, VR::US, dicom_value!(U16, [failed.failure_reason])),
			]);
			failed_items.push(item);
		}

		object.put(referenced_sequence);
		object.put(failed_sequence);
		object
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::object::mem::InMemElement as Element;

	#[test]
	fn failed_instance_carries_a_failure_reason() {
		let response = StoreResponse {
			failed_sequence: vec![FailedInstance {
				sop_class_uid: String::from("1.2.840.10008.5.1.4.1.1.1"),
				sop_instance_uid: String::from("1.2.3"),
				failure_reason: 0x0110,
			}],
			referenced_sequence: vec![],
		};
		let object: InMemDicomObject = response.into();
		let failed = object.get(tags::FAILED_SOP_SEQUENCE).unwrap();
		let item = &failed.items().unwrap()[0];
		let reason: Element = item.get(tags::FAILURE_REASON).unwrap().clone();
		assert_eq!(reason.to_int::<u16>().unwrap(), 0x0110);
	}

	#[test]
	fn empty_response_reports_empty() {
		assert!(StoreResponse::default().is_empty());
	}
}
