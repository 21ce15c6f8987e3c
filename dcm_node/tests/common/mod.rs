//! Helpers for building DICOM test files on disk.

use std::path::Path;

use dicom_core::value::PrimitiveValue;
use dicom_core::{DataElement, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_dictionary_std::uids;
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};

pub struct TestObject {
    pub sop_class_uid: String,
    pub dataset: InMemDicomObject,
}

impl TestObject {
    pub fn new(sop_class_uid: &str, modality: &str, sop_instance_uid: &str) -> Self {
        let mut dataset = InMemDicomObject::new_empty();
        dataset.put(DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(sop_class_uid),
        ));
        dataset.put(DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(sop_instance_uid),
        ));
        dataset.put(DataElement::new(
            tags::MODALITY,
            VR::CS,
            PrimitiveValue::from(modality),
        ));
        Self {
            sop_class_uid: sop_class_uid.to_string(),
            dataset,
        }
    }

    pub fn with_str(mut self, tag: Tag, vr: VR, value: &str) -> Self {
        self.dataset
            .put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
        self
    }

    pub fn patient(self, id: &str, name: &str) -> Self {
        self.with_str(tags::PATIENT_ID, VR::LO, id)
            .with_str(tags::PATIENT_NAME, VR::PN, name)
    }

    pub fn study(self, study_uid: &str) -> Self {
        self.with_str(tags::STUDY_INSTANCE_UID, VR::UI, study_uid)
    }

    pub fn frame_of_reference(self, for_uid: &str) -> Self {
        self.with_str(tags::FRAME_OF_REFERENCE_UID, VR::UI, for_uid)
    }

    /// Writes the object as a complete part-10 file.
    pub fn write(self, path: &Path) {
        let sop_uid = self
            .dataset
            .element(tags::SOP_INSTANCE_UID)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let meta = FileMetaTableBuilder::new()
            .transfer_syntax(uids::IMPLICIT_VR_LITTLE_ENDIAN)
            .media_storage_sop_class_uid(self.sop_class_uid)
            .media_storage_sop_instance_uid(sop_uid)
            .build()
            .unwrap();
        self.dataset
            .with_exact_meta(meta)
            .write_to_file(path)
            .unwrap();
    }

    /// The dataset serialized as Implicit VR LE bytes, as it would travel
    /// on the wire.
    pub fn wire_bytes(&self) -> Vec<u8> {
        let mut data = Vec::new();
        self.dataset
            .write_dataset_with_ts(
                &mut data,
                &dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
            )
            .unwrap();
        data
    }
}

pub fn ct(sop_uid: &str, patient_id: &str, study_uid: &str, for_uid: &str) -> TestObject {
    TestObject::new(uids::CT_IMAGE_STORAGE, "CT", sop_uid)
        .patient(patient_id, "Doe^Jane")
        .study(study_uid)
        .frame_of_reference(for_uid)
}

pub fn rt_plan(
    sop_uid: &str,
    patient_id: &str,
    study_uid: &str,
    for_uid: &str,
    label: &str,
) -> TestObject {
    TestObject::new(uids::RT_PLAN_STORAGE, "RTPLAN", sop_uid)
        .patient(patient_id, "Doe^Jane")
        .study(study_uid)
        .frame_of_reference(for_uid)
        .with_str(tags::RT_PLAN_LABEL, VR::SH, label)
}

pub fn rt_struct(
    sop_uid: &str,
    patient_id: &str,
    study_uid: &str,
    for_uid: &str,
) -> TestObject {
    TestObject::new(uids::RT_STRUCTURE_SET_STORAGE, "RTSTRUCT", sop_uid)
        .patient(patient_id, "Doe^Jane")
        .study(study_uid)
        .frame_of_reference(for_uid)
}

/// A dose dataset referencing a plan through
/// `ReferencedRTPlanSequence[0].ReferencedSOPInstanceUID`.
pub fn rt_dose(
    sop_uid: &str,
    patient_id: &str,
    study_uid: &str,
    referenced_plan_uid: &str,
) -> TestObject {
    let mut object = TestObject::new(uids::RT_DOSE_STORAGE, "RTDOSE", sop_uid)
        .patient(patient_id, "Doe^Jane")
        .study(study_uid)
        .with_str(tags::SERIES_DESCRIPTION, VR::LO, "PlanDose");
    let mut item = InMemDicomObject::new_empty();
    item.put(DataElement::new(
        tags::REFERENCED_SOP_CLASS_UID,
        VR::UI,
        PrimitiveValue::from(uids::RT_PLAN_STORAGE),
    ));
    item.put(DataElement::new(
        tags::REFERENCED_SOP_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from(referenced_plan_uid),
    ));
    object.dataset.put(DataElement::new(
        tags::REFERENCED_RT_PLAN_SEQUENCE,
        VR::SQ,
        dicom_core::value::DataSetSequence::from(vec![item]),
    ));
    object
}
