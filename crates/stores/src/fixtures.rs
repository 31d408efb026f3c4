//! Part-10 instance fixtures shared by integration tests across the
//! workspace. Not used by production code paths.

use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::tags;
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};

/// Secondary Capture Image Storage.
pub const SC_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.7";
pub const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

/// Everything needed to fabricate one plausible instance.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub study_uid: String,
    pub series_uid: String,
    pub sop_uid: String,
    pub modality: String,
    pub series_description: String,
    pub series_number: i64,
    pub manufacturer: String,
    pub patient_id: String,
    pub patient_name: String,
    pub accession_number: String,
    pub study_date: String,
    pub study_time: String,
    pub extra: Vec<(Tag, VR, String)>,
}

impl InstanceSpec {
    pub fn new(study_uid: &str, series_uid: &str, sop_uid: &str) -> Self {
        InstanceSpec {
            study_uid: study_uid.to_string(),
            series_uid: series_uid.to_string(),
            sop_uid: sop_uid.to_string(),
            modality: "CT".to_string(),
            series_description: "AX HEAD".to_string(),
            series_number: 1,
            manufacturer: "SIEMENS".to_string(),
            patient_id: "M1".to_string(),
            patient_name: "DOE^JANE".to_string(),
            accession_number: "A1".to_string(),
            study_date: "20230102".to_string(),
            study_time: "101500".to_string(),
            extra: Vec::new(),
        }
    }

    pub fn with(mut self, tag: Tag, vr: VR, value: &str) -> Self {
        self.extra.push((tag, vr, value.to_string()));
        self
    }

    /// The dataset alone, without file meta.
    pub fn dataset(&self) -> InMemDicomObject {
        let mut object = InMemDicomObject::new_empty();
        let mut put = |tag: Tag, vr: VR, value: &str| {
            object.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
        };
        put(tags::SOP_CLASS_UID, VR::UI, SC_SOP_CLASS);
        put(tags::SOP_INSTANCE_UID, VR::UI, &self.sop_uid);
        put(tags::STUDY_INSTANCE_UID, VR::UI, &self.study_uid);
        put(tags::SERIES_INSTANCE_UID, VR::UI, &self.series_uid);
        put(tags::MODALITY, VR::CS, &self.modality);
        put(tags::SERIES_DESCRIPTION, VR::LO, &self.series_description);
        put(tags::MANUFACTURER, VR::LO, &self.manufacturer);
        put(tags::PATIENT_ID, VR::LO, &self.patient_id);
        put(tags::PATIENT_NAME, VR::PN, &self.patient_name);
        put(tags::ACCESSION_NUMBER, VR::SH, &self.accession_number);
        put(tags::STUDY_DATE, VR::DA, &self.study_date);
        put(tags::STUDY_TIME, VR::TM, &self.study_time);
        put(
            tags::SERIES_NUMBER,
            VR::IS,
            &self.series_number.to_string(),
        );
        for (tag, vr, value) in &self.extra {
            object.put(DataElement::new(*tag, *vr, PrimitiveValue::from(value.as_str())));
        }
        object
    }

    /// The full part-10 encoding of this instance.
    pub fn encode(&self) -> Vec<u8> {
        let object = self.dataset();
        let file = object
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax(EXPLICIT_VR_LE)
                    .media_storage_sop_class_uid(SC_SOP_CLASS)
                    .media_storage_sop_instance_uid(self.sop_uid.as_str()),
            )
            .expect("valid file meta");
        let mut bytes = Vec::new();
        file.write_all(&mut bytes).expect("in-memory write");
        bytes
    }
}
