//! Zip packaging of anonymised studies: one zip per study, instances laid
//! out as `<series-number>/<sop-uid>.dcm`.

use crate::UploadError;
use deident::AnonymisedStudy;
use std::io::Write;
use zip::write::FileOptions;

pub fn study_zip(study: &AnonymisedStudy) -> Result<Vec<u8>, UploadError> {
    let permanent = |err: &dyn std::fmt::Display| UploadError::Permanent(format!("zip: {err}"));

    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for instance in &study.instances {
        let series = instance.series_number.unwrap_or(0);
        let name = format!("{series}/{}.dcm", instance.sop_uid);
        writer.start_file(name, options).map_err(|e| permanent(&e))?;
        writer
            .write_all(&instance.bytes)
            .map_err(|e| permanent(&e))?;
    }

    let cursor = writer.finish().map_err(|e| permanent(&e))?;
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod test {
    use super::*;
    use deident::AnonymisedInstance;

    fn study() -> AnonymisedStudy {
        AnonymisedStudy {
            study_uid: "2.9.1".to_string(),
            pseudo_patient_id: "abc123".to_string(),
            instances: vec![
                AnonymisedInstance {
                    sop_uid: "2.9.1.1".to_string(),
                    series_uid: "2.9.1.0".to_string(),
                    series_number: Some(3),
                    bytes: b"first".to_vec(),
                },
                AnonymisedInstance {
                    sop_uid: "2.9.1.2".to_string(),
                    series_uid: "2.9.1.0".to_string(),
                    series_number: None,
                    bytes: b"second".to_vec(),
                },
            ],
            skipped: Vec::new(),
        }
    }

    #[test]
    fn zips_lay_instances_out_by_series() {
        let bytes = study_zip(&study()).unwrap();
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();

        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(names, vec!["3/2.9.1.1.dcm", "0/2.9.1.2.dcm"]);

        let mut first = String::new();
        std::io::Read::read_to_string(
            &mut archive.by_name("3/2.9.1.1.dcm").unwrap(),
            &mut first,
        )
        .unwrap();
        assert_eq!(first, "first");
    }
}
