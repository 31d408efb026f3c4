use chrono::{DateTime, Utc};

/// Message priority, 1 (lowest) through 5 (highest).
///
/// Priorities are respected within a queue; there is no ordering guarantee
/// across queues or across distinct priorities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Priority = Priority(1);
    pub const MAX: Priority = Priority(5);

    pub fn new(value: u8) -> Result<Self, String> {
        if (1..=5).contains(&value) {
            Ok(Priority(value))
        } else {
            Err(format!("priority must be 1..=5, got {value}"))
        }
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl serde::Serialize for Priority {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u8(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Priority {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        let value = u8::deserialize(deserializer)?;
        Priority::new(value).map_err(D::Error::custom)
    }
}

/// One extract request, as published on the imaging queues.
///
/// (MRN, accession number) uniquely identifies a study/report pair within the
/// hospital; when `study_uid` is present it takes precedence for matching.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractRequest {
    pub mrn: String,
    pub accession_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub study_uid: Option<String>,
    pub study_date: DateTime<Utc>,
    pub project_name: String,
    pub extract_datetime: DateTime<Utc>,
    pub priority: Priority,
}

impl ExtractRequest {
    /// The identity used to match this request against a DICOM source.
    pub fn query(&self) -> StudyQuery {
        match &self.study_uid {
            Some(uid) if !uid.is_empty() => StudyQuery::StudyUid(uid.clone()),
            _ => StudyQuery::MrnAccession {
                mrn: self.mrn.clone(),
                accession_number: self.accession_number.clone(),
            },
        }
    }

    /// The ledger key for this request: the study UID when known, otherwise
    /// the (MRN, accession) pair in its canonical `mrn:accession` form.
    pub fn source_key(&self) -> String {
        match &self.study_uid {
            Some(uid) if !uid.is_empty() => uid.clone(),
            _ => format!("{}:{}", self.mrn, self.accession_number),
        }
    }
}

/// How a study is looked up against a modality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StudyQuery {
    StudyUid(String),
    MrnAccession {
        mrn: String,
        accession_number: String,
    },
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn request() -> ExtractRequest {
        ExtractRequest {
            mrn: "M1".to_string(),
            accession_number: "A1".to_string(),
            study_uid: Some("1.2.3.4".to_string()),
            study_date: Utc.with_ymd_and_hms(2023, 1, 2, 3, 4, 5).unwrap(),
            project_name: "p1".to_string(),
            extract_datetime: Utc.with_ymd_and_hms(2023, 6, 7, 8, 9, 10).unwrap(),
            priority: Priority::new(3).unwrap(),
        }
    }

    #[test]
    fn round_trip_is_identity() {
        let before = request();
        let encoded = serde_json::to_vec(&before).unwrap();
        let after: ExtractRequest = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn round_trip_without_study_uid() {
        let mut before = request();
        before.study_uid = None;
        let encoded = serde_json::to_string(&before).unwrap();
        assert!(!encoded.contains("study_uid"));
        let after: ExtractRequest = serde_json::from_str(&encoded).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let mut value = serde_json::to_value(request()).unwrap();
        value["surprise"] = serde_json::json!(true);
        assert!(serde_json::from_value::<ExtractRequest>(value).is_err());
    }

    #[test]
    fn priority_bounds_are_enforced() {
        assert!(Priority::new(0).is_err());
        assert!(Priority::new(6).is_err());
        assert!(serde_json::from_str::<Priority>("0").is_err());
        assert_eq!(serde_json::from_str::<Priority>("5").unwrap(), Priority::MAX);
    }

    #[test]
    fn study_uid_takes_precedence_in_queries() {
        let with_uid = request();
        assert_eq!(
            with_uid.query(),
            StudyQuery::StudyUid("1.2.3.4".to_string())
        );
        assert_eq!(with_uid.source_key(), "1.2.3.4");

        let mut without = request();
        without.study_uid = None;
        assert_eq!(
            without.query(),
            StudyQuery::MrnAccession {
                mrn: "M1".to_string(),
                accession_number: "A1".to_string()
            }
        );
        assert_eq!(without.source_key(), "M1:A1");
    }
}
