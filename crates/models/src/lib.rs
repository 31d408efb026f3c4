mod errors;
mod message;
mod project;
mod tags;

pub use errors::ErrorKind;
pub use message::{ExtractRequest, Priority, StudyQuery};
pub use project::{
    DestinationSpec, DicomDestination, ManufacturerRule, ParquetDestination, ProjectConfig,
    XnatDestination, XnatOptions, XnatOverwrite,
};
pub use tags::{ManufacturerOverride, ResolvedScheme, TagDirective, TagKey, TagOperation, TagScheme};

/// State of one (project, source study) pair in the export ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportState {
    Pending,
    Anonymised,
    Exported,
    Failed,
}

impl ExportState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportState::Pending => "pending",
            ExportState::Anonymised => "anonymised",
            ExportState::Exported => "exported",
            ExportState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ExportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExportState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExportState::Pending),
            "anonymised" => Ok(ExportState::Anonymised),
            "exported" => Ok(ExportState::Exported),
            "failed" => Ok(ExportState::Failed),
            other => Err(format!("unknown export state {other:?}")),
        }
    }
}

impl TryFrom<String> for ExportState {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Which of the two configured DICOM sources a query is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Primary,
    Secondary,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Primary => "primary",
            SourceKind::Secondary => "secondary",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod test {
    use super::ExportState;

    #[test]
    fn export_state_round_trips_through_strings() {
        for state in [
            ExportState::Pending,
            ExportState::Anonymised,
            ExportState::Exported,
            ExportState::Failed,
        ] {
            let parsed: ExportState = state.as_str().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert!("queued".parse::<ExportState>().is_err());
    }
}
