//! XNAT uploader: posts a DICOM zip to the session-import service of the
//! project whose XNAT project ID equals the project slug.

use crate::{package, TabularFile, UploadError, UploadReceipt, Uploader};
use deident::AnonymisedStudy;
use models::{XnatDestination, XnatOptions, XnatOverwrite};

pub struct XnatUploader {
    endpoint: String,
    username: String,
    password: String,
    options: XnatOptions,
    client: reqwest::Client,
}

impl XnatUploader {
    pub fn new(endpoint: String, username: String, password: String, options: XnatOptions) -> Self {
        XnatUploader {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            username,
            password,
            options,
            client: reqwest::Client::new(),
        }
    }
}

fn overwrite_param(overwrite: XnatOverwrite) -> &'static str {
    match overwrite {
        XnatOverwrite::None => "none",
        XnatOverwrite::Append => "append",
        XnatOverwrite::Delete => "delete",
    }
}

fn destination_param(destination: XnatDestination) -> &'static str {
    match destination {
        XnatDestination::Archive => "/archive",
        XnatDestination::Prearchive => "/prearchive",
    }
}

#[async_trait::async_trait]
impl Uploader for XnatUploader {
    async fn upload_study(
        &self,
        project: &str,
        study: &AnonymisedStudy,
    ) -> Result<UploadReceipt, UploadError> {
        let zip = package::study_zip(study)?;
        let size = zip.len() as u64;
        let url = format!("{}/data/services/import", self.endpoint);

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .query(&[
                ("import-handler", "DICOM-zip"),
                ("project", project),
                ("subject", study.pseudo_patient_id.as_str()),
                ("session", study.pseudo_patient_id.as_str()),
                ("overwrite", overwrite_param(self.options.overwrite)),
                ("dest", destination_param(self.options.destination)),
                ("inbody", "true"),
            ])
            .header(reqwest::header::CONTENT_TYPE, "application/zip")
            .body(zip)
            .send()
            .await
            .map_err(|err| UploadError::Transient(format!("xnat: {err}")))?;

        let status = response.status();
        if status.is_success() {
            tracing::info!(project, url, bytes = size, "imported study into XNAT");
            Ok(UploadReceipt {
                location: format!("{url}?project={project}"),
                bytes: size,
            })
        } else if status.is_server_error() {
            Err(UploadError::Transient(format!("xnat returned {status}")))
        } else {
            Err(UploadError::Permanent(format!("xnat returned {status}")))
        }
    }

    async fn upload_tabular(
        &self,
        _project: &str,
        _extract_datetime: &chrono::DateTime<chrono::Utc>,
        _files: &[TabularFile],
    ) -> Result<UploadReceipt, UploadError> {
        Err(UploadError::Permanent(
            "XNAT destinations do not accept tabular extracts".to_string(),
        ))
    }

    async fn close(&self) -> Result<(), UploadError> {
        Ok(())
    }
}
