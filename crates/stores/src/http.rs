use crate::{DicomStore, InstanceInfo, Level, QueryAnswer, Statistics, StoreError, StudyInfo};
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct HttpStoreConfig {
    pub base_url: url::Url,
    pub username: String,
    pub password: String,
    /// The AE title transfers are addressed to; this store's own title.
    pub local_aet: String,
}

/// An Orthanc-style store driven over HTTP with basic auth.
pub struct HttpStore {
    config: HttpStoreConfig,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct QueryCreated {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Deserialize)]
struct StudyResource {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "IsStable", default)]
    is_stable: bool,
    #[serde(rename = "MainDicomTags", default)]
    main_dicom_tags: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct SeriesResource {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "MainDicomTags", default)]
    main_dicom_tags: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct InstanceResource {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "ParentSeries", default)]
    parent_series: String,
    #[serde(rename = "MainDicomTags", default)]
    main_dicom_tags: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct StudyStatistics {
    #[serde(rename = "CountInstances", default)]
    count_instances: u32,
}

#[derive(Deserialize)]
struct StoreStatistics {
    #[serde(rename = "TotalDiskSizeMB", default)]
    total_disk_size_mb: u64,
}

impl HttpStore {
    pub fn new(config: HttpStoreConfig) -> Self {
        HttpStore {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, self.url(path))
            .basic_auth(&self.config.username, Some(&self.config.password))
    }

    async fn expect_success(
        response: reqwest::Response,
        context: &str,
    ) -> Result<reqwest::Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(StoreError::Status {
                status: status.as_u16(),
                context: context.to_string(),
            })
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, StoreError> {
        let response = self.request(reqwest::Method::GET, path).send().await?;
        let response = Self::expect_success(response, path).await?;
        response
            .json()
            .await
            .map_err(|err| StoreError::Decode(err.into()))
    }
}

#[async_trait::async_trait]
impl DicomStore for HttpStore {
    async fn echo(&self, modality: &str) -> Result<(), StoreError> {
        let path = format!("modalities/{modality}/echo");
        let response = self
            .request(reqwest::Method::POST, &path)
            .json(&serde_json::json!({}))
            .send()
            .await?;
        Self::expect_success(response, &path).await.map(|_| ())
    }

    async fn query(
        &self,
        modality: &str,
        level: Level,
        query: &BTreeMap<String, String>,
    ) -> Result<Vec<QueryAnswer>, StoreError> {
        let path = format!("modalities/{modality}/query");
        let body = serde_json::json!({ "Level": level.as_str(), "Query": query });
        let response = self
            .request(reqwest::Method::POST, &path)
            .json(&body)
            .send()
            .await?;
        let created: QueryCreated = Self::expect_success(response, &path)
            .await?
            .json()
            .await
            .map_err(|err| StoreError::Decode(err.into()))?;

        // `simplify` renders each answer as a flat keyword -> value map.
        let answers: Vec<BTreeMap<String, String>> = self
            .get_json(&format!("queries/{}/answers?expand&simplify", created.id))
            .await?;
        Ok(answers
            .into_iter()
            .map(|tags| QueryAnswer { tags })
            .collect())
    }

    async fn retrieve(
        &self,
        modality: &str,
        level: Level,
        keys: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let path = format!("modalities/{modality}/move");
        let body = serde_json::json!({
            "Level": level.as_str(),
            "Resources": [keys],
            "TargetAet": self.config.local_aet,
            "Synchronous": true,
        });
        let response = self
            .request(reqwest::Method::POST, &path)
            .json(&body)
            .send()
            .await?;
        Self::expect_success(response, &path).await.map(|_| ())
    }

    async fn find_study(&self, study_uid: &str) -> Result<Option<String>, StoreError> {
        let body = serde_json::json!({
            "Level": "Study",
            "Query": { "StudyInstanceUID": study_uid },
        });
        let response = self
            .request(reqwest::Method::POST, "tools/find")
            .json(&body)
            .send()
            .await?;
        let ids: Vec<String> = Self::expect_success(response, "tools/find")
            .await?
            .json()
            .await
            .map_err(|err| StoreError::Decode(err.into()))?;
        Ok(ids.into_iter().next())
    }

    async fn list_studies(&self) -> Result<Vec<String>, StoreError> {
        self.get_json("studies").await
    }

    async fn study_info(&self, id: &str) -> Result<StudyInfo, StoreError> {
        let study: StudyResource = self.get_json(&format!("studies/{id}")).await?;
        let stats: StudyStatistics = self.get_json(&format!("studies/{id}/statistics")).await?;
        let study_uid = study
            .main_dicom_tags
            .get("StudyInstanceUID")
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("StudyInstanceUID of {id}")))?;
        Ok(StudyInfo {
            id: study.id,
            study_uid,
            is_stable: study.is_stable,
            instance_count: stats.count_instances,
        })
    }

    async fn study_instances(&self, id: &str) -> Result<Vec<InstanceInfo>, StoreError> {
        let series: Vec<SeriesResource> =
            self.get_json(&format!("studies/{id}/series?expand")).await?;
        let series_by_id: BTreeMap<String, (String, Option<i64>)> = series
            .into_iter()
            .map(|s| {
                let uid = s
                    .main_dicom_tags
                    .get("SeriesInstanceUID")
                    .cloned()
                    .unwrap_or_default();
                let number = s
                    .main_dicom_tags
                    .get("SeriesNumber")
                    .and_then(|n| n.trim().parse().ok());
                (s.id, (uid, number))
            })
            .collect();

        let instances: Vec<InstanceResource> = self
            .get_json(&format!("studies/{id}/instances?expand"))
            .await?;
        Ok(instances
            .into_iter()
            .map(|instance| {
                let (series_uid, series_number) = series_by_id
                    .get(&instance.parent_series)
                    .cloned()
                    .unwrap_or_default();
                let sop_uid = instance
                    .main_dicom_tags
                    .get("SOPInstanceUID")
                    .cloned()
                    .unwrap_or_default();
                InstanceInfo {
                    id: instance.id,
                    sop_uid,
                    series_uid,
                    series_number,
                }
            })
            .collect())
    }

    async fn instance_bytes(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        let path = format!("instances/{id}/file");
        let response = self.request(reqwest::Method::GET, &path).send().await?;
        let response = Self::expect_success(response, &path).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn delete_study(&self, id: &str) -> Result<(), StoreError> {
        let path = format!("studies/{id}");
        let response = self.request(reqwest::Method::DELETE, &path).send().await?;
        Self::expect_success(response, &path).await.map(|_| ())
    }

    async fn statistics(&self) -> Result<Statistics, StoreError> {
        let stats: StoreStatistics = self.get_json("statistics").await?;
        Ok(Statistics {
            total_disk_size_mb: stats.total_disk_size_mb,
        })
    }

    async fn store_instance(&self, bytes: Vec<u8>) -> Result<(), StoreError> {
        let response = self
            .request(reqwest::Method::POST, "instances")
            .header(reqwest::header::CONTENT_TYPE, "application/dicom")
            .body(bytes)
            .send()
            .await?;
        Self::expect_success(response, "instances").await.map(|_| ())
    }
}
