//! FTPS uploader (implicit TLS). The FTP client is synchronous, so every
//! transfer runs on the blocking pool; one connection per call keeps the
//! uploader free of shared mutable session state.

use crate::{package, TabularFile, UploadError, UploadReceipt, Uploader};
use deident::AnonymisedStudy;
use suppaftp::native_tls::TlsConnector;
use suppaftp::types::FileType;
use suppaftp::{NativeTlsConnector, NativeTlsFtpStream};

pub struct FtpsUploader {
    host: String,
    port: u16,
    username: String,
    password: String,
}

impl FtpsUploader {
    pub fn new(host: String, port: u16, username: String, password: String) -> Self {
        FtpsUploader {
            host,
            port,
            username,
            password,
        }
    }

    fn connect(&self) -> Result<NativeTlsFtpStream, UploadError> {
        let transient = |err: &dyn std::fmt::Display| UploadError::Transient(format!("ftps: {err}"));
        let connector = TlsConnector::new().map_err(|e| transient(&e))?;
        let mut ftp = NativeTlsFtpStream::connect_secure_implicit(
            (self.host.as_str(), self.port),
            NativeTlsConnector::from(connector),
            &self.host,
        )
        .map_err(|e| transient(&e))?;
        ftp.login(&self.username, &self.password)
            .map_err(|e| transient(&e))?;
        ftp.transfer_type(FileType::Binary)
            .map_err(|e| transient(&e))?;
        Ok(ftp)
    }

    /// Store one file at `path`, creating parent directories as needed.
    fn store(ftp: &mut NativeTlsFtpStream, path: &str, bytes: &[u8]) -> Result<(), UploadError> {
        let transient = |err: &dyn std::fmt::Display| UploadError::Transient(format!("ftps: {err}"));

        if let Some((dirs, _file)) = path.rsplit_once('/') {
            let mut prefix = String::new();
            for component in dirs.split('/') {
                if !prefix.is_empty() {
                    prefix.push('/');
                }
                prefix.push_str(component);
                // Already-existing directories are fine.
                let _ = ftp.mkdir(&prefix);
            }
        }
        ftp.put_file(path, &mut std::io::Cursor::new(bytes))
            .map_err(|e| transient(&e))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Uploader for FtpsUploader {
    async fn upload_study(
        &self,
        project: &str,
        study: &AnonymisedStudy,
    ) -> Result<UploadReceipt, UploadError> {
        let zip = package::study_zip(study)?;
        let path = format!("{project}/{}.zip", study.pseudo_patient_id);
        let size = zip.len() as u64;

        let uploader = self.clone_config();
        let stored_path = path.clone();
        tokio::task::spawn_blocking(move || {
            let mut ftp = uploader.connect()?;
            Self::store(&mut ftp, &stored_path, &zip)?;
            let _ = ftp.quit();
            Ok::<(), UploadError>(())
        })
        .await
        .map_err(|join| UploadError::Permanent(format!("ftps worker died: {join}")))??;

        tracing::info!(project, path, bytes = size, "uploaded study zip over FTPS");
        Ok(UploadReceipt {
            location: path,
            bytes: size,
        })
    }

    async fn upload_tabular(
        &self,
        project: &str,
        extract_datetime: &chrono::DateTime<chrono::Utc>,
        files: &[TabularFile],
    ) -> Result<UploadReceipt, UploadError> {
        let stamp = extract_datetime.format("%Y-%m-%dT%H-%M-%S").to_string();
        let root = format!("{project}/{stamp}/parquet");
        let total: u64 = files.iter().map(|f| f.bytes.len() as u64).sum();

        let uploader = self.clone_config();
        let files: Vec<TabularFile> = files.to_vec();
        let upload_root = root.clone();
        tokio::task::spawn_blocking(move || {
            let mut ftp = uploader.connect()?;
            for file in &files {
                let path = format!("{upload_root}/{}", file.relative_path);
                Self::store(&mut ftp, &path, &file.bytes)?;
            }
            let _ = ftp.quit();
            Ok::<(), UploadError>(())
        })
        .await
        .map_err(|join| UploadError::Permanent(format!("ftps worker died: {join}")))??;

        tracing::info!(project, root, bytes = total, "uploaded tabular extract over FTPS");
        Ok(UploadReceipt {
            location: root,
            bytes: total,
        })
    }

    async fn close(&self) -> Result<(), UploadError> {
        // Connections are per-call; nothing is held open.
        Ok(())
    }
}

impl FtpsUploader {
    fn clone_config(&self) -> FtpsUploader {
        FtpsUploader {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}
