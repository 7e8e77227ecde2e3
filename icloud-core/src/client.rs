use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use url::Url;

pub const ROOT_DRIVEWSID: &str = "FOLDER::com.apple.CloudDocs::root";
pub const TRASH_DRIVEWSID: &str = "TRASH_ROOT";
const CLOUD_DOCS_ZONE: &str = "com.apple.CloudDocs";

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("time parse error: {0}")]
    Time(#[from] time::error::Parse),
    #[error("api response missing field: {0}")]
    MissingField(&'static str),
}

/// Coarse failure classes the sync core keys retry and pause decisions on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    ZoneBusy,
    Transient,
    NotFound,
    Permission,
    Permanent,
}

impl DriveError {
    pub fn classification(&self) -> ApiErrorClass {
        match self {
            DriveError::Auth(_) => ApiErrorClass::Auth,
            DriveError::Api { status, body } => classify_api_status(*status, body),
            DriveError::Request(err) if err.is_timeout() || err.is_connect() => {
                ApiErrorClass::Transient
            }
            DriveError::Io(err) => match err.kind() {
                io::ErrorKind::PermissionDenied => ApiErrorClass::Permission,
                io::ErrorKind::NotFound => ApiErrorClass::NotFound,
                _ => ApiErrorClass::Transient,
            },
            _ => ApiErrorClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            ApiErrorClass::ZoneBusy | ApiErrorClass::Transient
        )
    }
}

fn classify_api_status(status: StatusCode, body: &str) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::NOT_FOUND {
        ApiErrorClass::NotFound
    } else if status == StatusCode::CONFLICT || body.contains("ZONE_BUSY") {
        ApiErrorClass::ZoneBusy
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

/// Opaque remote identifier. The etag rides along because every mutation
/// endpoint demands the etag observed at listing time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DriveHandle {
    pub id: String,
    pub etag: Option<String>,
}

impl DriveHandle {
    pub fn new(id: impl Into<String>, etag: Option<String>) -> Self {
        Self {
            id: id.into(),
            etag,
        }
    }

    /// The document id embedded in a drivewsid like
    /// `FILE::com.apple.CloudDocs::<docwsid>`.
    fn document_id(&self) -> &str {
        self.id.rsplit("::").next().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveKind {
    Folder,
    File,
    AppLibrary,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct DriveChild {
    pub name: String,
    pub kind: DriveKind,
    pub size: Option<u64>,
    pub mtime: Option<i64>,
    pub handle: DriveHandle,
    pub child_count: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RootSummary {
    pub handle: DriveHandle,
    pub file_count: u64,
    pub trash_item_count: u64,
}

/// The capability set the sync core consumes. Everything behind it
/// (cookies, session renewal, endpoint shapes) stays in this crate.
#[async_trait]
pub trait DriveApi: Send + Sync {
    async fn list_root(&self) -> Result<RootSummary, DriveError>;
    async fn list_folder(&self, handle: &DriveHandle) -> Result<Vec<DriveChild>, DriveError>;
    async fn download(&self, handle: &DriveHandle, target: &Path) -> Result<(), DriveError>;
    async fn upload(
        &self,
        parent: &DriveHandle,
        name: &str,
        source: &Path,
        mtime: i64,
    ) -> Result<DriveHandle, DriveError>;
    async fn create_folder(
        &self,
        parent: &DriveHandle,
        name: &str,
    ) -> Result<DriveHandle, DriveError>;
    async fn delete(&self, handle: &DriveHandle) -> Result<(), DriveError>;
    async fn move_node(
        &self,
        handle: &DriveHandle,
        new_parent: &DriveHandle,
        new_name: &str,
    ) -> Result<(), DriveError>;
}

#[derive(Clone)]
pub struct HttpDriveClient {
    http: Client,
    drivews_url: Url,
    docws_url: Url,
    dsid: String,
}

impl HttpDriveClient {
    pub fn new(
        http: Client,
        drivews_url: &str,
        docws_url: &str,
        dsid: impl Into<String>,
    ) -> Result<Self, DriveError> {
        Ok(Self {
            http,
            drivews_url: Url::parse(drivews_url)?,
            docws_url: Url::parse(docws_url)?,
            dsid: dsid.into(),
        })
    }

    fn drivews_endpoint(&self, path: &str) -> Result<Url, DriveError> {
        let mut url = self.drivews_url.join(path)?;
        url.query_pairs_mut().append_pair("dsid", &self.dsid);
        Ok(url)
    }

    fn docws_endpoint(&self, path: &str) -> Result<Url, DriveError> {
        let mut url = self.docws_url.join(path)?;
        url.query_pairs_mut().append_pair("dsid", &self.dsid);
        Ok(url)
    }

    async fn retrieve_details(
        &self,
        drivewsids: &[&str],
    ) -> Result<Vec<ItemDetails>, DriveError> {
        let url = self.drivews_endpoint("retrieveItemDetailsInFolders")?;
        let body: Vec<_> = drivewsids
            .iter()
            .map(|id| {
                serde_json::json!({
                    "drivewsid": id,
                    "partialData": false,
                    "includeHierarchy": false,
                })
            })
            .collect();
        let response = self.http.post(url).json(&body).send().await?;
        Self::handle_response(response).await
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DriveError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(DriveError::Api { status, body })
        }
    }
}

#[async_trait]
impl DriveApi for HttpDriveClient {
    async fn list_root(&self) -> Result<RootSummary, DriveError> {
        let details = self
            .retrieve_details(&[ROOT_DRIVEWSID, TRASH_DRIVEWSID])
            .await?;
        let root = details
            .iter()
            .find(|d| d.drivewsid == ROOT_DRIVEWSID)
            .ok_or(DriveError::MissingField("root folder details"))?;
        let trash = details.iter().find(|d| d.drivewsid == TRASH_DRIVEWSID);
        Ok(RootSummary {
            handle: DriveHandle::new(root.drivewsid.clone(), root.etag.clone()),
            file_count: root.file_count.unwrap_or(0),
            trash_item_count: trash.and_then(|t| t.number_of_items).unwrap_or(0),
        })
    }

    async fn list_folder(&self, handle: &DriveHandle) -> Result<Vec<DriveChild>, DriveError> {
        let details = self.retrieve_details(&[handle.id.as_str()]).await?;
        let folder = details
            .into_iter()
            .next()
            .ok_or(DriveError::MissingField("folder details"))?;
        folder
            .items
            .unwrap_or_default()
            .into_iter()
            .map(|item| item.into_child())
            .collect()
    }

    async fn download(&self, handle: &DriveHandle, target: &Path) -> Result<(), DriveError> {
        let mut url = self.docws_endpoint(&format!("ws/{CLOUD_DOCS_ZONE}/download/by_id"))?;
        url.query_pairs_mut()
            .append_pair("document_id", handle.document_id());
        let response = self.http.get(url).send().await?;
        let token: DownloadToken = Self::handle_response(response).await?;
        let content_url = token
            .data_token
            .or(token.package_token)
            .ok_or(DriveError::MissingField("download token url"))?
            .url;

        let response = self.http.get(Url::parse(&content_url)?).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DriveError::Api { status, body });
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(target);
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        tokio::fs::rename(partial, target).await?;
        Ok(())
    }

    async fn upload(
        &self,
        parent: &DriveHandle,
        name: &str,
        source: &Path,
        mtime: i64,
    ) -> Result<DriveHandle, DriveError> {
        let size = tokio::fs::metadata(source).await?.len();

        let url = self.docws_endpoint(&format!("ws/{CLOUD_DOCS_ZONE}/upload/web"))?;
        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({
                "filename": name,
                "type": "FILE",
                "content_type": "",
                "size": size,
            }))
            .send()
            .await?;
        let slots: Vec<UploadSlot> = Self::handle_response(response).await?;
        let slot = slots
            .into_iter()
            .next()
            .ok_or(DriveError::MissingField("upload slot"))?;

        let file = tokio::fs::File::open(source).await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let part = reqwest::multipart::Part::stream_with_length(body, size)
            .file_name(name.to_string());
        let form = reqwest::multipart::Form::new().part("files", part);
        let response = self
            .http
            .post(Url::parse(&slot.url)?)
            .multipart(form)
            .send()
            .await?;
        let receipt: UploadReceipt = Self::handle_response(response).await?;
        let single = receipt
            .single_file
            .ok_or(DriveError::MissingField("singleFile receipt"))?;

        let url = self.docws_endpoint(&format!("ws/{CLOUD_DOCS_ZONE}/update_documents"))?;
        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({
                "allow_conflict": true,
                "btime": mtime * 1000,
                "mtime": mtime * 1000,
                "command": "add_file",
                "document_id": slot.document_id,
                "path": {
                    "starting_document_id": parent.document_id(),
                    "path": name,
                },
                "data": {
                    "signature": single.file_checksum,
                    "wrapping_key": single.wrapping_key,
                    "reference_signature": single.reference_checksum,
                    "size": single.size,
                },
            }))
            .send()
            .await?;
        let update: UpdateDocumentsResponse = Self::handle_response(response).await?;
        let item_id = update
            .results
            .into_iter()
            .next()
            .and_then(|r| r.document)
            .map(|d| d.item_id)
            .ok_or(DriveError::MissingField("updated document id"))?;
        Ok(DriveHandle::new(
            format!("FILE::{CLOUD_DOCS_ZONE}::{item_id}"),
            None,
        ))
    }

    async fn create_folder(
        &self,
        parent: &DriveHandle,
        name: &str,
    ) -> Result<DriveHandle, DriveError> {
        let url = self.drivews_endpoint("createFolders")?;
        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({
                "destinationDrivewsId": parent.id,
                "folders": [{
                    "clientId": uuid::Uuid::new_v4().to_string(),
                    "name": name,
                }],
            }))
            .send()
            .await?;
        let created: CreateFoldersResponse = Self::handle_response(response).await?;
        let folder = created
            .folders
            .into_iter()
            .next()
            .ok_or(DriveError::MissingField("created folder"))?;
        if let Some(status) = folder.status.as_deref() {
            if status != "OK" {
                return Err(DriveError::Api {
                    status: StatusCode::CONFLICT,
                    body: status.to_string(),
                });
            }
        }
        Ok(DriveHandle::new(folder.drivewsid, folder.etag))
    }

    async fn delete(&self, handle: &DriveHandle) -> Result<(), DriveError> {
        let url = self.drivews_endpoint("moveItemsToTrash")?;
        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({
                "items": [{
                    "drivewsid": handle.id,
                    "etag": handle.etag,
                    "clientId": handle.id,
                }],
            }))
            .send()
            .await?;
        let result: ItemStatusResponse = Self::handle_response(response).await?;
        result.check()
    }

    async fn move_node(
        &self,
        handle: &DriveHandle,
        new_parent: &DriveHandle,
        new_name: &str,
    ) -> Result<(), DriveError> {
        let url = self.drivews_endpoint("moveItems")?;
        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({
                "destinationDrivewsId": new_parent.id,
                "items": [{
                    "drivewsid": handle.id,
                    "etag": handle.etag,
                    "clientId": handle.id,
                    "name": new_name,
                }],
            }))
            .send()
            .await?;
        let result: ItemStatusResponse = Self::handle_response(response).await?;
        result.check()
    }
}

fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}

fn parse_modified(value: Option<&str>) -> Result<Option<i64>, time::error::Parse> {
    let Some(value) = value else {
        return Ok(None);
    };
    let parsed = OffsetDateTime::parse(value, &Rfc3339)?;
    Ok(Some(parsed.unix_timestamp()))
}

#[derive(Debug, Deserialize)]
struct ItemDetails {
    drivewsid: String,
    #[serde(default)]
    etag: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    extension: Option<String>,
    #[serde(rename = "type")]
    item_type: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(rename = "dateModified", default)]
    date_modified: Option<String>,
    #[serde(rename = "fileCount", default)]
    file_count: Option<u64>,
    #[serde(rename = "numberOfItems", default)]
    number_of_items: Option<u64>,
    #[serde(rename = "directChildrenCount", default)]
    direct_children_count: Option<u64>,
    #[serde(default)]
    items: Option<Vec<ItemDetails>>,
}

impl ItemDetails {
    fn into_child(self) -> Result<DriveChild, DriveError> {
        let kind = match self.item_type.as_str() {
            "FOLDER" => DriveKind::Folder,
            "FILE" => DriveKind::File,
            "APP_LIBRARY" => DriveKind::AppLibrary,
            _ => DriveKind::Unknown,
        };
        let name = match (&self.name, &self.extension) {
            (Some(name), Some(ext)) if !ext.is_empty() => format!("{name}.{ext}"),
            (Some(name), _) => name.clone(),
            (None, _) => String::new(),
        };
        let mtime = parse_modified(self.date_modified.as_deref())?;
        Ok(DriveChild {
            name,
            kind,
            size: self.size,
            mtime,
            handle: DriveHandle::new(self.drivewsid, self.etag),
            child_count: self.direct_children_count.or(self.number_of_items),
        })
    }
}

#[derive(Debug, Deserialize)]
struct DownloadToken {
    #[serde(default)]
    data_token: Option<TokenUrl>,
    #[serde(default)]
    package_token: Option<TokenUrl>,
}

#[derive(Debug, Deserialize)]
struct TokenUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct UploadSlot {
    document_id: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct UploadReceipt {
    #[serde(rename = "singleFile", default)]
    single_file: Option<SingleFileReceipt>,
}

#[derive(Debug, Deserialize)]
struct SingleFileReceipt {
    #[serde(rename = "fileChecksum")]
    file_checksum: String,
    #[serde(rename = "wrappingKey")]
    wrapping_key: String,
    #[serde(rename = "referenceChecksum")]
    reference_checksum: String,
    size: u64,
}

#[derive(Debug, Deserialize)]
struct UpdateDocumentsResponse {
    #[serde(default)]
    results: Vec<UpdateResult>,
}

#[derive(Debug, Deserialize)]
struct UpdateResult {
    #[serde(default)]
    document: Option<UpdatedDocument>,
}

#[derive(Debug, Deserialize)]
struct UpdatedDocument {
    item_id: String,
}

#[derive(Debug, Deserialize)]
struct CreateFoldersResponse {
    #[serde(default)]
    folders: Vec<CreatedFolder>,
}

#[derive(Debug, Deserialize)]
struct CreatedFolder {
    drivewsid: String,
    #[serde(default)]
    etag: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ItemStatusResponse {
    #[serde(default)]
    items: Vec<ItemStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ItemStatus {
    #[serde(default)]
    status: Option<String>,
}

impl ItemStatusResponse {
    fn check(self) -> Result<(), DriveError> {
        for item in &self.items {
            if let Some(status) = item.status.as_deref() {
                if status != "OK" {
                    return Err(DriveError::Api {
                        status: StatusCode::CONFLICT,
                        body: status.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}
