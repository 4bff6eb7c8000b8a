use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{
    header,
    multipart::{Form, Part},
    Client,
};

use crate::models::{LogContext, PoseMetadata, Visibility};

use super::auth::Credential;
use super::error::{classify_status, UploadError};

const UPLOAD_PATH: &str = "api/uploads";

/// Everything sent for one upload attempt.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub jpeg: Vec<u8>,
    /// Name of the source capture; sent with a `.jpg` extension.
    pub file_name: String,
    pub taken_at: DateTime<Utc>,
    pub visibility: Visibility,
    pub context: Option<LogContext>,
    pub pose: PoseMetadata,
}

impl UploadRequest {
    pub fn upload_file_name(&self) -> String {
        Path::new(&self.file_name)
            .with_extension("jpg")
            .to_string_lossy()
            .into_owned()
    }

    /// Text fields of the multipart form. Context fields are left out when no
    /// context was resolved, pose fields when nothing was decoded.
    pub fn form_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("visibility", self.visibility.as_str().to_string()),
            (
                "taken_at",
                self.taken_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            ("filename", self.upload_file_name()),
        ];

        if let Some(context) = &self.context {
            fields.push(("world_id", context.world_id.clone()));
            fields.push(("instance_id", context.instance_id.clone()));
            fields.push(("instance_type", context.instance_type.as_str().to_string()));
            if let Some(name) = &context.world_name {
                fields.push(("world_name", name.clone()));
            }
        }

        if self.pose.extracted_ok {
            let PoseMetadata {
                position, rotation, ..
            } = self.pose;
            fields.extend([
                ("position_x", position.x.to_string()),
                ("position_y", position.y.to_string()),
                ("position_z", position.z.to_string()),
            ]);
            if let Some(rotation) = rotation {
                fields.extend([
                    ("rotation_yaw", rotation.yaw.to_string()),
                    ("rotation_pitch", rotation.pitch.to_string()),
                    ("rotation_roll", rotation.roll.to_string()),
                ]);
            }
            if let Some(code) = self.pose.world_code {
                fields.push(("world_code", code.to_string()));
            }
        }

        fields
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    /// Server-assigned id; `None` when a 2xx body did not carry one.
    pub remote_id: Option<String>,
}

#[async_trait]
pub trait UploadTransport: Send + Sync {
    async fn upload(
        &self,
        credential: &Credential,
        request: &UploadRequest,
    ) -> Result<UploadReceipt, UploadError>;
}

/// Multipart `POST {server_url}/api/uploads` over reqwest.
pub struct ReqwestUploader {
    client: Client,
    base_url: String,
    endpoint: String,
}

impl ReqwestUploader {
    pub fn new(server_url: &str, timeout: Duration) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build upload HTTP client")?;

        let base_url = server_url.trim_end_matches('/').to_string();
        Ok(Self {
            client,
            endpoint: format!("{base_url}/{UPLOAD_PATH}"),
            base_url,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    fn build_form(request: &UploadRequest) -> Result<Form, UploadError> {
        let image = Part::bytes(request.jpeg.clone())
            .file_name(request.upload_file_name())
            .mime_str("image/jpeg")
            .map_err(|err| UploadError::Local(format!("invalid image part: {err}")))?;

        Ok(request
            .form_fields()
            .into_iter()
            .fold(Form::new().part("image", image), |form, (name, value)| {
                form.text(name, value)
            }))
    }
}

#[async_trait]
impl UploadTransport for ReqwestUploader {
    async fn upload(
        &self,
        credential: &Credential,
        request: &UploadRequest,
    ) -> Result<UploadReceipt, UploadError> {
        let form = Self::build_form(request)?;

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(credential.bearer())
            .multipart(form)
            .send()
            .await
            .map_err(send_error)?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response
            .text()
            .await
            .map_err(|err| UploadError::Transient(format!("response read failed: {err}")))?;

        if status.is_success() {
            Ok(UploadReceipt {
                remote_id: extract_remote_id(&body),
            })
        } else {
            Err(classify_status(status.as_u16(), &body, retry_after))
        }
    }
}

pub(crate) fn send_error(err: reqwest::Error) -> UploadError {
    if err.is_connect() {
        UploadError::Unreachable(err.to_string())
    } else if err.is_timeout() {
        UploadError::Transient(format!("request timed out: {err}"))
    } else {
        UploadError::Transient(format!("request failed: {err}"))
    }
}

/// Reads the id from `id`, `data.id` or `data.photo_uuid`.
pub fn extract_remote_id(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let found = [
        value.get("id"),
        value.get("data").and_then(|data| data.get("id")),
        value.get("data").and_then(|data| data.get("photo_uuid")),
    ]
    .into_iter()
    .flatten()
    .find_map(|id| match id {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    });
    found
}
