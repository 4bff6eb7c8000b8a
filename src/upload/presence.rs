//! Instance join/leave reports, so the server knows where the player is.

use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde::Serialize;

use super::auth::Credential;
use super::client::{send_error, ReqwestUploader};
use super::error::{classify_status, UploadError};

const JOIN_PATH: &str = "vrc/api/instance/join";
const LEAVE_PATH: &str = "vrc/api/instance/leave";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InstanceJoin {
    pub world_id: String,
    pub instance_id: String,
    pub vrc_user_id: Option<String>,
    pub vrc_display_name: Option<String>,
}

#[async_trait]
pub trait PresenceReporter: Send + Sync {
    async fn report_join(
        &self,
        credential: &Credential,
        join: &InstanceJoin,
    ) -> Result<(), UploadError>;

    /// Clears the server-side location.
    async fn report_leave(&self, credential: &Credential) -> Result<(), UploadError>;
}

#[async_trait]
impl PresenceReporter for ReqwestUploader {
    async fn report_join(
        &self,
        credential: &Credential,
        join: &InstanceJoin,
    ) -> Result<(), UploadError> {
        let request = self
            .client()
            .post(self.url(JOIN_PATH))
            .bearer_auth(credential.bearer())
            .json(join);
        expect_success(request).await
    }

    async fn report_leave(&self, credential: &Credential) -> Result<(), UploadError> {
        let request = self
            .client()
            .post(self.url(LEAVE_PATH))
            .bearer_auth(credential.bearer());
        expect_success(request).await
    }
}

async fn expect_success(request: RequestBuilder) -> Result<(), UploadError> {
    let response = request.send().await.map_err(send_error)?;
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status.as_u16(), &body, None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::upload::client::tests::one_shot_server;

    #[tokio::test]
    async fn join_posts_json_with_bearer() {
        let (url, server) = one_shot_server("200 OK", r#"{"status":"success"}"#).await;
        let reporter = ReqwestUploader::new(&url, Duration::from_secs(5)).unwrap();

        reporter
            .report_join(
                &Credential::new("tok-9"),
                &InstanceJoin {
                    world_id: "wrld_a".into(),
                    instance_id: "123~friends(usr_x)".into(),
                    vrc_user_id: Some("usr_0b1c-77".into()),
                    vrc_display_name: None,
                },
            )
            .await
            .unwrap();

        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /vrc/api/instance/join"));
        let lower = raw.to_ascii_lowercase();
        assert!(lower.contains("authorization: bearer tok-9"));
        assert!(lower.contains("content-type: application/json"));
        let body = &raw[raw.find("\r\n\r\n").unwrap() + 4..];
        let json: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(json["world_id"], "wrld_a");
        assert_eq!(json["instance_id"], "123~friends(usr_x)");
        assert_eq!(json["vrc_user_id"], "usr_0b1c-77");
        assert!(json["vrc_display_name"].is_null());
    }

    #[tokio::test]
    async fn leave_maps_unauthorized_to_auth_required() {
        let (url, server) = one_shot_server("401 Unauthorized", r#"{"detail":"expired"}"#).await;
        let reporter = ReqwestUploader::new(&url, Duration::from_secs(5)).unwrap();

        let err = reporter
            .report_leave(&Credential::new("old"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::AuthRequired(_)));

        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /vrc/api/instance/leave"));
    }
}
