//! Remote upload API: transport, presence reports, credential source and
//! failure taxonomy.

mod auth;
mod client;
mod error;
mod presence;

pub use auth::{AuthClient, AuthRequired, Credential, SettingsCredentialStore};
pub use client::{extract_remote_id, ReqwestUploader, UploadReceipt, UploadRequest, UploadTransport};
pub use error::{classify_status, UploadError};
pub use presence::{InstanceJoin, PresenceReporter};
