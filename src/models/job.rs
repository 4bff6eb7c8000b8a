//! Upload job model and its lifecycle state machine.
//!
//! A job moves forward through `Pending -> Converting -> Uploading` and ends in
//! `Succeeded` or `FailedPermanent`. `FailedRetryable` is a parking state: the
//! only ways out are another `Uploading` attempt or giving up.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::fingerprint::Fingerprint;
use crate::models::{CaptureEvent, LogContext, PoseMetadata};

/// Access tier applied to an upload on the remote service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    #[serde(rename = "self")]
    OnlyMe,
    Friends,
    InstanceFriends,
    Instance,
    Public,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::OnlyMe => "self",
            Visibility::Friends => "friends",
            Visibility::InstanceFriends => "instance_friends",
            Visibility::Instance => "instance",
            Visibility::Public => "public",
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Visibility {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "self" => Ok(Visibility::OnlyMe),
            "friends" => Ok(Visibility::Friends),
            "instance_friends" => Ok(Visibility::InstanceFriends),
            "instance" => Ok(Visibility::Instance),
            "public" => Ok(Visibility::Public),
            other => Err(anyhow::anyhow!("unknown visibility '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobState {
    Pending,
    Converting,
    Uploading,
    Succeeded,
    FailedPermanent,
    FailedRetryable,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "Pending",
            JobState::Converting => "Converting",
            JobState::Uploading => "Uploading",
            JobState::Succeeded => "Succeeded",
            JobState::FailedPermanent => "FailedPermanent",
            JobState::FailedRetryable => "FailedRetryable",
        }
    }

    /// Terminal states end the job; the ledger never moves away from them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::FailedPermanent)
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Converting)
                | (Pending, FailedPermanent)
                | (Converting, Uploading)
                | (Converting, FailedPermanent)
                | (Uploading, Succeeded)
                | (Uploading, FailedPermanent)
                | (Uploading, FailedRetryable)
                | (FailedRetryable, Uploading)
                | (FailedRetryable, FailedPermanent)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Pending" => Ok(JobState::Pending),
            "Converting" => Ok(JobState::Converting),
            "Uploading" => Ok(JobState::Uploading),
            "Succeeded" => Ok(JobState::Succeeded),
            "FailedPermanent" => Ok(JobState::FailedPermanent),
            "FailedRetryable" => Ok(JobState::FailedRetryable),
            other => Err(anyhow::anyhow!("unknown job state '{other}'")),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal job transition {from} -> {to}")]
pub struct TransitionError {
    pub from: JobState,
    pub to: JobState,
}

#[derive(Debug, Clone)]
pub struct UploadJob {
    pub id: Uuid,
    pub capture: CaptureEvent,
    pub fingerprint: Fingerprint,
    pub log_context: Option<LogContext>,
    pub pose: PoseMetadata,
    pub visibility: Visibility,
    /// Upload requests counted against the retry budget, including attempts
    /// recorded by earlier runs. Requests refused for the credential are not
    /// counted here.
    pub attempt_count: u32,
    /// Requests the server refused with 401 in this run.
    pub auth_rejections: u32,
    pub state: JobState,
    pub last_error: Option<String>,
}

impl UploadJob {
    pub fn new(
        capture: CaptureEvent,
        fingerprint: Fingerprint,
        visibility: Visibility,
        prior_attempts: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            capture,
            fingerprint,
            log_context: None,
            pose: PoseMetadata::missing(),
            visibility,
            attempt_count: prior_attempts,
            auth_rejections: 0,
            state: JobState::Pending,
            last_error: None,
        }
    }

    pub fn advance(&mut self, next: JobState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        if next == JobState::Uploading {
            self.attempt_count = self.attempt_count.saturating_add(1);
        }
        self.state = next;
        Ok(())
    }

    /// The server refused the credential. The job waits for a new one, and
    /// the request does not count against the retry budget.
    pub fn reject_credential(&mut self) -> Result<(), TransitionError> {
        self.advance(JobState::FailedRetryable)?;
        self.attempt_count = self.attempt_count.saturating_sub(1);
        self.auth_rejections = self.auth_rejections.saturating_add(1);
        self.last_error = Some("credential rejected".into());
        Ok(())
    }

    pub fn fail_permanently(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.advance(JobState::FailedPermanent)?;
        self.last_error = Some(reason.into());
        Ok(())
    }
}
