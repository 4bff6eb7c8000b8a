//! Tells the server which instance the player is in.
//!
//! Follows the correlator's presence channel. Only the latest location is
//! reported, so a backlog of joins read at startup turns into one request.
//! Nothing is sent while signed out; failed reports are logged and dropped.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::models::Presence;
use crate::upload::{AuthClient, InstanceJoin, PresenceReporter, UploadError};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

/// `(world_id, instance_id)` last told to the server.
type Reported = Option<(String, String)>;

pub async fn presence_loop(
    mut presence: watch::Receiver<Presence>,
    reporter: Arc<dyn PresenceReporter>,
    auth: Arc<dyn AuthClient>,
    cancel_token: CancellationToken,
) {
    let mut reported: Reported = None;
    loop {
        tokio::select! {
            changed = presence.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = presence.borrow_and_update().clone();
                reported = report_change(&current, reported, reporter.as_ref(), auth.as_ref()).await;
            }
            _ = cancel_token.cancelled() => {
                log_info!("presence reporter shutting down");
                break;
            }
        }
    }
}

async fn report_change(
    current: &Presence,
    reported: Reported,
    reporter: &dyn PresenceReporter,
    auth: &dyn AuthClient,
) -> Reported {
    let target = current
        .location
        .as_ref()
        .map(|context| (context.world_id.clone(), context.instance_id.clone()));
    if target == reported {
        return reported;
    }

    let credential = match auth.current_credential().await {
        Ok(credential) => credential,
        Err(_) => {
            log_debug!("not signed in, skipping presence report");
            return target;
        }
    };

    let result = match (&current.location, &reported) {
        (Some(context), _) => {
            let join = InstanceJoin {
                world_id: context.world_id.clone(),
                instance_id: context.instance_id.clone(),
                vrc_user_id: current.user.as_ref().map(|user| user.user_id.clone()),
                vrc_display_name: current.user.as_ref().map(|user| user.display_name.clone()),
            };
            reporter.report_join(&credential, &join).await
        }
        (None, Some(_)) => reporter.report_leave(&credential).await,
        (None, None) => Ok(()),
    };

    match result {
        Ok(()) => log_debug!("presence reported: {target:?}"),
        Err(UploadError::AuthRequired(_)) => {
            log_warn!("server rejected the credential for a presence report");
            auth.invalidate(&credential).await;
        }
        Err(err) => log_warn!("presence report failed: {err}"),
    }
    target
}

pub struct PresenceController {
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl Default for PresenceController {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceController {
    pub fn new() -> Self {
        Self {
            handle: None,
            cancel_token: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn start(
        &mut self,
        presence: watch::Receiver<Presence>,
        reporter: Arc<dyn PresenceReporter>,
        auth: Arc<dyn AuthClient>,
        parent: &CancellationToken,
    ) -> Result<()> {
        if self.handle.is_some() {
            bail!("presence reporter already active");
        }

        let cancel_token = parent.child_token();
        let handle = tokio::spawn(presence_loop(
            presence,
            reporter,
            auth,
            cancel_token.clone(),
        ));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(handle) = self.handle.take() {
            handle.await.context("presence task failed to join")
        } else {
            Ok(())
        }
    }
}
