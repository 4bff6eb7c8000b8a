//! Visibility selection from inside the game over OSC.
//!
//! The avatar menu sends `EterPixVisibilitySelect` with 1..=5. The choice is
//! saved as `default_visibility`, which reaches the pipeline through the
//! settings hook, and echoed back as 101..=105 on `EterPixVisibility` so the
//! menu can show it. 100 is sent once at startup to say we are listening.

use std::{net::SocketAddr, sync::Arc};

use anyhow::{anyhow, bail, Context, Result};
use rosc::{decoder, encoder, OscMessage, OscPacket, OscType};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::models::Visibility;
use crate::settings::{OscSettings, SettingsStore};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

pub const SELECT_ADDRESS: &str = "/avatar/parameters/EterPixVisibilitySelect";
pub const STATUS_ADDRESS: &str = "/avatar/parameters/EterPixVisibility";
pub const READY_CODE: i32 = 100;

const RECV_BUFFER: usize = 1536;

/// Menu value for a visibility choice.
pub fn selection_code(visibility: Visibility) -> i32 {
    match visibility {
        Visibility::OnlyMe => 1,
        Visibility::Friends => 2,
        Visibility::InstanceFriends => 3,
        Visibility::Instance => 4,
        Visibility::Public => 5,
    }
}

pub fn visibility_for_selection(code: i32) -> Option<Visibility> {
    match code {
        1 => Some(Visibility::OnlyMe),
        2 => Some(Visibility::Friends),
        3 => Some(Visibility::InstanceFriends),
        4 => Some(Visibility::Instance),
        5 => Some(Visibility::Public),
        _ => None,
    }
}

/// Value echoed to the game once a choice is applied.
pub fn status_code(visibility: Visibility) -> i32 {
    READY_CODE + selection_code(visibility)
}

/// Integer selections carried by `packet`, bundles flattened in order.
fn selections(packet: OscPacket, out: &mut Vec<i32>) {
    match packet {
        OscPacket::Message(message) if message.addr == SELECT_ADDRESS => {
            match message.args.first() {
                Some(OscType::Int(code)) => out.push(*code),
                other => log_debug!("ignoring visibility selection with argument {other:?}"),
            }
        }
        OscPacket::Message(_) => {}
        OscPacket::Bundle(bundle) => {
            for inner in bundle.content {
                selections(inner, out);
            }
        }
    }
}

async fn send_status(socket: &UdpSocket, target: SocketAddr, code: i32) -> Result<()> {
    let packet = OscPacket::Message(OscMessage {
        addr: STATUS_ADDRESS.to_string(),
        args: vec![OscType::Int(code)],
    });
    let bytes = encoder::encode(&packet)
        .map_err(|err| anyhow!("failed to encode OSC status: {err:?}"))?;
    socket
        .send_to(&bytes, target)
        .await
        .with_context(|| format!("failed to send OSC status to {target}"))?;
    Ok(())
}

pub async fn osc_loop(
    socket: UdpSocket,
    target: SocketAddr,
    settings: Arc<SettingsStore>,
    cancel_token: CancellationToken,
) {
    if let Err(err) = send_status(&socket, target, READY_CODE).await {
        log_warn!("{err:#}");
    }

    let mut buf = [0u8; RECV_BUFFER];
    loop {
        let received = tokio::select! {
            received = socket.recv_from(&mut buf) => received,
            _ = cancel_token.cancelled() => {
                log_info!("OSC listener shutting down");
                break;
            }
        };

        let len = match received {
            Ok((len, _from)) => len,
            Err(err) => {
                log_warn!("OSC receive failed: {err}");
                continue;
            }
        };
        let packet = match decoder::decode_udp(&buf[..len]) {
            Ok((_, packet)) => packet,
            Err(err) => {
                log_debug!("dropping malformed OSC packet: {err:?}");
                continue;
            }
        };

        let mut codes = Vec::new();
        selections(packet, &mut codes);
        for code in codes {
            apply_selection(&socket, target, &settings, code).await;
        }
    }
}

async fn apply_selection(
    socket: &UdpSocket,
    target: SocketAddr,
    settings: &SettingsStore,
    code: i32,
) {
    let Some(visibility) = visibility_for_selection(code) else {
        log_debug!("ignoring unknown visibility selection {code}");
        return;
    };
    if settings.snapshot().default_visibility == visibility {
        return;
    }

    if let Err(err) = settings.update(|s| s.default_visibility = visibility) {
        log_warn!("could not save visibility {visibility}: {err:#}");
        return;
    }
    log_info!("visibility set to {visibility} from the game");
    if let Err(err) = send_status(socket, target, status_code(visibility)).await {
        log_warn!("{err:#}");
    }
}

pub struct OscController {
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
    local_addr: Option<SocketAddr>,
}

impl Default for OscController {
    fn default() -> Self {
        Self::new()
    }
}

impl OscController {
    pub fn new() -> Self {
        Self {
            handle: None,
            cancel_token: None,
            local_addr: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Address the listener is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub async fn start(
        &mut self,
        config: &OscSettings,
        settings: Arc<SettingsStore>,
        parent: &CancellationToken,
    ) -> Result<()> {
        if self.handle.is_some() {
            bail!("OSC listener already active");
        }

        let socket = UdpSocket::bind((config.host.as_str(), config.recv_port))
            .await
            .with_context(|| format!("failed to bind OSC port {}:{}", config.host, config.recv_port))?;
        let target = tokio::net::lookup_host((config.host.as_str(), config.send_port))
            .await
            .with_context(|| format!("failed to resolve OSC host {}", config.host))?
            .next()
            .with_context(|| format!("no address for OSC host {}", config.host))?;
        let local_addr = socket.local_addr().context("OSC socket has no local address")?;
        log_info!("OSC listening on {local_addr}, reporting to {target}");

        let cancel_token = parent.child_token();
        let handle = tokio::spawn(osc_loop(socket, target, settings, cancel_token.clone()));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        self.local_addr = Some(local_addr);
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
        self.local_addr = None;

        if let Some(handle) = self.handle.take() {
            handle.await.context("OSC task failed to join")
        } else {
            Ok(())
        }
    }
}
