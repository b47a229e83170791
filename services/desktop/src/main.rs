//! Desktop 主程序职责：
//! 1. 维护与 relay 的长连接，处理配对、E2EE 命令与控制信号。
//! 2. 驱动远程控制状态机与接管宽限计时。
//! 3. 提供本机管理端口（解锁与策略配置）。

use std::sync::PoisonError;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

mod admin;
mod channels;
mod config;
mod control;
mod pairing;
mod proxy;

use cs_endpoint_core::{ClientConfig, RelayEvent, RelayHandle, SessionStore, sessions::SESSIONS_FILE};
use cs_shared_protocol::{ClientFrame, DeviceRole};

use admin::AdminRequest;
use config::Config;
use control::{ControlDecision, ControlPolicy, RemoteControl, UnlockOutcome};
use pairing::PendingOffer;
use proxy::CommandProxy;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = std::env::args().skip(1).collect::<Vec<String>>();
    match args.first().map(String::as_str).unwrap_or("run") {
        "run" => {}
        "version" => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        "-h" | "--help" | "help" => {
            println!(
                "cs-desktop [run]\n\n环境变量: CS_RELAY_URL / CS_TOKEN / CS_DEVICE_NAME / \
                 CS_UNLOCK_SECRET / CS_ALLOW_REMOTE_CONTROL / CS_AUTO_LOCK_TIMEOUT_MS / \
                 CS_CHAT_COMMAND / CS_SESSIONS_DIR / CS_WORKSPACE_DIR"
            );
            return Ok(());
        }
        other => return Err(anyhow!("unknown command: {other}")),
    }

    let _log_runtime = cs_endpoint_core::logging::init("desktop", false, "info")?;
    let cfg = Config::load()?;
    info!(
        "cs-desktop identity ready device_id={} device_name={} relay={}",
        cfg.device_id, cfg.device_name, cfg.relay_url
    );

    let store = SessionStore::load(cfg.config_root.as_ref().map(|root| root.join(SESSIONS_FILE)));
    let (handle, events, client_task) = cs_endpoint_core::spawn(
        ClientConfig {
            server_url: cfg.relay_url.clone(),
            token: cfg.token.clone(),
            device_id: cfg.device_id.clone(),
            device_name: cfg.device_name.clone(),
            role: DeviceRole::Desktop,
        },
        store,
    );

    let (admin_tx, admin_rx) = mpsc::unbounded_channel();
    admin::spawn(cfg.admin_addr.clone(), admin_tx);

    run_loop(cfg, handle, events, admin_rx).await?;
    let _ = client_task.await;
    Ok(())
}

/// desktop 主事件循环。
async fn run_loop(
    cfg: Config,
    handle: RelayHandle,
    mut events: mpsc::UnboundedReceiver<RelayEvent>,
    mut admin_rx: mpsc::UnboundedReceiver<AdminRequest>,
) -> anyhow::Result<()> {
    let (mut proxy, mut chat_events) = CommandProxy::new(&cfg);
    let mut fsm = RemoteControl::new(ControlPolicy {
        allow_remote_control: cfg.allow_remote_control,
        unlock_secret: cfg.unlock_secret.clone(),
        auto_lock_timeout: cfg.auto_lock_timeout,
    });
    let mut pending_offer: Option<PendingOffer> = None;

    loop {
        let grace_deadline = fsm.next_deadline();
        tokio::select! {
            biased;
            _ = tokio::signal::ctrl_c() => {
                info!("cs-desktop shutdown requested");
                proxy.abort_all();
                handle.disconnect();
                return Ok(());
            }
            maybe_event = events.recv() => {
                let Some(event) = maybe_event else {
                    return Err(anyhow!("relay client event stream closed"));
                };
                handle_relay_event(&cfg, &handle, &mut proxy, &mut fsm, &mut pending_offer, event)
                    .await;
            }
            maybe_chat = chat_events.recv() => {
                if let Some(chat_event) = maybe_chat
                    && let Some((to, frame)) = proxy.on_chat_event(chat_event)
                    && let Err(err) = handle.send_encrypted(&to, &frame)
                {
                    warn!("forward chat event to {to} failed: {err}");
                }
            }
            maybe_admin = admin_rx.recv() => {
                if let Some(request) = maybe_admin {
                    handle_admin_request(&cfg, &handle, &mut fsm, request);
                }
            }
            _ = grace_wait(grace_deadline) => {
                if fsm.on_deadline(Instant::now()) {
                    info!("remote control engaged controller={:?}", fsm.controller());
                }
            }
        }
    }
}

/// 宽限计时等待；无计时时挂起。
async fn grace_wait(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

/// 处理一条 relay 事件。
async fn handle_relay_event(
    cfg: &Config,
    handle: &RelayHandle,
    proxy: &mut CommandProxy,
    fsm: &mut RemoteControl,
    pending_offer: &mut Option<PendingOffer>,
    event: RelayEvent,
) {
    match event {
        RelayEvent::Connected => {
            *pending_offer = pairing::register_offer(cfg, handle);
        }
        RelayEvent::Disconnected => {
            *pending_offer = None;
            if fsm.connection_lost() {
                info!("remote control released: relay disconnected");
            }
        }
        RelayEvent::PairingAccepted {
            device_id,
            device_name,
            public_key,
        } => {
            let Some(offer) = pending_offer.take() else {
                warn!("pairing-accepted without a pending offer, ignored");
                return;
            };
            match offer.keys.derive_session(&public_key, &offer.code) {
                Ok(session) => {
                    handle
                        .sessions()
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(&device_id, &device_name, session);
                    info!("paired with mobile {device_id} ({device_name})");
                }
                Err(err) => warn!("derive session with {device_id} failed: {err}"),
            }
            // 继续挂出新的 offer，允许再配一台。
            *pending_offer = pairing::register_offer(cfg, handle);
        }
        RelayEvent::PairingRevoked { device_id } => {
            info!("pairing revoked by {device_id}");
            if fsm.peer_lost(&device_id) {
                info!("remote control released: pairing revoked");
            }
        }
        RelayEvent::RepairRequired { device_id, reason } => {
            warn!("e2ee session with {device_id} dropped ({reason}); re-pair required");
            if fsm.peer_lost(&device_id) {
                info!("remote control released: session dropped");
            }
        }
        RelayEvent::EncryptedMessage { from, body } => {
            if let Some(response) = proxy.handle_message(&from, &body).await
                && let Err(err) = handle.send_encrypted(&from, &response)
            {
                warn!("send response to {from} failed: {err}");
            }
        }
        RelayEvent::ControlRequest { from, device_name } => {
            let has_session = handle
                .sessions()
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .has(&from);
            let decision = fsm.on_control_request(&from, &device_name, has_session, Instant::now());
            let accepted = matches!(decision, ControlDecision::Accepted { .. });
            if let Err(err) = handle.send_frame(ClientFrame::ControlAck {
                to: from.clone(),
                accepted,
            }) {
                warn!("send control-ack failed: {err}");
            }
            match decision {
                ControlDecision::Accepted { immediate: true } => {
                    info!("remote control engaged controller={from}");
                }
                ControlDecision::Accepted { immediate: false } => {
                    info!("remote control scheduled controller={from}");
                }
                ControlDecision::Denied => info!("control request from {from} denied"),
            }
        }
        RelayEvent::ControlRevoked { from } => {
            if fsm.peer_lost(&from) {
                info!("remote control released by {from}");
            }
        }
        RelayEvent::DeviceOnline { device_id } => debug!("peer online: {device_id}"),
        RelayEvent::DeviceOffline { device_id } => {
            debug!("peer offline: {device_id}");
            if fsm.peer_lost(&device_id) {
                info!("remote control released: controller offline");
            }
        }
        RelayEvent::DeviceList { .. } | RelayEvent::ControlAck { .. } => {}
        RelayEvent::ServerError { code, message } => warn!("relay error: {code} {message}"),
    }
}

/// 处理管理端口请求。
fn handle_admin_request(
    cfg: &Config,
    handle: &RelayHandle,
    fsm: &mut RemoteControl,
    request: AdminRequest,
) {
    match request {
        AdminRequest::Unlock { secret, reply } => {
            let value = match fsm.try_unlock(&secret) {
                UnlockOutcome::Unlocked { controller } => {
                    if let Err(err) = handle.send_frame(ClientFrame::ControlRevoked {
                        to: controller.clone(),
                    }) {
                        warn!("send control-revoked failed: {err}");
                    }
                    info!("unlocked; control revoked from {controller}");
                    serde_json::json!({ "ok": true, "state": fsm.snapshot() })
                }
                UnlockOutcome::WrongSecret => {
                    serde_json::json!({ "ok": false, "message": "解锁密码错误", "state": fsm.snapshot() })
                }
                UnlockOutcome::NotLocked => {
                    serde_json::json!({ "ok": true, "message": "当前未锁定", "state": fsm.snapshot() })
                }
            };
            let _ = reply.send(value);
        }
        AdminRequest::ControlState { reply } => {
            let _ = reply.send(fsm.snapshot());
        }
        AdminRequest::UpdatePolicy {
            unlock_secret,
            allow_remote_control,
            auto_lock_timeout_ms,
            reply,
        } => {
            if let Some(secret) = unlock_secret.as_deref()
                && let Err(message) = fsm.set_unlock_secret(secret)
            {
                let _ = reply.send(Err(message));
                return;
            }
            if let Some(allow) = allow_remote_control {
                fsm.set_allow_remote_control(allow);
            }
            if let Some(ms) = auto_lock_timeout_ms {
                fsm.set_auto_lock_timeout(Duration::from_millis(ms));
            }

            let policy = fsm.policy();
            if let Err(err) = cfg.persist_policy(
                &policy.unlock_secret,
                policy.allow_remote_control,
                policy.auto_lock_timeout,
            ) {
                warn!("persist policy failed: {err}");
            }
            let _ = reply.send(Ok(serde_json::json!({ "ok": true, "state": fsm.snapshot() })));
        }
    }
}
