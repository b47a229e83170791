//! mobile CLI 分发：`pair`、`run`、`devices`、`exec`、`control`、
//! `release`、`revoke`、`version`。

use std::sync::PoisonError;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle};
use uuid::Uuid;

use cs_endpoint_core::{
    ClientConfig, RelayEvent, RelayHandle, SessionStore, sessions::SESSIONS_FILE,
};
use cs_shared_protocol::{ClientFrame, DeviceRole, PairingQrPayload, e2ee::EphemeralKeyPair};

use crate::{
    config::{self, RelayConfig},
    rpc,
};

/// 等待连接建立的预算。
const CONNECT_BUDGET: Duration = Duration::from_secs(15);
/// 配对握手预算。
const PAIRING_BUDGET: Duration = Duration::from_secs(30);

/// 解析并执行 mobile CLI。
pub(crate) async fn dispatch(args: &[String]) -> anyhow::Result<()> {
    let cmd = args.first().map(String::as_str).unwrap_or("");
    match cmd {
        "" | "-h" | "--help" | "help" => {
            print_help();
            Ok(())
        }
        "pair" => pair(args.get(1)).await,
        "run" => run().await,
        "devices" => devices().await,
        "exec" => exec(&args[1..]).await,
        "control" => control(required_arg(args, 1, "control <desktopId>")?).await,
        "release" => release(required_arg(args, 1, "release <desktopId>")?).await,
        "revoke" => revoke(required_arg(args, 1, "revoke <desktopId>")?).await,
        "version" => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        other => Err(anyhow!("unknown command: {other}; run `cs-mobile --help` for usage")),
    }
}

fn required_arg<'a>(args: &'a [String], index: usize, usage: &str) -> anyhow::Result<&'a str> {
    args.get(index)
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| anyhow!("usage: cs-mobile {usage}"))
}

fn print_help() {
    println!(
        "cs-mobile {}\n\n\
         用法:\n  cs-mobile pair '<二维码内容>' | @file   扫码配对并保存连接配置\n  \
         cs-mobile run                          常驻运行并打印事件\n  \
         cs-mobile devices                      列出账号下的 desktop\n  \
         cs-mobile exec <desktopId> <channel> [args…]   远程执行白名单命令\n  \
         cs-mobile control <desktopId>          请求接管 desktop\n  \
         cs-mobile release <desktopId>          释放接管\n  \
         cs-mobile revoke <desktopId>           解除配对\n  \
         cs-mobile version                      输出版本号",
        env!("CARGO_PKG_VERSION")
    );
}

/// 已连接的 relay 会话现场。
struct Session {
    handle: RelayHandle,
    events: mpsc::UnboundedReceiver<RelayEvent>,
    task: JoinHandle<()>,
}

impl Session {
    /// 主动断开并等客户端落盘退出。
    async fn close(self) {
        self.handle.disconnect();
        let _ = self.task.await;
    }
}

/// 用已保存的配置连接 relay。
async fn connect() -> anyhow::Result<Session> {
    connect_with(config::load_relay_config()?).await
}

/// 用指定配置连接 relay，等待首个 Connected。
async fn connect_with(relay: RelayConfig) -> anyhow::Result<Session> {
    let (device_id, device_name) = config::device_identity();
    let store = SessionStore::load(config::mobile_config_dir().map(|dir| dir.join(SESSIONS_FILE)));
    let (handle, mut events, task) = cs_endpoint_core::spawn(
        ClientConfig {
            server_url: relay.server_url,
            token: relay.token,
            device_id,
            device_name,
            role: DeviceRole::Mobile,
        },
        store,
    );

    let deadline = tokio::time::Instant::now() + CONNECT_BUDGET;
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .map_err(|_| anyhow!("connect timed out; token 可能已失效或 relay 不可达"))?
            .ok_or_else(|| anyhow!("relay client stopped"))?;
        if matches!(event, RelayEvent::Connected) {
            return Ok(Session {
                handle,
                events,
                task,
            });
        }
    }
}

/// 扫码配对：保存连接配置、预派生会话、认领配对码。
async fn pair(arg: Option<&String>) -> anyhow::Result<()> {
    let Some(raw) = arg else {
        bail!("usage: cs-mobile pair '<二维码内容>' | @file");
    };
    let raw = if let Some(path) = raw.strip_prefix('@') {
        std::fs::read_to_string(path).with_context(|| format!("read qr file failed: {path}"))?
    } else {
        raw.clone()
    };

    let qr = PairingQrPayload::decode(raw.trim()).context("二维码内容无法解析")?;
    if [&qr.s, &qr.t, &qr.p, &qr.k, &qr.d]
        .iter()
        .any(|v| v.trim().is_empty())
    {
        bail!("二维码内容不完整");
    }

    config::save_relay_config(&RelayConfig {
        server_url: qr.s.clone(),
        token: qr.t.clone(),
    })?;

    let keys = EphemeralKeyPair::generate();
    // 提前派生：赶在 pairing-accepted 之前到达的密文也能解。
    let session = keys
        .derive_session(&qr.k, &qr.p)
        .context("derive e2ee session failed")?;

    let mut sess = connect_with(RelayConfig {
        server_url: qr.s.clone(),
        token: qr.t.clone(),
    })
    .await?;
    sess.handle
        .sessions()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(&qr.d, "", session);

    sess.handle.send_frame(ClientFrame::ClaimPairing {
        pairing_code: qr.p.clone(),
        public_key: keys.public_key_hex().to_string(),
    })?;

    let deadline = tokio::time::Instant::now() + PAIRING_BUDGET;
    loop {
        let event = tokio::time::timeout_at(deadline, sess.events.recv())
            .await
            .map_err(|_| anyhow!("pairing timed out"))?
            .ok_or_else(|| anyhow!("relay client stopped"))?;
        match event {
            RelayEvent::PairingAccepted {
                device_id,
                device_name,
                ..
            } if device_id == qr.d => {
                sess.handle
                    .sessions()
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .set_peer_name(&device_id, &device_name);
                println!("配对成功: {device_name} ({device_id})");
                break;
            }
            RelayEvent::ServerError { code, message } => {
                // 认领失败，预派生的会话作废。
                sess.handle
                    .sessions()
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&qr.d);
                sess.close().await;
                bail!("配对失败 {code}: {message}");
            }
            _ => {}
        }
    }
    sess.close().await;
    Ok(())
}

/// 常驻运行，把事件打成人类可读行。
async fn run() -> anyhow::Result<()> {
    let mut sess = connect().await?;
    println!("已连接 relay，Ctrl-C 退出。");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                sess.close().await;
                return Ok(());
            }
            maybe_event = sess.events.recv() => {
                let Some(event) = maybe_event else {
                    return Err(anyhow!("relay client stopped"));
                };
                print_event(&event);
            }
        }
    }
}

fn print_event(event: &RelayEvent) {
    match event {
        RelayEvent::Connected => println!("[conn] connected"),
        RelayEvent::Disconnected => println!("[conn] disconnected, retrying"),
        RelayEvent::DeviceList { devices } => {
            println!("[devices] {} desktop(s):", devices.len());
            for device in devices {
                println!(
                    "  {} {} online={}",
                    device.device_id, device.device_name, device.online
                );
            }
        }
        RelayEvent::DeviceOnline { device_id } => println!("[online] {device_id}"),
        RelayEvent::DeviceOffline { device_id } => println!("[offline] {device_id}"),
        RelayEvent::EncryptedMessage { from, body } => {
            println!("[msg] {from}: {}", serde_json::to_string(body).unwrap_or_default());
        }
        RelayEvent::RepairRequired { device_id, reason } => {
            println!("[repair] 与 {device_id} 的会话已失效（{reason}），请重新扫码配对");
        }
        RelayEvent::PairingAccepted { device_id, .. } => println!("[pairing] accepted by {device_id}"),
        RelayEvent::PairingRevoked { device_id } => println!("[pairing] revoked by {device_id}"),
        RelayEvent::ControlAck { from, accepted } => println!("[control] {from} accepted={accepted}"),
        RelayEvent::ControlRequest { from, .. } => println!("[control] request from {from}"),
        RelayEvent::ControlRevoked { from } => println!("[control] revoked by {from}"),
        RelayEvent::ServerError { code, message } => println!("[error] {code}: {message}"),
    }
}

/// 列出账号下的 desktop（连接即收到 device-list）。
async fn devices() -> anyhow::Result<()> {
    let mut sess = connect().await?;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let event = tokio::time::timeout_at(deadline, sess.events.recv())
            .await
            .map_err(|_| anyhow!("device list timed out"))?
            .ok_or_else(|| anyhow!("relay client stopped"))?;
        if let RelayEvent::DeviceList { devices } = event {
            if devices.is_empty() {
                println!("尚无配对过的 desktop。");
            }
            for device in devices {
                println!(
                    "{} {} online={}",
                    device.device_id, device.device_name, device.online
                );
            }
            break;
        }
    }
    sess.close().await;
    Ok(())
}

/// 远程执行一条白名单命令并等待响应。
async fn exec(args: &[String]) -> anyhow::Result<()> {
    if args.len() < 2 {
        bail!("usage: cs-mobile exec <desktopId> <channel> [args…]");
    }
    let desktop_id = args[0].trim();
    let channel = args[1].trim();
    let call_args = args[2..]
        .iter()
        .map(|raw| serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.clone())))
        .collect::<Vec<_>>();

    let mut sess = connect().await?;
    let request_id = Uuid::new_v4().simple().to_string();
    let command = serde_json::json!({
        "type": "command",
        "id": request_id,
        "channel": channel,
        "args": call_args,
    });
    sess.handle
        .send_encrypted(desktop_id, &command)
        .context("发送命令失败（若提示 no e2ee session，请先重新配对）")?;

    let result = rpc::await_response(&mut sess.events, desktop_id, &request_id, rpc::COMMAND_TIMEOUT)
        .await;
    sess.close().await;
    match result {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// 请求接管 desktop 并等待应答。
async fn control(desktop_id: &str) -> anyhow::Result<()> {
    let mut sess = connect().await?;
    sess.handle.send_frame(ClientFrame::ControlRequest {
        target_desktop_id: desktop_id.to_string(),
    })?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    let outcome = loop {
        let event = tokio::time::timeout_at(deadline, sess.events.recv())
            .await
            .map_err(|_| anyhow!("control request timed out"))?
            .ok_or_else(|| anyhow!("relay client stopped"))?;
        match event {
            RelayEvent::ControlAck { from, accepted } if from == desktop_id => break Ok(accepted),
            RelayEvent::ServerError { code, message } => {
                break Err(anyhow!("relay error: {code} {message}"));
            }
            _ => {}
        }
    };
    sess.close().await;
    match outcome? {
        true => {
            println!("已接管 {desktop_id}");
            Ok(())
        }
        false => Err(anyhow!("desktop 拒绝了接管请求")),
    }
}

/// 释放对 desktop 的接管。
async fn release(desktop_id: &str) -> anyhow::Result<()> {
    let sess = connect().await?;
    sess.handle.send_frame(ClientFrame::ControlRevoked {
        to: desktop_id.to_string(),
    })?;
    sess.close().await;
    println!("已释放 {desktop_id}");
    Ok(())
}

/// 解除配对并丢弃本地会话。
async fn revoke(desktop_id: &str) -> anyhow::Result<()> {
    let sess = connect().await?;
    sess.handle.send_frame(ClientFrame::RevokePairing {
        target_device_id: desktop_id.to_string(),
    })?;
    sess.handle
        .sessions()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(desktop_id);
    sess.close().await;
    println!("已解除与 {desktop_id} 的配对");
    Ok(())
}
