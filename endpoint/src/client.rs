//! relay 客户端模块职责：
//! 1. 维护与 relay 的长连接：10 秒握手超时、指数退避重连、30 秒心跳。
//! 2. 将服务端下行帧翻译为 `RelayEvent` 流交给应用层。
//! 3. 提供 `send_encrypted` 出站通道，E2EE 会话由共享存储串行读写。

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::{
    net::TcpStream,
    sync::mpsc,
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use cs_shared_protocol::{ClientFrame, DeviceRole, RELAY_WS_PATH, ServerFrame};

use crate::{
    error::ClientError,
    events::RelayEvent,
    sessions::{SessionFailure, SessionStore},
};

/// 心跳周期。
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// 连接建立超时。
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// 重连退避上限。
const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// relay 客户端配置。
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// relay 服务地址（http/https/ws/wss）。
    pub server_url: String,
    /// bearer token。
    pub token: String,
    /// 本端设备 ID。
    pub device_id: String,
    /// 本端显示名。
    pub device_name: String,
    /// 本端角色。
    pub role: DeviceRole,
}

/// 会话循环内部命令。
enum ClientCommand {
    Frame(ClientFrame),
    Disconnect,
}

/// 单次会话的结束方式。
enum SessionEnd {
    Intentional,
    Lost,
}

/// relay 客户端句柄：发帧与主动断开。
#[derive(Clone)]
pub struct RelayHandle {
    cmd_tx: mpsc::UnboundedSender<ClientCommand>,
    sessions: Arc<Mutex<SessionStore>>,
    connected: Arc<AtomicBool>,
}

impl RelayHandle {
    /// 当前是否在线。
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// 共享会话存储（配对流程写入新会话时使用）。
    pub fn sessions(&self) -> Arc<Mutex<SessionStore>> {
        Arc::clone(&self.sessions)
    }

    /// 发送明文控制帧。
    pub fn send_frame(&self, frame: ClientFrame) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        self.cmd_tx
            .send(ClientCommand::Frame(frame))
            .map_err(|_| ClientError::NotConnected)
    }

    /// 加密并发送一帧；返回本帧 seq。
    pub fn send_encrypted(&self, to: &str, body: &Value) -> Result<u64, ClientError> {
        let raw = serde_json::to_vec(body).map_err(|_| ClientError::Encode)?;
        let (payload, seq) = {
            let mut store = self
                .sessions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            store.encrypt_for(to, &raw)?
        };
        self.send_frame(ClientFrame::Relay {
            to: to.to_string(),
            payload,
            seq,
        })?;
        Ok(seq)
    }

    /// 主动断开：落盘计数器并停止重连。
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(ClientCommand::Disconnect);
    }
}

/// 启动客户端循环，返回句柄、事件流与任务句柄。
pub fn spawn(
    cfg: ClientConfig,
    store: SessionStore,
) -> (
    RelayHandle,
    mpsc::UnboundedReceiver<RelayEvent>,
    JoinHandle<()>,
) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let sessions = Arc::new(Mutex::new(store));
    let connected = Arc::new(AtomicBool::new(false));

    let handle = RelayHandle {
        cmd_tx,
        sessions: Arc::clone(&sessions),
        connected: Arc::clone(&connected),
    };
    let task = tokio::spawn(run(cfg, sessions, connected, cmd_rx, event_tx));
    (handle, event_rx, task)
}

/// 把 relay 地址转换为带握手参数的 WS URL。
fn relay_ws_url(cfg: &ClientConfig) -> Result<Url, ClientError> {
    let mut parsed = Url::parse(cfg.server_url.trim())
        .map_err(|_| ClientError::InvalidServerUrl(cfg.server_url.clone()))?;
    match parsed.scheme() {
        "http" => {
            let _ = parsed.set_scheme("ws");
        }
        "https" => {
            let _ = parsed.set_scheme("wss");
        }
        "ws" | "wss" => {}
        _ => return Err(ClientError::InvalidServerUrl(cfg.server_url.clone())),
    }
    parsed.set_fragment(None);
    parsed.set_path(RELAY_WS_PATH);
    parsed.query_pairs_mut().clear();
    parsed
        .query_pairs_mut()
        .append_pair("token", &cfg.token)
        .append_pair("deviceType", cfg.role.as_str())
        .append_pair("deviceId", &cfg.device_id)
        .append_pair("deviceName", &cfg.device_name);
    Ok(parsed)
}

/// 第 n 次重试前的退避时长：min(2^n, 30) 秒。
fn reconnect_delay(attempts: u32) -> Duration {
    Duration::from_secs(2u64.pow(attempts.min(5))).min(RECONNECT_CAP)
}

/// 重连主循环。会话状态在断线期间保持不动。
async fn run(
    cfg: ClientConfig,
    sessions: Arc<Mutex<SessionStore>>,
    connected: Arc<AtomicBool>,
    mut cmd_rx: mpsc::UnboundedReceiver<ClientCommand>,
    event_tx: mpsc::UnboundedSender<RelayEvent>,
) {
    let mut attempts: u32 = 0;
    loop {
        let ws_url = match relay_ws_url(&cfg) {
            Ok(url) => url,
            Err(err) => {
                warn!("relay client misconfigured: {err}");
                return;
            }
        };

        match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(ws_url.as_str())).await {
            Ok(Ok((stream, _))) => {
                attempts = 0;
                connected.store(true, Ordering::SeqCst);
                info!("relay connected device={}", cfg.device_id);
                let _ = event_tx.send(RelayEvent::Connected);

                let end = run_session(stream, &sessions, &mut cmd_rx, &event_tx).await;
                connected.store(false, Ordering::SeqCst);
                let _ = event_tx.send(RelayEvent::Disconnected);

                if matches!(end, SessionEnd::Intentional) {
                    persist(&sessions);
                    info!("relay client stopped device={}", cfg.device_id);
                    return;
                }
                warn!("relay session lost device={}", cfg.device_id);
            }
            Ok(Err(err)) => warn!("relay connect failed: {err}"),
            Err(_) => warn!("relay connect timed out after {CONNECT_TIMEOUT:?}"),
        }

        let backoff = reconnect_delay(attempts);
        attempts = attempts.saturating_add(1);
        // 退避等待期间仍要响应主动断开；普通帧在断线窗口只能丢弃。
        let sleep = tokio::time::sleep(backoff);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = cmd_rx.recv() => {
                    if matches!(cmd, Some(ClientCommand::Disconnect) | None) {
                        persist(&sessions);
                        return;
                    }
                }
            }
        }
    }
}

/// 单次会话：读下行、写上行、按周期发心跳，任一侧失败即结束。
async fn run_session(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    sessions: &Arc<Mutex<SessionStore>>,
    cmd_rx: &mut mpsc::UnboundedReceiver<ClientCommand>,
    event_tx: &mpsc::UnboundedSender<RelayEvent>,
) -> SessionEnd {
    let (mut ws_writer, mut ws_reader) = stream.split();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // 跳过 interval 的首次立即触发。
    heartbeat.tick().await;

    loop {
        tokio::select! {
            next = ws_reader.next() => {
                match next {
                    Some(Ok(Message::Text(text))) => handle_server_frame(&text, sessions, event_tx),
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Lost,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!("relay read error: {err}");
                        return SessionEnd::Lost;
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ClientCommand::Frame(frame)) => {
                        let Ok(raw) = serde_json::to_string(&frame) else {
                            continue;
                        };
                        if ws_writer.send(Message::Text(raw.into())).await.is_err() {
                            return SessionEnd::Lost;
                        }
                    }
                    Some(ClientCommand::Disconnect) | None => {
                        let _ = ws_writer.send(Message::Close(None)).await;
                        return SessionEnd::Intentional;
                    }
                }
            }
            _ = heartbeat.tick() => {
                let Ok(raw) = serde_json::to_string(&ClientFrame::Heartbeat) else {
                    continue;
                };
                // 心跳写失败视为半开连接。
                if ws_writer.send(Message::Text(raw.into())).await.is_err() {
                    return SessionEnd::Lost;
                }
            }
        }
    }
}

/// 下行帧翻译：`relay` 帧走解密，其余直接映射为事件。
fn handle_server_frame(
    raw: &str,
    sessions: &Arc<Mutex<SessionStore>>,
    event_tx: &mpsc::UnboundedSender<RelayEvent>,
) {
    let frame = match serde_json::from_str::<ServerFrame>(raw) {
        Ok(frame) => frame,
        Err(err) => {
            debug!("drop unrecognized server frame: {err}");
            return;
        }
    };

    let event = match frame {
        ServerFrame::Pong => return,
        ServerFrame::Relay { from, payload, seq } => {
            let outcome = {
                let mut store = sessions.lock().unwrap_or_else(PoisonError::into_inner);
                store.decrypt_from(&from, &payload, seq)
            };
            match outcome {
                Ok(plaintext) => match serde_json::from_slice::<Value>(&plaintext) {
                    Ok(body) => RelayEvent::EncryptedMessage { from, body },
                    Err(err) => {
                        warn!("decrypted payload from {from} is not json: {err}");
                        return;
                    }
                },
                Err(SessionFailure::NoSession) => {
                    // 无会话同样要向 UI 发重配信号，不能静默吞帧。
                    warn!("relay frame from peer {from} without a session; re-pair required");
                    RelayEvent::RepairRequired {
                        device_id: from,
                        reason: "no session".to_string(),
                    }
                }
                Err(SessionFailure::Dropped(reason)) => {
                    warn!("e2ee session with {from} dropped: {reason}");
                    RelayEvent::RepairRequired {
                        device_id: from,
                        reason: reason.to_string(),
                    }
                }
            }
        }
        ServerFrame::PairingAccepted {
            device_id,
            device_name,
            public_key,
        } => RelayEvent::PairingAccepted {
            device_id,
            device_name,
            public_key,
        },
        ServerFrame::PairingRevoked { device_id } => {
            let mut store = sessions.lock().unwrap_or_else(PoisonError::into_inner);
            store.remove(&device_id);
            RelayEvent::PairingRevoked { device_id }
        }
        ServerFrame::DeviceOnline { device_id } => RelayEvent::DeviceOnline { device_id },
        ServerFrame::DeviceOffline { device_id } => RelayEvent::DeviceOffline { device_id },
        ServerFrame::DeviceList { devices } => RelayEvent::DeviceList { devices },
        ServerFrame::ControlRequest { from, device_name } => {
            RelayEvent::ControlRequest { from, device_name }
        }
        ServerFrame::ControlAck { from, accepted } => RelayEvent::ControlAck { from, accepted },
        ServerFrame::ControlRevoked { from } => RelayEvent::ControlRevoked { from },
        ServerFrame::Error { code, message } => RelayEvent::ServerError { code, message },
    };
    let _ = event_tx.send(event);
}

fn persist(sessions: &Arc<Mutex<SessionStore>>) {
    sessions
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .persist();
}
