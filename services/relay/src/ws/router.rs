//! 帧路由：单一权威分发点，负责角色/配对约束与转发。
//!
//! 密文 payload 仅在内存中过手，不落盘、不打日志。

use axum::extract::ws::Message;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use cs_shared_protocol::{
    ClientFrame, DeviceRole, FrameParseError, ServerFrame, now_rfc3339_nanos, parse_client_frame,
};

use crate::{
    auth::unix_now,
    pairing::store::{ClaimError, PairingOffer},
    registry::DeviceConn,
    state::AppState,
};

/// 连接上下文：路由回发错误与应答所需的最小信息。
pub(crate) struct ConnCtx {
    pub(crate) user_id: String,
    pub(crate) device_id: String,
    pub(crate) role: DeviceRole,
    pub(crate) device_name: String,
    pub(crate) conn_id: Uuid,
    sender: mpsc::UnboundedSender<Message>,
}

impl ConnCtx {
    pub(crate) fn from_conn(conn: &DeviceConn) -> Self {
        Self {
            user_id: conn.user_id.clone(),
            device_id: conn.device_id.clone(),
            role: conn.role,
            device_name: conn.device_name.clone(),
            conn_id: conn.conn_id,
            sender: conn.sender.clone(),
        }
    }

    fn send(&self, frame: &ServerFrame) {
        if let Ok(raw) = serde_json::to_string(frame) {
            let _ = self.sender.send(Message::Text(raw.into()));
        }
    }

    fn send_error(&self, code: &str, message: impl Into<String>) {
        self.send(&ServerFrame::Error {
            code: code.to_string(),
            message: message.into(),
        });
    }
}

/// 处理一帧上行消息。协议级错误只回发 `error`，连接保持。
pub(crate) async fn handle_frame(state: &AppState, ctx: &ConnCtx, raw: &str) {
    let frame = match parse_client_frame(raw) {
        Ok(frame) => frame,
        Err(err) => {
            let (code, message) = match &err {
                FrameParseError::InvalidFormat(_) => ("INVALID_FORMAT", "报文不是合法 JSON".to_string()),
                FrameParseError::MissingType => ("MISSING_FIELD", "缺少 type 字段".to_string()),
                FrameParseError::UnknownType(t) => ("UNKNOWN_TYPE", format!("未知消息类型: {t}")),
                FrameParseError::MissingField { frame_type, .. } => {
                    ("MISSING_FIELD", format!("{frame_type} 缺少必填字段"))
                }
            };
            debug!("reject frame from {}: {err}", ctx.device_id);
            ctx.send_error(code, message);
            return;
        }
    };

    match frame {
        ClientFrame::Heartbeat => ctx.send(&ServerFrame::Pong),
        ClientFrame::RegisterPairing {
            pairing_code,
            public_key,
            device_name,
        } => handle_register_pairing(state, ctx, pairing_code, public_key, device_name).await,
        ClientFrame::ClaimPairing {
            pairing_code,
            public_key,
        } => handle_claim_pairing(state, ctx, pairing_code, public_key).await,
        ClientFrame::RevokePairing { target_device_id } => {
            handle_revoke_pairing(state, ctx, target_device_id).await
        }
        ClientFrame::Relay { to, payload, seq } => handle_relay(state, ctx, to, payload, seq).await,
        ClientFrame::ControlRequest { target_desktop_id } => {
            handle_control_request(state, ctx, target_desktop_id).await
        }
        ClientFrame::ControlAck { to, accepted } => {
            forward_control(state, ctx, &to, ServerFrame::ControlAck {
                from: ctx.device_id.clone(),
                accepted,
            })
            .await
        }
        ClientFrame::ControlRevoked { to } => {
            forward_control(state, ctx, &to, ServerFrame::ControlRevoked {
                from: ctx.device_id.clone(),
            })
            .await
        }
    }
}

/// desktop 登记配对 offer；成功静默。
async fn handle_register_pairing(
    state: &AppState,
    ctx: &ConnCtx,
    pairing_code: String,
    public_key: String,
    device_name: Option<String>,
) {
    if ctx.role != DeviceRole::Desktop {
        ctx.send_error("ROLE_VIOLATION", "仅 desktop 可登记配对");
        return;
    }
    if pairing_code.trim().is_empty() || public_key.trim().is_empty() {
        ctx.send_error("MISSING_FIELD", "register-pairing 缺少必填字段");
        return;
    }

    let desktop_device_name = device_name
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| ctx.device_name.clone());

    let mut guard = state.router.write().await;
    guard.offers.register(
        pairing_code.trim(),
        PairingOffer {
            user_id: ctx.user_id.clone(),
            desktop_device_id: ctx.device_id.clone(),
            desktop_public_key: public_key.trim().to_string(),
            desktop_device_name,
            created_at: unix_now(),
        },
    );
    debug!("pairing offer registered by {}", ctx.device_id);
}

/// mobile 认领配对：消费 offer、建立关系、双向下发 pairing-accepted。
async fn handle_claim_pairing(state: &AppState, ctx: &ConnCtx, pairing_code: String, public_key: String) {
    if ctx.role != DeviceRole::Mobile {
        ctx.send_error("ROLE_VIOLATION", "仅 mobile 可认领配对");
        return;
    }
    if pairing_code.trim().is_empty() || public_key.trim().is_empty() {
        ctx.send_error("MISSING_FIELD", "claim-pairing 缺少必填字段");
        return;
    }

    let mut guard = state.router.write().await;
    let offer = match guard.offers.claim(pairing_code.trim(), &ctx.user_id, unix_now()) {
        Ok(offer) => offer,
        Err(ClaimError::NotFound) => {
            ctx.send_error("PAIRING_NOT_FOUND", "配对码不存在或已被使用");
            return;
        }
        Err(ClaimError::Expired) => {
            ctx.send_error("PAIRING_EXPIRED", "配对码已过期，请重新扫码");
            return;
        }
        Err(ClaimError::WrongUser) => {
            ctx.send_error("PAIRING_WRONG_USER", "配对码不属于当前账号");
            return;
        }
    };

    // offer 在通知之前已经不可再被消费。
    guard.graph.link(
        &ctx.user_id,
        &offer.desktop_device_id,
        &ctx.device_id,
        &offer.desktop_device_name,
        now_rfc3339_nanos(),
    );

    if let Some(desktop) = guard.registry.get(&offer.desktop_device_id) {
        desktop.send(&ServerFrame::PairingAccepted {
            device_id: ctx.device_id.clone(),
            device_name: ctx.device_name.clone(),
            public_key: public_key.trim().to_string(),
        });
    }
    ctx.send(&ServerFrame::PairingAccepted {
        device_id: offer.desktop_device_id,
        device_name: offer.desktop_device_name,
        public_key: offer.desktop_public_key,
    });
}

/// 解除配对：关系存在才动作，并通知对端。
async fn handle_revoke_pairing(state: &AppState, ctx: &ConnCtx, target_device_id: String) {
    let target = target_device_id.trim();
    if target.is_empty() {
        ctx.send_error("MISSING_FIELD", "revoke-pairing 缺少 targetDeviceId");
        return;
    }

    let mut guard = state.router.write().await;
    if !guard.graph.are_linked(&ctx.user_id, &ctx.device_id, target) {
        return;
    }
    guard.graph.unlink(&ctx.device_id, target);
    if let Some(peer) = guard.registry.get(target) {
        peer.send(&ServerFrame::PairingRevoked {
            device_id: ctx.device_id.clone(),
        });
    }
}

/// 转发密文帧：必须已配对且目标在线；payload 原样透传。
async fn handle_relay(state: &AppState, ctx: &ConnCtx, to: String, payload: String, seq: u64) {
    let to = to.trim();
    if to.is_empty() {
        ctx.send_error("MISSING_FIELD", "relay 缺少 to");
        return;
    }

    let guard = state.router.read().await;
    if !guard.graph.are_linked(&ctx.user_id, &ctx.device_id, to) {
        ctx.send_error("NOT_PAIRED", "与目标设备未配对");
        return;
    }
    let Some(target) = guard.registry.get(to) else {
        ctx.send_error("TARGET_OFFLINE", "目标设备不在线");
        return;
    };
    let delivered = target.send(&ServerFrame::Relay {
        from: ctx.device_id.clone(),
        payload,
        seq,
    });
    if !delivered {
        ctx.send_error("TARGET_OFFLINE", "目标设备不在线");
    }
}

/// mobile 发起控制请求。
async fn handle_control_request(state: &AppState, ctx: &ConnCtx, target_desktop_id: String) {
    if ctx.role != DeviceRole::Mobile {
        ctx.send_error("ROLE_VIOLATION", "仅 mobile 可发起控制请求");
        return;
    }
    forward_control(state, ctx, &target_desktop_id, ServerFrame::ControlRequest {
        from: ctx.device_id.clone(),
        device_name: ctx.device_name.clone(),
    })
    .await;
}

/// 控制信号共用转发路径：同样受配对与在线约束。
async fn forward_control(state: &AppState, ctx: &ConnCtx, to: &str, frame: ServerFrame) {
    let to = to.trim();
    if to.is_empty() {
        ctx.send_error("MISSING_FIELD", "控制帧缺少目标设备");
        return;
    }

    let guard = state.router.read().await;
    if !guard.graph.are_linked(&ctx.user_id, &ctx.device_id, to) {
        ctx.send_error("NOT_PAIRED", "与目标设备未配对");
        return;
    }
    let Some(target) = guard.registry.get(to) else {
        ctx.send_error("TARGET_OFFLINE", "目标设备不在线");
        return;
    };
    target.send(&frame);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::{auth::AuthService, config::Config, state::AppState};
    use cs_shared_protocol::e2ee::EphemeralKeyPair;

    struct AllowAll;

    impl AuthService for AllowAll {
        fn verify_token(&self, _token: &str) -> Option<String> {
            Some("user_a".to_string())
        }
        fn user_exists(&self, _user_id: &str) -> bool {
            true
        }
    }

    fn test_state() -> AppState {
        let cfg = Config {
            addr: "127.0.0.1:0".to_string(),
            allow_origins: Vec::new(),
            auth_signing_key: "test-key".to_string(),
            disable_registration: false,
            known_users: Vec::new(),
            pairing_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        };
        AppState::new(&cfg, Arc::new(AllowAll))
    }

    async fn attach(
        state: &AppState,
        user: &str,
        device: &str,
        role: DeviceRole,
        name: &str,
    ) -> (ConnCtx, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = DeviceConn {
            user_id: user.to_string(),
            device_id: device.to_string(),
            role,
            device_name: name.to_string(),
            conn_id: Uuid::new_v4(),
            connected_at: now_rfc3339_nanos(),
            sender: tx,
        };
        let ctx = ConnCtx::from_conn(&conn);
        state.attach(conn).await;
        (ctx, rx)
    }

    async fn send(state: &AppState, ctx: &ConnCtx, frame: &ClientFrame) {
        handle_frame(state, ctx, &serde_json::to_string(frame).unwrap()).await;
    }

    fn next_frame(rx: &mut mpsc::UnboundedReceiver<Message>) -> ServerFrame {
        match rx.try_recv().expect("expected a frame") {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("unexpected ws message: {other:?}"),
        }
    }

    fn assert_silent(rx: &mut mpsc::UnboundedReceiver<Message>) {
        assert!(rx.try_recv().is_err(), "expected no pending frame");
    }

    fn assert_error(rx: &mut mpsc::UnboundedReceiver<Message>, expected_code: &str) {
        match next_frame(rx) {
            ServerFrame::Error { code, .. } => assert_eq!(code, expected_code),
            other => panic!("expected error {expected_code}, got {other:?}"),
        }
    }

    /// 快乐路径：注册 + 认领 + 双端派生一致 + 密文转发可解。
    #[tokio::test]
    async fn pairing_then_encrypted_echo() {
        let state = test_state();
        let (desktop, mut desktop_rx) = attach(&state, "user_a", "dev_d", DeviceRole::Desktop, "Desk").await;
        let (mobile, mut mobile_rx) = attach(&state, "user_a", "dev_m", DeviceRole::Mobile, "Phone").await;
        // mobile 入场先收 device-list（此时为空）。
        assert!(matches!(next_frame(&mut mobile_rx), ServerFrame::DeviceList { devices } if devices.is_empty()));

        let desktop_keys = EphemeralKeyPair::generate();
        let mobile_keys = EphemeralKeyPair::generate();
        send(&state, &desktop, &ClientFrame::RegisterPairing {
            pairing_code: "C1".to_string(),
            public_key: desktop_keys.public_key_hex().to_string(),
            device_name: None,
        })
        .await;
        assert_silent(&mut desktop_rx);

        send(&state, &mobile, &ClientFrame::ClaimPairing {
            pairing_code: "C1".to_string(),
            public_key: mobile_keys.public_key_hex().to_string(),
        })
        .await;

        let (mobile_pub_at_desktop, desktop_pub_at_mobile) = match (next_frame(&mut desktop_rx), next_frame(&mut mobile_rx)) {
            (
                ServerFrame::PairingAccepted { device_id: d_peer, public_key: d_key, .. },
                ServerFrame::PairingAccepted { device_id: m_peer, public_key: m_key, .. },
            ) => {
                assert_eq!(d_peer, "dev_m");
                assert_eq!(m_peer, "dev_d");
                (d_key, m_key)
            }
            other => panic!("expected pairing-accepted on both sides, got {other:?}"),
        };

        let mut desktop_session = desktop_keys
            .derive_session(&mobile_pub_at_desktop, "C1")
            .unwrap();
        let mut mobile_session = mobile_keys
            .derive_session(&desktop_pub_at_mobile, "C1")
            .unwrap();
        assert_eq!(desktop_session.derived_key_hex(), mobile_session.derived_key_hex());

        let (payload, seq) = mobile_session.encrypt(b"hello").unwrap();
        send(&state, &mobile, &ClientFrame::Relay {
            to: "dev_d".to_string(),
            payload,
            seq,
        })
        .await;
        match next_frame(&mut desktop_rx) {
            ServerFrame::Relay { from, payload, seq } => {
                assert_eq!(from, "dev_m");
                assert_eq!(seq, 0);
                assert_eq!(desktop_session.decrypt(&payload, seq).unwrap(), b"hello");
            }
            other => panic!("expected relay frame, got {other:?}"),
        }
    }

    /// TTL 过期的 offer 在认领时报错且不建立关系。
    #[tokio::test]
    async fn expired_offer_rejects_claim() {
        let state = test_state();
        let (_desktop, mut desktop_rx) = attach(&state, "user_a", "dev_d", DeviceRole::Desktop, "Desk").await;
        let (mobile, mut mobile_rx) = attach(&state, "user_a", "dev_m", DeviceRole::Mobile, "Phone").await;
        let _ = next_frame(&mut mobile_rx); // device-list

        {
            let mut guard = state.router.write().await;
            guard.offers.register("C2", PairingOffer {
                user_id: "user_a".to_string(),
                desktop_device_id: "dev_d".to_string(),
                desktop_public_key: "04ab".to_string(),
                desktop_device_name: "Desk".to_string(),
                created_at: unix_now() - 301,
            });
        }

        send(&state, &mobile, &ClientFrame::ClaimPairing {
            pairing_code: "C2".to_string(),
            public_key: "04cd".to_string(),
        })
        .await;
        assert_error(&mut mobile_rx, "PAIRING_EXPIRED");
        assert_silent(&mut desktop_rx);
        assert!(!state.router.read().await.graph.are_linked("user_a", "dev_d", "dev_m"));
    }

    /// 跨账号认领不消费 offer，原账号仍可认领成功。
    #[tokio::test]
    async fn cross_account_claim_is_isolated() {
        let state = test_state();
        let (desktop, mut desktop_rx) = attach(&state, "user_1", "dev_d1", DeviceRole::Desktop, "Desk").await;
        let (foreign, mut foreign_rx) = attach(&state, "user_2", "dev_m2", DeviceRole::Mobile, "Evil").await;
        let (own, mut own_rx) = attach(&state, "user_1", "dev_m1", DeviceRole::Mobile, "Phone").await;
        let _ = next_frame(&mut foreign_rx);
        let _ = next_frame(&mut own_rx);

        send(&state, &desktop, &ClientFrame::RegisterPairing {
            pairing_code: "C3".to_string(),
            public_key: "04ab".to_string(),
            device_name: None,
        })
        .await;

        send(&state, &foreign, &ClientFrame::ClaimPairing {
            pairing_code: "C3".to_string(),
            public_key: "04ee".to_string(),
        })
        .await;
        assert_error(&mut foreign_rx, "PAIRING_WRONG_USER");
        assert_silent(&mut desktop_rx);

        send(&state, &own, &ClientFrame::ClaimPairing {
            pairing_code: "C3".to_string(),
            public_key: "04cd".to_string(),
        })
        .await;
        assert!(matches!(next_frame(&mut own_rx), ServerFrame::PairingAccepted { .. }));
        assert!(matches!(next_frame(&mut desktop_rx), ServerFrame::PairingAccepted { .. }));
    }

    /// 二次认领同一配对码：码已消费，返回 not-found。
    #[tokio::test]
    async fn second_claim_of_consumed_code_fails() {
        let state = test_state();
        let (desktop, mut desktop_rx) = attach(&state, "user_a", "dev_d", DeviceRole::Desktop, "Desk").await;
        let (mobile, mut mobile_rx) = attach(&state, "user_a", "dev_m", DeviceRole::Mobile, "Phone").await;
        let _ = next_frame(&mut mobile_rx);

        send(&state, &desktop, &ClientFrame::RegisterPairing {
            pairing_code: "C4".to_string(),
            public_key: "04ab".to_string(),
            device_name: None,
        })
        .await;
        let claim = ClientFrame::ClaimPairing {
            pairing_code: "C4".to_string(),
            public_key: "04cd".to_string(),
        };
        send(&state, &mobile, &claim).await;
        let _ = next_frame(&mut mobile_rx);
        let _ = next_frame(&mut desktop_rx);

        send(&state, &mobile, &claim).await;
        assert_error(&mut mobile_rx, "PAIRING_NOT_FOUND");
    }

    /// 顶号：旧连接收 replaced 关闭、路由指向新连接、不误发下线。
    #[tokio::test]
    async fn displacement_replaces_routing_without_offline() {
        let state = test_state();
        let (desktop, mut desktop_rx) = attach(&state, "user_a", "dev_d", DeviceRole::Desktop, "Desk").await;
        let (mobile, mut mobile_rx) = attach(&state, "user_a", "dev_m", DeviceRole::Mobile, "Phone").await;
        let _ = next_frame(&mut mobile_rx);

        // 先建立配对，让 dev_m 成为 dev_d 的对端。
        send(&state, &desktop, &ClientFrame::RegisterPairing {
            pairing_code: "C5".to_string(),
            public_key: "04ab".to_string(),
            device_name: None,
        })
        .await;
        send(&state, &mobile, &ClientFrame::ClaimPairing {
            pairing_code: "C5".to_string(),
            public_key: "04cd".to_string(),
        })
        .await;
        let _ = next_frame(&mut desktop_rx);
        let _ = next_frame(&mut mobile_rx);

        let old_conn_id = desktop.conn_id;
        let (_desktop2, mut desktop2_rx) = attach(&state, "user_a", "dev_d", DeviceRole::Desktop, "Desk").await;

        match desktop_rx.try_recv().unwrap() {
            Message::Close(Some(frame)) => assert_eq!(frame.reason.as_str(), "replaced"),
            other => panic!("expected replaced close, got {other:?}"),
        }

        // 旧连接的迟到清理不能打出 device-offline。
        state.detach("dev_d", old_conn_id).await;
        assert_silent(&mut mobile_rx);

        // 路由现在落在新连接上。
        send(&state, &mobile, &ClientFrame::Relay {
            to: "dev_d".to_string(),
            payload: "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=".to_string(),
            seq: 0,
        })
        .await;
        assert!(matches!(next_frame(&mut desktop2_rx), ServerFrame::Relay { .. }));
    }

    /// 解除配对后 relay 被拒，对端收到 pairing-revoked。
    #[tokio::test]
    async fn revoke_stops_relay() {
        let state = test_state();
        let (desktop, mut desktop_rx) = attach(&state, "user_a", "dev_d", DeviceRole::Desktop, "Desk").await;
        let (mobile, mut mobile_rx) = attach(&state, "user_a", "dev_m", DeviceRole::Mobile, "Phone").await;
        let _ = next_frame(&mut mobile_rx);

        send(&state, &desktop, &ClientFrame::RegisterPairing {
            pairing_code: "C6".to_string(),
            public_key: "04ab".to_string(),
            device_name: None,
        })
        .await;
        send(&state, &mobile, &ClientFrame::ClaimPairing {
            pairing_code: "C6".to_string(),
            public_key: "04cd".to_string(),
        })
        .await;
        let _ = next_frame(&mut desktop_rx);
        let _ = next_frame(&mut mobile_rx);

        send(&state, &desktop, &ClientFrame::RevokePairing {
            target_device_id: "dev_m".to_string(),
        })
        .await;
        assert!(matches!(
            next_frame(&mut mobile_rx),
            ServerFrame::PairingRevoked { device_id } if device_id == "dev_d"
        ));

        send(&state, &mobile, &ClientFrame::Relay {
            to: "dev_d".to_string(),
            payload: "AAEC".to_string(),
            seq: 0,
        })
        .await;
        assert_error(&mut mobile_rx, "NOT_PAIRED");
    }

    /// 控制信号走配对约束转发；desktop 不可发起控制请求。
    #[tokio::test]
    async fn control_signals_respect_role_and_pairing() {
        let state = test_state();
        let (desktop, mut desktop_rx) = attach(&state, "user_a", "dev_d", DeviceRole::Desktop, "Desk").await;
        let (mobile, mut mobile_rx) = attach(&state, "user_a", "dev_m", DeviceRole::Mobile, "Phone").await;
        let _ = next_frame(&mut mobile_rx);

        // 未配对即请求控制。
        send(&state, &mobile, &ClientFrame::ControlRequest {
            target_desktop_id: "dev_d".to_string(),
        })
        .await;
        assert_error(&mut mobile_rx, "NOT_PAIRED");

        send(&state, &desktop, &ClientFrame::RegisterPairing {
            pairing_code: "C7".to_string(),
            public_key: "04ab".to_string(),
            device_name: None,
        })
        .await;
        send(&state, &mobile, &ClientFrame::ClaimPairing {
            pairing_code: "C7".to_string(),
            public_key: "04cd".to_string(),
        })
        .await;
        let _ = next_frame(&mut desktop_rx);
        let _ = next_frame(&mut mobile_rx);

        send(&state, &mobile, &ClientFrame::ControlRequest {
            target_desktop_id: "dev_d".to_string(),
        })
        .await;
        assert!(matches!(
            next_frame(&mut desktop_rx),
            ServerFrame::ControlRequest { from, device_name } if from == "dev_m" && device_name == "Phone"
        ));

        send(&state, &desktop, &ClientFrame::ControlAck {
            to: "dev_m".to_string(),
            accepted: true,
        })
        .await;
        assert!(matches!(
            next_frame(&mut mobile_rx),
            ServerFrame::ControlAck { from, accepted } if from == "dev_d" && accepted
        ));

        send(&state, &desktop, &ClientFrame::ControlRevoked {
            to: "dev_m".to_string(),
        })
        .await;
        assert!(matches!(
            next_frame(&mut mobile_rx),
            ServerFrame::ControlRevoked { from } if from == "dev_d"
        ));

        // desktop 不可发起控制请求。
        send(&state, &desktop, &ClientFrame::ControlRequest {
            target_desktop_id: "dev_m".to_string(),
        })
        .await;
        assert_error(&mut desktop_rx, "ROLE_VIOLATION");
    }

    /// 离线目标返回 target-offline，上下线通知到达配对对端。
    #[tokio::test]
    async fn presence_and_offline_target() {
        let state = test_state();
        let (desktop, mut desktop_rx) = attach(&state, "user_a", "dev_d", DeviceRole::Desktop, "Desk").await;
        let (mobile, mut mobile_rx) = attach(&state, "user_a", "dev_m", DeviceRole::Mobile, "Phone").await;
        let _ = next_frame(&mut mobile_rx);

        send(&state, &desktop, &ClientFrame::RegisterPairing {
            pairing_code: "C8".to_string(),
            public_key: "04ab".to_string(),
            device_name: None,
        })
        .await;
        send(&state, &mobile, &ClientFrame::ClaimPairing {
            pairing_code: "C8".to_string(),
            public_key: "04cd".to_string(),
        })
        .await;
        let _ = next_frame(&mut desktop_rx);
        let _ = next_frame(&mut mobile_rx);

        // mobile 正常下线：desktop 收到 device-offline。
        state.detach("dev_m", mobile.conn_id).await;
        assert!(matches!(
            next_frame(&mut desktop_rx),
            ServerFrame::DeviceOffline { device_id } if device_id == "dev_m"
        ));

        send(&state, &desktop, &ClientFrame::Relay {
            to: "dev_m".to_string(),
            payload: "AAEC".to_string(),
            seq: 0,
        })
        .await;
        assert_error(&mut desktop_rx, "TARGET_OFFLINE");

        // mobile 重连：desktop 收 device-online，mobile 收含 dev_d 的列表。
        let (_mobile2, mut mobile2_rx) = attach(&state, "user_a", "dev_m", DeviceRole::Mobile, "Phone").await;
        assert!(matches!(
            next_frame(&mut desktop_rx),
            ServerFrame::DeviceOnline { device_id } if device_id == "dev_m"
        ));
        match next_frame(&mut mobile2_rx) {
            ServerFrame::DeviceList { devices } => {
                assert_eq!(devices.len(), 1);
                assert_eq!(devices[0].device_id, "dev_d");
                assert!(devices[0].online);
            }
            other => panic!("expected device-list, got {other:?}"),
        }
    }

    /// 协议级坏帧只回 error，不断连接。
    #[tokio::test]
    async fn malformed_frames_produce_single_error() {
        let state = test_state();
        let (desktop, mut desktop_rx) = attach(&state, "user_a", "dev_d", DeviceRole::Desktop, "Desk").await;

        handle_frame(&state, &desktop, "{oops").await;
        assert_error(&mut desktop_rx, "INVALID_FORMAT");

        handle_frame(&state, &desktop, r#"{"type":"teleport"}"#).await;
        assert_error(&mut desktop_rx, "UNKNOWN_TYPE");

        handle_frame(&state, &desktop, r#"{"type":"relay","to":"dev_m"}"#).await;
        assert_error(&mut desktop_rx, "MISSING_FIELD");

        handle_frame(&state, &desktop, r#"{"payload":1}"#).await;
        assert_error(&mut desktop_rx, "MISSING_FIELD");

        // 连接仍可用。
        send(&state, &desktop, &ClientFrame::Heartbeat).await;
        assert!(matches!(next_frame(&mut desktop_rx), ServerFrame::Pong));
    }

    /// mobile 调 register-pairing 是角色违规。
    #[tokio::test]
    async fn mobile_cannot_register_pairing() {
        let state = test_state();
        let (mobile, mut mobile_rx) = attach(&state, "user_a", "dev_m", DeviceRole::Mobile, "Phone").await;
        let _ = next_frame(&mut mobile_rx);

        send(&state, &mobile, &ClientFrame::RegisterPairing {
            pairing_code: "C9".to_string(),
            public_key: "04ab".to_string(),
            device_name: None,
        })
        .await;
        assert_error(&mut mobile_rx, "ROLE_VIOLATION");
    }
}
