//! WebSocket 握手与会话处理。

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use cs_shared_protocol::{DeviceRole, now_rfc3339_nanos};

use crate::{registry::DeviceConn, state::AppState, ws::router};

/// WS 握手 query 参数。
#[derive(Debug, Deserialize)]
pub(crate) struct WsQuery {
    #[serde(default)]
    pub(crate) token: String,
    #[serde(rename = "deviceType", default)]
    pub(crate) device_type: String,
    #[serde(rename = "deviceId", default)]
    pub(crate) device_id: String,
    #[serde(rename = "deviceName", default)]
    pub(crate) device_name: String,
}

/// WS 握手入口：校验 query、鉴权并升级连接。
pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(q): Query<WsQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if q.token.trim().is_empty()
        || q.device_type.trim().is_empty()
        || q.device_id.trim().is_empty()
        || q.device_name.trim().is_empty()
    {
        return Err((
            StatusCode::BAD_REQUEST,
            "missing token/deviceType/deviceId/deviceName".to_string(),
        ));
    }

    let Some(role) = DeviceRole::parse(&q.device_type) else {
        return Err((StatusCode::BAD_REQUEST, "invalid deviceType".to_string()));
    };

    let Some(user_id) = state.auth.verify_token(q.token.trim()) else {
        return Err((StatusCode::UNAUTHORIZED, "invalid token".to_string()));
    };
    if !state.auth.user_exists(&user_id) {
        return Err((StatusCode::UNAUTHORIZED, "unknown user".to_string()));
    }

    Ok(ws.on_upgrade(move |socket| handle_socket(state, socket, user_id, role, q)))
}

/// 单连接处理：注册连接、逐帧路由、断开清理。
async fn handle_socket(
    state: AppState,
    socket: WebSocket,
    user_id: String,
    role: DeviceRole,
    q: WsQuery,
) {
    let conn_id = Uuid::new_v4();
    let (mut ws_sender, mut ws_reader) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let conn = DeviceConn {
        user_id: user_id.clone(),
        device_id: q.device_id.trim().to_string(),
        role,
        device_name: q.device_name.trim().to_string(),
        conn_id,
        connected_at: now_rfc3339_nanos(),
        sender: tx,
    };
    let ctx = router::ConnCtx::from_conn(&conn);

    let displaced = state.attach(conn).await;
    info!(
        "ws connected user={} device={} role={} displaced={}",
        user_id,
        ctx.device_id,
        role.as_str(),
        displaced
    );

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    while let Some(next) = ws_reader.next().await {
        let msg = match next {
            Ok(m) => m,
            Err(err) => {
                warn!("ws read error device={}: {err}", ctx.device_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => router::handle_frame(&state, &ctx, text.as_str()).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.detach(&ctx.device_id, conn_id).await;
    writer.abort();
    info!(
        "ws disconnected user={} device={} role={}",
        user_id,
        ctx.device_id,
        role.as_str()
    );
}
