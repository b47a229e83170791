//! 本机管理端口：健康检查、控制状态查询、解锁与策略配置。
//! 仅监听回环地址，是解锁密码的「配置口」。

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

/// 主循环处理的管理请求。
pub(crate) enum AdminRequest {
    /// 解锁尝试。
    Unlock {
        secret: String,
        reply: oneshot::Sender<Value>,
    },
    /// 控制状态快照。
    ControlState { reply: oneshot::Sender<Value> },
    /// 策略更新（缺省字段不变）。
    UpdatePolicy {
        unlock_secret: Option<String>,
        allow_remote_control: Option<bool>,
        auto_lock_timeout_ms: Option<u64>,
        reply: oneshot::Sender<Result<Value, String>>,
    },
}

#[derive(Clone)]
struct AdminState {
    tx: mpsc::UnboundedSender<AdminRequest>,
}

/// 启动管理端口服务。
pub(crate) fn spawn(addr: String, tx: mpsc::UnboundedSender<AdminRequest>) {
    tokio::spawn(async move {
        let app = Router::new()
            .route("/healthz", get(|| async { "ok" }))
            .route("/v1/control/state", get(control_state))
            .route("/v1/control/unlock", post(unlock))
            .route("/v1/control/config", post(update_config))
            .with_state(AdminState { tx });

        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(err) => {
                error!("admin port bind failed on {addr}: {err}");
                return;
            }
        };
        info!("cs-desktop admin listening on {addr}");
        if let Err(err) = axum::serve(listener, app).await {
            error!("admin server exited: {err}");
        }
    });
}

async fn control_state(State(state): State<AdminState>) -> Result<Json<Value>, StatusCode> {
    let (reply_tx, reply_rx) = oneshot::channel();
    state
        .tx
        .send(AdminRequest::ControlState { reply: reply_tx })
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    let value = reply_rx.await.map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(value))
}

#[derive(Deserialize)]
struct UnlockBody {
    #[serde(default)]
    secret: String,
}

async fn unlock(
    State(state): State<AdminState>,
    Json(body): Json<UnlockBody>,
) -> Result<Json<Value>, StatusCode> {
    let (reply_tx, reply_rx) = oneshot::channel();
    state
        .tx
        .send(AdminRequest::Unlock {
            secret: body.secret,
            reply: reply_tx,
        })
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    let value = reply_rx.await.map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(value))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigBody {
    #[serde(default)]
    unlock_secret: Option<String>,
    #[serde(default)]
    allow_remote_control: Option<bool>,
    #[serde(default)]
    auto_lock_timeout_ms: Option<u64>,
}

async fn update_config(
    State(state): State<AdminState>,
    Json(body): Json<ConfigBody>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let (reply_tx, reply_rx) = oneshot::channel();
    state
        .tx
        .send(AdminRequest::UpdatePolicy {
            unlock_secret: body.unlock_secret,
            allow_remote_control: body.allow_remote_control,
            auto_lock_timeout_ms: body.auto_lock_timeout_ms,
            reply: reply_tx,
        })
        .map_err(|_| {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "ok": false, "message": "desktop loop unavailable" })),
            )
        })?;
    match reply_rx.await {
        Ok(Ok(value)) => Ok(Json(value)),
        Ok(Err(message)) => Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "ok": false, "message": message })),
        )),
        Err(_) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ok": false, "message": "desktop loop unavailable" })),
        )),
    }
}
