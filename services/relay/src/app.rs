//! Relay 应用装配：路由、CORS、offer 清扫任务与监听。

use std::sync::Arc;

use axum::{
    Router,
    http::{
        HeaderValue, Method,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
    routing::get,
};
use tokio::time::MissedTickBehavior;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use cs_shared_protocol::RELAY_WS_PATH;

use crate::{
    auth::{HmacTokenAuth, unix_now},
    config::Config,
    state::AppState,
    ws::handlers::ws_handler,
};

/// Relay 入口：装配状态与路由并开始监听。
pub(crate) async fn run() -> anyhow::Result<()> {
    let cfg = Config::from_env();
    let auth = HmacTokenAuth::new(
        cfg.auth_signing_key.clone(),
        cfg.disable_registration.then(|| cfg.known_users.clone()),
    );
    let state = AppState::new(&cfg, Arc::new(auth));

    spawn_offer_sweeper(state.clone(), &cfg);

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route(RELAY_WS_PATH, get(ws_handler))
        .layer(cors_layer(&cfg))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&cfg.addr).await?;
    info!("cs-relay listening on {}", cfg.addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// 健康检查接口。
async fn healthz() -> &'static str {
    "ok"
}

/// CORS：配置了白名单则精确放行，否则放行所有来源。
fn cors_layer(cfg: &Config) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION]);
    if cfg.allow_origins.is_empty() {
        return base.allow_origin(Any);
    }

    let origins = cfg
        .allow_origins
        .iter()
        .filter_map(|raw| match raw.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("ignore invalid allow origin: {raw}");
                None
            }
        })
        .collect::<Vec<_>>();
    base.allow_origin(origins)
}

/// 周期清扫过期配对 offer。
fn spawn_offer_sweeper(state: AppState, cfg: &Config) {
    let interval = cfg.sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            state.sweep_offers(unix_now()).await;
        }
    });
}
