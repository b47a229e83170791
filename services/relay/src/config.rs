//! Relay 配置：监听地址、CORS 白名单与鉴权参数，全部来自环境变量。

use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

/// 默认监听地址。
const DEFAULT_RELAY_ADDR: &str = "0.0.0.0:18080";
/// 配对 offer 默认 TTL（秒）。
const DEFAULT_PAIRING_TTL_SEC: u64 = 300;
/// 过期 offer 清扫周期（秒）。
const DEFAULT_SWEEP_INTERVAL_SEC: u64 = 60;

/// Relay 运行时配置。
#[derive(Debug, Clone)]
pub(crate) struct Config {
    /// HTTP/WS 监听地址。
    pub(crate) addr: String,
    /// CORS 允许来源；为空表示放行所有来源。
    pub(crate) allow_origins: Vec<String>,
    /// token 签名密钥。
    pub(crate) auth_signing_key: String,
    /// 是否关闭未知用户自动放行（开启后仅 `CS_KNOWN_USERS` 可连）。
    pub(crate) disable_registration: bool,
    /// 已知用户白名单。
    pub(crate) known_users: Vec<String>,
    /// 配对 offer TTL。
    pub(crate) pairing_ttl: Duration,
    /// 清扫周期。
    pub(crate) sweep_interval: Duration,
}

impl Config {
    /// 从环境变量构建配置。
    pub(crate) fn from_env() -> Self {
        let auth_signing_key = std::env::var("CS_AUTH_SIGNING_KEY")
            .ok()
            .map(|raw| raw.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| {
                let generated = Uuid::new_v4().simple().to_string();
                warn!("CS_AUTH_SIGNING_KEY not set; using a per-process random key");
                generated
            });

        Self {
            addr: env_or_default("CS_RELAY_ADDR", DEFAULT_RELAY_ADDR),
            allow_origins: csv_from_env("CS_ALLOW_ORIGINS"),
            auth_signing_key,
            disable_registration: bool_from_env("CS_DISABLE_REGISTRATION", false),
            known_users: csv_from_env("CS_KNOWN_USERS"),
            pairing_ttl: duration_from_env("CS_PAIRING_TTL_SEC", DEFAULT_PAIRING_TTL_SEC),
            sweep_interval: duration_from_env(
                "CS_PAIRING_SWEEP_INTERVAL_SEC",
                DEFAULT_SWEEP_INTERVAL_SEC,
            ),
        }
    }
}

/// 读取环境变量；不存在时返回默认值。
fn env_or_default(key: &str, fallback: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

/// 逗号分隔环境变量解析为列表。
fn csv_from_env(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// 解析布尔环境变量，支持常见 true/false 文本。
fn bool_from_env(key: &str, fallback: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "y" | "on" => true,
            "0" | "false" | "no" | "n" | "off" => false,
            _ => fallback,
        },
        Err(_) => fallback,
    }
}

/// 读取秒级时长配置，非法值回退默认。
fn duration_from_env(key: &str, fallback_sec: u64) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(fallback_sec))
}
