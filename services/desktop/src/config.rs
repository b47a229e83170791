//! 配置模块职责：
//! 1. 读取 desktop 端运行所需的环境变量与持久化配置文件，并提供默认值。
//! 2. 管理解锁密码、远程控制开关与接管延迟等本机策略项。
//! 3. 提供宿主机名探测与通用解析辅助。

use std::{
    fs,
    path::PathBuf,
    process::Command,
    time::Duration,
};

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use cs_endpoint_core::identity::{config_dir, load_or_create_device_id};

/// 默认 relay 地址（开发态默认本机）。
const DEFAULT_RELAY_URL: &str = "http://127.0.0.1:18080";
/// 默认本机管理端口监听地址。
const DEFAULT_ADMIN_ADDR: &str = "127.0.0.1:18081";
/// 出厂解锁密码。
pub(crate) const DEFAULT_UNLOCK_SECRET: &str = "666666";
/// 默认聊天 CLI。
const DEFAULT_CHAT_COMMAND: &str = "claude";
/// 持久化配置版本。
const CONFIG_VERSION: u8 = 1;

/// desktop 持久化配置（仅存可覆盖项，不存 token）。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PersistedConfig {
    #[serde(default)]
    pub(crate) version: u8,
    #[serde(default)]
    pub(crate) relay_url: Option<String>,
    #[serde(default)]
    pub(crate) device_name: Option<String>,
    #[serde(default)]
    pub(crate) unlock_secret: Option<String>,
    #[serde(default)]
    pub(crate) allow_remote_control: Option<bool>,
    #[serde(default)]
    pub(crate) auto_lock_timeout_ms: Option<u64>,
}

/// desktop 运行时配置。
#[derive(Debug, Clone)]
pub(crate) struct Config {
    /// relay 服务地址。
    pub(crate) relay_url: String,
    /// bearer token（来自认证服务）。
    pub(crate) token: String,
    /// 本机设备 ID。
    pub(crate) device_id: String,
    /// 本机显示名。
    pub(crate) device_name: String,
    /// 本机管理端口（解锁与策略配置）。
    pub(crate) admin_addr: String,
    /// 解锁密码（六位数字）。
    pub(crate) unlock_secret: String,
    /// 是否允许远程接管。
    pub(crate) allow_remote_control: bool,
    /// 接管前的宽限延迟；0 表示立即接管。
    pub(crate) auto_lock_timeout: Duration,
    /// 聊天 CLI 命令。
    pub(crate) chat_command: String,
    /// 会话历史目录。
    pub(crate) sessions_dir: PathBuf,
    /// git / 文件检索的工作根目录。
    pub(crate) workspace_dir: PathBuf,
    /// 配置目录（会话存储等落盘位置）。
    pub(crate) config_root: Option<PathBuf>,
}

impl Config {
    /// 从环境变量与配置文件构建配置。token 缺失视为致命错误。
    pub(crate) fn load() -> anyhow::Result<Self> {
        let config_root = config_dir("desktop");
        let persisted = load_persisted(config_root.as_deref()).unwrap_or_default();

        let token = env_trimmed("CS_TOKEN").unwrap_or_default();
        if token.is_empty() {
            bail!("CS_TOKEN is required; issue one with `cs-relay token <userId>`");
        }

        let relay_url = env_trimmed("CS_RELAY_URL")
            .or_else(|| persisted.relay_url.clone())
            .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string());

        let device_name = env_trimmed("CS_DEVICE_NAME")
            .or_else(|| persisted.device_name.clone())
            .map(|raw| normalize_device_name(&raw))
            .filter(|value| !value.is_empty())
            .unwrap_or_else(detect_host_name);

        let unlock_secret = env_trimmed("CS_UNLOCK_SECRET")
            .or_else(|| persisted.unlock_secret.clone())
            .filter(|value| is_valid_unlock_secret(value))
            .unwrap_or_else(|| DEFAULT_UNLOCK_SECRET.to_string());

        let device_id = config_root
            .as_deref()
            .map(load_or_create_device_id)
            .unwrap_or_else(|| "desktop-local".to_string());

        let sessions_dir = env_trimmed("CS_SESSIONS_DIR")
            .map(PathBuf::from)
            .or_else(|| config_root.as_ref().map(|root| root.join("sessions")))
            .unwrap_or_else(|| PathBuf::from("sessions"));

        let workspace_dir = env_trimmed("CS_WORKSPACE_DIR")
            .map(PathBuf::from)
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            relay_url,
            token,
            device_id,
            device_name,
            admin_addr: env_trimmed("CS_DESKTOP_ADDR")
                .unwrap_or_else(|| DEFAULT_ADMIN_ADDR.to_string()),
            unlock_secret,
            allow_remote_control: bool_from_env("CS_ALLOW_REMOTE_CONTROL")
                .or(persisted.allow_remote_control)
                .unwrap_or(true),
            auto_lock_timeout: Duration::from_millis(
                u64_from_env("CS_AUTO_LOCK_TIMEOUT_MS")
                    .or(persisted.auto_lock_timeout_ms)
                    .unwrap_or(0),
            ),
            chat_command: env_trimmed("CS_CHAT_COMMAND")
                .unwrap_or_else(|| DEFAULT_CHAT_COMMAND.to_string()),
            sessions_dir,
            workspace_dir,
            config_root,
        })
    }

    /// 把当前可持久化的策略项写回配置文件。
    pub(crate) fn persist_policy(
        &self,
        unlock_secret: &str,
        allow_remote_control: bool,
        auto_lock_timeout: Duration,
    ) -> anyhow::Result<()> {
        let Some(root) = self.config_root.as_ref() else {
            return Ok(());
        };
        let mut persisted = load_persisted(Some(root)).unwrap_or_default();
        persisted.version = CONFIG_VERSION;
        persisted.relay_url = Some(self.relay_url.clone());
        persisted.device_name = Some(self.device_name.clone());
        persisted.unlock_secret = Some(unlock_secret.to_string());
        persisted.allow_remote_control = Some(allow_remote_control);
        persisted.auto_lock_timeout_ms = Some(auto_lock_timeout.as_millis() as u64);

        fs::create_dir_all(root)
            .with_context(|| format!("create config dir failed: {}", root.display()))?;
        let path = root.join("config.json");
        let payload = serde_json::to_string_pretty(&persisted).context("encode config failed")?;
        fs::write(&path, format!("{payload}\n"))
            .with_context(|| format!("write config failed: {}", path.display()))?;
        Ok(())
    }
}

/// 读取持久化配置；文件不存在时返回默认。
fn load_persisted(root: Option<&std::path::Path>) -> anyhow::Result<PersistedConfig> {
    let Some(root) = root else {
        return Ok(PersistedConfig::default());
    };
    let path = root.join("config.json");
    if !path.exists() {
        return Ok(PersistedConfig::default());
    }
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("read config failed: {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("decode config failed: {}", path.display()))
}

/// 解锁密码必须是六位 ASCII 数字。
pub(crate) fn is_valid_unlock_secret(secret: &str) -> bool {
    secret.len() == 6 && secret.chars().all(|c| c.is_ascii_digit())
}

/// 读取环境变量并去空白；空值视为未设置。
fn env_trimmed(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// 解析可选布尔环境变量。
fn bool_from_env(key: &str) -> Option<bool> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "y" | "on" => Some(true),
            "0" | "false" | "no" | "n" | "off" => Some(false),
            _ => None,
        },
        Err(_) => None,
    }
}

/// 解析可选 u64 环境变量。
fn u64_from_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
}

/// 推断宿主机名称：优先系统环境变量，其次系统命令。
fn detect_host_name() -> String {
    for key in ["COMPUTERNAME", "HOSTNAME"] {
        if let Ok(value) = std::env::var(key) {
            let normalized = normalize_device_name(&value);
            if !normalized.is_empty() {
                return normalized;
            }
        }
    }

    if let Ok(output) = Command::new("hostname").output() {
        let value = String::from_utf8_lossy(&output.stdout);
        let normalized = normalize_device_name(&value);
        if !normalized.is_empty() {
            return normalized;
        }
    }

    "Claude Studio Desktop".to_string()
}

/// 规范化显示名：去空白，限长 64 字符。
fn normalize_device_name(raw: &str) -> String {
    raw.trim().chars().take(64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlock_secret_must_be_six_digits() {
        assert!(is_valid_unlock_secret("666666"));
        assert!(is_valid_unlock_secret("000000"));
        assert!(!is_valid_unlock_secret("12345"));
        assert!(!is_valid_unlock_secret("1234567"));
        assert!(!is_valid_unlock_secret("12345a"));
        assert!(!is_valid_unlock_secret(""));
    }

    #[test]
    fn device_name_is_trimmed_and_bounded() {
        assert_eq!(normalize_device_name("  My Desk  "), "My Desk");
        assert_eq!(normalize_device_name(&"x".repeat(100)).len(), 64);
    }
}
