//! mobile 配置：扫码后保存的 relay 连接信息与设备身份。

use std::{fs, path::PathBuf};

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use cs_endpoint_core::identity::{config_dir, load_or_create_device_id};

/// relay 连接配置文件名。
const RELAY_CONFIG_FILE: &str = "relay-config.json";

/// 首次扫码成功后保存的连接信息。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RelayConfig {
    pub(crate) server_url: String,
    pub(crate) token: String,
}

/// mobile 配置目录。
pub(crate) fn mobile_config_dir() -> Option<PathBuf> {
    config_dir("mobile")
}

/// 读取 relay 连接配置；未配对过时给出操作提示。
pub(crate) fn load_relay_config() -> anyhow::Result<RelayConfig> {
    let Some(path) = mobile_config_dir().map(|dir| dir.join(RELAY_CONFIG_FILE)) else {
        bail!("HOME not set, cannot locate relay config");
    };
    if !path.exists() {
        bail!("尚未配对：先在 desktop 上扫码并执行 `cs-mobile pair '<二维码内容>'`");
    }
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("read relay config failed: {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("decode relay config failed: {}", path.display()))
}

/// 持久化 relay 连接配置。
pub(crate) fn save_relay_config(cfg: &RelayConfig) -> anyhow::Result<()> {
    let Some(dir) = mobile_config_dir() else {
        bail!("HOME not set, cannot persist relay config");
    };
    fs::create_dir_all(&dir)
        .with_context(|| format!("create config dir failed: {}", dir.display()))?;
    let path = dir.join(RELAY_CONFIG_FILE);
    let payload = serde_json::to_string_pretty(cfg).context("encode relay config failed")?;
    fs::write(&path, format!("{payload}\n"))
        .with_context(|| format!("write relay config failed: {}", path.display()))?;
    Ok(())
}

/// 本端设备身份（ID 懒创建，名称可用环境变量覆盖）。
pub(crate) fn device_identity() -> (String, String) {
    let device_id = mobile_config_dir()
        .as_deref()
        .map(load_or_create_device_id)
        .unwrap_or_else(|| "mobile-local".to_string());
    let device_name = std::env::var("CS_DEVICE_NAME")
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "Claude Studio Mobile".to_string());
    (device_id, device_name)
}
