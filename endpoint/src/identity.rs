//! 设备身份模块职责：
//! 1. 每端维护一个稳定 hex deviceId，懒创建、永不覆盖。
//! 2. 提供 `~/.config/claude-studio/<service>` 配置目录定位。

use std::{
    fs,
    path::{Path, PathBuf},
};

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// 设备 ID 文件名（纯文本，单行 hex）。
const DEVICE_ID_FILE: &str = "device-id";

/// 返回 `~/.config/claude-studio/<service>`；HOME 缺失时返回 None。
pub fn config_dir(service: &str) -> Option<PathBuf> {
    let home = std::env::var("HOME").ok()?;
    if home.trim().is_empty() {
        return None;
    }
    Some(
        Path::new(&home)
            .join(".config")
            .join("claude-studio")
            .join(service),
    )
}

/// 读取或生成设备 ID。已有文件只读不写，保证跨重装前 ID 稳定。
pub fn load_or_create_device_id(config_dir: &Path) -> String {
    let path = config_dir.join(DEVICE_ID_FILE);
    if let Ok(raw) = fs::read_to_string(&path) {
        let value = raw.trim().to_string();
        if !value.is_empty() {
            return value;
        }
    }

    let value = generate_device_id();
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let _ = fs::write(&path, format!("{value}\n"));
    value
}

/// 按「安装随机 UUID + 系统用户名」哈希出稳定短 hex ID。
fn generate_device_id() -> String {
    let install = Uuid::new_v4().simple().to_string();
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let digest = Sha256::digest(format!("{install}:{user}").as_bytes());
    hex::encode(&digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_is_stable_across_reads() {
        let dir = std::env::temp_dir().join(format!("cs-id-{}", Uuid::new_v4().simple()));
        let first = load_or_create_device_id(&dir);
        let second = load_or_create_device_id(&dir);
        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn existing_file_is_never_overwritten() {
        let dir = std::env::temp_dir().join(format!("cs-id-{}", Uuid::new_v4().simple()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(DEVICE_ID_FILE), "cafebabe\n").unwrap();
        assert_eq!(load_or_create_device_id(&dir), "cafebabe");
        let _ = fs::remove_dir_all(&dir);
    }
}
