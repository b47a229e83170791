//! 会话存储模块职责：
//! 1. 维护按对端 deviceId 索引的 E2EE 会话（密钥 + 双向计数器）。
//! 2. 整文件替换式 JSON 持久化，计数器跨重启保持单调。
//! 3. 落实解密失败即弃会话的策略，强制走重新配对。

use std::{collections::HashMap, fs, path::PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use cs_shared_protocol::e2ee::{E2eeError, E2eeSession};

use crate::error::ClientError;

/// 每发送多少帧刷一次计数器落盘。
const FLUSH_EVERY_SENDS: u32 = 5;
/// 会话文件名。
pub const SESSIONS_FILE: &str = "e2ee-sessions.json";

/// 会话文件结构。
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionFile {
    #[serde(default)]
    version: u8,
    #[serde(default)]
    peers: Vec<PeerRecord>,
}

/// 单个对端的持久化记录。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeerRecord {
    device_id: String,
    #[serde(default)]
    device_name: String,
    derived_key_hex: String,
    outbound_seq: u64,
    last_inbound_seq: i64,
}

/// 入站解密失败分类。
#[derive(Debug)]
pub enum SessionFailure {
    /// 本端没有该对端的会话。
    NoSession,
    /// 会话已被弃置（重放或 tag 校验失败），需要重新配对。
    Dropped(E2eeError),
}

struct PeerEntry {
    device_name: String,
    session: E2eeSession,
}

/// E2EE 会话存储。路径为空时仅内存生效（HOME 缺失的兜底）。
pub struct SessionStore {
    path: Option<PathBuf>,
    peers: HashMap<String, PeerEntry>,
    sends_since_flush: u32,
}

impl SessionStore {
    /// 从本地文件加载；文件缺失或损坏时回退为空存储。
    pub fn load(path: Option<PathBuf>) -> Self {
        let mut store = Self {
            path,
            peers: HashMap::new(),
            sends_since_flush: 0,
        };
        let Some(path_ref) = store.path.as_ref() else {
            return store;
        };
        let Ok(bytes) = fs::read(path_ref) else {
            return store;
        };

        let parsed = serde_json::from_slice::<SessionFile>(&bytes).unwrap_or_else(|err| {
            warn!("load e2ee sessions failed: {err}");
            SessionFile::default()
        });
        for record in parsed.peers {
            match E2eeSession::from_parts(
                &record.derived_key_hex,
                record.outbound_seq,
                record.last_inbound_seq,
            ) {
                Ok(session) => {
                    store.peers.insert(
                        record.device_id,
                        PeerEntry {
                            device_name: record.device_name,
                            session,
                        },
                    );
                }
                Err(err) => warn!("skip corrupt session for {}: {err}", record.device_id),
            }
        }
        store
    }

    /// 是否存在指定对端会话。
    pub fn has(&self, device_id: &str) -> bool {
        self.peers.contains_key(device_id)
    }

    /// 对端显示名（无记录时为空）。
    pub fn peer_name(&self, device_id: &str) -> Option<&str> {
        self.peers.get(device_id).map(|entry| entry.device_name.as_str())
    }

    /// 当前已配对的对端列表（按 deviceId 排序）。
    pub fn list_peers(&self) -> Vec<(String, String)> {
        let mut peers = self
            .peers
            .iter()
            .map(|(id, entry)| (id.clone(), entry.device_name.clone()))
            .collect::<Vec<_>>();
        peers.sort();
        peers
    }

    /// 写入（或替换）对端会话并立即落盘。重配对必须覆盖旧会话，
    /// 否则密钥与计数器会错位。
    pub fn insert(&mut self, device_id: &str, device_name: &str, session: E2eeSession) {
        self.peers.insert(
            device_id.to_string(),
            PeerEntry {
                device_name: device_name.to_string(),
                session,
            },
        );
        self.persist();
    }

    /// 仅更新对端显示名（配对确认时补全，不触碰计数器）。
    pub fn set_peer_name(&mut self, device_id: &str, device_name: &str) {
        if let Some(entry) = self.peers.get_mut(device_id) {
            entry.device_name = device_name.to_string();
            self.persist();
        }
    }

    /// 移除对端会话并落盘；返回是否实际存在。
    pub fn remove(&mut self, device_id: &str) -> bool {
        let removed = self.peers.remove(device_id).is_some();
        if removed {
            self.persist();
        }
        removed
    }

    /// 出站加密；每 `FLUSH_EVERY_SENDS` 帧刷一次计数器。
    pub fn encrypt_for(
        &mut self,
        device_id: &str,
        plaintext: &[u8],
    ) -> Result<(String, u64), ClientError> {
        let Some(entry) = self.peers.get_mut(device_id) else {
            return Err(ClientError::NoSession(device_id.to_string()));
        };
        let (payload, seq) = entry.session.encrypt(plaintext)?;

        self.sends_since_flush += 1;
        if self.sends_since_flush >= FLUSH_EVERY_SENDS {
            self.persist();
        }
        Ok((payload, seq))
    }

    /// 入站解密。任何解密失败（重放、tag 校验、信封损坏）都弃掉
    /// 会话并落盘，不再用同一把密钥重试，迫使重新配对。
    pub fn decrypt_from(
        &mut self,
        device_id: &str,
        payload: &str,
        seq: u64,
    ) -> Result<Vec<u8>, SessionFailure> {
        let Some(entry) = self.peers.get_mut(device_id) else {
            return Err(SessionFailure::NoSession);
        };
        match entry.session.decrypt(payload, seq) {
            Ok(plaintext) => Ok(plaintext),
            Err(err) => {
                self.peers.remove(device_id);
                self.persist();
                Err(SessionFailure::Dropped(err))
            }
        }
    }

    /// 全量落盘（整文件替换写）。
    pub fn persist(&mut self) {
        self.sends_since_flush = 0;
        let Some(path) = self.path.as_ref() else {
            return;
        };
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }

        let mut peers = self
            .peers
            .iter()
            .map(|(device_id, entry)| PeerRecord {
                device_id: device_id.clone(),
                device_name: entry.device_name.clone(),
                derived_key_hex: entry.session.derived_key_hex(),
                outbound_seq: entry.session.outbound_seq(),
                last_inbound_seq: entry.session.last_inbound_seq(),
            })
            .collect::<Vec<_>>();
        peers.sort_by(|a, b| a.device_id.cmp(&b.device_id));

        let file = SessionFile { version: 1, peers };
        match serde_json::to_vec_pretty(&file) {
            Ok(bytes) => {
                if let Err(err) = fs::write(path, bytes) {
                    warn!("persist e2ee sessions failed: {err}");
                }
            }
            Err(err) => warn!("encode e2ee sessions failed: {err}"),
        }
    }
}
