//! 设备注册表：全服务器范围内每个 deviceId 至多一条在线连接。

use axum::extract::ws::{CloseFrame, Message};
use std::collections::HashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use cs_shared_protocol::{DeviceRole, ServerFrame};

/// 顶号关闭原因，写进 Close 帧。
pub(crate) const REPLACED_CLOSE_REASON: &str = "replaced";

/// 单条设备连接。出站通道在连接存续期内归注册表持有者使用。
#[derive(Debug, Clone)]
pub(crate) struct DeviceConn {
    pub(crate) user_id: String,
    pub(crate) device_id: String,
    pub(crate) role: DeviceRole,
    pub(crate) device_name: String,
    /// 连接实例 ID，用于防止被替换连接的迟到清理。
    pub(crate) conn_id: Uuid,
    pub(crate) connected_at: String,
    pub(crate) sender: mpsc::UnboundedSender<Message>,
}

impl DeviceConn {
    /// 序列化并发送一帧；返回是否写入成功。
    pub(crate) fn send(&self, frame: &ServerFrame) -> bool {
        let Ok(raw) = serde_json::to_string(frame) else {
            return false;
        };
        self.sender.send(Message::Text(raw.into())).is_ok()
    }

    /// 发送顶号关闭帧。
    pub(crate) fn send_replaced_close(&self) {
        let _ = self.sender.send(Message::Close(Some(CloseFrame {
            code: 1000,
            reason: REPLACED_CLOSE_REASON.into(),
        })));
    }
}

/// 在线连接表，键为 deviceId。
#[derive(Debug, Default)]
pub(crate) struct DeviceRegistry {
    devices: HashMap<String, DeviceConn>,
}

impl DeviceRegistry {
    /// 注册连接；同 deviceId 的旧连接被移除并返回给调用方关闭。
    pub(crate) fn attach(&mut self, conn: DeviceConn) -> Option<DeviceConn> {
        self.devices.insert(conn.device_id.clone(), conn)
    }

    /// 注销连接。仅当当前登记的就是该连接实例时才移除，
    /// 防止「替换后旧连接关闭」竞态误删新连接。
    pub(crate) fn detach(&mut self, device_id: &str, conn_id: Uuid) -> Option<DeviceConn> {
        match self.devices.get(device_id) {
            Some(existing) if existing.conn_id == conn_id => self.devices.remove(device_id),
            _ => None,
        }
    }

    pub(crate) fn get(&self, device_id: &str) -> Option<&DeviceConn> {
        self.devices.get(device_id)
    }

    pub(crate) fn is_online(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cs_shared_protocol::now_rfc3339_nanos;

    fn conn(device_id: &str) -> (DeviceConn, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            DeviceConn {
                user_id: "user_a".to_string(),
                device_id: device_id.to_string(),
                role: DeviceRole::Desktop,
                device_name: "Studio Desk".to_string(),
                conn_id: Uuid::new_v4(),
                connected_at: now_rfc3339_nanos(),
                sender: tx,
            },
            rx,
        )
    }

    #[test]
    fn attach_displaces_prior_connection() {
        let mut registry = DeviceRegistry::default();
        let (first, _rx1) = conn("dev_a");
        let first_id = first.conn_id;
        assert!(registry.attach(first).is_none());

        let (second, _rx2) = conn("dev_a");
        let displaced = registry.attach(second).unwrap();
        assert_eq!(displaced.conn_id, first_id);
        assert!(registry.is_online("dev_a"));
    }

    #[test]
    fn detach_only_removes_matching_instance() {
        let mut registry = DeviceRegistry::default();
        let (first, _rx1) = conn("dev_a");
        let stale_id = first.conn_id;
        registry.attach(first);
        let (second, _rx2) = conn("dev_a");
        let live_id = second.conn_id;
        registry.attach(second);

        // 被替换连接的迟到清理不能摘掉新连接。
        assert!(registry.detach("dev_a", stale_id).is_none());
        assert!(registry.is_online("dev_a"));
        assert!(registry.detach("dev_a", live_id).is_some());
        assert!(!registry.is_online("dev_a"));
    }

    #[test]
    fn replaced_close_reaches_old_socket() {
        let (old, mut rx) = conn("dev_a");
        old.send_replaced_close();
        match rx.try_recv().unwrap() {
            Message::Close(Some(frame)) => assert_eq!(frame.reason.as_str(), "replaced"),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
