//! Relay 共享状态：三张路由表（注册表 / offer 表 / 配对图）与认证句柄。

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use cs_shared_protocol::{DeviceRole, DeviceSummary, ServerFrame};

use crate::{
    auth::AuthService,
    config::Config,
    pairing::{graph::PairingGraph, store::PairingStore},
    registry::{DeviceConn, DeviceRegistry},
};

/// 路由触及的三张共享表，统一放在一把锁下，link 等两步操作天然原子。
#[derive(Debug)]
pub(crate) struct RouterState {
    pub(crate) registry: DeviceRegistry,
    pub(crate) offers: PairingStore,
    pub(crate) graph: PairingGraph,
}

/// Relay 共享状态。
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) router: Arc<RwLock<RouterState>>,
    pub(crate) auth: Arc<dyn AuthService>,
}

impl AppState {
    pub(crate) fn new(cfg: &Config, auth: Arc<dyn AuthService>) -> Self {
        Self {
            router: Arc::new(RwLock::new(RouterState {
                registry: DeviceRegistry::default(),
                offers: PairingStore::new(cfg.pairing_ttl.as_secs()),
                graph: PairingGraph::default(),
            })),
            auth,
        }
    }

    /// 注册连接：顶号关闭旧连接、向配对对端广播上线、
    /// mobile 连接即刻下发 desktop 列表。
    pub(crate) async fn attach(&self, conn: DeviceConn) -> bool {
        let mut guard = self.router.write().await;

        if conn.role == DeviceRole::Desktop {
            guard
                .graph
                .refresh_desktop_name(&conn.user_id, &conn.device_id, &conn.device_name);
        }

        let device_list = (conn.role == DeviceRole::Mobile).then(|| ServerFrame::DeviceList {
            devices: guard
                .graph
                .desktops_for_user(&conn.user_id)
                .into_iter()
                .map(|(device_id, device_name)| DeviceSummary {
                    online: guard.registry.is_online(&device_id),
                    device_id,
                    device_name,
                })
                .collect(),
        });

        let displaced = guard.registry.attach(conn.clone());
        let was_displaced = displaced.is_some();
        if let Some(old) = displaced {
            old.send_replaced_close();
        }

        // 顶号场景下设备对对端而言从未离线，不重复广播上线。
        if !was_displaced {
            for peer_id in guard.graph.peer_of(&conn.user_id, &conn.device_id) {
                if let Some(peer) = guard.registry.get(&peer_id) {
                    peer.send(&ServerFrame::DeviceOnline {
                        device_id: conn.device_id.clone(),
                    });
                }
            }
        }

        if let Some(frame) = device_list {
            conn.send(&frame);
        }
        was_displaced
    }

    /// 注销连接并广播下线。被替换连接的迟到清理在注册表层被挡下，
    /// 因此不会误发 device-offline。
    pub(crate) async fn detach(&self, device_id: &str, conn_id: uuid::Uuid) {
        let mut guard = self.router.write().await;
        let Some(conn) = guard.registry.detach(device_id, conn_id) else {
            return;
        };
        for peer_id in guard.graph.peer_of(&conn.user_id, &conn.device_id) {
            if let Some(peer) = guard.registry.get(&peer_id) {
                peer.send(&ServerFrame::DeviceOffline {
                    device_id: conn.device_id.clone(),
                });
            }
        }
    }

    /// 清扫过期配对 offer。
    pub(crate) async fn sweep_offers(&self, now: u64) {
        let mut guard = self.router.write().await;
        let removed = guard.offers.sweep(now);
        if removed > 0 {
            debug!("swept {removed} expired pairing offers");
        }
    }
}
