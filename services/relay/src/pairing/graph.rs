//! 配对关系图：用户名下 desktop↔mobile 的内存关系，仅作路由判定。
//!
//! 服务端不持久化配对；关系由每次 claim 事件重建。端侧的派生密钥
//! 才是通信是否可用的最终依据。

use std::collections::{BTreeMap, HashMap};

/// 单条配对关系。
#[derive(Debug, Clone)]
pub(crate) struct PairRelation {
    pub(crate) user_id: String,
    pub(crate) desktop_id: String,
    pub(crate) mobile_id: String,
    pub(crate) paired_at: String,
}

/// 配对关系图。关系量极小，线性扫描即可。
#[derive(Debug, Default)]
pub(crate) struct PairingGraph {
    relations: Vec<PairRelation>,
    /// 每个用户名下「出现过配对」的 desktop 及其最近显示名（只增不减）。
    desktops_seen: HashMap<String, BTreeMap<String, String>>,
}

impl PairingGraph {
    /// 建立配对；同一 (user, desktop, mobile) 的旧关系被替换。
    pub(crate) fn link(
        &mut self,
        user_id: &str,
        desktop_id: &str,
        mobile_id: &str,
        desktop_name: &str,
        paired_at: String,
    ) {
        self.relations.retain(|r| {
            !(r.user_id == user_id && r.desktop_id == desktop_id && r.mobile_id == mobile_id)
        });
        self.relations.push(PairRelation {
            user_id: user_id.to_string(),
            desktop_id: desktop_id.to_string(),
            mobile_id: mobile_id.to_string(),
            paired_at,
        });
        self.desktops_seen
            .entry(user_id.to_string())
            .or_default()
            .insert(desktop_id.to_string(), desktop_name.to_string());
    }

    /// 解除包含这两台设备（任意角色方向）的关系；返回是否有移除。
    pub(crate) fn unlink(&mut self, device_a: &str, device_b: &str) -> bool {
        let before = self.relations.len();
        self.relations.retain(|r| {
            !((r.desktop_id == device_a && r.mobile_id == device_b)
                || (r.desktop_id == device_b && r.mobile_id == device_a))
        });
        before != self.relations.len()
    }

    /// 指定用户名下两台设备是否互为配对（角色方向不限）。
    pub(crate) fn are_linked(&self, user_id: &str, device_a: &str, device_b: &str) -> bool {
        self.relations.iter().any(|r| {
            r.user_id == user_id
                && ((r.desktop_id == device_a && r.mobile_id == device_b)
                    || (r.desktop_id == device_b && r.mobile_id == device_a))
        })
    }

    /// 用户名下与指定设备配对的全部对端。
    pub(crate) fn peer_of(&self, user_id: &str, device_id: &str) -> Vec<String> {
        let mut peers = Vec::new();
        for r in &self.relations {
            if r.user_id != user_id {
                continue;
            }
            if r.desktop_id == device_id {
                peers.push(r.mobile_id.clone());
            } else if r.mobile_id == device_id {
                peers.push(r.desktop_id.clone());
            }
        }
        peers
    }

    /// 用户名下出现过配对的 desktop（含显示名），按 ID 排序。
    pub(crate) fn desktops_for_user(&self, user_id: &str) -> Vec<(String, String)> {
        self.desktops_seen
            .get(user_id)
            .map(|seen| {
                seen.iter()
                    .map(|(id, name)| (id.clone(), name.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// desktop 重连时刷新显示名；未出现过配对的设备不入表。
    pub(crate) fn refresh_desktop_name(&mut self, user_id: &str, device_id: &str, name: &str) {
        if let Some(seen) = self.desktops_seen.get_mut(user_id)
            && let Some(entry) = seen.get_mut(device_id)
        {
            *entry = name.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with_pair() -> PairingGraph {
        let mut graph = PairingGraph::default();
        graph.link("user_a", "dev_d", "dev_m", "Studio Desk", "t0".to_string());
        graph
    }

    #[test]
    fn linked_devices_are_symmetric() {
        let graph = graph_with_pair();
        assert!(graph.are_linked("user_a", "dev_d", "dev_m"));
        assert!(graph.are_linked("user_a", "dev_m", "dev_d"));
        assert!(!graph.are_linked("user_b", "dev_d", "dev_m"));
    }

    #[test]
    fn relink_replaces_instead_of_duplicating() {
        let mut graph = graph_with_pair();
        graph.link("user_a", "dev_d", "dev_m", "Studio Desk", "t1".to_string());
        assert_eq!(graph.peer_of("user_a", "dev_d"), vec!["dev_m".to_string()]);
    }

    #[test]
    fn unlink_works_in_either_orientation() {
        let mut graph = graph_with_pair();
        assert!(graph.unlink("dev_m", "dev_d"));
        assert!(!graph.are_linked("user_a", "dev_d", "dev_m"));
        assert!(!graph.unlink("dev_m", "dev_d"));
    }

    #[test]
    fn peer_of_lists_all_counterparts() {
        let mut graph = graph_with_pair();
        graph.link("user_a", "dev_d2", "dev_m", "Work Desk", "t1".to_string());
        let mut peers = graph.peer_of("user_a", "dev_m");
        peers.sort();
        assert_eq!(peers, vec!["dev_d".to_string(), "dev_d2".to_string()]);
    }

    #[test]
    fn desktops_seen_survive_unlink() {
        let mut graph = graph_with_pair();
        graph.unlink("dev_d", "dev_m");
        let desktops = graph.desktops_for_user("user_a");
        assert_eq!(desktops.len(), 1);
        assert_eq!(desktops[0].0, "dev_d");
    }

    #[test]
    fn refresh_only_touches_known_desktops() {
        let mut graph = graph_with_pair();
        graph.refresh_desktop_name("user_a", "dev_d", "Renamed Desk");
        graph.refresh_desktop_name("user_a", "dev_x", "Ghost");
        let desktops = graph.desktops_for_user("user_a");
        assert_eq!(desktops[0].1, "Renamed Desk");
        assert_eq!(desktops.len(), 1);
    }
}
