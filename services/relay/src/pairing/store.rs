//! 配对 offer 表：短时存活、一次性消费、周期清扫。

use std::collections::HashMap;

/// 配对 offer（desktop 注册，mobile 认领）。
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PairingOffer {
    pub(crate) user_id: String,
    pub(crate) desktop_device_id: String,
    pub(crate) desktop_public_key: String,
    pub(crate) desktop_device_name: String,
    /// Unix 秒。
    pub(crate) created_at: u64,
}

/// 认领失败分类。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClaimError {
    /// 配对码不存在（或已被消费）。
    NotFound,
    /// 超过 TTL，本次认领顺带将其移除。
    Expired,
    /// 归属其他账号；offer 保留原样，不泄露任何信息。
    WrongUser,
}

/// offer 内存表，键为配对码。
#[derive(Debug)]
pub(crate) struct PairingStore {
    offers: HashMap<String, PairingOffer>,
    ttl_sec: u64,
}

impl PairingStore {
    pub(crate) fn new(ttl_sec: u64) -> Self {
        Self {
            offers: HashMap::new(),
            ttl_sec,
        }
    }

    /// 登记 offer；同码重复登记以新值为准。
    pub(crate) fn register(&mut self, pairing_code: &str, offer: PairingOffer) {
        self.offers.insert(pairing_code.to_string(), offer);
    }

    /// 原子认领：校验归属与 TTL，成功即移除。
    pub(crate) fn claim(
        &mut self,
        pairing_code: &str,
        user_id: &str,
        now: u64,
    ) -> Result<PairingOffer, ClaimError> {
        let Some(offer) = self.offers.get(pairing_code) else {
            return Err(ClaimError::NotFound);
        };
        if now.saturating_sub(offer.created_at) > self.ttl_sec {
            self.offers.remove(pairing_code);
            return Err(ClaimError::Expired);
        }
        if offer.user_id != user_id {
            return Err(ClaimError::WrongUser);
        }
        self.offers.remove(pairing_code).ok_or(ClaimError::NotFound)
    }

    /// 清扫过期 offer，返回移除数量。
    pub(crate) fn sweep(&mut self, now: u64) -> usize {
        let before = self.offers.len();
        let ttl = self.ttl_sec;
        self.offers
            .retain(|_, offer| now.saturating_sub(offer.created_at) <= ttl);
        before - self.offers.len()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.offers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(user_id: &str, created_at: u64) -> PairingOffer {
        PairingOffer {
            user_id: user_id.to_string(),
            desktop_device_id: "dev_d".to_string(),
            desktop_public_key: "04ab".to_string(),
            desktop_device_name: "Studio Desk".to_string(),
            created_at,
        }
    }

    #[test]
    fn claim_consumes_exactly_once() {
        let mut store = PairingStore::new(300);
        store.register("c1", offer("user_a", 1000));
        assert!(store.claim("c1", "user_a", 1010).is_ok());
        assert_eq!(store.claim("c1", "user_a", 1011), Err(ClaimError::NotFound));
    }

    #[test]
    fn expired_offer_is_removed_on_claim() {
        let mut store = PairingStore::new(300);
        store.register("c2", offer("user_a", 1000));
        // TTL 刚过一秒。
        assert_eq!(store.claim("c2", "user_a", 1301), Err(ClaimError::Expired));
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn claim_at_ttl_boundary_still_succeeds() {
        let mut store = PairingStore::new(300);
        store.register("c3", offer("user_a", 1000));
        assert!(store.claim("c3", "user_a", 1300).is_ok());
    }

    #[test]
    fn wrong_user_does_not_consume() {
        let mut store = PairingStore::new(300);
        store.register("c4", offer("user_a", 1000));
        assert_eq!(store.claim("c4", "user_b", 1010), Err(ClaimError::WrongUser));
        // 原账号仍可认领。
        assert!(store.claim("c4", "user_a", 1020).is_ok());
    }

    #[test]
    fn sweep_removes_only_expired() {
        let mut store = PairingStore::new(300);
        store.register("old", offer("user_a", 1000));
        store.register("new", offer("user_a", 1200));
        assert_eq!(store.sweep(1350), 1);
        assert_eq!(store.len(), 1);
        assert!(store.claim("new", "user_a", 1350).is_ok());
    }

    #[test]
    fn reregister_same_code_replaces_offer() {
        let mut store = PairingStore::new(300);
        store.register("c5", offer("user_a", 1000));
        store.register("c5", offer("user_b", 1100));
        assert_eq!(store.claim("c5", "user_a", 1110), Err(ClaimError::WrongUser));
        assert!(store.claim("c5", "user_b", 1110).is_ok());
    }
}
