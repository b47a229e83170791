//! 鉴权模块职责：
//! 1. 定义 relay 消费的认证服务接口（verifyToken / getUser）。
//! 2. 提供 `sat_v1` HMAC-SHA256 token 的签发与校验实现。

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

/// 认证服务接口。实现方可以换成外部 JWT 校验器。
pub(crate) trait AuthService: Send + Sync {
    /// 校验 bearer token，返回其归属的 userId。
    fn verify_token(&self, token: &str) -> Option<String>;
    /// 判断用户是否存在。
    fn user_exists(&self, user_id: &str) -> bool;
}

/// access token claims。
#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    uid: String,
    iat: u64,
    exp: u64,
    jti: String,
}

/// HMAC 签名 token 的内置认证实现。
pub(crate) struct HmacTokenAuth {
    signing_key: String,
    /// 为 Some 时仅白名单内用户可连（`disableRegistration`）。
    allowed_users: Option<HashSet<String>>,
}

impl HmacTokenAuth {
    pub(crate) fn new(signing_key: impl Into<String>, allowed_users: Option<Vec<String>>) -> Self {
        Self {
            signing_key: signing_key.into(),
            allowed_users: allowed_users
                .map(|users| users.into_iter().map(|u| u.trim().to_string()).collect()),
        }
    }

    /// 签发 `sat_v1.<claims_b64url>.<sig_b64url>` token。
    pub(crate) fn issue_token(&self, user_id: &str, ttl_sec: u64) -> String {
        issue_token(&self.signing_key, user_id, ttl_sec)
    }
}

impl AuthService for HmacTokenAuth {
    fn verify_token(&self, token: &str) -> Option<String> {
        let mut parts = token.split('.');
        let version = parts.next().unwrap_or_default();
        let payload_b64 = parts.next().unwrap_or_default();
        let sig_b64 = parts.next().unwrap_or_default();
        if version != "sat_v1" || payload_b64.is_empty() || sig_b64.is_empty() || parts.next().is_some()
        {
            return None;
        }

        let sig = URL_SAFE_NO_PAD.decode(sig_b64.as_bytes()).ok()?;
        let mut mac = HmacSha256::new_from_slice(self.signing_key.as_bytes()).ok()?;
        mac.update(payload_b64.as_bytes());
        mac.verify_slice(&sig).ok()?;

        let payload_raw = URL_SAFE_NO_PAD.decode(payload_b64.as_bytes()).ok()?;
        let claims: TokenClaims = serde_json::from_slice(&payload_raw).ok()?;
        if claims.exp <= unix_now() {
            return None;
        }
        Some(claims.uid)
    }

    fn user_exists(&self, user_id: &str) -> bool {
        match self.allowed_users.as_ref() {
            Some(allowed) => allowed.contains(user_id),
            None => true,
        }
    }
}

type HmacSha256 = Hmac<Sha256>;

/// 签发 token（CLI 与测试共用）。
pub(crate) fn issue_token(signing_key: &str, user_id: &str, ttl_sec: u64) -> String {
    let now = unix_now();
    let claims = TokenClaims {
        uid: user_id.to_string(),
        iat: now,
        exp: now.saturating_add(ttl_sec),
        jti: Uuid::new_v4().simple().to_string(),
    };
    let payload_raw = serde_json::to_string(&claims).unwrap_or_default();
    let payload_b64 = URL_SAFE_NO_PAD.encode(payload_raw.as_bytes());

    let mut mac =
        HmacSha256::new_from_slice(signing_key.as_bytes()).expect("hmac key should be valid");
    mac.update(payload_b64.as_bytes());
    let sig_b64 = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    format!("sat_v1.{payload_b64}.{sig_b64}")
}

/// 当前 Unix 秒。
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_verifies_to_user() {
        let auth = HmacTokenAuth::new("k1", None);
        let token = auth.issue_token("user_a", 600);
        assert!(token.starts_with("sat_v1."));
        assert_eq!(auth.verify_token(&token), Some("user_a".to_string()));
    }

    #[test]
    fn wrong_key_or_garbage_is_rejected() {
        let auth = HmacTokenAuth::new("k1", None);
        let other = HmacTokenAuth::new("k2", None);
        let token = auth.issue_token("user_a", 600);
        assert_eq!(other.verify_token(&token), None);
        assert_eq!(auth.verify_token("sat_v1.x"), None);
        assert_eq!(auth.verify_token("not-a-token"), None);
    }

    #[test]
    fn expired_token_is_rejected() {
        let auth = HmacTokenAuth::new("k1", None);
        let token = auth.issue_token("user_a", 0);
        assert_eq!(auth.verify_token(&token), None);
    }

    #[test]
    fn user_allowlist_gates_existence() {
        let open = HmacTokenAuth::new("k1", None);
        assert!(open.user_exists("anyone"));
        let gated = HmacTokenAuth::new("k1", Some(vec!["user_a".to_string()]));
        assert!(gated.user_exists("user_a"));
        assert!(!gated.user_exists("user_b"));
    }
}
