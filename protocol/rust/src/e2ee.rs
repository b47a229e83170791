//! 端到端加密核心：P-256 ECDH 派生 + AES-256-GCM 信封 + 重放计数。
//!
//! desktop 与 mobile 必须逐字节派生出相同密钥，所以派生规则只允许存在
//! 这一份实现：共享点仅取 X 坐标 32 字节作 IKM，HKDF-SHA256 以配对码为
//! salt、以固定标签为 info；信封格式为 base64(IV12 ‖ 密文 ‖ tag16)。

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hkdf::Hkdf;
use p256::{PublicKey, SecretKey, ecdh, elliptic_curve::sec1::ToEncodedPoint};
use rand::{RngCore, rngs::OsRng};
use sha2::Sha256;
use thiserror::Error;

/// HKDF info 标签，三端一致，改动即断配对。
pub const E2EE_HKDF_INFO: &[u8] = b"claude-studio-e2ee";
/// GCM IV 长度（字节）。
const IV_LEN: usize = 12;
/// GCM 认证 tag 长度（字节）。
const TAG_LEN: usize = 16;

/// E2EE 层错误。
#[derive(Debug, Error, PartialEq, Eq)]
pub enum E2eeError {
    #[error("peer public key is not a valid uncompressed P-256 point")]
    InvalidPublicKey,
    #[error("key material is invalid")]
    InvalidKeyMaterial,
    #[error("payload encoding is invalid")]
    PayloadFormat,
    #[error("seq {seq} replays (last inbound {last})")]
    ReplayRejected { seq: u64, last: i64 },
    #[error("authentication tag verify failed")]
    AuthFailed,
}

/// 配对期间的临时 P-256 密钥对；公钥以未压缩点 hex 上线。
pub struct EphemeralKeyPair {
    secret: SecretKey,
    public_key_hex: String,
}

impl EphemeralKeyPair {
    /// 生成新的临时密钥对。
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        let point = secret.public_key().to_encoded_point(false);
        Self {
            public_key_hex: hex::encode(point.as_bytes()),
            secret,
        }
    }

    /// 未压缩公钥（0x04 ‖ X ‖ Y）的 hex 形式。
    pub fn public_key_hex(&self) -> &str {
        &self.public_key_hex
    }

    /// 与对端公钥完成 ECDH 并派生会话。
    pub fn derive_session(
        &self,
        peer_public_key_hex: &str,
        pairing_code: &str,
    ) -> Result<E2eeSession, E2eeError> {
        let raw = hex::decode(peer_public_key_hex.trim()).map_err(|_| E2eeError::InvalidPublicKey)?;
        let peer = PublicKey::from_sec1_bytes(&raw).map_err(|_| E2eeError::InvalidPublicKey)?;
        let shared = ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());

        // 共享点只保留 X 坐标 32 字节，前缀字节与 Y 坐标都不参与派生。
        let hk = Hkdf::<Sha256>::new(
            Some(pairing_code.as_bytes()),
            shared.raw_secret_bytes().as_slice(),
        );
        let mut key = [0u8; 32];
        hk.expand(E2EE_HKDF_INFO, &mut key)
            .map_err(|_| E2eeError::InvalidKeyMaterial)?;
        Ok(E2eeSession::new(key))
    }
}

/// 生成 128-bit 随机配对码（hex 可打印形式，嵌入二维码）。
pub fn generate_pairing_code() -> String {
    let mut raw = [0u8; 16];
    OsRng.fill_bytes(&mut raw);
    hex::encode(raw)
}

/// 单端 E2EE 会话：派生密钥加双向单调计数。
///
/// `outbound_seq` 从 0 递增；`last_inbound_seq` 初始 -1，收到合法帧后
/// 抬升，`seq ≤ last_inbound_seq` 的帧一律判重放。
pub struct E2eeSession {
    key: [u8; 32],
    outbound_seq: u64,
    last_inbound_seq: i64,
}

impl E2eeSession {
    fn new(key: [u8; 32]) -> Self {
        Self {
            key,
            outbound_seq: 0,
            last_inbound_seq: -1,
        }
    }

    /// 从持久化字段复原会话，计数器跨重启保持单调。
    pub fn from_parts(
        derived_key_hex: &str,
        outbound_seq: u64,
        last_inbound_seq: i64,
    ) -> Result<Self, E2eeError> {
        let raw = hex::decode(derived_key_hex.trim()).map_err(|_| E2eeError::InvalidKeyMaterial)?;
        let key: [u8; 32] = raw.try_into().map_err(|_| E2eeError::InvalidKeyMaterial)?;
        Ok(Self {
            key,
            outbound_seq,
            last_inbound_seq,
        })
    }

    /// 派生密钥的 hex 形式（用于持久化）。
    pub fn derived_key_hex(&self) -> String {
        hex::encode(self.key)
    }

    pub fn outbound_seq(&self) -> u64 {
        self.outbound_seq
    }

    pub fn last_inbound_seq(&self) -> i64 {
        self.last_inbound_seq
    }

    /// 加密一帧：随机 IV，输出 base64(IV ‖ 密文 ‖ tag) 与本帧 seq。
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<(String, u64), E2eeError> {
        let cipher =
            Aes256Gcm::new_from_slice(&self.key).map_err(|_| E2eeError::InvalidKeyMaterial)?;
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| E2eeError::InvalidKeyMaterial)?;

        let mut raw = Vec::with_capacity(IV_LEN + ciphertext.len());
        raw.extend_from_slice(&iv);
        raw.extend_from_slice(&ciphertext);

        let seq = self.outbound_seq;
        self.outbound_seq += 1;
        Ok((BASE64.encode(raw), seq))
    }

    /// 解密一帧；重放与 tag 校验失败分别返回独立错误。
    pub fn decrypt(&mut self, payload: &str, seq: u64) -> Result<Vec<u8>, E2eeError> {
        if (seq as i128) <= (self.last_inbound_seq as i128) {
            return Err(E2eeError::ReplayRejected {
                seq,
                last: self.last_inbound_seq,
            });
        }

        let raw = BASE64.decode(payload).map_err(|_| E2eeError::PayloadFormat)?;
        if raw.len() < IV_LEN + TAG_LEN {
            return Err(E2eeError::PayloadFormat);
        }
        let (iv, body) = raw.split_at(IV_LEN);

        let cipher =
            Aes256Gcm::new_from_slice(&self.key).map_err(|_| E2eeError::InvalidKeyMaterial)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(iv), body)
            .map_err(|_| E2eeError::AuthFailed)?;

        self.last_inbound_seq = seq as i64;
        Ok(plaintext)
    }
}
