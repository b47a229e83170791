// 文件职责：
// 1) 定义 relay/desktop/mobile 共用的 WebSocket 帧结构与配对二维码载荷。
// 2) 提供帧解析与协议错误分类，保证三端对未知类型/缺字段行为一致。
// 3) 作为 Rust 侧协议唯一代码源，供其他服务复用。

pub mod e2ee;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// WebSocket 升级端点路径。
pub const RELAY_WS_PATH: &str = "/ws/relay";

/// 设备角色。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    Desktop,
    Mobile,
}

impl DeviceRole {
    /// 解析握手 query 中的 `deviceType` 字段。
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "desktop" => Some(Self::Desktop),
            "mobile" => Some(Self::Mobile),
            _ => None,
        }
    }

    /// 协议字符串形式。
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Desktop => "desktop",
            Self::Mobile => "mobile",
        }
    }
}

/// 客户端上行帧。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    Heartbeat,
    RegisterPairing {
        #[serde(rename = "pairingCode")]
        pairing_code: String,
        #[serde(rename = "publicKey")]
        public_key: String,
        #[serde(rename = "deviceName", default, skip_serializing_if = "Option::is_none")]
        device_name: Option<String>,
    },
    ClaimPairing {
        #[serde(rename = "pairingCode")]
        pairing_code: String,
        #[serde(rename = "publicKey")]
        public_key: String,
    },
    RevokePairing {
        #[serde(rename = "targetDeviceId")]
        target_device_id: String,
    },
    Relay {
        to: String,
        payload: String,
        seq: u64,
    },
    ControlRequest {
        #[serde(rename = "targetDesktopId")]
        target_desktop_id: String,
    },
    ControlAck {
        to: String,
        accepted: bool,
    },
    ControlRevoked {
        to: String,
    },
}

/// 服务端下行帧。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    Pong,
    PairingAccepted {
        #[serde(rename = "deviceId")]
        device_id: String,
        #[serde(rename = "deviceName")]
        device_name: String,
        #[serde(rename = "publicKey")]
        public_key: String,
    },
    PairingRevoked {
        #[serde(rename = "deviceId")]
        device_id: String,
    },
    Relay {
        from: String,
        payload: String,
        seq: u64,
    },
    DeviceOnline {
        #[serde(rename = "deviceId")]
        device_id: String,
    },
    DeviceOffline {
        #[serde(rename = "deviceId")]
        device_id: String,
    },
    DeviceList {
        devices: Vec<DeviceSummary>,
    },
    ControlRequest {
        from: String,
        #[serde(rename = "deviceName")]
        device_name: String,
    },
    ControlAck {
        from: String,
        accepted: bool,
    },
    ControlRevoked {
        from: String,
    },
    Error {
        code: String,
        message: String,
    },
}

/// `device-list` 中的单台 desktop 摘要。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSummary {
    pub device_id: String,
    pub device_name: String,
    pub online: bool,
}

/// 已知上行帧类型表，用于区分「未知类型」与「缺字段」。
pub const CLIENT_FRAME_TYPES: &[&str] = &[
    "heartbeat",
    "register-pairing",
    "claim-pairing",
    "revoke-pairing",
    "relay",
    "control-request",
    "control-ack",
    "control-revoked",
];

/// 帧解析错误分类。
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameParseError {
    #[error("invalid frame json: {0}")]
    InvalidFormat(String),
    #[error("frame missing `type` field")]
    MissingType,
    #[error("unknown frame type: {0}")]
    UnknownType(String),
    #[error("frame `{frame_type}` field error: {detail}")]
    MissingField { frame_type: String, detail: String },
}

/// 解析上行帧，把 JSON 错误、未知类型与缺字段拆成独立分支。
pub fn parse_client_frame(raw: &str) -> Result<ClientFrame, FrameParseError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|err| FrameParseError::InvalidFormat(err.to_string()))?;
    let Some(frame_type) = value
        .get("type")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
    else {
        return Err(FrameParseError::MissingType);
    };
    if !CLIENT_FRAME_TYPES.contains(&frame_type) {
        return Err(FrameParseError::UnknownType(frame_type.to_string()));
    }
    let frame_type = frame_type.to_string();
    serde_json::from_value(value).map_err(|err| FrameParseError::MissingField {
        frame_type,
        detail: err.to_string(),
    })
}

/// 配对二维码载荷。单字母键是扫码端的既定格式，不可改名。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairingQrPayload {
    /// s：relay 服务地址（http/https/ws/wss 均可）。
    pub s: String,
    /// t：bearer token，移动端借二维码免登录。
    pub t: String,
    /// p：一次性配对码。
    pub p: String,
    /// k：desktop 公钥（未压缩点 hex）。
    pub k: String,
    /// d：desktop 设备 ID。
    pub d: String,
}

impl PairingQrPayload {
    /// 序列化为二维码内容。
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// 从扫码文本解析。
    pub fn decode(raw: &str) -> Result<Self, FrameParseError> {
        serde_json::from_str(raw).map_err(|err| FrameParseError::InvalidFormat(err.to_string()))
    }
}

/// 生成纳秒精度 UTC 时间戳（RFC3339）。
pub fn now_rfc3339_nanos() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_uses_kebab_tag_and_camel_fields() {
        let frame = ClientFrame::RegisterPairing {
            pairing_code: "c1".to_string(),
            public_key: "04ab".to_string(),
            device_name: Some("Studio".to_string()),
        };
        let raw = serde_json::to_string(&frame).unwrap();
        assert!(raw.contains("\"type\":\"register-pairing\""));
        assert!(raw.contains("\"pairingCode\":\"c1\""));
        assert!(raw.contains("\"deviceName\":\"Studio\""));
    }

    #[test]
    fn relay_frame_roundtrip_preserves_seq() {
        let frame = ClientFrame::Relay {
            to: "dev_a".to_string(),
            payload: "AAEC".to_string(),
            seq: 41,
        };
        let raw = serde_json::to_string(&frame).unwrap();
        assert_eq!(parse_client_frame(&raw).unwrap(), frame);
    }

    #[test]
    fn parse_distinguishes_error_classes() {
        assert!(matches!(
            parse_client_frame("{not json"),
            Err(FrameParseError::InvalidFormat(_))
        ));
        assert_eq!(
            parse_client_frame(r#"{"payload":"x"}"#),
            Err(FrameParseError::MissingType)
        );
        assert_eq!(
            parse_client_frame(r#"{"type":"teleport"}"#),
            Err(FrameParseError::UnknownType("teleport".to_string()))
        );
        assert!(matches!(
            parse_client_frame(r#"{"type":"relay","to":"dev_a"}"#),
            Err(FrameParseError::MissingField { frame_type, .. }) if frame_type == "relay"
        ));
    }

    #[test]
    fn heartbeat_parses_without_extra_fields() {
        assert_eq!(
            parse_client_frame(r#"{"type":"heartbeat"}"#).unwrap(),
            ClientFrame::Heartbeat
        );
    }

    #[test]
    fn server_error_frame_carries_code_and_message() {
        let frame = ServerFrame::Error {
            code: "NOT_PAIRED".to_string(),
            message: "未配对".to_string(),
        };
        let raw = serde_json::to_string(&frame).unwrap();
        assert!(raw.contains("\"type\":\"error\""));
        assert!(raw.contains("\"code\":\"NOT_PAIRED\""));
    }

    #[test]
    fn qr_payload_keeps_single_letter_keys() {
        let payload = PairingQrPayload {
            s: "https://relay.example.com".to_string(),
            t: "sat_v1.x.y".to_string(),
            p: "0011223344556677".to_string(),
            k: "04ab".to_string(),
            d: "dev_a".to_string(),
        };
        let raw = payload.encode();
        let value: Value = serde_json::from_str(&raw).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 5);
        for key in ["s", "t", "p", "k", "d"] {
            assert!(obj.contains_key(key), "missing qr key {key}");
        }
        assert_eq!(PairingQrPayload::decode(&raw).unwrap(), payload);
    }

    #[test]
    fn device_role_parse_rejects_unknown() {
        assert_eq!(DeviceRole::parse("desktop"), Some(DeviceRole::Desktop));
        assert_eq!(DeviceRole::parse(" mobile "), Some(DeviceRole::Mobile));
        assert_eq!(DeviceRole::parse("tablet"), None);
    }
}
