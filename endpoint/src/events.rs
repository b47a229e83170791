//! relay 客户端向应用层上抛的事件。

use serde_json::Value;

use cs_shared_protocol::DeviceSummary;

/// 应用层事件流。帧语义与服务端下行一一对应，外加本地连接状态。
#[derive(Debug)]
pub enum RelayEvent {
    /// 连接建立（每次重连都会重新触发）。
    Connected,
    /// 连接断开（主动断开与异常断线都会触发）。
    Disconnected,
    /// 配对握手完成，携带对端身份与公钥。
    PairingAccepted {
        device_id: String,
        device_name: String,
        public_key: String,
    },
    /// 对端解除配对，本地会话已被移除。
    PairingRevoked { device_id: String },
    /// 解密成功的对端消息（JSON 明文）。
    EncryptedMessage { from: String, body: Value },
    /// 本地会话因重放或校验失败被弃置，需要重新配对。
    RepairRequired { device_id: String, reason: String },
    /// 配对集合中的对端上线。
    DeviceOnline { device_id: String },
    /// 配对集合中的对端下线。
    DeviceOffline { device_id: String },
    /// 连接建立时服务端推送的 desktop 列表（仅 mobile 收到）。
    DeviceList { devices: Vec<DeviceSummary> },
    /// 对端请求接管本机。
    ControlRequest { from: String, device_name: String },
    /// 控制请求的应答。
    ControlAck { from: String, accepted: bool },
    /// 对端释放控制权。
    ControlRevoked { from: String },
    /// 服务端错误帧。
    ServerError { code: String, message: String },
}
