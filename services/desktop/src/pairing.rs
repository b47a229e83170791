//! 配对发起（desktop 侧）：临时密钥对 + 配对码 + 终端二维码横幅。

use cs_endpoint_core::RelayHandle;
use cs_shared_protocol::{
    ClientFrame, PairingQrPayload,
    e2ee::{EphemeralKeyPair, generate_pairing_code},
};
use tracing::warn;

use crate::config::Config;

/// 终端高亮样式：重置。
const ANSI_RESET: &str = "\x1b[0m";
/// 终端高亮样式：粗体。
const ANSI_BOLD: &str = "\x1b[1m";
/// 终端高亮样式：青色。
const ANSI_CYAN: &str = "\x1b[36m";
/// 终端高亮样式：亮白。
const ANSI_WHITE: &str = "\x1b[97m";

/// 等待被认领的配对现场。
pub(crate) struct PendingOffer {
    pub(crate) keys: EphemeralKeyPair,
    pub(crate) code: String,
}

/// 生成并登记一个新的配对 offer，打印扫码横幅。
/// 发送失败（断线窗口）返回 None，等下次连接成功再登记。
pub(crate) fn register_offer(cfg: &Config, handle: &RelayHandle) -> Option<PendingOffer> {
    let keys = EphemeralKeyPair::generate();
    let code = generate_pairing_code();

    let frame = ClientFrame::RegisterPairing {
        pairing_code: code.clone(),
        public_key: keys.public_key_hex().to_string(),
        device_name: Some(cfg.device_name.clone()),
    };
    if let Err(err) = handle.send_frame(frame) {
        warn!("register pairing offer failed: {err}");
        return None;
    }

    let qr = PairingQrPayload {
        s: cfg.relay_url.clone(),
        t: cfg.token.clone(),
        p: code.clone(),
        k: keys.public_key_hex().to_string(),
        d: cfg.device_id.clone(),
    };
    print_pairing_banner(cfg, &code, &qr);
    Some(PendingOffer { keys, code })
}

/// 打印 desktop 视角的配对区块。
fn print_pairing_banner(cfg: &Config, code: &str, qr: &PairingQrPayload) {
    println!(
        "{cyan}{bold}\n╔══════════════════════════════════════════════════════════════╗\n\
         ║                     配对本机（desktop）                      ║\n\
         ╚══════════════════════════════════════════════════════════════╝{reset}",
        cyan = ANSI_CYAN,
        bold = ANSI_BOLD,
        reset = ANSI_RESET
    );
    println!(
        "{white}{bold}设备名:{reset} {name}",
        white = ANSI_WHITE,
        bold = ANSI_BOLD,
        reset = ANSI_RESET,
        name = cfg.device_name
    );
    println!(
        "{white}{bold}配对码:{reset} {white}{code}{reset}",
        white = ANSI_WHITE,
        bold = ANSI_BOLD,
        reset = ANSI_RESET,
        code = code
    );
    println!(
        "{white}{bold}二维码内容:{reset} {payload}",
        white = ANSI_WHITE,
        bold = ANSI_BOLD,
        reset = ANSI_RESET,
        payload = qr.encode()
    );
    println!(
        "{white}{bold}提示:{reset} 用移动端扫码（或执行 `cs-mobile pair '<二维码内容>'`）完成配对；配对码 5 分钟内有效。\n",
        white = ANSI_WHITE,
        bold = ANSI_BOLD,
        reset = ANSI_RESET
    );
}
