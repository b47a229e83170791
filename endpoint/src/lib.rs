// 文件职责：
// 1) 聚合 desktop/mobile 两端共用的 relay 客户端能力。
// 2) 会话持久化、设备身份与事件类型都只在这里定义一次。

pub mod client;
pub mod error;
pub mod events;
pub mod identity;
pub mod logging;
pub mod sessions;

pub use client::{ClientConfig, RelayHandle, spawn};
pub use error::ClientError;
pub use events::RelayEvent;
pub use sessions::{SessionFailure, SessionStore};
