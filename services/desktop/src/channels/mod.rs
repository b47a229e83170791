//! 白名单通道宿主：聊天子进程、会话历史、版本控制与文件检索。

pub(crate) mod chat;
pub(crate) mod files;
pub(crate) mod sessions;
pub(crate) mod vcs;

use std::time::Instant;

use serde_json::{Value, json};
use sysinfo::System;

/// `app:info` 通道：只读的本机概览。
pub(crate) fn app_info(sys: &mut System, started_at: Instant, device_name: &str) -> Value {
    sys.refresh_memory();
    sys.refresh_cpu_usage();
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "deviceName": device_name,
        "host": System::host_name(),
        "os": System::long_os_version(),
        "uptimeSec": started_at.elapsed().as_secs(),
        "cpuPercent": sys.global_cpu_usage(),
        "memoryTotalMb": sys.total_memory() as f64 / 1024.0 / 1024.0,
        "memoryUsedMb": sys.used_memory() as f64 / 1024.0 / 1024.0,
    })
}
